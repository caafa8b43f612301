//! subtunnel Client Binary
//!
//! A command-line client that decodes a subscription, probes its nodes, and
//! runs one of them as the live tunnel behind the system proxy.

use clap::{Parser, Subcommand};
use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::process;
use subtunnel::{
    config::Config,
    error::{EngineError, Result},
    profile::{ConnectionProfile, ProbeStatus, Subscription, PROBE_FAILED},
    subscription::{fetch_subscription, parse_subscription},
    supervisor::{EngineManager, EngineState},
    system_proxy,
};
use tokio::signal;

#[derive(Parser)]
#[command(name = "subtunnel")]
#[command(about = "Subscription proxy client - xray, hysteria and shadowsocks engines")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Path to configuration file (defaults apply when absent)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Decode a subscription and list its profiles
    Parse {
        /// Subscription file or http(s) URL
        source: String,
        /// Subscription name stamped on the profiles
        #[arg(short, long, default_value = "default")]
        name: String,
    },
    /// Measure the latency of every profile
    Probe {
        source: String,
        #[arg(short, long, default_value = "default")]
        name: String,
    },
    /// Run one profile as the live tunnel until interrupted
    Connect {
        source: String,
        #[arg(short, long, default_value = "default")]
        name: String,
        /// Profile index (from `parse`) or profile name
        #[arg(long)]
        node: String,
        /// Leave the OS proxy settings untouched
        #[arg(long)]
        no_system_proxy: bool,
    },
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let config = match load_config(args.config.as_ref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{e}");
            process::exit(1);
        }
    };
    init_logging(&config, args.verbose);
    info!("Starting subtunnel v{}", env!("CARGO_PKG_VERSION"));

    if let Err(e) = run(args.command, config).await {
        error!("{e}");
        process::exit(1);
    }
}

async fn run(command: Command, mut config: Config) -> Result<()> {
    match command {
        Command::Parse { source, name } => {
            let profiles = load_profiles(&source, &name).await?;
            print_profiles(&profiles);
        }
        Command::Probe { source, name } => {
            let profiles = load_profiles(&source, &name).await?;
            let manager = EngineManager::new(&config, system_proxy::from_config(&config.system_proxy))?;
            probe(&manager, profiles).await;
        }
        Command::Connect {
            source,
            name,
            node,
            no_system_proxy,
        } => {
            if no_system_proxy {
                config.system_proxy.enabled = false;
            }
            let profiles = load_profiles(&source, &name).await?;
            let profile = select_node(&profiles, &node)?;
            let manager = EngineManager::new(&config, system_proxy::from_config(&config.system_proxy))?;
            connect(&manager, profile, &config).await?;
        }
    }
    Ok(())
}

/// Load configuration from file or fall back to defaults
fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    let config = match path {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    config.validate()?;
    Ok(config)
}

fn init_logging(config: &Config, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();
}

async fn load_profiles(source: &str, name: &str) -> Result<Vec<ConnectionProfile>> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let client = reqwest::Client::builder().build()?;
        let subscription = Subscription::new(name, name, source);
        return fetch_subscription(&client, &subscription).await;
    }
    let payload = std::fs::read(source)
        .map_err(|e| EngineError::Config(format!("Failed to read subscription file {source}: {e}")))?;
    Ok(parse_subscription(&payload, name))
}

fn select_node<'a>(profiles: &'a [ConnectionProfile], node: &str) -> Result<&'a ConnectionProfile> {
    let by_index = node.parse::<usize>().ok().and_then(|i| profiles.get(i));
    by_index
        .or_else(|| profiles.iter().find(|p| p.name == node || p.id == node))
        .ok_or_else(|| EngineError::Config(format!("No profile matches '{node}'")))
}

fn print_profiles(profiles: &[ConnectionProfile]) {
    println!("\n=== Profiles ({}) ===", profiles.len());
    for (index, profile) in profiles.iter().enumerate() {
        let ping = match profile.ping {
            Some(PROBE_FAILED) => "failed".to_string(),
            Some(ms) => format!("{ms} ms"),
            None => "-".to_string(),
        };
        println!(
            "{:>3}  {:<11} {:<32} {}:{}  [{}] {}",
            index, profile.kind, profile.name, profile.server, profile.port, profile.id, ping
        );
    }
    println!("=====================\n");
}

async fn probe(manager: &EngineManager, profiles: Vec<ConnectionProfile>) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<subtunnel::ProbeEvent>();
    let progress = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            if event.status == ProbeStatus::Tested {
                debug!("#{} {} -> {:?}", event.index, event.id, event.ping);
            }
        }
    });

    let mut tested = manager.test_profiles(profiles, Some(tx)).await;
    if let Err(e) = progress.await {
        warn!("Progress reporter failed: {e}");
    }

    tested.sort_by_key(|p| match p.ping {
        Some(ms) if ms != PROBE_FAILED => ms,
        _ => i64::MAX,
    });
    print_profiles(&tested);
}

async fn connect(manager: &EngineManager, profile: &ConnectionProfile, config: &Config) -> Result<()> {
    info!("Connecting to '{}' ({})", profile.name, profile.kind);
    manager.start_engine(profile).await?;
    info!(
        "Tunnel is up: socks {}:{}, http {}:{}. Press Ctrl+C to disconnect.",
        config.ports.listen, config.ports.socks, config.ports.listen, config.ports.http
    );

    let mut state = manager.subscribe();
    tokio::select! {
        _ = setup_shutdown_handler() => {
            info!("Shutdown signal received");
        }
        _ = state.wait_for(|s| *s == EngineState::Disconnected) => {
            warn!("Tunnel went down on its own");
        }
    }

    info!("Shutting down tunnel...");
    manager.stop_engine().await;
    info!("Tunnel stopped and system proxy cleared");
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn setup_shutdown_handler() {
    tokio::select! {
        _ = signal::ctrl_c() => {
            debug!("Received Ctrl+C");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut sigterm) => {
                        sigterm.recv().await;
                        debug!("Received SIGTERM");
                    }
                    Err(e) => {
                        warn!("Cannot listen for SIGTERM: {e}");
                        futures::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                futures::future::pending::<()>().await;
            }
        } => {}
    }
}
