//! Linux proxy settings for the GNOME and KDE desktops
//!
//! KDE commands go to `kwriteconfig6` (Plasma 6) or `kwriteconfig5`.

use super::{OsCommand, ProxyEndpoint};

const KDE_PROXY_GROUP: &str = "Proxy Settings";

/// Desktop environment whose proxy settings are edited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Desktop {
    Gnome,
    Kde,
}

impl Desktop {
    pub fn detect() -> Self {
        Self::from_xdg(&std::env::var("XDG_CURRENT_DESKTOP").unwrap_or_default())
    }

    /// GNOME settings are the fallback for unknown desktops
    pub fn from_xdg(value: &str) -> Self {
        if value.to_ascii_lowercase().contains("kde") {
            Desktop::Kde
        } else {
            Desktop::Gnome
        }
    }
}

fn gsettings(schema: &str, key: &str, value: &str) -> OsCommand {
    OsCommand::new("gsettings", ["set", schema, key, value])
}

fn kwriteconfig(key: &str, value: &str) -> OsCommand {
    OsCommand::new(
        "kwriteconfig6",
        ["--file", "kioslaverc", "--group", KDE_PROXY_GROUP, "--key", key, value],
    )
    .with_fallback("kwriteconfig5")
}

pub fn enable_commands(desktop: Desktop, endpoint: &ProxyEndpoint) -> Vec<OsCommand> {
    let port = endpoint.port.to_string();
    match desktop {
        Desktop::Gnome => vec![
            gsettings("org.gnome.system.proxy", "mode", "manual"),
            gsettings("org.gnome.system.proxy.http", "host", &endpoint.host),
            gsettings("org.gnome.system.proxy.http", "port", &port),
            gsettings("org.gnome.system.proxy.https", "host", &endpoint.host),
            gsettings("org.gnome.system.proxy.https", "port", &port),
        ],
        Desktop::Kde => {
            let server = format!("http://{} {}", endpoint.host, endpoint.port);
            vec![
                kwriteconfig("ProxyType", "1"),
                kwriteconfig("httpProxy", &server),
                kwriteconfig("httpsProxy", &server),
            ]
        }
    }
}

pub fn disable_commands(desktop: Desktop) -> Vec<OsCommand> {
    match desktop {
        Desktop::Gnome => vec![gsettings("org.gnome.system.proxy", "mode", "none")],
        Desktop::Kde => vec![kwriteconfig("ProxyType", "0")],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_desktop_detection() {
        assert_eq!(Desktop::from_xdg("KDE"), Desktop::Kde);
        assert_eq!(Desktop::from_xdg("ubuntu:GNOME"), Desktop::Gnome);
        assert_eq!(Desktop::from_xdg(""), Desktop::Gnome);
    }

    #[test]
    fn test_gnome_commands() {
        let enable = enable_commands(Desktop::Gnome, &ProxyEndpoint::new("127.0.0.1", 10809));
        assert_eq!(enable.len(), 5);
        assert_eq!(enable[0].args, ["set", "org.gnome.system.proxy", "mode", "manual"]);
        assert_eq!(enable[2].args, ["set", "org.gnome.system.proxy.http", "port", "10809"]);
        assert_eq!(enable[3].args, ["set", "org.gnome.system.proxy.https", "host", "127.0.0.1"]);

        let disable = disable_commands(Desktop::Gnome);
        assert_eq!(disable[0].args, ["set", "org.gnome.system.proxy", "mode", "none"]);
    }

    #[test]
    fn test_kde_commands() {
        let enable = enable_commands(Desktop::Kde, &ProxyEndpoint::new("127.0.0.1", 10809));
        assert_eq!(enable[0].program, "kwriteconfig6");
        assert_eq!(enable[0].fallback.as_deref(), Some("kwriteconfig5"));
        assert_eq!(enable[1].args.last().map(String::as_str), Some("http://127.0.0.1 10809"));
        assert_eq!(disable_commands(Desktop::Kde)[0].args.last().map(String::as_str), Some("0"));
    }
}
