//! macOS proxy settings through `networksetup` on the primary network service

use super::{OsCommand, ProxyEndpoint};

/// User-visible name of the service carrying the default route
///
/// Resolved through `scutil`: the global IPv4 state names the primary
/// service id, whose setup entry holds the display name.
pub fn active_network_service() -> Option<String> {
    let global = OsCommand::new("scutil", Vec::<String>::new())
        .with_stdin("show State:/Network/Global/IPv4\n")
        .run()
        .map_err(|e| log::debug!("[SystemProxy] scutil failed: {e}"))
        .ok()?;
    let service_id = scutil_value(&global, "PrimaryService")?;

    let setup = OsCommand::new("scutil", Vec::<String>::new())
        .with_stdin(format!("show Setup:/Network/Service/{service_id}\n"))
        .run()
        .map_err(|e| log::debug!("[SystemProxy] scutil failed: {e}"))
        .ok()?;
    scutil_value(&setup, "UserDefinedName")
}

/// Value of `key` in a `scutil show` dictionary dump
pub fn scutil_value(dump: &str, key: &str) -> Option<String> {
    dump.lines()
        .filter_map(|line| line.trim().split_once(" : "))
        .find(|(k, _)| k.trim() == key)
        .map(|(_, v)| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn enable_commands(service: &str, endpoint: &ProxyEndpoint) -> Vec<OsCommand> {
    let port = endpoint.port.to_string();
    ["-setwebproxy", "-setsecurewebproxy"]
        .into_iter()
        .map(|flag| OsCommand::new("networksetup", [flag, service, endpoint.host.as_str(), port.as_str()]))
        .collect()
}

pub fn disable_commands(service: &str) -> Vec<OsCommand> {
    ["-setwebproxystate", "-setsecurewebproxystate"]
        .into_iter()
        .map(|flag| OsCommand::new("networksetup", [flag, service, "off"]))
        .collect()
}
