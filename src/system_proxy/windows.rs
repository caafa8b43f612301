//! Windows proxy settings through the per-user Internet Settings registry key

use super::{OsCommand, ProxyEndpoint};

const INTERNET_SETTINGS: &str = r"HKCU\Software\Microsoft\Windows\CurrentVersion\Internet Settings";

fn reg_add(value: &str, kind: &str, data: &str) -> OsCommand {
    OsCommand::new(
        "reg",
        ["add", INTERNET_SETTINGS, "/v", value, "/t", kind, "/d", data, "/f"],
    )
}

pub fn enable_commands(endpoint: &ProxyEndpoint) -> Vec<OsCommand> {
    vec![
        reg_add("ProxyEnable", "REG_DWORD", "1"),
        reg_add(
            "ProxyServer",
            "REG_SZ",
            &format!("{}:{}", endpoint.host, endpoint.port),
        ),
    ]
}

pub fn disable_commands() -> Vec<OsCommand> {
    vec![reg_add("ProxyEnable", "REG_DWORD", "0")]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_writes_server_and_flag() {
        let commands = enable_commands(&ProxyEndpoint::new("127.0.0.1", 10809));
        assert_eq!(commands.len(), 2);
        assert_eq!(commands[0].program, "reg");
        assert_eq!(commands[0].args[1], INTERNET_SETTINGS);
        assert_eq!(commands[0].args[3], "ProxyEnable");
        assert_eq!(commands[0].args[7], "1");
        assert_eq!(commands[1].args[3], "ProxyServer");
        assert_eq!(commands[1].args[7], "127.0.0.1:10809");
    }

    #[test]
    fn test_disable_clears_flag_only() {
        let commands = disable_commands();
        assert_eq!(commands.len(), 1);
        assert_eq!(commands[0].args[7], "0");
    }
}
