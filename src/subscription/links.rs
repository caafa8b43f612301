//! Single-link decoding, dispatched on URI scheme

use super::decode_base64;
use crate::error::{EngineError, Result};
use crate::profile::{ConnectionProfile, ProfileType};
use percent_encoding::percent_decode_str;
use serde_json::{Map, Value};
use url::Url;

/// Decode one subscription line into a profile
///
/// The returned profile has no subscription name yet.
pub fn parse_link(link: &str) -> Result<ConnectionProfile> {
    let (scheme, body) = link
        .split_once("://")
        .ok_or_else(|| EngineError::Parse("line is not a URI".to_string()))?;

    match scheme.to_ascii_lowercase().as_str() {
        "vmess" => parse_vmess(body),
        "vless" => parse_url_form(link, ProfileType::Vless),
        "trojan" => parse_url_form(link, ProfileType::Trojan),
        "hy2" | "hysteria2" => parse_url_form(link, ProfileType::Hysteria2),
        "ss" => parse_shadowsocks(body),
        other => Err(EngineError::Parse(format!("unrecognized scheme '{other}'"))),
    }
}

/// `vmess://<base64 JSON>`
fn parse_vmess(body: &str) -> Result<ConnectionProfile> {
    let decoded = decode_base64(body)
        .ok_or_else(|| EngineError::Parse("vmess payload is not base64".to_string()))?;
    let value: Value = serde_json::from_slice(&decoded)
        .map_err(|e| EngineError::Parse(format!("vmess payload is not JSON: {e}")))?;

    let server = json_field(&value, "add")
        .ok_or_else(|| EngineError::Parse("vmess payload has no address".to_string()))?;
    let port = json_field(&value, "port")
        .and_then(|p| p.parse::<u16>().ok())
        .filter(|p| *p != 0)
        .ok_or_else(|| EngineError::Parse("vmess payload has no valid port".to_string()))?;
    let uuid = json_field(&value, "id")
        .ok_or_else(|| EngineError::Parse("vmess payload has no id".to_string()))?;

    let mut profile = ConnectionProfile::new(ProfileType::Vmess, server, port);
    profile.uuid = Some(uuid);
    if let Some(name) = json_field(&value, "ps") {
        profile.name = name;
    }
    profile.network = json_field(&value, "net");
    profile.security = json_field(&value, "tls");
    profile.sni = json_field(&value, "sni");
    profile.path = json_field(&value, "path");
    profile.host = json_field(&value, "host");
    profile.config = value;
    profile.refresh_id();
    Ok(profile)
}

/// `vless://`, `trojan://`, `hy2://`: `<credential>@<host>:<port>?<query>#<name>`
fn parse_url_form(link: &str, kind: ProfileType) -> Result<ConnectionProfile> {
    let url = Url::parse(link).map_err(|e| EngineError::Parse(format!("{kind} link: {e}")))?;

    let server = url
        .host_str()
        .map(|h| h.trim_start_matches('[').trim_end_matches(']').to_string())
        .filter(|h| !h.is_empty())
        .ok_or_else(|| EngineError::Parse(format!("{kind} link has no host")))?;
    let port = match (url.port(), kind) {
        (Some(port), _) if port != 0 => port,
        // hysteria2 links may omit the port
        (None, ProfileType::Hysteria2) => 443,
        _ => return Err(EngineError::Parse(format!("{kind} link has no port"))),
    };

    let mut credential = decode_component(url.username())?;
    if let Some(password) = url.password() {
        credential = format!("{credential}:{}", decode_component(password)?);
    }
    if credential.is_empty() {
        return Err(EngineError::Parse(format!("{kind} link has no credential")));
    }

    let query: Map<String, Value> = url
        .query_pairs()
        .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
        .collect();
    let param = |key: &str| {
        query
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    };

    let mut profile = ConnectionProfile::new(kind, server, port);
    match kind {
        ProfileType::Vless => profile.uuid = Some(credential),
        _ => profile.password = Some(credential),
    }
    profile.network = param("type");
    profile.security = match kind {
        ProfileType::Trojan => param("security").or_else(|| Some("tls".to_string())),
        _ => param("security"),
    };
    profile.sni = param("sni").or_else(|| param("peer"));
    profile.path = param("path").or_else(|| param("serviceName"));
    profile.host = param("host");
    if let Some(name) = url.fragment().map(decode_component).transpose()? {
        if !name.is_empty() {
            profile.name = name;
        }
    }
    profile.config = Value::Object(query);
    profile.refresh_id();
    Ok(profile)
}

/// `ss://<base64 method:password>@<host>:<port>#<name>` and the legacy
/// `ss://<base64 method:password@host:port>#<name>`
fn parse_shadowsocks(body: &str) -> Result<ConnectionProfile> {
    let (main, fragment) = match body.split_once('#') {
        Some((main, fragment)) => (main, Some(fragment)),
        None => (body, None),
    };
    // SIP002 plugin parameters are not supported by the engine
    let main = main.split('?').next().unwrap_or(main).trim_end_matches('/');

    let (userinfo, host_port) = match main.rsplit_once('@') {
        Some((userinfo, host_port)) => (decode_ss_userinfo(userinfo)?, host_port.to_string()),
        None => {
            let decoded = decode_base64(main)
                .and_then(|bytes| String::from_utf8(bytes).ok())
                .ok_or_else(|| EngineError::Parse("ss link is not base64".to_string()))?;
            let (userinfo, host_port) = decoded
                .rsplit_once('@')
                .ok_or_else(|| EngineError::Parse("ss link has no server".to_string()))?;
            (userinfo.to_string(), host_port.to_string())
        }
    };

    let (method, password) = userinfo
        .split_once(':')
        .ok_or_else(|| EngineError::Parse("ss user-info is not method:password".to_string()))?;
    let (server, port) = split_host_port(&host_port)?;

    let mut profile = ConnectionProfile::new(ProfileType::Shadowsocks, server, port);
    profile.method = Some(method.to_string());
    profile.password = Some(password.to_string());
    if let Some(name) = fragment.map(decode_component).transpose()? {
        if !name.is_empty() {
            profile.name = name;
        }
    }
    profile.config = serde_json::json!({ "method": method });
    profile.refresh_id();
    Ok(profile)
}

fn decode_ss_userinfo(raw: &str) -> Result<String> {
    let unescaped = decode_component(raw)?;
    if let Some(text) = decode_base64(&unescaped).and_then(|b| String::from_utf8(b).ok()) {
        if text.contains(':') {
            return Ok(text);
        }
    }
    if unescaped.contains(':') {
        return Ok(unescaped);
    }
    Err(EngineError::Parse("ss user-info is neither base64 nor method:password".to_string()))
}

fn split_host_port(host_port: &str) -> Result<(String, u16)> {
    let (host, port) = host_port
        .rsplit_once(':')
        .ok_or_else(|| EngineError::Parse("missing port".to_string()))?;
    let host = host.trim_start_matches('[').trim_end_matches(']');
    if host.is_empty() {
        return Err(EngineError::Parse("missing host".to_string()));
    }
    let port = port
        .parse::<u16>()
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| EngineError::Parse(format!("invalid port '{port}'")))?;
    Ok((host.to_string(), port))
}

fn decode_component(raw: &str) -> Result<String> {
    percent_decode_str(raw)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|e| EngineError::Parse(format!("invalid percent-encoding: {e}")))
}

/// vmess payloads carry numbers as either JSON strings or numbers
fn json_field(value: &Value, key: &str) -> Option<String> {
    match value.get(key)? {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    #[test]
    fn test_vmess_link() {
        let json = r#"{"add":"example.com","port":"443","id":"abc","ps":"MyNode","net":"ws","tls":"tls","path":"/ray","aid":"0"}"#;
        let profile = parse_link(&format!("vmess://{}", STANDARD.encode(json))).unwrap();
        assert_eq!(profile.kind, ProfileType::Vmess);
        assert_eq!(profile.server, "example.com");
        assert_eq!(profile.port, 443);
        assert_eq!(profile.uuid.as_deref(), Some("abc"));
        assert_eq!(profile.name, "MyNode");
        assert_eq!(profile.network.as_deref(), Some("ws"));
        assert_eq!(profile.security.as_deref(), Some("tls"));
        assert_eq!(profile.path.as_deref(), Some("/ray"));
        assert_eq!(profile.extra("aid"), Some("0"));
    }

    #[test]
    fn test_vmess_numeric_port_and_missing_name() {
        let json = r#"{"add":"10.0.0.1","port":8080,"id":"u-1"}"#;
        let profile = parse_link(&format!("vmess://{}", STANDARD.encode(json))).unwrap();
        assert_eq!(profile.port, 8080);
        assert_eq!(profile.name, "10.0.0.1:8080");
    }

    #[test]
    fn test_vmess_without_id_is_rejected() {
        let json = r#"{"add":"example.com","port":"443"}"#;
        assert!(parse_link(&format!("vmess://{}", STANDARD.encode(json))).is_err());
    }

    #[test]
    fn test_vless_link() {
        let link = "vless://3f1c-uuid@vl.example.com:8443?type=grpc&security=tls&sni=cdn.example.com&serviceName=svc&flow=xtls-rprx-vision#My%20VLESS";
        let profile = parse_link(link).unwrap();
        assert_eq!(profile.kind, ProfileType::Vless);
        assert_eq!(profile.uuid.as_deref(), Some("3f1c-uuid"));
        assert_eq!(profile.server, "vl.example.com");
        assert_eq!(profile.port, 8443);
        assert_eq!(profile.network.as_deref(), Some("grpc"));
        assert_eq!(profile.sni.as_deref(), Some("cdn.example.com"));
        assert_eq!(profile.path.as_deref(), Some("svc"));
        assert_eq!(profile.name, "My VLESS");
        assert_eq!(profile.extra("flow"), Some("xtls-rprx-vision"));
    }

    #[test]
    fn test_trojan_defaults_to_tls() {
        let profile = parse_link("trojan://pa%40ss@tr.example.com:443#tr").unwrap();
        assert_eq!(profile.kind, ProfileType::Trojan);
        assert_eq!(profile.password.as_deref(), Some("pa@ss"));
        assert_eq!(profile.security.as_deref(), Some("tls"));
        assert!(profile.uuid.is_none());
    }

    #[test]
    fn test_hysteria2_link_and_alias() {
        let profile = parse_link("hy2://secret@[2001:db8::1]:4443?sni=hy.example.com&insecure=1#hy").unwrap();
        assert_eq!(profile.kind, ProfileType::Hysteria2);
        assert_eq!(profile.server, "2001:db8::1");
        assert_eq!(profile.port, 4443);
        assert_eq!(profile.password.as_deref(), Some("secret"));
        assert_eq!(profile.extra("insecure"), Some("1"));

        let alias = parse_link("hysteria2://secret@hy.example.com#hy").unwrap();
        assert_eq!(alias.port, 443);
    }

    #[test]
    fn test_shadowsocks_sip002_base64() {
        let userinfo = STANDARD.encode("aes-256-gcm:password");
        let profile = parse_link(&format!("ss://{userinfo}@ss.example.com:8388#Tokyo")).unwrap();
        assert_eq!(profile.kind, ProfileType::Shadowsocks);
        assert_eq!(profile.method.as_deref(), Some("aes-256-gcm"));
        assert_eq!(profile.password.as_deref(), Some("password"));
        assert_eq!(profile.server, "ss.example.com");
        assert_eq!(profile.port, 8388);
        assert_eq!(profile.name, "Tokyo");
    }

    #[test]
    fn test_shadowsocks_plain_and_legacy_forms() {
        let plain = parse_link("ss://chacha20-ietf-poly1305:p%3Ass@1.2.3.4:8388/?plugin=x#n").unwrap();
        assert_eq!(plain.method.as_deref(), Some("chacha20-ietf-poly1305"));
        assert_eq!(plain.password.as_deref(), Some("p:ss"));

        let legacy = STANDARD.encode("aes-128-gcm:pw@legacy.example.com:443");
        let profile = parse_link(&format!("ss://{legacy}#old")).unwrap();
        assert_eq!(profile.server, "legacy.example.com");
        assert_eq!(profile.port, 443);
        assert_eq!(profile.name, "old");
    }

    #[test]
    fn test_malformed_links() {
        assert!(parse_link("not a link").is_err());
        assert!(parse_link("wireguard://abc@host:51820").is_err());
        assert!(parse_link("vless://@host:443").is_err());
        assert!(parse_link("vless://uuid@host").is_err());
        assert!(parse_link("trojan://pw@host:99999").is_err());
        assert!(parse_link("ss://bm90LWJhc2U2NA@host:1").is_err());
        assert!(parse_link("vmess://%%%").is_err());
    }
}
