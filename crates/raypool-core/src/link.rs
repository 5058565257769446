//! 代理链接解析：`vmess://`、`trojan://`、`ss://`

use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use serde_json::{json, Map, Value};
use url::Url;

use crate::core_config::{
    Outbound, OutboundProtocol, ServerList, ShadowsocksServer, TrojanServer, VmessServer,
    VmessSettings, VmessUser,
};
use crate::error::{Error, Result};

/// 解析结果
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedLink {
    /// 显示名称
    pub name: String,
    /// 服务器地址
    pub host: String,
    /// 出站定义（未打标签）
    pub outbound: Outbound,
}

/// 解析单个代理链接
pub fn parse_link(link: &str) -> Result<ParsedLink> {
    let link = link.trim();
    if let Some(payload) = link.strip_prefix("vmess://") {
        parse_vmess(payload)
    } else if link.starts_with("trojan://") {
        parse_trojan(link)
    } else if link.starts_with("ss://") {
        parse_shadowsocks(link)
    } else {
        Err(Error::InvalidLink(format!("不支持的协议: {}", truncate(link))))
    }
}

/// 宽松的base64解码，兼容标准/URL安全字母表以及缺少填充的情况
pub fn decode_base64(input: &str) -> Result<Vec<u8>> {
    let cleaned: String = input.chars().filter(|c| !c.is_whitespace()).collect();
    for engine in [&STANDARD, &STANDARD_NO_PAD, &URL_SAFE, &URL_SAFE_NO_PAD] {
        if let Ok(bytes) = engine.decode(&cleaned) {
            return Ok(bytes);
        }
    }
    Err(Error::InvalidLink(format!("无效的base64: {}", truncate(input))))
}

fn truncate(s: &str) -> String {
    s.chars().take(48).collect()
}

fn str_field<'a>(data: &'a Map<String, Value>, key: &str) -> Option<&'a str> {
    data.get(key).and_then(Value::as_str).filter(|s| !s.is_empty())
}

/// 字段可能是数字也可能是字符串
fn num_field(data: &Map<String, Value>, key: &str) -> Option<u64> {
    match data.get(key)? {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn split_list(value: Option<&str>) -> Vec<String> {
    value
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_vmess(payload: &str) -> Result<ParsedLink> {
    let bytes = decode_base64(payload)?;
    let data: Map<String, Value> = serde_json::from_slice(&bytes)
        .map_err(|e| Error::InvalidLink(format!("vmess内容不是JSON: {}", e)))?;

    let address = str_field(&data, "add")
        .ok_or_else(|| Error::InvalidLink("vmess缺少地址".to_string()))?
        .to_string();
    let port = num_field(&data, "port")
        .and_then(|p| u16::try_from(p).ok())
        .ok_or_else(|| Error::InvalidLink(format!("vmess端口无效: {}", address)))?;
    let id = str_field(&data, "id")
        .ok_or_else(|| Error::InvalidLink(format!("vmess缺少用户ID: {}", address)))?
        .to_string();
    let name = str_field(&data, "ps").unwrap_or(&address).to_string();

    let outbound = Outbound {
        tag: String::new(),
        protocol: OutboundProtocol::Vmess {
            settings: VmessSettings {
                vnext: vec![VmessServer {
                    address: address.clone(),
                    port,
                    users: vec![VmessUser {
                        id,
                        alter_id: num_field(&data, "aid").unwrap_or(0) as u32,
                        security: str_field(&data, "scy").unwrap_or("auto").to_string(),
                    }],
                }],
            },
        },
        stream_settings: Some(vmess_stream_settings(&data)),
    };

    Ok(ParsedLink { name, host: address, outbound })
}

fn vmess_stream_settings(data: &Map<String, Value>) -> Value {
    let network = str_field(data, "net").unwrap_or("tcp");
    let host = str_field(data, "host");
    let path = str_field(data, "path");
    let header_type = str_field(data, "type").unwrap_or("none");
    let tls = str_field(data, "tls") == Some("tls");

    let mut stream = Map::new();
    stream.insert("network".into(), json!(network));
    stream.insert("security".into(), json!(if tls { "tls" } else { "none" }));

    if tls {
        let allow_insecure = data.get("allowInsecure").and_then(Value::as_bool).unwrap_or(true);
        stream.insert(
            "tlsSettings".into(),
            json!({
                "serverName": str_field(data, "sni").or(host).unwrap_or_default(),
                "alpn": split_list(str_field(data, "alpn")),
                "allowInsecure": allow_insecure,
            }),
        );
    }

    match network {
        "tcp" => {
            let header = if header_type == "http" {
                json!({
                    "type": "http",
                    "request": { "headers": { "Host": host.unwrap_or_default(), "path": split_list(path) } }
                })
            } else {
                json!({ "type": "none" })
            };
            stream.insert("tcpSettings".into(), json!({ "header": header }));
        }
        "kcp" => {
            stream.insert(
                "kcpSettings".into(),
                json!({ "header": { "type": header_type }, "seed": path }),
            );
        }
        "ws" => {
            stream.insert(
                "wsSettings".into(),
                json!({ "headers": { "Host": host.unwrap_or_default() }, "path": path }),
            );
        }
        "h2" | "http" => {
            stream.insert(
                "httpSettings".into(),
                json!({ "host": split_list(host), "path": path.unwrap_or("/") }),
            );
        }
        "quic" => {
            stream.insert(
                "quicSettings".into(),
                json!({ "security": host.unwrap_or("none"), "key": path, "header": { "type": header_type } }),
            );
        }
        "grpc" => {
            stream.insert("grpcSettings".into(), json!({ "serviceName": path }));
        }
        _ => {}
    }

    Value::Object(stream)
}

/// 链接片段中的名称（`#name`），缺省使用主机名
fn fragment_name(url: &Url, host: &str) -> String {
    url.fragment()
        .filter(|f| !f.is_empty())
        .map(|f| percent_decode(f))
        .unwrap_or_else(|| host.to_string())
}

fn percent_decode(input: &str) -> String {
    url::form_urlencoded::parse(format!("n={}", input.replace('+', "%2B")).as_bytes())
        .next()
        .map(|(_, v)| v.into_owned())
        .unwrap_or_else(|| input.to_string())
}

fn host_and_port(url: &Url) -> Result<(String, u16)> {
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| Error::InvalidLink(format!("缺少服务器地址: {}", url.scheme())))?
        .trim_matches(|c| c == '[' || c == ']')
        .to_string();
    let port = url
        .port()
        .ok_or_else(|| Error::InvalidLink(format!("缺少端口: {}", host)))?;
    Ok((host, port))
}

fn parse_trojan(link: &str) -> Result<ParsedLink> {
    let url = Url::parse(link).map_err(|e| Error::InvalidLink(format!("trojan链接无效: {}", e)))?;
    let (host, port) = host_and_port(&url)?;
    if url.username().is_empty() {
        return Err(Error::InvalidLink(format!("trojan缺少密码: {}", host)));
    }
    let password = percent_decode(url.username());

    let outbound = Outbound {
        tag: String::new(),
        protocol: OutboundProtocol::Trojan {
            settings: ServerList {
                servers: vec![TrojanServer { address: host.clone(), port, password }],
            },
        },
        stream_settings: None,
    };

    Ok(ParsedLink { name: fragment_name(&url, &host), host, outbound })
}

/// 旧格式 `ss://base64(method:password@host:port)#name`
fn expand_legacy_shadowsocks(link: &str) -> Option<String> {
    let rest = link.strip_prefix("ss://")?;
    let (body, fragment) = match rest.split_once('#') {
        Some((body, fragment)) => (body, Some(fragment)),
        None => (rest, None),
    };
    if body.contains('@') {
        return None;
    }
    let decoded = String::from_utf8(decode_base64(body).ok()?).ok()?;
    let (credentials, server) = decoded.rsplit_once('@')?;
    let encoded = URL_SAFE_NO_PAD.encode(credentials);
    Some(match fragment {
        Some(fragment) => format!("ss://{}@{}#{}", encoded, server, fragment),
        None => format!("ss://{}@{}", encoded, server),
    })
}

fn parse_shadowsocks(link: &str) -> Result<ParsedLink> {
    let link = expand_legacy_shadowsocks(link).unwrap_or_else(|| link.to_string());
    let url = Url::parse(&link).map_err(|e| Error::InvalidLink(format!("ss链接无效: {}", e)))?;
    let (host, port) = host_and_port(&url)?;

    // userinfo 可能是 base64(method:password)，也可能是明文 method:password
    let userinfo = percent_decode(url.username());
    let credentials = match decode_base64(&userinfo).ok().and_then(|b| String::from_utf8(b).ok()) {
        Some(decoded) if decoded.contains(':') => decoded,
        _ => match url.password() {
            Some(password) => format!("{}:{}", userinfo, percent_decode(password)),
            None => userinfo,
        },
    };
    let (method, password) = credentials
        .split_once(':')
        .ok_or_else(|| Error::InvalidLink(format!("ss缺少加密方式或密码: {}", host)))?;

    let outbound = Outbound {
        tag: String::new(),
        protocol: OutboundProtocol::Shadowsocks {
            settings: ServerList {
                servers: vec![ShadowsocksServer {
                    address: host.clone(),
                    port,
                    method: method.to_string(),
                    password: password.to_string(),
                }],
            },
        },
        stream_settings: None,
    };

    Ok(ParsedLink { name: fragment_name(&url, &host), host, outbound })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vmess_link(value: Value) -> String {
        format!("vmess://{}", STANDARD.encode(value.to_string()))
    }

    #[test]
    fn parses_vmess_ws_tls() {
        let link = vmess_link(json!({
            "v": "2", "ps": "HK 01", "add": "hk.example.com", "port": "443",
            "id": "b831381d-6324-4d53-ad4f-8cda48b30811", "aid": "0", "scy": "auto",
            "net": "ws", "type": "none", "host": "cdn.example.com", "path": "/ray", "tls": "tls"
        }));
        let parsed = parse_link(&link).unwrap();

        assert_eq!(parsed.name, "HK 01");
        assert_eq!(parsed.host, "hk.example.com");
        match &parsed.outbound.protocol {
            OutboundProtocol::Vmess { settings } => {
                assert_eq!(settings.vnext[0].port, 443);
                assert_eq!(settings.vnext[0].users[0].alter_id, 0);
            }
            other => panic!("unexpected protocol: {:?}", other),
        }
        let stream = parsed.outbound.stream_settings.unwrap();
        assert_eq!(stream["network"], "ws");
        assert_eq!(stream["security"], "tls");
        assert_eq!(stream["tlsSettings"]["serverName"], "cdn.example.com");
        assert_eq!(stream["wsSettings"]["path"], "/ray");
    }

    #[test]
    fn vmess_name_defaults_to_address() {
        let link = vmess_link(json!({ "add": "1.2.3.4", "port": 10086, "id": "uuid", "net": "tcp" }));
        let parsed = parse_link(&link).unwrap();
        assert_eq!(parsed.name, "1.2.3.4");
        assert_eq!(parsed.outbound.stream_settings.unwrap()["tcpSettings"]["header"]["type"], "none");
    }

    #[test]
    fn parses_trojan() {
        let parsed = parse_link("trojan://secret@t.example.com:443#Tokyo%20%E4%B8%80").unwrap();
        assert_eq!(parsed.name, "Tokyo 一");
        assert_eq!(parsed.host, "t.example.com");
        assert_eq!(parsed.outbound.server_address(), Some("t.example.com"));
    }

    #[test]
    fn parses_shadowsocks_base64_userinfo() {
        let userinfo = URL_SAFE_NO_PAD.encode("aes-256-gcm:p@ss");
        let parsed = parse_link(&format!("ss://{}@10.0.0.1:8388#node", userinfo)).unwrap();
        match parsed.outbound.protocol {
            OutboundProtocol::Shadowsocks { settings } => {
                assert_eq!(settings.servers[0].method, "aes-256-gcm");
                assert_eq!(settings.servers[0].password, "p@ss");
                assert_eq!(settings.servers[0].port, 8388);
            }
            other => panic!("unexpected protocol: {:?}", other),
        }
        assert_eq!(parsed.name, "node");
    }

    #[test]
    fn parses_legacy_shadowsocks() {
        let body = STANDARD.encode("chacha20-ietf-poly1305:pw@ss.example.com:8443");
        let parsed = parse_link(&format!("ss://{}#legacy", body)).unwrap();
        assert_eq!(parsed.host, "ss.example.com");
        assert_eq!(parsed.name, "legacy");
    }

    #[test]
    fn rejects_unknown_and_broken_links() {
        assert!(matches!(parse_link("vless://abc@host:1"), Err(Error::InvalidLink(_))));
        assert!(matches!(parse_link("vmess://not-base64!!"), Err(Error::InvalidLink(_))));
        assert!(matches!(parse_link("trojan://@host:443"), Err(Error::InvalidLink(_))));
        assert!(matches!(parse_link("ss://bm9jb2xvbg@host:8388"), Err(Error::InvalidLink(_))));
    }
}
