pub mod group;

use std::sync::Arc;

use serde_json::Value;

use crate::common::EngineError;
use crate::options::{Member, MemberKind};

use group::selector::SelectorGroup;
use group::urltest::UrlTestGroup;

pub const SELECTOR: &str = "selector";
pub const URLTEST: &str = "urltest";

/// 连接型协议：需要 server / server_port
const DIAL_PROTOCOLS: &[&str] = &[
    "http",
    "socks",
    "shadowsocks",
    "vmess",
    "vless",
    "trojan",
    "hysteria2",
    "tuic",
    "anytls",
];

/// 点对点协议，只能作为 endpoint
const ENDPOINT_PROTOCOLS: &[&str] = &["wireguard", "tailscale"];

/// 单个上游（非组）成员
#[derive(Debug)]
pub struct ProxyAdapter {
    tag: String,
    protocol: String,
    kind: MemberKind,
    server: Option<(String, u16)>,
}

impl ProxyAdapter {
    pub fn tag(&self) -> &str {
        &self.tag
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn kind(&self) -> MemberKind {
        self.kind
    }

    pub fn server(&self) -> Option<(&str, u16)> {
        self.server.as_ref().map(|(h, p)| (h.as_str(), *p))
    }
}

/// 引擎中的成员：显式区分普通上游与两类组，不依赖运行时 downcast
#[derive(Debug, Clone)]
pub enum Adapter {
    Outbound(Arc<ProxyAdapter>),
    Endpoint(Arc<ProxyAdapter>),
    Selector(Arc<SelectorGroup>),
    UrlTest(Arc<UrlTestGroup>),
}

impl Adapter {
    /// 按协议校验选项并构造适配器
    pub fn from_member(member: &Member) -> Result<Self, EngineError> {
        match member.protocol.as_str() {
            SELECTOR => {
                let members = member.group_members().unwrap_or_default();
                let default = member.str_option("default").unwrap_or_default();
                Ok(Adapter::Selector(Arc::new(SelectorGroup::new(
                    member.tag.clone(),
                    members,
                    default.to_string(),
                ))))
            }
            URLTEST => {
                let members = member.group_members().unwrap_or_default();
                let interval = member.str_option("interval").unwrap_or("3m");
                let interval = group::urltest::parse_interval(interval).ok_or_else(|| {
                    EngineError::InvalidOptions {
                        tag: member.tag.clone(),
                        reason: format!("bad interval '{}'", interval),
                    }
                })?;
                let tolerance = member
                    .options
                    .get("tolerance")
                    .and_then(Value::as_u64)
                    .unwrap_or(group::urltest::DEFAULT_TOLERANCE_MS);
                let url = member
                    .str_option("url")
                    .unwrap_or(group::urltest::DEFAULT_TEST_URL);
                Ok(Adapter::UrlTest(Arc::new(UrlTestGroup::new(
                    member.tag.clone(),
                    members,
                    url.to_string(),
                    interval,
                    tolerance,
                ))))
            }
            _ => {
                let adapter = Arc::new(validate_proxy(member)?);
                Ok(match member.kind {
                    MemberKind::Outbound => Adapter::Outbound(adapter),
                    MemberKind::Endpoint => Adapter::Endpoint(adapter),
                })
            }
        }
    }

    pub fn tag(&self) -> &str {
        match self {
            Adapter::Outbound(a) | Adapter::Endpoint(a) => a.tag(),
            Adapter::Selector(g) => g.tag(),
            Adapter::UrlTest(g) => g.tag(),
        }
    }

    pub fn protocol(&self) -> &str {
        match self {
            Adapter::Outbound(a) | Adapter::Endpoint(a) => a.protocol(),
            Adapter::Selector(_) => SELECTOR,
            Adapter::UrlTest(_) => URLTEST,
        }
    }

    pub fn is_group(&self) -> bool {
        matches!(self, Adapter::Selector(_) | Adapter::UrlTest(_))
    }
}

fn invalid(member: &Member, reason: impl Into<String>) -> EngineError {
    EngineError::InvalidOptions {
        tag: member.tag.clone(),
        reason: reason.into(),
    }
}

fn validate_proxy(member: &Member) -> Result<ProxyAdapter, EngineError> {
    let protocol = member.protocol.as_str();
    let mut server = None;

    match (member.kind, protocol) {
        (MemberKind::Outbound, "direct" | "block") => {}
        (MemberKind::Outbound, p) if DIAL_PROTOCOLS.contains(&p) => {
            let host = member
                .str_option("server")
                .filter(|s| !s.is_empty())
                .ok_or_else(|| invalid(member, "missing server"))?;
            let port = member
                .options
                .get("server_port")
                .and_then(Value::as_u64)
                .filter(|p| (1..=65535).contains(p))
                .ok_or_else(|| invalid(member, "missing or invalid server_port"))?;
            if p == "shadowsocks"
                && (member.str_option("method").is_none() || member.str_option("password").is_none())
            {
                return Err(invalid(member, "shadowsocks requires method and password"));
            }
            server = Some((host.to_string(), port as u16));
        }
        (MemberKind::Endpoint, p) if ENDPOINT_PROTOCOLS.contains(&p) => {
            let has_array = |key: &str| {
                member
                    .options
                    .get(key)
                    .and_then(Value::as_array)
                    .map_or(false, |a| !a.is_empty())
            };
            if !has_array("peers") && !has_array("address") {
                return Err(invalid(member, "endpoint requires peers or address"));
            }
        }
        _ => {
            return Err(EngineError::UnsupportedProtocol {
                tag: member.tag.clone(),
                protocol: protocol.to_string(),
            })
        }
    }

    Ok(ProxyAdapter {
        tag: member.tag.clone(),
        protocol: protocol.to_string(),
        kind: member.kind,
        server,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn outbound(v: Value) -> Member {
        Member::from_value(MemberKind::Outbound, v).unwrap()
    }

    #[test]
    fn dial_protocol_requires_server() {
        let ok = outbound(json!({"type": "socks", "tag": "s", "server": "h", "server_port": 1080}));
        let adapter = Adapter::from_member(&ok).unwrap();
        assert!(matches!(adapter, Adapter::Outbound(ref a) if a.server() == Some(("h", 1080))));

        let no_port = outbound(json!({"type": "socks", "tag": "s", "server": "h"}));
        assert!(matches!(
            Adapter::from_member(&no_port),
            Err(EngineError::InvalidOptions { .. })
        ));

        let bad_port = outbound(json!({"type": "http", "tag": "s", "server": "h", "server_port": 70000}));
        assert!(Adapter::from_member(&bad_port).is_err());
    }

    #[test]
    fn shadowsocks_requires_credentials() {
        let m = outbound(json!({"type": "shadowsocks", "tag": "ss", "server": "h", "server_port": 8388}));
        assert!(Adapter::from_member(&m).is_err());
        let m = outbound(json!({
            "type": "shadowsocks", "tag": "ss", "server": "h", "server_port": 8388,
            "method": "2022-blake3-aes-128-gcm", "password": "secret"
        }));
        assert!(Adapter::from_member(&m).is_ok());
    }

    #[test]
    fn endpoint_protocols_only_as_endpoints() {
        let wg = json!({"type": "wireguard", "tag": "wg", "address": ["10.0.0.2/32"]});
        let ep = Member::from_value(MemberKind::Endpoint, wg.clone()).unwrap();
        assert!(matches!(Adapter::from_member(&ep).unwrap(), Adapter::Endpoint(_)));

        let as_outbound = outbound(wg);
        assert!(matches!(
            Adapter::from_member(&as_outbound),
            Err(EngineError::UnsupportedProtocol { .. })
        ));
    }

    #[test]
    fn unknown_protocol_rejected() {
        let m = outbound(json!({"type": "carrier-pigeon", "tag": "p"}));
        assert!(matches!(
            Adapter::from_member(&m),
            Err(EngineError::UnsupportedProtocol { .. })
        ));
    }

    #[test]
    fn group_members_become_groups() {
        let sel = Member::selector("managed", vec!["a".into(), "b".into()], "b");
        let adapter = Adapter::from_member(&sel).unwrap();
        assert!(adapter.is_group());
        assert_eq!(adapter.protocol(), SELECTOR);

        let auto = Member::url_test("auto-managed", vec!["a".into()]);
        assert!(matches!(Adapter::from_member(&auto).unwrap(), Adapter::UrlTest(_)));
    }
}
