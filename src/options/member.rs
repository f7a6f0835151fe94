use serde::{Serialize, Serializer};
use serde_json::{json, Map, Value};

use crate::proxy::{SELECTOR, URLTEST};

/// 成员类别：连接型 outbound 或点对点型 endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberKind {
    Outbound,
    Endpoint,
}

impl MemberKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberKind::Outbound => "outbound",
            MemberKind::Endpoint => "endpoint",
        }
    }
}

/// 路由图中的一个可路由成员
///
/// `options` 保存除 `type`/`tag` 以外的协议字段，序列化后即为 sing-box 风格的对象。
#[derive(Debug, Clone, PartialEq)]
pub struct Member {
    pub tag: String,
    pub kind: MemberKind,
    pub protocol: String,
    pub options: Map<String, Value>,
}

impl Member {
    pub fn new(kind: MemberKind, protocol: &str, tag: &str, options: Value) -> Self {
        let options = match options {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Self {
            tag: tag.to_string(),
            kind,
            protocol: protocol.to_string(),
            options,
        }
    }

    /// 从 JSON 对象解析成员，`type` 与 `tag` 必须存在且非空
    pub fn from_value(kind: MemberKind, value: Value) -> Result<Self, String> {
        let Value::Object(mut map) = value else {
            return Err(format!("{} entry must be an object", kind.as_str()));
        };
        let protocol = match map.remove("type") {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => return Err(format!("{} entry is missing 'type'", kind.as_str())),
        };
        let tag = match map.remove("tag") {
            Some(Value::String(s)) if !s.is_empty() => s,
            _ => {
                return Err(format!(
                    "{} entry of type '{}' is missing 'tag'",
                    kind.as_str(),
                    protocol
                ))
            }
        };
        Ok(Self {
            tag,
            kind,
            protocol,
            options: map,
        })
    }

    pub fn selector(tag: &str, members: Vec<String>, default: &str) -> Self {
        Self::new(
            MemberKind::Outbound,
            SELECTOR,
            tag,
            json!({
                "outbounds": members,
                "default": default,
                "interrupt_exist_connections": true,
            }),
        )
    }

    pub fn url_test(tag: &str, members: Vec<String>) -> Self {
        Self::new(
            MemberKind::Outbound,
            URLTEST,
            tag,
            json!({
                "outbounds": members,
                "url": crate::proxy::group::urltest::DEFAULT_TEST_URL,
                "interval": "3m",
                "tolerance": crate::proxy::group::urltest::DEFAULT_TOLERANCE_MS,
            }),
        )
    }

    pub fn is_group(&self) -> bool {
        self.protocol == SELECTOR || self.protocol == URLTEST
    }

    /// 组成员列表（仅 selector / urltest）
    pub fn group_members(&self) -> Option<Vec<String>> {
        if !self.is_group() {
            return None;
        }
        let members = self
            .options
            .get("outbounds")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();
        Some(members)
    }

    pub fn str_option(&self, key: &str) -> Option<&str> {
        self.options.get(key).and_then(|v| v.as_str())
    }

    pub fn to_value(&self) -> Value {
        let mut map = self.options.clone();
        map.insert("type".to_string(), Value::String(self.protocol.clone()));
        map.insert("tag".to_string(), Value::String(self.tag.clone()));
        Value::Object(map)
    }

    /// 用于去重比较的规范序列化（键有序）
    pub fn serialized(&self) -> String {
        self.to_value().to_string()
    }
}

impl Serialize for Member {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value().serialize(serializer)
    }
}
