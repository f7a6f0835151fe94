use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::member::{Member, MemberKind};

/// 完整的路由配置图，每次冷启动重新构建，交给引擎后即丢弃
#[derive(Debug, Clone, Default, Serialize)]
pub struct RoutingGraph {
    pub log: LogOptions,
    pub dns: DnsOptions,
    pub inbounds: Vec<Value>,
    pub outbounds: Vec<Member>,
    pub endpoints: Vec<Member>,
    pub route: RouteOptions,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub experimental: Option<ExperimentalOptions>,
}

impl RoutingGraph {
    pub fn member(&self, tag: &str) -> Option<&Member> {
        self.members().find(|m| m.tag == tag)
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.outbounds.iter().chain(self.endpoints.iter())
    }

    /// 组成员列表；tag 不存在或不是组时返回 None
    pub fn group_members(&self, tag: &str) -> Option<Vec<String>> {
        self.member(tag).and_then(|m| m.group_members())
    }

    pub fn push_member(&mut self, member: Member) {
        match member.kind {
            MemberKind::Outbound => self.outbounds.push(member),
            MemberKind::Endpoint => self.endpoints.push(member),
        }
    }

    pub fn cache_file(&self) -> Option<&CacheFileOptions> {
        self.experimental.as_ref().and_then(|e| e.cache_file.as_ref())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct LogOptions {
    pub level: String,
    pub timestamp: bool,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            timestamp: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsOptions {
    #[serde(default)]
    pub servers: Vec<Value>,
    #[serde(default)]
    pub rules: Vec<Value>,
    #[serde(rename = "final", default, skip_serializing_if = "Option::is_none")]
    pub final_server: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strategy: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteOptions {
    #[serde(default)]
    pub rules: Vec<Value>,
    #[serde(default)]
    pub rule_set: Vec<Value>,
    #[serde(rename = "final", default, skip_serializing_if = "Option::is_none")]
    pub final_outbound: Option<String>,
    #[serde(default)]
    pub auto_detect_interface: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ExperimentalOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cache_file: Option<CacheFileOptions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clash_api: Option<ClashApiOptions>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheFileOptions {
    pub enabled: bool,
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClashApiOptions {
    pub default_mode: String,
}
