//! 服务器列表文档
//!
//! 远程下发列表与用户列表共用同一格式（sing-box 风格 JSON）：
//! `outbounds` / `endpoints` 为成员，`route` / `dns` 只对远程列表生效。

use std::path::Path;

use serde::Deserialize;
use serde_json::Value;

use crate::common::TunnelError;

use super::member::{Member, MemberKind};
use super::types::{DnsOptions, RouteOptions};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerList {
    #[serde(default)]
    pub outbounds: Vec<Value>,
    #[serde(default)]
    pub endpoints: Vec<Value>,
    #[serde(default)]
    pub route: Option<RouteOptions>,
    #[serde(default)]
    pub dns: Option<DnsOptions>,
}

impl ServerList {
    pub fn parse(content: &str) -> Result<Self, TunnelError> {
        if content.trim().is_empty() {
            return Err(TunnelError::Build("server list is empty".to_string()));
        }
        serde_json::from_str(content)
            .map_err(|e| TunnelError::Build(format!("parse server list: {}", e)))
    }

    /// 读取服务器列表；文件不存在返回 `Ok(None)`
    pub fn load(path: &Path) -> Result<Option<Self>, TunnelError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::parse(&content).map(Some).map_err(|e| match e {
            TunnelError::Build(msg) => TunnelError::Build(format!("{}: {}", path.display(), msg)),
            other => other,
        })
    }

    /// 解析全部成员，outbounds 在前，endpoints 在后
    ///
    /// 组由构建过程生成，列表中出现 selector / urltest 视为错误。
    pub fn members(&self) -> Result<Vec<Member>, TunnelError> {
        let outbounds = self
            .outbounds
            .iter()
            .map(|v| Member::from_value(MemberKind::Outbound, v.clone()));
        let endpoints = self
            .endpoints
            .iter()
            .map(|v| Member::from_value(MemberKind::Endpoint, v.clone()));
        let members = outbounds
            .chain(endpoints)
            .collect::<Result<Vec<_>, _>>()
            .map_err(TunnelError::Build)?;
        if let Some(group) = members.iter().find(|m| m.is_group()) {
            return Err(TunnelError::Build(format!(
                "'{}' has group type '{}', not allowed in a server list",
                group.tag, group.protocol
            )));
        }
        Ok(members)
    }

    pub fn is_empty(&self) -> bool {
        self.outbounds.is_empty() && self.endpoints.is_empty()
    }
}
