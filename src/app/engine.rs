use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::common::EngineError;
use crate::options::{Member, MemberKind, RoutingGraph};
use crate::proxy::Adapter;

use super::adapter_manager::AdapterManager;

/// 组的运行时快照
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInfo {
    pub tag: String,
    #[serde(rename = "type")]
    pub group_type: String,
    pub members: Vec<String>,
    pub selected: String,
}

/// 代理内核实例：只暴露控制面需要的适配器管理接口
pub struct Engine {
    outbounds: AdapterManager,
    endpoints: AdapterManager,
    closed: Arc<AtomicBool>,
    started: AtomicBool,
    cache_file: PathBuf,
    log_level: String,
    cancel: CancellationToken,
}

impl Engine {
    /// 从路由图初始化；cache_file 选项是必需的
    pub fn new(graph: &RoutingGraph, cancel: CancellationToken) -> Result<Self, EngineError> {
        let cache_file = match graph.cache_file() {
            Some(c) if c.enabled && !c.path.as_os_str().is_empty() => c.path.clone(),
            _ => return Err(EngineError::MissingCacheFile),
        };

        let closed = Arc::new(AtomicBool::new(false));
        let engine = Self {
            outbounds: AdapterManager::new(MemberKind::Outbound, closed.clone()),
            endpoints: AdapterManager::new(MemberKind::Endpoint, closed.clone()),
            closed,
            started: AtomicBool::new(false),
            cache_file,
            log_level: graph.log.level.clone(),
            cancel,
        };

        for member in graph.members() {
            engine.create_member(member)?;
        }

        // 组成员必须都已注册
        for member in graph.members().filter(|m| m.is_group()) {
            for tag in member.group_members().unwrap_or_default() {
                if !engine.contains(&tag) {
                    return Err(EngineError::UnknownTag(tag));
                }
            }
        }

        info!(
            outbounds = engine.outbounds.len(),
            endpoints = engine.endpoints.len(),
            log_level = engine.log_level.as_str(),
            "engine initialized"
        );
        Ok(engine)
    }

    pub async fn start(&self) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::AlreadyStarted);
        }
        info!(cache_file = %self.cache_file.display(), "engine started");
        Ok(())
    }

    /// 关闭引擎，之后所有管理接口都返回 `EngineError::Closed`；可重复调用
    pub async fn close(&self) -> Result<(), EngineError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            debug!("engine already closed");
            return Ok(());
        }
        self.cancel.cancel();
        info!("engine closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn outbound_manager(&self) -> &AdapterManager {
        &self.outbounds
    }

    pub fn endpoint_manager(&self) -> &AdapterManager {
        &self.endpoints
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.outbounds.contains(tag) || self.endpoints.contains(tag)
    }

    /// 新建成员；tag 在 outbound 与 endpoint 之间全局唯一
    pub fn create_member(&self, member: &Member) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        if self.contains(&member.tag) {
            return Err(EngineError::DuplicateTag(member.tag.clone()));
        }
        let adapter = Adapter::from_member(member)?;
        match member.kind {
            MemberKind::Outbound => self.outbounds.register(adapter),
            MemberKind::Endpoint => self.endpoints.register(adapter),
        }
    }

    pub fn remove_member(&self, tag: &str) -> Result<(), EngineError> {
        if self.is_closed() {
            return Err(EngineError::Closed);
        }
        if self.endpoints.contains(tag) {
            self.endpoints.remove(tag)
        } else {
            self.outbounds.remove(tag)
        }
    }

    /// 列出所有组及其成员、当前选中项
    pub async fn groups(&self) -> Result<Vec<GroupInfo>, EngineError> {
        let mut groups = Vec::new();
        for adapter in self.outbounds.list()? {
            let info = match adapter {
                Adapter::Selector(g) => GroupInfo {
                    tag: g.tag().to_string(),
                    group_type: crate::proxy::SELECTOR.to_string(),
                    members: g.members().await,
                    selected: g.selected_name().await,
                },
                Adapter::UrlTest(g) => GroupInfo {
                    tag: g.tag().to_string(),
                    group_type: crate::proxy::URLTEST.to_string(),
                    members: g.members().await,
                    selected: g.selected_name().await,
                },
                _ => continue,
            };
            groups.push(info);
        }
        Ok(groups)
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        if !self.is_closed() {
            warn!("engine dropped without close");
            self.cancel.cancel();
        }
    }
}
