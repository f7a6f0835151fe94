use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tracing::{debug, info};

use crate::common::EngineError;
use crate::options::MemberKind;
use crate::proxy::group::{SelectorGroup, UrlTestGroup};
use crate::proxy::Adapter;

/// 按 tag 管理一类成员（outbound 或 endpoint），保持注册顺序
pub struct AdapterManager {
    kind: MemberKind,
    closed: Arc<AtomicBool>,
    inner: RwLock<Registry>,
}

#[derive(Default)]
struct Registry {
    adapters: HashMap<String, Adapter>,
    order: Vec<String>,
}

impl AdapterManager {
    pub fn new(kind: MemberKind, closed: Arc<AtomicBool>) -> Self {
        Self {
            kind,
            closed,
            inner: RwLock::new(Registry::default()),
        }
    }

    pub fn kind(&self) -> MemberKind {
        self.kind
    }

    fn check_open(&self) -> Result<(), EngineError> {
        if self.closed.load(Ordering::Acquire) {
            Err(EngineError::Closed)
        } else {
            Ok(())
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Registry> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn register(&self, adapter: Adapter) -> Result<(), EngineError> {
        self.check_open()?;
        let mut reg = self.write();
        let tag = adapter.tag().to_string();
        if reg.adapters.contains_key(&tag) {
            return Err(EngineError::DuplicateTag(tag));
        }
        info!(
            tag = tag.as_str(),
            protocol = adapter.protocol(),
            kind = self.kind.as_str(),
            "adapter registered"
        );
        reg.order.push(tag.clone());
        reg.adapters.insert(tag, adapter);
        Ok(())
    }

    pub fn remove(&self, tag: &str) -> Result<(), EngineError> {
        self.check_open()?;
        let mut reg = self.write();
        if reg.adapters.remove(tag).is_none() {
            return Err(EngineError::UnknownTag(tag.to_string()));
        }
        reg.order.retain(|t| t != tag);
        debug!(tag, kind = self.kind.as_str(), "adapter removed");
        Ok(())
    }

    pub fn get(&self, tag: &str) -> Result<Option<Adapter>, EngineError> {
        self.check_open()?;
        Ok(self.read().adapters.get(tag).cloned())
    }

    pub fn contains(&self, tag: &str) -> bool {
        self.read().adapters.contains_key(tag)
    }

    pub fn selector(&self, tag: &str) -> Result<Option<Arc<SelectorGroup>>, EngineError> {
        Ok(match self.get(tag)? {
            Some(Adapter::Selector(g)) => Some(g),
            _ => None,
        })
    }

    pub fn url_test(&self, tag: &str) -> Result<Option<Arc<UrlTestGroup>>, EngineError> {
        Ok(match self.get(tag)? {
            Some(Adapter::UrlTest(g)) => Some(g),
            _ => None,
        })
    }

    /// 按注册顺序列出全部 tag
    pub fn tags(&self) -> Result<Vec<String>, EngineError> {
        self.check_open()?;
        Ok(self.read().order.clone())
    }

    /// 按注册顺序列出全部适配器
    pub fn list(&self) -> Result<Vec<Adapter>, EngineError> {
        self.check_open()?;
        let reg = self.read();
        Ok(reg
            .order
            .iter()
            .filter_map(|t| reg.adapters.get(t).cloned())
            .collect())
    }

    pub fn len(&self) -> usize {
        self.read().adapters.len()
    }
}
