use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::RwLock;
use tracing::{debug, info};

/// 客户端统计的作用域：托管分类当前的普通成员
///
/// scope 由隧道在托管分类变化后整体替换；关闭后 scope 清空且不再接受替换。
pub struct ClientInfoTracker {
    scope: RwLock<HashSet<String>>,
    closed: AtomicBool,
}

impl ClientInfoTracker {
    pub fn new(scope: impl IntoIterator<Item = String>) -> Self {
        Self {
            scope: RwLock::new(scope.into_iter().collect()),
            closed: AtomicBool::new(false),
        }
    }

    /// 整体替换 scope；已关闭时返回 false
    pub async fn set_scope(&self, tags: impl IntoIterator<Item = String>) -> bool {
        let mut scope = self.scope.write().await;
        if self.is_closed() {
            return false;
        }
        *scope = tags.into_iter().collect();
        info!(tags = scope.len(), "client tracker scope replaced");
        true
    }

    pub async fn scope(&self) -> Vec<String> {
        let mut tags: Vec<String> = self.scope.read().await.iter().cloned().collect();
        tags.sort();
        tags
    }

    pub async fn is_tracked(&self, outbound_tag: &str) -> bool {
        self.scope.read().await.contains(outbound_tag)
    }

    /// 停止统计并清空 scope，返回清空前的成员数
    pub async fn close(&self) -> usize {
        let mut scope = self.scope.write().await;
        self.closed.store(true, Ordering::Release);
        let count = scope.len();
        scope.clear();
        debug!(count, "client tracker scope cleared");
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
