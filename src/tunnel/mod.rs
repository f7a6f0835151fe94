//! 隧道生命周期
//!
//! `Tunnel` 持有一个引擎实例及其附属资源（客户端统计、文件监视），
//! 状态机：initializing → connecting → running → closing → closed。
//! closed 是终态，重新运行需要新建 `Tunnel`。

pub mod closer;
pub mod reconcile;
pub mod service;
pub mod status;
pub mod watcher;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use tokio::sync::{oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::app::{ClientInfoTracker, Engine, GroupInfo};
use crate::common::TunnelError;
use crate::config::ServiceConfig;
use crate::options::{auto_tag, is_category, is_sentinel, RoutingGraph, ServerList, AUTO_ALL, MANAGED};

pub use closer::Closer;
pub use reconcile::ReconcileReport;
pub use service::{Metrics, TunnelService};
pub use status::{AtomicStatus, Status};
pub use watcher::{FileWatcher, WatchCallback};

/// 单个隧道的运行参数
#[derive(Debug, Clone)]
pub struct TunnelConfig {
    pub shutdown_timeout: Duration,
    pub watch_debounce: Duration,
    pub abort_on_invariant_violation: bool,
    /// (分类, 服务器列表文件)；为空时不注册文件监视
    pub watch: Vec<(String, PathBuf)>,
}

impl Default for TunnelConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(10),
            watch_debounce: Duration::from_millis(500),
            abort_on_invariant_violation: true,
            watch: Vec::new(),
        }
    }
}

impl From<&ServiceConfig> for TunnelConfig {
    fn from(cfg: &ServiceConfig) -> Self {
        let paths = cfg.paths();
        Self {
            shutdown_timeout: cfg.shutdown_timeout(),
            watch_debounce: cfg.watch_debounce(),
            abort_on_invariant_violation: cfg.abort_on_invariant_violation,
            watch: vec![
                (MANAGED.to_string(), paths.remote_servers),
                (crate::options::USER_SUPPLIED.to_string(), paths.user_servers),
            ],
        }
    }
}

/// 当前生效的选择：模式（分类或 auto-all）与选中的成员
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selection {
    pub mode: String,
    pub tag: String,
}

#[derive(Clone)]
struct Handles {
    engine: Arc<Engine>,
    tracker: Arc<ClientInfoTracker>,
    cancel: CancellationToken,
}

pub struct Tunnel {
    config: TunnelConfig,
    status: AtomicStatus,
    /// 生命周期锁：start / close 串行；持有已获取资源，按获取顺序
    lifecycle: Mutex<Vec<Arc<dyn Closer>>>,
    /// 调和锁：tag → 序列化选项
    opts: Mutex<HashMap<String, String>>,
    handles: RwLock<Option<Handles>>,
    mode: RwLock<String>,
}

impl Tunnel {
    pub fn new(config: TunnelConfig) -> Self {
        Self {
            config,
            status: AtomicStatus::new(Status::Initializing),
            lifecycle: Mutex::new(Vec::new()),
            opts: Mutex::new(HashMap::new()),
            handles: RwLock::new(None),
            mode: RwLock::new(String::new()),
        }
    }

    /// 无锁读取状态
    pub fn status(&self) -> Status {
        self.status.load()
    }

    fn handles(&self) -> Option<Handles> {
        self.handles.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn set_handles(&self, handles: Option<Handles>) -> Option<Handles> {
        let mut guard = self.handles.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *guard, handles)
    }

    /// 启动隧道；任一步骤失败都会释放已获取的资源，最终状态为 closed
    pub async fn start(
        self: &Arc<Self>,
        category: &str,
        tag: &str,
        graph: RoutingGraph,
    ) -> Result<(), TunnelError> {
        let mut closers = self.lifecycle.lock().await;
        match self.status() {
            Status::Initializing if closers.is_empty() && self.handles().is_none() => {}
            Status::Closed | Status::Closing => return Err(TunnelError::NotReady(self.status())),
            _ => return Err(TunnelError::AlreadyRunning),
        }

        self.status.store(Status::Initializing);
        let cancel = CancellationToken::new();

        match self.start_inner(&mut closers, &cancel, category, tag, &graph).await {
            Ok(()) => {
                self.status.store(Status::Running);
                info!(category, tag, "tunnel running");
                Ok(())
            }
            Err(err) => {
                error!(error = %err, kind = err.kind().as_str(), "tunnel start failed, releasing resources");
                cancel.cancel();
                self.set_handles(None);
                let acquired = std::mem::take(&mut *closers);
                if let Err(release_err) = release(acquired, self.config.shutdown_timeout).await {
                    warn!(error = %release_err, "release after failed start incomplete");
                }
                self.status.store(Status::Closed);
                Err(err)
            }
        }
    }

    async fn start_inner(
        self: &Arc<Self>,
        closers: &mut Vec<Arc<dyn Closer>>,
        cancel: &CancellationToken,
        category: &str,
        tag: &str,
        graph: &RoutingGraph,
    ) -> Result<(), TunnelError> {
        let engine = Arc::new(Engine::new(graph, cancel.child_token())?);
        closers.push(engine.clone());

        let tracker = Arc::new(ClientInfoTracker::new(category_members(graph, MANAGED)));
        closers.push(tracker.clone());

        for (watch_category, path) in &self.config.watch {
            let watcher = FileWatcher::spawn(
                path,
                self.config.watch_debounce,
                cancel,
                reload_callback(Arc::downgrade(self), watch_category.clone(), path.clone()),
            )?;
            closers.push(Arc::new(watcher));
        }

        self.status.store(Status::Connecting);
        engine.start().await?;

        self.set_handles(Some(Handles {
            engine,
            tracker,
            cancel: cancel.clone(),
        }));

        if !category.is_empty() {
            self.apply_selection(category, tag).await?;
        }

        let mut opts = self.opts.lock().await;
        opts.clear();
        for member in graph.members().filter(|m| !m.is_group() && !is_sentinel(&m.tag)) {
            opts.insert(member.tag.clone(), member.serialized());
        }
        debug!(members = opts.len(), "options snapshot taken");
        Ok(())
    }

    /// 关闭隧道
    ///
    /// 先取消上下文，再在后台任务中逆序释放资源，并与超时竞争；
    /// 无论哪一方先完成，状态都会被置为 closed。
    pub async fn close(&self) -> Result<(), TunnelError> {
        let mut closers = self.lifecycle.lock().await;
        if self.status() == Status::Closed {
            return Ok(());
        }
        self.status.store(Status::Closing);

        if let Some(handles) = self.set_handles(None) {
            handles.cancel.cancel();
        }
        let acquired = std::mem::take(&mut *closers);
        let result = release(acquired, self.config.shutdown_timeout).await;

        self.status.store(Status::Closed);
        match &result {
            Ok(()) => info!("tunnel closed"),
            Err(err) => warn!(error = %err, "tunnel closed with errors"),
        }
        result
    }

    /// 切换模式，tag 非空时让分类 selector 选中它
    pub async fn select_outbound(&self, category: &str, tag: &str) -> Result<(), TunnelError> {
        let status = self.status();
        if status != Status::Running {
            return Err(TunnelError::NotReady(status));
        }
        self.apply_selection(category, tag).await
    }

    async fn apply_selection(&self, category: &str, tag: &str) -> Result<(), TunnelError> {
        let handles = self.handles().ok_or(TunnelError::NotRunning)?;

        if category == AUTO_ALL {
            if !tag.is_empty() {
                return Err(TunnelError::InvalidSelection(format!(
                    "'{}' is automatic and cannot select '{}'",
                    AUTO_ALL, tag
                )));
            }
        } else if is_category(category) {
            if !tag.is_empty() {
                let selector = handles
                    .engine
                    .outbound_manager()
                    .selector(category)?
                    .ok_or_else(|| {
                        TunnelError::InvariantViolation(format!("selector '{}' missing", category))
                    })?;
                if !selector.select(tag).await {
                    return Err(TunnelError::InvalidSelection(format!(
                        "'{}' is not a member of '{}'",
                        tag, category
                    )));
                }
            }
        } else {
            return Err(TunnelError::InvalidSelection(format!(
                "unknown category '{}'",
                category
            )));
        }

        *self.mode.write().unwrap_or_else(|e| e.into_inner()) = category.to_string();
        info!(mode = category, tag, "selection applied");
        Ok(())
    }

    /// 当前模式与分类 selector 的实际选中项
    pub async fn active_selection(&self) -> Selection {
        let mode = self.mode.read().unwrap_or_else(|e| e.into_inner()).clone();
        let mut tag = String::new();
        if is_category(&mode) {
            if let Some(handles) = self.handles() {
                if let Ok(Some(selector)) = handles.engine.outbound_manager().selector(&mode) {
                    tag = selector.selected_name().await;
                    // 选中自动组或占位哨兵等同于未指定
                    if tag == auto_tag(&mode) || is_sentinel(&tag) {
                        tag.clear();
                    }
                }
            }
        }
        Selection { mode, tag }
    }

    pub async fn groups(&self) -> Result<Vec<GroupInfo>, TunnelError> {
        match self.handles() {
            Some(handles) if self.status() == Status::Running => Ok(handles.engine.groups().await?),
            _ => Ok(Vec::new()),
        }
    }

    pub fn engine(&self) -> Option<Arc<Engine>> {
        self.handles().map(|h| h.engine)
    }

    pub fn tracker(&self) -> Option<Arc<ClientInfoTracker>> {
        self.handles().map(|h| h.tracker)
    }

    /// 运行期的取消信号；未运行时为 None
    pub fn cancel_token(&self) -> Option<CancellationToken> {
        self.handles().map(|h| h.cancel)
    }

    fn abort_on_invariant_violation(&self) -> bool {
        self.config.abort_on_invariant_violation
    }
}

/// 分类 selector 中的普通成员（去掉自动组与哨兵）
fn category_members(graph: &RoutingGraph, category: &str) -> Vec<String> {
    let auto = auto_tag(category);
    graph
        .group_members(category)
        .unwrap_or_default()
        .into_iter()
        .filter(|t| *t != auto && !is_sentinel(t))
        .collect()
}

/// 服务器列表文件变化后重新读取并调和对应分类
fn reload_callback(tunnel: Weak<Tunnel>, category: String, path: PathBuf) -> WatchCallback {
    Arc::new(move || {
        let tunnel = tunnel.clone();
        let category = category.clone();
        let path = path.clone();
        Box::pin(async move {
            let Some(tunnel) = tunnel.upgrade() else {
                return;
            };
            let members = match ServerList::load(&path).and_then(|l| match l {
                Some(list) => list.members(),
                None => Ok(Vec::new()),
            }) {
                Ok(members) => members,
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "server list reload failed");
                    return;
                }
            };
            match tunnel.update_group(&category, members).await {
                Ok(report) => debug!(category = category.as_str(), ?report, "reload applied"),
                Err(err) if err.is_invariant_violation() && tunnel.abort_on_invariant_violation() => {
                    error!(category = category.as_str(), error = %err, "group invariant broken, aborting");
                    std::process::abort();
                }
                Err(err) => warn!(
                    category = category.as_str(),
                    kind = err.kind().as_str(),
                    error = %err,
                    "reload failed"
                ),
            }
        })
    })
}

/// 逆序释放资源，与超时竞争
///
/// 超时后通过 abandon 信号让释放任务在当前 closer 返回后停止，
/// 剩余未释放的 closer 名称会被记录。
async fn release(closers: Vec<Arc<dyn Closer>>, timeout: Duration) -> Result<(), TunnelError> {
    if closers.is_empty() {
        return Ok(());
    }
    let abandon = CancellationToken::new();
    let (tx, rx) = oneshot::channel::<Vec<String>>();

    let task_abandon = abandon.clone();
    tokio::spawn(async move {
        let mut failures = Vec::new();
        let ordered: Vec<_> = closers.into_iter().rev().collect();
        for (i, closer) in ordered.iter().enumerate() {
            if task_abandon.is_cancelled() {
                let skipped: Vec<&str> = ordered[i..].iter().map(|c| c.name()).collect();
                warn!(?skipped, "release abandoned after timeout");
                break;
            }
            match closer.close().await {
                Ok(()) => debug!(closer = closer.name(), "released"),
                Err(err) => {
                    warn!(closer = closer.name(), error = %err, "release failed");
                    failures.push(format!("{}: {:#}", closer.name(), err));
                }
            }
        }
        let _ = tx.send(failures);
    });

    tokio::select! {
        result = rx => match result {
            Ok(failures) if failures.is_empty() => Ok(()),
            Ok(failures) => Err(TunnelError::Other(anyhow::anyhow!(
                "release failed: {}",
                failures.join("; ")
            ))),
            Err(_) => Err(TunnelError::Other(anyhow::anyhow!("release task aborted"))),
        },
        _ = tokio::time::sleep(timeout) => {
            abandon.cancel();
            warn!(timeout_ms = timeout.as_millis() as u64, "resource release timed out");
            Err(TunnelError::Timeout(timeout))
        }
    }
}
