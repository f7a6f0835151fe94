use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::app::GroupInfo;
use crate::common::TunnelError;
use crate::config::{ServiceConfig, TunnelPaths};
use crate::options::{build_from_paths, Member};

use super::{ReconcileReport, Status, Tunnel, TunnelConfig};

/// 进程级运行指标
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    /// 常驻内存（字节）
    pub memory: u64,
    /// tokio 存活任务数
    pub tasks: usize,
    pub connections: usize,
    pub uplink_total: u64,
    pub downlink_total: u64,
}

/// 隧道监管者：最多持有一个活动隧道
///
/// start / close / restart 串行执行；status 只读取当前隧道槽位，不等待它们。
pub struct TunnelService {
    paths: TunnelPaths,
    config: TunnelConfig,
    verbs: Mutex<()>,
    slot: RwLock<Option<Arc<Tunnel>>>,
}

impl TunnelService {
    pub fn new(paths: TunnelPaths, config: TunnelConfig) -> Self {
        Self {
            paths,
            config,
            verbs: Mutex::new(()),
            slot: RwLock::new(None),
        }
    }

    pub fn from_config(cfg: &ServiceConfig) -> Self {
        Self::new(cfg.paths(), TunnelConfig::from(cfg))
    }

    pub fn paths(&self) -> &TunnelPaths {
        &self.paths
    }

    fn current(&self) -> Option<Arc<Tunnel>> {
        self.slot.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn replace(&self, tunnel: Option<Arc<Tunnel>>) -> Option<Arc<Tunnel>> {
        let mut slot = self.slot.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *slot, tunnel)
    }

    /// 构建新的路由图并启动隧道
    pub async fn start(&self, category: &str, tag: &str) -> Result<(), TunnelError> {
        let _verbs = self.verbs.lock().await;
        self.start_locked(category, tag).await
    }

    async fn start_locked(&self, category: &str, tag: &str) -> Result<(), TunnelError> {
        if let Some(existing) = self.current() {
            if existing.status() != Status::Closed {
                return Err(TunnelError::AlreadyRunning);
            }
        }

        let graph = build_from_paths(&self.paths)?;
        let tunnel = Arc::new(Tunnel::new(self.config.clone()));
        self.replace(Some(tunnel.clone()));

        if let Err(err) = tunnel.start(category, tag, graph).await {
            self.replace(None);
            return Err(err);
        }
        info!(category, tag, "tunnel service started");
        Ok(())
    }

    /// 没有隧道时直接成功；先摘下隧道引用再关闭
    pub async fn close(&self) -> Result<(), TunnelError> {
        let _verbs = self.verbs.lock().await;
        match self.replace(None) {
            Some(tunnel) => tunnel.close().await,
            None => Ok(()),
        }
    }

    /// 用相同的选择重建隧道
    pub async fn restart(&self) -> Result<(), TunnelError> {
        let _verbs = self.verbs.lock().await;
        let tunnel = self.current().ok_or(TunnelError::NotRunning)?;
        let status = tunnel.status();
        if status != Status::Running {
            return Err(TunnelError::NotReady(status));
        }

        let selection = tunnel.active_selection().await;
        self.replace(None);
        if let Err(err) = tunnel.close().await {
            warn!(error = %err, "previous tunnel closed with errors, restarting anyway");
        }
        info!(mode = selection.mode.as_str(), tag = selection.tag.as_str(), "restarting tunnel");
        match self.start_locked(&selection.mode, &selection.tag).await {
            // 新路由图中已没有原选中项，退回到分类的自动选择
            Err(TunnelError::InvalidSelection(reason)) if !selection.tag.is_empty() => {
                warn!(
                    tag = selection.tag.as_str(),
                    reason = reason.as_str(),
                    "previous selection gone, restarting with automatic selection"
                );
                self.start_locked(&selection.mode, "").await
            }
            result => result,
        }
    }

    pub fn status(&self) -> Status {
        self.current().map_or(Status::Closed, |t| t.status())
    }

    pub async fn select(&self, category: &str, tag: &str) -> Result<(), TunnelError> {
        let tunnel = self.current().ok_or(TunnelError::NotRunning)?;
        tunnel.select_outbound(category, tag).await
    }

    pub async fn groups(&self) -> Result<Vec<GroupInfo>, TunnelError> {
        match self.current() {
            Some(tunnel) => tunnel.groups().await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn update_group(
        &self,
        category: &str,
        members: Vec<Member>,
    ) -> Result<ReconcileReport, TunnelError> {
        let tunnel = self.current().ok_or(TunnelError::NotRunning)?;
        tunnel.update_group(category, members).await
    }

    /// 进程指标；引擎模型不承载流量，连接与流量字段保持为 0
    pub async fn metrics(&self) -> Metrics {
        Metrics {
            memory: resident_memory(),
            tasks: tokio::runtime::Handle::current().metrics().num_alive_tasks(),
            ..Default::default()
        }
    }
}

fn resident_memory() -> u64 {
    #[cfg(target_os = "linux")]
    {
        std::fs::read_to_string("/proc/self/status")
            .ok()
            .and_then(|status| {
                status
                    .lines()
                    .find(|l| l.starts_with("VmRSS:"))
                    .and_then(|l| l.split_whitespace().nth(1))
                    .and_then(|kb| kb.parse::<u64>().ok())
            })
            .map_or(0, |kb| kb * 1024)
    }
    #[cfg(windows)]
    {
        use std::mem;
        #[repr(C)]
        #[allow(non_snake_case)]
        struct ProcessMemoryCounters {
            cb: u32,
            PageFaultCount: u32,
            PeakWorkingSetSize: usize,
            WorkingSetSize: usize,
            QuotaPeakPagedPoolUsage: usize,
            QuotaPagedPoolUsage: usize,
            QuotaPeakNonPagedPoolUsage: usize,
            QuotaNonPagedPoolUsage: usize,
            PagefileUsage: usize,
            PeakPagefileUsage: usize,
        }
        extern "system" {
            fn GetCurrentProcess() -> isize;
            fn K32GetProcessMemoryInfo(
                process: isize,
                ppsmemcounters: *mut ProcessMemoryCounters,
                cb: u32,
            ) -> i32;
        }
        unsafe {
            let mut pmc: ProcessMemoryCounters = mem::zeroed();
            pmc.cb = mem::size_of::<ProcessMemoryCounters>() as u32;
            if K32GetProcessMemoryInfo(GetCurrentProcess(), &mut pmc, pmc.cb) != 0 {
                return pmc.WorkingSetSize as u64;
            }
        }
        0
    }
    #[cfg(not(any(target_os = "linux", windows)))]
    {
        0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::USER_SUPPLIED;
    use std::time::Duration;

    const REMOTE: &str = r#"{"outbounds": [
        {"type": "http", "tag": "http1-out", "server": "10.0.0.1", "server_port": 8080},
        {"type": "http", "tag": "http2-out", "server": "10.0.0.2", "server_port": 8080}
    ]}"#;

    fn service(dir: &std::path::Path) -> TunnelService {
        std::fs::write(dir.join(crate::config::types::REMOTE_SERVERS_FILE), REMOTE).unwrap();
        TunnelService::new(
            TunnelPaths::new(dir),
            TunnelConfig {
                shutdown_timeout: Duration::from_secs(2),
                ..Default::default()
            },
        )
    }

    #[tokio::test]
    async fn start_close_cycle() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        assert_eq!(svc.status(), Status::Closed);

        svc.start("managed", "http2-out").await.unwrap();
        assert_eq!(svc.status(), Status::Running);
        let before = svc.groups().await.unwrap();
        assert!(matches!(
            svc.start("managed", "").await,
            Err(TunnelError::AlreadyRunning)
        ));
        assert_eq!(svc.status(), Status::Running);
        assert_eq!(svc.groups().await.unwrap(), before);

        svc.close().await.unwrap();
        assert_eq!(svc.status(), Status::Closed);
        svc.close().await.unwrap();

        svc.start("", "").await.unwrap();
        assert_eq!(svc.status(), Status::Running);
    }

    #[tokio::test]
    async fn restart_keeps_selection() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        assert!(matches!(svc.restart().await, Err(TunnelError::NotRunning)));

        svc.start("managed", "").await.unwrap();
        svc.select("managed", "http2-out").await.unwrap();
        svc.restart().await.unwrap();

        assert_eq!(svc.status(), Status::Running);
        let groups = svc.groups().await.unwrap();
        let managed = groups.iter().find(|g| g.tag == "managed").unwrap();
        assert_eq!(managed.selected, "http2-out");
    }

    #[tokio::test]
    async fn restart_after_placeholder_filled() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.start(USER_SUPPLIED, "").await.unwrap();

        std::fs::write(
            dir.path().join(crate::config::types::USER_SERVERS_FILE),
            r#"{"outbounds": [{"type": "http", "tag": "mine", "server": "192.168.1.2", "server_port": 8080}]}"#,
        )
        .unwrap();
        svc.restart().await.unwrap();

        assert_eq!(svc.status(), Status::Running);
        let groups = svc.groups().await.unwrap();
        let user = groups.iter().find(|g| g.tag == USER_SUPPLIED).unwrap();
        assert_eq!(user.members, vec!["auto-user-supplied", "mine"]);
        assert_eq!(user.selected, "auto-user-supplied");
    }

    #[tokio::test]
    async fn restart_falls_back_when_selection_vanishes() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        svc.start("managed", "http2-out").await.unwrap();

        std::fs::write(
            dir.path().join(crate::config::types::REMOTE_SERVERS_FILE),
            r#"{"outbounds": [{"type": "http", "tag": "http1-out", "server": "10.0.0.1", "server_port": 8080}]}"#,
        )
        .unwrap();
        svc.restart().await.unwrap();

        assert_eq!(svc.status(), Status::Running);
        let groups = svc.groups().await.unwrap();
        let managed = groups.iter().find(|g| g.tag == "managed").unwrap();
        assert_eq!(managed.selected, "auto-managed");
    }

    #[tokio::test]
    async fn build_failure_leaves_service_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        std::fs::write(dir.path().join(crate::config::types::USER_SERVERS_FILE), "").unwrap();
        assert!(matches!(svc.start("", "").await, Err(TunnelError::Build(_))));
        assert_eq!(svc.status(), Status::Closed);
    }

    #[tokio::test]
    async fn metrics_zero_traffic_when_stopped() {
        let dir = tempfile::tempdir().unwrap();
        let svc = service(dir.path());
        let m = svc.metrics().await;
        assert_eq!((m.connections, m.uplink_total, m.downlink_total), (0, 0, 0));
        assert!(svc.groups().await.unwrap().is_empty());
        assert!(matches!(
            svc.select("managed", "http1-out").await,
            Err(TunnelError::NotRunning)
        ));
    }
}
