use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use serde::Deserialize;

/// 后台服务配置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub log: LogConfig,
    /// IPC 套接字路径，默认 `<data_dir>/openworld.sock`（仅 Unix）
    pub socket_path: Option<PathBuf>,
    /// socket 文件权限（八进制字符串，例如 "660"）
    pub socket_mode: String,
    /// 远程下发的服务器列表，默认 `<data_dir>/servers.json`
    pub remote_servers: Option<PathBuf>,
    /// 用户自建服务器列表，默认 `<data_dir>/user_servers.json`
    pub user_servers: Option<PathBuf>,
    pub shutdown_timeout_ms: u64,
    pub watch_debounce_ms: u64,
    pub ipc_timeout_ms: u64,
    pub abort_on_invariant_violation: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            log: LogConfig::default(),
            socket_path: None,
            socket_mode: "660".to_string(),
            remote_servers: None,
            user_servers: None,
            shutdown_timeout_ms: 10_000,
            watch_debounce_ms: 500,
            ipc_timeout_ms: 5_000,
            abort_on_invariant_violation: true,
        }
    }
}

impl ServiceConfig {
    pub fn validate(&self) -> Result<()> {
        if self.data_dir.as_os_str().is_empty() {
            anyhow::bail!("data_dir must not be empty");
        }
        if self.shutdown_timeout_ms == 0 {
            anyhow::bail!("shutdown_timeout_ms must be greater than zero");
        }
        if self.ipc_timeout_ms == 0 {
            anyhow::bail!("ipc_timeout_ms must be greater than zero");
        }
        if u32::from_str_radix(&self.socket_mode, 8).is_err() {
            anyhow::bail!("invalid socket_mode '{}'", self.socket_mode);
        }
        Ok(())
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    pub fn watch_debounce(&self) -> Duration {
        Duration::from_millis(self.watch_debounce_ms)
    }

    pub fn ipc_timeout(&self) -> Duration {
        Duration::from_millis(self.ipc_timeout_ms)
    }

    pub fn socket_mode_bits(&self) -> u32 {
        u32::from_str_radix(&self.socket_mode, 8).unwrap_or(0o600)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.socket_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join(SOCKET_FILE))
    }

    /// 构建 tunnel 所需的文件布局
    pub fn paths(&self) -> TunnelPaths {
        TunnelPaths {
            data_dir: self.data_dir.clone(),
            remote_servers: self
                .remote_servers
                .clone()
                .unwrap_or_else(|| self.data_dir.join(REMOTE_SERVERS_FILE)),
            user_servers: self
                .user_servers
                .clone()
                .unwrap_or_else(|| self.data_dir.join(USER_SERVERS_FILE)),
        }
    }
}

pub const SOCKET_FILE: &str = "openworld.sock";
pub const REMOTE_SERVERS_FILE: &str = "servers.json";
pub const USER_SERVERS_FILE: &str = "user_servers.json";
pub const SPLIT_TUNNEL_FILE: &str = "split-tunnel.json";
pub const AD_BLOCK_FILE: &str = "ad-block.json";
pub const CACHE_FILE: &str = "cache.db";

#[derive(Debug, Clone, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// tunnel 重建所需的全部路径
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelPaths {
    pub data_dir: PathBuf,
    pub remote_servers: PathBuf,
    pub user_servers: PathBuf,
}

impl TunnelPaths {
    pub fn new(data_dir: &Path) -> Self {
        Self {
            data_dir: data_dir.to_path_buf(),
            remote_servers: data_dir.join(REMOTE_SERVERS_FILE),
            user_servers: data_dir.join(USER_SERVERS_FILE),
        }
    }

    pub fn split_tunnel(&self) -> PathBuf {
        self.data_dir.join(SPLIT_TUNNEL_FILE)
    }

    pub fn ad_block(&self) -> PathBuf {
        self.data_dir.join(AD_BLOCK_FILE)
    }

    pub fn cache_file(&self) -> PathBuf {
        self.data_dir.join(CACHE_FILE)
    }
}
