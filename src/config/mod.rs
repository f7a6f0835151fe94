pub mod types;

use anyhow::{Context, Result};
use std::path::Path;

pub use types::{LogConfig, ServiceConfig, TunnelPaths};

/// 加载服务配置；文件不存在时使用默认值
pub fn load_config(path: &str) -> Result<ServiceConfig> {
    let path = Path::new(path);
    let config: ServiceConfig = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        if content.trim().is_empty() {
            ServiceConfig::default()
        } else {
            serde_yml::from_str(&content)
                .with_context(|| format!("parse config {}", path.display()))?
        }
    } else {
        tracing::info!(path = %path.display(), "config file not found, using defaults");
        ServiceConfig::default()
    };

    config.validate()?;
    Ok(config)
}
