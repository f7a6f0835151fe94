use std::collections::HashMap;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::info;

pub const DEFAULT_TEST_URL: &str = "https://www.gstatic.com/generate_204";
pub const DEFAULT_TOLERANCE_MS: u64 = 50;

/// 自动选择代理组（按延迟最低选择）
///
/// 延迟样本由引擎探测后写入；组本身只负责成员维护与择优。
pub struct UrlTestGroup {
    name: String,
    url: String,
    interval: Duration,
    tolerance: u64,
    state: RwLock<UrlTestState>,
}

struct UrlTestState {
    members: Vec<String>,
    /// member -> Option<latency_ms>，None 表示不可用
    latencies: HashMap<String, Option<u64>>,
    selected: Option<String>,
}

impl std::fmt::Debug for UrlTestGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UrlTestGroup")
            .field("name", &self.name)
            .field("url", &self.url)
            .finish()
    }
}

impl UrlTestGroup {
    pub fn new(
        name: String,
        members: Vec<String>,
        url: String,
        interval: Duration,
        tolerance: u64,
    ) -> Self {
        Self {
            name,
            url,
            interval,
            tolerance,
            state: RwLock::new(UrlTestState {
                members,
                latencies: HashMap::new(),
                selected: None,
            }),
        }
    }

    pub fn tag(&self) -> &str {
        &self.name
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub async fn members(&self) -> Vec<String> {
        self.state.read().await.members.clone()
    }

    pub async fn contains(&self, tag: &str) -> bool {
        self.state.read().await.members.iter().any(|n| n == tag)
    }

    pub async fn add(&self, tag: &str) -> bool {
        let mut state = self.state.write().await;
        if state.members.iter().any(|n| n == tag) {
            return false;
        }
        state.members.push(tag.to_string());
        true
    }

    pub async fn remove(&self, tag: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(idx) = state.members.iter().position(|n| n == tag) else {
            return false;
        };
        state.members.remove(idx);
        state.latencies.remove(tag);
        if state.selected.as_deref() == Some(tag) {
            state.selected = None;
        }
        true
    }

    /// 写入一次探测结果
    pub async fn record_latency(&self, tag: &str, latency: Option<u64>) {
        let mut state = self.state.write().await;
        if state.members.iter().any(|n| n == tag) {
            state.latencies.insert(tag.to_string(), latency);
        }
        self.update_selection(&mut state);
    }

    pub async fn latencies(&self) -> HashMap<String, Option<u64>> {
        self.state.read().await.latencies.clone()
    }

    pub async fn selected_name(&self) -> String {
        let mut state = self.state.write().await;
        self.update_selection(&mut state);
        state
            .selected
            .clone()
            .or_else(|| state.members.first().cloned())
            .unwrap_or_default()
    }

    /// 根据最新延迟数据选择最佳成员
    fn update_selection(&self, state: &mut UrlTestState) {
        let current_latency = state
            .selected
            .as_ref()
            .and_then(|s| state.latencies.get(s).copied().flatten());

        let mut best: Option<(&String, u64)> = None;
        for name in &state.members {
            if let Some(Some(lat)) = state.latencies.get(name) {
                if best.map_or(true, |(_, b)| *lat < b) {
                    best = Some((name, *lat));
                }
            }
        }

        let Some((best_name, best_latency)) = best else {
            return;
        };

        // 只在延迟差超过容差时切换
        let should_switch = match current_latency {
            Some(cur) => cur > best_latency.saturating_add(self.tolerance),
            None => true,
        };

        if should_switch && state.selected.as_ref() != Some(best_name) {
            info!(
                group = self.name,
                from = state.selected.as_deref().unwrap_or(""),
                to = best_name.as_str(),
                latency = best_latency,
                "url-test auto-switched"
            );
            state.selected = Some(best_name.clone());
        }
    }
}

/// 解析 "30s" / "3m" / "1h" 形式的间隔
pub fn parse_interval(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
    let (num, unit) = s.split_at(split);
    let n: u64 = num.parse().ok()?;
    let secs = match unit {
        "" | "s" => n,
        "m" => n.checked_mul(60)?,
        "h" => n.checked_mul(3600)?,
        _ => return None,
    };
    Some(Duration::from_secs(secs))
}
