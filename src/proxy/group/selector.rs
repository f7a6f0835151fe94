use tokio::sync::RwLock;
use tracing::info;

/// 手动选择代理组
///
/// 成员列表可在运行期增删；当前选中项被删除时回落到默认项。
pub struct SelectorGroup {
    name: String,
    default: String,
    state: RwLock<SelectorState>,
}

struct SelectorState {
    members: Vec<String>,
    selected: String,
}

impl std::fmt::Debug for SelectorGroup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelectorGroup")
            .field("name", &self.name)
            .field("default", &self.default)
            .finish()
    }
}

impl SelectorGroup {
    pub fn new(name: String, members: Vec<String>, default: String) -> Self {
        let selected = if members.contains(&default) {
            default.clone()
        } else {
            members.first().cloned().unwrap_or_default()
        };
        Self {
            name,
            default,
            state: RwLock::new(SelectorState { members, selected }),
        }
    }

    pub fn tag(&self) -> &str {
        &self.name
    }

    pub fn default_member(&self) -> &str {
        &self.default
    }

    pub async fn select(&self, name: &str) -> bool {
        let mut state = self.state.write().await;
        if state.members.iter().any(|n| n == name) {
            state.selected = name.to_string();
            info!(group = self.name, selected = name, "proxy group selection changed");
            true
        } else {
            false
        }
    }

    pub async fn selected_name(&self) -> String {
        self.state.read().await.selected.clone()
    }

    pub async fn members(&self) -> Vec<String> {
        self.state.read().await.members.clone()
    }

    pub async fn contains(&self, tag: &str) -> bool {
        self.state.read().await.members.iter().any(|n| n == tag)
    }

    /// 追加成员；已存在时返回 false
    pub async fn add(&self, tag: &str) -> bool {
        let mut state = self.state.write().await;
        if state.members.iter().any(|n| n == tag) {
            return false;
        }
        state.members.push(tag.to_string());
        if state.selected.is_empty() {
            state.selected = tag.to_string();
        }
        true
    }

    /// 插入到列表头部（自动组固定在第一位）
    pub async fn insert_front(&self, tag: &str) -> bool {
        let mut state = self.state.write().await;
        if state.members.iter().any(|n| n == tag) {
            return false;
        }
        state.members.insert(0, tag.to_string());
        if state.selected.is_empty() || tag == self.default {
            state.selected = tag.to_string();
        }
        true
    }

    pub async fn remove(&self, tag: &str) -> bool {
        let mut state = self.state.write().await;
        let Some(idx) = state.members.iter().position(|n| n == tag) else {
            return false;
        };
        state.members.remove(idx);
        if state.selected == tag {
            state.selected = if state.members.contains(&self.default) {
                self.default.clone()
            } else {
                state.members.first().cloned().unwrap_or_default()
            };
            info!(
                group = self.name,
                removed = tag,
                selected = state.selected,
                "selected member removed, falling back"
            );
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn default_selected_when_present() {
        let g = SelectorGroup::new("sel".into(), names(&["auto", "a", "b"]), "auto".into());
        assert_eq!(g.selected_name().await, "auto");

        let g = SelectorGroup::new("sel".into(), names(&["a", "b"]), "missing".into());
        assert_eq!(g.selected_name().await, "a");
    }

    #[tokio::test]
    async fn select_unknown_member_keeps_choice() {
        let g = SelectorGroup::new("sel".into(), names(&["a", "b"]), "a".into());
        assert!(g.select("b").await);
        assert!(!g.select("zzz").await);
        assert_eq!(g.selected_name().await, "b");
    }

    #[tokio::test]
    async fn removing_selected_falls_back_to_default() {
        let g = SelectorGroup::new("sel".into(), names(&["auto", "a", "b"]), "auto".into());
        assert!(g.select("b").await);
        assert!(g.remove("b").await);
        assert_eq!(g.selected_name().await, "auto");
        assert!(!g.remove("b").await);
        assert_eq!(g.members().await, names(&["auto", "a"]));
    }

    #[tokio::test]
    async fn add_and_insert_front() {
        let g = SelectorGroup::new("sel".into(), names(&["block"]), "block".into());
        assert!(g.remove("block").await);
        assert_eq!(g.selected_name().await, "");
        assert!(g.add("x").await);
        assert!(!g.add("x").await);
        assert!(g.insert_front("auto").await);
        assert_eq!(g.members().await, names(&["auto", "x"]));
        assert!(g.contains("x").await);
    }
}
