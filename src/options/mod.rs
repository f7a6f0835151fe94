pub mod builder;
pub mod member;
pub mod server_list;
pub mod types;

pub use builder::{build_from_paths, build_options};
pub use member::{Member, MemberKind};
pub use server_list::ServerList;
pub use types::RoutingGraph;

/// 远程下发的托管服务器分类
pub const MANAGED: &str = "managed";
/// 用户自行添加的服务器分类
pub const USER_SUPPLIED: &str = "user-supplied";
/// 覆盖全部分类的自动选择组
pub const AUTO_ALL: &str = "auto-all";

pub const DIRECT: &str = "direct";
pub const BLOCK: &str = "block";

/// 分类按固定顺序生成路由规则
pub const CATEGORIES: [&str; 2] = [MANAGED, USER_SUPPLIED];

pub fn auto_tag(category: &str) -> String {
    format!("auto-{}", category)
}

/// 哨兵成员只会从组里剔除，不会从引擎里删除
pub fn is_sentinel(tag: &str) -> bool {
    tag == DIRECT || tag == BLOCK
}

pub fn is_category(name: &str) -> bool {
    CATEGORIES.contains(&name)
}
