use std::collections::HashSet;

use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::common::TunnelError;
use crate::config::TunnelPaths;

use super::member::{Member, MemberKind};
use super::server_list::ServerList;
use super::types::{
    CacheFileOptions, ClashApiOptions, DnsOptions, ExperimentalOptions, LogOptions,
    RouteOptions, RoutingGraph,
};
use super::{auto_tag, AUTO_ALL, BLOCK, CATEGORIES, DIRECT, MANAGED, USER_SUPPLIED};

const SPLIT_TUNNEL_TAG: &str = "split-tunnel";
const AD_BLOCK_TAG: &str = "ad-block";
const DNS_REMOTE_TAG: &str = "dns-remote";
const DNS_LOCAL_TAG: &str = "dns-local";

/// 从磁盘读取远程列表与用户列表后构建路由图
pub fn build_from_paths(paths: &TunnelPaths) -> Result<RoutingGraph, TunnelError> {
    let remote = ServerList::load(&paths.remote_servers)?;
    let user = ServerList::load(&paths.user_servers)?;
    build_options(paths, remote.as_ref(), user.as_ref())
}

/// 合成基础配置、远程服务器列表与用户服务器列表
///
/// 每个分类生成一对组：selector `<category>` 与 url-test `auto-<category>`；
/// 最后生成覆盖全部分类的 `auto-all`。
pub fn build_options(
    paths: &TunnelPaths,
    remote: Option<&ServerList>,
    user: Option<&ServerList>,
) -> Result<RoutingGraph, TunnelError> {
    let mut graph = base_options(paths);

    match remote {
        Some(list) => {
            let members = list.members()?;
            merge_remote_fragments(&mut graph, list);
            append_category(&mut graph, MANAGED, members);
        }
        None => {
            warn!("no remote server list, managed traffic will be blocked");
            append_category(&mut graph, MANAGED, Vec::new());
        }
    }

    match user {
        Some(list) => append_category(&mut graph, USER_SUPPLIED, list.members()?),
        None => append_category(&mut graph, USER_SUPPLIED, Vec::new()),
    }

    let autos: Vec<String> = CATEGORIES.iter().map(|c| auto_tag(c)).collect();
    graph.outbounds.push(Member::url_test(AUTO_ALL, autos));

    for category in CATEGORIES {
        graph
            .route
            .rules
            .push(json!({"clash_mode": category, "outbound": category}));
    }
    graph
        .route
        .rules
        .push(json!({"clash_mode": AUTO_ALL, "outbound": AUTO_ALL}));

    check_unique_tags(&graph)?;

    info!(
        outbounds = graph.outbounds.len(),
        endpoints = graph.endpoints.len(),
        rules = graph.route.rules.len(),
        "routing options built"
    );
    Ok(graph)
}

/// 固定的基础配置：DNS、TUN 入站、哨兵出站与前置路由规则
fn base_options(paths: &TunnelPaths) -> RoutingGraph {
    let mut tun = json!({
        "type": "tun",
        "tag": "tun-in",
        "address": ["172.19.0.1/30", "fdfe:dcba:9876::1/126"],
        "mtu": 1500,
        "auto_route": true,
        "strict_route": true,
    });
    if cfg!(target_os = "linux") {
        tun["auto_redirect"] = Value::Bool(true);
    }

    let mut rule_set = vec![json!({
        "type": "local",
        "tag": SPLIT_TUNNEL_TAG,
        "format": "source",
        "path": paths.split_tunnel(),
    })];
    let mut rules = vec![
        json!({"action": "sniff"}),
        json!({"protocol": "dns", "action": "hijack-dns"}),
        json!({"rule_set": SPLIT_TUNNEL_TAG, "outbound": DIRECT}),
    ];

    let ad_block = paths.ad_block();
    if ad_block.exists() {
        rule_set.push(json!({
            "type": "local",
            "tag": AD_BLOCK_TAG,
            "format": "source",
            "path": ad_block,
        }));
        rules.push(json!({"rule_set": AD_BLOCK_TAG, "outbound": BLOCK}));
    }

    RoutingGraph {
        log: LogOptions::default(),
        dns: DnsOptions {
            servers: vec![
                json!({"tag": DNS_REMOTE_TAG, "type": "https", "server": "1.1.1.1"}),
                json!({"tag": DNS_LOCAL_TAG, "type": "local"}),
            ],
            rules: vec![json!({"rule_set": SPLIT_TUNNEL_TAG, "server": DNS_LOCAL_TAG})],
            final_server: Some(DNS_REMOTE_TAG.to_string()),
            strategy: None,
        },
        inbounds: vec![tun],
        outbounds: vec![
            Member::new(MemberKind::Outbound, DIRECT, DIRECT, json!({})),
            Member::new(MemberKind::Outbound, BLOCK, BLOCK, json!({})),
        ],
        endpoints: Vec::new(),
        route: RouteOptions {
            rules,
            rule_set,
            final_outbound: Some(AUTO_ALL.to_string()),
            auto_detect_interface: true,
        },
        experimental: Some(ExperimentalOptions {
            cache_file: Some(CacheFileOptions {
                enabled: true,
                path: paths.cache_file(),
            }),
            clash_api: Some(ClashApiOptions {
                default_mode: AUTO_ALL.to_string(),
            }),
        }),
    }
}

/// 远程列表携带的路由规则、规则集与 DNS 条目
fn merge_remote_fragments(graph: &mut RoutingGraph, list: &ServerList) {
    if let Some(route) = &list.route {
        graph.route.rules.extend(route.rules.iter().cloned());
        graph.route.rule_set.extend(route.rule_set.iter().cloned());
    }
    if let Some(dns) = &list.dns {
        graph.dns.servers.extend(dns.servers.iter().cloned());
        graph.dns.rules.extend(dns.rules.iter().cloned());
    }
}

fn append_category(graph: &mut RoutingGraph, category: &str, members: Vec<Member>) {
    let auto = auto_tag(category);
    if members.is_empty() {
        debug!(category, "no servers, installing placeholder groups");
        graph
            .outbounds
            .push(Member::selector(category, vec![BLOCK.to_string()], BLOCK));
        graph
            .outbounds
            .push(Member::url_test(&auto, vec![BLOCK.to_string()]));
        return;
    }

    let tags: Vec<String> = members.iter().map(|m| m.tag.clone()).collect();
    for member in members {
        graph.push_member(member);
    }

    let mut selectable = Vec::with_capacity(tags.len() + 1);
    selectable.push(auto.clone());
    selectable.extend(tags.iter().cloned());

    graph.outbounds.push(Member::url_test(&auto, tags));
    graph
        .outbounds
        .push(Member::selector(category, selectable, &auto));
    debug!(category, "category groups generated");
}

fn check_unique_tags(graph: &RoutingGraph) -> Result<(), TunnelError> {
    let mut seen = HashSet::new();
    for member in graph.members() {
        if !seen.insert(member.tag.as_str()) {
            return Err(TunnelError::Build(format!("duplicate tag '{}'", member.tag)));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paths() -> (tempfile::TempDir, TunnelPaths) {
        let dir = tempfile::tempdir().unwrap();
        let paths = TunnelPaths::new(dir.path());
        (dir, paths)
    }

    fn remote_list() -> ServerList {
        ServerList::parse(
            r#"{
                "outbounds": [
                    {"type": "http", "tag": "http1-out", "server": "10.0.0.1", "server_port": 8080},
                    {"type": "http", "tag": "http2-out", "server": "10.0.0.2", "server_port": 8080}
                ],
                "route": {"rules": [{"domain_suffix": ["corp"], "outbound": "managed"}]},
                "dns": {"servers": [{"tag": "dns-corp", "type": "udp", "server": "10.0.0.53"}]}
            }"#,
        )
        .unwrap()
    }

    #[test]
    fn managed_category_groups_from_remote_list() {
        let (_dir, paths) = paths();
        let graph = build_options(&paths, Some(&remote_list()), None).unwrap();

        assert_eq!(
            graph.group_members("managed").unwrap(),
            vec!["auto-managed", "http1-out", "http2-out"]
        );
        assert_eq!(
            graph.group_members("auto-managed").unwrap(),
            vec!["http1-out", "http2-out"]
        );
        assert_eq!(graph.group_members("user-supplied").unwrap(), vec!["block"]);
        assert_eq!(
            graph.group_members("auto-all").unwrap(),
            vec!["auto-managed", "auto-user-supplied"]
        );
        assert_eq!(
            graph.member("managed").unwrap().str_option("default"),
            Some("auto-managed")
        );
    }

    #[test]
    fn absent_sources_fail_safe_to_block() {
        let (_dir, paths) = paths();
        let graph = build_options(&paths, None, None).unwrap();
        for category in CATEGORIES {
            assert_eq!(graph.group_members(category).unwrap(), vec!["block"]);
            assert_eq!(
                graph.group_members(&auto_tag(category)).unwrap(),
                vec!["block"]
            );
            assert_eq!(
                graph.member(category).unwrap().str_option("default"),
                Some("block")
            );
        }
    }

    #[test]
    fn rule_order_is_fixed() {
        let (_dir, paths) = paths();
        let graph = build_options(&paths, Some(&remote_list()), None).unwrap();
        let rules = &graph.route.rules;

        assert_eq!(rules[0]["action"], "sniff");
        assert_eq!(rules[1]["action"], "hijack-dns");
        assert_eq!(rules[2]["rule_set"], "split-tunnel");
        assert_eq!(rules[2]["outbound"], "direct");
        // 远程规则位于分类规则之前
        assert_eq!(rules[3]["outbound"], "managed");
        assert!(rules[3].get("clash_mode").is_none());
        assert_eq!(rules[4]["clash_mode"], "managed");
        assert_eq!(rules[5]["clash_mode"], "user-supplied");
        assert_eq!(rules[6]["clash_mode"], "auto-all");
        assert_eq!(graph.route.final_outbound.as_deref(), Some("auto-all"));
    }

    #[test]
    fn ad_block_rule_only_when_file_present() {
        let (dir, paths) = paths();
        let graph = build_options(&paths, None, None).unwrap();
        assert!(!graph.route.rules.iter().any(|r| r["rule_set"] == "ad-block"));

        std::fs::write(dir.path().join("ad-block.json"), r#"{"version": 2, "rules": []}"#).unwrap();
        let graph = build_options(&paths, None, None).unwrap();
        assert_eq!(graph.route.rules[3]["rule_set"], "ad-block");
        assert_eq!(graph.route.rules[3]["outbound"], "block");
        assert_eq!(graph.route.rule_set.len(), 2);
    }

    #[test]
    fn remote_dns_entries_are_merged() {
        let (_dir, paths) = paths();
        let graph = build_options(&paths, Some(&remote_list()), None).unwrap();
        assert!(graph.dns.servers.iter().any(|s| s["tag"] == "dns-corp"));
        assert!(graph.cache_file().unwrap().enabled);
    }

    #[test]
    fn duplicate_tags_across_categories_rejected() {
        let (_dir, paths) = paths();
        let user = ServerList::parse(
            r#"{"outbounds": [{"type": "http", "tag": "http1-out", "server": "x", "server_port": 1}]}"#,
        )
        .unwrap();
        let err = build_options(&paths, Some(&remote_list()), Some(&user)).unwrap_err();
        assert!(matches!(err, TunnelError::Build(msg) if msg.contains("http1-out")));
    }

    #[test]
    fn reserved_tag_collision_rejected() {
        let (_dir, paths) = paths();
        let user = ServerList::parse(r#"{"outbounds": [{"type": "direct", "tag": "direct"}]}"#)
            .unwrap();
        assert!(build_options(&paths, None, Some(&user)).is_err());
    }

    #[test]
    fn build_from_paths_reads_files() {
        let (dir, paths) = paths();
        std::fs::write(
            dir.path().join("user_servers.json"),
            r#"{"endpoints": [{"type": "wireguard", "tag": "wg-home", "address": ["10.8.0.2/32"]}]}"#,
        )
        .unwrap();
        let graph = build_from_paths(&paths).unwrap();
        assert_eq!(
            graph.group_members("user-supplied").unwrap(),
            vec!["auto-user-supplied", "wg-home"]
        );
        assert_eq!(graph.endpoints.len(), 1);
        assert_eq!(graph.group_members("managed").unwrap(), vec!["block"]);

        std::fs::write(dir.path().join("servers.json"), "{oops").unwrap();
        assert!(matches!(build_from_paths(&paths), Err(TunnelError::Build(_))));
    }

    #[test]
    fn group_entries_in_server_lists_rejected() {
        let (_dir, paths) = paths();
        let remote = ServerList::parse(
            r#"{"outbounds": [
                {"type": "http", "tag": "http1-out", "server": "10.0.0.1", "server_port": 8080},
                {"type": "selector", "tag": "evil", "outbounds": ["ghost"]}
            ]}"#,
        )
        .unwrap();
        let err = build_options(&paths, Some(&remote), None).unwrap_err();
        assert!(matches!(&err, TunnelError::Build(msg) if msg.contains("evil")));

        let user = ServerList::parse(
            r#"{"outbounds": [{"type": "urltest", "tag": "fast", "outbounds": ["http1-out"]}]}"#,
        )
        .unwrap();
        assert!(matches!(
            build_options(&paths, None, Some(&user)),
            Err(TunnelError::Build(_))
        ));
    }
}
