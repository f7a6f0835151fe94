//! 分组调和测试：先删后增、去重、占位组填充

use std::sync::Arc;

use openworld_vpn::common::TunnelError;
use openworld_vpn::config::TunnelPaths;
use openworld_vpn::options::{build_options, Member, MemberKind, ServerList, MANAGED, USER_SUPPLIED};
use openworld_vpn::tunnel::{Tunnel, TunnelConfig};
use serde_json::json;

fn outbound(protocol: &str, tag: &str, host: &str, port: u16) -> Member {
    Member::from_value(
        MemberKind::Outbound,
        json!({"type": protocol, "tag": tag, "server": host, "server_port": port}),
    )
    .unwrap()
}

async fn running_tunnel(dir: &std::path::Path) -> Arc<Tunnel> {
    let remote = ServerList::parse(
        r#"{"outbounds": [
            {"type": "http", "tag": "http1-out", "server": "10.0.0.1", "server_port": 8080},
            {"type": "socks", "tag": "socks1-out", "server": "10.0.0.2", "server_port": 1080}
        ]}"#,
    )
    .unwrap();
    let graph = build_options(&TunnelPaths::new(dir), Some(&remote), None).unwrap();
    let tunnel = Arc::new(Tunnel::new(TunnelConfig::default()));
    tunnel.start(MANAGED, "", graph).await.unwrap();
    tunnel
}

async fn group_members(tunnel: &Tunnel, tag: &str) -> Vec<String> {
    tunnel
        .groups()
        .await
        .unwrap()
        .into_iter()
        .find(|g| g.tag == tag)
        .map(|g| g.members)
        .unwrap()
}

#[tokio::test]
async fn only_differences_touch_the_engine() {
    let dir = tempfile::tempdir().unwrap();
    let tunnel = running_tunnel(dir.path()).await;

    let report = tunnel
        .update_group(
            MANAGED,
            vec![
                outbound("http", "http1-out", "10.0.0.1", 8080),
                outbound("socks", "socks2-out", "10.0.0.3", 1080),
            ],
        )
        .await
        .unwrap();

    assert_eq!(report.removed, vec!["socks1-out"]);
    assert_eq!(report.added, vec!["socks2-out"]);
    assert_eq!(report.unchanged, vec!["http1-out"]);
    assert_eq!(
        group_members(&tunnel, MANAGED).await,
        vec!["auto-managed", "http1-out", "socks2-out"]
    );
    assert_eq!(
        group_members(&tunnel, "auto-managed").await,
        vec!["http1-out", "socks2-out"]
    );
}

#[tokio::test]
async fn repeated_update_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let tunnel = running_tunnel(dir.path()).await;
    let list = vec![
        outbound("http", "http1-out", "10.0.0.1", 8080),
        outbound("http", "http7-out", "10.0.0.7", 8080),
    ];
    let first = tunnel.update_group(MANAGED, list.clone()).await.unwrap();
    assert_eq!(first.added, vec!["http7-out"]);
    let second = tunnel.update_group(MANAGED, list).await.unwrap();
    assert!(second.is_noop());
}

#[tokio::test]
async fn selector_and_autogroup_stay_in_lockstep() {
    let dir = tempfile::tempdir().unwrap();
    let tunnel = running_tunnel(dir.path()).await;
    tunnel
        .update_group(USER_SUPPLIED, vec![outbound("socks", "home", "192.168.0.2", 1080)])
        .await
        .unwrap();
    tunnel
        .update_group(
            USER_SUPPLIED,
            vec![
                outbound("socks", "home", "192.168.0.3", 1080),
                outbound("http", "office", "172.16.0.1", 3128),
            ],
        )
        .await
        .unwrap();

    for category in [MANAGED, USER_SUPPLIED] {
        let selector = group_members(&tunnel, category).await;
        let auto = group_members(&tunnel, &format!("auto-{}", category)).await;
        assert_eq!(selector[0], format!("auto-{}", category));
        let mut rest = selector[1..].to_vec();
        let mut auto_sorted = auto.clone();
        rest.sort();
        auto_sorted.sort();
        assert_eq!(rest, auto_sorted);
    }
}

#[tokio::test]
async fn closed_tunnel_rejects_updates() {
    let dir = tempfile::tempdir().unwrap();
    let tunnel = running_tunnel(dir.path()).await;
    tunnel.close().await.unwrap();
    let err = tunnel
        .update_group(MANAGED, vec![outbound("http", "x", "10.0.0.1", 80)])
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::NotReady(_)));
}
