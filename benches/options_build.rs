use criterion::{black_box, criterion_group, criterion_main, Criterion};
use serde_json::json;

use openworld_vpn::config::TunnelPaths;
use openworld_vpn::options::{build_options, Member, MemberKind, ServerList, MANAGED};
use openworld_vpn::tunnel::{Tunnel, TunnelConfig};

fn server_list(count: usize, offset: usize) -> String {
    let outbounds: Vec<_> = (0..count)
        .map(|i| {
            json!({
                "type": "http",
                "tag": format!("http{}-out", i + offset),
                "server": format!("10.0.{}.{}", i / 250, i % 250 + 1),
                "server_port": 8080
            })
        })
        .collect();
    json!({ "outbounds": outbounds }).to_string()
}

fn bench_build_options(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let paths = TunnelPaths::new(dir.path());
    let remote = ServerList::parse(&server_list(200, 0)).unwrap();
    let user = ServerList::parse(&server_list(20, 1000)).unwrap();

    c.bench_function("build_options_220_members", |b| {
        b.iter(|| {
            black_box(build_options(&paths, Some(&remote), Some(&user)).unwrap());
        });
    });
}

fn bench_reconcile_diff(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let remote = ServerList::parse(&server_list(200, 0)).unwrap();
    let graph = build_options(&TunnelPaths::new(dir.path()), Some(&remote), None).unwrap();
    let tunnel = std::sync::Arc::new(Tunnel::new(TunnelConfig::default()));
    rt.block_on(tunnel.start("", "", graph)).unwrap();

    // 与当前配置完全相同：只走去重路径
    let same: Vec<Member> = remote.members().unwrap();
    c.bench_function("reconcile_noop_200", |b| {
        b.iter(|| {
            black_box(rt.block_on(tunnel.update_group(MANAGED, same.clone())).unwrap());
        });
    });

    let a: Vec<Member> = ServerList::parse(&server_list(200, 0)).unwrap().members().unwrap();
    let mut b_list = a.clone();
    b_list[0] = Member::from_value(
        MemberKind::Outbound,
        json!({"type": "http", "tag": "http0-out", "server": "10.9.9.9", "server_port": 8080}),
    )
    .unwrap();
    let mut flip = false;
    c.bench_function("reconcile_swap_one_of_200", |b| {
        b.iter(|| {
            flip = !flip;
            let list = if flip { b_list.clone() } else { a.clone() };
            black_box(rt.block_on(tunnel.update_group(MANAGED, list)).unwrap());
        });
    });
}

criterion_group!(benches, bench_build_options, bench_reconcile_diff);
criterion_main!(benches);
