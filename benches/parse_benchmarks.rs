//! Subscription decoding and engine config generation benchmarks

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use subtunnel::engine::{ConfigMode, EngineKind, EngineRegistry};
use subtunnel::subscription::{parse_link, parse_subscription};
use subtunnel::Config;

const LINKS: [&str; 5] = [
    "vless://2f1c1b2e-6a5b-4d3c-9e8f-1a2b3c4d5e6f@v.example.com:443?type=ws&security=tls&path=%2Fray&host=cdn.example.com#vless%20node",
    "trojan://secret@t.example.com:443?sni=front.example.com#trojan",
    "hy2://secret@hy.example.com:8443?sni=real.example.com&obfs=salamander&obfs-password=salt#hy2",
    "ss://YWVzLTI1Ni1nY206cHc@ss.example.com:8388#ss",
    "ss://YWVzLTI1Ni1nY206cHdAbGVnYWN5LmV4YW1wbGUuY29tOjgzODg=#legacy",
];

fn vmess_link(n: usize) -> String {
    let json = format!(
        r#"{{"v":"2","ps":"node {n}","add":"n{n}.example.com","port":"443","id":"2f1c1b2e-6a5b-4d3c-9e8f-{n:012}","aid":"0","net":"ws","path":"/ray","tls":"tls"}}"#
    );
    format!("vmess://{}", STANDARD.encode(json))
}

fn payload(count: usize) -> String {
    let lines: Vec<String> = (0..count)
        .map(|n| match n % 6 {
            0 => vmess_link(n),
            i => LINKS[i - 1].to_string(),
        })
        .collect();
    STANDARD.encode(lines.join("\n"))
}

fn link_parsing_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("link_parsing");

    let vmess = vmess_link(1);
    group.bench_function("parse_vmess", |b| {
        b.iter(|| {
            let profile = parse_link(black_box(&vmess)).unwrap();
            black_box(profile);
        });
    });

    for (name, link) in ["vless", "trojan", "hysteria2", "shadowsocks"].iter().zip(LINKS) {
        group.bench_with_input(BenchmarkId::new("parse_url_form", *name), link, |b, link| {
            b.iter(|| {
                let profile = parse_link(black_box(link)).unwrap();
                black_box(profile);
            });
        });
    }

    group.finish();
}

fn subscription_throughput_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("subscription_throughput");

    for count in [10, 100, 1000] {
        let payload = payload(count);
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_with_input(BenchmarkId::new("parse_subscription", count), &payload, |b, payload| {
            b.iter(|| {
                let profiles = parse_subscription(black_box(payload.as_bytes()), "bench");
                black_box(profiles);
            });
        });
    }

    group.finish();
}

fn config_generation_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("config_generation");

    let registry = EngineRegistry::from_config(&Config::default()).unwrap();
    let vmess = parse_link(&vmess_link(1)).unwrap();
    let hysteria = parse_link(LINKS[2]).unwrap();

    if let Some(xray) = registry.get(EngineKind::Xray) {
        group.bench_function("xray_live_config", |b| {
            b.iter(|| {
                let config = xray.build_config(black_box(&vmess), ConfigMode::Live).unwrap();
                black_box(config);
            });
        });
    }

    if let Some(engine) = registry.get(EngineKind::Hysteria) {
        group.bench_function("hysteria_test_config", |b| {
            b.iter(|| {
                let config = engine
                    .build_config(black_box(&hysteria), ConfigMode::Test { socks_port: 40000 })
                    .unwrap();
                black_box(config);
            });
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    link_parsing_benchmark,
    subscription_throughput_benchmark,
    config_generation_benchmark
);
criterion_main!(benches);
