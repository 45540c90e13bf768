/// Benchmark: hot paths of a run
///
/// - sampler ticks over a full 20-sample download
/// - result section rendering
/// - aggregated config construction for large shards
/// - concurrent appends through the file result sink
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use stairspeed::batch::AggregatedConfig;
use stairspeed::node::{LinkType, NodeRecord};
use stairspeed::probe::{SamplerLimits, SpeedSampler};
use stairspeed::results::sink::render_section;
use stairspeed::results::{FileResultSink, PersistPolicy, ResultSink};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const OUTBOUND: &str = r#"{"outbounds":[{"protocol":"vless","settings":{"vnext":[{"address":"v.example","port":443,"users":[{"id":"00000000-0000-0000-0000-000000000000"}]}]},"streamSettings":{"network":"ws","security":"tls"}}]}"#;

fn limits() -> SamplerLimits {
    SamplerLimits {
        interval: Duration::from_millis(500),
        max_ticks: 20,
        max_bytes: u64::MAX,
        stable_window: 4,
        stable_tolerance: 0.01,
        slow_abort_ticks: 20,
        slow_abort_bytes: 0,
    }
}

fn online_node(id: u32) -> NodeRecord {
    let mut node = NodeRecord::new(id, LinkType::Vless, "v.example", 443, OUTBOUND);
    node.remarks = format!("bench node {}", id);
    node.results.online = true;
    for ms in [40, 42, 0, 41, 39, 40] {
        node.results.raw_ping.push(ms);
    }
    for ms in [120, 118, 125] {
        node.results.raw_site_ping.push(ms);
    }
    for speed in [1 << 20, 3 << 19, 1 << 21] {
        node.results.raw_speed.push(speed);
    }
    node.results.avg_speed = Some(1.5 * 1024.0 * 1024.0);
    node.results.max_speed = Some(2.0 * 1024.0 * 1024.0);
    node.results.total_recv_bytes = 8 << 20;
    node
}

fn bench_sampler_full_download(c: &mut Criterion) {
    c.bench_function("sampler_20_ticks", |b| {
        b.iter(|| {
            let mut sampler = SpeedSampler::new(limits());
            let mut total = 0u64;
            for tick in 0..20u64 {
                // uneven ramp so the stability rule never fires
                total += (tick % 3 + 1) * 400_000;
                if sampler.tick(black_box(total), 4).is_some() {
                    break;
                }
            }
            black_box(sampler.max_speed())
        });
    });
}

fn bench_render_section(c: &mut Criterion) {
    let node = online_node(7);
    c.bench_function("render_section", |b| {
        b.iter(|| black_box(render_section(black_box(&node))));
    });
}

fn bench_aggregate_build(c: &mut Criterion) {
    let mut group = c.benchmark_group("aggregate_build");
    for size in [64usize, 512, 1024] {
        let members: Vec<NodeRecord> = (0..size as u32).map(online_node).collect();
        let ports: Vec<u16> = (0..size as u16).map(|i| 32768 + i).collect();
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, _| {
            b.iter(|| {
                let config = AggregatedConfig::build(&members, &ports).unwrap();
                black_box(config.to_json().len())
            });
        });
    }
    group.finish();
}

fn bench_sink_concurrent_appends(c: &mut Criterion) {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let dir = TempDir::new().unwrap();
    let policy = PersistPolicy {
        site_ping_enabled: true,
        download_enabled: true,
    };

    c.bench_function("sink_64_concurrent_records", |b| {
        b.to_async(&runtime).iter(|| {
            let sink = Arc::new(FileResultSink::new(
                dir.path().join("bench.log"),
                "StairSpeed bench",
                policy,
                false,
            ));
            async move {
                let tasks: Vec<_> = (0..64u32)
                    .map(|id| {
                        let sink = Arc::clone(&sink);
                        tokio::spawn(async move { sink.record_result(&online_node(id)).await })
                    })
                    .collect();
                for task in tasks {
                    let _ = task.await;
                }
            }
        });
    });
}

criterion_group!(
    benches,
    bench_sampler_full_download,
    bench_render_section,
    bench_aggregate_build,
    bench_sink_concurrent_appends
);
criterion_main!(benches);
