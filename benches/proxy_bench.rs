//! Performance benchmarks for the wire codec and hot-path bookkeeping.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use phoenix_server::wire::{self, SocksAddr};

fn wire_codec_benchmark(c: &mut Criterion) {
    let mut group = c.benchmark_group("wire_codec");
    group.throughput(Throughput::Elements(1));

    group.bench_function("encode_v4", |b| {
        b.iter(|| {
            let mut buf = Vec::new();
            SocksAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1)).encode(black_box(8080), &mut buf);
            black_box(buf);
        })
    });

    group.bench_function("decode_v4", |b| {
        let mut buf = Vec::new();
        SocksAddr::V4(std::net::Ipv4Addr::new(10, 0, 0, 1)).encode(8080, &mut buf);
        b.iter(|| {
            let decoded = SocksAddr::decode(black_box(&buf)).unwrap();
            black_box(decoded);
        })
    });

    group.bench_function("udp_header_roundtrip", |b| {
        b.iter(|| {
            let header = wire::build_udp_header(
                SocksAddr::V4(std::net::Ipv4Addr::LOCALHOST),
                53,
                black_box(b"benchmark payload"),
            );
            let parsed = wire::parse_udp_header(&header).unwrap();
            black_box(parsed);
        })
    });

    group.finish();
}

fn connection_manager_benchmark(c: &mut Criterion) {
    use phoenix_server::connection::ConnectionManager;

    let manager = ConnectionManager::new();
    let addr: std::net::SocketAddr = "127.0.0.1:12345".parse().unwrap();

    let mut group = c.benchmark_group("connection_manager");
    group.bench_function("register_remove", |b| {
        b.iter(|| {
            let id = manager.register(black_box(addr));
            manager.touch(id);
            manager.remove(id);
        })
    });
    group.finish();
}

fn metrics_benchmark(c: &mut Criterion) {
    use phoenix_server::metrics::METRICS;

    let mut group = c.benchmark_group("metrics");
    group.throughput(Throughput::Elements(1));

    group.bench_function("counter_increment", |b| {
        b.iter(|| {
            METRICS.bytes_rx(black_box(1024));
        })
    });

    group.bench_function("snapshot", |b| {
        b.iter(|| {
            let snapshot = METRICS.snapshot();
            black_box(snapshot);
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    wire_codec_benchmark,
    connection_manager_benchmark,
    metrics_benchmark,
);
criterion_main!(benches);
