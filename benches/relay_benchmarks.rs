//! Hot-path benchmarks: head parsing and shared counter updates

use criterion::{Criterion, black_box, criterion_group, criterion_main};
use http_relay::SharedCounters;
use http_relay::counters::OpenRequestGuard;
use http_relay::http1::{parse_request_head, parse_response_head};

const REQUEST: &[u8] = b"GET /MOUNT HTTP/1.1\r\nHost: relay.local:2101\r\nNtrip-Version: Ntrip/2.0\r\nUser-Agent: NTRIP bench/1.0\r\nAuthorization: Basic dXNlcjpwYXNz\r\n\r\n";
const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\nContent-Type: gnss/data\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n";

fn bench_head_parsing(c: &mut Criterion) {
    let mut group = c.benchmark_group("head_parsing");

    group.bench_function("parse_request_head", |b| {
        b.iter(|| black_box(parse_request_head(black_box(REQUEST))));
    });

    group.bench_function("parse_response_head", |b| {
        b.iter(|| black_box(parse_response_head(black_box(RESPONSE))));
    });

    let head = parse_request_head(REQUEST).expect("bench request parses");
    group.bench_function("encode_for_upstream", |b| {
        b.iter(|| black_box(head.encode_for_upstream(black_box("caster.example.com:2101"))));
    });

    group.finish();
}

fn bench_counters(c: &mut Criterion) {
    let mut group = c.benchmark_group("counters");
    let counters = SharedCounters::new();

    group.bench_function("record_bytes", |b| {
        b.iter(|| counters.record_bytes(black_box(1)));
    });

    group.bench_function("open_request_guard", |b| {
        b.iter(|| black_box(OpenRequestGuard::new(counters.clone()).id()));
    });

    group.bench_function("snapshot", |b| {
        b.iter(|| black_box(counters.snapshot()));
    });

    group.finish();
}

criterion_group!(benches, bench_head_parsing, bench_counters);
criterion_main!(benches);
