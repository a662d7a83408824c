//! Criterion benchmarks for the header codec.
//!
//! The header codec runs for every message on every session, so both wire
//! forms are measured in both directions.
//!
//! Run with:
//! ```bash
//! cargo bench --package pv-core --bench codec_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use pv_core::protocol::codec::{decode_header, encode_header_into, encode_message};
use pv_core::protocol::{Beacon, Command, Header};

fn make_headers() -> Vec<(&'static str, Header)> {
    vec![
        (
            "legacy",
            Header::new(Command::ReadNotify)
                .with_payload_size(8)
                .with_data_type(6)
                .with_element_count(1)
                .with_cid(42)
                .with_available(1),
        ),
        (
            "large",
            Header::new(Command::EventAdd)
                .with_payload_size(0x10_0000)
                .with_data_type(6)
                .with_element_count(0x2_0000)
                .with_cid(42)
                .with_available(7),
        ),
    ]
}

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_header");
    let mut out = [0u8; 24];
    for (name, hdr) in make_headers() {
        group.bench_with_input(BenchmarkId::from_parameter(name), &hdr, |b, hdr| {
            b.iter(|| encode_header_into(black_box(hdr), &mut out))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_header");
    for (name, hdr) in make_headers() {
        let mut bytes = [0u8; 24];
        let _ = encode_header_into(&hdr, &mut bytes);
        group.bench_with_input(BenchmarkId::from_parameter(name), &bytes, |b, bytes| {
            b.iter(|| decode_header(black_box(bytes), true))
        });
    }
    group.finish();
}

fn bench_search_reply(c: &mut Criterion) {
    let hdr = Header::new(Command::Search)
        .with_data_type(5064)
        .with_cid(1234)
        .with_available(7);
    c.bench_function("encode_search_reply", |b| {
        b.iter(|| encode_message(black_box(&hdr), &13u16.to_be_bytes()))
    });
    c.bench_function("encode_beacon", |b| {
        b.iter(|| black_box(Beacon::new(5064, 99)).encode())
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_search_reply);
criterion_main!(benches);
