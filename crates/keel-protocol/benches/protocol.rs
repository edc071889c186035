//! Micro-benchmarks for line validation, command classification and
//! reply serialization.
//!
//! Run with `cargo bench -p keel-protocol -- classify` or
//! `cargo bench -p keel-protocol -- serialize`.

use std::hint::black_box;

use bytes::BytesMut;
use criterion::{criterion_group, criterion_main, Criterion};
use keel_protocol::{
    check_literal_with_int_list, find_line, Command, NodeDetails, NodeKey, NodeRecord, Status,
};

fn bench_classify(c: &mut Criterion) {
    let mut group = c.benchmark_group("classify");

    group.bench_function("list", |b| {
        b.iter(|| black_box(Command::parse(b"list").unwrap()));
    });

    group.bench_function("start_node", |b| {
        b.iter(|| black_box(Command::parse(b"start node gridA clusterB node3").unwrap()));
    });

    group.bench_function("update_config", |b| {
        b.iter(|| black_box(Command::parse(b"update config 4096 120").unwrap()));
    });

    group.bench_function("unknown", |b| {
        b.iter(|| black_box(Command::parse(b"reboot node gridA clusterB node3").is_err()));
    });

    group.finish();
}

fn bench_validate(c: &mut Criterion) {
    let mut group = c.benchmark_group("validate");

    group.bench_function("find_line_crlf", |b| {
        let buf = b"list node gridA clusterB node3 full\r\npid 1";
        b.iter(|| black_box(find_line(buf).unwrap()));
    });

    group.bench_function("int_list_8", |b| {
        let line = b"config 1 22 333 4444 55555 666666 7777777 88888888";
        b.iter(|| black_box(check_literal_with_int_list(line, "config ", 8).unwrap()));
    });

    group.finish();
}

fn bench_serialize(c: &mut Criterion) {
    let mut group = c.benchmark_group("serialize");

    group.bench_function("status", |b| {
        let mut buf = BytesMut::with_capacity(64);
        b.iter(|| {
            buf.clear();
            Status::Started(4_194_304).serialize(&mut buf);
            black_box(&buf);
        });
    });

    group.bench_function("full_record", |b| {
        let record = NodeRecord {
            key: NodeKey::new("gridA", "clusterB", "node3").to_owned_key(),
            details: Some(NodeDetails {
                pid: 31_337,
                program: "keel-data".into(),
                started_at: 1_700_000_000,
            }),
        };
        let mut buf = BytesMut::with_capacity(256);
        b.iter(|| {
            buf.clear();
            record.serialize(&mut buf);
            black_box(&buf);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_classify, bench_validate, bench_serialize);
criterion_main!(benches);
