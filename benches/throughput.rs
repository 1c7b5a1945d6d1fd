//! Throughput Benchmark for flashmdb
//!
//! Measures the record codec and the MM* command path on both engines.

use bytes::{Bytes, BytesMut};
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use flashmdb::commands::handler::execute_on;
use flashmdb::commands::CommandTable;
use flashmdb::config::Config;
use flashmdb::connection::ConnectionStats;
use flashmdb::protocol::RequestParser;
use flashmdb::server::ServerState;
use flashmdb::storage::codec;
use flashmdb::storage::store::{BackendKind, MdbConfig, MdbStore};
use std::sync::Arc;
use std::time::Duration;

const NOW_MS: i64 = 1_700_000_000_000;

fn argv(parts: &[&str]) -> Vec<Bytes> {
    parts.iter().map(|s| Bytes::from(s.to_string())).collect()
}

fn state_for(kind: BackendKind, dir: &std::path::Path) -> ServerState {
    let mdb = MdbConfig {
        backend: kind,
        map_size: 1 << 30,
        ..MdbConfig::default()
    };
    let backend = mdb.backend(dir);
    let store = MdbStore::open(mdb.clone(), backend).unwrap();
    let config = Config {
        dir: dir.to_path_buf(),
        mdb,
        ..Config::default()
    };
    ServerState::new(config, store, Arc::new(ConnectionStats::new()))
}

/// Benchmark the record header codec
fn bench_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");
    group.throughput(Throughput::Elements(1));

    let payload = vec![b'x'; 1024];
    group.bench_function("encode_1kb", |b| {
        b.iter(|| black_box(codec::encode(black_box(&payload), Some(NOW_MS))));
    });

    let raw = codec::encode(&payload, Some(NOW_MS));
    group.bench_function("decode_shallow", |b| {
        b.iter(|| black_box(codec::decode(black_box(&raw), true)));
    });
    group.bench_function("decode_full", |b| {
        b.iter(|| black_box(codec::decode(black_box(&raw), false)));
    });

    group.finish();
}

/// Benchmark MMSET / MMGET through the dispatcher
fn bench_commands(c: &mut Criterion) {
    for (name, kind) in [("memory", BackendKind::Memory), ("lmdb", BackendKind::Lmdb)] {
        let dir = tempfile::tempdir().unwrap();
        let mut state = state_for(kind, dir.path());
        let table = CommandTable::new(true);

        for i in 0..10_000 {
            let cmd = argv(&["MMSET", &format!("key:{}", i), &format!("value:{}", i)]);
            execute_on(&mut state, &table, &cmd, NOW_MS);
        }

        let mut group = c.benchmark_group(format!("commands_{}", name));
        group.throughput(Throughput::Elements(1));

        group.bench_function("mmset", |b| {
            let mut i = 0u64;
            b.iter(|| {
                let cmd = argv(&["MMSET", &format!("bench:{}", i), "small_value"]);
                black_box(execute_on(&mut state, &table, &cmd, NOW_MS));
                i += 1;
            });
        });

        group.bench_function("mmget_existing", |b| {
            let mut i = 0u64;
            b.iter(|| {
                let cmd = argv(&["MMGET", &format!("key:{}", i % 10_000)]);
                black_box(execute_on(&mut state, &table, &cmd, NOW_MS));
                i += 1;
            });
        });

        group.bench_function("mmincrby", |b| {
            let cmd = argv(&["MMINCRBY", "counter", "1"]);
            b.iter(|| black_box(execute_on(&mut state, &table, &cmd, NOW_MS)));
        });

        group.finish();
    }
}

/// Benchmark request parsing
fn bench_parser(c: &mut Criterion) {
    let mut group = c.benchmark_group("parser");

    let frame = b"*3\r\n$5\r\nMMSET\r\n$8\r\nkey:1234\r\n$11\r\nsmall_value\r\n";
    group.throughput(Throughput::Bytes(frame.len() as u64));
    group.bench_function("multibulk_mmset", |b| {
        let mut parser = RequestParser::new();
        b.iter(|| {
            let mut buf = BytesMut::from(&frame[..]);
            black_box(parser.parse(&mut buf).unwrap());
        });
    });

    let pipeline: Vec<u8> = frame.iter().copied().cycle().take(frame.len() * 100).collect();
    group.throughput(Throughput::Elements(100));
    group.bench_function("pipeline_100", |b| {
        let mut parser = RequestParser::new();
        b.iter(|| {
            let mut buf = BytesMut::from(&pipeline[..]);
            while let Some(args) = parser.parse(&mut buf).unwrap() {
                black_box(args);
            }
        });
    });

    group.finish();
}

criterion_group! {
    name = benches;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(50);
    targets = bench_codec, bench_commands, bench_parser
}

criterion_main!(benches);
