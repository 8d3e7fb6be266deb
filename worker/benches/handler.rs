//! Ingestion handler benchmarks
//!
//! Measures payload decoding and the full handle path against the
//! in-memory store.

use bytes::Bytes;
use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use serde_json::json;
use std::sync::Arc;
use varasto_worker::RoutingTable;
use varasto_worker::handler::IngestionHandler;
use varasto_worker::message::{InboundMessage, decode_document};
use varasto_worker::store::MemoryStore;

fn make_payload(fields: usize) -> Bytes {
    let mut doc = serde_json::Map::new();
    for i in 0..fields {
        doc.insert(format!("field_{i}"), json!({ "value": i, "label": "benchmark" }));
    }
    Bytes::from(serde_json::Value::Object(doc).to_string())
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode");

    for fields in [1, 10, 100] {
        let payload = make_payload(fields);
        group.throughput(Throughput::Bytes(payload.len() as u64));
        group.bench_function(format!("fields_{fields}"), |b| {
            b.iter(|| decode_document(&payload))
        });
    }

    group.finish();
}

fn bench_handle(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let table = Arc::new(RoutingTable::from_pairs([("orders", "orders_collection")]).unwrap());

    let mut group = c.benchmark_group("handle");

    for fields in [1, 10, 100] {
        let handler = IngestionHandler::new(Arc::clone(&table), Arc::new(MemoryStore::new()));
        let message = InboundMessage::new("orders", 1, make_payload(fields));

        group.throughput(Throughput::Elements(1));
        group.bench_function(format!("fields_{fields}"), |b| {
            b.to_async(&rt).iter(|| handler.handle(&message))
        });
    }

    group.finish();
}

criterion_group!(benches, bench_decode, bench_handle);
criterion_main!(benches);
