//! Performance benchmark for throughput
//!
//! Measures command encoding and the double-buffered pipeline writing to a
//! sink that discards everything, so the numbers exclude the network.

use async_trait::async_trait;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use docdb_bulk_insert::bulk_insert::buffer::EncodingBuffer;
use docdb_bulk_insert::bulk_insert::command::PutCommand;
use docdb_bulk_insert::bulk_insert::output::{OutputStream, RequestBodyWriter};
use docdb_bulk_insert::bulk_insert::pipeline::TransmissionPipeline;
use docdb_bulk_insert::{CompressionLevel, Metadata};
use serde_json::{json, Value};
use std::io;
use tokio_util::sync::CancellationToken;

struct DiscardStream;

#[async_trait]
impl OutputStream for DiscardStream {
    async fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        black_box(data);
        Ok(())
    }

    async fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

fn create_documents(count: usize) -> Vec<(String, Value)> {
    (0..count)
        .map(|i| {
            (
                format!("users/{}", i),
                json!({"Name": format!("name_{}", i), "Age": i % 90, "Tags": ["a", "b"]}),
            )
        })
        .collect()
}

fn collection_metadata() -> Metadata {
    let mut metadata = Metadata::new();
    metadata.insert("@collection".to_string(), json!("Users"));
    metadata
}

fn bench_encoding(c: &mut Criterion) {
    let mut group = c.benchmark_group("encoding");
    let metadata = collection_metadata();

    for count in [100, 1000, 10000] {
        let documents = create_documents(count);
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(
            BenchmarkId::from_parameter(format!("{}_documents", count)),
            &documents,
            |b, documents| {
                let mut buffer = EncodingBuffer::with_capacity(1024 * 1024);
                b.iter(|| {
                    buffer.reset();
                    for (i, (id, document)) in documents.iter().enumerate() {
                        PutCommand {
                            id,
                            document,
                            metadata: &metadata,
                        }
                        .encode(&mut buffer, i == 0, None)
                        .unwrap();
                    }
                    black_box(buffer.len());
                });
            },
        );
    }

    group.finish();
}

fn bench_pipeline(c: &mut Criterion) {
    let mut group = c.benchmark_group("pipeline");
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let metadata = collection_metadata();
    let documents = create_documents(10000);
    group.throughput(Throughput::Elements(documents.len() as u64));

    for (label, compression) in [
        ("plain", CompressionLevel::NoCompression),
        ("gzip_fastest", CompressionLevel::Fastest),
    ] {
        for max_buffer_size in [16 * 1024, 1024 * 1024] {
            group.bench_function(
                BenchmarkId::new(label, format!("{}_byte_threshold", max_buffer_size)),
                |b| {
                    b.iter(|| {
                        runtime.block_on(async {
                            let mut pipeline = TransmissionPipeline::new(
                                RequestBodyWriter::new(Box::new(DiscardStream), compression),
                                EncodingBuffer::with_capacity(64 * 1024),
                                EncodingBuffer::with_capacity(64 * 1024),
                                max_buffer_size,
                                CancellationToken::new(),
                            );
                            pipeline.current_mut().push(b'[');
                            for (i, (id, document)) in documents.iter().enumerate() {
                                PutCommand {
                                    id,
                                    document,
                                    metadata: &metadata,
                                }
                                .encode(pipeline.current_mut(), i == 0, None)
                                .unwrap();
                                pipeline.flush_if_needed().await.unwrap();
                            }
                            pipeline.current_mut().push(b']');
                            pipeline.close().await.unwrap();
                            black_box(pipeline.swaps());
                        })
                    });
                },
            );
        }
    }

    group.finish();
}

criterion_group!(benches, bench_encoding, bench_pipeline);
criterion_main!(benches);
