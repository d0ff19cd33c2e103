//! Upload benchmarks

use bytes::Bytes;
use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};
use resumable_uploadr::codec::{decode_metadata, encode_metadata, parse_content_range};
use resumable_uploadr::config::StorageConfig;
use resumable_uploadr::storage::{DiskStorage, Storage};
use resumable_uploadr::upload::{bytes_stream, ChunkWrite, FileInit, Metadata};

fn benchmark_codec(c: &mut Criterion) {
    let mut group = c.benchmark_group("codec");

    group.bench_function("parse_content_range", |b| {
        b.iter(|| parse_content_range(black_box("bytes 1048576-2097151/10485760")));
    });

    let mut metadata = Metadata::new();
    metadata.insert("filename".into(), "holiday-video.mp4".into());
    metadata.insert("filetype".into(), "video/mp4".into());
    metadata.insert("checksum".into(), "9e107d9d372bb6826bd81d3542a419d6".into());
    let encoded = encode_metadata(&metadata);

    group.bench_function("encode_metadata", |b| {
        b.iter(|| encode_metadata(black_box(&metadata)));
    });
    group.bench_function("decode_metadata", |b| {
        b.iter(|| decode_metadata(black_box(&encoded)));
    });

    group.finish();
}

fn benchmark_disk_writes(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();
    let dir = tempfile::tempdir().unwrap();
    let storage = rt
        .block_on(DiskStorage::new(StorageConfig::with_directory(dir.path())))
        .unwrap();

    let mut group = c.benchmark_group("disk_chunk_write");

    for size in [64 * 1024, 1024 * 1024, 4 * 1024 * 1024].iter() {
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(format!("{}_bytes", size), size, |b, &size| {
            let data = Bytes::from(vec![0u8; size]);
            b.to_async(&rt).iter(|| {
                let data = data.clone();
                let storage = &storage;
                async move {
                    let record = storage
                        .create(FileInit {
                            size: Some(size as u64),
                            ..Default::default()
                        })
                        .await
                        .unwrap();
                    let record = storage
                        .write(ChunkWrite::new(record.id, 0, bytes_stream(data)))
                        .await
                        .unwrap();
                    black_box(record);
                }
            });
        });
    }

    group.finish();
}

criterion_group!(benches, benchmark_codec, benchmark_disk_writes);
criterion_main!(benches);
