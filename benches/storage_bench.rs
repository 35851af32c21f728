//! Benchmarks for pagevault block operations

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use pagevault::{CompressionAlgorithm, Config, StorageProvider};
use tempfile::TempDir;

fn open(dir: &TempDir, compression: CompressionAlgorithm) -> StorageProvider {
    let config = Config::builder()
        .path(dir.path().join("bench.db"))
        .compression(compression)
        .min_extension_bytes(1024 * 1024)
        .build();
    StorageProvider::open(config).unwrap()
}

fn write_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("write_block");

    for size in [256usize, 2048, 16 * 1024] {
        group.throughput(Throughput::Bytes(size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), &size, |b, &size| {
            let dir = TempDir::new().unwrap();
            let provider = open(&dir, CompressionAlgorithm::None);
            let data = vec![0x5Au8; size];
            let mut i = 0u64;
            b.iter(|| {
                provider.write_block(&format!("block-{}", i % 1024), &data).unwrap();
                i += 1;
            });
        });
    }
    group.finish();
}

fn read_benchmarks(c: &mut Criterion) {
    let mut group = c.benchmark_group("read_block");

    for (label, compression) in [("plain", CompressionAlgorithm::None), ("zstd", CompressionAlgorithm::Zstd)] {
        let dir = TempDir::new().unwrap();
        let provider = open(&dir, compression);
        let data: Vec<u8> = (0..32 * 1024).map(|i| (i % 251) as u8).collect();
        for i in 0..64 {
            provider.write_block(&format!("block-{}", i), &data).unwrap();
        }

        group.throughput(Throughput::Bytes(data.len() as u64));
        group.bench_function(label, |b| {
            let mut i = 0u64;
            b.iter(|| {
                provider.read_block(&format!("block-{}", i % 64)).unwrap();
                i += 1;
            });
        });
    }
    group.finish();
}

criterion_group!(benches, write_benchmarks, read_benchmarks);
criterion_main!(benches);
