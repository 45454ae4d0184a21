//! Model repository benchmarks
//!
//! Benchmarks for the on-disk model store:
//! - Save and load of a single compressed artifact
//! - Latest-model lookup as the number of stored models grows

use chrono::Utc;
use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use nlu_manager::engine::{Model, ModelData};
use nlu_manager::{BriefId, ModelId, ModelRepository};
use std::hint::black_box;
use tempfile::TempDir;
use tokio::runtime::Runtime;

const SECRET: &str = "bench-secret";

fn model(seed: i64, payload_len: usize) -> Model {
    let id: ModelId = format!("0123456789abcdef.fedcba9876543210.{}.en", seed)
        .parse()
        .unwrap();
    Model {
        id,
        started_at: Utc::now(),
        finished_at: Utc::now(),
        data: ModelData {
            input: "x".repeat(payload_len),
            output: "y".repeat(payload_len),
        },
    }
}

async fn populated_repository(dir: &TempDir, count: usize) -> ModelRepository {
    let repository = ModelRepository::new(dir.path().join("models"));
    repository.init().await.unwrap();
    for seed in 0..count as i64 {
        repository.save_model(&model(seed, 256), SECRET).await.unwrap();
    }
    repository
}

fn bench_save_get(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("repository_save_get");

    for payload_len in [1_024, 64 * 1_024] {
        let dir = TempDir::new().unwrap();
        let repository = rt.block_on(populated_repository(&dir, 0));
        let artifact = model(1, payload_len);

        group.bench_with_input(
            BenchmarkId::new("payload_bytes", payload_len),
            &artifact,
            |b, artifact| {
                b.to_async(&rt).iter(|| async {
                    repository.save_model(artifact, SECRET).await.unwrap();
                    let loaded = repository.get_model(&artifact.id, SECRET).await.unwrap();
                    black_box(loaded);
                });
            },
        );
    }
    group.finish();
}

fn bench_latest(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("repository_latest");

    for count in [10, 100] {
        let dir = TempDir::new().unwrap();
        let repository = rt.block_on(populated_repository(&dir, count));
        let brief = BriefId {
            language_code: Some("en".parse().unwrap()),
            ..Default::default()
        };

        group.bench_with_input(BenchmarkId::new("models", count), &brief, |b, brief| {
            b.to_async(&rt).iter(|| async {
                black_box(repository.latest_model(brief, SECRET).await.unwrap());
            });
        });
    }
    group.finish();
}

criterion_group!(benches, bench_save_get, bench_latest);
criterion_main!(benches);
