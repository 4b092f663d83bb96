//! Criterion benchmarks for the state stores.
//!
//! These measure bookmark persistence and job lifecycle writes that occur on
//! every Extract-Load run.

use chrono::Utc;
use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use serde_json::json;

use elflow_state::document::LockSettings;
use elflow_state::object::MemoryStorage;
use elflow_state::prelude::*;
use elflow_types::job::{JobRecord, JobState};

fn bookmarks(stream_count: usize, counter: u64) -> StateMap {
    let streams: serde_json::Map<String, serde_json::Value> = (0..stream_count)
        .map(|i| (format!("stream_{i}"), json!({"replication_key_value": counter})))
        .collect();
    json!({"bookmarks": streams}).as_object().cloned().unwrap()
}

fn bench_job_lifecycle(c: &mut Criterion) {
    let mut group = c.benchmark_group("state/job_lifecycle");

    group.bench_function("start_heartbeat_succeed", |b| {
        let store = SqliteJobStore::in_memory().unwrap();

        b.iter(|| {
            let mut job = JobRecord::new("bench:tap-to-target");
            job.transit(JobState::Running).unwrap();
            job.started_at = Some(Utc::now());
            store.save(&job).unwrap();
            store.heartbeat(job.run_id, Utc::now()).unwrap();
            job.transit(JobState::Success).unwrap();
            job.ended_at = Some(Utc::now());
            store.save(&job).unwrap();
        });
    });

    group.finish();
}

fn bench_partial_writes(c: &mut Criterion) {
    let mut group = c.benchmark_group("state/partial_write");

    for stream_count in [1, 10, 50] {
        group.bench_with_input(
            BenchmarkId::new("sqlite", stream_count),
            &stream_count,
            |b, &stream_count| {
                let store = SqliteStateStore::in_memory().unwrap();
                let mut counter = 0u64;
                b.iter(|| {
                    let state = bookmarks(stream_count, counter);
                    store.set(&StateRecord::partial("bench", state)).unwrap();
                    counter += 1;
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("memory", stream_count),
            &stream_count,
            |b, &stream_count| {
                let store =
                    MemoryStateStore::memory(MemoryStorage::new("bench"), LockSettings::default());
                let mut counter = 0u64;
                b.iter(|| {
                    let state = bookmarks(stream_count, counter);
                    store.set(&StateRecord::partial("bench", state)).unwrap();
                    counter += 1;
                });
            },
        );
    }

    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let mut group = c.benchmark_group("state/get");

    for stream_count in [1, 10, 50] {
        group.bench_with_input(
            BenchmarkId::new("sqlite", stream_count),
            &stream_count,
            |b, &stream_count| {
                let store = SqliteStateStore::in_memory().unwrap();
                store
                    .set(&StateRecord::complete("bench", bookmarks(stream_count, 0)))
                    .unwrap();
                let id = StateId::new("bench");

                b.iter(|| {
                    let _merged = store.get(&id).unwrap().map(|r| r.merged());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_job_lifecycle, bench_partial_writes, bench_get);
criterion_main!(benches);
