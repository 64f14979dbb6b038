// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Benchmarks for coordinator IPC message encoding.
//!
//! Run with: `cargo bench --bench protocol`

use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::path::PathBuf;

use forkjoin::ipc::{decode, decode_messages, encode, Request, Response};
use forkjoin::queue::{EnqueueReceipt, EnqueueRequest, JobSnapshot, JobStatus, QueueStatus};

fn enqueue_request(agent: usize) -> Request {
    Request::Enqueue(EnqueueRequest {
        agent_id: format!("agent-{}", agent),
        session_id: "fj-20260314-101500-3fa2c1".to_string(),
        branch: format!("agent/fj-20260314-101500-3fa2c1/agent-{}", agent),
        workspace: PathBuf::from(format!("/work/.worktrees/fj-agent-{}", agent)),
        target_branch: "feature/combined".to_string(),
        commit_sha: Some("3fa2c1d9e8b7a6f5e4d3c2b1a0f9e8d7c6b5a4f3".to_string()),
        commit_message: Some("Add authentication middleware".to_string()),
    })
}

fn status_response(pending: usize) -> Response {
    Response::with_data(&QueueStatus {
        length: pending + 1,
        pending,
        processing: 1,
        merging: Some("agent-0".to_string()),
        agents: (1..=pending).map(|i| format!("agent-{}", i)).collect(),
        shutting_down: false,
    })
}

/// Benchmark request encode and decode.
fn bench_requests(c: &mut Criterion) {
    let mut group = c.benchmark_group("request");
    group.throughput(Throughput::Elements(1));

    let enqueue = enqueue_request(1);
    let encoded = encode(&enqueue).unwrap();

    group.bench_function("encode_enqueue", |b| {
        b.iter(|| encode(black_box(&enqueue)));
    });

    group.bench_function("decode_enqueue", |b| {
        b.iter(|| decode::<Request>(black_box(&encoded)));
    });

    let wait = encode(&Request::Wait {
        agent_id: "agent-1".to_string(),
        session_id: None,
        timeout_ms: Some(600_000),
    })
    .unwrap();
    group.bench_function("decode_wait", |b| {
        b.iter(|| decode::<Request>(black_box(&wait)));
    });

    group.finish();
}

/// Benchmark response encode and decode.
fn bench_responses(c: &mut Criterion) {
    let mut group = c.benchmark_group("response");

    let receipt = Response::receipt(&EnqueueReceipt::Queued { position: 3 });
    group.bench_function("encode_receipt", |b| {
        b.iter(|| encode(black_box(&receipt)));
    });

    let snapshot = Response::with_data(&JobSnapshot {
        agent_id: "agent-1".to_string(),
        session_id: "fj-20260314-101500-3fa2c1".to_string(),
        status: JobStatus::MergeFailed,
        attempt_count: 2,
        commit_sha: None,
        conflict_files: vec!["src/auth/mod.rs".to_string(), "Cargo.toml".to_string()],
        last_error: Some("merge conflict in src/auth/mod.rs, Cargo.toml".to_string()),
        error_kind: None,
    });
    let encoded = encode(&snapshot).unwrap();
    group.bench_function("decode_snapshot", |b| {
        b.iter(|| {
            let response: Response = decode(black_box(&encoded)).unwrap();
            response.data_as::<JobSnapshot>()
        });
    });

    for pending in [0usize, 10, 100] {
        let status = status_response(pending);
        let encoded = encode(&status).unwrap();
        group.bench_with_input(BenchmarkId::new("status_roundtrip", pending), &encoded, |b, line| {
            b.iter(|| {
                let response: Response = decode(black_box(line)).unwrap();
                response.data_as::<QueueStatus>()
            });
        });
    }

    group.finish();
}

/// Benchmark splitting a buffer of several messages.
fn bench_stream(c: &mut Criterion) {
    let mut group = c.benchmark_group("stream");

    for count in [10usize, 100] {
        let buffer: String = (0..count).map(|i| encode(&enqueue_request(i)).unwrap()).collect();
        group.throughput(Throughput::Elements(count as u64));
        group.bench_with_input(BenchmarkId::new("decode_messages", count), &buffer, |b, buffer| {
            b.iter(|| decode_messages::<Request>(black_box(buffer)));
        });
    }

    group.finish();
}

criterion_group!(benches, bench_requests, bench_responses, bench_stream);
criterion_main!(benches);
