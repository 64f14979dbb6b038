// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Logging and metrics.
//!
//! - **Tracing**: `init_telemetry` installs a stderr `fmt` subscriber filtered
//!   by `RUST_LOG` or the configured level.
//! - **Metrics**: `GLOBAL_METRICS` keeps operation latencies (`queue.merge`,
//!   `queue.enqueue`, `session.store.update_agent`, `finalize.run`) and merge
//!   outcome counters when the `telemetry` feature is enabled.
//! - **Spans**: `MergeSpan` wraps each merge attempt.
//!
//! ```rust,ignore
//! use forkjoin::telemetry::{init_telemetry, TelemetryConfig};
//!
//! let _guard = init_telemetry(&TelemetryConfig::production())?;
//! ```

mod init;
pub mod metrics;
mod spans;

pub use init::{init_telemetry, TelemetryConfig, TelemetryGuard};
pub use metrics::{Histogram, Metrics, MetricsSnapshot, OperationMetrics, GLOBAL_METRICS};
pub use spans::{MergeSpan, SpanExt};
