// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Span helpers for merge instrumentation.

use std::time::{Duration, Instant};

use tracing::{info_span, Span};

/// Extension trait for recording results on a span.
pub trait SpanExt {
    fn record_result<T, E>(&self, result: &Result<T, E>);
}

impl SpanExt for Span {
    fn record_result<T, E>(&self, result: &Result<T, E>) {
        self.record("success", result.is_ok());
    }
}

/// RAII guard around one merge attempt.
///
/// Carries the job identity and attempt number; [`MergeSpan::finish`]
/// records the outcome and duration on the span and in the global metrics.
/// Dropping the guard unfinished records an `abandoned` outcome.
pub struct MergeSpan {
    start: Instant,
    span: Span,
    finished: bool,
}

impl MergeSpan {
    pub fn start(session_id: &str, agent_id: &str, attempt: u32) -> Self {
        let span = info_span!(
            "merge",
            session = %session_id,
            agent = %agent_id,
            attempt,
            outcome = tracing::field::Empty,
            duration_ms = tracing::field::Empty,
        );
        Self {
            start: Instant::now(),
            span,
            finished: false,
        }
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Record the outcome label and return the elapsed time.
    pub fn finish(mut self, outcome: &str) -> Duration {
        self.finished = true;
        self.close(outcome)
    }

    fn close(&self, outcome: &str) -> Duration {
        let elapsed = self.start.elapsed();
        self.span.record("outcome", outcome);
        self.span.record("duration_ms", elapsed.as_millis() as u64);

        #[cfg(feature = "telemetry")]
        {
            let metrics = &super::metrics::GLOBAL_METRICS;
            metrics.record_operation("queue.merge", elapsed);
            metrics.record_merge_outcome(outcome);
        }

        tracing::info!(parent: &self.span, "Merge attempt finished: {}", outcome);
        elapsed
    }
}

impl Drop for MergeSpan {
    fn drop(&mut self) {
        if !self.finished {
            self.close("abandoned");
        }
    }
}
