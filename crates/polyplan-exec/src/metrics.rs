//! Metrics/tracing hooks.
//!
//! Counters are plain atomics shared by every job of one `Context`. Nothing
//! here pulls in a telemetry stack; export `snapshot()` from the binary layer.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

pub fn emit_span(event: &str, key_values: &[(&str, String)]) {
    let span = tracing::span!(tracing::Level::TRACE, "polyplan", event);
    let _entered = span.enter();
    for (k, v) in key_values {
        tracing::trace!(%event, %k, %v, "metric");
    }
}

#[derive(Debug, Default)]
pub struct ExecutionMetrics {
    jobs_started: AtomicU64,
    jobs_succeeded: AtomicU64,
    jobs_failed: AtomicU64,
    dispatches: AtomicU64,
    instances_created: AtomicU64,
    conversions: AtomicU64,
    iterations: AtomicU64,
    fallbacks: AtomicU64,
    reoptimizations: AtomicU64,
    quanta_produced: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_started: u64,
    pub jobs_succeeded: u64,
    pub jobs_failed: u64,
    pub dispatches: u64,
    pub instances_created: u64,
    pub conversions: u64,
    pub iterations: u64,
    pub fallbacks: u64,
    pub reoptimizations: u64,
    pub quanta_produced: u64,
}

impl ExecutionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let get = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            jobs_started: get(&self.jobs_started),
            jobs_succeeded: get(&self.jobs_succeeded),
            jobs_failed: get(&self.jobs_failed),
            dispatches: get(&self.dispatches),
            instances_created: get(&self.instances_created),
            conversions: get(&self.conversions),
            iterations: get(&self.iterations),
            fallbacks: get(&self.fallbacks),
            reoptimizations: get(&self.reoptimizations),
            quanta_produced: get(&self.quanta_produced),
        }
    }

    pub(crate) fn job_started(&self) {
        self.jobs_started.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn job_finished(&self, ok: bool) {
        let c = if ok { &self.jobs_succeeded } else { &self.jobs_failed };
        c.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn dispatched(&self, produced_quanta: u64) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
        self.quanta_produced
            .fetch_add(produced_quanta, Ordering::Relaxed);
    }

    pub(crate) fn instance_created(&self) {
        self.instances_created.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn converted(&self) {
        self.conversions.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn iteration(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn fallback(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn reoptimized(&self) {
        self.reoptimizations.fetch_add(1, Ordering::Relaxed);
    }
}

impl MetricsSnapshot {
    /// Counter deltas since `earlier`.
    pub fn since(&self, earlier: &MetricsSnapshot) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_started: self.jobs_started - earlier.jobs_started,
            jobs_succeeded: self.jobs_succeeded - earlier.jobs_succeeded,
            jobs_failed: self.jobs_failed - earlier.jobs_failed,
            dispatches: self.dispatches - earlier.dispatches,
            instances_created: self.instances_created - earlier.instances_created,
            conversions: self.conversions - earlier.conversions,
            iterations: self.iterations - earlier.iterations,
            fallbacks: self.fallbacks - earlier.fallbacks,
            reoptimizations: self.reoptimizations - earlier.reoptimizations,
            quanta_produced: self.quanta_produced - earlier.quanta_produced,
        }
    }
}
