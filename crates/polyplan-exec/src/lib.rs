#![forbid(unsafe_code)]
//! polyplan-exec: cross-platform executor, loop driver, and the job API.
//!
//! `Context::submit` optimizes a plan against the context's platforms, then
//! runs it on a private tokio runtime: ready operators are dispatched to
//! blocking workers (bounded by `polyplan.executor.max_parallelism`), loops
//! are driven iteration by iteration in child scopes, conversions are applied
//! lazily per consumer, and every dispatch lands in the execution lineage.
//! Guarded segments replay on their fallback platform once; with a
//! re-optimization threshold set, large cardinality misestimates re-plan the
//! unstarted remainder.

pub mod cancel;
pub mod context;
mod driver;
pub mod error;
mod executor;
pub mod instrumentation;
pub mod job;
pub mod metrics;
pub mod replay;
mod scheduler;
mod scope;

pub use cancel::{CancelHandle, JobState};
pub use context::Context;
pub use error::JobError;
pub use executor::{LoopReport, LoopTermination, OperatorState};
pub use instrumentation::{FullInstrumentation, Instrumentation, NoInstrumentation};
pub use job::{Job, JobResult};
pub use metrics::{ExecutionMetrics, MetricsSnapshot};
