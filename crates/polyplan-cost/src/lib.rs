#![forbid(unsafe_code)]
//! polyplan-cost: what running an operator somewhere is expected to cost.
//!
//! Responsibilities:
//! - Cost and cardinality estimate types (`CostEstimate`, `CardinalityEstimate`).
//! - Cardinality propagation heuristics per operator kind.
//! - The pluggable `LoadEstimator` protocol and its registry.
//! - The per-job `OptimizationContext` tree that records estimates and
//!   observations.
//!
//! Numbers here are abstract cost units. Only their relative order matters to
//! the optimizer.

pub mod cardinality;
pub mod context;
pub mod estimate;
pub mod estimator;

pub use cardinality::estimate_output;
pub use context::{ContextEntry, OptimizationContext};
pub use estimate::{CardinalityEstimate, CostEstimate, InputStatistics, ObservedCost};
pub use estimator::{EstimatorRegistry, LinearLoadEstimator, LoadEstimator};
