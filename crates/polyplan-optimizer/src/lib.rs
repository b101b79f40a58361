#![forbid(unsafe_code)]
//! polyplan-optimizer: validated plan -> `ExecutionAssignment`.
//!
//! Pipeline:
//!   1. candidate platforms per operator (permitted, registered, capable, pinned)
//!   2. cardinality propagation in topological order
//!   3. exhaustive branch-and-bound over candidates (greedy above the
//!      configured enumeration limit), routing every channel natively or
//!      through registered conversions
//!   4. segments (platform-uniform, natively connected operator sets) and,
//!      if the plan asks for it, a fallback platform per top-level segment
//!
//! The optimizer never touches data. It is deterministic for a fixed plan,
//! registry, estimator state, and configuration.

pub mod assignment;
pub mod candidates;
pub mod cardinality;
pub mod error;
pub mod explain;
pub mod optimizer;
pub mod routing;
pub mod search;
pub mod segments;

pub use assignment::{
    ChannelPlan, ConsumerRoute, ExecutionAssignment, FallbackPlan, SearchStrategy, Segment,
};
pub use error::OptimizerError;
pub use optimizer::{Committed, Optimizer};
