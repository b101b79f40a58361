//! Caller-facing entry point.
//!
//! A `Context` owns one platform registry and one estimator registry and
//! hands out jobs. Estimators are shared across jobs, so calibration learned
//! by one job informs the next one's optimizer.

use std::sync::Arc;

use polyplan_core::config::Configuration;
use polyplan_core::plan::Plan;
use polyplan_cost::{EstimatorRegistry, OptimizationContext};
use polyplan_optimizer::explain::explain;
use polyplan_optimizer::{ExecutionAssignment, Optimizer};
use polyplan_platform::PlatformRegistry;

use crate::error::Result;
use crate::job::{Job, JobResult};
use crate::metrics::{ExecutionMetrics, MetricsSnapshot};

pub struct Context {
    registry: Arc<PlatformRegistry>,
    estimators: Arc<EstimatorRegistry>,
    metrics: Arc<ExecutionMetrics>,
}

impl Context {
    pub fn new(registry: PlatformRegistry) -> Self {
        Self {
            registry: Arc::new(registry),
            estimators: Arc::new(EstimatorRegistry::default()),
            metrics: Arc::new(ExecutionMetrics::new()),
        }
    }

    pub fn with_estimators(mut self, estimators: EstimatorRegistry) -> Self {
        self.estimators = Arc::new(estimators);
        self
    }

    pub fn registry(&self) -> &PlatformRegistry {
        &self.registry
    }

    pub fn estimators(&self) -> &EstimatorRegistry {
        &self.estimators
    }

    /// Counters accumulated over every job of this context.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Prepare a job. The configuration is snapshotted here; malformed values
    /// for known keys fail now.
    pub fn job(&self, plan: &Plan, configuration: &Configuration) -> Result<Job> {
        let config = configuration.job_config()?;
        Ok(Job::new(
            Arc::new(plan.clone()),
            config,
            Arc::clone(&self.registry),
            Arc::clone(&self.estimators),
            Arc::clone(&self.metrics),
        ))
    }

    /// Optimize and execute `plan`, blocking until it finishes.
    pub fn submit(&self, plan: &Plan, configuration: &Configuration) -> Result<JobResult> {
        self.job(plan, configuration)?.execute()
    }

    /// The assignment `submit` would start with, without running anything.
    pub fn optimize(&self, plan: &Plan, configuration: &Configuration) -> Result<ExecutionAssignment> {
        let config = configuration.job_config()?;
        let ctx = OptimizationContext::root();
        Ok(Optimizer::new(&self.registry, &self.estimators, &config).optimize(plan, &ctx)?)
    }

    /// Human-readable rendering of `optimize`.
    pub fn explain(&self, plan: &Plan, configuration: &Configuration) -> Result<String> {
        let assignment = self.optimize(plan, configuration)?;
        Ok(explain(plan, &assignment))
    }
}
