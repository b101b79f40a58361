//! One job: optimize, execute on a private runtime, report.

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;

use polyplan_core::config::JobConfig;
use polyplan_core::id::OperatorId;
use polyplan_core::manifest::{now_ms, JobId, JobManifest};
use polyplan_core::plan::Plan;
use polyplan_core::types::Quantum;
use polyplan_cost::{EstimatorRegistry, OptimizationContext};
use polyplan_optimizer::{ExecutionAssignment, Optimizer};
use polyplan_platform::{ExecutionLineage, LineageRecord, PlatformRegistry};

use crate::cancel::{CancelHandle, JobState};
use crate::error::{JobError, Result};
use crate::executor::{CrossPlatformExecutor, ExecutorParts, LoopReport, OperatorState};
use crate::instrumentation::strategy;
use crate::metrics::ExecutionMetrics;
use crate::replay::{hash_assignment, hash_config, hash_plan};
use crate::scope::Scope;

/// A prepared job. Created by `Context::job`; consumed by `execute`.
pub struct Job {
    id: JobId,
    plan: Arc<Plan>,
    config: JobConfig,
    registry: Arc<PlatformRegistry>,
    estimators: Arc<EstimatorRegistry>,
    metrics: Arc<ExecutionMetrics>,
    cancel: CancelHandle,
}

/// Everything a successful job hands back.
#[derive(Debug)]
pub struct JobResult {
    pub job_id: JobId,
    outputs: BTreeMap<OperatorId, Vec<Quantum>>,
    names: BTreeMap<String, OperatorId>,
    pub lineage: Arc<ExecutionLineage>,
    pub loop_reports: Vec<LoopReport>,
    /// The assignment the job finished under.
    pub assignment: Arc<ExecutionAssignment>,
    pub manifest: JobManifest,
    pub operator_states: BTreeMap<OperatorId, OperatorState>,
}

impl JobResult {
    pub fn output(&self, sink: OperatorId) -> Option<&[Quantum]> {
        self.outputs.get(&sink).map(|v| v.as_slice())
    }

    /// Output of the sink named `name`.
    pub fn output_named(&self, name: &str) -> Option<&[Quantum]> {
        self.names.get(name).and_then(|id| self.output(*id))
    }

    pub fn outputs(&self) -> &BTreeMap<OperatorId, Vec<Quantum>> {
        &self.outputs
    }

    /// Every lineage node, collected or not.
    pub fn lineage_records(&self) -> Vec<LineageRecord> {
        self.lineage.records()
    }

    /// Lineage behind `sink`'s last execution that was not handed out before.
    pub fn collect_lineage(&self, sink: OperatorId) -> Vec<LineageRecord> {
        self.lineage
            .executions_of(sink)
            .last()
            .map(|r| self.lineage.collect_and_mark(r.id))
            .unwrap_or_default()
    }
}

impl Job {
    pub(crate) fn new(
        plan: Arc<Plan>,
        config: JobConfig,
        registry: Arc<PlatformRegistry>,
        estimators: Arc<EstimatorRegistry>,
        metrics: Arc<ExecutionMetrics>,
    ) -> Self {
        Self {
            id: JobId::random(),
            plan,
            config,
            registry,
            estimators,
            metrics,
            cancel: CancelHandle::new(),
        }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    pub fn config(&self) -> &JobConfig {
        &self.config
    }

    /// Handle that cancels this job from any thread, before or during
    /// `execute`.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn state(&self) -> JobState {
        self.cancel.job_state()
    }

    /// Optimize and run to completion. Blocks the calling thread.
    pub fn execute(self) -> Result<JobResult> {
        let started = now_ms();
        self.metrics.job_started();
        self.cancel.set_state(JobState::Running);
        tracing::info!(job = %self.id, name = ?self.plan.name(), operators = self.plan.len(), "job started");

        let result = self.run(started);
        match &result {
            Ok(r) => {
                self.cancel.set_state(JobState::Succeeded);
                self.metrics.job_finished(true);
                tracing::info!(
                    job = %self.id,
                    elapsed_ms = r.manifest.finished_ms.saturating_sub(started),
                    fallbacks = r.manifest.fallbacks,
                    reoptimizations = r.manifest.reoptimizations,
                    "job succeeded"
                );
            }
            Err(e) => {
                self.cancel.set_state(JobState::Failed);
                self.metrics.job_finished(false);
                tracing::error!(job = %self.id, operator = ?e.failing_operator(), error = %e, "job failed");
            }
        }
        result
    }

    fn run(&self, started: u64) -> Result<JobResult> {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }

        let ctx = OptimizationContext::root();
        let assignment = Optimizer::new(&self.registry, &self.estimators, &self.config)
            .optimize(&self.plan, &ctx)?;
        tracing::info!(
            job = %self.id,
            cost = assignment.total_cost.total(),
            platforms = assignment.distinct_platforms().len(),
            conversions = assignment.conversions(),
            strategy = ?assignment.strategy,
            "assignment chosen"
        );

        let manifest = JobManifest::new(
            self.id,
            self.plan.name().map(str::to_string),
            hash_plan(&self.plan)?,
            hash_assignment(&assignment)?,
            hash_config(&self.config, &self.registry)?,
            started,
        );

        let scratch_dir = self.config.scratch_dir.join(format!("job-{}", self.id));
        let executor = Arc::new(CrossPlatformExecutor::new(ExecutorParts {
            plan: Arc::clone(&self.plan),
            registry: Arc::clone(&self.registry),
            estimators: Arc::clone(&self.estimators),
            config: self.config.clone(),
            instrumentation: strategy(self.config.instrumentation),
            metrics: Arc::clone(&self.metrics),
            cancel: self.cancel.clone(),
            scratch_dir: scratch_dir.clone(),
            assignment,
        }));

        let outcome = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .thread_name("polyplan-exec")
            .build()
            .map_err(|e| JobError::Internal(format!("failed to start runtime: {e}")))
            .and_then(|rt| {
                rt.block_on(Arc::clone(&executor).run_scope(Scope::root(), ctx, None))
            });

        let leftover = executor.release_all();
        tracing::debug!(job = %self.id, leftover, "released remaining instances");
        if scratch_dir.exists() {
            if let Err(e) = fs::remove_dir_all(&scratch_dir) {
                tracing::warn!(dir = %scratch_dir.display(), error = %e, "failed to clean scratch dir");
            }
        }

        if let Err(e) = outcome {
            executor.clear_outputs();
            return Err(e);
        }

        let final_assignment = executor.assignment();
        let mut manifest = manifest.finish(now_ms(), hash_assignment(&final_assignment)?);
        manifest.reoptimizations = executor.replans();
        manifest.fallbacks = executor.fallbacks();

        let outputs = executor.take_outputs();
        let names = outputs
            .keys()
            .filter_map(|id| {
                self.plan
                    .operator(*id)
                    .and_then(|o| o.name())
                    .map(|n| (n.to_string(), *id))
            })
            .collect();

        Ok(JobResult {
            job_id: self.id,
            outputs,
            names,
            lineage: Arc::clone(&executor.lineage),
            loop_reports: executor.loop_reports(),
            assignment: final_assignment,
            manifest,
            operator_states: executor.operator_states(),
        })
    }
}
