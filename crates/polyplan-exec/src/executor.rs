//! The cross-platform executor: shared job state and single-operator dispatch.
//!
//! One `CrossPlatformExecutor` exists per running job and is shared (behind an
//! `Arc`) by the scope scheduler, the loop driver and every dispatch worker.
//! The current assignment sits behind a lock because fallback replay and
//! re-planning swap it while the job runs; every dispatch works from the
//! snapshot it was launched with.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::Semaphore;

use polyplan_core::channel::ChannelKind;
use polyplan_core::config::JobConfig;
use polyplan_core::error::PlanError;
use polyplan_core::id::{ChannelId, InstanceId, LineageId, LoopId, OperatorId, SlotRef};
use polyplan_core::plan::{Operator, Plan};
use polyplan_core::types::Quantum;
use polyplan_cost::{EstimatorRegistry, OptimizationContext};
use polyplan_optimizer::ExecutionAssignment;
use polyplan_platform::conversion::convert_along;
use polyplan_platform::{
    ChannelInstance, ConversionPath, ExecutionContext, ExecutionLineage, Measurement,
    OutputPlaceholder, PlatformError, PlatformRegistry,
};

use crate::cancel::CancelHandle;
use crate::error::{JobError, Result};
use crate::instrumentation::Instrumentation;
use crate::metrics::{emit_span, ExecutionMetrics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperatorState {
    Pending,
    Scheduled,
    Executing,
    Done,
    Failed,
}

/// Why a loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LoopTermination {
    Converged,
    IterationBound,
}

/// One completed run of a loop (a nested loop reports once per enclosing
/// iteration).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LoopReport {
    pub loop_id: LoopId,
    pub name: String,
    pub iterations: usize,
    pub termination: LoopTermination,
}

/// One operator to run.
pub(crate) struct DispatchRequest {
    pub op: OperatorId,
    /// Input slot -> instance, slot order.
    pub inputs: Vec<(usize, Arc<ChannelInstance>)>,
    /// Output slots to produce.
    pub outputs: Vec<usize>,
    pub ctx: Arc<OptimizationContext>,
    pub iteration: Option<usize>,
    pub assignment: Arc<ExecutionAssignment>,
}

/// What a successful dispatch hands back to the scheduler.
#[derive(Debug)]
pub(crate) struct Dispatched {
    pub op: OperatorId,
    pub produced: Vec<(ChannelId, Arc<ChannelInstance>)>,
    pub collected: Option<Vec<Quantum>>,
    pub output_quanta: u64,
}

pub(crate) struct ExecutorParts {
    pub plan: Arc<Plan>,
    pub registry: Arc<PlatformRegistry>,
    pub estimators: Arc<EstimatorRegistry>,
    pub config: JobConfig,
    pub instrumentation: Arc<dyn Instrumentation>,
    pub metrics: Arc<ExecutionMetrics>,
    pub cancel: CancelHandle,
    pub scratch_dir: PathBuf,
    pub assignment: ExecutionAssignment,
}

pub(crate) struct CrossPlatformExecutor {
    pub(crate) plan: Arc<Plan>,
    pub(crate) registry: Arc<PlatformRegistry>,
    pub(crate) estimators: Arc<EstimatorRegistry>,
    pub(crate) config: JobConfig,
    pub(crate) lineage: Arc<ExecutionLineage>,
    pub(crate) metrics: Arc<ExecutionMetrics>,
    pub(crate) cancel: CancelHandle,
    pub(crate) scratch_dir: PathBuf,
    instrumentation: Arc<dyn Instrumentation>,
    assignment: RwLock<Arc<ExecutionAssignment>>,
    permits: Option<Arc<Semaphore>>,
    created: Mutex<Vec<Arc<ChannelInstance>>>,
    states: DashMap<OperatorId, OperatorState>,
    observed: DashMap<OperatorId, u64>,
    outputs: DashMap<OperatorId, Vec<Quantum>>,
    loop_reports: Mutex<Vec<LoopReport>>,
    next_instance: AtomicU64,
    replans: AtomicU32,
    fallbacks: AtomicU32,
}

impl CrossPlatformExecutor {
    pub(crate) fn new(parts: ExecutorParts) -> Self {
        let states = parts
            .plan
            .operator_ids()
            .map(|op| (op, OperatorState::Pending))
            .collect();
        let permits = parts
            .config
            .max_parallelism
            .map(|n| Arc::new(Semaphore::new(n)));
        Self {
            plan: parts.plan,
            registry: parts.registry,
            estimators: parts.estimators,
            config: parts.config,
            lineage: Arc::new(ExecutionLineage::new()),
            metrics: parts.metrics,
            cancel: parts.cancel,
            scratch_dir: parts.scratch_dir,
            instrumentation: parts.instrumentation,
            assignment: RwLock::new(Arc::new(parts.assignment)),
            permits,
            created: Mutex::new(Vec::new()),
            states,
            observed: DashMap::new(),
            outputs: DashMap::new(),
            loop_reports: Mutex::new(Vec::new()),
            next_instance: AtomicU64::new(0),
            replans: AtomicU32::new(0),
            fallbacks: AtomicU32::new(0),
        }
    }

    // ----- shared state -----

    pub(crate) fn assignment(&self) -> Arc<ExecutionAssignment> {
        Arc::clone(&self.assignment.read())
    }

    pub(crate) fn swap_assignment(&self, next: ExecutionAssignment) {
        *self.assignment.write() = Arc::new(next);
    }

    pub(crate) fn set_state(&self, op: OperatorId, state: OperatorState) {
        self.states.insert(op, state);
    }

    pub(crate) fn operator_states(&self) -> BTreeMap<OperatorId, OperatorState> {
        self.states.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    pub(crate) fn observed(&self, op: OperatorId) -> Option<u64> {
        self.observed.get(&op).map(|v| *v.value())
    }

    pub(crate) fn store_output(&self, sink: OperatorId, data: Vec<Quantum>) {
        self.outputs.insert(sink, data);
    }

    pub(crate) fn take_outputs(&self) -> BTreeMap<OperatorId, Vec<Quantum>> {
        let keys: Vec<OperatorId> = self.outputs.iter().map(|e| *e.key()).collect();
        keys.into_iter()
            .filter_map(|k| self.outputs.remove(&k))
            .collect()
    }

    pub(crate) fn discard_output(&self, sink: OperatorId) {
        self.outputs.remove(&sink);
    }

    pub(crate) fn clear_outputs(&self) {
        self.outputs.clear();
    }

    pub(crate) fn report_loop(&self, report: LoopReport) {
        self.loop_reports.lock().push(report);
    }

    pub(crate) fn loop_reports(&self) -> Vec<LoopReport> {
        self.loop_reports.lock().clone()
    }

    pub(crate) fn replanned(&self) {
        self.replans.fetch_add(1, Ordering::Relaxed);
        self.metrics.reoptimized();
    }

    pub(crate) fn fell_back(&self) {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        self.metrics.fallback();
    }

    pub(crate) fn replans(&self) -> u32 {
        self.replans.load(Ordering::Relaxed)
    }

    pub(crate) fn fallbacks(&self) -> u32 {
        self.fallbacks.load(Ordering::Relaxed)
    }

    /// Release every instance this job created. Idempotent; returns how many
    /// were still live.
    pub(crate) fn release_all(&self) -> usize {
        self.created.lock().iter().filter(|i| i.release()).count()
    }

    fn alloc_instance(&self) -> InstanceId {
        InstanceId::new(self.next_instance.fetch_add(1, Ordering::Relaxed))
    }

    fn track(&self, instance: &Arc<ChannelInstance>) {
        self.created.lock().push(Arc::clone(instance));
        self.metrics.instance_created();
    }

    fn operator(&self, op: OperatorId) -> Result<&Operator> {
        self.plan
            .operator(op)
            .ok_or(JobError::Validation(PlanError::UnknownOperator(op)))
    }

    // ----- dispatch -----

    /// Run one operator on its assigned platform, blocking.
    pub(crate) fn dispatch(&self, req: DispatchRequest) -> Result<Dispatched> {
        if self.cancel.is_cancelled() {
            return Err(JobError::Cancelled);
        }
        let op = self.operator(req.op)?;
        let platform_id = req
            .assignment
            .platform_of(req.op)
            .cloned()
            .ok_or_else(|| JobError::Internal(format!("{} has no platform", req.op)))?;
        let platform = self
            .registry
            .get(&platform_id)
            .cloned()
            .ok_or_else(|| JobError::Internal(format!("platform '{platform_id}' is not registered")))?;
        let fail = |source: PlatformError| match source {
            PlatformError::Cancelled => JobError::Cancelled,
            source => JobError::Execution {
                operator: req.op,
                name: op.display_name(),
                platform: platform_id.clone(),
                source,
            },
        };

        self.set_state(req.op, OperatorState::Executing);

        let mut inputs = Vec::with_capacity(req.inputs.len());
        let mut input_quanta = 0;
        for (slot, inst) in &req.inputs {
            let consumer = SlotRef::new(req.op, *slot);
            let route = req
                .assignment
                .channel_plan(inst.channel())
                .and_then(|p| p.route_for(consumer));
            let ready = match route {
                None => Arc::clone(inst),
                Some(r) if r.kind() == inst.kind() => Arc::clone(inst),
                Some(r) if r.path.from == inst.kind() => self.convert(inst, &r.path).map_err(fail)?,
                // Produced under an earlier assignment; find a path from what
                // is actually there.
                Some(r) => {
                    let path = self
                        .registry
                        .conversion_path(inst.kind(), &[r.kind()], inst.len() as f64)
                        .ok_or_else(|| {
                            fail(PlatformError::NoConversion {
                                from: inst.kind().to_string(),
                                to: r.kind().to_string(),
                            })
                        })?;
                    tracing::debug!(
                        channel = %inst.channel(),
                        from = %inst.kind(),
                        to = %r.kind(),
                        "rerouted stale channel instance"
                    );
                    self.convert(inst, &path).map_err(fail)?
                }
            };
            input_quanta += ready.len();
            inputs.push(ready);
        }

        let mut placeholders = Vec::with_capacity(req.outputs.len());
        for slot in &req.outputs {
            let Some(channel) = self.plan.output_channel(req.op, *slot) else {
                continue;
            };
            let consumers = self
                .plan
                .channel(channel)
                .map_or(0, |c| c.consumers.len());
            let kind = req
                .assignment
                .channel_plan(channel)
                .map(|p| p.produced)
                .ok_or_else(|| JobError::Internal(format!("{channel} has no channel plan")))?;
            placeholders.push(OutputPlaceholder {
                slot: *slot,
                channel,
                kind,
                instance: self.alloc_instance(),
                lineage: self.lineage.next_id(),
                consumers,
            });
        }

        let exec_ctx = ExecutionContext {
            platform: platform_id.clone(),
            scratch_dir: self.scratch_dir.clone(),
            cancelled: self.cancel.flag(),
            iteration: req.iteration,
            estimate: req.ctx.entry(req.op),
        };

        tracing::debug!(
            operator = %req.op,
            name = %op.display_name(),
            platform = %platform_id,
            iteration = ?req.iteration,
            "dispatch"
        );
        let started = Instant::now();
        let outcome = platform
            .execute(op, &inputs, &placeholders, &exec_ctx)
            .map_err(fail)?;
        let elapsed = started.elapsed();

        if outcome.produced.len() != placeholders.len() {
            for p in &outcome.produced {
                p.release();
            }
            return Err(fail(PlatformError::Exec(format!(
                "produced {} instances for {} outputs",
                outcome.produced.len(),
                placeholders.len()
            ))));
        }

        let mut produced = Vec::with_capacity(placeholders.len());
        let mut produced_lineage = Vec::with_capacity(placeholders.len());
        let mut output_quanta = 0;
        for (ph, inst) in placeholders.iter().zip(outcome.produced) {
            self.lineage.add_channel(
                inst.lineage(),
                inst.id(),
                ph.channel,
                inst.kind(),
                inst.len(),
                Vec::new(),
            );
            self.track(&inst);
            produced_lineage.push(inst.lineage());
            output_quanta = output_quanta.max(inst.len());
            produced.push((ph.channel, inst));
        }
        if let Some(c) = &outcome.collected {
            output_quanta = output_quanta.max(c.len() as u64);
        }

        let measurement = outcome.lineage.measurement.unwrap_or(Measurement {
            elapsed,
            input_quanta,
            output_quanta,
        });
        let mut node = outcome.lineage;
        node.measurement = Some(measurement);
        self.lineage.add_execution(node, &produced_lineage);

        let estimator = self.estimators.resolve(
            op.key(),
            &platform_id,
            platform.load_estimator(op.key()),
        );
        self.instrumentation
            .observe(op, &platform_id, measurement, &req.ctx, estimator.as_ref());
        self.observed.insert(req.op, output_quanta);
        self.metrics.dispatched(output_quanta);
        self.set_state(req.op, OperatorState::Done);
        emit_span(
            "dispatch",
            &[
                ("operator", req.op.to_string()),
                ("platform", platform_id.to_string()),
                ("elapsed_us", elapsed.as_micros().to_string()),
                ("quanta", output_quanta.to_string()),
            ],
        );

        Ok(Dispatched {
            op: req.op,
            produced,
            collected: outcome.collected,
            output_quanta,
        })
    }

    /// `dispatch` on a blocking worker, bounded by `max_parallelism`.
    pub(crate) async fn dispatch_async(self: Arc<Self>, req: DispatchRequest) -> Result<Dispatched> {
        let _permit = match &self.permits {
            Some(sem) => Some(
                Arc::clone(sem)
                    .acquire_owned()
                    .await
                    .map_err(|e| JobError::Internal(format!("dispatch permits closed: {e}")))?,
            ),
            None => None,
        };
        let op = req.op;
        let this = Arc::clone(&self);
        let joined = tokio::task::spawn_blocking(move || this.dispatch(req)).await;
        let result = match joined {
            Ok(r) => r,
            Err(e) => Err(JobError::Internal(format!("dispatch worker for {op} failed: {e}"))),
        };
        if result.is_err() {
            self.set_state(op, OperatorState::Failed);
        }
        result
    }

    /// Convert `src` along `path`, registering every new instance in lineage.
    fn convert(
        &self,
        src: &Arc<ChannelInstance>,
        path: &ConversionPath,
    ) -> std::result::Result<Arc<ChannelInstance>, PlatformError> {
        let mut fresh: Vec<(InstanceId, LineageId, LineageId, ChannelKind, u64)> = Vec::new();
        let out = convert_along(src, path, &self.scratch_dir, |from| {
            let id = self.alloc_instance();
            let lineage = self.lineage.next_id();
            let to = path
                .steps
                .iter()
                .find(|s| s.from == from.kind())
                .map_or(path.to, |s| s.to);
            fresh.push((id, lineage, from.lineage(), to, from.len()));
            (id, lineage)
        })?;
        for (id, lineage, pred, kind, quanta) in fresh {
            self.lineage
                .add_channel(lineage, id, src.channel(), kind, quanta, vec![pred]);
            self.metrics.converted();
            self.metrics.instance_created();
            tracing::debug!(channel = %src.channel(), instance = %id, kind = %kind, "converted");
        }
        Ok(out)
    }
}
