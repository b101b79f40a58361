//! Scope scheduler.
//!
//! Runs every unit of one scope as soon as its inputs are available. Plain
//! operators go to blocking dispatch workers; nested loops run as async tasks
//! (see `driver`). Completion order is whatever the workers produce; the launch
//! order of simultaneously ready units is by id.
//!
//! At the top level two things can interrupt the flow:
//! - a failure inside a segment with a precomputed fallback: in-flight work
//!   drains, the segment's partial outputs are dropped, and it runs again on
//!   the fallback platform;
//! - an observed cardinality far off its estimate (adaptive re-planning):
//!   in-flight work drains and the unstarted remainder is re-optimized.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::task::JoinSet;

use polyplan_core::id::{OperatorId, SegmentId};
use polyplan_cost::OptimizationContext;
use polyplan_optimizer::{Committed, ExecutionAssignment, Optimizer};
use polyplan_platform::ChannelInstance;

use crate::error::{JobError, Result};
use crate::executor::{CrossPlatformExecutor, DispatchRequest, Dispatched, OperatorState};
use crate::scope::{external_inputs, units_of, Scope, Unit};

pub(crate) type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// An input a launched unit holds: the instance and whether it lives in the
/// scope being run (only those are counted down here).
type Source = (Arc<ChannelInstance>, bool);

struct Completed {
    unit: Unit,
    sources: Vec<Source>,
    result: Result<Dispatched>,
}

enum Drain {
    Fail(JobError),
    Fallback(SegmentId, JobError),
    Replan(OperatorId),
}

/// Bookkeeping for a segment whose outputs are withheld until it commits.
#[derive(Default)]
struct Hold {
    done: BTreeSet<OperatorId>,
    deferred: Vec<Arc<ChannelInstance>>,
}

fn finish_consumer(inst: &ChannelInstance) {
    if inst.consumer_done() {
        inst.release();
    }
}

impl CrossPlatformExecutor {
    pub(crate) fn run_scope(
        self: Arc<Self>,
        scope: Arc<Scope>,
        ctx: Arc<OptimizationContext>,
        iteration: Option<usize>,
    ) -> BoxFuture<Result<()>> {
        Box::pin(async move { self.scope_loop(scope, ctx, iteration).await })
    }

    async fn scope_loop(
        self: Arc<Self>,
        scope: Arc<Scope>,
        ctx: Arc<OptimizationContext>,
        iteration: Option<usize>,
    ) -> Result<()> {
        let plan = Arc::clone(&self.plan);
        let top = scope.loop_id().is_none();
        let adaptive =
            top && !plan.fallback_enabled() && self.config.reoptimize_threshold.is_some();

        let mut pending: BTreeSet<Unit> = units_of(&plan, scope.loop_id());
        let mut done: BTreeSet<Unit> = BTreeSet::new();
        let mut tasks: JoinSet<Completed> = JoinSet::new();
        let mut drain: Option<Drain> = None;

        let mut holds: BTreeMap<SegmentId, Hold> = BTreeMap::new();
        if top && plan.fallback_enabled() {
            let assignment = self.assignment();
            for seg in assignment.segments.iter().filter(|s| s.top_level) {
                if assignment.fallback_for(seg.id).is_some() {
                    holds.insert(seg.id, Hold::default());
                }
            }
        }

        loop {
            if drain.is_none() && self.cancel.is_cancelled() {
                drain = Some(Drain::Fail(JobError::Cancelled));
            }

            if drain.is_none() {
                let assignment = self.assignment();
                let ready: Vec<Unit> = pending
                    .iter()
                    .copied()
                    .filter(|u| self.is_ready(*u, &scope, &assignment, &holds))
                    .collect();
                for unit in ready {
                    pending.remove(&unit);
                    if let Err(e) =
                        self.launch(unit, &scope, &ctx, iteration, &assignment, &mut tasks)
                    {
                        drain = Some(Drain::Fail(e));
                        break;
                    }
                }
            }

            if tasks.is_empty() {
                match drain.take() {
                    None if pending.is_empty() => return Ok(()),
                    None => {
                        let stuck: Vec<String> = pending.iter().map(|u| format!("{u:?}")).collect();
                        return Err(JobError::Internal(format!(
                            "no runnable unit left; waiting: {}",
                            stuck.join(", ")
                        )));
                    }
                    Some(Drain::Fail(e)) => return Err(e),
                    Some(Drain::Fallback(seg, e)) => {
                        self.fall_back(seg, e, &scope, &mut pending, &mut done, &mut holds)?;
                        continue;
                    }
                    Some(Drain::Replan(op)) => {
                        self.replan(op, &done, &ctx)?;
                        continue;
                    }
                }
            }

            let Some(joined) = tasks.join_next().await else {
                continue;
            };
            let completed = match joined {
                Ok(c) => c,
                Err(e) => {
                    if !matches!(drain, Some(Drain::Fail(_))) {
                        drain = Some(Drain::Fail(JobError::Internal(format!(
                            "scheduler task failed: {e}"
                        ))));
                    }
                    continue;
                }
            };

            let assignment = self.assignment();
            let segment = match completed.unit {
                Unit::Op(op) => assignment
                    .segment_of(op)
                    .map(|s| s.id)
                    .filter(|id| holds.contains_key(id)),
                Unit::Loop(_) => None,
            };

            match completed.result {
                Ok(d) => {
                    if let Some(Drain::Fallback(failing, _)) = &drain {
                        if segment == Some(*failing) {
                            for (_, inst) in &d.produced {
                                inst.release();
                            }
                            continue;
                        }
                    }
                    done.insert(completed.unit);
                    for (ch, inst) in d.produced {
                        scope.insert(ch, inst);
                    }
                    if let Some(data) = d.collected {
                        self.store_output(d.op, data);
                    }

                    let local = completed
                        .sources
                        .into_iter()
                        .filter(|(_, local)| *local)
                        .map(|(i, _)| i);
                    match segment {
                        Some(seg) => {
                            let members = assignment
                                .segment(seg)
                                .map(|s| s.operators.clone())
                                .unwrap_or_default();
                            let mut committed = false;
                            if let Some(hold) = holds.get_mut(&seg) {
                                hold.deferred.extend(local);
                                hold.done.insert(d.op);
                                committed = members.iter().all(|op| hold.done.contains(op));
                            }
                            if committed {
                                if let Some(hold) = holds.remove(&seg) {
                                    for inst in &hold.deferred {
                                        finish_consumer(inst);
                                    }
                                }
                                tracing::debug!(segment = %seg, "segment committed");
                            }
                        }
                        None => {
                            for inst in local {
                                finish_consumer(&inst);
                            }
                        }
                    }

                    if adaptive && drain.is_none() && !pending.is_empty() {
                        if let Some(est) = assignment.cardinalities.get(&d.op) {
                            let threshold = self.config.reoptimize_threshold.unwrap_or(f64::MAX);
                            if est.deviation(d.output_quanta) > threshold {
                                tracing::debug!(
                                    operator = %d.op,
                                    estimated = est.point(),
                                    observed = d.output_quanta,
                                    "cardinality misestimate"
                                );
                                drain = Some(Drain::Replan(d.op));
                            }
                        }
                    }
                }
                Err(e) => {
                    if let Unit::Op(op) = completed.unit {
                        self.set_state(op, OperatorState::Failed);
                    }
                    drain = match drain.take() {
                        Some(Drain::Fail(first)) => Some(Drain::Fail(first)),
                        _ if matches!(e, JobError::Cancelled) => Some(Drain::Fail(e)),
                        Some(Drain::Fallback(failing, first)) => {
                            if segment == Some(failing) {
                                Some(Drain::Fallback(failing, first))
                            } else {
                                Some(Drain::Fail(e))
                            }
                        }
                        None | Some(Drain::Replan(_)) => match segment {
                            Some(seg) if assignment.fallback_for(seg).is_some() => {
                                Some(Drain::Fallback(seg, e))
                            }
                            _ => Some(Drain::Fail(e)),
                        },
                    };
                }
            }
        }
    }

    /// Are all of `unit`'s inputs present and committed?
    fn is_ready(
        &self,
        unit: Unit,
        scope: &Scope,
        assignment: &ExecutionAssignment,
        holds: &BTreeMap<SegmentId, Hold>,
    ) -> bool {
        let Ok(inputs) = external_inputs(&self.plan, unit) else {
            return false;
        };
        let own = match unit {
            Unit::Op(op) => assignment.segment_of(op).map(|s| s.id),
            Unit::Loop(_) => None,
        };
        inputs.iter().all(|(_, ch)| {
            if scope.lookup(*ch).is_none() {
                return false;
            }
            let producer = self.plan.channel(*ch).map(|c| c.producer.operator);
            let from = producer
                .and_then(|p| assignment.segment_of(p))
                .map(|s| s.id)
                .filter(|id| holds.contains_key(id));
            match from {
                Some(seg) => own == Some(seg),
                None => true,
            }
        })
    }

    fn launch(
        self: &Arc<Self>,
        unit: Unit,
        scope: &Arc<Scope>,
        ctx: &Arc<OptimizationContext>,
        iteration: Option<usize>,
        assignment: &Arc<ExecutionAssignment>,
        tasks: &mut JoinSet<Completed>,
    ) -> Result<()> {
        let mut sources = Vec::new();
        let mut inputs = Vec::new();
        for (slot, ch) in external_inputs(&self.plan, unit)? {
            let (inst, local) = scope
                .lookup(ch)
                .ok_or_else(|| JobError::Internal(format!("{ch} vanished before launch")))?;
            inputs.push((slot.index, Arc::clone(&inst)));
            sources.push((inst, local));
        }

        let this = Arc::clone(self);
        match unit {
            Unit::Op(op) => {
                let outputs = self
                    .plan
                    .operator(op)
                    .map_or(0, |o| o.outputs().len());
                self.set_state(op, OperatorState::Scheduled);
                let req = DispatchRequest {
                    op,
                    inputs,
                    outputs: (0..outputs).collect(),
                    ctx: Arc::clone(ctx),
                    iteration,
                    assignment: Arc::clone(assignment),
                };
                tasks.spawn(async move {
                    let result = this.dispatch_async(req).await;
                    Completed {
                        unit,
                        sources,
                        result,
                    }
                });
            }
            Unit::Loop(l) => {
                let scope = Arc::clone(scope);
                let ctx = Arc::clone(ctx);
                tasks.spawn(async move {
                    let result = this.run_loop(l, scope, ctx, iteration).await;
                    Completed {
                        unit,
                        sources,
                        result,
                    }
                });
            }
        }
        Ok(())
    }

    fn fall_back(
        &self,
        seg: SegmentId,
        error: JobError,
        scope: &Scope,
        pending: &mut BTreeSet<Unit>,
        done: &mut BTreeSet<Unit>,
        holds: &mut BTreeMap<SegmentId, Hold>,
    ) -> Result<()> {
        let current = self.assignment();
        let Some(segment) = current.segment(seg) else {
            return Err(error);
        };
        let Some(next) = Optimizer::new(&self.registry, &self.estimators, &self.config)
            .fall_back(&self.plan, &current, seg)?
        else {
            return Err(error);
        };
        tracing::warn!(
            segment = %seg,
            from = %segment.platform,
            to = %next.segment(seg).map_or_else(String::new, |s| s.platform.to_string()),
            error = %error,
            "segment failed; replaying on fallback platform"
        );

        for op in &segment.operators {
            let outputs = self.plan.operator(*op).map_or(0, |o| o.outputs().len());
            for slot in 0..outputs {
                let Some(ch) = self.plan.output_channel(*op, slot) else {
                    continue;
                };
                if let Some(inst) = scope.take(ch) {
                    inst.release();
                }
            }
            self.discard_output(*op);
            self.set_state(*op, OperatorState::Pending);
            done.remove(&Unit::Op(*op));
            pending.insert(Unit::Op(*op));
        }
        if let Some(hold) = holds.get_mut(&seg) {
            *hold = Hold::default();
        }

        self.swap_assignment(next);
        self.fell_back();
        Ok(())
    }

    /// Re-optimize with everything that already ran held fixed.
    fn replan(
        &self,
        trigger: OperatorId,
        done: &BTreeSet<Unit>,
        ctx: &OptimizationContext,
    ) -> Result<()> {
        let current = self.assignment();
        let mut committed = Committed::default();
        for unit in done {
            let ops: Vec<OperatorId> = match unit {
                Unit::Op(op) => vec![*op],
                Unit::Loop(l) => {
                    let mut ops = self.plan.loop_members(*l);
                    if let Some(spec) = self.plan.loop_spec(*l) {
                        ops.push(spec.head);
                        ops.push(spec.output);
                        if let Some(n) = self.observed(spec.output) {
                            committed.cardinalities.insert(spec.output, n);
                        }
                    }
                    ops
                }
            };
            for op in ops {
                if let Some(p) = current.platform_of(op) {
                    committed.platforms.insert(op, p.clone());
                }
                if let Unit::Op(_) = unit {
                    if let Some(n) = self.observed(op) {
                        committed.cardinalities.insert(op, n);
                    }
                }
                let outputs = self.plan.operator(op).map_or(0, |o| o.outputs().len());
                for slot in 0..outputs {
                    let Some(ch) = self.plan.output_channel(op, slot) else {
                        continue;
                    };
                    if let Some(cp) = current.channel_plan(ch) {
                        committed.channel_kinds.insert(ch, cp.produced);
                    }
                }
            }
        }

        let next = Optimizer::new(&self.registry, &self.estimators, &self.config)
            .reoptimize(&self.plan, &committed, ctx)?;
        tracing::warn!(
            trigger = %trigger,
            committed = committed.platforms.len(),
            before = current.total_cost.total(),
            after = next.total_cost.total(),
            "re-optimized remaining plan"
        );
        self.swap_assignment(next);
        self.replanned();
        Ok(())
    }
}
