//! Loop driver.
//!
//! A loop runs as one unit of its enclosing scope:
//!
//! ```text
//! head(initial) -> iteration -> body ... exit -> feedback
//!   converged?  no  -> head(feedback) -> iteration -> body ...
//!               yes -> head(feedback) -> final -> loop output
//! ```
//!
//! Every iteration gets a fresh child scope and a child optimization context.
//! The body always runs at least once; `max_iterations` caps it.

use std::sync::Arc;

use polyplan_core::id::LoopId;
use polyplan_core::plan::{LoopState, HEAD_FEEDBACK, HEAD_FINAL, HEAD_INITIAL, HEAD_ITERATION};
use polyplan_cost::OptimizationContext;
use polyplan_platform::ChannelInstance;

use crate::error::{JobError, Result};
use crate::executor::{
    CrossPlatformExecutor, DispatchRequest, Dispatched, LoopReport, LoopTermination,
};
use crate::scheduler::BoxFuture;
use crate::scope::Scope;

impl CrossPlatformExecutor {
    pub(crate) fn run_loop(
        self: Arc<Self>,
        loop_id: LoopId,
        outer: Arc<Scope>,
        ctx: Arc<OptimizationContext>,
        iteration: Option<usize>,
    ) -> BoxFuture<Result<Dispatched>> {
        Box::pin(async move { self.drive(loop_id, outer, ctx, iteration).await })
    }

    async fn drive(
        self: Arc<Self>,
        loop_id: LoopId,
        outer: Arc<Scope>,
        ctx: Arc<OptimizationContext>,
        iteration: Option<usize>,
    ) -> Result<Dispatched> {
        let plan = Arc::clone(&self.plan);
        let spec = plan
            .loop_spec(loop_id)
            .cloned()
            .ok_or_else(|| JobError::Internal(format!("{loop_id} is not in the plan")))?;
        let members = plan.loop_members(loop_id);
        let missing = |what: &str| JobError::Internal(format!("loop '{}' has no {what}", spec.name));
        let initial_ch = plan
            .input_channel(spec.head, HEAD_INITIAL)
            .ok_or_else(|| missing("initial input"))?;
        let feedback_ch = plan
            .input_channel(spec.head, HEAD_FEEDBACK)
            .ok_or_else(|| missing("feedback channel"))?;
        let (initial, _) = outer
            .lookup(initial_ch)
            .ok_or_else(|| missing("initial state instance"))?;

        tracing::debug!(loop_id = %loop_id, name = %spec.name, "loop started");

        let mut state = initial;
        let mut state_slot = HEAD_INITIAL;
        // Feedback instances are owned here; the initial one belongs to `outer`.
        let mut owned: Option<Arc<ChannelInstance>> = None;
        let mut completed = 0usize;

        let termination = loop {
            if self.cancel.is_cancelled() {
                release_owned(&mut owned);
                return Err(JobError::Cancelled);
            }
            let child_ctx = ctx.child(loop_id, completed, &members);
            let child = Scope::child(&outer, loop_id);

            let entered = Arc::clone(&self)
                .dispatch_async(DispatchRequest {
                    op: spec.head,
                    inputs: vec![(state_slot, Arc::clone(&state))],
                    outputs: vec![HEAD_ITERATION],
                    ctx: Arc::clone(&ctx),
                    iteration: Some(completed),
                    assignment: self.assignment(),
                })
                .await;
            let entered = match entered {
                Ok(d) => d,
                Err(e) => {
                    release_owned(&mut owned);
                    return Err(e);
                }
            };
            for (ch, inst) in entered.produced {
                child.insert(ch, inst);
            }

            let body = Arc::clone(&self)
                .run_scope(Arc::clone(&child), child_ctx, Some(completed))
                .await;
            let feedback = child.take(feedback_ch);
            for leftover in child.drain() {
                leftover.release();
            }
            if let Err(e) = body {
                if let Some(f) = feedback {
                    f.release();
                }
                release_owned(&mut owned);
                return Err(e);
            }
            let feedback = feedback.ok_or_else(|| missing("feedback after an iteration"))?;

            release_owned(&mut owned);
            owned = Some(Arc::clone(&feedback));
            state = feedback;
            state_slot = HEAD_FEEDBACK;
            completed += 1;
            self.metrics.iteration();

            let data = match state.read() {
                Ok(d) => d,
                Err(source) => {
                    release_owned(&mut owned);
                    return Err(JobError::Execution {
                        operator: spec.head,
                        name: spec.name.clone(),
                        platform: self
                            .assignment()
                            .platform_of(spec.head)
                            .cloned()
                            .unwrap_or_else(|| "unassigned".into()),
                        source,
                    });
                }
            };
            let converged = spec.has_converged(&LoopState {
                iteration: completed,
                state: data.as_slice(),
            });
            tracing::trace!(loop_id = %loop_id, iteration = completed, state = data.len(), converged, "iteration done");

            if converged {
                break LoopTermination::Converged;
            }
            if completed >= self.config.max_iterations {
                if self.config.strict_convergence {
                    release_owned(&mut owned);
                    return Err(JobError::NotConverged {
                        loop_id,
                        head: spec.head,
                        name: spec.name.clone(),
                        iterations: completed,
                    });
                }
                tracing::warn!(
                    loop_id = %loop_id,
                    name = %spec.name,
                    iterations = completed,
                    "loop stopped at the iteration bound"
                );
                break LoopTermination::IterationBound;
            }
        };

        let finished = Arc::clone(&self)
            .dispatch_async(DispatchRequest {
                op: spec.head,
                inputs: vec![(state_slot, Arc::clone(&state))],
                outputs: vec![HEAD_FINAL],
                ctx: Arc::clone(&ctx),
                iteration,
                assignment: self.assignment(),
            })
            .await;
        release_owned(&mut owned);
        let finished = finished?;

        let mut final_inputs = Vec::with_capacity(1);
        for (_, inst) in &finished.produced {
            final_inputs.push((0, Arc::clone(inst)));
        }
        let out = Arc::clone(&self)
            .dispatch_async(DispatchRequest {
                op: spec.output,
                inputs: final_inputs,
                outputs: vec![0],
                ctx,
                iteration,
                assignment: self.assignment(),
            })
            .await;
        for (_, inst) in &finished.produced {
            inst.release();
        }
        let out = out?;

        tracing::debug!(loop_id = %loop_id, name = %spec.name, iterations = completed, termination = ?termination, "loop finished");
        self.report_loop(LoopReport {
            loop_id,
            name: spec.name.clone(),
            iterations: completed,
            termination,
        });
        Ok(out)
    }
}

fn release_owned(owned: &mut Option<Arc<ChannelInstance>>) {
    if let Some(inst) = owned.take() {
        inst.release();
    }
}
