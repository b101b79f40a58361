//! The optimizer entry point.

use std::collections::{BTreeMap, HashMap};

use polyplan_core::channel::ChannelKind;
use polyplan_core::config::JobConfig;
use polyplan_core::error::PlanError;
use polyplan_core::id::{ChannelId, LoopId, OperatorId, PlatformId, SegmentId};
use polyplan_core::plan::{OperatorKind, Plan, HEAD_INITIAL};
use polyplan_cost::{
    CardinalityEstimate, CostEstimate, EstimatorRegistry, InputStatistics, OptimizationContext,
};
use polyplan_platform::PlatformRegistry;

use crate::assignment::{ExecutionAssignment, Segment};
use crate::candidates::candidates;
use crate::cardinality::propagate;
use crate::error::OptimizerError;
use crate::search::{search, SearchSpace};
use crate::segments::{build_segments, plan_fallbacks};

/// Decisions that can no longer change because execution already acted on
/// them.
#[derive(Debug, Clone, Default)]
pub struct Committed {
    /// Operators that have run, on the platform they ran on.
    pub platforms: BTreeMap<OperatorId, PlatformId>,
    /// Produced kinds of channels whose producer has run.
    pub channel_kinds: BTreeMap<ChannelId, ChannelKind>,
    /// Observed output sizes.
    pub cardinalities: BTreeMap<OperatorId, u64>,
}

impl Committed {
    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }
}

/// Borrowed view of everything the optimizer consults.
#[derive(Debug, Clone, Copy)]
pub struct Optimizer<'a> {
    registry: &'a PlatformRegistry,
    estimators: &'a EstimatorRegistry,
    config: &'a JobConfig,
}

impl<'a> Optimizer<'a> {
    pub fn new(
        registry: &'a PlatformRegistry,
        estimators: &'a EstimatorRegistry,
        config: &'a JobConfig,
    ) -> Self {
        Self {
            registry,
            estimators,
            config,
        }
    }

    /// Validate `plan` and choose a platform for every operator and a route
    /// for every channel. Estimates are recorded into `ctx`.
    pub fn optimize(
        &self,
        plan: &Plan,
        ctx: &OptimizationContext,
    ) -> Result<ExecutionAssignment, OptimizerError> {
        self.run(plan, &Committed::default(), ctx)
    }

    /// Re-plan the not yet executed part of `plan`, keeping `committed`.
    pub fn reoptimize(
        &self,
        plan: &Plan,
        committed: &Committed,
        ctx: &OptimizationContext,
    ) -> Result<ExecutionAssignment, OptimizerError> {
        self.run(plan, committed, ctx)
    }

    fn run(
        &self,
        plan: &Plan,
        committed: &Committed,
        ctx: &OptimizationContext,
    ) -> Result<ExecutionAssignment, OptimizerError> {
        plan.validate()?;
        let order = plan.topological_order()?;
        let candidates = candidates(plan, self.registry, self.config, &committed.platforms)?;
        let cardinalities = propagate(plan, &order, &committed.cardinalities)?;

        let operator_costs = self.operator_costs(plan, &candidates, &cardinalities)?;

        let quanta = channel_quanta(plan, &cardinalities);
        let mut channel_multipliers = BTreeMap::new();
        for ch in plan.channels() {
            let scope = plan.output_scope(ch.producer)?;
            channel_multipliers.insert(ch.id, scope_multiplier(plan, scope));
        }

        let result = search(&SearchSpace {
            plan,
            registry: self.registry,
            order: &order,
            candidates: &candidates,
            operator_costs: &operator_costs,
            quanta: &quanta,
            channel_multipliers: &channel_multipliers,
            fixed_kinds: &committed.channel_kinds,
            enumeration_limit: self.config.enumeration_limit,
        })?;

        let segments = build_segments(plan, &result.platforms, &result.channels);
        let fallbacks = if plan.fallback_enabled() {
            plan_fallbacks(
                plan,
                self.registry,
                &segments,
                &candidates,
                &result.platforms,
                &result.channels,
                &operator_costs,
                &quanta,
            )
        } else {
            BTreeMap::new()
        };

        for (op, platform) in &result.platforms {
            ctx.record_estimate(
                *op,
                platform.clone(),
                result
                    .operator_costs
                    .get(op)
                    .copied()
                    .unwrap_or(CostEstimate::ZERO),
                cardinalities
                    .get(op)
                    .copied()
                    .unwrap_or_else(CardinalityEstimate::unknown),
            );
        }

        let assignment = ExecutionAssignment {
            platforms: result.platforms,
            channels: result.channels,
            segments,
            fallbacks,
            operator_costs: result.operator_costs,
            cardinalities,
            total_cost: result.total_cost,
            strategy: result.strategy,
        };
        tracing::info!(
            job = plan.name().unwrap_or("-"),
            operators = plan.len(),
            platforms = assignment.distinct_platforms().len(),
            conversions = assignment.conversions(),
            cost = assignment.total_cost.total(),
            strategy = ?assignment.strategy,
            "plan optimized"
        );
        Ok(assignment)
    }

    /// Move `segment` onto its fallback platform and re-plan the remaining
    /// fallbacks against the result. `None` once the segment's fallback is
    /// used up.
    pub fn fall_back(
        &self,
        plan: &Plan,
        current: &ExecutionAssignment,
        segment: SegmentId,
    ) -> Result<Option<ExecutionAssignment>, OptimizerError> {
        let Some(mut next) = current.with_fallback(segment) else {
            return Ok(None);
        };
        if next.fallbacks.is_empty() {
            return Ok(Some(next));
        }

        let candidates = candidates(plan, self.registry, self.config, &BTreeMap::new())?;
        let operator_costs = self.operator_costs(plan, &candidates, &next.cardinalities)?;
        let quanta = channel_quanta(plan, &next.cardinalities);
        let remaining: Vec<Segment> = next
            .segments
            .iter()
            .filter(|s| next.fallbacks.contains_key(&s.id))
            .cloned()
            .collect();
        next.fallbacks = plan_fallbacks(
            plan,
            self.registry,
            &remaining,
            &candidates,
            &next.platforms,
            &next.channels,
            &operator_costs,
            &quanta,
        );
        tracing::debug!(
            segment = %segment,
            remaining = next.fallbacks.len(),
            "fallback plans refreshed"
        );
        Ok(Some(next))
    }

    /// Estimated cost of each operator on each of its candidates, scaled by
    /// how often the operator is expected to run.
    fn operator_costs(
        &self,
        plan: &Plan,
        candidates: &BTreeMap<OperatorId, Vec<PlatformId>>,
        cardinalities: &BTreeMap<OperatorId, CardinalityEstimate>,
    ) -> Result<HashMap<(OperatorId, PlatformId), CostEstimate>, OptimizerError> {
        let mut out = HashMap::new();
        for (op_id, list) in candidates {
            let op = plan
                .operator(*op_id)
                .ok_or(PlanError::UnknownOperator(*op_id))?;
            let inputs: Vec<CardinalityEstimate> = match op.kind() {
                OperatorKind::LoopHead(_) => vec![input_estimate(plan, cardinalities, *op_id, HEAD_INITIAL)],
                _ => (0..op.inputs().len())
                    .map(|slot| input_estimate(plan, cardinalities, *op_id, slot))
                    .collect(),
            };
            let output = cardinalities
                .get(op_id)
                .copied()
                .unwrap_or_else(CardinalityEstimate::unknown);
            let stats = InputStatistics::new(inputs, output);
            let multiplier = match op.kind() {
                OperatorKind::LoopHead(l) => scope_multiplier(plan, Some(*l)),
                _ => plan.iteration_multiplier(*op_id),
            };

            for platform_id in list {
                let Some(platform) = self.registry.get(platform_id) else {
                    continue;
                };
                let estimator = self.estimators.resolve(
                    op.key(),
                    platform_id,
                    platform.load_estimator(op.key()),
                );
                let cost = estimator.estimate(op.key(), platform_id, &stats).scale(multiplier);
                out.insert((*op_id, platform_id.clone()), cost);
            }
        }
        Ok(out)
    }
}

fn input_estimate(
    plan: &Plan,
    cardinalities: &BTreeMap<OperatorId, CardinalityEstimate>,
    op: OperatorId,
    slot: usize,
) -> CardinalityEstimate {
    plan.input_channel(op, slot)
        .and_then(|c| plan.channel(c))
        .and_then(|c| cardinalities.get(&c.producer.operator).copied())
        .unwrap_or_else(|| CardinalityEstimate::exact(0))
}

/// Expected quanta on each channel: its producer's output estimate.
fn channel_quanta(
    plan: &Plan,
    cardinalities: &BTreeMap<OperatorId, CardinalityEstimate>,
) -> BTreeMap<ChannelId, f64> {
    plan.channels()
        .map(|ch| {
            let n = cardinalities
                .get(&ch.producer.operator)
                .map_or(0.0, |c| c.point());
            (ch.id, n)
        })
        .collect()
}

/// Expected number of times code in `scope` runs per job.
fn scope_multiplier(plan: &Plan, scope: Option<LoopId>) -> f64 {
    let mut factor = 1.0;
    let mut cur = scope;
    while let Some(l) = cur {
        let Some(spec) = plan.loop_spec(l) else { break };
        factor *= spec.expected_iterations.max(1) as f64;
        cur = spec.parent;
    }
    factor
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyplan_core::plan::{LoopDef, Operator};
    use polyplan_core::types::{DataUnitType, Quantum, SlotType};
    use polyplan_cost::LinearLoadEstimator;
    use polyplan_platform::LocalPlatform;
    use std::sync::Arc;

    fn registry() -> PlatformRegistry {
        PlatformRegistry::builder()
            .register(Arc::new(LocalPlatform::new("cheap").with_cost(1.0, 0.1)))
            .unwrap()
            .register(Arc::new(LocalPlatform::new("pricey").with_cost(50.0, 5.0)))
            .unwrap()
            .build()
    }

    fn pipeline() -> (Plan, OperatorId) {
        let mut plan = Plan::new().named("t");
        let src = plan
            .add(Operator::collection_source(vec![Quantum::Int(3); 20], DataUnitType::Int))
            .unwrap();
        let sort = plan.add(Operator::sort(DataUnitType::Int).named("sort")).unwrap();
        let sink = plan
            .add(Operator::collect_sink(SlotType::single(DataUnitType::Int)))
            .unwrap();
        plan.pipe(src, sort).unwrap();
        plan.pipe(sort, sink).unwrap();
        (plan, sort)
    }

    #[test]
    fn picks_the_cheaper_platform_and_records_estimates() {
        let reg = registry();
        let est = EstimatorRegistry::default();
        let cfg = JobConfig::default();
        let (plan, sort) = pipeline();
        let ctx = OptimizationContext::root();

        let a = Optimizer::new(&reg, &est, &cfg).optimize(&plan, &ctx).unwrap();
        assert!(a.platforms.values().all(|p| p.as_str() == "cheap"));
        assert_eq!(a.segments.len(), 1);
        assert!(a.fallbacks.is_empty());
        assert_eq!(ctx.entry(sort).and_then(|e| e.platform), Some(PlatformId::new("cheap")));

        let again = Optimizer::new(&reg, &est, &cfg).optimize(&plan, &OptimizationContext::root()).unwrap();
        assert_eq!(a.fingerprint().unwrap(), again.fingerprint().unwrap());
    }

    #[test]
    fn pins_override_cost_and_fallbacks_follow_the_plan_flag() {
        let reg = registry();
        let est = EstimatorRegistry::default();
        let mut cfg = JobConfig::default();
        cfg.pins.insert("sort".into(), PlatformId::new("pricey"));
        let (plan, sort) = pipeline();
        let plan = plan.with_fallback();

        let a = Optimizer::new(&reg, &est, &cfg)
            .optimize(&plan, &OptimizationContext::root())
            .unwrap();
        assert_eq!(a.platform_of(sort).map(|p| p.as_str()), Some("pricey"));
        assert_eq!(a.segments.len(), 3);
        let seg = a.segment_of(sort).unwrap().id;
        // The pin leaves sort no alternative.
        assert!(a.fallback_for(seg).is_none());
        assert!(a.fallbacks.values().all(|f| f.platform.as_str() == "pricey"));
    }

    #[test]
    fn loop_bodies_are_weighted_by_expected_iterations() {
        let reg = registry();
        let cfg = JobConfig::default();
        let est = EstimatorRegistry::new(Arc::new(LinearLoadEstimator::new(1.0, 1.0)));

        let mut plan = Plan::new();
        let src = plan
            .add(Operator::collection_source(vec![Quantum::Int(1)], DataUnitType::Int))
            .unwrap();
        let l = plan
            .add_loop(LoopDef::repeat("l", SlotType::single(DataUnitType::Int), 4).expected_iterations(4))
            .unwrap();
        let body = plan
            .add_to_loop(l.id, Operator::map(DataUnitType::Int, DataUnitType::Int, |q| q.clone()))
            .unwrap();
        plan.close_loop(l.id, body, body).unwrap();
        let sink = plan
            .add(Operator::collect_sink(SlotType::single(DataUnitType::Int)))
            .unwrap();
        plan.connect(src, 0, l.head, HEAD_INITIAL).unwrap();
        plan.pipe(l.output, sink).unwrap();

        let a = Optimizer::new(&reg, &est, &cfg)
            .optimize(&plan, &OptimizationContext::root())
            .unwrap();
        let once = a.operator_costs[&src].total();
        let body_cost = a.operator_costs[&body].total();
        assert!((body_cost - 4.0 * once).abs() < 1e-9);
    }
}
