//! Cardinality propagation over the whole plan.

use std::collections::BTreeMap;

use polyplan_core::id::OperatorId;
use polyplan_core::plan::{OperatorKind, Plan, HEAD_INITIAL};
use polyplan_cost::{estimate_output, CardinalityEstimate};

use crate::error::OptimizerError;

/// Output estimate per operator, in topological order.
///
/// `observed` (operator -> produced quanta) overrides everything else. Loop
/// heads see only their initial input; the state is assumed to keep its size
/// across iterations.
pub fn propagate(
    plan: &Plan,
    order: &[OperatorId],
    observed: &BTreeMap<OperatorId, u64>,
) -> Result<BTreeMap<OperatorId, CardinalityEstimate>, OptimizerError> {
    let mut out: BTreeMap<OperatorId, CardinalityEstimate> = BTreeMap::new();
    for id in order {
        let op = plan
            .operator(*id)
            .ok_or(polyplan_core::error::PlanError::UnknownOperator(*id))?;
        if let Some(n) = observed.get(id) {
            out.insert(*id, CardinalityEstimate::exact(*n));
            continue;
        }
        let inputs: Vec<CardinalityEstimate> = match op.kind() {
            OperatorKind::LoopHead(_) => vec![input_estimate(plan, &out, *id, HEAD_INITIAL)],
            _ => (0..op.inputs().len())
                .map(|slot| input_estimate(plan, &out, *id, slot))
                .collect(),
        };
        let est = estimate_output(op.kind(), &inputs, op.declared_cardinality());
        out.insert(*id, est);
    }
    Ok(out)
}

fn input_estimate(
    plan: &Plan,
    known: &BTreeMap<OperatorId, CardinalityEstimate>,
    op: OperatorId,
    slot: usize,
) -> CardinalityEstimate {
    plan.input_channel(op, slot)
        .and_then(|c| plan.channel(c))
        .and_then(|c| known.get(&c.producer.operator).copied())
        .unwrap_or_else(|| CardinalityEstimate::exact(0))
}
