//! Output cardinality heuristics.
//!
//! Declared sizes win; otherwise each transform applies a fixed factor. These
//! are deliberately crude and only need to rank alternatives.

use polyplan_core::plan::{OperatorKind, Source, Transform};

use crate::estimate::CardinalityEstimate;

const DEFAULT_FILTER_SELECTIVITY: f64 = 0.5;
const DEFAULT_FLAT_MAP_EXPANSION: f64 = 3.0;
/// Roughly 10% of quanta carry a distinct key.
const GROUPING_FACTOR: f64 = 0.1;
const DISTINCT_FACTOR: f64 = 0.7;
/// Each heuristic step loses some confidence.
const PENALTY: f64 = 0.8;

/// Estimate what `kind` produces from `inputs` (one entry per input slot).
pub fn estimate_output(
    kind: &OperatorKind,
    inputs: &[CardinalityEstimate],
    declared: Option<u64>,
) -> CardinalityEstimate {
    if let Some(n) = declared {
        return CardinalityEstimate::exact(n);
    }
    let first = inputs.first().copied().unwrap_or_default();

    match kind {
        OperatorKind::Source(Source::Collection(items)) => {
            CardinalityEstimate::exact(items.len() as u64)
        }
        OperatorKind::Transform(t) | OperatorKind::LoopBody { transform: t, .. } => {
            transform_output(t, inputs, first)
        }
        OperatorKind::Sink(_) | OperatorKind::LoopHead(_) | OperatorKind::LoopOutput(_) => first,
    }
}

fn transform_output(
    t: &Transform,
    inputs: &[CardinalityEstimate],
    first: CardinalityEstimate,
) -> CardinalityEstimate {
    match t {
        Transform::Map(_) | Transform::IterationMap(_) | Transform::Sort => first,
        Transform::Filter { selectivity, .. } => {
            first.scale(selectivity.unwrap_or(DEFAULT_FILTER_SELECTIVITY), PENALTY)
        }
        Transform::FlatMap { expansion, .. } => {
            first.scale(expansion.unwrap_or(DEFAULT_FLAT_MAP_EXPANSION), PENALTY)
        }
        Transform::GroupBy(_) | Transform::ReduceBy { .. } => {
            let mut out = first.scale(GROUPING_FACTOR, PENALTY);
            if first.upper > 0 {
                out.lower = out.lower.max(1);
                out.upper = out.upper.max(1);
            }
            out
        }
        Transform::Distinct => first.scale(DISTINCT_FACTOR, PENALTY),
        Transform::Count => CardinalityEstimate::exact(1),
        Transform::Union => inputs
            .iter()
            .fold(CardinalityEstimate::exact(0), |acc, c| acc.plus(c)),
    }
}
