//! Optimization contexts.
//!
//! One root per job, one child per loop iteration. Each context maps operators
//! to the platform chosen for them, what that was expected to cost and produce,
//! and (once instrumented) what it actually cost. Contexts are shared between
//! the optimizer and concurrently running dispatches, hence the sharded map.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use polyplan_core::id::{ContextId, LoopId, OperatorId, PlatformId};
use serde::Serialize;

use crate::estimate::{CardinalityEstimate, CostEstimate, ObservedCost};

#[derive(Debug, Clone, Serialize)]
pub struct ContextEntry {
    pub platform: Option<PlatformId>,
    pub estimated_cost: CostEstimate,
    pub estimated_cardinality: CardinalityEstimate,
    pub observed: Option<ObservedCost>,
}

#[derive(Debug)]
pub struct OptimizationContext {
    id: ContextId,
    loop_id: Option<LoopId>,
    iteration: Option<usize>,
    entries: DashMap<OperatorId, ContextEntry>,
    children: Mutex<Vec<Arc<OptimizationContext>>>,
    ids: Arc<AtomicU64>,
}

impl OptimizationContext {
    pub fn root() -> Arc<Self> {
        let ids = Arc::new(AtomicU64::new(1));
        Arc::new(Self {
            id: ContextId::new(0),
            loop_id: None,
            iteration: None,
            entries: DashMap::new(),
            children: Mutex::new(Vec::new()),
            ids,
        })
    }

    /// Fresh context for iteration `iteration` of `loop_id`, seeded with this
    /// context's estimates for the loop's members.
    pub fn child(
        self: &Arc<Self>,
        loop_id: LoopId,
        iteration: usize,
        members: &[OperatorId],
    ) -> Arc<Self> {
        let entries = DashMap::new();
        for op in members {
            if let Some(e) = self.entries.get(op) {
                entries.insert(
                    *op,
                    ContextEntry {
                        observed: None,
                        ..e.value().clone()
                    },
                );
            }
        }
        let child = Arc::new(Self {
            id: ContextId::new(self.ids.fetch_add(1, Ordering::Relaxed)),
            loop_id: Some(loop_id),
            iteration: Some(iteration),
            entries,
            children: Mutex::new(Vec::new()),
            ids: Arc::clone(&self.ids),
        });
        self.children.lock().push(Arc::clone(&child));
        child
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn loop_id(&self) -> Option<LoopId> {
        self.loop_id
    }

    pub fn iteration(&self) -> Option<usize> {
        self.iteration
    }

    pub fn record_estimate(
        &self,
        op: OperatorId,
        platform: PlatformId,
        cost: CostEstimate,
        cardinality: CardinalityEstimate,
    ) {
        let mut entry = self.entries.entry(op).or_insert_with(|| ContextEntry {
            platform: None,
            estimated_cost: CostEstimate::ZERO,
            estimated_cardinality: CardinalityEstimate::unknown(),
            observed: None,
        });
        entry.platform = Some(platform);
        entry.estimated_cost = cost;
        entry.estimated_cardinality = cardinality;
    }

    pub fn record_observation(&self, observed: ObservedCost) {
        let op = observed.operator;
        let platform = observed.platform.clone();
        self.entries
            .entry(op)
            .and_modify(|e| e.observed = Some(observed.clone()))
            .or_insert_with(|| ContextEntry {
                platform: Some(platform),
                estimated_cost: CostEstimate::ZERO,
                estimated_cardinality: CardinalityEstimate::unknown(),
                observed: Some(observed),
            });
    }

    pub fn entry(&self, op: OperatorId) -> Option<ContextEntry> {
        self.entries.get(&op).map(|e| e.value().clone())
    }

    pub fn observed_cardinality(&self, op: OperatorId) -> Option<u64> {
        self.entries
            .get(&op)
            .and_then(|e| e.observed.as_ref().map(|o| o.output_quanta))
    }

    pub fn children(&self) -> Vec<Arc<OptimizationContext>> {
        self.children.lock().clone()
    }

    /// Contexts in this subtree, this one included.
    pub fn subtree_len(&self) -> usize {
        1 + self
            .children
            .lock()
            .iter()
            .map(|c| c.subtree_len())
            .sum::<usize>()
    }

    /// Sum of estimated costs in this context (children excluded).
    pub fn estimated_total(&self) -> f64 {
        self.entries.iter().map(|e| e.estimated_cost.total()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn children_inherit_estimates_not_observations() {
        let root = OptimizationContext::root();
        let op = OperatorId::new(3);
        root.record_estimate(
            op,
            PlatformId::new("java"),
            CostEstimate::cpu(4.0),
            CardinalityEstimate::exact(10),
        );
        root.record_observation(ObservedCost {
            operator: op,
            key: "transform.map".into(),
            platform: PlatformId::new("java"),
            input_quanta: 10,
            output_quanta: 9,
            elapsed: Duration::from_millis(1),
        });
        assert_eq!(root.observed_cardinality(op), Some(9));

        let child = root.child(LoopId::new(0), 1, &[op]);
        assert_ne!(child.id(), root.id());
        assert_eq!(child.iteration(), Some(1));
        let entry = child.entry(op).unwrap();
        assert_eq!(entry.estimated_cost.total(), 4.0);
        assert!(entry.observed.is_none());
        assert_eq!(root.subtree_len(), 2);
    }
}
