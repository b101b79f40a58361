//! Candidate platforms per operator.

use std::collections::BTreeMap;

use polyplan_core::config::JobConfig;
use polyplan_core::id::{OperatorId, PlatformId};
use polyplan_core::plan::Plan;
use polyplan_platform::PlatformRegistry;

use crate::error::OptimizerError;

/// permitted ∩ registered ∩ capable, narrowed by a fixed platform, a pin, or
/// an already committed choice. Registration order is kept.
///
/// Fails on the first operator (by id) left without a candidate.
pub fn candidates(
    plan: &Plan,
    registry: &PlatformRegistry,
    config: &JobConfig,
    committed: &BTreeMap<OperatorId, PlatformId>,
) -> Result<BTreeMap<OperatorId, Vec<PlatformId>>, OptimizerError> {
    let mut out = BTreeMap::new();
    for op in plan.operators() {
        if let Some(p) = committed.get(&op.id()) {
            out.insert(op.id(), vec![p.clone()]);
            continue;
        }
        let pin = config.pin_for(op.name());
        let list: Vec<PlatformId> = registry
            .platforms()
            .filter(|p| op.permits(p.id()))
            .filter(|p| pin.map_or(true, |pin| pin == p.id()))
            .filter(|p| p.supports(op.kind()))
            .map(|p| p.id().clone())
            .collect();
        if list.is_empty() {
            tracing::debug!(operator = %op.id(), key = op.key(), ?pin, "no feasible platform");
            return Err(OptimizerError::NoFeasiblePlatform {
                operator: op.id(),
                name: op.display_name(),
            });
        }
        out.insert(op.id(), list);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyplan_core::types::{DataUnitType, Quantum};
    use polyplan_core::plan::Operator;
    use polyplan_platform::LocalPlatform;
    use std::sync::Arc;

    fn registry() -> PlatformRegistry {
        PlatformRegistry::builder()
            .register(Arc::new(LocalPlatform::new("java")))
            .unwrap()
            .register(Arc::new(
                LocalPlatform::new("graph").with_operators(&["transform.map"]),
            ))
            .unwrap()
            .build()
    }

    #[test]
    fn capability_permission_and_pins_narrow_the_set() {
        let mut plan = Plan::new();
        let map = plan
            .add(Operator::map(DataUnitType::Int, DataUnitType::Int, |q| q.clone()).named("m"))
            .unwrap();
        let sort = plan.add(Operator::sort(DataUnitType::Int)).unwrap();
        let src = plan
            .add(Operator::collection_source(vec![Quantum::Int(1)], DataUnitType::Int).with_target_platform("graph"))
            .unwrap();

        let reg = registry();
        let cfg = JobConfig::default();
        let none = BTreeMap::new();

        let err = candidates(&plan, &reg, &cfg, &none).unwrap_err();
        assert_eq!(
            err,
            OptimizerError::NoFeasiblePlatform {
                operator: src,
                name: format!("op{}", src.get())
            }
        );

        let mut plan2 = Plan::new();
        let m2 = plan2
            .add(Operator::map(DataUnitType::Int, DataUnitType::Int, |q| q.clone()).named("m"))
            .unwrap();
        let s2 = plan2.add(Operator::sort(DataUnitType::Int)).unwrap();
        let c = candidates(&plan2, &reg, &cfg, &none).unwrap();
        assert_eq!(c[&m2], vec![PlatformId::new("java"), PlatformId::new("graph")]);
        assert_eq!(c[&s2], vec![PlatformId::new("java")]);

        let mut pinned = cfg.clone();
        pinned.pins.insert("m".into(), PlatformId::new("graph"));
        let c = candidates(&plan2, &reg, &pinned, &none).unwrap();
        assert_eq!(c[&m2], vec![PlatformId::new("graph")]);

        pinned.pins.insert("m".into(), PlatformId::new("made-up"));
        assert!(matches!(
            candidates(&plan2, &reg, &pinned, &none),
            Err(OptimizerError::NoFeasiblePlatform { operator, .. }) if operator == m2
        ));
        let _ = (map, sort);
    }
}
