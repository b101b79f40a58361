//! Instrumentation strategies.
//!
//! Every dispatch is timed and counted for lineage regardless. A strategy
//! decides what happens with the measurement afterwards.

use std::sync::Arc;

use polyplan_core::config::InstrumentationMode;
use polyplan_core::id::PlatformId;
use polyplan_core::plan::Operator;
use polyplan_cost::{LoadEstimator, ObservedCost, OptimizationContext};
use polyplan_platform::Measurement;

pub trait Instrumentation: Send + Sync {
    fn mode(&self) -> InstrumentationMode;

    fn observe(
        &self,
        op: &Operator,
        platform: &PlatformId,
        measurement: Measurement,
        ctx: &OptimizationContext,
        estimator: &dyn LoadEstimator,
    );
}

/// Record observed cost in the optimization context and feed the estimator.
#[derive(Debug, Default, Clone, Copy)]
pub struct FullInstrumentation;

/// Lineage only.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoInstrumentation;

impl Instrumentation for FullInstrumentation {
    fn mode(&self) -> InstrumentationMode {
        InstrumentationMode::Full
    }

    fn observe(
        &self,
        op: &Operator,
        platform: &PlatformId,
        measurement: Measurement,
        ctx: &OptimizationContext,
        estimator: &dyn LoadEstimator,
    ) {
        let observed = ObservedCost {
            operator: op.id(),
            key: op.key().to_string(),
            platform: platform.clone(),
            input_quanta: measurement.input_quanta,
            output_quanta: measurement.output_quanta,
            elapsed: measurement.elapsed,
        };
        estimator.update(&observed);
        ctx.record_observation(observed);
    }
}

impl Instrumentation for NoInstrumentation {
    fn mode(&self) -> InstrumentationMode {
        InstrumentationMode::None
    }

    fn observe(
        &self,
        _op: &Operator,
        _platform: &PlatformId,
        _measurement: Measurement,
        _ctx: &OptimizationContext,
        _estimator: &dyn LoadEstimator,
    ) {
    }
}

pub fn strategy(mode: InstrumentationMode) -> Arc<dyn Instrumentation> {
    match mode {
        InstrumentationMode::Full => Arc::new(FullInstrumentation),
        InstrumentationMode::None => Arc::new(NoInstrumentation),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyplan_core::types::{DataUnitType, Quantum};
    use polyplan_cost::LinearLoadEstimator;
    use std::time::Duration;

    fn measurement() -> Measurement {
        Measurement {
            elapsed: Duration::from_micros(40),
            input_quanta: 0,
            output_quanta: 4,
        }
    }

    #[test]
    fn full_records_and_feeds_the_estimator() {
        let op = Operator::collection_source(vec![Quantum::Int(1); 4], DataUnitType::Int);
        let ctx = OptimizationContext::root();
        let est = LinearLoadEstimator::new(1.0, 1.0).with_calibration(1.0);
        let platform = PlatformId::new("local");

        strategy(InstrumentationMode::Full).observe(&op, &platform, measurement(), &ctx, &est);
        assert_eq!(ctx.observed_cardinality(op.id()), Some(4));
        assert_eq!(est.runs(op.key()), 1);
    }

    #[test]
    fn none_leaves_context_untouched() {
        let op = Operator::collection_source(vec![Quantum::Int(1)], DataUnitType::Int);
        let ctx = OptimizationContext::root();
        let est = LinearLoadEstimator::new(1.0, 1.0).with_calibration(1.0);
        let s = strategy(InstrumentationMode::None);
        s.observe(&op, &PlatformId::new("local"), measurement(), &ctx, &est);
        assert_eq!(s.mode(), InstrumentationMode::None);
        assert!(ctx.entry(op.id()).is_none());
        assert_eq!(est.runs(op.key()), 0);
    }
}
