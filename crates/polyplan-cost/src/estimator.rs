//! Load estimators: the pluggable cost model.
//!
//! An estimator maps (operator key, platform, input statistics) to a
//! `CostEstimate` and may learn from `ObservedCost` feedback. Resolution order
//! for a given key and platform: explicit registration, then whatever the
//! platform itself offers, then the registry default.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use polyplan_core::id::PlatformId;

use crate::estimate::{CostEstimate, InputStatistics, ObservedCost};

pub trait LoadEstimator: Send + Sync {
    fn estimate(&self, key: &str, platform: &PlatformId, stats: &InputStatistics) -> CostEstimate;

    /// Feedback from an instrumented run. Default: ignore.
    fn update(&self, _observed: &ObservedCost) {}
}

/// Running totals kept per operator key.
#[derive(Debug, Clone, Copy, Default)]
struct Observations {
    runs: u64,
    quanta: u64,
    micros: u128,
}

/// `startup + per_quantum * work(n)` with optional self-calibration.
///
/// `work(n)` is `n log n` for sorts, `1.5 n` for keyed operators, `n` otherwise.
/// With calibration on, the CPU term is scaled by the observed microseconds per
/// quantum relative to `baseline_micros_per_quantum`.
pub struct LinearLoadEstimator {
    pub startup: f64,
    pub cpu_per_quantum: f64,
    pub io_per_quantum: f64,
    pub network_per_quantum: f64,
    calibrate: bool,
    baseline_micros_per_quantum: f64,
    observed: Mutex<HashMap<String, Observations>>,
}

impl LinearLoadEstimator {
    pub fn new(startup: f64, cpu_per_quantum: f64) -> Self {
        Self {
            startup,
            cpu_per_quantum,
            io_per_quantum: 0.0,
            network_per_quantum: 0.0,
            calibrate: false,
            baseline_micros_per_quantum: 1.0,
            observed: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_io(mut self, per_quantum: f64) -> Self {
        self.io_per_quantum = per_quantum;
        self
    }

    pub fn with_network(mut self, per_quantum: f64) -> Self {
        self.network_per_quantum = per_quantum;
        self
    }

    /// Scale CPU estimates by observed throughput.
    pub fn with_calibration(mut self, baseline_micros_per_quantum: f64) -> Self {
        self.calibrate = true;
        self.baseline_micros_per_quantum = baseline_micros_per_quantum.max(f64::EPSILON);
        self
    }

    /// Observed runs for `key` so far.
    pub fn runs(&self, key: &str) -> u64 {
        self.observed.lock().get(key).map(|o| o.runs).unwrap_or(0)
    }

    fn calibration(&self, key: &str) -> f64 {
        if !self.calibrate {
            return 1.0;
        }
        let obs = self.observed.lock().get(key).copied().unwrap_or_default();
        if obs.runs == 0 || obs.quanta == 0 {
            return 1.0;
        }
        let rate = obs.micros as f64 / obs.quanta as f64;
        (rate / self.baseline_micros_per_quantum).clamp(0.1, 10.0)
    }
}

impl Default for LinearLoadEstimator {
    fn default() -> Self {
        Self::new(1.0, 1.0)
    }
}

impl fmt::Debug for LinearLoadEstimator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LinearLoadEstimator")
            .field("startup", &self.startup)
            .field("cpu_per_quantum", &self.cpu_per_quantum)
            .field("io_per_quantum", &self.io_per_quantum)
            .field("network_per_quantum", &self.network_per_quantum)
            .field("calibrate", &self.calibrate)
            .finish()
    }
}

fn work(key: &str, n: f64) -> f64 {
    match key {
        "transform.sort" => n * n.max(2.0).log2(),
        "transform.group_by" | "transform.reduce_by" | "transform.distinct" => 1.5 * n,
        _ => n,
    }
}

impl LoadEstimator for LinearLoadEstimator {
    fn estimate(&self, key: &str, _platform: &PlatformId, stats: &InputStatistics) -> CostEstimate {
        // Sources have no inputs; charge them for what they emit.
        let n = if stats.inputs.is_empty() {
            stats.output.point()
        } else {
            stats.total_input()
        };
        CostEstimate {
            cpu: self.startup + self.cpu_per_quantum * work(key, n) * self.calibration(key),
            io: self.io_per_quantum * n,
            network: self.network_per_quantum * n,
        }
    }

    fn update(&self, observed: &ObservedCost) {
        let mut map = self.observed.lock();
        let entry = map.entry(observed.key.clone()).or_default();
        entry.runs += 1;
        entry.quanta += observed.input_quanta.max(observed.output_quanta);
        entry.micros += observed.elapsed.as_micros();
        tracing::trace!(
            key = %observed.key,
            platform = %observed.platform,
            runs = entry.runs,
            "estimator observation"
        );
    }
}

/// Estimators keyed by (operator key, platform).
pub struct EstimatorRegistry {
    by_key: RwLock<HashMap<(String, PlatformId), Arc<dyn LoadEstimator>>>,
    default: Arc<dyn LoadEstimator>,
}

impl EstimatorRegistry {
    pub fn new(default: Arc<dyn LoadEstimator>) -> Self {
        Self {
            by_key: RwLock::new(HashMap::new()),
            default,
        }
    }

    pub fn register(
        &self,
        key: impl Into<String>,
        platform: impl Into<PlatformId>,
        estimator: Arc<dyn LoadEstimator>,
    ) {
        self.by_key
            .write()
            .insert((key.into(), platform.into()), estimator);
    }

    /// Pick the estimator for `key` on `platform`.
    ///
    /// `platform_own` is what the platform offers for this key, if anything.
    pub fn resolve(
        &self,
        key: &str,
        platform: &PlatformId,
        platform_own: Option<Arc<dyn LoadEstimator>>,
    ) -> Arc<dyn LoadEstimator> {
        if let Some(e) = self.by_key.read().get(&(key.to_string(), platform.clone())) {
            return Arc::clone(e);
        }
        platform_own.unwrap_or_else(|| Arc::clone(&self.default))
    }

    pub fn default_estimator(&self) -> Arc<dyn LoadEstimator> {
        Arc::clone(&self.default)
    }
}

impl Default for EstimatorRegistry {
    fn default() -> Self {
        Self::new(Arc::new(LinearLoadEstimator::default()))
    }
}

impl fmt::Debug for EstimatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EstimatorRegistry")
            .field("registered", &self.by_key.read().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::estimate::CardinalityEstimate;
    use polyplan_core::id::OperatorId;
    use std::time::Duration;

    fn stats(n: u64) -> InputStatistics {
        InputStatistics::new(vec![CardinalityEstimate::exact(n)], CardinalityEstimate::exact(n))
    }

    #[test]
    fn cost_grows_with_input() {
        let e = LinearLoadEstimator::new(5.0, 2.0);
        let p = PlatformId::new("p");
        let small = e.estimate("transform.map", &p, &stats(10)).total();
        let large = e.estimate("transform.map", &p, &stats(1000)).total();
        assert!(small < large);
        assert_eq!(small, 5.0 + 20.0);
        assert!(e.estimate("transform.sort", &p, &stats(1000)).total() > large);
    }

    #[test]
    fn calibration_tracks_observed_rate() {
        let e = LinearLoadEstimator::new(0.0, 1.0).with_calibration(1.0);
        let p = PlatformId::new("p");
        let before = e.estimate("transform.map", &p, &stats(100)).cpu;
        e.update(&ObservedCost {
            operator: OperatorId::new(0),
            key: "transform.map".into(),
            platform: p.clone(),
            input_quanta: 100,
            output_quanta: 100,
            elapsed: Duration::from_micros(400),
        });
        let after = e.estimate("transform.map", &p, &stats(100)).cpu;
        assert_eq!(e.runs("transform.map"), 1);
        assert_eq!(after, before * 4.0);
    }

    #[test]
    fn registry_prefers_explicit_then_platform_then_default() {
        let reg = EstimatorRegistry::default();
        let p = PlatformId::new("spark");
        let own: Arc<dyn LoadEstimator> = Arc::new(LinearLoadEstimator::new(100.0, 0.0));
        let explicit: Arc<dyn LoadEstimator> = Arc::new(LinearLoadEstimator::new(7.0, 0.0));
        let s = stats(1);

        let got = reg.resolve("transform.map", &p, None);
        assert_eq!(got.estimate("transform.map", &p, &s).total(), 2.0);

        let got = reg.resolve("transform.map", &p, Some(Arc::clone(&own)));
        assert_eq!(got.estimate("transform.map", &p, &s).total(), 100.0);

        reg.register("transform.map", "spark", explicit);
        let got = reg.resolve("transform.map", &p, Some(own));
        assert_eq!(got.estimate("transform.map", &p, &s).total(), 7.0);
    }
}
