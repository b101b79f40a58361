//! Estimate value types.

use std::ops::{Add, AddAssign};
use std::time::Duration;

use polyplan_core::id::{OperatorId, PlatformId};
use serde::{Deserialize, Serialize};

/// Cost of one operator execution or one channel conversion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CostEstimate {
    pub cpu: f64,
    pub io: f64,
    pub network: f64,
}

impl CostEstimate {
    pub const ZERO: CostEstimate = CostEstimate {
        cpu: 0.0,
        io: 0.0,
        network: 0.0,
    };

    pub fn cpu(cpu: f64) -> Self {
        Self {
            cpu,
            ..Self::ZERO
        }
    }

    pub fn total(&self) -> f64 {
        self.cpu + self.io + self.network
    }

    pub fn scale(&self, factor: f64) -> Self {
        Self {
            cpu: self.cpu * factor,
            io: self.io * factor,
            network: self.network * factor,
        }
    }
}

impl Add for CostEstimate {
    type Output = CostEstimate;

    fn add(self, rhs: Self) -> Self {
        Self {
            cpu: self.cpu + rhs.cpu,
            io: self.io + rhs.io,
            network: self.network + rhs.network,
        }
    }
}

impl AddAssign for CostEstimate {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Interval estimate of a quanta count with a confidence in `[0, 1]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CardinalityEstimate {
    pub lower: u64,
    pub upper: u64,
    pub confidence: f64,
}

impl CardinalityEstimate {
    pub fn exact(n: u64) -> Self {
        Self {
            lower: n,
            upper: n,
            confidence: 1.0,
        }
    }

    pub fn new(lower: u64, upper: u64, confidence: f64) -> Self {
        Self {
            lower: lower.min(upper),
            upper: upper.max(lower),
            confidence: confidence.clamp(0.0, 1.0),
        }
    }

    /// Nothing known.
    pub fn unknown() -> Self {
        Self::new(0, 1_000, 0.0)
    }

    /// Single representative value.
    pub fn point(&self) -> f64 {
        (self.lower as f64 + self.upper as f64) / 2.0
    }

    /// Scale both bounds; confidence drops with every heuristic applied.
    pub fn scale(&self, factor: f64, confidence_penalty: f64) -> Self {
        let f = factor.max(0.0);
        Self::new(
            (self.lower as f64 * f).floor() as u64,
            (self.upper as f64 * f).ceil() as u64,
            self.confidence * confidence_penalty,
        )
    }

    pub fn plus(&self, other: &Self) -> Self {
        Self::new(
            self.lower.saturating_add(other.lower),
            self.upper.saturating_add(other.upper),
            self.confidence.min(other.confidence),
        )
    }

    /// Ratio by which `observed` deviates from this estimate (always >= 1).
    pub fn deviation(&self, observed: u64) -> f64 {
        let est = self.point().max(1.0);
        let obs = (observed as f64).max(1.0);
        if est > obs {
            est / obs
        } else {
            obs / est
        }
    }
}

impl Default for CardinalityEstimate {
    fn default() -> Self {
        Self::unknown()
    }
}

/// What an estimator is told about an operator's inputs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputStatistics {
    /// One estimate per input slot, in slot order.
    pub inputs: Vec<CardinalityEstimate>,
    /// Estimated output size.
    pub output: CardinalityEstimate,
}

impl InputStatistics {
    pub fn new(inputs: Vec<CardinalityEstimate>, output: CardinalityEstimate) -> Self {
        Self { inputs, output }
    }

    pub fn total_input(&self) -> f64 {
        self.inputs.iter().map(|c| c.point()).sum()
    }
}

/// What actually happened when an operator ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservedCost {
    pub operator: OperatorId,
    pub key: String,
    pub platform: PlatformId,
    pub input_quanta: u64,
    pub output_quanta: u64,
    pub elapsed: Duration,
}
