//! The optimizer's output.
//!
//! Everything is keyed by id in `BTreeMap`s so equal assignments serialize
//! (and hash) identically.

use std::collections::{BTreeMap, BTreeSet};

use polyplan_core::channel::ChannelKind;
use polyplan_core::hash::{hash_serde, Hash256};
use polyplan_core::id::{ChannelId, OperatorId, PlatformId, SegmentId, SlotRef};
use polyplan_cost::{CardinalityEstimate, CostEstimate};
use polyplan_platform::ConversionPath;
use serde::Serialize;

use crate::error::OptimizerError;

/// How one consumer receives a channel's data.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConsumerRoute {
    pub consumer: SlotRef,
    /// Identity path when the produced kind is read natively.
    pub path: ConversionPath,
}

impl ConsumerRoute {
    pub fn is_native(&self) -> bool {
        self.path.is_identity()
    }

    /// Kind the consumer actually reads.
    pub fn kind(&self) -> ChannelKind {
        self.path.to
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelPlan {
    pub channel: ChannelId,
    /// Kind the producer writes.
    pub produced: ChannelKind,
    /// One route per consumer, in the channel's consumer order.
    pub routes: Vec<ConsumerRoute>,
    pub cost: CostEstimate,
}

impl ChannelPlan {
    pub fn route_for(&self, consumer: SlotRef) -> Option<&ConsumerRoute> {
        self.routes.iter().find(|r| r.consumer == consumer)
    }

    pub fn needs_conversion(&self) -> bool {
        self.routes.iter().any(|r| !r.is_native())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Segment {
    pub id: SegmentId,
    pub platform: PlatformId,
    pub operators: BTreeSet<OperatorId>,
    /// All members sit outside any loop body.
    pub top_level: bool,
}

/// Precomputed alternative for one segment.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FallbackPlan {
    pub segment: SegmentId,
    pub platform: PlatformId,
    /// Replacement plans for every channel touching the segment.
    pub channels: BTreeMap<ChannelId, ChannelPlan>,
    pub cost: CostEstimate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SearchStrategy {
    Exhaustive { explored: u64 },
    Greedy,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionAssignment {
    pub platforms: BTreeMap<OperatorId, PlatformId>,
    pub channels: BTreeMap<ChannelId, ChannelPlan>,
    pub segments: Vec<Segment>,
    pub fallbacks: BTreeMap<SegmentId, FallbackPlan>,
    pub operator_costs: BTreeMap<OperatorId, CostEstimate>,
    pub cardinalities: BTreeMap<OperatorId, CardinalityEstimate>,
    pub total_cost: CostEstimate,
    pub strategy: SearchStrategy,
}

impl ExecutionAssignment {
    pub fn platform_of(&self, op: OperatorId) -> Option<&PlatformId> {
        self.platforms.get(&op)
    }

    pub fn channel_plan(&self, channel: ChannelId) -> Option<&ChannelPlan> {
        self.channels.get(&channel)
    }

    pub fn segment_of(&self, op: OperatorId) -> Option<&Segment> {
        self.segments.iter().find(|s| s.operators.contains(&op))
    }

    pub fn segment(&self, id: SegmentId) -> Option<&Segment> {
        self.segments.iter().find(|s| s.id == id)
    }

    pub fn fallback_for(&self, segment: SegmentId) -> Option<&FallbackPlan> {
        self.fallbacks.get(&segment)
    }

    pub fn distinct_platforms(&self) -> BTreeSet<&PlatformId> {
        self.platforms.values().collect()
    }

    pub fn conversions(&self) -> usize {
        self.channels
            .values()
            .flat_map(|c| c.routes.iter())
            .filter(|r| !r.is_native())
            .count()
    }

    /// This assignment with `segment` moved onto its fallback platform.
    ///
    /// The fallback is consumed: the returned assignment has none for that
    /// segment, so a segment is replayed at most once.
    pub fn with_fallback(&self, segment: SegmentId) -> Option<ExecutionAssignment> {
        let fb = self.fallbacks.get(&segment)?;
        let seg = self.segment(segment)?;
        let mut next = self.clone();
        for op in &seg.operators {
            next.platforms.insert(*op, fb.platform.clone());
        }
        for (ch, plan) in &fb.channels {
            next.channels.insert(*ch, plan.clone());
        }
        for s in next.segments.iter_mut() {
            if s.id == segment {
                s.platform = fb.platform.clone();
            }
        }
        next.fallbacks.remove(&segment);
        Some(next)
    }

    pub fn fingerprint(&self) -> Result<Hash256, OptimizerError> {
        hash_serde(self).map_err(|e| OptimizerError::Hash(e.to_string()))
    }
}
