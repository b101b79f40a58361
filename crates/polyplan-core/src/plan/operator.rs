//! Operators: the nodes of a plan.
//!
//! Every operator is one variant of the closed `OperatorKind` union. Platforms
//! decide what they can run by looking at `OperatorKind::key()`, so there is no
//! per-platform operator type hierarchy.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::id::{ChannelId, LoopId, OperatorId, PlatformId};
use crate::types::{DataUnitType, Quantum, SlotType};

pub type MapFn = Arc<dyn Fn(&Quantum) -> Quantum + Send + Sync>;
/// A map that also receives the number of loop iterations completed so far
/// (0 outside loops).
pub type IterationMapFn = Arc<dyn Fn(&Quantum, usize) -> Quantum + Send + Sync>;
pub type FlatMapFn = Arc<dyn Fn(&Quantum) -> Vec<Quantum> + Send + Sync>;
pub type PredicateFn = Arc<dyn Fn(&Quantum) -> bool + Send + Sync>;
pub type KeyFn = Arc<dyn Fn(&Quantum) -> Quantum + Send + Sync>;
pub type ReduceFn = Arc<dyn Fn(&Quantum, &Quantum) -> Quantum + Send + Sync>;

#[derive(Clone)]
pub enum Source {
    /// Quanta supplied by the caller.
    Collection(Arc<Vec<Quantum>>),
}

#[derive(Clone)]
pub enum Transform {
    Map(MapFn),
    IterationMap(IterationMapFn),
    FlatMap {
        f: FlatMapFn,
        /// Average number of outputs per input, if known.
        expansion: Option<f64>,
    },
    Filter {
        predicate: PredicateFn,
        /// Fraction of quanta expected to pass, if known.
        selectivity: Option<f64>,
    },
    GroupBy(KeyFn),
    ReduceBy {
        key: KeyFn,
        reduce: ReduceFn,
    },
    /// Concatenates its two inputs (slot 0 first).
    Union,
    Distinct,
    Count,
    Sort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sink {
    /// Hands all received quanta back to the caller.
    Collect,
}

#[derive(Clone)]
pub enum OperatorKind {
    Source(Source),
    Transform(Transform),
    Sink(Sink),
    LoopHead(LoopId),
    LoopBody { loop_id: LoopId, transform: Transform },
    LoopOutput(LoopId),
}

/// Coarse classification of an operator kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum KindTag {
    Source,
    Transform,
    Sink,
    LoopHead,
    LoopBody,
    LoopOutput,
}

impl Transform {
    pub fn key(&self) -> &'static str {
        match self {
            Transform::Map(_) | Transform::IterationMap(_) => "transform.map",
            Transform::FlatMap { .. } => "transform.flat_map",
            Transform::Filter { .. } => "transform.filter",
            Transform::GroupBy(_) => "transform.group_by",
            Transform::ReduceBy { .. } => "transform.reduce_by",
            Transform::Union => "transform.union",
            Transform::Distinct => "transform.distinct",
            Transform::Count => "transform.count",
            Transform::Sort => "transform.sort",
        }
    }

    pub fn arity(&self) -> usize {
        match self {
            Transform::Union => 2,
            _ => 1,
        }
    }
}

impl fmt::Debug for Transform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

impl fmt::Debug for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Source::Collection(items) => write!(f, "Collection({} quanta)", items.len()),
        }
    }
}

impl OperatorKind {
    /// Stable key used to index estimators and platform capability tables.
    pub fn key(&self) -> &'static str {
        match self {
            OperatorKind::Source(Source::Collection(_)) => "source.collection",
            OperatorKind::Transform(t) => t.key(),
            OperatorKind::LoopBody { transform, .. } => transform.key(),
            OperatorKind::Sink(Sink::Collect) => "sink.collect",
            OperatorKind::LoopHead(_) => "loop.head",
            OperatorKind::LoopOutput(_) => "loop.output",
        }
    }

    pub fn tag(&self) -> KindTag {
        match self {
            OperatorKind::Source(_) => KindTag::Source,
            OperatorKind::Transform(_) => KindTag::Transform,
            OperatorKind::Sink(_) => KindTag::Sink,
            OperatorKind::LoopHead(_) => KindTag::LoopHead,
            OperatorKind::LoopBody { .. } => KindTag::LoopBody,
            OperatorKind::LoopOutput(_) => KindTag::LoopOutput,
        }
    }

    /// The transform this operator applies, whether or not it sits in a loop body.
    pub fn transform(&self) -> Option<&Transform> {
        match self {
            OperatorKind::Transform(t) | OperatorKind::LoopBody { transform: t, .. } => Some(t),
            _ => None,
        }
    }

    pub fn is_loop_control(&self) -> bool {
        matches!(self, OperatorKind::LoopHead(_) | OperatorKind::LoopOutput(_))
    }
}

impl fmt::Debug for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperatorKind::Source(s) => write!(f, "Source({s:?})"),
            OperatorKind::Transform(t) => write!(f, "Transform({t:?})"),
            OperatorKind::Sink(s) => write!(f, "Sink({s:?})"),
            OperatorKind::LoopHead(l) => write!(f, "LoopHead({l})"),
            OperatorKind::LoopBody { loop_id, transform } => {
                write!(f, "LoopBody({loop_id}, {transform:?})")
            }
            OperatorKind::LoopOutput(l) => write!(f, "LoopOutput({l})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct InputSlot {
    pub name: &'static str,
    pub ty: SlotType,
    pub optional: bool,
    pub channel: Option<ChannelId>,
}

#[derive(Debug, Clone)]
pub struct OutputSlot {
    pub name: &'static str,
    pub ty: SlotType,
    pub channel: Option<ChannelId>,
}

fn input(name: &'static str, ty: SlotType) -> InputSlot {
    InputSlot {
        name,
        ty,
        optional: false,
        channel: None,
    }
}

fn output(name: &'static str, ty: SlotType) -> OutputSlot {
    OutputSlot {
        name,
        ty,
        channel: None,
    }
}

/// One node of a plan.
#[derive(Debug, Clone)]
pub struct Operator {
    pub(crate) id: OperatorId,
    pub(crate) name: Option<String>,
    pub(crate) kind: OperatorKind,
    pub(crate) inputs: Vec<InputSlot>,
    pub(crate) outputs: Vec<OutputSlot>,
    pub(crate) target_platforms: BTreeSet<PlatformId>,
    pub(crate) fixed_platform: Option<PlatformId>,
    pub(crate) declared_cardinality: Option<u64>,
}

impl Operator {
    pub(crate) fn new(kind: OperatorKind, inputs: Vec<InputSlot>, outputs: Vec<OutputSlot>) -> Self {
        Self {
            id: OperatorId::new(0),
            name: None,
            kind,
            inputs,
            outputs,
            target_platforms: BTreeSet::new(),
            fixed_platform: None,
            declared_cardinality: None,
        }
    }

    // ----- constructors for the built-in kinds -----

    pub fn collection_source(items: Vec<Quantum>, unit: DataUnitType) -> Self {
        let n = items.len() as u64;
        let mut op = Self::new(
            OperatorKind::Source(Source::Collection(Arc::new(items))),
            vec![],
            vec![output("out", SlotType::single(unit))],
        );
        op.declared_cardinality = Some(n);
        op
    }

    pub fn map<F>(in_unit: DataUnitType, out_unit: DataUnitType, f: F) -> Self
    where
        F: Fn(&Quantum) -> Quantum + Send + Sync + 'static,
    {
        Self::transform(
            Transform::Map(Arc::new(f)),
            SlotType::single(in_unit),
            SlotType::single(out_unit),
        )
    }

    /// Like [`Operator::map`], but `f` also gets the current iteration when
    /// run inside a loop body.
    pub fn map_with_iteration<F>(in_unit: DataUnitType, out_unit: DataUnitType, f: F) -> Self
    where
        F: Fn(&Quantum, usize) -> Quantum + Send + Sync + 'static,
    {
        Self::transform(
            Transform::IterationMap(Arc::new(f)),
            SlotType::single(in_unit),
            SlotType::single(out_unit),
        )
    }

    pub fn flat_map<F>(in_unit: DataUnitType, out_unit: DataUnitType, f: F) -> Self
    where
        F: Fn(&Quantum) -> Vec<Quantum> + Send + Sync + 'static,
    {
        Self::transform(
            Transform::FlatMap {
                f: Arc::new(f),
                expansion: None,
            },
            SlotType::single(in_unit),
            SlotType::single(out_unit),
        )
    }

    pub fn filter<F>(unit: DataUnitType, predicate: F) -> Self
    where
        F: Fn(&Quantum) -> bool + Send + Sync + 'static,
    {
        let ty = SlotType::single(unit);
        Self::transform(
            Transform::Filter {
                predicate: Arc::new(predicate),
                selectivity: None,
            },
            ty,
            ty,
        )
    }

    pub fn group_by<F>(unit: DataUnitType, key: F) -> Self
    where
        F: Fn(&Quantum) -> Quantum + Send + Sync + 'static,
    {
        Self::transform(
            Transform::GroupBy(Arc::new(key)),
            SlotType::single(unit),
            SlotType::grouped(unit),
        )
    }

    pub fn reduce_by<K, R>(unit: DataUnitType, key: K, reduce: R) -> Self
    where
        K: Fn(&Quantum) -> Quantum + Send + Sync + 'static,
        R: Fn(&Quantum, &Quantum) -> Quantum + Send + Sync + 'static,
    {
        let ty = SlotType::single(unit);
        Self::transform(
            Transform::ReduceBy {
                key: Arc::new(key),
                reduce: Arc::new(reduce),
            },
            ty,
            ty,
        )
    }

    pub fn union(unit: DataUnitType) -> Self {
        let ty = SlotType::single(unit);
        Self::new(
            OperatorKind::Transform(Transform::Union),
            vec![input("in0", ty), input("in1", ty)],
            vec![output("out", ty)],
        )
    }

    pub fn distinct(unit: DataUnitType) -> Self {
        let ty = SlotType::single(unit);
        Self::transform(Transform::Distinct, ty, ty)
    }

    pub fn sort(unit: DataUnitType) -> Self {
        let ty = SlotType::single(unit);
        Self::transform(Transform::Sort, ty, ty)
    }

    pub fn count(in_type: SlotType) -> Self {
        Self::transform(Transform::Count, in_type, SlotType::single(DataUnitType::Int))
    }

    pub fn collect_sink(in_type: SlotType) -> Self {
        Self::new(
            OperatorKind::Sink(Sink::Collect),
            vec![input("in", in_type)],
            vec![],
        )
    }

    /// Any single-input transform with explicit slot types.
    pub fn transform(transform: Transform, in_type: SlotType, out_type: SlotType) -> Self {
        Self::new(
            OperatorKind::Transform(transform),
            vec![input("in", in_type)],
            vec![output("out", out_type)],
        )
    }

    pub(crate) fn loop_head(loop_id: LoopId, state: SlotType) -> Self {
        Self::new(
            OperatorKind::LoopHead(loop_id),
            vec![input("initial", state), input("feedback", state)],
            vec![output("iteration", state), output("final", state)],
        )
    }

    pub(crate) fn loop_output(loop_id: LoopId, state: SlotType) -> Self {
        Self::new(
            OperatorKind::LoopOutput(loop_id),
            vec![input("in", state)],
            vec![output("out", state)],
        )
    }

    // ----- builder-style modifiers -----

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Restrict the platforms this operator may run on. Empty means any.
    pub fn with_target_platform(mut self, platform: impl Into<PlatformId>) -> Self {
        self.target_platforms.insert(platform.into());
        self
    }

    /// Force this operator onto one platform.
    pub fn with_fixed_platform(mut self, platform: impl Into<PlatformId>) -> Self {
        self.fixed_platform = Some(platform.into());
        self
    }

    /// Declare the expected number of output quanta.
    pub fn with_cardinality(mut self, quanta: u64) -> Self {
        self.declared_cardinality = Some(quanta);
        self
    }

    /// Declare filter selectivity or flat-map expansion; ignored by other kinds.
    pub fn with_selectivity(mut self, factor: f64) -> Self {
        match &mut self.kind {
            OperatorKind::Transform(Transform::Filter { selectivity, .. }) => {
                *selectivity = Some(factor)
            }
            OperatorKind::Transform(Transform::FlatMap { expansion, .. }) => {
                *expansion = Some(factor)
            }
            _ => {}
        }
        self
    }

    pub fn mark_input_optional(mut self, index: usize) -> Self {
        if let Some(slot) = self.inputs.get_mut(index) {
            slot.optional = true;
        }
        self
    }

    // ----- accessors -----

    pub fn id(&self) -> OperatorId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Name if set, otherwise a stable rendering of the id.
    pub fn display_name(&self) -> String {
        match &self.name {
            Some(n) => n.clone(),
            None => format!("op{}", self.id.get()),
        }
    }

    pub fn kind(&self) -> &OperatorKind {
        &self.kind
    }

    pub fn key(&self) -> &'static str {
        self.kind.key()
    }

    pub fn inputs(&self) -> &[InputSlot] {
        &self.inputs
    }

    pub fn outputs(&self) -> &[OutputSlot] {
        &self.outputs
    }

    pub fn target_platforms(&self) -> &BTreeSet<PlatformId> {
        &self.target_platforms
    }

    pub fn fixed_platform(&self) -> Option<&PlatformId> {
        self.fixed_platform.as_ref()
    }

    pub fn declared_cardinality(&self) -> Option<u64> {
        self.declared_cardinality
    }

    pub fn is_source(&self) -> bool {
        matches!(self.kind, OperatorKind::Source(_))
    }

    pub fn is_sink(&self) -> bool {
        matches!(self.kind, OperatorKind::Sink(_))
    }

    /// Is `platform` allowed by this operator's own restrictions?
    pub fn permits(&self, platform: &PlatformId) -> bool {
        if let Some(fixed) = &self.fixed_platform {
            if fixed != platform {
                return false;
            }
        }
        self.target_platforms.is_empty() || self.target_platforms.contains(platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sources_and_sinks_have_one_sided_slots() {
        let src = Operator::collection_source(vec![Quantum::Int(1)], DataUnitType::Int);
        assert!(src.inputs().is_empty());
        assert_eq!(src.outputs().len(), 1);
        assert_eq!(src.declared_cardinality(), Some(1));

        let sink = Operator::collect_sink(SlotType::single(DataUnitType::Int));
        assert!(sink.outputs().is_empty());
        assert_eq!(sink.key(), "sink.collect");
    }

    #[test]
    fn fixed_platform_overrides_permitted_set() {
        let op = Operator::distinct(DataUnitType::Str)
            .with_target_platform("java")
            .with_target_platform("spark")
            .with_fixed_platform("spark");
        assert!(op.permits(&PlatformId::new("spark")));
        assert!(!op.permits(&PlatformId::new("java")));
    }

    #[test]
    fn selectivity_applies_to_filters_only() {
        let op = Operator::filter(DataUnitType::Int, |_| true).with_selectivity(0.2);
        match op.kind() {
            OperatorKind::Transform(Transform::Filter { selectivity, .. }) => {
                assert_eq!(*selectivity, Some(0.2))
            }
            other => panic!("unexpected kind {other:?}"),
        }
        assert_eq!(Operator::union(DataUnitType::Int).inputs().len(), 2);
    }
}
