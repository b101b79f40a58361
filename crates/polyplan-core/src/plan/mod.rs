//! The operator/channel plan.
//!
//! A `Plan` is built incrementally: add operators, connect output slots to input
//! slots, declare loops, then `validate()`. Channels are created implicitly by
//! `connect`: one channel per producing output slot, extended with one consumer
//! per additional `connect` from the same slot.
//!
//! Everything is kept in `BTreeMap`s keyed by id so iteration order (and thus
//! optimization and fingerprints) is deterministic.

mod looping;
mod operator;
mod validate;

use std::collections::{BTreeMap, BTreeSet};

use serde::Serialize;

pub use looping::{
    ConvergenceFn, LoopDef, LoopHandle, LoopSpec, LoopState, HEAD_FEEDBACK, HEAD_FINAL,
    HEAD_INITIAL, HEAD_ITERATION,
};
pub use operator::{
    FlatMapFn, InputSlot, IterationMapFn, KeyFn, KindTag, MapFn, Operator, OperatorKind, OutputSlot, PredicateFn,
    ReduceFn, Sink, Source, Transform,
};

use crate::error::{Error, PlanError, SlotSide};
use crate::hash::{hash_serde, Hash256};
use crate::id::{ChannelId, LoopId, OperatorId, PlatformId, SlotRef};
use crate::types::SlotType;

/// One producing output slot feeding one or more consuming input slots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Channel {
    pub id: ChannelId,
    pub producer: SlotRef,
    pub consumers: Vec<SlotRef>,
    pub ty: SlotType,
}

#[derive(Debug, Clone, Default)]
pub struct Plan {
    name: Option<String>,
    operators: BTreeMap<OperatorId, Operator>,
    channels: BTreeMap<ChannelId, Channel>,
    loops: BTreeMap<LoopId, LoopSpec>,
    names: BTreeMap<String, OperatorId>,
    next_operator: u64,
    next_channel: u64,
    next_loop: u64,
    fallback: bool,
}

impl Plan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Give the job a name (shows up in logs and the manifest).
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Ask the optimizer to precompute fallback platforms per segment.
    pub fn with_fallback(mut self) -> Self {
        self.fallback = true;
        self
    }

    pub fn fallback_enabled(&self) -> bool {
        self.fallback
    }

    // ----- construction -----

    pub fn add(&mut self, op: Operator) -> Result<OperatorId, PlanError> {
        let id = self.alloc_operator();
        self.insert(id, op)
    }

    fn alloc_operator(&mut self) -> OperatorId {
        let id = OperatorId::new(self.next_operator);
        self.next_operator += 1;
        id
    }

    fn insert(&mut self, id: OperatorId, mut op: Operator) -> Result<OperatorId, PlanError> {
        if let Some(name) = &op.name {
            if self.names.contains_key(name) {
                return Err(PlanError::DuplicateName(name.clone()));
            }
            self.names.insert(name.clone(), id);
        }
        op.id = id;
        self.operators.insert(id, op);
        Ok(id)
    }

    /// Connect output slot `out_slot` of `from` to input slot `in_slot` of `to`.
    pub fn connect(
        &mut self,
        from: OperatorId,
        out_slot: usize,
        to: OperatorId,
        in_slot: usize,
    ) -> Result<ChannelId, PlanError> {
        let producer = SlotRef::new(from, out_slot);
        let consumer = SlotRef::new(to, in_slot);

        let out = self.output_slot(producer)?.clone();
        let inp = self.input_slot(consumer)?;
        if inp.channel.is_some() {
            return Err(PlanError::SlotOccupied(consumer));
        }
        if !out.ty.compatible_with(&inp.ty) {
            return Err(PlanError::SlotTypeMismatch {
                producer,
                consumer,
                produced: out.ty.to_string(),
                expected: inp.ty.to_string(),
            });
        }

        let channel_id = match out.channel {
            Some(id) => id,
            None => {
                let id = ChannelId::new(self.next_channel);
                self.next_channel += 1;
                self.channels.insert(
                    id,
                    Channel {
                        id,
                        producer,
                        consumers: Vec::new(),
                        ty: out.ty,
                    },
                );
                if let Some(op) = self.operators.get_mut(&from) {
                    op.outputs[out_slot].channel = Some(id);
                }
                id
            }
        };

        if let Some(ch) = self.channels.get_mut(&channel_id) {
            ch.consumers.push(consumer);
        }
        if let Some(op) = self.operators.get_mut(&to) {
            op.inputs[in_slot].channel = Some(channel_id);
        }
        Ok(channel_id)
    }

    /// `connect(from, 0, to, 0)`.
    pub fn pipe(&mut self, from: OperatorId, to: OperatorId) -> Result<ChannelId, PlanError> {
        self.connect(from, 0, to, 0)
    }

    /// Create a loop head and output, connected head.final -> output.
    pub fn add_loop(&mut self, def: LoopDef) -> Result<LoopHandle, PlanError> {
        if let Some(parent) = def.parent {
            if !self.loops.contains_key(&parent) {
                return Err(PlanError::UnknownLoop(parent));
            }
        }
        let output_name = format!("{}.output", def.name);
        for name in [&def.name, &output_name] {
            if self.names.contains_key(name) {
                return Err(PlanError::DuplicateName(name.clone()));
            }
        }
        let loop_id = LoopId::new(self.next_loop);
        self.next_loop += 1;

        let head = self.add(Operator::loop_head(loop_id, def.state_type).named(def.name.clone()))?;
        let output = self.add(Operator::loop_output(loop_id, def.state_type).named(output_name))?;
        self.connect(head, HEAD_FINAL, output, 0)?;

        self.loops.insert(
            loop_id,
            LoopSpec {
                id: loop_id,
                name: def.name,
                head,
                output,
                parent: def.parent,
                entry: None,
                exit: None,
                state_type: def.state_type,
                expected_iterations: def.expected_iterations,
                converged: def.converged,
            },
        );
        Ok(LoopHandle {
            id: loop_id,
            head,
            output,
        })
    }

    /// Add a transform to the body of `loop_id`.
    pub fn add_to_loop(&mut self, loop_id: LoopId, op: Operator) -> Result<OperatorId, PlanError> {
        if !self.loops.contains_key(&loop_id) {
            return Err(PlanError::UnknownLoop(loop_id));
        }
        let id = self.alloc_operator();
        let Operator {
            name,
            kind,
            inputs,
            outputs,
            target_platforms,
            fixed_platform,
            declared_cardinality,
            ..
        } = op;
        let transform = match kind {
            OperatorKind::Transform(t) => t,
            other => {
                return Err(PlanError::NotALoopBody {
                    operator: id,
                    reason: format!("only transforms can be loop body members, got {other:?}"),
                })
            }
        };
        let body = Operator {
            id,
            name,
            kind: OperatorKind::LoopBody { loop_id, transform },
            inputs,
            outputs,
            target_platforms,
            fixed_platform,
            declared_cardinality,
        };
        self.insert(id, body)
    }

    /// Declare the body's entry and exit and wire the loop's internal channels.
    pub fn close_loop(
        &mut self,
        loop_id: LoopId,
        entry: OperatorId,
        exit: OperatorId,
    ) -> Result<(), PlanError> {
        let spec = self.loops.get(&loop_id).ok_or(PlanError::UnknownLoop(loop_id))?;
        if spec.is_closed() {
            return Err(PlanError::InvalidLoop {
                loop_id,
                reason: "loop is already closed".into(),
            });
        }
        let head = spec.head;
        for op in [entry, exit] {
            if self.scope_of(op)? != Some(loop_id) {
                return Err(PlanError::NotALoopBody {
                    operator: op,
                    reason: format!("not a member of {loop_id}"),
                });
            }
        }
        self.connect(head, HEAD_ITERATION, entry, 0)?;
        self.connect(exit, 0, head, HEAD_FEEDBACK)?;
        if let Some(spec) = self.loops.get_mut(&loop_id) {
            spec.entry = Some(entry);
            spec.exit = Some(exit);
        }
        Ok(())
    }

    // ----- lookups -----

    pub fn operator(&self, id: OperatorId) -> Option<&Operator> {
        self.operators.get(&id)
    }

    pub(crate) fn try_operator(&self, id: OperatorId) -> Result<&Operator, PlanError> {
        self.operators.get(&id).ok_or(PlanError::UnknownOperator(id))
    }

    pub fn operator_by_name(&self, name: &str) -> Option<&Operator> {
        self.names.get(name).and_then(|id| self.operators.get(id))
    }

    /// Operators in id (declaration) order.
    pub fn operators(&self) -> impl Iterator<Item = &Operator> {
        self.operators.values()
    }

    pub fn operator_ids(&self) -> impl Iterator<Item = OperatorId> + '_ {
        self.operators.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.operators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operators.is_empty()
    }

    pub fn channel(&self, id: ChannelId) -> Option<&Channel> {
        self.channels.get(&id)
    }

    pub fn channels(&self) -> impl Iterator<Item = &Channel> {
        self.channels.values()
    }

    pub fn loop_spec(&self, id: LoopId) -> Option<&LoopSpec> {
        self.loops.get(&id)
    }

    pub fn loops(&self) -> impl Iterator<Item = &LoopSpec> {
        self.loops.values()
    }

    pub fn sinks(&self) -> Vec<OperatorId> {
        self.operators
            .values()
            .filter(|op| op.is_sink())
            .map(|op| op.id)
            .collect()
    }

    pub fn sources(&self) -> Vec<OperatorId> {
        self.operators
            .values()
            .filter(|op| op.is_source())
            .map(|op| op.id)
            .collect()
    }

    pub fn input_channel(&self, op: OperatorId, slot: usize) -> Option<ChannelId> {
        self.operators.get(&op)?.inputs.get(slot)?.channel
    }

    pub fn output_channel(&self, op: OperatorId, slot: usize) -> Option<ChannelId> {
        self.operators.get(&op)?.outputs.get(slot)?.channel
    }

    /// Producers of `op`'s inputs, in slot order, skipping unconnected slots.
    pub fn predecessors(&self, op: OperatorId) -> Vec<OperatorId> {
        let Some(o) = self.operators.get(&op) else {
            return Vec::new();
        };
        o.inputs
            .iter()
            .filter_map(|s| s.channel)
            .filter_map(|c| self.channels.get(&c))
            .map(|c| c.producer.operator)
            .collect()
    }

    /// Consumers of any of `op`'s outputs, deduplicated, in id order.
    pub fn successors(&self, op: OperatorId) -> Vec<OperatorId> {
        let Some(o) = self.operators.get(&op) else {
            return Vec::new();
        };
        let set: BTreeSet<OperatorId> = o
            .outputs
            .iter()
            .filter_map(|s| s.channel)
            .filter_map(|c| self.channels.get(&c))
            .flat_map(|c| c.consumers.iter().map(|s| s.operator))
            .collect();
        set.into_iter().collect()
    }

    /// Is `slot` the feedback input of a loop head?
    pub fn is_feedback_slot(&self, slot: SlotRef) -> bool {
        slot.index == HEAD_FEEDBACK
            && matches!(
                self.operators.get(&slot.operator).map(|o| &o.kind),
                Some(OperatorKind::LoopHead(_))
            )
    }

    // ----- loop scoping -----

    /// The loop whose body `op` belongs to (`None` = top level).
    ///
    /// A loop's own head and output live in the enclosing scope.
    pub fn scope_of(&self, op: OperatorId) -> Result<Option<LoopId>, PlanError> {
        let o = self.try_operator(op)?;
        Ok(match &o.kind {
            OperatorKind::LoopBody { loop_id, .. } => Some(*loop_id),
            OperatorKind::LoopHead(l) | OperatorKind::LoopOutput(l) => {
                self.loops.get(l).ok_or(PlanError::UnknownLoop(*l))?.parent
            }
            _ => None,
        })
    }

    /// Scope data written to an output slot lives in.
    pub fn output_scope(&self, slot: SlotRef) -> Result<Option<LoopId>, PlanError> {
        let o = self.try_operator(slot.operator)?;
        match &o.kind {
            OperatorKind::LoopHead(l) if slot.index == HEAD_ITERATION => Ok(Some(*l)),
            _ => self.scope_of(slot.operator),
        }
    }

    /// Scope data read from an input slot must be visible in.
    pub fn input_scope(&self, slot: SlotRef) -> Result<Option<LoopId>, PlanError> {
        let o = self.try_operator(slot.operator)?;
        match &o.kind {
            OperatorKind::LoopHead(l) if slot.index == HEAD_FEEDBACK => Ok(Some(*l)),
            _ => self.scope_of(slot.operator),
        }
    }

    /// Is scope `inner` equal to or nested inside scope `outer`?
    pub fn is_within(&self, inner: Option<LoopId>, outer: Option<LoopId>) -> bool {
        let Some(outer) = outer else {
            return true;
        };
        let mut cur = inner;
        while let Some(l) = cur {
            if l == outer {
                return true;
            }
            cur = self.loops.get(&l).and_then(|s| s.parent);
        }
        false
    }

    /// Every operator inside the body of `loop_id`, nested loops included.
    pub fn loop_members(&self, loop_id: LoopId) -> Vec<OperatorId> {
        self.operators
            .keys()
            .copied()
            .filter(|op| {
                matches!(self.scope_of(*op), Ok(s @ Some(_)) if self.is_within(s, Some(loop_id)))
            })
            .collect()
    }

    /// Operators whose scope is exactly `scope`.
    pub fn direct_members(&self, scope: Option<LoopId>) -> Vec<OperatorId> {
        self.operators
            .keys()
            .copied()
            .filter(|op| matches!(self.scope_of(*op), Ok(s) if s == scope))
            .collect()
    }

    /// Product of the expected iteration counts of every loop enclosing `op`.
    pub fn iteration_multiplier(&self, op: OperatorId) -> f64 {
        let mut factor = 1.0;
        let mut cur = self.scope_of(op).ok().flatten();
        while let Some(l) = cur {
            match self.loops.get(&l) {
                Some(spec) => {
                    factor *= spec.expected_iterations.max(1) as f64;
                    cur = spec.parent;
                }
                None => break,
            }
        }
        factor
    }

    // ----- ordering & hashing -----

    /// Kahn's algorithm over all channels except loop feedback edges.
    ///
    /// Ties resolve to the lowest operator id, so the order is deterministic.
    pub fn topological_order(&self) -> Result<Vec<OperatorId>, PlanError> {
        let mut indegree: BTreeMap<OperatorId, usize> =
            self.operators.keys().map(|id| (*id, 0)).collect();
        for ch in self.channels.values() {
            for c in &ch.consumers {
                if !self.is_feedback_slot(*c) {
                    *indegree.entry(c.operator).or_insert(0) += 1;
                }
            }
        }

        let mut ready: BTreeSet<OperatorId> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.operators.len());

        while let Some(id) = ready.pop_first() {
            order.push(id);
            let Some(op) = self.operators.get(&id) else {
                continue;
            };
            for slot in &op.outputs {
                let Some(ch) = slot.channel.and_then(|c| self.channels.get(&c)) else {
                    continue;
                };
                for c in &ch.consumers {
                    if self.is_feedback_slot(*c) {
                        continue;
                    }
                    if let Some(d) = indegree.get_mut(&c.operator) {
                        *d -= 1;
                        if *d == 0 {
                            ready.insert(c.operator);
                        }
                    }
                }
            }
        }

        if order.len() != self.operators.len() {
            let placed: BTreeSet<OperatorId> = order.iter().copied().collect();
            let stuck = self
                .operators
                .keys()
                .find(|id| !placed.contains(id))
                .copied()
                .unwrap_or(OperatorId::new(0));
            return Err(PlanError::IllegalCycle { operator: stuck });
        }
        Ok(order)
    }

    /// Deterministic hash of the plan's structure.
    ///
    /// UDF bodies are opaque and do not contribute; two plans differing only in
    /// a closure hash equal.
    pub fn fingerprint(&self) -> Result<Hash256, Error> {
        #[derive(Serialize)]
        struct OpShape<'a> {
            id: OperatorId,
            name: Option<&'a str>,
            key: &'static str,
            inputs: Vec<SlotType>,
            outputs: Vec<SlotType>,
            targets: &'a BTreeSet<PlatformId>,
            fixed: Option<&'a PlatformId>,
            cardinality: Option<u64>,
        }
        #[derive(Serialize)]
        struct LoopShape {
            id: LoopId,
            head: OperatorId,
            output: OperatorId,
            parent: Option<LoopId>,
            entry: Option<OperatorId>,
            exit: Option<OperatorId>,
            expected: usize,
        }
        #[derive(Serialize)]
        struct PlanShape<'a> {
            ops: Vec<OpShape<'a>>,
            channels: Vec<(ChannelId, SlotRef, &'a [SlotRef])>,
            loops: Vec<LoopShape>,
            fallback: bool,
        }

        let shape = PlanShape {
            ops: self
                .operators
                .values()
                .map(|o| OpShape {
                    id: o.id,
                    name: o.name.as_deref(),
                    key: o.key(),
                    inputs: o.inputs.iter().map(|s| s.ty).collect(),
                    outputs: o.outputs.iter().map(|s| s.ty).collect(),
                    targets: &o.target_platforms,
                    fixed: o.fixed_platform.as_ref(),
                    cardinality: o.declared_cardinality,
                })
                .collect(),
            channels: self
                .channels
                .values()
                .map(|c| (c.id, c.producer, c.consumers.as_slice()))
                .collect(),
            loops: self
                .loops
                .values()
                .map(|l| LoopShape {
                    id: l.id,
                    head: l.head,
                    output: l.output,
                    parent: l.parent,
                    entry: l.entry,
                    exit: l.exit,
                    expected: l.expected_iterations,
                })
                .collect(),
            fallback: self.fallback,
        };
        hash_serde(&shape)
    }

    fn output_slot(&self, slot: SlotRef) -> Result<&OutputSlot, PlanError> {
        self.try_operator(slot.operator)?
            .outputs
            .get(slot.index)
            .ok_or(PlanError::NoSuchSlot {
                operator: slot.operator,
                side: SlotSide::Output,
                index: slot.index,
            })
    }

    fn input_slot(&self, slot: SlotRef) -> Result<&InputSlot, PlanError> {
        self.try_operator(slot.operator)?
            .inputs
            .get(slot.index)
            .ok_or(PlanError::NoSuchSlot {
                operator: slot.operator,
                side: SlotSide::Input,
                index: slot.index,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{DataUnitType, Quantum};

    fn strs(items: &[&str]) -> Vec<Quantum> {
        items.iter().map(|s| Quantum::str(*s)).collect()
    }

    #[test]
    fn connect_reuses_the_output_channel_for_extra_consumers() {
        let mut plan = Plan::new();
        let src = plan
            .add(Operator::collection_source(strs(&["a"]), DataUnitType::Str))
            .unwrap();
        let s1 = plan
            .add(Operator::collect_sink(SlotType::single(DataUnitType::Str)))
            .unwrap();
        let s2 = plan
            .add(Operator::collect_sink(SlotType::single(DataUnitType::Str)))
            .unwrap();
        let c1 = plan.pipe(src, s1).unwrap();
        let c2 = plan.pipe(src, s2).unwrap();
        assert_eq!(c1, c2);
        assert_eq!(plan.channel(c1).unwrap().consumers.len(), 2);
        assert_eq!(plan.successors(src), vec![s1, s2]);
    }

    #[test]
    fn connect_rejects_type_mismatch_and_occupied_slots() {
        let mut plan = Plan::new();
        let src = plan
            .add(Operator::collection_source(vec![Quantum::Int(1)], DataUnitType::Int))
            .unwrap();
        let other = plan
            .add(Operator::collection_source(vec![Quantum::Int(2)], DataUnitType::Int))
            .unwrap();
        let strs_sink = plan
            .add(Operator::collect_sink(SlotType::single(DataUnitType::Str)))
            .unwrap();
        let err = plan.pipe(src, strs_sink).unwrap_err();
        assert!(matches!(err, PlanError::SlotTypeMismatch { .. }));

        let sink = plan.add(Operator::collect_sink(SlotType::ANY)).unwrap();
        plan.pipe(src, sink).unwrap();
        assert_eq!(
            plan.pipe(other, sink).unwrap_err(),
            PlanError::SlotOccupied(SlotRef::new(sink, 0))
        );
        assert!(matches!(
            plan.connect(src, 3, sink, 0).unwrap_err(),
            PlanError::NoSuchSlot { .. }
        ));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut plan = Plan::new();
        plan.add(Operator::distinct(DataUnitType::Int).named("d")).unwrap();
        let err = plan
            .add(Operator::distinct(DataUnitType::Int).named("d"))
            .unwrap_err();
        assert_eq!(err, PlanError::DuplicateName("d".into()));
    }

    #[test]
    fn loop_with_a_taken_output_name_adds_nothing() {
        let mut plan = Plan::new();
        let ty = SlotType::single(DataUnitType::Int);
        plan.add(Operator::distinct(DataUnitType::Int).named("l.output"))
            .unwrap();
        let err = plan.add_loop(LoopDef::repeat("l", ty, 2)).unwrap_err();
        assert_eq!(err, PlanError::DuplicateName("l.output".into()));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan.loops().count(), 0);
        assert!(plan.operator_by_name("l").is_none());

        // the name is still free for a loop that fits
        plan.add_loop(LoopDef::repeat("m", ty, 2)).unwrap();
        assert_eq!(plan.len(), 3);
    }

    #[test]
    fn loop_scopes_and_multipliers() {
        let mut plan = Plan::new();
        let ty = SlotType::single(DataUnitType::Int);
        let outer = plan.add_loop(LoopDef::repeat("outer", ty, 3)).unwrap();
        let inner = plan
            .add_loop(LoopDef::repeat("inner", ty, 4).inside(outer.id))
            .unwrap();
        let body = plan
            .add_to_loop(inner.id, Operator::map(DataUnitType::Int, DataUnitType::Int, |q| q.clone()))
            .unwrap();

        assert_eq!(plan.scope_of(outer.head).unwrap(), None);
        assert_eq!(plan.scope_of(inner.head).unwrap(), Some(outer.id));
        assert_eq!(plan.scope_of(body).unwrap(), Some(inner.id));
        assert!(plan.is_within(Some(inner.id), Some(outer.id)));
        assert!(!plan.is_within(Some(outer.id), Some(inner.id)));
        assert_eq!(plan.iteration_multiplier(body), 12.0);
        assert!(plan.loop_members(outer.id).contains(&body));
        assert!(plan.loop_members(outer.id).contains(&inner.head));
    }

    #[test]
    fn only_transforms_join_loop_bodies() {
        let mut plan = Plan::new();
        let lp = plan
            .add_loop(LoopDef::repeat("l", SlotType::ANY, 2))
            .unwrap();
        let err = plan
            .add_to_loop(lp.id, Operator::collect_sink(SlotType::ANY))
            .unwrap_err();
        assert!(matches!(err, PlanError::NotALoopBody { .. }));
    }

    #[test]
    fn fingerprint_ignores_closures_but_not_structure() {
        let build = |name: &str| {
            let mut plan = Plan::new();
            let src = plan
                .add(Operator::collection_source(strs(&["a"]), DataUnitType::Str))
                .unwrap();
            let map = plan
                .add(Operator::map(DataUnitType::Str, DataUnitType::Str, |q| q.clone()).named(name))
                .unwrap();
            let sink = plan
                .add(Operator::collect_sink(SlotType::single(DataUnitType::Str)))
                .unwrap();
            plan.pipe(src, map).unwrap();
            plan.pipe(map, sink).unwrap();
            plan
        };
        let a = build("upper").fingerprint().unwrap();
        let b = build("upper").fingerprint().unwrap();
        let c = build("lower").fingerprint().unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
