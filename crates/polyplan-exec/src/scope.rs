//! Execution scopes and scheduling units.
//!
//! The top level is one scope; every loop iteration runs in a fresh child
//! scope. A scope holds the channel instances produced in it; lookups fall
//! through to enclosing scopes so loop bodies can read loop-invariant data.
//!
//! Within a scope the scheduler moves whole units: a plain operator, or a
//! nested loop (head, every iteration of its body, and its output) as one.

use std::collections::BTreeSet;
use std::sync::Arc;

use dashmap::DashMap;
use polyplan_core::error::PlanError;
use polyplan_core::id::{ChannelId, LoopId, OperatorId, SlotRef};
use polyplan_core::plan::{Plan, HEAD_INITIAL};
use polyplan_platform::ChannelInstance;

#[derive(Debug)]
pub(crate) struct Scope {
    loop_id: Option<LoopId>,
    parent: Option<Arc<Scope>>,
    instances: DashMap<ChannelId, Arc<ChannelInstance>>,
}

impl Scope {
    pub(crate) fn root() -> Arc<Self> {
        Arc::new(Self {
            loop_id: None,
            parent: None,
            instances: DashMap::new(),
        })
    }

    pub(crate) fn child(parent: &Arc<Scope>, loop_id: LoopId) -> Arc<Self> {
        Arc::new(Self {
            loop_id: Some(loop_id),
            parent: Some(Arc::clone(parent)),
            instances: DashMap::new(),
        })
    }

    pub(crate) fn loop_id(&self) -> Option<LoopId> {
        self.loop_id
    }

    pub(crate) fn insert(&self, channel: ChannelId, instance: Arc<ChannelInstance>) {
        self.instances.insert(channel, instance);
    }

    /// Find `channel`, innermost scope first. The flag says whether it was
    /// found in this scope itself.
    pub(crate) fn lookup(&self, channel: ChannelId) -> Option<(Arc<ChannelInstance>, bool)> {
        if let Some(i) = self.instances.get(&channel) {
            return Some((Arc::clone(i.value()), true));
        }
        let mut cur = self.parent.as_ref();
        while let Some(s) = cur {
            if let Some(i) = s.instances.get(&channel) {
                return Some((Arc::clone(i.value()), false));
            }
            cur = s.parent.as_ref();
        }
        None
    }

    pub(crate) fn take(&self, channel: ChannelId) -> Option<Arc<ChannelInstance>> {
        self.instances.remove(&channel).map(|(_, i)| i)
    }

    /// Empty this scope, returning what it held.
    pub(crate) fn drain(&self) -> Vec<Arc<ChannelInstance>> {
        let keys: Vec<ChannelId> = self.instances.iter().map(|e| *e.key()).collect();
        keys.into_iter().filter_map(|k| self.take(k)).collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub(crate) enum Unit {
    Op(OperatorId),
    Loop(LoopId),
}

/// Units directly inside `scope`. Loop heads and outputs are folded into
/// their loop's unit.
pub(crate) fn units_of(plan: &Plan, scope: Option<LoopId>) -> BTreeSet<Unit> {
    let mut out: BTreeSet<Unit> = plan
        .direct_members(scope)
        .into_iter()
        .filter(|op| {
            plan.operator(*op)
                .map_or(false, |o| !o.kind().is_loop_control())
        })
        .map(Unit::Op)
        .collect();
    out.extend(
        plan.loops()
            .filter(|l| l.parent == scope)
            .map(|l| Unit::Loop(l.id)),
    );
    out
}

/// Input slots of `unit` fed from outside the unit, with their channels.
pub(crate) fn external_inputs(plan: &Plan, unit: Unit) -> Result<Vec<(SlotRef, ChannelId)>, PlanError> {
    match unit {
        Unit::Op(op) => {
            let o = plan.operator(op).ok_or(PlanError::UnknownOperator(op))?;
            Ok((0..o.inputs().len())
                .filter_map(|slot| {
                    plan.input_channel(op, slot)
                        .map(|ch| (SlotRef::new(op, slot), ch))
                })
                .collect())
        }
        Unit::Loop(l) => {
            let spec = plan.loop_spec(l).ok_or(PlanError::UnknownLoop(l))?;
            let members: BTreeSet<OperatorId> = plan.loop_members(l).into_iter().collect();
            let mut out = Vec::new();
            if let Some(ch) = plan.input_channel(spec.head, HEAD_INITIAL) {
                out.push((SlotRef::new(spec.head, HEAD_INITIAL), ch));
            }
            for m in &members {
                let o = plan.operator(*m).ok_or(PlanError::UnknownOperator(*m))?;
                for slot in 0..o.inputs().len() {
                    let Some(ch) = plan.input_channel(*m, slot) else {
                        continue;
                    };
                    let Some(channel) = plan.channel(ch) else {
                        continue;
                    };
                    let producer = channel.producer.operator;
                    if producer != spec.head && !members.contains(&producer) {
                        out.push((SlotRef::new(*m, slot), ch));
                    }
                }
            }
            Ok(out)
        }
    }
}
