//! Structural validation. Runs before optimization; every failure is fatal.

use crate::error::{PlanError, SlotSide};
use crate::id::SlotRef;

use super::{OperatorKind, Plan};

impl Plan {
    /// Accepts iff every required slot is connected, every loop is closed and
    /// well-scoped, and the only cycles are loop feedback channels.
    pub fn validate(&self) -> Result<(), PlanError> {
        self.check_loops_closed()?;
        self.check_slots_connected()?;
        self.check_loop_boundaries()?;
        self.topological_order().map(|_| ())
    }

    fn check_loops_closed(&self) -> Result<(), PlanError> {
        for spec in self.loops() {
            if !spec.is_closed() {
                return Err(PlanError::InvalidLoop {
                    loop_id: spec.id,
                    reason: format!("loop '{}' has no body entry/exit", spec.name),
                });
            }
        }
        Ok(())
    }

    fn check_slots_connected(&self) -> Result<(), PlanError> {
        for op in self.operators() {
            for (index, slot) in op.inputs().iter().enumerate() {
                if slot.channel.is_none() && !slot.optional {
                    return Err(PlanError::DanglingSlot {
                        slot: SlotRef::new(op.id(), index),
                        side: SlotSide::Input,
                    });
                }
            }
            // Every produced result must go somewhere, sinks being the only terminus.
            for (index, slot) in op.outputs().iter().enumerate() {
                if slot.channel.is_none() {
                    return Err(PlanError::DanglingSlot {
                        slot: SlotRef::new(op.id(), index),
                        side: SlotSide::Output,
                    });
                }
            }
        }
        Ok(())
    }

    /// Data may flow into a loop body from any enclosing scope, but may only
    /// leave it through the head's feedback slot.
    fn check_loop_boundaries(&self) -> Result<(), PlanError> {
        for ch in self.channels() {
            let from = self.output_scope(ch.producer)?;
            for consumer in &ch.consumers {
                let to = self.input_scope(*consumer)?;

                if self.is_feedback_slot(*consumer) {
                    if from != to {
                        let loop_id = match &self.try_operator(consumer.operator)?.kind {
                            OperatorKind::LoopHead(l) => *l,
                            _ => continue,
                        };
                        return Err(PlanError::InvalidLoop {
                            loop_id,
                            reason: format!(
                                "feedback of {} must come from its own body, not {}",
                                consumer.operator, ch.producer
                            ),
                        });
                    }
                    continue;
                }

                if !self.is_within(to, from) {
                    // `from` is Some here: the top level encloses everything.
                    let Some(loop_id) = from else { continue };
                    return Err(PlanError::InvalidLoop {
                        loop_id,
                        reason: format!(
                            "{} -> {} leaves the loop body other than via feedback or final",
                            ch.producer, consumer
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::error::{PlanError, SlotSide};
    use crate::id::SlotRef;
    use crate::plan::{LoopDef, Operator, Plan, HEAD_INITIAL};
    use crate::types::{DataUnitType, Quantum, SlotType};

    const INT: SlotType = SlotType::single(DataUnitType::Int);

    fn inc() -> Operator {
        Operator::map(DataUnitType::Int, DataUnitType::Int, |q| {
            Quantum::Int(q.as_int().unwrap_or(0) + 1)
        })
    }

    /// source -> loop(map) -> sink
    fn looped_plan() -> (Plan, crate::plan::LoopHandle, crate::id::OperatorId) {
        let mut plan = Plan::new();
        let src = plan
            .add(Operator::collection_source(vec![Quantum::Int(0)], DataUnitType::Int))
            .unwrap();
        let lp = plan.add_loop(LoopDef::repeat("count", INT, 3)).unwrap();
        let body = plan.add_to_loop(lp.id, inc()).unwrap();
        let sink = plan.add(Operator::collect_sink(INT)).unwrap();
        plan.connect(src, 0, lp.head, HEAD_INITIAL).unwrap();
        plan.close_loop(lp.id, body, body).unwrap();
        plan.pipe(lp.output, sink).unwrap();
        (plan, lp, body)
    }

    #[test]
    fn well_formed_loop_validates() {
        let (plan, _, _) = looped_plan();
        plan.validate().unwrap();
        let order = plan.topological_order().unwrap();
        assert_eq!(order.len(), plan.len());
    }

    #[test]
    fn dangling_input_is_reported() {
        let mut plan = Plan::new();
        let map = plan.add(inc()).unwrap();
        let sink = plan.add(Operator::collect_sink(INT)).unwrap();
        plan.pipe(map, sink).unwrap();
        assert_eq!(
            plan.validate().unwrap_err(),
            PlanError::DanglingSlot {
                slot: SlotRef::new(map, 0),
                side: SlotSide::Input
            }
        );
    }

    #[test]
    fn dangling_output_is_reported() {
        let mut plan = Plan::new();
        let src = plan
            .add(Operator::collection_source(vec![], DataUnitType::Int))
            .unwrap();
        assert!(matches!(
            plan.validate().unwrap_err(),
            PlanError::DanglingSlot { slot, side: SlotSide::Output } if slot.operator == src
        ));
    }

    #[test]
    fn unclosed_loop_is_invalid() {
        let mut plan = Plan::new();
        let lp = plan.add_loop(LoopDef::repeat("open", INT, 2)).unwrap();
        assert!(matches!(
            plan.validate().unwrap_err(),
            PlanError::InvalidLoop { loop_id, .. } if loop_id == lp.id
        ));
    }

    #[test]
    fn cycle_outside_a_loop_is_illegal() {
        let mut plan = Plan::new();
        let src = plan
            .add(Operator::collection_source(vec![Quantum::Int(1)], DataUnitType::Int))
            .unwrap();
        let union = plan.add(Operator::union(DataUnitType::Int)).unwrap();
        let map = plan.add(inc()).unwrap();
        let sink = plan.add(Operator::collect_sink(INT)).unwrap();
        plan.connect(src, 0, union, 0).unwrap();
        plan.pipe(union, map).unwrap();
        plan.connect(map, 0, union, 1).unwrap();
        plan.pipe(map, sink).unwrap();
        assert!(matches!(
            plan.validate().unwrap_err(),
            PlanError::IllegalCycle { .. }
        ));
    }

    #[test]
    fn body_data_cannot_escape_except_through_feedback() {
        let (mut plan, lp, body) = looped_plan();
        let leak = plan.add(Operator::collect_sink(INT)).unwrap();
        plan.pipe(body, leak).unwrap();
        assert!(matches!(
            plan.validate().unwrap_err(),
            PlanError::InvalidLoop { loop_id, .. } if loop_id == lp.id
        ));
    }

    #[test]
    fn loop_invariant_input_from_outside_is_allowed() {
        let mut plan = Plan::new();
        let src = plan
            .add(Operator::collection_source(vec![Quantum::Int(0)], DataUnitType::Int))
            .unwrap();
        let constant = plan
            .add(Operator::collection_source(vec![Quantum::Int(5)], DataUnitType::Int))
            .unwrap();
        let lp = plan.add_loop(LoopDef::repeat("acc", INT, 2)).unwrap();
        let union = plan
            .add_to_loop(lp.id, Operator::union(DataUnitType::Int))
            .unwrap();
        let sink = plan.add(Operator::collect_sink(INT)).unwrap();
        plan.connect(src, 0, lp.head, HEAD_INITIAL).unwrap();
        plan.connect(constant, 0, union, 1).unwrap();
        plan.close_loop(lp.id, union, union).unwrap();
        plan.pipe(lp.output, sink).unwrap();
        plan.validate().unwrap();
    }
}
