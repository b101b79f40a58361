//! Loop constructs.
//!
//! A loop is a head operator, a body (a set of `LoopBody` operators with one
//! entry and one exit), and an output operator. The head feeds the body through
//! its `iteration` slot and receives the body's result on its `feedback` slot;
//! once the convergence predicate holds, the state leaves through `final` into
//! the loop output. The feedback channel is the only cycle a plan may contain.

use std::fmt;
use std::sync::Arc;

use crate::id::{LoopId, OperatorId};
use crate::types::{Quantum, SlotType};

/// Input slot of the head receiving the loop's initial state.
pub const HEAD_INITIAL: usize = 0;
/// Input slot of the head receiving the body's result.
pub const HEAD_FEEDBACK: usize = 1;
/// Output slot of the head feeding the body.
pub const HEAD_ITERATION: usize = 0;
/// Output slot of the head feeding the loop output.
pub const HEAD_FINAL: usize = 1;

/// What the convergence predicate sees after each iteration.
#[derive(Debug, Clone, Copy)]
pub struct LoopState<'a> {
    /// Iterations completed so far (1 after the first body run).
    pub iteration: usize,
    /// The feedback produced by the last iteration.
    pub state: &'a [Quantum],
}

pub type ConvergenceFn = Arc<dyn Fn(&LoopState<'_>) -> bool + Send + Sync>;

/// Caller's description of a loop, consumed by `Plan::add_loop`.
#[derive(Clone)]
pub struct LoopDef {
    pub name: String,
    pub state_type: SlotType,
    pub converged: ConvergenceFn,
    /// Used by the optimizer to weight body costs.
    pub expected_iterations: usize,
    pub parent: Option<LoopId>,
}

impl LoopDef {
    pub fn new<F>(name: impl Into<String>, state_type: SlotType, converged: F) -> Self
    where
        F: Fn(&LoopState<'_>) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            state_type,
            converged: Arc::new(converged),
            expected_iterations: 10,
            parent: None,
        }
    }

    /// Run the body exactly `n` times.
    pub fn repeat(name: impl Into<String>, state_type: SlotType, n: usize) -> Self {
        Self::new(name, state_type, move |s| s.iteration >= n).expected_iterations(n)
    }

    pub fn expected_iterations(mut self, n: usize) -> Self {
        self.expected_iterations = n.max(1);
        self
    }

    /// Nest this loop inside the body of `parent`.
    pub fn inside(mut self, parent: LoopId) -> Self {
        self.parent = Some(parent);
        self
    }
}

impl fmt::Debug for LoopDef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopDef")
            .field("name", &self.name)
            .field("state_type", &self.state_type)
            .field("expected_iterations", &self.expected_iterations)
            .field("parent", &self.parent)
            .finish_non_exhaustive()
    }
}

/// A loop as stored in the plan.
#[derive(Clone)]
pub struct LoopSpec {
    pub id: LoopId,
    pub name: String,
    pub head: OperatorId,
    pub output: OperatorId,
    pub parent: Option<LoopId>,
    pub entry: Option<OperatorId>,
    pub exit: Option<OperatorId>,
    pub state_type: SlotType,
    pub expected_iterations: usize,
    pub(crate) converged: ConvergenceFn,
}

impl LoopSpec {
    pub fn is_closed(&self) -> bool {
        self.entry.is_some() && self.exit.is_some()
    }

    pub fn has_converged(&self, state: &LoopState<'_>) -> bool {
        (self.converged)(state)
    }
}

impl fmt::Debug for LoopSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoopSpec")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("head", &self.head)
            .field("output", &self.output)
            .field("parent", &self.parent)
            .field("entry", &self.entry)
            .field("exit", &self.exit)
            .finish_non_exhaustive()
    }
}

/// Ids handed back by `Plan::add_loop`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopHandle {
    pub id: LoopId,
    pub head: OperatorId,
    pub output: OperatorId,
}
