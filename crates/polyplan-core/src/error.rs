use thiserror::Error;

use crate::id::{LoopId, OperatorId, SlotRef};

/// Canonical result for core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("Hashing error: {0}")]
    Hash(String),

    #[error("Internal invariant failed: {0}")]
    Invariant(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Hash(e.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(e: serde_yaml::Error) -> Self {
        Error::Config(e.to_string())
    }
}

/// Which side of an operator a slot sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotSide {
    Input,
    Output,
}

impl std::fmt::Display for SlotSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotSide::Input => f.write_str("input"),
            SlotSide::Output => f.write_str("output"),
        }
    }
}

/// Structural plan errors. Always fatal, always raised before execution starts.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum PlanError {
    #[error("unknown operator {0}")]
    UnknownOperator(OperatorId),

    #[error("unknown loop {0}")]
    UnknownLoop(LoopId),

    #[error("operator {operator} has no {side} slot {index}")]
    NoSuchSlot {
        operator: OperatorId,
        side: SlotSide,
        index: usize,
    },

    #[error("slot type mismatch between {producer} ({produced}) and {consumer} ({expected})")]
    SlotTypeMismatch {
        producer: SlotRef,
        consumer: SlotRef,
        produced: String,
        expected: String,
    },

    #[error("input slot {0} is already occupied by a channel")]
    SlotOccupied(SlotRef),

    #[error("{side} slot {slot} is not connected")]
    DanglingSlot { slot: SlotRef, side: SlotSide },

    #[error("cycle through operator {operator} is not closed by a loop feedback channel")]
    IllegalCycle { operator: OperatorId },

    #[error("invalid loop {loop_id}: {reason}")]
    InvalidLoop { loop_id: LoopId, reason: String },

    #[error("operator name '{0}' is used more than once")]
    DuplicateName(String),

    #[error("operator {operator} cannot be added to a loop body: {reason}")]
    NotALoopBody { operator: OperatorId, reason: String },
}

impl PlanError {
    /// The operator this error is about, if one can be named.
    pub fn operator(&self) -> Option<OperatorId> {
        match self {
            PlanError::UnknownOperator(op) => Some(*op),
            PlanError::NoSuchSlot { operator, .. } => Some(*operator),
            PlanError::SlotTypeMismatch { consumer, .. } => Some(consumer.operator),
            PlanError::SlotOccupied(slot) => Some(slot.operator),
            PlanError::DanglingSlot { slot, .. } => Some(slot.operator),
            PlanError::IllegalCycle { operator } => Some(*operator),
            PlanError::NotALoopBody { operator, .. } => Some(*operator),
            PlanError::UnknownLoop(_) | PlanError::InvalidLoop { .. } | PlanError::DuplicateName(_) => {
                None
            }
        }
    }
}
