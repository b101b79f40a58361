use polyplan_core::error::PlanError;
use polyplan_core::id::{ChannelId, OperatorId, PlatformId};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum OptimizerError {
    #[error(transparent)]
    Plan(#[from] PlanError),

    #[error("no feasible platform for operator {operator} ('{name}')")]
    NoFeasiblePlatform { operator: OperatorId, name: String },

    #[error("no channel conversion for {channel} from platform '{from}' to platform '{to}'")]
    ConversionUnavailable {
        channel: ChannelId,
        from: PlatformId,
        to: PlatformId,
    },

    #[error("no complete platform assignment exists")]
    NoAssignment,

    #[error("hashing failed: {0}")]
    Hash(String),
}

impl OptimizerError {
    pub fn operator(&self) -> Option<OperatorId> {
        match self {
            OptimizerError::Plan(e) => e.operator(),
            OptimizerError::NoFeasiblePlatform { operator, .. } => Some(*operator),
            OptimizerError::ConversionUnavailable { .. }
            | OptimizerError::NoAssignment
            | OptimizerError::Hash(_) => None,
        }
    }
}
