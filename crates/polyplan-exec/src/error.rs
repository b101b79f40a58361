use polyplan_core::error::{Error as CoreError, PlanError};
use polyplan_core::id::{LoopId, OperatorId, PlatformId};
use polyplan_optimizer::OptimizerError;
use polyplan_platform::PlatformError;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, JobError>;

#[derive(Debug, Error)]
pub enum JobError {
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("invalid plan: {0}")]
    Validation(PlanError),

    #[error("optimization failed: {0}")]
    Optimization(OptimizerError),

    #[error("operator {operator} ('{name}') failed on platform '{platform}': {source}")]
    Execution {
        operator: OperatorId,
        name: String,
        platform: PlatformId,
        #[source]
        source: PlatformError,
    },

    #[error("loop '{name}' did not converge within {iterations} iterations")]
    NotConverged {
        loop_id: LoopId,
        head: OperatorId,
        name: String,
        iterations: usize,
    },

    #[error("job cancelled")]
    Cancelled,

    #[error("executor invariant failed: {0}")]
    Internal(String),
}

impl JobError {
    /// The operator responsible for the failure, when there is one.
    pub fn failing_operator(&self) -> Option<OperatorId> {
        match self {
            JobError::Validation(e) => e.operator(),
            JobError::Optimization(e) => e.operator(),
            JobError::Execution { operator, .. } => Some(*operator),
            JobError::NotConverged { head, .. } => Some(*head),
            JobError::Config(_) | JobError::Cancelled | JobError::Internal(_) => None,
        }
    }
}

impl From<PlanError> for JobError {
    fn from(e: PlanError) -> Self {
        JobError::Validation(e)
    }
}

impl From<OptimizerError> for JobError {
    fn from(e: OptimizerError) -> Self {
        match e {
            OptimizerError::Plan(p) => JobError::Validation(p),
            other => JobError::Optimization(other),
        }
    }
}

impl From<CoreError> for JobError {
    fn from(e: CoreError) -> Self {
        match e {
            CoreError::Config(msg) => JobError::Config(msg),
            CoreError::Plan(p) => JobError::Validation(p),
            other => JobError::Internal(other.to_string()),
        }
    }
}
