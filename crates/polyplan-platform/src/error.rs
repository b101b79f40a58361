use polyplan_core::id::{InstanceId, PlatformId};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PlatformError {
    #[error("platform '{platform}' cannot execute '{key}'")]
    Unsupported { platform: PlatformId, key: String },

    #[error("execution error: {0}")]
    Exec(String),

    #[error("input slot {0} has no channel instance")]
    MissingInput(usize),

    #[error("channel instance {0} is single-read and was already consumed")]
    AlreadyConsumed(InstanceId),

    #[error("channel instance {0} was already released")]
    Released(InstanceId),

    #[error("no conversion from '{from}' to '{to}'")]
    NoConversion { from: String, to: String },

    #[error("dispatch cancelled")]
    Cancelled,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("platform '{0}' has no channel kind it can both produce and consume")]
    NoSelfChannel(PlatformId),

    #[error("platform '{0}' is registered twice")]
    DuplicatePlatform(PlatformId),
}
