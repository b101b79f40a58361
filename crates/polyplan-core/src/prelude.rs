//! Convenient re-exports for downstream crates.

pub use crate::channel::{ChannelKind, ChannelStorage};
pub use crate::config::{Configuration, InstrumentationMode, JobConfig};
pub use crate::error::{Error, PlanError, Result, SlotSide};
pub use crate::hash::Hash256;
pub use crate::id::{
    ChannelId, ContextId, InstanceId, LineageId, LoopId, OperatorId, PlatformId, SegmentId,
    SlotRef,
};
pub use crate::manifest::{JobId, JobManifest};
pub use crate::plan::{
    Channel, KindTag, LoopDef, LoopHandle, LoopSpec, LoopState, Operator, OperatorKind, Plan,
    Sink, Source, Transform,
};
pub use crate::types::{Cardinality, DataUnitType, Quantum, SlotType};
