#![forbid(unsafe_code)]
//! polyplan-platform: the boundary between the core and execution engines.
//!
//! - `Platform`: what an engine can run and which channel kinds it speaks.
//! - `PlatformRegistry`: the set of platforms and channel conversions for one
//!   caller context. Built explicitly and passed by reference.
//! - `ChannelInstance`: runtime data of one channel, reference counted by
//!   remaining consumers.
//! - `ExecutionLineage`: what ran, on what, producing what.
//! - `LocalPlatform`: an in-process engine that evaluates every built-in
//!   operator kind. Several differently configured instances can stand in for
//!   heterogeneous engines.

pub mod conversion;
pub mod error;
pub mod instance;
pub mod lineage;
pub mod local;
pub mod materialize;
pub mod platform;
pub mod registry;

pub use conversion::{ChannelConversion, ConversionPath};
pub use error::{PlatformError, RegistryError};
pub use instance::{ChannelData, ChannelInstance};
pub use lineage::{ExecutionLineage, ExecutionLineageNode, LineageKind, LineageRecord, Measurement};
pub use local::LocalPlatform;
pub use platform::{ExecutionContext, ExecutionOutcome, OutputPlaceholder, Platform};
pub use registry::{PlatformRegistry, RegistryBuilder};
