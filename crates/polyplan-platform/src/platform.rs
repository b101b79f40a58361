//! The platform capability interface.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use polyplan_core::channel::ChannelKind;
use polyplan_core::id::{ChannelId, InstanceId, LineageId, OperatorId, PlatformId};
use polyplan_core::plan::{Operator, OperatorKind};
use polyplan_core::types::Quantum;
use polyplan_cost::{ContextEntry, LoadEstimator};

use crate::error::PlatformError;
use crate::instance::{ChannelData, ChannelInstance};
use crate::lineage::ExecutionLineageNode;

/// An execution engine.
///
/// Implementations must be thread-safe: the executor dispatches independent
/// operators to the same platform concurrently.
pub trait Platform: Send + Sync {
    fn id(&self) -> &PlatformId;

    /// Channel kinds this platform can write, most preferred first.
    fn produced_channel_kinds(&self) -> Vec<ChannelKind>;

    /// Channel kinds this platform can read.
    fn consumed_channel_kinds(&self) -> Vec<ChannelKind>;

    /// Kinds an operator with key `key` can read on this platform.
    fn supported_input_channel_kinds(&self, _key: &str) -> Vec<ChannelKind> {
        self.consumed_channel_kinds()
    }

    /// Kinds an operator with key `key` can write on this platform, most
    /// preferred first.
    fn supported_output_channel_kinds(&self, _key: &str) -> Vec<ChannelKind> {
        self.produced_channel_kinds()
    }

    fn supports(&self, kind: &OperatorKind) -> bool;

    /// Platform-specific estimator for `key`, if it has one.
    fn load_estimator(&self, _key: &str) -> Option<Arc<dyn LoadEstimator>> {
        None
    }

    /// Run `op`. `inputs` are in slot order and already in a kind this
    /// platform reads; `outputs` describe the instances to produce, in slot
    /// order.
    fn execute(
        &self,
        op: &Operator,
        inputs: &[Arc<ChannelInstance>],
        outputs: &[OutputPlaceholder],
        ctx: &ExecutionContext,
    ) -> Result<ExecutionOutcome, PlatformError>;
}

/// Description of one output instance a dispatch must produce.
#[derive(Debug, Clone)]
pub struct OutputPlaceholder {
    pub slot: usize,
    pub channel: ChannelId,
    pub kind: ChannelKind,
    pub instance: InstanceId,
    pub lineage: LineageId,
    pub consumers: usize,
}

impl OutputPlaceholder {
    pub fn fill(&self, producer: OperatorId, data: ChannelData, quanta: u64) -> ChannelInstance {
        ChannelInstance::new(
            self.instance,
            self.channel,
            producer,
            self.kind,
            data,
            quanta,
            self.lineage,
            self.consumers,
        )
    }
}

/// Everything a dispatch may consult besides its data.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub platform: PlatformId,
    /// Job-private directory for file-backed instances.
    pub scratch_dir: PathBuf,
    pub cancelled: Arc<AtomicBool>,
    /// Loop iteration this dispatch belongs to, if inside a loop body.
    pub iteration: Option<usize>,
    /// This operator's entry in the current optimization context.
    pub estimate: Option<ContextEntry>,
}

impl ExecutionContext {
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn check_cancelled(&self) -> Result<(), PlatformError> {
        if self.is_cancelled() {
            Err(PlatformError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[derive(Debug)]
pub struct ExecutionOutcome {
    /// One instance per placeholder, same order.
    pub produced: Vec<Arc<ChannelInstance>>,
    pub lineage: ExecutionLineageNode,
    /// Data handed back by sinks.
    pub collected: Option<Vec<Quantum>>,
}
