//! Channel instances: the runtime data of one channel in one execution scope.
//!
//! An instance is created with the number of consumers that will read it.
//! Each consumer calls `consumer_done` when it has finished; the caller that
//! observes the count reach zero releases the instance. Release is idempotent
//! and also releases every converted instance derived from this one.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use polyplan_core::channel::ChannelKind;
use polyplan_core::id::{ChannelId, InstanceId, LineageId, OperatorId};
use polyplan_core::types::Quantum;

use crate::error::PlatformError;
use crate::materialize::read_jsonl;

#[derive(Debug, Clone)]
pub enum ChannelData {
    Memory(Arc<Vec<Quantum>>),
    File(PathBuf),
}

pub struct ChannelInstance {
    id: InstanceId,
    channel: ChannelId,
    producer: OperatorId,
    kind: ChannelKind,
    data: ChannelData,
    quanta: u64,
    lineage: LineageId,
    remaining: AtomicUsize,
    reads: AtomicUsize,
    released: AtomicBool,
    derived: Mutex<Vec<Arc<ChannelInstance>>>,
}

impl ChannelInstance {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: InstanceId,
        channel: ChannelId,
        producer: OperatorId,
        kind: ChannelKind,
        data: ChannelData,
        quanta: u64,
        lineage: LineageId,
        consumers: usize,
    ) -> Self {
        Self {
            id,
            channel,
            producer,
            kind,
            data,
            quanta,
            lineage,
            remaining: AtomicUsize::new(consumers),
            reads: AtomicUsize::new(0),
            released: AtomicBool::new(false),
            derived: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> InstanceId {
        self.id
    }

    pub fn channel(&self) -> ChannelId {
        self.channel
    }

    pub fn producer(&self) -> OperatorId {
        self.producer
    }

    pub fn kind(&self) -> ChannelKind {
        self.kind
    }

    pub fn data(&self) -> &ChannelData {
        &self.data
    }

    /// Number of quanta held.
    pub fn len(&self) -> u64 {
        self.quanta
    }

    pub fn is_empty(&self) -> bool {
        self.quanta == 0
    }

    pub fn lineage(&self) -> LineageId {
        self.lineage
    }

    pub fn remaining_consumers(&self) -> usize {
        self.remaining.load(Ordering::Acquire)
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    /// Read the quanta. Single-read kinds fail on the second call.
    pub fn read(&self) -> Result<Arc<Vec<Quantum>>, PlatformError> {
        if self.is_released() {
            return Err(PlatformError::Released(self.id));
        }
        if !self.kind.reusable && self.reads.fetch_add(1, Ordering::AcqRel) > 0 {
            return Err(PlatformError::AlreadyConsumed(self.id));
        }
        match &self.data {
            ChannelData::Memory(items) => Ok(Arc::clone(items)),
            ChannelData::File(path) => Ok(Arc::new(read_jsonl(path)?)),
        }
    }

    /// Previously converted instance of kind `kind`, if any.
    pub fn derived(&self, kind: ChannelKind) -> Option<Arc<ChannelInstance>> {
        self.derived.lock().iter().find(|d| d.kind == kind).cloned()
    }

    /// Cache a converted instance. If one of the same kind raced in first,
    /// that one is kept and returned.
    pub fn add_derived(&self, inst: Arc<ChannelInstance>) -> Arc<ChannelInstance> {
        let mut derived = self.derived.lock();
        if let Some(existing) = derived.iter().find(|d| d.kind == inst.kind) {
            let existing = Arc::clone(existing);
            drop(derived);
            inst.release();
            return existing;
        }
        derived.push(Arc::clone(&inst));
        inst
    }

    /// One consumer finished. Returns true exactly once: for the caller that
    /// brought the count to zero.
    pub fn consumer_done(&self) -> bool {
        let mut cur = self.remaining.load(Ordering::Acquire);
        loop {
            if cur == 0 {
                return false;
            }
            match self.remaining.compare_exchange(
                cur,
                cur - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return cur == 1,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Free the data. File-backed instances delete their file.
    ///
    /// Returns false if the instance was already released.
    pub fn release(&self) -> bool {
        if self.released.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let ChannelData::File(path) = &self.data {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!(instance = %self.id, path = %path.display(), error = %e, "failed to delete channel file");
                }
            }
        }
        let derived = std::mem::take(&mut *self.derived.lock());
        for d in derived {
            d.release();
        }
        tracing::trace!(instance = %self.id, channel = %self.channel, "released");
        true
    }
}

impl fmt::Debug for ChannelInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelInstance")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .field("kind", &self.kind.name)
            .field("quanta", &self.quanta)
            .field("remaining", &self.remaining_consumers())
            .field("released", &self.is_released())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::materialize::write_jsonl;

    fn mem(kind: ChannelKind, consumers: usize) -> ChannelInstance {
        ChannelInstance::new(
            InstanceId::new(1),
            ChannelId::new(0),
            OperatorId::new(0),
            kind,
            ChannelData::Memory(Arc::new(vec![Quantum::Int(1), Quantum::Int(2)])),
            2,
            LineageId::new(0),
            consumers,
        )
    }

    #[test]
    fn last_consumer_triggers_release_once() {
        let inst = mem(ChannelKind::COLLECTION, 2);
        assert!(!inst.consumer_done());
        assert!(inst.consumer_done());
        assert!(!inst.consumer_done());
        assert!(inst.release());
        assert!(!inst.release());
        assert!(matches!(inst.read(), Err(PlatformError::Released(_))));
    }

    #[test]
    fn streams_are_single_read() {
        let inst = mem(ChannelKind::STREAM, 1);
        assert_eq!(inst.read().unwrap().len(), 2);
        assert!(matches!(inst.read(), Err(PlatformError::AlreadyConsumed(_))));

        let reusable = mem(ChannelKind::COLLECTION, 1);
        reusable.read().unwrap();
        reusable.read().unwrap();
    }

    #[test]
    fn release_deletes_files_and_derived_instances() {
        let dir = std::env::temp_dir().join(format!("polyplan-inst-{}", std::process::id()));
        let path = dir.join("x.jsonl");
        write_jsonl(&path, &[Quantum::Int(1)]).unwrap();
        let file = Arc::new(ChannelInstance::new(
            InstanceId::new(2),
            ChannelId::new(0),
            OperatorId::new(0),
            ChannelKind::FILE,
            ChannelData::File(path.clone()),
            1,
            LineageId::new(1),
            1,
        ));
        let base = mem(ChannelKind::COLLECTION, 1);
        let kept = base.add_derived(Arc::clone(&file));
        assert!(Arc::ptr_eq(&kept, &file));
        assert!(base.derived(ChannelKind::FILE).is_some());

        base.release();
        assert!(file.is_released());
        assert!(!path.exists());
        let _ = fs::remove_dir_all(&dir);
    }
}
