//! Channel kinds: how a channel's data is represented at runtime.
//!
//! A kind says where the data lives (memory or a file) and whether it can be
//! read more than once. Lazy single-pass sequences are `reusable: false`; the
//! optimizer never routes such a kind to more than one consumer.

use std::fmt;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChannelStorage {
    Memory,
    File,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ChannelKind {
    pub name: &'static str,
    pub storage: ChannelStorage,
    pub reusable: bool,
}

impl ChannelKind {
    /// In-process, materialized collection.
    pub const COLLECTION: ChannelKind = ChannelKind::new("collection", ChannelStorage::Memory, true);
    /// In-process lazy sequence; can be read once.
    pub const STREAM: ChannelKind = ChannelKind::new("stream", ChannelStorage::Memory, false);
    /// Handle to a dataset owned by a distributed engine.
    pub const DATASET: ChannelKind = ChannelKind::new("dataset", ChannelStorage::Memory, true);
    /// JSON-lines file in the job's scratch directory.
    pub const FILE: ChannelKind = ChannelKind::new("file", ChannelStorage::File, true);

    pub const fn new(name: &'static str, storage: ChannelStorage, reusable: bool) -> Self {
        Self {
            name,
            storage,
            reusable,
        }
    }

    pub fn is_file(&self) -> bool {
        self.storage == ChannelStorage::File
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}
