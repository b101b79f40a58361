//! Execution lineage.
//!
//! A DAG of channel-instance nodes and execution nodes. Every channel instance
//! gets a node when it is created; every successful dispatch adds an execution
//! node whose predecessors are the instances it consumed, and becomes the
//! predecessor of the instances it produced. Converted instances point at the
//! instance they were converted from.
//!
//! `collect_and_mark` hands out each node at most once, which is what lets the
//! executor report lineage incrementally without duplicates.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use polyplan_core::channel::ChannelKind;
use polyplan_core::id::{ChannelId, InstanceId, LineageId, OperatorId, PlatformId};
use serde::Serialize;

/// What the instrumentation measured for one dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Measurement {
    pub elapsed: Duration,
    pub input_quanta: u64,
    pub output_quanta: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum LineageKind {
    Channel {
        instance: InstanceId,
        channel: ChannelId,
        kind: ChannelKind,
        quanta: u64,
    },
    Execution {
        operator: OperatorId,
        platform: PlatformId,
        iteration: Option<usize>,
        measurement: Option<Measurement>,
    },
}

/// Execution node as reported by a platform.
#[derive(Debug, Clone)]
pub struct ExecutionLineageNode {
    pub operator: OperatorId,
    pub platform: PlatformId,
    pub iteration: Option<usize>,
    /// Lineage nodes of the instances read, in slot order.
    pub consumed: Vec<LineageId>,
    pub measurement: Option<Measurement>,
}

#[derive(Debug)]
struct LineageNode {
    kind: LineageKind,
    predecessors: Mutex<Vec<LineageId>>,
    collected: AtomicBool,
}

/// Snapshot of one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LineageRecord {
    pub id: LineageId,
    pub kind: LineageKind,
    pub predecessors: Vec<LineageId>,
}

impl LineageRecord {
    pub fn operator(&self) -> Option<OperatorId> {
        match &self.kind {
            LineageKind::Execution { operator, .. } => Some(*operator),
            LineageKind::Channel { .. } => None,
        }
    }

    pub fn platform(&self) -> Option<&PlatformId> {
        match &self.kind {
            LineageKind::Execution { platform, .. } => Some(platform),
            LineageKind::Channel { .. } => None,
        }
    }
}

#[derive(Debug, Default)]
pub struct ExecutionLineage {
    nodes: DashMap<LineageId, Arc<LineageNode>>,
    next: AtomicU64,
}

impl ExecutionLineage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve an id for a node that will be added later.
    pub fn next_id(&self) -> LineageId {
        LineageId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn insert(&self, id: LineageId, kind: LineageKind, predecessors: Vec<LineageId>) {
        self.nodes.insert(
            id,
            Arc::new(LineageNode {
                kind,
                predecessors: Mutex::new(predecessors),
                collected: AtomicBool::new(false),
            }),
        );
    }

    pub fn add_channel(
        &self,
        id: LineageId,
        instance: InstanceId,
        channel: ChannelId,
        kind: ChannelKind,
        quanta: u64,
        predecessors: Vec<LineageId>,
    ) {
        self.insert(
            id,
            LineageKind::Channel {
                instance,
                channel,
                kind,
                quanta,
            },
            predecessors,
        );
    }

    /// Merge an execution node; `produced` instance nodes get it as predecessor.
    pub fn add_execution(&self, node: ExecutionLineageNode, produced: &[LineageId]) -> LineageId {
        let id = self.next_id();
        self.insert(
            id,
            LineageKind::Execution {
                operator: node.operator,
                platform: node.platform,
                iteration: node.iteration,
                measurement: node.measurement,
            },
            node.consumed,
        );
        for p in produced {
            if let Some(n) = self.nodes.get(p) {
                n.predecessors.lock().push(id);
            }
        }
        id
    }

    /// Transitive closure of not-yet-collected nodes reachable backwards from
    /// `from`, marking them collected. Ordered by id.
    pub fn collect_and_mark(&self, from: LineageId) -> Vec<LineageRecord> {
        let mut out = Vec::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            let Some(node) = self.nodes.get(&id).map(|n| Arc::clone(n.value())) else {
                continue;
            };
            // Whoever flips the flag owns the node; collected nodes already
            // had their ancestors collected.
            if node
                .collected
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                continue;
            }
            let preds = node.predecessors.lock().clone();
            stack.extend(preds.iter().copied());
            out.push(LineageRecord {
                id,
                kind: node.kind.clone(),
                predecessors: preds,
            });
        }
        out.sort_by_key(|r| r.id);
        out
    }

    /// Every node, collected or not, ordered by id.
    pub fn records(&self) -> Vec<LineageRecord> {
        let mut out: Vec<LineageRecord> = self
            .nodes
            .iter()
            .map(|e| LineageRecord {
                id: *e.key(),
                kind: e.value().kind.clone(),
                predecessors: e.value().predecessors.lock().clone(),
            })
            .collect();
        out.sort_by_key(|r| r.id);
        out
    }

    /// Execution records for `operator`, in the order they happened.
    pub fn executions_of(&self, operator: OperatorId) -> Vec<LineageRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.operator() == Some(operator))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}
