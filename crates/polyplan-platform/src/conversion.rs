//! Channel conversions: turning an instance of one kind into another kind.
//!
//! Conversions are edges in a small graph over channel kinds. The registry
//! finds the cheapest path; the executor applies it lazily, once per
//! (instance, target kind), caching each step on the source instance.

use std::path::Path;
use std::sync::Arc;

use polyplan_core::channel::ChannelKind;
use polyplan_core::id::{InstanceId, LineageId};
use polyplan_cost::CostEstimate;
use serde::Serialize;

use crate::error::PlatformError;
use crate::instance::ChannelInstance;
use crate::materialize::materialize;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ChannelConversion {
    pub from: ChannelKind,
    pub to: ChannelKind,
    /// Fixed cost of one conversion.
    pub startup: CostEstimate,
    /// Cost per converted quantum.
    pub per_quantum: CostEstimate,
}

impl ChannelConversion {
    pub fn new(from: ChannelKind, to: ChannelKind, startup: CostEstimate, per_quantum: CostEstimate) -> Self {
        Self {
            from,
            to,
            startup,
            per_quantum,
        }
    }

    /// Write memory data to a file.
    pub fn materialize(from: ChannelKind, to: ChannelKind) -> Self {
        Self::new(
            from,
            to,
            CostEstimate {
                io: 5.0,
                ..CostEstimate::ZERO
            },
            CostEstimate {
                io: 2.0,
                ..CostEstimate::ZERO
            },
        )
    }

    /// Read a file back into memory.
    pub fn reread(from: ChannelKind, to: ChannelKind) -> Self {
        Self::new(
            from,
            to,
            CostEstimate {
                io: 5.0,
                ..CostEstimate::ZERO
            },
            CostEstimate {
                io: 1.5,
                ..CostEstimate::ZERO
            },
        )
    }

    /// Re-label in-memory data (e.g. drain a stream into a collection).
    pub fn in_memory(from: ChannelKind, to: ChannelKind) -> Self {
        Self::new(from, to, CostEstimate::cpu(0.5), CostEstimate::cpu(0.2))
    }

    pub fn cost(&self, quanta: f64) -> CostEstimate {
        self.startup + self.per_quantum.scale(quanta.max(0.0))
    }

    /// Produce a new instance of kind `self.to` holding `src`'s data.
    pub fn apply(
        &self,
        src: &ChannelInstance,
        id: InstanceId,
        lineage: LineageId,
        scratch_dir: &Path,
    ) -> Result<ChannelInstance, PlatformError> {
        if src.kind() != self.from {
            return Err(PlatformError::NoConversion {
                from: src.kind().to_string(),
                to: self.to.to_string(),
            });
        }
        let items = src.read()?;
        let quanta = items.len() as u64;
        let data = materialize(items, self.to, scratch_dir, id)?;
        // Derived instances are owned by their source and released with it.
        Ok(ChannelInstance::new(
            id,
            src.channel(),
            src.producer(),
            self.to,
            data,
            quanta,
            lineage,
            0,
        ))
    }
}

/// Cheapest sequence of conversions between two kinds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConversionPath {
    pub from: ChannelKind,
    pub to: ChannelKind,
    pub steps: Vec<ChannelConversion>,
    pub cost: CostEstimate,
}

impl ConversionPath {
    pub fn identity(kind: ChannelKind) -> Self {
        Self {
            from: kind,
            to: kind,
            steps: Vec::new(),
            cost: CostEstimate::ZERO,
        }
    }

    pub fn is_identity(&self) -> bool {
        self.steps.is_empty()
    }

    /// Kinds visited, source first.
    pub fn kinds(&self) -> Vec<ChannelKind> {
        let mut out = vec![self.from];
        out.extend(self.steps.iter().map(|s| s.to));
        out
    }
}

/// Convert `src` along `path`, reusing cached intermediate instances.
///
/// `alloc` hands out a fresh instance id and lineage id per step and reports
/// each newly created instance (for lineage and metrics).
pub fn convert_along<F>(
    src: &Arc<ChannelInstance>,
    path: &ConversionPath,
    scratch_dir: &Path,
    mut alloc: F,
) -> Result<Arc<ChannelInstance>, PlatformError>
where
    F: FnMut(&ChannelInstance) -> (InstanceId, LineageId),
{
    let mut current = Arc::clone(src);
    for step in &path.steps {
        if let Some(cached) = current.derived(step.to) {
            current = cached;
            continue;
        }
        let (id, lineage) = alloc(&current);
        let next = Arc::new(step.apply(&current, id, lineage, scratch_dir)?);
        current = current.add_derived(next);
    }
    Ok(current)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance::ChannelData;
    use polyplan_core::id::{ChannelId, OperatorId};
    use polyplan_core::types::Quantum;

    #[test]
    fn conversion_cost_never_negative_and_grows() {
        let c = ChannelConversion::materialize(ChannelKind::COLLECTION, ChannelKind::FILE);
        assert!(c.cost(0.0).total() > 0.0);
        assert!(c.cost(100.0).total() > c.cost(10.0).total());
    }

    #[test]
    fn converting_through_a_file_round_trips_and_caches() {
        let dir = std::env::temp_dir().join(format!("polyplan-conv-{}", std::process::id()));
        let src = Arc::new(ChannelInstance::new(
            InstanceId::new(0),
            ChannelId::new(0),
            OperatorId::new(0),
            ChannelKind::COLLECTION,
            ChannelData::Memory(Arc::new(vec![Quantum::str("a"), Quantum::str("b")])),
            2,
            LineageId::new(0),
            1,
        ));
        let path = ConversionPath {
            from: ChannelKind::COLLECTION,
            to: ChannelKind::DATASET,
            steps: vec![
                ChannelConversion::materialize(ChannelKind::COLLECTION, ChannelKind::FILE),
                ChannelConversion::reread(ChannelKind::FILE, ChannelKind::DATASET),
            ],
            cost: CostEstimate::ZERO,
        };
        let mut next = 1;
        let mut created = 0;
        let mut alloc = |_: &ChannelInstance| {
            created += 1;
            next += 1;
            (InstanceId::new(next), LineageId::new(next))
        };
        let out = convert_along(&src, &path, &dir, &mut alloc).unwrap();
        assert_eq!(out.kind(), ChannelKind::DATASET);
        assert_eq!(out.read().unwrap().as_slice(), &[Quantum::str("a"), Quantum::str("b")]);

        let again = convert_along(&src, &path, &dir, &mut alloc).unwrap();
        assert!(Arc::ptr_eq(&out, &again));
        assert_eq!(created, 2);

        src.release();
        assert!(out.is_released());
        let _ = std::fs::remove_dir_all(&dir);
    }
}
