//! Platform and channel registry.
//!
//! Built once per caller context and shared by reference. Registration order
//! is kept and used for every deterministic tie-break downstream.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use polyplan_core::channel::{ChannelKind, ChannelStorage};
use polyplan_core::id::PlatformId;
use polyplan_cost::CostEstimate;

use crate::conversion::{ChannelConversion, ConversionPath};
use crate::error::RegistryError;
use crate::platform::Platform;

pub struct PlatformRegistry {
    platforms: Vec<Arc<dyn Platform>>,
    index: HashMap<PlatformId, usize>,
    conversions: Vec<ChannelConversion>,
}

pub struct RegistryBuilder {
    platforms: Vec<Arc<dyn Platform>>,
    index: HashMap<PlatformId, usize>,
    conversions: Vec<ChannelConversion>,
    standard_conversions: bool,
}

impl PlatformRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            platforms: Vec::new(),
            index: HashMap::new(),
            conversions: Vec::new(),
            standard_conversions: true,
        }
    }

    pub fn get(&self, id: &PlatformId) -> Option<&Arc<dyn Platform>> {
        self.index.get(id).map(|i| &self.platforms[*i])
    }

    pub fn contains(&self, id: &PlatformId) -> bool {
        self.index.contains_key(id)
    }

    /// Registration position; lower wins ties.
    pub fn position(&self, id: &PlatformId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Platforms in registration order.
    pub fn platforms(&self) -> impl Iterator<Item = &Arc<dyn Platform>> {
        self.platforms.iter()
    }

    pub fn platform_ids(&self) -> Vec<PlatformId> {
        self.platforms.iter().map(|p| p.id().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.platforms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.platforms.is_empty()
    }

    pub fn conversions(&self) -> &[ChannelConversion] {
        &self.conversions
    }

    /// Platforms that produce or consume `kind`, in registration order.
    pub fn platforms_compatible_with(&self, kind: ChannelKind) -> Vec<PlatformId> {
        self.platforms
            .iter()
            .filter(|p| {
                p.produced_channel_kinds().contains(&kind)
                    || p.consumed_channel_kinds().contains(&kind)
            })
            .map(|p| p.id().clone())
            .collect()
    }

    /// Kinds `src` produces that `dst` consumes, in `src`'s preference order.
    /// Empty means a conversion through some intermediate kind is needed.
    pub fn channel_kinds_bridging(&self, src: &PlatformId, dst: &PlatformId) -> Vec<ChannelKind> {
        let (Some(s), Some(d)) = (self.get(src), self.get(dst)) else {
            return Vec::new();
        };
        let consumed = d.consumed_channel_kinds();
        s.produced_channel_kinds()
            .into_iter()
            .filter(|k| consumed.contains(k))
            .collect()
    }

    /// Cheapest conversion route from `from` to any of `targets` for
    /// `quanta` quanta. Identity if `from` is already a target.
    ///
    /// Dijkstra over conversion edges; on equal cost the earlier-registered
    /// edge and the earlier-listed target win.
    pub fn conversion_path(
        &self,
        from: ChannelKind,
        targets: &[ChannelKind],
        quanta: f64,
    ) -> Option<ConversionPath> {
        if targets.contains(&from) {
            return Some(ConversionPath::identity(from));
        }

        let mut nodes: Vec<ChannelKind> = vec![from];
        for c in &self.conversions {
            for k in [c.from, c.to] {
                if !nodes.contains(&k) {
                    nodes.push(k);
                }
            }
        }
        let n = nodes.len();
        let idx = |k: ChannelKind| nodes.iter().position(|x| *x == k);

        let mut dist: Vec<Option<f64>> = vec![None; n];
        let mut via: Vec<Option<usize>> = vec![None; n];
        let mut done = vec![false; n];
        dist[0] = Some(0.0);

        loop {
            let mut best: Option<usize> = None;
            for i in 0..n {
                if done[i] {
                    continue;
                }
                if let Some(d) = dist[i] {
                    let better = match best.and_then(|b| dist[b]) {
                        None => true,
                        Some(bd) => d < bd,
                    };
                    if better {
                        best = Some(i);
                    }
                }
            }
            let Some(u) = best else {
                break;
            };
            done[u] = true;
            let du = dist[u].unwrap_or(0.0);

            for (ci, c) in self.conversions.iter().enumerate() {
                if c.from != nodes[u] {
                    continue;
                }
                let Some(v) = idx(c.to) else { continue };
                if done[v] {
                    continue;
                }
                let nd = du + c.cost(quanta).total();
                if dist[v].map_or(true, |dv| nd < dv) {
                    dist[v] = Some(nd);
                    via[v] = Some(ci);
                }
            }
        }

        let target = targets
            .iter()
            .filter_map(|t| idx(*t).and_then(|i| dist[i].map(|d| (i, d))))
            .fold(None::<(usize, f64)>, |acc, (i, d)| match acc {
                Some((_, bd)) if bd <= d => acc,
                _ => Some((i, d)),
            })?;

        let mut steps = Vec::new();
        let mut cur = target.0;
        while let Some(ci) = via[cur] {
            let c = self.conversions[ci];
            steps.push(c);
            cur = idx(c.from)?;
        }
        steps.reverse();
        let cost = steps
            .iter()
            .fold(CostEstimate::ZERO, |acc, s| acc + s.cost(quanta));
        Some(ConversionPath {
            from,
            to: nodes[target.0],
            steps,
            cost,
        })
    }
}

impl fmt::Debug for PlatformRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PlatformRegistry")
            .field("platforms", &self.platform_ids())
            .field("conversions", &self.conversions.len())
            .finish()
    }
}

impl RegistryBuilder {
    /// Add a platform. Fails if it has no channel kind it can both produce
    /// and consume, or if its name is taken.
    pub fn register(mut self, platform: Arc<dyn Platform>) -> Result<Self, RegistryError> {
        let id = platform.id().clone();
        if self.index.contains_key(&id) {
            return Err(RegistryError::DuplicatePlatform(id));
        }
        let consumed = platform.consumed_channel_kinds();
        if !platform
            .produced_channel_kinds()
            .iter()
            .any(|k| consumed.contains(k))
        {
            return Err(RegistryError::NoSelfChannel(id));
        }
        tracing::debug!(platform = %id, "registered platform");
        self.index.insert(id, self.platforms.len());
        self.platforms.push(platform);
        Ok(self)
    }

    pub fn conversion(mut self, conversion: ChannelConversion) -> Self {
        self.conversions.push(conversion);
        self
    }

    /// Only use explicitly added conversions.
    pub fn without_standard_conversions(mut self) -> Self {
        self.standard_conversions = false;
        self
    }

    /// Finish. Standard conversions (every memory kind to and from `file`,
    /// `stream` to `collection`) are appended after explicit ones, so explicit
    /// conversions win ties.
    pub fn build(mut self) -> PlatformRegistry {
        if self.standard_conversions {
            let mut kinds: Vec<ChannelKind> = Vec::new();
            for p in &self.platforms {
                for k in p
                    .produced_channel_kinds()
                    .into_iter()
                    .chain(p.consumed_channel_kinds())
                {
                    if !kinds.contains(&k) {
                        kinds.push(k);
                    }
                }
            }
            let mut standard = Vec::new();
            for k in &kinds {
                if k.storage == ChannelStorage::Memory {
                    standard.push(ChannelConversion::materialize(*k, ChannelKind::FILE));
                    standard.push(ChannelConversion::reread(ChannelKind::FILE, *k));
                }
            }
            if kinds.contains(&ChannelKind::STREAM) {
                standard.push(ChannelConversion::in_memory(
                    ChannelKind::STREAM,
                    ChannelKind::COLLECTION,
                ));
            }
            for c in standard {
                let dup = self
                    .conversions
                    .iter()
                    .any(|e| e.from == c.from && e.to == c.to);
                if !dup {
                    self.conversions.push(c);
                }
            }
        }
        PlatformRegistry {
            platforms: self.platforms,
            index: self.index,
            conversions: self.conversions,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalPlatform;

    fn registry() -> PlatformRegistry {
        PlatformRegistry::builder()
            .register(Arc::new(LocalPlatform::new("alpha").with_channel_kinds(
                vec![ChannelKind::COLLECTION],
                vec![ChannelKind::COLLECTION],
            )))
            .unwrap()
            .register(Arc::new(LocalPlatform::new("beta").with_channel_kinds(
                vec![ChannelKind::DATASET],
                vec![ChannelKind::DATASET],
            )))
            .unwrap()
            .build()
    }

    #[test]
    fn registration_rejects_platform_without_self_channel() {
        let err = PlatformRegistry::builder()
            .register(Arc::new(LocalPlatform::new("odd").with_channel_kinds(
                vec![ChannelKind::COLLECTION],
                vec![ChannelKind::DATASET],
            )))
            .err();
        assert_eq!(err, Some(RegistryError::NoSelfChannel(PlatformId::new("odd"))));
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = PlatformRegistry::builder()
            .register(Arc::new(LocalPlatform::new("java")))
            .unwrap()
            .register(Arc::new(LocalPlatform::new("java")))
            .err();
        assert_eq!(err, Some(RegistryError::DuplicatePlatform(PlatformId::new("java"))));
    }

    #[test]
    fn disjoint_platforms_need_a_file_hop() {
        let reg = registry();
        let alpha = PlatformId::new("alpha");
        let beta = PlatformId::new("beta");
        assert!(reg.channel_kinds_bridging(&alpha, &beta).is_empty());
        assert_eq!(reg.channel_kinds_bridging(&alpha, &alpha), vec![ChannelKind::COLLECTION]);

        let path = reg
            .conversion_path(ChannelKind::COLLECTION, &[ChannelKind::DATASET], 10.0)
            .unwrap();
        assert_eq!(
            path.kinds(),
            vec![ChannelKind::COLLECTION, ChannelKind::FILE, ChannelKind::DATASET]
        );
        assert!(path.cost.total() > 0.0);
        assert_eq!(reg.platforms_compatible_with(ChannelKind::DATASET), vec![beta]);
    }

    #[test]
    fn identity_and_missing_routes() {
        let reg = registry();
        let id = reg
            .conversion_path(ChannelKind::COLLECTION, &[ChannelKind::COLLECTION], 5.0)
            .unwrap();
        assert!(id.is_identity());

        let bare = PlatformRegistry::builder()
            .register(Arc::new(LocalPlatform::new("a")))
            .unwrap()
            .without_standard_conversions()
            .build();
        assert!(bare
            .conversion_path(ChannelKind::COLLECTION, &[ChannelKind::DATASET], 5.0)
            .is_none());
    }
}
