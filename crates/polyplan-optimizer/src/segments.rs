//! Execution segments and their fallback plans.
//!
//! A segment is a maximal set of operators on one platform connected by
//! native channels. Segments are the unit of fallback: if a dispatch inside
//! one fails, the whole segment is replayed on its precomputed alternative.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use polyplan_core::channel::ChannelKind;
use polyplan_core::id::{ChannelId, LoopId, OperatorId, PlatformId, SegmentId};
use polyplan_core::plan::{OperatorKind, Plan};
use polyplan_cost::CostEstimate;
use polyplan_platform::PlatformRegistry;

use crate::assignment::{ChannelPlan, FallbackPlan, Segment};
use crate::routing::plan_channel;

/// Group operators into segments. Ids follow the smallest member id.
pub fn build_segments(
    plan: &Plan,
    platforms: &BTreeMap<OperatorId, PlatformId>,
    channels: &BTreeMap<ChannelId, ChannelPlan>,
) -> Vec<Segment> {
    let ids: Vec<OperatorId> = platforms.keys().copied().collect();
    let index: HashMap<OperatorId, usize> = ids.iter().enumerate().map(|(i, op)| (*op, i)).collect();
    let mut parent: Vec<usize> = (0..ids.len()).collect();

    fn find(parent: &mut [usize], mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    for ch in plan.channels() {
        let Some(cp) = channels.get(&ch.id) else { continue };
        let producer = ch.producer.operator;
        for route in &cp.routes {
            let consumer = route.consumer.operator;
            if !route.is_native() || platforms.get(&producer) != platforms.get(&consumer) {
                continue;
            }
            let (Some(&a), Some(&b)) = (index.get(&producer), index.get(&consumer)) else {
                continue;
            };
            let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
            if ra != rb {
                // Smaller root keeps the smaller id at the top.
                let (lo, hi) = if ra < rb { (ra, rb) } else { (rb, ra) };
                parent[hi] = lo;
            }
        }
    }

    let mut groups: BTreeMap<usize, BTreeSet<OperatorId>> = BTreeMap::new();
    for (i, op) in ids.iter().enumerate() {
        let root = find(&mut parent, i);
        groups.entry(root).or_default().insert(*op);
    }

    groups
        .into_values()
        .enumerate()
        .filter_map(|(n, operators)| {
            let first = *operators.iter().next()?;
            let platform = platforms.get(&first)?.clone();
            let top_level = operators.iter().all(|op| {
                matches!(plan.scope_of(*op), Ok(None))
                    && plan
                        .operator(*op)
                        .map_or(false, |o| !o.kind().is_loop_control())
            });
            Some(Segment {
                id: SegmentId::new(n as u64),
                platform,
                operators,
                top_level,
            })
        })
        .collect()
}

/// Cheapest alternative platform for each top-level segment.
///
/// Segments whose output comes back into them through another operator or
/// loop get none: their outputs could not be withheld until they finish.
/// The alternative must be a candidate of every member. Channels entering
/// the segment keep their produced kind (their producers have already run by
/// the time a replay happens); everything else touching the segment is
/// rerouted. Ties go to the earlier-registered platform.
pub fn plan_fallbacks(
    plan: &Plan,
    registry: &PlatformRegistry,
    segments: &[Segment],
    candidates: &BTreeMap<OperatorId, Vec<PlatformId>>,
    platforms: &BTreeMap<OperatorId, PlatformId>,
    channels: &BTreeMap<ChannelId, ChannelPlan>,
    operator_costs: &HashMap<(OperatorId, PlatformId), CostEstimate>,
    quanta: &BTreeMap<ChannelId, f64>,
) -> BTreeMap<SegmentId, FallbackPlan> {
    let mut out = BTreeMap::new();
    let graph = TopLevelGraph::new(plan);
    for seg in segments.iter().filter(|s| s.top_level) {
        if graph.reenters(&seg.operators) {
            tracing::debug!(segment = %seg.id, "segment output re-enters it; no fallback");
            continue;
        }
        let mut best: Option<FallbackPlan> = None;
        for alt in registry.platform_ids() {
            if alt == seg.platform {
                continue;
            }
            let everywhere = seg
                .operators
                .iter()
                .all(|op| candidates.get(op).map_or(false, |c| c.contains(&alt)));
            if !everywhere {
                continue;
            }
            if let Some(fb) = fallback_on(
                plan, registry, seg, &alt, platforms, channels, operator_costs, quanta,
            ) {
                if best.as_ref().map_or(true, |b| fb.cost.total() < b.cost.total()) {
                    best = Some(fb);
                }
            }
        }
        match best {
            Some(fb) => {
                tracing::debug!(segment = %seg.id, from = %seg.platform, to = %fb.platform, "fallback planned");
                out.insert(seg.id, fb);
            }
            None => tracing::debug!(segment = %seg.id, "no fallback platform"),
        }
    }
    out
}

/// A top-level scheduling node: a plain operator, or a whole top-level loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Node {
    Op(OperatorId),
    Loop(LoopId),
}

/// Data dependencies between top-level nodes.
struct TopLevelGraph {
    successors: BTreeMap<Node, BTreeSet<Node>>,
}

impl TopLevelGraph {
    fn new(plan: &Plan) -> Self {
        let mut successors: BTreeMap<Node, BTreeSet<Node>> = BTreeMap::new();
        for ch in plan.channels() {
            let Some(from) = top_node(plan, ch.producer.operator) else {
                continue;
            };
            for consumer in &ch.consumers {
                match top_node(plan, consumer.operator) {
                    Some(to) if to != from => {
                        successors.entry(from).or_default().insert(to);
                    }
                    _ => {}
                }
            }
        }
        Self { successors }
    }

    /// Does data leaving `members` flow back into them?
    fn reenters(&self, members: &BTreeSet<OperatorId>) -> bool {
        let inside = |n: &Node| matches!(n, Node::Op(op) if members.contains(op));
        let mut seen: BTreeSet<Node> = BTreeSet::new();
        let mut queue: VecDeque<Node> = members
            .iter()
            .filter_map(|op| self.successors.get(&Node::Op(*op)))
            .flatten()
            .filter(|n| !inside(n))
            .copied()
            .collect();
        while let Some(n) = queue.pop_front() {
            if !seen.insert(n) {
                continue;
            }
            for next in self.successors.get(&n).into_iter().flatten() {
                if inside(next) {
                    return true;
                }
                queue.push_back(*next);
            }
        }
        false
    }
}

/// The top-level node `op` runs in.
fn top_node(plan: &Plan, op: OperatorId) -> Option<Node> {
    let mut scope = match plan.operator(op)?.kind() {
        OperatorKind::LoopHead(l) | OperatorKind::LoopOutput(l) => Some(*l),
        _ => plan.scope_of(op).ok()?,
    };
    let mut outermost = None;
    while let Some(l) = scope {
        outermost = Some(l);
        scope = plan.loop_spec(l)?.parent;
    }
    Some(outermost.map_or(Node::Op(op), Node::Loop))
}

#[allow(clippy::too_many_arguments)]
fn fallback_on(
    plan: &Plan,
    registry: &PlatformRegistry,
    seg: &Segment,
    alt: &PlatformId,
    platforms: &BTreeMap<OperatorId, PlatformId>,
    channels: &BTreeMap<ChannelId, ChannelPlan>,
    operator_costs: &HashMap<(OperatorId, PlatformId), CostEstimate>,
    quanta: &BTreeMap<ChannelId, f64>,
) -> Option<FallbackPlan> {
    let on = |op: &OperatorId| -> Option<PlatformId> {
        if seg.operators.contains(op) {
            Some(alt.clone())
        } else {
            platforms.get(op).cloned()
        }
    };

    let mut cost = CostEstimate::ZERO;
    for op in &seg.operators {
        cost += operator_costs
            .get(&(*op, alt.clone()))
            .copied()
            .unwrap_or(CostEstimate::ZERO);
    }

    let mut replanned = BTreeMap::new();
    for ch in plan.channels() {
        let inside_producer = seg.operators.contains(&ch.producer.operator);
        let touches = inside_producer
            || ch
                .consumers
                .iter()
                .any(|c| seg.operators.contains(&c.operator));
        if !touches {
            continue;
        }
        let producer = on(&ch.producer.operator)?;
        let consumers: Vec<PlatformId> = ch
            .consumers
            .iter()
            .map(|c| on(&c.operator))
            .collect::<Option<_>>()?;
        let fixed: Option<ChannelKind> = if inside_producer {
            None
        } else {
            channels.get(&ch.id).map(|c| c.produced)
        };
        let q = quanta.get(&ch.id).copied().unwrap_or(0.0);
        let cp = plan_channel(plan, registry, ch, &producer, &consumers, q, fixed).ok()?;
        cost += cp.cost;
        replanned.insert(ch.id, cp);
    }

    Some(FallbackPlan {
        segment: seg.id,
        platform: alt.clone(),
        channels: replanned,
        cost,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyplan_core::plan::{LoopDef, Operator, HEAD_INITIAL};
    use polyplan_core::types::{DataUnitType, Quantum, SlotType};
    use polyplan_platform::LocalPlatform;
    use std::sync::Arc;

    #[test]
    fn native_same_platform_edges_merge_and_others_split() {
        let mut plan = Plan::new();
        let src = plan
            .add(Operator::collection_source(vec![Quantum::Int(1)], DataUnitType::Int))
            .unwrap();
        let map = plan
            .add(Operator::map(DataUnitType::Int, DataUnitType::Int, |q| q.clone()))
            .unwrap();
        let sink = plan
            .add(Operator::collect_sink(SlotType::single(DataUnitType::Int)))
            .unwrap();
        plan.pipe(src, map).unwrap();
        plan.pipe(map, sink).unwrap();

        let registry = PlatformRegistry::builder()
            .register(Arc::new(LocalPlatform::new("a")))
            .unwrap()
            .register(Arc::new(LocalPlatform::new("b")))
            .unwrap()
            .build();
        let platforms = BTreeMap::from([
            (src, PlatformId::new("a")),
            (map, PlatformId::new("a")),
            (sink, PlatformId::new("b")),
        ]);
        let mut channels = BTreeMap::new();
        for ch in plan.channels() {
            let producer = platforms[&ch.producer.operator].clone();
            let consumers: Vec<_> = ch.consumers.iter().map(|c| platforms[&c.operator].clone()).collect();
            let cp = plan_channel(&plan, &registry, ch, &producer, &consumers, 1.0, None).unwrap();
            channels.insert(ch.id, cp);
        }

        let segs = build_segments(&plan, &platforms, &channels);
        assert_eq!(segs.len(), 2);
        assert_eq!(segs[0].operators, BTreeSet::from([src, map]));
        assert_eq!(segs[1].operators, BTreeSet::from([sink]));
        assert!(segs.iter().all(|s| s.top_level));

        let both = vec![PlatformId::new("a"), PlatformId::new("b")];
        let candidates = BTreeMap::from([(src, both.clone()), (map, both.clone()), (sink, both)]);
        let costs = HashMap::new();
        let quanta = BTreeMap::new();
        let fbs = plan_fallbacks(&plan, &registry, &segs, &candidates, &platforms, &channels, &costs, &quanta);
        assert_eq!(fbs[&segs[0].id].platform.as_str(), "b");
        assert_eq!(fbs[&segs[1].id].platform.as_str(), "a");
        assert_eq!(fbs[&segs[0].id].channels.len(), 2);
    }

    #[test]
    fn segments_fed_back_through_other_units_are_detected() {
        let ty = SlotType::single(DataUnitType::Int);
        // src -> merge.0, src -> map -> merge.1, merge -> sink
        let mut plan = Plan::new();
        let src = plan
            .add(Operator::collection_source(vec![Quantum::Int(1)], DataUnitType::Int))
            .unwrap();
        let map = plan
            .add(Operator::map(DataUnitType::Int, DataUnitType::Int, |q| q.clone()))
            .unwrap();
        let merge = plan.add(Operator::union(DataUnitType::Int)).unwrap();
        let sink = plan.add(Operator::collect_sink(ty)).unwrap();
        plan.connect(src, 0, merge, 0).unwrap();
        plan.pipe(src, map).unwrap();
        plan.connect(map, 0, merge, 1).unwrap();
        plan.pipe(merge, sink).unwrap();

        let graph = TopLevelGraph::new(&plan);
        assert!(graph.reenters(&BTreeSet::from([src, merge, sink])));
        assert!(!graph.reenters(&BTreeSet::from([map])));
        assert!(!graph.reenters(&BTreeSet::from([src, map, merge, sink])));

        // the same shape with a loop where the map was
        let mut plan = Plan::new();
        let src = plan
            .add(Operator::collection_source(vec![Quantum::Int(1)], DataUnitType::Int))
            .unwrap();
        let l = plan.add_loop(LoopDef::repeat("l", ty, 2)).unwrap();
        let body = plan
            .add_to_loop(l.id, Operator::map(DataUnitType::Int, DataUnitType::Int, |q| q.clone()))
            .unwrap();
        plan.close_loop(l.id, body, body).unwrap();
        let merge = plan.add(Operator::union(DataUnitType::Int)).unwrap();
        plan.connect(src, 0, l.head, HEAD_INITIAL).unwrap();
        plan.connect(src, 0, merge, 0).unwrap();
        plan.connect(l.output, 0, merge, 1).unwrap();

        let graph = TopLevelGraph::new(&plan);
        assert!(graph.reenters(&BTreeSet::from([src, merge])));
        assert!(!graph.reenters(&BTreeSet::from([merge])));
    }
}
