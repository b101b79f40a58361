//! Platform assignment search.
//!
//! Depth-first branch-and-bound over operators in topological order. A
//! channel is routed (and its conversion cost paid) as soon as its last
//! endpoint is assigned. The bound is the cost so far plus the cheapest
//! possible cost of every operator still unassigned.
//!
//! When the product of candidate counts exceeds the enumeration limit, a
//! greedy pass picks the locally cheapest platform per operator instead. It
//! backs up at most one operator when it gets stuck, so it can still report
//! an infeasible plan that a full search would have solved.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use polyplan_core::channel::ChannelKind;
use polyplan_core::id::{ChannelId, OperatorId, PlatformId};
use polyplan_core::plan::Plan;
use polyplan_cost::CostEstimate;
use polyplan_platform::PlatformRegistry;

use crate::assignment::{ChannelPlan, SearchStrategy};
use crate::error::OptimizerError;
use crate::routing::{plan_channel, RouteFailure};

const EPSILON: f64 = 1e-9;

/// Everything the search reads. Costs are already scaled by loop multipliers.
pub struct SearchSpace<'a> {
    pub plan: &'a Plan,
    pub registry: &'a PlatformRegistry,
    pub order: &'a [OperatorId],
    pub candidates: &'a BTreeMap<OperatorId, Vec<PlatformId>>,
    pub operator_costs: &'a HashMap<(OperatorId, PlatformId), CostEstimate>,
    /// Quanta crossing each channel.
    pub quanta: &'a BTreeMap<ChannelId, f64>,
    /// How often each channel is materialized (loop multipliers).
    pub channel_multipliers: &'a BTreeMap<ChannelId, f64>,
    /// Produced kinds that can no longer change.
    pub fixed_kinds: &'a BTreeMap<ChannelId, ChannelKind>,
    pub enumeration_limit: u64,
}

#[derive(Debug, Clone)]
pub struct SearchResult {
    pub platforms: BTreeMap<OperatorId, PlatformId>,
    pub channels: BTreeMap<ChannelId, ChannelPlan>,
    pub operator_costs: BTreeMap<OperatorId, CostEstimate>,
    pub total_cost: CostEstimate,
    pub strategy: SearchStrategy,
}

type RouteKey = (ChannelId, Vec<PlatformId>);

struct Search<'s, 'a> {
    space: &'s SearchSpace<'a>,
    /// Channels whose last endpoint sits at each position of `order`.
    closing: Vec<Vec<ChannelId>>,
    /// Cheapest remaining operator cost from each position on.
    suffix_min: Vec<f64>,
    routes: HashMap<RouteKey, Result<ChannelPlan, RouteFailure>>,
    first_failure: Option<(ChannelId, RouteFailure)>,
    assigned: BTreeMap<OperatorId, PlatformId>,
    channels: BTreeMap<ChannelId, ChannelPlan>,
    best: Option<Best>,
    explored: u64,
}

#[derive(Debug, Clone)]
struct Best {
    cost: CostEstimate,
    tie_key: (usize, Vec<usize>),
    platforms: BTreeMap<OperatorId, PlatformId>,
    channels: BTreeMap<ChannelId, ChannelPlan>,
}

/// Search for the cheapest feasible assignment.
pub fn search(space: &SearchSpace<'_>) -> Result<SearchResult, OptimizerError> {
    let combinations = space
        .order
        .iter()
        .map(|op| space.candidates.get(op).map_or(0, |c| c.len()) as u64)
        .try_fold(1u64, |acc, n| acc.checked_mul(n));
    let exhaustive = combinations.map_or(false, |n| n <= space.enumeration_limit);

    let mut s = Search::new(space);
    let best = if exhaustive {
        s.descend(0, CostEstimate::ZERO);
        tracing::debug!(explored = s.explored, "exhaustive search finished");
        s.best.take()
    } else {
        tracing::debug!(
            limit = space.enumeration_limit,
            "candidate space too large; using greedy assignment"
        );
        s.greedy()
    };

    let Some(best) = best else {
        return Err(match s.first_failure {
            Some((channel, f)) => OptimizerError::ConversionUnavailable {
                channel,
                from: f.from,
                to: f.to,
            },
            None => OptimizerError::NoAssignment,
        });
    };

    let operator_costs = best
        .platforms
        .iter()
        .map(|(op, p)| (*op, op_cost(space, *op, p)))
        .collect();
    Ok(SearchResult {
        platforms: best.platforms,
        channels: best.channels,
        operator_costs,
        total_cost: best.cost,
        strategy: if exhaustive {
            SearchStrategy::Exhaustive {
                explored: s.explored,
            }
        } else {
            SearchStrategy::Greedy
        },
    })
}

fn op_cost(space: &SearchSpace<'_>, op: OperatorId, platform: &PlatformId) -> CostEstimate {
    space
        .operator_costs
        .get(&(op, platform.clone()))
        .copied()
        .unwrap_or(CostEstimate::ZERO)
}

impl<'s, 'a> Search<'s, 'a> {
    fn new(space: &'s SearchSpace<'a>) -> Self {
        let position: HashMap<OperatorId, usize> = space
            .order
            .iter()
            .enumerate()
            .map(|(i, op)| (*op, i))
            .collect();

        let mut closing = vec![Vec::new(); space.order.len()];
        for ch in space.plan.channels() {
            let last = std::iter::once(ch.producer.operator)
                .chain(ch.consumers.iter().map(|c| c.operator))
                .filter_map(|op| position.get(&op).copied())
                .max();
            if let Some(i) = last {
                closing[i].push(ch.id);
            }
        }

        let mut suffix_min = vec![0.0; space.order.len() + 1];
        for i in (0..space.order.len()).rev() {
            let op = space.order[i];
            let cheapest = space
                .candidates
                .get(&op)
                .into_iter()
                .flatten()
                .map(|p| op_cost(space, op, p).total())
                .fold(f64::INFINITY, f64::min);
            let cheapest = if cheapest.is_finite() { cheapest } else { 0.0 };
            suffix_min[i] = suffix_min[i + 1] + cheapest;
        }

        Self {
            space,
            closing,
            suffix_min,
            routes: HashMap::new(),
            first_failure: None,
            assigned: BTreeMap::new(),
            channels: BTreeMap::new(),
            best: None,
            explored: 0,
        }
    }

    /// Route a channel whose endpoints are all assigned.
    fn route(&mut self, channel: ChannelId) -> Option<ChannelPlan> {
        let space = self.space;
        let ch = space.plan.channel(channel)?;
        let producer = self.assigned.get(&ch.producer.operator)?.clone();
        let consumers: Vec<PlatformId> = ch
            .consumers
            .iter()
            .map(|c| self.assigned.get(&c.operator).cloned())
            .collect::<Option<_>>()?;

        let mut key_platforms = Vec::with_capacity(consumers.len() + 1);
        key_platforms.push(producer.clone());
        key_platforms.extend(consumers.iter().cloned());
        let key = (channel, key_platforms);

        let result = match self.routes.get(&key) {
            Some(r) => r.clone(),
            None => {
                let quanta = space.quanta.get(&channel).copied().unwrap_or(0.0);
                let r = plan_channel(
                    space.plan,
                    space.registry,
                    ch,
                    &producer,
                    &consumers,
                    quanta,
                    space.fixed_kinds.get(&channel).copied(),
                );
                self.routes.insert(key, r.clone());
                r
            }
        };
        match result {
            Ok(plan) => Some(plan),
            Err(f) => {
                if self.first_failure.is_none() {
                    self.first_failure = Some((channel, f));
                }
                None
            }
        }
    }

    fn channel_cost(&self, plan: &ChannelPlan) -> CostEstimate {
        let m = self
            .space
            .channel_multipliers
            .get(&plan.channel)
            .copied()
            .unwrap_or(1.0);
        plan.cost.scale(m)
    }

    /// Assign `order[i]` on its candidate platform `platform` and route every
    /// channel that closes here. `None` if some channel cannot be routed.
    fn step(&mut self, i: usize, platform: &PlatformId) -> Option<(CostEstimate, Vec<ChannelId>)> {
        let op = self.space.order[i];
        self.assigned.insert(op, platform.clone());
        let mut cost = op_cost(self.space, op, platform);
        let mut routed = Vec::new();
        for ch in self.closing[i].clone() {
            match self.route(ch) {
                Some(plan) => {
                    cost += self.channel_cost(&plan);
                    self.channels.insert(ch, plan);
                    routed.push(ch);
                }
                None => {
                    self.undo(op, &routed);
                    return None;
                }
            }
        }
        Some((cost, routed))
    }

    fn undo(&mut self, op: OperatorId, routed: &[ChannelId]) {
        self.assigned.remove(&op);
        for ch in routed {
            self.channels.remove(ch);
        }
    }

    fn descend(&mut self, i: usize, so_far: CostEstimate) {
        if i == self.space.order.len() {
            self.explored += 1;
            self.offer(so_far);
            return;
        }
        let op = self.space.order[i];
        let candidates = self.space.candidates.get(&op).cloned().unwrap_or_default();
        for platform in &candidates {
            let Some((cost, routed)) = self.step(i, platform) else {
                continue;
            };
            let reached = so_far + cost;
            let bound = reached.total() + self.suffix_min[i + 1];
            let prune = self
                .best
                .as_ref()
                .map_or(false, |b| bound > b.cost.total() + EPSILON);
            if !prune {
                self.descend(i + 1, reached);
            }
            self.undo(op, &routed);
        }
    }

    /// Feasible platforms for `order[i]` given everything assigned before it,
    /// cheapest first (registration order on ties). Leaves nothing assigned.
    fn ranked(&mut self, i: usize, skip: Option<&PlatformId>) -> Vec<(PlatformId, CostEstimate)> {
        let op = self.space.order[i];
        let candidates = self.space.candidates.get(&op).cloned().unwrap_or_default();
        let mut out = Vec::new();
        for platform in candidates.iter().filter(|p| Some(*p) != skip) {
            if let Some((cost, routed)) = self.step(i, platform) {
                self.undo(op, &routed);
                out.push((platform.clone(), cost));
            }
        }
        out.sort_by(|a, b| a.1.total().total_cmp(&b.1.total()));
        out
    }

    /// Assign `order[i]` its locally cheapest feasible platform.
    fn commit_cheapest(&mut self, i: usize) -> Option<(PlatformId, CostEstimate, Vec<ChannelId>)> {
        let (platform, _) = self.ranked(i, None).into_iter().next()?;
        let (cost, routed) = self.step(i, &platform)?;
        Some((platform, cost, routed))
    }

    /// One cheapest-first pass in topological order. When an operator has no
    /// feasible platform, the previous operator is moved once to each of its
    /// other platforms before giving up; nothing further back is revisited.
    fn greedy(&mut self) -> Option<Best> {
        let n = self.space.order.len();
        let mut steps: Vec<(PlatformId, CostEstimate, Vec<ChannelId>)> = Vec::with_capacity(n);
        while steps.len() < n {
            let i = steps.len();
            if let Some(step) = self.commit_cheapest(i) {
                steps.push(step);
                continue;
            }

            let (prev, _, routed) = steps.pop()?;
            let prev_op = self.space.order[i - 1];
            self.undo(prev_op, &routed);
            let mut repaired = false;
            for (alt, _) in self.ranked(i - 1, Some(&prev)) {
                let Some((cost, routed)) = self.step(i - 1, &alt) else {
                    continue;
                };
                if let Some(next) = self.commit_cheapest(i) {
                    tracing::debug!(operator = %prev_op, from = %prev, to = %alt, "greedy assignment repaired");
                    steps.push((alt, cost, routed));
                    steps.push(next);
                    repaired = true;
                    break;
                }
                self.undo(prev_op, &routed);
            }
            if !repaired {
                return None;
            }
        }

        let total = steps
            .iter()
            .fold(CostEstimate::ZERO, |acc, (_, cost, _)| acc + *cost);
        self.offer(total);
        self.best.take()
    }

    /// Keep the current complete assignment if it beats the best so far:
    /// lower cost, then fewer distinct platforms, then earlier-registered
    /// platforms in operator id order.
    fn offer(&mut self, cost: CostEstimate) {
        let distinct: BTreeSet<&PlatformId> = self.assigned.values().collect();
        let positions: Vec<usize> = self
            .assigned
            .values()
            .map(|p| self.space.registry.position(p).unwrap_or(usize::MAX))
            .collect();
        let tie_key = (distinct.len(), positions);

        let better = match &self.best {
            None => true,
            Some(b) => {
                let (c, bc) = (cost.total(), b.cost.total());
                if c + EPSILON < bc {
                    true
                } else if (c - bc).abs() <= EPSILON {
                    tie_key < b.tie_key
                } else {
                    false
                }
            }
        };
        if better {
            self.best = Some(Best {
                cost,
                tie_key,
                platforms: self.assigned.clone(),
                channels: self.channels.clone(),
            });
        }
    }
}
