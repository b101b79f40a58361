//! Channel routing: which kind a producer writes and how each consumer reads it.

use polyplan_core::channel::ChannelKind;
use polyplan_core::id::{PlatformId, SlotRef};
use polyplan_core::plan::{Channel, OperatorKind, Plan};
use polyplan_cost::CostEstimate;
use polyplan_platform::{ConversionPath, PlatformRegistry};

use crate::assignment::{ChannelPlan, ConsumerRoute};

/// Why a channel could not be routed: no path from `from`'s kinds to `to`'s.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteFailure {
    pub from: PlatformId,
    pub to: PlatformId,
}

/// Does `consumer` read the data more than once?
///
/// Loop heads read their state for the convergence check and again for the
/// dispatch; body operators reading data from outside the loop read it once
/// per iteration.
pub fn consumer_rereads(plan: &Plan, channel: &Channel, consumer: SlotRef) -> bool {
    if matches!(
        plan.operator(consumer.operator).map(|o| o.kind()),
        Some(OperatorKind::LoopHead(_))
    ) {
        return true;
    }
    match (plan.output_scope(channel.producer), plan.input_scope(consumer)) {
        (Ok(from), Ok(to)) => from != to && plan.is_within(to, from),
        _ => false,
    }
}

/// Must the produced kind be readable more than once?
///
/// With fallback enabled any consumer may be replayed, so every channel is.
pub fn requires_reusable(plan: &Plan, channel: &Channel) -> bool {
    plan.fallback_enabled()
        || channel.consumers.len() > 1
        || channel
            .consumers
            .iter()
            .any(|c| consumer_rereads(plan, channel, *c))
}

/// Route `channel` given the platforms of its producer and consumers
/// (`consumers[i]` runs `channel.consumers[i]`).
///
/// Produced kinds are tried in the producer's preference order; the cheapest
/// total conversion cost wins, earlier preference on ties. `fixed_produced`
/// pins the produced kind (the producer already ran).
#[allow(clippy::too_many_arguments)]
pub fn plan_channel(
    plan: &Plan,
    registry: &PlatformRegistry,
    channel: &Channel,
    producer: &PlatformId,
    consumers: &[PlatformId],
    quanta: f64,
    fixed_produced: Option<ChannelKind>,
) -> Result<ChannelPlan, RouteFailure> {
    let first_consumer = consumers.first().cloned().unwrap_or_else(|| producer.clone());
    let fail = |to: PlatformId| RouteFailure {
        from: producer.clone(),
        to,
    };

    let Some(prod_platform) = registry.get(producer) else {
        return Err(fail(first_consumer));
    };
    let producer_key = plan
        .operator(channel.producer.operator)
        .map(|o| o.key())
        .unwrap_or_default();

    let reusable = requires_reusable(plan, channel);
    let produced: Vec<ChannelKind> = match fixed_produced {
        Some(k) => vec![k],
        None => prod_platform
            .supported_output_channel_kinds(producer_key)
            .into_iter()
            .filter(|k| k.reusable || !reusable)
            .collect(),
    };

    // Per-consumer accepted kinds.
    let mut accepted: Vec<Vec<ChannelKind>> = Vec::with_capacity(consumers.len());
    for (slot, platform) in channel.consumers.iter().zip(consumers) {
        let Some(p) = registry.get(platform) else {
            return Err(fail(platform.clone()));
        };
        let key = plan
            .operator(slot.operator)
            .map(|o| o.key())
            .unwrap_or_default();
        let rereads = consumer_rereads(plan, channel, *slot);
        accepted.push(
            p.supported_input_channel_kinds(key)
                .into_iter()
                .filter(|k| k.reusable || !rereads)
                .collect(),
        );
    }

    let mut best: Option<ChannelPlan> = None;
    let mut first_failure: Option<RouteFailure> = None;

    for kind in produced {
        let mut routes = Vec::with_capacity(consumers.len());
        let mut cost = CostEstimate::ZERO;
        let mut paid: Vec<ConversionPath> = Vec::new();
        let mut ok = true;

        for ((slot, platform), targets) in channel.consumers.iter().zip(consumers).zip(&accepted) {
            match registry.conversion_path(kind, targets, quanta) {
                Some(path) => {
                    // Identical conversions share one derived instance at runtime.
                    if !path.is_identity() && !paid.contains(&path) {
                        cost += path.cost;
                        paid.push(path.clone());
                    }
                    routes.push(ConsumerRoute {
                        consumer: *slot,
                        path,
                    });
                }
                None => {
                    if first_failure.is_none() {
                        first_failure = Some(fail(platform.clone()));
                    }
                    ok = false;
                    break;
                }
            }
        }
        if !ok {
            continue;
        }
        let better = best
            .as_ref()
            .map_or(true, |b| cost.total() < b.cost.total());
        if better {
            best = Some(ChannelPlan {
                channel: channel.id,
                produced: kind,
                routes,
                cost,
            });
        }
    }

    best.ok_or_else(|| first_failure.unwrap_or_else(|| fail(first_consumer)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use polyplan_core::plan::Operator;
    use polyplan_core::types::{DataUnitType, Quantum, SlotType};
    use polyplan_platform::LocalPlatform;
    use std::sync::Arc;

    fn setup() -> (Plan, PlatformRegistry, Channel) {
        let mut plan = Plan::new();
        let src = plan
            .add(Operator::collection_source(vec![Quantum::Int(1)], DataUnitType::Int))
            .unwrap();
        let sink = plan
            .add(Operator::collect_sink(SlotType::single(DataUnitType::Int)))
            .unwrap();
        let ch = plan.pipe(src, sink).unwrap();
        let reg = PlatformRegistry::builder()
            .register(Arc::new(LocalPlatform::new("alpha").with_channel_kinds(
                vec![ChannelKind::STREAM, ChannelKind::COLLECTION],
                vec![ChannelKind::STREAM, ChannelKind::COLLECTION],
            )))
            .unwrap()
            .register(Arc::new(LocalPlatform::new("beta").with_channel_kinds(
                vec![ChannelKind::DATASET],
                vec![ChannelKind::DATASET],
            )))
            .unwrap()
            .build();
        let channel = plan.channel(ch).unwrap().clone();
        (plan, reg, channel)
    }

    #[test]
    fn same_platform_is_native_in_preference_order() {
        let (plan, reg, ch) = setup();
        let alpha = PlatformId::new("alpha");
        let cp = plan_channel(&plan, &reg, &ch, &alpha, &[alpha.clone()], 10.0, None).unwrap();
        assert_eq!(cp.produced, ChannelKind::STREAM);
        assert!(!cp.needs_conversion());
        assert_eq!(cp.cost, CostEstimate::ZERO);
    }

    #[test]
    fn cross_platform_goes_through_a_file() {
        let (plan, reg, ch) = setup();
        let cp = plan_channel(
            &plan,
            &reg,
            &ch,
            &PlatformId::new("alpha"),
            &[PlatformId::new("beta")],
            10.0,
            None,
        )
        .unwrap();
        assert!(cp.needs_conversion());
        assert_eq!(cp.routes[0].kind(), ChannelKind::DATASET);
        assert!(cp.cost.total() > 0.0);
    }

    #[test]
    fn missing_conversions_report_the_platform_pair() {
        let (plan, _, ch) = setup();
        let bare = PlatformRegistry::builder()
            .register(Arc::new(LocalPlatform::new("alpha")))
            .unwrap()
            .register(Arc::new(LocalPlatform::new("beta").with_channel_kinds(
                vec![ChannelKind::DATASET],
                vec![ChannelKind::DATASET],
            )))
            .unwrap()
            .without_standard_conversions()
            .build();
        let err = plan_channel(
            &plan,
            &bare,
            &ch,
            &PlatformId::new("alpha"),
            &[PlatformId::new("beta")],
            1.0,
            None,
        )
        .unwrap_err();
        assert_eq!(
            err,
            RouteFailure {
                from: PlatformId::new("alpha"),
                to: PlatformId::new("beta")
            }
        );
    }
}
