//! Human-readable rendering of an assignment.

use std::fmt::Write;

use polyplan_core::plan::Plan;

use crate::assignment::{ExecutionAssignment, SearchStrategy};

/// Render `assignment` for `plan` as a multi-line report.
pub fn explain(plan: &Plan, assignment: &ExecutionAssignment) -> String {
    let mut out = String::new();
    // Writing into a String cannot fail.
    let _ = render(&mut out, plan, assignment);
    out
}

fn render(out: &mut String, plan: &Plan, a: &ExecutionAssignment) -> std::fmt::Result {
    writeln!(out, "Execution Assignment")?;
    writeln!(out, "====================")?;
    if let Some(name) = plan.name() {
        writeln!(out, "Job: {name}")?;
    }
    writeln!(out)?;
    match a.strategy {
        SearchStrategy::Exhaustive { explored } => {
            writeln!(out, "Strategy: exhaustive ({explored} complete assignments explored)")?
        }
        SearchStrategy::Greedy => writeln!(out, "Strategy: greedy")?,
    }
    writeln!(
        out,
        "Estimated Cost: {:.2} (cpu {:.2}, io {:.2}, network {:.2})",
        a.total_cost.total(),
        a.total_cost.cpu,
        a.total_cost.io,
        a.total_cost.network
    )?;
    let platforms: Vec<&str> = a.distinct_platforms().into_iter().map(|p| p.as_str()).collect();
    writeln!(out, "Platforms: {}", platforms.join(", "))?;
    writeln!(out)?;

    writeln!(out, "Operators:")?;
    let order = plan
        .topological_order()
        .unwrap_or_else(|_| plan.operator_ids().collect());
    for (i, id) in order.iter().enumerate() {
        let Some(op) = plan.operator(*id) else { continue };
        let platform = a.platform_of(*id).map_or("?", |p| p.as_str());
        let cost = a.operator_costs.get(id).map_or(0.0, |c| c.total());
        let quanta = a.cardinalities.get(id).map_or(0.0, |c| c.point());
        writeln!(
            out,
            "  {}. {} [{}] -> {} (cost {:.2}, ~{:.0} quanta)",
            i + 1,
            op.display_name(),
            op.key(),
            platform,
            cost,
            quanta
        )?;
    }
    writeln!(out)?;

    writeln!(out, "Channels:")?;
    for ch in plan.channels() {
        let Some(cp) = a.channel_plan(ch.id) else { continue };
        let producer = plan
            .operator(ch.producer.operator)
            .map_or_else(|| "?".to_string(), |o| o.display_name());
        for route in &cp.routes {
            let consumer = plan
                .operator(route.consumer.operator)
                .map_or_else(|| "?".to_string(), |o| o.display_name());
            let kinds: Vec<String> = route.path.kinds().iter().map(|k| k.to_string()).collect();
            let how = if route.is_native() { " (native)" } else { "" };
            writeln!(
                out,
                "  {} -> {}: {}{}",
                producer,
                consumer,
                kinds.join(" -> "),
                how
            )?;
        }
    }
    writeln!(out)?;

    writeln!(out, "Segments:")?;
    for seg in &a.segments {
        let members: Vec<String> = seg
            .operators
            .iter()
            .filter_map(|op| plan.operator(*op).map(|o| o.display_name()))
            .collect();
        let fallback = a
            .fallback_for(seg.id)
            .map(|f| format!(" (fallback: {})", f.platform))
            .unwrap_or_default();
        writeln!(
            out,
            "  Segment {} on {}: {}{}",
            seg.id.get(),
            seg.platform,
            members.join(", "),
            fallback
        )?;
    }
    Ok(())
}
