//! Loop execution: iteration counts, convergence, bounds, nesting.

mod test_platforms;

use polyplan_core::config::{Configuration, MAX_ITERATIONS, STRICT_CONVERGENCE};
use polyplan_core::id::OperatorId;
use polyplan_core::plan::{LoopDef, LoopHandle, Operator, Plan, HEAD_INITIAL};
use polyplan_core::types::{DataUnitType, Quantum};
use polyplan_exec::{Context, JobError, LoopTermination};
use test_platforms::*;

/// seed -> loop(body) -> sink. Returns the loop handle, body and sink ids.
fn single_loop(seed: &[i64], def: LoopDef, body: Operator) -> (Plan, LoopHandle, OperatorId, OperatorId) {
    let mut plan = Plan::new();
    let src = plan
        .add(Operator::collection_source(ints(seed), DataUnitType::Int))
        .unwrap();
    let lp = plan.add_loop(def).unwrap();
    let body = plan.add_to_loop(lp.id, body).unwrap();
    let sink = plan.add(Operator::collect_sink(INT).named("result")).unwrap();
    plan.connect(src, 0, lp.head, HEAD_INITIAL).unwrap();
    plan.close_loop(lp.id, body, body).unwrap();
    plan.pipe(lp.output, sink).unwrap();
    (plan, lp, body, sink)
}

#[test]
fn test_fixed_count_loop_runs_exactly_n_iterations() {
    let (plan, lp, body, sink) = single_loop(&[0], LoopDef::repeat("count", INT, 5), increment());
    let ctx = Context::new(local_registry());
    let result = ctx.submit(&plan, &Configuration::new()).unwrap();

    assert_eq!(result.output(sink).unwrap(), &[Quantum::Int(5)][..]);
    assert_eq!(result.loop_reports.len(), 1);
    let report = &result.loop_reports[0];
    assert_eq!(report.loop_id, lp.id);
    assert_eq!(report.name, "count");
    assert_eq!(report.iterations, 5);
    assert_eq!(report.termination, LoopTermination::Converged);

    let runs = result.lineage.executions_of(body);
    assert_eq!(runs.len(), 5);
    assert_eq!(ctx.metrics().iterations, 5);
}

#[test]
fn test_convergence_predicate_sees_the_feedback_state() {
    // double until the single value reaches 100
    let def = LoopDef::new("double", INT, |s| {
        s.state.first().and_then(Quantum::as_int).unwrap_or(0) >= 100
    });
    let double = Operator::map(DataUnitType::Int, DataUnitType::Int, |q| {
        Quantum::Int(q.as_int().unwrap_or(0) * 2)
    });
    let (plan, _, _, sink) = single_loop(&[3], def, double);

    let result = Context::new(local_registry())
        .submit(&plan, &Configuration::new())
        .unwrap();
    // 3 6 12 24 48 96 192
    assert_eq!(result.output(sink).unwrap(), &[Quantum::Int(192)][..]);
    assert_eq!(result.loop_reports[0].iterations, 6);
    assert_eq!(result.loop_reports[0].termination, LoopTermination::Converged);
}

#[test]
fn test_iteration_cap_stops_quietly_by_default() {
    let def = LoopDef::new("forever", INT, |_| false);
    let (plan, _, _, sink) = single_loop(&[0], def, increment());

    let result = Context::new(local_registry())
        .submit(&plan, &Configuration::new().with(MAX_ITERATIONS, "4"))
        .unwrap();
    assert_eq!(result.output(sink).unwrap(), &[Quantum::Int(4)][..]);
    assert_eq!(result.loop_reports[0].iterations, 4);
    assert_eq!(
        result.loop_reports[0].termination,
        LoopTermination::IterationBound
    );
}

#[test]
fn test_strict_convergence_fails_at_the_cap() {
    let def = LoopDef::new("forever", INT, |_| false);
    let (plan, lp, _, _) = single_loop(&[0], def, increment());
    let config = Configuration::new()
        .with(MAX_ITERATIONS, "3")
        .with(STRICT_CONVERGENCE, "true");

    let ctx = Context::new(local_registry());
    let err = ctx.submit(&plan, &config).unwrap_err();
    match &err {
        JobError::NotConverged {
            loop_id,
            head,
            name,
            iterations,
        } => {
            assert_eq!(*loop_id, lp.id);
            assert_eq!(*head, lp.head);
            assert_eq!(name, "forever");
            assert_eq!(*iterations, 3);
        }
        other => panic!("expected NotConverged, got {other:?}"),
    }
    assert_eq!(err.failing_operator(), Some(lp.head));
    assert_eq!(ctx.metrics().jobs_failed, 1);
}

#[test]
fn test_loop_body_reads_invariant_input_every_iteration() {
    // state := state ∪ {7}, three times
    let mut plan = Plan::new();
    let seed = plan
        .add(Operator::collection_source(ints(&[1]), DataUnitType::Int))
        .unwrap();
    let extra = plan
        .add(Operator::collection_source(ints(&[7]), DataUnitType::Int))
        .unwrap();
    let lp = plan.add_loop(LoopDef::repeat("grow", INT, 3)).unwrap();
    let merge = plan
        .add_to_loop(lp.id, Operator::union(DataUnitType::Int))
        .unwrap();
    let sink = plan.add(Operator::collect_sink(INT)).unwrap();
    plan.connect(seed, 0, lp.head, HEAD_INITIAL).unwrap();
    plan.connect(extra, 0, merge, 1).unwrap();
    plan.close_loop(lp.id, merge, merge).unwrap();
    plan.pipe(lp.output, sink).unwrap();

    let result = Context::new(local_registry())
        .submit(&plan, &Configuration::new())
        .unwrap();
    assert_eq!(result.output(sink).unwrap(), &ints(&[1, 7, 7, 7])[..]);
    // the invariant source ran once, not once per iteration
    assert_eq!(result.lineage.executions_of(extra).len(), 1);
}

#[test]
fn test_multi_operator_body_iterations_are_tagged() {
    let mut plan = Plan::new();
    let src = plan
        .add(Operator::collection_source(ints(&[1, 2]), DataUnitType::Int))
        .unwrap();
    let lp = plan.add_loop(LoopDef::repeat("chain", INT, 2)).unwrap();
    let first = plan.add_to_loop(lp.id, increment()).unwrap();
    let second = plan
        .add_to_loop(
            lp.id,
            Operator::map(DataUnitType::Int, DataUnitType::Int, |q| {
                Quantum::Int(q.as_int().unwrap_or(0) * 10)
            }),
        )
        .unwrap();
    let sink = plan.add(Operator::collect_sink(INT)).unwrap();
    plan.connect(src, 0, lp.head, HEAD_INITIAL).unwrap();
    plan.pipe(first, second).unwrap();
    plan.close_loop(lp.id, first, second).unwrap();
    plan.pipe(lp.output, sink).unwrap();

    let result = Context::new(local_registry())
        .submit(&plan, &Configuration::new())
        .unwrap();
    // (1+1)*10 = 20 -> (20+1)*10 = 210; (2+1)*10 = 30 -> 310
    assert_eq!(result.output(sink).unwrap(), &ints(&[210, 310])[..]);

    let iterations: Vec<Option<usize>> = result
        .lineage
        .executions_of(second)
        .iter()
        .map(|r| match &r.kind {
            polyplan_platform::LineageKind::Execution { iteration, .. } => *iteration,
            _ => None,
        })
        .collect();
    assert_eq!(iterations, vec![Some(0), Some(1)]);
}

#[test]
fn test_body_functions_see_the_current_iteration() {
    let add_iteration = Operator::map_with_iteration(DataUnitType::Int, DataUnitType::Int, |q, i| {
        Quantum::Int(q.as_int().unwrap_or(0) + i as i64)
    });
    let (plan, _, _, sink) = single_loop(&[0], LoopDef::repeat("sum", INT, 4), add_iteration);

    let result = Context::new(local_registry())
        .submit(&plan, &Configuration::new())
        .unwrap();
    // 0 + 0 + 1 + 2 + 3
    assert_eq!(result.output(sink).unwrap(), &[Quantum::Int(6)][..]);
}

#[test]
fn test_nested_loops_report_per_enclosing_iteration() {
    // outer x2 { +1 ; inner x3 { +1 } ; pass }
    let mut plan = Plan::new();
    let src = plan
        .add(Operator::collection_source(ints(&[0]), DataUnitType::Int))
        .unwrap();
    let outer = plan.add_loop(LoopDef::repeat("outer", INT, 2)).unwrap();
    let enter = plan.add_to_loop(outer.id, increment()).unwrap();
    let inner = plan
        .add_loop(LoopDef::repeat("inner", INT, 3).inside(outer.id))
        .unwrap();
    let step = plan.add_to_loop(inner.id, increment()).unwrap();
    let leave = plan
        .add_to_loop(
            outer.id,
            Operator::map(DataUnitType::Int, DataUnitType::Int, |q| q.clone()),
        )
        .unwrap();
    let sink = plan.add(Operator::collect_sink(INT)).unwrap();

    plan.connect(src, 0, outer.head, HEAD_INITIAL).unwrap();
    plan.connect(enter, 0, inner.head, HEAD_INITIAL).unwrap();
    plan.close_loop(inner.id, step, step).unwrap();
    plan.pipe(inner.output, leave).unwrap();
    plan.close_loop(outer.id, enter, leave).unwrap();
    plan.pipe(outer.output, sink).unwrap();
    plan.validate().unwrap();

    let result = Context::new(local_registry())
        .submit(&plan, &Configuration::new())
        .unwrap();
    assert_eq!(result.output(sink).unwrap(), &[Quantum::Int(8)][..]);

    let inner_runs: Vec<_> = result
        .loop_reports
        .iter()
        .filter(|r| r.loop_id == inner.id)
        .collect();
    assert_eq!(inner_runs.len(), 2);
    assert!(inner_runs.iter().all(|r| r.iterations == 3));
    let outer_runs: Vec<_> = result
        .loop_reports
        .iter()
        .filter(|r| r.loop_id == outer.id)
        .collect();
    assert_eq!(outer_runs.len(), 1);
    assert_eq!(outer_runs[0].iterations, 2);
    assert_eq!(result.lineage.executions_of(step).len(), 6);
}
