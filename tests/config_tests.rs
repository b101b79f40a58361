//! Configuration sources applied end to end.

mod test_platforms;

use std::fs;

use polyplan_core::config::{Configuration, MAX_ITERATIONS, SCRATCH_DIR};
use polyplan_core::id::PlatformId;
use polyplan_core::plan::{LoopDef, Operator, Plan, HEAD_INITIAL};
use polyplan_core::types::{DataUnitType, Quantum};
use polyplan_exec::{Context, JobError, LoopTermination};
use test_platforms::*;

/// src -> upper -> out.
fn pipeline() -> Plan {
    let mut plan = Plan::new();
    let src = plan
        .add(Operator::collection_source(strs(&["p", "q"]), DataUnitType::Str).named("src"))
        .unwrap();
    let upper = plan.add(uppercase().named("upper")).unwrap();
    let out = plan.add(Operator::collect_sink(STR).named("out")).unwrap();
    plan.pipe(src, upper).unwrap();
    plan.pipe(upper, out).unwrap();
    plan
}

#[test]
fn test_yaml_pins_steer_the_assignment() {
    let yaml = r#"
polyplan:
  pin:
    upper: alpha
    out: beta
  executor:
    max_parallelism: 2
"#;
    let config = Configuration::from_yaml_str(yaml).expect("valid yaml");
    let plan = pipeline();
    let result = Context::new(alpha_beta_registry())
        .submit(&plan, &config)
        .unwrap();

    let out = plan.operator_by_name("out").unwrap().id();
    assert_eq!(result.assignment.platform_of(out), Some(&PlatformId::new("beta")));
    assert_eq!(result.assignment.conversions(), 1);
    assert_eq!(sorted_strs(result.output(out).unwrap()), vec!["P", "Q"]);
}

#[test]
fn test_environment_variables_configure_jobs() {
    let config = Configuration::from_env_vars(vec![
        ("POLYPLAN_PIN_out".to_string(), "beta".to_string()),
        ("POLYPLAN_PIN_upper".to_string(), "alpha".to_string()),
        ("POLYPLAN_LOOP_MAX_ITERATIONS".to_string(), "9".to_string()),
        ("HOME".to_string(), "/root".to_string()),
    ]);
    assert_eq!(config.len(), 3);

    let ctx = Context::new(alpha_beta_registry());
    let job = ctx.job(&pipeline(), &config).unwrap();
    assert_eq!(job.config().max_iterations, 9);
    assert_eq!(job.config().pins.get("out"), Some(&PlatformId::new("beta")));
}

#[test]
fn test_iteration_cap_comes_from_configuration() {
    let mut plan = Plan::new();
    let src = plan
        .add(Operator::collection_source(ints(&[0]), DataUnitType::Int))
        .unwrap();
    let lp = plan
        .add_loop(LoopDef::new("spin", INT, |_| false))
        .unwrap();
    let body = plan.add_to_loop(lp.id, increment()).unwrap();
    let sink = plan.add(Operator::collect_sink(INT)).unwrap();
    plan.connect(src, 0, lp.head, HEAD_INITIAL).unwrap();
    plan.close_loop(lp.id, body, body).unwrap();
    plan.pipe(lp.output, sink).unwrap();

    let ctx = Context::new(local_registry());
    let default_cap = ctx.submit(&plan, &Configuration::new()).unwrap();
    assert_eq!(default_cap.loop_reports[0].iterations, 100);
    assert_eq!(default_cap.output(sink).unwrap(), &[Quantum::Int(100)][..]);

    let yaml = "polyplan:\n  loop:\n    max_iterations: 12\n";
    let small_cap = ctx
        .submit(&plan, &Configuration::from_yaml_str(yaml).unwrap())
        .unwrap();
    assert_eq!(small_cap.loop_reports[0].iterations, 12);
    assert_eq!(
        small_cap.loop_reports[0].termination,
        LoopTermination::IterationBound
    );
}

#[test]
fn test_malformed_values_fail_before_the_job_starts() {
    let ctx = Context::new(local_registry());
    let plan = pipeline();

    for (key, value) in [
        (MAX_ITERATIONS, "many"),
        (MAX_ITERATIONS, "0"),
        ("polyplan.executor.max_parallelism", "-1"),
        ("polyplan.instrumentation", "sampled"),
        ("polyplan.optimizer.reoptimize_threshold", "0.5"),
    ] {
        let err = ctx
            .job(&plan, &Configuration::new().with(key, value))
            .err()
            .unwrap_or_else(|| panic!("{key} = {value} was accepted"));
        assert!(matches!(err, JobError::Config(_)), "{key}: unexpected error {err:?}");
        assert_eq!(err.failing_operator(), None);
    }
    assert_eq!(ctx.metrics().jobs_started, 0);

    // unknown keys are ignored
    ctx.submit(&plan, &Configuration::new().with("polyplan.unknown", "x"))
        .unwrap();
}

#[test]
fn test_scratch_space_is_removed_after_the_job() {
    let scratch = std::env::temp_dir().join(format!("polyplan-config-tests-{}", std::process::id()));
    let config = Configuration::new()
        .with(SCRATCH_DIR, scratch.display().to_string())
        .with_pin("upper", "alpha")
        .with_pin("out", "beta");

    let result = Context::new(alpha_beta_registry())
        .submit(&pipeline(), &config)
        .unwrap();
    assert_eq!(result.assignment.conversions(), 1);
    assert!(!scratch.join(format!("job-{}", result.job_id)).exists());

    let _ = fs::remove_dir_all(&scratch);
}
