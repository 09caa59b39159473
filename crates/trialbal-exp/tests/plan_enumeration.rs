use trialbal_core::{Algorithm, TrialError};
use trialbal_exp::{load_plan, write_plan, ExperimentPlan, Mix};

#[test]
fn default_plan_matches_regression_sweep() {
    let plan = ExperimentPlan::with_defaults("regression");
    let configurations = plan.configurations().unwrap();
    // 3 group counts x (2 single-covariate + 3 two-covariate mixes) x 2 intervals x 2 repetitions
    assert_eq!(configurations.len(), 60);

    let first = &configurations[0];
    assert_eq!(first.experiment_id, 1);
    assert_eq!(first.protocol_name, "2_1_continuous");
    assert_eq!(first.repetition, "P00");
    assert_eq!(first.placement_interval, 0);
    assert_eq!(first.group_names, vec!["W".to_string(), "X".to_string()]);
    assert_eq!(first.instance_id(Algorithm::Balanced), "2_1_continuous_P00Balanced010");
    assert_eq!(configurations[1].placement_interval, 3);

    let last = configurations.last().unwrap();
    assert_eq!(last.repetition, "P01");
    assert_eq!(last.protocol_name, "4_2_mixed");
    assert_eq!(last.experiment_id, 60);
}

#[test]
fn mixed_template_interleaves_kinds() {
    let plan = ExperimentPlan::with_defaults("regression");
    let mixed = plan
        .configurations()
        .unwrap()
        .into_iter()
        .find(|config| config.mix == Mix::Mixed)
        .unwrap();
    let names: Vec<&str> = mixed.template.iter().map(|spec| spec.name.as_str()).collect();
    assert_eq!(names, vec!["score", "state", "age", "fruit"]);
    assert!(mixed.is_used("state"));
    assert!(!mixed.is_used("age"));
    let protocol = mixed.protocol(Algorithm::Alternating).unwrap();
    assert_eq!(protocol.covariates.len(), 2);
}

#[test]
fn mixed_needs_two_covariates() {
    let mut plan = ExperimentPlan::with_defaults("single");
    plan.covariate_counts = vec![1];
    let configurations = plan.configurations().unwrap();
    assert!(configurations.iter().all(|config| config.mix != Mix::Mixed));
    assert_eq!(configurations.len(), 3 * 2 * 2 * 2);
}

#[test]
fn yaml_defaults_fill_missing_fields() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("plan.yaml");
    std::fs::write(&path, "name: tiny\ngroup_counts: [2]\nrepetitions: 1\n").unwrap();
    let plan = load_plan(&path).unwrap();
    assert_eq!(plan.seed, 2008);
    assert_eq!(plan.subject_count, 10);
    assert_eq!(plan.placement_intervals, vec![0, 3]);
    assert_eq!(plan.categorical["mouse"], vec!["micky".to_string(), "minnie".to_string()]);
    assert_eq!(plan.generator.continuous_sd, 20.0);
}

#[test]
fn written_plan_loads_back_with_same_hash() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("plan.yaml");
    let plan = ExperimentPlan::with_defaults("regression");
    write_plan(&path, &plan).unwrap();
    let loaded = load_plan(&path).unwrap();
    assert_eq!(loaded, plan);
    assert_eq!(loaded.plan_hash().unwrap(), plan.plan_hash().unwrap());

    let mut reseeded = plan.clone();
    reseeded.seed = 7;
    assert_ne!(reseeded.plan_hash().unwrap(), plan.plan_hash().unwrap());
}

#[test]
fn invalid_plans_are_rejected() {
    let mut plan = ExperimentPlan::with_defaults("bad");
    plan.group_counts = vec![5];
    assert!(matches!(plan.configurations(), Err(TrialError::InvalidData(_))));

    let mut plan = ExperimentPlan::with_defaults("bad");
    plan.covariate_counts = vec![0];
    assert!(matches!(plan.validate(), Err(TrialError::InvalidData(_))));

    let mut plan = ExperimentPlan::with_defaults("bad");
    plan.template_width = 5;
    plan.covariate_counts = vec![1];
    assert!(matches!(plan.validate(), Err(TrialError::InvalidData(_))));
}

#[test]
fn checked_in_regression_plan_is_the_default() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../plans/regression.yaml");
    let plan = load_plan(path).unwrap();
    assert_eq!(plan, ExperimentPlan::with_defaults("regression"));
}
