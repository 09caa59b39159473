use std::collections::BTreeSet;

use trialbal_core::{
    Algorithm, ErrorInfo, Features, Group, GroupMembership, ProtocolConfig, Subject, TrialError,
};
use trialbal_exp::{
    check_group_sizes, registry_query, run_sweep, AllocationService, ExperimentPlan,
    LocalAllocationService, Mix, Query, Registry, TrialOutcome, TrialState,
};

fn small_plan() -> ExperimentPlan {
    let mut plan = ExperimentPlan::with_defaults("smoke");
    plan.group_counts = vec![2];
    plan.covariate_counts = vec![1];
    plan.mixes = vec![Mix::Continuous, Mix::Categorical];
    plan.template_width = 2;
    plan.placement_intervals = vec![0, 3];
    plan.repetitions = 1;
    plan.subject_count = 8;
    plan
}

#[test]
fn small_sweep_evaluates_every_configuration() {
    let plan = small_plan();
    let mut service = LocalAllocationService::new();
    let report = run_sweep(&plan, &mut service, None).unwrap();

    assert_eq!(report.plan_name, "smoke");
    assert_eq!(report.plan_hash, plan.plan_hash().unwrap());
    assert_eq!(report.configurations, 4);
    assert_eq!(report.completed, 4);
    assert!(report.failures.iter().all(|failure| failure.covariate_name.is_some()));
    // two algorithms x two template covariates per configuration
    assert_eq!(report.rows.len() + report.failures.len(), 16);

    for row in &report.rows {
        assert_eq!(row.n_subjects, 8);
        assert_eq!(row.n_groups, 2);
        assert_eq!(row.n_covariates, 1);
        assert!((0.0..=1.0).contains(&row.pvalue));
        assert!(row.diversity_all > 0.0 && row.diversity_all <= 1.0);
        assert!(row.diversity_used > 0.0 && row.diversity_used <= 1.0);
        assert_eq!(row.is_used, row.covariate_name == "score" || row.covariate_name == "state");
    }
    assert!(report.rows.iter().any(|row| row.algorithm == Algorithm::Balanced));
}

#[test]
fn sweep_is_deterministic_for_a_seed() {
    let plan = small_plan();
    let first = run_sweep(&plan, &mut LocalAllocationService::new(), None).unwrap();
    let second = run_sweep(&plan, &mut LocalAllocationService::new(), None).unwrap();
    assert_eq!(first.rows, second.rows);
}

#[test]
fn sweep_tears_down_instances() {
    let plan = small_plan();
    let mut service = LocalAllocationService::new();
    run_sweep(&plan, &mut service, None).unwrap();
    for config in plan.configurations().unwrap() {
        for algorithm in Algorithm::ALL {
            let pending = service.pending(&config.instance_id(algorithm));
            assert!(matches!(pending, Err(TrialError::NotFound(_))));
        }
    }
}

#[test]
fn registry_receives_every_row() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::from_path(dir.path().join("results.csv"));
    let plan = small_plan();
    let report = run_sweep(&plan, &mut LocalAllocationService::new(), Some(registry.clone())).unwrap();
    let table = registry_query(&registry, &Query::default()).unwrap();
    assert_eq!(table.rows.len(), report.rows.len());
    assert_eq!(table.rows[0], report.rows[0].to_record());
}

/// Wraps the in-process service, piling every subject of the `skewed`
/// instances into their first group and refusing to start the `refused` ones.
struct MisbehavingService {
    inner: LocalAllocationService,
    skewed: BTreeSet<String>,
    refused: BTreeSet<String>,
}

impl MisbehavingService {
    fn new(plan: &ExperimentPlan, skewed: usize, refused: usize) -> Self {
        let configs = plan.configurations().unwrap();
        let instances = |index: usize| -> BTreeSet<String> {
            Algorithm::ALL
                .iter()
                .map(|&algorithm| configs[index].instance_id(algorithm))
                .collect()
        };
        Self {
            inner: LocalAllocationService::new(),
            skewed: instances(skewed),
            refused: instances(refused),
        }
    }
}

impl AllocationService for MisbehavingService {
    fn start(&mut self, instance: &str, config: &ProtocolConfig) -> Result<(), TrialError> {
        if self.refused.contains(instance) {
            return Err(TrialError::Transport(ErrorInfo::new("http-503", "service unavailable")));
        }
        self.inner.start(instance, config)
    }

    fn submit(&mut self, instance: &str, subject: &str, features: &Features) -> Result<(), TrialError> {
        self.inner.submit(instance, subject, features)
    }

    fn submit_and_assign(
        &mut self,
        instance: &str,
        subject: &str,
        features: &Features,
    ) -> Result<String, TrialError> {
        self.inner.submit_and_assign(instance, subject, features)
    }

    fn get_group(&mut self, instance: &str, subject: &str) -> Result<String, TrialError> {
        self.inner.get_group(instance, subject)
    }

    fn assign_all(&mut self, instance: &str) -> Result<(), TrialError> {
        self.inner.assign_all(instance)
    }

    fn get_groups(&mut self, instance: &str) -> Result<Vec<GroupMembership>, TrialError> {
        let mut groups = self.inner.get_groups(instance)?;
        if self.skewed.contains(instance) {
            let mut moved = Vec::new();
            for group in groups.iter_mut().skip(1) {
                moved.append(&mut group.subject_ids);
            }
            groups[0].subject_ids.extend(moved);
        }
        Ok(groups)
    }

    fn stop(&mut self, instance: &str) -> Result<(), TrialError> {
        self.inner.stop(instance)
    }
}

#[test]
fn failed_configurations_are_recorded_and_skipped() {
    let plan = small_plan();
    let mut service = MisbehavingService::new(&plan, 0, 1);
    let report = run_sweep(&plan, &mut service, None).unwrap();

    assert_eq!(report.configurations, 4);
    assert_eq!(report.completed, 2);
    let whole: Vec<(usize, &str)> = report
        .failures
        .iter()
        .filter(|failure| failure.algorithm.is_none())
        .map(|failure| (failure.experiment_id, failure.error.family()))
        .collect();
    assert_eq!(whole, vec![(1, "assignment-invariant"), (2, "trial-aborted")]);
    assert_eq!(report.failures[0].error.info().code, "group-size-spread");
    assert!(report.failures[0].error.is_config_fatal());

    assert!(!report.rows.is_empty());
    assert!(report.rows.iter().all(|row| row.experiment_id > 2));
    let skipped_rows = report.failures.iter().filter(|failure| failure.algorithm.is_some()).count();
    assert_eq!(report.rows.len() + skipped_rows, 8);
}

#[test]
fn group_size_spread_above_one_is_rejected() {
    let group = |name: &str, ids: &[&str]| Group {
        name: name.to_string(),
        subjects: ids.iter().map(|id| Subject::new(*id, Features::new())).collect(),
    };
    let mut outcome = TrialOutcome {
        algorithm: Algorithm::Balanced,
        instance: "skew".to_string(),
        state: TrialState::Completed,
        groups: vec![group("A", &["S001", "S002", "S003"]), group("B", &["S004"])],
    };
    let err = check_group_sizes(&outcome).unwrap_err();
    assert!(matches!(err, TrialError::AssignmentInvariant(_)));
    assert_eq!(err.info().context.get("sizes").map(String::as_str), Some("A=3,B=1"));

    outcome.groups = vec![group("A", &["S001", "S002"]), group("B", &["S003"])];
    assert!(check_group_sizes(&outcome).is_ok());
}
