use indexmap::IndexMap;
use trialbal_core::{
    Algorithm, CovariateSpec, ErrorInfo, FeatureValue, Features, GroupMembership, ProtocolConfig,
    RngHandle, Subject, TrialError,
};
use trialbal_exp::{
    AllocationService, DriverOptions, FeatureGenerator, LocalAllocationService, SubjectStream,
    TrialArm, TrialDriver, TrialState,
};
use trialbal_stats::balance_test;

fn score_config(algorithm: Algorithm) -> ProtocolConfig {
    ProtocolConfig::new(["A", "B"], vec![CovariateSpec::continuous("score")], false, algorithm).unwrap()
}

fn score_stream(scores: &[f64]) -> SubjectStream {
    let subjects = scores
        .iter()
        .enumerate()
        .map(|(idx, score)| {
            let mut features = IndexMap::new();
            features.insert("score".to_string(), FeatureValue::Continuous(*score));
            Subject::new(format!("S{:03}", idx + 1), features)
        })
        .collect();
    SubjectStream::from_subjects(subjects)
}

#[test]
fn four_scores_split_evenly_with_a_pvalue() {
    let mut service = LocalAllocationService::new();
    let options = DriverOptions {
        placement_interval: 0,
        immediate_assignment: true,
        teardown: true,
    };
    let stream = score_stream(&[10.0, 90.0, 12.0, 88.0]);
    for algorithm in Algorithm::ALL {
        let config = score_config(algorithm);
        let outcome = TrialDriver::new(&mut service, options.clone())
            .run(&format!("demo{algorithm}"), &config, &stream)
            .unwrap();
        assert_eq!(outcome.state, TrialState::Stopped);
        let sizes: Vec<usize> = outcome.groups.iter().map(|g| g.len()).collect();
        assert_eq!(sizes, vec![2, 2]);
        let test = balance_test(&config.covariates["score"], &outcome.groups).unwrap();
        assert!(test.pvalue > 0.0 && test.pvalue <= 1.0);
    }
}

#[test]
fn paired_arms_see_identical_subjects() {
    let template = vec![
        CovariateSpec::continuous("score"),
        CovariateSpec::categorical("mouse", ["micky", "minnie"]),
    ];
    let mut rng = RngHandle::from_seed(7);
    let stream = FeatureGenerator::default().generate(&template, 9, &mut rng).unwrap();
    let mut arms: Vec<TrialArm> = Algorithm::ALL
        .iter()
        .map(|&algorithm| {
            let config = ProtocolConfig::new(["W", "X", "Y"], template.clone(), false, algorithm).unwrap();
            TrialArm::new(format!("pair{algorithm}"), config)
        })
        .collect();

    let mut service = LocalAllocationService::new();
    let outcomes = TrialDriver::new(&mut service, DriverOptions::with_interval(3))
        .run_paired(&mut arms, &stream)
        .unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(arms.iter().all(|arm| arm.state() == TrialState::Stopped));

    let collect = |idx: usize| {
        let mut subjects: Vec<Subject> = outcomes[idx]
            .groups
            .iter()
            .flat_map(|g| g.subjects.iter().cloned())
            .collect();
        subjects.sort_by(|a, b| a.id.cmp(&b.id));
        subjects
    };
    assert_eq!(collect(0), collect(1));
    assert_eq!(collect(0), stream.subjects().to_vec());
}

#[test]
fn window_leaves_interval_subjects_pending() {
    let mut service = LocalAllocationService::new();
    let stream = score_stream(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    let options = DriverOptions {
        placement_interval: 3,
        immediate_assignment: false,
        teardown: false,
    };
    let mut arms = vec![TrialArm::new("win", score_config(Algorithm::Alternating))];
    let outcomes = TrialDriver::new(&mut service, options)
        .run_paired(&mut arms, &stream)
        .unwrap();
    assert_eq!(outcomes[0].state, TrialState::Completed);
    // instance kept alive without teardown
    assert!(service.pending("win").unwrap().is_empty());
    let total: usize = outcomes[0].groups.iter().map(|g| g.len()).sum();
    assert_eq!(total, 6);
}

#[test]
fn generated_ids_are_zero_padded() {
    let mut rng = RngHandle::from_seed(1);
    let stream = FeatureGenerator::default()
        .generate(&[CovariateSpec::continuous("score")], 3, &mut rng)
        .unwrap();
    let ids: Vec<&str> = stream.subjects().iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["S001", "S002", "S003"]);
}

/// Service that fails every `get_group` call.
struct FlakyService {
    inner: LocalAllocationService,
}

impl AllocationService for FlakyService {
    fn start(&mut self, instance: &str, config: &ProtocolConfig) -> Result<(), TrialError> {
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

    fn get_group(&mut self, _instance: &str, _subject: &str) -> Result<String, TrialError> {
        Err(TrialError::Transport(ErrorInfo::new("http-500", "server error")))
    }

    fn assign_all(&mut self, instance: &str) -> Result<(), TrialError> {
        self.inner.assign_all(instance)
    }

    fn get_groups(&mut self, instance: &str) -> Result<Vec<GroupMembership>, TrialError> {
        self.inner.get_groups(instance)
    }

    fn stop(&mut self, instance: &str) -> Result<(), TrialError> {
        self.inner.stop(instance)
    }
}

#[test]
fn service_failure_aborts_and_cleans_up() {
    let mut service = FlakyService {
        inner: LocalAllocationService::new(),
    };
    let mut arms: Vec<TrialArm> = Algorithm::ALL
        .iter()
        .map(|&algorithm| TrialArm::new(format!("flaky{algorithm}"), score_config(algorithm)))
        .collect();
    let err = TrialDriver::new(&mut service, DriverOptions::with_interval(0))
        .run_paired(&mut arms, &score_stream(&[1.0, 2.0]))
        .unwrap_err();
    assert!(matches!(err, TrialError::TrialAborted(_)));
    assert_eq!(err.info().context.get("cause").map(String::as_str), Some("transport"));
    assert!(arms.iter().all(|arm| arm.state() == TrialState::Aborted));
    assert!(matches!(
        service.inner.pending("flakyAlternating"),
        Err(TrialError::NotFound(_))
    ));
}

#[test]
fn conflicting_start_keeps_its_family() {
    let mut service = LocalAllocationService::new();
    service.start("dup", &score_config(Algorithm::Balanced)).unwrap();
    let err = TrialDriver::new(&mut service, DriverOptions::with_interval(0))
        .run("dup", &score_config(Algorithm::Alternating), &score_stream(&[1.0, 2.0]))
        .unwrap_err();
    assert!(matches!(err, TrialError::ProtocolConflict(_)));
}

/// Service whose group listing forgets one subject.
struct ForgetfulService {
    inner: LocalAllocationService,
    forgotten: &'static str,
}

impl AllocationService for ForgetfulService {
    fn start(&mut self, instance: &str, config: &ProtocolConfig) -> Result<(), TrialError> {
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
        for group in &mut groups {
            group.subject_ids.retain(|id| id != self.forgotten);
        }
        Ok(groups)
    }

    fn stop(&mut self, instance: &str) -> Result<(), TrialError> {
        self.inner.stop(instance)
    }
}

#[test]
fn subject_missing_from_every_group_is_rejected() {
    let mut service = ForgetfulService {
        inner: LocalAllocationService::new(),
        forgotten: "S001",
    };
    let err = TrialDriver::new(&mut service, DriverOptions::with_interval(0))
        .run("lost", &score_config(Algorithm::Balanced), &score_stream(&[10.0, 90.0, 12.0, 88.0]))
        .unwrap_err();
    assert!(matches!(err, TrialError::AssignmentInvariant(_)));
    assert_eq!(err.info().code, "unassigned-subject");
    assert_eq!(err.info().context.get("missing").map(String::as_str), Some("S001"));
    assert!(matches!(service.inner.pending("lost"), Err(TrialError::NotFound(_))));
}
