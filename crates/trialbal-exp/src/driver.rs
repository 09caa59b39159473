use std::collections::{BTreeSet, VecDeque};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use trialbal_core::{Algorithm, ErrorInfo, Group, GroupMembership, ProtocolConfig, TrialError};

use crate::generator::SubjectStream;
use crate::service::AllocationService;

/// Lifecycle of one trial instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TrialState {
    /// Not yet started on the service.
    Unstarted,
    /// Started and receiving subjects.
    Active,
    /// Every subject has a group.
    Completed,
    /// Torn down on the service.
    Stopped,
    /// A service call failed mid-trial.
    Aborted,
}

/// Knobs controlling how subjects are fed to the service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DriverOptions {
    /// Number of submitted subjects allowed to wait for a group.
    pub placement_interval: usize,
    /// With a zero interval, submit and assign in a single call.
    #[serde(default)]
    pub immediate_assignment: bool,
    /// Stop instances once their groups have been read.
    #[serde(default = "DriverOptions::default_teardown")]
    pub teardown: bool,
}

impl DriverOptions {
    const fn default_teardown() -> bool {
        true
    }

    /// Options with the given interval, no immediate assignment and teardown on.
    pub fn with_interval(placement_interval: usize) -> Self {
        Self {
            placement_interval,
            immediate_assignment: false,
            teardown: Self::default_teardown(),
        }
    }
}

/// Completed trial with groups resolved against the full feature ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialOutcome {
    /// Algorithm the instance ran.
    pub algorithm: Algorithm,
    /// Protocol instance id on the service.
    pub instance: String,
    /// Final state after the run.
    pub state: TrialState,
    /// Groups in service order, subjects carrying every generated feature.
    pub groups: Vec<Group>,
}

/// One arm of a paired comparison.
#[derive(Debug, Clone)]
pub struct TrialArm {
    instance: String,
    config: ProtocolConfig,
    state: TrialState,
}

impl TrialArm {
    /// Creates an unstarted arm.
    pub fn new(instance: impl Into<String>, config: ProtocolConfig) -> Self {
        Self {
            instance: instance.into(),
            config,
            state: TrialState::Unstarted,
        }
    }

    /// Instance id on the service.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    /// Current lifecycle state.
    pub fn state(&self) -> TrialState {
        self.state
    }

    fn transition(&mut self, next: TrialState) {
        debug!(instance = %self.instance, from = ?self.state, to = ?next, "trial state");
        self.state = next;
    }
}

/// Drives trial arms through an allocation service in lockstep.
pub struct TrialDriver<'s, S: AllocationService + ?Sized> {
    service: &'s mut S,
    options: DriverOptions,
}

impl<'s, S: AllocationService + ?Sized> TrialDriver<'s, S> {
    /// Creates a driver over `service`.
    pub fn new(service: &'s mut S, options: DriverOptions) -> Self {
        Self { service, options }
    }

    /// Runs a single trial.
    pub fn run(
        &mut self,
        instance: &str,
        config: &ProtocolConfig,
        stream: &SubjectStream,
    ) -> Result<TrialOutcome, TrialError> {
        let mut arms = vec![TrialArm::new(instance, config.clone())];
        let mut outcomes = self.run_paired(&mut arms, stream)?;
        outcomes.pop().ok_or_else(|| {
            TrialError::TrialAborted(ErrorInfo::new("no-outcome", "trial produced no outcome"))
        })
    }

    /// Runs every arm against the same subject stream.
    ///
    /// Each subject is projected once per arm and submitted to every arm
    /// before the next subject, so the arms see identical ids, values and
    /// order. A failure in any arm aborts the whole comparison.
    pub fn run_paired(
        &mut self,
        arms: &mut [TrialArm],
        stream: &SubjectStream,
    ) -> Result<Vec<TrialOutcome>, TrialError> {
        let result = self.drive(arms, stream);
        if let Err(err) = &result {
            warn!(error = %err, "paired trial aborted");
            for arm in arms.iter_mut() {
                if arm.state == TrialState::Active || arm.state == TrialState::Completed {
                    arm.transition(TrialState::Aborted);
                    if self.options.teardown {
                        if let Err(stop_err) = self.service.stop(&arm.instance) {
                            warn!(instance = %arm.instance, error = %stop_err, "cleanup stop failed");
                        }
                    }
                }
            }
        }
        result
    }

    fn drive(&mut self, arms: &mut [TrialArm], stream: &SubjectStream) -> Result<Vec<TrialOutcome>, TrialError> {
        for arm in arms.iter_mut() {
            self.service
                .start(&arm.instance, &arm.config)
                .map_err(|err| aborted(err, &arm.instance))?;
            arm.transition(TrialState::Active);
        }

        let immediate = self.options.immediate_assignment && self.options.placement_interval == 0;
        let mut window: VecDeque<&str> = VecDeque::new();
        for subject in stream.subjects() {
            for arm in arms.iter() {
                let features = subject.project(&arm.config)?;
                if immediate {
                    let group = self
                        .service
                        .submit_and_assign(&arm.instance, &subject.id, &features)
                        .map_err(|err| aborted(err, &arm.instance))?;
                    debug!(instance = %arm.instance, subject = %subject.id, group = %group, "placed");
                } else {
                    self.service
                        .submit(&arm.instance, &subject.id, &features)
                        .map_err(|err| aborted(err, &arm.instance))?;
                    debug!(instance = %arm.instance, subject = %subject.id, "submitted");
                }
            }
            if immediate {
                continue;
            }
            window.push_back(&subject.id);
            if window.len() > self.options.placement_interval {
                if let Some(oldest) = window.pop_front() {
                    for arm in arms.iter() {
                        let group = self
                            .service
                            .get_group(&arm.instance, oldest)
                            .map_err(|err| aborted(err, &arm.instance))?;
                        debug!(instance = %arm.instance, subject = oldest, group = %group, "placed");
                    }
                }
            }
        }

        let mut outcomes = Vec::with_capacity(arms.len());
        for arm in arms.iter_mut() {
            self.service
                .assign_all(&arm.instance)
                .map_err(|err| aborted(err, &arm.instance))?;
            let memberships = self
                .service
                .get_groups(&arm.instance)
                .map_err(|err| aborted(err, &arm.instance))?;
            let groups = resolve_groups(&memberships, stream, &arm.instance)?;
            arm.transition(TrialState::Completed);
            info!(instance = %arm.instance, algorithm = %arm.config.algorithm, "trial completed");
            outcomes.push(TrialOutcome {
                algorithm: arm.config.algorithm,
                instance: arm.instance.clone(),
                state: TrialState::Completed,
                groups,
            });
        }

        if self.options.teardown {
            for (arm, outcome) in arms.iter_mut().zip(outcomes.iter_mut()) {
                self.service
                    .stop(&arm.instance)
                    .map_err(|err| aborted(err, &arm.instance))?;
                arm.transition(TrialState::Stopped);
                outcome.state = TrialState::Stopped;
                info!(instance = %arm.instance, "trial stopped");
            }
        }
        Ok(outcomes)
    }
}

/// Attaches full feature records to the memberships reported by a service.
pub fn resolve_groups(
    memberships: &[GroupMembership],
    stream: &SubjectStream,
    instance: &str,
) -> Result<Vec<Group>, TrialError> {
    let ledger = stream.ledger();
    let mut seen = BTreeSet::new();
    let mut groups = Vec::with_capacity(memberships.len());
    for membership in memberships {
        let mut subjects = Vec::with_capacity(membership.subject_ids.len());
        for id in &membership.subject_ids {
            let subject = ledger.get(id.as_str()).ok_or_else(|| {
                TrialError::TrialAborted(
                    ErrorInfo::new("unknown-member", "service reported a subject never submitted")
                        .with_context("instance", instance.to_string())
                        .with_context("subject", id.clone()),
                )
            })?;
            if !seen.insert(id.as_str()) {
                return Err(TrialError::AssignmentInvariant(
                    ErrorInfo::new("duplicate-membership", "subject reported in two groups")
                        .with_context("instance", instance.to_string())
                        .with_context("subject", id.clone()),
                ));
            }
            subjects.push((*subject).clone());
        }
        groups.push(Group {
            name: membership.name.clone(),
            subjects,
        });
    }
    if seen.len() != stream.len() {
        let missing: Vec<&str> = stream
            .subjects()
            .iter()
            .map(|subject| subject.id.as_str())
            .filter(|id| !seen.contains(id))
            .collect();
        return Err(TrialError::AssignmentInvariant(
            ErrorInfo::new("unassigned-subject", "submitted subjects missing from every group")
                .with_context("instance", instance.to_string())
                .with_context("missing", missing.join(",")),
        ));
    }
    Ok(groups)
}

// Service failures abort the trial; a config conflict keeps its own family.
fn aborted(err: TrialError, instance: &str) -> TrialError {
    if matches!(err, TrialError::ProtocolConflict(_)) {
        return err.with_context("instance", instance.to_string());
    }
    let mut info = ErrorInfo::new("service-failure", err.to_string())
        .with_context("instance", instance.to_string())
        .with_context("cause", err.family());
    for (key, value) in &err.info().context {
        info.context.entry(key.clone()).or_insert_with(|| value.clone());
    }
    TrialError::TrialAborted(info)
}
