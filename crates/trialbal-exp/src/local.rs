use std::collections::BTreeMap;

use indexmap::IndexMap;
use tracing::debug;
use trialbal_core::{ErrorInfo, Features, GroupMembership, ProtocolConfig, TrialError};

use crate::allocator::{encode, place, Encoded, RunningMoments};
use crate::service::AllocationService;

#[derive(Debug, Clone)]
struct SubjectRecord {
    encoded: Encoded,
    group: Option<usize>,
    committed: bool,
}

#[derive(Debug, Clone)]
struct ProtocolInstance {
    config: ProtocolConfig,
    // sorted group labels; indices below refer to this order
    group_names: Vec<String>,
    members: Vec<Vec<String>>,
    subjects: IndexMap<String, SubjectRecord>,
    pending: Vec<String>,
    moments: RunningMoments,
}

impl ProtocolInstance {
    fn new(config: ProtocolConfig) -> Self {
        let mut group_names = config.group_names.clone();
        group_names.sort();
        let members = vec![Vec::new(); group_names.len()];
        Self {
            config,
            group_names,
            members,
            subjects: IndexMap::new(),
            pending: Vec::new(),
            moments: RunningMoments::default(),
        }
    }

    fn validate(&self, subject: &str, features: &Features) -> Result<(), TrialError> {
        for spec in self.config.covariate_specs() {
            let value = features.get(&spec.name).ok_or_else(|| {
                TrialError::InvalidData(
                    ErrorInfo::new("missing-covariate", "subject lacks a protocol covariate")
                        .with_context("subject", subject.to_string())
                        .with_context("covariate", spec.name.clone()),
                )
            })?;
            spec.check_value(value)
                .map_err(|err| err.with_context("subject", subject.to_string()))?;
        }
        if let Some(extra) = features.keys().find(|key| self.config.covariate(key).is_none()) {
            return Err(TrialError::InvalidData(
                ErrorInfo::new("unknown-covariate", "subject carries a covariate the protocol lacks")
                    .with_context("subject", subject.to_string())
                    .with_context("covariate", extra.clone()),
            ));
        }
        Ok(())
    }

    // A revised subject leaves its group and rejoins the pending queue, so group
    // sizes may differ by more than one until it is placed again.
    fn register(&mut self, subject: &str, features: &Features) -> Result<(), TrialError> {
        self.validate(subject, features)?;
        if let Some(existing) = self.subjects.get(subject) {
            if !self.config.allow_revision || existing.committed {
                return Err(TrialError::InvalidData(
                    ErrorInfo::new("duplicate-subject", "subject already registered")
                        .with_context("subject", subject.to_string())
                        .with_context("committed", existing.committed.to_string()),
                ));
            }
            self.remove(subject);
        }
        let encoded = encode(&self.config, features);
        self.moments.encounter(&encoded);
        self.subjects.insert(
            subject.to_string(),
            SubjectRecord {
                encoded,
                group: None,
                committed: false,
            },
        );
        self.pending.push(subject.to_string());
        Ok(())
    }

    fn remove(&mut self, subject: &str) {
        if let Some(record) = self.subjects.shift_remove(subject) {
            match record.group {
                Some(group) => self.members[group].retain(|id| id != subject),
                None => self.pending.retain(|id| id != subject),
            }
        }
    }

    fn assign_one(&mut self, instance: &str) -> Result<(), TrialError> {
        let placement = {
            let groups: Vec<Vec<&Encoded>> = self
                .members
                .iter()
                .map(|ids| ids.iter().filter_map(|id| self.subjects.get(id)).map(|r| &r.encoded).collect())
                .collect();
            let pending: Vec<&Encoded> = self
                .pending
                .iter()
                .filter_map(|id| self.subjects.get(id))
                .map(|record| &record.encoded)
                .collect();
            place(self.config.algorithm, &groups, &pending, &self.moments)
        };
        let (group, pending_idx) = placement.ok_or_else(|| {
            TrialError::AssignmentInvariant(
                ErrorInfo::new("nothing-to-assign", "assignment requested with no pending subject")
                    .with_context("instance", instance.to_string()),
            )
        })?;
        let subject = self.pending.remove(pending_idx);
        if let Some(record) = self.subjects.get_mut(&subject) {
            record.group = Some(group);
        }
        debug!(instance, subject = %subject, group = %self.group_names[group], "assigned");
        self.members[group].push(subject);
        Ok(())
    }

    fn group_of(&mut self, instance: &str, subject: &str) -> Result<String, TrialError> {
        loop {
            let record = self.subjects.get(subject).ok_or_else(|| unknown_subject(instance, subject))?;
            if let Some(group) = record.group {
                return Ok(self.group_names[group].clone());
            }
            self.assign_one(instance)?;
        }
    }

    fn assign_all(&mut self, instance: &str) -> Result<(), TrialError> {
        while !self.pending.is_empty() {
            self.assign_one(instance)?;
        }
        Ok(())
    }

    fn memberships(&self) -> Vec<GroupMembership> {
        self.group_names
            .iter()
            .zip(&self.members)
            .map(|(name, ids)| GroupMembership {
                name: name.clone(),
                subject_ids: ids.clone(),
            })
            .collect()
    }
}

/// In-memory allocation service running the alternating and balanced allocators.
///
/// Instances live until [`AllocationService::stop`]; nothing is persisted.
#[derive(Debug, Clone, Default)]
pub struct LocalAllocationService {
    instances: BTreeMap<String, ProtocolInstance>,
}

impl LocalAllocationService {
    /// Creates a service with no running instances.
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks `subject` as committed; committed subjects cannot be revised.
    pub fn commit(&mut self, instance: &str, subject: &str) -> Result<(), TrialError> {
        let state = self.instance_mut(instance)?;
        let record = state
            .subjects
            .get_mut(subject)
            .ok_or_else(|| unknown_subject(instance, subject))?;
        record.committed = true;
        Ok(())
    }

    /// Reports whether `subject` has been committed.
    pub fn is_committed(&self, instance: &str, subject: &str) -> Result<bool, TrialError> {
        let state = self
            .instances
            .get(instance)
            .ok_or_else(|| unknown_instance(instance))?;
        Ok(state.subjects.get(subject).map_or(false, |record| record.committed))
    }

    /// Identifiers still waiting for a group, oldest first.
    pub fn pending(&self, instance: &str) -> Result<Vec<String>, TrialError> {
        self.instances
            .get(instance)
            .map(|state| state.pending.clone())
            .ok_or_else(|| unknown_instance(instance))
    }

    fn instance_mut(&mut self, instance: &str) -> Result<&mut ProtocolInstance, TrialError> {
        self.instances
            .get_mut(instance)
            .ok_or_else(|| unknown_instance(instance))
    }
}

impl AllocationService for LocalAllocationService {
    fn start(&mut self, instance: &str, config: &ProtocolConfig) -> Result<(), TrialError> {
        config.validate()?;
        if let Some(existing) = self.instances.get(instance) {
            if existing.config.matches(config) {
                return Ok(());
            }
            return Err(TrialError::ProtocolConflict(
                ErrorInfo::new("config-mismatch", "instance already started with another config")
                    .with_context("instance", instance.to_string()),
            ));
        }
        debug!(instance, algorithm = %config.algorithm, "protocol started");
        self.instances
            .insert(instance.to_string(), ProtocolInstance::new(config.clone()));
        Ok(())
    }

    fn submit(&mut self, instance: &str, subject: &str, features: &Features) -> Result<(), TrialError> {
        self.instance_mut(instance)?.register(subject, features)
    }

    fn submit_and_assign(
        &mut self,
        instance: &str,
        subject: &str,
        features: &Features,
    ) -> Result<String, TrialError> {
        let state = self.instance_mut(instance)?;
        state.register(subject, features)?;
        state.group_of(instance, subject)
    }

    fn get_group(&mut self, instance: &str, subject: &str) -> Result<String, TrialError> {
        self.instance_mut(instance)?.group_of(instance, subject)
    }

    fn assign_all(&mut self, instance: &str) -> Result<(), TrialError> {
        self.instance_mut(instance)?.assign_all(instance)
    }

    fn get_groups(&mut self, instance: &str) -> Result<Vec<GroupMembership>, TrialError> {
        Ok(self.instance_mut(instance)?.memberships())
    }

    fn stop(&mut self, instance: &str) -> Result<(), TrialError> {
        self.instances
            .remove(instance)
            .map(|_| ())
            .ok_or_else(|| unknown_instance(instance))
    }
}

fn unknown_instance(instance: &str) -> TrialError {
    TrialError::NotFound(
        ErrorInfo::new("unknown-instance", "no running protocol instance with this id")
            .with_context("instance", instance.to_string()),
    )
}

fn unknown_subject(instance: &str, subject: &str) -> TrialError {
    TrialError::NotFound(
        ErrorInfo::new("unknown-subject", "subject not registered with this instance")
            .with_context("instance", instance.to_string())
            .with_context("subject", subject.to_string()),
    )
}
