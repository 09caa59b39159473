use trialbal_core::{Features, GroupMembership, ProtocolConfig, TrialError};

/// Request/response contract of an allocation service.
///
/// Every call is a blocking round trip scoped to one protocol instance. The
/// trial driver issues calls strictly in sequence and never overlaps two
/// requests against the same instance.
pub trait AllocationService {
    /// Starts `instance` with `config`.
    ///
    /// Resubmitting an identical configuration is a no-op; a different
    /// configuration fails with [`TrialError::ProtocolConflict`].
    fn start(&mut self, instance: &str, config: &ProtocolConfig) -> Result<(), TrialError>;

    /// Registers or revises a subject without forcing its assignment.
    fn submit(&mut self, instance: &str, subject: &str, features: &Features) -> Result<(), TrialError>;

    /// Registers a subject and returns its group, forcing assignment if needed.
    fn submit_and_assign(
        &mut self,
        instance: &str,
        subject: &str,
        features: &Features,
    ) -> Result<String, TrialError>;

    /// Returns the group of `subject`, assigning pending subjects until it has one.
    fn get_group(&mut self, instance: &str, subject: &str) -> Result<String, TrialError>;

    /// Forces assignment of every pending subject.
    fn assign_all(&mut self, instance: &str) -> Result<(), TrialError>;

    /// Lists the current membership of every group.
    fn get_groups(&mut self, instance: &str) -> Result<Vec<GroupMembership>, TrialError>;

    /// Tears the instance down; later calls on it fail with [`TrialError::NotFound`].
    fn stop(&mut self, instance: &str) -> Result<(), TrialError>;
}

impl<S: AllocationService + ?Sized> AllocationService for Box<S> {
    fn start(&mut self, instance: &str, config: &ProtocolConfig) -> Result<(), TrialError> {
        (**self).start(instance, config)
    }

    fn submit(&mut self, instance: &str, subject: &str, features: &Features) -> Result<(), TrialError> {
        (**self).submit(instance, subject, features)
    }

    fn submit_and_assign(
        &mut self,
        instance: &str,
        subject: &str,
        features: &Features,
    ) -> Result<String, TrialError> {
        (**self).submit_and_assign(instance, subject, features)
    }

    fn get_group(&mut self, instance: &str, subject: &str) -> Result<String, TrialError> {
        (**self).get_group(instance, subject)
    }

    fn assign_all(&mut self, instance: &str) -> Result<(), TrialError> {
        (**self).assign_all(instance)
    }

    fn get_groups(&mut self, instance: &str) -> Result<Vec<GroupMembership>, TrialError> {
        (**self).get_groups(instance)
    }

    fn stop(&mut self, instance: &str) -> Result<(), TrialError> {
        (**self).stop(instance)
    }
}
