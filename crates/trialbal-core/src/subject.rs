//! Subjects, feature values and realised groups.

use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorInfo, TrialError};
use crate::protocol::{CovariateSpec, ProtocolConfig};

/// Value recorded for one covariate of one subject.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FeatureValue {
    /// Measurement of a continuous covariate.
    Continuous(f64),
    /// Level of a categorical covariate.
    Categorical(String),
}

impl FeatureValue {
    /// Numeric value, if continuous.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Continuous(value) => Some(*value),
            FeatureValue::Categorical(_) => None,
        }
    }

    /// Level, if categorical.
    pub fn as_level(&self) -> Option<&str> {
        match self {
            FeatureValue::Continuous(_) => None,
            FeatureValue::Categorical(level) => Some(level),
        }
    }
}

impl fmt::Display for FeatureValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FeatureValue::Continuous(value) => write!(f, "{value}"),
            FeatureValue::Categorical(level) => f.write_str(level),
        }
    }
}

/// Covariate name to value mapping, in covariate declaration order.
pub type Features = IndexMap<String, FeatureValue>;

/// A trial participant and its measured covariates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    /// Identifier, unique within a trial instance.
    pub id: String,
    /// Measured covariate values.
    pub features: Features,
}

impl Subject {
    /// Creates a subject from an identifier and feature map.
    pub fn new(id: impl Into<String>, features: Features) -> Self {
        Self {
            id: id.into(),
            features,
        }
    }

    /// Looks up the value recorded for `covariate`.
    pub fn value(&self, covariate: &str) -> Result<&FeatureValue, TrialError> {
        self.features.get(covariate).ok_or_else(|| {
            TrialError::InvalidData(
                ErrorInfo::new("missing-feature", "subject has no value for covariate")
                    .with_context("subject", self.id.clone())
                    .with_context("covariate", covariate.to_string()),
            )
        })
    }

    /// Restricts the features to the covariates of `config`, in its order.
    pub fn project(&self, config: &ProtocolConfig) -> Result<Features, TrialError> {
        self.project_onto(config.covariate_specs())
    }

    /// Restricts the features to the given covariates, in their order.
    pub fn project_onto<'a, I>(&self, covariates: I) -> Result<Features, TrialError>
    where
        I: IntoIterator<Item = &'a CovariateSpec>,
    {
        covariates
            .into_iter()
            .map(|spec| Ok((spec.name.clone(), self.value(&spec.name)?.clone())))
            .collect()
    }
}

/// Group membership as reported by an allocation service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMembership {
    /// Group label.
    pub name: String,
    /// Identifiers of the subjects assigned to the group.
    pub subject_ids: Vec<String>,
}

/// A realised group whose subjects carry resolved feature values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    /// Group label.
    pub name: String,
    /// Subjects assigned to the group.
    pub subjects: Vec<Subject>,
}

impl Group {
    /// Number of subjects in the group.
    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    /// True when the group has no subjects.
    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Collects the values of `covariate` across the group's subjects.
    pub fn values(&self, covariate: &str) -> Result<Vec<FeatureValue>, TrialError> {
        self.subjects
            .iter()
            .map(|subject| subject.value(covariate).cloned())
            .collect()
    }
}

/// Difference between the largest and smallest group sizes.
pub fn group_size_spread(groups: &[Group]) -> usize {
    let sizes = groups.iter().map(Group::len);
    let max = sizes.clone().max().unwrap_or(0);
    let min = sizes.min().unwrap_or(0);
    max - min
}
