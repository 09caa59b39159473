//! Protocol and covariate descriptors.

use std::collections::BTreeSet;
use std::fmt;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::errors::{ErrorInfo, TrialError};
use crate::subject::FeatureValue;

/// Smoothing constant used by continuous similarity when none is configured.
pub const DEFAULT_SIMILARITY_SCALE: f64 = 25.0;

/// Measurement kind of a covariate together with the fields that kind requires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum CovariateKind {
    /// Real valued measurement compared through an exponential kernel.
    Continuous {
        /// Distance at which similarity has decayed to `1/e`.
        #[serde(default = "CovariateKind::default_scale")]
        scale: f64,
    },
    /// Measurement restricted to a fixed ordered set of levels.
    Categorical {
        /// Permissible values in declaration order.
        levels: Vec<String>,
    },
}

impl CovariateKind {
    fn default_scale() -> f64 {
        DEFAULT_SIMILARITY_SCALE
    }

    /// Short lowercase label (`continuous` or `categorical`).
    pub fn label(&self) -> &'static str {
        match self {
            CovariateKind::Continuous { .. } => "continuous",
            CovariateKind::Categorical { .. } => "categorical",
        }
    }
}

/// Definition of a single measured covariate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CovariateSpec {
    /// Unique name within a protocol.
    pub name: String,
    /// Kind-specific description.
    #[serde(flatten)]
    pub kind: CovariateKind,
}

impl CovariateSpec {
    /// Creates a continuous covariate with the default similarity scale.
    pub fn continuous(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: CovariateKind::Continuous {
                scale: DEFAULT_SIMILARITY_SCALE,
            },
        }
    }

    /// Creates a categorical covariate with the provided ordered levels.
    pub fn categorical<I, S>(name: impl Into<String>, levels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            kind: CovariateKind::Categorical {
                levels: levels.into_iter().map(Into::into).collect(),
            },
        }
    }

    /// Returns a copy with the continuous similarity scale replaced.
    pub fn with_scale(mut self, new_scale: f64) -> Self {
        if let CovariateKind::Continuous { scale } = &mut self.kind {
            *scale = new_scale;
        }
        self
    }

    /// True when the covariate is categorical.
    pub fn is_categorical(&self) -> bool {
        matches!(self.kind, CovariateKind::Categorical { .. })
    }

    /// Checks that `value` has the right kind and, for categoricals, a declared level.
    pub fn check_value(&self, value: &FeatureValue) -> Result<(), TrialError> {
        match (&self.kind, value) {
            (CovariateKind::Continuous { .. }, FeatureValue::Continuous(x)) if x.is_finite() => {
                Ok(())
            }
            (CovariateKind::Continuous { .. }, FeatureValue::Continuous(x)) => {
                Err(TrialError::InvalidData(
                    ErrorInfo::new("non-finite-value", "continuous value must be finite")
                        .with_context("covariate", self.name.clone())
                        .with_context("value", x.to_string()),
                ))
            }
            (CovariateKind::Categorical { levels }, FeatureValue::Categorical(level)) => {
                if levels.iter().any(|candidate| candidate == level) {
                    Ok(())
                } else {
                    Err(TrialError::InvalidData(
                        ErrorInfo::new("unknown-level", "value is not a declared level")
                            .with_context("covariate", self.name.clone())
                            .with_context("value", level.clone()),
                    ))
                }
            }
            _ => Err(TrialError::InvalidData(
                ErrorInfo::new("kind-mismatch", "value kind does not match covariate kind")
                    .with_context("covariate", self.name.clone())
                    .with_context("expected", self.kind.label()),
            )),
        }
    }

    fn validate(&self) -> Result<(), TrialError> {
        if self.name.trim().is_empty() {
            return Err(invalid_config("empty-covariate-name", "covariate name is empty"));
        }
        match &self.kind {
            CovariateKind::Continuous { scale } => {
                if !(scale.is_finite() && *scale > 0.0) {
                    return Err(invalid_config(
                        "invalid-scale",
                        "continuous scale must be positive and finite",
                    )
                    .with_context("covariate", self.name.clone()));
                }
            }
            CovariateKind::Categorical { levels } => {
                if levels.is_empty() {
                    return Err(invalid_config("no-levels", "categorical covariate has no levels")
                        .with_context("covariate", self.name.clone()));
                }
                let distinct: BTreeSet<&String> = levels.iter().collect();
                if distinct.len() != levels.len() {
                    return Err(invalid_config("duplicate-level", "levels must be distinct")
                        .with_context("covariate", self.name.clone()));
                }
            }
        }
        Ok(())
    }
}

/// Allocation algorithm requested from the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Algorithm {
    /// Fill groups round-robin without looking at covariates.
    Alternating,
    /// Minimise covariate imbalance between groups.
    Balanced,
}

impl Algorithm {
    /// Both algorithms in the order paired comparisons run them.
    pub const ALL: [Algorithm; 2] = [Algorithm::Alternating, Algorithm::Balanced];

    /// Wire tag for the algorithm.
    pub fn as_str(&self) -> &'static str {
        match self {
            Algorithm::Alternating => "Alternating",
            Algorithm::Balanced => "Balanced",
        }
    }
}

impl fmt::Display for Algorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Immutable description of one protocol instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolConfig {
    /// Labels of the intervention groups.
    pub group_names: Vec<String>,
    /// Covariates keyed by name, in declaration order.
    pub covariates: IndexMap<String, CovariateSpec>,
    /// Whether an uncommitted subject may be resubmitted with new values.
    pub allow_revision: bool,
    /// Allocation algorithm run by the service.
    pub algorithm: Algorithm,
}

impl ProtocolConfig {
    /// Builds and validates a protocol configuration.
    pub fn new<G, S>(
        group_names: G,
        covariates: Vec<CovariateSpec>,
        allow_revision: bool,
        algorithm: Algorithm,
    ) -> Result<Self, TrialError>
    where
        G: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let group_names: Vec<String> = group_names.into_iter().map(Into::into).collect();
        let mut map = IndexMap::with_capacity(covariates.len());
        for spec in covariates {
            if map.contains_key(&spec.name) {
                return Err(invalid_config("duplicate-covariate", "covariate names must be unique")
                    .with_context("covariate", spec.name.clone()));
            }
            map.insert(spec.name.clone(), spec);
        }
        let config = Self {
            group_names,
            covariates: map,
            allow_revision,
            algorithm,
        };
        config.validate()?;
        Ok(config)
    }

    /// Checks group and covariate invariants.
    pub fn validate(&self) -> Result<(), TrialError> {
        if self.group_names.len() < 2 {
            return Err(invalid_config("too-few-groups", "at least two groups are required")
                .with_context("groups", self.group_names.len().to_string()));
        }
        let distinct: BTreeSet<&String> = self.group_names.iter().collect();
        if distinct.len() != self.group_names.len() {
            return Err(invalid_config("duplicate-group", "group names must be distinct"));
        }
        if self.covariates.is_empty() {
            return Err(invalid_config("no-covariates", "at least one covariate is required"));
        }
        for (key, spec) in &self.covariates {
            if key != &spec.name {
                return Err(invalid_config("covariate-key-mismatch", "map key differs from name")
                    .with_context("key", key.clone())
                    .with_context("name", spec.name.clone()));
            }
            spec.validate()?;
        }
        Ok(())
    }

    /// Structural comparison used to decide whether a restart is a no-op.
    ///
    /// Group order is irrelevant; covariates, revision policy and algorithm must agree.
    pub fn matches(&self, other: &ProtocolConfig) -> bool {
        let mine: BTreeSet<&String> = self.group_names.iter().collect();
        let theirs: BTreeSet<&String> = other.group_names.iter().collect();
        mine == theirs
            && self.group_names.len() == other.group_names.len()
            && self.covariates == other.covariates
            && self.allow_revision == other.allow_revision
            && self.algorithm == other.algorithm
    }

    /// Returns a copy running a different algorithm.
    pub fn with_algorithm(&self, algorithm: Algorithm) -> Self {
        Self {
            algorithm,
            ..self.clone()
        }
    }

    /// Looks up a covariate by name.
    pub fn covariate(&self, name: &str) -> Option<&CovariateSpec> {
        self.covariates.get(name)
    }

    /// Iterates covariate specs in declaration order.
    pub fn covariate_specs(&self) -> impl Iterator<Item = &CovariateSpec> {
        self.covariates.values()
    }
}

fn invalid_config(code: &str, message: &str) -> TrialError {
    TrialError::InvalidData(ErrorInfo::new(code, message))
}
