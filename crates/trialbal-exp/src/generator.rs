use indexmap::IndexMap;
use rand::seq::SliceRandom;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use trialbal_core::{
    CovariateKind, CovariateSpec, ErrorInfo, FeatureValue, Features, RngHandle, Subject, TrialError,
};

/// Distribution parameters for synthetic subjects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureGenerator {
    /// Mean of continuous draws.
    #[serde(default = "FeatureGenerator::default_mean")]
    pub continuous_mean: f64,
    /// Standard deviation of continuous draws.
    #[serde(default = "FeatureGenerator::default_sd")]
    pub continuous_sd: f64,
}

impl FeatureGenerator {
    const fn default_mean() -> f64 {
        50.0
    }

    const fn default_sd() -> f64 {
        20.0
    }

    /// Draws `count` subjects with a value for every covariate in `template`.
    ///
    /// Continuous values are Gaussian, categorical values uniform over the
    /// declared levels. Ids run `S001`, `S002`, and so on.
    pub fn generate(
        &self,
        template: &[CovariateSpec],
        count: usize,
        rng: &mut RngHandle,
    ) -> Result<SubjectStream, TrialError> {
        let normal = Normal::new(self.continuous_mean, self.continuous_sd).map_err(|err| {
            TrialError::InvalidData(
                ErrorInfo::new("generator-params", err.to_string())
                    .with_context("mean", self.continuous_mean.to_string())
                    .with_context("sd", self.continuous_sd.to_string()),
            )
        })?;
        let mut subjects = Vec::with_capacity(count);
        for idx in 0..count {
            let mut features = Features::with_capacity(template.len());
            for spec in template {
                let value = match &spec.kind {
                    CovariateKind::Continuous { .. } => FeatureValue::Continuous(normal.sample(rng)),
                    CovariateKind::Categorical { levels } => {
                        let level = levels.choose(rng).ok_or_else(|| {
                            TrialError::InvalidData(
                                ErrorInfo::new("no-levels", "categorical covariate has no levels")
                                    .with_context("covariate", spec.name.clone()),
                            )
                        })?;
                        FeatureValue::Categorical(level.clone())
                    }
                };
                features.insert(spec.name.clone(), value);
            }
            subjects.push(Subject::new(subject_id(idx + 1), features));
        }
        Ok(SubjectStream { subjects })
    }
}

impl Default for FeatureGenerator {
    fn default() -> Self {
        Self {
            continuous_mean: Self::default_mean(),
            continuous_sd: Self::default_sd(),
        }
    }
}

/// Zero-padded subject identifier, `S001` for `1`.
pub fn subject_id(number: usize) -> String {
    format!("S{number:03}")
}

/// Ordered synthetic subjects shared by both arms of a paired comparison.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubjectStream {
    subjects: Vec<Subject>,
}

impl SubjectStream {
    /// Wraps an explicit list of subjects.
    pub fn from_subjects(subjects: Vec<Subject>) -> Self {
        Self { subjects }
    }

    /// Subjects in submission order.
    pub fn subjects(&self) -> &[Subject] {
        &self.subjects
    }

    /// Number of subjects.
    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    /// True when the stream is empty.
    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    /// Full feature ledger keyed by subject id.
    pub fn ledger(&self) -> IndexMap<&str, &Subject> {
        self.subjects
            .iter()
            .map(|subject| (subject.id.as_str(), subject))
            .collect()
    }
}
