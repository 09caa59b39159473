use nalgebra::DMatrix;
use trialbal_core::{
    CovariateKind, CovariateSpec, ErrorInfo, FeatureValue, Features, Subject, TrialError,
};

/// Pairwise subject similarity over a fixed covariate set.
///
/// Continuous covariates score `exp(-|a - b| / scale)`, categorical ones score
/// 1 on exact level equality and 0 otherwise. The aggregate is the arithmetic
/// mean over covariates, so the result lies in `[0, 1]` and is symmetric.
#[derive(Debug, Clone, PartialEq)]
pub struct SimilarityModel {
    covariates: Vec<CovariateSpec>,
}

impl SimilarityModel {
    /// Builds a model over the given covariates. An empty set is rejected.
    pub fn new<'a, I>(covariates: I) -> Result<Self, TrialError>
    where
        I: IntoIterator<Item = &'a CovariateSpec>,
    {
        let covariates: Vec<CovariateSpec> = covariates.into_iter().cloned().collect();
        if covariates.is_empty() {
            return Err(TrialError::InsufficientData(ErrorInfo::new(
                "empty-covariate-set",
                "similarity needs at least one covariate",
            )));
        }
        Ok(Self { covariates })
    }

    /// Covariates the model compares, in order.
    pub fn covariates(&self) -> &[CovariateSpec] {
        &self.covariates
    }

    /// Similarity of two feature maps.
    pub fn similarity(&self, a: &Features, b: &Features) -> Result<f64, TrialError> {
        let mut total = 0.0;
        for spec in &self.covariates {
            let lhs = lookup(a, &spec.name)?;
            let rhs = lookup(b, &spec.name)?;
            total += covariate_similarity(spec, lhs, rhs)?;
        }
        Ok(total / self.covariates.len() as f64)
    }

    /// Full symmetric similarity matrix over `subjects`, in the given order.
    pub fn matrix(&self, subjects: &[&Subject]) -> Result<DMatrix<f64>, TrialError> {
        let n = subjects.len();
        let mut matrix = DMatrix::<f64>::zeros(n, n);
        for i in 0..n {
            matrix[(i, i)] = self.similarity(&subjects[i].features, &subjects[i].features)?;
            for j in (i + 1)..n {
                let value = self.similarity(&subjects[i].features, &subjects[j].features)?;
                matrix[(i, j)] = value;
                matrix[(j, i)] = value;
            }
        }
        Ok(matrix)
    }
}

fn lookup<'a>(features: &'a Features, name: &str) -> Result<&'a FeatureValue, TrialError> {
    features.get(name).ok_or_else(|| {
        TrialError::InsufficientData(
            ErrorInfo::new("missing-feature", "feature map lacks a compared covariate")
                .with_context("covariate", name.to_string()),
        )
    })
}

fn covariate_similarity(
    spec: &CovariateSpec,
    lhs: &FeatureValue,
    rhs: &FeatureValue,
) -> Result<f64, TrialError> {
    match (&spec.kind, lhs, rhs) {
        (CovariateKind::Continuous { scale }, FeatureValue::Continuous(a), FeatureValue::Continuous(b)) => {
            Ok((-(a - b).abs() / scale).exp())
        }
        (CovariateKind::Categorical { .. }, FeatureValue::Categorical(a), FeatureValue::Categorical(b)) => {
            Ok(if a == b { 1.0 } else { 0.0 })
        }
        _ => Err(TrialError::InvalidData(
            ErrorInfo::new("kind-mismatch", "feature kind does not match covariate kind")
                .with_context("covariate", spec.name.clone()),
        )),
    }
}
