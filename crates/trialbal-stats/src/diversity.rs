use std::collections::BTreeSet;

use nalgebra::{DMatrix, DVector};
use serde::{Deserialize, Serialize};
use tracing::debug;
use trialbal_core::{CovariateSpec, ErrorInfo, Group, Subject, TrialError};

use crate::similarity::SimilarityModel;

/// Similarity-sensitive diversity measures of a group partition.
///
/// Every measure is a power mean of order `1 - q` of a per-subject quantity,
/// first within each group and then across groups weighted by group size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Measure {
    /// Effective number of distinct subjects per unit of group weight.
    Alpha,
    /// Effective number of distinct subjects within each group.
    NormalizedAlpha,
    /// Redundancy of each group relative to the whole trial.
    Rho,
    /// Representativeness of each group for the whole trial.
    NormalizedRho,
    /// Distinctness of each group from the rest of the trial.
    Beta,
    /// Inverse of [`Measure::NormalizedRho`].
    NormalizedBeta,
    /// Contribution of each group to whole-trial diversity.
    Gamma,
}

/// Subjects-by-groups abundance matrix together with the subject similarity matrix.
#[derive(Debug, Clone)]
pub struct Metacommunity {
    group_names: Vec<String>,
    // subjects x groups, entries sum to one
    abundance: DMatrix<f64>,
    similarity: DMatrix<f64>,
}

impl Metacommunity {
    /// Builds the metacommunity of realised groups under `model`.
    ///
    /// Empty groups carry no weight and are left out.
    pub fn from_groups(groups: &[Group], model: &SimilarityModel) -> Result<Self, TrialError> {
        let mut seen = BTreeSet::new();
        let mut subjects: Vec<&Subject> = Vec::new();
        let mut membership: Vec<usize> = Vec::new();
        let mut group_names = Vec::new();
        for group in groups.iter().filter(|group| !group.is_empty()) {
            let column = group_names.len();
            group_names.push(group.name.clone());
            for subject in &group.subjects {
                if !seen.insert(subject.id.as_str()) {
                    return Err(TrialError::AssignmentInvariant(
                        ErrorInfo::new("duplicate-membership", "subject appears in two groups")
                            .with_context("subject", subject.id.clone()),
                    ));
                }
                subjects.push(subject);
                membership.push(column);
            }
        }
        if subjects.len() < 2 {
            return Err(TrialError::InsufficientData(
                ErrorInfo::new("too-few-subjects", "diversity needs at least two subjects")
                    .with_context("subjects", subjects.len().to_string()),
            ));
        }
        let total = subjects.len() as f64;
        let mut abundance = DMatrix::<f64>::zeros(subjects.len(), group_names.len());
        for (row, column) in membership.into_iter().enumerate() {
            abundance[(row, column)] = 1.0 / total;
        }
        let similarity = model.matrix(&subjects)?;
        Self::new(group_names, abundance, similarity)
    }

    /// Builds a metacommunity from explicit matrices.
    pub fn new(
        group_names: Vec<String>,
        abundance: DMatrix<f64>,
        similarity: DMatrix<f64>,
    ) -> Result<Self, TrialError> {
        let (rows, columns) = abundance.shape();
        if columns != group_names.len() {
            return Err(shape_error("abundance columns differ from group count"));
        }
        if similarity.shape() != (rows, rows) {
            return Err(shape_error("similarity must be square over subjects"));
        }
        if rows < 2 {
            return Err(TrialError::InsufficientData(ErrorInfo::new(
                "too-few-subjects",
                "diversity needs at least two subjects",
            )));
        }
        let total = abundance.sum();
        if !(total > 0.0) || abundance.iter().any(|value| *value < 0.0) {
            return Err(shape_error("abundances must be non-negative with positive total"));
        }
        Ok(Self {
            group_names,
            abundance: abundance / total,
            similarity,
        })
    }

    /// Group labels in column order.
    pub fn group_names(&self) -> &[String] {
        &self.group_names
    }

    /// Per-group diversity at viewpoint `q`, in column order.
    pub fn subcommunity_diversity(
        &self,
        viewpoint: f64,
        measure: Measure,
    ) -> Result<Vec<(String, f64)>, TrialError> {
        check_viewpoint(viewpoint)?;
        let order = 1.0 - viewpoint;
        let metacommunity_abundance: DVector<f64> = self.abundance.column_sum();
        let weights: DVector<f64> = self.abundance.row_sum().transpose();
        let zp = &self.similarity * &metacommunity_abundance;
        let z_abundance = &self.similarity * &self.abundance;

        let mut results = Vec::with_capacity(self.group_names.len());
        for (column, name) in self.group_names.iter().enumerate() {
            let weight = weights[column];
            if !(weight > 0.0) {
                return Err(shape_error("group with zero weight").with_context("group", name.clone()));
            }
            let mut member_weights = Vec::new();
            let mut member_values = Vec::new();
            for row in 0..self.abundance.nrows() {
                let share = self.abundance[(row, column)];
                if share <= 0.0 {
                    continue;
                }
                let zp_raw = z_abundance[(row, column)];
                let zp_normalized = zp_raw / weight;
                let value = match measure {
                    Measure::Alpha => 1.0 / zp_raw,
                    Measure::NormalizedAlpha => 1.0 / zp_normalized,
                    Measure::Rho => zp[row] / zp_raw,
                    Measure::NormalizedRho => zp[row] / zp_normalized,
                    Measure::Beta => zp_raw / zp[row],
                    Measure::NormalizedBeta => zp_normalized / zp[row],
                    Measure::Gamma => 1.0 / zp[row],
                };
                member_weights.push(share / weight);
                member_values.push(value);
            }
            let value = power_mean(order, &member_weights, &member_values);
            results.push((name.clone(), value));
        }
        Ok(results)
    }

    /// Whole-trial diversity at viewpoint `q`.
    pub fn metacommunity_diversity(&self, viewpoint: f64, measure: Measure) -> Result<f64, TrialError> {
        let per_group = self.subcommunity_diversity(viewpoint, measure)?;
        let weights: DVector<f64> = self.abundance.row_sum().transpose();
        let values: Vec<f64> = per_group.iter().map(|(_, value)| *value).collect();
        let value = power_mean(1.0 - viewpoint, weights.as_slice(), &values);
        if !value.is_finite() {
            return Err(TrialError::TestComputation(
                ErrorInfo::new("non-finite-diversity", "diversity evaluated to a non-finite value")
                    .with_context("measure", format!("{measure:?}"))
                    .with_context("viewpoint", viewpoint.to_string()),
            ));
        }
        Ok(value)
    }
}

/// Normalised redundancy of the group partition over `covariates`, capped at 1.
///
/// Values near 1 mean every group looks like the whole trial on these
/// covariates; smaller values mean the groups are distinct from each other.
pub fn normalized_rho(
    groups: &[Group],
    covariates: &[CovariateSpec],
    viewpoint: f64,
) -> Result<f64, TrialError> {
    let model = SimilarityModel::new(covariates)?;
    let metacommunity = Metacommunity::from_groups(groups, &model)?;
    let value = metacommunity.metacommunity_diversity(viewpoint, Measure::NormalizedRho)?;
    if value > 1.0 {
        debug!(value, "normalized rho above one, capping");
    }
    Ok(value.min(1.0))
}

/// Weighted power mean of order `order` over entries with positive weight.
pub fn power_mean(order: f64, weights: &[f64], values: &[f64]) -> f64 {
    let pairs = weights
        .iter()
        .zip(values.iter())
        .filter(|(weight, _)| **weight > 0.0);
    if order == f64::NEG_INFINITY {
        return pairs.map(|(_, value)| *value).fold(f64::INFINITY, f64::min);
    }
    if order == f64::INFINITY {
        return pairs.map(|(_, value)| *value).fold(f64::NEG_INFINITY, f64::max);
    }
    if order.abs() < 1e-12 {
        let log_sum: f64 = pairs.map(|(weight, value)| weight * value.ln()).sum();
        return log_sum.exp();
    }
    let sum: f64 = pairs.map(|(weight, value)| weight * value.powf(order)).sum();
    sum.powf(1.0 / order)
}

fn check_viewpoint(viewpoint: f64) -> Result<(), TrialError> {
    if viewpoint.is_nan() || viewpoint < 0.0 {
        return Err(TrialError::InvalidData(
            ErrorInfo::new("invalid-viewpoint", "viewpoint must be a non-negative number")
                .with_context("viewpoint", viewpoint.to_string()),
        ));
    }
    Ok(())
}

fn shape_error(message: &str) -> TrialError {
    TrialError::InvalidData(ErrorInfo::new("metacommunity-shape", message))
}
