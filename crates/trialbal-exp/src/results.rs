use serde::{Deserialize, Serialize};
use trialbal_core::{Algorithm, TrialError};

/// Evaluation of one covariate for one trial instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultRow {
    pub algorithm: Algorithm,
    pub n_subjects: usize,
    pub n_groups: usize,
    pub n_covariates: usize,
    pub placement_interval: usize,
    pub experiment_id: usize,
    pub covariate_name: String,
    pub is_used: bool,
    pub pvalue: f64,
    pub diversity_all: f64,
    pub diversity_used: f64,
}

impl ResultRow {
    /// Column names in table order.
    pub const COLUMNS: [&'static str; 11] = [
        "algorithm",
        "n_subjects",
        "n_groups",
        "n_covariates",
        "placement_interval",
        "experiment_id",
        "covariate_name",
        "is_used",
        "pvalue",
        "diversity_all",
        "diversity_used",
    ];

    /// Values rendered as strings in [`ResultRow::COLUMNS`] order.
    pub fn to_record(&self) -> Vec<String> {
        vec![
            self.algorithm.to_string(),
            self.n_subjects.to_string(),
            self.n_groups.to_string(),
            self.n_covariates.to_string(),
            self.placement_interval.to_string(),
            self.experiment_id.to_string(),
            self.covariate_name.clone(),
            self.is_used.to_string(),
            self.pvalue.to_string(),
            self.diversity_all.to_string(),
            self.diversity_used.to_string(),
        ]
    }
}

/// Something the sweep skipped, and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub experiment_id: usize,
    /// Algorithm of the affected row, absent when the whole configuration failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<Algorithm>,
    /// Covariate of the affected row, absent when the whole configuration failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub covariate_name: Option<String>,
    pub error: TrialError,
}

/// Aggregate outcome of a sweep.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SweepReport {
    pub plan_name: String,
    pub plan_hash: String,
    /// Configurations enumerated.
    pub configurations: usize,
    /// Configurations whose paired trials completed and were evaluated.
    pub completed: usize,
    pub rows: Vec<ResultRow>,
    pub failures: Vec<FailureRecord>,
}
