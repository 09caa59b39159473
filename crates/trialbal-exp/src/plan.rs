use std::path::Path;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use trialbal_core::{Algorithm, CovariateSpec, ErrorInfo, ProtocolConfig, TrialError};

use crate::codec::{read_yaml, stable_hash_string, write_yaml};
use crate::generator::FeatureGenerator;

fn invalid_plan(code: &str, message: &str) -> TrialError {
    TrialError::InvalidData(ErrorInfo::new(code, message))
}

/// Covariate kinds making up a protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mix {
    /// Continuous covariates only.
    Continuous,
    /// Categorical covariates only.
    Categorical,
    /// Continuous and categorical covariates interleaved.
    Mixed,
}

impl Mix {
    /// Lowercase label used in protocol names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Mix::Continuous => "continuous",
            Mix::Categorical => "categorical",
            Mix::Mixed => "mixed",
        }
    }
}

/// Sweep description loaded from YAML.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentPlan {
    /// Plan label recorded in reports.
    pub name: String,
    /// Master seed for every subject stream.
    #[serde(default = "ExperimentPlan::default_seed")]
    pub seed: u64,
    /// Pool of group labels; a configuration with `n` groups uses the first `n`.
    #[serde(default = "ExperimentPlan::default_group_names")]
    pub group_names: Vec<String>,
    /// Group counts to sweep.
    #[serde(default = "ExperimentPlan::default_group_counts")]
    pub group_counts: Vec<usize>,
    /// Numbers of covariates the allocator sees.
    #[serde(default = "ExperimentPlan::default_covariate_counts")]
    pub covariate_counts: Vec<usize>,
    /// Covariate kind mixes to sweep.
    #[serde(default = "ExperimentPlan::default_mixes")]
    pub mixes: Vec<Mix>,
    /// Number of covariates measured on every subject.
    #[serde(default = "ExperimentPlan::default_template_width")]
    pub template_width: usize,
    /// Continuous covariate names in template order.
    #[serde(default = "ExperimentPlan::default_continuous")]
    pub continuous: Vec<String>,
    /// Categorical covariates and their levels in template order.
    #[serde(default = "ExperimentPlan::default_categorical")]
    pub categorical: IndexMap<String, Vec<String>>,
    /// Delayed-assignment window sizes to sweep.
    #[serde(default = "ExperimentPlan::default_placement_intervals")]
    pub placement_intervals: Vec<usize>,
    /// Repetitions of every configuration.
    #[serde(default = "ExperimentPlan::default_repetitions")]
    pub repetitions: usize,
    /// Subjects per trial.
    #[serde(default = "ExperimentPlan::default_subject_count")]
    pub subject_count: usize,
    /// Revision policy of every protocol.
    #[serde(default)]
    pub allow_revision: bool,
    /// Similarity scale of continuous covariates.
    #[serde(default = "ExperimentPlan::default_similarity_scale")]
    pub similarity_scale: f64,
    /// Diversity viewpoint `q`.
    #[serde(default)]
    pub viewpoint: f64,
    /// Stop protocol instances after evaluation.
    #[serde(default = "ExperimentPlan::default_teardown")]
    pub teardown: bool,
    /// Synthetic feature distributions.
    #[serde(default)]
    pub generator: FeatureGenerator,
}

impl ExperimentPlan {
    const fn default_seed() -> u64 {
        2008
    }

    fn default_group_names() -> Vec<String> {
        ["W", "X", "Y", "Z"].iter().map(|s| s.to_string()).collect()
    }

    fn default_group_counts() -> Vec<usize> {
        vec![2, 3, 4]
    }

    fn default_covariate_counts() -> Vec<usize> {
        vec![1, 2]
    }

    fn default_mixes() -> Vec<Mix> {
        vec![Mix::Continuous, Mix::Categorical, Mix::Mixed]
    }

    const fn default_template_width() -> usize {
        4
    }

    fn default_continuous() -> Vec<String> {
        ["score", "age", "shoesize", "iq"].iter().map(|s| s.to_string()).collect()
    }

    fn default_categorical() -> IndexMap<String, Vec<String>> {
        let table: [(&str, &[&str]); 4] = [
            ("state", &["Iowa", "Ohio", "Illinois", "Pennsylvania"]),
            ("fruit", &["apple", "banana", "cherry", "durian"]),
            ("mouse", &["micky", "minnie"]),
            ("student", &["BS", "MS", "PhD"]),
        ];
        table
            .iter()
            .map(|(name, levels)| {
                (
                    name.to_string(),
                    levels.iter().map(|level| level.to_string()).collect(),
                )
            })
            .collect()
    }

    fn default_placement_intervals() -> Vec<usize> {
        vec![0, 3]
    }

    const fn default_repetitions() -> usize {
        2
    }

    const fn default_subject_count() -> usize {
        10
    }

    const fn default_similarity_scale() -> f64 {
        trialbal_core::DEFAULT_SIMILARITY_SCALE
    }

    const fn default_teardown() -> bool {
        true
    }

    /// The regression sweep under `name`, every field at its default.
    pub fn with_defaults(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            seed: Self::default_seed(),
            group_names: Self::default_group_names(),
            group_counts: Self::default_group_counts(),
            covariate_counts: Self::default_covariate_counts(),
            mixes: Self::default_mixes(),
            template_width: Self::default_template_width(),
            continuous: Self::default_continuous(),
            categorical: Self::default_categorical(),
            placement_intervals: Self::default_placement_intervals(),
            repetitions: Self::default_repetitions(),
            subject_count: Self::default_subject_count(),
            allow_revision: false,
            similarity_scale: Self::default_similarity_scale(),
            viewpoint: 0.0,
            teardown: Self::default_teardown(),
            generator: FeatureGenerator::default(),
        }
    }

    /// SHA-256 over the canonical JSON of the plan and its seed.
    pub fn plan_hash(&self) -> Result<String, TrialError> {
        stable_hash_string(&(self, self.seed))
    }

    /// Serializes the plan to YAML.
    pub fn to_yaml_string(&self) -> Result<String, TrialError> {
        serde_yaml::to_string(self)
            .map_err(|err| TrialError::Serde(ErrorInfo::new("yaml-serialize", err.to_string())))
    }

    /// Rejects plans whose enumeration would build invalid protocols.
    pub fn validate(&self) -> Result<(), TrialError> {
        for &count in &self.group_counts {
            if count < 2 || count > self.group_names.len() {
                return Err(invalid_plan("group-count", "group count must lie in 2..=pool size")
                    .with_context("count", count.to_string()));
            }
        }
        for &count in &self.covariate_counts {
            if count == 0 || count > self.template_width {
                return Err(invalid_plan("covariate-count", "covariate count must lie in 1..=template width")
                    .with_context("count", count.to_string()));
            }
        }
        if self.repetitions == 0 {
            return Err(invalid_plan("repetitions", "at least one repetition is required"));
        }
        if !(self.similarity_scale.is_finite() && self.similarity_scale > 0.0) {
            return Err(invalid_plan("similarity-scale", "similarity scale must be positive"));
        }
        if self.viewpoint.is_nan() || self.viewpoint < 0.0 {
            return Err(invalid_plan("viewpoint", "viewpoint must be non-negative"));
        }
        for &mix in &self.mixes {
            let available = self.covariate_pool(mix).len();
            if available < self.template_width {
                return Err(invalid_plan("template-width", "not enough covariates for the template")
                    .with_context("mix", mix.as_str())
                    .with_context("available", available.to_string()));
            }
        }
        Ok(())
    }

    fn continuous_specs(&self) -> Vec<CovariateSpec> {
        self.continuous
            .iter()
            .map(|name| CovariateSpec::continuous(name.clone()).with_scale(self.similarity_scale))
            .collect()
    }

    fn categorical_specs(&self) -> Vec<CovariateSpec> {
        self.categorical
            .iter()
            .map(|(name, levels)| CovariateSpec::categorical(name.clone(), levels.iter().cloned()))
            .collect()
    }

    fn covariate_pool(&self, mix: Mix) -> Vec<CovariateSpec> {
        match mix {
            Mix::Continuous => self.continuous_specs(),
            Mix::Categorical => self.categorical_specs(),
            Mix::Mixed => self
                .continuous_specs()
                .into_iter()
                .zip(self.categorical_specs())
                .flat_map(|(a, b)| [a, b])
                .collect(),
        }
    }

    /// Enumerates every configuration in sweep order.
    ///
    /// Repetition is the outermost loop, then group count, covariate count,
    /// mix and placement interval. `Mixed` is only enumerated for more than one covariate.
    pub fn configurations(&self) -> Result<Vec<ExperimentConfiguration>, TrialError> {
        self.validate()?;
        let mut protocols = Vec::new();
        for &n_groups in &self.group_counts {
            for &n_covariates in &self.covariate_counts {
                for &mix in &self.mixes {
                    if mix == Mix::Mixed && n_covariates < 2 {
                        continue;
                    }
                    let pool = self.covariate_pool(mix);
                    let template: Vec<CovariateSpec> =
                        pool.into_iter().take(self.template_width).collect();
                    let used: Vec<CovariateSpec> = template.iter().take(n_covariates).cloned().collect();
                    protocols.push((n_groups, n_covariates, mix, template, used));
                }
            }
        }

        let mut configurations = Vec::new();
        for repetition in 0..self.repetitions {
            for (n_groups, n_covariates, mix, template, used) in &protocols {
                for &placement_interval in &self.placement_intervals {
                    let index = configurations.len();
                    configurations.push(ExperimentConfiguration {
                        index,
                        experiment_id: index + 1,
                        repetition: format!("P{repetition:02}"),
                        protocol_name: format!("{n_groups}_{n_covariates}_{}", mix.as_str()),
                        group_names: self.group_names[..*n_groups].to_vec(),
                        mix: *mix,
                        placement_interval,
                        subject_count: self.subject_count,
                        allow_revision: self.allow_revision,
                        template: template.clone(),
                        used: used.clone(),
                    });
                }
            }
        }
        Ok(configurations)
    }
}

/// One point of the sweep, compared under both algorithms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentConfiguration {
    /// Zero-based position in sweep order; also the RNG substream.
    pub index: usize,
    /// One-based experiment number reported in result rows.
    pub experiment_id: usize,
    /// Repetition label, `P00`, `P01`, ...
    pub repetition: String,
    /// `{groups}_{covariates}_{mix}`.
    pub protocol_name: String,
    /// Group labels.
    pub group_names: Vec<String>,
    /// Covariate mix.
    pub mix: Mix,
    /// Delayed-assignment window.
    pub placement_interval: usize,
    /// Subjects per trial.
    pub subject_count: usize,
    /// Revision policy.
    pub allow_revision: bool,
    /// Every covariate measured on subjects.
    pub template: Vec<CovariateSpec>,
    /// Leading subset of the template the allocator sees.
    pub used: Vec<CovariateSpec>,
}

impl ExperimentConfiguration {
    /// Protocol configuration for `algorithm`.
    pub fn protocol(&self, algorithm: Algorithm) -> Result<ProtocolConfig, TrialError> {
        ProtocolConfig::new(
            self.group_names.iter().cloned(),
            self.used.clone(),
            self.allow_revision,
            algorithm,
        )
    }

    /// Instance id, unique per repetition, algorithm, interval and subject count.
    pub fn instance_id(&self, algorithm: Algorithm) -> String {
        format!(
            "{}_{}{}{}{}",
            self.protocol_name, self.repetition, algorithm, self.placement_interval, self.subject_count
        )
    }

    /// True when `covariate` is visible to the allocator.
    pub fn is_used(&self, covariate: &str) -> bool {
        self.used.iter().any(|spec| spec.name == covariate)
    }
}

/// Loads and validates an [`ExperimentPlan`] from a YAML file.
pub fn load_plan<P: AsRef<Path>>(path: P) -> Result<ExperimentPlan, TrialError> {
    let plan: ExperimentPlan = read_yaml(path.as_ref())?;
    plan.validate()?;
    Ok(plan)
}

/// Writes `plan` as YAML, creating parent directories.
pub fn write_plan<P: AsRef<Path>>(path: P, plan: &ExperimentPlan) -> Result<(), TrialError> {
    write_yaml(path.as_ref(), plan)
}
