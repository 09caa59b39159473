use serde::{Deserialize, Serialize};
use statrs::distribution::{ChiSquared, ContinuousCDF, FisherSnedecor, StudentsT};
use trialbal_core::{CovariateKind, CovariateSpec, ErrorInfo, FeatureValue, Group, TrialError};

/// Hypothesis test chosen for a covariate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BalanceTest {
    /// Student's pooled-variance two-sample t-test.
    TwoSampleT,
    /// Classic one-way analysis of variance.
    OneWayAnova,
    /// Pearson chi-squared test of independence on a levels x groups table.
    ChiSquared,
}

/// Result of one balance test.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceOutcome {
    /// Test that produced the result.
    pub test: BalanceTest,
    /// Test statistic (t, F or chi-squared).
    pub statistic: f64,
    /// Degrees of freedom; the F test reports numerator and denominator.
    pub dof: (f64, Option<f64>),
    /// Probability of a statistic at least this extreme under the null.
    pub pvalue: f64,
}

/// Knobs for the balance tester.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BalanceOptions {
    /// Apply the Yates continuity correction to one-degree-of-freedom tables.
    #[serde(default = "BalanceOptions::default_yates")]
    pub yates_correction: bool,
}

impl BalanceOptions {
    const fn default_yates() -> bool {
        true
    }
}

impl Default for BalanceOptions {
    fn default() -> Self {
        Self {
            yates_correction: Self::default_yates(),
        }
    }
}

/// Picks the test for a covariate kind and group count.
pub fn select_test(kind: &CovariateKind, n_groups: usize) -> Result<BalanceTest, TrialError> {
    if n_groups < 2 {
        return Err(TrialError::InsufficientData(
            ErrorInfo::new("too-few-groups", "balance tests compare at least two groups")
                .with_context("groups", n_groups.to_string()),
        ));
    }
    Ok(match kind {
        CovariateKind::Continuous { .. } if n_groups == 2 => BalanceTest::TwoSampleT,
        CovariateKind::Continuous { .. } => BalanceTest::OneWayAnova,
        CovariateKind::Categorical { .. } => BalanceTest::ChiSquared,
    })
}

/// Tests whether `spec` is identically distributed across the realised groups.
pub fn balance_test(spec: &CovariateSpec, groups: &[Group]) -> Result<BalanceOutcome, TrialError> {
    balance_test_with(spec, groups, &BalanceOptions::default())
}

/// Same as [`balance_test`] with explicit options.
pub fn balance_test_with(
    spec: &CovariateSpec,
    groups: &[Group],
    opts: &BalanceOptions,
) -> Result<BalanceOutcome, TrialError> {
    let samples = groups
        .iter()
        .map(|group| group.values(&spec.name))
        .collect::<Result<Vec<_>, _>>()?;
    test_samples(spec, &samples, opts).map_err(|err| err.with_context("covariate", spec.name.clone()))
}

/// Runs the dispatched test on raw per-group samples.
pub fn test_samples(
    spec: &CovariateSpec,
    samples: &[Vec<FeatureValue>],
    opts: &BalanceOptions,
) -> Result<BalanceOutcome, TrialError> {
    let outcome = match select_test(&spec.kind, samples.len())? {
        BalanceTest::TwoSampleT => {
            let numeric = numeric_samples(spec, samples)?;
            two_sample_t(&numeric[0], &numeric[1])?
        }
        BalanceTest::OneWayAnova => one_way_anova(&numeric_samples(spec, samples)?)?,
        BalanceTest::ChiSquared => {
            let table = ContingencyTable::from_samples(spec, samples)?;
            chi_squared_independence(&table, opts.yates_correction)?
        }
    };
    checked(outcome)
}

/// Two-sided pooled-variance t-test.
pub fn two_sample_t(a: &[f64], b: &[f64]) -> Result<BalanceOutcome, TrialError> {
    let (n1, n2) = (a.len(), b.len());
    if n1 == 0 || n2 == 0 || n1 + n2 < 3 {
        return Err(TrialError::InsufficientData(
            ErrorInfo::new("t-test-sizes", "t-test needs two non-empty groups and three values")
                .with_context("n1", n1.to_string())
                .with_context("n2", n2.to_string()),
        ));
    }
    let (mean_a, ss_a) = mean_and_sum_squares(a);
    let (mean_b, ss_b) = mean_and_sum_squares(b);
    let dof = (n1 + n2 - 2) as f64;
    let pooled = (ss_a + ss_b) / dof;
    let statistic = (mean_a - mean_b) / (pooled * (1.0 / n1 as f64 + 1.0 / n2 as f64)).sqrt();
    checked(BalanceOutcome {
        test: BalanceTest::TwoSampleT,
        statistic,
        dof: (dof, None),
        pvalue: student_t_two_sided(statistic, dof)?,
    })
}

/// One-way ANOVA F-test across any number of groups.
pub fn one_way_anova(samples: &[Vec<f64>]) -> Result<BalanceOutcome, TrialError> {
    let k = samples.len();
    let n: usize = samples.iter().map(Vec::len).sum();
    if k < 2 || samples.iter().any(Vec::is_empty) || n <= k {
        return Err(TrialError::InsufficientData(
            ErrorInfo::new("anova-sizes", "ANOVA needs non-empty groups and more values than groups")
                .with_context("groups", k.to_string())
                .with_context("values", n.to_string()),
        ));
    }
    let grand_mean = samples.iter().flatten().sum::<f64>() / n as f64;
    let mut between = 0.0;
    let mut within = 0.0;
    for sample in samples {
        let (mean, ss) = mean_and_sum_squares(sample);
        between += sample.len() as f64 * (mean - grand_mean).powi(2);
        within += ss;
    }
    let dof_between = (k - 1) as f64;
    let dof_within = (n - k) as f64;
    let statistic = (between / dof_between) / (within / dof_within);
    checked(BalanceOutcome {
        test: BalanceTest::OneWayAnova,
        statistic,
        dof: (dof_between, Some(dof_within)),
        pvalue: f_survival(statistic, dof_between, dof_within)?,
    })
}

/// Observed counts of a categorical covariate, levels by groups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContingencyTable {
    /// Row labels.
    pub levels: Vec<String>,
    /// Counts indexed `[level][group]`.
    pub counts: Vec<Vec<u64>>,
}

impl ContingencyTable {
    /// Tallies per-group samples against the declared levels of `spec`.
    pub fn from_samples(spec: &CovariateSpec, samples: &[Vec<FeatureValue>]) -> Result<Self, TrialError> {
        let levels = match &spec.kind {
            CovariateKind::Categorical { levels } => levels.clone(),
            CovariateKind::Continuous { .. } => {
                return Err(TrialError::InvalidData(
                    ErrorInfo::new("kind-mismatch", "contingency tables need a categorical covariate")
                        .with_context("covariate", spec.name.clone()),
                ))
            }
        };
        let mut counts = vec![vec![0u64; samples.len()]; levels.len()];
        for (column, sample) in samples.iter().enumerate() {
            for value in sample {
                spec.check_value(value)?;
                let level = value.as_level().unwrap_or_default();
                if let Some(row) = levels.iter().position(|candidate| candidate == level) {
                    counts[row][column] += 1;
                }
            }
        }
        Ok(Self { levels, counts })
    }

    /// Drops levels never observed and groups with no observations.
    pub fn pruned(&self) -> Self {
        let columns = self.counts.first().map(Vec::len).unwrap_or(0);
        let keep_columns: Vec<usize> = (0..columns)
            .filter(|&column| self.counts.iter().any(|row| row[column] > 0))
            .collect();
        let mut levels = Vec::new();
        let mut counts = Vec::new();
        for (level, row) in self.levels.iter().zip(&self.counts) {
            if row.iter().all(|count| *count == 0) {
                continue;
            }
            levels.push(level.clone());
            counts.push(keep_columns.iter().map(|&column| row[column]).collect());
        }
        Self { levels, counts }
    }

    fn shape(&self) -> (usize, usize) {
        (self.counts.len(), self.counts.first().map(Vec::len).unwrap_or(0))
    }
}

/// Chi-squared test of independence after pruning empty rows and columns.
pub fn chi_squared_independence(
    table: &ContingencyTable,
    yates_correction: bool,
) -> Result<BalanceOutcome, TrialError> {
    let table = table.pruned();
    let (rows, columns) = table.shape();
    if rows < 2 || columns < 2 {
        return Err(TrialError::DegenerateTable(
            ErrorInfo::new("table-too-small", "need at least two observed levels and two groups")
                .with_context("rows", rows.to_string())
                .with_context("columns", columns.to_string()),
        ));
    }
    let row_totals: Vec<f64> = table
        .counts
        .iter()
        .map(|row| row.iter().sum::<u64>() as f64)
        .collect();
    let column_totals: Vec<f64> = (0..columns)
        .map(|column| table.counts.iter().map(|row| row[column]).sum::<u64>() as f64)
        .collect();
    let total: f64 = row_totals.iter().sum();
    let dof = ((rows - 1) * (columns - 1)) as f64;
    let correct = yates_correction && dof == 1.0;

    let mut statistic = 0.0;
    for (row, counts) in table.counts.iter().enumerate() {
        for (column, count) in counts.iter().enumerate() {
            let expected = row_totals[row] * column_totals[column] / total;
            let mut observed = *count as f64;
            if correct {
                let diff = expected - observed;
                observed += diff.signum() * diff.abs().min(0.5);
            }
            statistic += (observed - expected).powi(2) / expected;
        }
    }
    checked(BalanceOutcome {
        test: BalanceTest::ChiSquared,
        statistic,
        dof: (dof, None),
        pvalue: chi_squared_survival(statistic, dof)?,
    })
}

fn numeric_samples(spec: &CovariateSpec, samples: &[Vec<FeatureValue>]) -> Result<Vec<Vec<f64>>, TrialError> {
    samples
        .iter()
        .map(|sample| {
            sample
                .iter()
                .map(|value| {
                    spec.check_value(value)?;
                    value.as_f64().ok_or_else(|| {
                        TrialError::InvalidData(ErrorInfo::new("kind-mismatch", "expected a number"))
                    })
                })
                .collect()
        })
        .collect()
}

fn mean_and_sum_squares(values: &[f64]) -> (f64, f64) {
    let mean = values.iter().sum::<f64>() / values.len() as f64;
    let ss = values.iter().map(|value| (value - mean).powi(2)).sum();
    (mean, ss)
}

fn student_t_two_sided(statistic: f64, dof: f64) -> Result<f64, TrialError> {
    let dist = StudentsT::new(0.0, 1.0, dof).map_err(|err| distribution_error("students-t", dof, err))?;
    Ok(2.0 * upper_tail(statistic.abs(), |x| dist.sf(x)))
}

fn f_survival(statistic: f64, dof_between: f64, dof_within: f64) -> Result<f64, TrialError> {
    let dist = FisherSnedecor::new(dof_between, dof_within)
        .map_err(|err| distribution_error("fisher-snedecor", dof_between, err))?;
    Ok(upper_tail(statistic, |x| dist.sf(x)))
}

fn chi_squared_survival(statistic: f64, dof: f64) -> Result<f64, TrialError> {
    let dist = ChiSquared::new(dof).map_err(|err| distribution_error("chi-squared", dof, err))?;
    Ok(upper_tail(statistic, |x| dist.sf(x)))
}

// NaN passes through to `checked`; statrs only sees finite statistics.
fn upper_tail(statistic: f64, sf: impl Fn(f64) -> f64) -> f64 {
    if statistic.is_nan() {
        f64::NAN
    } else if statistic == f64::INFINITY {
        0.0
    } else {
        sf(statistic)
    }
}

fn distribution_error(distribution: &str, dof: f64, err: impl ToString) -> TrialError {
    TrialError::TestComputation(
        ErrorInfo::new("bad-distribution", err.to_string())
            .with_context("distribution", distribution.to_string())
            .with_context("dof", dof.to_string()),
    )
}

fn checked(mut outcome: BalanceOutcome) -> Result<BalanceOutcome, TrialError> {
    if outcome.pvalue.is_nan() || outcome.statistic.is_nan() {
        return Err(TrialError::TestComputation(
            ErrorInfo::new("nan-result", "test produced NaN")
                .with_context("test", format!("{:?}", outcome.test))
                .with_hint("all values may be identical"),
        ));
    }
    outcome.pvalue = outcome.pvalue.clamp(0.0, 1.0);
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pruning_drops_empty_rows_and_columns() {
        let table = ContingencyTable {
            levels: vec!["a".into(), "b".into(), "c".into()],
            counts: vec![vec![2, 0, 1], vec![0, 0, 0], vec![1, 0, 3]],
        };
        let pruned = table.pruned();
        assert_eq!(pruned.levels, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(pruned.counts, vec![vec![2, 1], vec![1, 3]]);
    }

    #[test]
    fn separated_constant_groups_have_zero_pvalue() {
        let outcome = two_sample_t(&[1.0, 1.0], &[2.0, 2.0]).unwrap();
        assert!(outcome.statistic.is_infinite());
        assert_eq!(outcome.pvalue, 0.0);
    }

    #[test]
    fn survival_functions_are_one_at_zero() {
        assert!((chi_squared_survival(0.0, 1.0).unwrap() - 1.0).abs() < 1e-12);
        assert!((f_survival(0.0, 2.0, 6.0).unwrap() - 1.0).abs() < 1e-12);
        assert!((student_t_two_sided(0.0, 6.0).unwrap() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn identical_values_are_a_computation_error() {
        let err = two_sample_t(&[3.0, 3.0], &[3.0, 3.0]).unwrap_err();
        assert!(matches!(err, TrialError::TestComputation(_)));
    }
}
