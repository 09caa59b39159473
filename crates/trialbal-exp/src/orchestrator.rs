use tracing::{debug, info, warn};
use trialbal_core::{group_size_spread, Algorithm, ErrorInfo, RngHandle, TrialError};
use trialbal_stats::{balance_test_with, normalized_rho, BalanceOptions};

use crate::driver::{DriverOptions, TrialArm, TrialDriver, TrialOutcome};
use crate::plan::{ExperimentConfiguration, ExperimentPlan};
use crate::registry::{registry_append, Registry};
use crate::results::{FailureRecord, ResultRow, SweepReport};
use crate::service::AllocationService;

/// Single-writer accumulator for result rows and failures.
///
/// With a registry attached, rows are appended to it as each configuration
/// finishes so an interrupted sweep keeps what it completed.
#[derive(Debug, Default)]
pub struct ResultTable {
    rows: Vec<ResultRow>,
    failures: Vec<FailureRecord>,
    registry: Option<Registry>,
}

impl ResultTable {
    /// In-memory table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table that also appends to `registry`.
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry: Some(registry),
            ..Self::default()
        }
    }

    /// Stores the rows of one configuration.
    pub fn record(&mut self, rows: Vec<ResultRow>) -> Result<(), TrialError> {
        if let Some(registry) = &self.registry {
            if !rows.is_empty() {
                registry_append(registry, &rows)?;
            }
        }
        self.rows.extend(rows);
        Ok(())
    }

    /// Notes a skipped row or configuration.
    pub fn fail(&mut self, failure: FailureRecord) {
        self.failures.push(failure);
    }

    /// Rows recorded so far.
    pub fn rows(&self) -> &[ResultRow] {
        &self.rows
    }

    /// Failures recorded so far.
    pub fn failures(&self) -> &[FailureRecord] {
        &self.failures
    }
}

/// Checks that group sizes differ by at most one.
pub fn check_group_sizes(outcome: &TrialOutcome) -> Result<(), TrialError> {
    let spread = group_size_spread(&outcome.groups);
    if spread > 1 {
        let sizes: Vec<String> = outcome.groups.iter().map(|g| format!("{}={}", g.name, g.len())).collect();
        return Err(TrialError::AssignmentInvariant(
            ErrorInfo::new("group-size-spread", "group sizes differ by more than one")
                .with_context("instance", outcome.instance.clone())
                .with_context("sizes", sizes.join(",")),
        ));
    }
    Ok(())
}

/// Evaluates one configuration's paired outcomes into result rows.
///
/// A group-size violation in any arm fails the whole configuration. A
/// failing statistic skips only the rows it affects; those land in the
/// returned failures.
pub fn evaluate(
    config: &ExperimentConfiguration,
    outcomes: &[TrialOutcome],
    viewpoint: f64,
    balance: &BalanceOptions,
) -> Result<(Vec<ResultRow>, Vec<FailureRecord>), TrialError> {
    for outcome in outcomes {
        check_group_sizes(outcome)?;
    }
    let mut rows = Vec::new();
    let mut failures = Vec::new();
    for outcome in outcomes {
        let diversity = normalized_rho(&outcome.groups, &config.template, viewpoint).and_then(|all| {
            normalized_rho(&outcome.groups, &config.used, viewpoint).map(|used| (all, used))
        });
        let (diversity_all, diversity_used) = match diversity {
            Ok(values) => values,
            Err(error) => {
                warn!(experiment = config.experiment_id, algorithm = %outcome.algorithm, error = %error, "diversity skipped");
                failures.push(FailureRecord {
                    experiment_id: config.experiment_id,
                    algorithm: Some(outcome.algorithm),
                    covariate_name: None,
                    error,
                });
                continue;
            }
        };
        for spec in &config.template {
            match balance_test_with(spec, &outcome.groups, balance) {
                Ok(test) => rows.push(ResultRow {
                    algorithm: outcome.algorithm,
                    n_subjects: config.subject_count,
                    n_groups: config.group_names.len(),
                    n_covariates: config.used.len(),
                    placement_interval: config.placement_interval,
                    experiment_id: config.experiment_id,
                    covariate_name: spec.name.clone(),
                    is_used: config.is_used(&spec.name),
                    pvalue: test.pvalue,
                    diversity_all,
                    diversity_used,
                }),
                Err(error) => {
                    warn!(
                        experiment = config.experiment_id,
                        algorithm = %outcome.algorithm,
                        covariate = %spec.name,
                        error = %error,
                        "row skipped"
                    );
                    failures.push(FailureRecord {
                        experiment_id: config.experiment_id,
                        algorithm: Some(outcome.algorithm),
                        covariate_name: Some(spec.name.clone()),
                        error,
                    });
                }
            }
        }
    }
    Ok((rows, failures))
}

/// Runs the plan's sweep against `service`.
pub struct Orchestrator<'p> {
    plan: &'p ExperimentPlan,
    balance: BalanceOptions,
    table: ResultTable,
}

impl<'p> Orchestrator<'p> {
    /// Creates an orchestrator writing into `table`.
    pub fn new(plan: &'p ExperimentPlan, table: ResultTable) -> Self {
        Self {
            plan,
            balance: BalanceOptions::default(),
            table,
        }
    }

    /// Overrides the balance test options.
    pub fn with_balance_options(mut self, balance: BalanceOptions) -> Self {
        self.balance = balance;
        self
    }

    /// Results accumulated so far.
    pub fn table(&self) -> &ResultTable {
        &self.table
    }

    /// Runs one configuration; returns whether it produced an evaluation.
    ///
    /// Trial and configuration failures are recorded and swallowed; only
    /// registry failures propagate.
    pub fn run_configuration<S: AllocationService + ?Sized>(
        &mut self,
        config: &ExperimentConfiguration,
        service: &mut S,
    ) -> Result<bool, TrialError> {
        info!(
            experiment = config.experiment_id,
            protocol = %config.protocol_name,
            repetition = %config.repetition,
            interval = config.placement_interval,
            "configuration started"
        );
        match self.run_trials(config, service) {
            Ok(outcomes) => match evaluate(config, &outcomes, self.plan.viewpoint, &self.balance) {
                Ok((rows, failures)) => {
                    let produced = rows.len();
                    for failure in failures {
                        self.table.fail(failure);
                    }
                    self.table.record(rows)?;
                    info!(experiment = config.experiment_id, rows = produced, "configuration finished");
                    Ok(true)
                }
                Err(error) => {
                    self.fail_configuration(config, error);
                    Ok(false)
                }
            },
            Err(error) => {
                self.fail_configuration(config, error);
                Ok(false)
            }
        }
    }

    fn run_trials<S: AllocationService + ?Sized>(
        &self,
        config: &ExperimentConfiguration,
        service: &mut S,
    ) -> Result<Vec<TrialOutcome>, TrialError> {
        let mut rng = RngHandle::substream(self.plan.seed, config.index as u64);
        debug!(experiment = config.experiment_id, seed = rng.seed(), "subject stream seeded");
        let stream = self
            .plan
            .generator
            .generate(&config.template, config.subject_count, &mut rng)?;
        let mut arms = Algorithm::ALL
            .iter()
            .map(|&algorithm| -> Result<TrialArm, TrialError> {
                Ok(TrialArm::new(config.instance_id(algorithm), config.protocol(algorithm)?))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let options = DriverOptions {
            placement_interval: config.placement_interval,
            immediate_assignment: false,
            teardown: self.plan.teardown,
        };
        TrialDriver::new(service, options).run_paired(&mut arms, &stream)
    }

    fn fail_configuration(&mut self, config: &ExperimentConfiguration, error: TrialError) {
        warn!(
            experiment = config.experiment_id,
            family = error.family(),
            fatal = error.is_config_fatal(),
            error = %error,
            "configuration aborted"
        );
        self.table.fail(FailureRecord {
            experiment_id: config.experiment_id,
            algorithm: None,
            covariate_name: None,
            error,
        });
    }

    /// Runs every configuration and assembles the report.
    pub fn run<S: AllocationService + ?Sized>(mut self, service: &mut S) -> Result<SweepReport, TrialError> {
        let plan_hash = self.plan.plan_hash()?;
        let configurations = self.plan.configurations()?;
        let mut completed = 0;
        for config in &configurations {
            if self.run_configuration(config, service)? {
                completed += 1;
            }
        }
        info!(
            plan = %self.plan.name,
            configurations = configurations.len(),
            completed,
            rows = self.table.rows.len(),
            failures = self.table.failures.len(),
            "sweep finished"
        );
        Ok(SweepReport {
            plan_name: self.plan.name.clone(),
            plan_hash,
            configurations: configurations.len(),
            completed,
            rows: self.table.rows,
            failures: self.table.failures,
        })
    }
}

/// Runs a full sweep, appending rows to `registry` when given.
pub fn run_sweep<S: AllocationService + ?Sized>(
    plan: &ExperimentPlan,
    service: &mut S,
    registry: Option<Registry>,
) -> Result<SweepReport, TrialError> {
    let table = registry.map_or_else(ResultTable::new, ResultTable::with_registry);
    Orchestrator::new(plan, table).run(service)
}
