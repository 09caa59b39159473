use std::error::Error;
use std::path::{Path, PathBuf};

use clap::Args;
use tracing::info;
use trialbal_exp::{load_plan, run_sweep, write_canonical_json, ExperimentPlan, Registry};

use super::connect;

#[derive(Args, Debug)]
pub struct SweepArgs {
    /// YAML plan; the default regression plan when omitted.
    #[arg(long)]
    pub plan: Option<PathBuf>,
    /// Result table; `.sqlite` or `.db` selects SQLite, anything else CSV.
    #[arg(long)]
    pub out: PathBuf,
    /// Overrides the plan's master seed.
    #[arg(long)]
    pub seed: Option<u64>,
    /// Base URL of an allocation server.
    #[arg(long)]
    pub server: Option<String>,
}

pub fn run(args: &SweepArgs) -> Result<(), Box<dyn Error>> {
    let mut plan = match &args.plan {
        Some(path) => load_plan(path)?,
        None => ExperimentPlan::with_defaults("regression"),
    };
    if let Some(seed) = args.seed {
        plan.seed = seed;
    }
    let mut service = connect(args.server.as_deref())?;
    let registry = Registry::from_path(&args.out);
    let report = run_sweep(&plan, &mut service, Some(registry))?;
    let report_path = report_path(&args.out);
    write_canonical_json(&report_path, &report)?;
    info!(
        rows = report.rows.len(),
        failures = report.failures.len(),
        report = %report_path.display(),
        "sweep written"
    );
    println!(
        "{} of {} configurations completed, {} rows, {} failures",
        report.completed,
        report.configurations,
        report.rows.len(),
        report.failures.len()
    );
    Ok(())
}

/// `results.csv` reports to `results.report.json`.
pub fn report_path(out: &Path) -> PathBuf {
    out.with_extension("report.json")
}
