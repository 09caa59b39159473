use std::error::Error;
use std::path::PathBuf;

use clap::Args;
use trialbal_exp::{write_plan, ExperimentPlan};

#[derive(Args, Debug)]
pub struct PlanArgs {
    #[arg(long)]
    pub out: PathBuf,
    #[arg(long, default_value = "regression")]
    pub name: String,
}

pub fn run(args: &PlanArgs) -> Result<(), Box<dyn Error>> {
    let plan = ExperimentPlan::with_defaults(args.name.clone());
    write_plan(&args.out, &plan)?;
    println!("{} configurations, plan hash {}", plan.configurations()?.len(), plan.plan_hash()?);
    Ok(())
}
