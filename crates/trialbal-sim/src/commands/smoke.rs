use std::error::Error;

use clap::{Args, ValueEnum};
use trialbal_core::{Algorithm, CovariateSpec, ProtocolConfig, RngHandle};
use trialbal_exp::{resolve_groups, FeatureGenerator};
use trialbal_stats::balance_test;

use super::connect;

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum AlgorithmArg {
    Balanced,
    Alternating,
}

impl From<AlgorithmArg> for Algorithm {
    fn from(arg: AlgorithmArg) -> Self {
        match arg {
            AlgorithmArg::Balanced => Algorithm::Balanced,
            AlgorithmArg::Alternating => Algorithm::Alternating,
        }
    }
}

#[derive(Args, Debug)]
pub struct SmokeArgs {
    /// Base URL of an allocation server; in-process when omitted.
    #[arg(long)]
    pub server: Option<String>,
    #[arg(long, value_enum, default_value_t = AlgorithmArg::Balanced)]
    pub algorithm: AlgorithmArg,
    #[arg(long, default_value_t = 12)]
    pub subjects: usize,
    #[arg(long, default_value_t = 2008)]
    pub seed: u64,
    #[arg(long, default_value = "smoke")]
    pub instance: String,
}

pub fn run(args: &SmokeArgs) -> Result<(), Box<dyn Error>> {
    let covariates = vec![
        CovariateSpec::continuous("score"),
        CovariateSpec::categorical("mouse", ["micky", "minnie"]),
    ];
    let config = ProtocolConfig::new(["A", "B"], covariates.clone(), false, args.algorithm.into())?;
    let mut rng = RngHandle::from_seed(args.seed);
    let stream = FeatureGenerator::default().generate(&covariates, args.subjects, &mut rng)?;

    let mut service = connect(args.server.as_deref())?;
    let instance = args.instance.as_str();
    service.start(instance, &config)?;
    let result = (|| -> Result<(), Box<dyn Error>> {
        for subject in stream.subjects() {
            service.submit(instance, &subject.id, &subject.project(&config)?)?;
        }
        service.assign_all(instance)?;
        let groups = resolve_groups(&service.get_groups(instance)?, &stream, instance)?;
        for group in &groups {
            let ids: Vec<&str> = group.subjects.iter().map(|subject| subject.id.as_str()).collect();
            println!("{}: {}", group.name, ids.join(" "));
        }
        for spec in &covariates {
            match balance_test(spec, &groups) {
                Ok(outcome) => println!("{} p={:.4}", spec.name, outcome.pvalue),
                Err(err) => println!("{} skipped: {err}", spec.name),
            }
        }
        Ok(())
    })();
    service.stop(instance)?;
    result
}
