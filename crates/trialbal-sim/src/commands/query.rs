use std::error::Error;
use std::path::PathBuf;

use clap::Args;
use trialbal_exp::{registry_query, Query, Registry};

#[derive(Args, Debug)]
pub struct QueryArgs {
    #[arg(long)]
    pub registry: PathBuf,
    #[arg(long)]
    pub algorithm: Option<String>,
    #[arg(long)]
    pub limit: Option<usize>,
}

pub fn run(args: &QueryArgs) -> Result<(), Box<dyn Error>> {
    let registry = Registry::from_path(&args.registry);
    let query = Query {
        algorithm: args.algorithm.clone(),
        limit: args.limit,
    };
    let table = registry_query(&registry, &query)?;
    println!("{}", table.columns.join("\t"));
    for row in &table.rows {
        println!("{}", row.join("\t"));
    }
    Ok(())
}
