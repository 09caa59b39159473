//! Paired allocation trials, sweep orchestration and result registries.

mod allocator;
mod codec;
mod driver;
mod generator;
mod http;
mod local;
mod orchestrator;
mod plan;
mod registry;
mod results;
mod service;

pub use codec::{stable_hash_string, to_canonical_json_bytes, write_canonical_json};
pub use driver::{resolve_groups, DriverOptions, TrialArm, TrialDriver, TrialOutcome, TrialState};
pub use generator::{subject_id, FeatureGenerator, SubjectStream};
pub use http::HttpAllocationService;
pub use local::LocalAllocationService;
pub use orchestrator::{check_group_sizes, evaluate, run_sweep, Orchestrator, ResultTable};
pub use plan::{load_plan, write_plan, ExperimentConfiguration, ExperimentPlan, Mix};
pub use registry::{registry_append, registry_query, Query, Registry, Table};
pub use results::{FailureRecord, ResultRow, SweepReport};
pub use service::AllocationService;
