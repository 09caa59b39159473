#![deny(missing_docs)]
#![doc = "Core types, error taxonomy and seeding policy shared by the trialbal crates."]

pub mod errors;
pub mod protocol;
pub mod rng;
pub mod subject;

pub use errors::{ErrorInfo, TrialError};
pub use protocol::{
    Algorithm, CovariateKind, CovariateSpec, ProtocolConfig, DEFAULT_SIMILARITY_SCALE,
};
pub use rng::{derive_substream_seed, RngHandle};
pub use subject::{group_size_spread, FeatureValue, Features, Group, GroupMembership, Subject};
