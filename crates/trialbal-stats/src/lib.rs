#![deny(missing_docs)]
#![doc = "Similarity, diversity and covariate balance statistics for allocation experiments."]

/// Per-covariate hypothesis tests of group balance.
pub mod balance;
/// Similarity-sensitive diversity of a group partition.
pub mod diversity;
/// Pairwise subject similarity.
pub mod similarity;

pub use balance::{
    balance_test, balance_test_with, chi_squared_independence, one_way_anova, select_test,
    test_samples, two_sample_t, BalanceOptions, BalanceOutcome, BalanceTest, ContingencyTable,
};
pub use diversity::{normalized_rho, power_mean, Measure, Metacommunity};
pub use similarity::SimilarityModel;
