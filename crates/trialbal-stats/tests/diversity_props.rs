use indexmap::IndexMap;
use proptest::prelude::*;
use trialbal_core::{CovariateSpec, FeatureValue, Group, Subject, TrialError};
use trialbal_stats::{normalized_rho, Measure, Metacommunity, SimilarityModel};

fn scored(name: &str, scores: &[f64]) -> Group {
    let subjects = scores
        .iter()
        .enumerate()
        .map(|(idx, score)| {
            let mut features = IndexMap::new();
            features.insert("score".to_string(), FeatureValue::Continuous(*score));
            Subject::new(format!("{name}-{idx}"), features)
        })
        .collect();
    Group {
        name: name.to_string(),
        subjects,
    }
}

fn score_spec() -> Vec<CovariateSpec> {
    vec![CovariateSpec::continuous("score")]
}

#[test]
fn identical_compositions_reach_one() {
    let groups = vec![scored("W", &[10.0, 90.0]), scored("X", &[10.0, 90.0])];
    let value = normalized_rho(&groups, &score_spec(), 0.0).unwrap();
    assert!((value - 1.0).abs() < 1e-12, "got {value}");
}

#[test]
fn mixed_groups_match_reference() {
    let groups = vec![scored("W", &[10.0, 90.0]), scored("X", &[12.0, 88.0])];
    let value = normalized_rho(&groups, &score_spec(), 0.0).unwrap();
    assert!((value - 0.963_126_473_710_852).abs() < 1e-9, "got {value}");
}

#[test]
fn separated_groups_are_less_redundant() {
    let separated = vec![scored("W", &[10.0, 12.0]), scored("X", &[88.0, 90.0])];
    let mixed = vec![scored("W", &[10.0, 90.0]), scored("X", &[12.0, 88.0])];
    let low = normalized_rho(&separated, &score_spec(), 0.0).unwrap();
    let high = normalized_rho(&mixed, &score_spec(), 0.0).unwrap();
    assert!((low - 0.522_998_014_478_472_8).abs() < 1e-9, "got {low}");
    assert!(low < high);
}

#[test]
fn viewpoint_one_uses_geometric_mean() {
    let separated = vec![scored("W", &[10.0, 12.0]), scored("X", &[88.0, 90.0])];
    let q1 = normalized_rho(&separated, &score_spec(), 1.0).unwrap();
    let q2 = normalized_rho(&separated, &score_spec(), 2.0).unwrap();
    assert!((q1 - 0.522_997_206_298_853_9).abs() < 1e-9, "got {q1}");
    assert!((q2 - 0.522_996_398_120_483_9).abs() < 1e-9, "got {q2}");
}

#[test]
fn empty_groups_are_ignored() {
    let with_empty = vec![
        scored("W", &[10.0, 90.0]),
        scored("X", &[12.0, 88.0]),
        scored("Y", &[]),
    ];
    let without = vec![scored("W", &[10.0, 90.0]), scored("X", &[12.0, 88.0])];
    let a = normalized_rho(&with_empty, &score_spec(), 0.0).unwrap();
    let b = normalized_rho(&without, &score_spec(), 0.0).unwrap();
    assert!((a - b).abs() < 1e-12);
}

#[test]
fn duplicate_membership_is_an_invariant_error() {
    let mut groups = vec![scored("W", &[10.0, 90.0]), scored("X", &[12.0])];
    groups[1].subjects[0].id = "W-0".to_string();
    assert!(matches!(
        normalized_rho(&groups, &score_spec(), 0.0),
        Err(TrialError::AssignmentInvariant(_))
    ));
}

#[test]
fn empty_covariate_set_is_rejected() {
    let groups = vec![scored("W", &[10.0]), scored("X", &[12.0])];
    assert!(matches!(
        normalized_rho(&groups, &[], 0.0),
        Err(TrialError::InsufficientData(_))
    ));
}

#[test]
fn negative_viewpoint_is_invalid() {
    let groups = vec![scored("W", &[10.0]), scored("X", &[12.0])];
    assert!(matches!(
        normalized_rho(&groups, &score_spec(), -1.0),
        Err(TrialError::InvalidData(_))
    ));
}

#[test]
fn gamma_of_distinct_singletons_counts_subjects() {
    // identity similarity: each subject distinct, so gamma diversity is the subject count
    let groups = vec![scored("W", &[0.0, 1e6]), scored("X", &[2e6, 3e6])];
    let model = SimilarityModel::new(&score_spec()).unwrap();
    let meta = Metacommunity::from_groups(&groups, &model).unwrap();
    let gamma = meta.metacommunity_diversity(1.0, Measure::Gamma).unwrap();
    assert!((gamma - 4.0).abs() < 1e-9, "got {gamma}");
    assert_eq!(meta.group_names(), ["W".to_string(), "X".to_string()]);
}

proptest! {
    #[test]
    fn rho_is_bounded_and_label_invariant(
        w in prop::collection::vec(0.0f64..100.0, 1..6),
        x in prop::collection::vec(0.0f64..100.0, 1..6),
        q in prop_oneof![Just(0.0f64), Just(1.0), Just(2.0)],
    ) {
        let groups = vec![scored("W", &w), scored("X", &x)];
        let value = normalized_rho(&groups, &score_spec(), q).unwrap();
        prop_assert!(value > 0.0 && value <= 1.0);

        let relabelled = vec![scored("Q", &x), scored("P", &w)];
        let swapped = normalized_rho(&relabelled, &score_spec(), q).unwrap();
        prop_assert!((value - swapped).abs() < 1e-9);

        let mut shuffled_w = w.clone();
        shuffled_w.reverse();
        let reordered = vec![scored("W", &shuffled_w), scored("X", &x)];
        let again = normalized_rho(&reordered, &score_spec(), q).unwrap();
        prop_assert!((value - again).abs() < 1e-9);
    }
}
