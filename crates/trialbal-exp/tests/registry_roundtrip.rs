use trialbal_core::Algorithm;
use trialbal_exp::{registry_append, registry_query, Query, Registry, ResultRow};

fn row(algorithm: Algorithm, covariate: &str, pvalue: f64) -> ResultRow {
    ResultRow {
        algorithm,
        n_subjects: 10,
        n_groups: 2,
        n_covariates: 1,
        placement_interval: 3,
        experiment_id: 4,
        covariate_name: covariate.to_string(),
        is_used: covariate == "score",
        pvalue,
        diversity_all: 0.75,
        diversity_used: 0.5,
    }
}

fn sample_rows() -> Vec<ResultRow> {
    vec![
        row(Algorithm::Alternating, "score", 0.25),
        row(Algorithm::Balanced, "score", 0.5),
        row(Algorithm::Alternating, "age", 0.125),
    ]
}

fn exercise(registry: Registry) {
    assert!(registry_query(&registry, &Query::default()).unwrap().rows.is_empty());

    registry_append(&registry, &sample_rows()[..2]).unwrap();
    registry_append(&registry, &sample_rows()[2..]).unwrap();

    let all = registry_query(&registry, &Query::default()).unwrap();
    assert_eq!(all.columns.len(), 11);
    assert_eq!(all.columns[8], "pvalue");
    assert_eq!(all.rows.len(), 3);
    assert_eq!(all.rows[0], sample_rows()[0].to_record());
    assert_eq!(
        all.rows[0],
        vec!["Alternating", "10", "2", "1", "3", "4", "score", "true", "0.25", "0.75", "0.5"]
    );

    let alternating = registry_query(
        &registry,
        &Query {
            algorithm: Some("Alternating".to_string()),
            limit: None,
        },
    )
    .unwrap();
    assert_eq!(alternating.rows.len(), 2);
    assert_eq!(alternating.rows[1][6], "age");

    let limited = registry_query(
        &registry,
        &Query {
            algorithm: None,
            limit: Some(1),
        },
    )
    .unwrap();
    assert_eq!(limited.rows.len(), 1);
}

#[test]
fn csv_registry_appends_and_filters() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::from_path(dir.path().join("out").join("results.csv"));
    assert!(matches!(registry, Registry::Csv(_)));
    exercise(registry);
}

#[test]
fn sqlite_registry_appends_and_filters() {
    let dir = tempfile::tempdir().unwrap();
    let registry = Registry::from_path(dir.path().join("results.sqlite"));
    assert!(matches!(registry, Registry::Sqlite(_)));
    exercise(registry);
}

#[test]
fn empty_csv_file_gets_a_header() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("results.csv");
    std::fs::write(&path, "").unwrap();
    let registry = Registry::from_path(&path);
    assert!(registry_query(&registry, &Query::default()).unwrap().rows.is_empty());

    registry_append(&registry, &sample_rows()).unwrap();
    let table = registry_query(&registry, &Query::default()).unwrap();
    assert_eq!(table.rows.len(), 3);
    assert_eq!(table.rows[0], sample_rows()[0].to_record());
    assert!(std::fs::read_to_string(&path).unwrap().starts_with("algorithm,n_subjects,"));
}
