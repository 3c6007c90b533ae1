//! End-to-end: execute against a SQLite statistics snapshot, archive, compare.

use dmvsentry::config::Config;
use dmvsentry::error::SentryError;
use dmvsentry::report::ReportComparator;
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use tokio_test::{assert_err, assert_ok};

const CATALOG: &str = r#"
[[query]]
id = "top-cpu"
title = "Highest average CPU"
target_dmv = "query_stats"
metric = "Avg CPU ms"
identity = "query_hash"
expected_columns = ["query_hash", "Avg CPU ms"]
sql = '''
SELECT query_hash, avg_cpu AS "Avg CPU ms"
FROM query_stats
ORDER BY avg_cpu DESC
'''

[[query]]
id = "broken"
target_dmv = "query_stats"
sql = "SELECT * FROM missing_table"
"#;

struct Fixture {
    _dir: tempfile::TempDir,
    snapshot: PathBuf,
    config: Config,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let snapshot = dir.path().join("snapshot.db");
    let catalog = dir.path().join("catalog.toml");
    std::fs::write(&catalog, CATALOG).unwrap();

    Connection::open(&snapshot)
        .unwrap()
        .execute_batch(
            "CREATE TABLE query_stats (query_hash TEXT PRIMARY KEY, avg_cpu REAL NOT NULL);
             INSERT INTO query_stats VALUES ('0xAAAA', 100.0), ('0xBBBB', 100.0);",
        )
        .unwrap();

    let config = Config::from_toml(&format!(
        r#"
        [storage]
        path = "{}"
        [target]
        path = "{}"
        [catalog]
        path = "{}"
        "#,
        dir.path().join("results.db").display(),
        snapshot.display(),
        catalog.display()
    ))
    .unwrap();

    Fixture {
        _dir: dir,
        snapshot,
        config,
    }
}

fn set_cpu(snapshot: &Path, hash: &str, value: f64) {
    Connection::open(snapshot)
        .unwrap()
        .execute(
            "UPDATE query_stats SET avg_cpu = ?1 WHERE query_hash = ?2",
            rusqlite::params![value, hash],
        )
        .unwrap();
}

#[tokio::test]
async fn test_increase_beyond_threshold_is_flagged() {
    let fx = fixture();
    assert_ok!(dmvsentry::run_once(&fx.config, "top-cpu", None).await);

    set_cpu(&fx.snapshot, "0xAAAA", 140.0);
    set_cpu(&fx.snapshot, "0xBBBB", 110.0);
    assert_ok!(dmvsentry::run_once(&fx.config, "top-cpu", None).await);

    let catalog = dmvsentry::load_catalog(&fx.config).unwrap();
    let store = dmvsentry::open_store(&fx.config).unwrap();
    let report =
        dmvsentry::build_report(&catalog, &store, ReportComparator::new(0.2), "top-cpu", 1).unwrap();

    assert_eq!(report.regressions.len(), 2);
    let flagged: Vec<&str> = report.flagged().map(|r| r.identity.as_str()).collect();
    assert_eq!(flagged, vec!["0xAAAA"]);

    let a = &report.regressions[0];
    assert_eq!(a.baseline_value, 100.0);
    assert_eq!(a.current_value, 140.0);
    assert_eq!(a.delta, 40.0);
}

#[tokio::test]
async fn test_report_is_idempotent() {
    let fx = fixture();
    dmvsentry::run_once(&fx.config, "top-cpu", None).await.unwrap();
    set_cpu(&fx.snapshot, "0xAAAA", 250.0);
    dmvsentry::run_once(&fx.config, "top-cpu", None).await.unwrap();

    let catalog = dmvsentry::load_catalog(&fx.config).unwrap();
    let store = dmvsentry::open_store(&fx.config).unwrap();
    let first = dmvsentry::build_report(&catalog, &store, ReportComparator::default(), "top-cpu", 1).unwrap();
    let second = dmvsentry::build_report(&catalog, &store, ReportComparator::default(), "top-cpu", 1).unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn test_since_reaches_further_back() {
    let fx = fixture();
    dmvsentry::run_once(&fx.config, "top-cpu", None).await.unwrap();
    set_cpu(&fx.snapshot, "0xAAAA", 115.0);
    dmvsentry::run_once(&fx.config, "top-cpu", None).await.unwrap();
    set_cpu(&fx.snapshot, "0xAAAA", 130.0);
    dmvsentry::run_once(&fx.config, "top-cpu", None).await.unwrap();

    let catalog = dmvsentry::load_catalog(&fx.config).unwrap();
    let store = dmvsentry::open_store(&fx.config).unwrap();
    let comparator = ReportComparator::new(0.2);

    // 115 -> 130 is 13%; 100 -> 130 is 30%.
    let last_two = dmvsentry::build_report(&catalog, &store, comparator, "top-cpu", 1).unwrap();
    assert_eq!(last_two.flagged().count(), 0);
    let vs_first = dmvsentry::build_report(&catalog, &store, comparator, "top-cpu", 2).unwrap();
    assert_eq!(vs_first.flagged().count(), 1);
    // Fewer runs than asked for: compare against the oldest.
    let beyond = dmvsentry::build_report(&catalog, &store, comparator, "top-cpu", 10).unwrap();
    assert_eq!(beyond.baseline_at, vs_first.baseline_at);
}

#[tokio::test]
async fn test_since_beyond_any_history_uses_oldest_run() {
    let fx = fixture();
    dmvsentry::run_once(&fx.config, "top-cpu", None).await.unwrap();
    set_cpu(&fx.snapshot, "0xAAAA", 300.0);
    dmvsentry::run_once(&fx.config, "top-cpu", None).await.unwrap();

    let catalog = dmvsentry::load_catalog(&fx.config).unwrap();
    let store = dmvsentry::open_store(&fx.config).unwrap();
    let report =
        dmvsentry::build_report(&catalog, &store, ReportComparator::default(), "top-cpu", usize::MAX).unwrap();
    let oldest = store.recent("top-cpu", 2).unwrap()[1].timestamp();
    assert_eq!(report.baseline_at, Some(oldest));
    assert_eq!(report.flagged().count(), 1);
}

#[tokio::test]
async fn test_single_run_has_nothing_to_compare() {
    let fx = fixture();
    dmvsentry::run_once(&fx.config, "top-cpu", None).await.unwrap();

    let catalog = dmvsentry::load_catalog(&fx.config).unwrap();
    let store = dmvsentry::open_store(&fx.config).unwrap();
    let report = dmvsentry::build_report(&catalog, &store, ReportComparator::default(), "top-cpu", 1).unwrap();
    assert!(report.baseline_at.is_none());
    assert!(report.regressions.is_empty());
}

#[tokio::test]
async fn test_report_without_runs_is_not_found() {
    let fx = fixture();
    let catalog = dmvsentry::load_catalog(&fx.config).unwrap();
    let store = dmvsentry::open_store(&fx.config).unwrap();
    let err = dmvsentry::build_report(&catalog, &store, ReportComparator::default(), "top-cpu", 1).unwrap_err();
    assert!(matches!(err, SentryError::NoResults(_)));
}

#[tokio::test]
async fn test_database_error_is_reported_and_not_archived() {
    let fx = fixture();
    let err = assert_err!(dmvsentry::run_once(&fx.config, "broken", None).await);
    assert_eq!(err.exit_code(), 1);
    match err {
        SentryError::Execution { query_id, message } => {
            assert_eq!(query_id, "broken");
            assert!(message.contains("missing_table"));
        }
        other => panic!("unexpected error: {other:?}"),
    }

    let store = dmvsentry::open_store(&fx.config).unwrap();
    assert_eq!(store.count("broken").unwrap(), 0);
}

#[tokio::test]
async fn test_unknown_query_is_catalog_error() {
    let fx = fixture();
    let err = dmvsentry::run_once(&fx.config, "top-io", None).await.unwrap_err();
    assert!(matches!(err, SentryError::QueryNotFound(_)));
    assert_eq!(err.exit_code(), 2);
}
