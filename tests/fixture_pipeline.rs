//! Fixture discovery and execution order, standalone and during stack start.

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use icestack::StackConfig;
use icestack::error::{ScriptError, StackError};
use icestack::fixtures::{ScriptPipeline, discover};
use icestack::query::QueryConnector;
use icestack::stack::services::QUERY_ENGINE_READY_LINE;
use icestack::stack::{LifecycleState, Stage, StackController};
use icestack::testing::{FakeRuntime, RecordingConnector};
use pretty_assertions::assert_eq;
use tokio_util::sync::CancellationToken;

fn write(root: &Path, relative: &str, content: &str) {
    let path = root.join(relative);
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    fs::write(path, content).unwrap();
}

fn fixture_root() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    // Written out of order on purpose.
    write(
        dir.path(),
        "insert/002_more_orders.sql",
        "INSERT INTO iceberg.shop.orders VALUES (3, 30.0);",
    );
    write(
        dir.path(),
        "insert/001_orders.sql",
        "-- seed rows\nINSERT INTO iceberg.shop.orders VALUES (1, 10.0);\n\
         INSERT INTO iceberg.shop.orders VALUES (2, 20.0); -- second\n",
    );
    write(
        dir.path(),
        "create/002_tables.sql",
        "CREATE TABLE IF NOT EXISTS iceberg.shop.orders (\n  id BIGINT,\n  amount DOUBLE\n);\n",
    );
    write(
        dir.path(),
        "create/001_schema.sql",
        "CREATE SCHEMA IF NOT EXISTS iceberg.shop",
    );
    write(dir.path(), "create/README.md", "not a fixture");
    dir
}

#[test]
fn test_discovery_orders_create_before_insert() {
    let dir = fixture_root();
    let files: Vec<_> = discover(dir.path())
        .unwrap()
        .into_iter()
        .map(|s| s.path.strip_prefix(dir.path()).unwrap().to_path_buf())
        .collect();

    let expected: Vec<std::path::PathBuf> = [
        "create/001_schema.sql",
        "create/002_tables.sql",
        "insert/001_orders.sql",
        "insert/002_more_orders.sql",
    ]
    .into_iter()
    .map(std::path::PathBuf::from)
    .collect();
    assert_eq!(files, expected);
}

#[tokio::test]
async fn test_pipeline_executes_every_statement_in_order() {
    let dir = fixture_root();
    let connector = RecordingConnector::new();
    let mut connection = connector
        .connect("http://127.0.0.1:8080", "iceberg", None)
        .await
        .unwrap();

    let report = ScriptPipeline::new(dir.path())
        .run(connection.as_mut(), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(report.files, 4);
    assert_eq!(report.statements, 5);
    assert_eq!(
        connector.statements(),
        vec![
            "CREATE SCHEMA IF NOT EXISTS iceberg.shop",
            "CREATE TABLE IF NOT EXISTS iceberg.shop.orders ( id BIGINT, amount DOUBLE )",
            "INSERT INTO iceberg.shop.orders VALUES (1, 10.0)",
            "INSERT INTO iceberg.shop.orders VALUES (2, 20.0)",
            "INSERT INTO iceberg.shop.orders VALUES (3, 30.0)",
        ]
    );
}

#[tokio::test]
async fn test_missing_folders_mean_no_fixtures() {
    let dir = tempfile::tempdir().unwrap();
    let connector = RecordingConnector::new();
    let mut connection = connector
        .connect("http://127.0.0.1:8080", "iceberg", None)
        .await
        .unwrap();

    let report = ScriptPipeline::new(dir.path())
        .run(connection.as_mut(), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(report.statements, 0);
    assert!(connector.statements().is_empty());
}

fn stack_with_fixtures(
    root: &Path,
    connector: &RecordingConnector,
) -> (Arc<FakeRuntime>, StackController) {
    let runtime = Arc::new(FakeRuntime::new());
    runtime.set_logs("query-engine", &[QUERY_ENGINE_READY_LINE]);
    let config = StackConfig {
        fixtures_dir: Some(root.to_path_buf()),
        poll_interval: Duration::from_millis(10),
        ..Default::default()
    };
    let stack = StackController::builder(config, runtime.clone())
        .connector(Arc::new(connector.clone()))
        .build();
    (runtime, stack)
}

#[tokio::test]
async fn test_stack_start_loads_fixtures_on_one_connection() {
    let dir = fixture_root();
    let connector = RecordingConnector::new();
    let (_runtime, stack) = stack_with_fixtures(dir.path(), &connector);

    stack.start(&CancellationToken::new()).await.unwrap();

    assert_eq!(stack.state().await, LifecycleState::FixturesLoaded);
    let connections = connector.connections();
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].1, "iceberg");
    assert_eq!(connections[0].2, None);

    let statements = connector.statements();
    let last_create = statements
        .iter()
        .rposition(|s| s.starts_with("CREATE"))
        .unwrap();
    let first_insert = statements
        .iter()
        .position(|s| s.starts_with("INSERT"))
        .unwrap();
    assert!(last_create < first_insert);

    stack.dispose().await;
}

#[tokio::test]
async fn test_statement_failure_fails_fixture_stage() {
    let dir = fixture_root();
    let connector = RecordingConnector::new();
    connector.fail_on("VALUES (2, 20.0)", "TABLE_NOT_FOUND");
    let (runtime, stack) = stack_with_fixtures(dir.path(), &connector);

    let err = stack.start(&CancellationToken::new()).await.unwrap_err();
    assert_eq!(err.stage(), Some(Stage::Fixtures));
    assert_eq!(stack.state().await, LifecycleState::ServiceReady);

    match err {
        StackError::Fixtures {
            source: ScriptError::Statement {
                file, statement, ..
            },
            ..
        } => {
            assert!(file.ends_with("insert/001_orders.sql"));
            assert_eq!(statement, "INSERT INTO iceberg.shop.orders VALUES (2, 20.0)");
        }
        other => panic!("unexpected error: {other}"),
    }
    // The third insert never ran.
    assert!(!connector.statements().iter().any(|s| s.contains("(3, 30.0)")));

    stack.dispose().await;
    assert!(runtime.containers().is_empty());
}
