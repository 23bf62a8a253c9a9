//! Query-engine client protocol against a mock statement endpoint.

use std::sync::{Arc, Mutex};

use axum::Router;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Json;
use icestack::error::QueryError;
use icestack::query::{QueryConnector, TrinoConnector};
use serde_json::{Value, json};

#[derive(Clone, Default)]
struct Mock {
    base: Arc<Mutex<String>>,
    seen: Arc<Mutex<Vec<(String, Option<String>, Option<String>, String)>>>,
    busy_once: Arc<Mutex<bool>>,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

async fn submit(State(mock): State<Mock>, headers: HeaderMap, body: String) -> impl IntoResponse {
    {
        let mut busy = mock.busy_once.lock().unwrap();
        if *busy {
            *busy = false;
            return (StatusCode::SERVICE_UNAVAILABLE, HeaderMap::new(), Json(json!({})));
        }
    }

    mock.seen.lock().unwrap().push((
        header(&headers, "X-Trino-User").unwrap_or_default(),
        header(&headers, "X-Trino-Catalog"),
        header(&headers, "X-Trino-Schema"),
        body.clone(),
    ));
    let base = mock.base.lock().unwrap().clone();

    let mut response_headers = HeaderMap::new();
    let page = if body.starts_with("USE ") {
        response_headers.insert("X-Trino-Set-Schema", "shop".parse().unwrap());
        json!({"id": "q-use", "updateType": "USE"})
    } else if body.contains("missing_table") {
        json!({
            "id": "q-err",
            "error": {"message": "Table 'iceberg.shop.missing_table' does not exist", "errorName": "TABLE_NOT_FOUND", "errorCode": 46}
        })
    } else {
        json!({"id": "q1", "nextUri": format!("{base}/v1/statement/executing/q1/1")})
    };
    (StatusCode::OK, response_headers, Json(page))
}

async fn next_page(State(mock): State<Mock>, Path(token): Path<u32>) -> Json<Value> {
    let base = mock.base.lock().unwrap().clone();
    match token {
        1 => Json(json!({
            "id": "q1",
            "nextUri": format!("{base}/v1/statement/executing/q1/2"),
            "columns": [{"name": "_col0", "type": "bigint"}],
            "data": [[3]]
        })),
        _ => Json(json!({"id": "q1", "data": [[4]]})),
    }
}

async fn serve(mock: Mock) -> String {
    let app = Router::new()
        .route("/v1/statement", post(submit))
        .route("/v1/statement/executing/q1/{token}", get(next_page))
        .with_state(mock.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let base = format!("http://{}", listener.local_addr().unwrap());
    *mock.base.lock().unwrap() = base.clone();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    base
}

#[tokio::test]
async fn test_follows_next_uri_and_collects_rows() {
    let mock = Mock::default();
    let endpoint = serve(mock.clone()).await;
    let mut connection = TrinoConnector::new("tester")
        .connect(&endpoint, "iceberg", None)
        .await
        .unwrap();

    let result = connection.execute("SELECT count(*) FROM t").await.unwrap();

    assert_eq!(result.columns.len(), 1);
    assert_eq!(result.columns[0].type_name, "bigint");
    assert_eq!(result.rows.len(), 2);
    assert_eq!(result.scalar_i64(), Some(3));

    let seen = mock.seen.lock().unwrap();
    assert_eq!(seen[0].0, "tester");
    assert_eq!(seen[0].1.as_deref(), Some("iceberg"));
    assert_eq!(seen[0].2, None);
    assert_eq!(seen[0].3, "SELECT count(*) FROM t");
}

#[tokio::test]
async fn test_server_error_surfaces_error_name() {
    let mock = Mock::default();
    let endpoint = serve(mock).await;
    let mut connection = TrinoConnector::new("tester")
        .connect(&endpoint, "iceberg", None)
        .await
        .unwrap();

    let err = connection
        .execute("SELECT * FROM missing_table")
        .await
        .unwrap_err();
    match err {
        QueryError::Server { error_name, message } => {
            assert_eq!(error_name, "TABLE_NOT_FOUND");
            assert!(message.contains("missing_table"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_set_schema_applies_to_later_statements() {
    let mock = Mock::default();
    let endpoint = serve(mock.clone()).await;
    let mut connection = TrinoConnector::new("tester")
        .connect(&endpoint, "iceberg", None)
        .await
        .unwrap();

    connection.execute("USE iceberg.shop").await.unwrap();
    connection.execute("SELECT 1").await.unwrap();

    let seen = mock.seen.lock().unwrap();
    assert_eq!(seen[0].2, None);
    assert_eq!(seen[1].2.as_deref(), Some("shop"));
}

#[tokio::test]
async fn test_busy_engine_is_retried() {
    let mock = Mock::default();
    *mock.busy_once.lock().unwrap() = true;
    let endpoint = serve(mock.clone()).await;
    let mut connection = TrinoConnector::new("tester")
        .connect(&endpoint, "iceberg", None)
        .await
        .unwrap();

    let result = connection.execute("SELECT 1").await.unwrap();
    assert_eq!(result.scalar_i64(), Some(3));
    assert_eq!(mock.seen.lock().unwrap().len(), 1);
}
