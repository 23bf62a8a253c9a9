//! Client side of the query engine's HTTP statement protocol.
//!
//! A statement is submitted with `POST /v1/statement`; the engine answers
//! with a page that may carry columns, rows, an error, and a `nextUri` to
//! follow until the query finishes.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use url::Url;

use crate::error::QueryError;
use crate::query::{Column, QueryConnection, QueryConnector, QueryResult};

/// Retries for a 503 (engine busy or still starting).
const MAX_BUSY_RETRIES: u32 = 5;
const BUSY_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResults {
    id: String,
    next_uri: Option<String>,
    columns: Option<Vec<Column>>,
    data: Option<Vec<Vec<serde_json::Value>>>,
    error: Option<QueryFailure>,
    update_type: Option<String>,
    update_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryFailure {
    message: String,
    error_name: Option<String>,
}

/// Opens [`TrinoConnection`]s.
#[derive(Debug, Clone)]
pub struct TrinoConnector {
    client: reqwest::Client,
    user: String,
}

impl TrinoConnector {
    pub fn new(user: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            user: user.into(),
        }
    }
}

#[async_trait]
impl QueryConnector for TrinoConnector {
    async fn connect(
        &self,
        endpoint: &str,
        catalog: &str,
        schema: Option<&str>,
    ) -> Result<Box<dyn QueryConnection>, QueryError> {
        let connection = TrinoConnection::new(
            self.client.clone(),
            endpoint,
            &self.user,
            catalog,
            schema,
        )?;
        Ok(Box::new(connection))
    }
}

/// One query-engine session over HTTP.
#[derive(Debug)]
pub struct TrinoConnection {
    client: reqwest::Client,
    base: Url,
    user: String,
    catalog: String,
    schema: Option<String>,
}

impl TrinoConnection {
    pub fn new(
        client: reqwest::Client,
        endpoint: &str,
        user: &str,
        catalog: &str,
        schema: Option<&str>,
    ) -> Result<Self, QueryError> {
        let base = Url::parse(endpoint)
            .map_err(|e| QueryError::Protocol(format!("invalid endpoint '{endpoint}': {e}")))?;
        Ok(Self {
            client,
            base,
            user: user.to_string(),
            catalog: catalog.to_string(),
            schema: schema.map(str::to_string),
        })
    }

    pub fn catalog(&self) -> &str {
        &self.catalog
    }

    /// Session schema, if one was given or set by a `USE` statement.
    pub fn schema(&self) -> Option<&str> {
        self.schema.as_deref()
    }

    fn with_session_headers(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request
            .header("X-Trino-User", &self.user)
            .header("X-Trino-Source", "icestack")
            .header("X-Trino-Catalog", &self.catalog);
        match &self.schema {
            Some(schema) => request.header("X-Trino-Schema", schema),
            None => request,
        }
    }

    /// Send a request built by `build`, retrying while the engine answers 503.
    async fn send<F>(&mut self, build: F) -> Result<QueryResults, QueryError>
    where
        F: Fn(&Self) -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            let response = build(&*self).send().await?;
            let status = response.status();

            if status == reqwest::StatusCode::SERVICE_UNAVAILABLE && attempt < MAX_BUSY_RETRIES {
                attempt += 1;
                tracing::debug!(attempt, "Query engine busy, retrying");
                tokio::time::sleep(BUSY_BACKOFF * attempt).await;
                continue;
            }

            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                return Err(QueryError::Transport(format!("HTTP {status}: {body}")));
            }

            if let Some(schema) = response
                .headers()
                .get("X-Trino-Set-Schema")
                .and_then(|v| v.to_str().ok())
            {
                self.schema = Some(schema.to_string());
            }

            return response
                .json::<QueryResults>()
                .await
                .map_err(|e| QueryError::Protocol(e.to_string()));
        }
    }
}

#[async_trait]
impl QueryConnection for TrinoConnection {
    async fn execute(&mut self, sql: &str) -> Result<QueryResult, QueryError> {
        let submit = self
            .base
            .join("v1/statement")
            .map_err(|e| QueryError::Protocol(e.to_string()))?;
        let body = sql.to_string();

        let mut page = self
            .send(|conn| {
                conn.with_session_headers(conn.client.post(submit.clone()))
                    .body(body.clone())
            })
            .await?;
        tracing::debug!(query_id = %page.id, "Submitted statement");

        let mut result = QueryResult::default();
        loop {
            if let Some(error) = page.error {
                return Err(QueryError::Server {
                    error_name: error.error_name.unwrap_or_else(|| "UNKNOWN".to_string()),
                    message: error.message,
                });
            }
            if result.columns.is_empty()
                && let Some(columns) = page.columns.take()
            {
                result.columns = columns;
            }
            if let Some(rows) = page.data.take() {
                result.rows.extend(rows);
            }
            if page.update_type.is_some() {
                result.update_type = page.update_type.take();
            }
            if page.update_count.is_some() {
                result.update_count = page.update_count;
            }

            let Some(next) = page.next_uri.take() else {
                break;
            };
            let next = Url::parse(&next).map_err(|e| QueryError::Protocol(e.to_string()))?;
            page = self
                .send(|conn| conn.with_session_headers(conn.client.get(next.clone())))
                .await?;
        }

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_deserialization() {
        let page: QueryResults = serde_json::from_str(
            r#"{
                "id": "20240101_000000_00001_abcde",
                "nextUri": "http://127.0.0.1:8080/v1/statement/executing/x/1",
                "columns": [{"name": "_col0", "type": "bigint", "typeSignature": {}}],
                "data": [[3]],
                "stats": {"state": "RUNNING"}
            }"#,
        )
        .unwrap();

        assert_eq!(page.columns.unwrap()[0].type_name, "bigint");
        assert_eq!(page.data.unwrap()[0][0], serde_json::json!(3));
        assert!(page.next_uri.is_some());
        assert!(page.error.is_none());
    }

    #[test]
    fn test_failure_deserialization() {
        let page: QueryResults = serde_json::from_str(
            r#"{
                "id": "q",
                "error": {"message": "Table 'iceberg.s.t' does not exist", "errorName": "TABLE_NOT_FOUND", "errorCode": 46}
            }"#,
        )
        .unwrap();
        let error = page.error.unwrap();
        assert_eq!(error.error_name.as_deref(), Some("TABLE_NOT_FOUND"));
    }

    #[test]
    fn test_invalid_endpoint_rejected() {
        let result = TrinoConnection::new(reqwest::Client::new(), "not a url", "u", "iceberg", None);
        assert!(matches!(result, Err(QueryError::Protocol(_))));
    }
}
