//! Query-engine connections.
//!
//! The fixture pipeline and test code talk to the query engine only through
//! [`QueryConnection`]. `execute` takes `&mut self`: one connection serves one
//! caller at a time, and callers that need concurrent queries open more
//! connections through a [`QueryConnector`].

mod trino;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::QueryError;

pub use trino::{TrinoConnection, TrinoConnector};

/// Column metadata of a result set.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Column {
    pub name: String,
    #[serde(rename = "type")]
    pub type_name: String,
}

/// Fully materialized result of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<serde_json::Value>>,
    /// Statement kind reported for DDL/DML (e.g. `CREATE TABLE`, `INSERT`).
    pub update_type: Option<String>,
    /// Affected row count reported for DML.
    pub update_count: Option<i64>,
}

impl QueryResult {
    /// First column of the first row as an integer, if it is one.
    pub fn scalar_i64(&self) -> Option<i64> {
        match self.rows.first()?.first()? {
            serde_json::Value::Number(n) => n.as_i64(),
            serde_json::Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// A single query-engine session.
#[async_trait]
pub trait QueryConnection: Send {
    /// Run one statement to completion and return its full result.
    async fn execute(&mut self, sql: &str) -> Result<QueryResult, QueryError>;
}

/// Opens connections against a resolved query-engine endpoint.
#[async_trait]
pub trait QueryConnector: Send + Sync {
    /// Open a connection scoped to `catalog`. `schema` may be left unset, in
    /// which case statements qualify their schema explicitly.
    async fn connect(
        &self,
        endpoint: &str,
        catalog: &str,
        schema: Option<&str>,
    ) -> Result<Box<dyn QueryConnection>, QueryError>;
}
