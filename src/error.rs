//! Error types for the stack, its containers, fixtures and configuration.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::stack::{LifecycleState, Service, Stage};

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Errors reported by the container runtime boundary.
#[derive(Debug, Error)]
pub enum RuntimeError {
    /// The daemon could not be reached at all.
    #[error("Docker not available: {reason}")]
    Unavailable { reason: String },

    /// The referenced container, network or exec instance does not exist.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Any other API failure.
    #[error("Container runtime error: {0}")]
    Api(String),

    /// An HTTP probe against a mapped port failed before a status was received.
    #[error("HTTP probe failed: {0}")]
    Probe(String),
}

impl RuntimeError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound(_))
    }
}

impl From<bollard::errors::Error> for RuntimeError {
    fn from(err: bollard::errors::Error) -> Self {
        match err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => RuntimeError::NotFound(message),
            other => RuntimeError::Api(other.to_string()),
        }
    }
}

/// Why a readiness wait ended without the condition holding.
#[derive(Debug, Error)]
pub enum WaitError {
    #[error("deadline elapsed: {reason}")]
    Timeout { reason: String },

    #[error("wait cancelled")]
    Cancelled,

    #[error("container exited")]
    Exited,

    #[error("no host binding for readiness port {0}")]
    UnknownPort(u16),

    #[error("log stream failed: {0}")]
    Stream(String),
}

/// Errors from a single managed container.
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Failed to pull image '{image}': {reason}")]
    ImagePullFailed { image: String, reason: String },

    #[error("Failed to create container '{name}': {reason}")]
    CreationFailed { name: String, reason: String },

    #[error("Failed to copy '{path}' into container '{name}': {reason}")]
    CopyFailed {
        name: String,
        path: String,
        reason: String,
    },

    #[error("Failed to start container '{name}': {reason}")]
    StartFailed { name: String, reason: String },

    #[error("Container '{name}' has no host binding for port {port}")]
    PortNotMapped { name: String, port: u16 },

    #[error("Container '{name}' not ready within {timeout:?}: {reason}")]
    WaitTimeout {
        name: String,
        timeout: Duration,
        reason: String,
    },

    #[error("Container '{name}' stopped before becoming ready")]
    ContainerExited { name: String },

    #[error("Exec {argv:?} in container '{name}' failed: {reason}")]
    ExecFailed {
        name: String,
        argv: Vec<String>,
        reason: String,
    },

    #[error("Exec {argv:?} in container '{name}' did not finish within {timeout:?}")]
    ExecTimeout {
        name: String,
        argv: Vec<String>,
        timeout: Duration,
    },

    #[error("Container '{name}' is not running")]
    NotStarted { name: String },

    #[error("Container '{name}' was already started")]
    AlreadyStarted { name: String },

    #[error("Operation on container '{name}' was cancelled")]
    Cancelled { name: String },
}

impl ContainerError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ContainerError::Cancelled { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            ContainerError::WaitTimeout { .. } | ContainerError::ExecTimeout { .. }
        )
    }
}

/// Errors from fixture discovery and execution.
#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("Failed to read fixture {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Statement in {file} failed: {reason}\n  statement: {statement}")]
    Statement {
        file: PathBuf,
        statement: String,
        reason: String,
    },

    #[error("Could not open query-engine connection: {0}")]
    Connection(#[source] QueryError),

    #[error("Fixture execution was cancelled")]
    Cancelled,
}

/// Errors from the query-engine client protocol.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("Query-engine request failed: {0}")]
    Transport(String),

    #[error("Query failed ({error_name}): {message}")]
    Server { error_name: String, message: String },

    #[error("Unexpected query-engine response: {0}")]
    Protocol(String),
}

impl From<reqwest::Error> for QueryError {
    fn from(err: reqwest::Error) -> Self {
        QueryError::Transport(err.to_string())
    }
}

/// Top-level errors surfaced by the stack controller.
#[derive(Debug, Error)]
pub enum StackError {
    #[error("Docker not available: {reason}")]
    DockerNotAvailable { reason: String },

    #[error("Failed to create network '{name}': {reason}")]
    NetworkCreation { name: String, reason: String },

    #[error("{stage} stage failed for {service}: {source}")]
    Component {
        stage: Stage,
        service: Service,
        #[source]
        source: ContainerError,
    },

    #[error("Bucket bootstrap for '{bucket}' exited with code {exit_code}: {stderr}")]
    Bootstrap {
        bucket: String,
        exit_code: i64,
        stdout: String,
        stderr: String,
    },

    #[error("{stage} stage failed: {source}")]
    Fixtures {
        stage: Stage,
        #[source]
        source: ScriptError,
    },

    #[error("Startup cancelled during {stage} stage")]
    Cancelled { stage: Stage },

    #[error("Cannot {action} while the stack is {state}")]
    InvalidState {
        action: &'static str,
        state: LifecycleState,
    },

    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl StackError {
    /// Whether this error is a caller-triggered cancellation rather than a
    /// health or startup failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, StackError::Cancelled { .. })
    }

    /// The startup stage that failed, if the error belongs to one.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            StackError::NetworkCreation { .. } => Some(Stage::Network),
            StackError::Component { stage, .. }
            | StackError::Fixtures { stage, .. }
            | StackError::Cancelled { stage } => Some(*stage),
            StackError::Bootstrap { .. } => Some(Stage::Services),
            _ => None,
        }
    }

    /// Wrap a container failure, folding cancellation into its own variant.
    pub(crate) fn component(stage: Stage, service: Service, source: ContainerError) -> Self {
        if source.is_cancelled() {
            StackError::Cancelled { stage }
        } else {
            StackError::Component {
                stage,
                service,
                source,
            }
        }
    }

    pub(crate) fn fixtures(source: ScriptError) -> Self {
        match source {
            ScriptError::Cancelled => StackError::Cancelled {
                stage: Stage::Fixtures,
            },
            source => StackError::Fixtures {
                stage: Stage::Fixtures,
                source,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancellation_is_distinct_from_timeout() {
        let cancelled = StackError::component(
            Stage::Dependencies,
            Service::Catalog,
            ContainerError::Cancelled {
                name: "catalog".to_string(),
            },
        );
        assert!(cancelled.is_cancelled());
        assert_eq!(cancelled.stage(), Some(Stage::Dependencies));

        let timeout = StackError::component(
            Stage::Dependencies,
            Service::Catalog,
            ContainerError::WaitTimeout {
                name: "catalog".to_string(),
                timeout: Duration::from_secs(1),
                reason: "status 503".to_string(),
            },
        );
        assert!(!timeout.is_cancelled());
        let message = timeout.to_string();
        assert!(message.contains("dependencies"));
        assert!(message.contains("catalog"));
    }

    #[test]
    fn test_fixture_cancellation_maps_to_fixture_stage() {
        let err = StackError::fixtures(ScriptError::Cancelled);
        assert!(err.is_cancelled());
        assert_eq!(err.stage(), Some(Stage::Fixtures));
    }

    #[test]
    fn test_statement_error_names_file_and_statement() {
        let err = ScriptError::Statement {
            file: PathBuf::from("insert/001_orders.sql"),
            statement: "INSERT INTO orders VALUES (1)".to_string(),
            reason: "TABLE_NOT_FOUND".to_string(),
        };
        let message = err.to_string();
        assert!(message.contains("001_orders.sql"));
        assert!(message.contains("INSERT INTO orders VALUES (1)"));
    }
}
