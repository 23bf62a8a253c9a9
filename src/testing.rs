//! In-memory doubles for exercising the stack without a container daemon.
//!
//! Provides:
//! - [`FakeRuntime`]: a [`ContainerRuntime`] that records every call and
//!   supports per-container failure injection
//! - [`RecordingConnector`]: a [`QueryConnector`] whose connections record the
//!   statements they receive
//! - [`init_tracing`]: test-friendly log output
//!
//! Behaviour rules (`set_logs`, `fail_stop`, ...) take a name *pattern*: any
//! container whose name contains the pattern is affected. Stack tests can then
//! target `"query-engine"` without knowing the generated session prefix.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use icestack::testing::FakeRuntime;
//!
//! let runtime = Arc::new(FakeRuntime::new());
//! runtime.set_logs("query-engine", &["======== SERVER STARTED ========"]);
//! runtime.fail_stop("catalog");
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::{self, BoxStream};

use crate::error::{QueryError, RuntimeError};
use crate::query::{QueryConnection, QueryConnector, QueryResult};
use crate::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, HttpProbe};

/// Install a fmt subscriber that writes through the test harness.
///
/// Safe to call from every test; only the first call installs.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("icestack=info")),
        )
        .with_test_writer()
        .try_init();
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn rule_matches(patterns: &[String], name: &str) -> bool {
    patterns.iter().any(|p| name.contains(p.as_str()))
}

fn rule_value<'a, T>(rules: &'a [(String, T)], name: &str) -> Option<&'a T> {
    rules
        .iter()
        .rev()
        .find(|(pattern, _)| name.contains(pattern.as_str()))
        .map(|(_, value)| value)
}

struct FakeContainer {
    spec: ContainerSpec,
    running: bool,
    ports: HashMap<u16, u16>,
    copied: Vec<String>,
}

#[derive(Default)]
struct FakeState {
    containers: HashMap<String, FakeContainer>,
    networks: HashSet<String>,
    events: Vec<String>,
    exec_calls: Vec<(String, Vec<String>)>,

    logs: Vec<(String, Vec<String>)>,
    exec_outputs: Vec<(String, ExecOutput)>,
    http_statuses: Vec<(String, u16)>,
    start_delays: Vec<(String, Duration)>,
    hang_exec: Vec<String>,
    fail_create: Vec<String>,
    fail_start: Vec<String>,
    fail_stop: Vec<String>,
    fail_remove: Vec<String>,
    fail_network: bool,
}

/// A [`ContainerRuntime`] backed by in-memory state.
///
/// Container ids are the container names. Every container gets unique host
/// ports, HTTP probes answer 200 unless overridden, and log streams stay
/// silent unless [`set_logs`](Self::set_logs) configures them.
pub struct FakeRuntime {
    state: Mutex<FakeState>,
    next_port: AtomicU16,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState::default()),
            next_port: AtomicU16::new(40000),
        }
    }

    /// Log chunks emitted by matching containers; the stream ends after them.
    pub fn set_logs(&self, pattern: &str, chunks: &[&str]) {
        lock(&self.state).logs.push((
            pattern.to_string(),
            chunks.iter().map(|c| c.to_string()).collect(),
        ));
    }

    /// Output returned by exec in matching containers.
    pub fn set_exec_output(&self, pattern: &str, output: ExecOutput) {
        lock(&self.state)
            .exec_outputs
            .push((pattern.to_string(), output));
    }

    /// Status answered by HTTP probes against matching containers' ports.
    pub fn set_http_status(&self, pattern: &str, status: u16) {
        lock(&self.state)
            .http_statuses
            .push((pattern.to_string(), status));
    }

    /// Delay `start_container` for matching containers.
    pub fn delay_start(&self, pattern: &str, delay: Duration) {
        lock(&self.state)
            .start_delays
            .push((pattern.to_string(), delay));
    }

    /// Exec in matching containers never returns.
    pub fn hang_exec(&self, pattern: &str) {
        lock(&self.state).hang_exec.push(pattern.to_string());
    }

    pub fn fail_create(&self, pattern: &str) {
        lock(&self.state).fail_create.push(pattern.to_string());
    }

    pub fn fail_start(&self, pattern: &str) {
        lock(&self.state).fail_start.push(pattern.to_string());
    }

    pub fn fail_stop(&self, pattern: &str) {
        lock(&self.state).fail_stop.push(pattern.to_string());
    }

    pub fn fail_remove(&self, pattern: &str) {
        lock(&self.state).fail_remove.push(pattern.to_string());
    }

    pub fn fail_create_network(&self) {
        lock(&self.state).fail_network = true;
    }

    /// Every recorded call, in order, as `"<op> <target> [detail]"`.
    pub fn events(&self) -> Vec<String> {
        lock(&self.state).events.clone()
    }

    /// Recorded calls whose target contains `pattern`.
    pub fn events_for(&self, pattern: &str) -> Vec<String> {
        lock(&self.state)
            .events
            .iter()
            .filter(|e| {
                e.split_whitespace()
                    .nth(1)
                    .is_some_and(|target| target.contains(pattern))
            })
            .cloned()
            .collect()
    }

    /// Index of the first event starting with `"<op> "` whose target contains
    /// `pattern`.
    pub fn position(&self, op: &str, pattern: &str) -> Option<usize> {
        lock(&self.state).events.iter().position(|e| {
            let mut parts = e.split_whitespace();
            parts.next() == Some(op) && parts.next().is_some_and(|t| t.contains(pattern))
        })
    }

    /// Paths copied into the container named `name`.
    pub fn copied_files(&self, name: &str) -> Vec<String> {
        lock(&self.state)
            .containers
            .get(name)
            .map(|c| c.copied.clone())
            .unwrap_or_default()
    }

    /// Argument vectors executed in containers matching `pattern`.
    pub fn exec_calls(&self, pattern: &str) -> Vec<Vec<String>> {
        lock(&self.state)
            .exec_calls
            .iter()
            .filter(|(name, _)| name.contains(pattern))
            .map(|(_, argv)| argv.clone())
            .collect()
    }

    /// Creation spec of the existing container matching `pattern`.
    pub fn spec_of(&self, pattern: &str) -> Option<ContainerSpec> {
        lock(&self.state)
            .containers
            .iter()
            .find(|(name, _)| name.contains(pattern))
            .map(|(_, c)| c.spec.clone())
    }

    pub fn exists(&self, name: &str) -> bool {
        lock(&self.state).containers.contains_key(name)
    }

    /// Names of containers that currently exist.
    pub fn containers(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.state).containers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Names of networks that currently exist.
    pub fn networks(&self) -> Vec<String> {
        let mut names: Vec<_> = lock(&self.state).networks.iter().cloned().collect();
        names.sort();
        names
    }

    /// Every host port handed out to a live container.
    pub fn host_ports(&self) -> Vec<u16> {
        lock(&self.state)
            .containers
            .values()
            .flat_map(|c| c.ports.values().copied())
            .collect()
    }

    fn record(&self, event: String) {
        lock(&self.state).events.push(event);
    }
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpProbe for FakeRuntime {
    async fn http_status(&self, url: &str) -> Result<u16, RuntimeError> {
        let port = url::Url::parse(url)
            .ok()
            .and_then(|u| u.port())
            .ok_or_else(|| RuntimeError::Probe(format!("bad url {url}")))?;

        let state = lock(&self.state);
        let owner = state
            .containers
            .iter()
            .find(|(_, c)| c.running && c.ports.values().any(|p| *p == port))
            .map(|(name, _)| name.clone())
            .ok_or_else(|| RuntimeError::Probe(format!("connection refused: {url}")))?;

        Ok(rule_value(&state.http_statuses, &owner)
            .copied()
            .unwrap_or(200))
    }
}

#[async_trait]
impl ContainerRuntime for FakeRuntime {
    async fn create_network(
        &self,
        name: &str,
        _labels: &HashMap<String, String>,
    ) -> Result<String, RuntimeError> {
        self.record(format!("create_network {name}"));
        let mut state = lock(&self.state);
        if state.fail_network {
            return Err(RuntimeError::Api("network creation refused".to_string()));
        }
        if !state.networks.insert(name.to_string()) {
            return Err(RuntimeError::Api(format!("network {name} already exists")));
        }
        Ok(name.to_string())
    }

    async fn remove_network(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(format!("remove_network {id}"));
        let mut state = lock(&self.state);
        if state.containers.values().any(|c| c.spec.network == id) {
            return Err(RuntimeError::Api(format!(
                "network {id} has active endpoints"
            )));
        }
        if state.networks.remove(id) {
            Ok(())
        } else {
            Err(RuntimeError::NotFound(format!("network {id}")))
        }
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        self.record(format!("pull {image}"));
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        self.record(format!("create {}", spec.name));
        let mut state = lock(&self.state);
        if rule_matches(&state.fail_create, &spec.name) {
            return Err(RuntimeError::Api("creation refused".to_string()));
        }
        if state.containers.contains_key(&spec.name) {
            return Err(RuntimeError::Api(format!(
                "Conflict. The container name \"/{}\" is already in use",
                spec.name
            )));
        }
        let ports = spec
            .exposed_ports
            .iter()
            .map(|&p| (p, self.next_port.fetch_add(1, Ordering::Relaxed)))
            .collect();
        state.containers.insert(
            spec.name.clone(),
            FakeContainer {
                spec: spec.clone(),
                running: false,
                ports,
                copied: Vec::new(),
            },
        );
        Ok(spec.name.clone())
    }

    async fn copy_to_container(
        &self,
        id: &str,
        path: &str,
        _content: &[u8],
    ) -> Result<(), RuntimeError> {
        self.record(format!("copy {id} {path}"));
        let mut state = lock(&self.state);
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.copied.push(path.to_string());
        Ok(())
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        let delay = rule_value(&lock(&self.state).start_delays, id).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        self.record(format!("start {id}"));
        let mut state = lock(&self.state);
        if rule_matches(&state.fail_start, id) {
            return Err(RuntimeError::Api("start refused".to_string()));
        }
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.running = true;
        Ok(())
    }

    async fn host_port(&self, id: &str, container_port: u16) -> Result<Option<u16>, RuntimeError> {
        let state = lock(&self.state);
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        Ok(container.ports.get(&container_port).copied())
    }

    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError> {
        let state = lock(&self.state);
        let container = state
            .containers
            .get(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        Ok(container.running)
    }

    async fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutput, RuntimeError> {
        self.record(format!("exec {id} {}", argv.join(" ")));
        let (hang, output) = {
            let mut state = lock(&self.state);
            if !state.containers.get(id).is_some_and(|c| c.running) {
                return Err(RuntimeError::Api(format!("container {id} is not running")));
            }
            state.exec_calls.push((id.to_string(), argv.to_vec()));
            (
                rule_matches(&state.hang_exec, id),
                rule_value(&state.exec_outputs, id).cloned(),
            )
        };

        if hang {
            futures::future::pending::<()>().await;
        }
        Ok(output.unwrap_or_default())
    }

    fn follow_logs(&self, id: &str) -> BoxStream<'static, Result<String, RuntimeError>> {
        match rule_value(&lock(&self.state).logs, id).cloned() {
            Some(chunks) => stream::iter(chunks.into_iter().map(Ok)).boxed(),
            None => stream::pending().boxed(),
        }
    }

    async fn stop_container(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        self.record(format!("stop {id}"));
        let mut state = lock(&self.state);
        if rule_matches(&state.fail_stop, id) {
            return Err(RuntimeError::Api("stop refused".to_string()));
        }
        let container = state
            .containers
            .get_mut(id)
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))?;
        container.running = false;
        Ok(())
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.record(format!("remove {id}"));
        let mut state = lock(&self.state);
        if rule_matches(&state.fail_remove, id) {
            return Err(RuntimeError::Api("removal refused".to_string()));
        }
        state
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| RuntimeError::NotFound(id.to_string()))
    }
}

#[derive(Default)]
struct RecordingState {
    statements: Vec<String>,
    connections: Vec<(String, String, Option<String>)>,
    failures: Vec<(String, String)>,
    results: Vec<(String, QueryResult)>,
}

/// A [`QueryConnector`] whose connections record statements instead of
/// running them.
///
/// Clones share the same recording.
#[derive(Clone, Default)]
pub struct RecordingConnector {
    state: Arc<Mutex<RecordingState>>,
}

impl RecordingConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Statements containing `substring` fail with a server error.
    pub fn fail_on(&self, substring: &str, message: &str) {
        lock(&self.state)
            .failures
            .push((substring.to_string(), message.to_string()));
    }

    /// Statements containing `substring` return `result`.
    pub fn respond_to(&self, substring: &str, result: QueryResult) {
        lock(&self.state)
            .results
            .push((substring.to_string(), result));
    }

    /// Every statement received, across all connections, in order.
    pub fn statements(&self) -> Vec<String> {
        lock(&self.state).statements.clone()
    }

    /// `(endpoint, catalog, schema)` of every connection opened.
    pub fn connections(&self) -> Vec<(String, String, Option<String>)> {
        lock(&self.state).connections.clone()
    }
}

#[async_trait]
impl QueryConnector for RecordingConnector {
    async fn connect(
        &self,
        endpoint: &str,
        catalog: &str,
        schema: Option<&str>,
    ) -> Result<Box<dyn QueryConnection>, QueryError> {
        lock(&self.state).connections.push((
            endpoint.to_string(),
            catalog.to_string(),
            schema.map(str::to_string),
        ));
        Ok(Box::new(RecordingConnection {
            state: Arc::clone(&self.state),
        }))
    }
}

/// Connection handed out by [`RecordingConnector`].
pub struct RecordingConnection {
    state: Arc<Mutex<RecordingState>>,
}

#[async_trait]
impl QueryConnection for RecordingConnection {
    async fn execute(&mut self, sql: &str) -> Result<QueryResult, QueryError> {
        let mut state = lock(&self.state);
        state.statements.push(sql.to_string());

        if let Some(message) = rule_value(&state.failures, sql) {
            return Err(QueryError::Server {
                error_name: "INJECTED_FAILURE".to_string(),
                message: message.clone(),
            });
        }

        Ok(rule_value(&state.results, sql).cloned().unwrap_or_default())
    }
}
