//! Startup and teardown sequencing for the whole stack.
//!
//! ```text
//!   network ──► { storage ∥ catalog } ──► { bucket bootstrap ∥ query engine } ──► fixtures
//!                      join barrier                    join barrier
//! ```
//!
//! Disposal runs the other way round: query engine, then storage and catalog,
//! then the network. Each step swallows and logs its own failures so every
//! remaining component is still removed. Disposing first cancels any start
//! still in flight and waits for it to unwind.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::StackConfig;
use crate::container::{ContainerHandle, HandleOptions};
use crate::error::{ContainerError, ScriptError, StackError};
use crate::fixtures::{PipelineReport, ScriptPipeline};
use crate::network::NetworkHandle;
use crate::query::{QueryConnection, QueryConnector, TrinoConnector};
use crate::runtime::{ContainerRuntime, DockerRuntime, check_docker};
use crate::stack::services::{self, StackNames};
use crate::stack::{LifecycleState, Service, Stage};

/// Host-reachable base URLs of the three services.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackEndpoints {
    pub storage: String,
    pub catalog: String,
    pub query_engine: String,
}

/// Builder for [`StackController`].
pub struct StackControllerBuilder {
    config: StackConfig,
    runtime: Arc<dyn ContainerRuntime>,
    connector: Option<Arc<dyn QueryConnector>>,
    names: Option<StackNames>,
}

impl StackControllerBuilder {
    /// Query-engine client used for fixtures and [`StackController::connection`].
    pub fn connector(mut self, connector: Arc<dyn QueryConnector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Fixed names instead of freshly generated ones.
    pub fn names(mut self, names: StackNames) -> Self {
        self.names = Some(names);
        self
    }

    pub fn build(self) -> StackController {
        let names = self.names.unwrap_or_else(StackNames::generate);
        let connector = self
            .connector
            .unwrap_or_else(|| Arc::new(TrinoConnector::new(self.config.query_user.clone())));

        let options = HandleOptions {
            host_address: self.config.host_address.clone(),
            auto_pull: self.config.auto_pull,
            exec_timeout: self.config.exec_timeout,
            stop_timeout: self.config.stop_timeout,
        };
        let handle = |descriptor| {
            ContainerHandle::new(descriptor, Arc::clone(&self.runtime), options.clone())
        };

        StackController {
            network: NetworkHandle::new(
                names.network(),
                names.labels(None),
                Arc::clone(&self.runtime),
            ),
            storage: handle(services::storage(&self.config, &names)),
            catalog: handle(services::catalog(&self.config, &names)),
            query_engine: handle(services::query_engine(&self.config, &names)),
            config: self.config,
            names,
            connector,
            state: RwLock::new(LifecycleState::NotStarted),
            start_requested: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            start_lock: Mutex::new(()),
            dispose_lock: Mutex::new(()),
        }
    }
}

/// Owns one disposable stack instance.
///
/// Construction allocates nothing. [`start`](Self::start) brings the stack
/// up; on failure it leaves whatever was created in place for inspection.
/// [`dispose`](Self::dispose) is always safe to call and must be called.
pub struct StackController {
    config: StackConfig,
    names: StackNames,
    connector: Arc<dyn QueryConnector>,
    network: NetworkHandle,
    storage: ContainerHandle,
    catalog: ContainerHandle,
    query_engine: ContainerHandle,
    state: RwLock<LifecycleState>,
    start_requested: AtomicBool,
    /// Cancelled by `dispose`; every start runs under a child of it.
    shutdown: CancellationToken,
    /// Held for the whole of `start`.
    start_lock: Mutex<()>,
    dispose_lock: Mutex<()>,
}

impl std::fmt::Debug for StackController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StackController")
            .field("session", &self.names.session())
            .field("network", &self.network.name())
            .field("catalog", &self.config.catalog)
            .finish_non_exhaustive()
    }
}

impl StackController {
    pub fn builder(config: StackConfig, runtime: Arc<dyn ContainerRuntime>) -> StackControllerBuilder {
        StackControllerBuilder {
            config,
            runtime,
            connector: None,
            names: None,
        }
    }

    pub fn new(config: StackConfig, runtime: Arc<dyn ContainerRuntime>) -> Self {
        Self::builder(config, runtime).build()
    }

    /// Controller over the local Docker daemon.
    pub async fn connect(config: StackConfig) -> Result<Self, StackError> {
        let detection = check_docker().await;
        if !detection.status.is_ok() {
            let reason = match detection.hint() {
                Some(hint) => format!("{} ({})", detection.status.as_str(), hint),
                None => detection.status.as_str().to_string(),
            };
            return Err(StackError::DockerNotAvailable { reason });
        }

        let runtime = DockerRuntime::connect()
            .await
            .map_err(|e| StackError::DockerNotAvailable {
                reason: e.to_string(),
            })?;
        Ok(Self::new(config, Arc::new(runtime)))
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn names(&self) -> &StackNames {
        &self.names
    }

    pub async fn state(&self) -> LifecycleState {
        *self.state.read().await
    }

    pub fn network(&self) -> &NetworkHandle {
        &self.network
    }

    pub fn handle(&self, service: Service) -> &ContainerHandle {
        match service {
            Service::Storage => &self.storage,
            Service::Catalog => &self.catalog,
            Service::QueryEngine => &self.query_engine,
        }
    }

    /// Bring the stack to the ready state.
    ///
    /// Runs at most once per controller. Cancelling `cancel`, or calling
    /// [`dispose`](Self::dispose), aborts the current stage and yields
    /// [`StackError::Cancelled`].
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), StackError> {
        self.config.validate()?;
        if self.start_requested.swap(true, Ordering::SeqCst) {
            return Err(StackError::InvalidState {
                action: "start",
                state: self.state().await,
            });
        }

        let _running = self.start_lock.lock().await;
        let current = self.state().await;
        if current != LifecycleState::NotStarted {
            return Err(StackError::InvalidState {
                action: "start",
                state: current,
            });
        }

        let token = self.shutdown.child_token();
        // Ends the forwarding task below once startup returns.
        let _stop_forwarding = token.clone().drop_guard();
        if cancel.is_cancelled() {
            token.cancel();
        }
        let caller = cancel.clone();
        let forward = token.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = caller.cancelled() => forward.cancel(),
                _ = forward.cancelled() => {}
            }
        });

        self.run_startup(&token).await
    }

    async fn run_startup(&self, cancel: &CancellationToken) -> Result<(), StackError> {
        tracing::info!(session = %self.names.session(), network = %self.network.name(), "Starting stack");

        if cancel.is_cancelled() {
            return Err(StackError::Cancelled {
                stage: Stage::Network,
            });
        }
        self.network.create().await?;
        self.advance(LifecycleState::NetworkReady).await?;

        let (storage, catalog) = tokio::join!(self.storage.start(cancel), self.catalog.start(cancel));
        first_failure([
            storage.map_err(|e| StackError::component(Stage::Dependencies, Service::Storage, e)),
            catalog.map_err(|e| StackError::component(Stage::Dependencies, Service::Catalog, e)),
        ])?;
        self.advance(LifecycleState::DependenciesReady).await?;

        let (bootstrap, query_engine) =
            tokio::join!(self.bootstrap_bucket(cancel), self.query_engine.start(cancel));
        first_failure([
            bootstrap,
            query_engine
                .map_err(|e| StackError::component(Stage::Services, Service::QueryEngine, e)),
        ])?;
        self.advance(LifecycleState::ServiceReady).await?;

        if let Some(dir) = &self.config.fixtures_dir {
            self.load_fixtures(ScriptPipeline::new(dir), cancel).await?;
        }
        self.advance(LifecycleState::FixturesLoaded).await?;

        tracing::info!(session = %self.names.session(), "Stack ready");
        Ok(())
    }

    /// Create the configured bucket if it does not exist yet.
    ///
    /// Idempotent; safe to call again on a running stack.
    pub async fn bootstrap_bucket(&self, cancel: &CancellationToken) -> Result<(), StackError> {
        let bucket = &self.config.bucket;
        let argv = services::bootstrap_bucket_argv(bucket);
        let output = self
            .storage
            .exec(&argv, cancel)
            .await
            .map_err(|e| StackError::component(Stage::Services, Service::Storage, e))?;

        if !output.success() {
            return Err(StackError::Bootstrap {
                bucket: bucket.clone(),
                exit_code: output.exit_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        }
        tracing::info!(bucket = %bucket, "Bucket ready");
        Ok(())
    }

    /// Run a fixture pipeline over one fresh connection.
    pub async fn load_fixtures(
        &self,
        pipeline: ScriptPipeline,
        cancel: &CancellationToken,
    ) -> Result<PipelineReport, StackError> {
        let endpoint = self
            .query_endpoint()
            .map_err(|e| StackError::component(Stage::Fixtures, Service::QueryEngine, e))?;
        let mut connection = self
            .connector
            .connect(&endpoint, &self.config.catalog, None)
            .await
            .map_err(|e| StackError::fixtures(ScriptError::Connection(e)))?;

        pipeline
            .run(connection.as_mut(), cancel)
            .await
            .map_err(StackError::fixtures)
    }

    /// A new query-engine connection scoped to the configured catalog.
    ///
    /// Connections are independent; use one per concurrent caller.
    pub async fn connection(&self) -> Result<Box<dyn QueryConnection>, StackError> {
        let endpoint = match self.query_endpoint() {
            Ok(endpoint) => endpoint,
            Err(_) => {
                return Err(StackError::InvalidState {
                    action: "open a query connection",
                    state: self.state().await,
                });
            }
        };
        Ok(self
            .connector
            .connect(&endpoint, &self.config.catalog, None)
            .await?)
    }

    /// Object-storage API URL. Available once storage has started.
    pub fn storage_endpoint(&self) -> Result<String, ContainerError> {
        self.storage.endpoint("http", services::STORAGE_API_PORT)
    }

    /// Catalog REST URL. Available once the catalog has started.
    pub fn catalog_endpoint(&self) -> Result<String, ContainerError> {
        self.catalog.endpoint("http", services::CATALOG_PORT)
    }

    /// Query-engine URL. Available once the query engine has started.
    pub fn query_endpoint(&self) -> Result<String, ContainerError> {
        self.query_engine.endpoint("http", services::QUERY_ENGINE_PORT)
    }

    /// All three URLs, recomputed from the live handles.
    pub fn endpoints(&self) -> Result<StackEndpoints, ContainerError> {
        Ok(StackEndpoints {
            storage: self.storage_endpoint()?,
            catalog: self.catalog_endpoint()?,
            query_engine: self.query_endpoint()?,
        })
    }

    /// Tear everything down in reverse dependency order.
    ///
    /// Never fails and may be called any number of times, from any state.
    /// A [`start`](Self::start) still in flight is cancelled and awaited
    /// before anything is removed.
    pub async fn dispose(&self) {
        self.shutdown.cancel();
        let _guard = self.dispose_lock.lock().await;
        let _no_start = self.start_lock.lock().await;
        {
            let mut state = self.state.write().await;
            let current = *state;
            if current == LifecycleState::Disposed {
                return;
            }
            tracing::info!(session = %self.names.session(), from = %current, "Disposing stack");
            *state = LifecycleState::Disposing;
        }

        self.query_engine.dispose().await;
        tokio::join!(self.storage.dispose(), self.catalog.dispose());
        self.network.dispose().await;

        *self.state.write().await = LifecycleState::Disposed;
        tracing::info!(session = %self.names.session(), "Stack disposed");
    }

    async fn advance(&self, next: LifecycleState) -> Result<(), StackError> {
        let mut state = self.state.write().await;
        if state.is_disposed() {
            return Err(StackError::InvalidState {
                action: "continue startup",
                state: *state,
            });
        }
        *state = next;
        tracing::debug!(state = %next, "Stack state advanced");
        Ok(())
    }
}

/// The first real failure of a join group; cancellation only when nothing
/// else went wrong.
fn first_failure<const N: usize>(results: [Result<(), StackError>; N]) -> Result<(), StackError> {
    let mut cancelled = None;
    for result in results {
        match result {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                cancelled.get_or_insert(e);
            }
            Err(e) => return Err(e),
        }
    }
    cancelled.map_or(Ok(()), Err)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cancelled(stage: Stage) -> Result<(), StackError> {
        Err(StackError::Cancelled { stage })
    }

    #[test]
    fn test_real_failure_wins_over_cancellation() {
        let err = first_failure([
            cancelled(Stage::Dependencies),
            Err(StackError::NetworkCreation {
                name: "n".to_string(),
                reason: "boom".to_string(),
            }),
        ])
        .unwrap_err();
        assert!(!err.is_cancelled());

        let err = first_failure([Ok(()), cancelled(Stage::Dependencies)]).unwrap_err();
        assert!(err.is_cancelled());

        assert!(first_failure([Ok(()), Ok(())]).is_ok());
    }
}
