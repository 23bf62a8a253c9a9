//! Lifecycle of one managed container.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::container::ContainerDescriptor;
use crate::error::{ContainerError, WaitError};
use crate::runtime::{ContainerRuntime, ExecOutput};

/// State of a managed container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    /// Not started yet.
    NotStarted,
    /// Start in progress.
    Starting,
    /// Running and ready.
    Running,
    /// Start failed; the container may still exist for inspection.
    Failed,
    /// Stopped and removed.
    Disposed,
}

/// Settings shared by every handle of a stack.
#[derive(Debug, Clone)]
pub struct HandleOptions {
    /// Address published ports are bound on and endpoints point at.
    pub host_address: String,
    /// Pull the image when it is not present locally.
    pub auto_pull: bool,
    /// Upper bound on a single exec call; `None` relies on caller cancellation.
    pub exec_timeout: Option<Duration>,
    /// Grace period before a stopping container is killed.
    pub stop_timeout: Duration,
}

impl Default for HandleOptions {
    fn default() -> Self {
        Self {
            host_address: "127.0.0.1".to_string(),
            auto_pull: true,
            exec_timeout: None,
            stop_timeout: Duration::from_secs(10),
        }
    }
}

/// One managed service process.
///
/// The port map is written once, by a successful `start`, and is read-only
/// afterwards; endpoints are always derived from it on demand.
pub struct ContainerHandle {
    descriptor: ContainerDescriptor,
    runtime: Arc<dyn ContainerRuntime>,
    options: HandleOptions,
    state: RwLock<ContainerState>,
    container_id: RwLock<Option<String>>,
    ports: OnceLock<HashMap<u16, u16>>,
}

impl ContainerHandle {
    pub fn new(
        descriptor: ContainerDescriptor,
        runtime: Arc<dyn ContainerRuntime>,
        options: HandleOptions,
    ) -> Self {
        Self {
            descriptor,
            runtime,
            options,
            state: RwLock::new(ContainerState::NotStarted),
            container_id: RwLock::new(None),
            ports: OnceLock::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn descriptor(&self) -> &ContainerDescriptor {
        &self.descriptor
    }

    pub async fn state(&self) -> ContainerState {
        *self.state.read().await
    }

    /// Daemon-assigned id, once the container has been created.
    pub async fn container_id(&self) -> Option<String> {
        self.container_id.read().await.clone()
    }

    /// Launch the container and block until its wait strategy succeeds.
    ///
    /// A handle starts at most once. On failure the container is left in place
    /// for inspection; [`dispose`](Self::dispose) removes it.
    pub async fn start(&self, cancel: &CancellationToken) -> Result<(), ContainerError> {
        {
            let mut state = self.state.write().await;
            if *state != ContainerState::NotStarted {
                return Err(ContainerError::AlreadyStarted {
                    name: self.descriptor.name.clone(),
                });
            }
            *state = ContainerState::Starting;
        }

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ContainerError::Cancelled {
                name: self.descriptor.name.clone(),
            }),
            result = self.do_start(cancel) => result,
        };

        let mut state = self.state.write().await;
        if *state == ContainerState::Starting {
            *state = if result.is_ok() {
                ContainerState::Running
            } else {
                ContainerState::Failed
            };
        }

        result
    }

    async fn do_start(&self, cancel: &CancellationToken) -> Result<(), ContainerError> {
        let name = &self.descriptor.name;

        if self.options.auto_pull {
            self.runtime
                .ensure_image(&self.descriptor.image)
                .await
                .map_err(|e| ContainerError::ImagePullFailed {
                    image: self.descriptor.image.clone(),
                    reason: e.to_string(),
                })?;
        }

        let spec = self.descriptor.to_spec(&self.options.host_address);
        let id = self
            .runtime
            .create_container(&spec)
            .await
            .map_err(|e| ContainerError::CreationFailed {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        *self.container_id.write().await = Some(id.clone());
        tracing::debug!(container = %name, id = %id, "Created container");

        for resource in &self.descriptor.resources {
            self.runtime
                .copy_to_container(&id, &resource.path, &resource.content)
                .await
                .map_err(|e| ContainerError::CopyFailed {
                    name: name.clone(),
                    path: resource.path.clone(),
                    reason: e.to_string(),
                })?;
            tracing::debug!(container = %name, path = %resource.path, "Copied resource");
        }

        self.runtime
            .start_container(&id)
            .await
            .map_err(|e| ContainerError::StartFailed {
                name: name.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(container = %name, image = %self.descriptor.image, "Started container");

        let mut ports = HashMap::with_capacity(self.descriptor.ports.len());
        for &port in &self.descriptor.ports {
            let host_port = self
                .runtime
                .host_port(&id, port)
                .await
                .map_err(|e| ContainerError::StartFailed {
                    name: name.clone(),
                    reason: e.to_string(),
                })?
                .ok_or_else(|| ContainerError::PortNotMapped {
                    name: name.clone(),
                    port,
                })?;
            ports.insert(port, host_port);
        }

        let wait = &self.descriptor.wait;
        wait.wait_until_ready(
            self.runtime.as_ref(),
            &id,
            &self.options.host_address,
            &ports,
            cancel,
        )
        .await
        .map_err(|e| match e {
            WaitError::Timeout { reason } => ContainerError::WaitTimeout {
                name: name.clone(),
                timeout: wait.timeout,
                reason,
            },
            WaitError::Cancelled => ContainerError::Cancelled { name: name.clone() },
            WaitError::Exited => ContainerError::ContainerExited { name: name.clone() },
            WaitError::UnknownPort(port) => ContainerError::PortNotMapped {
                name: name.clone(),
                port,
            },
            WaitError::Stream(reason) => ContainerError::StartFailed {
                name: name.clone(),
                reason,
            },
        })?;

        // Only a fully successful start publishes the port map.
        let _ = self.ports.set(ports);
        tracing::info!(container = %name, "Container ready");
        Ok(())
    }

    /// Host port bound to `internal_port`. Fails before `start` completes.
    pub fn mapped_port(&self, internal_port: u16) -> Result<u16, ContainerError> {
        let ports = self.ports.get().ok_or_else(|| ContainerError::NotStarted {
            name: self.descriptor.name.clone(),
        })?;
        ports
            .get(&internal_port)
            .copied()
            .ok_or_else(|| ContainerError::PortNotMapped {
                name: self.descriptor.name.clone(),
                port: internal_port,
            })
    }

    /// `scheme://host:mapped-port` for an internal port, computed on each call.
    pub fn endpoint(&self, scheme: &str, internal_port: u16) -> Result<String, ContainerError> {
        let port = self.mapped_port(internal_port)?;
        Ok(format!("{}://{}:{}", scheme, self.options.host_address, port))
    }

    /// Run a one-shot command inside the running container.
    ///
    /// Bounded by the configured exec timeout when one is set, and always by
    /// `cancel`.
    pub async fn exec(
        &self,
        argv: &[String],
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, ContainerError> {
        let name = &self.descriptor.name;
        if *self.state.read().await != ContainerState::Running {
            return Err(ContainerError::NotStarted { name: name.clone() });
        }
        let id = self
            .container_id
            .read()
            .await
            .clone()
            .ok_or_else(|| ContainerError::NotStarted { name: name.clone() })?;

        let call = async {
            let result = match self.options.exec_timeout {
                Some(limit) => tokio::time::timeout(limit, self.runtime.exec(&id, argv))
                    .await
                    .map_err(|_| ContainerError::ExecTimeout {
                        name: name.clone(),
                        argv: argv.to_vec(),
                        timeout: limit,
                    })?,
                None => self.runtime.exec(&id, argv).await,
            };
            result.map_err(|e| ContainerError::ExecFailed {
                name: name.clone(),
                argv: argv.to_vec(),
                reason: e.to_string(),
            })
        };

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(ContainerError::Cancelled { name: name.clone() }),
            output = call => output?,
        };

        tracing::debug!(
            container = %name,
            argv = ?argv,
            exit_code = output.exit_code,
            "Exec finished"
        );
        Ok(output)
    }

    /// Stop and remove the container.
    ///
    /// Idempotent and infallible: failures are logged and swallowed so the
    /// caller can continue tearing down everything else.
    pub async fn dispose(&self) {
        let previous = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, ContainerState::Disposed)
        };

        match previous {
            ContainerState::Disposed => return,
            ContainerState::NotStarted => {
                tracing::debug!(container = %self.descriptor.name, "Never started, nothing to remove");
                return;
            }
            _ => {}
        }

        // A start cancelled mid-create may not have recorded the id; the
        // daemon also accepts the unique name.
        let target = self
            .container_id
            .read()
            .await
            .clone()
            .unwrap_or_else(|| self.descriptor.name.clone());

        if let Err(e) = self
            .runtime
            .stop_container(&target, self.options.stop_timeout)
            .await
            && !e.is_not_found()
        {
            tracing::warn!(container = %self.descriptor.name, "Failed to stop container: {}", e);
        }

        match self.runtime.remove_container(&target).await {
            Ok(()) => tracing::info!(container = %self.descriptor.name, "Removed container"),
            Err(e) if e.is_not_found() => {
                tracing::debug!(container = %self.descriptor.name, "Container already gone")
            }
            Err(e) => {
                tracing::warn!(container = %self.descriptor.name, "Failed to remove container: {}", e)
            }
        }
    }
}

impl Drop for ContainerHandle {
    fn drop(&mut self) {
        if let Ok(state) = self.state.try_read()
            && matches!(
                *state,
                ContainerState::Starting | ContainerState::Running | ContainerState::Failed
            )
        {
            tracing::warn!(
                "ContainerHandle '{}' dropped without dispose(), container may remain",
                self.descriptor.name
            );
        }
    }
}
