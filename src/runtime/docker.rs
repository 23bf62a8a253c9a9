//! Docker-backed container runtime.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bollard::Docker;
use bytes::Bytes;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, LogOutput, LogsOptions,
    NetworkingConfig, RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::{EndpointSettings, HostConfig, PortBinding};
use bollard::network::CreateNetworkOptions;
use futures::StreamExt;
use futures::stream::BoxStream;

use crate::error::RuntimeError;
use crate::runtime::{ContainerRuntime, ContainerSpec, ExecOutput, HttpProbe, HttpProber};

/// The daemon records an exec's exit code shortly after its output closes.
const EXEC_EXIT_POLLS: u32 = 50;
const EXEC_EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Connect to the Docker daemon.
///
/// Tries bollard's local defaults first (which honour `DOCKER_HOST`), then the
/// rootless and Docker Desktop socket locations.
pub async fn connect_docker() -> Result<Docker, RuntimeError> {
    let last_error = match Docker::connect_with_local_defaults() {
        Ok(docker) => match docker.ping().await {
            Ok(_) => return Ok(docker),
            Err(e) => e.to_string(),
        },
        Err(e) => e.to_string(),
    };

    #[cfg(unix)]
    for socket in fallback_sockets() {
        if !socket.exists() {
            continue;
        }
        let path = socket.to_string_lossy();
        if let Ok(docker) = Docker::connect_with_unix(&path, 120, bollard::API_DEFAULT_VERSION)
            && docker.ping().await.is_ok()
        {
            tracing::debug!(socket = %path, "Connected to Docker via fallback socket");
            return Ok(docker);
        }
    }

    Err(RuntimeError::Unavailable { reason: last_error })
}

#[cfg(unix)]
fn fallback_sockets() -> Vec<PathBuf> {
    let mut sockets = Vec::new();
    if let Some(runtime_dir) = std::env::var_os("XDG_RUNTIME_DIR") {
        sockets.push(PathBuf::from(runtime_dir).join("docker.sock"));
    }
    if let Some(home) = std::env::var_os("HOME") {
        sockets.push(PathBuf::from(home).join(".docker/run/docker.sock"));
    }
    sockets
}

/// [`ContainerRuntime`] over a Docker daemon.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    prober: HttpProber,
}

impl DockerRuntime {
    pub fn new(docker: Docker) -> Self {
        Self {
            docker,
            prober: HttpProber::new(),
        }
    }

    /// Connect to the local daemon.
    pub async fn connect() -> Result<Self, RuntimeError> {
        Ok(Self::new(connect_docker().await?))
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

#[async_trait]
impl HttpProbe for DockerRuntime {
    async fn http_status(&self, url: &str) -> Result<u16, RuntimeError> {
        self.prober.http_status(url).await
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<String, RuntimeError> {
        let options = CreateNetworkOptions {
            name: name.to_string(),
            driver: "bridge".to_string(),
            check_duplicate: true,
            labels: labels.clone(),
            ..Default::default()
        };

        let response = self.docker.create_network(options).await?;
        if response.id.is_empty() {
            return Err(RuntimeError::Api(format!(
                "no id returned for network {name}"
            )));
        }
        Ok(response.id)
    }

    async fn remove_network(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker.remove_network(id).await?;
        Ok(())
    }

    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.docker.inspect_image(image).await.is_ok() {
            tracing::debug!(image, "Image exists locally");
            return Ok(());
        }

        tracing::info!(image, "Pulling image");

        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut stream = self.docker.create_image(Some(options), None, None);
        while let Some(result) = stream.next().await {
            let info = result?;
            if let Some(status) = info.status {
                tracing::trace!(image, status = %status, "Pull progress");
            }
        }

        tracing::info!(image, "Pulled image");
        Ok(())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError> {
        let exposed_ports: HashMap<String, HashMap<(), ()>> = spec
            .exposed_ports
            .iter()
            .map(|port| (format!("{port}/tcp"), HashMap::new()))
            .collect();

        // An empty host port asks the daemon for an ephemeral one.
        let port_bindings: HashMap<String, Option<Vec<PortBinding>>> = spec
            .exposed_ports
            .iter()
            .map(|port| {
                (
                    format!("{port}/tcp"),
                    Some(vec![PortBinding {
                        host_ip: Some(spec.bind_address.clone()),
                        host_port: Some(String::new()),
                    }]),
                )
            })
            .collect();

        let env: Vec<String> = spec.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let host_config = HostConfig {
            port_bindings: Some(port_bindings),
            network_mode: Some(spec.network.clone()),
            auto_remove: Some(false),
            ..Default::default()
        };

        let endpoints_config: HashMap<String, EndpointSettings> = [(
            spec.network.clone(),
            EndpointSettings {
                aliases: Some(vec![spec.alias.clone()]),
                ..Default::default()
            },
        )]
        .into_iter()
        .collect();

        let config = Config {
            image: Some(spec.image.clone()),
            env: if env.is_empty() { None } else { Some(env) },
            cmd: spec.cmd.clone(),
            labels: Some(spec.labels.clone()),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            networking_config: Some(NetworkingConfig { endpoints_config }),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let response = self.docker.create_container(Some(options), config).await?;
        for warning in response.warnings {
            tracing::warn!(container = %spec.name, "Container creation warning: {}", warning);
        }
        Ok(response.id)
    }

    async fn copy_to_container(
        &self,
        id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), RuntimeError> {
        let archive = archive_file(path, content)
            .map_err(|e| RuntimeError::Api(format!("failed to build archive for {path}: {e}")))?;

        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };
        self.docker
            .upload_to_container(id, Some(options), Bytes::from(archive))
            .await?;
        Ok(())
    }

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await?;
        Ok(())
    }

    async fn host_port(&self, id: &str, container_port: u16) -> Result<Option<u16>, RuntimeError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;

        let key = format!("{container_port}/tcp");
        let port = info
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|mut ports| ports.remove(&key))
            .flatten()
            .and_then(|bindings| {
                bindings
                    .into_iter()
                    .find_map(|b| b.host_port.and_then(|p| p.parse::<u16>().ok()))
            });
        Ok(port)
    }

    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError> {
        let info = self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await?;
        Ok(info.state.and_then(|s| s.running).unwrap_or(false))
    }

    async fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutput, RuntimeError> {
        let options = CreateExecOptions {
            cmd: Some(argv.to_vec()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.docker.create_exec(id, options).await?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None::<StartExecOptions>)
            .await?
        {
            while let Some(chunk) = output.next().await {
                match chunk? {
                    LogOutput::StdOut { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    _ => {}
                }
            }
        }

        let docker = &self.docker;
        let exec_id = exec.id.as_str();
        let exit_code = await_exit_code(
            || async move {
                let inspect = docker.inspect_exec(exec_id).await?;
                Ok::<_, RuntimeError>((inspect.running, inspect.exit_code))
            },
            EXEC_EXIT_POLLS,
            EXEC_EXIT_POLL_INTERVAL,
        )
        .await?;

        Ok(ExecOutput {
            exit_code,
            stdout,
            stderr,
        })
    }

    fn follow_logs(&self, id: &str) -> BoxStream<'static, Result<String, RuntimeError>> {
        let options = LogsOptions::<String> {
            follow: true,
            stdout: true,
            stderr: true,
            ..Default::default()
        };
        self.docker
            .logs(id, Some(options))
            .map(|chunk| chunk.map(|out| out.to_string()).map_err(RuntimeError::from))
            .boxed()
    }

    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError> {
        let options = StopContainerOptions {
            t: grace.as_secs() as i64,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(()) => Ok(()),
            // Already stopped.
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }
}

/// Re-inspect an exec until it reports as finished with an exit code.
///
/// `inspect` yields `(running, exit_code)`. Dropping the returned future
/// stops the polling.
async fn await_exit_code<F, Fut>(
    mut inspect: F,
    max_polls: u32,
    interval: Duration,
) -> Result<i64, RuntimeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(Option<bool>, Option<i64>), RuntimeError>>,
{
    for attempt in 1..=max_polls {
        if let (Some(false), Some(code)) = inspect().await? {
            return Ok(code);
        }
        if attempt < max_polls {
            tokio::time::sleep(interval).await;
        }
    }
    Err(RuntimeError::Api(format!(
        "exec did not report an exit code after {max_polls} checks"
    )))
}

/// Build an in-memory tar archive holding a single file at `path`.
fn archive_file(path: &str, content: &[u8]) -> std::io::Result<Vec<u8>> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);

    let mut builder = tar::Builder::new(Vec::new());
    builder.append_data(&mut header, path.trim_start_matches('/'), content)?;
    builder.into_inner()
}
