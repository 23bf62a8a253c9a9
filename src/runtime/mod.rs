//! The container-management API the stack is a client of.
//!
//! [`ContainerRuntime`] is the seam between orchestration logic and the
//! daemon. [`DockerRuntime`] talks to a local Docker daemon through bollard;
//! tests substitute [`crate::testing::FakeRuntime`].

mod detect;
mod docker;
mod probe;

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::error::RuntimeError;

pub use detect::{DockerDetection, DockerStatus, Platform, check_docker};
pub use docker::{DockerRuntime, connect_docker};
pub use probe::HttpProber;

/// Everything the runtime needs to create one container.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    /// Unique container name.
    pub name: String,
    pub image: String,
    pub env: Vec<(String, String)>,
    /// Replaces the image's default command when set.
    pub cmd: Option<Vec<String>>,
    /// Container-internal TCP ports, each published on an ephemeral host port.
    pub exposed_ports: Vec<u16>,
    /// Network to attach to.
    pub network: String,
    /// Stable in-network alias.
    pub alias: String,
    pub labels: HashMap<String, String>,
    /// Host address published ports are bound on.
    pub bind_address: String,
}

/// Result of a one-shot command run inside a container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// HTTP reachability check against a published port.
#[async_trait]
pub trait HttpProbe: Send + Sync {
    /// Issue a GET and return the response status code.
    async fn http_status(&self, url: &str) -> Result<u16, RuntimeError>;
}

/// Container lifecycle operations used by the stack.
#[async_trait]
pub trait ContainerRuntime: HttpProbe {
    /// Create an isolated network and return its id.
    async fn create_network(
        &self,
        name: &str,
        labels: &HashMap<String, String>,
    ) -> Result<String, RuntimeError>;

    async fn remove_network(&self, id: &str) -> Result<(), RuntimeError>;

    /// Make sure the image is available locally, pulling it if needed.
    async fn ensure_image(&self, image: &str) -> Result<(), RuntimeError>;

    /// Create (but do not start) a container and return its id.
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, RuntimeError>;

    /// Write `content` to `path` inside a created container.
    async fn copy_to_container(
        &self,
        id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), RuntimeError>;

    async fn start_container(&self, id: &str) -> Result<(), RuntimeError>;

    /// Host port bound to `container_port`, if any.
    async fn host_port(&self, id: &str, container_port: u16) -> Result<Option<u16>, RuntimeError>;

    async fn is_running(&self, id: &str) -> Result<bool, RuntimeError>;

    /// Run `argv` inside a running container and collect its output.
    async fn exec(&self, id: &str, argv: &[String]) -> Result<ExecOutput, RuntimeError>;

    /// Follow the combined stdout/stderr stream of a container from the start.
    /// The stream ends when the container exits.
    fn follow_logs(&self, id: &str) -> BoxStream<'static, Result<String, RuntimeError>>;

    /// Stop a container, killing it once `grace` elapses.
    async fn stop_container(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    async fn remove_container(&self, id: &str) -> Result<(), RuntimeError>;
}
