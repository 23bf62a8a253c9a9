//! Docker availability detection with platform-specific guidance.
//!
//! Checks whether the `docker` binary is on PATH and whether the daemon
//! answers a ping through [`connect_docker`](super::connect_docker). Tests
//! that need a real daemon use this to skip with an actionable message
//! instead of failing deep inside container creation.

/// Docker daemon availability status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DockerStatus {
    /// Binary found and daemon responding to ping.
    Available,
    /// `docker` binary not found on PATH.
    NotInstalled,
    /// Binary found but daemon not responding.
    NotRunning,
}

impl DockerStatus {
    pub fn is_ok(&self) -> bool {
        matches!(self, DockerStatus::Available)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DockerStatus::Available => "available",
            DockerStatus::NotInstalled => "not installed",
            DockerStatus::NotRunning => "not running",
        }
    }
}

/// Host platform for install guidance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    MacOS,
    Linux,
    Windows,
}

impl Platform {
    pub fn current() -> Self {
        match std::env::consts::OS {
            "macos" => Platform::MacOS,
            "windows" => Platform::Windows,
            _ => Platform::Linux,
        }
    }

    pub fn install_hint(&self) -> &'static str {
        match self {
            Platform::MacOS => {
                "Install Docker Desktop: https://docs.docker.com/desktop/install/mac-install/"
            }
            Platform::Linux => "Install Docker Engine: https://docs.docker.com/engine/install/",
            Platform::Windows => {
                "Install Docker Desktop: https://docs.docker.com/desktop/install/windows-install/"
            }
        }
    }

    pub fn start_hint(&self) -> &'static str {
        match self {
            Platform::MacOS => "Start Docker Desktop from Applications, or run: open -a Docker",
            Platform::Linux => "Start the Docker daemon: sudo systemctl start docker",
            Platform::Windows => "Start Docker Desktop from the Start menu",
        }
    }
}

/// Result of a Docker detection check.
#[derive(Debug, Clone, Copy)]
pub struct DockerDetection {
    pub status: DockerStatus,
    pub platform: Platform,
}

impl DockerDetection {
    /// What the user should do next, if anything.
    pub fn hint(&self) -> Option<&'static str> {
        match self.status {
            DockerStatus::Available => None,
            DockerStatus::NotInstalled => Some(self.platform.install_hint()),
            DockerStatus::NotRunning => Some(self.platform.start_hint()),
        }
    }
}

/// Check whether Docker is installed and running.
pub async fn check_docker() -> DockerDetection {
    let platform = Platform::current();

    if !docker_binary_exists() {
        return DockerDetection {
            status: DockerStatus::NotInstalled,
            platform,
        };
    }

    let status = if super::connect_docker().await.is_ok() {
        DockerStatus::Available
    } else {
        DockerStatus::NotRunning
    };

    DockerDetection { status, platform }
}

fn docker_binary_exists() -> bool {
    let locator = if cfg!(windows) { "where" } else { "which" };
    std::process::Command::new(locator)
        .arg("docker")
        .stdout(std::process::Stdio::null())
        .stderr(std::process::Stdio::null())
        .status()
        .is_ok_and(|s| s.success())
}
