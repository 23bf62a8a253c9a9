use std::collections::HashMap;

use crate::container::WaitStrategy;
use crate::runtime::ContainerSpec;

/// Bytes written to a path inside the container before its process starts.
#[derive(Clone, PartialEq, Eq)]
pub struct ResourceMapping {
    pub path: String,
    pub content: Vec<u8>,
}

impl std::fmt::Debug for ResourceMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Content may hold credentials.
        f.debug_struct("ResourceMapping")
            .field("path", &self.path)
            .field("len", &self.content.len())
            .finish()
    }
}

/// Immutable description of one managed service.
#[derive(Debug, Clone)]
pub struct ContainerDescriptor {
    /// Generated unique container name.
    pub name: String,
    pub image: String,
    /// Network the container joins.
    pub network: String,
    /// Stable in-network alias other services use to reach it.
    pub alias: String,
    /// Container-internal ports, each published on an ephemeral host port.
    pub ports: Vec<u16>,
    pub env: Vec<(String, String)>,
    pub cmd: Option<Vec<String>>,
    pub wait: WaitStrategy,
    pub resources: Vec<ResourceMapping>,
    pub labels: HashMap<String, String>,
}

impl ContainerDescriptor {
    pub fn new(
        name: impl Into<String>,
        image: impl Into<String>,
        network: impl Into<String>,
        alias: impl Into<String>,
        wait: WaitStrategy,
    ) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            network: network.into(),
            alias: alias.into(),
            ports: Vec::new(),
            env: Vec::new(),
            cmd: None,
            wait,
            resources: Vec::new(),
            labels: HashMap::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        if !self.ports.contains(&port) {
            self.ports.push(port);
        }
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_cmd<I, S>(mut self, cmd: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cmd = Some(cmd.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_resource(mut self, path: impl Into<String>, content: impl Into<Vec<u8>>) -> Self {
        self.resources.push(ResourceMapping {
            path: path.into(),
            content: content.into(),
        });
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Runtime-level creation request for this descriptor.
    pub fn to_spec(&self, bind_address: &str) -> ContainerSpec {
        ContainerSpec {
            name: self.name.clone(),
            image: self.image.clone(),
            env: self.env.clone(),
            cmd: self.cmd.clone(),
            exposed_ports: self.ports.clone(),
            network: self.network.clone(),
            alias: self.alias.clone(),
            labels: self.labels.clone(),
            bind_address: bind_address.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_deduplicates_ports() {
        let descriptor = ContainerDescriptor::new(
            "icestack-abc-minio",
            "minio/minio:latest",
            "icestack-abc",
            "minio",
            WaitStrategy::http("/minio/health/ready", 9000),
        )
        .with_port(9000)
        .with_port(9001)
        .with_port(9000)
        .with_env("MINIO_ROOT_USER", "admin")
        .with_cmd(["server", "/data"]);

        assert_eq!(descriptor.ports, vec![9000, 9001]);
        assert_eq!(
            descriptor.cmd,
            Some(vec!["server".to_string(), "/data".to_string()])
        );

        let spec = descriptor.to_spec("127.0.0.1");
        assert_eq!(spec.exposed_ports, vec![9000, 9001]);
        assert_eq!(spec.alias, "minio");
        assert_eq!(spec.network, "icestack-abc");
        assert_eq!(spec.bind_address, "127.0.0.1");
    }

    #[test]
    fn test_resource_debug_hides_content() {
        let descriptor = ContainerDescriptor::new("n", "i", "net", "a", WaitStrategy::log_line("up"))
            .with_resource("/etc/app.properties", "secret=hunter2");
        let debug = format!("{:?}", descriptor.resources[0]);
        assert!(debug.contains("/etc/app.properties"));
        assert!(!debug.contains("hunter2"));
    }
}
