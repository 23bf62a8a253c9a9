//! Per-stack isolated bridge network.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::StackError;
use crate::runtime::ContainerRuntime;

/// The private network the stack's services resolve each other on.
///
/// Created once before any container and removed after all of them.
pub struct NetworkHandle {
    name: String,
    labels: HashMap<String, String>,
    runtime: Arc<dyn ContainerRuntime>,
    id: RwLock<Option<String>>,
}

impl NetworkHandle {
    pub fn new(
        name: impl Into<String>,
        labels: HashMap<String, String>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        Self {
            name: name.into(),
            labels,
            runtime,
            id: RwLock::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn id(&self) -> Option<String> {
        self.id.read().await.clone()
    }

    pub async fn create(&self) -> Result<(), StackError> {
        let mut id = self.id.write().await;
        if id.is_some() {
            return Ok(());
        }

        let created = self
            .runtime
            .create_network(&self.name, &self.labels)
            .await
            .map_err(|e| StackError::NetworkCreation {
                name: self.name.clone(),
                reason: e.to_string(),
            })?;
        tracing::info!(network = %self.name, id = %created, "Created network");
        *id = Some(created);
        Ok(())
    }

    /// Remove the network. Idempotent; failures are logged, not returned.
    pub async fn dispose(&self) {
        let Some(id) = self.id.write().await.take() else {
            return;
        };

        match self.runtime.remove_network(&id).await {
            Ok(()) => tracing::info!(network = %self.name, "Removed network"),
            Err(e) if e.is_not_found() => {
                tracing::debug!(network = %self.name, "Network already gone")
            }
            Err(e) => tracing::warn!(network = %self.name, "Failed to remove network: {}", e),
        }
    }
}
