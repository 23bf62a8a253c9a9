//! One stack shared by many tests.

use std::sync::Arc;

use tokio::sync::OnceCell;
use tokio_util::sync::CancellationToken;

use crate::error::StackError;
use crate::stack::{StackController, Stage};

/// A stack started at most once and torn down at most once.
///
/// Construct it explicitly and hand it to the tests that need it (for
/// example behind an `Arc`). The first [`get_or_start`](Self::get_or_start)
/// starts the stack; concurrent callers wait for that same start and all see
/// its outcome. [`teardown`](Self::teardown) cancels a start still in flight,
/// then disposes exactly once.
pub struct SharedStack {
    controller: StackController,
    cancel: CancellationToken,
    started: OnceCell<Result<(), Arc<StackError>>>,
    torn_down: OnceCell<()>,
}

impl SharedStack {
    pub fn new(controller: StackController) -> Self {
        Self {
            controller,
            cancel: CancellationToken::new(),
            started: OnceCell::new(),
            torn_down: OnceCell::new(),
        }
    }

    /// The running stack, starting it on first use.
    pub async fn get_or_start(&self) -> Result<&StackController, Arc<StackError>> {
        if self.torn_down.initialized() {
            return Err(Arc::new(StackError::InvalidState {
                action: "use a shared stack",
                state: self.controller.state().await,
            }));
        }

        self.started
            .get_or_init(|| async {
                self.controller.start(&self.cancel).await.map_err(|e| {
                    tracing::error!("Shared stack failed to start: {}", e);
                    Arc::new(e)
                })
            })
            .await
            .clone()
            .map(|()| &self.controller)
    }

    /// The controller, whether or not it has been started.
    pub fn controller(&self) -> &StackController {
        &self.controller
    }

    pub async fn teardown(&self) {
        self.cancel.cancel();
        // Let a start still in flight observe the cancellation first.
        let _ = self
            .started
            .get_or_init(|| async {
                Err(Arc::new(StackError::Cancelled {
                    stage: Stage::Network,
                }))
            })
            .await;
        self.torn_down
            .get_or_init(|| self.controller.dispose())
            .await;
    }
}
