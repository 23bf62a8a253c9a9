//! Disposable query engine + catalog + object storage stack for integration
//! tests.
//!
//! A [`StackController`] creates an isolated network, starts object storage
//! and the metadata catalog together, then bootstraps the warehouse bucket
//! while the query engine starts, and finally applies SQL fixtures. Endpoints
//! are resolved from the live containers after start. Disposal removes
//! everything in reverse order and never fails.
//!
//! ```rust,no_run
//! use icestack::{StackConfig, StackController};
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run() -> Result<(), icestack::error::StackError> {
//! let stack = StackController::connect(StackConfig::resolve()?).await?;
//! let started = stack.start(&CancellationToken::new()).await;
//! if started.is_ok() {
//!     let mut conn = stack.connection().await?;
//!     let result = conn.execute("SELECT 1").await?;
//!     assert_eq!(result.scalar_i64(), Some(1));
//! }
//! stack.dispose().await;
//! started
//! # }
//! ```

pub mod config;
pub mod container;
pub mod error;
pub mod fixtures;
pub mod network;
pub mod query;
pub mod runtime;
pub mod stack;
pub mod testing;

pub use config::StackConfig;
pub use error::{ContainerError, StackError};
pub use stack::{LifecycleState, SharedStack, StackController, StackEndpoints};
