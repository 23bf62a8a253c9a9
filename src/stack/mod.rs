//! The three-service stack: topology, lifecycle and teardown.

mod controller;
pub mod services;
mod shared;
mod state;

pub use controller::{StackController, StackControllerBuilder, StackEndpoints};
pub use services::StackNames;
pub use shared::SharedStack;
pub use state::{LifecycleState, Service, Stage};
