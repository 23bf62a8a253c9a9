//! Managed service containers.
//!
//! A [`ContainerDescriptor`] is the immutable recipe for one service; a
//! [`ContainerHandle`] owns the running process created from it. Readiness is
//! decided by a [`WaitStrategy`]:
//!
//! ```text
//!   start(cancel)
//!        │
//!        ▼
//!   ┌────────────┐   ┌────────────┐   ┌────────────┐   ┌──────────────┐
//!   │ Pull image │──▶│ Create     │──▶│ Copy       │──▶│ Start        │
//!   │ (if absent)│   │ container  │   │ resources  │   │ process      │
//!   └────────────┘   └────────────┘   └────────────┘   └──────────────┘
//!                                                              │
//!                                                              ▼
//!                                     ┌──────────────┐   ┌──────────────┐
//!                                     │ WaitStrategy │◀──│ Resolve host │
//!                                     │ (HTTP / log) │   │ ports        │
//!                                     └──────────────┘   └──────────────┘
//! ```

mod descriptor;
mod handle;
pub mod wait;

pub use descriptor::{ContainerDescriptor, ResourceMapping};
pub use handle::{ContainerHandle, ContainerState, HandleOptions};
pub use wait::{ReadyCondition, WaitStrategy};
