//! Environment-driven configuration for the stack.
//!
//! Values are read from `ICESTACK_*` variables, with a `.env` file in the
//! working directory loaded first when present.

pub(crate) mod helpers;
mod stack;

pub use stack::{DEFAULT_CATALOG_IMAGE, DEFAULT_QUERY_ENGINE_IMAGE, DEFAULT_STORAGE_IMAGE, StackConfig};
