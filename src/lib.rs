//! Fixture runner - multi-channel manufacturing test fixture orchestrator
//!
//! Drives up to five fixture channels, each a debug probe plus the carrier
//! board holding a group of DUTs. Test functions are dispatched either once
//! for the whole fixture or to every active channel in parallel, joined by a
//! completion barrier before the next step of the cycle.

pub mod channel;
pub mod cli;
pub mod commands;
pub mod common;
pub mod coordinator;
pub mod daemon;
pub mod dispatch;
pub mod hw;
pub mod ipc;
pub mod methods;
pub mod store;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use coordinator::{Coordinator, CoordinatorHandle, CoordinatorState};
pub use ipc::protocol::Command;
