//! Core logic for the cagent container lifecycle engine
//!
//! This crate provides:
//! - The per-container state machine (pull, create, run, monitor, terminate)
//! - The manager owning every live container, with reattachment after restarts
//! - A ring cache of recent exits so late signals still get an answer
//! - Lifecycle events and the publisher they flow through

mod container;
mod error;
mod event;
pub mod launch;
mod manager;
mod recent;

pub use container::*;
pub use error::*;
pub use event::*;
pub use manager::*;
pub use recent::*;

#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
