//! Configuration for the cagent execution agent
//!
//! This crate handles:
//! - Agent configuration (`~/.config/cagent/config.toml`)
//! - The device inventory the agent advertises to the scheduler

mod agent;
mod device;
mod error;

pub use agent::*;
pub use device::*;
pub use error::*;
