//! Library half of the `cagent` binary, exposed for integration tests

pub mod commands;
