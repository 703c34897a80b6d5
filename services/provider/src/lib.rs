//! Computing provider agent.
//!
//! The crate ships the `computing-provider` binary. The library surface
//! exists so integration tests can drive the router against in-memory
//! collaborators.

pub mod api;
pub mod chain;
pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod model;
pub mod pipeline;
pub mod proof;
pub mod reporter;
pub mod reward;
pub mod state;
pub mod store;
pub mod units;
