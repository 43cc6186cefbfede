//! foreman — leaderful cluster membership for a fleet of producer
//! processes.
//!
//! Each process is a peer; at steady state the cluster has exactly one
//! master and any number of slaves.  Peers discover one another through
//! a shared relational store, elect a master by racing for a unique row,
//! and keep liveness with periodic HTTP probes.  When the master dies, a
//! slave supersedes it deterministically; when it leaves gracefully, it
//! hands over to a designated successor and re-parents the rest.

use std::sync::Arc;

pub mod config;
pub mod envelope;
pub mod errors;
pub mod handlers;
pub mod netutil;
pub mod pool;
pub mod rpc;
pub mod server;
pub mod store;

use crate::config::Config;
use crate::pool::Pool;

/// Shared application state passed to all handlers via
/// `axum::extract::State`.
pub struct AppState {
    /// Server configuration.
    pub config: Config,
    /// The membership pool, absent when identity is 0.
    pub pool: Option<Arc<Pool>>,
}

impl AppState {
    /// The pool handle, when the membership core is enabled.
    pub fn pool(&self) -> Option<Arc<Pool>> {
        self.pool.clone()
    }
}
