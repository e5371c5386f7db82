pub mod api;
pub mod auth;
pub mod recovery;
pub mod shutdown;
pub mod webhook;

use std::sync::Arc;

use deadpool_postgres::Pool;

use finlock_engine::runner::SweepRunner;
use finlock_engine::Engine;

/// Shared application state
pub struct AppState {
    pub engine: Arc<Engine>,
    pub runner: Arc<SweepRunner>,
    /// Registry the engine metrics were registered into, served at /metrics
    pub registry: prometheus::Registry,
    /// None when running on the in-memory store
    pub pool: Option<Pool>,
    pub api_token: String,
    pub webhook_secret: String,
}
