//! Shared application state for the API server.

use std::sync::Arc;

use stash::engine::Engine;
use stash::io::store::HistoryStore;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Durable history; also the source of live events.
    pub store: Arc<HistoryStore>,
    pub engine: Arc<Engine>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>) -> Self {
        Self {
            store: Arc::clone(engine.store()),
            engine,
        }
    }
}
