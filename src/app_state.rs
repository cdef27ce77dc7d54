//! Shared application state injected into all Axum handlers.

use std::sync::Arc;

use crate::server::SessionRegistry;
use crate::storage::Storage;

/// Shared application state available to all handlers via Axum's
/// `State` extractor.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Session registry owning every rover link.
    pub registry: Arc<SessionRegistry>,
    /// Record storage, shared with the registry.
    pub storage: Arc<dyn Storage>,
    /// Capacity of each new link's outbound queue.
    pub outbound_queue_capacity: usize,
}

impl AppState {
    /// Builds the state around `storage`, creating a fresh registry.
    #[must_use]
    pub fn new(storage: Arc<dyn Storage>, outbound_queue_capacity: usize) -> Self {
        Self {
            registry: Arc::new(SessionRegistry::new(Arc::clone(&storage))),
            storage,
            outbound_queue_capacity,
        }
    }
}
