//! Application state shared across handlers.

use std::sync::Arc;

use canopy_core::{ConnectionHub, HistoryStore, HubConfig};
use tokio::sync::{Mutex, MutexGuard};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

/// Alias used by routers and handlers.
pub type SharedState = AppState;

struct AppStateInner {
    hub: Mutex<ConnectionHub>,
    store: HistoryStore,
    config: HubConfig,
}

impl AppState {
    /// Create state for a fresh hub sized from `config`.
    ///
    /// History is persisted to `config.data_file`.
    #[must_use]
    pub fn new(config: HubConfig) -> Self {
        let store = HistoryStore::new(config.data_file.clone());
        Self::with_hub(ConnectionHub::from_config(&config), store, config)
    }

    /// Create state around an existing hub and store.
    #[must_use]
    pub fn with_hub(hub: ConnectionHub, store: HistoryStore, config: HubConfig) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                hub: Mutex::new(hub),
                store,
                config,
            }),
        }
    }

    /// Lock the connection hub.
    ///
    /// Every hub mutation happens under this lock, one message at a time.
    pub async fn hub(&self) -> MutexGuard<'_, ConnectionHub> {
        self.inner.hub.lock().await
    }

    /// History file store.
    #[must_use]
    pub fn store(&self) -> &HistoryStore {
        &self.inner.store
    }

    /// Hub configuration.
    #[must_use]
    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }
}
