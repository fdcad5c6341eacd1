//! History persistence: load at startup, periodic and final saves.
//!
//! The snapshot is taken under the hub lock; the file write happens after
//! the lock is released so routing never waits on disk.

use canopy_core::{CanopyError, PersistedHistory, Result};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::state::SharedState;

/// Restore saved history into the hub.
///
/// A missing file is a fresh start. A corrupt file is logged and ignored so
/// the hub still comes up.
///
/// Returns the number of restored entries.
pub async fn load(state: &SharedState) -> usize {
    match read_saved(state).await {
        Ok(Some(saved)) => {
            let mut hub = state.hub().await;
            hub.restore(saved);
            hub.history_len()
        }
        Ok(None) => {
            info!(path = %state.store().path().display(), "No saved history, starting fresh");
            0
        }
        Err(e) => {
            warn!(error = %e, code = e.error_code(), "Ignoring unreadable history file");
            0
        }
    }
}

async fn read_saved(state: &SharedState) -> Result<Option<PersistedHistory>> {
    let store = state.store().clone();
    let saved = tokio::task::spawn_blocking(move || store.load())
        .await
        .map_err(|e| CanopyError::PersistenceError(format!("history load task failed: {e}")))??;
    Ok(saved)
}

/// Write the current history to disk.
///
/// # Errors
///
/// Returns [`CanopyError::PersistenceError`] if the file cannot be written.
pub async fn save_now(state: &SharedState) -> Result<()> {
    let doc: PersistedHistory = state.hub().await.to_persisted();
    let entries = doc.history.len();
    let store = state.store().clone();

    tokio::task::spawn_blocking(move || store.save(&doc))
        .await
        .map_err(|e| CanopyError::PersistenceError(format!("history save task failed: {e}")))??;

    debug!(entries, "History saved");
    Ok(())
}

/// Spawn the periodic save loop.
///
/// Saves every `hub.save_interval_secs` until `shutdown` is cancelled.
/// Failures are logged and the loop keeps going.
#[must_use]
pub fn spawn_periodic_save(state: SharedState, shutdown: CancellationToken) -> JoinHandle<()> {
    let period = state.config().save_interval();
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            tokio::select! {
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = save_now(&state).await {
                        error!(error = %e, "Periodic history save failed");
                    }
                }
            }
        }
        debug!("Periodic save stopped");
    })
}
