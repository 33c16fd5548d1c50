//! User-controlled offline mode.
//!
//! The switch is never flipped by network errors. Only the explicit setters
//! change it, and every sync operation reads it before deciding whether to
//! call the backend.

use crate::store::LocalStore;
use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectivityState {
    Online,
    Offline,
}

impl fmt::Display for ConnectivityState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectivityState::Online => f.write_str("online"),
            ConnectivityState::Offline => f.write_str("offline"),
        }
    }
}

/// Shared offline flag. Clones observe the same state.
#[derive(Debug, Clone, Default)]
pub struct OfflineSwitch {
    offline: Arc<AtomicBool>,
}

impl OfflineSwitch {
    pub fn new(offline: bool) -> Self {
        Self {
            offline: Arc::new(AtomicBool::new(offline)),
        }
    }

    /// Restore the persisted flag from the local store.
    pub async fn restore(store: &LocalStore) -> Self {
        Self::new(store.offline_flag().await)
    }

    pub fn is_offline(&self) -> bool {
        self.offline.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> ConnectivityState {
        if self.is_offline() {
            ConnectivityState::Offline
        } else {
            ConnectivityState::Online
        }
    }

    pub fn set_offline(&self) {
        self.offline.store(true, Ordering::SeqCst);
    }

    pub fn set_online(&self) {
        self.offline.store(false, Ordering::SeqCst);
    }

    /// Flip the flag and return the new state.
    pub fn toggle(&self) -> ConnectivityState {
        self.offline.fetch_xor(true, Ordering::SeqCst);
        self.state()
    }

    /// Write the current state back so the next process starts the same way.
    pub async fn persist(&self, store: &LocalStore) -> Result<()> {
        let offline = self.is_offline();
        store.set_offline_flag(offline).await?;
        info!(state = %self.state(), "offline mode saved");
        Ok(())
    }
}
