//! What every tab of one application shares.
//!
//! An [`Origin`] plays the role the browser plays for same-origin tabs: it
//! owns the durable storage area, a broadcast channel every tab can post to,
//! and the change feed fired when one tab modifies durable storage. Both
//! travel on one channel, so every tab sees them in the order they happened.
//! A tab skips the events it caused itself.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{trace, warn};

use super::credentials::CredentialSet;
use super::storage::{MemoryStorage, Storage};
use crate::config::Config;

/// Capacity of the event channel.
/// Receivers that fall further behind than this resync from durable storage.
const CHANNEL_CAPACITY: usize = 64;

/// Identifies one tab (one `SessionStore`) within an origin.
pub type TabId = u64;

/// Message posted on the origin's broadcast channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SyncMessage {
    Set { value: CredentialSet },
    Clear,
}

/// Fired to other tabs when the durable storage area changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    pub key: String,
    /// New serialized value, `None` when the key was removed.
    pub new_value: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) enum OriginEvent {
    Message(SyncMessage),
    Storage(StorageEvent),
}

#[derive(Debug, Clone)]
pub(crate) struct Envelope {
    pub from: TabId,
    pub event: OriginEvent,
}

struct OriginInner {
    durable: Option<Arc<dyn Storage>>,
    events: broadcast::Sender<Envelope>,
    next_tab: AtomicU64,
}

/// Shared context for all tabs of one application. Clone is cheap.
#[derive(Clone)]
pub struct Origin {
    inner: Arc<OriginInner>,
}

impl Origin {
    /// Create an origin over `durable`. `None` means durable storage is
    /// unavailable and only the broadcast channel connects tabs.
    pub fn new(durable: Option<Arc<dyn Storage>>) -> Self {
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            inner: Arc::new(OriginInner {
                durable,
                events,
                next_tab: AtomicU64::new(1),
            }),
        }
    }

    /// Origin whose durable area lives in process memory.
    pub fn in_memory() -> Self {
        Self::new(Some(Arc::new(MemoryStorage::new())))
    }

    /// Origin over the durable backend `config` selects. A backend that
    /// cannot be set up leaves the origin without durable storage.
    pub fn from_config(config: &Config) -> Self {
        match config.durable_storage() {
            Ok(storage) => Self::new(Some(storage)),
            Err(e) => {
                warn!(error = %e, "Durable storage unavailable, sessions will not survive restarts");
                Self::new(None)
            }
        }
    }

    pub fn has_durable_storage(&self) -> bool {
        self.inner.durable.is_some()
    }

    pub(crate) fn register_tab(&self) -> TabId {
        self.inner.next_tab.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn post_message(&self, from: TabId, message: SyncMessage) {
        self.send(from, OriginEvent::Message(message));
    }

    pub(crate) fn events(&self) -> broadcast::Receiver<Envelope> {
        self.inner.events.subscribe()
    }

    fn send(&self, from: TabId, event: OriginEvent) {
        // No receivers just means no other tab is open
        let _ = self.inner.events.send(Envelope { from, event });
    }

    pub(crate) fn durable_get(&self, key: &str) -> Result<Option<String>> {
        match self.inner.durable {
            Some(ref storage) => storage.get(key),
            None => Ok(None),
        }
    }

    pub(crate) fn durable_set(&self, from: TabId, key: &str, value: &str) -> Result<()> {
        let Some(ref storage) = self.inner.durable else {
            anyhow::bail!("Durable storage is unavailable");
        };
        let previous = storage.get(key).ok().flatten();
        storage.set(key, value)?;
        if previous.as_deref() != Some(value) {
            self.fire_storage_event(from, key, Some(value.to_string()));
        }
        Ok(())
    }

    pub(crate) fn durable_remove(&self, from: TabId, key: &str) -> Result<()> {
        let Some(ref storage) = self.inner.durable else {
            return Ok(());
        };
        let previous = storage.get(key).ok().flatten();
        storage.remove(key)?;
        if previous.is_some() {
            self.fire_storage_event(from, key, None);
        }
        Ok(())
    }

    fn fire_storage_event(&self, from: TabId, key: &str, new_value: Option<String>) {
        trace!(tab = from, key, removed = new_value.is_none(), "Durable storage changed");
        self.send(
            from,
            OriginEvent::Storage(StorageEvent {
                key: key.to_string(),
                new_value,
            }),
        );
    }
}

// ============================================================================
// Tests
// ============================================================================
