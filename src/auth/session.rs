//! The per-tab session store.
//!
//! Holds the credential set this tab believes is valid, persists it to the
//! active tier, and keeps other tabs of the same [`Origin`] in step. Remote
//! changes arrive through two signals (broadcast messages and durable storage
//! events) that both end in [`StoreInner::apply_remote`]. Applying a remote
//! change never writes storage back, otherwise tabs would echo each other.
//!
//! Every change (local or remote) runs under one write gate, from storage
//! through broadcast to the last subscriber call. The final notification
//! therefore always matches `read()`, storage and what other tabs were told.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::credentials::{CredentialSet, StorageTier};
use super::origin::{Envelope, Origin, OriginEvent, StorageEvent, SyncMessage, TabId};
use super::storage::{MemoryStorage, Storage};
use crate::config::Config;

/// Storage key the credential set is persisted under.
pub const DEFAULT_STORAGE_KEY: &str = "auth";

type Subscriber = Arc<dyn Fn(Option<&CredentialSet>) + Send + Sync>;

#[derive(Default)]
struct SessionState {
    current: Option<CredentialSet>,
    /// Active tier, or the preference recorded for the next write.
    tier: Option<StorageTier>,
}

enum RemoteUpdate {
    Set(CredentialSet),
    Clear,
    /// A channel overflowed; reload from durable storage.
    Resync,
}

struct StoreInner {
    tab: TabId,
    key: String,
    origin: Origin,
    ephemeral: Option<Arc<dyn Storage>>,
    /// Serializes whole changes. Reentrant so subscribers may call back in.
    write_gate: ReentrantMutex<()>,
    state: Mutex<SessionState>,
    subscribers: Mutex<Vec<(u64, Subscriber)>>,
    next_subscriber: AtomicU64,
    // Dropping the store drops this sender, which stops the listener task
    _shutdown: oneshot::Sender<()>,
}

/// Session store for one tab. Clone is cheap and clones share state.
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    /// Open a tab on `origin` with a fresh ephemeral area and the default key.
    pub fn open(origin: &Origin) -> Self {
        Self::open_with(
            origin,
            Some(Arc::new(MemoryStorage::new())),
            DEFAULT_STORAGE_KEY,
        )
    }

    /// Open a tab with an explicit ephemeral area (`None` when unavailable)
    /// and storage key.
    ///
    /// Cross-tab listening needs a Tokio runtime; outside one the store still
    /// works but only sees its own changes.
    pub fn open_with(
        origin: &Origin,
        ephemeral: Option<Arc<dyn Storage>>,
        key: impl Into<String>,
    ) -> Self {
        let key = key.into();
        let tab = origin.register_tab();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let state = load_initial(origin, ephemeral.as_deref(), &key);
        debug!(
            tab,
            has_credentials = state.current.is_some(),
            tier = ?state.tier,
            "Session store opened"
        );

        let inner = Arc::new(StoreInner {
            tab,
            key,
            origin: origin.clone(),
            ephemeral,
            write_gate: ReentrantMutex::new(()),
            state: Mutex::new(state),
            subscribers: Mutex::new(Vec::new()),
            next_subscriber: AtomicU64::new(1),
            _shutdown: shutdown_tx,
        });
        spawn_listener(&inner, shutdown_rx);

        Self { inner }
    }

    /// Open a tab using the storage key from `config`.
    pub fn open_configured(origin: &Origin, config: &Config) -> Self {
        Self::open_with(
            origin,
            Some(Arc::new(MemoryStorage::new())),
            config.storage_key.clone(),
        )
    }

    pub fn tab_id(&self) -> TabId {
        self.inner.tab
    }

    /// Snapshot of the current credential set.
    pub fn read(&self) -> Option<CredentialSet> {
        self.inner.state.lock().current.clone()
    }

    pub fn active_tier(&self) -> Option<StorageTier> {
        self.inner.state.lock().tier
    }

    pub fn is_authenticated(&self) -> bool {
        self.inner.state.lock().current.is_some()
    }

    /// Replace the credential set and persist it to `tier` (default: the
    /// active tier, else ephemeral). Other tabs are told and local
    /// subscribers are notified before this returns.
    pub fn write(&self, creds: CredentialSet, tier: Option<StorageTier>) {
        let inner = &self.inner;
        let _gate = inner.write_gate.lock();
        {
            let mut state = inner.state.lock();
            let tier = tier.or(state.tier).unwrap_or(StorageTier::Ephemeral);
            state.current = Some(creds.clone());
            state.tier = Some(tier);
            inner.persist(tier, &creds);
        }
        inner.origin.post_message(
            inner.tab,
            SyncMessage::Set {
                value: creds.clone(),
            },
        );
        inner.notify(Some(&creds));
    }

    /// Move the held credential set to `tier`, or remember `tier` for the
    /// next write when nothing is held.
    pub fn set_tier_preference(&self, tier: StorageTier) {
        let _gate = self.inner.write_gate.lock();
        let current = {
            let mut state = self.inner.state.lock();
            state.tier = Some(tier);
            state.current.clone()
        };
        if let Some(creds) = current {
            debug!(tab = self.inner.tab, ?tier, "Migrating credentials to new tier");
            self.write(creds, Some(tier));
        }
    }

    /// Forget the credential set everywhere.
    pub fn clear(&self) {
        let inner = &self.inner;
        let _gate = inner.write_gate.lock();
        {
            let mut state = inner.state.lock();
            state.current = None;
            state.tier = None;
            inner.remove_from(StorageTier::Durable);
            inner.remove_from(StorageTier::Ephemeral);
        }
        inner.origin.post_message(inner.tab, SyncMessage::Clear);
        inner.notify(None);
    }

    /// Register `f` for future changes. The returned handle removes it.
    ///
    /// Callbacks run on the thread that made the change, one change at a
    /// time. They may call back into the store.
    pub fn subscribe<F>(&self, f: F) -> Subscription
    where
        F: Fn(Option<&CredentialSet>) + Send + Sync + 'static,
    {
        let id = self.inner.next_subscriber.fetch_add(1, Ordering::Relaxed);
        self.inner.subscribers.lock().push((id, Arc::new(f)));
        Subscription {
            id,
            store: Arc::downgrade(&self.inner),
            active: AtomicBool::new(true),
        }
    }
}

/// Handle returned by [`SessionStore::subscribe`].
///
/// Dropping the handle does not unsubscribe; call [`Subscription::unsubscribe`].
#[must_use = "dropping the handle keeps the callback registered"]
pub struct Subscription {
    id: u64,
    store: Weak<StoreInner>,
    active: AtomicBool,
}

impl Subscription {
    /// Remove the callback. Later calls do nothing.
    pub fn unsubscribe(&self) {
        if !self.active.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(store) = self.store.upgrade() {
            store.subscribers.lock().retain(|(id, _)| *id != self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl StoreInner {
    fn notify(&self, creds: Option<&CredentialSet>) {
        // Call outside the lock so subscribers may (un)subscribe
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .iter()
            .map(|(_, f)| Arc::clone(f))
            .collect();
        for subscriber in subscribers {
            subscriber(creds);
        }
    }

    /// Write to `tier` and drop the stale copy from the other tier.
    fn persist(&self, tier: StorageTier, creds: &CredentialSet) {
        let raw = match serde_json::to_string(creds) {
            Ok(raw) => raw,
            Err(e) => {
                warn!(error = %e, "Failed to serialize credentials, keeping them in memory only");
                return;
            }
        };
        let result = match tier {
            StorageTier::Durable => self.origin.durable_set(self.tab, &self.key, &raw),
            StorageTier::Ephemeral => match self.ephemeral {
                Some(ref storage) => storage.set(&self.key, &raw),
                None => Err(anyhow::anyhow!("Ephemeral storage is unavailable")),
            },
        };
        if let Err(e) = result {
            warn!(?tier, error = %e, "Failed to persist credentials, keeping them in memory only");
        }
        self.remove_from(tier.other());
    }

    fn remove_from(&self, tier: StorageTier) {
        let result = match tier {
            StorageTier::Durable => self.origin.durable_remove(self.tab, &self.key),
            StorageTier::Ephemeral => match self.ephemeral {
                Some(ref storage) => storage.remove(&self.key),
                None => Ok(()),
            },
        };
        if let Err(e) = result {
            warn!(?tier, error = %e, "Failed to remove stored credentials");
        }
    }

    /// Adopt a change made by another tab. Memory and subscribers only.
    fn apply_remote(&self, update: RemoteUpdate) {
        let _gate = self.write_gate.lock();
        let update = match update {
            RemoteUpdate::Resync => match read_tier(
                self.origin.durable_get(&self.key),
                StorageTier::Durable,
            ) {
                Some(creds) => RemoteUpdate::Set(creds),
                None => return,
            },
            other => other,
        };

        let changed = {
            let mut state = self.state.lock();
            match update {
                RemoteUpdate::Set(creds) => {
                    if state.current.as_ref() == Some(&creds) {
                        None
                    } else {
                        state.current = Some(creds.clone());
                        Some(Some(creds))
                    }
                }
                RemoteUpdate::Clear => {
                    state.tier = None;
                    state.current.take().map(|_| None)
                }
                RemoteUpdate::Resync => None,
            }
        };

        if let Some(creds) = changed {
            debug!(tab = self.tab, cleared = creds.is_none(), "Applied remote session update");
            self.notify(creds.as_ref());
        }
    }
}

impl RemoteUpdate {
    fn from_message(message: SyncMessage) -> Self {
        match message {
            SyncMessage::Set { value } => RemoteUpdate::Set(value),
            SyncMessage::Clear => RemoteUpdate::Clear,
        }
    }

    fn from_storage_event(event: StorageEvent) -> Option<Self> {
        match event.new_value {
            // A tab moving to the ephemeral tier also removes the durable copy;
            // its Set message follows on the same channel and restores the value.
            None => Some(RemoteUpdate::Clear),
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(creds) => Some(RemoteUpdate::Set(creds)),
                Err(e) => {
                    warn!(error = %e, "Ignoring unparseable credentials from storage event");
                    None
                }
            },
        }
    }
}

/// Cold start: durable wins over ephemeral.
fn load_initial(origin: &Origin, ephemeral: Option<&dyn Storage>, key: &str) -> SessionState {
    if let Some(current) = read_tier(origin.durable_get(key), StorageTier::Durable) {
        return SessionState {
            current: Some(current),
            tier: Some(StorageTier::Durable),
        };
    }
    if let Some(storage) = ephemeral {
        if let Some(current) = read_tier(storage.get(key), StorageTier::Ephemeral) {
            return SessionState {
                current: Some(current),
                tier: Some(StorageTier::Ephemeral),
            };
        }
    }
    SessionState::default()
}

fn read_tier(raw: anyhow::Result<Option<String>>, tier: StorageTier) -> Option<CredentialSet> {
    let raw = match raw {
        Ok(raw) => raw?,
        Err(e) => {
            warn!(?tier, error = %e, "Stored credentials unavailable");
            return None;
        }
    };
    match serde_json::from_str(&raw) {
        Ok(creds) => Some(creds),
        Err(e) => {
            warn!(?tier, error = %e, "Ignoring unparseable stored credentials");
            None
        }
    }
}

fn spawn_listener(inner: &Arc<StoreInner>, mut shutdown: oneshot::Receiver<()>) {
    let Ok(runtime) = tokio::runtime::Handle::try_current() else {
        warn!(tab = inner.tab, "No async runtime, cross-tab updates disabled for this tab");
        return;
    };

    let store = Arc::downgrade(inner);
    let tab = inner.tab;
    let key = inner.key.clone();
    let mut events = inner.origin.events();

    runtime.spawn(async move {
        loop {
            let update = tokio::select! {
                _ = &mut shutdown => break,
                received = events.recv() => match received {
                    Ok(Envelope { from, .. }) if from == tab => continue,
                    Ok(Envelope { event: OriginEvent::Message(message), .. }) => {
                        RemoteUpdate::from_message(message)
                    }
                    Ok(Envelope { event: OriginEvent::Storage(event), .. }) => {
                        if event.key != key {
                            continue;
                        }
                        match RemoteUpdate::from_storage_event(event) {
                            Some(update) => update,
                            None => continue,
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(tab, skipped, "Session events lagged, resyncing");
                        RemoteUpdate::Resync
                    }
                    Err(RecvError::Closed) => break,
                },
            };

            let Some(inner) = store.upgrade() else { break };
            inner.apply_remote(update);
        }
        debug!(tab, "Session listener stopped");
    });
}

// ============================================================================
// Tests
// ============================================================================
