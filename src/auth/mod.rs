//! Authentication module for managing session credentials.
//!
//! This module provides:
//! - `CredentialSet`: the token pair and its expiry
//! - `Storage`: file, keychain and in-memory storage areas
//! - `Origin`: what all tabs of one application share
//! - `SessionStore`: the per-tab store, synchronized across tabs

pub mod credentials;
pub mod origin;
pub mod session;
pub mod storage;

pub use credentials::{CredentialSet, StorageTier};
pub use origin::{Origin, StorageEvent, SyncMessage, TabId};
pub use session::{SessionStore, Subscription, DEFAULT_STORAGE_KEY};
pub use storage::{FileStorage, KeyringStorage, MemoryStorage, Storage};
