//! Single-flight bookkeeping for credential refresh.
//!
//! One flag plus a FIFO of waiters. A waiter is a oneshot sender that is
//! completed with the cycle's outcome: all waiters of one cycle get the same
//! result. The queue is only non-empty while the flag is set, and both are
//! reset together under one lock when the cycle ends.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::error::ApiError;
use crate::auth::{CredentialSet, SessionStore};

pub(crate) type RefreshOutcome = Result<CredentialSet, ApiError>;

#[derive(Default)]
pub(crate) struct PendingRefresh {
    refreshing: bool,
    waiters: VecDeque<oneshot::Sender<RefreshOutcome>>,
}

/// A parked caller.
pub(crate) struct Ticket {
    pub receiver: oneshot::Receiver<RefreshOutcome>,
    /// This caller opened the cycle and must start the refresh.
    pub leads: bool,
}

impl PendingRefresh {
    pub fn is_refreshing(&self) -> bool {
        self.refreshing
    }

    /// Queue a waiter, opening a cycle if none is running.
    pub fn park(&mut self) -> Ticket {
        let (tx, receiver) = oneshot::channel();
        self.waiters.push_back(tx);
        let leads = !self.refreshing;
        self.refreshing = true;
        Ticket { receiver, leads }
    }

    fn finish(&mut self) -> VecDeque<oneshot::Sender<RefreshOutcome>> {
        self.refreshing = false;
        std::mem::take(&mut self.waiters)
    }
}

/// Ends the current cycle when dropped.
///
/// Waiters get the recorded outcome. A cycle that ended without one (the
/// refresh task panicked or was aborted) counts as a terminal failure: the
/// session is cleared and waiters get a terminal unauthorized error.
/// Either way the flag is cleared, so the coordinator cannot stay stuck.
pub(crate) struct CycleGuard<'a> {
    pending: &'a Mutex<PendingRefresh>,
    session: &'a SessionStore,
    outcome: Option<RefreshOutcome>,
}

impl<'a> CycleGuard<'a> {
    pub fn new(pending: &'a Mutex<PendingRefresh>, session: &'a SessionStore) -> Self {
        Self {
            pending,
            session,
            outcome: None,
        }
    }

    pub fn complete(mut self, outcome: RefreshOutcome) {
        self.outcome = Some(outcome);
    }
}

impl Drop for CycleGuard<'_> {
    fn drop(&mut self) {
        let outcome = match self.outcome.take() {
            Some(outcome) => outcome,
            None => {
                warn!("Refresh ended without an outcome, signing out");
                self.session.clear();
                Err(ApiError::session_expired())
            }
        };
        let waiters = self.pending.lock().finish();
        debug!(waiters = waiters.len(), success = outcome.is_ok(), "Releasing parked calls");
        for waiter in waiters {
            // A waiter whose caller went away is fine to skip
            let _ = waiter.send(outcome.clone());
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
