//! Admission Control
//!
//! Bounds the number of concurrently active sessions. Each admitted session
//! holds a [`SessionSlot`]; dropping it frees the slot and decrements the
//! active-session count.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::config::AdmissionPolicy;
use crate::error::RelayError;

#[derive(Debug, Default)]
struct Counters {
    active: AtomicUsize,
    peak: AtomicUsize,
    admitted: AtomicUsize,
    rejected: AtomicUsize,
}

/// Session limit shared by the accept loop and every session
#[derive(Debug)]
pub struct Admission {
    limit: Option<usize>,
    policy: AdmissionPolicy,
    semaphore: Option<Arc<Semaphore>>,
    counters: Arc<Counters>,
}

/// Snapshot of admission statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AdmissionStats {
    pub active_sessions: usize,
    pub peak_sessions: usize,
    pub total_admitted: usize,
    pub total_rejected: usize,
    pub limit: Option<usize>,
}

impl Admission {
    /// `limit` of `None` admits everything
    pub fn new(limit: Option<usize>, policy: AdmissionPolicy) -> Self {
        Self {
            limit,
            policy,
            semaphore: limit.map(|n| Arc::new(Semaphore::new(n))),
            counters: Arc::new(Counters::default()),
        }
    }

    pub fn policy(&self) -> AdmissionPolicy {
        self.policy
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Whether the accept loop must wait for a slot before accepting
    pub fn blocks_accept(&self) -> bool {
        self.limit.is_some() && self.policy == AdmissionPolicy::Block
    }

    /// Wait until a slot is free
    pub async fn acquire(&self) -> Result<SessionSlot, RelayError> {
        let permit = match &self.semaphore {
            Some(semaphore) => Some(
                Arc::clone(semaphore)
                    .acquire_owned()
                    .await
                    .map_err(|_| self.rejected())?,
            ),
            None => None,
        };
        Ok(self.admit(permit))
    }

    /// Take a slot only if one is free right now
    pub fn try_acquire(&self) -> Result<SessionSlot, RelayError> {
        let permit = match &self.semaphore {
            Some(semaphore) => Some(
                Arc::clone(semaphore)
                    .try_acquire_owned()
                    .map_err(|_| self.rejected())?,
            ),
            None => None,
        };
        Ok(self.admit(permit))
    }

    /// Number of sessions currently holding a slot
    pub fn active_sessions(&self) -> usize {
        self.counters.active.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> AdmissionStats {
        AdmissionStats {
            active_sessions: self.active_sessions(),
            peak_sessions: self.counters.peak.load(Ordering::Relaxed),
            total_admitted: self.counters.admitted.load(Ordering::Relaxed),
            total_rejected: self.counters.rejected.load(Ordering::Relaxed),
            limit: self.limit,
        }
    }

    fn admit(&self, permit: Option<OwnedSemaphorePermit>) -> SessionSlot {
        let active = self.counters.active.fetch_add(1, Ordering::Relaxed) + 1;
        self.counters.admitted.fetch_add(1, Ordering::Relaxed);
        self.counters.peak.fetch_max(active, Ordering::Relaxed);
        debug!("Acquired session slot, active sessions: {}", active);

        SessionSlot {
            _permit: permit,
            counters: Arc::clone(&self.counters),
        }
    }

    fn rejected(&self) -> RelayError {
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        let limit = self.limit.unwrap_or_default();
        warn!("Session limit reached ({}), rejecting connection", limit);
        RelayError::CapacityExceeded { limit }
    }
}

/// Session slot that is released when dropped
#[derive(Debug)]
pub struct SessionSlot {
    _permit: Option<OwnedSemaphorePermit>,
    counters: Arc<Counters>,
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        let remaining = self.counters.active.fetch_sub(1, Ordering::Relaxed) - 1;
        debug!("Released session slot, active sessions: {}", remaining);
    }
}
