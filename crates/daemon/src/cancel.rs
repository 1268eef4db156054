//! Cancellation handles for running pipelines and prefetches.

use crate::jobs::JobId;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio_util::sync::CancellationToken;

/// Why a pipeline was cancelled. Operator cancels are terminal, stuck ones are retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    Operator,
    Stuck,
}

#[derive(Debug, Clone)]
struct Entry {
    token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

/// A registered token plus the reason it was cancelled with.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    pub token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
}

impl CancelHandle {
    pub fn reason(&self) -> Option<CancelReason> {
        *lock(&self.reason)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Tokens keyed by job id. One registry for pipelines, one for prefetches.
#[derive(Debug, Clone, Default)]
pub struct CancelRegistry {
    entries: Arc<Mutex<HashMap<JobId, Entry>>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh token for `job_id`, replacing any previous one.
    pub fn register(&self, job_id: &str) -> CancelHandle {
        let entry = Entry {
            token: CancellationToken::new(),
            reason: Arc::new(Mutex::new(None)),
        };
        let handle = CancelHandle {
            token: entry.token.clone(),
            reason: entry.reason.clone(),
        };
        lock(&self.entries).insert(job_id.to_string(), entry);
        handle
    }

    /// Cancel the job's token. Returns false when nothing is registered.
    pub fn cancel(&self, job_id: &str, reason: CancelReason) -> bool {
        let entries = lock(&self.entries);
        match entries.get(job_id) {
            Some(entry) => {
                lock(&entry.reason).get_or_insert(reason);
                entry.token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, job_id: &str) -> bool {
        lock(&self.entries).contains_key(job_id)
    }

    pub fn remove(&self, job_id: &str) {
        lock(&self.entries).remove(job_id);
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        lock(&self.entries).keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn cancel_all(&self, reason: CancelReason) {
        for entry in lock(&self.entries).values() {
            lock(&entry.reason).get_or_insert(reason);
            entry.token.cancel();
        }
    }
}
