// src/rabbitmq/correlation.rs
//
// Correlation ids and the registry of calls waiting for a reply. Each waiter
// owns a write-once slot: the first transition out of `Pending` wins and every
// later write is a no-op, so a reply and a timeout can race safely.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, trace};
use uuid::Uuid;

const DEFAULT_GRACE: Duration = Duration::from_secs(5);

/// Identifier carried in the `correlation_id` property of a request and
/// echoed back on its reply.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CorrelationId(String);

impl CorrelationId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl Borrow<str> for CorrelationId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SlotState {
    Pending,
    Resolved(Vec<u8>),
    TimedOut,
    Cancelled,
}

impl SlotState {
    pub fn is_pending(&self) -> bool {
        matches!(self, SlotState::Pending)
    }
}

/// Outcome of handing a reply to the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// The waiter was pending and now holds the payload.
    Delivered,
    /// The waiter exists but already resolved, timed out or was cancelled.
    AlreadySettled,
    /// No waiter is registered under this id.
    Unknown,
}

impl Resolution {
    pub fn is_delivered(self) -> bool {
        self == Resolution::Delivered
    }
}

/// Read side of a slot. Any number of reads observe the same final state.
#[derive(Debug, Clone)]
pub struct Waiter {
    rx: watch::Receiver<SlotState>,
}

impl Waiter {
    /// Wait until the slot leaves `Pending`. A slot whose registry entry was
    /// dropped while still pending reads as `Cancelled`.
    pub async fn wait(&mut self) -> SlotState {
        self.rx
            .wait_for(|state| !state.is_pending())
            .await
            .map(|state| state.clone())
            .unwrap_or(SlotState::Cancelled)
    }

    pub fn state(&self) -> SlotState {
        self.rx.borrow().clone()
    }
}

struct PendingEntry {
    slot: watch::Sender<SlotState>,
    created_at: Instant,
    deadline: Instant,
}

impl PendingEntry {
    fn settle(&self, next: SlotState) -> bool {
        self.slot.send_if_modified(|state| {
            if state.is_pending() {
                *state = next;
                true
            } else {
                false
            }
        })
    }
}

fn lock_ignore_poison<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    match m.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Pending calls keyed by correlation id.
///
/// The map lives behind a plain mutex; every operation is a short map update
/// and the lock is never held across an await point.
pub struct CorrelationRegistry {
    pending: Mutex<HashMap<CorrelationId, PendingEntry>>,
    grace: Duration,
}

impl Default for CorrelationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CorrelationRegistry {
    pub fn new() -> Self {
        Self::with_grace(DEFAULT_GRACE)
    }

    /// `grace` is how long past its deadline an entry survives before
    /// `purge_expired` reclaims it.
    pub fn with_grace(grace: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            grace,
        }
    }

    /// Mint a fresh id and register a pending waiter for it.
    pub fn register(&self, timeout: Duration) -> (CorrelationId, Waiter) {
        self.purge_expired();

        let now = Instant::now();
        let (slot, rx) = watch::channel(SlotState::Pending);
        let mut pending = lock_ignore_poison(&self.pending);

        let mut id = CorrelationId::generate();
        while pending.contains_key(&id) {
            id = CorrelationId::generate();
        }

        pending.insert(
            id.clone(),
            PendingEntry {
                slot,
                created_at: now,
                deadline: now + timeout,
            },
        );
        trace!(correlation_id = %id, pending = pending.len(), "Registered waiter");

        (id, Waiter { rx })
    }

    /// Hand a reply payload to the waiter registered under `id`.
    pub fn resolve(&self, id: &str, payload: Vec<u8>) -> Resolution {
        let pending = lock_ignore_poison(&self.pending);
        match pending.get(id) {
            None => Resolution::Unknown,
            Some(entry) => {
                if entry.settle(SlotState::Resolved(payload)) {
                    trace!(
                        correlation_id = %id,
                        elapsed_ms = entry.created_at.elapsed().as_millis() as u64,
                        "Waiter resolved"
                    );
                    Resolution::Delivered
                } else {
                    Resolution::AlreadySettled
                }
            }
        }
    }

    /// Mark the waiter timed out. Returns false if it had already left
    /// `Pending`, typically because a reply won the race.
    pub fn time_out(&self, id: &str) -> bool {
        lock_ignore_poison(&self.pending)
            .get(id)
            .is_some_and(|entry| entry.settle(SlotState::TimedOut))
    }

    /// Remove the entry whatever its state. A still-pending waiter reads
    /// `Cancelled` afterwards.
    pub fn forget(&self, id: &str) {
        if let Some(entry) = lock_ignore_poison(&self.pending).remove(id) {
            entry.settle(SlotState::Cancelled);
        }
    }

    /// Drop entries more than `grace` past their deadline, marking any that
    /// never settled as timed out. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let mut pending = lock_ignore_poison(&self.pending);
        let before = pending.len();

        pending.retain(|id, entry| {
            if entry.deadline + self.grace > now {
                return true;
            }
            if entry.settle(SlotState::TimedOut) {
                debug!(correlation_id = %id, "Purged stale waiter");
            }
            false
        });

        before - pending.len()
    }

    pub fn len(&self) -> usize {
        lock_ignore_poison(&self.pending).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, id: &str) -> bool {
        lock_ignore_poison(&self.pending).contains_key(id)
    }
}
