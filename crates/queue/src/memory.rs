//! In-process lease queue.
//!
//! All queues live behind one async mutex. Pollable entries are kept per
//! queue in a `BTreeSet` ordered by `(Reverse(priority), seq)`, leased entries
//! in a global set ordered by expiry so expired leases can be reclaimed in
//! order before every poll.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tracing::debug;
use uuid::Uuid;

use crate::clock::{after, Clock, SystemClock};
use crate::{Lease, QueueError, TaskQueue};

type ReadyKey = (Reverse<i32>, u64, Uuid);

#[derive(Debug)]
struct Entry {
    queue_name: String,
    priority: i32,
    seq: u64,
    lease: Option<(Uuid, DateTime<Utc>)>,
}

impl Entry {
    fn ready_key(&self, task_id: Uuid) -> ReadyKey {
        (Reverse(self.priority), self.seq, task_id)
    }
}

#[derive(Debug, Default)]
struct QueueState {
    entries: HashMap<Uuid, Entry>,
    ready: HashMap<String, BTreeSet<ReadyKey>>,
    leased: BTreeSet<(DateTime<Utc>, Uuid)>,
    next_seq: u64,
}

impl QueueState {
    /// Return every lease that expired at or before `now` to its ready set.
    fn reclaim_expired(&mut self, now: DateTime<Utc>) {
        while let Some(&(expires_at, task_id)) = self.leased.first() {
            if expires_at > now {
                break;
            }
            self.leased.pop_first();
            if let Some(entry) = self.entries.get_mut(&task_id) {
                entry.lease = None;
                debug!(%task_id, queue = %entry.queue_name, "lease expired, task pollable again");
                self.ready
                    .entry(entry.queue_name.clone())
                    .or_default()
                    .insert(entry.ready_key(task_id));
            }
        }
    }

    /// Validate a receipt against the entry's live lease.
    fn live_lease(
        &self,
        task_id: Uuid,
        lease_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, QueueError> {
        let entry = self
            .entries
            .get(&task_id)
            .ok_or(QueueError::NotQueued(task_id))?;

        match entry.lease {
            Some((current, expires_at)) if current == lease_id => {
                if expires_at <= now {
                    Err(QueueError::LeaseExpired { task_id, lease_id })
                } else {
                    Ok(expires_at)
                }
            }
            _ => Err(QueueError::LeaseMismatch { task_id, lease_id }),
        }
    }
}

/// A [`TaskQueue`] held entirely in memory.
pub struct MemoryQueue {
    state: Mutex<QueueState>,
    clock: Arc<dyn Clock>,
}

impl MemoryQueue {
    /// Queue driven by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Queue driven by an injected clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            clock,
        }
    }
}

impl Default for MemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskQueue for MemoryQueue {
    async fn enqueue(&self, queue_name: &str, task_id: Uuid, priority: i32) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.entries.contains_key(&task_id) {
            debug!(%task_id, queue = queue_name, "task already queued");
            return Ok(());
        }

        let seq = state.next_seq;
        state.next_seq += 1;
        let entry = Entry {
            queue_name: queue_name.to_owned(),
            priority,
            seq,
            lease: None,
        };
        let key = entry.ready_key(task_id);
        state.entries.insert(task_id, entry);
        state.ready.entry(queue_name.to_owned()).or_default().insert(key);
        Ok(())
    }

    async fn poll(&self, queue_name: &str, lease: Duration) -> Result<Option<Lease>, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        state.reclaim_expired(now);

        let Some(key) = state.ready.get_mut(queue_name).and_then(|ready| ready.pop_first()) else {
            return Ok(None);
        };
        let task_id = key.2;
        let lease_id = Uuid::new_v4();
        let expires_at = after(now, lease);

        if let Some(entry) = state.entries.get_mut(&task_id) {
            entry.lease = Some((lease_id, expires_at));
        }
        state.leased.insert((expires_at, task_id));

        Ok(Some(Lease {
            task_id,
            lease_id,
            queue_name: queue_name.to_owned(),
            expires_at,
        }))
    }

    async fn ack(&self, task_id: Uuid, lease_id: Uuid) -> Result<(), QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let expires_at = state.live_lease(task_id, lease_id, now)?;

        state.leased.remove(&(expires_at, task_id));
        state.entries.remove(&task_id);
        Ok(())
    }

    async fn extend_lease(
        &self,
        task_id: Uuid,
        lease_id: Uuid,
        duration: Duration,
    ) -> Result<DateTime<Utc>, QueueError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let old_expiry = state.live_lease(task_id, lease_id, now)?;
        let new_expiry = after(now, duration);

        state.leased.remove(&(old_expiry, task_id));
        state.leased.insert((new_expiry, task_id));
        if let Some(entry) = state.entries.get_mut(&task_id) {
            entry.lease = Some((lease_id, new_expiry));
        }
        Ok(new_expiry)
    }

    async fn remove(&self, task_id: Uuid) -> Result<bool, QueueError> {
        let mut state = self.state.lock().await;
        let Some(entry) = state.entries.remove(&task_id) else {
            return Ok(false);
        };

        match entry.lease {
            Some((_, expires_at)) => {
                state.leased.remove(&(expires_at, task_id));
            }
            None => {
                if let Some(ready) = state.ready.get_mut(&entry.queue_name) {
                    ready.remove(&entry.ready_key(task_id));
                }
            }
        }
        Ok(true)
    }

    async fn depth(&self, queue_name: &str) -> Result<usize, QueueError> {
        let state = self.state.lock().await;
        Ok(state
            .entries
            .values()
            .filter(|entry| entry.queue_name == queue_name)
            .count())
    }
}
