//! Durable queue with visibility timeouts
//!
//! Messages move `Visible → Hidden → Deleted` (dequeue, then ack), or back
//! from `Hidden → Visible` when the visibility timeout lapses or the consumer
//! nacks. Delivery is at-least-once: nothing is removed until acked.
//!
//! Every dequeue issues a fresh receipt handle. `ack` and `nack` only act on
//! the current receive, and only while its hide is still in force, so a
//! consumer that overran the timeout cannot delete a redelivered message.
//!
//! All bookkeeping sits behind one mutex, so a hidden message is never handed
//! to a second consumer until it becomes visible again.

use crate::clock::{Clock, SystemClock};
use crate::dlq::{should_dead_letter, DeadLetter, DlqHandler};
use crate::error::{FabricError, Result};
use crate::state::QueueStore;
use crate::types::{Event, MessageId, QueueStats, ReceivedMessage};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

/// Default visibility timeout
pub const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

/// Upper bound on a queue's visibility timeout
pub const MAX_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(12 * 60 * 60);

/// Longest a long-poll sleeps before rechecking for expired hides
const RECHECK_INTERVAL: Duration = Duration::from_millis(50);

/// A message as held (and persisted) by the queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub message_id: MessageId,

    /// The original event
    pub event: Event,

    /// Unix milliseconds at enqueue
    pub enqueued_at: u64,

    /// Unix milliseconds at which the message is visible (again)
    pub visible_at: u64,

    #[serde(default)]
    pub receive_count: u32,

    /// Receipt handle of the latest receive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receipt_handle: Option<String>,
}

impl StoredMessage {
    fn received(&self) -> ReceivedMessage {
        ReceivedMessage {
            message_id: self.message_id.clone(),
            receipt_handle: self.receipt_handle.clone().unwrap_or_default(),
            event: self.event.clone(),
            receive_count: self.receive_count,
            enqueued_at: self.enqueued_at,
            visible_at: self.visible_at,
        }
    }
}

/// Queue tuning
#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// How long a dequeued message stays hidden
    pub visibility_timeout: Duration,

    /// Upper bound on waiting for the queue lock during enqueue
    pub send_timeout: Duration,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
            send_timeout: Duration::from_secs(5),
        }
    }
}

/// Move messages to a dead-letter handler after too many receives
#[derive(Clone)]
pub struct RedrivePolicy {
    pub max_receive_count: u32,
    pub handler: Arc<dyn DlqHandler>,
}

#[derive(Default)]
struct QueueState {
    next_seq: u64,
    /// seq → message, in enqueue order
    messages: BTreeMap<u64, StoredMessage>,
    /// message id → seq
    index: HashMap<MessageId, u64>,
}

impl QueueState {
    fn insert(&mut self, message: StoredMessage) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.restore(seq, message);
    }

    /// Put a message back at its original position
    fn restore(&mut self, seq: u64, message: StoredMessage) {
        self.index.insert(message.message_id.clone(), seq);
        self.messages.insert(seq, message);
    }

    fn remove(&mut self, message_id: &str) -> Option<StoredMessage> {
        let seq = self.index.remove(message_id)?;
        self.messages.remove(&seq)
    }

    fn get_mut(&mut self, message_id: &str) -> Option<&mut StoredMessage> {
        let seq = self.index.get(message_id)?;
        self.messages.get_mut(seq)
    }

    /// The message if `receipt_handle` is its current receive and still hidden
    fn held(
        &mut self,
        message_id: &str,
        receipt_handle: &str,
        now: u64,
    ) -> Option<&mut StoredMessage> {
        self.get_mut(message_id)
            .filter(|m| m.visible_at > now && m.receipt_handle.as_deref() == Some(receipt_handle))
    }

    fn snapshot(&self) -> Vec<StoredMessage> {
        self.messages.values().cloned().collect()
    }
}

/// A durable, at-least-once work queue
pub struct DurableQueue {
    name: String,
    options: QueueOptions,
    state: Mutex<QueueState>,
    /// Woken on enqueue and nack
    available: Notify,
    clock: Arc<dyn Clock>,
    store: Option<Arc<dyn QueueStore>>,
    redrive: Option<RedrivePolicy>,
}

impl DurableQueue {
    /// Create an empty queue using the system clock
    pub fn new(name: impl Into<String>, options: QueueOptions) -> Self {
        Self {
            name: name.into(),
            options,
            state: Mutex::new(QueueState::default()),
            available: Notify::new(),
            clock: Arc::new(SystemClock),
            store: None,
            redrive: None,
        }
    }

    /// Use a different time source
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Persist in-flight messages to `store`, restoring any saved snapshot
    pub fn with_store(mut self, store: Arc<dyn QueueStore>) -> Result<Self> {
        let saved = store.load(&self.name)?;
        let state = self.state.get_mut();
        for message in saved {
            state.insert(message);
        }
        if !state.messages.is_empty() {
            tracing::info!(
                queue = %self.name,
                messages = state.messages.len(),
                "Queue restored from store"
            );
        }
        self.store = Some(store);
        Ok(self)
    }

    /// Dead-letter messages received `max_receive_count` times
    pub fn with_redrive(mut self, policy: RedrivePolicy) -> Self {
        self.redrive = Some(policy);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.options.visibility_timeout
    }

    /// How long a received message stays hidden from now on (zero once lapsed)
    pub fn remaining_visibility(&self, message: &ReceivedMessage) -> Duration {
        let now = self.clock.now_millis();
        Duration::from_millis(message.visible_at.saturating_sub(now))
    }

    /// Add a message, returning its id
    pub async fn enqueue(&self, event: Event) -> Result<MessageId> {
        let now = self.clock.now_millis();
        let message = StoredMessage {
            message_id: format!("msg-{}", uuid::Uuid::new_v4()),
            event,
            enqueued_at: now,
            visible_at: now,
            receive_count: 0,
            receipt_handle: None,
        };
        let message_id = message.message_id.clone();

        let mut state = tokio::time::timeout(self.options.send_timeout, self.state.lock())
            .await
            .map_err(|_| {
                FabricError::Timeout(format!(
                    "Enqueue on '{}' timed out after {:?}",
                    self.name, self.options.send_timeout
                ))
            })?;

        state.insert(message);
        if let Err(e) = self.persist(&state) {
            // Not durable, so not accepted
            state.remove(&message_id);
            return Err(e);
        }
        drop(state);

        self.available.notify_waiters();
        tracing::debug!(queue = %self.name, message_id = %message_id, "Message enqueued");
        Ok(message_id)
    }

    /// Take up to `max` visible messages, hiding each for the visibility timeout
    pub async fn dequeue_batch(&self, max: usize) -> Result<Vec<ReceivedMessage>> {
        if max == 0 {
            return Ok(Vec::new());
        }

        let now = self.clock.now_millis();
        let timeout_ms =
            u64::try_from(self.options.visibility_timeout.as_millis()).unwrap_or(u64::MAX);
        let hidden_until = now.saturating_add(timeout_ms);
        let mut batch = Vec::new();
        let mut dead = Vec::new();

        {
            let mut state = self.state.lock().await;
            let mut dead_seqs = Vec::new();

            for (seq, message) in state.messages.iter_mut() {
                if batch.len() >= max {
                    break;
                }
                if message.visible_at > now {
                    continue;
                }
                if let Some(policy) = &self.redrive {
                    if should_dead_letter(message.receive_count, policy.max_receive_count) {
                        dead_seqs.push(*seq);
                        continue;
                    }
                }
                message.visible_at = hidden_until;
                message.receive_count += 1;
                message.receipt_handle = Some(format!("rh-{}", uuid::Uuid::new_v4()));
                batch.push(message.received());
            }

            for seq in dead_seqs {
                if let Some(message) = state.messages.remove(&seq) {
                    state.index.remove(&message.message_id);
                    dead.push((seq, message));
                }
            }

            if !batch.is_empty() || !dead.is_empty() {
                self.persist_or_warn(&state);
            }
        }

        if let Some(policy) = &self.redrive {
            let mut failed = Vec::new();
            for (seq, message) in dead {
                let reason = format!(
                    "received {} times (max {})",
                    message.receive_count, policy.max_receive_count
                );
                let letter = DeadLetter::new(&self.name, message.clone(), reason);
                if let Err(e) = policy.handler.handle(letter).await {
                    tracing::error!(
                        queue = %self.name,
                        message_id = %message.message_id,
                        error = %e,
                        "Dead-letter handler failed, message kept"
                    );
                    failed.push((seq, message));
                }
            }
            self.restore_failed_letters(failed).await;
        }

        if !batch.is_empty() {
            tracing::debug!(queue = %self.name, count = batch.len(), "Messages dequeued");
        }
        Ok(batch)
    }

    /// Like `dequeue_batch`, but waits up to `wait` for a message to arrive
    pub async fn receive(&self, max: usize, wait: Duration) -> Result<Vec<ReceivedMessage>> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            let batch = self.dequeue_batch(max).await?;
            let now = tokio::time::Instant::now();
            if !batch.is_empty() || max == 0 || now >= deadline {
                return Ok(batch);
            }
            let nap = (deadline - now).min(RECHECK_INTERVAL);
            let _ = tokio::time::timeout(nap, self.available.notified()).await;
        }
    }

    /// Delete a received message permanently; returns whether it was deleted
    ///
    /// Only the current receive can ack, and only while its hide lasts.
    /// Acking an unknown, deleted or expired receive is a no-op.
    pub async fn ack(&self, message_id: &str, receipt_handle: &str) -> bool {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        if state.held(message_id, receipt_handle, now).is_none() {
            tracing::debug!(queue = %self.name, message_id, "Stale ack ignored");
            return false;
        }
        state.remove(message_id);
        self.persist_or_warn(&state);
        tracing::debug!(queue = %self.name, message_id, "Message acked");
        true
    }

    /// Make a received message visible immediately; returns whether it was released
    pub async fn nack(&self, message_id: &str, receipt_handle: &str) -> bool {
        let now = self.clock.now_millis();
        let mut state = self.state.lock().await;
        let released = match state.held(message_id, receipt_handle, now) {
            Some(message) => {
                message.visible_at = now;
                true
            }
            None => false,
        };
        if released {
            self.persist_or_warn(&state);
        }
        drop(state);

        if released {
            self.available.notify_waiters();
            tracing::debug!(queue = %self.name, message_id, "Message released");
        }
        released
    }

    /// Copies of up to `limit` messages, visible or not, without hiding them
    pub async fn peek(&self, limit: usize) -> Vec<StoredMessage> {
        let state = self.state.lock().await;
        state.messages.values().take(limit).cloned().collect()
    }

    pub async fn stats(&self) -> QueueStats {
        let now = self.clock.now_millis();
        let state = self.state.lock().await;
        let visible = state
            .messages
            .values()
            .filter(|m| m.visible_at <= now)
            .count();
        QueueStats {
            visible,
            in_flight: state.messages.len() - visible,
        }
    }

    /// Total messages held, visible or hidden
    pub async fn len(&self) -> usize {
        self.state.lock().await.messages.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    async fn restore_failed_letters(&self, failed: Vec<(u64, StoredMessage)>) {
        if failed.is_empty() {
            return;
        }
        let mut state = self.state.lock().await;
        for (seq, message) in failed {
            state.restore(seq, message);
        }
        self.persist_or_warn(&state);
        drop(state);
        self.available.notify_waiters();
    }

    fn persist(&self, state: &QueueState) -> Result<()> {
        match &self.store {
            Some(store) => store.save(&self.name, &state.snapshot()),
            None => Ok(()),
        }
    }

    fn persist_or_warn(&self, state: &QueueState) {
        if let Err(e) = self.persist(state) {
            tracing::warn!(queue = %self.name, error = %e, "Failed to persist queue state");
        }
    }
}

impl std::fmt::Debug for DurableQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurableQueue")
            .field("name", &self.name)
            .field("options", &self.options)
            .field("persistent", &self.store.is_some())
            .finish()
    }
}
