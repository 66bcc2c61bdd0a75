//! Dead Letter Queue — handle messages that exceed max receive attempts
//!
//! Off by default: without a redrive policy a failing message is redelivered
//! indefinitely. With one, the queue removes a message once it has been
//! received `max_receive_count` times and hands it to a `DlqHandler`.

use crate::clock::now_millis;
use crate::error::Result;
use crate::queue::{DurableQueue, StoredMessage};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::RwLock;

/// A failed message with context about why it ended up in the DLQ
#[derive(Debug, Clone)]
pub struct DeadLetter {
    /// Queue the message was removed from
    pub queue: String,

    /// The message as last held by the queue
    pub message: StoredMessage,

    /// Reason the message was dead-lettered
    pub reason: String,

    /// Unix timestamp in milliseconds when the message was dead-lettered
    pub dead_lettered_at: u64,
}

impl DeadLetter {
    pub fn new(
        queue: impl Into<String>,
        message: StoredMessage,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            queue: queue.into(),
            message,
            reason: reason.into(),
            dead_lettered_at: now_millis(),
        }
    }
}

/// Trait for dead letter queue handlers
#[async_trait]
pub trait DlqHandler: Send + Sync {
    /// Handle a dead-lettered message
    async fn handle(&self, letter: DeadLetter) -> Result<()>;

    /// Get the number of messages currently in the DLQ
    async fn count(&self) -> Result<usize>;

    /// List recent dead-lettered messages, most recent first
    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>>;
}

/// In-memory DLQ handler for development and testing
///
/// Stores dead letters in a `Vec` with configurable max capacity.
pub struct MemoryDlqHandler {
    letters: Arc<RwLock<Vec<DeadLetter>>>,
    max_letters: usize,
}

impl MemoryDlqHandler {
    pub fn new(max_letters: usize) -> Self {
        Self {
            letters: Arc::new(RwLock::new(Vec::new())),
            max_letters,
        }
    }
}

impl Default for MemoryDlqHandler {
    fn default() -> Self {
        Self::new(10_000)
    }
}

#[async_trait]
impl DlqHandler for MemoryDlqHandler {
    async fn handle(&self, letter: DeadLetter) -> Result<()> {
        tracing::warn!(
            queue = %letter.queue,
            message_id = %letter.message.message_id,
            event_id = %letter.message.event.id,
            receive_count = letter.message.receive_count,
            reason = %letter.reason,
            "Message dead-lettered"
        );

        let mut letters = self.letters.write().await;
        letters.push(letter);

        if self.max_letters > 0 && letters.len() > self.max_letters {
            let drain_count = letters.len() - self.max_letters;
            letters.drain(..drain_count);
        }

        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.letters.read().await.len())
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let letters = self.letters.read().await;
        Ok(letters.iter().rev().take(limit).cloned().collect())
    }
}

/// DLQ handler that moves dead letters onto another durable queue
///
/// The original event is enqueued unchanged, so its delivery id survives.
pub struct QueueDlqHandler {
    queue: Arc<DurableQueue>,
}

impl QueueDlqHandler {
    pub fn new(queue: Arc<DurableQueue>) -> Self {
        Self { queue }
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }
}

#[async_trait]
impl DlqHandler for QueueDlqHandler {
    async fn handle(&self, letter: DeadLetter) -> Result<()> {
        let message_id = self.queue.enqueue(letter.message.event.clone()).await?;
        tracing::warn!(
            queue = %letter.queue,
            dead_letter_queue = %self.queue.name(),
            message_id = %letter.message.message_id,
            new_message_id = %message_id,
            reason = %letter.reason,
            "Message moved to dead-letter queue"
        );
        Ok(())
    }

    async fn count(&self) -> Result<usize> {
        Ok(self.queue.len().await)
    }

    async fn list(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let mut messages = self.queue.peek(usize::MAX).await;
        messages.reverse();
        Ok(messages
            .into_iter()
            .take(limit)
            .map(|message| DeadLetter {
                queue: self.queue.name().to_string(),
                dead_lettered_at: message.enqueued_at,
                message,
                reason: "held in dead-letter queue".to_string(),
            })
            .collect())
    }
}

/// Whether a message received `receive_count` times should be dead-lettered
///
/// `max_receive_count == 0` means unlimited.
pub fn should_dead_letter(receive_count: u32, max_receive_count: u32) -> bool {
    max_receive_count > 0 && receive_count >= max_receive_count
}
