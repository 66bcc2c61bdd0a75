//! Consumer dispatcher — drains a queue into its registered handler
//!
//! Each worker long-polls the queue, invokes the handler once per message and
//! acks on success. On handler error or timeout it does nothing: the message
//! stays hidden until its visibility timeout lapses and is then redelivered.
//! Redelivery is the only retry.
//!
//! A handler never runs past the hide of the message it is handling. Batch
//! messages are processed in order, so later ones get whatever remains of
//! their hide; a message whose hide has already lapsed is skipped and left
//! to whichever consumer receives it next.

use crate::error::{HandlerError, Result};
use crate::queue::DurableQueue;
use crate::types::{Event, ReceivedMessage};
use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Consumer handler contract
#[async_trait]
pub trait Handler: Send + Sync {
    /// Process one event; an error leaves the message for redelivery
    async fn handle(&self, event: &Event) -> std::result::Result<(), HandlerError>;
}

/// Handler that logs each event and succeeds
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingHandler;

#[async_trait]
impl Handler for LoggingHandler {
    async fn handle(&self, event: &Event) -> std::result::Result<(), HandlerError> {
        let body = serde_json::to_string(event).map_err(|e| HandlerError::new(e.to_string()))?;
        tracing::info!(
            event_id = %event.id,
            source = %event.source,
            event = %body,
            "Event received"
        );
        Ok(())
    }
}

/// Adapter turning an async closure into a `Handler`
pub struct FnHandler<F> {
    f: F,
}

/// Wrap an async closure as a handler
pub fn handler_fn<F, Fut>(f: F) -> FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    FnHandler { f }
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Event) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = std::result::Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: &Event) -> std::result::Result<(), HandlerError> {
        (self.f)(event.clone()).await
    }
}

/// Dispatcher tuning
#[derive(Debug, Clone)]
pub struct DispatcherOptions {
    /// Maximum messages per dequeue
    pub batch_size: usize,

    /// Concurrent workers polling the queue
    pub workers: usize,

    /// Long-poll wait per receive
    pub poll_wait: Duration,

    /// Per-message handler deadline; `None` uses the queue's visibility timeout
    pub handler_timeout: Option<Duration>,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            batch_size: 10,
            workers: 1,
            poll_wait: Duration::from_secs(1),
            handler_timeout: None,
        }
    }
}

/// Outcome of processing one batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub acked: usize,
    pub failed: usize,
    pub timed_out: usize,

    /// Hide lapsed before the message could be handled or acked
    pub expired: usize,
}

impl BatchReport {
    fn merge(&mut self, other: BatchReport) {
        self.received += other.received;
        self.acked += other.acked;
        self.failed += other.failed;
        self.timed_out += other.timed_out;
        self.expired += other.expired;
    }
}

/// Binds one handler to one queue
pub struct Dispatcher {
    queue: Arc<DurableQueue>,
    handler: Arc<dyn Handler>,
    options: DispatcherOptions,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    pub fn new(
        queue: Arc<DurableQueue>,
        handler: Arc<dyn Handler>,
        options: DispatcherOptions,
    ) -> Self {
        Self {
            queue,
            handler,
            options,
        }
    }

    pub fn queue(&self) -> &Arc<DurableQueue> {
        &self.queue
    }

    pub fn options(&self) -> &DispatcherOptions {
        &self.options
    }

    fn handler_timeout(&self) -> Duration {
        self.options
            .handler_timeout
            .unwrap_or_else(|| self.queue.visibility_timeout())
    }

    /// Dequeue one batch without waiting and process it
    pub async fn poll_once(&self) -> Result<BatchReport> {
        let batch = self.queue.dequeue_batch(self.options.batch_size).await?;
        Ok(self.process(batch).await)
    }

    /// Process an already-dequeued batch
    pub async fn process(&self, batch: Vec<ReceivedMessage>) -> BatchReport {
        let mut report = BatchReport {
            received: batch.len(),
            ..Default::default()
        };
        let handler_timeout = self.handler_timeout();

        for message in batch {
            let remaining = self.queue.remaining_visibility(&message);
            if remaining.is_zero() {
                tracing::debug!(
                    queue = %self.queue.name(),
                    message_id = %message.message_id,
                    "Hide lapsed before handling, message skipped"
                );
                report.expired += 1;
                continue;
            }

            let timeout = handler_timeout.min(remaining);
            match tokio::time::timeout(timeout, self.handler.handle(&message.event)).await {
                Ok(Ok(())) => {
                    if self
                        .queue
                        .ack(&message.message_id, &message.receipt_handle)
                        .await
                    {
                        report.acked += 1;
                    } else {
                        tracing::warn!(
                            queue = %self.queue.name(),
                            message_id = %message.message_id,
                            event_id = %message.event.id,
                            "Handled after hide lapsed, ack ignored"
                        );
                        report.expired += 1;
                    }
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        queue = %self.queue.name(),
                        message_id = %message.message_id,
                        event_id = %message.event.id,
                        receive_count = message.receive_count,
                        error = %e,
                        "Handler failed, message left for redelivery"
                    );
                    report.failed += 1;
                }
                Err(_) => {
                    tracing::warn!(
                        queue = %self.queue.name(),
                        message_id = %message.message_id,
                        event_id = %message.event.id,
                        timeout_ms = timeout.as_millis() as u64,
                        "Handler timed out, message left for redelivery"
                    );
                    report.timed_out += 1;
                }
            }
        }

        report
    }

    /// Start the configured number of workers
    pub fn spawn(self) -> DispatcherHandle {
        let (shutdown, rx) = watch::channel(false);
        let workers = self.options.workers.max(1);
        let dispatcher = Arc::new(self);

        tracing::info!(
            queue = %dispatcher.queue.name(),
            workers,
            batch_size = dispatcher.options.batch_size,
            "Dispatcher started"
        );

        let handles = (0..workers)
            .map(|worker| {
                let dispatcher = Arc::clone(&dispatcher);
                let rx = rx.clone();
                tokio::spawn(async move { dispatcher.run_worker(worker, rx).await })
            })
            .collect();

        DispatcherHandle {
            shutdown,
            workers: handles,
        }
    }

    async fn run_worker(&self, worker: usize, mut shutdown: watch::Receiver<bool>) -> BatchReport {
        let mut total = BatchReport::default();

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                // Also fires when the handle is dropped
                _ = shutdown.changed() => break,
                batch = self.queue.receive(self.options.batch_size, self.options.poll_wait) => {
                    match batch {
                        Ok(batch) if batch.is_empty() => {}
                        Ok(batch) => total.merge(self.process(batch).await),
                        Err(e) => {
                            tracing::warn!(
                                queue = %self.queue.name(),
                                worker,
                                error = %e,
                                "Receive failed"
                            );
                            tokio::time::sleep(self.options.poll_wait).await;
                        }
                    }
                }
            }
        }

        tracing::debug!(queue = %self.queue.name(), worker, "Worker stopped");
        total
    }
}

/// Running dispatcher workers
pub struct DispatcherHandle {
    shutdown: watch::Sender<bool>,
    workers: Vec<JoinHandle<BatchReport>>,
}

impl DispatcherHandle {
    /// Stop all workers after their current batch, returning combined totals
    pub async fn shutdown(self) -> BatchReport {
        let _ = self.shutdown.send(true);
        let mut total = BatchReport::default();
        for worker in self.workers {
            match worker.await {
                Ok(report) => total.merge(report),
                Err(e) => tracing::error!(error = %e, "Dispatcher worker panicked"),
            }
        }
        tracing::info!(
            acked = total.acked,
            failed = total.failed,
            timed_out = total.timed_out,
            expired = total.expired,
            "Dispatcher stopped"
        );
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::queue::{QueueOptions, DEFAULT_VISIBILITY_TIMEOUT};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn event(id: u64) -> Event {
        Event::new("custom.stripe.test", "test", serde_json::json!({"id": id}))
    }

    fn manual_queue() -> (Arc<DurableQueue>, ManualClock) {
        let clock = ManualClock::default();
        let queue = DurableQueue::new("StripeEventQueue", QueueOptions::default())
            .with_clock(Arc::new(clock.clone()));
        (Arc::new(queue), clock)
    }

    #[tokio::test]
    async fn test_success_acks() {
        let (queue, _clock) = manual_queue();
        queue.enqueue(event(1)).await.unwrap();
        queue.enqueue(event(2)).await.unwrap();

        let dispatcher = Dispatcher::new(
            queue.clone(),
            Arc::new(LoggingHandler),
            DispatcherOptions::default(),
        );
        let report = dispatcher.poll_once().await.unwrap();

        assert_eq!(
            report,
            BatchReport {
                received: 2,
                acked: 2,
                failed: 0,
                timed_out: 0,
                expired: 0,
            }
        );
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_failure_redelivered_after_timeout() {
        let (queue, clock) = manual_queue();
        queue.enqueue(event(1)).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let handler = handler_fn({
            let calls = calls.clone();
            move |_event| {
                let calls = calls.clone();
                async move {
                    // Fail the first delivery only
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Err(HandlerError::new("transient"))
                    } else {
                        Ok(())
                    }
                }
            }
        });
        let dispatcher = Dispatcher::new(
            queue.clone(),
            Arc::new(handler),
            DispatcherOptions::default(),
        );

        let first = dispatcher.poll_once().await.unwrap();
        assert_eq!(first.failed, 1);
        assert_eq!(queue.len().await, 1);

        // Still hidden: no retry within the same invocation or before expiry
        let again = dispatcher.poll_once().await.unwrap();
        assert_eq!(again.received, 0);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        clock.advance(DEFAULT_VISIBILITY_TIMEOUT);
        let second = dispatcher.poll_once().await.unwrap();
        assert_eq!(second.acked, 1);
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_handler_timeout_leaves_message() {
        let (queue, _clock) = manual_queue();
        queue.enqueue(event(1)).await.unwrap();

        let handler = handler_fn(|_event| async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(())
        });
        let dispatcher = Dispatcher::new(
            queue.clone(),
            Arc::new(handler),
            DispatcherOptions {
                handler_timeout: Some(Duration::from_millis(20)),
                ..Default::default()
            },
        );

        let report = dispatcher.poll_once().await.unwrap();
        assert_eq!(report.timed_out, 1);
        assert_eq!(queue.stats().await.in_flight, 1);
    }

    #[tokio::test]
    async fn test_later_batch_messages_bounded_by_hide() {
        let queue = Arc::new(DurableQueue::new(
            "q",
            QueueOptions {
                visibility_timeout: Duration::from_millis(400),
                ..QueueOptions::default()
            },
        ));
        queue.enqueue(event(1)).await.unwrap();
        queue.enqueue(event(2)).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let handler = handler_fn({
            let calls = calls.clone();
            move |_event| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(250)).await;
                    Ok(())
                }
            }
        });
        let dispatcher = Dispatcher::new(
            queue.clone(),
            Arc::new(handler),
            DispatcherOptions::default(),
        );

        // The second message's hide runs out while the first is handled
        let first = dispatcher.poll_once().await.unwrap();
        assert_eq!(first.received, 2);
        assert_eq!(first.acked, 1);
        assert_eq!(first.timed_out + first.expired, 1);
        assert_eq!(queue.len().await, 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let second = dispatcher.poll_once().await.unwrap();
        assert_eq!(second.received, 1);
        assert_eq!(second.acked, 1);
        assert!(queue.is_empty().await);
        assert_eq!(first.acked + second.acked, 2);
    }

    #[tokio::test]
    async fn test_lapsed_message_skipped_and_not_counted_as_acked() {
        let (queue, clock) = manual_queue();
        queue.enqueue(event(1)).await.unwrap();
        let batch = queue.dequeue_batch(1).await.unwrap();

        let calls = Arc::new(AtomicUsize::new(0));
        let handler = handler_fn({
            let calls = calls.clone();
            move |_event| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        });
        let dispatcher = Dispatcher::new(
            queue.clone(),
            Arc::new(handler),
            DispatcherOptions::default(),
        );

        clock.advance(DEFAULT_VISIBILITY_TIMEOUT);
        let report = dispatcher.process(batch).await;
        assert_eq!(report.acked, 0);
        assert_eq!(report.expired, 1);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert_eq!(queue.stats().await.visible, 1);
    }

    #[tokio::test]
    async fn test_ack_after_lapse_not_counted() {
        let (queue, clock) = manual_queue();
        queue.enqueue(event(1)).await.unwrap();

        // The handler succeeds, but only after the hide has run out
        let handler = handler_fn({
            let clock = clock.clone();
            move |_event| {
                let clock = clock.clone();
                async move {
                    clock.advance(DEFAULT_VISIBILITY_TIMEOUT);
                    Ok(())
                }
            }
        });
        let dispatcher = Dispatcher::new(
            queue.clone(),
            Arc::new(handler),
            DispatcherOptions::default(),
        );

        let report = dispatcher.poll_once().await.unwrap();
        assert_eq!(report.acked, 0);
        assert_eq!(report.expired, 1);
        assert_eq!(queue.len().await, 1);
    }

    #[tokio::test]
    async fn test_batch_size_respected() {
        let (queue, _clock) = manual_queue();
        for i in 0..5 {
            queue.enqueue(event(i)).await.unwrap();
        }

        let dispatcher = Dispatcher::new(
            queue.clone(),
            Arc::new(LoggingHandler),
            DispatcherOptions {
                batch_size: 2,
                ..Default::default()
            },
        );
        assert_eq!(dispatcher.poll_once().await.unwrap().acked, 2);
        assert_eq!(queue.len().await, 3);
    }

    #[tokio::test]
    async fn test_spawned_workers_drain_queue() {
        let queue = Arc::new(DurableQueue::new("q", QueueOptions::default()));
        let seen = Arc::new(AtomicUsize::new(0));
        let handler = handler_fn({
            let seen = seen.clone();
            move |_event| {
                let seen = seen.clone();
                async move {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            }
        });

        let handle = Dispatcher::new(
            queue.clone(),
            Arc::new(handler),
            DispatcherOptions {
                workers: 3,
                poll_wait: Duration::from_millis(20),
                ..Default::default()
            },
        )
        .spawn();

        for i in 0..20 {
            queue.enqueue(event(i)).await.unwrap();
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while !queue.is_empty().await {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        let total = handle.shutdown().await;
        assert_eq!(total.acked, 20);
        assert_eq!(seen.load(Ordering::SeqCst), 20);
    }
}
