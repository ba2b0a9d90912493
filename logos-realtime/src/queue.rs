//! Ordered outbound delivery with per-message retry and exponential backoff.
//!
//! ```text
//! enqueue ──► [ head | m2 | m3 | … ]
//!               │
//!               ▼ send(head).await          (one message in flight)
//!        ┌──────┴──────────┐
//!        ok                err
//!        │                 │
//!     pop head      retries < max ? retry after retry_timeout·2^retries
//!        │                 : drop head (logged)
//!        ▼
//!  sleep(processing_interval), next head
//! ```
//!
//! One queue is one FIFO stream. Independent streams need separate queues.
//! Delivery is at-least-once: a re-attempt carries `retry: true` so the
//! receiver can deduplicate by id.

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::message::Message;

/// Queue timing and retry policy.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Pause between settled messages.
    pub processing_interval: Duration,
    /// Re-attempts allowed after the first failure.
    pub max_retries: u32,
    /// Base of the exponential retry delay.
    pub retry_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            processing_interval: Duration::from_millis(100),
            max_retries: 3,
            retry_timeout: Duration::from_millis(1000),
        }
    }
}

/// Delay before the re-attempt that follows `retry_count` earlier retries.
pub fn backoff_delay(retry_timeout: Duration, retry_count: u32) -> Duration {
    retry_timeout.saturating_mul(1u32 << retry_count.min(20))
}

/// Failure reported by a send function.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryError {
    reason: String,
}

impl DeliveryError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Delivery failed: {}", self.reason)
    }
}

impl std::error::Error for DeliveryError {}

/// A queued message with its delivery bookkeeping.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingMessage {
    pub message: Message,
    pub retry_count: u32,
}

/// Lifetime counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub delivered: u64,
    pub retried: u64,
    pub dropped: u64,
}

type SendFn = Arc<dyn Fn(Message) -> BoxFuture<'static, Result<(), DeliveryError>> + Send + Sync>;

struct QueueState {
    pending: VecDeque<PendingMessage>,
    worker: Option<JoinHandle<()>>,
    /// Bumped by `clear`; a worker from an older generation exits.
    generation: u64,
    stats: QueueStats,
}

struct QueueInner {
    config: QueueConfig,
    send: SendFn,
    state: Mutex<QueueState>,
}

/// FIFO outbound buffer with a single message in flight.
#[derive(Clone)]
pub struct DeliveryQueue {
    inner: Arc<QueueInner>,
}

impl DeliveryQueue {
    /// Create a queue around an async send function.
    pub fn new<F, Fut>(send: F, config: QueueConfig) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), DeliveryError>> + Send + 'static,
    {
        let send: SendFn = Arc::new(move |message| send(message).boxed());
        Self {
            inner: Arc::new(QueueInner {
                config,
                send,
                state: Mutex::new(QueueState {
                    pending: VecDeque::new(),
                    worker: None,
                    generation: 0,
                    stats: QueueStats::default(),
                }),
            }),
        }
    }

    /// Configuration the queue was built with.
    pub fn config(&self) -> &QueueConfig {
        &self.inner.config
    }

    /// Append a message and start draining if idle.
    ///
    /// The message gets a timestamp and id if it lacks them. Must be called
    /// from within a tokio runtime.
    pub fn enqueue(&self, mut message: Message) {
        message.prepare();
        let mut state = self.inner.state.lock();
        state.pending.push_back(PendingMessage {
            message,
            retry_count: 0,
        });
        if state.worker.is_none() {
            let generation = state.generation;
            state.worker = Some(tokio::spawn(drain(self.inner.clone(), generation)));
        }
    }

    /// Discard everything pending and halt the worker.
    ///
    /// A later `enqueue` starts a fresh worker.
    pub fn clear(&self) {
        let mut state = self.inner.state.lock();
        let discarded = state.pending.len();
        state.pending.clear();
        state.generation += 1;
        if let Some(worker) = state.worker.take() {
            worker.abort();
        }
        if discarded > 0 {
            log::debug!("Delivery queue cleared, {discarded} message(s) discarded");
        }
    }

    /// Number of messages waiting, including one in flight.
    pub fn get_queue_length(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    /// Snapshot of waiting messages in delivery order.
    pub fn get_pending_messages(&self) -> Vec<PendingMessage> {
        self.inner.state.lock().pending.iter().cloned().collect()
    }

    pub fn is_processing(&self) -> bool {
        self.inner.state.lock().worker.is_some()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().pending.is_empty()
    }

    /// Counters since creation.
    pub fn stats(&self) -> QueueStats {
        self.inner.state.lock().stats
    }
}

async fn drain(inner: Arc<QueueInner>, generation: u64) {
    loop {
        let attempt = {
            let mut state = inner.state.lock();
            if state.generation != generation {
                return;
            }
            match state.pending.front() {
                Some(head) => {
                    let mut message = head.message.clone();
                    message.retry = head.retry_count > 0;
                    message
                }
                None => {
                    state.worker = None;
                    return;
                }
            }
        };

        let result = match AssertUnwindSafe((inner.send)(attempt)).catch_unwind().await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::new("send function panicked")),
        };

        let delay = {
            let mut state = inner.state.lock();
            if state.generation != generation {
                return;
            }
            match settle(&mut state, result, &inner.config) {
                Some(delay) => delay,
                None => {
                    state.worker = None;
                    return;
                }
            }
        };

        tokio::time::sleep(delay).await;
    }
}

/// Apply one send outcome to the head. Returns the delay before the next
/// attempt, or `None` once the queue is empty.
fn settle(
    state: &mut QueueState,
    result: Result<(), DeliveryError>,
    config: &QueueConfig,
) -> Option<Duration> {
    let delay = match result {
        Ok(()) => {
            state.pending.pop_front();
            state.stats.delivered += 1;
            config.processing_interval
        }
        Err(err) => {
            let head = state.pending.front_mut()?;
            if head.retry_count < config.max_retries {
                let delay = backoff_delay(config.retry_timeout, head.retry_count);
                head.retry_count += 1;
                state.stats.retried += 1;
                log::warn!(
                    "Send failed for {} ({err}), retry {}/{} in {delay:?}",
                    head.message.id.as_deref().unwrap_or("<no id>"),
                    head.retry_count,
                    config.max_retries
                );
                return Some(delay);
            }
            if let Some(dropped) = state.pending.pop_front() {
                log::error!(
                    "Dropping message {} of type {} after {} retries: {err}",
                    dropped.message.id.as_deref().unwrap_or("<no id>"),
                    dropped.message.kind(),
                    dropped.retry_count
                );
            }
            state.stats.dropped += 1;
            config.processing_interval
        }
    };

    if state.pending.is_empty() {
        None
    } else {
        Some(delay)
    }
}
