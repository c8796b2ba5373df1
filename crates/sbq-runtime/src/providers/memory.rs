//! In-memory queue provider implementation for testing and development.
//!
//! Behaves like a peek-lock queue:
//! - received messages are locked for `lock_duration` and hidden from other
//!   receivers until completed, abandoned, or the lock expires
//! - expired locks make the message available again with a higher delivery count
//! - link opens and closes are counted so callers can check scoped release
//!
//! Faults can be injected for sends and for individual completion calls.

use crate::client::{QueueProvider, ReceiverLink, SenderLink};
use crate::error::QueueError;
use crate::message::{
    Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage, Timestamp, MAX_RECEIVE_BATCH,
};
use crate::provider::{InMemoryConfig, ProviderType};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Poll interval while waiting for the first message of a batch
const RECEIVE_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(25);

// ============================================================================
// Internal Storage Structures
// ============================================================================

struct QueueStorage {
    queues: HashMap<QueueName, InMemoryQueue>,
    config: InMemoryConfig,
    stats: LinkStats,
    faults: Faults,
    next_sequence: i64,
    closed: bool,
}

impl QueueStorage {
    fn new(config: InMemoryConfig) -> Self {
        Self {
            queues: HashMap::new(),
            config,
            stats: LinkStats::default(),
            faults: Faults::default(),
            next_sequence: 1,
            closed: false,
        }
    }

    fn get_or_create_queue(&mut self, queue_name: &QueueName) -> &mut InMemoryQueue {
        self.queues.entry(queue_name.clone()).or_default()
    }
}

#[derive(Default)]
struct InMemoryQueue {
    /// Messages available for delivery, in sequence order
    ready: VecDeque<StoredMessage>,
    /// Locked messages keyed by lock token
    in_flight: HashMap<String, InFlightMessage>,
}

impl InMemoryQueue {
    /// Return messages whose lock expired to the ready list, preserving order
    fn reclaim_expired_locks(&mut self) {
        let expired: Vec<String> = self
            .in_flight
            .iter()
            .filter(|(_, entry)| entry.is_expired())
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(entry) = self.in_flight.remove(&token) {
                self.requeue(entry.message);
            }
        }
    }

    fn requeue(&mut self, message: StoredMessage) {
        let position = self
            .ready
            .iter()
            .position(|m| m.sequence_number > message.sequence_number)
            .unwrap_or(self.ready.len());
        self.ready.insert(position, message);
    }
}

#[derive(Clone)]
struct StoredMessage {
    message_id: MessageId,
    body: Bytes,
    attributes: HashMap<String, String>,
    correlation_id: Option<String>,
    sequence_number: i64,
    enqueued_at: Timestamp,
    delivery_count: u32,
    expires_at: Option<Timestamp>,
}

impl StoredMessage {
    fn from_message(message: &Message, sequence_number: i64) -> Self {
        let now = Timestamp::now();
        let expires_at = message
            .time_to_live
            .map(|ttl| Timestamp::from_datetime(now.as_datetime() + ttl));

        Self {
            message_id: message.message_id.clone(),
            body: message.body.clone(),
            attributes: message.attributes.clone(),
            correlation_id: message.correlation_id.clone(),
            sequence_number,
            enqueued_at: now,
            delivery_count: 0,
            expires_at,
        }
    }

    fn is_expired(&self) -> bool {
        self.expires_at
            .as_ref()
            .is_some_and(|expires_at| Timestamp::now() >= *expires_at)
    }
}

struct InFlightMessage {
    message: StoredMessage,
    lock_expires_at: Timestamp,
}

impl InFlightMessage {
    fn is_expired(&self) -> bool {
        Timestamp::now() >= self.lock_expires_at
    }
}

#[derive(Default)]
struct Faults {
    fail_sends: bool,
    failing_completion_calls: HashSet<usize>,
    completion_calls: usize,
}

/// Counters of link lifecycle events
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LinkStats {
    pub senders_opened: usize,
    pub senders_closed: usize,
    pub receivers_opened: usize,
    pub receivers_closed: usize,
    pub completions: usize,
}

type SharedStorage = Arc<Mutex<QueueStorage>>;

fn lock(storage: &SharedStorage) -> MutexGuard<'_, QueueStorage> {
    storage.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// ============================================================================
// InMemoryProvider
// ============================================================================

/// In-memory queue provider implementation
pub struct InMemoryProvider {
    storage: SharedStorage,
    notify: Arc<Notify>,
}

impl InMemoryProvider {
    /// Create new in-memory provider with configuration
    pub fn new(config: InMemoryConfig) -> Self {
        Self {
            storage: Arc::new(Mutex::new(QueueStorage::new(config))),
            notify: Arc::new(Notify::new()),
        }
    }

    /// Handle sharing this provider's storage.
    ///
    /// The queue client takes ownership of its provider; keep a handle to
    /// inspect or fault the same queues from outside.
    pub fn handle(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
            notify: Arc::clone(&self.notify),
        }
    }

    /// Link lifecycle counters
    pub fn stats(&self) -> LinkStats {
        lock(&self.storage).stats
    }

    /// Messages waiting for delivery on `queue`
    pub fn ready_count(&self, queue: &QueueName) -> usize {
        lock(&self.storage)
            .queues
            .get(queue)
            .map_or(0, |q| q.ready.len())
    }

    /// Messages currently locked by a receiver on `queue`
    pub fn locked_count(&self, queue: &QueueName) -> usize {
        lock(&self.storage)
            .queues
            .get(queue)
            .map_or(0, |q| q.in_flight.len())
    }

    /// Make every send fail with a connection error until reset
    pub fn fail_sends(&self, fail: bool) {
        lock(&self.storage).faults.fail_sends = fail;
    }

    /// Make the `call`-th completion (1-based, counted across the provider) fail
    pub fn fail_completion_call(&self, call: usize) {
        lock(&self.storage)
            .faults
            .failing_completion_calls
            .insert(call);
    }
}

impl Default for InMemoryProvider {
    fn default() -> Self {
        Self::new(InMemoryConfig::default())
    }
}

#[async_trait]
impl QueueProvider for InMemoryProvider {
    async fn open_sender(&self, queue: &QueueName) -> Result<Box<dyn SenderLink>, QueueError> {
        let mut storage = lock(&self.storage);
        if storage.closed {
            return Err(QueueError::ClientClosed);
        }
        storage.get_or_create_queue(queue);
        storage.stats.senders_opened += 1;

        Ok(Box::new(InMemorySender {
            storage: Arc::clone(&self.storage),
            notify: Arc::clone(&self.notify),
            queue_name: queue.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_receiver(
        &self,
        queue: &QueueName,
    ) -> Result<Box<dyn ReceiverLink>, QueueError> {
        let mut storage = lock(&self.storage);
        if storage.closed {
            return Err(QueueError::ClientClosed);
        }
        storage.get_or_create_queue(queue);
        storage.stats.receivers_opened += 1;

        Ok(Box::new(InMemoryReceiver {
            storage: Arc::clone(&self.storage),
            notify: Arc::clone(&self.notify),
            queue_name: queue.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        lock(&self.storage).closed = true;
        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::InMemory
    }

    fn max_batch_size(&self) -> u32 {
        MAX_RECEIVE_BATCH
    }
}

// ============================================================================
// Links
// ============================================================================

struct InMemorySender {
    storage: SharedStorage,
    notify: Arc<Notify>,
    queue_name: QueueName,
    closed: AtomicBool,
}

#[async_trait]
impl SenderLink for InMemorySender {
    async fn send_message(&self, message: &Message) -> Result<MessageId, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::LinkClosed {
                queue_name: self.queue_name.to_string(),
            });
        }

        {
            let mut storage = lock(&self.storage);
            if storage.faults.fail_sends {
                return Err(QueueError::ConnectionFailed {
                    message: "injected send failure".to_string(),
                });
            }

            let max_size = storage.config.max_message_size;
            if message.body.len() > max_size {
                return Err(QueueError::MessageTooLarge {
                    size: message.body.len(),
                    max_size,
                });
            }

            let sequence = storage.next_sequence;
            storage.next_sequence += 1;
            storage
                .get_or_create_queue(&self.queue_name)
                .ready
                .push_back(StoredMessage::from_message(message, sequence));
        }

        self.notify.notify_waiters();
        Ok(message.message_id.clone())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.storage).stats.senders_closed += 1;
        Ok(())
    }

    fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }
}

struct InMemoryReceiver {
    storage: SharedStorage,
    notify: Arc<Notify>,
    queue_name: QueueName,
    closed: AtomicBool,
}

impl InMemoryReceiver {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::LinkClosed {
                queue_name: self.queue_name.to_string(),
            });
        }
        Ok(())
    }

    /// Lock up to `max_messages` ready messages
    fn take_ready(&self, max_messages: u32) -> Vec<ReceivedMessage> {
        let mut storage = lock(&self.storage);
        let lock_duration = storage.config.lock_duration;
        let queue = storage.get_or_create_queue(&self.queue_name);
        queue.reclaim_expired_locks();

        let mut batch = Vec::new();
        while batch.len() < max_messages as usize {
            let Some(mut stored) = queue.ready.pop_front() else {
                break;
            };
            if stored.is_expired() {
                continue;
            }

            stored.delivery_count += 1;
            let lock_token = uuid::Uuid::new_v4().to_string();
            let lock_expires_at =
                Timestamp::from_datetime(Timestamp::now().as_datetime() + lock_duration);

            batch.push(ReceivedMessage {
                message_id: stored.message_id.clone(),
                body: stored.body.clone(),
                attributes: stored.attributes.clone(),
                correlation_id: stored.correlation_id.clone(),
                receipt_handle: ReceiptHandle::new(
                    lock_token.clone(),
                    stored.message_id.clone(),
                    lock_expires_at.clone(),
                    ProviderType::InMemory,
                ),
                delivery_count: stored.delivery_count,
                sequence_number: Some(stored.sequence_number),
                enqueued_at: Some(stored.enqueued_at.clone()),
            });

            queue.in_flight.insert(
                lock_token,
                InFlightMessage {
                    message: stored,
                    lock_expires_at,
                },
            );
        }

        batch
    }
}

#[async_trait]
impl ReceiverLink for InMemoryReceiver {
    async fn receive_messages(
        &self,
        max_messages: u32,
        timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError> {
        self.ensure_open()?;

        if max_messages > MAX_RECEIVE_BATCH {
            return Err(QueueError::BatchTooLarge {
                size: max_messages as usize,
                max_size: MAX_RECEIVE_BATCH as usize,
            });
        }

        let start = tokio::time::Instant::now();
        let deadline = start
            .checked_add(timeout.to_std().unwrap_or_default())
            .unwrap_or(start + std::time::Duration::from_secs(86_400 * 365));
        loop {
            let batch = self.take_ready(max_messages);
            if !batch.is_empty() {
                return Ok(batch);
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }

            let wait = (deadline - now).min(RECEIVE_POLL_INTERVAL);
            let _ = tokio::time::timeout(wait, self.notify.notified()).await;
        }
    }

    async fn complete_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.ensure_open()?;

        let mut storage = lock(&self.storage);
        storage.faults.completion_calls += 1;
        let call = storage.faults.completion_calls;
        if storage.faults.failing_completion_calls.contains(&call) {
            return Err(QueueError::ConnectionFailed {
                message: format!("injected completion failure on call {}", call),
            });
        }

        let queue = storage.get_or_create_queue(&self.queue_name);
        match queue.in_flight.remove(receipt.handle()) {
            Some(entry) if !entry.is_expired() => {
                storage.stats.completions += 1;
                Ok(())
            }
            Some(entry) => {
                queue.requeue(entry.message);
                Err(QueueError::MessageNotFound {
                    receipt: receipt.handle().to_string(),
                })
            }
            None => Err(QueueError::MessageNotFound {
                receipt: receipt.handle().to_string(),
            }),
        }
    }

    async fn abandon_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.ensure_open()?;

        let released = {
            let mut storage = lock(&self.storage);
            let queue = storage.get_or_create_queue(&self.queue_name);
            match queue.in_flight.remove(receipt.handle()) {
                Some(entry) => {
                    queue.requeue(entry.message);
                    true
                }
                None => false,
            }
        };

        if !released {
            return Err(QueueError::MessageNotFound {
                receipt: receipt.handle().to_string(),
            });
        }

        self.notify.notify_waiters();
        Ok(())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.storage).stats.receivers_closed += 1;
        Ok(())
    }

    fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }
}
