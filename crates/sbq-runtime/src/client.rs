//! Client traits and the send/receive flow built on top of them.

use crate::context::OperationContext;
use crate::credentials::TokenSource;
use crate::error::{OperationError, QueueError};
use crate::message::{
    AckPolicy, Message, MessageId, QueueName, ReceiptHandle, ReceiveOptions, ReceivedMessage,
};
use crate::provider::{ProviderConfig, ProviderType, QueueConfig};
use crate::providers::{AzureServiceBusProvider, InMemoryProvider};
use async_trait::async_trait;
use chrono::Duration;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
#[path = "client_tests.rs"]
mod tests;

/// Interface implemented by specific queue providers (Azure, in-memory)
#[async_trait]
pub trait QueueProvider: Send + Sync {
    /// Open a send link bound to `queue`
    async fn open_sender(&self, queue: &QueueName) -> Result<Box<dyn SenderLink>, QueueError>;

    /// Open a peek-lock receive link bound to `queue`
    async fn open_receiver(&self, queue: &QueueName)
        -> Result<Box<dyn ReceiverLink>, QueueError>;

    /// Release provider-wide resources
    async fn close(&self) -> Result<(), QueueError>;

    /// Get provider type
    fn provider_type(&self) -> ProviderType;

    /// Largest batch one receive call can return
    fn max_batch_size(&self) -> u32;
}

/// Scoped channel for publishing to one queue
#[async_trait]
pub trait SenderLink: Send + Sync {
    /// Transmit one message
    async fn send_message(&self, message: &Message) -> Result<MessageId, QueueError>;

    /// Release the link; further sends fail with [`QueueError::LinkClosed`]
    async fn close(&self) -> Result<(), QueueError>;

    fn queue_name(&self) -> &QueueName;
}

/// Scoped channel for consuming from one queue
#[async_trait]
pub trait ReceiverLink: Send + Sync {
    /// Pull up to `max_messages`, waiting at most `timeout` for the first one
    async fn receive_messages(
        &self,
        max_messages: u32,
        timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, QueueError>;

    /// Remove a locked message from the queue
    async fn complete_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Release the lock so the message can be redelivered
    async fn abandon_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError>;

    /// Release the link; further operations fail with [`QueueError::LinkClosed`]
    async fn close(&self) -> Result<(), QueueError>;

    fn queue_name(&self) -> &QueueName;
}

/// Factory for creating queue clients with appropriate providers
pub struct QueueClientFactory;

impl QueueClientFactory {
    /// Create queue client from configuration.
    ///
    /// For Azure Service Bus the credential is exercised once here so a
    /// rejected identity fails construction rather than the first send.
    ///
    /// # Errors
    ///
    /// Returns [`OperationError::ClientConstruction`] when the configuration
    /// is invalid or the credential is rejected.
    #[instrument(skip(config, credential), fields(provider = %config.provider.provider_type()))]
    pub async fn create_client(
        config: QueueConfig,
        credential: Arc<dyn TokenSource>,
    ) -> Result<QueueClient, OperationError> {
        let provider: Box<dyn QueueProvider> = match config.provider {
            ProviderConfig::InMemory(in_memory_config) => {
                Box::new(InMemoryProvider::new(in_memory_config))
            }
            ProviderConfig::AzureServiceBus(azure_config) => {
                let provider = AzureServiceBusProvider::new(azure_config, credential)
                    .map_err(|e| OperationError::ClientConstruction {
                        operation: "QueueClientFactory::create_client",
                        source: e.to_queue_error(),
                    })?;

                provider
                    .verify_credential()
                    .await
                    .map_err(|source| OperationError::ClientConstruction {
                        operation: "QueueClientFactory::create_client",
                        source,
                    })?;

                Box::new(provider)
            }
        };

        info!(provider = %provider.provider_type(), "Queue client created");
        Ok(QueueClient::new(provider))
    }

    /// Create test client with in-memory provider
    ///
    /// # Example
    ///
    /// ```
    /// use sbq_runtime::{Message, OperationContext, QueueClientFactory, QueueName, ReceiveOptions};
    ///
    /// # tokio_test::block_on(async {
    /// let client = QueueClientFactory::create_test_client();
    /// let queue = QueueName::new("sbq-yym-dev-usce".to_string()).unwrap();
    /// let ctx = OperationContext::background();
    ///
    /// client
    ///     .send_message(&queue, Message::from_text("super cool message"), &ctx)
    ///     .await
    ///     .unwrap();
    ///
    /// let mut out = Vec::new();
    /// let options = ReceiveOptions::new().with_timeout(chrono::Duration::seconds(1));
    /// let report = client
    ///     .receive_and_complete(&queue, &options, &mut out, &ctx)
    ///     .await
    ///     .unwrap();
    ///
    /// assert_eq!(report.completed.len(), 1);
    /// assert_eq!(out, b"super cool message\n");
    /// client.close().await.unwrap();
    /// # });
    /// ```
    pub fn create_test_client() -> QueueClient {
        QueueClient::new(Box::new(InMemoryProvider::default()))
    }
}

/// Outcome of completing one message in a best-effort batch
#[derive(Debug)]
pub struct CompletionFailure {
    pub message_id: MessageId,
    pub error: QueueError,
}

/// Summary of one receive batch
#[derive(Debug, Default)]
pub struct ReceiveReport {
    /// Number of messages pulled from the queue
    pub received: usize,
    /// Messages printed and completed
    pub completed: Vec<MessageId>,
    /// Messages whose completion failed (best-effort policy only)
    pub failed: Vec<CompletionFailure>,
}

impl ReceiveReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Connection handle to one namespace.
///
/// Links are opened per operation and always closed before the operation
/// returns. The client itself must be released with [`QueueClient::close`].
pub struct QueueClient {
    provider: Box<dyn QueueProvider>,
    closed: AtomicBool,
}

impl QueueClient {
    /// Create new client over a provider
    pub fn new(provider: Box<dyn QueueProvider>) -> Self {
        Self {
            provider,
            closed: AtomicBool::new(false),
        }
    }

    /// Get provider type
    pub fn provider_type(&self) -> ProviderType {
        self.provider.provider_type()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.is_closed() {
            return Err(QueueError::ClientClosed);
        }
        Ok(())
    }

    /// Send one message to `queue`.
    ///
    /// Opens a sender link, transmits, and closes the link whatever the
    /// transmit outcome was.
    #[instrument(skip(self, message, ctx), fields(queue = %queue, message_id = %message.message_id))]
    pub async fn send_message(
        &self,
        queue: &QueueName,
        message: Message,
        ctx: &OperationContext,
    ) -> Result<MessageId, OperationError> {
        self.ensure_open().map_err(|source| OperationError::Send {
            operation: "client.open_sender",
            source,
        })?;

        let sender = ctx
            .run("client.open_sender", self.provider.open_sender(queue))
            .await
            .map_err(|source| OperationError::Send {
                operation: "client.open_sender",
                source,
            })?;

        let result = ctx
            .run("sender.send_message", sender.send_message(&message))
            .await;

        if let Err(e) = sender.close().await {
            warn!(queue = %queue, error = %e, "Failed to close sender link");
        }

        let message_id = result.map_err(|source| OperationError::Send {
            operation: "sender.send_message",
            source,
        })?;

        info!(message_id = %message_id, "Message sent");
        Ok(message_id)
    }

    /// Receive one batch from `queue`, writing each body as a line to `out`
    /// and completing it.
    ///
    /// The receiver link is closed on every exit path. See [`AckPolicy`] for
    /// how completion failures are handled.
    #[instrument(skip(self, options, out, ctx), fields(queue = %queue, max_messages = options.max_messages))]
    pub async fn receive_and_complete<W>(
        &self,
        queue: &QueueName,
        options: &ReceiveOptions,
        out: &mut W,
        ctx: &OperationContext,
    ) -> Result<ReceiveReport, OperationError>
    where
        W: Write + Send,
    {
        self.ensure_open().map_err(|source| OperationError::Receive {
            operation: "client.open_receiver",
            source,
        })?;

        let receiver = ctx
            .run("client.open_receiver", self.provider.open_receiver(queue))
            .await
            .map_err(|source| OperationError::Receive {
                operation: "client.open_receiver",
                source,
            })?;

        let result = self
            .drain_batch(receiver.as_ref(), options, out, ctx)
            .await;

        if let Err(e) = receiver.close().await {
            warn!(queue = %queue, error = %e, "Failed to close receiver link");
        }

        let report = result?;
        info!(
            received = report.received,
            completed = report.completed.len(),
            failed = report.failed.len(),
            "Receive batch finished"
        );
        Ok(report)
    }

    async fn drain_batch<W>(
        &self,
        receiver: &dyn ReceiverLink,
        options: &ReceiveOptions,
        out: &mut W,
        ctx: &OperationContext,
    ) -> Result<ReceiveReport, OperationError>
    where
        W: Write + Send,
    {
        let cap = options
            .max_messages
            .min(self.provider.max_batch_size())
            .max(1);

        let mut messages = ctx
            .run(
                "receiver.receive_messages",
                receiver.receive_messages(cap, options.timeout),
            )
            .await
            .map_err(|source| OperationError::Receive {
                operation: "receiver.receive_messages",
                source,
            })?;

        if messages.len() > cap as usize {
            let excess = messages.split_off(cap as usize);
            warn!(
                excess = excess.len(),
                "Provider returned more messages than requested; abandoning the excess"
            );
            for message in &excess {
                if let Err(e) = receiver.abandon_message(&message.receipt_handle).await {
                    warn!(message_id = %message.message_id, error = %e, "Failed to abandon message");
                }
            }
        }

        let mut report = ReceiveReport {
            received: messages.len(),
            ..Default::default()
        };
        debug!(count = messages.len(), "Received batch");

        for message in messages {
            write_line(out, &message).map_err(|source| OperationError::Receive {
                operation: "stdout.write",
                source,
            })?;

            let completion = ctx
                .run(
                    "receiver.complete_message",
                    receiver.complete_message(&message.receipt_handle),
                )
                .await;

            match (completion, options.ack_policy) {
                (Ok(()), _) => {
                    debug!(message_id = %message.message_id, "Message completed");
                    report.completed.push(message.message_id);
                }
                (Err(source), AckPolicy::StopOnFirstFailure) => {
                    return Err(OperationError::Receive {
                        operation: "receiver.complete_message",
                        source,
                    });
                }
                (Err(error), AckPolicy::BestEffort) => {
                    warn!(
                        message_id = %message.message_id,
                        error = %error,
                        transient = error.is_transient(),
                        "Failed to complete message; continuing"
                    );
                    report.failed.push(CompletionFailure {
                        message_id: message.message_id,
                        error,
                    });
                }
            }
        }

        Ok(report)
    }

    /// Release the client. Subsequent operations fail with
    /// [`QueueError::ClientClosed`]; closing twice is a no-op.
    pub async fn close(&self) -> Result<(), QueueError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!(provider = %self.provider.provider_type(), "Closing queue client");
        self.provider.close().await
    }
}

fn write_line<W: Write>(out: &mut W, message: &ReceivedMessage) -> Result<(), QueueError> {
    out.write_all(&message.body)
        .and_then(|_| out.write_all(b"\n"))
        .and_then(|_| out.flush())
        .map_err(|e| QueueError::OutputFailed {
            message: e.to_string(),
        })
}
