//! Azure Service Bus provider over the data-plane REST API.
//!
//! Requests are authorized with a bearer token from a [`TokenSource`] scoped
//! to `https://servicebus.azure.net/.default`.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | send      | `POST {queue}/messages` |
//! | receive   | `POST {queue}/messages/head?timeout=N` (peek-lock) |
//! | complete  | `DELETE {queue}/messages/{message-id}/{lock-token}` |
//! | abandon   | `PUT {queue}/messages/{message-id}/{lock-token}` |
//!
//! Broker properties (message id, lock token, delivery count...) travel as a
//! JSON object in the `BrokerProperties` header. Custom properties travel as
//! individual headers whose values are JSON strings.
//!
//! The REST API hands out one message per receive call, so a batch is built by
//! pulling repeatedly: the first pull waits up to the caller's timeout, later
//! pulls wait briefly and the batch ends at the first empty pull.

use crate::client::{QueueProvider, ReceiverLink, SenderLink};
use crate::credentials::TokenSource;
use crate::error::{ConfigurationError, QueueError, SerializationError, ValidationError};
use crate::message::{
    Message, MessageId, QueueName, ReceiptHandle, ReceivedMessage, Timestamp, MAX_RECEIVE_BATCH,
};
use crate::provider::{AzureServiceBusConfig, ProviderType};
use async_trait::async_trait;
use chrono::Duration;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client as HttpClient, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use url::Url;

#[cfg(test)]
#[path = "azure_tests.rs"]
mod tests;

const BROKER_PROPERTIES_HEADER: &str = "BrokerProperties";

/// Wait used for every pull after the first one in a batch
const FOLLOW_UP_POLL_SECONDS: i64 = 1;

/// Lock duration assumed when the service omits `LockedUntilUtc`
const DEFAULT_LOCK_SECONDS: i64 = 60;

/// Response headers that are never custom message properties
const STANDARD_HEADERS: &[&str] = &[
    "brokerproperties",
    "content-type",
    "content-length",
    "date",
    "location",
    "server",
    "strict-transport-security",
    "transfer-encoding",
];

// ============================================================================
// Error Types
// ============================================================================

/// Azure Service Bus specific errors
#[derive(Debug, Error)]
pub enum AzureError {
    #[error("Authentication failed: {0}")]
    AuthenticationError(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Message lock lost: {0}")]
    MessageLockLost(String),

    #[error("Message too large: {size} bytes (max: {max_size})")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Service Bus error ({status}): {message}")]
    ServiceBusError { status: u16, message: String },

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Invalid message property '{name}': {message}")]
    InvalidProperty { name: String, message: String },
}

impl AzureError {
    /// Check if error is transient
    pub fn is_transient(&self) -> bool {
        match self {
            Self::AuthenticationError(_) => false,
            Self::PermissionDenied(_) => false,
            Self::NetworkError(_) => true,
            Self::QueueNotFound(_) => false,
            Self::MessageLockLost(_) => false,
            Self::MessageTooLarge { .. } => false,
            Self::ServiceBusError { status, .. } => *status >= 500 || *status == 429,
            Self::ConfigurationError(_) => false,
            Self::InvalidProperty { .. } => false,
        }
    }

    /// Map Azure error to QueueError
    pub fn to_queue_error(self) -> QueueError {
        match self {
            Self::AuthenticationError(message) => QueueError::AuthenticationFailed { message },
            Self::PermissionDenied(operation) => QueueError::PermissionDenied { operation },
            Self::NetworkError(message) => QueueError::ConnectionFailed { message },
            Self::QueueNotFound(queue_name) => QueueError::QueueNotFound { queue_name },
            Self::MessageLockLost(receipt) => QueueError::MessageNotFound { receipt },
            Self::MessageTooLarge { size, max_size } => {
                QueueError::MessageTooLarge { size, max_size }
            }
            Self::ServiceBusError { status, message } => QueueError::ProviderError {
                provider: ProviderType::AzureServiceBus.to_string(),
                code: status.to_string(),
                message,
            },
            Self::ConfigurationError(message) => {
                QueueError::ConfigurationError(ConfigurationError::Invalid { message })
            }
            Self::InvalidProperty { name, message } => {
                QueueError::SerializationError(SerializationError::InvalidHeader { name, message })
            }
        }
    }

    /// Translate a token acquisition failure
    fn from_credential(error: QueueError) -> Self {
        match error {
            QueueError::AuthenticationFailed { message } => Self::AuthenticationError(message),
            QueueError::PermissionDenied { operation } => Self::PermissionDenied(operation),
            QueueError::ConnectionFailed { message } => Self::NetworkError(message),
            other => Self::AuthenticationError(other.to_string()),
        }
    }

    fn from_transport(error: reqwest::Error) -> Self {
        if error.is_timeout() {
            Self::NetworkError(format!("Request timeout: {}", error))
        } else if error.is_connect() {
            Self::NetworkError(format!("Connection failed: {}", error))
        } else {
            Self::NetworkError(format!("HTTP request failed: {}", error))
        }
    }
}

/// Classify a non-success response.
///
/// `missing` builds the error reported for 404, which means a missing queue
/// on queue-level calls and a lost lock on message-level calls.
fn error_for_status(
    status: StatusCode,
    body: &str,
    operation: &str,
    missing: impl FnOnce() -> AzureError,
) -> AzureError {
    match status {
        StatusCode::UNAUTHORIZED => AzureError::AuthenticationError(format!(
            "{} rejected the bearer token: {}",
            operation,
            summarize(body)
        )),
        StatusCode::FORBIDDEN => AzureError::PermissionDenied(operation.to_string()),
        StatusCode::NOT_FOUND => missing(),
        StatusCode::GONE => missing(),
        _ => AzureError::ServiceBusError {
            status: status.as_u16(),
            message: summarize(body),
        },
    }
}

fn summarize(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "no response body".to_string();
    }
    trimmed.chars().take(512).collect()
}

// ============================================================================
// Broker Properties
// ============================================================================

/// System properties exchanged in the `BrokerProperties` header
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct BrokerProperties {
    #[serde(skip_serializing_if = "Option::is_none")]
    message_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    correlation_id: Option<String>,
    /// Seconds
    #[serde(skip_serializing_if = "Option::is_none")]
    time_to_live: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    lock_token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    locked_until_utc: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    delivery_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sequence_number: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    enqueued_time_utc: Option<String>,
}

impl BrokerProperties {
    fn for_message(message: &Message) -> Self {
        Self {
            message_id: Some(message.message_id.as_str().to_string()),
            correlation_id: message.correlation_id.clone(),
            time_to_live: message
                .time_to_live
                .map(|ttl| ttl.num_milliseconds() as f64 / 1000.0),
            ..Default::default()
        }
    }

    fn from_headers(headers: &HeaderMap) -> Result<Self, AzureError> {
        let raw = headers
            .get(BROKER_PROPERTIES_HEADER)
            .ok_or_else(|| AzureError::InvalidProperty {
                name: BROKER_PROPERTIES_HEADER.to_string(),
                message: "header missing from receive response".to_string(),
            })?;

        let text = raw.to_str().map_err(|e| AzureError::InvalidProperty {
            name: BROKER_PROPERTIES_HEADER.to_string(),
            message: e.to_string(),
        })?;

        serde_json::from_str(text).map_err(|e| AzureError::InvalidProperty {
            name: BROKER_PROPERTIES_HEADER.to_string(),
            message: e.to_string(),
        })
    }
}

/// Encode custom properties as headers with JSON string values
fn property_headers(attributes: &HashMap<String, String>) -> Result<HeaderMap, AzureError> {
    let mut headers = HeaderMap::new();
    for (name, value) in attributes {
        let header_name =
            HeaderName::from_bytes(name.as_bytes()).map_err(|e| AzureError::InvalidProperty {
                name: name.clone(),
                message: e.to_string(),
            })?;

        let encoded = serde_json::to_string(value).map_err(|e| AzureError::InvalidProperty {
            name: name.clone(),
            message: e.to_string(),
        })?;

        let header_value =
            HeaderValue::from_str(&encoded).map_err(|e| AzureError::InvalidProperty {
                name: name.clone(),
                message: e.to_string(),
            })?;

        headers.insert(header_name, header_value);
    }
    Ok(headers)
}

/// Decode custom properties from response headers
fn properties_from_headers(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter(|(name, _)| !STANDARD_HEADERS.contains(&name.as_str()))
        .filter_map(|(name, value)| {
            let text = value.to_str().ok()?;
            let decoded: String = serde_json::from_str(text).ok()?;
            Some((name.as_str().to_string(), decoded))
        })
        .collect()
}

// ============================================================================
// REST Client
// ============================================================================

/// Shared HTTP state used by the provider and its links
struct ServiceBusRest {
    http_client: HttpClient,
    base_url: Url,
    credential: Arc<dyn TokenSource>,
    request_timeout: std::time::Duration,
}

impl ServiceBusRest {
    fn queue_url(&self, queue: &QueueName, segments: &[&str]) -> Result<Url, AzureError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| {
                AzureError::ConfigurationError(format!(
                    "Endpoint '{}' cannot carry a path",
                    self.base_url
                ))
            })?
            .pop_if_empty()
            .push(queue.as_str())
            .push("messages")
            .extend(segments);
        Ok(url)
    }

    async fn request(&self, method: Method, url: Url) -> Result<RequestBuilder, AzureError> {
        let token = self
            .credential
            .bearer_token()
            .await
            .map_err(AzureError::from_credential)?;

        Ok(self
            .http_client
            .request(method, url)
            .header(AUTHORIZATION, format!("Bearer {}", token)))
    }

    async fn execute(&self, request: RequestBuilder) -> Result<Response, AzureError> {
        request.send().await.map_err(AzureError::from_transport)
    }

    async fn send(&self, queue: &QueueName, message: &Message) -> Result<(), AzureError> {
        let max_size = ProviderType::AzureServiceBus.max_message_size();
        if message.body.len() > max_size {
            return Err(AzureError::MessageTooLarge {
                size: message.body.len(),
                max_size,
            });
        }

        let broker_properties = serde_json::to_string(&BrokerProperties::for_message(message))
            .map_err(|e| AzureError::InvalidProperty {
                name: BROKER_PROPERTIES_HEADER.to_string(),
                message: e.to_string(),
            })?;

        let url = self.queue_url(queue, &[])?;
        let request = self
            .request(Method::POST, url)
            .await?
            .headers(property_headers(&message.attributes)?)
            .header(BROKER_PROPERTIES_HEADER, broker_properties)
            .header(CONTENT_TYPE, "application/octet-stream")
            .timeout(self.request_timeout)
            .body(message.body.clone());

        let response = self.execute(request).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::PAYLOAD_TOO_LARGE {
            return Err(AzureError::MessageTooLarge {
                size: message.body.len(),
                max_size,
            });
        }
        Err(error_for_status(status, &body, "send", || {
            AzureError::QueueNotFound(queue.to_string())
        }))
    }

    /// Peek-lock the message at the head of `queue`; `None` when the wait
    /// elapses without a message.
    async fn receive_one(
        &self,
        queue: &QueueName,
        wait_seconds: i64,
    ) -> Result<Option<ReceivedMessage>, AzureError> {
        let wait_seconds = wait_seconds.max(0);
        let mut url = self.queue_url(queue, &["head"])?;
        url.query_pairs_mut()
            .append_pair("timeout", &wait_seconds.to_string());

        let request = self
            .request(Method::POST, url)
            .await?
            .header(CONTENT_TYPE, "application/octet-stream")
            .timeout(self.request_timeout + std::time::Duration::from_secs(wait_seconds as u64));

        let response = self.execute(request).await?;
        let status = response.status();

        if status == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(status, &body, "receive", || {
                AzureError::QueueNotFound(queue.to_string())
            }));
        }

        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(AzureError::from_transport)?;
        let properties = BrokerProperties::from_headers(&headers)?;

        let message_id: MessageId = properties
            .message_id
            .as_deref()
            .unwrap_or_default()
            .parse()
            .map_err(|e: ValidationError| AzureError::InvalidProperty {
                name: BROKER_PROPERTIES_HEADER.to_string(),
                message: e.to_string(),
            })?;

        let lock_token = properties
            .lock_token
            .clone()
            .ok_or_else(|| AzureError::InvalidProperty {
                name: BROKER_PROPERTIES_HEADER.to_string(),
                message: "LockToken missing; queue did not return a peek-locked message"
                    .to_string(),
            })?;

        let lock_expires_at = properties
            .locked_until_utc
            .as_deref()
            .and_then(Timestamp::from_http_date)
            .unwrap_or_else(|| {
                Timestamp::from_datetime(
                    Timestamp::now().as_datetime() + Duration::seconds(DEFAULT_LOCK_SECONDS),
                )
            });

        Ok(Some(ReceivedMessage {
            message_id: message_id.clone(),
            body,
            attributes: properties_from_headers(&headers),
            correlation_id: properties.correlation_id,
            receipt_handle: ReceiptHandle::new(
                lock_token,
                message_id,
                lock_expires_at,
                ProviderType::AzureServiceBus,
            ),
            delivery_count: properties.delivery_count.unwrap_or(1),
            sequence_number: properties.sequence_number,
            enqueued_at: properties
                .enqueued_time_utc
                .as_deref()
                .and_then(Timestamp::from_http_date),
        }))
    }

    /// Settle a locked message: `DELETE` completes, `PUT` abandons
    async fn settle(
        &self,
        queue: &QueueName,
        receipt: &ReceiptHandle,
        method: Method,
        operation: &str,
    ) -> Result<(), AzureError> {
        let url = self.queue_url(queue, &[receipt.message_id().as_str(), receipt.handle()])?;
        let request = self
            .request(method, url)
            .await?
            .timeout(self.request_timeout);

        let response = self.execute(request).await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(error_for_status(status, &body, operation, || {
            AzureError::MessageLockLost(receipt.handle().to_string())
        }))
    }
}

// ============================================================================
// Azure Service Bus Provider
// ============================================================================

/// Azure Service Bus queue provider
pub struct AzureServiceBusProvider {
    config: AzureServiceBusConfig,
    rest: Arc<ServiceBusRest>,
    closed: AtomicBool,
}

impl AzureServiceBusProvider {
    /// Create new Azure Service Bus provider.
    ///
    /// No network traffic happens here; see [`Self::verify_credential`].
    ///
    /// # Errors
    ///
    /// Returns [`AzureError::ConfigurationError`] when the namespace host or
    /// endpoint is unusable.
    pub fn new(
        config: AzureServiceBusConfig,
        credential: Arc<dyn TokenSource>,
    ) -> Result<Self, AzureError> {
        if config.namespace_host.trim().is_empty() {
            return Err(AzureError::ConfigurationError(
                "Namespace host cannot be empty".to_string(),
            ));
        }

        let endpoint = config
            .endpoint
            .clone()
            .unwrap_or_else(|| format!("https://{}/", config.namespace_host));
        let base_url = Url::parse(&endpoint).map_err(|e| {
            AzureError::ConfigurationError(format!("Invalid endpoint '{}': {}", endpoint, e))
        })?;

        let request_timeout = config.request_timeout.to_std().map_err(|_| {
            AzureError::ConfigurationError("Request timeout must be positive".to_string())
        })?;

        let http_client = HttpClient::builder()
            .build()
            .map_err(|e| AzureError::NetworkError(format!("Failed to create HTTP client: {}", e)))?;

        debug!(
            namespace = %config.namespace_host,
            endpoint = %base_url,
            credential = credential.kind(),
            "Configured Service Bus REST client"
        );

        Ok(Self {
            config,
            rest: Arc::new(ServiceBusRest {
                http_client,
                base_url,
                credential,
                request_timeout,
            }),
            closed: AtomicBool::new(false),
        })
    }

    /// Fully qualified namespace this provider talks to
    pub fn namespace_host(&self) -> &str {
        &self.config.namespace_host
    }

    /// Acquire one token so a rejected identity surfaces before any link opens
    #[instrument(skip(self), fields(namespace = %self.config.namespace_host))]
    pub async fn verify_credential(&self) -> Result<(), QueueError> {
        self.rest
            .credential
            .bearer_token()
            .await
            .map(|_| debug!(credential = self.rest.credential.kind(), "Credential verified"))
    }

    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::ClientClosed);
        }
        Ok(())
    }
}

impl fmt::Debug for AzureServiceBusProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AzureServiceBusProvider")
            .field("namespace_host", &self.config.namespace_host)
            .field("base_url", &self.rest.base_url.as_str())
            .field("closed", &self.closed.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl QueueProvider for AzureServiceBusProvider {
    async fn open_sender(&self, queue: &QueueName) -> Result<Box<dyn SenderLink>, QueueError> {
        self.ensure_open()?;
        debug!(queue = %queue, "Opening sender link");
        Ok(Box::new(AzureSender {
            rest: Arc::clone(&self.rest),
            queue_name: queue.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn open_receiver(
        &self,
        queue: &QueueName,
    ) -> Result<Box<dyn ReceiverLink>, QueueError> {
        self.ensure_open()?;
        debug!(queue = %queue, "Opening receiver link");
        Ok(Box::new(AzureReceiver {
            rest: Arc::clone(&self.rest),
            queue_name: queue.clone(),
            closed: AtomicBool::new(false),
        }))
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        debug!(namespace = %self.config.namespace_host, "Service Bus provider closed");
        Ok(())
    }

    fn provider_type(&self) -> ProviderType {
        ProviderType::AzureServiceBus
    }

    fn max_batch_size(&self) -> u32 {
        MAX_RECEIVE_BATCH
    }
}

// ============================================================================
// Links
// ============================================================================

struct AzureSender {
    rest: Arc<ServiceBusRest>,
    queue_name: QueueName,
    closed: AtomicBool,
}

#[async_trait]
impl SenderLink for AzureSender {
    async fn send_message(&self, message: &Message) -> Result<MessageId, QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::LinkClosed {
                queue_name: self.queue_name.to_string(),
            });
        }

        self.rest
            .send(&self.queue_name, message)
            .await
            .map_err(AzureError::to_queue_error)?;

        debug!(queue = %self.queue_name, message_id = %message.message_id, "Message accepted by Service Bus");
        Ok(message.message_id.clone())
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }
}

struct AzureReceiver {
    rest: Arc<ServiceBusRest>,
    queue_name: QueueName,
    closed: AtomicBool,
}

impl AzureReceiver {
    fn ensure_open(&self) -> Result<(), QueueError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(QueueError::LinkClosed {
                queue_name: self.queue_name.to_string(),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ReceiverLink for AzureReceiver {
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

        let mut batch = Vec::new();
        let mut wait_seconds = timeout.num_seconds();

        while batch.len() < max_messages as usize {
            match self.rest.receive_one(&self.queue_name, wait_seconds).await {
                Ok(Some(message)) => batch.push(message),
                Ok(None) => break,
                Err(e) if batch.is_empty() => return Err(e.to_queue_error()),
                Err(e) => {
                    // Messages already locked are handed back; the failed
                    // pull took nothing.
                    warn!(
                        queue = %self.queue_name,
                        received = batch.len(),
                        error = %e,
                        "Follow-up receive failed; returning partial batch"
                    );
                    break;
                }
            }
            wait_seconds = FOLLOW_UP_POLL_SECONDS;
        }

        debug!(queue = %self.queue_name, count = batch.len(), "Received batch from Service Bus");
        Ok(batch)
    }

    async fn complete_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.rest
            .settle(&self.queue_name, receipt, Method::DELETE, "complete")
            .await
            .map_err(AzureError::to_queue_error)
    }

    async fn abandon_message(&self, receipt: &ReceiptHandle) -> Result<(), QueueError> {
        self.ensure_open()?;
        self.rest
            .settle(&self.queue_name, receipt, Method::PUT, "abandon")
            .await
            .map_err(AzureError::to_queue_error)
    }

    async fn close(&self) -> Result<(), QueueError> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn queue_name(&self) -> &QueueName {
        &self.queue_name
    }
}
