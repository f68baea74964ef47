//! Message broker abstraction.
//!
//! The worker only talks to a [`Broker`]: declare the inbound binding, make
//! sure the outbound exchange exists, consume with a [`MessageHandler`] and
//! publish [`OutgoingMessage`]s. [`AmqpBroker`] is the RabbitMQ
//! implementation; [`MemoryBroker`] keeps everything in process.

mod amqp;
mod memory;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

pub use crate::config::AckMode;

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::warn;

/// Errors that can occur while talking to the broker
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("Failed to connect to broker: {0}")]
    Connection(String),

    #[error("Topology error: {0}")]
    Topology(String),

    #[error("Failed to publish to exchange {exchange}: {message}")]
    Publish { exchange: String, message: String },

    #[error("Consumer error: {0}")]
    Consume(String),

    #[error("Failed to serialize message: {0}")]
    Serialization(String),
}

/// Metadata about a received message
#[derive(Debug, Clone, Default)]
pub struct MessageMetadata {
    /// Exchange the message was published to
    pub exchange: String,
    pub routing_key: String,
    /// Broker-assigned tag, unique per channel
    pub delivery_tag: u64,
    /// The broker delivered this message before
    pub redelivered: bool,
    pub message_id: Option<String>,
    pub content_type: Option<String>,
    /// String-valued message headers
    pub headers: HashMap<String, String>,
}

/// A received message with payload and metadata
#[derive(Debug, Clone)]
pub struct IncomingMessage {
    pub payload: Vec<u8>,
    pub metadata: MessageMetadata,
}

impl IncomingMessage {
    pub fn new(payload: impl Into<Vec<u8>>) -> Self {
        Self {
            payload: payload.into(),
            metadata: MessageMetadata::default(),
        }
    }

    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.metadata.headers.get(key).map(|s| s.as_str())
    }

    /// Get the message type header
    pub fn message_type(&self) -> Option<&str> {
        self.header("message-type")
    }
}

/// Message to be published
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub payload: Vec<u8>,
    pub content_type: Option<String>,
    pub headers: Vec<(String, String)>,
}

impl OutgoingMessage {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        payload: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            payload: payload.into(),
            content_type: None,
            headers: Vec::new(),
        }
    }

    /// Create a new outgoing message with a JSON payload
    pub fn new_json<T: serde::Serialize>(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        message: &T,
    ) -> Result<Self, BrokerError> {
        let payload =
            serde_json::to_vec(message).map_err(|e| BrokerError::Serialization(e.to_string()))?;
        Ok(Self::new(exchange, routing_key, payload).with_content_type("application/json"))
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Add a header to the message
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((key.into(), value.into()));
        self
    }

    /// Add a message type header
    pub fn with_message_type(self, msg_type: impl Into<String>) -> Self {
        self.with_header("message-type", msg_type)
    }
}

/// Handler trait for processing messages
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Process a single message
    async fn handle(&self, message: &IncomingMessage) -> anyhow::Result<()>;

    /// Called when message processing fails
    async fn on_error(&self, message: &IncomingMessage, error: anyhow::Error) {
        warn!(
            exchange = %message.metadata.exchange,
            delivery_tag = message.metadata.delivery_tag,
            error = %error,
            "Message processing failed"
        );
    }
}

/// Broker capability used by the worker
#[async_trait]
pub trait Broker: Send + Sync {
    /// Bind `queue` to `exchange` with `routing_key` and remember it as the
    /// queue to consume. The exchange must already exist.
    async fn configure_inbound(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Check that `exchange` exists and allow publishing to it
    async fn configure_outbound(&self, exchange: &str) -> Result<(), BrokerError>;

    /// Deliver inbound messages to `handler`, one at a time, until `shutdown`
    /// is cancelled
    async fn consume(
        &self,
        handler: Arc<dyn MessageHandler>,
        ack_mode: AckMode,
        shutdown: CancellationToken,
    ) -> Result<(), BrokerError>;

    /// Publish to a configured outbound exchange
    async fn publish(&self, message: OutgoingMessage) -> Result<(), BrokerError>;

    async fn close(&self) -> Result<(), BrokerError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outgoing_json_message() {
        let message = OutgoingMessage::new_json("ex", "frame", &serde_json::json!({"a": 1}))
            .unwrap()
            .with_message_type("analyzed_frame")
            .with_header("stream-id", "cam-1");

        assert_eq!(message.payload, br#"{"a":1}"#);
        assert_eq!(message.content_type.as_deref(), Some("application/json"));
        assert_eq!(
            message.headers,
            vec![
                ("message-type".to_string(), "analyzed_frame".to_string()),
                ("stream-id".to_string(), "cam-1".to_string()),
            ]
        );
    }

    #[test]
    fn test_incoming_headers() {
        let mut message = IncomingMessage::new(br#"{"stream_id":"s"}"#.to_vec());
        message
            .metadata
            .headers
            .insert("message-type".to_string(), "raw_frame".to_string());

        assert_eq!(message.message_type(), Some("raw_frame"));
        assert_eq!(message.header("stream-id"), None);
    }
}
