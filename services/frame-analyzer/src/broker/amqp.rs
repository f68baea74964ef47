//! RabbitMQ implementation of [`Broker`] on top of `lapin`.
//!
//! The connection is opened lazily and re-opened after it drops. Topology is
//! recorded when configured and replayed on every new session, so a
//! reconnect resumes consuming the same queue and publishing to the same
//! exchanges.

use super::{
    AckMode, Broker, BrokerError, IncomingMessage, MessageHandler, MessageMetadata,
    OutgoingMessage,
};
use crate::config::BrokerConfig;
use async_trait::async_trait;
use futures::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicCancelOptions, BasicConsumeOptions, BasicPublishOptions,
    BasicQosOptions, BasicRejectOptions, ConfirmSelectOptions, ExchangeDeclareOptions,
    QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties, Consumer, ExchangeKind};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Persistent delivery mode
const PERSISTENT: u8 = 2;

#[derive(Debug, Clone, PartialEq, Eq)]
struct InboundBinding {
    exchange: String,
    queue: String,
    routing_key: String,
}

struct Session {
    connection: Connection,
    channel: Channel,
}

impl Session {
    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    /// Close a session that failed topology setup
    async fn discard(self, reason: &str) {
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(0, reason).await {
                debug!(error = %e, "Failed to close discarded broker connection");
            }
        }
    }
}

#[derive(Default)]
struct State {
    session: Option<Session>,
    inbound: Option<InboundBinding>,
    outbound: BTreeSet<String>,
}

/// A consumer together with the channel it runs on
struct ActiveConsumer {
    channel: Channel,
    consumer: Consumer,
    tag: String,
}

/// RabbitMQ broker client
pub struct AmqpBroker {
    config: BrokerConfig,
    state: Mutex<State>,
}

impl AmqpBroker {
    pub fn new(config: BrokerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(State::default()),
        }
    }

    /// Open the connection now instead of on first use
    pub async fn connect(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        self.channel(&mut state).await.map(|_| ())
    }

    /// Return an open channel, connecting and replaying topology when needed
    async fn channel(&self, state: &mut State) -> Result<Channel, BrokerError> {
        if let Some(session) = state.session.as_ref().filter(|s| s.is_open()) {
            return Ok(session.channel.clone());
        }

        if let Some(stale) = state.session.take() {
            warn!(endpoint = %self.config.endpoint(), "Broker session lost, reconnecting");
            stale.discard("reconnecting").await;
        }

        let session = self.open_session().await?;
        let channel = session.channel.clone();

        if let Err(e) = replay_topology(&channel, state).await {
            session.discard("topology replay failed").await;
            return Err(e);
        }

        state.session = Some(session);
        Ok(channel)
    }

    /// Drop the current session after a failed passive declare closed its channel
    async fn reset(&self, state: &mut State) {
        if let Some(session) = state.session.take() {
            session.discard("topology check failed").await;
        }
    }

    async fn open_session(&self) -> Result<Session, BrokerError> {
        info!(
            endpoint = %self.config.endpoint(),
            connection_name = %self.config.connection_name,
            "Connecting to broker"
        );

        let properties = ConnectionProperties::default()
            .with_connection_name(self.config.connection_name.clone().into());
        let connection = Connection::connect_uri(self.config.amqp_uri(), properties)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        let channel = connection
            .create_channel()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        channel
            .basic_qos(self.config.prefetch_count, BasicQosOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;

        info!(endpoint = %self.config.endpoint(), "Connected to broker");
        Ok(Session { connection, channel })
    }

    async fn start_consumer(&self, ack_mode: AckMode) -> Result<ActiveConsumer, BrokerError> {
        let (channel, queue) = {
            let mut state = self.state.lock().await;
            let queue = state
                .inbound
                .as_ref()
                .map(|binding| binding.queue.clone())
                .ok_or_else(|| BrokerError::Topology("no inbound queue configured".to_string()))?;
            (self.channel(&mut state).await?, queue)
        };

        // Auto mode still acks explicitly so prefetch bounds the deliveries in flight
        let tag = format!("{}-{}", self.config.connection_name, Uuid::new_v4());
        let options = BasicConsumeOptions {
            no_ack: false,
            ..Default::default()
        };
        let consumer = channel
            .basic_consume(&queue, &tag, options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::Consume(e.to_string()))?;

        info!(queue = %queue, consumer_tag = %tag, ack_mode = ?ack_mode, "Consuming");
        Ok(ActiveConsumer {
            channel,
            consumer,
            tag,
        })
    }

    async fn dispatch(&self, handler: &dyn MessageHandler, delivery: Delivery, ack_mode: AckMode) {
        let incoming = convert_delivery(&delivery);

        debug!(
            exchange = %incoming.metadata.exchange,
            routing_key = %incoming.metadata.routing_key,
            delivery_tag = incoming.metadata.delivery_tag,
            redelivered = incoming.metadata.redelivered,
            size_bytes = incoming.payload.len(),
            "Received message"
        );

        if ack_mode == AckMode::Auto {
            if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                error!(error = %e, "Failed to ack message");
            }
        }

        match handler.handle(&incoming).await {
            Ok(()) => {
                if ack_mode == AckMode::Manual {
                    if let Err(e) = delivery.acker.ack(BasicAckOptions::default()).await {
                        error!(error = %e, "Failed to ack message");
                    }
                }
            }
            Err(e) => {
                handler.on_error(&incoming, e).await;
                if ack_mode == AckMode::Manual {
                    if let Err(e) = delivery
                        .acker
                        .reject(BasicRejectOptions { requeue: false })
                        .await
                    {
                        error!(error = %e, "Failed to reject message");
                    }
                }
            }
        }
    }

    /// Sleep before reconnecting; `false` when shutdown arrived first
    async fn wait_reconnect(&self, shutdown: &CancellationToken) -> bool {
        let delay = self.config.reconnect_delay();
        info!(delay_ms = delay.as_millis() as u64, "Waiting before reconnect");
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    #[instrument(skip(self))]
    async fn configure_inbound(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let binding = InboundBinding {
            exchange: exchange.to_string(),
            queue: queue.to_string(),
            routing_key: routing_key.to_string(),
        };

        let mut state = self.state.lock().await;
        let channel = self.channel(&mut state).await?;
        if let Err(e) = declare_inbound(&channel, &binding).await {
            // A failed passive declare closes the channel
            self.reset(&mut state).await;
            return Err(e);
        }

        info!(exchange, queue, routing_key, "Inbound binding configured");
        state.inbound = Some(binding);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn configure_outbound(&self, exchange: &str) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        let channel = self.channel(&mut state).await?;
        if let Err(e) = check_exchange(&channel, exchange).await {
            self.reset(&mut state).await;
            return Err(e);
        }

        info!(exchange, "Outbound exchange configured");
        state.outbound.insert(exchange.to_string());
        Ok(())
    }

    async fn consume(
        &self,
        handler: Arc<dyn MessageHandler>,
        ack_mode: AckMode,
        shutdown: CancellationToken,
    ) -> Result<(), BrokerError> {
        info!("Starting message consumption loop");

        loop {
            let mut current = match self.start_consumer(ack_mode).await {
                Ok(current) => current,
                Err(e @ BrokerError::Topology(_)) => return Err(e),
                Err(e) => {
                    error!(error = %e, "Failed to start consumer");
                    if self.wait_reconnect(&shutdown).await {
                        continue;
                    }
                    break;
                }
            };

            let stopped = loop {
                tokio::select! {
                    biased;
                    _ = shutdown.cancelled() => break true,
                    delivery = current.consumer.next() => match delivery {
                        Some(Ok(delivery)) => self.dispatch(handler.as_ref(), delivery, ack_mode).await,
                        Some(Err(e)) => {
                            warn!(error = %e, "Consumer stream failed");
                            break false;
                        }
                        None => {
                            warn!("Consumer stream ended");
                            break false;
                        }
                    }
                }
            };

            if stopped {
                info!("Received shutdown signal");
                if let Err(e) = current
                    .channel
                    .basic_cancel(&current.tag, BasicCancelOptions::default())
                    .await
                {
                    warn!(error = %e, "Failed to cancel consumer");
                }
                break;
            }

            if !self.wait_reconnect(&shutdown).await {
                break;
            }
        }

        info!("Consumption loop stopped");
        Ok(())
    }

    #[instrument(skip(self, message), fields(exchange = %message.exchange, routing_key = %message.routing_key))]
    async fn publish(&self, message: OutgoingMessage) -> Result<(), BrokerError> {
        let channel = {
            let mut state = self.state.lock().await;
            if !state.outbound.contains(&message.exchange) {
                return Err(BrokerError::Publish {
                    exchange: message.exchange.clone(),
                    message: "exchange is not configured for publishing".to_string(),
                });
            }
            self.channel(&mut state).await?
        };

        let confirm = channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.payload,
                properties(&message),
            )
            .await
            .map_err(|e| BrokerError::Publish {
                exchange: message.exchange.clone(),
                message: e.to_string(),
            })?
            .await
            .map_err(|e| BrokerError::Publish {
                exchange: message.exchange.clone(),
                message: e.to_string(),
            })?;

        if let Confirmation::Nack(_) = confirm {
            return Err(BrokerError::Publish {
                exchange: message.exchange.clone(),
                message: "broker rejected the message".to_string(),
            });
        }

        debug!(size_bytes = message.payload.len(), "Message published");
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        let mut state = self.state.lock().await;
        if let Some(session) = state.session.take() {
            info!(endpoint = %self.config.endpoint(), "Closing broker connection");
            if session.channel.status().connected() {
                session
                    .channel
                    .close(200, "bye")
                    .await
                    .map_err(|e| BrokerError::Connection(e.to_string()))?;
            }
            if session.connection.status().connected() {
                session
                    .connection
                    .close(200, "bye")
                    .await
                    .map_err(|e| BrokerError::Connection(e.to_string()))?;
            }
        }
        Ok(())
    }
}

/// Passive declare: fails when the exchange does not exist
async fn check_exchange(channel: &Channel, exchange: &str) -> Result<(), BrokerError> {
    let options = ExchangeDeclareOptions {
        passive: true,
        ..Default::default()
    };
    channel
        .exchange_declare(exchange, ExchangeKind::Direct, options, FieldTable::default())
        .await
        .map_err(|e| BrokerError::Topology(format!("exchange {}: {}", exchange, e)))
}

/// Re-declare the recorded topology on a fresh channel
async fn replay_topology(channel: &Channel, state: &State) -> Result<(), BrokerError> {
    if let Some(binding) = &state.inbound {
        declare_inbound(channel, binding).await?;
    }
    for exchange in &state.outbound {
        check_exchange(channel, exchange).await?;
    }
    Ok(())
}

async fn declare_inbound(channel: &Channel, binding: &InboundBinding) -> Result<(), BrokerError> {
    check_exchange(channel, &binding.exchange).await?;

    channel
        .queue_declare(
            &binding.queue,
            QueueDeclareOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| BrokerError::Topology(format!("queue {}: {}", binding.queue, e)))?;

    channel
        .queue_bind(
            &binding.queue,
            &binding.exchange,
            &binding.routing_key,
            QueueBindOptions::default(),
            FieldTable::default(),
        )
        .await
        .map_err(|e| {
            BrokerError::Topology(format!(
                "bind {} -> {}: {}",
                binding.exchange, binding.queue, e
            ))
        })
}

fn properties(message: &OutgoingMessage) -> BasicProperties {
    let mut properties = BasicProperties::default()
        .with_delivery_mode(PERSISTENT)
        .with_message_id(Uuid::new_v4().to_string().into());

    if let Some(content_type) = &message.content_type {
        properties = properties.with_content_type(content_type.clone().into());
    }

    if !message.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &message.headers {
            table.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(value.clone().into()),
            );
        }
        properties = properties.with_headers(table);
    }

    properties
}

/// Convert a delivery to our IncomingMessage type
fn convert_delivery(delivery: &Delivery) -> IncomingMessage {
    let properties = &delivery.properties;

    let mut headers = HashMap::new();
    if let Some(table) = properties.headers() {
        for (key, value) in table.inner() {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => continue,
            };
            headers.insert(key.as_str().to_string(), value);
        }
    }

    IncomingMessage {
        payload: delivery.data.clone(),
        metadata: MessageMetadata {
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            delivery_tag: delivery.delivery_tag,
            redelivered: delivery.redelivered,
            message_id: properties.message_id().as_ref().map(|id| id.as_str().to_string()),
            content_type: properties
                .content_type()
                .as_ref()
                .map(|ct| ct.as_str().to_string()),
            headers,
        },
    }
}
