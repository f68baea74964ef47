//! In-process [`Broker`] with direct-exchange routing.
//!
//! Exchanges must be declared up front, the same way they are provisioned
//! ahead of time on a real broker. Everything published is also recorded so
//! it can be inspected afterwards.

use super::{
    AckMode, Broker, BrokerError, IncomingMessage, MessageHandler, MessageMetadata,
    OutgoingMessage,
};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct Binding {
    exchange: String,
    routing_key: String,
    queue: String,
}

#[derive(Default)]
struct MemoryState {
    exchanges: BTreeSet<String>,
    bindings: Vec<Binding>,
    queues: HashMap<String, VecDeque<IncomingMessage>>,
    inbound: Option<String>,
    outbound: BTreeSet<String>,
    published: Vec<OutgoingMessage>,
    acked: Vec<u64>,
    rejected: Vec<u64>,
    next_tag: u64,
}

impl MemoryState {
    fn route(&mut self, exchange: &str, routing_key: &str, message: &OutgoingMessage) -> usize {
        let queues: Vec<String> = self
            .bindings
            .iter()
            .filter(|b| b.exchange == exchange && b.routing_key == routing_key)
            .map(|b| b.queue.clone())
            .collect();

        for queue in &queues {
            self.next_tag += 1;
            let incoming = IncomingMessage {
                payload: message.payload.clone(),
                metadata: MessageMetadata {
                    exchange: exchange.to_string(),
                    routing_key: routing_key.to_string(),
                    delivery_tag: self.next_tag,
                    redelivered: false,
                    message_id: None,
                    content_type: message.content_type.clone(),
                    headers: message.headers.iter().cloned().collect(),
                },
            };
            self.queues.entry(queue.clone()).or_default().push_back(incoming);
        }
        queues.len()
    }
}

/// Broker that lives entirely in memory
#[derive(Default)]
pub struct MemoryBroker {
    state: Mutex<MemoryState>,
    arrivals: Notify,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a broker with the given exchanges already declared
    pub fn with_exchanges<I, S>(exchanges: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let broker = Self::new();
        for exchange in exchanges {
            broker.declare_exchange(exchange);
        }
        broker
    }

    pub fn declare_exchange(&self, exchange: impl Into<String>) {
        self.lock().exchanges.insert(exchange.into());
    }

    /// Publish `payload` as an external producer would. Returns the number
    /// of queues it was routed to.
    pub fn deliver(&self, exchange: &str, routing_key: &str, payload: impl Into<Vec<u8>>) -> usize {
        let message = OutgoingMessage::new(exchange, routing_key, payload);
        let routed = self.lock().route(exchange, routing_key, &message);
        if routed > 0 {
            self.arrivals.notify_one();
        }
        routed
    }

    /// Every message accepted by [`Broker::publish`], in order
    pub fn published(&self) -> Vec<OutgoingMessage> {
        self.lock().published.clone()
    }

    /// Messages waiting in `queue`
    pub fn pending(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, VecDeque::len)
    }

    /// Delivery tags acknowledged, on receipt in auto mode and after
    /// success in manual mode
    pub fn acked(&self) -> Vec<u64> {
        self.lock().acked.clone()
    }

    /// Delivery tags rejected in manual ack mode
    pub fn rejected(&self) -> Vec<u64> {
        self.lock().rejected.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn next_message(&self, queue: &str) -> IncomingMessage {
        loop {
            let next = self.lock().queues.get_mut(queue).and_then(VecDeque::pop_front);
            if let Some(message) = next {
                return message;
            }
            self.arrivals.notified().await;
        }
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn configure_inbound(
        &self,
        exchange: &str,
        queue: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::Topology(format!(
                "exchange {} does not exist",
                exchange
            )));
        }

        state.queues.entry(queue.to_string()).or_default();
        let bound = state
            .bindings
            .iter()
            .any(|b| b.exchange == exchange && b.routing_key == routing_key && b.queue == queue);
        if !bound {
            state.bindings.push(Binding {
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                queue: queue.to_string(),
            });
        }
        state.inbound = Some(queue.to_string());
        Ok(())
    }

    async fn configure_outbound(&self, exchange: &str) -> Result<(), BrokerError> {
        let mut state = self.lock();
        if !state.exchanges.contains(exchange) {
            return Err(BrokerError::Topology(format!(
                "exchange {} does not exist",
                exchange
            )));
        }
        state.outbound.insert(exchange.to_string());
        Ok(())
    }

    async fn consume(
        &self,
        handler: Arc<dyn MessageHandler>,
        ack_mode: AckMode,
        shutdown: CancellationToken,
    ) -> Result<(), BrokerError> {
        let queue = self
            .lock()
            .inbound
            .clone()
            .ok_or_else(|| BrokerError::Topology("no inbound queue configured".to_string()))?;

        info!(queue = %queue, ack_mode = ?ack_mode, "Consuming");

        loop {
            let message = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                message = self.next_message(&queue) => message,
            };
            let tag = message.metadata.delivery_tag;
            debug!(delivery_tag = tag, "Received message");

            if ack_mode == AckMode::Auto {
                self.lock().acked.push(tag);
            }

            match handler.handle(&message).await {
                Ok(()) => {
                    if ack_mode == AckMode::Manual {
                        self.lock().acked.push(tag);
                    }
                }
                Err(e) => {
                    handler.on_error(&message, e).await;
                    if ack_mode == AckMode::Manual {
                        self.lock().rejected.push(tag);
                    }
                }
            }
        }

        info!("Consumption loop stopped");
        Ok(())
    }

    async fn publish(&self, message: OutgoingMessage) -> Result<(), BrokerError> {
        let routed = {
            let mut state = self.lock();
            if !state.outbound.contains(&message.exchange) {
                return Err(BrokerError::Publish {
                    exchange: message.exchange.clone(),
                    message: "exchange is not configured for publishing".to_string(),
                });
            }
            let routed = state.route(&message.exchange, &message.routing_key, &message);
            state.published.push(message);
            routed
        };
        if routed > 0 {
            self.arrivals.notify_one();
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), BrokerError> {
        Ok(())
    }
}
