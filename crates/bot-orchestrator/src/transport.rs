//! Broker transport abstraction shared by the dispatcher and the reconciler.
//!
//! A transport owns one multiplexed broker session. Inbound messages are
//! routed to handlers registered with [`BrokerTransport::subscribe`] on the
//! transport's own dispatch task, so handlers must return quickly.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::watch;

/// A message received from the broker.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Callback invoked for every inbound message matching a subscription filter.
pub type MessageHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Not connected to broker")]
    NotConnected,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Subscribe failed: {0}")]
    Subscribe(String),

    #[error("Encode error: {0}")]
    Encode(#[from] serde_json::Error),
}

#[async_trait]
pub trait BrokerTransport: Send + Sync {
    /// Establishes the broker session.
    ///
    /// # Errors
    /// Returns `TransportError::ConnectionFailed` if the broker is unreachable.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Publishes a message to a topic.
    ///
    /// # Errors
    /// Returns `TransportError::NotConnected` when no session is up, or
    /// `TransportError::Publish` when the broker client rejects the message.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    /// Registers a handler for a topic filter (MQTT wildcards `+` and `#`).
    ///
    /// Subscriptions survive reconnects.
    ///
    /// # Errors
    /// Returns `TransportError::Subscribe` if the broker rejects the filter.
    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), TransportError>;

    fn is_connected(&self) -> bool;

    /// Watch channel carrying the current connected flag.
    fn connection_state(&self) -> watch::Receiver<bool>;

    /// Closes the session. Further publishes fail with `NotConnected`.
    ///
    /// # Errors
    /// Returns an error if the broker client fails to close cleanly.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// Matches a concrete topic against an MQTT topic filter.
#[must_use]
pub fn topic_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(f), Some(t)) if f == t => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

struct Subscription {
    filter: String,
    handler: MessageHandler,
}

/// Filter-to-handler routing table used by the transport implementations.
#[derive(Default)]
pub(crate) struct SubscriptionTable {
    entries: RwLock<Vec<Subscription>>,
}

impl SubscriptionTable {
    /// Adds a handler. Returns `true` if the filter was not subscribed before.
    pub(crate) fn add(&self, filter: &str, handler: MessageHandler) -> bool {
        let mut entries = self.entries.write();
        let is_new = !entries.iter().any(|s| s.filter == filter);
        entries.push(Subscription {
            filter: filter.to_string(),
            handler,
        });
        is_new
    }

    pub(crate) fn filters(&self) -> Vec<String> {
        let mut filters: Vec<String> = self
            .entries
            .read()
            .iter()
            .map(|s| s.filter.clone())
            .collect();
        filters.sort();
        filters.dedup();
        filters
    }

    /// Invokes every matching handler and returns how many ran.
    pub(crate) fn dispatch(&self, message: &InboundMessage) -> usize {
        // Handlers run outside the lock so they may subscribe or publish.
        let handlers: Vec<MessageHandler> = self
            .entries
            .read()
            .iter()
            .filter(|s| topic_matches(&s.filter, &message.topic))
            .map(|s| Arc::clone(&s.handler))
            .collect();

        for handler in &handlers {
            handler(message.clone());
        }
        handlers.len()
    }
}
