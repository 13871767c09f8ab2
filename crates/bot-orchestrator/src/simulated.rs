//! In-process broker and bot doubles.
//!
//! [`SimulatedBroker`] routes messages between subscribers exactly like a
//! real broker would, on a single delivery task so ordering is preserved.
//! [`SimulatedBot`] plays the bot side of the protocol: it answers
//! commands, publishes heartbeats and can drop off the fleet.
//!
//! Used by the test suites and by the CLI's `--simulated` mode.

use crate::commands::BotCommand;
use crate::protocol::{AckMessage, CommandEnvelope, Heartbeat, Topics};
use crate::state::{BotConfig, BotState};
use crate::transport::{
    topic_matches, BrokerTransport, InboundMessage, MessageHandler, SubscriptionTable,
    TransportError,
};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

enum Delivery {
    Message(InboundMessage),
    Flush(oneshot::Sender<()>),
}

struct BrokerInner {
    subscriptions: SubscriptionTable,
    state_tx: watch::Sender<bool>,
    session_open: AtomicBool,
    reachable: AtomicBool,
    published: Mutex<Vec<InboundMessage>>,
    deliveries: mpsc::UnboundedSender<Delivery>,
}

impl BrokerInner {
    fn deliver(&self, topic: &str, payload: Vec<u8>) {
        let message = InboundMessage {
            topic: topic.to_string(),
            payload,
        };
        if self.deliveries.send(Delivery::Message(message)).is_err() {
            debug!(%topic, "Delivery task gone, message dropped");
        }
    }

    fn refresh_state(&self) {
        let up = self.session_open.load(Ordering::SeqCst) && self.reachable.load(Ordering::SeqCst);
        self.state_tx.send_replace(up);
    }
}

/// Loopback broker. Cheap to clone; clones share the same routing table.
#[derive(Clone)]
pub struct SimulatedBroker {
    inner: Arc<BrokerInner>,
}

impl SimulatedBroker {
    /// Creates the broker and its delivery task. Must be called inside a Tokio runtime.
    #[must_use]
    pub fn new() -> Self {
        let (deliveries, mut rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(false);
        let inner = Arc::new(BrokerInner {
            subscriptions: SubscriptionTable::default(),
            state_tx,
            session_open: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            published: Mutex::new(Vec::new()),
            deliveries,
        });

        let weak: Weak<BrokerInner> = Arc::downgrade(&inner);
        tokio::spawn(async move {
            while let Some(delivery) = rx.recv().await {
                match delivery {
                    Delivery::Message(message) => {
                        let Some(inner) = weak.upgrade() else { break };
                        if !inner.reachable.load(Ordering::SeqCst) {
                            debug!(topic = %message.topic, "Broker unreachable, message dropped");
                            continue;
                        }
                        inner.subscriptions.dispatch(&message);
                    }
                    Delivery::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { inner }
    }

    #[must_use]
    pub fn transport(&self) -> Arc<dyn BrokerTransport> {
        Arc::new(self.clone())
    }

    /// Delivers a message to subscribers as if another client had published it.
    pub fn inject(&self, topic: &str, payload: Vec<u8>) {
        self.inner.deliver(topic, payload);
    }

    /// Resolves once every message queued before this call has been handled.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.inner.deliveries.send(Delivery::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Simulates the broker going away or coming back.
    pub fn set_reachable(&self, reachable: bool) {
        self.inner.reachable.store(reachable, Ordering::SeqCst);
        self.inner.refresh_state();
    }

    /// Every message published through the transport, in order.
    #[must_use]
    pub fn published(&self) -> Vec<InboundMessage> {
        self.inner.published.lock().clone()
    }

    #[must_use]
    pub fn published_to(&self, filter: &str) -> Vec<InboundMessage> {
        self.inner
            .published
            .lock()
            .iter()
            .filter(|m| topic_matches(filter, &m.topic))
            .cloned()
            .collect()
    }

    fn downgrade(&self) -> Weak<BrokerInner> {
        Arc::downgrade(&self.inner)
    }
}

impl Default for SimulatedBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerTransport for SimulatedBroker {
    async fn connect(&self) -> Result<(), TransportError> {
        if !self.inner.reachable.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "simulated broker unreachable".to_string(),
            ));
        }
        self.inner.session_open.store(true, Ordering::SeqCst);
        self.inner.refresh_state();
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.inner.published.lock().push(InboundMessage {
            topic: topic.to_string(),
            payload: payload.clone(),
        });
        self.inner.deliver(topic, payload);
        Ok(())
    }

    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), TransportError> {
        self.inner.subscriptions.add(filter, handler);
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.inner.state_tx.borrow()
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.inner.state_tx.subscribe()
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        self.inner.session_open.store(false, Ordering::SeqCst);
        self.inner.refresh_state();
        Ok(())
    }
}

struct BotSim {
    status: BotState,
    strategy: Option<String>,
    config: BotConfig,
}

struct BotInner {
    name: String,
    topics: Topics,
    broker: Weak<BrokerInner>,
    sim: Mutex<BotSim>,
    auto_ack: AtomicBool,
    received: Mutex<Vec<CommandEnvelope>>,
}

impl BotInner {
    fn send(&self, topic: &str, payload: Vec<u8>) {
        match self.broker.upgrade() {
            Some(broker) => broker.deliver(topic, payload),
            None => debug!(bot = %self.name, "Broker dropped, bot is silent"),
        }
    }

    fn heartbeat(&self, online: bool) {
        let beat = {
            let sim = self.sim.lock();
            Heartbeat {
                bot_name: self.name.clone(),
                status: sim.status,
                strategy: sim.strategy.clone(),
                config: Some(sim.config.clone()),
                timestamp: Some(Utc::now()),
                online,
            }
        };
        match serde_json::to_vec(&beat) {
            Ok(payload) => self.send(&self.topics.heartbeat(&self.name), payload),
            Err(e) => warn!(bot = %self.name, error = %e, "Failed to encode heartbeat"),
        }
    }

    fn handle_command(&self, message: &InboundMessage) {
        let envelope: CommandEnvelope = match serde_json::from_slice(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(bot = %self.name, error = %e, "Simulated bot got malformed command");
                return;
            }
        };

        let reply = {
            let mut sim = self.sim.lock();
            match &envelope.command {
                BotCommand::Start(payload) => {
                    sim.status = BotState::Running;
                    sim.config = BotConfig {
                        script: payload.script.clone(),
                        conf: payload.conf.clone(),
                        log_level: payload.log_level.clone(),
                        async_backend: payload.async_backend,
                    };
                    "started"
                }
                BotCommand::Stop(_) => {
                    sim.status = BotState::Stopped;
                    "stopped"
                }
                BotCommand::ImportStrategy(payload) => {
                    sim.strategy = Some(payload.strategy.clone());
                    "strategy imported"
                }
            }
        };

        let correlation_id = envelope.correlation_id;
        self.received.lock().push(envelope);

        if self.auto_ack.load(Ordering::SeqCst) {
            let ack = AckMessage {
                correlation_id,
                bot_name: self.name.clone(),
                success: true,
                message: Some(reply.to_string()),
                data: serde_json::Value::Null,
            };
            match serde_json::to_vec(&ack) {
                Ok(payload) => self.send(&self.topics.ack(&self.name), payload),
                Err(e) => warn!(bot = %self.name, error = %e, "Failed to encode ack"),
            }
        }
        self.heartbeat(true);
    }
}

/// Scripted bot attached to a [`SimulatedBroker`].
#[derive(Clone)]
pub struct SimulatedBot {
    inner: Arc<BotInner>,
}

impl SimulatedBot {
    /// Subscribes the bot to its command topic. Auto-ack is on by default.
    #[must_use]
    pub fn attach(broker: &SimulatedBroker, topics: &Topics, name: &str, status: BotState) -> Self {
        let inner = Arc::new(BotInner {
            name: name.to_string(),
            topics: topics.clone(),
            broker: broker.downgrade(),
            sim: Mutex::new(BotSim {
                status,
                strategy: None,
                config: BotConfig::default(),
            }),
            auto_ack: AtomicBool::new(true),
            received: Mutex::new(Vec::new()),
        });

        let handler_inner = Arc::clone(&inner);
        let handler: MessageHandler = Arc::new(move |message: InboundMessage| {
            handler_inner.handle_command(&message);
        });
        broker.inner.subscriptions.add(&topics.commands(name), handler);

        Self { inner }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// When off, commands are applied but never acknowledged.
    pub fn set_auto_ack(&self, enabled: bool) {
        self.inner.auto_ack.store(enabled, Ordering::SeqCst);
    }

    pub fn set_status(&self, status: BotState) {
        self.inner.sim.lock().status = status;
    }

    pub fn set_strategy(&self, strategy: impl Into<String>) {
        self.inner.sim.lock().strategy = Some(strategy.into());
    }

    #[must_use]
    pub fn status(&self) -> BotState {
        self.inner.sim.lock().status
    }

    #[must_use]
    pub fn strategy(&self) -> Option<String> {
        self.inner.sim.lock().strategy.clone()
    }

    #[must_use]
    pub fn received(&self) -> Vec<CommandEnvelope> {
        self.inner.received.lock().clone()
    }

    pub fn heartbeat(&self) {
        self.inner.heartbeat(true);
    }

    /// Announces departure, the way a broker would deliver a last will.
    pub fn go_offline(&self) {
        self.inner.heartbeat(false);
    }

    /// Publishes a heartbeat every `period` until aborted or the broker is dropped.
    #[must_use]
    pub fn spawn_heartbeats(&self, period: Duration) -> JoinHandle<()> {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            loop {
                interval.tick().await;
                if inner.broker.strong_count() == 0 {
                    break;
                }
                inner.heartbeat(true);
            }
        })
    }
}
