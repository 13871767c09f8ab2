//! MQTT implementation of [`BrokerTransport`] on top of `rumqttc`.
//!
//! The event loop runs on its own task. It:
//!
//! - flips the connected flag on every `ConnAck` and connection error
//! - re-subscribes all registered filters after each reconnect
//! - routes inbound publishes to the subscription table
//! - backs off exponentially between reconnect attempts, capped at
//!   `max_reconnect_delay`
//!
//! Correlations waiting for acks are not carried across a reconnect; they
//! observe the connected flag dropping and fail on their own.

use crate::transport::{
    BrokerTransport, InboundMessage, MessageHandler, SubscriptionTable, TransportError,
};
use async_trait::async_trait;
use botfleet_core::BrokerConfig;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

const REQUEST_CHANNEL_CAPACITY: usize = 64;

struct Session {
    client: AsyncClient,
    shutdown_tx: mpsc::Sender<()>,
    task: JoinHandle<()>,
}

pub struct MqttTransport {
    config: BrokerConfig,
    subscriptions: Arc<SubscriptionTable>,
    state_tx: Arc<watch::Sender<bool>>,
    session: Mutex<Option<Session>>,
}

impl MqttTransport {
    #[must_use]
    pub fn new(config: BrokerConfig) -> Self {
        let (state_tx, _) = watch::channel(false);
        Self {
            config,
            subscriptions: Arc::new(SubscriptionTable::default()),
            state_tx: Arc::new(state_tx),
            session: Mutex::new(None),
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(
            self.config.client_id.as_str(),
            self.config.host.as_str(),
            self.config.port,
        );
        options.set_keep_alive(self.config.keep_alive());
        options.set_clean_session(true);
        if self.config.has_credentials() {
            options.set_credentials(self.config.username.as_str(), self.config.password.as_str());
        }
        options
    }

    fn client(&self) -> Option<AsyncClient> {
        self.session.lock().as_ref().map(|s| s.client.clone())
    }
}

#[async_trait]
impl BrokerTransport for MqttTransport {
    async fn connect(&self) -> Result<(), TransportError> {
        if self.session.lock().is_some() {
            return Ok(());
        }

        info!(
            host = %self.config.host,
            port = self.config.port,
            client_id = %self.config.client_id,
            "Connecting to MQTT broker"
        );

        let (client, eventloop) = AsyncClient::new(self.options(), REQUEST_CHANNEL_CAPACITY);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);

        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            Arc::clone(&self.subscriptions),
            Arc::clone(&self.state_tx),
            ready_tx,
            shutdown_rx,
            Backoff::new(
                self.config.initial_reconnect_delay(),
                self.config.max_reconnect_delay(),
            ),
        ));

        let failure = match tokio::time::timeout(self.config.connect_timeout(), ready_rx).await {
            Ok(Ok(Ok(()))) => None,
            Ok(Ok(Err(reason))) => Some(reason),
            Ok(Err(_)) => Some("event loop exited before connecting".to_string()),
            Err(_) => Some(format!(
                "no acknowledgment from {}:{} within {:?}",
                self.config.host,
                self.config.port,
                self.config.connect_timeout()
            )),
        };

        if let Some(reason) = failure {
            task.abort();
            error!(%reason, "MQTT connect failed");
            return Err(TransportError::ConnectionFailed(reason));
        }

        *self.session.lock() = Some(Session {
            client,
            shutdown_tx,
            task,
        });
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        let client = self.client().ok_or(TransportError::NotConnected)?;
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }

        client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }

    async fn subscribe(&self, filter: &str, handler: MessageHandler) -> Result<(), TransportError> {
        let is_new = self.subscriptions.add(filter, handler);
        if !is_new {
            return Ok(());
        }

        // While disconnected the filter is picked up on the next ConnAck.
        if let Some(client) = self.client() {
            if self.is_connected() {
                client
                    .subscribe(filter, QoS::AtLeastOnce)
                    .await
                    .map_err(|e| TransportError::Subscribe(e.to_string()))?;
            }
        }
        debug!(%filter, "Subscribed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        *self.state_tx.borrow()
    }

    fn connection_state(&self) -> watch::Receiver<bool> {
        self.state_tx.subscribe()
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let Some(session) = self.session.lock().take() else {
            return Ok(());
        };

        let _ = session.shutdown_tx.send(()).await;
        if let Err(e) = session.client.disconnect().await {
            debug!(error = %e, "MQTT disconnect request not delivered");
        }
        self.state_tx.send_replace(false);
        if let Err(e) = session.task.await {
            warn!(error = %e, "MQTT event loop ended abnormally");
        }
        info!("Disconnected from MQTT broker");
        Ok(())
    }
}

/// Exponential reconnect delay, doubled per failure and capped.
#[derive(Debug, Clone)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
}

impl Backoff {
    fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            current: initial,
        }
    }

    fn next_delay(&mut self) -> Duration {
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        delay
    }

    fn reset(&mut self) {
        self.current = self.initial;
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    subscriptions: Arc<SubscriptionTable>,
    state_tx: Arc<watch::Sender<bool>>,
    ready_tx: oneshot::Sender<Result<(), String>>,
    mut shutdown_rx: mpsc::Receiver<()>,
    mut backoff: Backoff,
) {
    let mut ready_tx = Some(ready_tx);
    let mut attempts: u32 = 0;

    loop {
        let event = tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("MQTT event loop shutdown requested");
                break;
            }
            event = eventloop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                if attempts > 0 {
                    info!(attempts, "Reconnected to MQTT broker");
                } else {
                    info!("Connected to MQTT broker");
                }
                attempts = 0;
                backoff.reset();

                // try_subscribe: the request channel is drained by this very loop.
                for filter in subscriptions.filters() {
                    if let Err(e) = client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                        warn!(%filter, error = %e, "Failed to restore subscription");
                    }
                }

                state_tx.send_replace(true);
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if subscriptions.dispatch(&message) == 0 {
                    debug!(topic = %message.topic, "No handler for inbound message");
                }
            }
            Ok(_) => {}
            Err(e) => {
                state_tx.send_replace(false);

                // The first connection attempt is reported to `connect` instead of retried.
                if let Some(tx) = ready_tx.take() {
                    let _ = tx.send(Err(e.to_string()));
                    break;
                }

                attempts += 1;
                let delay = backoff.next_delay();
                error!(error = %e, attempt = attempts, ?delay, "MQTT connection lost, retrying");

                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    () = sleep(delay) => {}
                }
            }
        }
    }

    state_tx.send_replace(false);
}
