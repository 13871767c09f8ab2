use crate::protocol::{Heartbeat, Topics};
use crate::state::BotReport;
use crate::transport::{BrokerTransport, InboundMessage, TransportError};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Source of truth for which bots are currently alive.
#[async_trait]
pub trait FleetDiscovery: Send + Sync {
    /// Returns every bot the broker currently considers alive.
    ///
    /// # Errors
    /// Returns a `TransportError` when the broker cannot be queried.
    async fn discover(&self) -> Result<Vec<BotReport>, TransportError>;
}

/// Discovers bots from the heartbeats they publish on `{ns}/+/heartbeat`.
///
/// A bot counts as alive while its latest heartbeat is younger than the
/// liveness window. An offline heartbeat (last will) drops it right away.
pub struct HeartbeatDiscovery {
    transport: Arc<dyn BrokerTransport>,
    liveness_window: chrono::Duration,
    seen: Arc<RwLock<HashMap<String, BotReport>>>,
}

impl HeartbeatDiscovery {
    /// Subscribes to the heartbeat topic and starts recording reports.
    ///
    /// # Errors
    /// Returns an error if the subscription cannot be registered.
    pub async fn attach(
        transport: Arc<dyn BrokerTransport>,
        topics: &Topics,
        liveness_window: Duration,
    ) -> Result<Self, TransportError> {
        let seen: Arc<RwLock<HashMap<String, BotReport>>> = Arc::new(RwLock::new(HashMap::new()));

        let table = Arc::clone(&seen);
        let layout = topics.clone();
        transport
            .subscribe(
                &topics.heartbeat_filter(),
                Arc::new(move |message: InboundMessage| {
                    record_heartbeat(&table, &layout, &message);
                }),
            )
            .await?;

        let liveness_window = chrono::Duration::from_std(liveness_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));

        Ok(Self {
            transport,
            liveness_window,
            seen,
        })
    }

    /// Number of bots with any recorded heartbeat, alive or not.
    #[must_use]
    pub fn known(&self) -> usize {
        self.seen.read().len()
    }
}

/// Records a heartbeat under the bot named by its topic. Payloads naming a
/// different bot are dropped.
fn record_heartbeat(
    table: &RwLock<HashMap<String, BotReport>>,
    topics: &Topics,
    message: &InboundMessage,
) {
    let Some(topic_bot) = topics.bot_from_topic(&message.topic) else {
        warn!(topic = %message.topic, "Dropping heartbeat on unexpected topic");
        return;
    };

    let heartbeat: Heartbeat = match serde_json::from_slice(&message.payload) {
        Ok(hb) => hb,
        Err(e) => {
            warn!(topic = %message.topic, error = %e, "Dropping malformed heartbeat");
            return;
        }
    };

    if heartbeat.bot_name != topic_bot {
        warn!(
            topic = %message.topic,
            claimed = %heartbeat.bot_name,
            "Dropping heartbeat whose bot name does not match its topic"
        );
        return;
    }

    if !heartbeat.online {
        if table.write().remove(&heartbeat.bot_name).is_some() {
            info!(bot = %heartbeat.bot_name, "Bot announced it is going offline");
        }
        return;
    }

    debug!(bot = %heartbeat.bot_name, status = %heartbeat.status, "Heartbeat received");
    let report = BotReport {
        name: heartbeat.bot_name.clone(),
        status: heartbeat.status,
        strategy: heartbeat.strategy,
        config: heartbeat.config,
        last_seen: Utc::now(),
    };
    table.write().insert(heartbeat.bot_name, report);
}

#[async_trait]
impl FleetDiscovery for HeartbeatDiscovery {
    async fn discover(&self) -> Result<Vec<BotReport>, TransportError> {
        if !self.transport.is_connected() {
            return Err(TransportError::NotConnected);
        }

        let cutoff = Utc::now() - self.liveness_window;
        let alive = self
            .seen
            .read()
            .values()
            .filter(|report| report.last_seen >= cutoff)
            .cloned()
            .collect();
        Ok(alive)
    }
}
