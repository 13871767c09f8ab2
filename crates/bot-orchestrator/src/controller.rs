use crate::commands::{BotCommand, DispatchReport, ImportStrategyPayload, StartPayload, StopPayload};
use crate::discovery::{FleetDiscovery, HeartbeatDiscovery};
use crate::dispatcher::CommandDispatcher;
use crate::error::FleetError;
use crate::history::{HistoryEntry, HistoryStore};
use crate::mqtt::MqttTransport;
use crate::protocol::Topics;
use crate::reconciler::{ReconciliationLoop, TickOutcome};
use crate::state::BotInstance;
use crate::status_cache::{FleetSnapshot, StatusCache};
use crate::ticker::{spawn_ticker, TickerHandle};
use crate::transport::BrokerTransport;
use botfleet_core::{BrokerConfig, FleetConfig};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// Entry point for the request layer and the scheduler.
///
/// Construct once at startup and share behind an `Arc`.
pub struct FleetController {
    transport: Arc<dyn BrokerTransport>,
    cache: Arc<StatusCache>,
    history: Arc<HistoryStore>,
    dispatcher: CommandDispatcher,
    reconciler: Arc<ReconciliationLoop>,
    ack_timeout: Duration,
}

impl FleetController {
    /// Connects to the MQTT broker described by `broker` and wires up the controller.
    ///
    /// # Errors
    /// Returns `FleetError::TransportUnavailable` if the broker cannot be reached.
    pub async fn connect(broker: &BrokerConfig, fleet: &FleetConfig) -> Result<Self, FleetError> {
        let transport: Arc<dyn BrokerTransport> = Arc::new(MqttTransport::new(broker.clone()));
        Self::with_transport(transport, Topics::new(broker.namespace.as_str()), fleet).await
    }

    /// Builds a controller over an already constructed transport, connecting it first.
    ///
    /// # Errors
    /// Returns `FleetError::TransportUnavailable` if the transport fails to
    /// connect or to register its subscriptions.
    pub async fn with_transport(
        transport: Arc<dyn BrokerTransport>,
        topics: Topics,
        fleet: &FleetConfig,
    ) -> Result<Self, FleetError> {
        transport.connect().await?;

        let discovery =
            HeartbeatDiscovery::attach(Arc::clone(&transport), &topics, fleet.liveness_window())
                .await?;
        Self::with_discovery(transport, topics, Arc::new(discovery), fleet).await
    }

    /// Like [`with_transport`](Self::with_transport) but with a caller-supplied
    /// discovery source. The transport must already be connected.
    ///
    /// # Errors
    /// Returns `FleetError::TransportUnavailable` if the ack subscription fails.
    pub async fn with_discovery(
        transport: Arc<dyn BrokerTransport>,
        topics: Topics,
        discovery: Arc<dyn FleetDiscovery>,
        fleet: &FleetConfig,
    ) -> Result<Self, FleetError> {
        let cache = Arc::new(StatusCache::new());
        let history = Arc::new(HistoryStore::new(fleet.history_capacity()));
        let dispatcher =
            CommandDispatcher::attach(Arc::clone(&transport), topics, Arc::clone(&history)).await?;
        let reconciler = Arc::new(ReconciliationLoop::new(
            discovery,
            Arc::clone(&cache),
            Arc::clone(&history),
        ));

        tracing::info!(
            ack_timeout_ms = fleet.ack_timeout_ms,
            history_capacity = fleet.history_capacity,
            "Fleet controller ready"
        );

        Ok(Self {
            transport,
            cache,
            history,
            dispatcher,
            reconciler,
            ack_timeout: fleet.ack_timeout(),
        })
    }

    /// Asks a bot to start and waits for its acknowledgment.
    ///
    /// # Errors
    /// Returns `FleetError::NotFound` for an undiscovered bot, or
    /// `FleetError::TransportUnavailable` if the command cannot be published.
    pub async fn start_bot(
        &self,
        bot_name: &str,
        payload: StartPayload,
    ) -> Result<DispatchReport, FleetError> {
        self.send(bot_name, BotCommand::Start(payload), true, self.ack_timeout)
            .await
    }

    /// Asks a bot to stop and waits for its acknowledgment.
    ///
    /// # Errors
    /// Returns `FleetError::NotFound` for an undiscovered bot, or
    /// `FleetError::TransportUnavailable` if the command cannot be published.
    pub async fn stop_bot(
        &self,
        bot_name: &str,
        payload: StopPayload,
    ) -> Result<DispatchReport, FleetError> {
        self.send(bot_name, BotCommand::Stop(payload), true, self.ack_timeout)
            .await
    }

    /// Sends a strategy to a bot and waits for its acknowledgment.
    ///
    /// # Errors
    /// Returns `FleetError::NotFound` for an undiscovered bot, or
    /// `FleetError::TransportUnavailable` if the command cannot be published.
    pub async fn import_strategy(
        &self,
        bot_name: &str,
        strategy: impl Into<String>,
    ) -> Result<DispatchReport, FleetError> {
        let command = BotCommand::ImportStrategy(ImportStrategyPayload {
            strategy: strategy.into(),
        });
        self.send(bot_name, command, true, self.ack_timeout).await
    }

    /// Dispatches any command with explicit wait semantics.
    ///
    /// # Errors
    /// Returns `FleetError::NotFound` for an undiscovered bot, or
    /// `FleetError::TransportUnavailable` if the command cannot be published.
    pub async fn send(
        &self,
        bot_name: &str,
        command: BotCommand,
        wait_for_ack: bool,
        timeout: Duration,
    ) -> Result<DispatchReport, FleetError> {
        if !self.cache.contains(bot_name) {
            return Err(FleetError::NotFound(bot_name.to_string()));
        }
        self.dispatcher
            .dispatch(bot_name, command, wait_for_ack, timeout)
            .await
    }

    /// Current fleet view.
    ///
    /// # Errors
    /// Returns `FleetError::EmptyFleet` when no bot has ever been discovered.
    pub fn get_all_status(&self) -> Result<HashMap<String, BotInstance>, FleetError> {
        self.cache
            .get_all()
            .map(|snapshot| snapshot.bots.clone())
            .ok_or(FleetError::EmptyFleet)
    }

    /// # Errors
    /// Returns `FleetError::NotFound` if the bot has never been discovered.
    pub fn get_status(&self, bot_name: &str) -> Result<BotInstance, FleetError> {
        self.cache
            .get(bot_name)
            .ok_or_else(|| FleetError::NotFound(bot_name.to_string()))
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<FleetSnapshot> {
        self.cache.snapshot()
    }

    /// History for a bot, oldest first. Never fails; unknown bots have none.
    #[must_use]
    pub fn get_history(&self, bot_name: &str) -> Vec<HistoryEntry> {
        self.history.get(bot_name)
    }

    #[must_use]
    pub fn get_recent_history(&self, bot_name: &str, limit: usize) -> Vec<HistoryEntry> {
        self.history.get_recent(bot_name, limit)
    }

    /// Runs one reconciliation pass. Safe to call while another is in flight.
    pub async fn tick(&self) -> TickOutcome {
        self.reconciler.tick().await
    }

    /// Starts an interval timer driving [`tick`](Self::tick).
    #[must_use]
    pub fn start_ticker(&self, period: Duration) -> TickerHandle {
        spawn_ticker(Arc::clone(&self.reconciler), period)
    }

    #[must_use]
    pub fn is_broker_connected(&self) -> bool {
        self.transport.is_connected()
    }

    #[must_use]
    pub fn pending_commands(&self) -> usize {
        self.dispatcher.pending_count()
    }

    /// Closes the broker session.
    ///
    /// # Errors
    /// Returns an error if the transport fails to disconnect cleanly.
    pub async fn shutdown(&self) -> Result<(), FleetError> {
        self.transport.disconnect().await?;
        Ok(())
    }
}
