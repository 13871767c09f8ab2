pub mod commands;
pub mod controller;
pub mod discovery;
pub mod dispatcher;
pub mod error;
pub mod history;
pub mod mqtt;
pub mod protocol;
pub mod reconciler;
pub mod simulated;
pub mod state;
pub mod status_cache;
pub mod ticker;
pub mod transport;

pub use commands::{
    BotCommand, CommandKind, CommandOutcome, DispatchReport, ImportStrategyPayload, StartPayload,
    StopPayload,
};
pub use controller::FleetController;
pub use discovery::{FleetDiscovery, HeartbeatDiscovery};
pub use dispatcher::CommandDispatcher;
pub use error::FleetError;
pub use history::{HistoryEntry, HistoryEvent, HistoryStore};
pub use mqtt::MqttTransport;
pub use protocol::{AckMessage, CommandEnvelope, Heartbeat, Topics};
pub use reconciler::{ReconciliationLoop, TickOutcome};
pub use simulated::{SimulatedBot, SimulatedBroker};
pub use state::{BotConfig, BotInstance, BotReport, BotState};
pub use status_cache::{FleetSnapshot, StatusCache};
pub use ticker::{spawn_ticker, TickerHandle};
pub use transport::{BrokerTransport, InboundMessage, MessageHandler, TransportError};
