use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub fleet: FleetConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_server_host")]
    pub host: String,
    #[serde(default = "default_server_port")]
    pub port: u16,
}

impl ServerConfig {
    #[must_use]
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_server_host(),
            port: default_server_port(),
        }
    }
}

/// Connection settings for the message broker the bots listen on.
#[derive(Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_host")]
    pub host: String,
    #[serde(default = "default_broker_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
    /// Root of every topic the controller publishes or subscribes to.
    #[serde(default = "default_namespace")]
    pub namespace: String,
    #[serde(default = "default_keep_alive_secs")]
    pub keep_alive_secs: u64,
    /// How long `connect` waits for the first session acknowledgment.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_initial_reconnect_delay_ms")]
    pub initial_reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,
}

impl BrokerConfig {
    #[must_use]
    pub const fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    #[must_use]
    pub const fn initial_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.initial_reconnect_delay_ms)
    }

    #[must_use]
    pub const fn max_reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.max_reconnect_delay_ms)
    }

    #[must_use]
    pub fn has_credentials(&self) -> bool {
        !self.username.is_empty()
    }
}

// Hand-written so the password never reaches the logs.
impl fmt::Debug for BrokerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("client_id", &self.client_id)
            .field("namespace", &self.namespace)
            .field("keep_alive_secs", &self.keep_alive_secs)
            .field("connect_timeout_ms", &self.connect_timeout_ms)
            .field("initial_reconnect_delay_ms", &self.initial_reconnect_delay_ms)
            .field("max_reconnect_delay_ms", &self.max_reconnect_delay_ms)
            .finish()
    }
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            host: default_broker_host(),
            port: default_broker_port(),
            username: String::new(),
            password: String::new(),
            client_id: default_client_id(),
            namespace: default_namespace(),
            keep_alive_secs: default_keep_alive_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            initial_reconnect_delay_ms: default_initial_reconnect_delay_ms(),
            max_reconnect_delay_ms: default_max_reconnect_delay_ms(),
        }
    }
}

/// Timing and retention knobs for the fleet controller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    /// A bot with no heartbeat inside this window is no longer discovered.
    #[serde(default = "default_liveness_window_secs")]
    pub liveness_window_secs: u64,
    /// Entries kept per bot; 0 keeps everything.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
}

impl FleetConfig {
    #[must_use]
    pub const fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    #[must_use]
    pub const fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    #[must_use]
    pub const fn liveness_window(&self) -> Duration {
        Duration::from_secs(self.liveness_window_secs)
    }

    #[must_use]
    pub const fn history_capacity(&self) -> Option<usize> {
        if self.history_capacity == 0 {
            None
        } else {
            Some(self.history_capacity)
        }
    }
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            reconcile_interval_secs: default_reconcile_interval_secs(),
            ack_timeout_ms: default_ack_timeout_ms(),
            liveness_window_secs: default_liveness_window_secs(),
            history_capacity: default_history_capacity(),
        }
    }
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}

const fn default_server_port() -> u16 {
    8000
}

fn default_broker_host() -> String {
    "localhost".to_string()
}

const fn default_broker_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "botfleet-controller".to_string()
}

fn default_namespace() -> String {
    "botfleet".to_string()
}

const fn default_keep_alive_secs() -> u64 {
    30
}

const fn default_connect_timeout_ms() -> u64 {
    5_000
}

const fn default_initial_reconnect_delay_ms() -> u64 {
    500
}

const fn default_max_reconnect_delay_ms() -> u64 {
    30_000
}

const fn default_reconcile_interval_secs() -> u64 {
    10
}

const fn default_ack_timeout_ms() -> u64 {
    5_000
}

const fn default_liveness_window_secs() -> u64 {
    30
}

const fn default_history_capacity() -> usize {
    1_000
}
