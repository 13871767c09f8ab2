pub mod config;
pub mod config_loader;

pub use config::{AppConfig, BrokerConfig, FleetConfig, ServerConfig};
pub use config_loader::{ConfigLoader, DEFAULT_CONFIG_PATH, ENV_PREFIX};
