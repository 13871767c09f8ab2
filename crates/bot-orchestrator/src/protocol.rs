//! Wire format between the controller and the bots.
//!
//! Every topic lives under a namespace (default `botfleet`):
//!
//! ```text
//! {ns}/{bot}/commands    controller -> bot   CommandEnvelope (QoS 1)
//! {ns}/{bot}/ack         bot -> controller   AckMessage      (QoS 1)
//! {ns}/{bot}/heartbeat   bot -> controller   Heartbeat
//! ```
//!
//! All payloads are JSON. A bot announces itself by publishing heartbeats;
//! a heartbeat with `"online": false` (typically its last-will message)
//! removes it from discovery immediately.

use crate::commands::BotCommand;
use crate::state::{BotConfig, BotState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    namespace: String,
}

impl Topics {
    #[must_use]
    pub fn new(namespace: impl Into<String>) -> Self {
        let namespace: String = namespace.into();
        Self {
            namespace: namespace.trim_end_matches('/').to_string(),
        }
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub fn commands(&self, bot_name: &str) -> String {
        format!("{}/{bot_name}/commands", self.namespace)
    }

    #[must_use]
    pub fn ack(&self, bot_name: &str) -> String {
        format!("{}/{bot_name}/ack", self.namespace)
    }

    #[must_use]
    pub fn heartbeat(&self, bot_name: &str) -> String {
        format!("{}/{bot_name}/heartbeat", self.namespace)
    }

    #[must_use]
    pub fn ack_filter(&self) -> String {
        self.ack("+")
    }

    #[must_use]
    pub fn heartbeat_filter(&self) -> String {
        self.heartbeat("+")
    }

    /// Extracts the bot name from a `{ns}/{bot}/...` topic.
    #[must_use]
    pub fn bot_from_topic<'a>(&self, topic: &'a str) -> Option<&'a str> {
        let rest = topic.strip_prefix(self.namespace.as_str())?.strip_prefix('/')?;
        rest.split('/').next().filter(|name| !name.is_empty())
    }
}

impl Default for Topics {
    fn default() -> Self {
        Self::new("botfleet")
    }
}

/// A command as published on a bot's command topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandEnvelope {
    pub correlation_id: Uuid,
    pub bot_name: String,
    pub issued_at: DateTime<Utc>,
    pub command: BotCommand,
}

impl CommandEnvelope {
    #[must_use]
    pub fn new(bot_name: &str, command: BotCommand) -> Self {
        Self {
            correlation_id: Uuid::new_v4(),
            bot_name: bot_name.to_string(),
            issued_at: Utc::now(),
            command,
        }
    }
}

/// A bot's acknowledgment of a command, matched by `correlation_id`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AckMessage {
    pub correlation_id: Uuid,
    pub bot_name: String,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub data: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Heartbeat {
    pub bot_name: String,
    pub status: BotState,
    #[serde(default)]
    pub strategy: Option<String>,
    #[serde(default)]
    pub config: Option<BotConfig>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default = "default_online")]
    pub online: bool,
}

const fn default_online() -> bool {
    true
}
