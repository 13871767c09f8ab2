use crate::protocol::AckMessage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Start,
    Stop,
    ImportStrategy,
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Start => "start",
            Self::Stop => "stop",
            Self::ImportStrategy => "import_strategy",
        })
    }
}

/// A control command addressed to one bot, carrying its kind-specific payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum BotCommand {
    Start(StartPayload),
    Stop(StopPayload),
    ImportStrategy(ImportStrategyPayload),
}

impl BotCommand {
    #[must_use]
    pub const fn kind(&self) -> CommandKind {
        match self {
            Self::Start(_) => CommandKind::Start,
            Self::Stop(_) => CommandKind::Stop,
            Self::ImportStrategy(_) => CommandKind::ImportStrategy,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StartPayload {
    #[serde(default)]
    pub log_level: Option<String>,
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub conf: Option<String>,
    #[serde(default)]
    pub async_backend: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StopPayload {
    #[serde(default)]
    pub skip_order_cancellation: bool,
    #[serde(default)]
    pub async_backend: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportStrategyPayload {
    pub strategy: String,
}

/// How a dispatch resolved.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "outcome", content = "result", rename_all = "snake_case")]
pub enum CommandOutcome {
    /// Published without waiting for an acknowledgment.
    Pending,
    Acked(AckMessage),
    /// Published, but no acknowledgment arrived in time. The bot may still act on it.
    TimedOut,
    /// The broker session dropped while waiting.
    TransportFailed { reason: String },
}

/// Record of a single dispatch, returned to the caller once the outcome is known.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DispatchReport {
    pub correlation_id: Uuid,
    pub bot_name: String,
    pub kind: CommandKind,
    pub issued_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub outcome: CommandOutcome,
}

impl DispatchReport {
    #[must_use]
    pub const fn is_acknowledged(&self) -> bool {
        matches!(self.outcome, CommandOutcome::Acked(_))
    }

    #[must_use]
    pub const fn timed_out(&self) -> bool {
        matches!(self.outcome, CommandOutcome::TimedOut)
    }
}
