use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle state of a bot as observed through the broker.
///
/// `Unknown` is the state of any name reconciliation has never seen.
/// `Stopped` and `Failed` are terminal until a new start is observed;
/// `Lost` marks a bot that dropped out of discovery.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum BotState {
    #[default]
    Unknown,
    Starting,
    Running,
    Stopping,
    Stopped,
    Failed,
    Lost,
}

impl BotState {
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Whether the state machine permits moving from `self` to `next`.
    ///
    /// Reconciliation still applies a disallowed move (the broker is ground
    /// truth) but logs it.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        use BotState::{Failed, Lost, Running, Starting, Stopped, Stopping, Unknown};

        match (self, next) {
            (Unknown | Lost, _) => true,
            (Starting, Starting | Running | Stopping | Failed | Lost)
            | (Running, Running | Stopping | Failed | Lost)
            | (Stopping, Stopping | Running | Stopped | Failed | Lost)
            | (Stopped, Stopped | Starting | Running)
            | (Failed, Failed | Starting | Running) => true,
            _ => false,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Lost => "lost",
        }
    }
}

impl fmt::Display for BotState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Launch parameters a bot reports for itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct BotConfig {
    #[serde(default)]
    pub script: Option<String>,
    #[serde(default)]
    pub conf: Option<String>,
    #[serde(default)]
    pub log_level: Option<String>,
    /// Execution-mode flag, opaque to the controller.
    #[serde(default)]
    pub async_backend: bool,
}

/// Cached view of one bot, owned by the status cache.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BotInstance {
    pub name: String,
    pub status: BotState,
    pub last_seen: DateTime<Utc>,
    pub config: BotConfig,
    pub strategy: Option<String>,
}

/// What discovery learned about a live bot during one query.
#[derive(Debug, Clone, PartialEq)]
pub struct BotReport {
    pub name: String,
    pub status: BotState,
    pub strategy: Option<String>,
    pub config: Option<BotConfig>,
    pub last_seen: DateTime<Utc>,
}
