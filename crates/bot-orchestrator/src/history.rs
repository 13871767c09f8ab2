use crate::commands::CommandKind;
use crate::state::BotState;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", content = "detail", rename_all = "snake_case")]
pub enum HistoryEvent {
    StatusChanged {
        from: BotState,
        to: BotState,
        strategy: Option<String>,
    },
    CommandIssued {
        correlation_id: Uuid,
        kind: CommandKind,
    },
    CommandAcked {
        correlation_id: Uuid,
        kind: CommandKind,
        success: bool,
        message: Option<String>,
    },
    CommandTimedOut {
        correlation_id: Uuid,
        kind: CommandKind,
        timeout_ms: u64,
    },
    CommandTransportFailed {
        correlation_id: Uuid,
        kind: CommandKind,
        reason: String,
    },
    LostContact {
        last_seen: DateTime<Utc>,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub bot_name: String,
    pub timestamp: DateTime<Utc>,
    pub event: HistoryEvent,
}

/// Append-only event log per bot.
///
/// Timestamps within one bot's log never go backwards, even if the wall
/// clock does. With a capacity set, the oldest entries are evicted first.
pub struct HistoryStore {
    capacity: Option<usize>,
    logs: RwLock<HashMap<String, VecDeque<HistoryEntry>>>,
}

impl Default for HistoryStore {
    fn default() -> Self {
        Self::new(None)
    }
}

impl HistoryStore {
    #[must_use]
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            capacity: capacity.filter(|c| *c > 0),
            logs: RwLock::new(HashMap::new()),
        }
    }

    pub fn append(&self, bot_name: &str, event: HistoryEvent) -> HistoryEntry {
        self.append_at(bot_name, Utc::now(), event)
    }

    /// Appends with an explicit timestamp, clamped to the last entry's timestamp.
    pub fn append_at(
        &self,
        bot_name: &str,
        timestamp: DateTime<Utc>,
        event: HistoryEvent,
    ) -> HistoryEntry {
        let mut logs = self.logs.write();
        let log = logs.entry(bot_name.to_string()).or_default();

        let timestamp = log
            .back()
            .map_or(timestamp, |last| timestamp.max(last.timestamp));
        let entry = HistoryEntry {
            bot_name: bot_name.to_string(),
            timestamp,
            event,
        };

        if let Some(capacity) = self.capacity {
            while log.len() >= capacity {
                log.pop_front();
            }
        }
        log.push_back(entry.clone());
        entry
    }

    /// Full log for a bot, oldest first. Unknown bots yield an empty list.
    #[must_use]
    pub fn get(&self, bot_name: &str) -> Vec<HistoryEntry> {
        self.logs
            .read()
            .get(bot_name)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// The newest `limit` entries for a bot, oldest first.
    #[must_use]
    pub fn get_recent(&self, bot_name: &str, limit: usize) -> Vec<HistoryEntry> {
        self.logs
            .read()
            .get(bot_name)
            .map(|log| {
                let skip = log.len().saturating_sub(limit);
                log.iter().skip(skip).cloned().collect()
            })
            .unwrap_or_default()
    }

    #[must_use]
    pub fn len(&self, bot_name: &str) -> usize {
        self.logs.read().get(bot_name).map_or(0, VecDeque::len)
    }
}
