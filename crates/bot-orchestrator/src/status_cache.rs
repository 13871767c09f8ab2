use crate::state::BotInstance;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Immutable view of the whole fleet as of one reconciliation tick.
#[derive(Debug, Clone, Default)]
pub struct FleetSnapshot {
    pub generation: u64,
    pub taken_at: Option<DateTime<Utc>>,
    pub bots: HashMap<String, BotInstance>,
}

impl FleetSnapshot {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bots.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.bots.len()
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<&BotInstance> {
        self.bots.get(name)
    }
}

/// Live fleet view shared between the reconciler (sole writer) and any number of readers.
///
/// Readers clone an `Arc` to the current snapshot and never see a partially
/// applied update: `replace` swaps the whole map at once.
#[derive(Default)]
pub struct StatusCache {
    current: RwLock<Arc<FleetSnapshot>>,
}

impl StatusCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically installs a new fleet view and returns its generation number.
    pub fn replace(&self, bots: HashMap<String, BotInstance>) -> u64 {
        let mut current = self.current.write();
        let generation = current.generation + 1;
        *current = Arc::new(FleetSnapshot {
            generation,
            taken_at: Some(Utc::now()),
            bots,
        });
        generation
    }

    #[must_use]
    pub fn snapshot(&self) -> Arc<FleetSnapshot> {
        Arc::clone(&self.current.read())
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<BotInstance> {
        self.snapshot().get(name).cloned()
    }

    /// Returns the current snapshot, or `None` when no bot has been discovered.
    #[must_use]
    pub fn get_all(&self) -> Option<Arc<FleetSnapshot>> {
        let snapshot = self.snapshot();
        if snapshot.is_empty() {
            None
        } else {
            Some(snapshot)
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.current.read().bots.contains_key(name)
    }
}
