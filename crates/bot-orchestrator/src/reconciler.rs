use crate::discovery::FleetDiscovery;
use crate::history::{HistoryEvent, HistoryStore};
use crate::state::{BotInstance, BotReport, BotState};
use crate::status_cache::StatusCache;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum TickOutcome {
    /// A new snapshot was installed.
    Applied {
        bots: usize,
        changed: usize,
        lost: usize,
    },
    /// Another tick was still running.
    Skipped,
    /// Discovery failed; cache and history were left untouched.
    Aborted { reason: String },
}

/// Periodically rebuilds the fleet view from what the broker reports.
///
/// The loop is the only writer of [`StatusCache`]. Overlapping calls to
/// [`tick`](Self::tick) are skipped rather than queued.
pub struct ReconciliationLoop {
    discovery: Arc<dyn FleetDiscovery>,
    cache: Arc<StatusCache>,
    history: Arc<HistoryStore>,
    in_flight: AtomicBool,
    completed: AtomicU64,
}

impl ReconciliationLoop {
    #[must_use]
    pub fn new(
        discovery: Arc<dyn FleetDiscovery>,
        cache: Arc<StatusCache>,
        history: Arc<HistoryStore>,
    ) -> Self {
        Self {
            discovery,
            cache,
            history,
            in_flight: AtomicBool::new(false),
            completed: AtomicU64::new(0),
        }
    }

    /// Runs one reconciliation pass.
    pub async fn tick(&self) -> TickOutcome {
        let Some(_guard) = TickGuard::acquire(&self.in_flight) else {
            debug!("Previous reconciliation tick still running, skipping");
            return TickOutcome::Skipped;
        };

        let reports = match self.discovery.discover().await {
            Ok(reports) => reports,
            Err(e) => {
                warn!(error = %e, "Fleet discovery failed, keeping last snapshot");
                return TickOutcome::Aborted {
                    reason: e.to_string(),
                };
            }
        };

        let previous = self.cache.snapshot();
        let plan = reconcile(&previous.bots, reports, Utc::now());

        for (bot_name, event) in plan.events {
            self.history.append(&bot_name, event);
        }
        let bots = plan.next.len();
        let generation = self.cache.replace(plan.next);
        self.completed.fetch_add(1, Ordering::Relaxed);

        if plan.changed > 0 || plan.lost > 0 {
            info!(
                generation,
                bots,
                changed = plan.changed,
                lost = plan.lost,
                "Fleet snapshot updated"
            );
        } else {
            debug!(generation, bots, "Fleet snapshot unchanged");
        }

        TickOutcome::Applied {
            bots,
            changed: plan.changed,
            lost: plan.lost,
        }
    }

    /// Number of ticks that installed a snapshot.
    #[must_use]
    pub fn completed_ticks(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }
}

struct TickGuard<'a>(&'a AtomicBool);

impl<'a> TickGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for TickGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

struct ReconcilePlan {
    next: HashMap<String, BotInstance>,
    events: Vec<(String, HistoryEvent)>,
    changed: usize,
    lost: usize,
}

/// Merges discovery reports into the previous fleet view.
///
/// Bots missing from `reports` are kept and marked `Lost`. The transition to
/// `Lost` and its `LostContact` event are recorded only on the tick they first
/// go missing.
fn reconcile(
    previous: &HashMap<String, BotInstance>,
    reports: Vec<BotReport>,
    now: DateTime<Utc>,
) -> ReconcilePlan {
    let mut next = HashMap::with_capacity(previous.len().max(reports.len()));
    let mut events = Vec::new();
    let mut changed = 0;
    let mut lost = 0;

    for report in reports {
        let prior = previous.get(&report.name);
        let from = prior.map_or(BotState::Unknown, |p| p.status);
        if !from.can_transition_to(report.status) {
            debug!(bot = %report.name, %from, to = %report.status, "Unexpected state transition reported");
        }

        let instance = BotInstance {
            status: report.status,
            last_seen: report.last_seen,
            config: report
                .config
                .or_else(|| prior.map(|p| p.config.clone()))
                .unwrap_or_default(),
            strategy: report.strategy,
            name: report.name,
        };

        let status_changed = prior.map_or(true, |p| {
            p.status != instance.status || p.strategy != instance.strategy
        });
        if status_changed {
            changed += 1;
            events.push((
                instance.name.clone(),
                HistoryEvent::StatusChanged {
                    from,
                    to: instance.status,
                    strategy: instance.strategy.clone(),
                },
            ));
        }
        next.insert(instance.name.clone(), instance);
    }

    for (name, prior) in previous {
        if next.contains_key(name) {
            continue;
        }
        let mut missing = prior.clone();
        if prior.status != BotState::Lost {
            lost += 1;
            changed += 1;
            missing.status = BotState::Lost;
            events.push((
                name.clone(),
                HistoryEvent::StatusChanged {
                    from: prior.status,
                    to: BotState::Lost,
                    strategy: prior.strategy.clone(),
                },
            ));
            events.push((
                name.clone(),
                HistoryEvent::LostContact {
                    last_seen: prior.last_seen,
                },
            ));
            debug!(bot = %name, last_seen = %prior.last_seen, at = %now, "Bot missing from discovery");
        }
        next.insert(name.clone(), missing);
    }

    ReconcilePlan {
        next,
        events,
        changed,
        lost,
    }
}
