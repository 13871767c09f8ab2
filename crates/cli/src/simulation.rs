use botfleet_orchestrator::{BotState, SimulatedBot, SimulatedBroker, Topics};
use std::time::Duration;
use tokio::task::JoinHandle;

const DEMO_BOTS: [(&str, BotState, Option<&str>); 3] = [
    ("pmm-btc", BotState::Running, Some("pure_market_making")),
    ("arb-eth", BotState::Stopped, None),
    ("grid-sol", BotState::Running, Some("grid")),
];

/// Simulated bots and their heartbeat tasks.
pub struct Simulation {
    _bots: Vec<SimulatedBot>,
    heartbeats: Vec<JoinHandle<()>>,
}

impl Simulation {
    pub fn stop(self) {
        for task in self.heartbeats {
            task.abort();
        }
    }
}

/// Attaches a few demo bots that beat well inside the liveness window.
pub fn seed(broker: &SimulatedBroker, topics: &Topics, liveness_window: Duration) -> Simulation {
    let period = (liveness_window / 3).max(Duration::from_millis(100));
    let mut bots = Vec::with_capacity(DEMO_BOTS.len());
    let mut heartbeats = Vec::with_capacity(DEMO_BOTS.len());

    for (name, status, strategy) in DEMO_BOTS {
        let bot = SimulatedBot::attach(broker, topics, name, status);
        if let Some(strategy) = strategy {
            bot.set_strategy(strategy);
        }
        tracing::debug!(bot = bot.name(), %status, "Simulated bot attached");
        heartbeats.push(bot.spawn_heartbeats(period));
        bots.push(bot);
    }

    tracing::info!(bots = bots.len(), ?period, "Simulated fleet attached");
    Simulation {
        _bots: bots,
        heartbeats,
    }
}
