use botfleet_core::FleetConfig;
use botfleet_orchestrator::{
    BotState, CommandOutcome, FleetController, FleetError, HistoryEvent, SimulatedBot,
    SimulatedBroker, StartPayload, StopPayload, TickOutcome, Topics,
};
use std::time::{Duration, Instant};

struct Fleet {
    broker: SimulatedBroker,
    topics: Topics,
    controller: FleetController,
}

impl Fleet {
    async fn new() -> Self {
        let broker = SimulatedBroker::new();
        let topics = Topics::default();
        let config = FleetConfig {
            ack_timeout_ms: 200,
            liveness_window_secs: 30,
            history_capacity: 100,
            ..FleetConfig::default()
        };
        let controller = FleetController::with_transport(broker.transport(), topics.clone(), &config)
            .await
            .expect("controller should connect to simulated broker");
        Self {
            broker,
            topics,
            controller,
        }
    }

    fn bot(&self, name: &str, status: BotState) -> SimulatedBot {
        SimulatedBot::attach(&self.broker, &self.topics, name, status)
    }

    /// Lets queued heartbeats land, then reconciles.
    async fn settle(&self) -> TickOutcome {
        self.broker.flush().await;
        self.broker.flush().await;
        self.controller.tick().await
    }
}

fn stop_payload() -> StopPayload {
    StopPayload {
        skip_order_cancellation: false,
        async_backend: false,
    }
}

#[tokio::test]
async fn test_status_reflects_discovered_fleet() {
    let fleet = Fleet::new().await;
    fleet.bot("alpha", BotState::Running).heartbeat();
    fleet.bot("beta", BotState::Stopped).heartbeat();

    let outcome = fleet.settle().await;
    assert_eq!(
        outcome,
        TickOutcome::Applied {
            bots: 2,
            changed: 2,
            lost: 0
        }
    );

    let all = fleet.controller.get_all_status().unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all["alpha"].status, BotState::Running);
    assert_eq!(all["beta"].status, BotState::Stopped);

    assert!(matches!(
        fleet.controller.get_status("gamma"),
        Err(FleetError::NotFound(name)) if name == "gamma"
    ));
}

#[tokio::test]
async fn test_empty_fleet_reports_no_active_bots() {
    let fleet = Fleet::new().await;
    assert!(matches!(fleet.controller.tick().await, TickOutcome::Applied { bots: 0, .. }));
    assert!(matches!(
        fleet.controller.get_all_status(),
        Err(FleetError::EmptyFleet)
    ));
}

#[tokio::test]
async fn test_stop_with_ack_updates_status_after_next_tick() {
    let fleet = Fleet::new().await;
    let bot = fleet.bot("alpha", BotState::Running);
    bot.heartbeat();
    fleet.settle().await;

    let report = fleet.controller.stop_bot("alpha", stop_payload()).await.unwrap();
    assert!(report.is_acknowledged(), "unexpected outcome {:?}", report.outcome);
    assert_eq!(bot.status(), BotState::Stopped);
    assert_eq!(fleet.controller.pending_commands(), 0);

    // The dispatcher never writes the cache; only the next tick does.
    fleet.settle().await;
    assert_eq!(
        fleet.controller.get_status("alpha").unwrap().status,
        BotState::Stopped
    );

    let events: Vec<_> = fleet
        .controller
        .get_history("alpha")
        .into_iter()
        .map(|e| e.event)
        .collect();
    assert!(matches!(events[0], HistoryEvent::StatusChanged { to: BotState::Running, .. }));
    assert!(matches!(events[1], HistoryEvent::CommandIssued { .. }));
    assert!(matches!(events[2], HistoryEvent::CommandAcked { success: true, .. }));
    assert!(matches!(
        events[3],
        HistoryEvent::StatusChanged {
            from: BotState::Running,
            to: BotState::Stopped,
            ..
        }
    ));
}

#[tokio::test]
async fn test_silent_bot_times_out() {
    let fleet = Fleet::new().await;
    let bot = fleet.bot("alpha", BotState::Running);
    bot.set_auto_ack(false);
    bot.heartbeat();
    fleet.settle().await;

    let started = Instant::now();
    let report = fleet.controller.stop_bot("alpha", stop_payload()).await.unwrap();
    assert!(report.timed_out());
    assert!(started.elapsed() < Duration::from_secs(1));
    assert_eq!(fleet.controller.pending_commands(), 0);
    assert_eq!(bot.received().len(), 1);

    let last = fleet.controller.get_recent_history("alpha", 1);
    assert!(matches!(last[0].event, HistoryEvent::CommandTimedOut { timeout_ms: 200, .. }));
}

#[tokio::test]
async fn test_lost_contact_recorded_once() {
    let fleet = Fleet::new().await;
    let bot = fleet.bot("alpha", BotState::Running);
    bot.heartbeat();
    fleet.settle().await;

    bot.go_offline();
    assert!(matches!(fleet.settle().await, TickOutcome::Applied { lost: 1, .. }));
    assert!(matches!(fleet.settle().await, TickOutcome::Applied { lost: 0, .. }));

    assert_eq!(
        fleet.controller.get_status("alpha").unwrap().status,
        BotState::Lost
    );
    let to_lost = fleet
        .controller
        .get_history("alpha")
        .into_iter()
        .filter(|e| matches!(e.event, HistoryEvent::StatusChanged { to: BotState::Lost, .. }))
        .count();
    assert_eq!(to_lost, 1);
    let lost_events = fleet
        .controller
        .get_history("alpha")
        .into_iter()
        .filter(|e| matches!(e.event, HistoryEvent::LostContact { .. }))
        .count();
    assert_eq!(lost_events, 1);

    bot.heartbeat();
    fleet.settle().await;
    assert_eq!(
        fleet.controller.get_status("alpha").unwrap().status,
        BotState::Running
    );
}

#[tokio::test]
async fn test_broker_outage_keeps_last_snapshot() {
    let fleet = Fleet::new().await;
    fleet.bot("alpha", BotState::Running).heartbeat();
    fleet.settle().await;
    let before = fleet.controller.snapshot();

    fleet.broker.set_reachable(false);
    assert!(!fleet.controller.is_broker_connected());
    for _ in 0..2 {
        assert!(matches!(fleet.controller.tick().await, TickOutcome::Aborted { .. }));
    }
    let during = fleet.controller.snapshot();
    assert_eq!(during.generation, before.generation);
    assert_eq!(during.bots, before.bots);

    let result = fleet
        .controller
        .start_bot("alpha", StartPayload::default())
        .await;
    assert!(matches!(result, Err(FleetError::TransportUnavailable(_))));

    fleet.broker.set_reachable(true);
    assert!(matches!(fleet.controller.tick().await, TickOutcome::Applied { bots: 1, .. }));
    assert!(fleet.controller.snapshot().generation > before.generation);
}

#[tokio::test]
async fn test_command_to_unknown_bot_is_rejected() {
    let fleet = Fleet::new().await;
    fleet.bot("alpha", BotState::Running).heartbeat();
    fleet.settle().await;

    let result = fleet.controller.import_strategy("ghost", "grid").await;
    assert!(matches!(result, Err(FleetError::NotFound(_))));
    assert!(fleet.broker.published_to(&fleet.topics.commands("ghost")).is_empty());
    assert!(fleet.controller.get_history("ghost").is_empty());
}

#[tokio::test]
async fn test_import_strategy_shows_up_in_status() {
    let fleet = Fleet::new().await;
    let bot = fleet.bot("alpha", BotState::Running);
    bot.heartbeat();
    fleet.settle().await;

    let report = fleet.controller.import_strategy("alpha", "grid").await.unwrap();
    let CommandOutcome::Acked(ack) = report.outcome else {
        panic!("expected ack");
    };
    assert_eq!(ack.bot_name, "alpha");

    fleet.settle().await;
    assert_eq!(
        fleet.controller.get_status("alpha").unwrap().strategy.as_deref(),
        Some("grid")
    );
}

#[tokio::test]
async fn test_concurrent_commands_get_their_own_acks() {
    let fleet = Fleet::new().await;
    let alpha = fleet.bot("alpha", BotState::Running);
    let beta = fleet.bot("beta", BotState::Running);
    alpha.heartbeat();
    beta.heartbeat();
    fleet.settle().await;

    let (first, second, third) = tokio::join!(
        fleet.controller.import_strategy("alpha", "grid"),
        fleet.controller.import_strategy("alpha", "pmm"),
        fleet.controller.stop_bot("beta", stop_payload()),
    );
    let reports = [first.unwrap(), second.unwrap(), third.unwrap()];

    for report in &reports {
        let CommandOutcome::Acked(ack) = &report.outcome else {
            panic!("expected ack, got {:?}", report.outcome);
        };
        assert_eq!(ack.correlation_id, report.correlation_id);
        assert_eq!(ack.bot_name, report.bot_name);
    }
    assert_ne!(reports[0].correlation_id, reports[1].correlation_id);
    assert_eq!(fleet.controller.pending_commands(), 0);
    assert_eq!(alpha.received().len(), 2);
    assert_eq!(beta.status(), BotState::Stopped);
}

#[tokio::test]
async fn test_ticker_drives_reconciliation() {
    let fleet = Fleet::new().await;
    let bot = fleet.bot("alpha", BotState::Running);
    let beats = bot.spawn_heartbeats(Duration::from_millis(10));

    let ticker = fleet.controller.start_ticker(Duration::from_millis(20));
    let deadline = Instant::now() + Duration::from_secs(2);
    while fleet.controller.get_status("alpha").is_err() {
        assert!(Instant::now() < deadline, "bot never appeared");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    ticker.stop().await;
    beats.abort();
    fleet.controller.shutdown().await.unwrap();
    assert!(!fleet.controller.is_broker_connected());
}
