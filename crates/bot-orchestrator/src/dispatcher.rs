use crate::commands::{BotCommand, CommandKind, CommandOutcome, DispatchReport};
use crate::error::FleetError;
use crate::history::{HistoryEvent, HistoryStore};
use crate::protocol::{AckMessage, CommandEnvelope, Topics};
use crate::transport::{BrokerTransport, InboundMessage, TransportError};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

type PendingTable = Arc<Mutex<HashMap<Uuid, oneshot::Sender<AckMessage>>>>;

/// Publishes commands to bots and correlates their acknowledgments.
///
/// Each waiting dispatch owns one entry in the correlation table, keyed by
/// correlation id. The entry is removed when the ack arrives, the wait
/// times out, the connection drops, or the caller abandons the future.
pub struct CommandDispatcher {
    transport: Arc<dyn BrokerTransport>,
    topics: Topics,
    history: Arc<HistoryStore>,
    pending: PendingTable,
}

impl CommandDispatcher {
    /// Creates a dispatcher and subscribes it to the fleet-wide ack topic.
    ///
    /// # Errors
    /// Returns an error if the ack subscription cannot be registered.
    pub async fn attach(
        transport: Arc<dyn BrokerTransport>,
        topics: Topics,
        history: Arc<HistoryStore>,
    ) -> Result<Self, TransportError> {
        let pending: PendingTable = Arc::new(Mutex::new(HashMap::new()));

        let table = Arc::clone(&pending);
        transport
            .subscribe(
                &topics.ack_filter(),
                Arc::new(move |message: InboundMessage| resolve_ack(&table, &message)),
            )
            .await?;

        Ok(Self {
            transport,
            topics,
            history,
            pending,
        })
    }

    /// Publishes `command` to `bot_name` and, if `wait_for_ack`, waits up to `timeout` for the ack.
    ///
    /// A missing ack is not an error: the report carries `CommandOutcome::TimedOut`.
    /// Payload fields are forwarded to the bot untouched.
    ///
    /// # Errors
    /// Returns `FleetError::TransportUnavailable` if the command could not be
    /// published, or `FleetError::Encode` if it could not be serialized.
    pub async fn dispatch(
        &self,
        bot_name: &str,
        command: BotCommand,
        wait_for_ack: bool,
        timeout: Duration,
    ) -> Result<DispatchReport, FleetError> {
        let kind = command.kind();
        let envelope = CommandEnvelope::new(bot_name, command);
        let correlation_id = envelope.correlation_id;
        let payload = serde_json::to_vec(&envelope)?;
        let deadline = wait_for_ack
            .then(|| chrono::Duration::from_std(timeout).ok())
            .flatten()
            .map(|t| envelope.issued_at + t);

        self.history
            .append(bot_name, HistoryEvent::CommandIssued { correlation_id, kind });

        // Register before publishing so a fast ack cannot slip past us.
        let waiter = wait_for_ack.then(|| self.register(correlation_id));

        let topic = self.topics.commands(bot_name);
        if let Err(e) = self.transport.publish(&topic, payload).await {
            warn!(bot = %bot_name, %correlation_id, %kind, error = %e, "Failed to publish command");
            self.history.append(
                bot_name,
                HistoryEvent::CommandTransportFailed {
                    correlation_id,
                    kind,
                    reason: e.to_string(),
                },
            );
            return Err(FleetError::TransportUnavailable(e));
        }

        info!(bot = %bot_name, %correlation_id, %kind, wait_for_ack, "Command published");

        let outcome = match waiter {
            None => CommandOutcome::Pending,
            Some(waiter) => {
                let outcome = waiter.wait(timeout, self.transport.connection_state()).await;
                self.record_outcome(bot_name, correlation_id, kind, timeout, &outcome);
                outcome
            }
        };

        Ok(DispatchReport {
            correlation_id,
            bot_name: bot_name.to_string(),
            kind,
            issued_at: envelope.issued_at,
            deadline,
            outcome,
        })
    }

    /// Number of dispatches currently waiting for an ack.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }

    fn register(&self, correlation_id: Uuid) -> PendingAck {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(correlation_id, tx);
        PendingAck {
            correlation_id,
            rx,
            table: Arc::clone(&self.pending),
        }
    }

    fn record_outcome(
        &self,
        bot_name: &str,
        correlation_id: Uuid,
        kind: CommandKind,
        timeout: Duration,
        outcome: &CommandOutcome,
    ) {
        let event = match outcome {
            CommandOutcome::Pending => return,
            CommandOutcome::Acked(ack) => HistoryEvent::CommandAcked {
                correlation_id,
                kind,
                success: ack.success,
                message: ack.message.clone(),
            },
            CommandOutcome::TimedOut => {
                warn!(bot = %bot_name, %correlation_id, %kind, ?timeout, "No acknowledgment before timeout");
                HistoryEvent::CommandTimedOut {
                    correlation_id,
                    kind,
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                }
            }
            CommandOutcome::TransportFailed { reason } => {
                warn!(bot = %bot_name, %correlation_id, %kind, %reason, "Lost broker while awaiting acknowledgment");
                HistoryEvent::CommandTransportFailed {
                    correlation_id,
                    kind,
                    reason: reason.clone(),
                }
            }
        };
        self.history.append(bot_name, event);
    }
}

fn resolve_ack(table: &Mutex<HashMap<Uuid, oneshot::Sender<AckMessage>>>, message: &InboundMessage) {
    let ack: AckMessage = match serde_json::from_slice(&message.payload) {
        Ok(ack) => ack,
        Err(e) => {
            warn!(topic = %message.topic, error = %e, "Dropping malformed ack");
            return;
        }
    };

    let waiter = table.lock().remove(&ack.correlation_id);
    match waiter {
        Some(tx) => {
            let correlation_id = ack.correlation_id;
            if tx.send(ack).is_err() {
                debug!(%correlation_id, "Ack arrived after its waiter went away");
            }
        }
        None => {
            debug!(
                bot = %ack.bot_name,
                correlation_id = %ack.correlation_id,
                "Discarding ack with no pending correlation"
            );
        }
    }
}

/// One registered correlation. Dropping it removes the table entry.
struct PendingAck {
    correlation_id: Uuid,
    rx: oneshot::Receiver<AckMessage>,
    table: PendingTable,
}

impl PendingAck {
    async fn wait(mut self, timeout: Duration, connection: watch::Receiver<bool>) -> CommandOutcome {
        let started = Instant::now();
        let outcome = tokio::select! {
            biased;
            ack = &mut self.rx => match ack {
                Ok(ack) => CommandOutcome::Acked(ack),
                Err(_) => CommandOutcome::TransportFailed {
                    reason: "correlation dropped".to_string(),
                },
            },
            () = connection_lost(connection) => CommandOutcome::TransportFailed {
                reason: "broker connection lost".to_string(),
            },
            () = tokio::time::sleep(timeout) => CommandOutcome::TimedOut,
        };
        debug!(correlation_id = %self.correlation_id, elapsed = ?started.elapsed(), "Ack wait finished");
        outcome
    }
}

impl Drop for PendingAck {
    fn drop(&mut self) {
        self.table.lock().remove(&self.correlation_id);
    }
}

async fn connection_lost(mut state: watch::Receiver<bool>) {
    loop {
        if !*state.borrow_and_update() {
            return;
        }
        if state.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::{ImportStrategyPayload, StartPayload, StopPayload};
    use crate::simulated::SimulatedBroker;
    use serde_json::json;

    async fn setup() -> (SimulatedBroker, CommandDispatcher, Arc<HistoryStore>, Topics) {
        let broker = SimulatedBroker::new();
        broker.connect().await.unwrap();
        let topics = Topics::default();
        let history = Arc::new(HistoryStore::default());
        let dispatcher =
            CommandDispatcher::attach(broker.transport(), topics.clone(), Arc::clone(&history))
                .await
                .unwrap();
        (broker, dispatcher, history, topics)
    }

    fn stop(skip: bool, async_backend: bool) -> BotCommand {
        BotCommand::Stop(StopPayload {
            skip_order_cancellation: skip,
            async_backend,
        })
    }

    /// Replies to every command on `bot`'s topic with a successful ack.
    async fn auto_ack(broker: &SimulatedBroker, topics: &Topics, bot: &str) {
        let responder = broker.clone();
        let ack_topic = topics.ack(bot);
        broker
            .subscribe(
                &topics.commands(bot),
                Arc::new(move |message: InboundMessage| {
                    let envelope: CommandEnvelope = serde_json::from_slice(&message.payload).unwrap();
                    let ack = AckMessage {
                        correlation_id: envelope.correlation_id,
                        bot_name: envelope.bot_name,
                        success: true,
                        message: Some("ok".to_string()),
                        data: json!({ "echo": envelope.command }),
                    };
                    responder.inject(&ack_topic, serde_json::to_vec(&ack).unwrap());
                }),
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn fire_and_forget_returns_pending() {
        let (broker, dispatcher, history, topics) = setup().await;
        let report = dispatcher
            .dispatch("alpha", stop(false, false), false, Duration::from_secs(1))
            .await
            .unwrap();

        assert_eq!(report.outcome, CommandOutcome::Pending);
        assert!(report.deadline.is_none());
        assert_eq!(dispatcher.pending_count(), 0);
        assert_eq!(broker.published_to(&topics.commands("alpha")).len(), 1);

        let entries = history.get("alpha");
        assert_eq!(entries.len(), 1);
        assert!(matches!(entries[0].event, HistoryEvent::CommandIssued { kind: CommandKind::Stop, .. }));
    }

    #[tokio::test]
    async fn ack_resolves_waiting_dispatch() {
        let (broker, dispatcher, history, topics) = setup().await;
        auto_ack(&broker, &topics, "alpha").await;

        let report = dispatcher
            .dispatch(
                "alpha",
                BotCommand::ImportStrategy(ImportStrategyPayload {
                    strategy: "grid".to_string(),
                }),
                true,
                Duration::from_secs(2),
            )
            .await
            .unwrap();

        let CommandOutcome::Acked(ack) = &report.outcome else {
            panic!("expected ack, got {:?}", report.outcome);
        };
        assert_eq!(ack.correlation_id, report.correlation_id);
        assert!(ack.success);
        assert!(report.deadline.is_some());
        assert_eq!(dispatcher.pending_count(), 0);

        let events: Vec<_> = history.get("alpha").into_iter().map(|e| e.event).collect();
        assert!(matches!(events[0], HistoryEvent::CommandIssued { .. }));
        assert!(matches!(events[1], HistoryEvent::CommandAcked { success: true, .. }));
    }

    #[tokio::test]
    async fn missing_ack_times_out_within_bound() {
        let (_broker, dispatcher, history, _topics) = setup().await;
        let timeout = Duration::from_millis(100);

        let started = Instant::now();
        let report = dispatcher
            .dispatch("alpha", stop(true, false), true, timeout)
            .await
            .unwrap();
        let elapsed = started.elapsed();

        assert!(report.timed_out());
        assert!(elapsed >= timeout);
        assert!(elapsed < timeout + Duration::from_millis(500), "waited {elapsed:?}");
        assert_eq!(dispatcher.pending_count(), 0);

        let last = history.get("alpha").pop().unwrap();
        assert!(matches!(last.event, HistoryEvent::CommandTimedOut { timeout_ms: 100, .. }));
    }

    #[tokio::test]
    async fn late_ack_is_discarded() {
        let (broker, dispatcher, _history, topics) = setup().await;
        let report = dispatcher
            .dispatch("alpha", stop(false, false), true, Duration::from_millis(20))
            .await
            .unwrap();
        assert!(report.timed_out());

        let late = AckMessage {
            correlation_id: report.correlation_id,
            bot_name: "alpha".to_string(),
            success: true,
            message: None,
            data: serde_json::Value::Null,
        };
        broker.inject(&topics.ack("alpha"), serde_json::to_vec(&late).unwrap());
        broker.flush().await;
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn publish_failure_surfaces_transport_unavailable() {
        let (broker, dispatcher, history, _topics) = setup().await;
        broker.set_reachable(false);

        let result = dispatcher
            .dispatch("alpha", stop(false, false), true, Duration::from_secs(1))
            .await;
        assert!(matches!(result, Err(FleetError::TransportUnavailable(_))));
        assert_eq!(dispatcher.pending_count(), 0);

        let last = history.get("alpha").pop().unwrap();
        assert!(matches!(last.event, HistoryEvent::CommandTransportFailed { .. }));
    }

    #[tokio::test]
    async fn connection_loss_fails_waiter_before_timeout() {
        let (broker, dispatcher, _history, _topics) = setup().await;
        let dropper = broker.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            dropper.set_reachable(false);
        });

        let started = Instant::now();
        let report = dispatcher
            .dispatch("alpha", stop(false, false), true, Duration::from_secs(5))
            .await
            .unwrap();
        assert!(matches!(report.outcome, CommandOutcome::TransportFailed { .. }));
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn abandoned_wait_clears_correlation() {
        let (_broker, dispatcher, _history, _topics) = setup().await;
        let abandoned = tokio::time::timeout(
            Duration::from_millis(20),
            dispatcher.dispatch("alpha", stop(false, false), true, Duration::from_secs(10)),
        )
        .await;
        assert!(abandoned.is_err());
        assert_eq!(dispatcher.pending_count(), 0);
    }

    #[tokio::test]
    async fn payload_flags_are_forwarded_verbatim() {
        let (broker, dispatcher, _history, topics) = setup().await;
        let start = BotCommand::Start(StartPayload {
            log_level: Some("DEBUG".to_string()),
            script: Some("v2_with_controllers.py".to_string()),
            conf: Some("conf_v2_1.yml".to_string()),
            async_backend: true,
        });

        for command in [stop(true, true), stop(false, true), stop(true, false), start] {
            dispatcher
                .dispatch("alpha", command.clone(), false, Duration::from_secs(1))
                .await
                .unwrap();
            let sent = broker.published_to(&topics.commands("alpha")).pop().unwrap();
            let envelope: CommandEnvelope = serde_json::from_slice(&sent.payload).unwrap();
            assert_eq!(envelope.command, command);
            assert_eq!(envelope.bot_name, "alpha");
        }
    }
}
