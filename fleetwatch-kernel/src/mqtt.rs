/**
 * BUS INGEST GATEWAY - MQTT transport, ingestion loop, command dispatch
 *
 * ROLE:
 * Bridges the plant MQTT bus to the state store and the client fan-out.
 *
 * OPERATION:
 * - Transport task polls the rumqttc event loop, (re)subscribes on every
 *   ConnAck and pushes inbound publishes into a bounded ingest queue
 * - A single processing loop drains the queue: decode, record, broadcast
 * - A malformed message is logged and dropped, the loop keeps going
 * - Outbound commands fail fast when the bus is down, no retry
 */

use crate::config::MqttConf;
use crate::contracts::{decode, validate_advisory, BusEvent, DecodeError, Envelope, EventKind, TopicScheme};
use crate::fanout::BroadcastFanout;
use crate::health::HealthTracker;
use crate::models::{Advisory, AlarmTransition, Command, CommandStatus, MachineId};
use crate::state::StateStore;
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus is not connected")]
    NotConnected,
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("publish timed out after {0:?}")]
    Timeout(Duration),
    #[error("failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Outbound side of the bus.
#[async_trait]
pub trait BusPublisher: Send + Sync {
    /// Publishes at QoS 1, not retained.
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError>;
}

#[async_trait]
impl BusPublisher for AsyncClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        AsyncClient::publish(self, topic, QoS::AtLeastOnce, false, payload)
            .await
            .map_err(|e| BusError::Publish(e.to_string()))
    }
}

pub fn create_mqtt_client(conf: &MqttConf) -> (AsyncClient, EventLoop) {
    let mut opts = MqttOptions::new(&conf.client_id, &conf.host, conf.port);
    opts.set_keep_alive(Duration::from_secs(conf.keep_alive_secs.max(5)));
    opts.set_clean_session(true);
    AsyncClient::new(opts, 64)
}

/// Raw inbound publish waiting to be processed.
#[derive(Debug, Clone)]
pub struct IngestMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

pub fn ingest_queue(capacity: usize) -> (mpsc::Sender<IngestMessage>, mpsc::Receiver<IngestMessage>) {
    mpsc::channel(capacity.max(1))
}

/// Polls the event loop forever. A full ingest queue makes this task wait,
/// which in turn stops rumqttc from reading the socket.
pub fn spawn_bus_listener(
    mut eventloop: EventLoop,
    client: AsyncClient,
    scheme: TopicScheme,
    health: HealthTracker,
    queue: mpsc::Sender<IngestMessage>,
    reconnect_delay: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    health.mark_mqtt_connected();
                    for filter in scheme.subscriptions() {
                        // try_ variant: awaiting here would wait on the loop we are running
                        match client.try_subscribe(filter.as_str(), QoS::AtLeastOnce) {
                            Ok(()) => tracing::info!(%filter, "subscribed"),
                            Err(e) => tracing::error!(%filter, error = %e, "subscribe failed"),
                        }
                    }
                }
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let message = IngestMessage { topic: publish.topic, payload: publish.payload.to_vec() };
                    if queue.send(message).await.is_err() {
                        tracing::info!("ingest queue closed, stopping bus listener");
                        break;
                    }
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    health.mark_mqtt_disconnected();
                    tracing::warn!("broker sent disconnect");
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::warn!(error = %e, "MQTT connection error, retrying");
                    health.increment_reconnects();
                    tokio::time::sleep(reconnect_delay).await;
                }
            }
        }
    })
}

/// What one inbound message did.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Sample { machine_id: MachineId, kind: EventKind, delivered: usize },
    Alarm { machine_id: MachineId, alarm_id: String, transition: AlarmTransition, delivered: usize },
    Heartbeat { machine_id: MachineId },
    CommandUpdate { machine_id: MachineId, command_id: String, known: bool, delivered: usize },
}

/// Operator request for an outbound control command.
#[derive(Debug, Clone, Deserialize)]
pub struct CommandRequest {
    pub machine_id: MachineId,
    pub command: String,
    #[serde(default)]
    pub parameters: Map<String, Value>,
    #[serde(default)]
    pub command_id: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

#[derive(Serialize)]
struct ControlPayload<'a> {
    command: &'a str,
    parameters: &'a Map<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
    command_id: &'a str,
    user_id: Option<&'a str>,
}

pub struct IngestGateway {
    store: Arc<StateStore>,
    fanout: Arc<BroadcastFanout>,
    health: HealthTracker,
    publisher: Arc<dyn BusPublisher>,
    scheme: TopicScheme,
    publish_timeout: Duration,
}

impl IngestGateway {
    pub fn new(
        store: Arc<StateStore>,
        fanout: Arc<BroadcastFanout>,
        health: HealthTracker,
        publisher: Arc<dyn BusPublisher>,
        scheme: TopicScheme,
        publish_timeout: Duration,
    ) -> Self {
        Self { store, fanout, health, publisher, scheme, publish_timeout }
    }

    /// Single consumer of the ingest queue; returns once every sender is gone.
    pub async fn run(&self, mut queue: mpsc::Receiver<IngestMessage>) {
        tracing::info!("ingest loop started");
        while let Some(message) = queue.recv().await {
            match self.handle_message(&message.topic, &message.payload) {
                Ok(outcome) => tracing::debug!(topic = %message.topic, ?outcome, "ingested"),
                Err(e) => tracing::warn!(topic = %message.topic, error = %e, "dropping bus message"),
            }
        }
        tracing::info!("ingest queue closed, ingest loop stopped");
    }

    pub fn handle_message(&self, topic: &str, payload: &[u8]) -> Result<IngestOutcome, DecodeError> {
        let topic = self.scheme.parse(topic)?;
        let event = decode(&topic, payload, OffsetDateTime::now_utc())?;
        Ok(self.apply(topic.kind, event))
    }

    fn apply(&self, kind: EventKind, event: BusEvent) -> IngestOutcome {
        match event {
            BusEvent::Sample(sample) => {
                let envelope = Envelope::sample(&sample);
                let machine_id = sample.machine_id().to_string();
                self.store.record_sample(sample);
                let delivered = self.fanout.broadcast(&envelope);
                IngestOutcome::Sample { machine_id, kind, delivered }
            }
            BusEvent::Alarm(alarm) => {
                let transition = self.store.record_alarm(alarm.clone());
                let mut delivered = self.fanout.broadcast(&Envelope::alarm(&alarm, &transition));
                if transition.is_notable() {
                    delivered += self.fanout.notify_alarm(&alarm, &transition);
                }
                IngestOutcome::Alarm { machine_id: alarm.machine_id, alarm_id: alarm.alarm_id, transition, delivered }
            }
            BusEvent::Heartbeat { machine_id, timestamp } => {
                self.store.record_heartbeat(&machine_id, timestamp);
                IngestOutcome::Heartbeat { machine_id }
            }
            BusEvent::CommandUpdate(update) => match self.store.update_command(&update) {
                Some(command) => {
                    let delivered = self.fanout.notify_command_response(&command);
                    IngestOutcome::CommandUpdate {
                        machine_id: update.machine_id,
                        command_id: update.command_id,
                        known: true,
                        delivered,
                    }
                }
                None => {
                    tracing::debug!(machine_id = %update.machine_id, command_id = %update.command_id, "update for unknown command");
                    IngestOutcome::CommandUpdate {
                        machine_id: update.machine_id,
                        command_id: update.command_id,
                        known: false,
                        delivered: 0,
                    }
                }
            },
        }
    }

    /// Intake for advisories scored by the external ML service.
    pub fn submit_advisory(&self, advisory: Advisory) -> Result<usize, DecodeError> {
        validate_advisory(&advisory)?;
        tracing::info!(
            machine_id = %advisory.machine_id,
            severity = advisory.severity.as_str(),
            confidence = advisory.confidence,
            "advisory received"
        );
        let delivered = self.fanout.notify_advisory(&advisory);
        self.store.record_advisory(advisory);
        Ok(delivered)
    }

    /// Publishes a control command and logs it as `sent` or `failed`.
    /// Nothing is logged when the bus is known to be down.
    pub async fn dispatch_command(&self, request: CommandRequest) -> Result<Command, BusError> {
        if !self.health.is_connected() {
            return Err(BusError::NotConnected);
        }

        let mut command = Command {
            machine_id: request.machine_id,
            command_id: request
                .command_id
                .filter(|id| !id.is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            command: request.command,
            parameters: request.parameters,
            timestamp: OffsetDateTime::now_utc(),
            user_id: request.user_id,
            status: CommandStatus::Pending,
            response: None,
        };

        let payload = serde_json::to_vec(&ControlPayload {
            command: &command.command,
            parameters: &command.parameters,
            timestamp: command.timestamp,
            command_id: &command.command_id,
            user_id: command.user_id.as_deref(),
        })?;
        let topic = self.scheme.control_topic(&command.machine_id);

        let result = match tokio::time::timeout(self.publish_timeout, self.publisher.publish(&topic, payload)).await {
            Ok(result) => result,
            Err(_) => Err(BusError::Timeout(self.publish_timeout)),
        };

        match &result {
            Ok(()) => {
                command.status = CommandStatus::Sent;
                tracing::info!(machine_id = %command.machine_id, command = %command.command, command_id = %command.command_id, "command sent");
            }
            Err(e) => {
                command.status = CommandStatus::Failed;
                command.response = Some(e.to_string());
                tracing::error!(machine_id = %command.machine_id, command = %command.command, error = %e, "command publish failed");
            }
        }
        self.store.record_command(command.clone());
        result.map(|()| command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HistoryConf;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingBus {
        published: Mutex<Vec<(String, Vec<u8>)>>,
    }

    #[async_trait]
    impl BusPublisher for RecordingBus {
        async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
            self.published.lock().push((topic.to_string(), payload));
            Ok(())
        }
    }

    struct StalledBus;

    #[async_trait]
    impl BusPublisher for StalledBus {
        async fn publish(&self, _topic: &str, _payload: Vec<u8>) -> Result<(), BusError> {
            std::future::pending().await
        }
    }

    fn gateway(publisher: Arc<dyn BusPublisher>) -> (IngestGateway, HealthTracker) {
        let health = HealthTracker::new();
        let gateway = IngestGateway::new(
            Arc::new(StateStore::new(HistoryConf::default())),
            Arc::new(BroadcastFanout::new(32)),
            health.clone(),
            publisher,
            TopicScheme::from_conf(&MqttConf::default()),
            Duration::from_millis(50),
        );
        (gateway, health)
    }

    fn request() -> CommandRequest {
        CommandRequest {
            machine_id: "M1".into(),
            command: "stop".into(),
            parameters: Map::new(),
            command_id: None,
            user_id: Some("op1".into()),
        }
    }

    #[test]
    fn alarm_events_report_lifecycle_transitions() {
        let (gw, _) = gateway(Arc::new(RecordingBus::default()));
        let topic = "industrial/factory/M1/plc/alarms";

        let opened = gw.handle_message(topic, br#"{"alarm_id":"A1","severity":"warning"}"#).unwrap();
        assert!(matches!(opened, IngestOutcome::Alarm { transition: AlarmTransition::Opened, .. }));

        let escalated = gw.handle_message(topic, br#"{"alarm_id":"A1","severity":"critical"}"#).unwrap();
        assert!(matches!(
            escalated,
            IngestOutcome::Alarm { transition: AlarmTransition::Updated { escalated: true, .. }, .. }
        ));

        let resolved = gw.handle_message(topic, br#"{"alarm_id":"A1","resolved":true}"#).unwrap();
        assert!(matches!(resolved, IngestOutcome::Alarm { transition: AlarmTransition::Resolved, .. }));
        assert!(gw.store.active_alarms("M1").is_empty());
    }

    #[test]
    fn sample_kind_follows_topic() {
        let (gw, _) = gateway(Arc::new(RecordingBus::default()));
        let outcome = gw.handle_message("industrial/factory/M1/plc/process", br#"{"temperature":70}"#).unwrap();
        assert_eq!(outcome, IngestOutcome::Sample { machine_id: "M1".into(), kind: EventKind::Process, delivered: 0 });
        assert_eq!(gw.store.latest("M1").and_then(|s| s.channel("temperature")), Some(70.0));

        let status = gw
            .handle_message("industrial/factory/M1/plc/status", br#"{"status":"idle","health_score":90,"uptime_percentage":99}"#)
            .unwrap();
        assert!(matches!(status, IngestOutcome::Sample { kind: EventKind::Status, .. }));
    }

    #[tokio::test]
    async fn dispatch_fails_fast_when_disconnected() {
        let bus = Arc::new(RecordingBus::default());
        let (gw, _) = gateway(bus.clone());

        assert!(matches!(gw.dispatch_command(request()).await, Err(BusError::NotConnected)));
        assert!(bus.published.lock().is_empty());
        assert!(gw.store.commands("M1", None).is_none());
    }

    #[tokio::test]
    async fn dispatch_publishes_control_payload() {
        let bus = Arc::new(RecordingBus::default());
        let (gw, health) = gateway(bus.clone());
        health.mark_mqtt_connected();

        let command = gw.dispatch_command(request()).await.unwrap();
        assert_eq!(command.status, CommandStatus::Sent);

        let published = bus.published.lock();
        let (topic, payload) = &published[0];
        assert_eq!(topic, "industrial/factory/M1/plc/control");
        let json: Value = serde_json::from_slice(payload).unwrap();
        assert_eq!(json["command"], "stop");
        assert_eq!(json["command_id"], command.command_id.as_str());
        assert_eq!(json["user_id"], "op1");
        assert!(json["parameters"].is_object());
        assert!(json["timestamp"].is_string());
    }

    #[tokio::test]
    async fn stalled_publish_times_out_and_is_logged_failed() {
        let (gw, health) = gateway(Arc::new(StalledBus));
        health.mark_mqtt_connected();

        let err = gw.dispatch_command(request()).await.unwrap_err();
        assert!(matches!(err, BusError::Timeout(_)));
        let logged = gw.store.commands("M1", None).unwrap();
        assert_eq!(logged[0].status, CommandStatus::Failed);
    }
}
