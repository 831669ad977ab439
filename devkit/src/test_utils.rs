/*!
Test harness for the fleetwatch kernel

Wires a real store, fan-out and ingest gateway around a `MockBus`, so tests
can push bus payloads, attach fake dashboard clients and assert on what they
receive without a broker or a socket.
*/

use crate::mqtt_stub::MockBus;
use anyhow::Result;
use fleetwatch_kernel::config::{HistoryConf, MachineMeta, MqttConf};
use fleetwatch_kernel::contracts::TopicScheme;
use fleetwatch_kernel::fanout::{BroadcastFanout, ClientId, Frame};
use fleetwatch_kernel::health::HealthTracker;
use fleetwatch_kernel::mqtt::{ingest_queue, BusPublisher, IngestGateway, IngestOutcome};
use fleetwatch_kernel::state::StateStore;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

pub const DEFAULT_CLIENT_QUEUE: usize = 64;

/// Routes kernel logs through the test writer; safe to call from every test.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_test_writer()
        .try_init();
}

pub struct TestHarness {
    pub store: Arc<StateStore>,
    pub fanout: Arc<BroadcastFanout>,
    pub health: HealthTracker,
    pub bus: MockBus,
    pub gateway: Arc<IngestGateway>,
}

impl TestHarness {
    pub fn new() -> Self {
        Self::with_config(HistoryConf::default(), DEFAULT_CLIENT_QUEUE)
    }

    pub fn with_config(history: HistoryConf, client_queue: usize) -> Self {
        Self::with_store(StateStore::new(history), client_queue)
    }

    /// Harness whose store carries configured machine metadata.
    pub fn with_machines(machines: HashMap<String, MachineMeta>) -> Self {
        Self::with_store(StateStore::with_metadata(HistoryConf::default(), machines), DEFAULT_CLIENT_QUEUE)
    }

    fn with_store(store: StateStore, client_queue: usize) -> Self {
        init_tracing();

        let store = Arc::new(store);
        let fanout = Arc::new(BroadcastFanout::new(client_queue));
        let health = HealthTracker::new();
        let bus = MockBus::new();
        let publisher: Arc<dyn BusPublisher> = Arc::new(bus.clone());
        let gateway = Arc::new(IngestGateway::new(
            store.clone(),
            fanout.clone(),
            health.clone(),
            publisher,
            TopicScheme::from_conf(&MqttConf::default()),
            Duration::from_millis(500),
        ));

        Self { store, fanout, health, bus, gateway }
    }

    /// Marks the bus as connected so command dispatch is allowed.
    pub fn connect_bus(&self) {
        self.health.mark_mqtt_connected();
    }

    pub fn disconnect_bus(&self) {
        self.health.mark_mqtt_disconnected();
    }

    /// Feeds one JSON payload straight through the gateway.
    pub fn ingest(&self, topic: &str, payload: &Value) -> Result<IngestOutcome> {
        let bytes = serde_json::to_vec(payload)?;
        Ok(self.gateway.handle_message(topic, &bytes)?)
    }

    /// Starts the real ingest loop fed by `bus.simulate_incoming`.
    /// `bus.detach_ingest()` closes the queue and lets the loop finish.
    pub fn spawn_ingest_loop(&self, capacity: usize) -> JoinHandle<()> {
        let (tx, rx) = ingest_queue(capacity);
        self.bus.attach_ingest(tx);
        let gateway = self.gateway.clone();
        tokio::spawn(async move { gateway.run(rx).await })
    }

    pub fn connect_client(&self) -> TestClient {
        let (id, rx) = self.fanout.register();
        TestClient { id, rx }
    }

    /// Polls the mock bus until something is published on `topic`.
    pub async fn wait_for_published(&self, topic: &str, timeout_ms: u64) -> Result<Option<Value>> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if let Some(msg) = self.bus.get_last_json_message::<Value>(topic)? {
                return Ok(Some(msg));
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tracing::warn!(%topic, "timed out waiting for publish");
        Ok(None)
    }

    pub fn get_stats(&self) -> TestStats {
        let mut topic_counts = HashMap::new();
        let published = self.bus.get_published_messages();
        for msg in &published {
            *topic_counts.entry(msg.topic.clone()).or_insert(0) += 1;
        }
        TestStats {
            total_published: published.len(),
            topic_counts,
            machines: self.store.machine_count(),
            clients: self.fanout.client_count(),
        }
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug)]
pub struct TestStats {
    pub total_published: usize,
    pub topic_counts: HashMap<String, usize>,
    pub machines: usize,
    pub clients: usize,
}

/// A registered fan-out client read directly from its queue.
pub struct TestClient {
    pub id: ClientId,
    pub rx: mpsc::Receiver<Frame>,
}

impl TestClient {
    /// Everything queued so far, decoded.
    pub fn drain(&mut self) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(frame) = self.rx.try_recv() {
            if let Ok(value) = serde_json::from_str(&frame) {
                out.push(value);
            }
        }
        out
    }

    /// Envelope `type` of every queued frame, in delivery order.
    pub fn drain_types(&mut self) -> Vec<String> {
        self.drain()
            .iter()
            .filter_map(|v| v["type"].as_str().map(str::to_string))
            .collect()
    }

    /// Waits for the next frame whose `type` matches.
    pub async fn next_of_type(&mut self, kind: &str, timeout_ms: u64) -> Result<Value> {
        tokio::time::timeout(Duration::from_millis(timeout_ms), self.recv_of_type(kind))
            .await
            .map_err(|_| anyhow::anyhow!("no '{kind}' frame within {timeout_ms}ms"))?
    }

    async fn recv_of_type(&mut self, kind: &str) -> Result<Value> {
        while let Some(frame) = self.rx.recv().await {
            let value: Value = serde_json::from_str(&frame)?;
            if value["type"] == kind {
                return Ok(value);
            }
        }
        anyhow::bail!("client queue closed before a '{kind}' frame arrived")
    }
}

/// Reads `a.b.c` out of a JSON value.
pub fn get_nested_field<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |current, part| current.get(part))
}

pub fn assert_field_equals(value: &Value, path: &str, expected: &Value) -> Result<()> {
    match get_nested_field(value, path) {
        Some(actual) if actual == expected => Ok(()),
        Some(actual) => anyhow::bail!("field '{path}' mismatch: expected {expected}, got {actual}"),
        None => anyhow::bail!("field '{path}' not found"),
    }
}
