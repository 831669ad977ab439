/*!
In-memory bus for kernel tests without a broker

`MockBus` stands in for the rumqttc client on the outbound side (it records
every publish) and can feed simulated inbound messages into an ingest queue.
*/

use anyhow::Result;
use async_trait::async_trait;
use fleetwatch_kernel::mqtt::{BusError, BusPublisher, IngestMessage};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct MockBus {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    failure: Arc<Mutex<Option<String>>>,
    ingest: Arc<Mutex<Option<mpsc::Sender<IngestMessage>>>>,
}

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every publish fails with `reason` until `recover` is called.
    pub fn fail_publishes<S: Into<String>>(&self, reason: S) {
        *self.failure.lock() = Some(reason.into());
    }

    pub fn recover(&self) {
        *self.failure.lock() = None;
    }

    /// Routes `simulate_incoming` into the given ingest queue.
    pub fn attach_ingest(&self, queue: mpsc::Sender<IngestMessage>) {
        *self.ingest.lock() = Some(queue);
    }

    /// Drops the ingest sender so the consuming loop can finish.
    pub fn detach_ingest(&self) {
        self.ingest.lock().take();
    }

    pub async fn simulate_incoming<S, V>(&self, topic: S, payload: V) -> Result<()>
    where
        S: Into<String>,
        V: Into<Vec<u8>>,
    {
        let sender = self
            .ingest
            .lock()
            .clone()
            .ok_or_else(|| anyhow::anyhow!("no ingest queue attached"))?;
        let message = IngestMessage { topic: topic.into(), payload: payload.into() };
        tracing::debug!(topic = %message.topic, "[mock] simulated incoming");
        sender.send(message).await.map_err(|e| anyhow::anyhow!("ingest queue closed: {e}"))
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        match self.find_messages_by_topic(topic).last() {
            Some(last) => Ok(Some(serde_json::from_slice(&last.payload)?)),
            None => Ok(None),
        }
    }

    pub fn clear(&self) {
        self.published_messages.lock().clear();
    }
}

#[async_trait]
impl BusPublisher for MockBus {
    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), BusError> {
        if let Some(reason) = self.failure.lock().clone() {
            return Err(BusError::Publish(reason));
        }
        tracing::debug!(%topic, bytes = payload.len(), "[mock] published");
        self.published_messages.lock().push(MockMessage { topic: topic.to_string(), payload });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn records_publishes_and_parses_json() {
        let bus = MockBus::new();
        bus.publish("a/b", br#"{"command":"stop"}"#.to_vec()).await.unwrap();
        bus.publish("a/c", b"{}".to_vec()).await.unwrap();

        assert_eq!(bus.get_published_messages().len(), 2);
        let last: Option<serde_json::Value> = bus.get_last_json_message("a/b").unwrap();
        assert_eq!(last.unwrap()["command"], "stop");

        bus.clear();
        assert!(bus.get_published_messages().is_empty());
    }

    #[tokio::test]
    async fn failure_mode_rejects_publishes() {
        let bus = MockBus::new();
        bus.fail_publishes("broker gone");
        assert!(matches!(bus.publish("a/b", vec![]).await, Err(BusError::Publish(_))));
        bus.recover();
        assert!(bus.publish("a/b", vec![]).await.is_ok());
    }

    #[tokio::test]
    async fn simulated_messages_reach_the_queue() {
        let bus = MockBus::new();
        assert!(bus.simulate_incoming("x", b"{}".to_vec()).await.is_err());

        let (tx, mut rx) = mpsc::channel(4);
        bus.attach_ingest(tx);
        bus.simulate_incoming("industrial/factory/M1/plc/heartbeat", b"{}".to_vec()).await.unwrap();
        assert_eq!(rx.recv().await.unwrap().topic, "industrial/factory/M1/plc/heartbeat");
    }
}
