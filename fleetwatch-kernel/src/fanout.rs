use crate::contracts::Envelope;
use crate::models::{Advisory, Alarm, AlarmTransition, Command, MachineId};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub type ClientId = u64;

/// Serialized envelope, shared by every client it is delivered to.
pub type Frame = Arc<str>;

/// Which envelopes a client wants. Envelopes without a machine id reach everyone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "mode", content = "machines", rename_all = "snake_case")]
pub enum Subscription {
    All,
    Machines(BTreeSet<MachineId>),
}

impl Subscription {
    pub fn wants(&self, machine_id: Option<&str>) -> bool {
        match (self, machine_id) {
            (Subscription::All, _) | (_, None) => true,
            (Subscription::Machines(set), Some(id)) => set.contains(id),
        }
    }
}

#[derive(Debug)]
struct ClientEntry {
    sender: mpsc::Sender<Frame>,
    connected_at: OffsetDateTime,
    last_activity_at: OffsetDateTime,
    last_seen: Instant,
    subscription: Subscription,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientStats {
    pub client_id: ClientId,
    #[serde(with = "time::serde::rfc3339")]
    pub connected_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
    pub duration_seconds: i64,
    pub subscription: Subscription,
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStats {
    pub total_connections: usize,
    pub connections: Vec<ClientStats>,
}

/// Registry of live clients and the delivery path to them.
///
/// Each client owns a bounded queue drained by its connection's writer task.
/// Delivery never waits: a client whose queue is full or closed is dropped
/// from the registry and delivery to the others carries on.
#[derive(Debug)]
pub struct BroadcastFanout {
    clients: Mutex<HashMap<ClientId, ClientEntry>>,
    next_id: AtomicU64,
    queue_capacity: usize,
}

impl BroadcastFanout {
    pub fn new(queue_capacity: usize) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Adds a client and queues its `connection` welcome envelope.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<Frame>) {
        let (sender, receiver) = mpsc::channel(self.queue_capacity);
        let client_id = self.next_id.fetch_add(1, Ordering::Relaxed);

        if let Some(frame) = encode(&Envelope::connection(client_id)) {
            // Fresh queue with capacity >= 1, cannot be full.
            let _ = sender.try_send(frame);
        }

        let now = OffsetDateTime::now_utc();
        let total = {
            let mut clients = self.clients.lock();
            clients.insert(
                client_id,
                ClientEntry {
                    sender,
                    connected_at: now,
                    last_activity_at: now,
                    last_seen: Instant::now(),
                    subscription: Subscription::All,
                },
            );
            clients.len()
        };
        tracing::info!(client_id, total, "client connected");
        (client_id, receiver)
    }

    /// Safe to call on a client that is already gone.
    pub fn unregister(&self, client_id: ClientId) -> bool {
        let (removed, total) = {
            let mut clients = self.clients.lock();
            (clients.remove(&client_id).is_some(), clients.len())
        };
        if removed {
            tracing::info!(client_id, total, "client disconnected");
        }
        removed
    }

    /// Delivers `envelope` to every interested client, returning how many
    /// accepted it. Clients that could not take it are unregistered.
    pub fn broadcast(&self, envelope: &Envelope) -> usize {
        let Some(frame) = encode(envelope) else { return 0 };
        let machine_id = envelope.machine_id.as_deref();

        let targets: Vec<(ClientId, mpsc::Sender<Frame>)> = {
            let clients = self.clients.lock();
            clients
                .iter()
                .filter(|(_, c)| c.subscription.wants(machine_id))
                .map(|(id, c)| (*id, c.sender.clone()))
                .collect()
        };

        let mut delivered = 0;
        let mut failed = Vec::new();
        for (client_id, sender) in targets {
            match sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    tracing::warn!(client_id, reason = delivery_failure(&e), "dropping client");
                    failed.push(client_id);
                }
            }
        }
        self.remove_all(&failed);

        tracing::trace!(kind = ?envelope.kind, delivered, dropped = failed.len(), "broadcast");
        delivered
    }

    /// Personal message to one client, under the same drop-on-failure rule.
    pub fn send_to(&self, client_id: ClientId, envelope: &Envelope) -> bool {
        let Some(frame) = encode(envelope) else { return false };
        let Some(sender) = self.clients.lock().get(&client_id).map(|c| c.sender.clone()) else {
            return false;
        };
        match sender.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(client_id, reason = delivery_failure(&e), "dropping client");
                self.unregister(client_id);
                false
            }
        }
    }

    pub fn subscribe(&self, client_id: ClientId, machine_id: &str) -> bool {
        let known = {
            let mut clients = self.clients.lock();
            match clients.get_mut(&client_id) {
                Some(client) => {
                    if let Subscription::Machines(set) = &mut client.subscription {
                        set.insert(machine_id.to_string());
                    } else {
                        client.subscription = Subscription::Machines(BTreeSet::from([machine_id.to_string()]));
                    }
                    true
                }
                None => false,
            }
        };
        if known {
            tracing::info!(client_id, %machine_id, "client subscribed");
            self.send_to(client_id, &Envelope::subscription(machine_id, true));
        }
        known
    }

    /// Removing the last machine puts the client back on `All`.
    pub fn unsubscribe(&self, client_id: ClientId, machine_id: &str) -> bool {
        let known = {
            let mut clients = self.clients.lock();
            match clients.get_mut(&client_id) {
                Some(client) => {
                    if let Subscription::Machines(set) = &mut client.subscription {
                        set.remove(machine_id);
                        if set.is_empty() {
                            client.subscription = Subscription::All;
                        }
                    }
                    true
                }
                None => false,
            }
        };
        if known {
            tracing::info!(client_id, %machine_id, "client unsubscribed");
            self.send_to(client_id, &Envelope::subscription(machine_id, false));
        }
        known
    }

    pub fn subscription(&self, client_id: ClientId) -> Option<Subscription> {
        self.clients.lock().get(&client_id).map(|c| c.subscription.clone())
    }

    /// Records activity on a client's connection.
    pub fn touch(&self, client_id: ClientId) {
        if let Some(client) = self.clients.lock().get_mut(&client_id) {
            client.last_seen = Instant::now();
            client.last_activity_at = OffsetDateTime::now_utc();
        }
    }

    /// Drops clients with no activity for longer than `max_idle`.
    pub fn evict_idle(&self, max_idle: Duration) -> usize {
        let now = Instant::now();
        let evicted = {
            let mut clients = self.clients.lock();
            let before = clients.len();
            clients.retain(|_, c| now.saturating_duration_since(c.last_seen) <= max_idle);
            before - clients.len()
        };
        if evicted > 0 {
            tracing::info!(evicted, "evicted idle clients");
        }
        evicted
    }

    /// Evicts idle clients, then tells the rest how many are connected.
    pub fn heartbeat(&self, max_idle: Duration) -> usize {
        self.evict_idle(max_idle);
        let active = self.client_count();
        self.broadcast(&Envelope::heartbeat(active))
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn connection_stats(&self) -> ConnectionStats {
        let now = OffsetDateTime::now_utc();
        let clients = self.clients.lock();
        let mut connections: Vec<ClientStats> = clients
            .iter()
            .map(|(id, c)| ClientStats {
                client_id: *id,
                connected_at: c.connected_at,
                last_activity: c.last_activity_at,
                duration_seconds: (now - c.connected_at).whole_seconds().max(0),
                subscription: c.subscription.clone(),
            })
            .collect();
        connections.sort_by_key(|c| c.client_id);
        ConnectionStats { total_connections: clients.len(), connections }
    }

    /// Forgets every client; dropping the senders ends their writer tasks.
    pub fn shutdown_all(&self) -> usize {
        let count = {
            let mut clients = self.clients.lock();
            let count = clients.len();
            clients.clear();
            count
        };
        tracing::info!(count, "closed all client connections");
        count
    }

    pub fn notify_system(&self, notification_type: &str, message: &str, severity: &str) -> usize {
        tracing::info!(%notification_type, %message, "system notification");
        self.broadcast(&Envelope::system(notification_type, message, severity))
    }

    pub fn notify_alarm(&self, alarm: &Alarm, transition: &AlarmTransition) -> usize {
        tracing::info!(
            machine_id = %alarm.machine_id,
            alarm_id = %alarm.alarm_id,
            severity = alarm.severity.as_str(),
            transition = transition.as_str(),
            "alarm notification"
        );
        self.broadcast(&Envelope::alarm_notification(alarm, transition))
    }

    pub fn notify_advisory(&self, advisory: &Advisory) -> usize {
        self.broadcast(&Envelope::advisory(advisory))
    }

    pub fn notify_command_response(&self, command: &Command) -> usize {
        self.broadcast(&Envelope::command_response(command))
    }

    fn remove_all(&self, ids: &[ClientId]) {
        if ids.is_empty() {
            return;
        }
        let mut clients = self.clients.lock();
        for id in ids {
            clients.remove(id);
        }
    }
}

/// Periodic heartbeat and idle sweep.
pub fn spawn_heartbeat(fanout: Arc<BroadcastFanout>, every: Duration, max_idle: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let delivered = fanout.heartbeat(max_idle);
            tracing::trace!(delivered, "heartbeat sent");
        }
    })
}

fn encode(envelope: &Envelope) -> Option<Frame> {
    match envelope.to_json() {
        Ok(json) => Some(Arc::from(json)),
        Err(e) => {
            tracing::error!(kind = ?envelope.kind, error = %e, "failed to serialize envelope");
            None
        }
    }
}

fn delivery_failure<T>(err: &mpsc::error::TrySendError<T>) -> &'static str {
    match err {
        mpsc::error::TrySendError::Full(_) => "queue full",
        mpsc::error::TrySendError::Closed(_) => "connection closed",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contracts::EnvelopeType;
    use serde_json::{json, Value};

    fn event(machine_id: Option<&str>) -> Envelope {
        Envelope::new(
            EnvelopeType::ProcessData,
            machine_id.map(str::to_string),
            OffsetDateTime::now_utc(),
            json!({ "temperature": 72.0 }),
        )
    }

    fn next_type(rx: &mut mpsc::Receiver<Frame>) -> Option<String> {
        let frame = rx.try_recv().ok()?;
        let value: Value = serde_json::from_str(&frame).ok()?;
        value["type"].as_str().map(str::to_string)
    }

    #[tokio::test]
    async fn register_sends_welcome() {
        let fanout = BroadcastFanout::new(8);
        let (_, mut rx) = fanout.register();
        assert_eq!(next_type(&mut rx).as_deref(), Some("connection"));
        assert_eq!(fanout.client_count(), 1);
    }

    #[tokio::test]
    async fn closed_client_is_dropped_without_affecting_others() {
        let fanout = BroadcastFanout::new(8);
        let (_, mut rx1) = fanout.register();
        let (id2, rx2) = fanout.register();
        let (_, mut rx3) = fanout.register();
        drop(rx2);

        let delivered = fanout.broadcast(&event(Some("M1")));
        assert_eq!(delivered, 2);
        assert_eq!(fanout.client_count(), 2);
        assert!(fanout.subscription(id2).is_none());

        for rx in [&mut rx1, &mut rx3] {
            assert_eq!(next_type(rx).as_deref(), Some("connection"));
            assert_eq!(next_type(rx).as_deref(), Some("process_data"));
        }
    }

    #[tokio::test]
    async fn full_queue_drops_only_that_client() {
        let fanout = BroadcastFanout::new(2);
        let (slow, _slow_rx) = fanout.register();
        let (_, mut fast_rx) = fanout.register();

        assert_eq!(fanout.broadcast(&event(None)), 2);
        next_type(&mut fast_rx);
        next_type(&mut fast_rx);

        // slow client still holds welcome + first event
        assert_eq!(fanout.broadcast(&event(None)), 1);
        assert!(fanout.subscription(slow).is_none());
        assert_eq!(next_type(&mut fast_rx).as_deref(), Some("process_data"));
    }

    #[tokio::test]
    async fn frames_arrive_in_broadcast_order() {
        let fanout = BroadcastFanout::new(16);
        let (_, mut rx) = fanout.register();
        next_type(&mut rx);

        for i in 0..5 {
            fanout.broadcast(&Envelope::heartbeat(i));
        }
        for i in 0..5 {
            let frame = rx.try_recv().unwrap();
            let value: Value = serde_json::from_str(&frame).unwrap();
            assert_eq!(value["data"]["active_connections"], i);
        }
    }

    #[tokio::test]
    async fn subscriptions_filter_machine_events() {
        let fanout = BroadcastFanout::new(16);
        let (watcher, mut watcher_rx) = fanout.register();
        let (_, mut everyone_rx) = fanout.register();
        next_type(&mut watcher_rx);
        next_type(&mut everyone_rx);

        assert!(fanout.subscribe(watcher, "M1"));
        assert_eq!(next_type(&mut watcher_rx).as_deref(), Some("subscription"));

        assert_eq!(fanout.broadcast(&event(Some("M2"))), 1);
        assert_eq!(fanout.broadcast(&event(Some("M1"))), 2);
        assert_eq!(fanout.broadcast(&Envelope::heartbeat(2)), 2);

        assert_eq!(next_type(&mut watcher_rx).as_deref(), Some("process_data"));
        assert_eq!(next_type(&mut watcher_rx).as_deref(), Some("heartbeat"));
        assert!(next_type(&mut watcher_rx).is_none());

        assert!(fanout.unsubscribe(watcher, "M1"));
        assert_eq!(fanout.subscription(watcher), Some(Subscription::All));
        assert!(!fanout.subscribe(999, "M1"));
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_evicts_idle_clients_and_reports_count() {
        let fanout = BroadcastFanout::new(16);
        let (_, _idle_rx) = fanout.register();
        let (active, mut active_rx) = fanout.register();
        next_type(&mut active_rx);

        tokio::time::advance(Duration::from_secs(60)).await;
        fanout.touch(active);

        assert_eq!(fanout.heartbeat(Duration::from_secs(30)), 1);
        assert_eq!(fanout.client_count(), 1);

        let frame = active_rx.try_recv().unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["type"], "heartbeat");
        assert_eq!(value["data"]["active_connections"], 1);
    }

    #[tokio::test]
    async fn unregister_is_idempotent_and_shutdown_closes_queues() {
        let fanout = BroadcastFanout::new(4);
        let (a, _rx_a) = fanout.register();
        let (_, mut rx_b) = fanout.register();

        assert!(fanout.unregister(a));
        assert!(!fanout.unregister(a));
        assert_eq!(fanout.connection_stats().total_connections, 1);

        assert_eq!(fanout.shutdown_all(), 1);
        next_type(&mut rx_b);
        assert!(rx_b.recv().await.is_none());
    }
}
