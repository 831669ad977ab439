//! Client registry and delivery behaviour of `BroadcastFanout`.
//!
//! Clients are plain queue receivers here; the socket adapter is not involved.

use fleetwatch_devkit::{FleetMessageBuilder, TestHarness};
use fleetwatch_kernel::contracts::{Envelope, EventKind};
use fleetwatch_kernel::fanout::BroadcastFanout;
use fleetwatch_kernel::models::{AdvisoryType, Severity};
use serde_json::json;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Test: a closed client is dropped while the others still receive the event
// ---------------------------------------------------------------------------

#[tokio::test]
async fn closed_client_is_removed_during_broadcast() {
    let harness = TestHarness::new();
    let mut client1 = harness.connect_client();
    let client2 = harness.connect_client();
    let mut client3 = harness.connect_client();
    drop(client2.rx);

    let delivered = harness.fanout.broadcast(&Envelope::system("shift_change", "shift B on duty", "info"));

    assert_eq!(delivered, 2);
    assert_eq!(harness.fanout.client_count(), 2);
    assert_eq!(client1.drain_types(), ["connection", "system_notification"]);
    assert_eq!(client3.drain_types(), ["connection", "system_notification"]);
}

// ---------------------------------------------------------------------------
// Test: a client that stops reading is dropped once its queue is full
// ---------------------------------------------------------------------------

#[tokio::test]
async fn slow_client_does_not_block_others() {
    let harness = TestHarness::with_config(Default::default(), 2);
    let _stalled = harness.connect_client();
    let mut reader = harness.connect_client();
    let topic = FleetMessageBuilder::new("M1").topic(EventKind::Process);

    for t in 0..4 {
        harness
            .ingest(&topic, &FleetMessageBuilder::process(&[("temperature", 70.0 + t as f64)]))
            .unwrap();
        reader.drain();
    }

    assert_eq!(harness.fanout.client_count(), 1);
    assert_eq!(harness.store.history("M1", None).unwrap().len(), 4);
}

// ---------------------------------------------------------------------------
// Test: events reach a client in the order they were broadcast
// ---------------------------------------------------------------------------

#[tokio::test]
async fn per_client_order_matches_broadcast_order() {
    let harness = TestHarness::new();
    let mut client = harness.connect_client();
    let topic = FleetMessageBuilder::new("M1").topic(EventKind::Process);

    for t in 0..10 {
        harness.ingest(&topic, &json!({"seq": t as f64})).unwrap();
    }

    let seqs: Vec<f64> = client
        .drain()
        .iter()
        .filter(|frame| frame["type"] == "process_data")
        .filter_map(|frame| frame["data"]["channels"]["seq"].as_f64())
        .collect();
    assert_eq!(seqs, (0..10).map(|t| t as f64).collect::<Vec<_>>());
}

// ---------------------------------------------------------------------------
// Test: machine subscriptions filter machine events but not global ones
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscriptions_filter_machine_events() {
    let harness = TestHarness::new();
    let mut watcher = harness.connect_client();
    assert!(harness.fanout.subscribe(watcher.id, "M2"));
    watcher.drain();

    let m1 = FleetMessageBuilder::new("M1");
    let m2 = FleetMessageBuilder::new("M2");
    harness.ingest(&m1.topic(EventKind::Process), &FleetMessageBuilder::process(&[("rpm", 1200.0)])).unwrap();
    harness.ingest(&m2.topic(EventKind::Process), &FleetMessageBuilder::process(&[("rpm", 900.0)])).unwrap();
    harness.fanout.notify_system("maintenance_window", "line 2 stops at 18:00", "info");

    let frames = watcher.drain();
    let machines: Vec<_> = frames.iter().map(|f| f["machine_id"].as_str()).collect();
    assert_eq!(machines, [Some("M2"), None]);
}

// ---------------------------------------------------------------------------
// Test: advisories are stored and pushed to clients
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submitted_advisory_is_broadcast() {
    let harness = TestHarness::new();
    let mut client = harness.connect_client();
    let advisory = FleetMessageBuilder::new("M3").advisory(AdvisoryType::FaultPrediction, Severity::High, 0.87);

    let delivered = harness.gateway.submit_advisory(advisory).unwrap();
    assert_eq!(delivered, 1);

    let frame = client.next_of_type("advisory_notification", 500).await.unwrap();
    assert_eq!(frame["machine_id"], "M3");
    assert_eq!(frame["data"]["severity"], "high");
    assert_eq!(harness.store.advisories("M3", time::OffsetDateTime::now_utc()).len(), 1);
}

// ---------------------------------------------------------------------------
// Test: out-of-range advisory confidence is rejected
// ---------------------------------------------------------------------------

#[tokio::test]
async fn advisory_confidence_is_validated() {
    let harness = TestHarness::new();
    let advisory = FleetMessageBuilder::new("M3").advisory(AdvisoryType::AnomalyDetection, Severity::Low, 1.5);

    assert!(harness.gateway.submit_advisory(advisory).is_err());
    assert!(!harness.store.contains("M3"));
}

// ---------------------------------------------------------------------------
// Test: idle clients are evicted by the heartbeat sweep
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn heartbeat_evicts_idle_clients() {
    let fanout = BroadcastFanout::new(16);
    let (idle, _idle_rx) = fanout.register();
    let (active, mut active_rx) = fanout.register();

    tokio::time::advance(Duration::from_secs(45)).await;
    fanout.touch(active);
    tokio::time::advance(Duration::from_secs(30)).await;

    fanout.heartbeat(Duration::from_secs(60));

    assert_eq!(fanout.client_count(), 1);
    assert!(fanout.subscription(idle).is_none());
    let mut kinds = Vec::new();
    while let Ok(frame) = active_rx.try_recv() {
        let value: serde_json::Value = serde_json::from_str(&frame).unwrap();
        kinds.push(value["type"].as_str().unwrap().to_string());
    }
    assert_eq!(kinds, ["connection", "heartbeat"]);
}
