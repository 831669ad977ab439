//! Router-level tests for the HTTP surface, driven with `tower::ServiceExt::oneshot`.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::response::Response;
use axum::Router;
use fleetwatch_devkit::{FleetMessageBuilder, TestHarness};
use fleetwatch_kernel::config::{HttpConf, MachineMeta};
use fleetwatch_kernel::contracts::EventKind;
use fleetwatch_kernel::http::{build_router, AppState};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceExt;

fn app(harness: &TestHarness) -> Router {
    app_with(harness, &HttpConf::default())
}

fn app_with(harness: &TestHarness, http: &HttpConf) -> Router {
    let app_state = AppState {
        store: harness.store.clone(),
        fanout: harness.fanout.clone(),
        health: harness.health.clone(),
        gateway: harness.gateway.clone(),
        client_send_timeout: Duration::from_secs(1),
    };
    build_router(app_state, http)
}

fn preflight(uri: &str, origin: &str) -> Request<Body> {
    Request::builder()
        .method(Method::OPTIONS)
        .uri(uri)
        .header("origin", origin)
        .header("access-control-request-method", "GET")
        .body(Body::empty())
        .unwrap()
}

async fn send(app: Router, method: Method, uri: &str, body: Option<Value>) -> Response {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(json) => builder
            .header("content-type", "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    app.oneshot(request).await.unwrap()
}

async fn body_json(response: Response) -> Value {
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    serde_json::from_slice(&bytes).unwrap()
}

fn seed(harness: &TestHarness) {
    let m1 = FleetMessageBuilder::new("M1");
    let m2 = FleetMessageBuilder::new("M2");
    harness.ingest(&m1.topic(EventKind::Status), &FleetMessageBuilder::status("running", 90.0, 98.0)).unwrap();
    harness.ingest(&m2.topic(EventKind::Status), &FleetMessageBuilder::status("error", 40.0, 70.0)).unwrap();
    harness.ingest(&m1.topic(EventKind::Process), &FleetMessageBuilder::process(&[("temperature", 72.0)])).unwrap();
    harness
        .ingest(&m2.topic(EventKind::Alarms), &FleetMessageBuilder::alarm("A1", "critical", "coolant low"))
        .unwrap();
}

// ---------------------------------------------------------------------------
// Test: GET /health reports bus and client state
// ---------------------------------------------------------------------------

#[tokio::test]
async fn health_reports_bus_state() {
    let harness = TestHarness::new();
    harness.connect_bus();

    let response = send(app(&harness), Method::GET, "/health", None).await;
    assert_eq!(response.status(), StatusCode::OK);

    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["mqtt_connected"], true);
    assert_eq!(json["active_websockets"], 0);
}

// ---------------------------------------------------------------------------
// Test: GET /api/status rolls up the fleet
// ---------------------------------------------------------------------------

#[tokio::test]
async fn fleet_status_rollup() {
    let harness = TestHarness::new();
    seed(&harness);

    let json = body_json(send(app(&harness), Method::GET, "/api/status", None).await).await;
    assert_eq!(json["total_machines"], 2);
    assert_eq!(json["running_machines"], 1);
    assert_eq!(json["error_machines"], 1);
    assert_eq!(json["critical_alarms"], 1);
    assert_eq!(json["average_health_score"], 65.0);
    assert_eq!(json["machines_by_state"]["idle"], 0);
}

// ---------------------------------------------------------------------------
// Test: per-machine reads and 404 for unknown machines
// ---------------------------------------------------------------------------

#[tokio::test]
async fn machine_reads_and_unknown_machine() {
    let harness = TestHarness::new();
    seed(&harness);

    let response = send(app(&harness), Method::GET, "/api/process/M1", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["channels"]["temperature"], 72.0);

    let machines = body_json(send(app(&harness), Method::GET, "/api/machines", None).await).await;
    assert_eq!(machines.as_array().map(Vec::len), Some(2));

    let response = send(app(&harness), Method::GET, "/api/machines/M9", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert!(body_json(response).await["error"].as_str().unwrap().contains("M9"));

    // reads never create machines
    assert!(!harness.store.contains("M9"));
}

// ---------------------------------------------------------------------------
// Test: GET /api/machines/{id} returns the full detail view
// ---------------------------------------------------------------------------

#[tokio::test]
async fn machine_details_merge_metadata_and_live_state() {
    let meta = MachineMeta {
        name: Some("BPM2000 Production Line".into()),
        machine_type: Some("Manufacturing Line".into()),
        location: Some("Factory Floor A".into()),
        installation_date: Some("2020-01-15".into()),
        ..MachineMeta::default()
    };
    let harness = TestHarness::with_machines([("M1".to_string(), meta)].into_iter().collect());
    seed(&harness);

    let response = send(app(&harness), Method::GET, "/api/machines/M1", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["name"], "BPM2000 Production Line");
    assert_eq!(json["type"], "Manufacturing Line");
    assert_eq!(json["manufacturer"], "Unknown");
    assert_eq!(json["installation_date"], "2020-01-15");
    assert_eq!(json["status"], "running");
    assert_eq!(json["current_process_data"]["channels"]["temperature"], 72.0);
    assert_eq!(json["recent_alarms"], json!([]));

    let json = body_json(send(app(&harness), Method::GET, "/api/machines/M2", None).await).await;
    assert_eq!(json["name"], "M2");
    assert_eq!(json["recent_alarms"][0]["alarm_id"], "A1");
    assert!(json["current_process_data"].is_null());

    let machines = body_json(send(app(&harness), Method::GET, "/api/machines", None).await).await;
    assert_eq!(machines[0]["location"], "Factory Floor A");
}

// ---------------------------------------------------------------------------
// Test: CORS preflight for the default wildcard and for an explicit origin list
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cors_preflight_allows_any_origin_by_default() {
    let harness = TestHarness::new();

    let response = app(&harness).oneshot(preflight("/api/status", "http://dashboard.local")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["access-control-allow-origin"], "*");
    assert!(response.headers().contains_key("access-control-allow-methods"));
}

#[tokio::test]
async fn cors_preflight_honours_configured_origins() {
    let harness = TestHarness::new();
    let http = HttpConf {
        cors_origins: vec!["http://dashboard.local".into(), "not a\norigin".into()],
        ..HttpConf::default()
    };

    let response = app_with(&harness, &http)
        .oneshot(preflight("/api/status", "http://dashboard.local"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["access-control-allow-origin"], "http://dashboard.local");
    assert_eq!(response.headers()["access-control-allow-credentials"], "true");

    let response = app_with(&harness, &http)
        .oneshot(preflight("/api/status", "http://evil.example"))
        .await
        .unwrap();
    assert!(!response.headers().contains_key("access-control-allow-origin"));
}

// ---------------------------------------------------------------------------
// Test: acknowledge then resolve through the operator endpoints
// ---------------------------------------------------------------------------

#[tokio::test]
async fn acknowledge_then_resolve_alarm() {
    let harness = TestHarness::new();
    seed(&harness);
    let mut client = harness.connect_client();

    let response = send(app(&harness), Method::POST, "/api/alarms/M2/A1/acknowledge?user=op1", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let response = send(app(&harness), Method::POST, "/api/alarms/M2/A1/resolve?user=op1", None).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["resolved_by"], "op1");

    let active = body_json(send(app(&harness), Method::GET, "/api/alarms/M2", None).await).await;
    assert_eq!(active, json!([]));

    let history = body_json(send(app(&harness), Method::GET, "/api/alarms/M2/history", None).await).await;
    let archived = history.as_array().unwrap().last().unwrap().clone();
    assert_eq!(archived["acknowledged_by"], "op1");
    assert!(archived["resolved_at"].is_string());

    let response = send(app(&harness), Method::POST, "/api/alarms/M2/A1/resolve", None).await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    assert_eq!(client.drain_types(), ["connection", "system_notification"]);
}

// ---------------------------------------------------------------------------
// Test: POST /api/control maps bus state to status codes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn control_endpoint_status_codes() {
    let harness = TestHarness::new();
    let body = json!({"machine_id": "M1", "command": "stop"});

    let response = send(app(&harness), Method::POST, "/api/control", Some(body.clone())).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

    harness.connect_bus();
    let response = send(app(&harness), Method::POST, "/api/control", Some(body)).await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "sent");

    let response = send(app(&harness), Method::POST, "/api/control", Some(json!({"machine_id": "", "command": "stop"}))).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    harness.disconnect_bus();
    let response = send(app(&harness), Method::POST, "/api/control", Some(json!({"machine_id": "M1", "command": "start"}))).await;
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
}

// ---------------------------------------------------------------------------
// Test: POST /api/advisories validates and stores
// ---------------------------------------------------------------------------

#[tokio::test]
async fn advisory_submission() {
    let harness = TestHarness::new();
    let advisory = json!({
        "machine_id": "M4",
        "timestamp": time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap(),
        "advisory_type": "sensor_drift",
        "severity": "medium",
        "message": "thermocouple drifting",
        "confidence": 0.7,
    });

    let response = send(app(&harness), Method::POST, "/api/advisories", Some(advisory.clone())).await;
    assert_eq!(response.status(), StatusCode::CREATED);

    let stored = body_json(send(app(&harness), Method::GET, "/api/advisories/M4", None).await).await;
    assert_eq!(stored.as_array().map(Vec::len), Some(1));

    let mut bad = advisory;
    bad["confidence"] = json!(2.0);
    let response = send(app(&harness), Method::POST, "/api/advisories", Some(bad)).await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}
