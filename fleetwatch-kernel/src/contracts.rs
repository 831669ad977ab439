/**
 * MESSAGE CONTRACTS - Bus topic grammar, payload decoding, client envelopes
 *
 * ROLE:
 * Everything that crosses the kernel boundary as bytes is shaped here.
 * Inbound bus payloads become typed events, typed events become the JSON
 * envelopes pushed to live-view clients.
 *
 * OPERATION:
 * - Topics follow `<namespace>/<site>/<machine_id>/<device>/<kind>`
 * - Payloads must be JSON objects; `timestamp` defaults to ingestion time
 * - Range and type violations are rejected with a `DecodeError` before
 *   anything reaches the store
 * - Client envelopes are `{type, machine_id?, timestamp, data}`
 */

use crate::config::MqttConf;
use crate::models::{
    Advisory, Alarm, AlarmTransition, Command, CommandStatus, CommandUpdate, MachineId,
    OperationalState, Sample, Severity, StatusSnapshot, TelemetrySample,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, PrimitiveDateTime};

/// Keys of a process payload that are not telemetry channels.
const RESERVED_PROCESS_KEYS: [&str; 3] = ["timestamp", "machine_id", "additional_params"];

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed topic '{0}'")]
    Topic(String),
    #[error("unknown message kind '{0}'")]
    UnknownKind(String),
    #[error("payload is not valid UTF-8")]
    Utf8,
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object")]
    NotAnObject,
    #[error("missing required field '{0}'")]
    MissingField(&'static str),
    #[error("field '{field}' has the wrong type, expected {expected}")]
    WrongType { field: &'static str, expected: &'static str },
    #[error("field '{field}' = {value} outside [{min}, {max}]")]
    OutOfRange { field: &'static str, value: f64, min: f64, max: f64 },
    #[error("field '{field}' has unsupported value '{value}'")]
    UnknownVariant { field: &'static str, value: String },
    #[error("unparseable timestamp '{0}'")]
    Timestamp(String),
    #[error("process payload carries no numeric channel")]
    NoChannels,
}

// ============ TOPICS ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Process,
    Status,
    Alarms,
    Heartbeat,
    Commands,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::Process,
        EventKind::Status,
        EventKind::Alarms,
        EventKind::Heartbeat,
        EventKind::Commands,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Status => "status",
            Self::Alarms => "alarms",
            Self::Heartbeat => "heartbeat",
            Self::Commands => "commands",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topic {
    pub machine_id: MachineId,
    pub kind: EventKind,
}

/// Fixed segments of the topic tree this kernel listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    pub namespace: String,
    pub site: String,
    pub device: String,
}

impl TopicScheme {
    pub fn from_conf(conf: &MqttConf) -> Self {
        Self {
            namespace: conf.namespace.clone(),
            site: conf.site.clone(),
            device: conf.device.clone(),
        }
    }

    /// One wildcard filter per inbound kind.
    pub fn subscriptions(&self) -> Vec<String> {
        EventKind::ALL
            .iter()
            .map(|kind| format!("{}/{}/+/{}/{}", self.namespace, self.site, self.device, kind.as_str()))
            .collect()
    }

    pub fn control_topic(&self, machine_id: &str) -> String {
        format!("{}/{}/{}/{}/control", self.namespace, self.site, machine_id, self.device)
    }

    pub fn parse(&self, topic: &str) -> Result<Topic, DecodeError> {
        let parts: Vec<&str> = topic.split('/').collect();
        let [namespace, site, machine_id, device, kind] = parts.as_slice() else {
            return Err(DecodeError::Topic(topic.to_string()));
        };
        if *namespace != self.namespace || *site != self.site || *device != self.device || machine_id.is_empty() {
            return Err(DecodeError::Topic(topic.to_string()));
        }
        let kind = EventKind::parse(kind).ok_or_else(|| DecodeError::UnknownKind(kind.to_string()))?;
        Ok(Topic { machine_id: machine_id.to_string(), kind })
    }
}

// ============ INBOUND DECODING ============

/// A bus message decoded into the shape the store consumes.
#[derive(Debug, Clone, PartialEq)]
pub enum BusEvent {
    Sample(Sample),
    Alarm(Alarm),
    Heartbeat { machine_id: MachineId, timestamp: OffsetDateTime },
    CommandUpdate(CommandUpdate),
}

pub fn decode(topic: &Topic, payload: &[u8], now: OffsetDateTime) -> Result<BusEvent, DecodeError> {
    let text = std::str::from_utf8(payload).map_err(|_| DecodeError::Utf8)?;
    let obj = match serde_json::from_str::<Value>(text)? {
        Value::Object(obj) => obj,
        _ => return Err(DecodeError::NotAnObject),
    };
    let machine_id = topic.machine_id.clone();
    let timestamp = opt_timestamp(&obj, "timestamp")?.unwrap_or(now);

    match topic.kind {
        EventKind::Process => decode_process(machine_id, timestamp, &obj).map(|s| BusEvent::Sample(Sample::Process(s))),
        EventKind::Status => decode_status(machine_id, timestamp, &obj).map(|s| BusEvent::Sample(Sample::Status(s))),
        EventKind::Alarms => decode_alarm(machine_id, timestamp, &obj).map(BusEvent::Alarm),
        EventKind::Heartbeat => Ok(BusEvent::Heartbeat { machine_id, timestamp }),
        EventKind::Commands => decode_command_update(machine_id, timestamp, &obj).map(BusEvent::CommandUpdate),
    }
}

fn decode_process(machine_id: MachineId, timestamp: OffsetDateTime, obj: &Map<String, Value>) -> Result<TelemetrySample, DecodeError> {
    let mut channels = BTreeMap::new();
    for (key, value) in obj {
        if RESERVED_PROCESS_KEYS.contains(&key.as_str()) {
            continue;
        }
        if let Some(v) = value.as_f64() {
            channels.insert(key.clone(), v);
        }
    }
    match obj.get("additional_params") {
        None | Some(Value::Null) => {}
        Some(Value::Object(extra)) => {
            for (key, value) in extra {
                if let Some(v) = value.as_f64() {
                    channels.entry(key.clone()).or_insert(v);
                }
            }
        }
        Some(_) => return Err(DecodeError::WrongType { field: "additional_params", expected: "object" }),
    }
    if channels.is_empty() {
        return Err(DecodeError::NoChannels);
    }
    Ok(TelemetrySample { machine_id, timestamp, channels })
}

fn decode_status(machine_id: MachineId, timestamp: OffsetDateTime, obj: &Map<String, Value>) -> Result<StatusSnapshot, DecodeError> {
    let status = req_str(obj, "status")?;
    let status = enum_value::<OperationalState>("status", &status)?;

    Ok(StatusSnapshot {
        machine_id,
        timestamp,
        status,
        health_score: req_percent(obj, "health_score")?,
        uptime_percentage: req_percent(obj, "uptime_percentage")?,
        efficiency: opt_ranged(obj, "efficiency", 0.0, 100.0)?,
        availability: opt_ranged(obj, "availability", 0.0, 100.0)?,
        last_maintenance: opt_timestamp(obj, "last_maintenance")?,
        next_maintenance: opt_timestamp(obj, "next_maintenance")?,
        operating_hours: opt_f64(obj, "operating_hours")?,
        cycle_count: opt_u64(obj, "cycle_count")?,
    })
}

fn decode_alarm(machine_id: MachineId, timestamp: OffsetDateTime, obj: &Map<String, Value>) -> Result<Alarm, DecodeError> {
    let alarm_id = match opt_str(obj, "alarm_id")? {
        Some(id) if !id.is_empty() => id,
        _ => format!("ALM_{machine_id}_{}", timestamp.unix_timestamp()),
    };
    let severity = match opt_str(obj, "severity")? {
        Some(s) => enum_value::<Severity>("severity", &s)?,
        None => Severity::Medium,
    };

    Ok(Alarm {
        machine_id,
        alarm_id,
        timestamp,
        severity,
        message: opt_str(obj, "message")?.unwrap_or_else(|| "Unknown alarm".to_string()),
        category: opt_str(obj, "category")?,
        source: opt_str(obj, "source")?,
        acknowledged: opt_bool(obj, "acknowledged")?.unwrap_or(false),
        acknowledged_by: opt_str(obj, "acknowledged_by")?,
        acknowledged_at: opt_timestamp(obj, "acknowledged_at")?,
        resolved: opt_bool(obj, "resolved")?.unwrap_or(false),
        resolved_by: opt_str(obj, "resolved_by")?,
        resolved_at: opt_timestamp(obj, "resolved_at")?,
    })
}

fn decode_command_update(machine_id: MachineId, timestamp: OffsetDateTime, obj: &Map<String, Value>) -> Result<CommandUpdate, DecodeError> {
    let command_id = req_str(obj, "command_id")?;
    let status = req_str(obj, "status")?;
    let response = match obj.get("response") {
        None | Some(Value::Null) => None,
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => Some(other.to_string()),
    };

    Ok(CommandUpdate {
        machine_id,
        command_id,
        status: enum_value::<CommandStatus>("status", &status)?,
        response,
        timestamp,
    })
}

/// Range checks for advisories submitted by the external scoring service.
pub fn validate_advisory(advisory: &Advisory) -> Result<(), DecodeError> {
    if advisory.machine_id.is_empty() {
        return Err(DecodeError::MissingField("machine_id"));
    }
    check_range("confidence", advisory.confidence, 0.0, 1.0)?;
    if let Some(score) = advisory.anomaly_score {
        check_range("anomaly_score", score, 0.0, 1.0)?;
    }
    Ok(())
}

/// Accepts RFC 3339 and offset-less ISO 8601 (taken as UTC). A space may
/// stand in for the `T` date/time separator.
pub fn parse_timestamp(s: &str) -> Result<OffsetDateTime, DecodeError> {
    parse_iso(s)
        .or_else(|| {
            let (date, clock) = s.split_once(' ')?;
            parse_iso(&format!("{date}T{clock}"))
        })
        .ok_or_else(|| DecodeError::Timestamp(s.to_string()))
}

fn parse_iso(s: &str) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(s, &Rfc3339)
        .or_else(|_| OffsetDateTime::parse(s, &Iso8601::DEFAULT))
        .or_else(|_| PrimitiveDateTime::parse(s, &Iso8601::DEFAULT).map(PrimitiveDateTime::assume_utc))
        .ok()
}

fn enum_value<T: for<'de> Deserialize<'de>>(field: &'static str, value: &str) -> Result<T, DecodeError> {
    serde_json::from_value(Value::String(value.to_ascii_lowercase()))
        .map_err(|_| DecodeError::UnknownVariant { field, value: value.to_string() })
}

fn check_range(field: &'static str, value: f64, min: f64, max: f64) -> Result<f64, DecodeError> {
    if value.is_finite() && (min..=max).contains(&value) {
        Ok(value)
    } else {
        Err(DecodeError::OutOfRange { field, value, min, max })
    }
}

fn opt_f64(obj: &Map<String, Value>, field: &'static str) -> Result<Option<f64>, DecodeError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_f64().map(Some).ok_or(DecodeError::WrongType { field, expected: "number" }),
    }
}

fn opt_u64(obj: &Map<String, Value>, field: &'static str) -> Result<Option<u64>, DecodeError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v.as_u64().map(Some).ok_or(DecodeError::WrongType { field, expected: "unsigned integer" }),
    }
}

fn opt_ranged(obj: &Map<String, Value>, field: &'static str, min: f64, max: f64) -> Result<Option<f64>, DecodeError> {
    opt_f64(obj, field)?.map(|v| check_range(field, v, min, max)).transpose()
}

fn req_percent(obj: &Map<String, Value>, field: &'static str) -> Result<f64, DecodeError> {
    opt_ranged(obj, field, 0.0, 100.0)?.ok_or(DecodeError::MissingField(field))
}

fn opt_str(obj: &Map<String, Value>, field: &'static str) -> Result<Option<String>, DecodeError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(DecodeError::WrongType { field, expected: "string" }),
    }
}

fn req_str(obj: &Map<String, Value>, field: &'static str) -> Result<String, DecodeError> {
    opt_str(obj, field)?.ok_or(DecodeError::MissingField(field))
}

fn opt_bool(obj: &Map<String, Value>, field: &'static str) -> Result<Option<bool>, DecodeError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Bool(b)) => Ok(Some(*b)),
        Some(_) => Err(DecodeError::WrongType { field, expected: "boolean" }),
    }
}

fn opt_timestamp(obj: &Map<String, Value>, field: &'static str) -> Result<Option<OffsetDateTime>, DecodeError> {
    opt_str(obj, field)?.map(|s| parse_timestamp(&s)).transpose()
}

// ============ CLIENT ENVELOPES ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeType {
    Connection,
    ProcessData,
    Status,
    Alarm,
    Heartbeat,
    SystemNotification,
    AlarmNotification,
    AdvisoryNotification,
    CommandResponse,
    Subscription,
    Unsubscription,
}

/// Message pushed to live-view clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub kind: EnvelopeType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<MachineId>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub data: Value,
}

impl Envelope {
    pub fn new(kind: EnvelopeType, machine_id: Option<MachineId>, timestamp: OffsetDateTime, data: Value) -> Self {
        Self { kind, machine_id, timestamp, data }
    }

    /// Envelope with no machine id; reaches every client regardless of subscription.
    pub fn global(kind: EnvelopeType, data: Value) -> Self {
        Self::new(kind, None, OffsetDateTime::now_utc(), data)
    }

    pub fn connection(client_id: u64) -> Self {
        Self::global(
            EnvelopeType::Connection,
            json!({ "message": "Connected to FleetWatch", "connection_id": client_id }),
        )
    }

    pub fn heartbeat(active_connections: usize) -> Self {
        Self::global(EnvelopeType::Heartbeat, json!({ "active_connections": active_connections }))
    }

    pub fn sample(sample: &Sample) -> Self {
        let (kind, data) = match sample {
            Sample::Process(s) => (EnvelopeType::ProcessData, serde_json::to_value(s)),
            Sample::Status(s) => (EnvelopeType::Status, serde_json::to_value(s)),
        };
        Self::new(kind, Some(sample.machine_id().to_string()), sample.timestamp(), data.unwrap_or(Value::Null))
    }

    pub fn alarm(alarm: &Alarm, transition: &AlarmTransition) -> Self {
        let data = json!({
            "alarm": alarm,
            "transition": transition.as_str(),
        });
        Self::new(EnvelopeType::Alarm, Some(alarm.machine_id.clone()), alarm.timestamp, data)
    }

    pub fn alarm_notification(alarm: &Alarm, transition: &AlarmTransition) -> Self {
        let mut data = json!({ "alarm": alarm, "transition": transition.as_str() });
        if let AlarmTransition::Updated { previous, .. } = transition {
            data["previous_severity"] = json!(previous);
        }
        Self::new(EnvelopeType::AlarmNotification, Some(alarm.machine_id.clone()), OffsetDateTime::now_utc(), data)
    }

    pub fn advisory(advisory: &Advisory) -> Self {
        Self::new(
            EnvelopeType::AdvisoryNotification,
            Some(advisory.machine_id.clone()),
            OffsetDateTime::now_utc(),
            serde_json::to_value(advisory).unwrap_or(Value::Null),
        )
    }

    pub fn command_response(command: &Command) -> Self {
        Self::new(
            EnvelopeType::CommandResponse,
            Some(command.machine_id.clone()),
            OffsetDateTime::now_utc(),
            serde_json::to_value(command).unwrap_or(Value::Null),
        )
    }

    pub fn system(notification_type: &str, message: &str, severity: &str) -> Self {
        Self::global(
            EnvelopeType::SystemNotification,
            json!({ "notification_type": notification_type, "message": message, "severity": severity }),
        )
    }

    pub fn subscription(machine_id: &str, subscribed: bool) -> Self {
        let (kind, status) = if subscribed {
            (EnvelopeType::Subscription, "subscribed")
        } else {
            (EnvelopeType::Unsubscription, "unsubscribed")
        };
        Self::new(kind, Some(machine_id.to_string()), OffsetDateTime::now_utc(), json!({ "status": status }))
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
