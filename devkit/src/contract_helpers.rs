/*!
Payload builders for the fleet bus contracts

Builds topics and JSON payloads shaped like what machines publish, so tests
read as "machine M1 reports 72 degrees" instead of hand-written JSON.
*/

use fleetwatch_kernel::config::MqttConf;
use fleetwatch_kernel::contracts::{EventKind, TopicScheme};
use fleetwatch_kernel::models::{Advisory, AdvisoryType, Severity};
use serde_json::{json, Map, Value};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

pub fn rfc3339(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}

/// Topic + payload builder for one machine.
#[derive(Debug, Clone)]
pub struct FleetMessageBuilder {
    scheme: TopicScheme,
    machine_id: String,
}

impl FleetMessageBuilder {
    /// Uses the default `industrial/factory/.../plc` topic tree.
    pub fn new<S: Into<String>>(machine_id: S) -> Self {
        Self::with_scheme(TopicScheme::from_conf(&MqttConf::default()), machine_id)
    }

    pub fn with_scheme<S: Into<String>>(scheme: TopicScheme, machine_id: S) -> Self {
        Self { scheme, machine_id: machine_id.into() }
    }

    pub fn machine_id(&self) -> &str {
        &self.machine_id
    }

    pub fn topic(&self, kind: EventKind) -> String {
        format!(
            "{}/{}/{}/{}/{}",
            self.scheme.namespace,
            self.scheme.site,
            self.machine_id,
            self.scheme.device,
            kind.as_str()
        )
    }

    pub fn control_topic(&self) -> String {
        self.scheme.control_topic(&self.machine_id)
    }

    pub fn process(channels: &[(&str, f64)]) -> Value {
        let mut obj: Map<String, Value> = channels.iter().map(|(k, v)| (k.to_string(), json!(v))).collect();
        obj.insert("timestamp".into(), json!(rfc3339(OffsetDateTime::now_utc())));
        Value::Object(obj)
    }

    pub fn status(state: &str, health_score: f64, uptime_percentage: f64) -> Value {
        json!({
            "timestamp": rfc3339(OffsetDateTime::now_utc()),
            "status": state,
            "health_score": health_score,
            "uptime_percentage": uptime_percentage,
        })
    }

    pub fn alarm(alarm_id: &str, severity: &str, message: &str) -> Value {
        json!({
            "timestamp": rfc3339(OffsetDateTime::now_utc()),
            "alarm_id": alarm_id,
            "severity": severity,
            "message": message,
            "acknowledged": false,
        })
    }

    pub fn resolved_alarm(alarm_id: &str) -> Value {
        json!({
            "timestamp": rfc3339(OffsetDateTime::now_utc()),
            "alarm_id": alarm_id,
            "resolved": true,
        })
    }

    pub fn heartbeat() -> Value {
        json!({ "timestamp": rfc3339(OffsetDateTime::now_utc()) })
    }

    pub fn command_update(command_id: &str, status: &str, response: Option<&str>) -> Value {
        json!({
            "timestamp": rfc3339(OffsetDateTime::now_utc()),
            "command_id": command_id,
            "status": status,
            "response": response,
        })
    }

    /// Advisory as the external scoring service would submit it.
    pub fn advisory(&self, advisory_type: AdvisoryType, severity: Severity, confidence: f64) -> Advisory {
        Advisory {
            machine_id: self.machine_id.clone(),
            timestamp: OffsetDateTime::now_utc(),
            advisory_type,
            severity,
            message: format!("{advisory_type:?} on {}", self.machine_id),
            confidence,
            ttf_days: Some(12.0),
            mtbf_hours: Some(720.0),
            anomaly_score: Some(0.4),
            affected_components: vec!["bearing".into()],
            recommended_actions: vec!["schedule inspection".into()],
            model_version: Some("test".into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topics_follow_the_kernel_scheme() {
        let m1 = FleetMessageBuilder::new("M1");
        assert_eq!(m1.topic(EventKind::Process), "industrial/factory/M1/plc/process");
        assert_eq!(m1.control_topic(), "industrial/factory/M1/plc/control");
    }

    #[test]
    fn payload_builders_carry_expected_fields() {
        let process = FleetMessageBuilder::process(&[("temperature", 72.0)]);
        assert_eq!(process["temperature"], 72.0);
        assert!(process["timestamp"].is_string());

        let alarm = FleetMessageBuilder::alarm("A1", "critical", "overheat");
        assert_eq!(alarm["alarm_id"], "A1");
        assert_eq!(FleetMessageBuilder::resolved_alarm("A1")["resolved"], true);
    }
}
