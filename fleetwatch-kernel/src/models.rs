use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use time::{Duration, OffsetDateTime};

pub type MachineId = String;

/// Advisories older than this are no longer "current".
pub const ADVISORY_FRESHNESS: Duration = Duration::hours(24);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationalState {
    Running,
    Idle,
    Maintenance,
    Error,
    Offline,
}

impl OperationalState {
    pub const ALL: [OperationalState; 5] = [
        OperationalState::Running,
        OperationalState::Idle,
        OperationalState::Maintenance,
        OperationalState::Error,
        OperationalState::Offline,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Idle => "idle",
            Self::Maintenance => "maintenance",
            Self::Error => "error",
            Self::Offline => "offline",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    Warning,
    High,
    Critical,
}

impl Severity {
    pub const ALL: [Severity; 5] = [
        Severity::Low,
        Severity::Medium,
        Severity::Warning,
        Severity::High,
        Severity::Critical,
    ];

    /// Urgency rank; medium and warning share a level.
    pub fn rank(self) -> u8 {
        match self {
            Self::Low => 0,
            Self::Medium | Self::Warning => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::Warning => "warning",
            Self::High => "high",
            Self::Critical => "critical",
        }
    }
}

/// Process telemetry: named numeric channels read at one instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub machine_id: MachineId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub channels: BTreeMap<String, f64>,
}

impl TelemetrySample {
    pub fn channel(&self, name: &str) -> Option<f64> {
        self.channels.get(name).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub machine_id: MachineId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub status: OperationalState,
    pub health_score: f64,
    pub uptime_percentage: f64,
    pub efficiency: Option<f64>,
    pub availability: Option<f64>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_maintenance: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub next_maintenance: Option<OffsetDateTime>,
    pub operating_hours: Option<f64>,
    pub cycle_count: Option<u64>,
}

/// A sample of one of the kinds that keep both a history and a latest-value cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Sample {
    Process(TelemetrySample),
    Status(StatusSnapshot),
}

impl Sample {
    pub fn machine_id(&self) -> &str {
        match self {
            Sample::Process(s) => &s.machine_id,
            Sample::Status(s) => &s.machine_id,
        }
    }

    pub fn timestamp(&self) -> OffsetDateTime {
        match self {
            Sample::Process(s) => s.timestamp,
            Sample::Status(s) => s.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alarm {
    pub machine_id: MachineId,
    pub alarm_id: String,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub severity: Severity,
    pub message: String,
    pub category: Option<String>,
    pub source: Option<String>,
    pub acknowledged: bool,
    pub acknowledged_by: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub acknowledged_at: Option<OffsetDateTime>,
    pub resolved: bool,
    pub resolved_by: Option<String>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub resolved_at: Option<OffsetDateTime>,
}

/// Outcome of feeding one alarm event through the lifecycle.
#[derive(Debug, Clone, PartialEq)]
pub enum AlarmTransition {
    /// No active entry existed; the alarm is now open.
    Opened,
    /// An open alarm was overwritten in place.
    Updated { previous: Severity, escalated: bool },
    /// An open alarm was closed by a resolved event.
    Resolved,
    /// Resolved event for an alarm that was not active.
    Untracked,
}

impl AlarmTransition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Opened => "opened",
            Self::Updated { .. } => "updated",
            Self::Resolved => "resolved",
            Self::Untracked => "untracked",
        }
    }

    /// Whether operators should get a dedicated notification for this transition.
    pub fn is_notable(&self) -> bool {
        matches!(self, Self::Opened | Self::Updated { escalated: true, .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdvisoryType {
    FaultPrediction,
    AnomalyDetection,
    PerformanceDegradation,
    MaintenanceRequired,
    SensorDrift,
    ValveWear,
}

/// ML-derived, non-authoritative alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advisory {
    pub machine_id: MachineId,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub advisory_type: AdvisoryType,
    pub severity: Severity,
    pub message: String,
    pub confidence: f64,
    pub ttf_days: Option<f64>,
    pub mtbf_hours: Option<f64>,
    pub anomaly_score: Option<f64>,
    #[serde(default)]
    pub affected_components: Vec<String>,
    #[serde(default)]
    pub recommended_actions: Vec<String>,
    pub model_version: Option<String>,
}

impl Advisory {
    pub fn is_current(&self, now: OffsetDateTime) -> bool {
        self.timestamp > now - ADVISORY_FRESHNESS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandStatus {
    Pending,
    Sent,
    Acknowledged,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub machine_id: MachineId,
    pub command_id: String,
    pub command: String,
    pub parameters: Map<String, Value>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub user_id: Option<String>,
    pub status: CommandStatus,
    pub response: Option<String>,
}

/// Progress report a machine publishes about a command it received.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandUpdate {
    pub machine_id: MachineId,
    pub command_id: String,
    pub status: CommandStatus,
    pub response: Option<String>,
    pub timestamp: OffsetDateTime,
}

/// Per-machine summary. Machines without a status report show as offline.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineOverview {
    pub machine_id: MachineId,
    pub name: String,
    #[serde(rename = "type")]
    pub machine_type: String,
    pub location: String,
    pub status: OperationalState,
    pub health_score: f64,
    pub uptime_percentage: f64,
    pub efficiency: Option<f64>,
    pub availability: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_maintenance: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_maintenance: Option<OffsetDateTime>,
    pub active_alarms: usize,
    pub critical_advisories: usize,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_heartbeat: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
}

/// Everything known about one machine: configured metadata, the latest
/// status and process sample, recent alarm log and current advisories.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MachineDetails {
    pub machine_id: MachineId,
    pub name: String,
    #[serde(rename = "type")]
    pub machine_type: String,
    pub location: String,
    pub manufacturer: String,
    pub model: String,
    pub serial_number: String,
    pub installation_date: Option<String>,
    pub specifications: Map<String, Value>,
    pub status: OperationalState,
    pub health_score: f64,
    pub uptime_percentage: f64,
    pub efficiency: Option<f64>,
    pub availability: Option<f64>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_maintenance: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub next_maintenance: Option<OffsetDateTime>,
    pub operating_hours: Option<f64>,
    pub cycle_count: Option<u64>,
    pub current_process_data: Option<TelemetrySample>,
    pub recent_alarms: Vec<Alarm>,
    pub advisories: Vec<Advisory>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_heartbeat: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
}

/// Fleet-wide rollup, recomputed on every query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemStatus {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub total_machines: usize,
    pub running_machines: usize,
    pub idle_machines: usize,
    pub maintenance_machines: usize,
    pub error_machines: usize,
    pub offline_machines: usize,
    pub machines_by_state: BTreeMap<OperationalState, usize>,
    pub total_alarms: usize,
    pub critical_alarms: usize,
    pub warning_alarms: usize,
    pub alarms_by_severity: BTreeMap<Severity, usize>,
    pub average_health_score: f64,
    pub average_uptime: f64,
    pub bus_status: Option<String>,
}
