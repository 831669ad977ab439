use crate::models::{Alarm, OperationalState, Severity, StatusSnapshot, SystemStatus};
use std::collections::BTreeMap;
use time::OffsetDateTime;

/// Copy of the store contents the aggregator reads, taken in one critical section.
#[derive(Debug, Clone, Default)]
pub struct FleetSnapshot {
    /// Latest status of every machine that has reported one.
    pub statuses: Vec<StatusSnapshot>,
    pub active_alarms: Vec<Alarm>,
}

pub fn system_status(snapshot: &FleetSnapshot, now: OffsetDateTime) -> SystemStatus {
    let mut machines_by_state: BTreeMap<OperationalState, usize> =
        OperationalState::ALL.iter().map(|s| (*s, 0)).collect();
    let mut health_sum = 0.0;
    let mut uptime_sum = 0.0;

    for status in &snapshot.statuses {
        *machines_by_state.entry(status.status).or_default() += 1;
        health_sum += status.health_score;
        uptime_sum += status.uptime_percentage;
    }

    let mut alarms_by_severity: BTreeMap<Severity, usize> =
        Severity::ALL.iter().map(|s| (*s, 0)).collect();
    for alarm in &snapshot.active_alarms {
        *alarms_by_severity.entry(alarm.severity).or_default() += 1;
    }

    let total_machines = snapshot.statuses.len();
    let denominator = total_machines.max(1) as f64;
    let count = |state: OperationalState| machines_by_state.get(&state).copied().unwrap_or(0);

    SystemStatus {
        timestamp: now,
        total_machines,
        running_machines: count(OperationalState::Running),
        idle_machines: count(OperationalState::Idle),
        maintenance_machines: count(OperationalState::Maintenance),
        error_machines: count(OperationalState::Error),
        offline_machines: count(OperationalState::Offline),
        total_alarms: snapshot.active_alarms.len(),
        critical_alarms: alarms_by_severity.get(&Severity::Critical).copied().unwrap_or(0),
        warning_alarms: alarms_by_severity.get(&Severity::Warning).copied().unwrap_or(0),
        machines_by_state,
        alarms_by_severity,
        average_health_score: health_sum / denominator,
        average_uptime: uptime_sum / denominator,
        bus_status: None,
    }
}
