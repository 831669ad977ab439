/**
 * FLEET STATE - Authoritative in-memory state per machine
 *
 * ROLE:
 * One MachineState per machine in an arena indexed by machine id: bounded
 * histories per kind, latest-value caches and the active-alarm registry.
 *
 * OPERATION:
 * - Every operation takes the store mutex exactly once, does bounded work
 *   and copies out whatever it returns
 * - Nothing inside the critical section calls back into the store
 * - Configured machine metadata is read-only and lives outside the mutex
 */

use crate::aggregator::FleetSnapshot;
use crate::config::{HistoryConf, MachineMeta};
use crate::history::BoundedHistory;
use crate::models::{
    Advisory, Alarm, AlarmTransition, Command, CommandUpdate, MachineDetails, MachineId,
    MachineOverview, OperationalState, Sample, Severity, StatusSnapshot, TelemetrySample,
};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use time::OffsetDateTime;
use tokio::task::JoinHandle;

/// Alarm log records included in a machine's detail view.
const RECENT_ALARMS: usize = 10;

const UNKNOWN: &str = "Unknown";

/// Handle to a machine's entry in the store arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct MachineSlot(usize);

#[derive(Debug)]
struct MachineState {
    machine_id: MachineId,
    process: BoundedHistory<TelemetrySample>,
    status: BoundedHistory<StatusSnapshot>,
    alarm_log: BoundedHistory<Alarm>,
    advisories: BoundedHistory<Advisory>,
    commands: BoundedHistory<Command>,
    latest_process: Option<TelemetrySample>,
    latest_status: Option<StatusSnapshot>,
    active_alarms: Vec<Alarm>,
    last_heartbeat: Option<OffsetDateTime>,
}

impl MachineState {
    fn new(machine_id: &str, capacity: &HistoryConf) -> Self {
        Self {
            machine_id: machine_id.to_string(),
            process: BoundedHistory::new(capacity.process),
            status: BoundedHistory::new(capacity.status),
            alarm_log: BoundedHistory::new(capacity.alarms),
            advisories: BoundedHistory::new(capacity.advisories),
            commands: BoundedHistory::new(capacity.commands),
            latest_process: None,
            latest_status: None,
            active_alarms: Vec::new(),
            last_heartbeat: None,
        }
    }

    /// Alarm lifecycle: open, update in place, or resolve; the raw event is
    /// always appended to the audit log.
    fn apply_alarm(&mut self, alarm: Alarm) -> AlarmTransition {
        let position = self.active_alarms.iter().position(|a| a.alarm_id == alarm.alarm_id);

        let transition = match (alarm.resolved, position) {
            (false, Some(idx)) => {
                let previous = self.active_alarms[idx].severity;
                self.active_alarms[idx] = alarm.clone();
                AlarmTransition::Updated {
                    previous,
                    escalated: alarm.severity.rank() > previous.rank(),
                }
            }
            (false, None) => {
                self.active_alarms.push(alarm.clone());
                AlarmTransition::Opened
            }
            (true, Some(idx)) => {
                self.active_alarms.remove(idx);
                AlarmTransition::Resolved
            }
            (true, None) => AlarmTransition::Untracked,
        };

        self.alarm_log.push(alarm);
        transition
    }

    fn overview(&self, now: OffsetDateTime, meta: Option<&MachineMeta>) -> MachineOverview {
        let critical_advisories = self
            .advisories
            .iter()
            .filter(|a| a.is_current(now) && a.severity.rank() >= Severity::High.rank())
            .count();
        let status = self.latest_status.as_ref();

        MachineOverview {
            machine_id: self.machine_id.clone(),
            name: self.display_name(meta),
            machine_type: describe(meta, |m| m.machine_type.clone()),
            location: describe(meta, |m| m.location.clone()),
            status: status.map(|s| s.status).unwrap_or(OperationalState::Offline),
            health_score: status.map(|s| s.health_score).unwrap_or(0.0),
            uptime_percentage: status.map(|s| s.uptime_percentage).unwrap_or(0.0),
            efficiency: status.and_then(|s| s.efficiency),
            availability: status.and_then(|s| s.availability),
            last_maintenance: status.and_then(|s| s.last_maintenance),
            next_maintenance: status.and_then(|s| s.next_maintenance),
            active_alarms: self.active_alarms.len(),
            critical_advisories,
            last_heartbeat: self.last_heartbeat,
            last_updated: status.map(|s| s.timestamp),
        }
    }

    fn details(&self, now: OffsetDateTime, meta: Option<&MachineMeta>) -> MachineDetails {
        let status = self.latest_status.as_ref();

        MachineDetails {
            machine_id: self.machine_id.clone(),
            name: self.display_name(meta),
            machine_type: describe(meta, |m| m.machine_type.clone()),
            location: describe(meta, |m| m.location.clone()),
            manufacturer: describe(meta, |m| m.manufacturer.clone()),
            model: describe(meta, |m| m.model.clone()),
            serial_number: describe(meta, |m| m.serial_number.clone()),
            installation_date: meta.and_then(|m| m.installation_date.clone()),
            specifications: meta.map(|m| m.specifications.clone()).unwrap_or_default(),
            status: status.map(|s| s.status).unwrap_or(OperationalState::Offline),
            health_score: status.map(|s| s.health_score).unwrap_or(0.0),
            uptime_percentage: status.map(|s| s.uptime_percentage).unwrap_or(0.0),
            efficiency: status.and_then(|s| s.efficiency),
            availability: status.and_then(|s| s.availability),
            last_maintenance: status.and_then(|s| s.last_maintenance),
            next_maintenance: status.and_then(|s| s.next_maintenance),
            operating_hours: status.and_then(|s| s.operating_hours),
            cycle_count: status.and_then(|s| s.cycle_count),
            current_process_data: self.latest_process.clone(),
            recent_alarms: self.alarm_log.tail(Some(RECENT_ALARMS)),
            advisories: self.advisories.iter().filter(|a| a.is_current(now)).cloned().collect(),
            last_heartbeat: self.last_heartbeat,
            last_updated: status.map(|s| s.timestamp),
        }
    }

    fn display_name(&self, meta: Option<&MachineMeta>) -> String {
        meta.and_then(|m| m.name.clone()).unwrap_or_else(|| self.machine_id.clone())
    }
}

fn describe(meta: Option<&MachineMeta>, field: impl Fn(&MachineMeta) -> Option<String>) -> String {
    meta.and_then(field).unwrap_or_else(|| UNKNOWN.to_string())
}

#[derive(Debug)]
struct FleetState {
    capacity: HistoryConf,
    index: HashMap<MachineId, MachineSlot>,
    machines: Vec<MachineState>,
}

impl FleetState {
    fn slot(&self, machine_id: &str) -> Option<MachineSlot> {
        self.index.get(machine_id).copied()
    }

    fn slot_or_insert(&mut self, machine_id: &str) -> MachineSlot {
        if let Some(slot) = self.slot(machine_id) {
            return slot;
        }
        let slot = MachineSlot(self.machines.len());
        self.machines.push(MachineState::new(machine_id, &self.capacity));
        self.index.insert(machine_id.to_string(), slot);
        slot
    }

    fn machine(&self, machine_id: &str) -> Option<&MachineState> {
        self.slot(machine_id).map(|MachineSlot(i)| &self.machines[i])
    }

    fn machine_mut(&mut self, machine_id: &str) -> Option<&mut MachineState> {
        self.slot(machine_id).map(|MachineSlot(i)| &mut self.machines[i])
    }

    fn machine_or_insert(&mut self, machine_id: &str) -> &mut MachineState {
        let MachineSlot(i) = self.slot_or_insert(machine_id);
        &mut self.machines[i]
    }
}

/// Mutation-safe state container shared as `Arc<StateStore>`.
#[derive(Debug)]
pub struct StateStore {
    inner: Mutex<FleetState>,
    metadata: HashMap<MachineId, MachineMeta>,
}

impl StateStore {
    pub fn new(capacity: HistoryConf) -> Self {
        Self::with_metadata(capacity, HashMap::new())
    }

    /// Store decorated with configured machine metadata. Metadata alone never
    /// creates a machine entry.
    pub fn with_metadata(capacity: HistoryConf, metadata: HashMap<MachineId, MachineMeta>) -> Self {
        Self {
            inner: Mutex::new(FleetState {
                capacity,
                index: HashMap::new(),
                machines: Vec::new(),
            }),
            metadata,
        }
    }

    // ============ WRITES ============

    /// Appends to the kind's bounded history and refreshes the latest-value cache.
    pub fn record_sample(&self, sample: Sample) {
        let mut fleet = self.inner.lock();
        let machine = fleet.machine_or_insert(sample.machine_id());
        match sample {
            Sample::Process(s) => {
                machine.latest_process = Some(s.clone());
                machine.process.push(s);
            }
            Sample::Status(s) => {
                machine.latest_status = Some(s.clone());
                machine.status.push(s);
            }
        }
    }

    pub fn record_alarm(&self, alarm: Alarm) -> AlarmTransition {
        let machine_id = alarm.machine_id.clone();
        let alarm_id = alarm.alarm_id.clone();
        let transition = self.inner.lock().machine_or_insert(&machine_id).apply_alarm(alarm);
        tracing::debug!(%machine_id, %alarm_id, transition = transition.as_str(), "alarm recorded");
        transition
    }

    /// Marks an active alarm as acknowledged. Repeated calls overwrite the
    /// actor and time; unknown alarms are left alone and yield `false`.
    pub fn acknowledge(&self, machine_id: &str, alarm_id: &str, actor: &str) -> bool {
        let now = OffsetDateTime::now_utc();
        let found = {
            let mut fleet = self.inner.lock();
            fleet
                .machine_mut(machine_id)
                .and_then(|m| m.active_alarms.iter_mut().find(|a| a.alarm_id == alarm_id))
                .map(|alarm| {
                    alarm.acknowledged = true;
                    alarm.acknowledged_by = Some(actor.to_string());
                    alarm.acknowledged_at = Some(now);
                })
                .is_some()
        };
        if found {
            tracing::info!(%machine_id, %alarm_id, %actor, "alarm acknowledged");
        }
        found
    }

    /// Closes an active alarm on behalf of `actor`. The closed record, with its
    /// acknowledgment fields intact, goes to the alarm audit log.
    pub fn resolve(&self, machine_id: &str, alarm_id: &str, actor: &str) -> bool {
        let now = OffsetDateTime::now_utc();
        let found = {
            let mut fleet = self.inner.lock();
            match fleet.machine_mut(machine_id) {
                Some(machine) => match machine.active_alarms.iter().position(|a| a.alarm_id == alarm_id) {
                    Some(idx) => {
                        let mut alarm = machine.active_alarms.remove(idx);
                        alarm.resolved = true;
                        alarm.resolved_by = Some(actor.to_string());
                        alarm.resolved_at = Some(now);
                        machine.alarm_log.push(alarm);
                        true
                    }
                    None => false,
                },
                None => false,
            }
        };
        if found {
            tracing::info!(%machine_id, %alarm_id, %actor, "alarm resolved");
        }
        found
    }

    pub fn record_heartbeat(&self, machine_id: &str, timestamp: OffsetDateTime) {
        self.inner.lock().machine_or_insert(machine_id).last_heartbeat = Some(timestamp);
    }

    pub fn record_advisory(&self, advisory: Advisory) {
        let mut fleet = self.inner.lock();
        fleet.machine_or_insert(&advisory.machine_id).advisories.push(advisory);
    }

    pub fn record_command(&self, command: Command) {
        let mut fleet = self.inner.lock();
        fleet.machine_or_insert(&command.machine_id).commands.push(command);
    }

    /// Applies a machine's progress report to the logged command, returning
    /// the updated copy. Commands evicted from the log (or never sent) yield `None`.
    pub fn update_command(&self, update: &CommandUpdate) -> Option<Command> {
        let mut fleet = self.inner.lock();
        let machine = fleet.machine_mut(&update.machine_id)?;
        let command = machine.commands.iter_mut().find(|c| c.command_id == update.command_id)?;
        command.status = update.status;
        if update.response.is_some() {
            command.response = update.response.clone();
        }
        Some(command.clone())
    }

    /// Drops advisories older than `now - max_age`; returns how many went.
    /// A cutoff outside the representable range prunes nothing.
    pub fn prune(&self, max_age: time::Duration, now: OffsetDateTime) -> usize {
        let Some(cutoff) = now.checked_sub(max_age) else {
            tracing::warn!(max_age_hours = max_age.whole_hours(), "advisory cutoff out of range, skipping prune");
            return 0;
        };
        let mut fleet = self.inner.lock();
        fleet
            .machines
            .iter_mut()
            .map(|m| m.advisories.retain(|a| a.timestamp > cutoff))
            .sum()
    }

    // ============ SNAPSHOT READS ============

    pub fn contains(&self, machine_id: &str) -> bool {
        self.inner.lock().slot(machine_id).is_some()
    }

    pub fn machine_count(&self) -> usize {
        self.inner.lock().machines.len()
    }

    /// Machine ids in first-seen order.
    pub fn machine_ids(&self) -> Vec<MachineId> {
        self.inner.lock().machines.iter().map(|m| m.machine_id.clone()).collect()
    }

    pub fn latest(&self, machine_id: &str) -> Option<TelemetrySample> {
        self.inner.lock().machine(machine_id)?.latest_process.clone()
    }

    pub fn latest_all(&self) -> BTreeMap<MachineId, TelemetrySample> {
        let fleet = self.inner.lock();
        fleet
            .machines
            .iter()
            .filter_map(|m| m.latest_process.clone().map(|s| (m.machine_id.clone(), s)))
            .collect()
    }

    /// Newest `limit` process samples, oldest first; `None` for an unknown machine.
    pub fn history(&self, machine_id: &str, limit: Option<usize>) -> Option<Vec<TelemetrySample>> {
        Some(self.inner.lock().machine(machine_id)?.process.tail(limit))
    }

    pub fn latest_status(&self, machine_id: &str) -> Option<StatusSnapshot> {
        self.inner.lock().machine(machine_id)?.latest_status.clone()
    }

    pub fn status_history(&self, machine_id: &str, limit: Option<usize>) -> Option<Vec<StatusSnapshot>> {
        Some(self.inner.lock().machine(machine_id)?.status.tail(limit))
    }

    pub fn active_alarms(&self, machine_id: &str) -> Vec<Alarm> {
        self.inner
            .lock()
            .machine(machine_id)
            .map(|m| m.active_alarms.clone())
            .unwrap_or_default()
    }

    /// Active alarms of every machine that has at least one.
    pub fn active_alarms_all(&self) -> BTreeMap<MachineId, Vec<Alarm>> {
        let fleet = self.inner.lock();
        fleet
            .machines
            .iter()
            .filter(|m| !m.active_alarms.is_empty())
            .map(|m| (m.machine_id.clone(), m.active_alarms.clone()))
            .collect()
    }

    pub fn alarm_history(&self, machine_id: &str, limit: Option<usize>) -> Option<Vec<Alarm>> {
        Some(self.inner.lock().machine(machine_id)?.alarm_log.tail(limit))
    }

    /// Current (under 24h old) advisories for one machine.
    pub fn advisories(&self, machine_id: &str, now: OffsetDateTime) -> Vec<Advisory> {
        let fleet = self.inner.lock();
        match fleet.machine(machine_id) {
            Some(m) => m.advisories.iter().filter(|a| a.is_current(now)).cloned().collect(),
            None => Vec::new(),
        }
    }

    pub fn advisories_all(&self, now: OffsetDateTime) -> BTreeMap<MachineId, Vec<Advisory>> {
        let fleet = self.inner.lock();
        fleet
            .machines
            .iter()
            .filter_map(|m| {
                let current: Vec<Advisory> =
                    m.advisories.iter().filter(|a| a.is_current(now)).cloned().collect();
                (!current.is_empty()).then(|| (m.machine_id.clone(), current))
            })
            .collect()
    }

    pub fn commands(&self, machine_id: &str, limit: Option<usize>) -> Option<Vec<Command>> {
        Some(self.inner.lock().machine(machine_id)?.commands.tail(limit))
    }

    pub fn machine_overview(&self, machine_id: &str, now: OffsetDateTime) -> Option<MachineOverview> {
        let meta = self.metadata.get(machine_id);
        Some(self.inner.lock().machine(machine_id)?.overview(now, meta))
    }

    pub fn machines_overview(&self, now: OffsetDateTime) -> Vec<MachineOverview> {
        let fleet = self.inner.lock();
        fleet
            .machines
            .iter()
            .map(|m| m.overview(now, self.metadata.get(&m.machine_id)))
            .collect()
    }

    /// Detail view of one machine; `None` until the machine has reported.
    pub fn machine_details(&self, machine_id: &str, now: OffsetDateTime) -> Option<MachineDetails> {
        let meta = self.metadata.get(machine_id);
        Some(self.inner.lock().machine(machine_id)?.details(now, meta))
    }

    /// Copies out everything the status aggregator needs in one critical section.
    pub fn fleet_snapshot(&self) -> FleetSnapshot {
        let fleet = self.inner.lock();
        FleetSnapshot {
            statuses: fleet.machines.iter().filter_map(|m| m.latest_status.clone()).collect(),
            active_alarms: fleet.machines.iter().flat_map(|m| m.active_alarms.iter().cloned()).collect(),
        }
    }
}

/// Periodically prunes stale advisories from the store.
pub fn spawn_advisory_pruner(
    store: Arc<StateStore>,
    every: std::time::Duration,
    max_age: time::Duration,
) -> JoinHandle<()> {
    tracing::info!(every_secs = every.as_secs(), max_age_hours = max_age.whole_hours(), "starting advisory pruner");

    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let removed = store.prune(max_age, OffsetDateTime::now_utc());
            if removed > 0 {
                tracing::info!(removed, "pruned stale advisories");
            }
        }
    })
}
