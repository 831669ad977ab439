use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::{collections::HashMap, path::Path, time::Duration};
use tokio::fs;

/// Bounds for `retention.advisory_max_age_hours` (one hour to ten years).
pub const ADVISORY_MAX_AGE_HOURS: (i64, i64) = (1, 24 * 365 * 10);

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct KernelConfig {
    pub mqtt: MqttConf,
    pub history: HistoryConf,
    pub fanout: FanoutConf,
    pub ingest: IngestConf,
    pub retention: RetentionConf,
    pub http: HttpConf,
    pub machines: HashMap<String, MachineMeta>,
}

/// Descriptive data for one machine; everything is optional.
#[derive(Debug, Serialize, Deserialize, Clone, Default, PartialEq)]
#[serde(default)]
pub struct MachineMeta {
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub machine_type: Option<String>,
    pub location: Option<String>,
    pub manufacturer: Option<String>,
    pub model: Option<String>,
    pub serial_number: Option<String>,
    pub installation_date: Option<String>,
    pub specifications: Map<String, Value>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub keep_alive_secs: u64,
    pub namespace: String, // ex: "industrial"
    pub site: String,      // ex: "factory"
    pub device: String,    // ex: "plc"
    pub reconnect_delay_ms: u64,
    pub publish_timeout_ms: u64,
}

/// Per-kind capacity of the per-machine histories.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(default)]
pub struct HistoryConf {
    pub process: usize,
    pub status: usize,
    pub alarms: usize,
    pub advisories: usize,
    pub commands: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct FanoutConf {
    pub heartbeat_interval_secs: u64,
    pub idle_timeout_secs: u64,
    pub client_queue_capacity: usize,
    pub send_timeout_ms: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct IngestConf {
    pub queue_capacity: usize,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct RetentionConf {
    pub advisory_max_age_hours: i64,
    pub prune_interval_secs: u64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
    /// Allowed browser origins; `"*"` allows any.
    pub cors_origins: Vec<String>,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            client_id: "fleetwatch-kernel".into(),
            keep_alive_secs: 15,
            namespace: "industrial".into(),
            site: "factory".into(),
            device: "plc".into(),
            reconnect_delay_ms: 2000,
            publish_timeout_ms: 3000,
        }
    }
}

impl Default for HistoryConf {
    fn default() -> Self {
        Self { process: 1000, status: 1000, alarms: 1000, advisories: 1000, commands: 1000 }
    }
}

impl Default for FanoutConf {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            idle_timeout_secs: 30 * 60,
            client_queue_capacity: 256,
            send_timeout_ms: 5000,
        }
    }
}

impl Default for IngestConf {
    fn default() -> Self {
        Self { queue_capacity: 1024 }
    }
}

impl Default for RetentionConf {
    fn default() -> Self {
        Self { advisory_max_age_hours: 24, prune_interval_secs: 3600 }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into(), cors_origins: vec!["*".into()] }
    }
}

impl MqttConf {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl FanoutConf {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

impl RetentionConf {
    pub fn advisory_max_age(&self) -> time::Duration {
        let (min, max) = ADVISORY_MAX_AGE_HOURS;
        time::Duration::hours(self.advisory_max_age_hours.clamp(min, max))
    }

    pub fn prune_interval(&self) -> Duration {
        Duration::from_secs(self.prune_interval_secs.max(1))
    }
}

/// Loads the kernel config from `FLEETWATCH_CONFIG` (default `kernel.yaml`),
/// then applies environment overrides.
pub async fn load_config() -> KernelConfig {
    let path = std::env::var("FLEETWATCH_CONFIG").unwrap_or_else(|_| "kernel.yaml".into());
    let mut cfg = load_config_from(&path).await;
    apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());
    cfg
}

pub async fn load_config_from<P: AsRef<Path>>(path: P) -> KernelConfig {
    let path = path.as_ref();
    if !path.exists() {
        tracing::warn!(path = %path.display(), "no config file, using defaults");
        return KernelConfig::default();
    }
    let txt = fs::read_to_string(path).await.unwrap_or_default();
    if txt.trim().is_empty() {
        return KernelConfig::default();
    }
    let cfg: KernelConfig = serde_yaml::from_str(&txt).unwrap_or_else(|e| {
        tracing::error!(path = %path.display(), error = %e, "invalid config, using defaults");
        KernelConfig::default()
    });
    let (min, max) = ADVISORY_MAX_AGE_HOURS;
    if !(min..=max).contains(&cfg.retention.advisory_max_age_hours) {
        tracing::warn!(
            value = cfg.retention.advisory_max_age_hours,
            min,
            max,
            "advisory_max_age_hours out of range, clamping"
        );
    }
    cfg
}

fn apply_env_overrides<F: Fn(&str) -> Option<String>>(cfg: &mut KernelConfig, var: F) {
    if let Some(host) = var("MQTT_BROKER_HOST") {
        cfg.mqtt.host = host;
    }
    if let Some(port) = var("MQTT_BROKER_PORT") {
        match port.parse() {
            Ok(port) => cfg.mqtt.port = port,
            Err(_) => tracing::warn!(value = %port, "ignoring invalid MQTT_BROKER_PORT"),
        }
    }
    if let Some(bind) = var("FLEETWATCH_HTTP_ADDR") {
        cfg.http.bind = bind;
    }
}
