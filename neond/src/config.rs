use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::knobs::Knobs;

const DEFAULT_CONFIG_PATH: &str = "/etc/neon/neon.toml";
const ENV_CONFIG_PATH: &str = "NEON_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub metrics: MetricsConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `NEON_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path = std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&PathBuf::from(path))
    }

    /// Load configuration from an explicit path (e.g. `neond --config`),
    /// ignoring `NEON_CONFIG`. Falls back to defaults the same way `load`
    /// does if the file is missing or fails to parse.
    pub fn load_from(path: &Path) -> Self {
        match fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

/// File form of the knob surface; validated and converted to
/// [`Knobs`] once at startup, then governed by the live knob surface
/// (`KnobStore`) from then on.
#[derive(Debug, Deserialize, Clone)]
pub struct SchedulerConfig {
    #[serde(default = "default_polling_t_ms")]
    pub polling_t_ms: u32,
    #[serde(default = "default_malicious_t_ms")]
    pub malicious_t_ms: u32,
    #[serde(default = "default_policy")]
    pub policy: String,
    #[serde(default = "default_timeslice_t_ms")]
    pub timeslice_t_ms: u32,
    #[serde(default = "default_disengage")]
    pub disengage: bool,
    #[serde(default = "default_sampling_t_ms")]
    pub sampling_t_ms: u32,
    #[serde(default = "default_sampling_x")]
    pub sampling_x: u32,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            polling_t_ms: default_polling_t_ms(),
            malicious_t_ms: default_malicious_t_ms(),
            policy: default_policy(),
            timeslice_t_ms: default_timeslice_t_ms(),
            disengage: default_disengage(),
            sampling_t_ms: default_sampling_t_ms(),
            sampling_x: default_sampling_x(),
        }
    }
}

impl SchedulerConfig {
    /// Parses `policy` and builds the initial [`Knobs`], independent of
    /// `KnobStore`'s own range validation (which runs again on every live
    /// update through the knob surface).
    pub fn to_knobs(&self) -> crate::error::NeonResult<Knobs> {
        use std::str::FromStr;
        let policy = neon_proto::PolicyKind::from_str(&self.policy)
            .map_err(|e| crate::error::NeonError::UnexpectedState(e))?;
        Ok(Knobs {
            polling_t: std::time::Duration::from_millis(self.polling_t_ms as u64),
            malicious_t: std::time::Duration::from_millis(self.malicious_t_ms as u64),
            policy,
            timeslice_t: std::time::Duration::from_millis(self.timeslice_t_ms as u64),
            disengage: self.disengage,
            sampling_t: std::time::Duration::from_millis(self.sampling_t_ms as u64),
            sampling_x: self.sampling_x,
        })
    }
}

fn default_polling_t_ms() -> u32 {
    1
}
fn default_malicious_t_ms() -> u32 {
    60_000
}
fn default_policy() -> String {
    "fcfs".to_string()
}
fn default_timeslice_t_ms() -> u32 {
    30
}
fn default_disengage() -> bool {
    true
}
fn default_sampling_t_ms() -> u32 {
    5
}
fn default_sampling_x() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    #[serde(default)]
    pub journald: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self { level: default_level(), journald: false }
    }
}

fn default_level() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MetricsConfig {
    #[serde(default)]
    pub prometheus: bool,
    #[serde(default = "default_metrics_addr")]
    pub listen_addr: String,
}

fn default_metrics_addr() -> String {
    "127.0.0.1:9464".to_string()
}

/// Where the daemon lives at runtime and what it was told about the devices
/// it owns. Device probing itself (reading the seven words off the bus) is
/// an external collaborator; this crate only consumes the
/// result, so the probe words are supplied here rather than discovered.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    #[serde(default = "default_status_path")]
    pub status_path: String,
    #[serde(default = "default_pid_path")]
    pub pid_path: String,
    /// Where `neon-cli set` queues knob updates for `neond` to drain
    /// (knob surface; see `neond::control`).
    #[serde(default = "default_control_path")]
    pub control_path: String,
    #[serde(default)]
    pub devices: Vec<neon_proto::DeviceProbeWords>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            status_path: default_status_path(),
            pid_path: default_pid_path(),
            control_path: default_control_path(),
            devices: Vec::new(),
        }
    }
}

fn default_status_path() -> String {
    "/run/neon/status.json".to_string()
}
fn default_pid_path() -> String {
    "/run/neon/neond.pid".to_string()
}
fn default_control_path() -> String {
    "/run/neon/control.json".to_string()
}
