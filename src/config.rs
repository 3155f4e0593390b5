//! Configuration loading
//!
//! Everything except the robot host is optional; the accessor methods fill in
//! the defaults.

use crate::backoff::{RetryPolicy, DEFAULT_BASE_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MULTIPLIER};
use crate::connection::DEFAULT_CONNECT_TIMEOUT;
use crate::recipe::MissingFieldPolicy;
use crate::session::SessionSettings;
use crate::supervisor::SupervisorSettings;
use crate::{Result, URError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_RTDE_PORT: u16 = 30004;
pub const DEFAULT_SCRIPT_PORT: u16 = 30003;
pub const DEFAULT_DASHBOARD_PORT: u16 = 29999;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub robot: RobotConfig,
    pub connection: Option<ConnectionConfig>,
    pub rtde: Option<RtdeConfig>,
    pub supervisor: Option<SupervisorConfig>,
    pub dashboard: Option<DashboardConfig>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RobotConfig {
    pub host: String,
    pub ports: Option<PortConfig>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct PortConfig {
    pub rtde: Option<u16>,
    pub script: Option<u16>,
    pub dashboard: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ConnectionConfig {
    pub max_attempts: Option<u32>,
    pub base_delay_seconds: Option<f64>,
    pub multiplier: Option<f64>,
    pub connect_timeout_seconds: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct RtdeConfig {
    pub recipe_file: Option<PathBuf>,
    pub output_recipe: Option<String>,
    pub input_recipe: Option<String>,
    pub missing_fields: Option<MissingFieldPolicy>,
    pub frequency_hz: Option<f64>,
    pub sample_timeout_ms: Option<u64>,
    pub push_timeout_ms: Option<u64>,
    pub read_timeout_ms: Option<u64>,
    pub handshake_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SupervisorConfig {
    pub poll_interval_ms: Option<u64>,
    pub chars_per_poll: Option<usize>,
    pub max_not_running_polls: Option<u32>,
    pub abort_timeout_seconds: Option<f64>,
    pub start_register: Option<u32>,
    pub finish_register: Option<u32>,
    pub send_attempts: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct DashboardConfig {
    pub reply_timeout_ms: Option<u64>,
}

fn seconds(value: Option<f64>, default: Duration) -> Duration {
    value
        .filter(|s| s.is_finite() && *s >= 0.0)
        .and_then(|s| Duration::try_from_secs_f64(s).ok())
        .unwrap_or(default)
}

fn millis(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl Config {
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| URError::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        Self::load_from_str(&contents)
    }

    pub fn load_from_str(contents: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Minimal config pointing at `host` with every default
    pub fn for_host(host: &str) -> Self {
        Self {
            robot: RobotConfig {
                host: host.to_string(),
                ports: None,
            },
            connection: None,
            rtde: None,
            supervisor: None,
            dashboard: None,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.robot.host.trim().is_empty() {
            return Err(URError::Config("robot.host must not be empty".to_string()));
        }
        let supervisor = self.supervisor();
        if supervisor.start_register() == supervisor.finish_register() {
            return Err(URError::Config(
                "supervisor.start_register and finish_register must differ".to_string(),
            ));
        }
        if supervisor.start_register() >= 64 || supervisor.finish_register() >= 64 {
            return Err(URError::Config("sentinel registers must be below 64".to_string()));
        }
        let rtde = self.rtde();
        if !(rtde.frequency_hz() > 0.0 && rtde.frequency_hz() <= 500.0) {
            return Err(URError::Config(format!(
                "rtde.frequency_hz must be in (0, 500], got {}",
                rtde.frequency_hz()
            )));
        }
        let period = Duration::from_secs_f64(1.0 / rtde.frequency_hz());
        let read_timeout = rtde.session_settings().read_timeout;
        if read_timeout < period {
            return Err(URError::Config(format!(
                "rtde.read_timeout_ms ({:?}) is shorter than one sample period ({:?}) at {} Hz",
                read_timeout,
                period,
                rtde.frequency_hz()
            )));
        }
        Ok(())
    }

    pub fn ports(&self) -> PortConfig {
        self.robot.ports.clone().unwrap_or_default()
    }

    pub fn connection(&self) -> ConnectionConfig {
        self.connection.clone().unwrap_or_default()
    }

    pub fn rtde(&self) -> RtdeConfig {
        self.rtde.clone().unwrap_or_default()
    }

    pub fn supervisor(&self) -> SupervisorConfig {
        self.supervisor.clone().unwrap_or_default()
    }

    pub fn dashboard(&self) -> DashboardConfig {
        self.dashboard.clone().unwrap_or_default()
    }
}

impl PortConfig {
    pub fn rtde(&self) -> u16 {
        self.rtde.unwrap_or(DEFAULT_RTDE_PORT)
    }

    pub fn script(&self) -> u16 {
        self.script.unwrap_or(DEFAULT_SCRIPT_PORT)
    }

    pub fn dashboard(&self) -> u16 {
        self.dashboard.unwrap_or(DEFAULT_DASHBOARD_PORT)
    }
}

impl ConnectionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.max_attempts.unwrap_or(DEFAULT_MAX_ATTEMPTS),
            seconds(self.base_delay_seconds, DEFAULT_BASE_DELAY),
            self.multiplier.unwrap_or(DEFAULT_MULTIPLIER),
        )
    }

    pub fn connect_timeout(&self) -> Duration {
        seconds(self.connect_timeout_seconds, DEFAULT_CONNECT_TIMEOUT)
    }
}

impl RtdeConfig {
    pub fn recipe_file(&self) -> PathBuf {
        self.recipe_file.clone().unwrap_or_else(|| PathBuf::from("config/recipes.yaml"))
    }

    pub fn output_recipe(&self) -> String {
        self.output_recipe.clone().unwrap_or_else(|| "rco".to_string())
    }

    pub fn input_recipe(&self) -> String {
        self.input_recipe.clone().unwrap_or_else(|| "rci".to_string())
    }

    pub fn missing_fields(&self) -> MissingFieldPolicy {
        self.missing_fields.unwrap_or_default()
    }

    pub fn frequency_hz(&self) -> f64 {
        self.frequency_hz.unwrap_or(125.0)
    }

    pub fn session_settings(&self) -> SessionSettings {
        let defaults = SessionSettings::default();
        SessionSettings {
            frequency: self.frequency_hz(),
            protocol_version: defaults.protocol_version,
            sample_timeout: millis(self.sample_timeout_ms, defaults.sample_timeout),
            push_timeout: millis(self.push_timeout_ms, defaults.push_timeout),
            read_timeout: millis(self.read_timeout_ms, defaults.read_timeout),
            handshake_timeout: millis(self.handshake_timeout_ms, defaults.handshake_timeout),
        }
    }
}

impl SupervisorConfig {
    pub fn start_register(&self) -> u32 {
        self.start_register.unwrap_or(0)
    }

    pub fn finish_register(&self) -> u32 {
        self.finish_register.unwrap_or(1)
    }

    pub fn send_attempts(&self) -> u32 {
        self.send_attempts.unwrap_or(crate::script::DEFAULT_SEND_ATTEMPTS)
    }

    pub fn settings(&self) -> SupervisorSettings {
        let defaults = SupervisorSettings::default();
        SupervisorSettings {
            poll_interval: millis(self.poll_interval_ms, defaults.poll_interval),
            chars_per_poll: self.chars_per_poll.unwrap_or(defaults.chars_per_poll),
            max_not_running_polls: self.max_not_running_polls.unwrap_or(defaults.max_not_running_polls),
            abort_timeout: seconds(self.abort_timeout_seconds, defaults.abort_timeout),
            start_register: self.start_register(),
            finish_register: self.finish_register(),
        }
    }
}

impl DashboardConfig {
    pub fn reply_timeout(&self) -> Duration {
        millis(self.reply_timeout_ms, crate::dashboard::DEFAULT_REPLY_TIMEOUT)
    }
}
