//! Monitor configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/machine-bridge/monitor.toml`.
//!
//! # Required fields
//! - `machine.name`
//!
//! Everything else carries a default: the machine endpoint
//! (`localhost:23200`), the client name, the publish/conncheck/restart
//! periods (1 s / 10 s / 5 s), and the bus target
//! (`localhost:6379`, db 0, channel `machine_events`).

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct MonitorConfig {
    pub machine: MachineConfig,
    /// Sender identifier placed in the `sender` field of every handshake.
    pub client_name: String,
    pub timing: TimingConfig,
    pub bus: BusConfig,
}

#[derive(Debug, Clone)]
pub struct MachineConfig {
    pub host: String,
    pub conn_port: u16,
    /// Logical machine name requested during authentication.
    pub name: String,
}

#[derive(Debug, Clone)]
pub struct TimingConfig {
    pub publish_period_secs: f64,
    pub conncheck_period_secs: f64,
    pub restart_time_secs: f64,
}

#[derive(Debug, Clone)]
pub struct BusConfig {
    pub host: String,
    pub port: u16,
    pub db: u32,
    pub channel: String,
}

impl TimingConfig {
    pub fn publish_period(&self) -> Duration {
        Duration::from_secs_f64(self.publish_period_secs)
    }

    pub fn conncheck_period(&self) -> Duration {
        Duration::from_secs_f64(self.conncheck_period_secs)
    }

    pub fn restart_time(&self) -> Duration {
        Duration::from_secs_f64(self.restart_time_secs)
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    machine: Option<RawMachineConfig>,
    client_name: Option<String>,
    timing: Option<RawTimingConfig>,
    bus: Option<RawBusConfig>,
}

#[derive(Debug, Deserialize)]
struct RawMachineConfig {
    host: Option<String>,
    conn_port: Option<u16>,
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawTimingConfig {
    publish_period_secs: Option<f64>,
    conncheck_period_secs: Option<f64>,
    restart_time_secs: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawBusConfig {
    host: Option<String>,
    port: Option<u16>,
    db: Option<u32>,
    channel: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load monitor config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<MonitorConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load monitor config from the default path `/etc/machine-bridge/monitor.toml`.
pub fn load_config() -> Result<MonitorConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/machine-bridge/monitor.toml"))
}

/// Load monitor config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<MonitorConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let raw_machine = raw
        .machine
        .ok_or_else(|| ConfigError::MissingField("machine".to_owned()))?;
    let name = raw_machine
        .name
        .ok_or_else(|| ConfigError::MissingField("machine.name".to_owned()))?;
    let machine = MachineConfig {
        host: raw_machine.host.unwrap_or_else(|| "localhost".to_owned()),
        conn_port: raw_machine.conn_port.unwrap_or(23200),
        name,
    };

    let timing = match raw.timing {
        Some(t) => TimingConfig {
            publish_period_secs: t.publish_period_secs.unwrap_or(1.0),
            conncheck_period_secs: t.conncheck_period_secs.unwrap_or(10.0),
            restart_time_secs: t.restart_time_secs.unwrap_or(5.0),
        },
        None => TimingConfig {
            publish_period_secs: 1.0,
            conncheck_period_secs: 10.0,
            restart_time_secs: 5.0,
        },
    };
    for (field, value) in [
        ("timing.publish_period_secs", timing.publish_period_secs),
        ("timing.conncheck_period_secs", timing.conncheck_period_secs),
        ("timing.restart_time_secs", timing.restart_time_secs),
    ] {
        if !value.is_finite() || value <= 0.0 {
            return Err(ConfigError::InvalidValue(format!(
                "{field} must be a positive number, got {value}"
            )));
        }
    }

    let bus = match raw.bus {
        Some(b) => BusConfig {
            host: b.host.unwrap_or_else(|| "localhost".to_owned()),
            port: b.port.unwrap_or(6379),
            db: b.db.unwrap_or(0),
            channel: b.channel.unwrap_or_else(|| "machine_events".to_owned()),
        },
        None => BusConfig {
            host: "localhost".to_owned(),
            port: 6379,
            db: 0,
            channel: "machine_events".to_owned(),
        },
    };

    Ok(MonitorConfig {
        machine,
        client_name: raw.client_name.unwrap_or_else(|| "machine-monitor".to_owned()),
        timing,
        bus,
    })
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug)]
pub enum ConfigError {
    Io(String),
    Parse(String),
    MissingField(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(s) => write!(f, "IO error: {}", s),
            ConfigError::Parse(s) => write!(f, "Parse error: {}", s),
            ConfigError::MissingField(s) => write!(f, "Missing required field: {}", s),
            ConfigError::InvalidValue(s) => write!(f, "Invalid config value: {}", s),
        }
    }
}

impl std::error::Error for ConfigError {}
