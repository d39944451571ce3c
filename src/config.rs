//! Emulator and client configuration.
//!
//! Network-facing settings (`server_ip`, `json_port`, `tcp_port`,
//! `num_channels`, `msg_buffer_size_bytes`) have no defaults: a config that
//! leaves any of them out is rejected. Timing settings fall back to the
//! defaults below.

use crate::error::ConfigError;
use crate::fault_injection::FaultInjectionConfig;
use crate::telemetry::FRAME_LEN;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_TICK_PERIOD_MS: u64 = 100;
pub const DEFAULT_TELEMETRY_PERIOD_MS: u64 = 100;
pub const DEFAULT_WRITE_TIMEOUT_MS: u64 = 5000;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpooferConfig {
    pub server_ip: IpAddr,
    pub json_port: u16,
    pub tcp_port: u16,
    pub num_channels: u16,
    pub msg_buffer_size_bytes: usize,
    #[serde(default = "default_tick_period_ms")]
    pub tick_period_ms: u64,
    #[serde(default = "default_telemetry_period_ms")]
    pub telemetry_period_ms: u64,
    #[serde(default = "default_write_timeout_ms")]
    pub write_timeout_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fault_injection: Option<FaultInjectionConfig>,
}

fn default_tick_period_ms() -> u64 {
    DEFAULT_TICK_PERIOD_MS
}

fn default_telemetry_period_ms() -> u64 {
    DEFAULT_TELEMETRY_PERIOD_MS
}

fn default_write_timeout_ms() -> u64 {
    DEFAULT_WRITE_TIMEOUT_MS
}

fn default_request_timeout_ms() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_MS
}

impl SpooferConfig {
    pub fn new(
        server_ip: IpAddr,
        json_port: u16,
        tcp_port: u16,
        num_channels: u16,
        msg_buffer_size_bytes: usize,
    ) -> Self {
        Self {
            server_ip,
            json_port,
            tcp_port,
            num_channels,
            msg_buffer_size_bytes,
            tick_period_ms: DEFAULT_TICK_PERIOD_MS,
            telemetry_period_ms: DEFAULT_TELEMETRY_PERIOD_MS,
            write_timeout_ms: DEFAULT_WRITE_TIMEOUT_MS,
            fault_injection: None,
        }
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        SpooferConfigBuilder::from_file(path)?.build()
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.num_channels == 0 {
            return Err(invalid("num_channels", "must be at least 1"));
        }
        if self.json_port != 0 && self.json_port == self.tcp_port {
            return Err(invalid("tcp_port", "must differ from json_port"));
        }
        if self.msg_buffer_size_bytes < FRAME_LEN {
            return Err(invalid(
                "msg_buffer_size_bytes",
                format!("must hold at least one {FRAME_LEN} byte telemetry frame"),
            ));
        }
        if self.tick_period_ms == 0 {
            return Err(invalid("tick_period_ms", "must be at least 1"));
        }
        if self.telemetry_period_ms == 0 {
            return Err(invalid("telemetry_period_ms", "must be at least 1"));
        }
        if self.write_timeout_ms == 0 {
            return Err(invalid("write_timeout_ms", "must be at least 1"));
        }
        if let Some(fault_injection) = &self.fault_injection {
            fault_injection.validate()?;
        }
        Ok(())
    }

    pub fn json_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_ip, self.json_port)
    }

    pub fn telemetry_addr(&self) -> SocketAddr {
        SocketAddr::new(self.server_ip, self.tcp_port)
    }

    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    pub fn telemetry_period(&self) -> Duration {
        Duration::from_millis(self.telemetry_period_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

/// Partially specified configuration, assembled from a file and command line
/// overrides before [`build`](Self::build) checks that nothing required is
/// missing.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SpooferConfigBuilder {
    pub server_ip: Option<IpAddr>,
    pub json_port: Option<u16>,
    pub tcp_port: Option<u16>,
    pub num_channels: Option<u16>,
    pub msg_buffer_size_bytes: Option<usize>,
    pub tick_period_ms: Option<u64>,
    pub telemetry_period_ms: Option<u64>,
    pub write_timeout_ms: Option<u64>,
    pub fault_injection: Option<FaultInjectionConfig>,
}

impl SpooferConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Fields set in `overrides` win.
    #[must_use]
    pub fn overlay(self, overrides: SpooferConfigBuilder) -> Self {
        Self {
            server_ip: overrides.server_ip.or(self.server_ip),
            json_port: overrides.json_port.or(self.json_port),
            tcp_port: overrides.tcp_port.or(self.tcp_port),
            num_channels: overrides.num_channels.or(self.num_channels),
            msg_buffer_size_bytes: overrides.msg_buffer_size_bytes.or(self.msg_buffer_size_bytes),
            tick_period_ms: overrides.tick_period_ms.or(self.tick_period_ms),
            telemetry_period_ms: overrides.telemetry_period_ms.or(self.telemetry_period_ms),
            write_timeout_ms: overrides.write_timeout_ms.or(self.write_timeout_ms),
            fault_injection: overrides.fault_injection.or(self.fault_injection),
        }
    }

    pub fn build(self) -> Result<SpooferConfig, ConfigError> {
        let config = SpooferConfig {
            server_ip: self.server_ip.ok_or(ConfigError::Missing("server_ip"))?,
            json_port: self.json_port.ok_or(ConfigError::Missing("json_port"))?,
            tcp_port: self.tcp_port.ok_or(ConfigError::Missing("tcp_port"))?,
            num_channels: self.num_channels.ok_or(ConfigError::Missing("num_channels"))?,
            msg_buffer_size_bytes: self
                .msg_buffer_size_bytes
                .ok_or(ConfigError::Missing("msg_buffer_size_bytes"))?,
            tick_period_ms: self.tick_period_ms.unwrap_or(DEFAULT_TICK_PERIOD_MS),
            telemetry_period_ms: self.telemetry_period_ms.unwrap_or(DEFAULT_TELEMETRY_PERIOD_MS),
            write_timeout_ms: self.write_timeout_ms.unwrap_or(DEFAULT_WRITE_TIMEOUT_MS),
            fault_injection: self.fault_injection,
        };
        config.validate()?;
        Ok(config)
    }
}

/// Where a [`crate::client::CyclerInterface`] finds the instrument.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CyclerInterfaceConfig {
    pub server_ip: String,
    pub json_msg_port: u16,
    pub bin_msg_port: u16,
    pub msg_buffer_size_bytes: usize,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl CyclerInterfaceConfig {
    pub fn new(
        server_ip: impl Into<String>,
        json_msg_port: u16,
        bin_msg_port: u16,
        msg_buffer_size_bytes: usize,
    ) -> Self {
        Self {
            server_ip: server_ip.into(),
            json_msg_port,
            bin_msg_port,
            msg_buffer_size_bytes,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
