use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::gate::DEFAULT_REQUIRED_FRAMES;
use crate::link::system::SystemPortOpener;
use crate::link::{DEFAULT_BAUD_RATE, DEFAULT_REOPEN_BACKOFF, DEFAULT_TIMEOUT};
use crate::relay::{ReceiveSettings, DEFAULT_SETTLE_DELAY};
use crate::throttle::ThrottleConfig;

pub const DEFAULT_INBOUND_PORT: &str = "/dev/ttyUSB0";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RelayConfigInput {
    pub inbound: InboundConfigInput,
    pub outbound: Option<OutboundConfigInput>,
    pub stabilization: StabilizationConfigInput,
    pub throttle: ThrottleConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InboundConfigInput {
    pub port: Option<String>,
    pub baud_rate: Option<u32>,
    pub read_timeout_ms: Option<u64>,
    pub reopen_backoff_ms: Option<u64>,
    pub settle_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OutboundConfigInput {
    pub port: String,
    pub baud_rate: Option<u32>,
    pub write_timeout_ms: Option<u64>,
    pub reopen_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StabilizationConfigInput {
    pub required_frames: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ThrottleConfigInput {
    pub min_interval_ms: Option<u64>,
    pub consume_timeout_ms: Option<u64>,
    pub fault_wait_ms: Option<u64>,
    pub channel_id: Option<u8>,
}

/// One serial port. `timeout` is the read timeout for the inbound link and
/// the write timeout for the outbound one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkConfig {
    pub port: String,
    pub baud_rate: u32,
    pub timeout: Duration,
    pub reopen_backoff: Duration,
}

impl LinkConfig {
    pub fn new(port: impl Into<String>) -> Self {
        Self {
            port: port.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            timeout: DEFAULT_TIMEOUT,
            reopen_backoff: DEFAULT_REOPEN_BACKOFF,
        }
    }

    pub fn opener(&self) -> SystemPortOpener {
        SystemPortOpener::new(&self.port, self.baud_rate, self.timeout)
    }

    fn validate(&self, side: &'static str) -> Result<(), ConfigError> {
        if self.port.trim().is_empty() {
            return Err(invalid(side, "port must not be empty"));
        }
        if self.baud_rate == 0 {
            return Err(invalid(side, "baud_rate must be positive"));
        }
        if self.timeout.is_zero() {
            return Err(invalid(side, "timeout must be positive"));
        }
        if self.reopen_backoff.is_zero() {
            return Err(invalid(side, "reopen_backoff must be positive"));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    pub inbound: LinkConfig,
    pub settle_delay: Duration,
    /// `None` runs the relay receive-only.
    pub outbound: Option<LinkConfig>,
    pub required_frames: u32,
    pub throttle: ThrottleConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            inbound: LinkConfig::new(DEFAULT_INBOUND_PORT),
            settle_delay: DEFAULT_SETTLE_DELAY,
            outbound: None,
            required_frames: DEFAULT_REQUIRED_FRAMES,
            throttle: ThrottleConfig::default(),
        }
    }
}

fn invalid(field: &'static str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.into(),
    }
}

fn ms_or(value: Option<u64>, default: Duration) -> Duration {
    value.map(Duration::from_millis).unwrap_or(default)
}

impl RelayConfigInput {
    pub fn resolve(self) -> Result<RelayConfig, ConfigError> {
        let defaults = RelayConfig::default();

        let inbound = LinkConfig {
            port: self
                .inbound
                .port
                .map(|p| p.trim().to_string())
                .unwrap_or(defaults.inbound.port),
            baud_rate: self.inbound.baud_rate.unwrap_or(DEFAULT_BAUD_RATE),
            timeout: ms_or(self.inbound.read_timeout_ms, DEFAULT_TIMEOUT),
            reopen_backoff: ms_or(self.inbound.reopen_backoff_ms, DEFAULT_REOPEN_BACKOFF),
        };

        let outbound = self.outbound.map(|out| LinkConfig {
            port: out.port.trim().to_string(),
            baud_rate: out.baud_rate.unwrap_or(DEFAULT_BAUD_RATE),
            timeout: ms_or(out.write_timeout_ms, DEFAULT_TIMEOUT),
            reopen_backoff: ms_or(out.reopen_backoff_ms, DEFAULT_REOPEN_BACKOFF),
        });

        let throttle = ThrottleConfig {
            min_interval: ms_or(self.throttle.min_interval_ms, defaults.throttle.min_interval),
            consume_timeout: ms_or(
                self.throttle.consume_timeout_ms,
                defaults.throttle.consume_timeout,
            ),
            fault_wait: ms_or(self.throttle.fault_wait_ms, defaults.throttle.fault_wait),
            channel_id: self.throttle.channel_id.unwrap_or(defaults.throttle.channel_id),
        };

        let config = RelayConfig {
            inbound,
            settle_delay: ms_or(self.inbound.settle_delay_ms, defaults.settle_delay),
            outbound,
            required_frames: self
                .stabilization
                .required_frames
                .unwrap_or(DEFAULT_REQUIRED_FRAMES),
            throttle,
        };
        config.validate()?;
        Ok(config)
    }
}

impl RelayConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(RelayConfig::default());
        }
        let parsed: RelayConfigInput = toml::from_str(input)?;
        parsed.resolve()
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&text)
    }

    /// Checks value ranges. Call again after applying command-line overrides.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.inbound.validate("inbound")?;
        if let Some(outbound) = &self.outbound {
            outbound.validate("outbound")?;
        }
        if self.required_frames == 0 {
            return Err(invalid("stabilization.required_frames", "must be at least 1"));
        }
        if self.throttle.consume_timeout.is_zero() {
            return Err(invalid("throttle.consume_timeout_ms", "must be positive"));
        }
        if self.throttle.fault_wait.is_zero() {
            return Err(invalid("throttle.fault_wait_ms", "must be positive"));
        }
        Ok(())
    }

    pub fn receive_settings(&self) -> ReceiveSettings {
        ReceiveSettings {
            read_timeout: self.inbound.timeout,
            required_frames: self.required_frames,
            settle_delay: self.settle_delay,
        }
    }
}
