//! Rail configuration loading and validation.
//!
//! Configuration is loaded from a TOML file merged with environment
//! variables (prefixed with `RAIL_`):
//!
//! ```text
//! RAIL_ADDRESS="sim://rail"
//! RAIL_DEFAULT_SPEED=25.0
//! ```
//!
//! # Example
//!
//! ```toml
//! address = "192.168.7.2:9999"
//! default_speed = 50.0          # mm/s, 0 < v < 100
//! default_acceleration = 25.0   # mm/s^2, 0 < a < 100
//! span = 500.0                  # mm, valid travel range [0, span]
//! ```

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Speed and acceleration must stay strictly inside (0, 100) in controller
/// units (mm/s and mm/s²).
pub const MAX_RATE: f64 = 100.0;

/// Scale factor applied to relative move distances before they are sent to
/// the controller. The deployed system has always doubled the requested
/// distance; suspected unit mismatch in the controller firmware, kept
/// explicit and overridable here rather than as a hidden literal.
pub const DEFAULT_RELATIVE_MOVE_SCALE: f64 = 2.0;

/// Configuration error types.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("configuration load error: {0}")]
    Load(#[from] figment::Error),
    #[error("configuration validation error: {0}")]
    Validation(String),
}

/// Static rail parameters, immutable after construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RailConfig {
    /// Controller address. `sim://...` selects the in-process simulator,
    /// anything else is treated as a TCP host:port.
    pub address: String,

    /// Default travel speed in mm/s, applied on connect.
    pub default_speed: f64,

    /// Default acceleration in mm/s², applied on connect.
    pub default_acceleration: f64,

    /// Valid travel range upper bound in mm. Required and explicit; the
    /// driver never halves or otherwise reinterprets it.
    pub span: f64,

    /// Conservative speed used during homing, restored afterwards.
    #[serde(default = "default_homing_speed")]
    pub homing_speed: f64,

    /// Conservative acceleration used during homing, restored afterwards.
    #[serde(default = "default_homing_acceleration")]
    pub homing_acceleration: f64,

    /// Maximum accepted distance between the re-read position and the
    /// requested target for a move to count as successful.
    #[serde(default = "default_position_tolerance")]
    pub position_tolerance: f64,

    /// Scale applied to relative move distances. See
    /// [`DEFAULT_RELATIVE_MOVE_SCALE`].
    #[serde(default = "default_relative_move_scale")]
    pub relative_move_scale: f64,

    /// Upper bound on a single motion completion wait, in milliseconds.
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,

    /// Interval between completion polls, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

fn default_homing_speed() -> f64 {
    10.0
}

fn default_homing_acceleration() -> f64 {
    5.0
}

fn default_position_tolerance() -> f64 {
    1.0
}

fn default_relative_move_scale() -> f64 {
    DEFAULT_RELATIVE_MOVE_SCALE
}

fn default_completion_timeout_ms() -> u64 {
    60_000
}

fn default_poll_interval_ms() -> u64 {
    50
}

impl RailConfig {
    /// Build a configuration with defaults for everything beyond the four
    /// required parameters. Validates before returning.
    pub fn new(
        address: impl Into<String>,
        default_speed: f64,
        default_acceleration: f64,
        span: f64,
    ) -> Result<Self, ConfigError> {
        let config = Self {
            address: address.into(),
            default_speed,
            default_acceleration,
            span,
            homing_speed: default_homing_speed(),
            homing_acceleration: default_homing_acceleration(),
            position_tolerance: default_position_tolerance(),
            relative_move_scale: default_relative_move_scale(),
            completion_timeout_ms: default_completion_timeout_ms(),
            poll_interval_ms: default_poll_interval_ms(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file merged with `RAIL_`-prefixed
    /// environment variables, then validate.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("RAIL_"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Check semantic validity of all parameters.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() {
            return Err(ConfigError::Validation("address must not be empty".into()));
        }
        check_rate("default_speed", self.default_speed)?;
        check_rate("default_acceleration", self.default_acceleration)?;
        check_rate("homing_speed", self.homing_speed)?;
        check_rate("homing_acceleration", self.homing_acceleration)?;
        if self.span <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "span must be positive, got {}",
                self.span
            )));
        }
        if self.position_tolerance < 0.0 {
            return Err(ConfigError::Validation(format!(
                "position_tolerance must not be negative, got {}",
                self.position_tolerance
            )));
        }
        if self.relative_move_scale <= 0.0 {
            return Err(ConfigError::Validation(format!(
                "relative_move_scale must be positive, got {}",
                self.relative_move_scale
            )));
        }
        if self.completion_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "completion_timeout_ms must be positive".into(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "poll_interval_ms must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Whether the address selects the in-process simulator.
    pub fn is_simulated(&self) -> bool {
        self.address.starts_with("sim://")
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Speed/acceleration bound check shared by config validation and runtime
/// overrides.
pub(crate) fn check_rate(name: &str, value: f64) -> Result<(), ConfigError> {
    if !(value > 0.0 && value < MAX_RATE) {
        return Err(ConfigError::Validation(format!(
            "{} must lie strictly between 0 and {}, got {}",
            name, MAX_RATE, value
        )));
    }
    Ok(())
}
