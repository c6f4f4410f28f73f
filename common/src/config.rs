use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::Mode;

pub const SETPOINT_RANGE: (f64, f64) = (10.0, 30.0);
pub const HUMIDITY_SETPOINT_RANGE: (f64, f64) = (30.0, 60.0);
pub const OUTSIDE_HUMIDITY_RANGE: (f64, f64) = (20.0, 95.0);

pub const ENV_CONFIG_PATH: &str = "THERMO_CONFIG";
pub const ENV_HTTP_PORT: &str = "THERMO_PORT";
pub const ENV_TICK_MS: &str = "THERMO_TICK_MS";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid simulator config: {0}")]
    Invalid(#[from] serde_json::Error),
    #[error("physics.{field} = {value} is out of range: {expected}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        expected: &'static str,
    },
}

/// Room model constants. Rates are per tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PhysicsConfig {
    pub temp_hysteresis_c: f64,
    pub humidity_on_band: f64,
    pub humidity_off_band: f64,
    pub heat_rate: f64,
    pub cool_rate: f64,
    pub dry_rate: f64,
    pub leak_rate: f64,
    pub humidity_exchange_rate: f64,
    pub min_net_delta: f64,
    pub min_active_duty: f64,
    pub duty_span: f64,
    pub drying_heat_factor: f64,
    pub heating_drying_rate: f64,
    pub indoor_humidity_min: f64,
    pub indoor_humidity_max: f64,
}

impl Default for PhysicsConfig {
    fn default() -> Self {
        Self {
            temp_hysteresis_c: 0.4,
            humidity_on_band: 3.0,
            humidity_off_band: 2.0,
            heat_rate: 0.12,
            cool_rate: 0.12,
            dry_rate: 0.3,
            leak_rate: 0.01,
            humidity_exchange_rate: 0.01,
            min_net_delta: 0.02,
            min_active_duty: 0.3,
            duty_span: 2.0,
            drying_heat_factor: 0.2,
            heating_drying_rate: 0.05,
            indoor_humidity_min: 20.0,
            indoor_humidity_max: 70.0,
        }
    }
}

impl PhysicsConfig {
    /// Rejects values that would make the tick divide by zero or clamp with
    /// inverted bounds.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let out_of_range = |field, value, expected| ConfigError::OutOfRange {
            field,
            value,
            expected,
        };

        for (field, value) in [
            ("heat_rate", self.heat_rate),
            ("cool_rate", self.cool_rate),
            ("duty_span", self.duty_span),
        ] {
            if !(value > 0.0 && value.is_finite()) {
                return Err(out_of_range(field, value, "must be positive"));
            }
        }

        if !(self.min_active_duty > 0.0 && self.min_active_duty <= 1.0) {
            return Err(out_of_range(
                "min_active_duty",
                self.min_active_duty,
                "must be in (0, 1]",
            ));
        }

        if !(self.indoor_humidity_min <= self.indoor_humidity_max) {
            return Err(out_of_range(
                "indoor_humidity_min",
                self.indoor_humidity_min,
                "must not exceed indoor_humidity_max",
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InitialConditions {
    pub setpoint: f64,
    pub humidity_setpoint: f64,
    pub mode: Mode,
    pub current_temp: f64,
    pub current_humidity: f64,
    pub outside_temp: f64,
    pub outside_humidity: f64,
}

impl Default for InitialConditions {
    fn default() -> Self {
        Self {
            setpoint: 22.0,
            humidity_setpoint: 45.0,
            mode: Mode::Heating,
            current_temp: 20.2,
            current_humidity: 48.0,
            outside_temp: 5.0,
            outside_humidity: 70.0,
        }
    }
}

impl InitialConditions {
    pub fn sanitize(&mut self, physics: &PhysicsConfig) {
        self.setpoint = self.setpoint.clamp(SETPOINT_RANGE.0, SETPOINT_RANGE.1);
        self.humidity_setpoint = self
            .humidity_setpoint
            .clamp(HUMIDITY_SETPOINT_RANGE.0, HUMIDITY_SETPOINT_RANGE.1);
        self.outside_humidity = self
            .outside_humidity
            .clamp(OUTSIDE_HUMIDITY_RANGE.0, OUTSIDE_HUMIDITY_RANGE.1);
        self.current_humidity = self
            .current_humidity
            .clamp(physics.indoor_humidity_min, physics.indoor_humidity_max);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulatorConfig {
    pub http_port: u16,
    pub tick_interval_ms: u64,
    pub max_body_bytes: usize,
    pub physics: PhysicsConfig,
    pub initial: InitialConditions,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            http_port: 8081,
            tick_interval_ms: 1_000,
            max_body_bytes: 1_000_000,
            physics: PhysicsConfig::default(),
            initial: InitialConditions::default(),
        }
    }
}

/// An env override that was present but could not be used.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedOverride {
    pub var: &'static str,
    pub value: String,
}

impl SimulatorConfig {
    pub fn from_json(raw: &[u8]) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_slice(raw)?;
        config.physics.validate()?;
        Ok(config)
    }

    /// Applies `THERMO_PORT` / `THERMO_TICK_MS`. Unusable values keep the
    /// current setting and are handed back so the caller can report them.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Vec<RejectedOverride>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut rejected = Vec::new();

        if let Some(value) = lookup(ENV_HTTP_PORT) {
            match value.trim().parse::<u16>() {
                Ok(port) if port > 0 => self.http_port = port,
                _ => rejected.push(RejectedOverride {
                    var: ENV_HTTP_PORT,
                    value,
                }),
            }
        }

        if let Some(value) = lookup(ENV_TICK_MS) {
            match value.trim().parse::<u64>() {
                Ok(ms) if ms > 0 => self.tick_interval_ms = ms,
                _ => rejected.push(RejectedOverride {
                    var: ENV_TICK_MS,
                    value,
                }),
            }
        }

        rejected
    }

    pub fn sanitize(&mut self) -> Result<(), ConfigError> {
        self.physics.validate()?;
        if self.tick_interval_ms == 0 {
            self.tick_interval_ms = 1_000;
        }
        self.initial.sanitize(&self.physics);
        Ok(())
    }
}
