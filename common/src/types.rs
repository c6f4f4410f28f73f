use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Operating mode selected by the user. Wire labels are the dashboard's.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    #[serde(rename = "Ogrevanje")]
    Heating,
    #[serde(rename = "Hlajenje")]
    Cooling,
    #[serde(rename = "Izklop")]
    Off,
    #[serde(rename = "Razvlazevanje")]
    Dehumidify,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heating => "Ogrevanje",
            Self::Cooling => "Hlajenje",
            Self::Off => "Izklop",
            Self::Dehumidify => "Razvlazevanje",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown mode label: {0:?}")]
pub struct UnknownMode(pub String);

impl FromStr for Mode {
    type Err = UnknownMode;

    fn from_str(label: &str) -> Result<Self, Self::Err> {
        match label {
            "Ogrevanje" => Ok(Self::Heating),
            "Hlajenje" => Ok(Self::Cooling),
            "Izklop" => Ok(Self::Off),
            "Razvlazevanje" => Ok(Self::Dehumidify),
            other => Err(UnknownMode(other.to_string())),
        }
    }
}

/// Derived actuation state. Only the tick changes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HvacState {
    Heating,
    Cooling,
    Drying,
    Idle,
}

impl HvacState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Heating => "HEATING",
            Self::Cooling => "COOLING",
            Self::Drying => "DRYING",
            Self::Idle => "IDLE",
        }
    }

    pub fn is_active(self) -> bool {
        self != Self::Idle
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThermostatState {
    pub setpoint: f64,
    #[serde(rename = "humiditySetpoint")]
    pub humidity_setpoint: f64,
    pub mode: Mode,
    #[serde(rename = "hvacState")]
    pub hvac_state: HvacState,
    #[serde(rename = "currentTemp")]
    pub current_temp: f64,
    #[serde(rename = "currentHumidity")]
    pub current_humidity: f64,
    #[serde(rename = "outsideTemp")]
    pub outside_temp: f64,
    #[serde(rename = "outsideHumidity")]
    pub outside_humidity: f64,
    pub duty: f64,
    #[serde(rename = "lastUpdated", with = "iso_millis")]
    pub last_updated: DateTime<Utc>,
}

// Dashboards parse `lastUpdated` with JS `Date`, which expects millisecond precision.
mod iso_millis {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Millis, true))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|parsed| parsed.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}
