use std::fmt;

use serde_json::Value;

use crate::types::Mode;

/// Partial update posted to `/command`. `None` means "leave as is".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandPayload {
    pub setpoint: Option<f64>,
    pub humidity_setpoint: Option<f64>,
    pub mode: Option<Mode>,
    pub outside_temp: Option<f64>,
    pub outside_humidity: Option<f64>,
}

impl CommandPayload {
    /// Never fails: a body that is not a JSON object is an empty command, and
    /// fields with the wrong type or an unknown mode label are dropped one by one.
    pub fn from_slice(body: &[u8]) -> Self {
        let Ok(Value::Object(fields)) = serde_json::from_slice::<Value>(body) else {
            return Self::default();
        };

        let number = |key: &str| fields.get(key).and_then(Value::as_f64);

        Self {
            setpoint: number("setpoint"),
            humidity_setpoint: number("humiditySetpoint"),
            mode: fields
                .get("mode")
                .and_then(Value::as_str)
                .and_then(|label| label.parse::<Mode>().ok()),
            outside_temp: number("outsideTemp"),
            outside_humidity: number("outsideHumidity"),
        }
    }

    pub fn is_empty(&self) -> bool {
        self == &Self::default()
    }
}

/// One field that a command actually changed, with the stored value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CommandChange {
    Setpoint(f64),
    HumiditySetpoint(f64),
    Mode(Mode),
    OutsideTemp(f64),
    OutsideHumidity(f64),
}

impl fmt::Display for CommandChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Setpoint(value) => write!(f, "setpoint={value:.1}"),
            Self::HumiditySetpoint(value) => write!(f, "humidity={value}"),
            Self::Mode(mode) => write!(f, "mode={}", mode.as_str()),
            Self::OutsideTemp(value) => write!(f, "outside={value:.1}"),
            Self::OutsideHumidity(value) => write!(f, "outsideHumidity={value}"),
        }
    }
}

/// Renders the `COMMAND (...)` log line, or `None` for a no-op.
pub fn describe_changes(changes: &[CommandChange]) -> Option<String> {
    if changes.is_empty() {
        return None;
    }
    let joined = changes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    Some(format!("COMMAND ({joined})"))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn reads_all_known_fields() {
        let payload = CommandPayload::from_slice(
            br#"{"setpoint": 23.5, "humiditySetpoint": 50, "mode": "Hlajenje",
                 "outsideTemp": -3.26, "outsideHumidity": 80}"#,
        );

        assert_eq!(
            payload,
            CommandPayload {
                setpoint: Some(23.5),
                humidity_setpoint: Some(50.0),
                mode: Some(Mode::Cooling),
                outside_temp: Some(-3.26),
                outside_humidity: Some(80.0),
            }
        );
    }

    #[test]
    fn malformed_bodies_are_empty_commands() {
        let bodies: [&[u8]; 5] = [b"", b"not json", b"[1, 2]", b"null", b"{\"setpoint\": "];
        for body in bodies {
            assert!(CommandPayload::from_slice(body).is_empty());
        }
    }

    #[test]
    fn wrongly_typed_fields_are_dropped_individually() {
        let payload = CommandPayload::from_slice(
            br#"{"setpoint": "22", "mode": "NotAMode", "outsideTemp": 12.0, "extra": true}"#,
        );

        assert_eq!(
            payload,
            CommandPayload {
                outside_temp: Some(12.0),
                ..CommandPayload::default()
            }
        );
    }

    #[test]
    fn change_line_formats_each_field() {
        let line = describe_changes(&[
            CommandChange::Setpoint(22.0),
            CommandChange::HumiditySetpoint(45.0),
            CommandChange::Mode(Mode::Dehumidify),
            CommandChange::OutsideTemp(-2.5),
            CommandChange::OutsideHumidity(72.5),
        ]);

        assert_eq!(
            line.as_deref(),
            Some(
                "COMMAND (setpoint=22.0, humidity=45, mode=Razvlazevanje, outside=-2.5, outsideHumidity=72.5)"
            )
        );
        assert_eq!(describe_changes(&[]), None);
    }
}
