use std::fmt;

use chrono::{DateTime, Utc};

use crate::{
    command::{CommandChange, CommandPayload},
    config::{
        InitialConditions, PhysicsConfig, HUMIDITY_SETPOINT_RANGE, OUTSIDE_HUMIDITY_RANGE,
        SETPOINT_RANGE,
    },
    types::{HvacState, Mode, ThermostatState},
};

/// Emitted by [`ThermostatEngine::tick`] when the HVAC state changes.
#[derive(Debug, Clone, PartialEq)]
pub struct HvacTransition {
    pub from: HvacState,
    pub to: HvacState,
    pub current_temp: f64,
    pub setpoint: f64,
    pub outside_temp: f64,
    pub duty: f64,
}

impl fmt::Display for HvacTransition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.to == HvacState::Idle {
            return write!(f, "IDLE (within hysteresis)");
        }
        write!(
            f,
            "{} (temp={:.1} -> target={:.1}, outside={:.1}, duty={:.1})",
            self.to.as_str(),
            self.current_temp,
            self.setpoint,
            self.outside_temp,
            self.duty
        )
    }
}

/// Hysteretic controller. `previous` is the state at the end of the last tick;
/// inside the dead band it is kept, outside the band the readings decide.
pub fn next_hvac_state(
    previous: HvacState,
    state: &ThermostatState,
    physics: &PhysicsConfig,
) -> HvacState {
    let band = physics.temp_hysteresis_c;
    let hold = |active: HvacState| {
        if previous == active {
            active
        } else {
            HvacState::Idle
        }
    };

    match state.mode {
        Mode::Off => HvacState::Idle,
        Mode::Heating => {
            if state.current_temp <= state.setpoint - band {
                HvacState::Heating
            } else if state.current_temp >= state.setpoint + band {
                HvacState::Idle
            } else {
                hold(HvacState::Heating)
            }
        }
        Mode::Cooling => {
            if state.current_temp >= state.setpoint + band {
                HvacState::Cooling
            } else if state.current_temp <= state.setpoint - band {
                HvacState::Idle
            } else {
                hold(HvacState::Cooling)
            }
        }
        Mode::Dehumidify => {
            if state.current_humidity >= state.humidity_setpoint + physics.humidity_on_band {
                HvacState::Drying
            } else if state.current_humidity <= state.humidity_setpoint - physics.humidity_off_band
            {
                HvacState::Idle
            } else {
                hold(HvacState::Drying)
            }
        }
    }
}

/// Actuator drive for this tick. Scales with the distance to target, never
/// below `min_active_duty`, and for heating/cooling never so low that the
/// passive `leak` could cancel it. May exceed 1 when the floor demands it.
pub fn drive_duty(
    hvac: HvacState,
    state: &ThermostatState,
    leak: f64,
    physics: &PhysicsConfig,
) -> f64 {
    let base = |diff: f64| (diff / physics.duty_span).clamp(physics.min_active_duty, 1.0);

    match hvac {
        HvacState::Idle => 0.0,
        HvacState::Heating => {
            let base = base((state.setpoint - state.current_temp).abs());
            let floor = (physics.min_net_delta - leak).max(0.0) / physics.heat_rate;
            base.max(floor)
        }
        HvacState::Cooling => {
            let base = base((state.setpoint - state.current_temp).abs());
            let floor = (leak + physics.min_net_delta).max(0.0) / physics.cool_rate;
            base.max(floor)
        }
        HvacState::Drying => base((state.current_humidity - state.humidity_setpoint).max(0.0)),
    }
}

#[derive(Debug, Clone)]
pub struct ThermostatEngine {
    pub physics: PhysicsConfig,
    state: ThermostatState,
}

impl ThermostatEngine {
    pub fn new(physics: PhysicsConfig, mut initial: InitialConditions, now: DateTime<Utc>) -> Self {
        initial.sanitize(&physics);
        Self {
            physics,
            state: ThermostatState {
                setpoint: initial.setpoint,
                humidity_setpoint: initial.humidity_setpoint,
                mode: initial.mode,
                hvac_state: HvacState::Idle,
                current_temp: initial.current_temp,
                current_humidity: initial.current_humidity,
                outside_temp: initial.outside_temp,
                outside_humidity: initial.outside_humidity,
                duty: 0.0,
                last_updated: now,
            },
        }
    }

    pub fn state(&self) -> &ThermostatState {
        &self.state
    }

    /// Advances the room model by one step.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Option<HvacTransition> {
        let physics = &self.physics;
        let previous = self.state.hvac_state;
        let hvac = next_hvac_state(previous, &self.state, physics);
        self.state.hvac_state = hvac;

        let leak = (self.state.outside_temp - self.state.current_temp) * physics.leak_rate;
        let drive = drive_duty(hvac, &self.state, leak, physics);
        self.state.duty = round_to(drive.clamp(0.0, 1.0), 1);

        let transition = (hvac != previous).then(|| HvacTransition {
            from: previous,
            to: hvac,
            current_temp: self.state.current_temp,
            setpoint: self.state.setpoint,
            outside_temp: self.state.outside_temp,
            duty: self.state.duty,
        });

        let hvac_delta = match hvac {
            HvacState::Heating => physics.heat_rate * drive,
            HvacState::Cooling => -physics.cool_rate * drive,
            HvacState::Drying => physics.heat_rate * physics.drying_heat_factor,
            HvacState::Idle => 0.0,
        };
        self.state.current_temp = round_to(self.state.current_temp + leak + hvac_delta, 2);

        let mut humidity_change = (self.state.outside_humidity - self.state.current_humidity)
            * physics.humidity_exchange_rate;
        match hvac {
            HvacState::Drying => humidity_change -= physics.dry_rate,
            HvacState::Heating => humidity_change -= physics.heating_drying_rate,
            HvacState::Cooling | HvacState::Idle => {}
        }
        self.state.current_humidity = (self.state.current_humidity + humidity_change)
            .clamp(physics.indoor_humidity_min, physics.indoor_humidity_max)
            .round();

        self.state.last_updated = now;
        transition
    }

    /// Merges a partial command. Returns only the fields whose stored value changed.
    pub fn apply_command(&mut self, command: &CommandPayload) -> Vec<CommandChange> {
        let mut changes = Vec::new();

        if let Some(setpoint) = command.setpoint {
            let clamped = setpoint.clamp(SETPOINT_RANGE.0, SETPOINT_RANGE.1);
            if replace(&mut self.state.setpoint, clamped) {
                changes.push(CommandChange::Setpoint(clamped));
            }
        }

        if let Some(humidity) = command.humidity_setpoint {
            let clamped = humidity.clamp(HUMIDITY_SETPOINT_RANGE.0, HUMIDITY_SETPOINT_RANGE.1);
            if replace(&mut self.state.humidity_setpoint, clamped) {
                changes.push(CommandChange::HumiditySetpoint(clamped));
            }
        }

        if let Some(mode) = command.mode {
            if self.state.mode != mode {
                self.state.mode = mode;
                changes.push(CommandChange::Mode(mode));
            }
        }

        if let Some(outside) = command.outside_temp {
            let rounded = round_to(outside, 1);
            if replace(&mut self.state.outside_temp, rounded) {
                changes.push(CommandChange::OutsideTemp(rounded));
            }
        }

        if let Some(humidity) = command.outside_humidity {
            let clamped = humidity.clamp(OUTSIDE_HUMIDITY_RANGE.0, OUTSIDE_HUMIDITY_RANGE.1);
            if replace(&mut self.state.outside_humidity, clamped) {
                changes.push(CommandChange::OutsideHumidity(clamped));
            }
        }

        changes
    }
}

fn replace(slot: &mut f64, value: f64) -> bool {
    if (*slot - value).abs() > f64::EPSILON {
        *slot = value;
        true
    } else {
        false
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let scale = 10f64.powi(decimals);
    (value * scale).round() / scale
}
