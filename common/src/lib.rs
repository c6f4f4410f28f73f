pub mod command;
pub mod config;
pub mod thermostat;
pub mod types;

pub use command::{describe_changes, CommandChange, CommandPayload};
pub use config::{ConfigError, InitialConditions, PhysicsConfig, RejectedOverride, SimulatorConfig};
pub use thermostat::{drive_duty, next_hvac_state, HvacTransition, ThermostatEngine};
pub use types::{HvacState, Mode, ThermostatState, UnknownMode};
