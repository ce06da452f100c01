pub mod config;
pub mod error;
pub mod schedule;
pub mod thermostat;
pub mod topics;
pub mod types;

pub use config::{
    check_mode_references, parse_modes, parse_schedule, ActuatorSetting, ConfigSection,
    DeviceConfig, ModeDefinition, Modes, MqttConfig, TerrariumConfig, ThermostatSpec,
};
pub use error::ConfigError;
pub use schedule::{resolve_mode, Period, Schedule, TimeOfDay};
pub use thermostat::{Thermostat, ThermostatAction};
pub use topics::*;
pub use types::{ConfigStatus, ConfigUpdate, DeviceSummary, FullConfig, Reading};
