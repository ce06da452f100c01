use thiserror::Error;

/// Reasons a configuration update is rejected. The display text is what the
/// operator sees on `config/status`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("Update must include 'section' and 'data'")]
    MissingSectionOrData,

    #[error("Unknown config section: {0}")]
    UnknownSection(String),

    #[error("At least one mode is required")]
    NoModes,

    #[error("Modes must be an object of mode name to actuator states")]
    ModesNotObject,

    #[error("Invalid mode name: '{0}'")]
    InvalidModeName(String),

    #[error("Mode '{0}' must have actuator states")]
    ModeNotObject(String),

    #[error("Actuator '{actuator}' in mode '{mode}' must be true/false or a thermostat")]
    InvalidActuatorValue { mode: String, actuator: String },

    #[error("Thermostat '{actuator}' in mode '{mode}' is missing '{field}'")]
    MissingThermostatField {
        mode: String,
        actuator: String,
        field: &'static str,
    },

    #[error("Thermostat '{actuator}' in mode '{mode}': '{field}' must be {expected}")]
    InvalidThermostatField {
        mode: String,
        actuator: String,
        field: &'static str,
        expected: &'static str,
    },

    #[error("Thermostat '{actuator}' in mode '{mode}' has unknown field '{field}'")]
    UnknownThermostatField {
        mode: String,
        actuator: String,
        field: String,
    },

    #[error("Schedule must be an object")]
    ScheduleNotObject,

    #[error("Schedule must have '{0}' field")]
    MissingScheduleField(&'static str),

    #[error("Schedule '{field}' must be {expected}")]
    InvalidScheduleField {
        field: &'static str,
        expected: &'static str,
    },

    #[error("Period '{0}' must have start, end, and mode")]
    IncompletePeriod(String),

    #[error("Period '{period}': '{field}' must be {expected}")]
    InvalidPeriodField {
        period: String,
        field: &'static str,
        expected: &'static str,
    },

    #[error("Invalid time format in period '{period}': {value}")]
    InvalidTime { period: String, value: String },

    #[error("Schedule references unknown mode '{0}'")]
    UnknownMode(String),
}
