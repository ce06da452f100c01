use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    error::ConfigError,
    schedule::{Period, Schedule, TimeOfDay},
    thermostat::ThermostatAction,
};

pub const MIN_TARGET_TEMPERATURE: f64 = -50.0;
pub const MAX_TARGET_TEMPERATURE: f64 = 100.0;
pub const MIN_HYSTERESIS: f64 = 0.0;
pub const MAX_HYSTERESIS: f64 = 10.0;

/// Actuator name to target setting for one mode, in declaration order.
pub type ModeDefinition = IndexMap<String, ActuatorSetting>;

/// Mode name to definition, in declaration order.
pub type Modes = IndexMap<String, ModeDefinition>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingKind {
    Thermostat,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ThermostatSpec {
    #[serde(rename = "type")]
    pub kind: SettingKind,
    pub enabled: bool,
    pub target_temperature: f64,
    pub hysteresis: f64,
    pub sensor: String,
    pub action: ThermostatAction,
}

/// What an actuator should do in a mode: a fixed on/off state, or follow a
/// thermostat fed by a named sensor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ActuatorSetting {
    Switch(bool),
    Thermostat(ThermostatSpec),
}

/// Driver declaration for a sensor or actuator. Only `type` is interpreted
/// by the engine; the rest is handed to the driver constructor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MqttConfig {
    pub host: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: default_mqtt_port(),
            user: String::new(),
            password: String::new(),
            client_id: default_client_id(),
        }
    }
}

/// The whole configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TerrariumConfig {
    #[serde(default)]
    pub mqtt: MqttConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timezone: Option<String>,
    #[serde(default = "default_telemetry_interval")]
    pub telemetry_interval: u64,
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    #[serde(default)]
    pub sensors: BTreeMap<String, DeviceConfig>,
    #[serde(default)]
    pub actuators: BTreeMap<String, DeviceConfig>,
    pub modes: Modes,
    pub schedule: Schedule,
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_client_id() -> String {
    "terrarium-controller".to_string()
}

fn default_telemetry_interval() -> u64 {
    60
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSection {
    Modes,
    Schedule,
}

impl ConfigSection {
    pub fn parse(value: &str) -> Result<Self, ConfigError> {
        match value {
            "modes" => Ok(Self::Modes),
            "schedule" => Ok(Self::Schedule),
            other => Err(ConfigError::UnknownSection(other.to_string())),
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Modes => "modes",
            Self::Schedule => "schedule",
        }
    }
}

/// Validates a `modes` update payload. First failure wins.
pub fn parse_modes(value: &Value) -> Result<Modes, ConfigError> {
    let Value::Object(modes) = value else {
        return Err(ConfigError::ModesNotObject);
    };
    if modes.is_empty() {
        return Err(ConfigError::NoModes);
    }

    let mut parsed = Modes::new();
    for (mode_name, actuators) in modes {
        if mode_name.trim().is_empty() {
            return Err(ConfigError::InvalidModeName(mode_name.clone()));
        }
        let Value::Object(actuators) = actuators else {
            return Err(ConfigError::ModeNotObject(mode_name.clone()));
        };

        let mut definition = ModeDefinition::new();
        for (actuator, setting) in actuators {
            let setting = parse_actuator_setting(mode_name, actuator, setting)?;
            definition.insert(actuator.clone(), setting);
        }
        parsed.insert(mode_name.clone(), definition);
    }

    Ok(parsed)
}

fn parse_actuator_setting(
    mode: &str,
    actuator: &str,
    value: &Value,
) -> Result<ActuatorSetting, ConfigError> {
    match value {
        Value::Bool(state) => Ok(ActuatorSetting::Switch(*state)),
        Value::Object(fields) if fields.get("type") == Some(&Value::from("thermostat")) => {
            parse_thermostat(mode, actuator, fields).map(ActuatorSetting::Thermostat)
        }
        _ => Err(ConfigError::InvalidActuatorValue {
            mode: mode.to_string(),
            actuator: actuator.to_string(),
        }),
    }
}

const THERMOSTAT_FIELDS: [&str; 6] = [
    "type",
    "enabled",
    "target_temperature",
    "hysteresis",
    "sensor",
    "action",
];

fn parse_thermostat(
    mode: &str,
    actuator: &str,
    fields: &Map<String, Value>,
) -> Result<ThermostatSpec, ConfigError> {
    let field = |name: &'static str| {
        fields
            .get(name)
            .ok_or_else(|| ConfigError::MissingThermostatField {
                mode: mode.to_string(),
                actuator: actuator.to_string(),
                field: name,
            })
    };
    let invalid = |name: &'static str, expected: &'static str| {
        ConfigError::InvalidThermostatField {
            mode: mode.to_string(),
            actuator: actuator.to_string(),
            field: name,
            expected,
        }
    };

    let enabled = field("enabled")?
        .as_bool()
        .ok_or_else(|| invalid("enabled", "true/false"))?;

    let target_temperature = field("target_temperature")?
        .as_f64()
        .filter(|value| (MIN_TARGET_TEMPERATURE..=MAX_TARGET_TEMPERATURE).contains(value))
        .ok_or_else(|| invalid("target_temperature", "a number between -50 and 100"))?;

    let hysteresis = field("hysteresis")?
        .as_f64()
        .filter(|value| (MIN_HYSTERESIS..=MAX_HYSTERESIS).contains(value))
        .ok_or_else(|| invalid("hysteresis", "a number between 0 and 10"))?;

    let sensor = field("sensor")?
        .as_str()
        .filter(|value| !value.trim().is_empty())
        .ok_or_else(|| invalid("sensor", "a non-empty sensor name"))?;

    let action = field("action")?
        .as_str()
        .and_then(ThermostatAction::parse)
        .ok_or_else(|| invalid("action", "'cooling' or 'heating'"))?;

    if let Some(unknown) = fields
        .keys()
        .find(|key| !THERMOSTAT_FIELDS.contains(&key.as_str()))
    {
        return Err(ConfigError::UnknownThermostatField {
            mode: mode.to_string(),
            actuator: actuator.to_string(),
            field: unknown.clone(),
        });
    }

    Ok(ThermostatSpec {
        kind: SettingKind::Thermostat,
        enabled,
        target_temperature,
        hysteresis,
        sensor: sensor.to_string(),
        action,
    })
}

/// Validates the shape of a `schedule` payload. Mode names are checked
/// separately by [`check_mode_references`].
pub fn parse_schedule(value: &Value) -> Result<Schedule, ConfigError> {
    let Value::Object(fields) = value else {
        return Err(ConfigError::ScheduleNotObject);
    };

    let active = fields
        .get("active")
        .ok_or(ConfigError::MissingScheduleField("active"))?
        .as_bool()
        .ok_or(ConfigError::InvalidScheduleField {
            field: "active",
            expected: "true/false",
        })?;

    let default_mode = fields
        .get("default_mode")
        .ok_or(ConfigError::MissingScheduleField("default_mode"))?
        .as_str()
        .ok_or(ConfigError::InvalidScheduleField {
            field: "default_mode",
            expected: "a mode name",
        })?;

    let periods = match fields.get("periods") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(periods)) => periods
            .iter()
            .enumerate()
            .map(|(index, period)| parse_period(index, period))
            .collect::<Result<Vec<_>, _>>()?,
        Some(_) => {
            return Err(ConfigError::InvalidScheduleField {
                field: "periods",
                expected: "a list of periods",
            })
        }
    };

    Ok(Schedule {
        active,
        default_mode: default_mode.to_string(),
        periods,
    })
}

/// Rejects a schedule whose default or period modes are not defined.
pub fn check_mode_references(schedule: &Schedule, modes: &Modes) -> Result<(), ConfigError> {
    match schedule
        .referenced_modes()
        .find(|mode| !modes.contains_key(*mode))
    {
        Some(mode) => Err(ConfigError::UnknownMode(mode.to_string())),
        None => Ok(()),
    }
}

fn parse_period(index: usize, value: &Value) -> Result<Period, ConfigError> {
    let fallback_label = format!("#{}", index + 1);
    let Value::Object(fields) = value else {
        return Err(ConfigError::IncompletePeriod(fallback_label));
    };

    let name = match fields.get("name") {
        None => String::new(),
        Some(Value::String(name)) => name.clone(),
        Some(_) => {
            return Err(ConfigError::InvalidPeriodField {
                period: fallback_label,
                field: "name",
                expected: "a string",
            })
        }
    };
    let label = if name.is_empty() {
        fallback_label
    } else {
        name.clone()
    };

    let (Some(start), Some(end), Some(mode)) =
        (fields.get("start"), fields.get("end"), fields.get("mode"))
    else {
        return Err(ConfigError::IncompletePeriod(label));
    };

    let mode = mode.as_str().ok_or_else(|| ConfigError::InvalidPeriodField {
        period: label.clone(),
        field: "mode",
        expected: "a mode name",
    })?;

    let start = parse_period_time(&label, start)?;
    let end = parse_period_time(&label, end)?;

    Ok(Period {
        name,
        start,
        end,
        mode: mode.to_string(),
    })
}

fn parse_period_time(period: &str, value: &Value) -> Result<TimeOfDay, ConfigError> {
    let text = match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    };
    TimeOfDay::parse(&text).ok_or_else(|| ConfigError::InvalidTime {
        period: period.to_string(),
        value: text,
    })
}
