use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    config::{ConfigSection, DeviceConfig, Modes},
    error::ConfigError,
    schedule::Schedule,
};

/// Named numeric fields from one sensor read, e.g. `temperature`, `humidity`.
pub type Reading = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigStatus {
    pub success: bool,
    pub message: String,
    pub section: Option<String>,
}

impl ConfigStatus {
    pub fn accepted(section: ConfigSection, message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            section: Some(section.as_str().to_string()),
        }
    }

    pub fn rejected(section: Option<String>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            section,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSummary {
    #[serde(rename = "type")]
    pub kind: String,
}

impl From<&DeviceConfig> for DeviceSummary {
    fn from(device: &DeviceConfig) -> Self {
        Self {
            kind: device.kind.clone(),
        }
    }
}

/// Point-in-time view published on `config/full`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FullConfig {
    pub modes: Modes,
    pub schedule: Schedule,
    pub sensors: BTreeMap<String, DeviceSummary>,
    pub actuators: BTreeMap<String, DeviceSummary>,
    pub telemetry_interval: u64,
    pub current_mode: Option<String>,
}

/// Inbound `config/update` request: `{section, data}`.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigUpdate {
    pub section: ConfigSection,
    pub data: Value,
}

impl ConfigUpdate {
    /// Raw section name, echoed back on `config/status` even when unknown.
    pub fn section_name(request: &Value) -> Option<String> {
        request
            .get("section")
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn from_value(mut request: Value) -> Result<Self, ConfigError> {
        let section = Self::section_name(&request).filter(|section| !section.is_empty());
        let data = request
            .get_mut("data")
            .map(Value::take)
            .filter(|data| !data.is_null());

        let (Some(section), Some(data)) = (section, data) else {
            return Err(ConfigError::MissingSectionOrData);
        };

        Ok(Self {
            section: ConfigSection::parse(&section)?,
            data,
        })
    }
}
