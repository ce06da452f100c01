use std::{
    collections::BTreeMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::Context;
use serde::Serialize;
use serde_json::Value;
use serde_yaml::{Mapping, Value as YamlValue};
use terrarium_common::{
    check_mode_references, parse_modes, parse_schedule, ConfigError, ConfigSection, DeviceConfig,
    DeviceSummary, FullConfig, Modes, Schedule, TerrariumConfig,
};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Rejected(#[from] ConfigError),
    #[error("Failed to write {section} to configuration file: {reason}")]
    Persist {
        section: &'static str,
        reason: String,
    },
}

/// Reads the YAML document, substitutes `${VAR}` references from the
/// environment and deserializes it into the fixed schema. Modes and schedule
/// get the same field checks as a runtime update; schedule references to
/// undefined modes only warn, the control loop holds actuators for those.
pub async fn load_config(path: &Path) -> anyhow::Result<TerrariumConfig> {
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_config(&raw, |name| std::env::var(name).ok())
        .with_context(|| format!("failed to parse {}", path.display()))
}

fn parse_config(
    raw: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> anyhow::Result<TerrariumConfig> {
    let mut document: YamlValue = serde_yaml::from_str(raw)?;
    substitute_env(&mut document, &lookup);
    let config: TerrariumConfig = serde_yaml::from_value(document)?;

    parse_modes(&serde_json::to_value(&config.modes)?)?;
    parse_schedule(&serde_json::to_value(&config.schedule)?)?;
    for mode in config
        .schedule
        .referenced_modes()
        .filter(|mode| !config.modes.contains_key(*mode))
    {
        warn!(mode, "schedule references an undefined mode");
    }
    Ok(config)
}

fn substitute_env(value: &mut YamlValue, lookup: &impl Fn(&str) -> Option<String>) {
    match value {
        YamlValue::String(text) if text.contains("${") => {
            *text = expand_vars(text, lookup);
        }
        YamlValue::Sequence(items) => {
            for item in items {
                substitute_env(item, lookup);
            }
        }
        YamlValue::Mapping(entries) => {
            for (_, item) in entries.iter_mut() {
                substitute_env(item, lookup);
            }
        }
        _ => {}
    }
}

fn expand_vars(text: &str, lookup: &impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find("${") {
        let Some(len) = rest[start + 2..].find('}') else {
            break;
        };
        let name = &rest[start + 2..start + 2 + len];
        out.push_str(&rest[..start]);
        match lookup(name).filter(|value| !value.is_empty()) {
            Some(value) => out.push_str(&value),
            None => warn!("environment variable {name} is not set"),
        }
        rest = &rest[start + 3 + len..];
    }

    out.push_str(rest);
    out
}

/// Live configuration shared by the control loop and the message dispatcher.
///
/// The `modes` and `schedule` sections sit behind their own `Arc`; an accepted
/// update replaces the whole `Arc`, so readers always see a complete section.
pub struct ConfigStore {
    path: PathBuf,
    modes: RwLock<Arc<Modes>>,
    schedule: RwLock<Arc<Schedule>>,
    sensors: BTreeMap<String, DeviceSummary>,
    actuators: BTreeMap<String, DeviceSummary>,
    telemetry_interval: u64,
    write_lock: Mutex<()>,
}

impl ConfigStore {
    pub fn new(path: impl Into<PathBuf>, config: &TerrariumConfig) -> Self {
        Self {
            path: path.into(),
            modes: RwLock::new(Arc::new(config.modes.clone())),
            schedule: RwLock::new(Arc::new(config.schedule.clone())),
            sensors: summarize(&config.sensors),
            actuators: summarize(&config.actuators),
            telemetry_interval: config.telemetry_interval,
            write_lock: Mutex::new(()),
        }
    }

    pub async fn modes(&self) -> Arc<Modes> {
        self.modes.read().await.clone()
    }

    pub async fn schedule(&self) -> Arc<Schedule> {
        self.schedule.read().await.clone()
    }

    pub fn telemetry_interval(&self) -> u64 {
        self.telemetry_interval
    }

    /// Validates, persists and then publishes a new section. Nothing changes
    /// on rejection or when the write fails.
    pub async fn apply_update(
        &self,
        section: ConfigSection,
        data: &Value,
    ) -> Result<String, StoreError> {
        let _guard = self.write_lock.lock().await;

        match section {
            ConfigSection::Modes => {
                let modes = parse_modes(data)?;
                self.persist(section, &modes).await?;
                *self.modes.write().await = Arc::new(modes);
                info!("modes updated");
                Ok("Modes updated successfully".to_string())
            }
            ConfigSection::Schedule => {
                let schedule = parse_schedule(data)?;
                check_mode_references(&schedule, &*self.modes().await)?;
                self.persist(section, &schedule).await?;
                *self.schedule.write().await = Arc::new(schedule);
                info!("schedule updated");
                Ok("Schedule updated successfully".to_string())
            }
        }
    }

    /// Snapshot for `config/full`. `follow_schedule` reflects the live
    /// override flag rather than the persisted `active` value.
    pub async fn snapshot(&self, follow_schedule: bool, current_mode: Option<String>) -> FullConfig {
        let modes = self.modes().await;
        let mut schedule = Schedule::clone(&*self.schedule().await);
        schedule.active = follow_schedule;

        FullConfig {
            modes: Modes::clone(&modes),
            schedule,
            sensors: self.sensors.clone(),
            actuators: self.actuators.clone(),
            telemetry_interval: self.telemetry_interval,
            current_mode,
        }
    }

    async fn persist<T: Serialize>(
        &self,
        section: ConfigSection,
        value: &T,
    ) -> Result<(), StoreError> {
        self.write_section(section.as_str(), value)
            .await
            .map_err(|err| {
                warn!("failed to persist {}: {err:#}", section.as_str());
                StoreError::Persist {
                    section: section.as_str(),
                    reason: format!("{err:#}"),
                }
            })
    }

    /// Read-modify-write of one top-level key; other sections and key order
    /// are left as they are on disk.
    async fn write_section<T: Serialize>(&self, key: &str, value: &T) -> anyhow::Result<()> {
        let mut document = match tokio::fs::read_to_string(&self.path).await {
            Ok(raw) if raw.trim().is_empty() => Mapping::new(),
            Ok(raw) => match serde_yaml::from_str::<YamlValue>(&raw)? {
                YamlValue::Mapping(mapping) => mapping,
                _ => anyhow::bail!("{} is not a YAML mapping", self.path.display()),
            },
            Err(err) if err.kind() == ErrorKind::NotFound => Mapping::new(),
            Err(err) => return Err(err.into()),
        };

        document.insert(YamlValue::from(key), serde_yaml::to_value(value)?);

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_yaml::to_string(&document)?;
        tokio::fs::write(&self.path, payload)
            .await
            .with_context(|| format!("failed to write {}", self.path.display()))?;
        Ok(())
    }
}

fn summarize(devices: &BTreeMap<String, DeviceConfig>) -> BTreeMap<String, DeviceSummary> {
    devices
        .iter()
        .map(|(name, device)| (name.clone(), DeviceSummary::from(device)))
        .collect()
}
