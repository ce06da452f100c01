use std::sync::Arc;

use chrono_tz::Tz;
use serde_json::Value;
use terrarium_common::{
    resolve_mode, ConfigSection, ConfigStatus, ConfigUpdate, NO_MODE, TOPIC_CONFIG_FULL,
    TOPIC_CONFIG_GET, TOPIC_CONFIG_STATUS, TOPIC_CONFIG_UPDATE, TOPIC_MODE_SET,
    TOPIC_SCHEDULE_ACTIVE,
};
use tracing::{debug, info, warn};

use crate::{
    bus::Bus,
    control::{wall_clock, RuntimeState},
    store::ConfigStore,
};

/// Inbound payloads larger than this are dropped unparsed.
pub const MAX_PAYLOAD_BYTES: usize = 64 * 1024;

/// Routes inbound bus messages to the runtime state and config store.
pub struct Dispatcher {
    store: Arc<ConfigStore>,
    runtime: Arc<RuntimeState>,
    bus: Arc<dyn Bus>,
    timezone: Option<Tz>,
}

impl Dispatcher {
    pub fn new(
        store: Arc<ConfigStore>,
        runtime: Arc<RuntimeState>,
        bus: Arc<dyn Bus>,
        timezone: Option<Tz>,
    ) -> Self {
        Self {
            store,
            runtime,
            bus,
            timezone,
        }
    }

    pub async fn handle(&self, topic: &str, payload: &[u8]) {
        if payload.len() > MAX_PAYLOAD_BYTES {
            warn!(topic, size = payload.len(), "payload too large, dropped");
            return;
        }
        let Ok(payload) = std::str::from_utf8(payload) else {
            warn!(topic, "payload is not utf-8, dropped");
            return;
        };
        debug!(topic, payload, "inbound");

        match topic {
            TOPIC_SCHEDULE_ACTIVE => {
                let follow = payload.trim() == "1";
                self.runtime.set_follow_schedule(follow).await;
                info!(follow_schedule = follow, "schedule override updated");
            }
            TOPIC_MODE_SET => {
                // An empty payload, like `None`, selects no mode.
                let mode = match payload.trim() {
                    "" => NO_MODE.to_string(),
                    name => name.to_string(),
                };
                if self.runtime.set_manual_mode(mode.clone()).await {
                    info!(mode = %mode, "manual mode set");
                } else {
                    info!(mode = %mode, "following schedule, manual mode ignored");
                }
            }
            TOPIC_CONFIG_GET => self.publish_full_config().await,
            TOPIC_CONFIG_UPDATE => self.handle_update(payload).await,
            other => warn!(topic = other, "unhandled topic"),
        }
    }

    pub async fn publish_full_config(&self) {
        let current_mode = match self.runtime.resolved_mode().await {
            Some(mode) => Some(mode),
            None => {
                let schedule = self.store.schedule().await;
                let manual_mode = self.runtime.manual_mode().await;
                resolve_mode(
                    wall_clock(self.timezone),
                    &schedule,
                    self.runtime.follow_schedule(),
                    manual_mode.as_deref(),
                    None,
                )
            }
        };

        let snapshot = self
            .store
            .snapshot(self.runtime.follow_schedule(), current_mode)
            .await;
        match serde_json::to_string(&snapshot) {
            Ok(json) => self.bus.publish(TOPIC_CONFIG_FULL, json),
            Err(err) => warn!("failed to serialize config snapshot: {err}"),
        }
    }

    async fn handle_update(&self, payload: &str) {
        let status = match serde_json::from_str::<Value>(payload) {
            Err(err) => ConfigStatus::rejected(None, format!("Invalid JSON: {err}")),
            Ok(request) => self.apply(request).await,
        };

        let success = status.success;
        if success {
            info!(section = ?status.section, "{}", status.message);
        } else {
            warn!(section = ?status.section, "config update rejected: {}", status.message);
        }

        match serde_json::to_string(&status) {
            Ok(json) => self.bus.publish(TOPIC_CONFIG_STATUS, json),
            Err(err) => warn!("failed to serialize config status: {err}"),
        }

        if success {
            self.publish_full_config().await;
        }
    }

    async fn apply(&self, request: Value) -> ConfigStatus {
        let section_name = ConfigUpdate::section_name(&request);
        let update = match ConfigUpdate::from_value(request) {
            Ok(update) => update,
            Err(err) => return ConfigStatus::rejected(section_name, err.to_string()),
        };

        match self.store.apply_update(update.section, &update.data).await {
            Ok(message) => {
                if update.section == ConfigSection::Schedule {
                    let active = self.store.schedule().await.active;
                    self.runtime.set_follow_schedule(active).await;
                }
                ConfigStatus::accepted(update.section, message)
            }
            Err(err) => ConfigStatus::rejected(section_name, err.to_string()),
        }
    }
}
