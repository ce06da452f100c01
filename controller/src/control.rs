use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use chrono::{Local, NaiveTime, Utc};
use chrono_tz::Tz;
use terrarium_common::{
    actuator_state_topic, resolve_mode, sensor_topic, ActuatorSetting, ModeDefinition, Reading,
    Thermostat, ThermostatSpec, NO_MODE, TOPIC_MODE,
};
use tokio::{
    sync::Mutex,
    time::{Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    bus::Bus,
    drivers::{ActuatorSet, SensorSet},
    store::ConfigStore,
};

const TEMPERATURE_FIELD: &str = "temperature";

/// Override flag and mode selection, written by the dispatcher and read by
/// the control loop.
#[derive(Debug, Default)]
pub struct RuntimeState {
    follow_schedule: AtomicBool,
    manual_mode: Mutex<Option<String>>,
    resolved_mode: Mutex<Option<String>>,
}

impl RuntimeState {
    pub fn new(follow_schedule: bool) -> Self {
        Self {
            follow_schedule: AtomicBool::new(follow_schedule),
            ..Self::default()
        }
    }

    pub fn follow_schedule(&self) -> bool {
        self.follow_schedule.load(Ordering::Relaxed)
    }

    /// Returning to the schedule drops any manual selection, so a later
    /// override starts from whatever the schedule last picked.
    pub async fn set_follow_schedule(&self, follow: bool) {
        self.follow_schedule.store(follow, Ordering::Relaxed);
        if follow {
            self.manual_mode.lock().await.take();
        }
    }

    /// Only honored while the schedule is overridden.
    pub async fn set_manual_mode(&self, mode: String) -> bool {
        if self.follow_schedule() {
            return false;
        }
        *self.manual_mode.lock().await = Some(mode);
        true
    }

    pub async fn manual_mode(&self) -> Option<String> {
        self.manual_mode.lock().await.clone()
    }

    pub async fn resolved_mode(&self) -> Option<String> {
        self.resolved_mode.lock().await.clone()
    }

    async fn set_resolved_mode(&self, mode: Option<String>) {
        *self.resolved_mode.lock().await = mode;
    }
}

/// Wall-clock time of day in the configured timezone, or local time.
pub fn wall_clock(timezone: Option<Tz>) -> NaiveTime {
    match timezone {
        Some(tz) => Utc::now().with_timezone(&tz).time(),
        None => Local::now().time(),
    }
}

type ThermostatKey = (String, String);

pub struct ControlLoop {
    store: Arc<ConfigStore>,
    runtime: Arc<RuntimeState>,
    bus: Arc<dyn Bus>,
    sensors: SensorSet,
    actuators: ActuatorSet,
    thermostats: HashMap<ThermostatKey, Thermostat>,
    telemetry_interval: Duration,
    last_telemetry_at: Option<Instant>,
    tick_interval: Duration,
    timezone: Option<Tz>,
}

impl ControlLoop {
    pub fn new(
        store: Arc<ConfigStore>,
        runtime: Arc<RuntimeState>,
        bus: Arc<dyn Bus>,
        sensors: SensorSet,
        actuators: ActuatorSet,
    ) -> Self {
        let telemetry_interval = Duration::from_secs(store.telemetry_interval());
        Self {
            store,
            runtime,
            bus,
            sensors,
            actuators,
            thermostats: HashMap::new(),
            telemetry_interval,
            last_telemetry_at: None,
            tick_interval: Duration::from_secs(1),
            timezone: None,
        }
    }

    pub fn with_tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn with_timezone(mut self, timezone: Option<Tz>) -> Self {
        self.timezone = timezone;
        self
    }

    /// Ticks until `shutdown` resolves, then switches every actuator off.
    pub async fn run(&mut self, shutdown: impl Future<Output = ()>) {
        tokio::pin!(shutdown);
        let mut interval = tokio::time::interval(self.tick_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            tick_ms = self.tick_interval.as_millis() as u64,
            telemetry_secs = self.telemetry_interval.as_secs(),
            "control loop started"
        );

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    let now = wall_clock(self.timezone);
                    self.tick(now, Instant::now()).await;
                }
            }
        }

        self.all_off();
        info!("control loop stopped, actuators off");
    }

    pub async fn tick(&mut self, now: NaiveTime, instant: Instant) {
        let readings = self.read_sensors();

        let modes = self.store.modes().await;
        let schedule = self.store.schedule().await;
        let manual_mode = self.runtime.manual_mode().await;
        let previous_mode = self.runtime.resolved_mode().await;
        let mode = resolve_mode(
            now,
            &schedule,
            self.runtime.follow_schedule(),
            manual_mode.as_deref(),
            previous_mode.as_deref(),
        );
        if mode != previous_mode {
            info!(from = ?previous_mode, to = ?mode, "mode changed");
        }
        self.runtime.set_resolved_mode(mode.clone()).await;

        self.publish_telemetry(&readings, mode.as_deref(), instant);

        match mode.as_deref() {
            None => {
                debug!("no mode selected, switching all actuators off");
                self.all_off();
            }
            Some(name) => match modes.get(name) {
                Some(definition) => self.apply_mode(name, definition, &readings),
                None => warn!(mode = name, "unknown mode, actuators left unchanged"),
            },
        }

        for (name, actuator) in &self.actuators {
            self.bus
                .publish(&actuator_state_topic(name), actuator.state().to_string());
        }
    }

    pub fn all_off(&mut self) {
        for (name, actuator) in self.actuators.iter_mut() {
            if let Err(err) = actuator.set_state(false) {
                warn!("failed to switch {name} off: {err}");
            }
        }
    }

    fn read_sensors(&mut self) -> BTreeMap<String, Option<Reading>> {
        self.sensors
            .iter_mut()
            .map(|(name, sensor)| {
                let reading = match sensor.read() {
                    Ok(reading) => Some(reading),
                    Err(err) => {
                        warn!(sensor = %name, kind = sensor.kind(), "sensor read failed: {err}");
                        None
                    }
                };
                (name.clone(), reading)
            })
            .collect()
    }

    fn publish_telemetry(
        &mut self,
        readings: &BTreeMap<String, Option<Reading>>,
        mode: Option<&str>,
        instant: Instant,
    ) {
        let due = self
            .last_telemetry_at
            .map(|last| instant.saturating_duration_since(last) >= self.telemetry_interval)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_telemetry_at = Some(instant);

        for (sensor, reading) in readings {
            let Some(reading) = reading else {
                debug!(sensor = %sensor, "no reading, skipping telemetry");
                continue;
            };
            for (field, value) in reading {
                self.bus.publish(&sensor_topic(sensor, field), value.to_string());
            }
        }
        self.bus
            .publish(TOPIC_MODE, mode.unwrap_or(NO_MODE).to_string());
    }

    fn apply_mode(
        &mut self,
        mode: &str,
        definition: &ModeDefinition,
        readings: &BTreeMap<String, Option<Reading>>,
    ) {
        let names: Vec<String> = self.actuators.keys().cloned().collect();
        for name in names {
            let target = match definition.get(&name) {
                None => false,
                Some(ActuatorSetting::Switch(state)) => *state,
                Some(ActuatorSetting::Thermostat(spec)) => {
                    self.evaluate_thermostat(&name, mode, spec, readings)
                }
            };

            if let Some(actuator) = self.actuators.get_mut(&name) {
                if let Err(err) = actuator.set_state(target) {
                    warn!("failed to set {name}: {err}");
                }
            }
        }
    }

    fn evaluate_thermostat(
        &mut self,
        actuator: &str,
        mode: &str,
        spec: &ThermostatSpec,
        readings: &BTreeMap<String, Option<Reading>>,
    ) -> bool {
        if !spec.enabled {
            return false;
        }

        let key = (actuator.to_string(), mode.to_string());
        let temperature = readings
            .get(&spec.sensor)
            .and_then(Option::as_ref)
            .and_then(|reading| reading.get(TEMPERATURE_FIELD))
            .copied();

        let Some(temperature) = temperature else {
            let held = self
                .thermostats
                .get(&key)
                .map(Thermostat::relay_state)
                .unwrap_or(false);
            warn!(
                actuator,
                sensor = %spec.sensor,
                held,
                "no temperature reading, holding thermostat state"
            );
            return held;
        };

        let thermostat = self
            .thermostats
            .entry(key)
            .and_modify(|thermostat| thermostat.update_parameters(spec))
            .or_insert_with(|| Thermostat::from_spec(spec));
        let state = thermostat.compute_state(temperature);

        debug!(
            actuator,
            temperature,
            target = spec.target_temperature,
            hysteresis = spec.hysteresis,
            action = spec.action.as_str(),
            relay = state,
            "thermostat evaluated"
        );
        state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        bus::RecordingBus,
        dispatch::Dispatcher,
        drivers::fake::{ScriptedSensor, SharedActuator},
    };
    use serde_json::json;
    use terrarium_common::{ConfigSection, TerrariumConfig, TOPIC_MODE_SET};

    struct Rig {
        control: ControlLoop,
        store: Arc<ConfigStore>,
        runtime: Arc<RuntimeState>,
        bus: Arc<RecordingBus>,
        sensor: ScriptedSensor,
        light: SharedActuator,
        cooler: SharedActuator,
        _dir: tempfile::TempDir,
    }

    fn config(follow: bool) -> TerrariumConfig {
        serde_json::from_value(json!({
            "telemetry_interval": 60,
            "sensors": {"dht22": {"type": "DHT22", "pin": 4}},
            "actuators": {
                "light": {"type": "Relay", "pin": 17},
                "cooler": {"type": "Relay", "pin": 27}
            },
            "modes": {
                "day": {
                    "light": true,
                    "cooler": {
                        "type": "thermostat",
                        "enabled": true,
                        "target_temperature": 25.0,
                        "hysteresis": 1.0,
                        "sensor": "dht22",
                        "action": "cooling"
                    }
                },
                "night": {"light": false},
                "eco": {
                    "cooler": {
                        "type": "thermostat",
                        "enabled": false,
                        "target_temperature": 25.0,
                        "hysteresis": 1.0,
                        "sensor": "dht22",
                        "action": "cooling"
                    }
                }
            },
            "schedule": {
                "active": follow,
                "default_mode": "night",
                "periods": [{"name": "daytime", "start": "08:00", "end": "20:00", "mode": "day"}]
            }
        }))
        .unwrap()
    }

    fn rig(follow: bool) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let config = config(follow);
        let store = Arc::new(ConfigStore::new(dir.path().join("config.yaml"), &config));
        let runtime = Arc::new(RuntimeState::new(follow));
        let bus = Arc::new(RecordingBus::default());
        let sensor = ScriptedSensor::default();
        let light = SharedActuator::default();
        let cooler = SharedActuator::default();

        let sensors: SensorSet = BTreeMap::from([(
            "dht22".to_string(),
            Box::new(sensor.clone()) as Box<dyn crate::drivers::Sensor>,
        )]);
        let actuators: ActuatorSet = BTreeMap::from([
            (
                "light".to_string(),
                Box::new(light.clone()) as Box<dyn crate::drivers::Actuator>,
            ),
            (
                "cooler".to_string(),
                Box::new(cooler.clone()) as Box<dyn crate::drivers::Actuator>,
            ),
        ]);

        let control = ControlLoop::new(
            store.clone(),
            runtime.clone(),
            bus.clone(),
            sensors,
            actuators,
        );

        Rig {
            control,
            store,
            runtime,
            bus,
            sensor,
            light,
            cooler,
            _dir: dir,
        }
    }

    fn at(hour: u32, minute: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(hour, minute, 0).unwrap()
    }

    #[tokio::test]
    async fn schedule_drives_switches_and_thermostat() {
        let mut rig = rig(true);
        rig.sensor.push_temperature(27.0);

        rig.control.tick(at(12, 0), Instant::now()).await;

        assert!(rig.light.is_on());
        assert!(rig.cooler.is_on());
        assert_eq!(rig.runtime.resolved_mode().await.as_deref(), Some("day"));
        assert_eq!(rig.bus.last_on("actuator/light/state").as_deref(), Some("true"));
        assert_eq!(rig.bus.last_on("actuator/cooler/state").as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn absent_entry_means_off() {
        let mut rig = rig(true);
        rig.sensor.push_temperature(27.0);
        rig.light.force(true);
        rig.cooler.force(true);

        rig.control.tick(at(22, 0), Instant::now()).await;

        assert_eq!(rig.runtime.resolved_mode().await.as_deref(), Some("night"));
        assert!(!rig.light.is_on());
        assert!(!rig.cooler.is_on());
    }

    #[tokio::test]
    async fn disabled_thermostat_is_off() {
        let mut rig = rig(false);
        rig.sensor.push_temperature(40.0);
        rig.runtime.set_manual_mode("eco".to_string()).await;

        rig.control.tick(at(12, 0), Instant::now()).await;

        assert!(!rig.cooler.is_on());
    }

    #[tokio::test]
    async fn thermostat_follows_hysteresis_across_ticks() {
        let mut rig = rig(true);
        let mut states = Vec::new();
        for temperature in [24.0, 26.0, 25.5, 24.2, 23.9] {
            rig.sensor.push_temperature(temperature);
            rig.control.tick(at(12, 0), Instant::now()).await;
            states.push(rig.cooler.is_on());
        }

        assert_eq!(states, vec![false, true, true, true, false]);
    }

    #[tokio::test]
    async fn missing_reading_holds_thermostat_state() {
        let mut rig = rig(true);
        rig.sensor.push_temperature(27.0);
        rig.control.tick(at(12, 0), Instant::now()).await;
        assert!(rig.cooler.is_on());

        rig.sensor.push(None);
        rig.control.tick(at(12, 0), Instant::now()).await;
        rig.control.tick(at(12, 0), Instant::now()).await;

        assert!(rig.cooler.is_on());
        assert_eq!(rig.cooler.writes(), vec![true, true, true]);
    }

    #[tokio::test]
    async fn missing_reading_before_any_evaluation_is_off() {
        let mut rig = rig(true);
        rig.sensor.push(None);

        rig.control.tick(at(12, 0), Instant::now()).await;

        assert!(!rig.cooler.is_on());
        assert!(rig.light.is_on());
    }

    #[tokio::test]
    async fn no_mode_forces_everything_off() {
        let mut rig = rig(false);
        rig.sensor.push_temperature(27.0);
        rig.light.force(true);
        rig.cooler.force(true);

        rig.control.tick(at(12, 0), Instant::now()).await;

        assert_eq!(rig.runtime.resolved_mode().await, None);
        assert!(!rig.light.is_on());
        assert!(!rig.cooler.is_on());
        assert_eq!(rig.bus.last_on(TOPIC_MODE).as_deref(), Some(NO_MODE));
    }

    #[tokio::test]
    async fn mode_set_none_forces_everything_off() {
        let mut rig = rig(false);
        let dispatcher = Dispatcher::new(
            rig.store.clone(),
            rig.runtime.clone(),
            rig.bus.clone(),
            None,
        );
        rig.sensor.push_temperature(27.0);

        dispatcher.handle(TOPIC_MODE_SET, b"day").await;
        rig.control.tick(at(12, 0), Instant::now()).await;
        assert!(rig.light.is_on());
        assert!(rig.cooler.is_on());

        dispatcher.handle(TOPIC_MODE_SET, NO_MODE.as_bytes()).await;
        rig.control.tick(at(12, 0), Instant::now()).await;
        rig.control.tick(at(12, 0), Instant::now()).await;

        assert_eq!(rig.runtime.resolved_mode().await, None);
        assert!(!rig.light.is_on());
        assert!(!rig.cooler.is_on());
        assert_eq!(rig.bus.last_on("actuator/light/state").as_deref(), Some("false"));
    }

    #[tokio::test]
    async fn unknown_mode_leaves_actuators_alone() {
        let mut rig = rig(false);
        rig.sensor.push_temperature(27.0);
        rig.light.force(true);
        rig.runtime.set_manual_mode("storm".to_string()).await;

        rig.control.tick(at(12, 0), Instant::now()).await;

        assert!(rig.light.is_on());
        assert!(rig.light.writes().is_empty());
        assert_eq!(rig.bus.last_on("actuator/light/state").as_deref(), Some("true"));
    }

    #[tokio::test]
    async fn manual_override_takes_effect_immediately() {
        let mut rig = rig(false);
        rig.sensor.push_temperature(22.0);

        rig.runtime.set_manual_mode("day".to_string()).await;
        rig.control.tick(at(2, 0), Instant::now()).await;
        assert!(rig.light.is_on());

        rig.runtime.set_manual_mode("night".to_string()).await;
        rig.control.tick(at(2, 0), Instant::now()).await;
        assert!(!rig.light.is_on());
    }

    #[tokio::test]
    async fn manual_mode_ignored_while_following_schedule() {
        let mut rig = rig(true);
        rig.sensor.push_temperature(22.0);

        assert!(!rig.runtime.set_manual_mode("day".to_string()).await);
        rig.control.tick(at(2, 0), Instant::now()).await;

        assert_eq!(rig.runtime.resolved_mode().await.as_deref(), Some("night"));
    }

    #[tokio::test]
    async fn override_keeps_last_scheduled_mode() {
        let mut rig = rig(true);
        rig.sensor.push_temperature(22.0);
        rig.control.tick(at(12, 0), Instant::now()).await;

        rig.runtime.set_follow_schedule(false).await;
        rig.control.tick(at(23, 0), Instant::now()).await;

        assert_eq!(rig.runtime.resolved_mode().await.as_deref(), Some("day"));
    }

    #[tokio::test]
    async fn telemetry_is_throttled() {
        let mut rig = rig(true);
        rig.sensor.push(Some(Reading::from([
            ("temperature".to_string(), 24.5),
            ("humidity".to_string(), 70.0),
        ])));
        let start = Instant::now();

        rig.control.tick(at(12, 0), start).await;
        rig.control.tick(at(12, 0), start + Duration::from_secs(30)).await;
        rig.control.tick(at(12, 1), start + Duration::from_secs(60)).await;

        assert_eq!(rig.bus.on_topic("sensor/dht22/temperature"), vec!["24.5", "24.5"]);
        assert_eq!(rig.bus.on_topic("sensor/dht22/humidity"), vec!["70", "70"]);
        assert_eq!(rig.bus.on_topic(TOPIC_MODE), vec!["day", "day"]);
        // Actuator states go out every tick.
        assert_eq!(rig.bus.on_topic("actuator/light/state").len(), 3);
    }

    #[tokio::test]
    async fn failed_read_is_not_published() {
        let mut rig = rig(true);
        rig.sensor.push(None);

        rig.control.tick(at(12, 0), Instant::now()).await;

        let messages = rig.bus.take();
        assert!(messages.iter().all(|(topic, _)| !topic.starts_with("sensor/")));
        assert!(messages.iter().any(|(topic, _)| topic == TOPIC_MODE));
    }

    #[tokio::test]
    async fn hot_reloaded_target_keeps_relay_state() {
        let mut rig = rig(true);
        rig.sensor.push_temperature(26.5);
        rig.control.tick(at(12, 0), Instant::now()).await;
        assert!(rig.cooler.is_on());

        rig.store
            .apply_update(
                ConfigSection::Modes,
                &json!({
                    "day": {
                        "light": true,
                        "cooler": {
                            "type": "thermostat",
                            "enabled": true,
                            "target_temperature": 26.0,
                            "hysteresis": 1.0,
                            "sensor": "dht22",
                            "action": "cooling"
                        }
                    },
                    "night": {"light": false}
                }),
            )
            .await
            .unwrap();

        // 26.5 is inside the new dead-band [25, 27]: stays on.
        rig.control.tick(at(12, 0), Instant::now()).await;
        assert!(rig.cooler.is_on());

        rig.sensor.push_temperature(24.9);
        rig.control.tick(at(12, 0), Instant::now()).await;
        assert!(!rig.cooler.is_on());
    }

    #[tokio::test]
    async fn thermostat_state_is_per_mode() {
        let mut rig = rig(false);
        rig.runtime.set_manual_mode("day".to_string()).await;
        rig.sensor.push_temperature(27.0);
        rig.control.tick(at(12, 0), Instant::now()).await;
        assert!(rig.cooler.is_on());

        rig.runtime.set_manual_mode("night".to_string()).await;
        rig.control.tick(at(12, 0), Instant::now()).await;
        assert!(!rig.cooler.is_on());

        // Back in day mode the stored thermostat still remembers ON.
        rig.runtime.set_manual_mode("day".to_string()).await;
        rig.sensor.push_temperature(25.0);
        rig.control.tick(at(12, 0), Instant::now()).await;
        assert!(rig.cooler.is_on());
        assert_eq!(rig.control.thermostats.len(), 1);
    }

    #[tokio::test]
    async fn run_switches_off_on_shutdown() {
        let mut rig = rig(true);
        rig.light.force(true);
        rig.cooler.force(true);

        rig.control.run(async {}).await;

        assert!(!rig.light.is_on());
        assert!(!rig.cooler.is_on());
    }
}
