//! Sensor and actuator drivers.
//!
//! Devices are declared in the configuration by type name. The registries
//! below map each name to a constructor once at startup; an unknown name is
//! a startup error.

use std::{collections::BTreeMap, ops::RangeInclusive};

use terrarium_common::{DeviceConfig, Reading};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum DriverError {
    #[error("{device}: unknown {role} type '{kind}'")]
    UnknownType {
        device: String,
        role: &'static str,
        kind: String,
    },
    #[error("{device}: '{kind}' requires a pin")]
    MissingPin { device: String, kind: &'static str },
    #[error("{device}: read failed: {reason}")]
    Read { device: String, reason: String },
}

pub trait Sensor: Send {
    fn kind(&self) -> &'static str;
    fn read(&mut self) -> Result<Reading, DriverError>;
}

pub trait Actuator: Send {
    fn kind(&self) -> &'static str;
    fn set_state(&mut self, on: bool) -> Result<(), DriverError>;
    fn state(&self) -> bool;
}

type SensorFactory = fn(&str, &DeviceConfig) -> Result<Box<dyn Sensor>, DriverError>;
type ActuatorFactory = fn(&str, &DeviceConfig) -> Result<Box<dyn Actuator>, DriverError>;

const SENSOR_TYPES: &[(&str, SensorFactory)] = &[(Dht22::KIND, Dht22::build)];
const ACTUATOR_TYPES: &[(&str, ActuatorFactory)] = &[(Relay::KIND, Relay::build)];

pub type SensorSet = BTreeMap<String, Box<dyn Sensor>>;
pub type ActuatorSet = BTreeMap<String, Box<dyn Actuator>>;

pub fn build_sensors(devices: &BTreeMap<String, DeviceConfig>) -> Result<SensorSet, DriverError> {
    devices
        .iter()
        .map(|(name, device)| {
            let factory = lookup(SENSOR_TYPES, name, "sensor", device)?;
            Ok((name.clone(), factory(name, device)?))
        })
        .collect()
}

pub fn build_actuators(
    devices: &BTreeMap<String, DeviceConfig>,
) -> Result<ActuatorSet, DriverError> {
    devices
        .iter()
        .map(|(name, device)| {
            let factory = lookup(ACTUATOR_TYPES, name, "actuator", device)?;
            Ok((name.clone(), factory(name, device)?))
        })
        .collect()
}

fn lookup<F: Copy>(
    registry: &[(&str, F)],
    device: &str,
    role: &'static str,
    config: &DeviceConfig,
) -> Result<F, DriverError> {
    registry
        .iter()
        .find(|(kind, _)| *kind == config.kind)
        .map(|(_, factory)| *factory)
        .ok_or_else(|| DriverError::UnknownType {
            device: device.to_string(),
            role,
            kind: config.kind.clone(),
        })
}

fn require_pin(device: &str, kind: &'static str, config: &DeviceConfig) -> Result<u8, DriverError> {
    config.pin.ok_or_else(|| DriverError::MissingPin {
        device: device.to_string(),
        kind,
    })
}

/// DHT22 temperature/humidity sensor.
///
/// Host builds have no GPIO access, so readings are simulated around a warm
/// terrarium climate.
pub struct Dht22 {
    name: String,
    pin: u8,
    tick: u64,
}

impl Dht22 {
    pub const KIND: &'static str = "DHT22";
    const TEMPERATURE_RANGE: RangeInclusive<f64> = -40.0..=80.0;
    const HUMIDITY_RANGE: RangeInclusive<f64> = 0.0..=100.0;

    fn build(name: &str, config: &DeviceConfig) -> Result<Box<dyn Sensor>, DriverError> {
        let pin = require_pin(name, Self::KIND, config)?;
        info!(sensor = name, pin, "dht22 sensor ready (simulated)");
        Ok(Box::new(Self {
            name: name.to_string(),
            pin,
            tick: 0,
        }))
    }

    /// Values outside the DHT22 measuring range mean a corrupted frame.
    fn checked(&self, temperature: f64, humidity: f64) -> Result<Reading, DriverError> {
        if !Self::TEMPERATURE_RANGE.contains(&temperature)
            || !Self::HUMIDITY_RANGE.contains(&humidity)
        {
            return Err(DriverError::Read {
                device: self.name.clone(),
                reason: format!(
                    "out of range frame on pin {}: {temperature}C {humidity}%",
                    self.pin
                ),
            });
        }

        Ok(Reading::from([
            ("temperature".to_string(), temperature),
            ("humidity".to_string(), humidity),
        ]))
    }
}

impl Sensor for Dht22 {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn read(&mut self) -> Result<Reading, DriverError> {
        self.tick = self.tick.wrapping_add(1);

        // Hardware integration point: replace with a DHT22 driver on `self.pin`.
        let temperature = 24.0 + (self.tick % 8) as f64 * 0.25;
        let humidity = 65.0 + (self.tick % 6) as f64 * 0.5;

        self.checked(temperature, humidity)
    }
}

/// Active-low relay output. Starts switched off.
pub struct Relay {
    name: String,
    pin: u8,
    on: bool,
}

impl Relay {
    pub const KIND: &'static str = "Relay";

    fn build(name: &str, config: &DeviceConfig) -> Result<Box<dyn Actuator>, DriverError> {
        let pin = require_pin(name, Self::KIND, config)?;
        let mut relay = Self {
            name: name.to_string(),
            pin,
            on: true,
        };
        relay.set_state(false)?;
        Ok(Box::new(relay))
    }

    fn level(on: bool) -> &'static str {
        if on {
            "LOW"
        } else {
            "HIGH"
        }
    }
}

impl Actuator for Relay {
    fn kind(&self) -> &'static str {
        Self::KIND
    }

    fn set_state(&mut self, on: bool) -> Result<(), DriverError> {
        if self.on != on {
            // Hardware integration point: drive GPIO `self.pin` to this level.
            info!(
                relay = %self.name,
                pin = self.pin,
                level = Self::level(on),
                "relay {}",
                if on { "on" } else { "off" }
            );
        }
        self.on = on;
        Ok(())
    }

    fn state(&self) -> bool {
        self.on
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    fn device(kind: &str, pin: Option<u8>) -> DeviceConfig {
        DeviceConfig {
            kind: kind.to_string(),
            pin,
            address: None,
        }
    }

    #[test]
    fn builds_registered_devices() {
        let sensors =
            build_sensors(&BTreeMap::from([("dht22".to_string(), device("DHT22", Some(4)))]))
                .unwrap();
        let actuators =
            build_actuators(&BTreeMap::from([("light".to_string(), device("Relay", Some(17)))]))
                .unwrap();

        assert_eq!(sensors["dht22"].kind(), "DHT22");
        assert_eq!(actuators["light"].kind(), "Relay");
        assert!(!actuators["light"].state());
    }

    #[test]
    fn unknown_type_names_the_device() {
        let err = build_sensors(&BTreeMap::from([(
            "probe".to_string(),
            device("BME280", Some(2)),
        )]))
        .err()
        .unwrap();

        assert_eq!(err.to_string(), "probe: unknown sensor type 'BME280'");
    }

    #[test]
    fn relay_requires_pin() {
        let err = build_actuators(&BTreeMap::from([("fan".to_string(), device("Relay", None))]))
            .err()
            .unwrap();

        assert!(matches!(err, DriverError::MissingPin { .. }));
    }

    #[test]
    fn dht22_reports_temperature_and_humidity() {
        let mut sensors =
            build_sensors(&BTreeMap::from([("dht22".to_string(), device("DHT22", Some(4)))]))
                .unwrap();
        let reading = sensors.get_mut("dht22").unwrap().read().unwrap();

        assert!(reading.contains_key("temperature"));
        assert!(reading.contains_key("humidity"));
    }

    #[test]
    fn dht22_reads_do_not_fail_on_their_own() {
        let mut sensors =
            build_sensors(&BTreeMap::from([("dht22".to_string(), device("DHT22", Some(4)))]))
                .unwrap();
        let sensor = sensors.get_mut("dht22").unwrap();

        for _ in 0..200 {
            let reading = sensor.read().unwrap();
            assert!((24.0..=26.0).contains(&reading["temperature"]));
        }
    }

    #[test]
    fn dht22_rejects_out_of_range_frames() {
        let dht22 = Dht22 {
            name: "dht22".to_string(),
            pin: 4,
            tick: 0,
        };

        let err = dht22.checked(120.0, 50.0).unwrap_err();
        assert_eq!(
            err.to_string(),
            "dht22: read failed: out of range frame on pin 4: 120C 50%"
        );
        assert!(dht22.checked(25.5, 101.0).is_err());
        assert!(dht22.checked(25.5, 60.0).is_ok());
    }

    #[test]
    fn relay_tracks_state() {
        let mut actuators =
            build_actuators(&BTreeMap::from([("light".to_string(), device("Relay", Some(17)))]))
                .unwrap();
        let relay = actuators.get_mut("light").unwrap();

        relay.set_state(true).unwrap();
        assert!(relay.state());
        relay.set_state(false).unwrap();
        assert!(!relay.state());
    }
}
