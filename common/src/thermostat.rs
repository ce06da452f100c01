use serde::{Deserialize, Serialize};

use crate::config::ThermostatSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThermostatAction {
    Cooling,
    Heating,
}

impl ThermostatAction {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cooling => "cooling",
            Self::Heating => "heating",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "cooling" => Some(Self::Cooling),
            "heating" => Some(Self::Heating),
            _ => None,
        }
    }
}

/// Hysteresis relay controller.
///
/// Inside the dead-band `target ± hysteresis` the previous relay state is
/// kept, so the output only flips once a threshold is actually crossed.
#[derive(Debug, Clone, PartialEq)]
pub struct Thermostat {
    target_temperature: f64,
    hysteresis: f64,
    action: ThermostatAction,
    relay_state: bool,
}

impl Thermostat {
    pub fn new(target_temperature: f64, hysteresis: f64, action: ThermostatAction) -> Self {
        debug_assert!(hysteresis >= 0.0, "hysteresis must not be negative");
        Self {
            target_temperature,
            hysteresis,
            action,
            relay_state: false,
        }
    }

    pub fn from_spec(spec: &ThermostatSpec) -> Self {
        Self::new(spec.target_temperature, spec.hysteresis, spec.action)
    }

    /// Refresh setpoint parameters without touching the relay state.
    pub fn update_parameters(&mut self, spec: &ThermostatSpec) {
        debug_assert!(spec.hysteresis >= 0.0, "hysteresis must not be negative");
        self.target_temperature = spec.target_temperature;
        self.hysteresis = spec.hysteresis;
        self.action = spec.action;
    }

    pub fn compute_state(&mut self, current_temperature: f64) -> bool {
        let upper = self.target_temperature + self.hysteresis;
        let lower = self.target_temperature - self.hysteresis;

        match self.action {
            ThermostatAction::Cooling => {
                if current_temperature >= upper {
                    self.relay_state = true;
                } else if current_temperature <= lower {
                    self.relay_state = false;
                }
            }
            ThermostatAction::Heating => {
                if current_temperature <= lower {
                    self.relay_state = true;
                } else if current_temperature >= upper {
                    self.relay_state = false;
                }
            }
        }

        self.relay_state
    }

    pub fn set_state(&mut self, state: bool) {
        self.relay_state = state;
    }

    pub fn relay_state(&self) -> bool {
        self.relay_state
    }

    pub fn target_temperature(&self) -> f64 {
        self.target_temperature
    }

    pub fn hysteresis(&self) -> f64 {
        self.hysteresis
    }

    pub fn action(&self) -> ThermostatAction {
        self.action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SettingKind;

    fn run(thermostat: &mut Thermostat, temperatures: &[f64]) -> Vec<bool> {
        temperatures
            .iter()
            .map(|temp| thermostat.compute_state(*temp))
            .collect()
    }

    #[test]
    fn cooling_holds_inside_dead_band() {
        let mut thermostat = Thermostat::new(25.0, 1.0, ThermostatAction::Cooling);
        let states = run(&mut thermostat, &[24.0, 26.0, 25.5, 24.2, 23.9]);

        assert_eq!(states, vec![false, true, true, true, false]);
    }

    #[test]
    fn heating_mirrors_cooling() {
        let mut thermostat = Thermostat::new(25.0, 1.0, ThermostatAction::Heating);
        let states = run(&mut thermostat, &[26.0, 24.0, 24.5, 25.8, 26.1]);

        assert_eq!(states, vec![false, true, true, true, false]);
    }

    #[test]
    fn thresholds_are_inclusive() {
        let mut cooling = Thermostat::new(20.0, 0.5, ThermostatAction::Cooling);
        assert!(cooling.compute_state(20.5));
        assert!(!cooling.compute_state(19.5));

        let mut heating = Thermostat::new(20.0, 0.5, ThermostatAction::Heating);
        assert!(heating.compute_state(19.5));
        assert!(!heating.compute_state(20.5));
    }

    #[test]
    fn zero_hysteresis_switches_at_target() {
        let mut thermostat = Thermostat::new(22.0, 0.0, ThermostatAction::Cooling);
        assert!(thermostat.compute_state(22.0));
        assert!(thermostat.compute_state(22.1));
        assert!(!thermostat.compute_state(21.9));
    }

    #[test]
    fn forced_state_is_kept_in_dead_band() {
        let mut thermostat = Thermostat::new(25.0, 1.0, ThermostatAction::Cooling);
        thermostat.set_state(true);

        assert!(thermostat.compute_state(25.0));
        assert!(thermostat.relay_state());
    }

    #[test]
    fn parameter_refresh_keeps_relay_state() {
        let mut thermostat = Thermostat::new(25.0, 1.0, ThermostatAction::Cooling);
        assert!(thermostat.compute_state(27.0));

        let spec = ThermostatSpec {
            kind: SettingKind::Thermostat,
            enabled: true,
            target_temperature: 26.0,
            hysteresis: 2.0,
            sensor: "dht22".to_string(),
            action: ThermostatAction::Cooling,
        };
        thermostat.update_parameters(&spec);

        assert!(thermostat.relay_state());
        assert_eq!(thermostat.target_temperature(), 26.0);
        assert_eq!(thermostat.hysteresis(), 2.0);
        // 25.0 is inside the new band [24, 28], state must hold.
        assert!(thermostat.compute_state(25.0));
        assert!(!thermostat.compute_state(24.0));
    }

    #[test]
    fn action_names_round_trip() {
        for action in [ThermostatAction::Cooling, ThermostatAction::Heating] {
            assert_eq!(ThermostatAction::parse(action.as_str()), Some(action));
        }
        assert_eq!(ThermostatAction::parse("venting"), None);
    }
}
