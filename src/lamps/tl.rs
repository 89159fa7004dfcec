//! Transmitted-light LED lamp.
//!
//! The LED is wired directly to the IOTool box: one enable line and one PWM
//! line for intensity. Everything happens through IOTool commands, either
//! executed immediately or spliced into a stored acquisition program.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::TlLampPins;
use crate::error::{ScopeError, ScopeResult};
use crate::iotool::{commands, IoTool};
use crate::lamps::LampState;

/// The transmitted-light LED.
pub struct TlLamp {
    iotool: Arc<Mutex<IoTool>>,
    pins: TlLampPins,
    enabled: bool,
    intensity: u8,
    stack: Vec<LampState>,
}

impl TlLamp {
    /// Bring the lamp to a known state: off, full intensity.
    pub fn new(iotool: Arc<Mutex<IoTool>>, pins: TlLampPins) -> ScopeResult<Self> {
        let mut lamp = Self {
            iotool,
            pins,
            enabled: false,
            intensity: 255,
            stack: Vec::new(),
        };
        let initial = LampState::full(false, lamp.pins.pwm_max);
        lamp.apply(initial)?;
        Ok(lamp)
    }

    /// IOTool commands that bring the lamp to `state`. Intensity is applied
    /// before the enable edge so a lamp never flashes at a stale duty.
    pub fn iotool_lamp_commands(&self, state: LampState) -> ScopeResult<Vec<String>> {
        let mut program = Vec::new();
        if let Some(intensity) = state.intensity {
            if intensity > self.pins.pwm_max {
                return Err(ScopeError::Config(format!(
                    "TL intensity {intensity} exceeds PWM maximum {}",
                    self.pins.pwm_max
                )));
            }
            program.push(commands::pwm(&self.pins.pwm_pin, intensity));
        }
        if let Some(enabled) = state.enabled {
            program.push(if enabled {
                commands::set_high(&self.pins.enable_pin)
            } else {
                commands::set_low(&self.pins.enable_pin)
            });
        }
        Ok(program)
    }

    fn apply(&mut self, state: LampState) -> ScopeResult<()> {
        let program = self.iotool_lamp_commands(state)?;
        if !program.is_empty() {
            self.iotool.lock().execute(&program)?;
        }
        if let Some(enabled) = state.enabled {
            self.enabled = enabled;
        }
        if let Some(intensity) = state.intensity {
            self.intensity = intensity;
        }
        Ok(())
    }

    /// Turn the lamp on or off.
    pub fn set_enabled(&mut self, enabled: bool) -> ScopeResult<()> {
        self.apply(LampState::enabled(enabled))
    }

    /// Whether the lamp is on.
    pub fn get_enabled(&self) -> bool {
        self.enabled
    }

    /// Set intensity (0 = dark, `pwm_max` = brightest).
    pub fn set_intensity(&mut self, intensity: u8) -> ScopeResult<()> {
        self.apply(LampState::intensity(intensity))
    }

    /// Current intensity.
    pub fn get_intensity(&self) -> u8 {
        self.intensity
    }

    /// Save the current values of the fields named in `state`, then apply
    /// it. Unlike most devices this pushes even a state identical to the
    /// current one: a stored IOTool program may change the lamp behind our
    /// back, and the stack entry is what restores it afterwards.
    pub fn push_state(&mut self, state: LampState) -> ScopeResult<()> {
        let old = LampState {
            enabled: state.enabled.map(|_| self.enabled),
            intensity: state.intensity.map(|_| self.intensity),
        };
        // the snapshot stays on the stack even if applying fails partway:
        // whatever did change still needs restoring
        self.stack.push(old);
        self.apply(state)
    }

    /// Restore the most recently pushed state.
    pub fn pop_state(&mut self) -> ScopeResult<()> {
        let old = self
            .stack
            .pop()
            .ok_or_else(|| ScopeError::Config("TL lamp state stack is empty".into()))?;
        if let Err(e) = self.apply(old) {
            self.stack.push(old);
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IoToolConfig;
    use crate::serial::mock::{MockLink, MockLinkFactory, OpenOutcome};

    fn test_iotool() -> (Arc<Mutex<IoTool>>, MockLink) {
        let factory = MockLinkFactory::new();
        let session = MockLink::new();
        session
            .state()
            .lock()
            .responses
            .push_back(b"\x80\xff\r\n>".to_vec());
        factory.script_open(OpenOutcome::Link(MockLink::new()));
        factory.script_open(OpenOutcome::Link(session.clone()));
        let iotool =
            IoTool::new(IoToolConfig::default(), Box::new(factory)).expect("iotool reset");
        (Arc::new(Mutex::new(iotool)), session)
    }

    #[test]
    fn construction_parks_the_lamp_dark_at_full_duty() {
        let (iotool, session) = test_iotool();
        let lamp = TlLamp::new(iotool, TlLampPins::default()).expect("lamp");
        assert!(!lamp.get_enabled());
        assert_eq!(lamp.get_intensity(), 255);
        let written = session.state().lock().written_text();
        assert!(written.contains("pm D0 255"));
        assert!(written.contains("sl E6"));
    }

    #[test]
    fn command_generation_orders_pwm_before_enable() {
        let (iotool, _session) = test_iotool();
        let lamp = TlLamp::new(iotool, TlLampPins::default()).expect("lamp");
        let program = lamp
            .iotool_lamp_commands(LampState::full(true, 128))
            .expect("commands");
        assert_eq!(program, vec!["pm D0 128".to_string(), "sh E6".to_string()]);
    }

    #[test]
    fn push_pop_round_trips_lamp_state() {
        let (iotool, _session) = test_iotool();
        let mut lamp = TlLamp::new(iotool, TlLampPins::default()).expect("lamp");
        lamp.set_intensity(40).expect("set");
        lamp.push_state(LampState::full(true, 200)).expect("push");
        assert!(lamp.get_enabled());
        assert_eq!(lamp.get_intensity(), 200);
        lamp.pop_state().expect("pop");
        assert!(!lamp.get_enabled());
        assert_eq!(lamp.get_intensity(), 40);
    }

    #[test]
    fn identical_state_still_pushes() {
        let (iotool, _session) = test_iotool();
        let mut lamp = TlLamp::new(iotool, TlLampPins::default()).expect("lamp");
        lamp.push_state(LampState::enabled(false)).expect("push");
        lamp.pop_state().expect("pop");
        assert!(lamp.pop_state().is_err());
    }
}
