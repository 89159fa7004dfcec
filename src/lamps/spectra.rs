//! Lumencor Spectra X fluorescence lamp bank.
//!
//! Enable/disable edges are driven by IOTool pins so a stored acquisition
//! program can switch lamps with microsecond timing; intensities go over
//! the Spectra's own serial port using Lumencor's DAC byte protocol. The
//! two GPIO configuration commands below must be issued after every power
//! cycle before the unit accepts anything else.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::info;

use crate::config::SpectraConfig;
use crate::error::{ScopeError, ScopeResult};
use crate::iotool::{commands, IoTool};
use crate::lamps::LampState;
use crate::serial::{LinkFactory, SmartSerial};

/// "Set GPIO0-3 as open drain output"
const GPIO_INIT_1: &[u8] = &[0x57, 0x02, 0xFF, 0x50];
/// "Set GPI05-7 push-pull out, GPIO4 open drain out"
const GPIO_INIT_2: &[u8] = &[0x57, 0x03, 0xAB, 0x50];
/// Temperature query.
const TEMPERATURE_QUERY: &[u8] = &[0x53, 0x91, 0x02, 0x50];

/// DAC routing for each lamp: I2C address and bit within the DAC's enable
/// mask. Fixed by the Spectra X hardware, not by scope wiring.
const LAMP_DAC_ROUTES: &[(&str, u8, u8)] = &[
    ("uv", 0x18, 0),
    ("blue", 0x1A, 0),
    ("cyan", 0x18, 1),
    ("teal", 0x1A, 1),
    ("green_yellow", 0x18, 2),
    ("red", 0x18, 3),
];

/// Peak wavelength and 75%-intensity bandwidth per lamp, in nm.
const LAMP_SPECS: &[(&str, (u16, u16))] = &[
    ("uv", (396, 16)),
    ("blue", (434, 22)),
    ("cyan", (481, 22)),
    ("teal", (508, 29)),
    ("green_yellow", (545, 70)),
    ("red", (633, 19)),
];

fn dac_command(lamp: &str, intensity: u8) -> Option<[u8; 7]> {
    let (_, address, bit) = LAMP_DAC_ROUTES.iter().find(|(name, _, _)| *name == lamp)?;
    // The DAC wants the *inverted* intensity in the middle 8 bits of a
    // 16-bit word, framed by 0xF high nibble and zero low nibble.
    let inverted = u16::from(255 - intensity);
    let word = 0xF000 | (inverted << 4);
    Some([
        0x53,
        *address,
        0x03,
        1 << bit,
        (word >> 8) as u8,
        (word & 0x00FF) as u8,
        0x50,
    ])
}

/// The Spectra X controller.
pub struct SpectraX {
    serial: SmartSerial,
    iotool: Arc<Mutex<IoTool>>,
    /// Lamp name to IOTool enable pin, from scope wiring config.
    pins: BTreeMap<String, String>,
    intensities: BTreeMap<String, u8>,
    enableds: BTreeMap<String, bool>,
    stack: Vec<BTreeMap<String, LampState>>,
}

impl SpectraX {
    /// Open the serial link, run the mandatory GPIO configuration, verify
    /// the unit responds, and park every lamp off at full intensity.
    pub fn new(
        config: &SpectraConfig,
        lamp_pins: BTreeMap<String, String>,
        iotool: Arc<Mutex<IoTool>>,
        factory: &dyn LinkFactory,
    ) -> ScopeResult<Self> {
        for lamp in lamp_pins.keys() {
            if !LAMP_DAC_ROUTES.iter().any(|(name, _, _)| name == lamp) {
                return Err(ScopeError::Config(format!(
                    "'{lamp}' is not a Spectra X lamp"
                )));
            }
        }
        let link = factory.open(&config.serial_port, config.baud_rate)?;
        let mut spectra = Self {
            serial: SmartSerial::new(link, Some(std::time::Duration::from_secs(1))),
            iotool,
            pins: lamp_pins,
            intensities: BTreeMap::new(),
            enableds: BTreeMap::new(),
            stack: Vec::new(),
        };
        spectra.serial.write(GPIO_INIT_1)?;
        spectra.serial.write(GPIO_INIT_2)?;
        match spectra.get_temperature() {
            Ok(celsius) => info!(celsius, "Spectra X responding"),
            Err(ScopeError::SerialTimeout) => {
                return Err(ScopeError::Serial(
                    "could not read data from Spectra X -- is it turned on?".into(),
                ));
            }
            Err(e) => return Err(e),
        }

        let lamps: Vec<String> = spectra.pins.keys().cloned().collect();
        for lamp in &lamps {
            spectra.set_enabled(lamp, false)?;
        }
        for lamp in &lamps {
            spectra.set_intensity(lamp, 255)?;
        }
        Ok(spectra)
    }

    /// Names of the lamps present on this unit.
    pub fn lamp_names(&self) -> Vec<String> {
        self.pins.keys().cloned().collect()
    }

    /// Peak wavelength and bandwidth (nm) for each present lamp.
    pub fn get_lamp_specs(&self) -> BTreeMap<String, (u16, u16)> {
        LAMP_SPECS
            .iter()
            .filter(|(name, _)| self.pins.contains_key(*name))
            .map(|(name, spec)| ((*name).to_string(), *spec))
            .collect()
    }

    fn pin(&self, lamp: &str) -> ScopeResult<&str> {
        self.pins.get(lamp).map(String::as_str).ok_or_else(|| {
            let known = self.lamp_names().join(", ");
            ScopeError::Config(format!(
                "unrecognized Spectra lamp '{lamp}'; valid names are: {known}"
            ))
        })
    }

    /// IOTool commands enabling/disabling the given lamps (`None` entries
    /// are skipped).
    pub fn iotool_lamp_commands(
        &self,
        lamps: &BTreeMap<String, Option<bool>>,
    ) -> ScopeResult<Vec<String>> {
        let mut program = Vec::new();
        for (lamp, enabled) in lamps {
            let Some(enabled) = enabled else { continue };
            let pin = self.pin(lamp)?;
            program.push(if *enabled {
                commands::set_high(pin)
            } else {
                commands::set_low(pin)
            });
        }
        Ok(program)
    }

    /// Switch one lamp's enable line now.
    pub fn set_enabled(&mut self, lamp: &str, enabled: bool) -> ScopeResult<()> {
        let mut request = BTreeMap::new();
        request.insert(lamp.to_string(), Some(enabled));
        let program = self.iotool_lamp_commands(&request)?;
        self.iotool.lock().execute(&program)?;
        self.enableds.insert(lamp.to_string(), enabled);
        Ok(())
    }

    /// Whether a lamp is enabled.
    pub fn get_enabled(&self, lamp: &str) -> ScopeResult<bool> {
        self.pin(lamp)?;
        Ok(self.enableds.get(lamp).copied().unwrap_or(false))
    }

    /// Set one lamp's intensity over the serial DAC protocol.
    pub fn set_intensity(&mut self, lamp: &str, intensity: u8) -> ScopeResult<()> {
        self.pin(lamp)?;
        let command = dac_command(lamp, intensity)
            .ok_or_else(|| ScopeError::Config(format!("no DAC route for lamp '{lamp}'")))?;
        self.serial.write(&command)?;
        self.intensities.insert(lamp.to_string(), intensity);
        Ok(())
    }

    /// Current intensity of a lamp.
    pub fn get_intensity(&self, lamp: &str) -> ScopeResult<u8> {
        self.pin(lamp)?;
        Ok(self.intensities.get(lamp).copied().unwrap_or(255))
    }

    /// Read the head temperature in Celsius.
    pub fn get_temperature(&mut self) -> ScopeResult<f64> {
        self.serial.write(TEMPERATURE_QUERY)?;
        let reply = self.serial.read_exact(2)?;
        Ok(f64::from((u16::from(reply[0]) << 3) | (u16::from(reply[1]) >> 5)) * 0.125)
    }

    fn apply(&mut self, state: &BTreeMap<String, LampState>) -> ScopeResult<()> {
        for (lamp, lamp_state) in state {
            if let Some(intensity) = lamp_state.intensity {
                self.set_intensity(lamp, intensity)?;
            }
            if let Some(enabled) = lamp_state.enabled {
                self.set_enabled(lamp, enabled)?;
            }
        }
        Ok(())
    }

    /// Save the current values of every field named in `state`, then apply
    /// it.
    pub fn push_state(&mut self, state: BTreeMap<String, LampState>) -> ScopeResult<()> {
        let mut old_state = BTreeMap::new();
        for (lamp, lamp_state) in &state {
            self.pin(lamp)?;
            let old = LampState {
                enabled: lamp_state.enabled.map(|_| self.get_enabled(lamp)).transpose()?,
                intensity: lamp_state
                    .intensity
                    .map(|_| self.get_intensity(lamp))
                    .transpose()?,
            };
            old_state.insert(lamp.clone(), old);
        }
        // the snapshot stays on the stack even if applying fails partway
        self.stack.push(old_state);
        self.apply(&state)
    }

    /// Restore the most recently pushed lamp state.
    pub fn pop_state(&mut self) -> ScopeResult<()> {
        let old_state = self
            .stack
            .pop()
            .ok_or_else(|| ScopeError::Config("Spectra state stack is empty".into()))?;
        if let Err(e) = self.apply(&old_state) {
            self.stack.push(old_state);
            return Err(e);
        }
        Ok(())
    }
}
