//! Scope configuration using Figment.
//!
//! Strongly-typed configuration for the acquisition engine, loaded from:
//! 1. `scope.toml` (base configuration)
//! 2. Environment variables (prefixed with `SCOPE_`)
//!
//! The defaults describe the reference instrument (Andor Zyla 5.5 over USB3,
//! IOTool box on `/dev/ttyIOTool`, Lumencor Spectra X on `/dev/ttySpectra`)
//! so an empty file is a valid configuration. Hardware-calibration values
//! live here rather than in code: lamp timing records, IOTool pin
//! assignments, and the per-camera-model safe-queue-depth fit.

use std::collections::BTreeMap;
use std::path::Path;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::error::{ScopeError, ScopeResult};

/// Top-level configuration for the acquisition engine.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScopeConfig {
    /// Camera model and queue-depth calibration.
    #[serde(default)]
    pub camera: CameraConfig,
    /// IOTool serial link, pin assignments, and lamp timing.
    #[serde(default)]
    pub iotool: IoToolConfig,
    /// Spectra X lamp controller serial link.
    #[serde(default)]
    pub spectra: SpectraConfig,
}

impl ScopeConfig {
    /// Load from `scope.toml` in the working directory plus `SCOPE_`
    /// environment overrides.
    pub fn load() -> ScopeResult<Self> {
        Self::load_from("scope.toml")
    }

    /// Load from an explicit TOML path plus `SCOPE_` environment overrides.
    pub fn load_from<P: AsRef<Path>>(path: P) -> ScopeResult<Self> {
        let config: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SCOPE_").split("__"))
            .extract()?;
        config.validate()?;
        Ok(config)
    }

    /// Semantic validation beyond what deserialization enforces.
    pub fn validate(&self) -> ScopeResult<()> {
        if self.iotool.lumencor_pins.is_empty() {
            return Err(ScopeError::Config(
                "at least one fluorescence lamp pin must be configured".into(),
            ));
        }
        for (name, timing) in [
            ("iotool.tl_timing", &self.iotool.tl_timing),
            ("iotool.spectra_timing", &self.iotool.spectra_timing),
        ] {
            if timing.on_latency_ms < 0.0
                || timing.rise_ms < 0.0
                || timing.off_latency_ms < 0.0
                || timing.fall_ms < 0.0
            {
                return Err(ScopeError::Config(format!(
                    "{name}: lamp timing values must be non-negative"
                )));
            }
        }
        if self.camera.queue_model.ram_line_constant == 0 {
            return Err(ScopeError::Config(
                "camera.queue_model.ram_line_constant must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Camera model selection and per-model calibration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraConfig {
    /// Vendor model string passed to the driver at initialization.
    #[serde(default = "default_camera_model")]
    pub model: String,
    /// Calibration of the on-head RAM queue-depth formula.
    #[serde(default)]
    pub queue_model: QueueModel,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            model: default_camera_model(),
            queue_model: QueueModel::default(),
        }
    }
}

fn default_camera_model() -> String {
    "ZYLA-5.5-USB3".to_string()
}

/// Empirical fit for how many frames the camera head can hold without
/// dropping. The fit is per-model; these defaults describe the Zyla 5.5,
/// whose per-half-sensor RAM gives `ram_line_constant / lines + margin`
/// frames, where `lines` is the larger AOI extent above or below
/// `midline_row`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueModel {
    /// Sensor row index separating the two readout halves.
    #[serde(default = "default_midline_row")]
    pub midline_row: u32,
    /// Fitted RAM constant (frames x lines).
    #[serde(default = "default_ram_line_constant")]
    pub ram_line_constant: u32,
    /// Additive frame count. The raw fit gives 29; 20 leaves a safety factor.
    #[serde(default = "default_queue_margin")]
    pub margin: u32,
}

impl Default for QueueModel {
    fn default() -> Self {
        Self {
            midline_row: default_midline_row(),
            ram_line_constant: default_ram_line_constant(),
            margin: default_queue_margin(),
        }
    }
}

fn default_midline_row() -> u32 {
    1080
}

fn default_ram_line_constant() -> u32 {
    126_464
}

fn default_queue_margin() -> u32 {
    20
}

/// IOTool box link and wiring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IoToolConfig {
    /// Serial device node. The device re-enumerates on reset, so this path
    /// is also polled for re-appearance.
    #[serde(default = "default_iotool_port")]
    pub serial_port: String,
    /// Communication speed.
    #[serde(default = "default_iotool_baud")]
    pub baud_rate: u32,
    /// Camera handshake pins.
    #[serde(default)]
    pub camera_pins: CameraPins,
    /// Transmitted-light LED wiring.
    #[serde(default)]
    pub tl_lamp: TlLampPins,
    /// Fluorescence lamp name to enable-pin map.
    #[serde(default = "default_lumencor_pins")]
    pub lumencor_pins: BTreeMap<String, String>,
    /// Transmitted-light LED response timing.
    #[serde(default = "default_tl_timing")]
    pub tl_timing: LampTiming,
    /// Spectra X lamp response timing. These depend strongly on how recently
    /// the lamp was last lit; the defaults assume roughly 5 s between uses.
    #[serde(default = "default_spectra_timing")]
    pub spectra_timing: LampTiming,
}

impl Default for IoToolConfig {
    fn default() -> Self {
        Self {
            serial_port: default_iotool_port(),
            baud_rate: default_iotool_baud(),
            camera_pins: CameraPins::default(),
            tl_lamp: TlLampPins::default(),
            lumencor_pins: default_lumencor_pins(),
            tl_timing: default_tl_timing(),
            spectra_timing: default_spectra_timing(),
        }
    }
}

fn default_iotool_port() -> String {
    "/dev/ttyIOTool".to_string()
}

fn default_iotool_baud() -> u32 {
    115_200
}

fn default_lumencor_pins() -> BTreeMap<String, String> {
    [
        ("uv", "D6"),
        ("blue", "D5"),
        ("cyan", "D3"),
        ("teal", "D4"),
        ("green_yellow", "D2"),
        ("red", "D1"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

fn default_tl_timing() -> LampTiming {
    LampTiming {
        on_latency_ms: 0.025,
        rise_ms: 0.06,
        off_latency_ms: 0.06,
        fall_ms: 0.013,
        settle_ms: None,
    }
}

fn default_spectra_timing() -> LampTiming {
    LampTiming {
        on_latency_ms: 0.120,
        rise_ms: 0.015,
        off_latency_ms: 0.08,
        fall_ms: 0.010,
        settle_ms: None,
    }
}

/// Digital lines between the IOTool box and the camera.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CameraPins {
    /// Output driving the camera trigger input.
    #[serde(default = "default_trigger_pin")]
    pub trigger: String,
    /// Input reading the camera Arm output.
    #[serde(default = "default_arm_pin")]
    pub arm: String,
    /// Input reading the camera AuxOut1 output (configured as FireAll).
    #[serde(default = "default_aux_out1_pin")]
    pub aux_out1: String,
}

impl Default for CameraPins {
    fn default() -> Self {
        Self {
            trigger: default_trigger_pin(),
            arm: default_arm_pin(),
            aux_out1: default_aux_out1_pin(),
        }
    }
}

fn default_trigger_pin() -> String {
    "B0".to_string()
}

fn default_arm_pin() -> String {
    "B1".to_string()
}

fn default_aux_out1_pin() -> String {
    "B2".to_string()
}

/// Transmitted-light LED wiring on the IOTool box.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TlLampPins {
    /// Lamp enable line.
    #[serde(default = "default_tl_enable_pin")]
    pub enable_pin: String,
    /// PWM intensity line.
    #[serde(default = "default_tl_pwm_pin")]
    pub pwm_pin: String,
    /// Maximum PWM duty value.
    #[serde(default = "default_tl_pwm_max")]
    pub pwm_max: u8,
}

impl Default for TlLampPins {
    fn default() -> Self {
        Self {
            enable_pin: default_tl_enable_pin(),
            pwm_pin: default_tl_pwm_pin(),
            pwm_max: default_tl_pwm_max(),
        }
    }
}

fn default_tl_enable_pin() -> String {
    "E6".to_string()
}

fn default_tl_pwm_pin() -> String {
    "D0".to_string()
}

fn default_tl_pwm_max() -> u8 {
    255
}

/// Spectra X controller serial link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectraConfig {
    /// Serial device node.
    #[serde(default = "default_spectra_port")]
    pub serial_port: String,
    /// Communication speed.
    #[serde(default = "default_spectra_baud")]
    pub baud_rate: u32,
}

impl Default for SpectraConfig {
    fn default() -> Self {
        Self {
            serial_port: default_spectra_port(),
            baud_rate: default_spectra_baud(),
        }
    }
}

fn default_spectra_port() -> String {
    "/dev/ttySpectra".to_string()
}

fn default_spectra_baud() -> u32 {
    9600
}

/// Response timing of a lamp family to its enable/disable edges, all in
/// milliseconds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LampTiming {
    /// Time from the enable edge to the start of the intensity rise.
    pub on_latency_ms: f64,
    /// Time from the start of the rise to full intensity.
    pub rise_ms: f64,
    /// Time from the disable edge to the start of the fall.
    pub off_latency_ms: f64,
    /// Time from the start of the fall to dark.
    pub fall_ms: f64,
    /// Optional override for how long to wait for the lamp to be fully dark,
    /// for hardware (e.g. paddle-filter Spectra units) whose off behavior is
    /// not captured by the latency/fall pair. When unset, latency + fall is
    /// used.
    #[serde(default)]
    pub settle_ms: Option<f64>,
}

impl LampTiming {
    /// Equivalent full-intensity time contributed by the rising and falling
    /// edges together: during rise and fall the lamp averages half
    /// brightness.
    pub fn half_rise_fall_ms(&self) -> f64 {
        (self.rise_ms + self.fall_ms) / 2.0
    }

    /// Shortest exposure this lamp can deliver.
    pub fn min_exposure_ms(&self) -> f64 {
        self.half_rise_fall_ms() + self.off_latency_ms
    }

    /// Time from the disable edge until the lamp is fully dark.
    pub fn off_settle_ms(&self) -> f64 {
        self.settle_ms
            .unwrap_or(self.off_latency_ms + self.fall_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_describe_the_reference_instrument() {
        let config = ScopeConfig::default();
        assert_eq!(config.camera.model, "ZYLA-5.5-USB3");
        assert_eq!(config.iotool.camera_pins.trigger, "B0");
        assert_eq!(config.iotool.lumencor_pins["cyan"], "D3");
        assert_eq!(config.camera.queue_model.ram_line_constant, 126_464);
        config.validate().expect("defaults validate");
    }

    #[test]
    fn lamp_timing_derivations() {
        let timing = default_tl_timing();
        assert!((timing.half_rise_fall_ms() - 0.0365).abs() < 1e-12);
        assert!((timing.min_exposure_ms() - 0.0965).abs() < 1e-12);
        assert!((timing.off_settle_ms() - 0.073).abs() < 1e-12);
    }

    #[test]
    fn settle_override_wins() {
        let mut timing = default_spectra_timing();
        timing.settle_ms = Some(5.0);
        assert!((timing.off_settle_ms() - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn toml_fragment_overrides_defaults() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "scope.toml",
                r#"
                [camera]
                model = "SONA-4BV11"

                [camera.queue_model]
                midline_row = 1024
                ram_line_constant = 90000
                margin = 10
                "#,
            )?;
            let config = ScopeConfig::load_from("scope.toml").expect("load");
            assert_eq!(config.camera.model, "SONA-4BV11");
            assert_eq!(config.camera.queue_model.midline_row, 1024);
            // untouched sections keep defaults
            assert_eq!(config.iotool.serial_port, "/dev/ttyIOTool");
            Ok(())
        });
    }

    #[test]
    fn negative_lamp_timing_rejected() {
        let mut config = ScopeConfig::default();
        config.iotool.tl_timing.rise_ms = -1.0;
        assert!(config.validate().is_err());
    }
}
