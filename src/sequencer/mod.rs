//! Acquisition sequencer: compiles exposure steps into an IOTool
//! micro-program and runs it against the camera.
//!
//! A sequence puts the camera in the mode best able to handle fast
//! back-to-back acquisitions with illumination changes between frames:
//! rolling-shutter overlap external-exposure mode, with the IOTool box
//! timing the exposures. Per step, the box triggers an acquisition, waits
//! for every sensor row to be exposing (the camera's FireAll output), holds
//! the requested lamps on for the exposure, switches them off, and triggers
//! the next acquisition. Overlap mode rolls the readout of each frame into
//! the exposure of the next, so dead time is a single frame read.
//!
//! The per-step lamp timing accounts for enable-edge latencies and for the
//! rise/fall ramps, during which the lamp averages half brightness; see
//! [`AcquisitionSequencer::add_step`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::Mutex;
use serde::de::{self, Deserializer, SeqAccess, Visitor};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::camera::driver::FeatureValue;
use crate::camera::{Camera, CameraState};
use crate::config::{LampTiming, ScopeConfig};
use crate::error::{ScopeError, ScopeResult};
use crate::iotool::{commands, IoTool};
use crate::lamps::{LampState, SpectraX, TlLamp};

/// Debounce quantum programmed at the top of every sequence, in us.
const DEBOUNCE_US: u32 = 20;

/// Settle delay between the camera trigger and waiting for FireAll, in ms.
/// The FireAll line can take a moment to clear after the trigger edge.
const FIREALL_CLEAR_MS: f64 = 0.05;

/// Longest delay a single program step may request, in ms.
const MAX_DELAY_MS: f64 = 32767.0;

/// Which illumination a step uses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LampSelection {
    /// The transmitted-light LED.
    TransmittedLight,
    /// One or more Spectra X lamps, by name.
    Fluorescence(BTreeSet<String>),
}

impl Serialize for LampSelection {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            LampSelection::TransmittedLight => serializer.serialize_str("TL"),
            LampSelection::Fluorescence(lamps) => {
                serializer.collect_seq(lamps.iter())
            }
        }
    }
}

impl<'de> Deserialize<'de> for LampSelection {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LampVisitor;

        impl<'de> Visitor<'de> for LampVisitor {
            type Value = LampSelection;

            fn expecting(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str("\"TL\" or a list of fluorescence lamp names")
            }

            fn visit_str<E: de::Error>(self, value: &str) -> Result<Self::Value, E> {
                if value == "TL" {
                    Ok(LampSelection::TransmittedLight)
                } else {
                    Ok(LampSelection::Fluorescence(BTreeSet::from([value
                        .to_string()])))
                }
            }

            fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<Self::Value, A::Error> {
                let mut lamps = BTreeSet::new();
                while let Some(lamp) = seq.next_element::<String>()? {
                    lamps.insert(lamp);
                }
                Ok(LampSelection::Fluorescence(lamps))
            }
        }

        deserializer.deserialize_any(LampVisitor)
    }
}

/// One exposure of a compiled sequence. Immutable once added.
#[derive(Clone, Debug, PartialEq)]
pub struct ExposureStep {
    /// Light delivered to the sample, in ms of full-intensity equivalent.
    pub exposure_ms: f64,
    /// Illumination source(s).
    pub lamp: LampSelection,
    /// TL intensity override (TL steps only).
    pub tl_intensity: Option<u8>,
    /// Extra delay after the lamps are dark, before the next trigger.
    pub delay_after_ms: f64,
    /// Time from lamp-on to lamp-off in the program.
    pub on_delay_ms: f64,
    /// Time from lamp-off to the next trigger, excluding `delay_after_ms`.
    pub off_delay_ms: f64,
}

/// `add_step` arguments of one step, for saving and restoring sequences.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    /// Exposure in ms.
    pub exposure_ms: f64,
    /// Illumination source(s).
    pub lamp: LampSelection,
    /// TL intensity override.
    #[serde(default)]
    pub tl_intensity: Option<u8>,
    /// Post-step delay in ms.
    #[serde(default)]
    pub delay_after_ms: f64,
}

/// A whole sequence as serializable data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SequenceSpec {
    /// Non-default Spectra lamp intensities.
    #[serde(default)]
    pub custom_intensities: BTreeMap<String, u8>,
    /// The steps, in acquisition order.
    pub steps: Vec<StepSpec>,
}

/// Builds and runs hardware-timed acquisition sequences.
pub struct AcquisitionSequencer {
    camera: Arc<Mutex<Camera>>,
    iotool: Arc<Mutex<IoTool>>,
    spectra: Arc<Mutex<SpectraX>>,
    tl_lamp: Arc<Mutex<TlLamp>>,
    config: ScopeConfig,
    lamp_names: BTreeSet<String>,
    steps: Vec<ExposureStep>,
    fl_intensities: BTreeMap<String, u8>,
    compiled: Option<Vec<String>>,
    fire_all_ms: Vec<f64>,
    exposures_ms: Option<Vec<f64>>,
    latest_timestamps: Option<Vec<Option<u64>>>,
    output: Option<String>,
}

impl AcquisitionSequencer {
    /// New sequencer over the scope's devices, starting with an empty
    /// sequence.
    pub fn new(
        camera: Arc<Mutex<Camera>>,
        iotool: Arc<Mutex<IoTool>>,
        spectra: Arc<Mutex<SpectraX>>,
        tl_lamp: Arc<Mutex<TlLamp>>,
        config: ScopeConfig,
    ) -> Self {
        let lamp_names: BTreeSet<String> = spectra.lock().lamp_names().into_iter().collect();
        Self {
            camera,
            iotool,
            spectra,
            tl_lamp,
            config,
            lamp_names,
            steps: Vec::new(),
            fl_intensities: BTreeMap::new(),
            compiled: None,
            fire_all_ms: Vec::new(),
            exposures_ms: None,
            latest_timestamps: None,
            output: None,
        }
    }

    /// Start a new (empty) sequence. `fl_intensities` overrides the
    /// full-brightness default for named Spectra lamps during the run.
    pub fn new_sequence(&mut self, fl_intensities: BTreeMap<String, u8>) -> ScopeResult<()> {
        for lamp in fl_intensities.keys() {
            if !self.lamp_names.contains(lamp) {
                return Err(self.unknown_lamp_error(lamp));
            }
        }
        self.steps.clear();
        self.compiled = None;
        self.fire_all_ms.clear();
        self.fl_intensities = fl_intensities;
        Ok(())
    }

    fn unknown_lamp_error(&self, lamp: &str) -> ScopeError {
        let known: Vec<&str> = self.lamp_names.iter().map(String::as_str).collect();
        ScopeError::Config(format!(
            "unrecognized Spectra lamp name '{lamp}'; valid names are: {}",
            known.join(", ")
        ))
    }

    /// Append one image acquisition to the sequence.
    ///
    /// `exposure_ms` is the light actually delivered: the lamp ramps up and
    /// down during the exposure, and while ramping it averages half
    /// brightness, so the rise and fall together count as
    /// `(rise + fall) / 2` of full-on light. The lamp is therefore held
    /// fully on for `exposure_ms - (rise + fall) / 2`, and an exposure
    /// shorter than that ramp contribution plus the off-latency cannot be
    /// delivered at all.
    ///
    /// The on-delay runs from the enable edge to the disable edge: the
    /// on-latency, the rise, and the full-on time, minus the off-latency
    /// (the lamp stays lit that long after the disable edge anyway). The
    /// off-delay then covers the off-latency and the fall, plus any
    /// requested `delay_after_ms`, before the next trigger fires.
    pub fn add_step(
        &mut self,
        exposure_ms: f64,
        lamp: LampSelection,
        tl_intensity: Option<u8>,
        delay_after_ms: f64,
    ) -> ScopeResult<()> {
        if delay_after_ms < 0.0 {
            return Err(ScopeError::Config("delay_after_ms must be non-negative".into()));
        }
        let timing: LampTiming = match &lamp {
            LampSelection::TransmittedLight => self.config.iotool.tl_timing,
            LampSelection::Fluorescence(lamps) => {
                if tl_intensity.is_some() {
                    return Err(ScopeError::Config(
                        "cannot control TL intensity when the requested lamp is not TL".into(),
                    ));
                }
                if lamps.is_empty() {
                    return Err(ScopeError::Config(
                        "at least one fluorescence lamp must be named".into(),
                    ));
                }
                for name in lamps {
                    if !self.lamp_names.contains(name) {
                        return Err(self.unknown_lamp_error(name));
                    }
                }
                self.config.iotool.spectra_timing
            }
        };

        let half_rise_fall = timing.half_rise_fall_ms();
        let min_exposure = timing.min_exposure_ms();
        if exposure_ms < min_exposure {
            return Err(ScopeError::Config(format!(
                "minimum exposure time given lamp timing data is {min_exposure} ms"
            )));
        }
        let full_on = exposure_ms - half_rise_fall;
        let on_delay_ms = timing.on_latency_ms + timing.rise_ms + full_on - timing.off_latency_ms;
        let off_delay_ms = timing.off_latency_ms + timing.fall_ms;

        self.compiled = None;
        self.steps.push(ExposureStep {
            exposure_ms,
            lamp,
            tl_intensity,
            delay_after_ms,
            on_delay_ms,
            off_delay_ms,
        });
        Ok(())
    }

    /// Number of steps currently in the sequence.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Emit a delay as at most one `delay_ms` plus exactly one `delay_us`.
    ///
    /// The microsecond counter saturates at 32767 and the instructions cost
    /// time themselves: `delay_ms` 15 us and `delay_us` 4 us. For delays
    /// that need the millisecond instruction, one full millisecond is moved
    /// into the microsecond argument as 985 us (+15 us of instruction cost),
    /// which also guarantees the microsecond argument stays >= 4 so its own
    /// cost can be subtracted.
    fn add_delay(&self, delay_ms: f64) -> ScopeResult<Vec<String>> {
        if delay_ms == 0.0 {
            return Ok(Vec::new());
        }
        if !(0.004..=MAX_DELAY_MS).contains(&delay_ms) {
            return Err(ScopeError::Config(format!(
                "program delay of {delay_ms} ms is outside the 0.004..{MAX_DELAY_MS} ms range"
            )));
        }
        let delay_us = (delay_ms * 1000.0) as u32;
        let mut program = Vec::new();
        let us = if delay_us < 32768 {
            delay_us
        } else {
            let ms = delay_us / 1000 - 1;
            program.push(commands::delay_ms(ms));
            delay_us % 1000 + 985
        };
        program.push(commands::delay_us(us - 4));
        Ok(program)
    }

    fn lamp_on_commands(&self, step: &ExposureStep) -> ScopeResult<Vec<String>> {
        match &step.lamp {
            LampSelection::TransmittedLight => self.tl_lamp.lock().iotool_lamp_commands(LampState {
                enabled: Some(true),
                intensity: step.tl_intensity,
            }),
            LampSelection::Fluorescence(lamps) => {
                let request: BTreeMap<String, Option<bool>> =
                    lamps.iter().map(|l| (l.clone(), Some(true))).collect();
                self.spectra.lock().iotool_lamp_commands(&request)
            }
        }
    }

    fn lamp_off_commands(&self, step: &ExposureStep) -> ScopeResult<Vec<String>> {
        match &step.lamp {
            LampSelection::TransmittedLight => self
                .tl_lamp
                .lock()
                .iotool_lamp_commands(LampState::enabled(false)),
            LampSelection::Fluorescence(lamps) => {
                let request: BTreeMap<String, Option<bool>> =
                    lamps.iter().map(|l| (l.clone(), Some(false))).collect();
                self.spectra.lock().iotool_lamp_commands(&request)
            }
        }
    }

    /// Compile the sequence into IOTool byte-code. Pure: nothing is sent to
    /// any device, so a failed compile leaves all hardware untouched.
    fn compile(&mut self) -> ScopeResult<()> {
        if self.compiled.is_some() {
            return Ok(());
        }
        if self.steps.is_empty() {
            return Err(ScopeError::Config(
                "no acquisition steps have been configured".into(),
            ));
        }
        let pins = self.config.iotool.camera_pins.clone();
        let mut program = Vec::new();
        let mut fire_all_ms = Vec::with_capacity(self.steps.len());
        // give wait_high/wait_low a stable signal before acting on it
        program.push(commands::wait_time(DEBOUNCE_US));
        program.push(commands::wait_high(&pins.arm));
        for step in &self.steps {
            program.push(commands::set_high(&pins.trigger));
            program.push(commands::set_low(&pins.trigger));
            program.extend(self.add_delay(FIREALL_CLEAR_MS)?);
            // AuxOut1 is configured as FireAll: high once every row exposes
            program.push(commands::wait_high(&pins.aux_out1));
            program.extend(self.lamp_on_commands(step)?);
            program.extend(self.add_delay(step.on_delay_ms)?);
            program.extend(self.lamp_off_commands(step)?);
            let total_off_delay = step.off_delay_ms + step.delay_after_ms;
            program.extend(self.add_delay(total_off_delay)?);
            fire_all_ms.push(step.on_delay_ms + total_off_delay);
        }
        // one final trigger ends the last exposure
        program.push(commands::set_high(&pins.trigger));
        program.push(commands::set_low(&pins.trigger));

        debug!(steps = self.steps.len(), lines = program.len(), "compiled sequence");
        self.fire_all_ms = fire_all_ms;
        self.compiled = Some(program);
        Ok(())
    }

    /// The compiled IOTool program, compiling first if needed.
    pub fn get_iotool_program(&mut self) -> ScopeResult<Vec<String>> {
        self.compile()?;
        #[allow(clippy::expect_used)] // compile() just filled it
        Ok(self.compiled.clone().expect("sequence compiled"))
    }

    /// Per-step camera FireAll time (lamp window plus trailing delays), in
    /// ms. Adding the frame readout time gives the true sensor exposure.
    pub fn fire_all_times(&mut self) -> ScopeResult<Vec<f64>> {
        self.compile()?;
        Ok(self.fire_all_ms.clone())
    }

    /// The sequence as serializable data.
    pub fn steps(&self) -> SequenceSpec {
        SequenceSpec {
            custom_intensities: self.fl_intensities.clone(),
            steps: self
                .steps
                .iter()
                .map(|step| StepSpec {
                    exposure_ms: step.exposure_ms,
                    lamp: step.lamp.clone(),
                    tl_intensity: step.tl_intensity,
                    delay_after_ms: step.delay_after_ms,
                })
                .collect(),
        }
    }

    /// Replace the sequence from serialized data and compile it.
    pub fn set_steps(&mut self, spec: SequenceSpec) -> ScopeResult<()> {
        self.new_sequence(spec.custom_intensities)?;
        for step in spec.steps {
            self.add_step(
                step.exposure_ms,
                step.lamp,
                step.tl_intensity,
                step.delay_after_ms,
            )?;
        }
        self.compile()
    }

    /// Run the assembled sequence and return the image names, in step
    /// order.
    pub fn run(&mut self) -> ScopeResult<Vec<String>> {
        self.compile()?;
        let num_images = self.steps.len() as u64;

        let safe_images = self.camera.lock().get_safe_image_count_to_queue()?;
        if num_images > safe_images {
            return Err(ScopeError::Config(format!(
                "camera cannot queue more than {safe_images} images in its current state, \
                 {num_images} acquisition steps requested"
            )));
        }

        #[allow(clippy::expect_used)] // compile() just filled it
        let program = self.compiled.clone().expect("sequence compiled");
        self.iotool.lock().store_program(&program)?;

        self.camera.lock().set_io_selector("Aux Out 1")?;

        let mut camera_state = CameraState::new();
        camera_state.insert("overlap_enabled".into(), FeatureValue::Bool(true));
        camera_state.insert(
            "auxiliary_out_source".into(),
            FeatureValue::Enum("FireAll".into()),
        );
        camera_state.insert(
            "selected_io_pin_inverted".into(),
            FeatureValue::Bool(false),
        );
        self.camera.lock().start_image_sequence_acquisition(
            Some(num_images),
            "External Exposure",
            camera_state,
        )?;
        let mut guard = RunGuard {
            camera: self.camera.clone(),
            spectra: self.spectra.clone(),
            tl_lamp: self.tl_lamp.clone(),
            acquisition_started: true,
            spectra_pushed: false,
            tl_pushed: false,
        };

        // park every fluorescence lamp off at its run intensity
        let mut fl_state = BTreeMap::new();
        for lamp in &self.lamp_names {
            let intensity = self.fl_intensities.get(lamp).copied().unwrap_or(255);
            fl_state.insert(lamp.clone(), LampState::full(false, intensity));
        }
        self.spectra.lock().push_state(fl_state)?;
        guard.spectra_pushed = true;

        // TL off, at its current intensity so the pop is a true no-op
        let tl_intensity = self.tl_lamp.lock().get_intensity();
        self.tl_lamp.lock().push_state(LampState::full(false, tl_intensity))?;
        guard.tl_pushed = true;

        // wait out the slower lamp family's off settle
        let settle_ms = self
            .config
            .iotool
            .tl_timing
            .off_settle_ms()
            .max(self.config.iotool.spectra_timing.off_settle_ms());
        thread::sleep(Duration::from_secs_f64(settle_ms / 1000.0));

        // the relevant camera modes are set now, so the readout is final
        let readout_ms = self.camera.lock().get_readout_time()?;
        let exposures: Vec<f64> = self
            .fire_all_ms
            .iter()
            .map(|fire_all| fire_all + readout_ms)
            .collect();

        self.iotool.lock().start_program(1)?;
        info!(images = num_images, "sequence started");

        let mut names = Vec::with_capacity(exposures.len());
        let mut timestamps = Vec::with_capacity(exposures.len());
        for (index, exposure_ms) in exposures.iter().enumerate() {
            let result = self
                .camera
                .lock()
                .next_image_and_metadata(Some(exposure_ms + 1000.0));
            match result {
                Ok((name, timestamp, _frame)) => {
                    names.push(name);
                    timestamps.push(timestamp);
                }
                Err(ScopeError::Camera(e)) if e.is_timeout() => {
                    return Err(ScopeError::AcquisitionTimeout { step: index });
                }
                Err(e) => return Err(e),
            }
        }
        let output = self.iotool.lock().wait_until_done()?;

        self.exposures_ms = Some(exposures);
        self.latest_timestamps = Some(timestamps);
        self.output = Some(output);
        guard.finish()?;
        Ok(names)
    }

    /// Sensor timestamps of the last run, in step order.
    pub fn get_latest_timestamps(&self) -> Option<&[Option<u64>]> {
        self.latest_timestamps.as_deref()
    }

    /// Full per-image sensor exposure times of the last run (FireAll time
    /// plus readout), in ms. This is *longer* than the `exposure_ms` given
    /// to `add_step`; dark-current corrections should use these values.
    pub fn get_exposure_times(&self) -> Option<&[f64]> {
        self.exposures_ms.as_deref()
    }

    /// Serial output the program printed during the last run.
    pub fn get_program_output(&self) -> Option<&str> {
        self.output.as_deref()
    }
}

/// Restores lamp and camera state on every exit path of a run.
struct RunGuard {
    camera: Arc<Mutex<Camera>>,
    spectra: Arc<Mutex<SpectraX>>,
    tl_lamp: Arc<Mutex<TlLamp>>,
    acquisition_started: bool,
    spectra_pushed: bool,
    tl_pushed: bool,
}

impl RunGuard {
    /// Happy-path unwind, propagating restore failures to the caller.
    fn finish(mut self) -> ScopeResult<()> {
        self.unwind()
    }

    fn unwind(&mut self) -> ScopeResult<()> {
        let mut first_error = None;
        if self.tl_pushed {
            self.tl_pushed = false;
            if let Err(e) = self.tl_lamp.lock().pop_state() {
                first_error.get_or_insert(e);
            }
        }
        if self.spectra_pushed {
            self.spectra_pushed = false;
            if let Err(e) = self.spectra.lock().pop_state() {
                first_error.get_or_insert(e);
            }
        }
        if self.acquisition_started {
            self.acquisition_started = false;
            if let Err(e) = self.camera.lock().end_image_sequence_acquisition() {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }
}

impl Drop for RunGuard {
    fn drop(&mut self) {
        if let Err(e) = self.unwind() {
            warn!(error = %e, "error restoring state after aborted sequence run");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::driver::CameraDriver;
    use crate::camera::mock::MockDriver;
    use crate::config::{CameraConfig, IoToolConfig};
    use crate::serial::mock::{MockLink, MockLinkFactory, OpenOutcome};
    use ism_buffer::BufferRegistry;

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

    fn test_spectra(iotool: Arc<Mutex<IoTool>>) -> Arc<Mutex<SpectraX>> {
        let factory = MockLinkFactory::new();
        let link = MockLink::new();
        link.state().lock().push_rx(&[0x14, 0x60]);
        factory.script_open(OpenOutcome::Link(link));
        Arc::new(Mutex::new(
            SpectraX::new(
                &ScopeConfig::default().spectra,
                ScopeConfig::default().iotool.lumencor_pins,
                iotool,
                &factory,
            )
            .expect("spectra init"),
        ))
    }

    struct Rig {
        sequencer: AcquisitionSequencer,
        driver: Arc<MockDriver>,
        iotool_link: MockLink,
        _dir: tempfile::TempDir,
    }

    fn test_rig() -> Rig {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(BufferRegistry::with_dir(dir.path().to_path_buf()));
        let driver = MockDriver::new();
        let camera = Arc::new(Mutex::new(
            Camera::new(driver.clone(), registry, &CameraConfig::default())
                .expect("camera init"),
        ));
        let (iotool, iotool_link) = test_iotool();
        let spectra = test_spectra(iotool.clone());
        let tl_lamp = Arc::new(Mutex::new(
            TlLamp::new(iotool.clone(), ScopeConfig::default().iotool.tl_lamp)
                .expect("tl lamp"),
        ));
        let sequencer =
            AcquisitionSequencer::new(camera, iotool, spectra, tl_lamp, ScopeConfig::default());
        Rig {
            sequencer,
            driver,
            iotool_link,
            _dir: dir,
        }
    }

    fn fluorescence(lamp: &str) -> LampSelection {
        LampSelection::Fluorescence(BTreeSet::from([lamp.to_string()]))
    }

    fn assert_close(actual: f64, expected: f64) {
        assert!(
            (actual - expected).abs() < 1e-9,
            "expected {expected}, got {actual}"
        );
    }

    #[test]
    fn tl_step_delay_arithmetic() {
        let mut rig = test_rig();
        // TL timing: on 0.025, rise 0.06, off 0.06, fall 0.013
        rig.sequencer
            .add_step(50.0, LampSelection::TransmittedLight, Some(128), 0.0)
            .expect("step");
        let step = &rig.sequencer.steps[0];
        assert_close(step.on_delay_ms, 49.9885);
        assert_close(step.off_delay_ms, 0.073);
        let fire_all = rig.sequencer.fire_all_times().expect("fire-all")[0];
        assert_close(fire_all, 50.0615);
    }

    #[test]
    fn spectra_step_delay_arithmetic() {
        let mut rig = test_rig();
        // Spectra timing: on 0.120, rise 0.015, off 0.08, fall 0.010
        rig.sequencer
            .add_step(5.0, fluorescence("cyan"), None, 0.0)
            .expect("step");
        let step = &rig.sequencer.steps[0];
        assert_close(step.on_delay_ms, 5.0425);
        assert_close(step.off_delay_ms, 0.09);
    }

    #[test]
    fn exposure_at_the_lamp_minimum_compiles_and_below_it_fails() {
        let mut rig = test_rig();
        // TL minimum: (rise + fall) / 2 + off_latency = 0.0965 ms
        let half_rise_fall = (0.06 + 0.013) / 2.0;
        let min_exposure = half_rise_fall + 0.06;
        rig.sequencer
            .add_step(min_exposure, LampSelection::TransmittedLight, None, 0.0)
            .expect("at the minimum");
        let step = &rig.sequencer.steps[0];
        // on = on_latency + rise + (min - half_rise_fall) - off_latency
        assert_close(step.on_delay_ms, 0.085);
        assert_close(step.off_delay_ms, 0.073);

        let err = rig
            .sequencer
            .add_step(
                min_exposure - 1e-9,
                LampSelection::TransmittedLight,
                None,
                0.0,
            )
            .expect_err("below the minimum");
        assert!(matches!(err, ScopeError::Config(_)));
    }

    #[test]
    fn tl_intensity_rejected_for_fluorescence_steps() {
        let mut rig = test_rig();
        let err = rig
            .sequencer
            .add_step(5.0, fluorescence("cyan"), Some(100), 0.0)
            .expect_err("TL intensity with a spectra lamp");
        assert!(matches!(err, ScopeError::Config(_)));
    }

    #[test]
    fn unknown_lamp_rejected_with_valid_names() {
        let mut rig = test_rig();
        let err = rig
            .sequencer
            .add_step(5.0, fluorescence("magenta"), None, 0.0)
            .expect_err("unknown lamp");
        assert!(err.to_string().contains("cyan"));
    }

    #[test]
    fn one_millisecond_fits_in_a_single_delay_us() {
        let rig = test_rig();
        let program = rig.sequencer.add_delay(1.0).expect("delay");
        assert_eq!(program, vec!["du 996".to_string()]);
    }

    #[test]
    fn long_delays_split_and_keep_the_us_argument_safe() {
        let rig = test_rig();
        let program = rig.sequencer.add_delay(34.0).expect("delay");
        assert_eq!(program, vec!["dm 33".to_string(), "du 981".to_string()]);
    }

    #[test]
    fn zero_delay_emits_nothing() {
        let rig = test_rig();
        assert!(rig.sequencer.add_delay(0.0).expect("delay").is_empty());
    }

    #[test]
    fn program_shape_has_n_firealls_and_n_plus_one_triggers() {
        let mut rig = test_rig();
        for _ in 0..4 {
            rig.sequencer
                .add_step(5.0, fluorescence("cyan"), None, 0.0)
                .expect("step");
        }
        let program = rig.sequencer.get_iotool_program().expect("program");
        let triggers = program.iter().filter(|line| *line == "sh B0").count();
        let fire_all_waits = program.iter().filter(|line| *line == "wh B2").count();
        assert_eq!(triggers, 5);
        assert_eq!(fire_all_waits, 4);
        // prologue: debounce quantum, then wait for the camera to arm
        assert_eq!(program[0], "wt 20");
        assert_eq!(program[1], "wh B1");
    }

    #[test]
    fn every_emitted_delay_us_is_in_range() {
        let mut rig = test_rig();
        rig.sequencer
            .add_step(5.0, fluorescence("cyan"), None, 2.5)
            .expect("step");
        rig.sequencer
            .add_step(40.0, LampSelection::TransmittedLight, Some(200), 0.0)
            .expect("step");
        let program = rig.sequencer.get_iotool_program().expect("program");
        let mut saw_delay = false;
        for line in &program {
            if let Some(value) = line.strip_prefix("du ") {
                let value: u32 = value.parse().expect("numeric du argument");
                assert!((4..=32767).contains(&value), "du {value} out of range");
                saw_delay = true;
            }
        }
        assert!(saw_delay);
    }

    #[test]
    fn emitted_delays_cover_the_exposure() {
        let mut rig = test_rig();
        rig.sequencer
            .add_step(5.0, fluorescence("cyan"), None, 0.0)
            .expect("step");
        rig.sequencer
            .add_step(50.0, LampSelection::TransmittedLight, None, 1.0)
            .expect("step");
        for step in &rig.sequencer.steps {
            assert!(step.on_delay_ms + step.off_delay_ms >= step.exposure_ms);
        }
    }

    #[test]
    fn sequence_spec_round_trips_through_json() {
        let mut rig = test_rig();
        rig.sequencer
            .new_sequence(BTreeMap::from([("cyan".to_string(), 100u8)]))
            .expect("sequence");
        rig.sequencer
            .add_step(5.0, fluorescence("cyan"), None, 0.0)
            .expect("step");
        rig.sequencer
            .add_step(50.0, LampSelection::TransmittedLight, Some(128), 2.0)
            .expect("step");
        let spec = rig.sequencer.steps();
        let json = serde_json::to_string(&spec).expect("serialize");
        let parsed: SequenceSpec = serde_json::from_str(&json).expect("parse");
        assert_eq!(parsed, spec);

        let mut other = test_rig();
        other.sequencer.set_steps(parsed).expect("restore");
        assert_eq!(other.sequencer.step_count(), 2);
    }

    #[test]
    fn too_many_steps_fail_before_touching_hardware() {
        let mut rig = test_rig();
        let safe = {
            let camera = rig.sequencer.camera.clone();
            let depth = camera.lock().get_safe_image_count_to_queue().expect("depth");
            depth
        };
        for _ in 0..=safe {
            rig.sequencer
                .add_step(5.0, fluorescence("cyan"), None, 0.0)
                .expect("step");
        }
        let err = rig.sequencer.run().expect_err("too many steps");
        let message = err.to_string();
        assert!(message.contains(&safe.to_string()));
        assert!(message.contains(&(safe + 1).to_string()));
        // the camera never started acquiring and no frames were produced
        assert!(!rig.driver.get_bool("CameraAcquiring").expect("read"));
        assert_eq!(rig.driver.frames_produced(), 0);
        // and the program was never stored
        assert!(!rig
            .iotool_link
            .state()
            .lock()
            .written_text()
            .contains("program"));
    }
}
