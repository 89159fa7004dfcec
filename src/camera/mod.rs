//! Camera core: typed feature access, the state stack, acquisition
//! pipelines, and live imaging.
//!
//! Wraps a [`CameraDriver`] (the real vendor SDK binding or the in-crate
//! mock) and layers on what the rest of the engine needs:
//!
//! - typed getters/setters generated from the declarative feature table,
//!   with live mode paused around writes that require it;
//! - a LIFO state stack whose push/pop ordering respects the dependencies
//!   between trigger mode, overlap, frame count, and frame rate;
//! - AOI updates applied in an order that never transits an illegal state;
//! - fixed-count and continuous acquisition with eagerly queued buffers and
//!   per-frame timestamp extraction;
//! - software-triggered live imaging on a pair of background threads.
//!
//! Every retrieved frame lands in a named shared-memory buffer and is
//! announced to subscribers by a monotonically increasing frame number.

pub mod buffers;
pub mod driver;
pub mod live;
pub mod mock;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use ism_buffer::{BufferRegistry, IsmArray};
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::config::{CameraConfig, QueueModel};
use crate::error::{ScopeError, ScopeResult};
use buffers::BufferFactory;
use driver::{
    feature_by_name, CameraDriver, CameraError, ErrorCode, FeatureDecl, FeatureType, FeatureValue,
    CAMERA_FEATURES, FRAME_RATE_RANGE_AFFECTING, HIDDEN_DEFAULTS,
};
use live::LiveMode;

/// Cap on how much camera RAM worth of buffers is queued ahead of time.
const EAGER_QUEUE_BYTES: u64 = 1 << 30;

/// Update broadcast to camera subscribers.
#[derive(Clone, Debug)]
pub enum CameraEvent {
    /// A new frame was retrieved; payload is its frame number.
    FrameNumber(i64),
    /// A feature changed; `None` means the feature is currently unreadable.
    Feature {
        /// Engine-facing feature name.
        name: String,
        /// New value, if readable.
        value: Option<FeatureValue>,
    },
    /// Periodic sensor temperature report, in Celsius.
    Temperature(f64),
    /// Live mode was switched on or off.
    LiveMode(bool),
}

/// A set of named camera settings, as pushed onto the state stack. The key
/// `"live_mode"` (Bool) is handled by the camera itself; every other key
/// names a row of the feature table, valued in driver units.
pub type CameraState = BTreeMap<String, FeatureValue>;

/// Snapshot of pre-change values; `None` marks a feature that was unreadable
/// at push time and is skipped on restore.
type StateSnapshot = BTreeMap<String, Option<FeatureValue>>;

/// Partial AOI update; omitted components are left unchanged.
#[derive(Clone, Copy, Debug, Default)]
pub struct Aoi {
    /// 1-based left column.
    pub left: Option<i64>,
    /// 1-based top row.
    pub top: Option<i64>,
    /// Width in columns.
    pub width: Option<i64>,
    /// Height in rows.
    pub height: Option<i64>,
}

/// The most recently retrieved frame.
#[derive(Clone)]
pub struct LatestImage {
    /// Shared-buffer name.
    pub name: String,
    /// The image itself.
    pub array: Arc<IsmArray>,
    /// Session-scoped frame number.
    pub frame_number: i64,
    /// Sensor-clock ticks, when the metadata trailer carried them.
    pub timestamp: Option<u64>,
}

fn read_feature(driver: &dyn CameraDriver, decl: &FeatureDecl) -> Option<FeatureValue> {
    // Reads legitimately fail for state-dependent features (e.g. FrameCount
    // while cycling continuously); None marks "not applicable right now".
    match decl.ty {
        FeatureType::Int => driver.get_int(decl.driver_name).ok().map(FeatureValue::Int),
        FeatureType::Float => driver
            .get_float(decl.driver_name)
            .ok()
            .map(FeatureValue::Float),
        FeatureType::Bool => driver
            .get_bool(decl.driver_name)
            .ok()
            .map(FeatureValue::Bool),
        FeatureType::Str => driver
            .get_string(decl.driver_name)
            .ok()
            .map(FeatureValue::Str),
        FeatureType::Enum => {
            let index = driver.enum_index(decl.driver_name).ok()?;
            driver
                .enum_string_by_index(decl.driver_name, index)
                .ok()
                .map(FeatureValue::Enum)
        }
    }
}

struct TempPoller {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl TempPoller {
    fn stop(&mut self) {
        self.running.store(false, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// The camera core.
pub struct Camera {
    driver: Arc<dyn CameraDriver>,
    registry: Arc<BufferRegistry>,
    queue_model: QueueModel,
    state_stack: Vec<StateSnapshot>,
    live: Option<LiveMode>,
    /// Cycle/trigger values to restore when live mode ends; kept off the
    /// shared state stack (see `enable_live`).
    live_restore: Option<StateSnapshot>,
    latest: Arc<Mutex<Option<LatestImage>>>,
    frame_number: Arc<AtomicI64>,
    events: broadcast::Sender<CameraEvent>,
    factory: Option<BufferFactory>,
    temp_poller: Option<TempPoller>,
}

impl Camera {
    /// Wrap a driver, register feature-change callbacks, and return the
    /// camera in its default baseline state.
    pub fn new(
        driver: Arc<dyn CameraDriver>,
        registry: Arc<BufferRegistry>,
        config: &CameraConfig,
    ) -> ScopeResult<Self> {
        let (events, _) = broadcast::channel(1024);
        let mut camera = Self {
            driver: driver.clone(),
            registry,
            queue_model: config.queue_model.clone(),
            state_stack: Vec::new(),
            live: None,
            live_restore: None,
            latest: Arc::new(Mutex::new(None)),
            frame_number: Arc::new(AtomicI64::new(-1)),
            events: events.clone(),
            factory: None,
            temp_poller: None,
        };

        for decl in CAMERA_FEATURES {
            // weak: the driver stores these callbacks, so a strong reference
            // here would cycle and keep the handle alive past teardown
            let callback_driver = Arc::downgrade(&driver);
            let callback_events = events.clone();
            driver.register_feature_callback(
                decl.driver_name,
                Box::new(move |_feature| {
                    let Some(driver) = callback_driver.upgrade() else {
                        return;
                    };
                    let value = read_feature(driver.as_ref(), decl);
                    let _ = callback_events.send(CameraEvent::Feature {
                        name: decl.name.to_string(),
                        value,
                    });
                }),
            )?;
        }

        camera.return_to_default_state()?;
        info!(model = %config.model, "camera initialized");
        Ok(camera)
    }

    /// Subscribe to frame-number, feature, and temperature updates.
    pub fn subscribe(&self) -> broadcast::Receiver<CameraEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------------------------
    // Feature access
    // ------------------------------------------------------------------

    fn decl(name: &str) -> ScopeResult<&'static FeatureDecl> {
        feature_by_name(name)
            .ok_or_else(|| ScopeError::Config(format!("unknown camera feature '{name}'")))
    }

    /// Current value of a feature; `None` when the feature does not apply in
    /// the current camera state.
    pub fn get_feature(&self, name: &str) -> ScopeResult<Option<FeatureValue>> {
        let decl = Self::decl(name)?;
        Ok(read_feature(self.driver.as_ref(), decl))
    }

    /// Current legal range of a numeric feature.
    pub fn get_feature_range(&self, name: &str) -> ScopeResult<(f64, f64)> {
        let decl = Self::decl(name)?;
        match decl.ty {
            FeatureType::Int => {
                let (min, max) = self.driver.int_range(decl.driver_name)?;
                Ok((min as f64, max as f64))
            }
            FeatureType::Float => Ok(self.driver.float_range(decl.driver_name)?),
            _ => Err(ScopeError::Config(format!("feature '{name}' has no range"))),
        }
    }

    /// For an enum feature: every implemented value and whether it can be
    /// selected in the current camera state.
    pub fn get_feature_values(&self, name: &str) -> ScopeResult<BTreeMap<String, bool>> {
        let decl = Self::decl(name)?;
        if decl.ty != FeatureType::Enum {
            return Err(ScopeError::Config(format!("feature '{name}' is not an enum")));
        }
        let mut values = BTreeMap::new();
        let count = self.driver.enum_count(decl.driver_name)?;
        for index in 0..count {
            if !self.driver.is_enum_index_implemented(decl.driver_name, index)? {
                continue;
            }
            let value = self.driver.enum_string_by_index(decl.driver_name, index)?;
            let available = self.driver.is_enum_index_available(decl.driver_name, index)?;
            values.insert(value, available);
        }
        Ok(values)
    }

    /// Write a feature. Numeric and boolean writes pause live mode around
    /// the write when it is running; enum selection is applied directly.
    pub fn set_feature(&mut self, name: &str, value: FeatureValue) -> ScopeResult<()> {
        let decl = Self::decl(name)?;
        if decl.readonly {
            return Err(CameraError::new(ErrorCode::NotWritable, decl.driver_name).into());
        }
        match decl.ty {
            FeatureType::Enum => self.write_feature_raw(decl, &value),
            _ => {
                let mut guard = CameraState::new();
                guard.insert("live_mode".into(), FeatureValue::Bool(false));
                self.push_state(guard)?;
                let result = self.write_feature_raw(decl, &value);
                let pop = self.pop_state();
                result.and(pop)
            }
        }
    }

    fn write_feature_raw(&mut self, decl: &FeatureDecl, value: &FeatureValue) -> ScopeResult<()> {
        match (decl.ty, value) {
            (FeatureType::Int, FeatureValue::Int(v)) => {
                self.driver.set_int(decl.driver_name, *v)?;
            }
            (FeatureType::Float, FeatureValue::Float(v)) => {
                self.driver.set_float(decl.driver_name, *v)?;
            }
            (FeatureType::Bool, FeatureValue::Bool(v)) => {
                self.driver.set_bool(decl.driver_name, *v)?;
            }
            (FeatureType::Enum, FeatureValue::Enum(v)) => {
                self.driver.set_enum_string(decl.driver_name, v)?;
            }
            _ => {
                return Err(ScopeError::Config(format!(
                    "feature '{}' cannot take value {value:?}",
                    decl.name
                )));
            }
        }
        self.maybe_update_frame_rate(decl.driver_name);
        Ok(())
    }

    /// When a write may have shifted the frame-rate range, pin the frame
    /// rate to the new maximum (when the camera allows writing it at all).
    fn maybe_update_frame_rate(&self, driver_feature: &str) {
        if !FRAME_RATE_RANGE_AFFECTING.contains(&driver_feature) {
            return;
        }
        let Ok((_, max)) = self.driver.float_range("FrameRate") else {
            return;
        };
        if self.driver.is_writable("FrameRate").unwrap_or(false) {
            if let Err(e) = self.driver.set_float("FrameRate", max) {
                debug!(error = %e, "could not pin frame rate to range max");
            }
        }
    }

    // ------------------------------------------------------------------
    // State stack
    // ------------------------------------------------------------------

    fn current_value(&self, key: &str) -> ScopeResult<Option<FeatureValue>> {
        if key == "live_mode" {
            return Ok(Some(FeatureValue::Bool(self.live.is_some())));
        }
        self.get_feature(key)
    }

    fn push_weight(key: &str, state: &CameraState) -> i32 {
        match key {
            "frame_count" => 1,
            "trigger_mode" => 2,
            "overlap_enabled" => 3,
            "frame_rate" => 4,
            "live_mode" => {
                // turning live on happens last; turning it off happens first
                if state
                    .get("live_mode")
                    .and_then(FeatureValue::as_bool)
                    .unwrap_or(false)
                {
                    5
                } else {
                    -1
                }
            }
            _ => 0,
        }
    }

    fn pop_weight(key: &str, snapshot: &StateSnapshot) -> i32 {
        match key {
            "frame_count" => -1,
            "trigger_mode" => -2,
            "overlap_enabled" => -3,
            "frame_rate" => 1,
            "live_mode" => {
                if snapshot
                    .get("live_mode")
                    .and_then(|v| v.as_ref())
                    .and_then(FeatureValue::as_bool)
                    .unwrap_or(false)
                {
                    2
                } else {
                    -4
                }
            }
            _ => 0,
        }
    }

    /// Save the current values of the named settings, then apply the new
    /// ones in dependency order. Every push must be balanced by exactly one
    /// [`Camera::pop_state`] on every exit path.
    pub fn push_state(&mut self, mut state: CameraState) -> ScopeResult<()> {
        let mut old_state = StateSnapshot::new();
        for key in state.keys() {
            old_state.insert(key.clone(), self.current_value(key)?);
        }

        // Drop no-op writes, with one exception: a trigger-mode change can
        // silently rewrite overlap inside the camera, so the cached overlap
        // value cannot be trusted to prove the write redundant.
        let trigger_changing = match (state.get("trigger_mode"), old_state.get("trigger_mode")) {
            (Some(new), Some(old)) => old.as_ref() != Some(new),
            _ => false,
        };
        let redundant: Vec<String> = state
            .iter()
            .filter(|(key, new)| {
                if *key == "overlap_enabled" && trigger_changing {
                    return false;
                }
                old_state.get(*key).and_then(|v| v.as_ref()) == Some(*new)
            })
            .map(|(key, _)| key.clone())
            .collect();
        for key in &redundant {
            state.remove(key);
            old_state.remove(key);
        }

        if state
            .get("overlap_enabled")
            .and_then(FeatureValue::as_bool)
            .unwrap_or(false)
        {
            // enabling overlap can clobber the exposure time
            old_state.insert("exposure_time".into(), self.current_value("exposure_time")?);
        }

        let mut keys: Vec<String> = state.keys().cloned().collect();
        keys.sort_by_key(|key| (Self::push_weight(key, &state), key.clone()));

        self.state_stack.push(old_state);
        for key in keys {
            if let Some(value) = state.get(&key) {
                self.apply_state_key(&key, value.clone())?;
            }
        }
        Ok(())
    }

    /// Restore the most recently pushed settings, in reverse dependency
    /// order. If a restore fails the remaining snapshot stays on the stack
    /// for inspection rather than being dropped.
    pub fn pop_state(&mut self) -> ScopeResult<()> {
        let Some(snapshot) = self.state_stack.pop() else {
            return Err(ScopeError::Config("state stack is empty".into()));
        };
        let mut keys: Vec<String> = snapshot.keys().cloned().collect();
        keys.sort_by_key(|key| (Self::pop_weight(key, &snapshot), key.clone()));

        let mut remaining = snapshot;
        for key in keys {
            let value = remaining.get(&key).cloned().flatten();
            if let Some(value) = value {
                if let Err(e) = self.apply_state_key(&key, value) {
                    self.state_stack.push(remaining);
                    return Err(e);
                }
            }
            remaining.remove(&key);
        }
        Ok(())
    }

    fn apply_state_key(&mut self, key: &str, value: FeatureValue) -> ScopeResult<()> {
        match key {
            "live_mode" => {
                let enabled = value
                    .as_bool()
                    .ok_or_else(|| ScopeError::Config("live_mode takes a Bool".into()))?;
                self.set_live_mode(enabled)
            }
            "overlap_enabled" => {
                let enabled = value
                    .as_bool()
                    .ok_or_else(|| ScopeError::Config("overlap_enabled takes a Bool".into()))?;
                self.set_overlap_enabled(enabled)
            }
            "exposure_time" => {
                let seconds = value
                    .as_f64()
                    .ok_or_else(|| ScopeError::Config("exposure_time takes a Float".into()))?;
                self.set_exposure_time(seconds * 1000.0)
            }
            _ => {
                let decl = Self::decl(key)?;
                self.write_feature_raw(decl, &value)
            }
        }
    }

    /// Run `body` with the given settings pushed, popping on every exit
    /// path.
    pub fn with_state<R>(
        &mut self,
        state: CameraState,
        body: impl FnOnce(&mut Self) -> ScopeResult<R>,
    ) -> ScopeResult<R> {
        self.push_state(state)?;
        let result = body(self);
        let popped = self.pop_state();
        match (result, popped) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) | (Err(e), _) => Err(e),
        }
    }

    /// Depth of the state stack (diagnostics and tests).
    pub fn state_stack_depth(&self) -> usize {
        self.state_stack.len()
    }

    // ------------------------------------------------------------------
    // Typed convenience accessors
    // ------------------------------------------------------------------

    /// Exposure time in ms.
    pub fn get_exposure_time(&self) -> ScopeResult<f64> {
        Ok(1000.0 * self.driver.get_float("ExposureTime")?)
    }

    /// Legal exposure range in ms.
    pub fn get_exposure_time_range(&self) -> ScopeResult<(f64, f64)> {
        let (min, max) = self.driver.float_range("ExposureTime")?;
        Ok((1000.0 * min, 1000.0 * max))
    }

    /// Set the exposure time in ms.
    ///
    /// While live imaging is running, a change that keeps the exposure on
    /// the same side of the frame read time only retunes the trigger
    /// interval and resets the FPS window; crossing the read-time boundary
    /// changes the legal cycle parameters, so live mode is paused and
    /// resumed around the write.
    pub fn set_exposure_time(&mut self, ms: f64) -> ScopeResult<()> {
        if self.live.is_some() {
            let readout_ms = self.get_readout_time()?;
            let old_ms = self.get_exposure_time()?;
            if (old_ms < readout_ms) != (ms < readout_ms) {
                let mut state = CameraState::new();
                state.insert("live_mode".into(), FeatureValue::Bool(false));
                return self.with_state(state, |camera| {
                    camera.driver.set_float("ExposureTime", ms / 1000.0)?;
                    camera.maybe_update_frame_rate("ExposureTime");
                    Ok(())
                });
            }
            self.driver.set_float("ExposureTime", ms / 1000.0)?;
            self.maybe_update_frame_rate("ExposureTime");
            let interval = self.calculate_live_trigger_interval()?;
            if let Some(live) = &self.live {
                live.shared().set_interval(interval);
            }
            return Ok(());
        }
        self.driver.set_float("ExposureTime", ms / 1000.0)?;
        self.maybe_update_frame_rate("ExposureTime");
        Ok(())
    }

    /// Sensor readout time in ms.
    pub fn get_readout_time(&self) -> ScopeResult<f64> {
        Ok(1000.0 * self.driver.get_float("ReadoutTime")?)
    }

    /// Whether overlap mode is enabled; `None` when unreadable.
    pub fn get_overlap_enabled(&self) -> Option<bool> {
        self.driver.get_bool("Overlap").ok()
    }

    /// Enable or disable overlap mode. Clearing overlap in rolling-shutter
    /// software triggering is quietly skipped: the mode is already
    /// effectively off there and the camera rejects the write.
    pub fn set_overlap_enabled(&mut self, enabled: bool) -> ScopeResult<()> {
        if !enabled
            && self.get_shutter_mode()?.as_deref() == Some("Rolling")
            && self.get_trigger_mode()?.as_deref() == Some("Software")
        {
            return Ok(());
        }
        self.driver.set_bool("Overlap", enabled)?;
        self.maybe_update_frame_rate("Overlap");
        Ok(())
    }

    /// Current trigger mode.
    pub fn get_trigger_mode(&self) -> ScopeResult<Option<String>> {
        Ok(self
            .get_feature("trigger_mode")?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Select a trigger mode.
    pub fn set_trigger_mode(&mut self, mode: &str) -> ScopeResult<()> {
        self.driver.set_enum_string("TriggerMode", mode)?;
        self.maybe_update_frame_rate("TriggerMode");
        Ok(())
    }

    /// Current electronic shutter mode.
    pub fn get_shutter_mode(&self) -> ScopeResult<Option<String>> {
        Ok(self
            .get_feature("shutter_mode")?
            .and_then(|v| v.as_str().map(str::to_string)))
    }

    /// Current frame rate.
    pub fn get_frame_rate(&self) -> ScopeResult<f64> {
        Ok(self.driver.get_float("FrameRate")?)
    }

    /// Current legal frame-rate range.
    pub fn get_frame_rate_range(&self) -> ScopeResult<(f64, f64)> {
        Ok(self.driver.float_range("FrameRate")?)
    }

    /// Fastest rate the interface can move full frames.
    pub fn get_max_interface_fps(&self) -> ScopeResult<f64> {
        Ok(self.driver.get_float("MaxInterfaceTransferRate")?)
    }

    /// Bytes per raw frame.
    pub fn get_image_byte_count(&self) -> ScopeResult<i64> {
        Ok(self.driver.get_int("ImageSizeBytes")?)
    }

    /// Sensor timestamp clock frequency in Hz.
    pub fn get_timestamp_hz(&self) -> ScopeResult<i64> {
        Ok(self.driver.get_int("TimestampClockFrequency")?)
    }

    /// Convert sensor-clock ticks to seconds.
    pub fn timestamp_to_seconds(&self, ticks: u64) -> ScopeResult<f64> {
        Ok(ticks as f64 / self.get_timestamp_hz()? as f64)
    }

    /// Route one of the camera's IO pins to the selector.
    pub fn set_io_selector(&mut self, pin: &str) -> ScopeResult<()> {
        Ok(self.driver.set_enum_string("IOSelector", pin)?)
    }

    /// Reset the sensor timestamp clock to zero.
    pub fn reset_timestamp_clock(&self) -> ScopeResult<()> {
        Ok(self.driver.command("TimestampClockReset")?)
    }

    /// Discard all queued and filled driver buffers.
    pub fn flush(&self) -> ScopeResult<()> {
        Ok(self.driver.flush()?)
    }

    // ------------------------------------------------------------------
    // AOI
    // ------------------------------------------------------------------

    /// Current AOI, fully specified.
    pub fn get_aoi(&self) -> ScopeResult<Aoi> {
        Ok(Aoi {
            left: Some(self.driver.get_int("AOILeft")?),
            top: Some(self.driver.get_int("AOITop")?),
            width: Some(self.driver.get_int("AOIWidth")?),
            height: Some(self.driver.get_int("AOIHeight")?),
        })
    }

    /// `(width, height)` of the images the camera will produce.
    pub fn get_aoi_shape(&self) -> ScopeResult<(usize, usize)> {
        Ok((
            self.driver.get_int("AOIWidth")? as usize,
            self.driver.get_int("AOIHeight")? as usize,
        ))
    }

    /// Apply a (partial) AOI.
    ///
    /// The four components constrain each other, so a jointly-legal target
    /// can still fail if applied in the wrong order. Applying the updates in
    /// ascending order of signed delta from the current value guarantees
    /// every intermediate state is legal.
    pub fn set_aoi(&mut self, aoi: Aoi) -> ScopeResult<()> {
        let mut state = CameraState::new();
        state.insert("live_mode".into(), FeatureValue::Bool(false));
        self.with_state(state, |camera| {
            let mut updates: Vec<(&'static str, i64)> = Vec::new();
            for (name, value) in [
                ("aoi_left", aoi.left),
                ("aoi_top", aoi.top),
                ("aoi_width", aoi.width),
                ("aoi_height", aoi.height),
            ] {
                if let Some(value) = value {
                    updates.push((name, value));
                }
            }
            let mut keyed = Vec::with_capacity(updates.len());
            for (name, value) in updates {
                let decl = Self::decl(name)?;
                let current = camera.driver.get_int(decl.driver_name)?;
                keyed.push((value - current, name, value));
            }
            keyed.sort_by_key(|(delta, name, _)| (*delta, *name));
            for (_, name, value) in keyed {
                let decl = Self::decl(name)?;
                camera.write_feature_raw(decl, &FeatureValue::Int(value))?;
            }
            Ok(())
        })
    }

    /// Open the AOI to the full sensor.
    pub fn full_aoi(&mut self) -> ScopeResult<()> {
        // Move the origin first so the width/height ranges report the full
        // sensor rather than the remainder from the current origin.
        self.driver.set_int("AOILeft", 1)?;
        self.driver.set_int("AOITop", 1)?;
        let (_, max_width) = self.driver.int_range("AOIWidth")?;
        self.driver.set_int("AOIWidth", max_width)?;
        let (_, max_height) = self.driver.int_range("AOIHeight")?;
        self.driver.set_int("AOIHeight", max_height)?;
        self.maybe_update_frame_rate("AOIHeight");
        Ok(())
    }

    /// Center the current AOI on the sensor midline.
    pub fn vertically_center_aoi(&mut self) -> ScopeResult<()> {
        let (min, max) = self.driver.int_range("AOITop")?;
        self.driver.set_int("AOITop", (min + max) / 2)?;
        self.maybe_update_frame_rate("AOITop");
        Ok(())
    }

    /// Maximum number of frames that can be left on the camera head without
    /// overflowing its RAM.
    ///
    /// Each half-sensor readout chip buffers its own rows, so the limit
    /// depends only on the larger AOI extent above or below the midline.
    /// The formula is an empirical per-model fit taken from configuration.
    pub fn get_safe_image_count_to_queue(&self) -> ScopeResult<u64> {
        let binning_name = self
            .get_feature("binning")?
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "1x1".to_string());
        let binning: i64 = binning_name
            .split('x')
            .next()
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let height = self.driver.get_int("AOIHeight")? * binning;
        let top = self.driver.get_int("AOITop")? * binning - 1; // zero-based
        let bottom = top + height;
        let midline = i64::from(self.queue_model.midline_row);
        let lines = if bottom < midline || top > midline {
            height
        } else {
            (midline - top).max(bottom - midline)
        };
        let lines = lines.max(1) as u64;
        Ok(u64::from(self.queue_model.ram_line_constant) / lines
            + u64::from(self.queue_model.margin))
    }

    // ------------------------------------------------------------------
    // Image sequence acquisition
    // ------------------------------------------------------------------

    fn acquisition_namebase(frame_count: Option<u64>) -> String {
        let epoch = chrono::Utc::now().timestamp_micros() as f64 / 1e6;
        match frame_count {
            Some(1) => format!("acquire@{epoch:.6}"),
            _ => format!("sequence@{epoch:.6}-"),
        }
    }

    /// Start acquiring `frame_count` images (`None` for continuous). Pushes
    /// two state-stack entries; [`Camera::end_image_sequence_acquisition`]
    /// pops both.
    pub fn start_image_sequence_acquisition(
        &mut self,
        frame_count: Option<u64>,
        trigger_mode: &str,
        extra_state: CameraState,
    ) -> ScopeResult<()> {
        if self.factory.is_some() {
            return Err(ScopeError::Config(
                "an image sequence acquisition is already in progress".into(),
            ));
        }
        // live off first, so the main state push does not capture values
        // that are only legal during live cycling
        let mut live_off = CameraState::new();
        live_off.insert("live_mode".into(), FeatureValue::Bool(false));
        self.push_state(live_off)?;

        let mut state = extra_state;
        let cycle_mode = if frame_count.is_some() { "Fixed" } else { "Continuous" };
        state.insert(
            "cycle_mode".into(),
            FeatureValue::Enum(cycle_mode.to_string()),
        );
        state.insert(
            "trigger_mode".into(),
            FeatureValue::Enum(trigger_mode.to_string()),
        );
        if let Some(n) = frame_count {
            state.insert("frame_count".into(), FeatureValue::Int(n as i64));
        }
        if let Err(e) = self.push_state(state) {
            let _ = self.pop_state();
            return Err(e);
        }

        self.driver.flush()?;
        let namebase = Self::acquisition_namebase(frame_count);
        let mut factory = BufferFactory::new(
            self.driver.clone(),
            self.registry.clone(),
            namebase,
            frame_count,
        )?;
        if let Some(n) = frame_count {
            // queue eagerly so the sensor never stalls, but cap the RAM
            // committed to raw buffers
            let max_queue = (EAGER_QUEUE_BYTES / factory.image_bytes() as u64).max(1);
            for _ in 0..n.min(max_queue) {
                factory.queue_buffer()?;
            }
        }
        self.factory = Some(factory);
        self.driver.command("AcquisitionStart")?;
        Ok(())
    }

    /// Retrieve the next image of the running sequence.
    ///
    /// Returns the shared-buffer name, the sensor timestamp (ticks), and the
    /// frame number. The image is registered for one outgoing transfer
    /// before the name is returned.
    pub fn next_image_and_metadata(
        &mut self,
        read_timeout_ms: Option<f64>,
    ) -> ScopeResult<(String, Option<u64>, i64)> {
        let factory = self.factory.as_mut().ok_or_else(|| {
            ScopeError::Config("no image sequence acquisition in progress".into())
        })?;
        factory.queue_if_needed()?;
        let timeout = read_timeout_ms.map(|ms| ms.round().max(0.0) as u64);
        let raw = self.driver.wait_buffer(timeout)?;
        let (array, timestamp) = factory.convert_buffer(&raw)?;
        Self::publish_image(
            &self.latest,
            &self.frame_number,
            &self.events,
            array,
            timestamp,
        );
        self.latest_image()
    }

    /// Retrieve the next image, discarding its metadata.
    pub fn next_image(&mut self, read_timeout_ms: Option<f64>) -> ScopeResult<String> {
        Ok(self.next_image_and_metadata(read_timeout_ms)?.0)
    }

    /// Re-register the most recently retrieved image for one more outgoing
    /// transfer and return its name, timestamp, and frame number.
    pub fn latest_image(&self) -> ScopeResult<(String, Option<u64>, i64)> {
        let latest = self.latest.lock();
        let latest = latest
            .as_ref()
            .ok_or_else(|| ScopeError::Config("no image has been acquired".into()))?;
        self.registry.register_for_transfer(latest.array.clone());
        Ok((
            latest.name.clone(),
            latest.timestamp,
            latest.frame_number,
        ))
    }

    fn publish_image(
        latest: &Arc<Mutex<Option<LatestImage>>>,
        frame_number: &Arc<AtomicI64>,
        events: &broadcast::Sender<CameraEvent>,
        array: Arc<IsmArray>,
        timestamp: Option<u64>,
    ) {
        let frame = frame_number.fetch_add(1, Ordering::SeqCst) + 1;
        *latest.lock() = Some(LatestImage {
            name: array.name().to_string(),
            array,
            frame_number: frame,
            timestamp,
        });
        let _ = events.send(CameraEvent::FrameNumber(frame));
    }

    /// Stop the running sequence and restore the camera state (two pops,
    /// matching the two pushes of the start call).
    pub fn end_image_sequence_acquisition(&mut self) -> ScopeResult<()> {
        self.factory = None;
        self.driver.command("AcquisitionStop")?;
        self.driver.flush()?;
        self.pop_state()?;
        self.pop_state()?;
        Ok(())
    }

    /// Acquire one image with the camera's current settings (plus any
    /// overrides), handling setup and teardown internally.
    pub fn acquire_single_image(&mut self, extra_state: CameraState) -> ScopeResult<String> {
        self.start_image_sequence_acquisition(Some(1), "Internal", extra_state)?;
        let result = (|| {
            let timeout = self.get_exposure_time()? + 1000.0;
            self.next_image(Some(timeout))
        })();
        let ended = self.end_image_sequence_acquisition();
        match (result, ended) {
            (Ok(name), Ok(())) => Ok(name),
            (Ok(_), Err(e)) | (Err(e), _) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Live mode
    // ------------------------------------------------------------------

    /// Whether live imaging is running.
    pub fn get_live_mode(&self) -> bool {
        self.live.is_some()
    }

    /// Switch live imaging on or off.
    pub fn set_live_mode(&mut self, enabled: bool) -> ScopeResult<()> {
        if enabled {
            self.enable_live()?;
        } else {
            self.disable_live()?;
        }
        Ok(())
    }

    fn calculate_live_trigger_interval(&self) -> ScopeResult<f64> {
        let sustainable = self
            .get_frame_rate()?
            .min(self.get_max_interface_fps()?);
        Ok(1.0 / sustainable * 1.05)
    }

    fn enable_live(&mut self) -> ScopeResult<()> {
        if self.live.is_some() {
            return Ok(());
        }
        self.driver.flush()?;
        // The cycle/trigger snapshot lives with the session, not on the
        // shared state stack: live_mode is itself a state-stack key, and a
        // disable triggered from inside a push must not pop that push's
        // entry out from under it.
        let restore: StateSnapshot = [
            ("cycle_mode".to_string(), self.get_feature("cycle_mode")?),
            ("trigger_mode".to_string(), self.get_feature("trigger_mode")?),
        ]
        .into_iter()
        .collect();
        self.write_feature_raw(
            Self::decl("cycle_mode")?,
            &FeatureValue::Enum("Continuous".into()),
        )?;
        self.write_feature_raw(
            Self::decl("trigger_mode")?,
            &FeatureValue::Enum("Software".into()),
        )?;
        self.live_restore = Some(restore);

        let interval = self.calculate_live_trigger_interval()?;
        let epoch = chrono::Utc::now().timestamp_micros() as f64 / 1e6;
        let factory = BufferFactory::new(
            self.driver.clone(),
            self.registry.clone(),
            format!("live@{epoch:.6}-"),
            None,
        )?;
        self.driver.command("AcquisitionStart")?;

        let latest = self.latest.clone();
        let frame_number = self.frame_number.clone();
        let events = self.events.clone();
        let live = LiveMode::start(
            self.driver.clone(),
            factory,
            interval,
            move |array, timestamp| {
                Self::publish_image(&latest, &frame_number, &events, array, timestamp);
            },
        );
        self.live = Some(live);
        let _ = self.events.send(CameraEvent::LiveMode(true));
        Ok(())
    }

    fn disable_live(&mut self) -> ScopeResult<()> {
        let Some(live) = self.live.take() else {
            return Ok(());
        };
        // reader first, then trigger: a reader with no triggers coming
        // would block until its wait timed out
        let fatal = live.stop();
        self.driver.command("AcquisitionStop")?;
        self.driver.flush()?;
        if let Some(restore) = self.live_restore.take() {
            // trigger mode first, then cycle mode (reverse of enable order)
            for key in ["trigger_mode", "cycle_mode"] {
                if let Some(Some(value)) = restore.get(key) {
                    self.write_feature_raw(Self::decl(key)?, value)?;
                }
            }
        }
        let _ = self.events.send(CameraEvent::LiveMode(false));
        if let Some(error) = fatal {
            warn!(error = %error, "live mode ended with an error");
            return Err(error);
        }
        Ok(())
    }

    /// Mean recent live retrieval rate; `None` when live mode is off.
    pub fn get_live_fps(&self) -> Option<f64> {
        self.live.as_ref().map(|live| live.shared().fps())
    }

    // ------------------------------------------------------------------
    // Streaming
    // ------------------------------------------------------------------

    /// Pick the closest achievable `(frame_rate, overlap)` pair for a
    /// fixed-count internally triggered streaming acquisition.
    pub fn calculate_streaming_mode(
        &mut self,
        frame_count: u64,
        desired_fps: f64,
        extra_state: CameraState,
    ) -> ScopeResult<(f64, bool)> {
        let mut state = extra_state;
        state.insert("live_mode".into(), FeatureValue::Bool(false));
        self.with_state(state, |camera| {
            let mut frame_rate = if frame_count > camera.get_safe_image_count_to_queue()? {
                // frames will have to stream over the interface as they are
                // produced, so cap at what the interface sustains
                desired_fps.min(camera.get_max_interface_fps()?)
            } else {
                desired_fps
            };

            let readout_ms = camera.get_readout_time()?;
            let shutter = camera.get_shutter_mode()?.unwrap_or_default();
            let trigger = camera.get_trigger_mode()?.unwrap_or_default();
            let mut try_overlap = true;
            if shutter == "Global" && 1000.0 / desired_fps > readout_ms {
                // overlapping short global-shutter exposures silently
                // lengthens them to the readout time
                try_overlap = false;
            }
            if shutter == "Rolling" && trigger == "Software" {
                try_overlap = false;
            }

            let mut no_overlap = CameraState::new();
            no_overlap.insert("overlap_enabled".into(), FeatureValue::Bool(false));
            let (non_overlap_min, non_overlap_max) =
                camera.with_state(no_overlap, |camera| camera.get_frame_rate_range())?;
            if frame_rate < non_overlap_min {
                frame_rate = non_overlap_min;
            }

            if try_overlap {
                let mut with_overlap = CameraState::new();
                with_overlap.insert("overlap_enabled".into(), FeatureValue::Bool(true));
                let (overlap_min, overlap_max) =
                    camera.with_state(with_overlap, |camera| camera.get_frame_rate_range())?;
                if frame_rate > overlap_max {
                    frame_rate = overlap_max;
                }
                let overlap = (overlap_min..=overlap_max).contains(&frame_rate);
                Ok((frame_rate, overlap))
            } else {
                if frame_rate > non_overlap_max {
                    frame_rate = non_overlap_max;
                }
                Ok((frame_rate, false))
            }
        })
    }

    /// Acquire `frame_count` images at (up to) `frame_rate` fps, choosing
    /// overlap automatically. Returns the image names, their timestamps,
    /// and the frame rate actually attempted.
    pub fn stream_acquire(
        &mut self,
        frame_count: u64,
        frame_rate: f64,
        extra_state: CameraState,
    ) -> ScopeResult<(Vec<String>, Vec<Option<u64>>, f64)> {
        let mut calc_state = extra_state.clone();
        calc_state.insert(
            "trigger_mode".into(),
            FeatureValue::Enum("Internal".to_string()),
        );
        let (rate, overlap) = self.calculate_streaming_mode(frame_count, frame_rate, calc_state)?;
        let mut state = extra_state;
        state.insert("frame_rate".into(), FeatureValue::Float(rate));
        state.insert("overlap_enabled".into(), FeatureValue::Bool(overlap));
        self.start_image_sequence_acquisition(Some(frame_count), "Internal", state)?;

        let result = (|| {
            let read_time_s = 1.0 / self.get_max_interface_fps()?.min(rate);
            let mut names = Vec::with_capacity(frame_count as usize);
            let mut timestamps = Vec::with_capacity(frame_count as usize);
            for _ in 0..frame_count {
                let (name, timestamp, _) =
                    self.next_image_and_metadata(Some(3.0 * read_time_s * 1000.0))?;
                names.push(name);
                timestamps.push(timestamp);
            }
            Ok((names, timestamps, rate))
        })();
        let ended = self.end_image_sequence_acquisition();
        match (result, ended) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(e)) | (Err(e), _) => Err(e),
        }
    }

    // ------------------------------------------------------------------
    // Baseline state and background polling
    // ------------------------------------------------------------------

    /// Return the camera to its default, baseline state: live off,
    /// acquisition stopped, feature defaults applied, software triggering,
    /// full AOI, all IO pins uninverted.
    pub fn return_to_default_state(&mut self) -> ScopeResult<()> {
        if self.set_live_mode(false).is_err() {
            // live teardown is best-effort here; a reset must proceed
        }
        let _ = self.driver.command("AcquisitionStop");
        self.driver.flush()?;

        // overlap's default cannot be applied while software triggering
        self.driver.set_enum_string("TriggerMode", "Internal")?;
        for decl in CAMERA_FEATURES {
            if let Some(default) = decl.default {
                self.apply_default(decl.driver_name, default)?;
            }
        }
        for (feature, default) in HIDDEN_DEFAULTS {
            self.apply_default(feature, *default)?;
        }
        self.driver.set_enum_string("TriggerMode", "Software")?;
        self.full_aoi()?;

        let pin_count = self.driver.enum_count("IOSelector")?;
        for index in 0..pin_count {
            if !self.driver.is_enum_index_implemented("IOSelector", index)? {
                continue;
            }
            let pin = self.driver.enum_string_by_index("IOSelector", index)?;
            self.driver.set_enum_string("IOSelector", &pin)?;
            self.driver.set_bool("IOInvert", false)?;
        }
        Ok(())
    }

    fn apply_default(&self, feature: &str, default: driver::DefaultValue) -> ScopeResult<()> {
        use driver::DefaultValue;
        let result = match default {
            DefaultValue::Int(v) => self.driver.set_int(feature, v),
            DefaultValue::Float(v) => self.driver.set_float(feature, v),
            DefaultValue::Bool(v) => self.driver.set_bool(feature, v),
            DefaultValue::Enum(v) => self.driver.set_enum_string(feature, v),
        };
        match result {
            Ok(()) => Ok(()),
            // a default that does not apply on this model is not fatal
            Err(e) if e.code == ErrorCode::NotImplemented => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Default sensor-temperature polling interval.
    pub const TEMPERATURE_POLL_INTERVAL: Duration = Duration::from_secs(10);

    /// Publish the sensor temperature to subscribers on a fixed interval
    /// ([`Camera::TEMPERATURE_POLL_INTERVAL`] unless there is a reason to
    /// poll differently).
    pub fn start_temperature_updates(&mut self, interval: Duration) {
        if self.temp_poller.is_some() {
            return;
        }
        let running = Arc::new(AtomicBool::new(true));
        let flag = running.clone();
        let driver = self.driver.clone();
        let events = self.events.clone();
        let handle = std::thread::Builder::new()
            .name("camera-temperature".to_string())
            .spawn(move || {
                while flag.load(Ordering::Relaxed) {
                    if let Ok(celsius) = driver.get_float("SensorTemperature") {
                        let _ = events.send(CameraEvent::Temperature(celsius));
                    }
                    // sleep in slices so stop() stays responsive
                    let mut remaining = interval;
                    while flag.load(Ordering::Relaxed) && remaining > Duration::ZERO {
                        let slice = remaining.min(Duration::from_millis(100));
                        std::thread::sleep(slice);
                        remaining = remaining.saturating_sub(slice);
                    }
                }
            })
            .ok();
        self.temp_poller = Some(TempPoller { running, handle });
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if let Some(mut poller) = self.temp_poller.take() {
            poller.stop();
        }
        // stop dependent threads before the shared buffers they hold go away
        if self.live.is_some() {
            if let Err(e) = self.disable_live() {
                warn!(error = %e, "error stopping live mode during camera teardown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockDriver;
    use super::*;

    fn test_camera() -> (tempfile::TempDir, Camera, Arc<MockDriver>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let registry = Arc::new(BufferRegistry::with_dir(dir.path().to_path_buf()));
        let driver = MockDriver::new();
        let camera = Camera::new(driver.clone(), registry, &CameraConfig::default())
            .expect("camera init");
        (dir, camera, driver)
    }

    fn state(entries: &[(&str, FeatureValue)]) -> CameraState {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn push_pop_restores_every_feature() {
        let (_dir, mut camera, _driver) = test_camera();
        let before_exposure = camera.get_exposure_time().expect("exposure");
        let before_trigger = camera.get_trigger_mode().expect("trigger");

        camera
            .push_state(state(&[
                ("exposure_time", FeatureValue::Float(0.050)),
                ("trigger_mode", FeatureValue::Enum("External Exposure".into())),
                ("overlap_enabled", FeatureValue::Bool(true)),
            ]))
            .expect("push");
        assert_eq!(
            camera.get_trigger_mode().expect("trigger"),
            Some("External Exposure".to_string())
        );
        camera.pop_state().expect("pop");

        assert_eq!(camera.get_trigger_mode().expect("trigger"), before_trigger);
        let after = camera.get_exposure_time().expect("exposure");
        assert!((after - before_exposure).abs() < 1e-9);
        assert_eq!(camera.state_stack_depth(), 0);
    }

    #[test]
    fn overlap_survives_trigger_mode_round_trip() {
        let (_dir, mut camera, driver) = test_camera();
        // default state: software trigger, rolling shutter, overlap off
        camera
            .push_state(state(&[
                ("trigger_mode", FeatureValue::Enum("External Exposure".into())),
                ("overlap_enabled", FeatureValue::Bool(true)),
            ]))
            .expect("push");
        assert_eq!(driver.get_bool("Overlap").expect("read"), true);
        camera.pop_state().expect("pop");
        // restoring software triggering silently clears overlap inside the
        // camera; the pop must not fail over it
        assert_eq!(
            camera.get_trigger_mode().expect("trigger"),
            Some("Software".to_string())
        );
    }

    #[test]
    fn clearing_overlap_in_rolling_software_is_a_no_op() {
        let (_dir, mut camera, _driver) = test_camera();
        // push/pop around this must not crash even though the camera
        // rejects overlap writes in this mode
        camera.set_overlap_enabled(false).expect("quietly skipped");
    }

    #[test]
    fn jointly_legal_aoi_is_applied_without_an_illegal_intermediate() {
        let (_dir, mut camera, _driver) = test_camera();
        camera
            .set_aoi(Aoi {
                left: Some(2001),
                width: Some(500),
                ..Aoi::default()
            })
            .expect("aoi applied");
        let aoi = camera.get_aoi().expect("aoi");
        assert_eq!(aoi.left, Some(2001));
        assert_eq!(aoi.width, Some(500));
    }

    #[test]
    fn safe_queue_depth_follows_the_midline_formula() {
        let (_dir, mut camera, _driver) = test_camera();
        // full frame: 2160 rows split at 1080, so 1080 lines per half
        assert_eq!(
            camera.get_safe_image_count_to_queue().expect("depth"),
            126_464 / 1080 + 20
        );
        // a 200-row AOI entirely above the midline
        camera
            .set_aoi(Aoi {
                top: Some(101),
                height: Some(200),
                left: Some(1),
                width: Some(2560),
            })
            .expect("aoi");
        assert_eq!(
            camera.get_safe_image_count_to_queue().expect("depth"),
            126_464 / 200 + 20
        );
    }

    fn small_aoi(camera: &mut Camera) {
        camera
            .set_aoi(Aoi {
                left: Some(1),
                top: Some(1),
                width: Some(64),
                height: Some(48),
            })
            .expect("small aoi");
    }

    #[test]
    fn sequence_acquisition_produces_numbered_frames() {
        let (_dir, mut camera, _driver) = test_camera();
        small_aoi(&mut camera);
        let mut events = camera.subscribe();
        camera
            .start_image_sequence_acquisition(
                Some(3),
                "External Exposure",
                state(&[("overlap_enabled", FeatureValue::Bool(true))]),
            )
            .expect("start");
        let mut names = Vec::new();
        for expected in 0..3i64 {
            let (name, timestamp, frame) =
                camera.next_image_and_metadata(Some(1000.0)).expect("image");
            assert_eq!(frame, expected);
            assert!(timestamp.is_some());
            names.push(name);
        }
        camera.end_image_sequence_acquisition().expect("end");
        assert_eq!(camera.state_stack_depth(), 0);
        assert_eq!(names.len(), 3);
        assert!(names[0].ends_with('0'));

        // frame numbers were broadcast in order
        let mut seen = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let CameraEvent::FrameNumber(frame) = event {
                seen.push(frame);
            }
        }
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[test]
    fn acquisition_timeout_surfaces_the_driver_code() {
        let (_dir, mut camera, _driver) = test_camera();
        camera
            .start_image_sequence_acquisition(Some(1), "Software", CameraState::new())
            .expect("start");
        let err = camera
            .next_image_and_metadata(Some(30.0))
            .expect_err("no trigger, must time out");
        match err {
            ScopeError::Camera(e) => assert!(e.is_timeout()),
            other => panic!("unexpected error: {other}"),
        }
        camera.end_image_sequence_acquisition().expect("end");
    }

    #[test]
    fn live_mode_streams_and_stops_in_order() {
        let (_dir, mut camera, _driver) = test_camera();
        small_aoi(&mut camera);
        camera.set_exposure_time(1.0).expect("short exposure");
        camera.set_live_mode(true).expect("live on");
        assert!(camera.get_live_mode());

        // wait for at least one frame to land
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        loop {
            if camera.latest_image().is_ok() {
                break;
            }
            assert!(std::time::Instant::now() < deadline, "no live frame arrived");
            std::thread::sleep(Duration::from_millis(10));
        }
        let (name, _ts, frame) = camera.latest_image().expect("latest");
        assert!(name.starts_with("live@"));
        assert!(frame >= 0);

        camera.set_live_mode(false).expect("live off");
        assert!(!camera.get_live_mode());
        assert_eq!(camera.state_stack_depth(), 0);
    }

    #[test]
    fn exposure_change_during_live_keeps_it_running() {
        let (_dir, mut camera, _driver) = test_camera();
        small_aoi(&mut camera);
        camera.set_exposure_time(1.0).expect("exposure");
        camera.set_live_mode(true).expect("live on");
        // stays under the readout time: live keeps running
        camera.set_exposure_time(2.0).expect("retune");
        assert!(camera.get_live_mode());
        // crossing over the readout time pauses and resumes live mode
        let readout = camera.get_readout_time().expect("readout");
        camera.set_exposure_time(readout * 2.0).expect("cross boundary");
        assert!(camera.get_live_mode());
        camera.set_live_mode(false).expect("live off");
    }

    #[test]
    fn streaming_mode_prefers_overlap_when_the_rate_allows_it() {
        let (_dir, mut camera, _driver) = test_camera();
        // 10 ms exposure + ~10 ms readout: overlap mode requires ~50+ fps
        let (rate, overlap) = camera
            .calculate_streaming_mode(
                10,
                60.0,
                state(&[("trigger_mode", FeatureValue::Enum("Internal".into()))]),
            )
            .expect("calculate");
        assert!(overlap);
        assert!((rate - 60.0).abs() < 1e-9);
        assert_eq!(camera.state_stack_depth(), 0);

        // a rate below the overlap minimum falls back to non-overlap
        let (rate, overlap) = camera
            .calculate_streaming_mode(
                10,
                20.0,
                state(&[("trigger_mode", FeatureValue::Enum("Internal".into()))]),
            )
            .expect("calculate");
        assert!(!overlap);
        assert!((rate - 20.0).abs() < 1e-9);
    }

    #[test]
    fn single_image_acquisition_cleans_up() {
        let (_dir, mut camera, _driver) = test_camera();
        small_aoi(&mut camera);
        let name = camera
            .acquire_single_image(CameraState::new())
            .expect("single image");
        assert!(name.starts_with("acquire@"));
        assert_eq!(camera.state_stack_depth(), 0);
    }
}
