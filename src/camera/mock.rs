//! Simulated Zyla-class camera for tests and hardware-free development.
//!
//! Implements [`CameraDriver`] over an in-memory feature store with the
//! cross-feature behaviors the camera core has to cope with:
//!
//! - AOI features constrain each other, so a jointly-legal AOI can still be
//!   rejected if applied in the wrong order.
//! - Overlap cannot be set in rolling-shutter + software-trigger mode, and
//!   switching into that mode silently clears overlap.
//! - Enabling overlap in global shutter silently lengthens short exposures
//!   to the readout time.
//! - `FrameCount` reads fail with `NOTIMPLEMENTED` while cycling is
//!   continuous.
//! - The frame-rate range depends on exposure, readout, trigger and overlap
//!   state, and `FrameRate` is only writable under internal triggering.
//!
//! Frames are produced through the same queue/wait pipeline as the real SDK:
//! software triggers (or external-trigger free-running) move queued buffers
//! to the filled queue, stamped with a monotonic sensor-clock trailer.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::camera::buffers::{write_buffer_metadata, write_timestamp};
use crate::camera::driver::{
    CameraDriver, CameraError, DriverResult, ErrorCode, FeatureCallback,
};

const SENSOR_WIDTH: i64 = 2560;
const SENSOR_HEIGHT: i64 = 2160;
const TIMESTAMP_HZ: i64 = 781_250_000;
/// Bytes reserved after the pixel data for the metadata trailer.
const METADATA_BYTES: usize = 48;

struct EnumState {
    values: Vec<&'static str>,
    index: usize,
}

impl EnumState {
    fn new(values: Vec<&'static str>, current: &str) -> Self {
        let index = values.iter().position(|v| *v == current).unwrap_or(0);
        Self { values, index }
    }

    fn current(&self) -> &'static str {
        self.values[self.index]
    }
}

struct Inner {
    ints: HashMap<&'static str, i64>,
    floats: HashMap<&'static str, f64>,
    bools: HashMap<&'static str, bool>,
    strings: HashMap<&'static str, String>,
    enums: HashMap<&'static str, EnumState>,
    acquiring: bool,
    queued: VecDeque<Vec<u8>>,
    filled: VecDeque<Vec<u8>>,
    pending_triggers: usize,
    frame_counter: u64,
    timestamp_clock: u64,
}

impl Inner {
    fn shutter(&self) -> &'static str {
        self.enums["ElectronicShutteringMode"].current()
    }

    fn trigger(&self) -> &'static str {
        self.enums["TriggerMode"].current()
    }

    fn row_read_time(&self) -> f64 {
        match self.enums["PixelReadoutRate"].current() {
            "100 MHz" => 2.59e-5,
            _ => 9.24e-6,
        }
    }

    /// Rows are read out toward the midline from both halves at once, so the
    /// frame read time follows the larger half.
    fn recompute_geometry(&mut self) {
        let width = self.ints["AOIWidth"];
        let height = self.ints["AOIHeight"];
        let stride = width * 2;
        self.ints.insert("AOIStride", stride);
        self.ints
            .insert("ImageSizeBytes", stride * height + METADATA_BYTES as i64);
        let lines = (height as f64 / 2.0).ceil();
        self.floats
            .insert("ReadoutTime", lines * self.row_read_time());
        self.floats.insert("RowReadTime", self.row_read_time());
        let image_bytes = self.ints["ImageSizeBytes"] as f64;
        self.floats
            .insert("MaxInterfaceTransferRate", 840e6 / image_bytes);
    }

    fn frame_rate_range(&self) -> (f64, f64) {
        let exposure = self.floats["ExposureTime"];
        let readout = self.floats["ReadoutTime"];
        if self.bools["Overlap"] {
            (1.0 / (exposure + readout), 1.0 / exposure.max(readout))
        } else {
            (0.00005, 1.0 / (exposure + readout))
        }
    }

    fn clamp_frame_rate(&mut self) {
        let (min, max) = self.frame_rate_range();
        let rate = self.floats["FrameRate"].clamp(min, max);
        self.floats.insert("FrameRate", rate);
    }

    /// Internal and externally-triggered modes free-run in the mock: frames
    /// materialize as soon as a buffer is queued. Software triggering is the
    /// only mode that requires explicit triggers.
    fn free_running(&self) -> bool {
        matches!(
            self.trigger(),
            "Internal" | "External" | "External Start" | "External Exposure"
        )
    }

    /// Move one queued buffer through a simulated exposure.
    fn fill_one(&mut self) -> bool {
        let Some(mut buffer) = self.queued.pop_front() else {
            return false;
        };
        let width = self.ints["AOIWidth"] as usize;
        let height = self.ints["AOIHeight"] as usize;
        let stride = self.ints["AOIStride"] as usize;
        let frame = self.frame_counter;
        self.frame_counter += 1;

        let mut rng = rand::thread_rng();
        for y in 0..height {
            let noise: u16 = rng.gen_range(0..16);
            for x in 0..width {
                let value = ((x + y + frame as usize) % 4096) as u16 + noise;
                let at = y * stride + x * 2;
                if at + 1 < buffer.len() {
                    buffer[at..at + 2].copy_from_slice(&value.to_le_bytes());
                }
            }
        }

        // advance the sensor clock by one exposure + readout
        let exposure = self.floats["ExposureTime"];
        let readout = self.floats["ReadoutTime"];
        self.timestamp_clock += ((exposure + readout) * TIMESTAMP_HZ as f64) as u64;
        self.ints
            .insert("TimestampClock", self.timestamp_clock as i64);

        // trailer: a frame-info chunk, then the timestamp chunk last; both
        // are 16 bytes, the rest of the metadata region is padding
        buffer.truncate(stride * height);
        buffer.extend(std::iter::repeat(0u8).take(METADATA_BYTES - 32));
        write_buffer_metadata(&mut buffer, 7, &frame.to_le_bytes());
        write_timestamp(&mut buffer, self.timestamp_clock);
        self.filled.push_back(buffer);
        true
    }

    fn service_triggers(&mut self) {
        while self.pending_triggers > 0 && !self.queued.is_empty() {
            if self.fill_one() {
                self.pending_triggers -= 1;
            }
        }
    }
}

/// In-memory [`CameraDriver`] implementation.
pub struct MockDriver {
    inner: Mutex<Inner>,
    filled_cond: Condvar,
    callbacks: Mutex<HashMap<String, Vec<FeatureCallback>>>,
}

impl MockDriver {
    /// Fresh driver in the power-on state of a Zyla 5.5.
    pub fn new() -> Arc<Self> {
        let mut inner = Inner {
            ints: HashMap::new(),
            floats: HashMap::new(),
            bools: HashMap::new(),
            strings: HashMap::new(),
            enums: HashMap::new(),
            acquiring: false,
            queued: VecDeque::new(),
            filled: VecDeque::new(),
            pending_triggers: 0,
            frame_counter: 0,
            timestamp_clock: 0,
        };
        inner.ints.insert("AOIWidth", SENSOR_WIDTH);
        inner.ints.insert("AOIHeight", SENSOR_HEIGHT);
        inner.ints.insert("AOILeft", 1);
        inner.ints.insert("AOITop", 1);
        inner.ints.insert("SensorWidth", SENSOR_WIDTH);
        inner.ints.insert("SensorHeight", SENSOR_HEIGHT);
        inner.ints.insert("FrameCount", 1);
        inner.ints.insert("TimestampClock", 0);
        inner.ints.insert("TimestampClockFrequency", TIMESTAMP_HZ);

        inner.floats.insert("ExposureTime", 0.01);
        inner.floats.insert("FrameRate", 30.0);
        inner.floats.insert("SensorTemperature", 0.0);

        inner.bools.insert("Overlap", false);
        inner.bools.insert("IOInvert", false);
        inner.bools.insert("SensorCooling", true);
        inner.bools.insert("SpuriousNoiseFilter", true);
        inner.bools.insert("MetadataEnable", true);
        inner.bools.insert("MetadataTimestamp", true);

        inner
            .strings
            .insert("CameraModel", "ZYLA-5.5-USB3".to_string());
        inner
            .strings
            .insert("SerialNumber", "VSC-00000".to_string());
        inner
            .strings
            .insert("FirmwareVersion", "14.9.16.0".to_string());
        inner.strings.insert("InterfaceType", "USB3".to_string());

        inner.enums.insert(
            "TriggerMode",
            EnumState::new(
                vec![
                    "Internal",
                    "Software",
                    "External",
                    "External Start",
                    "External Exposure",
                ],
                "Internal",
            ),
        );
        inner.enums.insert(
            "CycleMode",
            EnumState::new(vec!["Fixed", "Continuous"], "Fixed"),
        );
        inner.enums.insert(
            "ElectronicShutteringMode",
            EnumState::new(vec!["Rolling", "Global"], "Rolling"),
        );
        inner.enums.insert(
            "AOIBinning",
            EnumState::new(vec!["1x1", "2x2", "3x3", "4x4", "8x8"], "1x1"),
        );
        inner.enums.insert(
            "PixelEncoding",
            EnumState::new(vec!["Mono12", "Mono12Packed", "Mono16", "Mono32"], "Mono16"),
        );
        inner.enums.insert(
            "AuxiliaryOutSource",
            EnumState::new(vec!["FireRow1", "FireRowN", "FireAll", "FireAny"], "FireAll"),
        );
        inner.enums.insert(
            "IOSelector",
            EnumState::new(
                vec!["Fire 1", "Fire N", "Aux Out 1", "Arm", "External Trigger"],
                "Fire 1",
            ),
        );
        inner.enums.insert(
            "PixelReadoutRate",
            EnumState::new(vec!["100 MHz", "280 MHz"], "280 MHz"),
        );
        inner.enums.insert(
            "BitDepth",
            EnumState::new(vec!["11 Bit", "16 Bit"], "16 Bit"),
        );
        inner.enums.insert(
            "TemperatureStatus",
            EnumState::new(
                vec!["Cooler Off", "Stabilised", "Cooling", "Drift", "Not Stabilised", "Fault"],
                "Stabilised",
            ),
        );
        inner.recompute_geometry();

        Arc::new(Self {
            inner: Mutex::new(inner),
            filled_cond: Condvar::new(),
            callbacks: Mutex::new(HashMap::new()),
        })
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        #[allow(clippy::expect_used)] // a poisoned mock is unrecoverable in tests
        self.inner.lock().expect("mock driver mutex poisoned")
    }

    /// Invoke callbacks outside the state lock, as the SDK does.
    fn notify(&self, feature: &str) {
        #[allow(clippy::expect_used)]
        let callbacks = self.callbacks.lock().expect("callback mutex poisoned");
        if let Some(list) = callbacks.get(feature) {
            for callback in list {
                callback(feature);
            }
        }
    }

    fn aoi_range(inner: &Inner, feature: &str) -> Option<(i64, i64)> {
        match feature {
            "AOIWidth" => Some((1, SENSOR_WIDTH - inner.ints["AOILeft"] + 1)),
            "AOILeft" => Some((1, SENSOR_WIDTH - inner.ints["AOIWidth"] + 1)),
            "AOIHeight" => Some((1, SENSOR_HEIGHT - inner.ints["AOITop"] + 1)),
            "AOITop" => Some((1, SENSOR_HEIGHT - inner.ints["AOIHeight"] + 1)),
            _ => None,
        }
    }

    /// Number of frames the mock has produced so far.
    pub fn frames_produced(&self) -> u64 {
        self.lock().frame_counter
    }

    /// Set the reported sensor temperature (exercises the poller path).
    pub fn set_sensor_temperature(&self, celsius: f64) {
        self.lock().floats.insert("SensorTemperature", celsius);
        self.notify("SensorTemperature");
    }
}

impl CameraDriver for MockDriver {
    fn get_int(&self, feature: &str) -> DriverResult<i64> {
        let inner = self.lock();
        if feature == "FrameCount" && inner.enums["CycleMode"].current() == "Continuous" {
            // matches real SDK behavior: no frame count while cycling forever
            return Err(CameraError::new(ErrorCode::NotImplemented, feature));
        }
        inner
            .ints
            .get(feature)
            .copied()
            .ok_or_else(|| CameraError::new(ErrorCode::NotImplemented, feature))
    }

    fn set_int(&self, feature: &str, value: i64) -> DriverResult<()> {
        {
            let mut inner = self.lock();
            if !inner.ints.contains_key(feature) {
                return Err(CameraError::new(ErrorCode::NotImplemented, feature));
            }
            if matches!(
                feature,
                "AOIStride" | "ImageSizeBytes" | "SensorWidth" | "SensorHeight"
                    | "TimestampClock" | "TimestampClockFrequency"
            ) {
                return Err(CameraError::new(ErrorCode::NotWritable, feature));
            }
            if let Some((min, max)) = Self::aoi_range(&inner, feature) {
                if value < min || value > max {
                    return Err(CameraError::new(
                        ErrorCode::OutOfRange,
                        format!("{feature}={value} outside [{min}, {max}]"),
                    ));
                }
            }
            inner.ints.insert(
                match feature {
                    "AOIWidth" => "AOIWidth",
                    "AOIHeight" => "AOIHeight",
                    "AOILeft" => "AOILeft",
                    "AOITop" => "AOITop",
                    "FrameCount" => "FrameCount",
                    other => {
                        return Err(CameraError::new(ErrorCode::NotWritable, other));
                    }
                },
                value,
            );
            if feature.starts_with("AOI") {
                inner.recompute_geometry();
                inner.clamp_frame_rate();
            }
        }
        self.notify(feature);
        Ok(())
    }

    fn int_range(&self, feature: &str) -> DriverResult<(i64, i64)> {
        let inner = self.lock();
        if let Some(range) = Self::aoi_range(&inner, feature) {
            return Ok(range);
        }
        match feature {
            "FrameCount" => Ok((1, i64::MAX)),
            _ => Err(CameraError::new(ErrorCode::NotImplemented, feature)),
        }
    }

    fn get_float(&self, feature: &str) -> DriverResult<f64> {
        self.lock()
            .floats
            .get(feature)
            .copied()
            .ok_or_else(|| CameraError::new(ErrorCode::NotImplemented, feature))
    }

    fn set_float(&self, feature: &str, value: f64) -> DriverResult<()> {
        {
            let mut inner = self.lock();
            match feature {
                "ExposureTime" => {
                    let (min, max) = (9.24e-6, 30.0);
                    if !(min..=max).contains(&value) {
                        return Err(CameraError::new(
                            ErrorCode::OutOfRange,
                            format!("{feature}={value}"),
                        ));
                    }
                    inner.floats.insert("ExposureTime", value);
                    inner.clamp_frame_rate();
                }
                "FrameRate" => {
                    // the rate is meaningless when an external signal paces
                    // the acquisition
                    if inner.free_running() && inner.trigger() != "Internal" {
                        return Err(CameraError::new(ErrorCode::NotWritable, feature));
                    }
                    let (min, max) = inner.frame_rate_range();
                    if !(min..=max).contains(&value) {
                        return Err(CameraError::new(
                            ErrorCode::OutOfRange,
                            format!("{feature}={value} outside [{min}, {max}]"),
                        ));
                    }
                    inner.floats.insert("FrameRate", value);
                }
                "SensorTemperature" => {
                    return Err(CameraError::new(ErrorCode::NotWritable, feature));
                }
                _ => {
                    return Err(CameraError::new(ErrorCode::NotImplemented, feature));
                }
            }
        }
        self.notify(feature);
        Ok(())
    }

    fn float_range(&self, feature: &str) -> DriverResult<(f64, f64)> {
        let inner = self.lock();
        match feature {
            "ExposureTime" => Ok((9.24e-6, 30.0)),
            "FrameRate" => Ok(inner.frame_rate_range()),
            _ => Err(CameraError::new(ErrorCode::NotImplemented, feature)),
        }
    }

    fn get_bool(&self, feature: &str) -> DriverResult<bool> {
        let inner = self.lock();
        if feature == "CameraAcquiring" {
            return Ok(inner.acquiring);
        }
        inner
            .bools
            .get(feature)
            .copied()
            .ok_or_else(|| CameraError::new(ErrorCode::NotImplemented, feature))
    }

    fn set_bool(&self, feature: &str, value: bool) -> DriverResult<()> {
        {
            let mut inner = self.lock();
            match feature {
                "Overlap" => {
                    if inner.shutter() == "Rolling" && inner.trigger() == "Software" {
                        return Err(CameraError::new(
                            ErrorCode::NotAvailable,
                            "Overlap in rolling-shutter software triggering",
                        ));
                    }
                    if value && inner.shutter() == "Global" {
                        // short global-shutter exposures are forced up to the
                        // readout time when overlapped
                        let readout = inner.floats["ReadoutTime"];
                        if inner.floats["ExposureTime"] < readout {
                            inner.floats.insert("ExposureTime", readout);
                        }
                    }
                    inner.bools.insert("Overlap", value);
                    inner.clamp_frame_rate();
                }
                "IOInvert" | "SpuriousNoiseFilter" | "MetadataEnable" | "MetadataTimestamp"
                | "SensorCooling" => {
                    inner.bools.insert(
                        match feature {
                            "IOInvert" => "IOInvert",
                            "SpuriousNoiseFilter" => "SpuriousNoiseFilter",
                            "MetadataEnable" => "MetadataEnable",
                            "SensorCooling" => "SensorCooling",
                            _ => "MetadataTimestamp",
                        },
                        value,
                    );
                }
                "CameraAcquiring" => {
                    return Err(CameraError::new(ErrorCode::NotWritable, feature));
                }
                _ => {
                    return Err(CameraError::new(ErrorCode::NotImplemented, feature));
                }
            }
        }
        self.notify(feature);
        Ok(())
    }

    fn get_string(&self, feature: &str) -> DriverResult<String> {
        self.lock()
            .strings
            .get(feature)
            .cloned()
            .ok_or_else(|| CameraError::new(ErrorCode::NotImplemented, feature))
    }

    fn enum_index(&self, feature: &str) -> DriverResult<usize> {
        self.lock()
            .enums
            .get(feature)
            .map(|e| e.index)
            .ok_or_else(|| CameraError::new(ErrorCode::NotImplemented, feature))
    }

    fn set_enum_string(&self, feature: &str, value: &str) -> DriverResult<()> {
        {
            let mut inner = self.lock();
            let state = inner
                .enums
                .get(feature)
                .ok_or_else(|| CameraError::new(ErrorCode::NotImplemented, feature))?;
            let index = state
                .values
                .iter()
                .position(|v| *v == value)
                .ok_or_else(|| {
                    CameraError::new(ErrorCode::NotAvailable, format!("{feature}={value}"))
                })?;
            if matches!(feature, "BitDepth" | "TemperatureStatus") {
                return Err(CameraError::new(ErrorCode::NotWritable, feature));
            }
            if let Some(state) = inner.enums.get_mut(feature) {
                state.index = index;
            }
            if feature == "TriggerMode" {
                // entering software triggering with a rolling shutter quietly
                // drops overlap; the cached pre-change value goes stale
                if value == "Software" && inner.shutter() == "Rolling" {
                    inner.bools.insert("Overlap", false);
                }
            }
            if matches!(feature, "PixelReadoutRate" | "ElectronicShutteringMode") {
                inner.recompute_geometry();
            }
            if matches!(
                feature,
                "TriggerMode" | "PixelReadoutRate" | "ElectronicShutteringMode"
            ) {
                inner.clamp_frame_rate();
            }
        }
        self.notify(feature);
        Ok(())
    }

    fn enum_count(&self, feature: &str) -> DriverResult<usize> {
        self.lock()
            .enums
            .get(feature)
            .map(|e| e.values.len())
            .ok_or_else(|| CameraError::new(ErrorCode::NotImplemented, feature))
    }

    fn enum_string_by_index(&self, feature: &str, index: usize) -> DriverResult<String> {
        let inner = self.lock();
        let state = inner
            .enums
            .get(feature)
            .ok_or_else(|| CameraError::new(ErrorCode::NotImplemented, feature))?;
        state
            .values
            .get(index)
            .map(|v| (*v).to_string())
            .ok_or_else(|| CameraError::new(ErrorCode::OutOfRange, format!("{feature}[{index}]")))
    }

    fn is_enum_index_implemented(&self, feature: &str, index: usize) -> DriverResult<bool> {
        let inner = self.lock();
        let state = inner
            .enums
            .get(feature)
            .ok_or_else(|| CameraError::new(ErrorCode::NotImplemented, feature))?;
        Ok(index < state.values.len())
    }

    fn is_enum_index_available(&self, feature: &str, index: usize) -> DriverResult<bool> {
        let inner = self.lock();
        let state = inner
            .enums
            .get(feature)
            .ok_or_else(|| CameraError::new(ErrorCode::NotImplemented, feature))?;
        if index >= state.values.len() {
            return Ok(false);
        }
        if feature == "TriggerMode" && state.values[index] == "Software" {
            // software triggering is unavailable while overlapped in rolling
            // shutter mode
            return Ok(!(inner.bools["Overlap"] && inner.shutter() == "Rolling"));
        }
        Ok(true)
    }

    fn is_writable(&self, feature: &str) -> DriverResult<bool> {
        let inner = self.lock();
        Ok(match feature {
            "FrameRate" => !(inner.free_running() && inner.trigger() != "Internal"),
            "AOIStride" | "ImageSizeBytes" | "SensorWidth" | "SensorHeight" | "BitDepth"
            | "CameraAcquiring" | "SensorTemperature" | "TimestampClock"
            | "TimestampClockFrequency" => false,
            _ => true,
        })
    }

    fn command(&self, name: &str) -> DriverResult<()> {
        let mut inner = self.lock();
        match name {
            "AcquisitionStart" => {
                inner.acquiring = true;
            }
            "AcquisitionStop" => {
                inner.acquiring = false;
                inner.pending_triggers = 0;
            }
            "SoftwareTrigger" => {
                if !inner.acquiring {
                    return Err(CameraError::new(ErrorCode::NotAvailable, name));
                }
                inner.pending_triggers += 1;
                inner.service_triggers();
                self.filled_cond.notify_all();
            }
            "TimestampClockReset" => {
                inner.timestamp_clock = 0;
                inner.ints.insert("TimestampClock", 0);
            }
            _ => return Err(CameraError::new(ErrorCode::NotImplemented, name)),
        }
        Ok(())
    }

    fn flush(&self) -> DriverResult<()> {
        let mut inner = self.lock();
        inner.queued.clear();
        inner.filled.clear();
        inner.pending_triggers = 0;
        Ok(())
    }

    fn queue_buffer(&self, buffer: Vec<u8>) -> DriverResult<()> {
        let mut inner = self.lock();
        inner.queued.push_back(buffer);
        inner.service_triggers();
        self.filled_cond.notify_all();
        Ok(())
    }

    fn wait_buffer(&self, timeout_ms: Option<u64>) -> DriverResult<Vec<u8>> {
        let deadline = timeout_ms.map(|ms| Instant::now() + Duration::from_millis(ms));
        let mut inner = self.lock();
        loop {
            if let Some(buffer) = inner.filled.pop_front() {
                return Ok(buffer);
            }
            if inner.acquiring && inner.free_running() && !inner.queued.is_empty() {
                inner.fill_one();
                continue;
            }
            let wait = match deadline {
                None => Duration::from_millis(50),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(CameraError::new(ErrorCode::TimedOut, "WaitBuffer"));
                    }
                    (deadline - now).min(Duration::from_millis(50))
                }
            };
            #[allow(clippy::expect_used)]
            let (guard, _timeout) = self
                .filled_cond
                .wait_timeout(inner, wait)
                .expect("mock driver mutex poisoned");
            inner = guard;
        }
    }

    fn convert_buffer(
        &self,
        src: &[u8],
        dst: &mut [u16],
        width: usize,
        height: usize,
        stride: usize,
        input_encoding: &str,
    ) -> DriverResult<()> {
        if input_encoding != "Mono16" {
            return Err(CameraError::new(
                ErrorCode::NotImplemented,
                format!("ConvertBuffer from {input_encoding}"),
            ));
        }
        if dst.len() < width * height || src.len() < stride * height {
            return Err(CameraError::new(ErrorCode::OutOfRange, "ConvertBuffer"));
        }
        for y in 0..height {
            let row = &src[y * stride..y * stride + width * 2];
            for x in 0..width {
                dst[y * width + x] = u16::from_le_bytes([row[x * 2], row[x * 2 + 1]]);
            }
        }
        Ok(())
    }

    fn register_feature_callback(
        &self,
        feature: &str,
        callback: FeatureCallback,
    ) -> DriverResult<()> {
        #[allow(clippy::expect_used)]
        self.callbacks
            .lock()
            .expect("callback mutex poisoned")
            .entry(feature.to_string())
            .or_default()
            .push(callback);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlap_rejected_in_rolling_software_mode() {
        let driver = MockDriver::new();
        driver.set_enum_string("TriggerMode", "Software").expect("set");
        let err = driver.set_bool("Overlap", true).expect_err("must reject");
        assert_eq!(err.code, ErrorCode::NotAvailable);
    }

    #[test]
    fn switching_to_software_trigger_silently_clears_overlap() {
        let driver = MockDriver::new();
        driver.set_bool("Overlap", true).expect("overlap on");
        driver.set_enum_string("TriggerMode", "Software").expect("set");
        assert!(!driver.get_bool("Overlap").expect("read"));
    }

    #[test]
    fn frame_count_unreadable_while_continuous() {
        let driver = MockDriver::new();
        driver.set_enum_string("CycleMode", "Continuous").expect("set");
        let err = driver.get_int("FrameCount").expect_err("must fail");
        assert_eq!(err.code, ErrorCode::NotImplemented);
    }

    #[test]
    fn aoi_ranges_depend_on_each_other() {
        let driver = MockDriver::new();
        // full width: left must stay at 1
        let err = driver.set_int("AOILeft", 2001).expect_err("out of range");
        assert_eq!(err.code, ErrorCode::OutOfRange);
        driver.set_int("AOIWidth", 500).expect("narrow first");
        driver.set_int("AOILeft", 2001).expect("now legal");
    }

    #[test]
    fn software_trigger_fills_a_queued_buffer() {
        let driver = MockDriver::new();
        driver.set_enum_string("TriggerMode", "Software").expect("set");
        driver.command("AcquisitionStart").expect("start");
        let bytes = driver.get_int("ImageSizeBytes").expect("size") as usize;
        driver.queue_buffer(vec![0; bytes]).expect("queue");
        driver.command("SoftwareTrigger").expect("trigger");
        let frame = driver.wait_buffer(Some(1000)).expect("frame");
        assert_eq!(frame.len(), bytes);
        assert!(crate::camera::buffers::parse_timestamp(&frame).is_some());
    }

    #[test]
    fn wait_buffer_times_out_without_a_trigger() {
        let driver = MockDriver::new();
        driver.command("AcquisitionStart").expect("start");
        let err = driver.wait_buffer(Some(20)).expect_err("no frame");
        assert!(err.is_timeout());
    }

    #[test]
    fn timestamps_increase_monotonically() {
        let driver = MockDriver::new();
        driver.set_enum_string("TriggerMode", "External Exposure").expect("set");
        driver.command("AcquisitionStart").expect("start");
        let bytes = driver.get_int("ImageSizeBytes").expect("size") as usize;
        let mut last = 0;
        for _ in 0..3 {
            driver.queue_buffer(vec![0; bytes]).expect("queue");
            let frame = driver.wait_buffer(Some(1000)).expect("frame");
            let ts = crate::camera::buffers::parse_timestamp(&frame).expect("ts");
            assert!(ts > last);
            last = ts;
        }
    }
}
