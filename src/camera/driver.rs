//! Vendor camera driver abstraction.
//!
//! The sCMOS vendor SDK models every camera setting as a named feature typed
//! as Int / Float / Bool / Enum / String, plus a handful of commands and a
//! queue/wait buffer pipeline. [`CameraDriver`] captures exactly that
//! operation set so the camera core can run against the real SDK binding or
//! the in-crate mock. The driver is assumed thread-safe for distinct feature
//! calls; acquisition sessions are serialized by the camera core.

use thiserror::Error;

/// Error codes surfaced by the vendor SDK.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorCode {
    /// Feature does not apply in the current camera state.
    NotImplemented,
    /// Feature exists but is read-only right now.
    NotWritable,
    /// Enum value cannot be selected in the current state.
    NotAvailable,
    /// Value outside the feature's current legal range.
    OutOfRange,
    /// A buffer wait exceeded its timeout.
    TimedOut,
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let text = match self {
            ErrorCode::NotImplemented => "NOTIMPLEMENTED",
            ErrorCode::NotWritable => "NOTWRITABLE",
            ErrorCode::NotAvailable => "NOTAVAILABLE",
            ErrorCode::OutOfRange => "OUTOFRANGE",
            ErrorCode::TimedOut => "TIMEDOUT",
        };
        f.write_str(text)
    }
}

/// A driver-level failure, carrying the SDK error code and what was being
/// touched at the time.
#[derive(Error, Clone, Debug, PartialEq, Eq)]
#[error("{code}: {context}")]
pub struct CameraError {
    /// SDK error code.
    pub code: ErrorCode,
    /// Feature or command involved.
    pub context: String,
}

impl CameraError {
    /// Build an error for the given code and context.
    pub fn new(code: ErrorCode, context: impl Into<String>) -> Self {
        Self {
            code,
            context: context.into(),
        }
    }

    /// True for buffer-wait timeouts, which live mode retries.
    pub fn is_timeout(&self) -> bool {
        self.code == ErrorCode::TimedOut
    }
}

/// Convenience alias for driver results.
pub type DriverResult<T> = std::result::Result<T, CameraError>;

/// Callback invoked by the driver when a feature's value changes.
pub type FeatureCallback = Box<dyn Fn(&str) + Send + Sync>;

/// Operation set of the vendor camera SDK.
pub trait CameraDriver: Send + Sync {
    /// Read an Int feature.
    fn get_int(&self, feature: &str) -> DriverResult<i64>;
    /// Write an Int feature.
    fn set_int(&self, feature: &str, value: i64) -> DriverResult<()>;
    /// Current legal range of an Int feature.
    fn int_range(&self, feature: &str) -> DriverResult<(i64, i64)>;

    /// Read a Float feature.
    fn get_float(&self, feature: &str) -> DriverResult<f64>;
    /// Write a Float feature.
    fn set_float(&self, feature: &str, value: f64) -> DriverResult<()>;
    /// Current legal range of a Float feature.
    fn float_range(&self, feature: &str) -> DriverResult<(f64, f64)>;

    /// Read a Bool feature.
    fn get_bool(&self, feature: &str) -> DriverResult<bool>;
    /// Write a Bool feature.
    fn set_bool(&self, feature: &str, value: bool) -> DriverResult<()>;

    /// Read a String feature.
    fn get_string(&self, feature: &str) -> DriverResult<String>;

    /// Index currently selected for an Enum feature.
    fn enum_index(&self, feature: &str) -> DriverResult<usize>;
    /// Select an Enum value by string.
    fn set_enum_string(&self, feature: &str, value: &str) -> DriverResult<()>;
    /// Number of indices an Enum feature declares.
    fn enum_count(&self, feature: &str) -> DriverResult<usize>;
    /// String for an Enum index.
    fn enum_string_by_index(&self, feature: &str, index: usize) -> DriverResult<String>;
    /// Whether an Enum index exists on this hardware at all.
    fn is_enum_index_implemented(&self, feature: &str, index: usize) -> DriverResult<bool>;
    /// Whether an Enum index may be selected in the current state.
    fn is_enum_index_available(&self, feature: &str, index: usize) -> DriverResult<bool>;

    /// Whether a feature may currently be written.
    fn is_writable(&self, feature: &str) -> DriverResult<bool>;

    /// Execute a command feature (`AcquisitionStart`, `AcquisitionStop`,
    /// `SoftwareTrigger`, `TimestampClockReset`).
    fn command(&self, name: &str) -> DriverResult<()>;

    /// Discard every queued and filled buffer.
    fn flush(&self) -> DriverResult<()>;

    /// Hand a raw buffer to the acquisition pipeline.
    fn queue_buffer(&self, buffer: Vec<u8>) -> DriverResult<()>;

    /// Block until the oldest queued buffer has been filled, returning it.
    /// `None` waits indefinitely.
    fn wait_buffer(&self, timeout_ms: Option<u64>) -> DriverResult<Vec<u8>>;

    /// Unpack a raw, stride-padded frame into tightly packed 16-bit pixels.
    /// The destination is laid out x-fastest to match sensor readout.
    #[allow(clippy::too_many_arguments)]
    fn convert_buffer(
        &self,
        src: &[u8],
        dst: &mut [u16],
        width: usize,
        height: usize,
        stride: usize,
        input_encoding: &str,
    ) -> DriverResult<()>;

    /// Register a change callback for a feature.
    fn register_feature_callback(&self, feature: &str, callback: FeatureCallback)
        -> DriverResult<()>;
}

/// Value of a camera feature in its native type.
#[derive(Clone, Debug, PartialEq)]
pub enum FeatureValue {
    /// Int feature value.
    Int(i64),
    /// Float feature value.
    Float(f64),
    /// Bool feature value.
    Bool(bool),
    /// Enum feature value, by its string name.
    Enum(String),
    /// String feature value.
    Str(String),
}

impl FeatureValue {
    /// The Float payload, also accepting Int.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            FeatureValue::Float(v) => Some(*v),
            FeatureValue::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    /// The Int payload.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FeatureValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    /// The Bool payload.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            FeatureValue::Bool(v) => Some(*v),
            _ => None,
        }
    }

    /// The Enum or String payload.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FeatureValue::Enum(v) | FeatureValue::Str(v) => Some(v),
            _ => None,
        }
    }
}

/// Native type of a feature.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FeatureType {
    /// 64-bit integer feature.
    Int,
    /// Floating-point feature.
    Float,
    /// Boolean feature.
    Bool,
    /// Enumerated feature.
    Enum,
    /// Read-only string feature.
    Str,
}

/// Default applied when returning the camera to its baseline state.
#[derive(Clone, Copy, Debug)]
pub enum DefaultValue {
    /// Int default.
    Int(i64),
    /// Float default. Time-valued defaults are in seconds, as the driver
    /// expects.
    Float(f64),
    /// Bool default.
    Bool(bool),
    /// Enum default, by string.
    Enum(&'static str),
}

/// One row of the declarative feature table: the engine-facing name, the
/// driver feature string, its type, writability, and optional default.
#[derive(Clone, Copy, Debug)]
pub struct FeatureDecl {
    /// Engine-facing snake_case name.
    pub name: &'static str,
    /// Vendor SDK feature string.
    pub driver_name: &'static str,
    /// Native type.
    pub ty: FeatureType,
    /// True when the SDK never accepts writes.
    pub readonly: bool,
    /// Baseline value, when one exists.
    pub default: Option<DefaultValue>,
}

const fn decl(
    name: &'static str,
    driver_name: &'static str,
    ty: FeatureType,
    readonly: bool,
    default: Option<DefaultValue>,
) -> FeatureDecl {
    FeatureDecl {
        name,
        driver_name,
        ty,
        readonly,
        default,
    }
}

/// The camera feature surface, generated from this one table.
pub const CAMERA_FEATURES: &[FeatureDecl] = &[
    decl("aoi_height", "AOIHeight", FeatureType::Int, false, None),
    decl("aoi_left", "AOILeft", FeatureType::Int, false, None),
    decl("aoi_stride", "AOIStride", FeatureType::Int, true, None),
    decl("aoi_top", "AOITop", FeatureType::Int, false, None),
    decl("aoi_width", "AOIWidth", FeatureType::Int, false, None),
    decl(
        "auxiliary_out_source",
        "AuxiliaryOutSource",
        FeatureType::Enum,
        false,
        Some(DefaultValue::Enum("FireAll")),
    ),
    decl(
        "binning",
        "AOIBinning",
        FeatureType::Enum,
        false,
        Some(DefaultValue::Enum("1x1")),
    ),
    decl("bit_depth", "BitDepth", FeatureType::Enum, true, None),
    decl("current_timestamp", "TimestampClock", FeatureType::Int, true, None),
    decl(
        "cycle_mode",
        "CycleMode",
        FeatureType::Enum,
        false,
        Some(DefaultValue::Enum("Fixed")),
    ),
    decl(
        "exposure_time",
        "ExposureTime",
        FeatureType::Float,
        false,
        Some(DefaultValue::Float(0.010)),
    ),
    decl("firmware_version", "FirmwareVersion", FeatureType::Str, true, None),
    decl(
        "frame_count",
        "FrameCount",
        FeatureType::Int,
        false,
        Some(DefaultValue::Int(1)),
    ),
    decl("frame_rate", "FrameRate", FeatureType::Float, false, None),
    decl("image_byte_count", "ImageSizeBytes", FeatureType::Int, true, None),
    decl("interface_type", "InterfaceType", FeatureType::Str, true, None),
    decl("io_selector", "IOSelector", FeatureType::Enum, false, None),
    decl("is_acquiring", "CameraAcquiring", FeatureType::Bool, true, None),
    decl(
        "max_interface_fps",
        "MaxInterfaceTransferRate",
        FeatureType::Float,
        true,
        None,
    ),
    decl("model_name", "CameraModel", FeatureType::Str, true, None),
    decl(
        "overlap_enabled",
        "Overlap",
        FeatureType::Bool,
        false,
        Some(DefaultValue::Bool(true)),
    ),
    decl("pixel_encoding", "PixelEncoding", FeatureType::Enum, true, None),
    decl("readout_rate", "PixelReadoutRate", FeatureType::Enum, false, None),
    decl("readout_time", "ReadoutTime", FeatureType::Float, true, None),
    decl("row_read_time", "RowReadTime", FeatureType::Float, true, None),
    decl(
        "selected_io_pin_inverted",
        "IOInvert",
        FeatureType::Bool,
        false,
        None,
    ),
    decl(
        "sensor_cooling_enabled",
        "SensorCooling",
        FeatureType::Bool,
        true,
        Some(DefaultValue::Bool(true)),
    ),
    decl("sensor_height", "SensorHeight", FeatureType::Int, true, None),
    decl(
        "sensor_temperature",
        "SensorTemperature",
        FeatureType::Float,
        true,
        None,
    ),
    decl("sensor_width", "SensorWidth", FeatureType::Int, true, None),
    decl("serial_number", "SerialNumber", FeatureType::Str, true, None),
    decl(
        "shutter_mode",
        "ElectronicShutteringMode",
        FeatureType::Enum,
        false,
        Some(DefaultValue::Enum("Rolling")),
    ),
    decl(
        "spurious_noise_filter_enabled",
        "SpuriousNoiseFilter",
        FeatureType::Bool,
        false,
        Some(DefaultValue::Bool(true)),
    ),
    decl(
        "temperature_status",
        "TemperatureStatus",
        FeatureType::Enum,
        true,
        None,
    ),
    decl(
        "timestamp_hz",
        "TimestampClockFrequency",
        FeatureType::Int,
        true,
        None,
    ),
    decl("trigger_mode", "TriggerMode", FeatureType::Enum, false, None),
];

/// Features kept out of the public surface but still defaulted at baseline:
/// per-frame metadata (and its timestamp chunk) stays enabled.
pub const HIDDEN_DEFAULTS: &[(&str, DefaultValue)] = &[
    ("MetadataEnable", DefaultValue::Bool(true)),
    ("MetadataTimestamp", DefaultValue::Bool(true)),
];

/// Driver features whose writes can shift the legal frame-rate range.
pub const FRAME_RATE_RANGE_AFFECTING: &[&str] = &[
    "AOITop",
    "AOIHeight",
    "PixelReadoutRate",
    "ElectronicShutteringMode",
    "TriggerMode",
    "Overlap",
    "ExposureTime",
];

/// Look up a table row by engine-facing name.
pub fn feature_by_name(name: &str) -> Option<&'static FeatureDecl> {
    CAMERA_FEATURES.iter().find(|decl| decl.name == name)
}

/// Look up a table row by vendor feature string.
pub fn feature_by_driver_name(driver_name: &str) -> Option<&'static FeatureDecl> {
    CAMERA_FEATURES
        .iter()
        .find(|decl| decl.driver_name == driver_name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_names_are_unique() {
        for (i, a) in CAMERA_FEATURES.iter().enumerate() {
            for b in &CAMERA_FEATURES[i + 1..] {
                assert_ne!(a.name, b.name);
                assert_ne!(a.driver_name, b.driver_name);
            }
        }
    }

    #[test]
    fn lookup_by_both_names() {
        let decl = feature_by_name("overlap_enabled").expect("present");
        assert_eq!(decl.driver_name, "Overlap");
        let decl = feature_by_driver_name("TriggerMode").expect("present");
        assert_eq!(decl.name, "trigger_mode");
    }

    #[test]
    fn error_codes_render_like_the_sdk() {
        let err = CameraError::new(ErrorCode::TimedOut, "WaitBuffer");
        assert_eq!(err.to_string(), "TIMEDOUT: WaitBuffer");
        assert!(err.is_timeout());
    }
}
