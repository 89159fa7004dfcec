//! Error types for the acquisition engine.
//!
//! One crate-wide enum, [`ScopeError`], covers the failure domains the
//! hardware stack can hit: configuration and sequence-building mistakes,
//! serial transport faults, IOTool program rejection, camera driver errors,
//! and run-time acquisition failures. Variants that originate in a
//! sub-system's own error type convert via `#[from]`, so `?` works across
//! the whole stack.

use thiserror::Error;

use crate::camera::driver::CameraError;

/// Convenience alias for results using the engine error type.
pub type ScopeResult<T> = std::result::Result<T, ScopeError>;

#[derive(Error, Debug)]
pub enum ScopeError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serial error: {0}")]
    Serial(String),

    #[error("Serial read timed out")]
    SerialTimeout,

    #[error("IOTool device is unresponsive: {0}")]
    IoToolUnresponsive(String),

    #[error("Unexpected IOTool output: {0}")]
    UnexpectedOutput(String),

    #[error("IOTool rejected program:\n{}", .0.join("\n"))]
    Program(Vec<String>),

    #[error("Camera error: {0}")]
    Camera(#[from] CameraError),

    #[error("Timed out waiting for image {step} of the acquisition sequence")]
    AcquisitionTimeout { step: usize },

    #[error("Acquisition aborted by external interrupt")]
    HardwareAborted,

    #[error("Live image retrieval timing out")]
    LiveRetrievalStalled,

    #[error("Shared buffer error: {0}")]
    Buffer(#[from] ism_buffer::IsmError),

    #[error("Image transport error: {0}")]
    Transport(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_error_names_each_offending_command() {
        let err = ScopeError::Program(vec![
            "sh Q9: bad pin".to_string(),
            "du 99999: out of range".to_string(),
        ]);
        let text = err.to_string();
        assert!(text.contains("sh Q9"));
        assert!(text.contains("du 99999"));
    }

    #[test]
    fn acquisition_timeout_names_the_step() {
        let err = ScopeError::AcquisitionTimeout { step: 3 };
        assert!(err.to_string().contains("image 3"));
    }
}
