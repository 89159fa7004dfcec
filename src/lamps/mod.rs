//! Illumination devices driven through the IOTool box.
//!
//! Two lamp families participate in sequenced acquisitions: the transmitted
//! -light LED (enable + PWM intensity pins on the IOTool box) and the
//! Lumencor Spectra X fluorescence bank (one enable pin per lamp on the
//! IOTool box, intensity over the Spectra's own serial port).
//!
//! Both expose the same two surfaces: immediate setters that execute IOTool
//! commands right away, and `*_commands` generators the sequencer splices
//! into its stored micro-program. Each device keeps a LIFO state stack so a
//! run can push a known illumination state and restore the previous one
//! afterwards.

pub mod spectra;
pub mod tl;

pub use spectra::SpectraX;
pub use tl::TlLamp;

/// Desired state of one lamp; `None` fields are left unchanged.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct LampState {
    /// Turn the lamp on or off.
    pub enabled: Option<bool>,
    /// Intensity in the range 0..=255.
    pub intensity: Option<u8>,
}

impl LampState {
    /// State changing only the enable line.
    pub fn enabled(enabled: bool) -> Self {
        Self {
            enabled: Some(enabled),
            intensity: None,
        }
    }

    /// State changing only the intensity.
    pub fn intensity(intensity: u8) -> Self {
        Self {
            enabled: None,
            intensity: Some(intensity),
        }
    }

    /// State pinning both fields.
    pub fn full(enabled: bool, intensity: u8) -> Self {
        Self {
            enabled: Some(enabled),
            intensity: Some(intensity),
        }
    }
}
