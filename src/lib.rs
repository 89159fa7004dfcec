//! Hardware-coordinated image acquisition engine for a research microscope.
//!
//! The engine drives minimum-dead-time, multi-channel acquisitions on an
//! sCMOS camera by compiling high-level exposure steps into a micro-program
//! for an external I/O microcontroller (the IOTool box), which times camera
//! triggers and lamp switching with microsecond precision while the host
//! retrieves frames into named shared-memory buffers.
//!
//! Module map:
//! - [`camera`]: vendor-driver wrapper, feature state stack, acquisition
//!   pipelines, live imaging
//! - [`iotool`]: serial controller for the IOTool byte-code interpreter
//! - [`lamps`]: transmitted-light LED and Spectra X fluorescence bank
//! - [`sequencer`]: exposure-step compilation and run orchestration
//! - [`transport`]: zero-copy / packed image hand-off to clients
//! - [`config`], [`error`], [`serial`]: ambient plumbing

pub mod camera;
pub mod config;
pub mod error;
pub mod iotool;
pub mod lamps;
pub mod sequencer;
pub mod serial;
pub mod transport;

pub use error::{ScopeError, ScopeResult};

/// Install a stderr `tracing` subscriber honoring `RUST_LOG`. Intended for
/// binaries and integration harnesses embedding the engine; returns quietly
/// if a subscriber is already set.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .try_init();
}
