//! End-to-end sequence run against the mock camera driver and scripted
//! serial links: compile steps, store the program, acquire, and hand the
//! images off through the transport layer.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use ism_buffer::BufferRegistry;
use parking_lot::Mutex;

use scope_daq::camera::driver::CameraDriver;
use scope_daq::camera::mock::MockDriver;
use scope_daq::camera::{Aoi, Camera};
use scope_daq::config::ScopeConfig;
use scope_daq::iotool::IoTool;
use scope_daq::lamps::{SpectraX, TlLamp};
use scope_daq::sequencer::{AcquisitionSequencer, LampSelection};
use scope_daq::serial::mock::{MockLink, MockLinkFactory, OpenOutcome};
use scope_daq::transport::{unpack, Compressor, ImageTransfer};

struct Scope {
    sequencer: AcquisitionSequencer,
    camera: Arc<Mutex<Camera>>,
    registry: Arc<BufferRegistry>,
    driver: Arc<MockDriver>,
    iotool_link: MockLink,
    _dir: tempfile::TempDir,
}

fn build_scope() -> Scope {
    let dir = tempfile::tempdir().expect("tempdir");
    let registry = Arc::new(BufferRegistry::with_dir(dir.path().to_path_buf()));
    let config = ScopeConfig::default();

    let driver = MockDriver::new();
    let camera = Arc::new(Mutex::new(
        Camera::new(driver.clone(), registry.clone(), &config.camera).expect("camera init"),
    ));

    let iotool_factory = MockLinkFactory::new();
    let iotool_link = MockLink::new();
    iotool_link
        .state()
        .lock()
        .responses
        .push_back(b"\x80\xff\r\n>".to_vec());
    iotool_factory.script_open(OpenOutcome::Link(MockLink::new()));
    iotool_factory.script_open(OpenOutcome::Link(iotool_link.clone()));
    let iotool = Arc::new(Mutex::new(
        IoTool::new(config.iotool.clone(), Box::new(iotool_factory)).expect("iotool reset"),
    ));

    let spectra_factory = MockLinkFactory::new();
    let spectra_link = MockLink::new();
    spectra_link.state().lock().push_rx(&[0x14, 0x60]); // temperature reply
    spectra_factory.script_open(OpenOutcome::Link(spectra_link));
    let spectra = Arc::new(Mutex::new(
        SpectraX::new(
            &config.spectra,
            config.iotool.lumencor_pins.clone(),
            iotool.clone(),
            &spectra_factory,
        )
        .expect("spectra init"),
    ));

    let tl_lamp = Arc::new(Mutex::new(
        TlLamp::new(iotool.clone(), config.iotool.tl_lamp.clone()).expect("tl lamp"),
    ));

    let sequencer = AcquisitionSequencer::new(
        camera.clone(),
        iotool,
        spectra,
        tl_lamp,
        config,
    );
    Scope {
        sequencer,
        camera,
        registry,
        driver,
        iotool_link,
        _dir: dir,
    }
}

fn fluorescence(lamps: &[&str]) -> LampSelection {
    LampSelection::Fluorescence(lamps.iter().map(|l| (*l).to_string()).collect::<BTreeSet<_>>())
}

#[test]
fn three_step_sequence_returns_named_images_in_order() {
    let mut scope = build_scope();
    scope
        .camera
        .lock()
        .set_aoi(Aoi {
            left: Some(1),
            top: Some(1),
            width: Some(64),
            height: Some(48),
        })
        .expect("small aoi");

    scope
        .sequencer
        .new_sequence(BTreeMap::from([("cyan".to_string(), 180u8)]))
        .expect("new sequence");
    scope
        .sequencer
        .add_step(5.0, fluorescence(&["cyan"]), None, 0.0)
        .expect("cyan step");
    scope
        .sequencer
        .add_step(50.0, LampSelection::TransmittedLight, Some(128), 0.0)
        .expect("TL step");
    scope
        .sequencer
        .add_step(10.0, fluorescence(&["green_yellow", "red"]), None, 1.0)
        .expect("dual lamp step");

    let names = scope.sequencer.run().expect("run");
    assert_eq!(names.len(), 3);
    assert!(names[0].starts_with("sequence@"));
    assert!(names[0].ends_with('0'));
    assert!(names[2].ends_with('2'));

    // each image is registered exactly once, awaiting its transfer
    for name in &names {
        assert_eq!(scope.registry.pending(name), 1);
    }

    // timestamps were extracted and increase across the sequence
    let timestamps = scope.sequencer.get_latest_timestamps().expect("timestamps");
    assert_eq!(timestamps.len(), 3);
    let ticks: Vec<u64> = timestamps.iter().map(|t| t.expect("timestamp")).collect();
    assert!(ticks[0] < ticks[1] && ticks[1] < ticks[2]);

    // total sensor exposures include the readout on top of the lamp window
    let exposures = scope.sequencer.get_exposure_times().expect("exposures");
    assert_eq!(exposures.len(), 3);
    assert!(exposures[1] > 50.0);

    // the IOTool session stored the program, ran it, and the run drained
    // the completion prompt
    let written = scope.iotool_link.state().lock().written_text();
    assert!(written.contains("program\n"));
    assert!(written.contains("end\n"));
    assert!(written.contains("run 1\n"));
    // the stored program switches the configured lamp pins
    assert!(written.contains("sh D3\n")); // cyan on
    assert!(written.contains("sl D3\n")); // cyan off
    assert!(written.contains("pm D0 128\n")); // TL intensity
    assert_eq!(scope.sequencer.get_program_output(), Some(""));

    // camera state fully restored: stack empty, acquisition stopped
    assert_eq!(scope.camera.lock().state_stack_depth(), 0);
    assert!(!scope.driver.get_bool("CameraAcquiring").expect("read"));
}

#[test]
fn sequence_images_flow_through_the_transport_layer() {
    let mut scope = build_scope();
    scope
        .camera
        .lock()
        .set_aoi(Aoi {
            left: Some(1),
            top: Some(1),
            width: Some(32),
            height: Some(16),
        })
        .expect("small aoi");

    scope
        .sequencer
        .add_step(5.0, fluorescence(&["cyan"]), None, 0.0)
        .expect("step");
    let names = scope.sequencer.run().expect("run");

    let transfer = ImageTransfer::new(scope.registry.clone());
    let packed = transfer
        .pack(&names[0], &Compressor::Lz4, None)
        .expect("pack");
    let image = unpack(&packed, &Compressor::Lz4).expect("unpack");
    assert_eq!(image.shape, (32, 16));
    // the name was released by the pack
    assert_eq!(scope.registry.pending(&names[0]), 0);
}

#[test]
fn rerunning_a_sequence_is_deterministic_in_shape() {
    let mut scope = build_scope();
    scope
        .camera
        .lock()
        .set_aoi(Aoi {
            left: Some(1),
            top: Some(1),
            width: Some(32),
            height: Some(16),
        })
        .expect("small aoi");

    scope
        .sequencer
        .add_step(5.0, fluorescence(&["cyan"]), None, 0.0)
        .expect("step");
    scope
        .sequencer
        .add_step(5.0, fluorescence(&["uv"]), None, 0.0)
        .expect("step");

    let first = scope.sequencer.run().expect("first run");
    let second = scope.sequencer.run().expect("second run");
    assert_eq!(first.len(), 2);
    assert_eq!(second.len(), 2);
    // fresh names each run
    assert_ne!(first[0], second[0]);
    assert_eq!(scope.camera.lock().state_stack_depth(), 0);
}
