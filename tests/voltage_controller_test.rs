//! Voltage controller moves and read-back against the simulated DAQ.

use std::sync::Arc;

use qt3_daq::config::ControllerSpec;
use qt3_daq::controllers::{EdgeCounter, Lifecycle, VoltageController};
use qt3_daq::hardware::{EdgeSource, SessionManager, SimulatedDaq};
use qt3_daq::registry::ControllerRegistry;
use qt3_daq::units::LengthUnit;
use qt3_daq::DaqError;

fn vcontrol() -> ControllerSpec {
    ControllerSpec::new(VoltageController::NAMESPACE, VoltageController::TYPE_NAME)
        .with("daq_name", "Dev1")
        .with("write_channels", "ao0")
        .with("min_position", -10.0)
        .with("max_position", 10.0)
        .with("scale_nm_per_volt", 1.0)
}

fn build(sessions: &Arc<SessionManager>, spec: &ControllerSpec) -> Arc<VoltageController> {
    ControllerRegistry::with_defaults()
        .resolve(spec, sessions)
        .unwrap()
        .as_voltage()
        .cloned()
        .unwrap()
}

#[test]
fn test_move_to_and_read_position() {
    let daq = Arc::new(SimulatedDaq::new());
    let sessions = Arc::new(SessionManager::new(daq.clone()));
    let piezo = build(&sessions, &vcontrol());
    assert_eq!(piezo.minimum_allowed_position(), -10.0);
    assert_eq!(piezo.maximum_allowed_position(), 10.0);

    piezo.start().unwrap();
    piezo.move_to(&[5.0]).unwrap();
    let position = piezo.read_position().unwrap();
    assert_eq!(position.len(), 1);
    assert!((position[0] - 5.0).abs() < 1e-9);
    assert!((daq.output_level("Dev1", "ao0").unwrap() - 15.0).abs() < 1e-9);

    let err = piezo.move_to(&[12.0]).unwrap_err();
    assert!(matches!(err, DaqError::PositionOutOfRange { axis: 0, .. }));
    // A rejected move leaves the output where it was
    assert!((piezo.read_position().unwrap()[0] - 5.0).abs() < 1e-9);
    piezo.stop().unwrap();
}

#[test]
fn test_per_axis_calibration_through_loopback() {
    let daq = Arc::new(SimulatedDaq::new().with_resolution_bits(16));
    for (ai, ao) in [("ai0", "ao0"), ("ai1", "ao1"), ("ai2", "ao2")] {
        daq.connect_loopback("Dev1", ai, ao);
    }
    let sessions = Arc::new(SessionManager::new(daq.clone()));
    let spec = ControllerSpec::new(VoltageController::NAMESPACE, VoltageController::TYPE_NAME)
        .with("daq_name", "Dev1")
        .with("write_channels", vec!["ao0", "ao1", "ao2"])
        .with("read_channels", "ai0,ai1,ai2")
        .with("min_position", vec![0.0, 0.0, -50.0])
        .with("max_position", vec![80.0, 80.0, 50.0])
        .with("scale_nm_per_volt", vec![8.0, 8.0, 10.0]);
    let piezo = build(&sessions, &spec);
    assert_eq!(piezo.n_axes(), 3);
    assert_eq!(piezo.position_limits(2), Some((-50.0, 50.0)));
    assert_eq!(piezo.position_limits(3), None);

    piezo.start().unwrap();
    piezo.move_to(&[40.0, 20.0, 25.0]).unwrap();
    let volts = piezo.current_voltages().unwrap();
    let expected = [5.0, 2.5, 7.5];
    // One LSB over a 20 V span at 16 bits
    let lsb = 20.0 / 65_535.0;
    for (v, e) in volts.iter().zip(expected) {
        assert!((v - e).abs() <= lsb, "{v} vs {e}");
    }
    let position = piezo.read_position().unwrap();
    assert!((position[2] - 25.0).abs() <= 10.0 * lsb);

    assert!(matches!(
        piezo.move_to(&[1.0, 2.0]),
        Err(DaqError::ChannelCountMismatch { expected: 3, actual: 2 })
    ));
    piezo.close();
    assert_eq!(sessions.active_sessions(), 0);
}

#[test]
fn test_clamp_policy_and_micron_units() {
    let daq = Arc::new(SimulatedDaq::new());
    let sessions = Arc::new(SessionManager::new(daq.clone()));
    let piezo = build(
        &sessions,
        &vcontrol()
            .with("out_of_range", "clamp")
            .with("units", "um"),
    );
    piezo.start().unwrap();

    piezo.move_to(&[25.0]).unwrap();
    assert!((piezo.read_position().unwrap()[0] - 10.0).abs() < 1e-9);

    piezo.move_to_in(&[-2_000.0], LengthUnit::Nanometers).unwrap();
    assert!((piezo.read_position().unwrap()[0] + 2.0).abs() < 1e-9);
    assert!((piezo.read_position_in(LengthUnit::Nanometers).unwrap()[0] + 2_000.0).abs() < 1e-6);
    piezo.stop().unwrap();
}

#[test]
fn test_counter_and_piezo_share_a_device() {
    let daq = Arc::new(SimulatedDaq::new());
    daq.set_edge_source("Dev1", "PFI0", EdgeSource::Constant { hz: 5_000.0 });
    let sessions = Arc::new(SessionManager::new(daq.clone()));
    let registry = ControllerRegistry::with_defaults();
    let counter_spec = ControllerSpec::new(EdgeCounter::NAMESPACE, EdgeCounter::TYPE_NAME)
        .with("daq_name", "Dev1")
        .with("signal_terminal", "PFI0")
        .with("signal_counter", "ctr2")
        .with("clock_rate", 100_000.0)
        .with("num_data_samples_per_batch", 1_000.0);
    let counter = registry.resolve(&counter_spec, &sessions).unwrap();
    let counter = counter.as_edge_counter().unwrap();
    let piezo = build(&sessions, &vcontrol());

    counter.start().unwrap();
    piezo.start().unwrap();

    let mover = {
        let piezo = Arc::clone(&piezo);
        std::thread::spawn(move || {
            for step in 0..20 {
                piezo.move_to(&[f64::from(step) * 0.5 - 5.0]).unwrap();
            }
        })
    };
    for _ in 0..5 {
        assert_eq!(counter.read_batch().unwrap().total(), 50);
    }
    mover.join().unwrap();
    assert!((piezo.read_position().unwrap()[0] - 4.5).abs() < 1e-9);

    counter.stop().unwrap();
    piezo.stop().unwrap();
    assert_eq!(sessions.active_sessions(), 0);
}

#[test]
fn test_second_controller_on_same_output_rejected() {
    let daq = Arc::new(SimulatedDaq::new());
    let sessions = Arc::new(SessionManager::new(daq.clone()));
    let a = build(&sessions, &vcontrol());
    let b = build(&sessions, &vcontrol());
    a.start().unwrap();
    assert!(matches!(
        b.start(),
        Err(DaqError::SessionAlreadyActive { .. })
    ));
    assert!(matches!(a.start(), Err(DaqError::InvalidState { .. })));
    a.stop().unwrap();
    b.start().unwrap();
    b.stop().unwrap();
}

fn looped_back(daq: &SimulatedDaq, pairs: &[(&str, &str)]) {
    for (ai, ao) in pairs {
        daq.connect_loopback("Dev1", ai, ao);
    }
}

#[test]
fn test_scalar_calibration_round_trip_over_window() {
    let daq = Arc::new(SimulatedDaq::new());
    looped_back(&daq, &[("ai0", "ao0")]);
    let sessions = Arc::new(SessionManager::new(daq.clone()));
    let piezo = build(&sessions, &vcontrol().with("read_channels", "ai0"));
    piezo.start().unwrap();

    for i in 0..=40 {
        let target = -10.0 + f64::from(i) * 0.5;
        piezo.move_to(&[target]).unwrap();
        let position = piezo.read_position().unwrap();
        assert!((position[0] - target).abs() < 1e-9, "{target} read back as {}", position[0]);
    }
    piezo.stop().unwrap();
}

#[test]
fn test_per_axis_calibration_round_trip_over_window() {
    let daq = Arc::new(SimulatedDaq::new());
    looped_back(&daq, &[("ai0", "ao0"), ("ai1", "ao1"), ("ai2", "ao2")]);
    let sessions = Arc::new(SessionManager::new(daq.clone()));
    let spec = ControllerSpec::new(VoltageController::NAMESPACE, VoltageController::TYPE_NAME)
        .with("daq_name", "Dev1")
        .with("write_channels", vec!["ao0", "ao1", "ao2"])
        .with("read_channels", vec!["ai0", "ai1", "ai2"])
        .with("min_position", vec![0.0, 10.0, -50.0])
        .with("max_position", vec![80.0, 30.0, 50.0])
        .with("scale_nm_per_volt", vec![8.0, 2.0, 10.0]);
    let piezo = build(&sessions, &spec);
    piezo.start().unwrap();

    let limits: Vec<(f64, f64)> = (0..3).map(|axis| piezo.position_limits(axis).unwrap()).collect();
    for step in 0..=10 {
        let t = f64::from(step) / 10.0;
        let targets: Vec<f64> = limits.iter().map(|(lo, hi)| lo + t * (hi - lo)).collect();
        piezo.move_to(&targets).unwrap();
        let position = piezo.read_position().unwrap();
        for (axis, (p, target)) in position.iter().zip(&targets).enumerate() {
            assert!((p - target).abs() < 1e-9, "axis {axis}: {target} read back as {p}");
        }
    }
    // Both ends of every window are admitted
    piezo.move_to(&[80.0, 30.0, 50.0]).unwrap();
    piezo.move_to(&[0.0, 10.0, -50.0]).unwrap();
    piezo.stop().unwrap();
}

#[test]
fn test_start_recovers_after_write_fault() {
    let daq = Arc::new(SimulatedDaq::new());
    let sessions = Arc::new(SessionManager::new(daq.clone()));
    let piezo = build(&sessions, &vcontrol());
    piezo.start().unwrap();
    piezo.move_to(&[1.0]).unwrap();

    daq.inject_fault("Dev1", "DAC overcurrent");
    let err = piezo.move_to(&[2.0]).unwrap_err();
    assert!(matches!(err, DaqError::HardwareFault { .. }));
    assert!(!piezo.is_running());
    assert!(matches!(
        piezo.move_to(&[2.0]),
        Err(DaqError::InvalidState { .. })
    ));

    piezo.start().unwrap();
    assert!(piezo.is_running());
    piezo.move_to(&[2.0]).unwrap();
    assert!((piezo.read_position().unwrap()[0] - 2.0).abs() < 1e-9);
    assert!(matches!(piezo.start(), Err(DaqError::InvalidState { .. })));
    piezo.stop().unwrap();
    assert_eq!(sessions.active_sessions(), 0);
}

#[test]
fn test_start_recovers_after_read_fault() {
    let daq = Arc::new(SimulatedDaq::new());
    looped_back(&daq, &[("ai0", "ao0")]);
    let sessions = Arc::new(SessionManager::new(daq.clone()));
    let piezo = build(&sessions, &vcontrol().with("read_channels", "ai0"));
    piezo.start().unwrap();
    piezo.move_to(&[3.0]).unwrap();

    daq.inject_fault("Dev1", "ADC overrange");
    let err = piezo.read_position().unwrap_err();
    assert!(matches!(err, DaqError::HardwareFault { .. }));
    assert!(!piezo.is_running());

    piezo.start().unwrap();
    assert!(piezo.is_running());
    assert!((piezo.read_position().unwrap()[0] - 3.0).abs() < 1e-9);
    piezo.move_to(&[-4.0]).unwrap();
    assert!((piezo.read_position().unwrap()[0] + 4.0).abs() < 1e-9);
    piezo.stop().unwrap();
}
