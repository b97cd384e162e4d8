//! Runs the bundled scenario files end to end.

use dkey_frame::CommandType;
use dkey_sim::{run_scenario, Scenario, SimError, Simulation, Step};

fn load(name: &str) -> Scenario {
    let path = format!("{}/configs/{}", env!("CARGO_MANIFEST_DIR"), name);
    Scenario::from_file(&path).unwrap()
}

#[test]
fn test_basic_scenario() {
    let scenario = load("basic.yaml");
    let mut sim = Simulation::new(&scenario).unwrap();
    let report = sim.run(&scenario.steps, false).unwrap();

    assert_eq!(report.steps_run, scenario.steps.len());
    assert_eq!(report.steps_failed, 0);
    assert_eq!(report.authentications, 1);
    assert_eq!(report.handshake_failures, 0);
    assert_eq!(report.wake_ups, 1);
    assert_eq!(report.commands_sent, 3);
    // three commands plus start, PE and PS
    assert_eq!(report.commands_acknowledged, 6);
    // three command replies plus reference, two acks and the close
    assert_eq!(report.frames_received, 7);
    assert_eq!(report.decode_errors, 0);
    assert_eq!(report.calibrations_uploaded, 1);
    assert_eq!(report.final_state, "disconnected");

    let types: Vec<CommandType> = sim
        .vehicle()
        .received()
        .iter()
        .map(|f| f.command_type)
        .collect();
    assert_eq!(
        types,
        vec![CommandType::Control, CommandType::Transfer, CommandType::Retry]
    );
    assert_eq!(sim.vehicle().received()[0].payload, vec![0x10, 0x01]);

    let uploaded = sim.service().calibrations();
    assert_eq!(uploaded.len(), 1);
    assert_eq!(uploaded[0].vehicle_mode_code, "SIM-A");
    assert_eq!(uploaded[0].pe, vec![0x01, 0x02]);
    assert_eq!(uploaded[0].ps, vec![0x03, 0x04]);
}

#[test]
fn test_tampered_vehicle_stops_run() {
    let scenario = load("tampered.yaml");
    match run_scenario(&scenario, false) {
        Err(SimError::StepFailed { index, action, .. }) => {
            assert_eq!(index, 0);
            assert_eq!(action, "wake_up");
        }
        other => panic!("expected step failure, got {:?}", other),
    }
}

#[test]
fn test_tampered_vehicle_keep_going() {
    let scenario = load("tampered.yaml");
    let report = run_scenario(&scenario, true).unwrap();
    assert_eq!(report.steps_run, 0);
    assert_eq!(report.steps_failed, 2);
    assert_eq!(report.authentications, 0);
    assert_eq!(report.handshake_failures, 1);
    assert_eq!(report.commands_sent, 0);
}

#[test]
fn test_silent_vehicle_times_out() {
    let scenario = load("silent.yaml");
    let mut sim = Simulation::new(&scenario).unwrap();
    let report = sim.run(&scenario.steps, true).unwrap();
    assert_eq!(report.steps_failed, 2);
    assert_eq!(report.handshake_failures, 1);
    assert!(report.log.iter().any(|line| line.contains("HandshakeTimeout")));
    assert!(!sim.engine().is_authenticated());
}

#[test]
fn test_refusing_vehicle() {
    let mut scenario = load("basic.yaml");
    scenario.vehicle.result_status = 3;
    scenario.steps = vec![Step::WakeUp];
    let report = run_scenario(&scenario, true).unwrap();
    assert_eq!(report.steps_failed, 1);
    assert_eq!(report.handshake_failures, 1);
}

#[test]
fn test_explicit_connect_and_region_wake() {
    let mut scenario = load("basic.yaml");
    scenario.steps = vec![
        Step::Connect,
        Step::Disconnect,
        Step::Region {
            inside: true,
            auto_wake: true,
        },
        Step::Transfer {
            payload: "01".to_string(),
        },
    ];
    let report = run_scenario(&scenario, false).unwrap();
    assert_eq!(report.authentications, 2);
    assert_eq!(report.wake_ups, 1);
    assert_eq!(report.commands_sent, 1);
    assert_eq!(report.final_state, "authenticated");
}

#[test]
fn test_retry_needs_a_command() {
    let mut scenario = load("basic.yaml");
    scenario.steps = vec![Step::WakeUp, Step::Retry];
    assert!(matches!(
        run_scenario(&scenario, false),
        Err(SimError::StepFailed { index: 1, .. })
    ));
}
