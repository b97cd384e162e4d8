//! Scenario runner.
//!
//! Owns the engine, the loopback radio and the simulated vehicle, and
//! settles every step by replaying radio completions until the channel is
//! empty.

use crate::loopback::{LoopbackTransport, RadioOp};
use crate::scenario::{decode_hex, Scenario, SimError, SimResult, Step};
use crate::vehicle::SimVehicle;
use crossbeam_channel::Receiver;
use dkey_ble::{
    CalibrationKind, ConnectionState, DeviceFingerprint, DigitalKeyEngine, EngineError,
    HandshakeEvent, RegionState, SessionEvent,
};
use dkey_frame::{CommandFrame, PermissionMask};
use dkey_keys::MemoryKeyService;
use serde::Serialize;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const AUTH_TOKEN: &str = "dkey-sim-token";

/// Summary of a run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimReport {
    /// Steps that completed.
    pub steps_run: usize,
    /// Steps that failed.
    pub steps_failed: usize,
    /// Successful handshakes.
    pub authentications: usize,
    /// Handshakes that ended without a key.
    pub handshake_failures: usize,
    /// Commands accepted by `send` or `retry`.
    pub commands_sent: usize,
    /// Commands and calibration frames whose write completed.
    pub commands_acknowledged: usize,
    /// Frames received from the vehicle.
    pub frames_received: usize,
    /// Inbound frames that failed to decode.
    pub decode_errors: usize,
    /// Calibration records uploaded.
    pub calibrations_uploaded: usize,
    /// Wake-ups that reached an authenticated link.
    pub wake_ups: usize,
    /// Engine state at the end of the run.
    pub final_state: String,
    /// Every event, in order.
    pub log: Vec<String>,
}

/// A running simulation.
pub struct Simulation {
    engine: DigitalKeyEngine<LoopbackTransport>,
    events: Receiver<SessionEvent>,
    ops: Receiver<RadioOp>,
    vehicle: SimVehicle,
    service: MemoryKeyService,
    elapsed: Duration,
    last_command: Option<CommandFrame>,
    last_wake: Option<Result<(), EngineError>>,
    last_failure: Option<EngineError>,
    report: SimReport,
}

impl Simulation {
    /// Build the engine, backend and vehicle for `scenario`, and install the
    /// scenario's key through the backend.
    pub fn new(scenario: &Scenario) -> SimResult<Self> {
        let mut vehicle = SimVehicle::new(&scenario.vehicle, &scenario.vehicle_seed()?)?;
        vehicle.trust(&scenario.key.dk_id, &scenario.key_public()?)?;

        let device_seed = scenario.key.device_seed.as_bytes();
        let mobile_id = DeviceFingerprint::from_seed(device_seed).to_hex();
        let mut service = MemoryKeyService::new(AUTH_TOKEN, mobile_id);
        service.provision(
            scenario.key_info(),
            scenario.key_material(vehicle.public_key())?,
        );

        let (ops_tx, ops) = crossbeam_channel::unbounded();
        let (mut engine, events) = DigitalKeyEngine::new(
            scenario.engine.clone(),
            device_seed,
            LoopbackTransport::new(ops_tx),
        )?;
        engine.keys_mut().install_from(
            &mut service,
            &scenario.vehicle.vin,
            &scenario.key.dk_id,
            AUTH_TOKEN,
        )?;
        engine.set_current_key(&scenario.key.dk_id);
        info!(
            "Sim: engine {} for device {}",
            DigitalKeyEngine::<LoopbackTransport>::version(),
            engine.mobile_id()
        );

        Ok(Simulation {
            engine,
            events,
            ops,
            vehicle,
            service,
            elapsed: Duration::ZERO,
            last_command: None,
            last_wake: None,
            last_failure: None,
            report: SimReport::default(),
        })
    }

    /// The engine.
    pub fn engine(&self) -> &DigitalKeyEngine<LoopbackTransport> {
        &self.engine
    }

    /// The vehicle.
    pub fn vehicle(&self) -> &SimVehicle {
        &self.vehicle
    }

    /// The backend.
    pub fn service(&self) -> &MemoryKeyService {
        &self.service
    }

    /// Run `steps` in order.
    ///
    /// With `keep_going`, a failed step is logged and counted and the run
    /// continues; otherwise the first failure is returned.
    pub fn run(&mut self, steps: &[Step], keep_going: bool) -> SimResult<SimReport> {
        for (index, step) in steps.iter().enumerate() {
            info!("Sim: step {} {}", index, step.action());
            match self.run_step(step) {
                Ok(()) => self.report.steps_run += 1,
                Err(e) => {
                    let err = SimError::StepFailed {
                        index,
                        action: step.action(),
                        reason: e.to_string(),
                    };
                    if !keep_going {
                        return Err(err);
                    }
                    warn!("Sim: {}", err);
                    self.report.steps_failed += 1;
                }
            }
        }
        self.report.final_state = self.engine.state().to_string();
        Ok(self.report.clone())
    }

    fn run_step(&mut self, step: &Step) -> SimResult<()> {
        self.last_wake = None;
        self.last_failure = None;
        match step {
            Step::WakeUp => {
                self.engine.wake_up()?;
                self.settle();
                match self.last_wake.take() {
                    Some(Ok(())) => Ok(()),
                    Some(Err(e)) => Err(e.into()),
                    None => Err(SimError::Invalid("wake-up did not resolve".to_string())),
                }
            }
            Step::Connect => {
                if self.engine.state() != ConnectionState::Found {
                    if !self.engine.start_scan() {
                        return Err(EngineError::RadioUnavailable.into());
                    }
                    self.settle();
                }
                self.engine.connect()?;
                self.settle();
                self.expect_authenticated()
            }
            Step::Control { mask, payload } => {
                let mask = PermissionMask::parse_hex(mask).map_err(EngineError::from)?;
                let frame = CommandFrame::control(mask, decode_hex("payload", payload)?);
                self.send(frame)
            }
            Step::Transfer { payload } => {
                self.send(CommandFrame::transfer(decode_hex("payload", payload)?))
            }
            Step::Retry => {
                let frame = self
                    .last_command
                    .clone()
                    .ok_or_else(|| SimError::Invalid("nothing to retry".to_string()))?;
                self.engine.retry(&frame)?;
                self.report.commands_sent += 1;
                self.settle();
                Ok(())
            }
            Step::Calibrate { mode_code, pe, ps } => {
                self.engine.demarcate_start()?;
                self.settle();
                self.engine
                    .submit_calibration(CalibrationKind::Pe, &decode_hex("pe", pe)?)?;
                self.settle();
                self.engine
                    .submit_calibration(CalibrationKind::Ps, &decode_hex("ps", ps)?)?;
                self.settle();
                let record = self.engine.upload_calibration(&mut self.service, mode_code)?;
                debug!("Sim: uploaded {:?}", record);
                self.report.calibrations_uploaded += 1;
                Ok(())
            }
            Step::Region { inside, auto_wake } => {
                if *auto_wake {
                    self.engine.monitor_auto_wake(true);
                }
                let state = if *inside {
                    RegionState::Inside
                } else {
                    RegionState::Outside
                };
                self.engine.on_region(state);
                self.settle();
                match self.last_wake.take() {
                    Some(Err(e)) => Err(e.into()),
                    _ => Ok(()),
                }
            }
            Step::Wait { secs } => {
                self.elapsed += Duration::from_secs(*secs);
                self.engine.poll_timeouts(Instant::now() + self.elapsed);
                self.settle();
                match self.last_failure.take() {
                    Some(e) => Err(e.into()),
                    None => Ok(()),
                }
            }
            Step::Disconnect => {
                self.engine.disconnect()?;
                self.settle();
                Ok(())
            }
        }
    }

    fn send(&mut self, frame: CommandFrame) -> SimResult<()> {
        self.engine.send(frame.clone())?;
        self.report.commands_sent += 1;
        self.last_command = Some(frame);
        self.settle();
        Ok(())
    }

    fn expect_authenticated(&mut self) -> SimResult<()> {
        if self.engine.is_authenticated() {
            return Ok(());
        }
        Err(match self.last_failure.take() {
            Some(e) => e.into(),
            None => SimError::Invalid(format!("link ended in state {}", self.engine.state())),
        })
    }

    /// Play radio completions back into the engine until nothing is left.
    pub fn settle(&mut self) {
        while let Ok(op) = self.ops.try_recv() {
            match op {
                RadioOp::StartScan => {
                    self.engine.on_peripheral_found(self.vehicle.peripheral());
                }
                RadioOp::StopScan => {}
                RadioOp::Connect(peripheral) => {
                    debug!("Sim: link up to {}", peripheral.id);
                    self.vehicle.on_connect();
                    self.engine.on_connected();
                }
                RadioOp::Write(bytes) => {
                    self.engine.on_write_complete(Ok(()));
                    for reply in self.vehicle.receive(&bytes) {
                        self.engine.on_data(&reply);
                    }
                }
                RadioOp::Disconnect => {
                    self.vehicle.on_disconnect();
                    self.engine.on_disconnected();
                }
            }
            self.collect_events();
        }
        self.collect_events();
    }

    fn collect_events(&mut self) {
        while let Ok(event) = self.events.try_recv() {
            info!("Sim: {:?}", event);
            match &event {
                SessionEvent::Handshake(HandshakeEvent::Success) => {
                    self.report.authentications += 1
                }
                SessionEvent::Handshake(HandshakeEvent::Failure(e)) => {
                    self.report.handshake_failures += 1;
                    self.last_failure = Some(e.clone());
                }
                SessionEvent::Connect(Err(e)) => self.last_failure = Some(e.clone()),
                SessionEvent::Sent(Ok(_)) => self.report.commands_acknowledged += 1,
                SessionEvent::Receive(Ok(_)) => self.report.frames_received += 1,
                SessionEvent::Receive(Err(_)) => self.report.decode_errors += 1,
                SessionEvent::WakeUp(result) => {
                    if result.is_ok() {
                        self.report.wake_ups += 1;
                    }
                    self.last_wake = Some(result.clone());
                }
                _ => {}
            }
            self.report.log.push(format!("{:?}", event));
        }
    }
}

/// Build a simulation for `scenario` and run its steps.
pub fn run_scenario(scenario: &Scenario, keep_going: bool) -> SimResult<SimReport> {
    let mut sim = Simulation::new(scenario)?;
    sim.run(&scenario.steps, keep_going)
}
