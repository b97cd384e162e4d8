//! The digital key engine.
//!
//! [`DigitalKeyEngine`] owns the connection state machine, the session, the
//! handshake and the outbound dispatcher for one vehicle link. It is
//! sans-IO: radio requests go out through a [`Transport`], completions come
//! back through the `on_*` methods, and everything the application needs to
//! know is sent as a [`SessionEvent`] on the channel returned by
//! [`DigitalKeyEngine::new`].

use crate::calibration::{CalibrationKind, CalibrationSession};
use crate::dispatcher::Outbound;
use crate::events::{HandshakeEvent, SessionEvent};
use crate::handshake::{ChallengeLedger, KeyAgreement, RoundOutcome, SignedEcdhHandshake};
use crate::region::{RegionMonitor, RegionState};
use crate::session::BleSession;
use crate::transport::{Peripheral, Transport, TransportError};
use crate::{
    AdapterStatus, BleStatus, ConnectionState, DeviceFingerprint, EngineConfig, EngineError,
    EngineResult, RejectReason,
};
use crossbeam_channel::{Receiver, Sender};
use dkey_frame::{
    decode_frame, encode_frame, peek_command_type, CommandFrame, CommandType, DecodeError,
    SessionKey,
};
use dkey_keys::{CalibrationRecord, InstalledKey, KeyLifecycleService, KeyStore};
use dkey_metrics::{metric_defs, SessionLabels};
use std::time::Instant;
use tracing::{debug, info, trace, warn};

/// Builds the key agreement used for each connection attempt.
pub type HandshakeFactory = Box<
    dyn Fn(&DeviceFingerprint, &InstalledKey) -> EngineResult<Box<dyn KeyAgreement + Send>>
        + Send,
>;

fn default_handshake_factory() -> HandshakeFactory {
    Box::new(
        |fingerprint: &DeviceFingerprint,
         key: &InstalledKey|
         -> EngineResult<Box<dyn KeyAgreement + Send>> {
            Ok(Box::new(SignedEcdhHandshake::new(fingerprint, key)?))
        },
    )
}

const NO_VEHICLE: &str = "none";

/// BLE connection and authentication engine for one vehicle link.
pub struct DigitalKeyEngine<T: Transport> {
    config: EngineConfig,
    fingerprint: DeviceFingerprint,
    transport: T,
    keys: KeyStore,

    // Connection state
    state: ConnectionState,
    adapter: AdapterStatus,
    last_status: Option<BleStatus>,
    session: Option<BleSession>,
    target: Option<Peripheral>,
    scan_started: Option<Instant>,

    // Survives sessions
    ledger: ChallengeLedger,
    region: RegionMonitor,
    wake_pending: bool,

    events: Sender<SessionEvent>,
    labels: SessionLabels,
    handshake_factory: HandshakeFactory,
}

impl<T: Transport> DigitalKeyEngine<T> {
    /// Create an engine.
    ///
    /// `device_seed` is a stable platform identifier; the device fingerprint
    /// is derived from it once here.
    pub fn new(
        config: EngineConfig,
        device_seed: &[u8],
        transport: T,
    ) -> EngineResult<(Self, Receiver<SessionEvent>)> {
        config.validate()?;
        let (events, receiver) = crossbeam_channel::unbounded();
        let fingerprint = DeviceFingerprint::from_seed(device_seed);
        let adapter = transport.adapter_status();
        info!(
            "Engine: created for device {} (adapter {:?})",
            fingerprint, adapter
        );
        let engine = DigitalKeyEngine {
            config,
            fingerprint,
            transport,
            keys: KeyStore::new(),
            state: ConnectionState::Idle,
            adapter,
            last_status: None,
            session: None,
            target: None,
            scan_started: None,
            ledger: ChallengeLedger::default(),
            region: RegionMonitor::new(),
            wake_pending: false,
            events,
            labels: SessionLabels::new(NO_VEHICLE),
            handshake_factory: default_handshake_factory(),
        };
        Ok((engine, receiver))
    }

    /// Replace the key agreement scheme.
    pub fn with_handshake_factory(mut self, factory: HandshakeFactory) -> Self {
        self.handshake_factory = factory;
        self
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Engine version.
    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    /// Device fingerprint.
    pub fn fingerprint(&self) -> &DeviceFingerprint {
        &self.fingerprint
    }

    /// Mobile id sent to the backend.
    pub fn mobile_id(&self) -> String {
        self.fingerprint.to_hex()
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Last status reported to the application.
    pub fn ble_status(&self) -> Option<BleStatus> {
        self.last_status
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// Whether a session key is installed.
    pub fn is_authenticated(&self) -> bool {
        self.state == ConnectionState::Authenticated
    }

    /// Current session.
    pub fn session(&self) -> Option<&BleSession> {
        self.session.as_ref()
    }

    /// Key of the current session.
    pub fn session_key(&self) -> Option<&SessionKey> {
        self.session.as_ref().and_then(BleSession::key)
    }

    /// Peripheral to connect to.
    pub fn target(&self) -> Option<&Peripheral> {
        self.target.as_ref()
    }

    /// Installed keys.
    pub fn keys(&self) -> &KeyStore {
        &self.keys
    }

    /// Installed keys, mutable.
    pub fn keys_mut(&mut self) -> &mut KeyStore {
        &mut self.keys
    }

    /// Select the key used by the next connection.
    pub fn set_current_key(&mut self, dk_id: &str) -> bool {
        self.keys.set_current(dk_id)
    }

    /// Region reported last.
    pub fn region(&self) -> RegionState {
        self.region.state()
    }

    /// Transport.
    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Transport, mutable.
    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    // ========================================================================
    // Radio adapter
    // ========================================================================

    /// Adapter status changed.
    ///
    /// Losing the radio tears down any session and returns to `Idle`.
    pub fn on_adapter_status(&mut self, status: AdapterStatus) {
        if status == self.adapter {
            return;
        }
        debug!(
            "Engine[{}]: adapter {:?} -> {:?}",
            self.labels.vehicle, self.adapter, status
        );
        self.adapter = status;
        self.report(BleStatus::from(status));

        if !status.is_available() && self.state != ConnectionState::Idle {
            let state = self.state;
            self.release_session(EngineError::RadioUnavailable);
            match state {
                ConnectionState::Connecting => {
                    self.emit(SessionEvent::Connect(Err(EngineError::RadioUnavailable)))
                }
                ConnectionState::Disconnecting => self.emit(SessionEvent::Disconnect(Ok(()))),
                _ => {}
            }
            self.scan_started = None;
            self.resolve_wake(Err(EngineError::RadioUnavailable));
            self.set_state(ConnectionState::Idle);
        }
    }

    // ========================================================================
    // Scanning
    // ========================================================================

    /// Start scanning for the vehicle.
    ///
    /// Returns false if the radio is unavailable. Already scanning or
    /// connected is a no-op returning true.
    pub fn start_scan(&mut self) -> bool {
        if !self.adapter.is_available() {
            debug!("Engine[{}]: scan refused, radio unavailable", self.labels.vehicle);
            return false;
        }
        if self.state == ConnectionState::Scanning
            || self.state.has_link()
            || self.state == ConnectionState::Disconnecting
        {
            return true;
        }
        if let Err(e) = self.transport.start_scan(&self.config.ble.service_uuid) {
            warn!("Engine[{}]: start scan failed: {}", self.labels.vehicle, e);
            return false;
        }
        self.scan_started = Some(Instant::now());
        self.set_state(ConnectionState::Scanning);
        true
    }

    /// Stop scanning. Returns false if no scan was running.
    pub fn stop_scan(&mut self) -> bool {
        if self.state != ConnectionState::Scanning {
            return false;
        }
        if let Err(e) = self.transport.stop_scan() {
            warn!("Engine[{}]: stop scan failed: {}", self.labels.vehicle, e);
        }
        self.scan_started = None;
        self.set_state(ConnectionState::Idle);
        self.resolve_wake(Err(EngineError::PeripheralNotFound));
        true
    }

    /// A peripheral was discovered. Returns true if it became the target.
    pub fn on_peripheral_found(&mut self, peripheral: Peripheral) -> bool {
        if self.state != ConnectionState::Scanning {
            trace!(
                "Engine[{}]: ignoring peripheral {} while {}",
                self.labels.vehicle,
                peripheral.name,
                self.state
            );
            return false;
        }
        if !peripheral.name.starts_with(&self.config.ble.name_prefix) {
            trace!("Engine: peripheral {} does not match", peripheral.name);
            return false;
        }
        if let Err(e) = self.transport.stop_scan() {
            warn!("Engine[{}]: stop scan failed: {}", self.labels.vehicle, e);
        }
        self.scan_started = None;
        self.labels = SessionLabels::new(peripheral.name.clone());
        debug!(
            "Engine[{}]: found peripheral {} (rssi {:?})",
            self.labels.vehicle, peripheral.id, peripheral.rssi
        );
        self.target = Some(peripheral);
        self.set_state(ConnectionState::Found);

        if self.wake_pending {
            if let Err(e) = self.connect() {
                self.resolve_wake(Err(e));
            }
        }
        true
    }

    // ========================================================================
    // Connection
    // ========================================================================

    /// Connect to the found or previously known vehicle.
    ///
    /// Usage errors are returned without side effects. Once accepted, the
    /// outcome arrives as exactly one `SessionEvent::Connect`.
    pub fn connect(&mut self) -> EngineResult<()> {
        if !self.adapter.is_available() {
            return Err(EngineError::RadioUnavailable);
        }
        if self.state != ConnectionState::Found && !self.state.is_at_rest() {
            return Err(EngineError::InvalidState {
                operation: "connect",
                state: self.state,
            });
        }
        let target = self.target.clone().ok_or(EngineError::PeripheralNotFound)?;
        let key = self.keys.current().ok_or(EngineError::NoDigitalKey)?;
        let handshake = (self.handshake_factory)(&self.fingerprint, key)?;

        let mut session = BleSession::new(target.clone(), &self.config, Instant::now());
        session.attach_handshake(handshake);
        self.session = Some(session);
        self.set_state(ConnectionState::Connecting);

        if let Err(e) = self.transport.connect(&target) {
            self.fail_connect(e.to_string());
        }
        Ok(())
    }

    /// Transport reports the link is up. Starts the handshake.
    pub fn on_connected(&mut self) {
        if self.state != ConnectionState::Connecting {
            warn!(
                "Engine[{}]: unexpected connect completion while {}",
                self.labels.vehicle, self.state
            );
            return;
        }
        self.set_state(ConnectionState::Connected);
        self.emit(SessionEvent::Connect(Ok(())));
        self.begin_handshake();
    }

    /// Transport reports the link could not be established.
    pub fn on_connect_failed(&mut self, reason: impl Into<String>) {
        if self.state != ConnectionState::Connecting {
            return;
        }
        self.fail_connect(reason.into());
    }

    fn fail_connect(&mut self, reason: String) {
        warn!("Engine[{}]: connect failed: {}", self.labels.vehicle, reason);
        metrics::counter!(metric_defs::CONNECT_FAILURES.name, &self.labels.to_labels())
            .increment(1);
        let err = EngineError::ConnectFailed(reason);
        self.release_session(err.clone());
        self.set_state(ConnectionState::ConnectFailed);
        self.emit(SessionEvent::Connect(Err(err.clone())));
        self.resolve_wake(Err(err));
    }

    /// Tear the link down.
    ///
    /// The session key, handshake and calibration are released before this
    /// returns. The teardown outcome arrives as one
    /// `SessionEvent::Disconnect`.
    pub fn disconnect(&mut self) -> EngineResult<()> {
        let state = self.state;
        if !state.has_link() {
            return Err(EngineError::InvalidState {
                operation: "disconnect",
                state,
            });
        }
        self.set_state(ConnectionState::Disconnecting);
        self.release_session(EngineError::HandshakeCancelled);
        if state == ConnectionState::Connecting {
            self.emit(SessionEvent::Connect(Err(EngineError::ConnectFailed(
                "cancelled by disconnect".to_string(),
            ))));
        }
        self.resolve_wake(Err(EngineError::HandshakeCancelled));

        if let Err(e) = self.transport.disconnect() {
            self.finish_disconnect(Err(EngineError::DisconnectFailed(e.to_string())));
        }
        Ok(())
    }

    /// Transport reports the link is down.
    pub fn on_disconnected(&mut self) {
        match self.state {
            ConnectionState::Disconnecting => self.finish_disconnect(Ok(())),
            ConnectionState::Connecting => self.fail_connect("link lost".to_string()),
            state if state.has_link() => {
                info!("Engine[{}]: link lost while {}", self.labels.vehicle, state);
                self.release_session(EngineError::HandshakeCancelled);
                self.resolve_wake(Err(EngineError::HandshakeCancelled));
                self.set_state(ConnectionState::Disconnected);
            }
            state => trace!(
                "Engine[{}]: disconnect notification while {}",
                self.labels.vehicle,
                state
            ),
        }
    }

    /// Transport reports the teardown failed.
    pub fn on_disconnect_failed(&mut self, reason: impl Into<String>) {
        if self.state == ConnectionState::Disconnecting {
            self.finish_disconnect(Err(EngineError::DisconnectFailed(reason.into())));
        }
    }

    fn finish_disconnect(&mut self, result: EngineResult<()>) {
        let next = if result.is_ok() {
            ConnectionState::Disconnected
        } else {
            ConnectionState::DisconnectFailed
        };
        self.set_state(next);
        self.emit(SessionEvent::Disconnect(result));
    }

    /// Drop the session, resolving everything it still owed.
    fn release_session(&mut self, cause: EngineError) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        if session.handshake_running() {
            self.record_handshake_end(&session, "cancelled");
            self.emit(SessionEvent::Handshake(HandshakeEvent::Failure(
                EngineError::HandshakeCancelled,
            )));
        }
        for owed in session.dispatcher.clear() {
            self.emit(SessionEvent::Sent(Err(cause.clone())));
            trace!(
                "Engine[{}]: dropped unsent {} frame",
                self.labels.vehicle,
                owed.command_type
            );
        }
        debug!(
            "Engine[{}]: session released after {:?}",
            self.labels.vehicle,
            session.age(Instant::now())
        );
    }

    // ========================================================================
    // Handshake
    // ========================================================================

    fn begin_handshake(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let Some(payload) = session.begin_handshake(&mut self.ledger, Instant::now()) else {
            return;
        };
        metrics::counter!(metric_defs::HANDSHAKE_STARTED.name, &self.labels.to_labels())
            .increment(1);
        self.set_state(ConnectionState::Authenticating);

        let result = encode_frame(&CommandFrame::auth(payload), None)
            .map_err(EngineError::from)
            .and_then(|bytes| self.queue(CommandType::Auth, bytes, false));
        if let Err(e) = result {
            self.fail_auth(e);
        }
    }

    fn on_auth_payload(&mut self, payload: &[u8]) {
        let outcome = match self.session.as_mut().and_then(|s| s.handshake_mut()) {
            Some(handshake) => handshake.consume(payload, &mut self.ledger),
            None => return,
        };
        match outcome {
            RoundOutcome::Continue(reply) => {
                trace!("Engine[{}]: handshake round accepted", self.labels.vehicle);
                let result = encode_frame(&CommandFrame::auth(reply), None)
                    .map_err(EngineError::from)
                    .and_then(|bytes| {
                        self.queue(CommandType::Auth, bytes.clone(), false)?;
                        Ok(bytes)
                    });
                match result {
                    // A refused write fails the attempt inside `queue`.
                    Ok(_) if self.state != ConnectionState::Authenticating => {}
                    Ok(bytes) => self.emit(SessionEvent::Handshake(HandshakeEvent::Process(bytes))),
                    Err(e) => self.fail_auth(e),
                }
            }
            RoundOutcome::Success { reply, key } => {
                if let Some(reply) = reply {
                    let result = encode_frame(&CommandFrame::auth(reply), None)
                        .map_err(EngineError::from)
                        .and_then(|bytes| self.queue(CommandType::Auth, bytes, false));
                    if let Err(e) = result {
                        self.fail_auth(e);
                        return;
                    }
                    if self.state != ConnectionState::Authenticating {
                        return;
                    }
                }
                self.complete_auth(key);
            }
            RoundOutcome::Failure(reason) => {
                self.fail_auth(EngineError::HandshakeRejected(reason));
            }
        }
    }

    fn complete_auth(&mut self, key: SessionKey) {
        if let Some(session) = self.session.as_ref() {
            self.record_handshake_end(session, "success");
        }
        info!(
            "Engine[{}]: authenticated, session key {}",
            self.labels.vehicle,
            key.fingerprint()
        );
        if let Some(session) = self.session.as_mut() {
            session.install_key(key);
        }
        self.set_state(ConnectionState::Authenticated);
        self.emit(SessionEvent::Handshake(HandshakeEvent::Success));
        self.resolve_wake(Ok(()));
    }

    /// Terminal handshake failure: wipe the session, report, and drop the
    /// link without a `Disconnect` event.
    fn fail_auth(&mut self, err: EngineError) {
        warn!("Engine[{}]: authentication failed: {}", self.labels.vehicle, err);
        if let Some(session) = self.session.take() {
            let outcome = match err {
                EngineError::HandshakeTimeout => "timeout",
                _ => "rejected",
            };
            self.record_handshake_end(&session, outcome);
            let mut session = session;
            for _ in session.dispatcher.clear() {
                self.emit(SessionEvent::Sent(Err(err.clone())));
            }
        }
        self.set_state(ConnectionState::AuthFailed);
        self.emit(SessionEvent::Handshake(HandshakeEvent::Failure(err.clone())));
        self.resolve_wake(Err(err));
        if let Err(e) = self.transport.disconnect() {
            debug!(
                "Engine[{}]: disconnect after auth failure: {}",
                self.labels.vehicle, e
            );
        }
    }

    fn record_handshake_end(&self, session: &BleSession, outcome: &'static str) {
        metrics::counter!(
            metric_defs::HANDSHAKE_COMPLETED.name,
            &self.labels.with(&[("outcome", outcome.to_string())])
        )
        .increment(1);
        if let Some(elapsed) = session.handshake_elapsed(Instant::now()) {
            metrics::histogram!(metric_defs::HANDSHAKE_DURATION.name, &self.labels.to_labels())
                .record(elapsed.as_secs_f64() * 1000.0);
        }
    }

    /// Enforce the handshake and scan bounds.
    pub fn poll_timeouts(&mut self, now: Instant) {
        if self.state == ConnectionState::Authenticating {
            let elapsed = self
                .session
                .as_ref()
                .and_then(|s| s.handshake_elapsed(now));
            if elapsed.is_some_and(|e| e >= self.config.handshake_timeout()) {
                self.fail_auth(EngineError::HandshakeTimeout);
            }
        }

        if self.state == ConnectionState::Scanning {
            let expired = self
                .scan_started
                .is_some_and(|started| now.saturating_duration_since(started) >= self.config.scan_timeout());
            if expired {
                debug!("Engine[{}]: scan window elapsed", self.labels.vehicle);
                if let Err(e) = self.transport.stop_scan() {
                    warn!("Engine[{}]: stop scan failed: {}", self.labels.vehicle, e);
                }
                self.scan_started = None;
                self.report(BleStatus::NotFound);
                self.set_state(ConnectionState::Idle);
                self.resolve_wake(Err(EngineError::PeripheralNotFound));
            }
        }
    }

    // ========================================================================
    // Inbound
    // ========================================================================

    /// Bytes arrived from the vehicle.
    ///
    /// Frames are processed in arrival order. A frame that fails to decode
    /// is reported and skipped; the session stays up.
    pub fn on_data(&mut self, data: &[u8]) {
        let Some(session) = self.session.as_mut() else {
            trace!("Engine: dropping {} bytes without a session", data.len());
            return;
        };
        session.touch(Instant::now());
        session.buffer.push(data);

        loop {
            let next = match self.session.as_mut() {
                Some(session) => session.buffer.next_frame(),
                None => return,
            };
            match next {
                None => return,
                Some(Ok(frame)) => self.on_frame(&frame),
                Some(Err(e)) if self.state == ConnectionState::Authenticating => {
                    self.reject_auth_frame(e)
                }
                Some(Err(e)) => self.report_decode_error(e),
            }
        }
    }

    fn on_frame(&mut self, bytes: &[u8]) {
        let command_type = match peek_command_type(bytes) {
            Ok(command_type) => command_type,
            Err(e) if self.state == ConnectionState::Authenticating => {
                return self.reject_auth_frame(e)
            }
            Err(e) => return self.report_decode_error(e),
        };
        if self.state == ConnectionState::Authenticating {
            if command_type != CommandType::Auth {
                return self.fail_auth(EngineError::HandshakeRejected(
                    RejectReason::UnexpectedMessage(command_type.tag()),
                ));
            }
            match decode_frame(bytes, None) {
                Ok(frame) => self.on_auth_payload(&frame.payload),
                Err(e) => self.reject_auth_frame(e),
            }
            return;
        }

        let frame = match decode_frame(bytes, self.session_key()) {
            Ok(frame) => frame,
            Err(e) => return self.report_decode_error(e),
        };
        metrics::counter!(
            metric_defs::FRAMES_RX.name,
            &self.labels.with(&[("command_type", command_type.as_str().to_string())])
        )
        .increment(1);
        trace!(
            "Engine[{}]: received {} frame ({} bytes)",
            self.labels.vehicle,
            command_type,
            frame.payload.len()
        );

        let calibration = if command_type == CommandType::Calibration {
            self.session
                .as_mut()
                .and_then(|s| s.calibration.as_mut())
                .map(|c| c.on_frame(&frame.payload))
        } else {
            None
        };
        self.emit(SessionEvent::Receive(Ok(frame)));
        match calibration {
            Some(Ok(event)) => self.emit(SessionEvent::Calibration(event)),
            Some(Err(e)) => warn!(
                "Engine[{}]: bad calibration message: {}",
                self.labels.vehicle, e
            ),
            None => {}
        }
    }

    /// Only handshake frames may arrive while authenticating; anything that
    /// fails to decode ends the attempt.
    fn reject_auth_frame(&mut self, err: DecodeError) {
        debug!(
            "Engine[{}]: undecodable frame during handshake: {}",
            self.labels.vehicle, err
        );
        metrics::counter!(
            metric_defs::DECODE_ERRORS.name,
            &self.labels.with(&[("kind", err.kind().to_string())])
        )
        .increment(1);
        self.fail_auth(EngineError::HandshakeRejected(RejectReason::Malformed(
            "handshake frame",
        )));
    }

    fn report_decode_error(&mut self, err: DecodeError) {
        debug!("Engine[{}]: dropping frame: {}", self.labels.vehicle, err);
        metrics::counter!(
            metric_defs::DECODE_ERRORS.name,
            &self.labels.with(&[("kind", err.kind().to_string())])
        )
        .increment(1);
        self.emit(SessionEvent::Receive(Err(err)));
    }

    /// Decode a frame under the current session key without delivering it.
    pub fn parse_instruction(&self, bytes: &[u8]) -> Result<CommandFrame, DecodeError> {
        decode_frame(bytes, self.session_key())
    }

    /// Command type of an encoded frame.
    pub fn command_type(bytes: &[u8]) -> Result<CommandType, DecodeError> {
        peek_command_type(bytes)
    }

    // ========================================================================
    // Outbound
    // ========================================================================

    /// Send a command to the vehicle.
    ///
    /// Refusals are returned synchronously and never reach the transport.
    /// Accepted frames complete with one `SessionEvent::Sent`.
    pub fn send(&mut self, frame: CommandFrame) -> EngineResult<()> {
        let now = Instant::now();
        let result = self.check_sendable(&frame, now).and_then(|()| {
            let bytes = encode_frame(&frame, self.session_key())?;
            self.queue(frame.command_type, bytes, true)
        });
        match result {
            Ok(()) => {
                if let Some(session) = self.session.as_mut() {
                    session.dispatcher.remember(frame, now);
                }
                Ok(())
            }
            Err(e) => Err(self.rejected(e)),
        }
    }

    /// Resend `frame` as a `Retry`, bypassing duplicate suppression.
    pub fn retry(&mut self, frame: &CommandFrame) -> EngineResult<()> {
        if frame.command_type == CommandType::Retry {
            return self.send(frame.clone());
        }
        self.send(CommandFrame::retry_of(frame))
    }

    /// Send an already encoded frame.
    pub fn send_encoded(&mut self, bytes: Vec<u8>) -> EngineResult<()> {
        let result = peek_command_type(&bytes)
            .map_err(EngineError::from)
            .and_then(|command_type| {
                self.check_authenticated(command_type)?;
                self.queue(command_type, bytes, true)
            });
        result.map_err(|e| self.rejected(e))
    }

    /// Encode `frame` under the current session key without sending it.
    pub fn package_instruction(&self, frame: &CommandFrame) -> EngineResult<Vec<u8>> {
        Ok(encode_frame(frame, self.session_key())?)
    }

    /// Transport finished writing the in-flight frame.
    pub fn on_write_complete(&mut self, result: Result<(), TransportError>) {
        let Some(done) = self.session.as_mut().and_then(|s| s.dispatcher.complete()) else {
            trace!("Engine[{}]: write completion with nothing in flight", self.labels.vehicle);
            return;
        };
        match result {
            Ok(()) => {
                if done.notify {
                    self.emit(SessionEvent::Sent(Ok(done.command_type)));
                }
            }
            Err(e) => {
                warn!(
                    "Engine[{}]: write of {} frame failed: {}",
                    self.labels.vehicle, done.command_type, e
                );
                let err = EngineError::Transport(e.to_string());
                if done.notify {
                    self.emit(SessionEvent::Sent(Err(err)));
                } else if done.command_type == CommandType::Auth {
                    self.fail_auth(err);
                    return;
                }
            }
        }
        self.flush();
    }

    fn check_authenticated(&self, command_type: CommandType) -> EngineResult<()> {
        if command_type.requires_authentication() && self.state != ConnectionState::Authenticated {
            return Err(EngineError::NotAuthenticated);
        }
        if self.session.is_none() {
            return Err(EngineError::InvalidState {
                operation: "send",
                state: self.state,
            });
        }
        Ok(())
    }

    fn check_sendable(&mut self, frame: &CommandFrame, now: Instant) -> EngineResult<()> {
        self.check_authenticated(frame.command_type)?;

        let logical = match frame.command_type {
            CommandType::Retry => frame.unwrap_retry(),
            _ => Some(frame.clone()),
        };
        if let Some(CommandFrame {
            command_type: CommandType::Control,
            permission_mask: Some(mask),
            ..
        }) = logical
        {
            let key = self.keys.current().ok_or(EngineError::NoDigitalKey)?;
            if !key.permits(&mask) {
                return Err(EngineError::PermissionDenied(mask.to_hex()));
            }
        }

        let duplicate = self
            .session
            .as_mut()
            .is_some_and(|s| s.dispatcher.is_duplicate(frame, now));
        if duplicate {
            return Err(EngineError::DuplicateCommand);
        }
        Ok(())
    }

    fn rejected(&self, err: EngineError) -> EngineError {
        debug!("Engine[{}]: send refused: {}", self.labels.vehicle, err);
        metrics::counter!(
            metric_defs::SEND_REJECTED.name,
            &self.labels.with(&[("reason", err.kind().to_string())])
        )
        .increment(1);
        err
    }

    fn queue(&mut self, command_type: CommandType, bytes: Vec<u8>, notify: bool) -> EngineResult<()> {
        let session = self.session.as_mut().ok_or(EngineError::InvalidState {
            operation: "send",
            state: self.state,
        })?;
        session.dispatcher.enqueue(Outbound {
            command_type,
            bytes,
            notify,
        })?;
        let depth = session.dispatcher.pending_len();
        metrics::gauge!(metric_defs::TX_QUEUE_DEPTH.name, &self.labels.to_labels()).set(depth as f64);
        self.flush();
        Ok(())
    }

    /// Write the next queued frame if the radio is free.
    fn flush(&mut self) {
        loop {
            let Some(session) = self.session.as_mut() else {
                return;
            };
            let Some(bytes) = session.dispatcher.next_to_write() else {
                return;
            };
            let command_type = session.dispatcher.in_flight().unwrap_or(CommandType::Transfer);
            match self.transport.write(&bytes) {
                Ok(()) => {
                    let labels = self
                        .labels
                        .with(&[("command_type", command_type.as_str().to_string())]);
                    metrics::counter!(metric_defs::FRAMES_TX.name, &labels).increment(1);
                    metrics::histogram!(metric_defs::TX_FRAME_SIZE.name, &labels)
                        .record(bytes.len() as f64);
                    trace!(
                        "Engine[{}]: wrote {} frame ({} bytes)",
                        self.labels.vehicle,
                        command_type,
                        bytes.len()
                    );
                    return;
                }
                Err(e) => {
                    warn!(
                        "Engine[{}]: write of {} frame refused: {}",
                        self.labels.vehicle, command_type, e
                    );
                    let Some(failed) = self.session.as_mut().and_then(|s| s.dispatcher.complete())
                    else {
                        return;
                    };
                    let err = EngineError::Transport(e.to_string());
                    if failed.notify {
                        self.emit(SessionEvent::Sent(Err(err)));
                    } else if failed.command_type == CommandType::Auth {
                        self.fail_auth(err);
                        return;
                    }
                }
            }
        }
    }

    // ========================================================================
    // Calibration
    // ========================================================================

    /// Open a calibration and send its start frame.
    ///
    /// Returns the encoded frame that was queued.
    pub fn demarcate_start(&mut self) -> EngineResult<Vec<u8>> {
        if self.state != ConnectionState::Authenticated {
            return Err(EngineError::NotAuthenticated);
        }
        let session = self.session.as_ref().ok_or(EngineError::NotAuthenticated)?;
        if session.calibration.as_ref().is_some_and(|c| !c.is_closed()) {
            return Err(EngineError::CalibrationInProgress);
        }
        let frame = CommandFrame::calibration(CalibrationSession::start_payload());
        let bytes = encode_frame(&frame, session.key())?;
        self.queue(CommandType::Calibration, bytes.clone(), true)?;
        if let Some(session) = self.session.as_mut() {
            session.calibration = Some(CalibrationSession::new());
        }
        debug!("Engine[{}]: calibration started", self.labels.vehicle);
        Ok(bytes)
    }

    /// Submit a calibration value on the open calibration.
    ///
    /// Returns the encoded frame that was queued.
    pub fn submit_calibration(
        &mut self,
        kind: CalibrationKind,
        value: &[u8],
    ) -> EngineResult<Vec<u8>> {
        let session = self.session.as_ref().ok_or(EngineError::NoCalibration)?;
        let calibration = session
            .calibration
            .as_ref()
            .filter(|c| !c.is_closed())
            .ok_or(EngineError::NoCalibration)?;
        let payload = calibration.prepare(kind, value)?;
        let bytes = encode_frame(&CommandFrame::calibration(payload), session.key())?;
        self.queue(CommandType::Calibration, bytes.clone(), true)?;
        if let Some(calibration) = self.session.as_mut().and_then(|s| s.calibration.as_mut()) {
            calibration.commit(kind, value);
        }
        metrics::counter!(
            metric_defs::CALIBRATION_SUBMITTED.name,
            &self.labels.with(&[("kind", kind.as_str().to_string())])
        )
        .increment(1);
        Ok(bytes)
    }

    /// Accepted calibration values of the current session.
    pub fn calibration_record(&self, vehicle_mode_code: &str) -> Option<CalibrationRecord> {
        self.session
            .as_ref()?
            .calibration
            .as_ref()?
            .record(vehicle_mode_code)
    }

    /// Upload the accepted calibration values to the backend.
    pub fn upload_calibration<S: KeyLifecycleService + ?Sized>(
        &self,
        service: &mut S,
        vehicle_mode_code: &str,
    ) -> EngineResult<CalibrationRecord> {
        let record = self
            .calibration_record(vehicle_mode_code)
            .ok_or(EngineError::NoCalibration)?;
        service.upload_calibration(&record)?;
        Ok(record)
    }

    // ========================================================================
    // Region & wake-up
    // ========================================================================

    /// Turn automatic wake-up on region entry on or off.
    pub fn monitor_auto_wake(&mut self, enabled: bool) {
        self.region.set_auto_wake(enabled);
    }

    /// Region report from the platform.
    pub fn on_region(&mut self, state: RegionState) {
        let Some(change) = self.region.on_region(state) else {
            return;
        };
        let labels = vec![("region", state.as_str().to_string())];
        metrics::counter!(metric_defs::REGION_TRANSITIONS.name, &labels).increment(1);
        self.emit(SessionEvent::Region(state));
        if change.wake {
            if let Err(e) = self.wake_up() {
                debug!("Engine[{}]: wake-up on region entry: {}", self.labels.vehicle, e);
            }
        }
    }

    /// Bring the link to `Authenticated` with whatever steps are missing.
    ///
    /// Usage errors are returned without an event. Once accepted, exactly one
    /// `SessionEvent::WakeUp` follows.
    pub fn wake_up(&mut self) -> EngineResult<()> {
        if !self.adapter.is_available() {
            return Err(EngineError::RadioUnavailable);
        }
        if self.keys.current().is_none() {
            return Err(EngineError::NoDigitalKey);
        }
        if self.wake_pending || self.state == ConnectionState::Disconnecting {
            return Err(EngineError::InvalidState {
                operation: "wake up",
                state: self.state,
            });
        }
        metrics::counter!(metric_defs::WAKE_REQUESTS.name).increment(1);

        match self.state {
            ConnectionState::Authenticated => {
                self.emit(SessionEvent::WakeUp(Ok(())));
            }
            ConnectionState::Scanning
            | ConnectionState::Connecting
            | ConnectionState::Connected
            | ConnectionState::Authenticating => {
                self.wake_pending = true;
            }
            _ if self.target.is_some() => {
                // A transport refusal resolves the wake through fail_connect.
                self.wake_pending = true;
                if let Err(e) = self.connect() {
                    self.wake_pending = false;
                    return Err(e);
                }
            }
            _ => {
                if !self.start_scan() {
                    return Err(EngineError::RadioUnavailable);
                }
                self.wake_pending = true;
            }
        }
        Ok(())
    }

    fn resolve_wake(&mut self, result: EngineResult<()>) {
        if self.wake_pending {
            self.wake_pending = false;
            self.emit(SessionEvent::WakeUp(result));
        }
    }

    // ========================================================================
    // Data management
    // ========================================================================

    /// Drop the session and any scan, keeping installed keys.
    pub fn clear_cache_data(&mut self) {
        if self.state.has_link() {
            if let Err(e) = self.disconnect() {
                debug!("Engine[{}]: clear cache: {}", self.labels.vehicle, e);
            }
        } else {
            self.stop_scan();
        }
        self.release_session(EngineError::HandshakeCancelled);
    }

    /// Drop the session, installed keys and the known target.
    pub fn clear_data(&mut self) {
        self.clear_cache_data();
        self.keys.clear();
        self.target = None;
        self.labels = SessionLabels::new(NO_VEHICLE);
    }

    // ========================================================================
    // Reporting
    // ========================================================================

    fn set_state(&mut self, next: ConnectionState) {
        if next == self.state {
            return;
        }
        debug!("Engine[{}]: {} -> {}", self.labels.vehicle, self.state, next);
        self.state = next;
        if let Some(status) = next.status() {
            self.report(status);
        }
    }

    fn report(&mut self, status: BleStatus) {
        self.last_status = Some(status);
        metrics::counter!(
            metric_defs::STATUS_TRANSITIONS.name,
            &self.labels.with(&[("status", status.as_str().to_string())])
        )
        .increment(1);
        self.emit(SessionEvent::Status(status));
    }

    fn emit(&self, event: SessionEvent) {
        if self.events.send(event).is_err() {
            trace!("Engine[{}]: event receiver dropped", self.labels.vehicle);
        }
    }
}

impl<T: Transport> std::fmt::Debug for DigitalKeyEngine<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigitalKeyEngine")
            .field("fingerprint", &self.fingerprint)
            .field("state", &self.state)
            .field("adapter", &self.adapter)
            .field("session", &self.session)
            .field("wake_pending", &self.wake_pending)
            .finish()
    }
}
