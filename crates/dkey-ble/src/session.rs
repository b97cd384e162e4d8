//! Per-connection session state.

use crate::calibration::CalibrationSession;
use crate::dispatcher::Dispatcher;
use crate::handshake::{ChallengeLedger, KeyAgreement};
use crate::transport::Peripheral;
use crate::EngineConfig;
use dkey_frame::{FrameBuffer, SessionKey};
use std::time::{Duration, Instant};

/// Everything that lives exactly as long as one connection attempt.
///
/// Dropping the session wipes the key (`SessionKey` zeroizes on drop),
/// discards the handshake and its partial key material, and releases any
/// open calibration.
pub struct BleSession {
    peripheral: Peripheral,
    key: Option<SessionKey>,
    handshake: Option<Box<dyn KeyAgreement + Send>>,
    handshake_started: Option<Instant>,
    opened: Instant,
    last_activity: Instant,
    pub(crate) calibration: Option<CalibrationSession>,
    pub(crate) buffer: FrameBuffer,
    pub(crate) dispatcher: Dispatcher,
}

impl BleSession {
    /// Open a session towards `peripheral`.
    pub fn new(peripheral: Peripheral, config: &EngineConfig, now: Instant) -> Self {
        BleSession {
            peripheral,
            key: None,
            handshake: None,
            handshake_started: None,
            opened: now,
            last_activity: now,
            calibration: None,
            buffer: FrameBuffer::new(),
            dispatcher: Dispatcher::new(config.dedup_window(), config.dispatcher.max_queue),
        }
    }

    /// Peripheral this session is bound to.
    pub fn peripheral(&self) -> &Peripheral {
        &self.peripheral
    }

    /// Installed session key.
    pub fn key(&self) -> Option<&SessionKey> {
        self.key.as_ref()
    }

    /// Whether a session key is installed.
    pub fn is_authenticated(&self) -> bool {
        self.key.is_some()
    }

    /// Install the key produced by the handshake and drop the handshake.
    pub(crate) fn install_key(&mut self, key: SessionKey) {
        self.handshake = None;
        self.handshake_started = None;
        self.key = Some(key);
    }

    /// Attach the handshake to run once the link is up.
    pub(crate) fn attach_handshake(&mut self, handshake: Box<dyn KeyAgreement + Send>) {
        self.key = None;
        self.handshake = Some(handshake);
        self.handshake_started = None;
    }

    /// Start the attached handshake, returning the opening payload.
    pub(crate) fn begin_handshake(
        &mut self,
        ledger: &mut ChallengeLedger,
        now: Instant,
    ) -> Option<Vec<u8>> {
        let payload = self.handshake.as_mut()?.begin(ledger);
        self.handshake_started = Some(now);
        Some(payload)
    }

    /// Running handshake, if any.
    pub(crate) fn handshake_mut(&mut self) -> Option<&mut (dyn KeyAgreement + Send + 'static)> {
        self.handshake.as_deref_mut()
    }

    /// Whether a handshake has started and not finished.
    pub fn handshake_running(&self) -> bool {
        self.handshake.is_some() && self.handshake_started.is_some()
    }

    /// Time since the handshake started.
    pub fn handshake_elapsed(&self, now: Instant) -> Option<Duration> {
        self.handshake_started
            .map(|started| now.saturating_duration_since(started))
    }

    /// Record traffic on the link.
    pub(crate) fn touch(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Time of the last traffic on the link.
    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    /// Age of the session.
    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.opened)
    }
}

impl std::fmt::Debug for BleSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BleSession")
            .field("peripheral", &self.peripheral.id)
            .field("key", &self.key)
            .field("handshake", &self.handshake.as_ref().map(|h| h.name()))
            .field("calibration", &self.calibration.is_some())
            .field("pending", &self.dispatcher.pending_len())
            .finish()
    }
}
