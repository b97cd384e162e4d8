//! Simulated vehicle peripheral.

use crate::scenario::{decode_hex, SimResult, VehicleConfig};
use dkey_ble::calibration::{OP_ACK, OP_REFERENCE, OP_SET, OP_START};
use dkey_ble::{CalibrationKind, Peripheral, RejectReason, VehicleResponder};
use dkey_frame::{decode_frame, encode_frame, CommandFrame, CommandType};
use tracing::{debug, info, warn};

/// Status byte the vehicle acknowledges commands with.
pub const COMMAND_OK: u8 = 0x00;

/// A vehicle answering the handshake, commands and calibration.
#[derive(Debug)]
pub struct SimVehicle {
    name: String,
    address: String,
    responder: VehicleResponder,
    reference: Vec<u8>,
    tamper_round: Option<usize>,
    silent: bool,
    round: usize,
    received: Vec<CommandFrame>,
    rejections: Vec<RejectReason>,
}

impl SimVehicle {
    /// Build the vehicle described by `config`.
    pub fn new(config: &VehicleConfig, seed: &[u8; 32]) -> SimResult<Self> {
        Ok(SimVehicle {
            name: config.name.clone(),
            address: config.address.clone(),
            responder: VehicleResponder::new(seed).with_result_status(config.result_status),
            reference: decode_hex("vehicle.reference", &config.reference)?,
            tamper_round: config.tamper_round,
            silent: config.silent,
            round: 0,
            received: Vec::new(),
            rejections: Vec::new(),
        })
    }

    /// Trust a phone key.
    pub fn trust(&mut self, key_id: &str, public_key: &[u8; 32]) -> SimResult<()> {
        self.responder.trust(key_id, public_key)?;
        Ok(())
    }

    /// Vehicle public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.responder.public_key()
    }

    /// How the vehicle advertises itself.
    pub fn peripheral(&self) -> Peripheral {
        Peripheral {
            id: self.address.clone(),
            name: self.name.clone(),
            rssi: Some(-58),
        }
    }

    /// Commands received after authentication.
    pub fn received(&self) -> &[CommandFrame] {
        &self.received
    }

    /// Handshake rejections raised by the vehicle.
    pub fn rejections(&self) -> &[RejectReason] {
        &self.rejections
    }

    /// Link came up.
    pub fn on_connect(&mut self) {
        self.round = 0;
        self.responder.reset();
    }

    /// Link went down.
    pub fn on_disconnect(&mut self) {
        self.responder.reset();
    }

    /// Handle one frame written by the phone, returning encoded replies.
    pub fn receive(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let frame = match decode_frame(bytes, self.responder.session_key()) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Vehicle[{}]: dropping frame: {}", self.name, e);
                return Vec::new();
            }
        };

        let replies = match frame.command_type {
            CommandType::Auth => self.on_auth(&frame.payload).into_iter().collect(),
            CommandType::Calibration => self.on_calibration(&frame.payload),
            _ => {
                info!(
                    "Vehicle[{}]: {} command, payload {}",
                    self.name,
                    frame.command_type,
                    hex::encode(&frame.payload)
                );
                self.received.push(frame);
                vec![CommandFrame::transfer(vec![COMMAND_OK])]
            }
        };

        replies
            .into_iter()
            .filter_map(|reply| match encode_frame(&reply, self.responder.session_key()) {
                Ok(bytes) => Some(bytes),
                Err(e) => {
                    warn!("Vehicle[{}]: cannot encode reply: {}", self.name, e);
                    None
                }
            })
            .collect()
    }

    fn on_auth(&mut self, payload: &[u8]) -> Option<CommandFrame> {
        if self.silent {
            debug!("Vehicle[{}]: ignoring handshake message", self.name);
            return None;
        }
        match self.responder.handle(payload) {
            Ok(mut reply) => {
                if self.tamper_round == Some(self.round) {
                    warn!("Vehicle[{}]: corrupting handshake round {}", self.name, self.round);
                    if let Some(last) = reply.last_mut() {
                        *last ^= 0x01;
                    }
                }
                self.round += 1;
                Some(CommandFrame::auth(reply))
            }
            Err(reason) => {
                warn!("Vehicle[{}]: handshake rejected: {}", self.name, reason);
                self.rejections.push(reason);
                None
            }
        }
    }

    fn on_calibration(&mut self, payload: &[u8]) -> Vec<CommandFrame> {
        match payload {
            [OP_START] => {
                let mut reply = vec![OP_REFERENCE, self.reference.len() as u8];
                reply.extend_from_slice(&self.reference);
                vec![CommandFrame::calibration(reply)]
            }
            [OP_SET, code, len, value @ ..] if value.len() == *len as usize => {
                let Some(kind) = CalibrationKind::from_code(*code) else {
                    return vec![CommandFrame::calibration(vec![OP_ACK, *code, 1])];
                };
                info!(
                    "Vehicle[{}]: calibration {} = {}",
                    self.name,
                    kind,
                    hex::encode(value)
                );
                let mut replies = vec![CommandFrame::calibration(vec![OP_ACK, *code, 0])];
                if kind == CalibrationKind::Ps {
                    replies.push(CommandFrame::calibration(vec![OP_ACK, 0]));
                }
                replies
            }
            _ => {
                warn!("Vehicle[{}]: malformed calibration message", self.name);
                Vec::new()
            }
        }
    }
}
