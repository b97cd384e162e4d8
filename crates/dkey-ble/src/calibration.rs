//! Calibration ("demarcation") sub-protocol.
//!
//! Payloads of `Calibration` frames:
//!
//! | direction | payload                          |
//! |-----------|----------------------------------|
//! | out       | `[START]`                        |
//! | in        | `[REFERENCE][len][value]`        |
//! | out       | `[SET][kind][len][value]`        |
//! | in        | `[ACK][kind][status]`            |
//! | in        | `[ACK][0]` closes the session    |

use crate::{EngineError, EngineResult};
use dkey_frame::{DecodeError, EncodeError};
use dkey_keys::CalibrationRecord;

/// Request the vehicle's reference value.
pub const OP_START: u8 = 0x01;
/// Vehicle reports its reference value.
pub const OP_REFERENCE: u8 = 0x02;
/// Submit a measured value.
pub const OP_SET: u8 = 0x03;
/// Vehicle acknowledges a value, or closes the session.
pub const OP_ACK: u8 = 0x04;

/// Largest value that fits the one-byte length field.
pub const MAX_VALUE_LEN: usize = u8::MAX as usize;

/// Calibration value kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CalibrationKind {
    /// Passive entry.
    Pe,
    /// Passive start.
    Ps,
}

impl CalibrationKind {
    /// Wire code.
    pub const fn code(self) -> u8 {
        match self {
            CalibrationKind::Pe => 1,
            CalibrationKind::Ps => 2,
        }
    }

    /// Parse a wire code.
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(CalibrationKind::Pe),
            2 => Some(CalibrationKind::Ps),
            _ => None,
        }
    }

    /// Lowercase name.
    pub const fn as_str(self) -> &'static str {
        match self {
            CalibrationKind::Pe => "pe",
            CalibrationKind::Ps => "ps",
        }
    }
}

impl std::fmt::Display for CalibrationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something the vehicle said about the open calibration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CalibrationEvent {
    /// Reference value reported after start.
    Reference(Vec<u8>),
    /// A submitted value was accepted or refused.
    Acknowledged {
        /// Kind the acknowledgment is for.
        kind: CalibrationKind,
        /// Whether the value was accepted.
        accepted: bool,
    },
    /// Vehicle closed the calibration.
    Closed,
}

/// One open calibration on a session.
///
/// PE then PS is the only order allowed; a kind can be resubmitted until the
/// vehicle accepts it.
#[derive(Debug, Default)]
pub struct CalibrationSession {
    kind: Option<CalibrationKind>,
    reference: Option<Vec<u8>>,
    submitted: [Option<Vec<u8>>; 2],
    accepted: [Option<Vec<u8>>; 2],
    closed: bool,
}

fn slot(kind: CalibrationKind) -> usize {
    kind.code() as usize - 1
}

impl CalibrationSession {
    /// Open a calibration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Payload of the start frame.
    pub fn start_payload() -> Vec<u8> {
        vec![OP_START]
    }

    /// Kind of the latest submission.
    pub fn kind(&self) -> Option<CalibrationKind> {
        self.kind
    }

    /// Reference value reported by the vehicle.
    pub fn reference(&self) -> Option<&[u8]> {
        self.reference.as_deref()
    }

    /// Whether the vehicle closed the calibration.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Accepted value of `kind`.
    pub fn accepted(&self, kind: CalibrationKind) -> Option<&[u8]> {
        self.accepted[slot(kind)].as_deref()
    }

    /// Build the payload submitting `value` as `kind`.
    ///
    /// Leaves the session untouched; call [`commit`](Self::commit) once the
    /// frame is on its way.
    pub fn prepare(&self, kind: CalibrationKind, value: &[u8]) -> EngineResult<Vec<u8>> {
        if self.closed {
            return Err(EngineError::NoCalibration);
        }
        match self.kind {
            Some(open) if open > kind => {
                return Err(EngineError::CalibrationMismatch {
                    open,
                    requested: kind,
                })
            }
            _ => {}
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(EncodeError::PayloadTooLarge {
                size: value.len(),
                max: MAX_VALUE_LEN,
            }
            .into());
        }

        let mut payload = Vec::with_capacity(3 + value.len());
        payload.push(OP_SET);
        payload.push(kind.code());
        payload.push(value.len() as u8);
        payload.extend_from_slice(value);
        Ok(payload)
    }

    /// Record `value` as sent for `kind`, awaiting the vehicle's ack.
    pub fn commit(&mut self, kind: CalibrationKind, value: &[u8]) {
        self.kind = Some(kind);
        self.submitted[slot(kind)] = Some(value.to_vec());
    }

    /// Apply an inbound calibration payload.
    pub fn on_frame(&mut self, payload: &[u8]) -> Result<CalibrationEvent, DecodeError> {
        match payload {
            [OP_REFERENCE, len, value @ ..] => {
                if value.len() != *len as usize {
                    return Err(DecodeError::IntegrityFailure(format!(
                        "calibration reference length {} != {}",
                        len,
                        value.len()
                    )));
                }
                self.reference = Some(value.to_vec());
                Ok(CalibrationEvent::Reference(value.to_vec()))
            }
            [OP_ACK, 0] => {
                self.closed = true;
                Ok(CalibrationEvent::Closed)
            }
            [OP_ACK, code, status] => {
                let kind = CalibrationKind::from_code(*code).ok_or_else(|| {
                    DecodeError::IntegrityFailure(format!("unknown calibration kind {}", code))
                })?;
                let value = self.submitted[slot(kind)].take();
                let accepted = *status == 0 && value.is_some();
                if accepted {
                    self.accepted[slot(kind)] = value;
                }
                Ok(CalibrationEvent::Acknowledged { kind, accepted })
            }
            [] => Err(DecodeError::too_short(1, 0)),
            [op, ..] => Err(DecodeError::IntegrityFailure(format!(
                "unexpected calibration message 0x{:02X}",
                op
            ))),
        }
    }

    /// Record of both accepted values, ready for upload.
    pub fn record(&self, vehicle_mode_code: &str) -> Option<CalibrationRecord> {
        Some(CalibrationRecord {
            vehicle_mode_code: vehicle_mode_code.to_string(),
            pe: self.accepted(CalibrationKind::Pe)?.to_vec(),
            ps: self.accepted(CalibrationKind::Ps)?.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn submit(
        cal: &mut CalibrationSession,
        kind: CalibrationKind,
        value: &[u8],
    ) -> EngineResult<Vec<u8>> {
        let payload = cal.prepare(kind, value)?;
        cal.commit(kind, value);
        Ok(payload)
    }

    #[test]
    fn test_submit_layout() {
        let mut cal = CalibrationSession::new();
        assert_eq!(CalibrationSession::start_payload(), vec![OP_START]);
        assert_eq!(
            submit(&mut cal, CalibrationKind::Pe, &[0xAA, 0xBB]).unwrap(),
            vec![OP_SET, 1, 2, 0xAA, 0xBB]
        );
        assert_eq!(cal.kind(), Some(CalibrationKind::Pe));
    }

    #[test]
    fn test_pe_then_ps() {
        let mut cal = CalibrationSession::new();
        submit(&mut cal, CalibrationKind::Pe, &[1]).unwrap();
        submit(&mut cal, CalibrationKind::Pe, &[2]).unwrap();
        submit(&mut cal, CalibrationKind::Ps, &[3]).unwrap();
        assert_eq!(
            submit(&mut cal, CalibrationKind::Pe, &[4]),
            Err(EngineError::CalibrationMismatch {
                open: CalibrationKind::Ps,
                requested: CalibrationKind::Pe,
            })
        );
    }

    #[test]
    fn test_acks_build_record() {
        let mut cal = CalibrationSession::new();
        assert_eq!(
            cal.on_frame(&[OP_REFERENCE, 1, 0x42]),
            Ok(CalibrationEvent::Reference(vec![0x42]))
        );
        submit(&mut cal, CalibrationKind::Pe, &[1]).unwrap();
        submit(&mut cal, CalibrationKind::Ps, &[2]).unwrap();
        assert!(cal.record("M1").is_none());

        assert_eq!(
            cal.on_frame(&[OP_ACK, 1, 0]),
            Ok(CalibrationEvent::Acknowledged {
                kind: CalibrationKind::Pe,
                accepted: true
            })
        );
        assert_eq!(
            cal.on_frame(&[OP_ACK, 2, 5]),
            Ok(CalibrationEvent::Acknowledged {
                kind: CalibrationKind::Ps,
                accepted: false
            })
        );
        assert!(cal.record("M1").is_none());

        submit(&mut cal, CalibrationKind::Ps, &[9]).unwrap();
        cal.on_frame(&[OP_ACK, 2, 0]).unwrap();
        let record = cal.record("M1").unwrap();
        assert_eq!(record.pe, vec![1]);
        assert_eq!(record.ps, vec![9]);

        assert_eq!(cal.on_frame(&[OP_ACK, 0]), Ok(CalibrationEvent::Closed));
        assert!(cal.is_closed());
        assert_eq!(submit(&mut cal, CalibrationKind::Ps, &[1]), Err(EngineError::NoCalibration));
    }

    #[test]
    fn test_malformed_frames() {
        let mut cal = CalibrationSession::new();
        assert!(matches!(cal.on_frame(&[]), Err(DecodeError::TooShort { .. })));
        assert!(cal.on_frame(&[OP_REFERENCE, 3, 1]).is_err());
        assert!(cal.on_frame(&[OP_ACK, 9, 0]).is_err());
        assert!(cal.on_frame(&[0x7F]).is_err());
    }

    #[test]
    fn test_prepare_leaves_session_untouched() {
        let mut cal = CalibrationSession::new();
        cal.prepare(CalibrationKind::Ps, &[1]).unwrap();
        assert_eq!(cal.kind(), None);

        assert_eq!(
            cal.on_frame(&[OP_ACK, 2, 0]),
            Ok(CalibrationEvent::Acknowledged {
                kind: CalibrationKind::Ps,
                accepted: false
            })
        );
        assert!(cal.accepted(CalibrationKind::Ps).is_none());
    }

    #[test]
    fn test_value_too_large() {
        let cal = CalibrationSession::new();
        assert!(matches!(
            cal.prepare(CalibrationKind::Pe, &[0u8; 256]),
            Err(EngineError::Encode(EncodeError::PayloadTooLarge { .. }))
        ));
    }
}
