//! Mutual-authentication handshake.
//!
//! The engine drives a [`KeyAgreement`] implementation: `begin` produces the
//! first `Auth` payload, and each inbound `Auth` payload is passed to
//! `consume`, which yields a reply, a session key, or a terminal rejection.
//!
//! The default scheme, [`SignedEcdhHandshake`], is an ephemeral X25519
//! exchange authenticated with long-term Ed25519 keys and closed with
//! BLAKE2s key-confirmation tags:
//!
//! ```text
//! mobile                                            vehicle
//!   MOBILE_HELLO   [01][ver][id_len][id][fp 32][mc 32][me 32] ->
//!               <- VEHICLE_HELLO   [02][vc 32][ve 32][sig 64]
//!   MOBILE_PROOF   [03][sig 64]                                ->
//!               <- VEHICLE_CONFIRM [04][tag 32]
//!   MOBILE_CONFIRM [05][tag 32]                                ->
//!               <- AUTH_RESULT     [06][status][tag 32]
//! ```
//!
//! `th1 = SHA-256("dkey-handshake-v1" || MOBILE_HELLO || vc || ve)`. Both
//! signatures cover `th1` under distinct labels. Keys come from
//! HKDF-SHA256 over the X25519 output, salted with `mc || vc`.

mod mobile;
mod responder;

pub use mobile::SignedEcdhHandshake;
pub use responder::VehicleResponder;

use crate::RejectReason;
use blake2::digest::generic_array::GenericArray;
use blake2::digest::{KeyInit, Mac};
use blake2::Blake2sMac256;
use dkey_frame::SessionKey;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};
use zeroize::{Zeroize, ZeroizeOnDrop};

// ============================================================================
// Wire constants
// ============================================================================

/// Handshake protocol version carried in `MOBILE_HELLO`.
pub const PROTOCOL_VERSION: u8 = 1;

/// Mobile opens the exchange.
pub const MSG_MOBILE_HELLO: u8 = 0x01;
/// Vehicle answers with its challenge, key share and signature.
pub const MSG_VEHICLE_HELLO: u8 = 0x02;
/// Mobile proves possession of its key.
pub const MSG_MOBILE_PROOF: u8 = 0x03;
/// Vehicle confirms the derived keys.
pub const MSG_VEHICLE_CONFIRM: u8 = 0x04;
/// Mobile confirms the derived keys.
pub const MSG_MOBILE_CONFIRM: u8 = 0x05;
/// Vehicle reports the final verdict.
pub const MSG_AUTH_RESULT: u8 = 0x06;

/// Challenge length.
pub const CHALLENGE_SIZE: usize = 32;
/// X25519 public key length.
pub const SHARE_SIZE: usize = 32;
/// Ed25519 signature length.
pub const SIGNATURE_SIZE: usize = 64;
/// Confirmation tag length.
pub const CONFIRM_TAG_SIZE: usize = 32;
/// Fingerprint length in `MOBILE_HELLO`.
pub const FINGERPRINT_SIZE: usize = 32;

/// `VEHICLE_HELLO` length.
pub const VEHICLE_HELLO_LEN: usize = 1 + CHALLENGE_SIZE + SHARE_SIZE + SIGNATURE_SIZE;
/// `MOBILE_PROOF` length.
pub const MOBILE_PROOF_LEN: usize = 1 + SIGNATURE_SIZE;
/// `VEHICLE_CONFIRM` and `MOBILE_CONFIRM` length.
pub const CONFIRM_LEN: usize = 1 + CONFIRM_TAG_SIZE;
/// `AUTH_RESULT` length.
pub const AUTH_RESULT_LEN: usize = 2 + CONFIRM_TAG_SIZE;

/// `AUTH_RESULT` status meaning the session is accepted.
pub const RESULT_ACCEPTED: u8 = 0;

const TRANSCRIPT_DOMAIN: &[u8] = b"dkey-handshake-v1";
const VEHICLE_SIG_LABEL: &[u8] = b"dkey-vehicle-hello";
const MOBILE_SIG_LABEL: &[u8] = b"dkey-mobile-proof";
const SESSION_LABEL: &[u8] = b"dkey session";
const VEHICLE_CONFIRM_LABEL: &[u8] = b"dkey vehicle confirm";
const MOBILE_CONFIRM_LABEL: &[u8] = b"dkey mobile confirm";
const RESULT_LABEL: &[u8] = b"dkey result";

// ============================================================================
// Pluggable interface
// ============================================================================

/// Result of consuming one handshake round.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Round valid; send this payload and wait for the next one.
    Continue(Vec<u8>),
    /// Handshake complete.
    Success {
        /// Final payload to send, if the scheme has one.
        reply: Option<Vec<u8>>,
        /// Derived session key.
        key: SessionKey,
    },
    /// Terminal rejection. Partial key material is already wiped.
    Failure(RejectReason),
}

/// A mutually-authenticated key establishment scheme.
///
/// Implementations are single-use: one instance per session attempt.
pub trait KeyAgreement {
    /// Produce the opening `Auth` payload.
    ///
    /// Challenges generated here must be recorded in `ledger`.
    fn begin(&mut self, ledger: &mut ChallengeLedger) -> Vec<u8>;

    /// Consume one inbound `Auth` payload.
    fn consume(&mut self, payload: &[u8], ledger: &mut ChallengeLedger) -> RoundOutcome;

    /// Scheme name, used in logs.
    fn name(&self) -> &'static str;
}

// ============================================================================
// Replay ledger
// ============================================================================

/// Default number of challenges remembered.
pub const DEFAULT_LEDGER_CAPACITY: usize = 1024;

/// Bounded record of challenges already used.
///
/// Survives individual sessions so a challenge seen by one attempt is
/// refused by every later one, until it ages out of the window.
#[derive(Debug)]
pub struct ChallengeLedger {
    seen: HashSet<[u8; CHALLENGE_SIZE]>,
    order: VecDeque<[u8; CHALLENGE_SIZE]>,
    capacity: usize,
}

impl Default for ChallengeLedger {
    fn default() -> Self {
        Self::new(DEFAULT_LEDGER_CAPACITY)
    }
}

impl ChallengeLedger {
    /// Create a ledger remembering up to `capacity` challenges.
    pub fn new(capacity: usize) -> Self {
        ChallengeLedger {
            seen: HashSet::new(),
            order: VecDeque::new(),
            capacity: capacity.max(1),
        }
    }

    /// Record a challenge. Returns false if it was already present.
    pub fn record(&mut self, challenge: &[u8; CHALLENGE_SIZE]) -> bool {
        if !self.seen.insert(*challenge) {
            return false;
        }
        self.order.push_back(*challenge);
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.seen.remove(&old);
            }
        }
        true
    }

    /// Whether a challenge is currently remembered.
    pub fn contains(&self, challenge: &[u8; CHALLENGE_SIZE]) -> bool {
        self.seen.contains(challenge)
    }

    /// Number of remembered challenges.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether nothing is remembered.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Draw a fresh random challenge and record it.
    pub fn fresh_challenge(&mut self) -> [u8; CHALLENGE_SIZE] {
        let mut challenge = [0u8; CHALLENGE_SIZE];
        loop {
            rand::rngs::OsRng.fill_bytes(&mut challenge);
            if self.record(&challenge) {
                return challenge;
            }
        }
    }
}

// ============================================================================
// Key schedule
// ============================================================================

/// Keys derived from one exchange.
#[derive(Zeroize, ZeroizeOnDrop)]
pub(crate) struct KeySchedule {
    pub session: [u8; 32],
    pub vehicle_confirm: [u8; 32],
    pub mobile_confirm: [u8; 32],
    pub result: [u8; 32],
}

impl KeySchedule {
    /// Expand the shared secret into the session and confirmation keys.
    pub fn derive(
        shared: &[u8; 32],
        mobile_challenge: &[u8; CHALLENGE_SIZE],
        vehicle_challenge: &[u8; CHALLENGE_SIZE],
        th1: &[u8; 32],
    ) -> Result<Self, RejectReason> {
        let mut salt = [0u8; CHALLENGE_SIZE * 2];
        salt[..CHALLENGE_SIZE].copy_from_slice(mobile_challenge);
        salt[CHALLENGE_SIZE..].copy_from_slice(vehicle_challenge);
        let hk = Hkdf::<Sha256>::new(Some(&salt[..]), shared);

        let mut schedule = KeySchedule {
            session: [0u8; 32],
            vehicle_confirm: [0u8; 32],
            mobile_confirm: [0u8; 32],
            result: [0u8; 32],
        };
        for (label, out) in [
            (SESSION_LABEL, &mut schedule.session),
            (VEHICLE_CONFIRM_LABEL, &mut schedule.vehicle_confirm),
            (MOBILE_CONFIRM_LABEL, &mut schedule.mobile_confirm),
            (RESULT_LABEL, &mut schedule.result),
        ] {
            hk.expand_multi_info(&[label, th1.as_slice()], out)
                .map_err(|_| RejectReason::Malformed("key schedule"))?;
        }
        Ok(schedule)
    }

    /// Session key for post-handshake frames.
    pub fn session_key(&self) -> SessionKey {
        SessionKey::from_bytes(self.session)
    }
}

// ============================================================================
// Transcript helpers
// ============================================================================

/// Transcript hash binding the opening message and the vehicle's share.
pub(crate) fn transcript_hash(
    mobile_hello: &[u8],
    vehicle_challenge: &[u8],
    vehicle_share: &[u8],
) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(TRANSCRIPT_DOMAIN);
    hasher.update(mobile_hello);
    hasher.update(vehicle_challenge);
    hasher.update(vehicle_share);
    hasher.finalize().into()
}

/// Message signed by the vehicle in `VEHICLE_HELLO`.
pub(crate) fn vehicle_signed_message(th1: &[u8; 32]) -> Vec<u8> {
    [VEHICLE_SIG_LABEL, th1.as_slice()].concat()
}

/// Message signed by the mobile in `MOBILE_PROOF`.
pub(crate) fn mobile_signed_message(th1: &[u8; 32]) -> Vec<u8> {
    [MOBILE_SIG_LABEL, th1.as_slice()].concat()
}

/// Keyed BLAKE2s tag over the concatenation of `parts`.
pub(crate) fn confirm_tag(key: &[u8; 32], parts: &[&[u8]]) -> [u8; CONFIRM_TAG_SIZE] {
    let mut mac = <Blake2sMac256 as KeyInit>::new(GenericArray::from_slice(key));
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().into()
}

/// Constant-time check of a confirmation tag.
pub(crate) fn verify_tag(key: &[u8; 32], parts: &[&[u8]], tag: &[u8]) -> bool {
    let mut mac = <Blake2sMac256 as KeyInit>::new(GenericArray::from_slice(key));
    for part in parts {
        mac.update(part);
    }
    mac.verify_slice(tag).is_ok()
}

/// Split a payload into its message type and body, checking the type and
/// total length.
pub(crate) fn expect_message(
    payload: &[u8],
    msg_type: u8,
    len: usize,
) -> Result<&[u8], RejectReason> {
    let (&actual, body) = payload
        .split_first()
        .ok_or(RejectReason::Malformed("empty message"))?;
    if actual != msg_type {
        return Err(RejectReason::UnexpectedMessage(actual));
    }
    if payload.len() != len {
        return Err(RejectReason::Malformed("wrong message length"));
    }
    Ok(body)
}

/// Copy a fixed-size field out of a checked message body.
pub(crate) fn field<const N: usize>(body: &[u8], offset: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&body[offset..offset + N]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_refuses_repeats() {
        let mut ledger = ChallengeLedger::new(4);
        let c = [7u8; CHALLENGE_SIZE];
        assert!(ledger.record(&c));
        assert!(!ledger.record(&c));
        assert!(ledger.contains(&c));
    }

    #[test]
    fn test_ledger_is_bounded() {
        let mut ledger = ChallengeLedger::new(2);
        for i in 0..5u8 {
            assert!(ledger.record(&[i; CHALLENGE_SIZE]));
        }
        assert_eq!(ledger.len(), 2);
        assert!(!ledger.contains(&[0u8; CHALLENGE_SIZE]));
        assert!(ledger.contains(&[4u8; CHALLENGE_SIZE]));
    }

    #[test]
    fn test_fresh_challenges_differ() {
        let mut ledger = ChallengeLedger::default();
        let a = ledger.fresh_challenge();
        let b = ledger.fresh_challenge();
        assert_ne!(a, b);
        assert_eq!(ledger.len(), 2);
    }

    #[test]
    fn test_key_schedule_separates_keys() {
        let th1 = transcript_hash(b"hello", &[1u8; 32], &[2u8; 32]);
        let ks = KeySchedule::derive(&[9u8; 32], &[1u8; 32], &[2u8; 32], &th1).unwrap();
        assert_ne!(ks.session, ks.vehicle_confirm);
        assert_ne!(ks.vehicle_confirm, ks.mobile_confirm);
        assert_ne!(ks.mobile_confirm, ks.result);

        let other = KeySchedule::derive(&[9u8; 32], &[1u8; 32], &[3u8; 32], &th1).unwrap();
        assert_ne!(ks.session, other.session);
    }

    #[test]
    fn test_confirm_tag_verifies() {
        let key = [5u8; 32];
        let tag = confirm_tag(&key, &[&b"a"[..], &b"b"[..]]);
        assert!(verify_tag(&key, &[&b"ab"[..]], &tag));
        assert!(!verify_tag(&[6u8; 32], &[&b"ab"[..]], &tag));
        assert!(!verify_tag(&key, &[&b"ab"[..]], &tag[..16]));
    }

    #[test]
    fn test_expect_message() {
        assert_eq!(
            expect_message(&[], MSG_VEHICLE_HELLO, VEHICLE_HELLO_LEN),
            Err(RejectReason::Malformed("empty message"))
        );
        assert_eq!(
            expect_message(&[MSG_AUTH_RESULT, 0], MSG_VEHICLE_HELLO, VEHICLE_HELLO_LEN),
            Err(RejectReason::UnexpectedMessage(MSG_AUTH_RESULT))
        );
        assert_eq!(
            expect_message(&[MSG_VEHICLE_CONFIRM, 0], MSG_VEHICLE_CONFIRM, CONFIRM_LEN),
            Err(RejectReason::Malformed("wrong message length"))
        );
    }
}
