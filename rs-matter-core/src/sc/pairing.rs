/*
 *
 *    Copyright (c) 2020-2022 Project CHIP Authors
 *
 *    Licensed under the Apache License, Version 2.0 (the "License");
 *    you may not use this file except in compliance with the License.
 *    You may obtain a copy of the License at
 *
 *        http://www.apache.org/licenses/LICENSE-2.0
 *
 *    Unless required by applicable law or agreed to in writing, software
 *    distributed under the License is distributed on an "AS IS" BASIS,
 *    WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *    See the License for the specific language governing permissions and
 *    limitations under the License.
 */

//! What PASE and CASE have in common: how they report their outcome, the
//! session parameters both sides advertise, and session key derivation.

use core::time::Duration;

use crate::crypto;
use crate::error::*;
use crate::tlv::{FromTLV, TLVElement, TLVWriter, TagType, ToTLV};
use crate::transport::mrp::RmpConfig;
use crate::transport::session::{SessionHandle, SessionKeys, ATT_CHALLENGE_LEN};

use super::status_report::GeneralCode;

/// How long either side of a handshake waits for the next message.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Why a handshake did not produce a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingError {
    /// The peer stopped answering.
    Timeout,
    /// We rejected the handshake: a malformed or out of order message, or
    /// a failed validation.
    Failed(ErrorCode),
    /// The peer rejected the handshake with a status report.
    Rejected {
        general_code: GeneralCode,
        proto_code: u16,
    },
}

impl From<Error> for PairingError {
    fn from(e: Error) -> Self {
        match e.code() {
            ErrorCode::Timeout => Self::Timeout,
            code => Self::Failed(code),
        }
    }
}

impl From<ErrorCode> for PairingError {
    fn from(code: ErrorCode) -> Self {
        Error::from(code).into()
    }
}

/// Receives the outcome of handshakes. On error no session was installed.
pub trait PairingDelegate {
    fn on_pairing_complete(&self, _session: SessionHandle) {}

    fn on_pairing_error(&self, error: PairingError);
}

/// Retransmission intervals a node asks its peers to use.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionParams {
    pub idle_interval_ms: Option<u32>,
    pub active_interval_ms: Option<u32>,
    pub active_threshold_ms: Option<u16>,
}

impl SessionParams {
    pub fn from_rmp(rmp: &RmpConfig) -> Self {
        Self {
            idle_interval_ms: Some(rmp.idle_retrans_timeout.as_millis() as u32),
            active_interval_ms: Some(rmp.active_retrans_timeout.as_millis() as u32),
            active_threshold_ms: Some(rmp.active_threshold.as_millis() as u16),
        }
    }

    /// The parameters for talking to a peer that advertised `self`.
    pub fn apply(&self, base: &RmpConfig) -> RmpConfig {
        let mut rmp = *base;

        if let Some(ms) = self.idle_interval_ms {
            rmp.idle_retrans_timeout = Duration::from_millis(ms as u64);
        }
        if let Some(ms) = self.active_interval_ms {
            rmp.active_retrans_timeout = Duration::from_millis(ms as u64);
        }
        if let Some(ms) = self.active_threshold_ms {
            rmp.active_threshold = Duration::from_millis(ms as u64);
        }

        rmp
    }
}

impl<'a> FromTLV<'a> for SessionParams {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        t.confirm_struct()?;

        Ok(Self {
            idle_interval_ms: t.ctx(1)?,
            active_interval_ms: t.ctx(2)?,
            active_threshold_ms: t.ctx(3)?,
        })
    }
}

impl ToTLV for SessionParams {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.start_struct(tag)?;
        self.idle_interval_ms.to_tlv(tw, TagType::Context(1))?;
        self.active_interval_ms.to_tlv(tw, TagType::Context(2))?;
        self.active_threshold_ms.to_tlv(tw, TagType::Context(3))?;
        tw.end_container()
    }
}

/// Expands a handshake secret into I2R key, R2I key and attestation
/// challenge, and orders them for our side of the session.
pub fn derive_session_keys(
    salt: &[u8],
    secret: &[u8],
    info: &[u8],
    initiator: bool,
) -> Result<SessionKeys, Error> {
    const KEY_LEN: usize = crypto::SYMM_KEY_LEN_BYTES;

    let mut okm = [0; 2 * KEY_LEN + ATT_CHALLENGE_LEN];
    crypto::hkdf_sha256(salt, secret, info, &mut okm)?;

    let mut i2r = [0; KEY_LEN];
    let mut r2i = [0; KEY_LEN];
    let mut att_challenge = [0; ATT_CHALLENGE_LEN];
    i2r.copy_from_slice(&okm[..KEY_LEN]);
    r2i.copy_from_slice(&okm[KEY_LEN..2 * KEY_LEN]);
    att_challenge.copy_from_slice(&okm[2 * KEY_LEN..]);

    let (enc_key, dec_key) = if initiator { (i2r, r2i) } else { (r2i, i2r) };

    Ok(SessionKeys {
        enc_key,
        dec_key,
        att_challenge,
    })
}
