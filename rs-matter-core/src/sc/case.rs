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

//! Certificate-authenticated session establishment (the SIGMA exchange).
//!
//! Sigma1 names the target fabric and node through a destination id keyed
//! by the fabric's IPK. Sigma2 and Sigma3 each carry the sender's NOC chain
//! and a signature over both ephemeral keys, encrypted under a key derived
//! from the ECDH secret and the transcript so far. Session resumption is
//! not supported; a Sigma1 asking for it gets a full handshake.

use core::cell::RefCell;

use log::{error, info, warn};

use crate::crypto::{
    self, hkdf_sha256, KeyPair, Sha256, AEAD_MIC_LEN_BYTES, ECDH_SHARED_SECRET_LEN_BYTES,
    EC_POINT_LEN_BYTES, EC_SIGNATURE_LEN_BYTES, SHA256_HASH_LEN_BYTES, SYMM_KEY_LEN_BYTES,
};
use crate::error::*;
use crate::fabric::{Fabric, FabricMgr};
use crate::tlv::{get_root_node_struct, OctetStr, TLVWriter, TagType, ToTLV};
use crate::transport::exchange::{
    ExchangeCtx, ExchangeDelegate, ExchangeHandle, ExchangeMgr, RxMessage,
};
use crate::transport::network::Address;
use crate::transport::session::{NewSession, SessionHandle, SessionKey, SessionKeys, SessionMode};
use crate::utils::rand::Rand;
use crate::utils::storage::WriteBuf;

use super::cert::{Cert, MAX_CERT_TLV_LEN};
use super::pairing::{
    derive_session_keys, PairingDelegate, PairingError, SessionParams, HANDSHAKE_TIMEOUT,
};
use super::status_report::StatusReport;
use super::{complete_with_status, write_tlv, OpCode, SCStatusCodes, PROTO_ID_SECURE_CHANNEL};

const RANDOM_LEN: usize = 32;
const RESUMPTION_ID_LEN: usize = 16;

const MAX_SIGMA_LEN: usize = 1024;
const MAX_TBE_LEN: usize = 2 * MAX_CERT_TLV_LEN + EC_SIGNATURE_LEN_BYTES + 64;

const SIGMA2_INFO: &[u8] = b"Sigma2";
const SIGMA3_INFO: &[u8] = b"Sigma3";
const SESSION_KEYS_INFO: &[u8] = b"SessionKeys";

const SIGMA2_NONCE: &[u8] = b"NCASE_Sigma2N";
const SIGMA3_NONCE: &[u8] = b"NCASE_Sigma3N";

const MAX_RESPONDER_HANDSHAKES: usize = 2;

type EcPoint = [u8; EC_POINT_LEN_BYTES];
type SharedSecret = [u8; ECDH_SHARED_SECRET_LEN_BYTES];

struct ResponderState {
    exchange: ExchangeHandle,
    fab_idx: u8,
    tt_hash: Sha256,
    shared_secret: SharedSecret,
    our_pub_key: EcPoint,
    peer_pub_key: EcPoint,
    local_sess_id: u16,
    peer_sess_id: u16,
    peer_params: SessionParams,
}

/// The responder side of CASE, serving every fabric in the table.
pub struct CaseResponder<'a> {
    fabrics: &'a RefCell<FabricMgr>,
    states: RefCell<heapless::Vec<ResponderState, MAX_RESPONDER_HANDSHAKES>>,
    delegate: &'a dyn PairingDelegate,
}

impl<'a> CaseResponder<'a> {
    pub const fn new(fabrics: &'a RefCell<FabricMgr>, delegate: &'a dyn PairingDelegate) -> Self {
        Self {
            fabrics,
            states: RefCell::new(heapless::Vec::new()),
            delegate,
        }
    }

    pub fn handshakes_in_progress(&self) -> usize {
        self.states.borrow().len()
    }

    fn handle_sigma1(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        if self.states.borrow().iter().any(|s| s.exchange == ctx.handle()) {
            warn!("Sigma1 repeated mid-handshake");
            Err(ErrorCode::InvalidState)?;
        }

        if self.states.borrow().is_full() {
            warn!("Too many CASE handshakes in progress");
            Err(ErrorCode::ResourceExhausted)?;
        }

        let root = get_root_node_struct(rx.payload)?;
        let initiator_random = root.ctx::<OctetStr>(1)?.0;
        let peer_sess_id = root.ctx::<u16>(2)?;
        let dest_id = root.ctx::<OctetStr>(3)?.0;
        let peer_pub_key: EcPoint = root.ctx::<OctetStr>(4)?.0.try_into()?;
        let peer_params = root.ctx::<Option<SessionParams>>(5)?.unwrap_or_default();

        if root.ctx::<Option<OctetStr>>(6)?.is_some() {
            info!("CASE resumption requested, falling back to a full handshake");
        }

        let fabrics = self.fabrics.borrow();
        let fab_idx = fabrics
            .match_dest_id(initiator_random, dest_id)
            .map_err(|_| ErrorCode::NoFabric)?;
        let fabric = fabrics.get(fab_idx).ok_or(ErrorCode::NoFabric)?;

        let (key_pair, our_pub_key) = ephemeral_key(ctx.rand())?;
        let mut shared_secret = [0; ECDH_SHARED_SECRET_LEN_BYTES];
        key_pair.derive_secret(&peer_pub_key, &mut shared_secret)?;

        let mut our_random = [0; RANDOM_LEN];
        (ctx.rand())(&mut our_random);
        let mut resumption_id = [0; RESUMPTION_ID_LEN];
        (ctx.rand())(&mut resumption_id);

        let mut tt_hash = Sha256::new();
        tt_hash.update(rx.payload);

        let mut signature = [0; EC_SIGNATURE_LEN_BYTES];
        sign_tbs(fabric, &our_pub_key, &peer_pub_key, &mut signature)?;

        let mut encrypted = [0; MAX_TBE_LEN + AEAD_MIC_LEN_BYTES];
        let len = encode_tbe(&mut encrypted, fabric, &signature, Some(&resumption_id))?;

        let s2k = sigma_key(
            fabric,
            &[&our_random, &our_pub_key, &hash_of(&tt_hash)?],
            &shared_secret,
            SIGMA2_INFO,
        )?;
        let len = crypto::encrypt_in_place(&s2k, SIGMA2_NONCE, &[], &mut encrypted, len)?;
        drop(fabrics);

        let local_sess_id = ctx.mgr().sessions_mut().get_next_sess_id();
        let local_params = SessionParams::from_rmp(ctx.mgr().rmp());

        let mut buf = [0; MAX_SIGMA_LEN];
        let sigma2_len = write_tlv(&mut buf, |tw| {
            tw.start_struct(TagType::Anonymous)?;
            tw.str8(TagType::Context(1), &our_random)?;
            tw.u16(TagType::Context(2), local_sess_id)?;
            tw.str8(TagType::Context(3), &our_pub_key)?;
            tw.str16(TagType::Context(4), &encrypted[..len])?;
            local_params.to_tlv(tw, TagType::Context(5))?;
            tw.end_container()
        })?;
        tt_hash.update(&buf[..sigma2_len]);

        ctx.send(OpCode::CASESigma2, &buf[..sigma2_len])?;
        ctx.set_response_timeout(Some(HANDSHAKE_TIMEOUT))?;

        self.states
            .borrow_mut()
            .push(ResponderState {
                exchange: ctx.handle(),
                fab_idx,
                tt_hash,
                shared_secret,
                our_pub_key,
                peer_pub_key,
                local_sess_id,
                peer_sess_id,
                peer_params,
            })
            .map_err(|_| ErrorCode::ResourceExhausted)?;

        Ok(())
    }

    fn handle_sigma3(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let mut state = self.take_state(ctx.handle()).ok_or(ErrorCode::InvalidState)?;

        let fabrics = self.fabrics.borrow();
        let fabric = fabrics.get(state.fab_idx).ok_or(ErrorCode::NoFabric)?;

        let root = get_root_node_struct(rx.payload)?;
        let encrypted = root.ctx::<OctetStr>(1)?.0;

        let s3k = sigma_key(
            fabric,
            &[&hash_of(&state.tt_hash)?],
            &state.shared_secret,
            SIGMA3_INFO,
        )?;

        let mut decrypted = [0; MAX_TBE_LEN + AEAD_MIC_LEN_BYTES];
        let decrypted = decrypted
            .get_mut(..encrypted.len())
            .ok_or(ErrorCode::NoSpace)?;
        decrypted.copy_from_slice(encrypted);
        let len = crypto::decrypt_in_place(&s3k, SIGMA3_NONCE, &[], decrypted)?;

        let peer_node_id = verify_peer(
            fabric,
            &decrypted[..len],
            &state.peer_pub_key,
            &state.our_pub_key,
        )?;

        state.tt_hash.update(rx.payload);
        let keys = session_keys(fabric, &state.tt_hash, &state.shared_secret, false)?;
        let local_nodeid = fabric.node_id();
        drop(fabrics);

        let peer_addr = ctx.session_info()?.get_peer_addr();
        let session = install_session(
            ctx.mgr(),
            &Handshake {
                fab_idx: state.fab_idx,
                local_nodeid,
                peer_nodeid: peer_node_id,
                local_sess_id: state.local_sess_id,
                peer_sess_id: state.peer_sess_id,
                peer_params: state.peer_params,
            },
            peer_addr,
            keys,
        )?;

        if let Err(e) = complete_with_status(ctx, SCStatusCodes::SessionEstablishmentSuccess, &[])
        {
            ctx.mgr().remove_session(session)?;
            Err(e)?;
        }
        ctx.close()?;

        info!(
            "CASE session {:?} established with node {:x} on fabric {}",
            session, peer_node_id, state.fab_idx
        );
        self.delegate.on_pairing_complete(session);

        Ok(())
    }

    fn handle_status_report(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let report = StatusReport::decode(rx.payload)?;
        warn!("CASE aborted by the initiator: {:?}", report);

        self.take_state(ctx.handle());
        ctx.close()?;

        self.delegate.on_pairing_error(PairingError::Rejected {
            general_code: report.general_code,
            proto_code: report.proto_code,
        });

        Ok(())
    }

    fn take_state(&self, exchange: ExchangeHandle) -> Option<ResponderState> {
        let mut states = self.states.borrow_mut();
        let pos = states.iter().position(|s| s.exchange == exchange)?;

        Some(states.swap_remove(pos))
    }

    fn abort(&self, ctx: &mut ExchangeCtx, error: Error) {
        error!("CASE failed: {:?}", error);

        self.take_state(ctx.handle());

        let status = match error.code() {
            ErrorCode::NoFabric => SCStatusCodes::NoSharedTrustRoots,
            ErrorCode::ResourceExhausted => SCStatusCodes::Busy,
            _ => SCStatusCodes::InvalidParameter,
        };
        if let Err(e) = complete_with_status(ctx, status, &[]) {
            warn!("Could not report the CASE failure: {:?}", e);
        }
        if let Err(e) = ctx.close() {
            warn!("Could not close the CASE exchange: {:?}", e);
        }

        self.delegate
            .on_pairing_error(PairingError::Failed(error.code()));
    }
}

impl ExchangeDelegate for CaseResponder<'_> {
    fn on_message_received(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let result = match rx.opcode::<OpCode>() {
            _ if rx.proto.proto_id != PROTO_ID_SECURE_CHANNEL => {
                Err(ErrorCode::InvalidProto.into())
            }
            Ok(OpCode::CASESigma1) => self.handle_sigma1(ctx, rx),
            Ok(OpCode::CASESigma3) => self.handle_sigma3(ctx, rx),
            Ok(OpCode::StatusReport) => self.handle_status_report(ctx, rx),
            _ => Err(ErrorCode::InvalidOpcode.into()),
        };

        if let Err(e) = result {
            self.abort(ctx, e);
        }

        Ok(())
    }

    fn on_response_timeout(&self, ctx: &mut ExchangeCtx) {
        if self.take_state(ctx.handle()).is_some() {
            warn!("CASE timed out");
            self.delegate.on_pairing_error(PairingError::Timeout);
        }
    }

    fn on_exchange_closing(&self, exchange: ExchangeHandle) {
        if self.take_state(exchange).is_some() {
            warn!("CASE session went away mid-handshake");
            self.delegate
                .on_pairing_error(PairingError::Failed(ErrorCode::NoSession));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitiatorStep {
    AwaitSigma2,
    AwaitStatus,
}

struct InitiatorState {
    exchange: ExchangeHandle,
    unsecured: SessionHandle,
    step: InitiatorStep,
    fab_idx: u8,
    peer_node_id: u64,
    key_pair: KeyPair,
    our_pub_key: EcPoint,
    tt_hash: Sha256,
    local_sess_id: u16,
    peer_sess_id: u16,
    peer_params: SessionParams,
    keys: Option<SessionKeys>,
}

/// The initiator side of CASE, for controllers opening an operational
/// session towards a node they share a fabric with.
pub struct CaseInitiator<'a> {
    fabrics: &'a RefCell<FabricMgr>,
    state: RefCell<Option<InitiatorState>>,
    delegate: &'a dyn PairingDelegate,
}

impl<'a> CaseInitiator<'a> {
    pub const fn new(fabrics: &'a RefCell<FabricMgr>, delegate: &'a dyn PairingDelegate) -> Self {
        Self {
            fabrics,
            state: RefCell::new(None),
            delegate,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Starts a handshake with `peer_node_id` on the fabric `fab_idx`,
    /// reachable at `peer`.
    pub fn start<'d>(
        &'d self,
        mgr: &mut ExchangeMgr<'d>,
        peer: Address,
        fab_idx: u8,
        peer_node_id: u64,
    ) -> Result<(), Error> {
        if self.is_busy() {
            Err(ErrorCode::Busy)?;
        }

        let unsecured = mgr.open_unsecured(peer)?;
        match self.send_sigma1(mgr, unsecured, fab_idx, peer_node_id) {
            Ok(state) => {
                *self.state.borrow_mut() = Some(state);
                Ok(())
            }
            Err(e) => {
                mgr.release_session(unsecured);
                Err(e)
            }
        }
    }

    fn send_sigma1<'d>(
        &'d self,
        mgr: &mut ExchangeMgr<'d>,
        unsecured: SessionHandle,
        fab_idx: u8,
        peer_node_id: u64,
    ) -> Result<InitiatorState, Error> {
        let mut random = [0; RANDOM_LEN];
        (mgr.rand())(&mut random);

        let mut dest_id = [0; SHA256_HASH_LEN_BYTES];
        self.fabrics
            .borrow()
            .get(fab_idx)
            .ok_or(ErrorCode::NoFabric)?
            .dest_id(&random, peer_node_id, &mut dest_id)?;

        let (key_pair, our_pub_key) = ephemeral_key(mgr.rand())?;

        let local_sess_id = mgr.sessions_mut().get_next_sess_id();
        let local_params = SessionParams::from_rmp(mgr.rmp());

        let mut buf = [0; MAX_SIGMA_LEN];
        let len = write_tlv(&mut buf, |tw| {
            tw.start_struct(TagType::Anonymous)?;
            tw.str8(TagType::Context(1), &random)?;
            tw.u16(TagType::Context(2), local_sess_id)?;
            tw.str8(TagType::Context(3), &dest_id)?;
            tw.str8(TagType::Context(4), &our_pub_key)?;
            local_params.to_tlv(tw, TagType::Context(5))?;
            tw.end_container()
        })?;

        let mut tt_hash = Sha256::new();
        tt_hash.update(&buf[..len]);

        let exchange = mgr.new_exchange(unsecured, self)?;
        let mut ctx = ExchangeCtx::new(mgr, exchange);
        let sent = ctx
            .send(OpCode::CASESigma1, &buf[..len])
            .and_then(|_| ctx.set_response_timeout(Some(HANDSHAKE_TIMEOUT)));
        if let Err(e) = sent {
            ctx.close()?;
            Err(e)?;
        }

        Ok(InitiatorState {
            exchange,
            unsecured,
            step: InitiatorStep::AwaitSigma2,
            fab_idx,
            peer_node_id,
            key_pair,
            our_pub_key,
            tt_hash,
            local_sess_id,
            peer_sess_id: 0,
            peer_params: SessionParams::default(),
            keys: None,
        })
    }

    fn handle_sigma2(
        &self,
        ctx: &mut ExchangeCtx,
        rx: &RxMessage,
        state: &mut InitiatorState,
    ) -> Result<(), Error> {
        let root = get_root_node_struct(rx.payload)?;
        let responder_random = root.ctx::<OctetStr>(1)?.0;
        state.peer_sess_id = root.ctx::<u16>(2)?;
        let peer_pub_key: EcPoint = root.ctx::<OctetStr>(3)?.0.try_into()?;
        let encrypted = root.ctx::<OctetStr>(4)?.0;
        state.peer_params = root.ctx::<Option<SessionParams>>(5)?.unwrap_or_default();

        let fabrics = self.fabrics.borrow();
        let fabric = fabrics.get(state.fab_idx).ok_or(ErrorCode::NoFabric)?;

        let mut shared_secret = [0; ECDH_SHARED_SECRET_LEN_BYTES];
        state
            .key_pair
            .derive_secret(&peer_pub_key, &mut shared_secret)?;

        let s2k = sigma_key(
            fabric,
            &[responder_random, &peer_pub_key, &hash_of(&state.tt_hash)?],
            &shared_secret,
            SIGMA2_INFO,
        )?;

        let mut decrypted = [0; MAX_TBE_LEN + AEAD_MIC_LEN_BYTES];
        let decrypted = decrypted
            .get_mut(..encrypted.len())
            .ok_or(ErrorCode::NoSpace)?;
        decrypted.copy_from_slice(encrypted);
        let len = crypto::decrypt_in_place(&s2k, SIGMA2_NONCE, &[], decrypted)?;

        let responder_node_id =
            verify_peer(fabric, &decrypted[..len], &peer_pub_key, &state.our_pub_key)?;
        if responder_node_id != state.peer_node_id {
            error!(
                "Responder is node {:x}, expected {:x}",
                responder_node_id, state.peer_node_id
            );
            Err(ErrorCode::InvalidData)?;
        }

        state.tt_hash.update(rx.payload);

        let mut signature = [0; EC_SIGNATURE_LEN_BYTES];
        sign_tbs(fabric, &state.our_pub_key, &peer_pub_key, &mut signature)?;

        let mut encrypted = [0; MAX_TBE_LEN + AEAD_MIC_LEN_BYTES];
        let len = encode_tbe(&mut encrypted, fabric, &signature, None)?;

        let s3k = sigma_key(fabric, &[&hash_of(&state.tt_hash)?], &shared_secret, SIGMA3_INFO)?;
        let len = crypto::encrypt_in_place(&s3k, SIGMA3_NONCE, &[], &mut encrypted, len)?;

        let mut buf = [0; MAX_SIGMA_LEN];
        let sigma3_len = write_tlv(&mut buf, |tw| {
            tw.start_struct(TagType::Anonymous)?;
            tw.str16(TagType::Context(1), &encrypted[..len])?;
            tw.end_container()
        })?;
        state.tt_hash.update(&buf[..sigma3_len]);

        state.keys = Some(session_keys(fabric, &state.tt_hash, &shared_secret, true)?);
        drop(fabrics);

        ctx.send(OpCode::CASESigma3, &buf[..sigma3_len])?;
        ctx.set_response_timeout(Some(HANDSHAKE_TIMEOUT))?;
        state.step = InitiatorStep::AwaitStatus;

        Ok(())
    }

    fn handle_status(
        &self,
        ctx: &mut ExchangeCtx,
        rx: &RxMessage,
        state: &InitiatorState,
    ) -> Result<SessionHandle, PairingError> {
        let report = StatusReport::decode(rx.payload).map_err(PairingError::from)?;

        if state.step != InitiatorStep::AwaitStatus
            || !report.is_success()
            || SCStatusCodes::from_report(&report)
                != Some(SCStatusCodes::SessionEstablishmentSuccess)
        {
            return Err(PairingError::Rejected {
                general_code: report.general_code,
                proto_code: report.proto_code,
            });
        }

        let keys = state.keys.clone().ok_or(ErrorCode::InvalidState)?;
        let local_nodeid = self
            .fabrics
            .borrow()
            .get(state.fab_idx)
            .map(Fabric::node_id)
            .ok_or(ErrorCode::NoFabric)?;
        let peer_addr = ctx.session_info()?.get_peer_addr();

        let session = install_session(
            ctx.mgr(),
            &Handshake {
                fab_idx: state.fab_idx,
                local_nodeid,
                peer_nodeid: state.peer_node_id,
                local_sess_id: state.local_sess_id,
                peer_sess_id: state.peer_sess_id,
                peer_params: state.peer_params,
            },
            peer_addr,
            keys,
        )?;

        Ok(session)
    }

    fn finish(&self, ctx: &mut ExchangeCtx, state: InitiatorState) {
        if let Err(e) = ctx.close() {
            warn!("Could not close the CASE exchange: {:?}", e);
        }
        ctx.mgr().release_session(state.unsecured);
    }
}

impl ExchangeDelegate for CaseInitiator<'_> {
    fn on_message_received(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let Some(mut state) = self.state.borrow_mut().take() else {
            warn!("CASE message without a handshake in progress");
            return ctx.close();
        };

        if state.exchange != ctx.handle() {
            *self.state.borrow_mut() = Some(state);
            return ctx.close();
        }

        let result = match rx.opcode::<OpCode>() {
            Ok(OpCode::CASESigma2) if state.step == InitiatorStep::AwaitSigma2 => self
                .handle_sigma2(ctx, rx, &mut state)
                .map(|_| None)
                .map_err(PairingError::from),
            Ok(OpCode::StatusReport) => self.handle_status(ctx, rx, &state).map(Some),
            _ => Err(PairingError::Failed(ErrorCode::InvalidOpcode)),
        };

        match result {
            Ok(None) => {
                *self.state.borrow_mut() = Some(state);
            }
            Ok(Some(session)) => {
                self.finish(ctx, state);
                info!("CASE session {:?} established", session);
                self.delegate.on_pairing_complete(session);
            }
            Err(e) => {
                error!("CASE failed: {:?}", e);

                if !matches!(e, PairingError::Rejected { .. }) {
                    if let Err(e) = complete_with_status(ctx, SCStatusCodes::InvalidParameter, &[])
                    {
                        warn!("Could not report the CASE failure: {:?}", e);
                    }
                }
                self.finish(ctx, state);

                self.delegate.on_pairing_error(e);
            }
        }

        Ok(())
    }

    fn on_response_timeout(&self, ctx: &mut ExchangeCtx) {
        let state = self.state.borrow_mut().take();

        if let Some(state) = state {
            warn!("CASE timed out");
            ctx.mgr().release_session(state.unsecured);
            self.delegate.on_pairing_error(PairingError::Timeout);
        }
    }

    fn on_exchange_closing(&self, exchange: ExchangeHandle) {
        let mut state = self.state.borrow_mut();

        if state.as_ref().is_some_and(|s| s.exchange == exchange) {
            state.take();
            drop(state);
            self.delegate
                .on_pairing_error(PairingError::Failed(ErrorCode::NoSession));
        }
    }
}

struct Handshake {
    fab_idx: u8,
    local_nodeid: u64,
    peer_nodeid: u64,
    local_sess_id: u16,
    peer_sess_id: u16,
    peer_params: SessionParams,
}

fn install_session(
    mgr: &mut ExchangeMgr,
    hs: &Handshake,
    peer_addr: Address,
    keys: SessionKeys,
) -> Result<SessionHandle, Error> {
    if mgr
        .sessions()
        .find_entry(&SessionKey::LocalId(hs.local_sess_id))
        .is_some()
    {
        Err(ErrorCode::InvalidState)?;
    }

    let rmp = hs.peer_params.apply(mgr.rmp());

    mgr.sessions_mut().alloc_entry(NewSession {
        mode: SessionMode::Case {
            fab_idx: hs.fab_idx,
        },
        peer_addr,
        local_nodeid: hs.local_nodeid,
        peer_nodeid: Some(hs.peer_nodeid),
        local_sess_id: hs.local_sess_id,
        peer_sess_id: hs.peer_sess_id,
        keys: Some(keys),
        rmp,
    })
}

fn hash_of(tt_hash: &Sha256) -> Result<[u8; SHA256_HASH_LEN_BYTES], Error> {
    let mut hash = [0; SHA256_HASH_LEN_BYTES];
    tt_hash.clone().finish(&mut hash)?;

    Ok(hash)
}

/// HKDF over the ECDH secret, salted with the IPK followed by `salt_parts`.
fn sigma_key(
    fabric: &Fabric,
    salt_parts: &[&[u8]],
    shared_secret: &[u8],
    info: &[u8],
) -> Result<[u8; SYMM_KEY_LEN_BYTES], Error> {
    let mut salt = heapless::Vec::<u8, 160>::new();
    salt.extend_from_slice(fabric.ipk().op_key())
        .map_err(|_| ErrorCode::NoSpace)?;
    for part in salt_parts {
        salt.extend_from_slice(part)
            .map_err(|_| ErrorCode::NoSpace)?;
    }

    let mut key = [0; SYMM_KEY_LEN_BYTES];
    hkdf_sha256(&salt, shared_secret, info, &mut key)?;

    Ok(key)
}

fn session_keys(
    fabric: &Fabric,
    tt_hash: &Sha256,
    shared_secret: &[u8],
    initiator: bool,
) -> Result<SessionKeys, Error> {
    let mut salt = [0; SYMM_KEY_LEN_BYTES + SHA256_HASH_LEN_BYTES];
    salt[..SYMM_KEY_LEN_BYTES].copy_from_slice(fabric.ipk().op_key());
    salt[SYMM_KEY_LEN_BYTES..].copy_from_slice(&hash_of(tt_hash)?);

    derive_session_keys(&salt, shared_secret, SESSION_KEYS_INFO, initiator)
}

fn write_tbs(
    buf: &mut [u8],
    noc: &[u8],
    icac: Option<&[u8]>,
    sender_pub_key: &[u8],
    receiver_pub_key: &[u8],
) -> Result<usize, Error> {
    write_tlv(buf, |tw| {
        tw.start_struct(TagType::Anonymous)?;
        tw.str16(TagType::Context(1), noc)?;
        if let Some(icac) = icac {
            tw.str16(TagType::Context(2), icac)?;
        }
        tw.str8(TagType::Context(3), sender_pub_key)?;
        tw.str8(TagType::Context(4), receiver_pub_key)?;
        tw.end_container()
    })
}

fn sign_tbs(
    fabric: &Fabric,
    our_pub_key: &[u8],
    peer_pub_key: &[u8],
    signature: &mut [u8],
) -> Result<(), Error> {
    let mut buf = [0; MAX_TBE_LEN];
    let len = write_tbs(&mut buf, fabric.noc(), fabric.icac(), our_pub_key, peer_pub_key)?;
    fabric.sign_msg(&buf[..len], signature)?;

    Ok(())
}

fn encode_tbe(
    buf: &mut [u8],
    fabric: &Fabric,
    signature: &[u8],
    resumption_id: Option<&[u8]>,
) -> Result<usize, Error> {
    let mut wb = WriteBuf::new(buf);
    let mut tw = TLVWriter::new(&mut wb);

    tw.start_struct(TagType::Anonymous)?;
    tw.str16(TagType::Context(1), fabric.noc())?;
    if let Some(icac) = fabric.icac() {
        tw.str16(TagType::Context(2), icac)?;
    }
    tw.str8(TagType::Context(3), signature)?;
    if let Some(resumption_id) = resumption_id {
        tw.str8(TagType::Context(4), resumption_id)?;
    }
    tw.end_container()?;

    Ok(tw.get_tail())
}

/// Checks the decrypted Sigma2/Sigma3 payload: the sender's chain must lead
/// to our fabric's root, and its signature must cover both ephemeral keys.
/// Returns the sender's node id.
fn verify_peer(
    fabric: &Fabric,
    tbe: &[u8],
    peer_pub_key: &[u8],
    our_pub_key: &[u8],
) -> Result<u64, Error> {
    let root = get_root_node_struct(tbe)?;
    let noc_raw = root.ctx::<OctetStr>(1)?.0;
    let icac_raw = root.ctx::<Option<OctetStr>>(2)?.map(|o| o.0);
    let signature = root.ctx::<OctetStr>(3)?.0;

    let noc = Cert::new(noc_raw)?;
    let icac = icac_raw.map(Cert::new).transpose()?;

    if noc.get_fabric_id()? != fabric.fabric_id() {
        error!("Peer NOC is for another fabric");
        Err(ErrorCode::InvalidData)?;
    }
    if let Some(icac) = &icac {
        if icac
            .subject()
            .fabric_id()
            .is_some_and(|id| id != fabric.fabric_id())
        {
            Err(ErrorCode::InvalidData)?;
        }
    }

    noc.verify_chain(icac.as_ref(), &fabric.root_ca()?)?;

    let mut buf = [0; MAX_TBE_LEN];
    let len = write_tbs(&mut buf, noc_raw, icac_raw, peer_pub_key, our_pub_key)?;
    KeyPair::new_from_public(noc.get_pubkey())?.verify_msg(&buf[..len], signature)?;

    noc.get_node_id()
}

fn ephemeral_key(rand: Rand) -> Result<(KeyPair, EcPoint), Error> {
    let key_pair = KeyPair::new(rand);
    let mut pub_key = [0; EC_POINT_LEN_BYTES];
    key_pair.get_public_key(&mut pub_key)?;

    Ok((key_pair, pub_key))
}
