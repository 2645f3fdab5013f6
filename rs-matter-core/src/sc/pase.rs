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

//! Passcode-authenticated session establishment.
//!
//! The responder (the device being commissioned) answers on the exchange
//! the initiator opens with a `PBKDFParamRequest`. Only one handshake runs
//! at a time; a second initiator is told to come back later. The session is
//! installed only after the initiator's confirmation has been verified.

use core::cell::RefCell;

use log::{error, info, warn};

use crate::error::*;
use crate::tlv::{get_root_node_struct, OctetStr, TagType, ToTLV};
use crate::transport::exchange::{
    ExchangeCtx, ExchangeDelegate, ExchangeHandle, ExchangeMgr, RxMessage,
};
use crate::transport::network::Address;
use crate::transport::session::{NewSession, SessionHandle, SessionKey, SessionKeys, SessionMode};

use super::pairing::{
    derive_session_keys, PairingDelegate, PairingError, SessionParams, HANDSHAKE_TIMEOUT,
};
use super::spake2p::{Spake2P, VerifierData};
use super::status_report::StatusReport;
use super::{complete_with_status, write_tlv, OpCode, SCStatusCodes, PROTO_ID_SECURE_CHANNEL};

const SPAKE2_SESSION_KEYS_INFO: &[u8] = b"SessionKeys";

const RANDOM_LEN: usize = 32;
const MAX_MSG_LEN: usize = 256;

// Minimum wait, in milliseconds, suggested to initiators we turn away
const BUSY_WAIT_MS: u16 = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ResponderStep {
    AwaitPake1,
    AwaitPake3,
}

struct ResponderState {
    exchange: ExchangeHandle,
    step: ResponderStep,
    spake2p: Spake2P,
    local_sess_id: u16,
    peer_sess_id: u16,
    peer_params: SessionParams,
}

/// The device side of PASE.
pub struct PaseResponder<'a> {
    verifier: RefCell<Option<VerifierData>>,
    state: RefCell<Option<ResponderState>>,
    delegate: &'a dyn PairingDelegate,
}

impl<'a> PaseResponder<'a> {
    pub const fn new(delegate: &'a dyn PairingDelegate) -> Self {
        Self {
            verifier: RefCell::new(None),
            state: RefCell::new(None),
            delegate,
        }
    }

    /// Opens the commissioning window with the given verifier.
    pub fn enable(&self, verifier: VerifierData) {
        info!("PASE enabled");
        *self.verifier.borrow_mut() = Some(verifier);
    }

    /// Closes the commissioning window. A handshake in progress is allowed
    /// to finish.
    pub fn disable(&self) {
        info!("PASE disabled");
        self.verifier.borrow_mut().take();
    }

    pub fn is_enabled(&self) -> bool {
        self.verifier.borrow().is_some()
    }

    pub fn is_busy(&self) -> bool {
        self.state.borrow().is_some()
    }

    fn handle_pbkdf_req(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let owner = self.state.borrow().as_ref().map(|s| s.exchange);
        if owner == Some(ctx.handle()) {
            // Out of order: this exchange is already past the parameters
            warn!("PBKDFParamRequest repeated mid-handshake");
            Err(ErrorCode::InvalidState)?;
        }

        if owner.is_some() {
            warn!("PASE already in progress, sending Busy");
            complete_with_status(ctx, SCStatusCodes::Busy, &BUSY_WAIT_MS.to_le_bytes())?;
            return ctx.close();
        }

        let Some(verifier) = self.verifier.borrow().clone() else {
            warn!("PASE request outside of a commissioning window");
            complete_with_status(ctx, SCStatusCodes::InvalidParameter, &[])?;
            return ctx.close();
        };

        let root = get_root_node_struct(rx.payload)?;
        let initiator_random = root.ctx::<OctetStr>(1)?.0;
        let peer_sess_id = root.ctx::<u16>(2)?;
        let passcode_id = root.ctx::<u16>(3)?;
        let has_params = root.ctx::<bool>(4)?;
        let peer_params = root.ctx::<Option<SessionParams>>(5)?.unwrap_or_default();

        if passcode_id != 0 || initiator_random.len() != RANDOM_LEN {
            Err(ErrorCode::InvalidData)?;
        }

        let mut our_random = [0; RANDOM_LEN];
        (ctx.rand())(&mut our_random);

        let local_sess_id = ctx.mgr().sessions_mut().get_next_sess_id();
        let local_params = SessionParams::from_rmp(ctx.mgr().rmp());

        let mut buf = [0; MAX_MSG_LEN];
        let len = write_tlv(&mut buf, |tw| {
            tw.start_struct(TagType::Anonymous)?;
            tw.str8(TagType::Context(1), initiator_random)?;
            tw.str8(TagType::Context(2), &our_random)?;
            tw.u16(TagType::Context(3), local_sess_id)?;
            if !has_params {
                tw.start_struct(TagType::Context(4))?;
                tw.u32(TagType::Context(1), verifier.count())?;
                tw.str8(TagType::Context(2), verifier.salt())?;
                tw.end_container()?;
            }
            local_params.to_tlv(tw, TagType::Context(5))?;
            tw.end_container()
        })?;

        let mut spake2p = Spake2P::new();
        spake2p.set_context();
        spake2p.update_context(rx.payload)?;
        spake2p.update_context(&buf[..len])?;
        spake2p.start_verifier(&verifier)?;

        ctx.send(OpCode::PBKDFParamResponse, &buf[..len])?;
        ctx.set_response_timeout(Some(HANDSHAKE_TIMEOUT))?;

        *self.state.borrow_mut() = Some(ResponderState {
            exchange: ctx.handle(),
            step: ResponderStep::AwaitPake1,
            spake2p,
            local_sess_id,
            peer_sess_id,
            peer_params,
        });

        Ok(())
    }

    #[allow(non_snake_case)]
    fn handle_pake1(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let mut state = self.take_state(ctx, ResponderStep::AwaitPake1)?;

        let root = get_root_node_struct(rx.payload)?;
        let pA = root.ctx::<OctetStr>(1)?.0;

        let (pB, cB) = state.spake2p.handle_pA(pA, ctx.rand())?;

        let mut buf = [0; MAX_MSG_LEN];
        let len = write_tlv(&mut buf, |tw| {
            tw.start_struct(TagType::Anonymous)?;
            tw.str8(TagType::Context(1), &pB)?;
            tw.str8(TagType::Context(2), &cB)?;
            tw.end_container()
        })?;

        ctx.send(OpCode::PASEPake2, &buf[..len])?;
        ctx.set_response_timeout(Some(HANDSHAKE_TIMEOUT))?;

        state.step = ResponderStep::AwaitPake3;
        *self.state.borrow_mut() = Some(state);

        Ok(())
    }

    #[allow(non_snake_case)]
    fn handle_pake3(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let mut state = self.take_state(ctx, ResponderStep::AwaitPake3)?;

        let root = get_root_node_struct(rx.payload)?;
        let cA = root.ctx::<OctetStr>(1)?.0;

        let Ke = state.spake2p.handle_cA(cA)?;
        let keys = derive_session_keys(&[], &Ke, SPAKE2_SESSION_KEYS_INFO, false)?;

        let peer_addr = ctx.session_info()?.get_peer_addr();
        let session = install_session(ctx.mgr(), &state, peer_addr, keys)?;

        if let Err(e) = complete_with_status(ctx, SCStatusCodes::SessionEstablishmentSuccess, &[])
        {
            ctx.mgr().remove_session(session)?;
            Err(e)?;
        }
        ctx.close()?;

        info!("PASE session {:?} established", session);
        self.delegate.on_pairing_complete(session);

        Ok(())
    }

    fn handle_status_report(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let report = StatusReport::decode(rx.payload)?;
        warn!("PASE aborted by the initiator: {:?}", report);

        self.clear_state(ctx.handle());
        ctx.close()?;

        self.delegate.on_pairing_error(PairingError::Rejected {
            general_code: report.general_code,
            proto_code: report.proto_code,
        });

        Ok(())
    }

    fn take_state(&self, ctx: &ExchangeCtx, step: ResponderStep) -> Result<ResponderState, Error> {
        let mut state = self.state.borrow_mut();

        if state
            .as_ref()
            .is_some_and(|s| s.exchange == ctx.handle() && s.step == step)
        {
            state.take().ok_or_else(|| ErrorCode::InvalidState.into())
        } else {
            Err(ErrorCode::InvalidState.into())
        }
    }

    fn clear_state(&self, exchange: ExchangeHandle) -> bool {
        let mut state = self.state.borrow_mut();

        if state.as_ref().is_some_and(|s| s.exchange == exchange) {
            state.take();
            true
        } else {
            false
        }
    }

    fn abort(&self, ctx: &mut ExchangeCtx, error: Error) {
        error!("PASE failed: {:?}", error);

        self.clear_state(ctx.handle());

        let status = if error.code() == ErrorCode::ResourceExhausted {
            SCStatusCodes::Busy
        } else {
            SCStatusCodes::InvalidParameter
        };
        if let Err(e) = complete_with_status(ctx, status, &[]) {
            warn!("Could not report the PASE failure: {:?}", e);
        }
        if let Err(e) = ctx.close() {
            warn!("Could not close the PASE exchange: {:?}", e);
        }

        self.delegate
            .on_pairing_error(PairingError::Failed(error.code()));
    }
}

impl ExchangeDelegate for PaseResponder<'_> {
    fn on_message_received(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let result = match rx.opcode::<OpCode>() {
            _ if rx.proto.proto_id != PROTO_ID_SECURE_CHANNEL => {
                Err(ErrorCode::InvalidProto.into())
            }
            Ok(OpCode::PBKDFParamRequest) => self.handle_pbkdf_req(ctx, rx),
            Ok(OpCode::PASEPake1) => self.handle_pake1(ctx, rx),
            Ok(OpCode::PASEPake3) => self.handle_pake3(ctx, rx),
            Ok(OpCode::StatusReport) => self.handle_status_report(ctx, rx),
            _ => Err(ErrorCode::InvalidOpcode.into()),
        };

        if let Err(e) = result {
            self.abort(ctx, e);
        }

        Ok(())
    }

    fn on_response_timeout(&self, ctx: &mut ExchangeCtx) {
        if self.clear_state(ctx.handle()) {
            warn!("PASE timed out");
            self.delegate.on_pairing_error(PairingError::Timeout);
        }
    }

    fn on_exchange_closing(&self, exchange: ExchangeHandle) {
        if self.clear_state(exchange) {
            warn!("PASE session went away mid-handshake");
            self.delegate
                .on_pairing_error(PairingError::Failed(ErrorCode::NoSession));
        }
    }
}

fn install_session(
    mgr: &mut ExchangeMgr,
    state: &ResponderState,
    peer_addr: Address,
    keys: SessionKeys,
) -> Result<SessionHandle, Error> {
    if mgr
        .sessions()
        .find_entry(&SessionKey::LocalId(state.local_sess_id))
        .is_some()
    {
        Err(ErrorCode::InvalidState)?;
    }

    let rmp = state.peer_params.apply(mgr.rmp());

    mgr.sessions_mut().alloc_entry(NewSession {
        mode: SessionMode::Pase { fab_idx: 0 },
        peer_addr,
        local_nodeid: 0,
        peer_nodeid: None,
        local_sess_id: state.local_sess_id,
        peer_sess_id: state.peer_sess_id,
        keys: Some(keys),
        rmp,
    })
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum InitiatorStep {
    AwaitPbkdfResp,
    AwaitPake2,
    AwaitStatus,
}

struct InitiatorState {
    exchange: ExchangeHandle,
    unsecured: SessionHandle,
    step: InitiatorStep,
    passcode: u32,
    random: [u8; RANDOM_LEN],
    spake2p: Spake2P,
    local_sess_id: u16,
    peer_sess_id: u16,
    peer_params: SessionParams,
    keys: Option<SessionKeys>,
}

/// The commissioner side of PASE.
pub struct PaseInitiator<'a> {
    state: RefCell<Option<InitiatorState>>,
    delegate: &'a dyn PairingDelegate,
}

impl<'a> PaseInitiator<'a> {
    pub const fn new(delegate: &'a dyn PairingDelegate) -> Self {
        Self {
            state: RefCell::new(None),
            delegate,
        }
    }

    pub fn is_busy(&self) -> bool {
        self.state.borrow().is_some()
    }

    /// Starts a handshake with the device at `peer`. The outcome is reported
    /// to the delegate.
    pub fn start<'d>(
        &'d self,
        mgr: &mut ExchangeMgr<'d>,
        peer: Address,
        passcode: u32,
    ) -> Result<(), Error> {
        if self.is_busy() {
            Err(ErrorCode::Busy)?;
        }

        let unsecured = mgr.open_unsecured(peer)?;
        match self.send_pbkdf_req(mgr, unsecured, passcode) {
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

    fn send_pbkdf_req<'d>(
        &'d self,
        mgr: &mut ExchangeMgr<'d>,
        unsecured: SessionHandle,
        passcode: u32,
    ) -> Result<InitiatorState, Error> {
        let mut random = [0; RANDOM_LEN];
        (mgr.rand())(&mut random);

        let local_sess_id = mgr.sessions_mut().get_next_sess_id();
        let local_params = SessionParams::from_rmp(mgr.rmp());

        let mut buf = [0; MAX_MSG_LEN];
        let len = write_tlv(&mut buf, |tw| {
            tw.start_struct(TagType::Anonymous)?;
            tw.str8(TagType::Context(1), &random)?;
            tw.u16(TagType::Context(2), local_sess_id)?;
            tw.u16(TagType::Context(3), 0)?;
            tw.bool(TagType::Context(4), false)?;
            local_params.to_tlv(tw, TagType::Context(5))?;
            tw.end_container()
        })?;

        let mut spake2p = Spake2P::new();
        spake2p.set_context();
        spake2p.update_context(&buf[..len])?;

        let exchange = mgr.new_exchange(unsecured, self)?;
        let mut ctx = ExchangeCtx::new(mgr, exchange);
        let sent = ctx
            .send(OpCode::PBKDFParamRequest, &buf[..len])
            .and_then(|_| ctx.set_response_timeout(Some(HANDSHAKE_TIMEOUT)));
        if let Err(e) = sent {
            ctx.close()?;
            Err(e)?;
        }

        Ok(InitiatorState {
            exchange,
            unsecured,
            step: InitiatorStep::AwaitPbkdfResp,
            passcode,
            random,
            spake2p,
            local_sess_id,
            peer_sess_id: 0,
            peer_params: SessionParams::default(),
            keys: None,
        })
    }

    #[allow(non_snake_case)]
    fn handle_pbkdf_resp(
        &self,
        ctx: &mut ExchangeCtx,
        rx: &RxMessage,
        state: &mut InitiatorState,
    ) -> Result<(), Error> {
        let root = get_root_node_struct(rx.payload)?;
        if root.ctx::<OctetStr>(1)?.0 != state.random {
            Err(ErrorCode::InvalidData)?;
        }
        state.peer_sess_id = root.ctx::<u16>(3)?;
        let params = root.find_ctx(4)?;
        let count = params.ctx::<u32>(1)?;
        let salt = params.ctx::<OctetStr>(2)?.0;
        state.peer_params = root.ctx::<Option<SessionParams>>(5)?.unwrap_or_default();

        state.spake2p.update_context(rx.payload)?;
        state.spake2p.start_prover(state.passcode, count, salt)?;
        let pA = state.spake2p.get_pA(ctx.rand())?;

        let mut buf = [0; MAX_MSG_LEN];
        let len = write_tlv(&mut buf, |tw| {
            tw.start_struct(TagType::Anonymous)?;
            tw.str8(TagType::Context(1), &pA)?;
            tw.end_container()
        })?;

        ctx.send(OpCode::PASEPake1, &buf[..len])?;
        ctx.set_response_timeout(Some(HANDSHAKE_TIMEOUT))?;
        state.step = InitiatorStep::AwaitPake2;

        Ok(())
    }

    #[allow(non_snake_case)]
    fn handle_pake2(
        &self,
        ctx: &mut ExchangeCtx,
        rx: &RxMessage,
        state: &mut InitiatorState,
    ) -> Result<(), Error> {
        let root = get_root_node_struct(rx.payload)?;
        let pB = root.ctx::<OctetStr>(1)?.0;
        let cB = root.ctx::<OctetStr>(2)?.0;

        let (cA, Ke) = state.spake2p.handle_pB_cB(pB, cB)?;
        state.keys = Some(derive_session_keys(
            &[],
            &Ke,
            SPAKE2_SESSION_KEYS_INFO,
            true,
        )?);

        let mut buf = [0; MAX_MSG_LEN];
        let len = write_tlv(&mut buf, |tw| {
            tw.start_struct(TagType::Anonymous)?;
            tw.str8(TagType::Context(1), &cA)?;
            tw.end_container()
        })?;

        ctx.send(OpCode::PASEPake3, &buf[..len])?;
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
        let peer_addr = ctx.session_info()?.get_peer_addr();
        let rmp = state.peer_params.apply(ctx.mgr().rmp());

        let session = ctx.mgr().sessions_mut().alloc_entry(NewSession {
            mode: SessionMode::Pase { fab_idx: 0 },
            peer_addr,
            local_nodeid: 0,
            peer_nodeid: None,
            local_sess_id: state.local_sess_id,
            peer_sess_id: state.peer_sess_id,
            keys: Some(keys),
            rmp,
        })?;

        Ok(session)
    }

    fn finish(&self, ctx: &mut ExchangeCtx, state: InitiatorState) {
        if let Err(e) = ctx.close() {
            warn!("Could not close the PASE exchange: {:?}", e);
        }
        ctx.mgr().release_session(state.unsecured);
    }
}

impl ExchangeDelegate for PaseInitiator<'_> {
    fn on_message_received(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let Some(mut state) = self.state.borrow_mut().take() else {
            warn!("PASE message without a handshake in progress");
            return ctx.close();
        };

        if state.exchange != ctx.handle() {
            *self.state.borrow_mut() = Some(state);
            return ctx.close();
        }

        let result = match rx.opcode::<OpCode>() {
            Ok(OpCode::PBKDFParamResponse) if state.step == InitiatorStep::AwaitPbkdfResp => self
                .handle_pbkdf_resp(ctx, rx, &mut state)
                .map(|_| None)
                .map_err(PairingError::from),
            Ok(OpCode::PASEPake2) if state.step == InitiatorStep::AwaitPake2 => self
                .handle_pake2(ctx, rx, &mut state)
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
                info!("PASE session {:?} established", session);
                self.delegate.on_pairing_complete(session);
            }
            Err(e) => {
                error!("PASE failed: {:?}", e);

                // A peer that rejected us already ended the handshake
                if !matches!(e, PairingError::Rejected { .. }) {
                    if let Err(e) = complete_with_status(ctx, SCStatusCodes::InvalidParameter, &[])
                    {
                        warn!("Could not report the PASE failure: {:?}", e);
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
            warn!("PASE timed out");
            // The exchange is freed by the caller
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
