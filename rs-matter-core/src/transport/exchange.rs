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

//! Exchanges: request/response conversations multiplexed over a session.
//!
//! The [`ExchangeMgr`] owns the session table and every open exchange. It
//! decodes and decrypts incoming packets, drops duplicates, runs the reliable
//! message protocol and hands each new message to the delegate of the
//! exchange it belongs to. Messages that open a new exchange are dispatched
//! to the delegate registered for their protocol and opcode.
//!
//! The manager performs no I/O of its own besides [`NetworkSend`]: packets
//! are fed in through [`ExchangeMgr::handle_rx`] and time is advanced with
//! [`ExchangeMgr::process_timers`].

use core::fmt;
use core::time::Duration;

use log::{debug, error, info, trace, warn};

use crate::crypto::AEAD_MIC_LEN_BYTES;
use crate::error::*;
use crate::sc::{self, OpCode, SCStatusCodes, PROTO_ID_SECURE_CHANNEL};
use crate::utils::epoch::Epoch;
use crate::utils::rand::Rand;
use crate::utils::storage::{ParseBuf, Pool, PoolHandle, WriteBuf};

use super::mrp::{ReliableMessage, RmpAction, RmpConfig};
use super::network::{Address, NetworkSend, MAX_TX_PACKET_SIZE};
use super::plain_hdr::{max_plain_hdr_len, PlainHdr};
use super::proto_hdr::{self, max_proto_hdr_len, nonce, ProtoHdr};
use super::session::{
    NewSession, Session, SessionHandle, SessionKey, SessionMgr, SessionMode,
    SessionReleaseListener,
};

cfg_if::cfg_if! {
    if #[cfg(feature = "small-pools")] {
        pub const MAX_EXCHANGES: usize = 4;
        pub const MAX_UNSOLICITED_HANDLERS: usize = 4;
    } else {
        pub const MAX_EXCHANGES: usize = 8;
        pub const MAX_UNSOLICITED_HANDLERS: usize = 8;
    }
}

pub type ExchangeHandle = PoolHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// What goes into the protocol header of an outgoing message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageMeta {
    pub proto_id: u16,
    pub proto_opcode: u8,
    /// Ask for an acknowledgement. Ignored on group sessions and over
    /// transports that are reliable on their own.
    pub reliable: bool,
}

impl MessageMeta {
    pub const fn new(proto_id: u16, proto_opcode: u8, reliable: bool) -> Self {
        Self {
            proto_id,
            proto_opcode,
            reliable,
        }
    }

    pub fn is_standalone_ack(&self) -> bool {
        self.proto_id == PROTO_ID_SECURE_CHANNEL
            && self.proto_opcode == OpCode::MRPStandAloneAck as u8
    }
}

/// A message delivered to an exchange delegate.
pub struct RxMessage<'a> {
    pub peer: Address,
    pub plain: &'a PlainHdr,
    pub proto: &'a ProtoHdr,
    pub payload: &'a [u8],
}

impl RxMessage<'_> {
    pub fn meta(&self) -> MessageMeta {
        MessageMeta {
            proto_id: self.proto.proto_id,
            proto_opcode: self.proto.proto_opcode,
            reliable: self.proto.is_reliable(),
        }
    }

    pub fn opcode<T: num::FromPrimitive>(&self) -> Result<T, Error> {
        self.proto.opcode()
    }
}

/// Receives the events of the exchanges it is attached to.
///
/// Implementations keep their own state behind interior mutability, since
/// one delegate typically serves many exchanges.
pub trait ExchangeDelegate {
    fn on_message_received(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error>;

    /// The peer did not answer in time, either because the reliable message
    /// protocol gave up or because the response deadline passed. The
    /// exchange is freed when this returns.
    fn on_response_timeout(&self, ctx: &mut ExchangeCtx);

    /// The exchange is going away without the delegate asking for it,
    /// typically because its session was removed.
    fn on_exchange_closing(&self, _exchange: ExchangeHandle) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ExchangeState {
    Active,
    // Closed by its delegate, waiting for the ack of the last message
    Closing,
}

struct Exchange<'d> {
    id: u16,
    role: Role,
    session: Option<SessionHandle>,
    state: ExchangeState,
    delegate: Option<&'d dyn ExchangeDelegate>,
    mrp: ReliableMessage,
    retrans_buf: heapless::Vec<u8, MAX_TX_PACKET_SIZE>,
    response_due: Option<Duration>,
}

impl Exchange<'_> {
    fn next_due(&self) -> Option<Duration> {
        match (self.mrp.next_due(), self.response_due) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl fmt::Display for Exchange<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "EID:{:x} {:?} {:?} sess:{:?}",
            self.id, self.role, self.state, self.session
        )
    }
}

type HandlerKey = (u16, Option<u8>);

pub struct ExchangeMgr<'d> {
    sessions: SessionMgr<'d>,
    exchanges: Pool<Exchange<'d>, MAX_EXCHANGES>,
    handlers: heapless::LinearMap<HandlerKey, &'d dyn ExchangeDelegate, MAX_UNSOLICITED_HANDLERS>,
    network: &'d dyn NetworkSend,
    rmp: RmpConfig,
    next_exch_id: u16,
    in_callback: bool,
    epoch: Epoch,
    rand: Rand,
}

impl<'d> ExchangeMgr<'d> {
    pub fn new(network: &'d dyn NetworkSend, rmp: RmpConfig, epoch: Epoch, rand: Rand) -> Self {
        let mut id = [0; 2];
        rand(&mut id);

        Self {
            sessions: SessionMgr::new(epoch, rand),
            exchanges: Pool::new(),
            handlers: heapless::LinearMap::new(),
            network,
            rmp,
            next_exch_id: u16::from_le_bytes(id),
            in_callback: false,
            epoch,
            rand,
        }
    }

    pub fn rmp(&self) -> &RmpConfig {
        &self.rmp
    }

    pub fn now(&self) -> Duration {
        (self.epoch)()
    }

    pub fn rand(&self) -> Rand {
        self.rand
    }

    pub fn sessions(&self) -> &SessionMgr<'d> {
        &self.sessions
    }

    pub fn sessions_mut(&mut self) -> &mut SessionMgr<'d> {
        &mut self.sessions
    }

    pub fn add_session_listener(
        &mut self,
        listener: &'d dyn SessionReleaseListener,
    ) -> Result<(), Error> {
        self.sessions.add_listener(listener)
    }

    pub fn exchange_count(&self) -> usize {
        self.exchanges.len()
    }

    pub fn exchange_session(&self, exchange: ExchangeHandle) -> Option<SessionHandle> {
        self.exchanges.get(exchange).and_then(|e| e.session)
    }

    /// Registers the delegate for exchanges opened by the peer with the
    /// given protocol and opcode. `None` as opcode matches every opcode of
    /// the protocol that has no more specific registration.
    pub fn register_unsolicited_handler(
        &mut self,
        proto_id: u16,
        opcode: Option<u8>,
        handler: &'d dyn ExchangeDelegate,
    ) -> Result<(), Error> {
        let key = (proto_id, opcode);

        if self.handlers.contains_key(&key) {
            Err(ErrorCode::HandlerAlreadyRegistered)?;
        }

        self.handlers
            .insert(key, handler)
            .map_err(|_| ErrorCode::NoSpaceHandlers)?;

        Ok(())
    }

    pub fn unregister_unsolicited_handler(
        &mut self,
        proto_id: u16,
        opcode: Option<u8>,
    ) -> Result<(), Error> {
        self.handlers
            .remove(&(proto_id, opcode))
            .map(|_| ())
            .ok_or(ErrorCode::NoHandler.into())
    }

    fn find_handler(&self, proto_id: u16, opcode: u8) -> Option<&'d dyn ExchangeDelegate> {
        self.handlers
            .get(&(proto_id, Some(opcode)))
            .or_else(|| self.handlers.get(&(proto_id, None)))
            .copied()
    }

    /// Opens an unauthenticated session towards a peer, for starting a
    /// PASE or CASE handshake as initiator.
    pub fn open_unsecured(&mut self, peer: Address) -> Result<SessionHandle, Error> {
        let mut id = [0; 8];
        (self.rand)(&mut id);

        self.sessions.alloc_entry(NewSession {
            mode: SessionMode::PlainText,
            peer_addr: peer,
            // Random ephemeral node id, as an unauthenticated initiator
            local_nodeid: u64::from_le_bytes(id) | 1,
            peer_nodeid: None,
            local_sess_id: 0,
            peer_sess_id: 0,
            keys: None,
            rmp: self.rmp,
        })
    }

    /// Opens an exchange on `session`, with us as initiator.
    pub fn new_exchange(
        &mut self,
        session: SessionHandle,
        delegate: &'d dyn ExchangeDelegate,
    ) -> Result<ExchangeHandle, Error> {
        let id = self.next_exch_id;
        self.next_exch_id = self.next_exch_id.wrapping_add(1);

        self.alloc_exchange(session, id, Role::Initiator, delegate)
    }

    fn alloc_exchange(
        &mut self,
        session: SessionHandle,
        id: u16,
        role: Role,
        delegate: &'d dyn ExchangeDelegate,
    ) -> Result<ExchangeHandle, Error> {
        if self.exchanges.is_full() {
            warn!("No space for a new exchange");
            Err(ErrorCode::ResourceExhausted)?;
        }

        self.sessions.retain(session)?;

        let exchange = Exchange {
            id,
            role,
            session: Some(session),
            state: ExchangeState::Active,
            delegate: Some(delegate),
            mrp: ReliableMessage::new(),
            retrans_buf: heapless::Vec::new(),
            response_due: None,
        };

        match self.exchanges.alloc(exchange) {
            Ok(handle) => {
                debug!("Exchange {:?} opened: EID:{:x} {:?}", handle, id, role);
                Ok(handle)
            }
            Err(_) => {
                self.release_session(session);
                Err(ErrorCode::ResourceExhausted.into())
            }
        }
    }

    /// Closes an exchange on behalf of its delegate. A pending ack is flushed
    /// right away; if our last message is still unacknowledged the exchange
    /// lingers, detached from the delegate, until it is acked or given up on.
    pub fn close(&mut self, exchange: ExchangeHandle) -> Result<(), Error> {
        let exch = self
            .exchanges
            .get_mut(exchange)
            .ok_or(ErrorCode::NoExchange)?;
        exch.delegate = None;
        exch.response_due = None;

        if exch.mrp.is_ack_pending() {
            if let Err(e) = self.send_on(exchange, standalone_ack(), |_| Ok(())) {
                warn!("Flushing the ack of exchange {:?} failed: {:?}", exchange, e);
            }
        }

        let Some(exch) = self.exchanges.get_mut(exchange) else {
            return Ok(());
        };

        if exch.mrp.is_retrans_pending() {
            debug!("Exchange {:?} closing, waiting for ack", exchange);
            exch.state = ExchangeState::Closing;
        } else {
            self.free_exchange(exchange);
        }

        Ok(())
    }

    fn free_exchange(&mut self, exchange: ExchangeHandle) {
        if let Some(exch) = self.exchanges.free(exchange) {
            debug!("Exchange {:?} freed: {}", exchange, exch);

            if let Some(session) = exch.session {
                self.release_session(session);
            }
        }
    }

    /// Drops a reference taken with [`ExchangeMgr::open_unsecured`] or
    /// [`SessionMgr::retain`].
    pub fn release_session(&mut self, session: SessionHandle) {
        let exchanges = &mut self.exchanges;
        if let Err(e) = self
            .sessions
            .release(session, &mut |handle, _| detach_session(exchanges, handle))
        {
            error!("Releasing session {:?} failed: {:?}", session, e);
        }
    }

    /// Removes a session right away. Exchanges running on it are torn down
    /// and their delegates told through `on_exchange_closing`.
    pub fn remove_session(&mut self, session: SessionHandle) -> Result<(), Error> {
        let exchanges = &mut self.exchanges;
        self.sessions
            .remove(session, &mut |handle, _| detach_session(exchanges, handle))?;

        self.reap();

        Ok(())
    }

    /// Tells the peer we are closing the session, then removes it.
    pub fn close_session(&mut self, session: SessionHandle) -> Result<(), Error> {
        let sess = self.sessions.get(session).ok_or(ErrorCode::NoSession)?;

        if sess.mode().is_secure() {
            let mut proto = ProtoHdr::new();
            proto.exch_id = self.next_exch_id;
            proto.proto_id = PROTO_ID_SECURE_CHANNEL;
            proto.proto_opcode = OpCode::StatusReport as u8;
            proto.set_initiator(true);
            self.next_exch_id = self.next_exch_id.wrapping_add(1);

            if let Err(e) = self.send_unbound(session, &proto, |wb| {
                sc::sc_write(wb, SCStatusCodes::CloseSession, &[])
            }) {
                warn!("Sending CloseSession on {:?} failed: {:?}", session, e);
            }
        }

        self.remove_session(session)
    }

    /// Makes room in the session table by closing the least recently used
    /// secure session that has no exchanges running. Returns whether a
    /// session was evicted.
    pub fn evict_lru_session(&mut self) -> Result<bool, Error> {
        match self.sessions.lru_candidate() {
            Some(session) => {
                info!("Evicting session {:?}", session);
                self.close_session(session)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn remove_sessions_for_fabric(&mut self, fab_idx: u8) -> Result<(), Error> {
        for session in self.sessions.handles_for_fabric(fab_idx) {
            self.close_session(session)?;
        }

        self.sessions.remove_group_senders(fab_idx);

        Ok(())
    }

    /// Frees the exchanges whose session is gone.
    fn reap(&mut self) {
        if self.in_callback {
            return;
        }

        for handle in self.exchanges.handles_where(|e| e.session.is_none()) {
            if let Some(exch) = self.exchanges.free(handle) {
                debug!("Exchange {:?} torn down: {}", handle, exch);

                if let Some(delegate) = exch.delegate {
                    delegate.on_exchange_closing(handle);
                }
            }
        }
    }

    /// Sends a message on an exchange, arming retransmission when it asks
    /// for reliability and piggy-backing any pending ack.
    pub fn send_on<F>(
        &mut self,
        exchange: ExchangeHandle,
        meta: MessageMeta,
        payload: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut WriteBuf) -> Result<(), Error>,
    {
        let now = (self.epoch)();
        let mut jitter = [0; 1];
        (self.rand)(&mut jitter);

        let exch = self
            .exchanges
            .get_mut(exchange)
            .ok_or(ErrorCode::NoExchange)?;
        let sess_handle = exch.session.ok_or(ErrorCode::NoSession)?;
        let session = self
            .sessions
            .get_mut(sess_handle)
            .ok_or(ErrorCode::NoSession)?;

        let mut proto = ProtoHdr::new();
        proto.exch_id = exch.id;
        proto.proto_id = meta.proto_id;
        proto.proto_opcode = meta.proto_opcode;
        proto.set_initiator(exch.role == Role::Initiator);
        proto.set_reliable(
            meta.reliable && !matches!(session.mode(), SessionMode::Group { .. }),
        );

        let peer = session.get_peer_addr();
        proto.adjust_reliability(false, &peer);

        let msg_ctr = session.get_msg_ctr();
        let first_delay = session
            .rmp()
            .retrans_delay(session.retrans_base(now), 1, jitter[0]);
        exch.mrp.pre_send(msg_ctr, &mut proto, now, first_delay)?;
        session.touch(now);

        let mut buf = [0; MAX_TX_PACKET_SIZE];
        let (start, end) = match encode_msg(session, &proto, msg_ctr, payload, &mut buf) {
            Ok(range) => range,
            Err(e) => {
                exch.mrp.clear_retrans();
                Err(e)?
            }
        };

        if proto.is_reliable() {
            exch.retrans_buf.clear();
            exch.retrans_buf
                .extend_from_slice(&buf[start..end])
                .map_err(|_| ErrorCode::NoSpace)?;
        }

        trace!("TX on {:?}: {}", exchange, proto);

        self.network.send_to(&buf[start..end], peer)
    }

    /// Sends a message that belongs to no open exchange: acks for
    /// duplicates of closed exchanges and session close notices.
    fn send_unbound<F>(
        &mut self,
        session: SessionHandle,
        proto: &ProtoHdr,
        payload: F,
    ) -> Result<(), Error>
    where
        F: FnOnce(&mut WriteBuf) -> Result<(), Error>,
    {
        let sess = self
            .sessions
            .get_mut(session)
            .ok_or(ErrorCode::NoSession)?;
        let msg_ctr = sess.get_msg_ctr();

        let mut buf = [0; MAX_TX_PACKET_SIZE];
        let (start, end) = encode_msg(sess, proto, msg_ctr, payload, &mut buf)?;

        self.network.send_to(&buf[start..end], sess.get_peer_addr())
    }

    fn send_ack_unbound(
        &mut self,
        session: SessionHandle,
        rx_proto: &ProtoHdr,
        ack_ctr: u32,
    ) -> Result<(), Error> {
        let mut proto = ProtoHdr::new();
        proto.exch_id = rx_proto.exch_id;
        proto.proto_id = PROTO_ID_SECURE_CHANNEL;
        proto.proto_opcode = OpCode::MRPStandAloneAck as u8;
        proto.set_initiator(!rx_proto.is_initiator());
        proto.set_ack(Some(ack_ctr));

        self.send_unbound(session, &proto, |_| Ok(()))
    }

    /// Processes one received packet.
    ///
    /// Packets that cannot be attributed to a session or fail to decrypt are
    /// dropped with an error; duplicates are acknowledged again but never
    /// delivered twice.
    pub fn handle_rx(&mut self, packet: &mut [u8], peer: Address) -> Result<(), Error> {
        let result = self.process_rx(packet, peer);
        self.reap();

        result
    }

    fn process_rx(&mut self, packet: &mut [u8], peer: Address) -> Result<(), Error> {
        let now = (self.epoch)();

        let mut pb = ParseBuf::new(packet);
        let mut plain = PlainHdr::new();
        plain.decode(&mut pb)?;

        let sess_handle = if plain.is_group() {
            self.sessions
                .find_entry(&SessionKey::Group(plain.sess_id))
                .ok_or(ErrorCode::NoSession)?
        } else if plain.sess_id == 0 {
            let rmp = self.rmp;
            let exchanges = &mut self.exchanges;
            self.sessions.get_or_add_unsecured(
                plain.get_src_nodeid(),
                peer,
                rmp,
                &mut |handle, _| detach_session(exchanges, handle),
            )?
        } else {
            self.sessions
                .find_entry(&SessionKey::LocalId(plain.sess_id))
                .ok_or(ErrorCode::NoSession)?
        };

        let session = self
            .sessions
            .get_mut(sess_handle)
            .ok_or(ErrorCode::NoSession)?;

        let mut proto = ProtoHdr::new();
        if plain.is_encrypted() {
            let sender = if plain.is_group() {
                plain.get_src_nodeid().ok_or(ErrorCode::InvalidData)?
            } else {
                session.rx_nonce_nodeid()
            };
            let nonce = nonce(plain.sec_flags(), plain.ctr, sender);
            proto.decrypt_and_decode(&mut pb, Some(&nonce), session.get_dec_key())?;
        } else {
            proto.decrypt_and_decode(&mut pb, None, None)?;
        }

        proto.adjust_reliability(true, &peer);

        let fresh = if plain.is_group() {
            self.sessions
                .post_recv_group(sess_handle, plain.get_src_nodeid().unwrap_or(0), plain.ctr)
        } else {
            if session.get_peer_addr() != peer {
                // The peer moved; answer where it talks from now
                session.set_peer_addr(peer);
            }
            session.post_recv(plain.ctr, now)
        };

        trace!("RX on {:?}: {} {}", sess_handle, plain, proto);

        let exchange = self.exchanges.iter().find_map(|(handle, e)| {
            (e.session == Some(sess_handle)
                && e.id == proto.exch_id
                && (e.role == Role::Initiator) != proto.is_initiator())
            .then_some(handle)
        });

        let meta = MessageMeta {
            proto_id: proto.proto_id,
            proto_opcode: proto.proto_opcode,
            reliable: proto.is_reliable(),
        };

        if !fresh {
            info!("Dropping duplicate {:x} on {:?}", plain.ctr, sess_handle);

            if let Some(exchange) = exchange {
                if let Some(exch) = self.exchanges.get_mut(exchange) {
                    // The ack it carries may still be news to us
                    let mut ack_only = proto.clone();
                    ack_only.set_reliable(false);
                    let _ = exch.mrp.post_recv(plain.ctr, &ack_only, now, self.rmp.ack_timeout);
                }
                self.finish_closing(exchange);
            }

            if proto.is_reliable() {
                self.send_ack_unbound(sess_handle, &proto, plain.ctr)?;
            }

            return Ok(());
        }

        let exchange = match exchange {
            Some(exchange) => exchange,
            None if meta.is_standalone_ack() => {
                debug!("Ack for no exchange, dropping");
                return Ok(());
            }
            None if proto.is_initiator() => {
                let Some(handler) = self.find_handler(proto.proto_id, proto.proto_opcode) else {
                    warn!(
                        "No handler for unsolicited PROTO:{:x} OP:{:x}",
                        proto.proto_id, proto.proto_opcode
                    );
                    if proto.is_reliable() {
                        self.send_ack_unbound(sess_handle, &proto, plain.ctr)?;
                    }
                    return Err(ErrorCode::NoHandler.into());
                };

                self.alloc_exchange(sess_handle, proto.exch_id, Role::Responder, handler)?
            }
            None => {
                warn!("Message for an unknown exchange EID:{:x}", proto.exch_id);
                if proto.is_reliable() {
                    self.send_ack_unbound(sess_handle, &proto, plain.ctr)?;
                }
                Err(ErrorCode::NoExchange)?
            }
        };

        let exch = self
            .exchanges
            .get_mut(exchange)
            .ok_or(ErrorCode::NoExchange)?;

        if let Err(e) = exch.mrp.post_recv(plain.ctr, &proto, now, self.rmp.ack_timeout) {
            if e.code() == ErrorCode::Duplicate {
                info!("Dropping message with a stale ack on {:?}", exchange);
                return Ok(());
            }
            Err(e)?;
        }

        if exch.state == ExchangeState::Closing {
            self.finish_closing(exchange);
            return Ok(());
        }

        if meta.is_standalone_ack() {
            return Ok(());
        }

        let Some(delegate) = exch.delegate else {
            return Ok(());
        };
        exch.response_due = None;

        let rx = RxMessage {
            peer,
            plain: &plain,
            proto: &proto,
            payload: pb.as_slice(),
        };

        self.in_callback = true;
        let result = delegate.on_message_received(
            &mut ExchangeCtx {
                mgr: self,
                exchange,
            },
            &rx,
        );
        self.in_callback = false;

        if let Err(e) = result {
            error!("Exchange {:?} failed: {:?}", exchange, e);
            if self.exchanges.contains(exchange) {
                self.close(exchange)?;
            }
        }

        Ok(())
    }

    fn finish_closing(&mut self, exchange: ExchangeHandle) {
        if let Some(exch) = self.exchanges.get(exchange) {
            if exch.state == ExchangeState::Closing && !exch.mrp.is_retrans_pending() {
                self.free_exchange(exchange);
            }
        }
    }

    /// The earliest instant [`ExchangeMgr::process_timers`] has work to do.
    pub fn next_wakeup(&self) -> Option<Duration> {
        self.exchanges.iter().filter_map(|(_, e)| e.next_due()).min()
    }

    /// Sends standalone acks that are due, retransmits unacknowledged
    /// messages and times out exchanges whose peer went silent.
    pub fn process_timers(&mut self) -> Result<(), Error> {
        let now = (self.epoch)();

        for exchange in self
            .exchanges
            .handles_where(|e| e.next_due().is_some_and(|due| due <= now))
        {
            self.process_exchange_timers(exchange, now);
        }

        self.reap();

        Ok(())
    }

    fn process_exchange_timers(&mut self, exchange: ExchangeHandle, now: Duration) {
        let max_retransmissions = self.rmp.max_retransmissions;

        loop {
            let Some(exch) = self.exchanges.get_mut(exchange) else {
                return;
            };

            match exch.mrp.poll(now, max_retransmissions) {
                Some(RmpAction::SendAck(ctr)) => {
                    debug!("Standalone ack {:x} on {:?}", ctr, exchange);
                    if let Err(e) = self.send_on(exchange, standalone_ack(), |_| Ok(())) {
                        warn!("Standalone ack on {:?} failed: {:?}", exchange, e);
                        if let Some(exch) = self.exchanges.get_mut(exchange) {
                            exch.mrp.clear_ack();
                        }
                    }
                }
                Some(RmpAction::Retransmit) => self.retransmit(exchange, now),
                Some(RmpAction::GiveUp) => {
                    warn!("Exchange {:?}: peer did not ack, giving up", exchange);
                    exch.mrp.clear_retrans();
                    self.timeout(exchange);
                    return;
                }
                None => {
                    if exch.response_due.is_some_and(|due| due <= now) {
                        warn!("Exchange {:?}: no response in time", exchange);
                        exch.response_due = None;
                        self.timeout(exchange);
                    }
                    return;
                }
            }
        }
    }

    fn retransmit(&mut self, exchange: ExchangeHandle, now: Duration) {
        let mut jitter = [0; 1];
        (self.rand)(&mut jitter);

        let Some(exch) = self.exchanges.get_mut(exchange) else {
            return;
        };
        let Some(session) = exch.session.and_then(|s| self.sessions.get(s)) else {
            exch.mrp.clear_retrans();
            return;
        };

        let sent = exch.mrp.retrans().map(|r| r.sent()).unwrap_or(1);
        debug!("Retransmission #{} on {:?}", sent, exchange);

        if let Err(e) = self
            .network
            .send_to(&exch.retrans_buf, session.get_peer_addr())
        {
            warn!("Retransmission on {:?} failed: {:?}", exchange, e);
        }

        let delay = session.rmp().retrans_delay(
            session.retrans_base(now),
            sent.saturating_add(1),
            jitter[0],
        );
        exch.mrp.on_retransmitted(now, delay);
    }

    fn timeout(&mut self, exchange: ExchangeHandle) {
        let delegate = self
            .exchanges
            .get(exchange)
            .filter(|e| e.state == ExchangeState::Active)
            .and_then(|e| e.delegate);

        if let Some(delegate) = delegate {
            self.in_callback = true;
            delegate.on_response_timeout(&mut ExchangeCtx {
                mgr: self,
                exchange,
            });
            self.in_callback = false;
        }

        self.free_exchange(exchange);
    }
}

impl fmt::Display for ExchangeMgr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Sessions: {}", self.sessions)?;
        writeln!(f, "Exchanges: {{[")?;
        for (handle, exch) in self.exchanges.iter() {
            writeln!(f, "{{ {:?}: {} }},", handle, exch)?;
        }
        write!(f, "]}}")
    }
}

fn standalone_ack() -> MessageMeta {
    OpCode::MRPStandAloneAck.meta()
}

fn detach_session(exchanges: &mut Pool<Exchange<'_>, MAX_EXCHANGES>, session: SessionHandle) {
    for (_, exch) in exchanges.iter_mut() {
        if exch.session == Some(session) {
            exch.session = None;
            exch.mrp.clear_retrans();
            exch.mrp.clear_ack();
            exch.response_due = None;
        }
    }
}

/// Lays out and, on secure sessions, encrypts one message. Returns the
/// range of `buf` holding the packet.
fn encode_msg<F>(
    session: &Session,
    proto: &ProtoHdr,
    msg_ctr: u32,
    payload: F,
    buf: &mut [u8],
) -> Result<(usize, usize), Error>
where
    F: FnOnce(&mut WriteBuf) -> Result<(), Error>,
{
    let mut wb = WriteBuf::new(buf);
    wb.reserve(max_plain_hdr_len() + max_proto_hdr_len())?;
    wb.shrink(AEAD_MIC_LEN_BYTES)?;
    payload(&mut wb)?;
    wb.expand(AEAD_MIC_LEN_BYTES)?;

    let mut hdr = [0; max_proto_hdr_len()];
    let mut hdr_wb = WriteBuf::new(&mut hdr);
    proto.encode(&mut hdr_wb)?;
    wb.prepend(hdr_wb.as_slice())?;

    let mut plain = PlainHdr::new();
    plain.sess_id = session.get_peer_sess_id();
    plain.ctr = msg_ctr;

    match session.mode() {
        SessionMode::Group { group_id, .. } => {
            plain.set_src_nodeid(Some(session.get_local_nodeid()));
            plain.set_dst_groupcast_nodeid(Some(group_id));
        }
        SessionMode::PlainText => {
            let local = session.get_local_nodeid();
            plain.set_src_nodeid((local != 0).then_some(local));
            plain.set_dst_unicast_nodeid(session.get_peer_nodeid());
        }
        _ => (),
    }

    let mut plain_buf = [0; max_plain_hdr_len()];
    let mut plain_wb = WriteBuf::new(&mut plain_buf);
    plain.encode(&mut plain_wb)?;

    if let Some(key) = session.get_enc_key() {
        let nonce = nonce(plain.sec_flags(), msg_ctr, session.tx_nonce_nodeid());
        proto_hdr::encrypt_in_place(&nonce, plain_wb.as_slice(), &mut wb, key)?;
    }

    wb.prepend(plain_wb.as_slice())?;

    Ok((wb.get_start(), wb.get_tail()))
}

/// What an exchange delegate gets to work with while handling an event.
pub struct ExchangeCtx<'a, 'd> {
    mgr: &'a mut ExchangeMgr<'d>,
    exchange: ExchangeHandle,
}

impl<'a, 'd> ExchangeCtx<'a, 'd> {
    /// Drives an exchange from outside its delegate callbacks, typically
    /// to send the first message of an exchange we initiate.
    pub fn new(mgr: &'a mut ExchangeMgr<'d>, exchange: ExchangeHandle) -> Self {
        Self { mgr, exchange }
    }

    pub fn handle(&self) -> ExchangeHandle {
        self.exchange
    }

    pub fn session(&self) -> Result<SessionHandle, Error> {
        self.mgr
            .exchange_session(self.exchange)
            .ok_or(ErrorCode::NoSession.into())
    }

    pub fn session_info(&self) -> Result<&Session, Error> {
        let session = self.session()?;
        self.mgr
            .sessions
            .get(session)
            .ok_or(ErrorCode::NoSession.into())
    }

    pub fn mgr(&mut self) -> &mut ExchangeMgr<'d> {
        self.mgr
    }

    pub fn now(&self) -> Duration {
        self.mgr.now()
    }

    pub fn rand(&self) -> Rand {
        self.mgr.rand
    }

    pub fn send(&mut self, meta: impl Into<MessageMeta>, payload: &[u8]) -> Result<(), Error> {
        self.send_with(meta, |wb| wb.append(payload))
    }

    pub fn send_with<F>(&mut self, meta: impl Into<MessageMeta>, payload: F) -> Result<(), Error>
    where
        F: FnOnce(&mut WriteBuf) -> Result<(), Error>,
    {
        let exch = self
            .mgr
            .exchanges
            .get(self.exchange)
            .ok_or(ErrorCode::NoExchange)?;
        if exch.state != ExchangeState::Active {
            Err(ErrorCode::InvalidState)?;
        }

        self.mgr.send_on(self.exchange, meta.into(), payload)
    }

    /// Fails the exchange with a response timeout unless a message arrives
    /// within `timeout`.
    pub fn set_response_timeout(&mut self, timeout: Option<Duration>) -> Result<(), Error> {
        let now = self.mgr.now();
        let exch = self
            .mgr
            .exchanges
            .get_mut(self.exchange)
            .ok_or(ErrorCode::NoExchange)?;
        exch.response_due = timeout.map(|t| now + t);

        Ok(())
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.mgr.close(self.exchange)
    }
}
