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

//! Matter messages over a Bluetooth LE GATT link (BTP)
//!
//! BTP splits each Matter message into segments that fit the negotiated
//! ATT MTU and runs a small sliding window with explicit acknowledgements
//! on top of the GATT write (central to peripheral) and indication
//! (peripheral to central) characteristics. The GATT driver is abstracted
//! by [`GattLink`]; this module only implements the peripheral role.

use core::cell::RefCell;
use core::num::Wrapping;
use std::time::{Duration, Instant};

use bitflags::bitflags;
use log::{debug, info, trace, warn};

use crate::error::{Error, ErrorCode};
use crate::utils::storage::{ParseBuf, WriteBuf};

use super::{Address, BtAddr, NetworkReceive, NetworkSend, MAX_RX_PACKET_SIZE};

/// The only protocol version this implementation speaks.
pub const BTP_VERSION: u8 = 4;

/// Smallest ATT MTU a central may negotiate.
pub const MIN_MTU: u16 = 23;
/// Largest ATT MTU accepted; larger requests are clamped.
pub const MAX_MTU: u16 = 247;
/// ATT opcode and handle preceding every GATT write or indication.
pub const GATT_HEADER_SIZE: usize = 3;

/// Largest receive window offered to a central.
pub const MAX_WINDOW_SIZE: u8 = 6;

pub const MAX_BTP_SESSIONS: usize = 2;

/// How long a full send window waits for an acknowledgement.
pub const ACK_TIMEOUT: Duration = Duration::from_secs(15);

const HANDSHAKE_OPCODE: u8 = 0x6c;

bitflags! {
    #[repr(transparent)]
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct BtpFlags: u8 {
        const HANDSHAKE = 0x40;
        const MANAGEMENT = 0x20;
        const ACK = 0x08;
        const ENDING_SEGMENT = 0x04;
        const CONTINUE = 0x02;
        const BEGINNING_SEGMENT = 0x01;
    }
}

/// The BTP segment header.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BtpHdr {
    pub flags: BtpFlags,
    pub opcode: u8,
    pub ack: u8,
    pub seq: u8,
    pub msg_len: u16,
}

impl BtpHdr {
    pub const fn new() -> Self {
        Self {
            flags: BtpFlags::empty(),
            opcode: 0,
            ack: 0,
            seq: 0,
            msg_len: 0,
        }
    }

    pub fn is_handshake(&self) -> bool {
        self.flags.contains(BtpFlags::HANDSHAKE)
    }

    pub fn get_ack(&self) -> Option<u8> {
        self.flags.contains(BtpFlags::ACK).then_some(self.ack)
    }

    pub fn get_msg_len(&self) -> Option<u16> {
        (self.flags.contains(BtpFlags::BEGINNING_SEGMENT) && !self.is_handshake())
            .then_some(self.msg_len)
    }

    /// Encoded size of the header.
    pub fn len(&self) -> usize {
        let mut len = 1;
        if self.flags.contains(BtpFlags::MANAGEMENT) {
            len += 1;
        }
        if self.flags.contains(BtpFlags::ACK) {
            len += 1;
        }
        if !self.is_handshake() {
            len += 1;
            if self.flags.contains(BtpFlags::BEGINNING_SEGMENT) {
                len += 2;
            }
        }

        len
    }

    pub fn decode(&mut self, buf: &mut ParseBuf) -> Result<(), Error> {
        self.flags = BtpFlags::from_bits(buf.le_u8()?).ok_or(ErrorCode::InvalidData)?;

        if self.flags.contains(BtpFlags::MANAGEMENT) {
            self.opcode = buf.le_u8()?;
        }

        if self.flags.contains(BtpFlags::ACK) {
            self.ack = buf.le_u8()?;
        }

        if !self.is_handshake() {
            self.seq = buf.le_u8()?;

            if self.flags.contains(BtpFlags::BEGINNING_SEGMENT) {
                self.msg_len = buf.le_u16()?;
            }
        }

        trace!("[decode] {:?}", self);
        Ok(())
    }

    pub fn encode(&self, buf: &mut WriteBuf) -> Result<(), Error> {
        trace!("[encode] {:?}", self);
        buf.le_u8(self.flags.bits())?;

        if self.flags.contains(BtpFlags::MANAGEMENT) {
            buf.le_u8(self.opcode)?;
        }

        if self.flags.contains(BtpFlags::ACK) {
            buf.le_u8(self.ack)?;
        }

        if !self.is_handshake() {
            buf.le_u8(self.seq)?;

            if self.flags.contains(BtpFlags::BEGINNING_SEGMENT) {
                buf.le_u16(self.msg_len)?;
            }
        }

        Ok(())
    }
}

/// The handshake a central opens the BTP session with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeReq {
    /// Supported versions, one per nibble, most preferred first.
    pub versions: u32,
    pub mtu: u16,
    pub window_size: u8,
}

impl HandshakeReq {
    pub fn decode(buf: &mut ParseBuf) -> Result<Self, Error> {
        Ok(Self {
            versions: buf.le_u32()?,
            mtu: buf.le_u16()?,
            window_size: buf.le_u8()?,
        })
    }

    pub fn encode(&self, buf: &mut WriteBuf) -> Result<(), Error> {
        BtpHdr {
            flags: handshake_flags(),
            opcode: HANDSHAKE_OPCODE,
            ..BtpHdr::new()
        }
        .encode(buf)?;

        buf.le_u32(self.versions)?;
        buf.le_u16(self.mtu)?;
        buf.le_u8(self.window_size)
    }

    pub fn supports(&self, version: u8) -> bool {
        (0..8).any(|i| ((self.versions >> (i * 4)) & 0x0f) as u8 == version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeResp {
    pub version: u8,
    pub mtu: u16,
    pub window_size: u8,
}

impl HandshakeResp {
    pub fn encode(&self, buf: &mut WriteBuf) -> Result<(), Error> {
        BtpHdr {
            flags: handshake_flags(),
            opcode: HANDSHAKE_OPCODE,
            ..BtpHdr::new()
        }
        .encode(buf)?;

        buf.le_u8(self.version & 0x0f)?;
        buf.le_u16(self.mtu)?;
        buf.le_u8(self.window_size)
    }
}

fn handshake_flags() -> BtpFlags {
    BtpFlags::HANDSHAKE
        | BtpFlags::MANAGEMENT
        | BtpFlags::BEGINNING_SEGMENT
        | BtpFlags::ENDING_SEGMENT
}

/// The GATT operations BTP needs from the platform's BLE stack.
pub trait GattLink {
    /// Waits for the next write by a central to the RX characteristic.
    ///
    /// `Ok(None)` means the timeout elapsed.
    fn recv_write(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<Option<(usize, BtAddr)>, Error>;

    /// Sends `data` as an indication on the TX characteristic.
    fn indicate(&self, peer: BtAddr, data: &[u8]) -> Result<(), Error>;
}

impl<T> GattLink for &T
where
    T: GattLink + ?Sized,
{
    fn recv_write(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<Option<(usize, BtAddr)>, Error> {
        (*self).recv_write(buf, timeout)
    }

    fn indicate(&self, peer: BtAddr, data: &[u8]) -> Result<(), Error> {
        (*self).indicate(peer, data)
    }
}

struct BtpSession {
    peer: BtAddr,
    /// Segment size, i.e. the ATT MTU minus the GATT header.
    segment_size: usize,
    window_size: u8,
    last_sent_seq: u8,
    /// Segments we sent that the peer has not acknowledged yet.
    unacked: u8,
    last_rx_seq: u8,
    /// Segments received since we last acknowledged.
    pending_acks: u8,
    msg: heapless::Vec<u8, MAX_RX_PACKET_SIZE>,
    msg_len: usize,
    assembling: bool,
    complete: bool,
}

impl BtpSession {
    fn new(peer: BtAddr, mtu: u16, window_size: u8) -> Self {
        Self {
            peer,
            segment_size: mtu as usize - GATT_HEADER_SIZE,
            window_size,
            // The handshake response counts as segment 0
            last_sent_seq: 0,
            unacked: 1,
            last_rx_seq: 255,
            pending_acks: 0,
            msg: heapless::Vec::new(),
            msg_len: 0,
            assembling: false,
            complete: false,
        }
    }

    fn on_ack(&mut self, ack: u8) {
        let unacked = (Wrapping(self.last_sent_seq) - Wrapping(ack)).0;
        if unacked < self.window_size {
            self.unacked = unacked;
        } else {
            warn!("{}: ignoring ack {} outside the send window", self.peer, ack);
        }
    }

    /// The window counts as full one segment early when an ack is owed,
    /// so the last slot is kept for a segment that carries it.
    fn window_full(&self) -> bool {
        self.unacked >= self.window_size
            || self.unacked + 1 >= self.window_size && self.pending_acks == 0
    }

    fn next_hdr(&mut self) -> BtpHdr {
        self.last_sent_seq = self.last_sent_seq.wrapping_add(1);
        self.unacked += 1;

        let mut hdr = BtpHdr {
            seq: self.last_sent_seq,
            ..BtpHdr::new()
        };

        if self.pending_acks > 0 {
            hdr.flags |= BtpFlags::ACK;
            hdr.ack = self.last_rx_seq;
            self.pending_acks = 0;
        }

        hdr
    }

    fn on_data(&mut self, hdr: &BtpHdr, payload: &[u8]) -> Result<(), Error> {
        if hdr.seq != self.last_rx_seq.wrapping_add(1) {
            warn!(
                "{}: expected segment {}, got {}",
                self.peer,
                self.last_rx_seq.wrapping_add(1),
                hdr.seq
            );
            Err(ErrorCode::InvalidData)?;
        }

        self.last_rx_seq = hdr.seq;
        self.pending_acks += 1;

        if let Some(ack) = hdr.get_ack() {
            self.on_ack(ack);
        }

        if let Some(len) = hdr.get_msg_len() {
            if self.complete {
                // The previous message was not fetched yet
                Err(ErrorCode::Busy)?;
            }

            self.msg.clear();
            self.msg_len = len as usize;
            self.assembling = true;
        } else if payload.is_empty() && !hdr.flags.contains(BtpFlags::CONTINUE) {
            // Standalone ack
            return Ok(());
        } else if !self.assembling {
            warn!("{}: continuation without a beginning segment", self.peer);
            Err(ErrorCode::InvalidData)?;
        }

        self.msg
            .extend_from_slice(payload)
            .map_err(|_| ErrorCode::NoSpace)?;

        if self.msg.len() > self.msg_len {
            Err(ErrorCode::InvalidData)?;
        }

        if hdr.flags.contains(BtpFlags::ENDING_SEGMENT) {
            if self.msg.len() != self.msg_len {
                warn!(
                    "{}: message length {} does not match the announced {}",
                    self.peer,
                    self.msg.len(),
                    self.msg_len
                );
                Err(ErrorCode::InvalidData)?;
            }

            self.assembling = false;
            self.complete = true;
        }

        Ok(())
    }

    fn take_message(&mut self, buf: &mut [u8]) -> Result<Option<usize>, Error> {
        if !self.complete {
            return Ok(None);
        }

        let len = self.msg.len();
        if buf.len() < len {
            Err(ErrorCode::BufferTooSmall)?;
        }

        buf[..len].copy_from_slice(&self.msg);
        self.msg.clear();
        self.complete = false;

        Ok(Some(len))
    }
}

/// BTP in the peripheral role, over a [`GattLink`].
pub struct Btp<G> {
    gatt: G,
    sessions: RefCell<heapless::Vec<BtpSession, MAX_BTP_SESSIONS>>,
    ack_timeout: Duration,
}

impl<G> Btp<G>
where
    G: GattLink,
{
    pub const fn new(gatt: G) -> Self {
        Self {
            gatt,
            sessions: RefCell::new(heapless::Vec::new()),
            ack_timeout: ACK_TIMEOUT,
        }
    }

    pub fn set_ack_timeout(&mut self, timeout: Duration) {
        self.ack_timeout = timeout;
    }

    pub fn gatt(&self) -> &G {
        &self.gatt
    }

    pub fn session_count(&self) -> usize {
        self.sessions.borrow().len()
    }

    /// Forgets the session with `peer`, e.g. when the central disconnects.
    pub fn remove_peer(&self, peer: BtAddr) {
        let mut sessions = self.sessions.borrow_mut();
        if let Some(index) = sessions.iter().position(|s| s.peer == peer) {
            sessions.swap_remove(index);
            info!("BTP session with {} removed", peer);
        }
    }

    fn process_write(&self, data: &mut [u8], peer: BtAddr) -> Result<(), Error> {
        let mut pb = ParseBuf::new(data);
        let mut hdr = BtpHdr::new();
        hdr.decode(&mut pb)?;

        if hdr.is_handshake() {
            if hdr.opcode != HANDSHAKE_OPCODE {
                Err(ErrorCode::InvalidData)?;
            }

            let req = HandshakeReq::decode(&mut pb)?;
            return self.handshake(peer, &req);
        }

        let mut sessions = self.sessions.borrow_mut();
        let session = sessions
            .iter_mut()
            .find(|s| s.peer == peer)
            .ok_or(ErrorCode::NoSession)?;

        let result = session.on_data(&hdr, pb.as_slice());
        if result.is_err() {
            // A broken stream cannot be resynchronised
            let peer = session.peer;
            drop(sessions);
            self.remove_peer(peer);
            return result;
        }

        if session.pending_acks + 1 >= session.window_size {
            self.send_standalone_ack(session)?;
        }

        Ok(())
    }

    fn handshake(&self, peer: BtAddr, req: &HandshakeReq) -> Result<(), Error> {
        if !req.supports(BTP_VERSION) {
            warn!("{}: no common BTP version in {:08x}", peer, req.versions);
            Err(ErrorCode::Invalid)?;
        }

        let mtu = req.mtu.clamp(MIN_MTU, MAX_MTU);
        let window_size = req.window_size.clamp(1, MAX_WINDOW_SIZE);

        let mut sessions = self.sessions.borrow_mut();
        if let Some(index) = sessions.iter().position(|s| s.peer == peer) {
            sessions.swap_remove(index);
        }

        sessions
            .push(BtpSession::new(peer, mtu, window_size))
            .map_err(|_| ErrorCode::ResourceExhausted)?;

        let mut buf = [0; 8];
        let mut wb = WriteBuf::new(&mut buf);
        HandshakeResp {
            version: BTP_VERSION,
            mtu,
            window_size,
        }
        .encode(&mut wb)?;

        self.gatt.indicate(peer, wb.as_slice())?;
        info!(
            "BTP session with {} established: MTU {}, window {}",
            peer, mtu, window_size
        );

        Ok(())
    }

    fn send_standalone_ack(&self, session: &mut BtpSession) -> Result<(), Error> {
        let hdr = session.next_hdr();

        let mut buf = [0; 4];
        let mut wb = WriteBuf::new(&mut buf);
        hdr.encode(&mut wb)?;

        debug!("{}: standalone ack {}", session.peer, hdr.ack);
        self.gatt.indicate(session.peer, wb.as_slice())
    }

    /// Reads and processes one GATT write, waiting until `deadline` at most.
    ///
    /// Returns `false` if nothing arrived in time.
    fn pump(&self, deadline: Option<Instant>) -> Result<bool, Error> {
        let mut seg = [0; MAX_MTU as usize];

        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        let Some((len, peer)) = self.gatt.recv_write(&mut seg, timeout)? else {
            return Ok(false);
        };

        if let Err(e) = self.process_write(&mut seg[..len], peer) {
            warn!("{}: dropping segment: {}", peer, e);
        }

        Ok(true)
    }

    fn take_any(&self, buf: &mut [u8]) -> Result<Option<(usize, Address)>, Error> {
        for session in self.sessions.borrow_mut().iter_mut() {
            if let Some(len) = session.take_message(buf)? {
                return Ok(Some((len, Address::Btp(session.peer))));
            }
        }

        Ok(None)
    }
}

impl<G> NetworkSend for Btp<G>
where
    G: GattLink,
{
    fn send_to(&self, data: &[u8], addr: Address) -> Result<(), Error> {
        let peer = addr.btp().ok_or(ErrorCode::NoNetworkInterface)?;
        let len = u16::try_from(data.len()).map_err(|_| ErrorCode::NoSpace)?;

        let mut offset = 0;
        loop {
            let deadline = Instant::now() + self.ack_timeout;
            loop {
                let full = self
                    .sessions
                    .borrow()
                    .iter()
                    .find(|s| s.peer == peer)
                    .map(BtpSession::window_full)
                    .ok_or(ErrorCode::NoSession)?;

                if !full {
                    break;
                }

                if Instant::now() >= deadline {
                    warn!("{}: send window stayed full", peer);
                    self.remove_peer(peer);
                    Err(ErrorCode::Timeout)?;
                }

                self.pump(Some(deadline))?;
            }

            let mut sessions = self.sessions.borrow_mut();
            let session = sessions
                .iter_mut()
                .find(|s| s.peer == peer)
                .ok_or(ErrorCode::NoSession)?;

            let mut hdr = session.next_hdr();
            if offset == 0 {
                hdr.flags |= BtpFlags::BEGINNING_SEGMENT;
                hdr.msg_len = len;
            } else {
                hdr.flags |= BtpFlags::CONTINUE;
            }

            let chunk = (session.segment_size - hdr.len()).min(data.len() - offset);
            if offset + chunk == data.len() {
                hdr.flags |= BtpFlags::ENDING_SEGMENT;
            }

            let mut seg = [0; MAX_MTU as usize];
            let mut wb = WriteBuf::new(&mut seg);
            hdr.encode(&mut wb)?;
            wb.append(&data[offset..offset + chunk])?;

            self.gatt.indicate(peer, wb.as_slice())?;
            trace!("{}: sent segment {} ({} bytes)", peer, hdr.seq, chunk);

            offset += chunk;
            if offset >= data.len() {
                break;
            }
        }

        debug!("Sent {} bytes to {}", data.len(), peer);
        Ok(())
    }
}

impl<G> NetworkReceive for Btp<G>
where
    G: GattLink,
{
    fn recv_from(
        &self,
        buffer: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<Option<(usize, Address)>, Error> {
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if let Some(received) = self.take_any(buffer)? {
                return Ok(Some(received));
            }

            if !self.pump(deadline)? && deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(None);
            }
        }
    }
}
