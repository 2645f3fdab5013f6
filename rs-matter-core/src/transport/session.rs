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

//! The session table.
//!
//! Every live session, whether secure, group or unauthenticated, occupies one
//! slot of a fixed-capacity pool and is addressed through a generational
//! [`SessionHandle`]. Lifetime is reference counted: the table's own
//! reference is taken at allocation, each exchange running on the session
//! takes another, and the session is freed when the count drops to zero.
//! Listeners are told about a release before the slot is recycled.

use core::fmt;
use core::time::Duration;

use log::{debug, info, warn};

use crate::crypto::{self, SYMM_KEY_LEN_BYTES};
use crate::error::*;
use crate::utils::epoch::Epoch;
use crate::utils::rand::Rand;
use crate::utils::storage::{Pool, PoolHandle};

use super::dedup::{GroupCtrStore, RxCtrState};
use super::mrp::RmpConfig;
use super::network::Address;

pub type SessionHandle = PoolHandle;

cfg_if::cfg_if! {
    if #[cfg(feature = "small-pools")] {
        pub const MAX_SESSIONS: usize = 4;
    } else {
        pub const MAX_SESSIONS: usize = 16;
    }
}

pub const MAX_SESSION_LISTENERS: usize = 4;

pub const ATT_CHALLENGE_LEN: usize = 16;

pub const UNSPECIFIED_NODE_ID: u64 = 0;

const MATTER_MSG_CTR_RANGE: u32 = 0x0fff_ffff;

pub type AeadKey = [u8; SYMM_KEY_LEN_BYTES];

#[derive(Debug, PartialEq, Eq, Clone, Copy, Default)]
pub enum SessionMode {
    Case {
        fab_idx: u8,
    },
    // A PASE session belongs to no fabric until commissioning assigns one
    Pase {
        fab_idx: u8,
    },
    Group {
        fab_idx: u8,
        group_id: u16,
    },
    #[default]
    PlainText,
}

impl SessionMode {
    pub fn fab_idx(&self) -> u8 {
        match self {
            SessionMode::Case { fab_idx }
            | SessionMode::Pase { fab_idx }
            | SessionMode::Group { fab_idx, .. } => *fab_idx,
            SessionMode::PlainText => 0,
        }
    }

    pub fn is_secure(&self) -> bool {
        matches!(self, SessionMode::Case { .. } | SessionMode::Pase { .. })
    }
}

/// The keys negotiated by a handshake. They are fixed for the lifetime of a
/// session; rekeying creates a new session.
#[derive(Clone)]
pub struct SessionKeys {
    pub enc_key: AeadKey,
    pub dec_key: AeadKey,
    pub att_challenge: [u8; ATT_CHALLENGE_LEN],
}

impl fmt::Debug for SessionKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKeys(..)")
    }
}

/// Everything needed to install a new session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub mode: SessionMode,
    pub peer_addr: Address,
    pub local_nodeid: u64,
    pub peer_nodeid: Option<u64>,
    pub local_sess_id: u16,
    pub peer_sess_id: u16,
    pub keys: Option<SessionKeys>,
    pub rmp: RmpConfig,
}

/// Lookup keys for [`SessionMgr::find_entry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKey {
    /// A secure unicast session, by the id we chose for it.
    LocalId(u16),
    /// A group session, by the session id derived from its key.
    Group(u16),
    /// A secure session to an operational peer.
    Peer { fab_idx: u8, nodeid: u64 },
    /// An unauthenticated session, by the peer's ephemeral node id.
    Unsecured { nodeid: Option<u64>, addr: Address },
}

pub struct Session {
    mode: SessionMode,
    peer_addr: Address,
    local_nodeid: u64,
    peer_nodeid: Option<u64>,
    keys: Option<SessionKeys>,
    local_sess_id: u16,
    peer_sess_id: u16,
    msg_ctr: u32,
    rx_ctr_state: Option<RxCtrState>,
    rmp: RmpConfig,
    refcount: u16,
    last_use: Duration,
    peer_active_at: Duration,
}

impl Session {
    fn new(params: NewSession, msg_ctr: u32, now: Duration) -> Self {
        Self {
            mode: params.mode,
            peer_addr: params.peer_addr,
            local_nodeid: params.local_nodeid,
            peer_nodeid: params.peer_nodeid,
            keys: params.keys,
            local_sess_id: params.local_sess_id,
            peer_sess_id: params.peer_sess_id,
            msg_ctr,
            rx_ctr_state: None,
            rmp: params.rmp,
            refcount: 1,
            last_use: now,
            peer_active_at: now,
        }
    }

    pub fn mode(&self) -> SessionMode {
        self.mode
    }

    pub fn fab_idx(&self) -> u8 {
        self.mode.fab_idx()
    }

    pub fn get_local_sess_id(&self) -> u16 {
        self.local_sess_id
    }

    pub fn get_peer_sess_id(&self) -> u16 {
        self.peer_sess_id
    }

    pub fn get_peer_addr(&self) -> Address {
        self.peer_addr
    }

    pub fn set_peer_addr(&mut self, addr: Address) {
        self.peer_addr = addr;
    }

    pub fn get_local_nodeid(&self) -> u64 {
        self.local_nodeid
    }

    pub fn get_peer_nodeid(&self) -> Option<u64> {
        self.peer_nodeid
    }

    pub fn is_encrypted(&self) -> bool {
        self.keys.is_some()
    }

    pub fn get_enc_key(&self) -> Option<&[u8]> {
        self.keys.as_ref().map(|k| &k.enc_key[..])
    }

    pub fn get_dec_key(&self) -> Option<&[u8]> {
        self.keys.as_ref().map(|k| &k.dec_key[..])
    }

    pub fn get_att_challenge(&self) -> Option<&[u8]> {
        self.keys.as_ref().map(|k| &k.att_challenge[..])
    }

    pub fn refcount(&self) -> u16 {
        self.refcount
    }

    pub fn last_use(&self) -> Duration {
        self.last_use
    }

    pub fn rmp(&self) -> &RmpConfig {
        &self.rmp
    }

    pub fn get_msg_ctr(&mut self) -> u32 {
        let ctr = self.msg_ctr;
        self.msg_ctr = self.msg_ctr.wrapping_add(1);
        ctr
    }

    /// Node id the peer uses in our nonces: its operational id on CASE,
    /// unspecified on PASE.
    pub fn rx_nonce_nodeid(&self) -> u64 {
        match self.mode {
            SessionMode::Case { .. } => self.peer_nodeid.unwrap_or(UNSPECIFIED_NODE_ID),
            _ => UNSPECIFIED_NODE_ID,
        }
    }

    pub fn tx_nonce_nodeid(&self) -> u64 {
        match self.mode {
            SessionMode::Case { .. } | SessionMode::Group { .. } => self.local_nodeid,
            _ => UNSPECIFIED_NODE_ID,
        }
    }

    /// Duplicate detection for unicast traffic. Returns `false` for a
    /// duplicate.
    pub fn post_recv(&mut self, msg_ctr: u32, now: Duration) -> bool {
        self.last_use = now;
        self.peer_active_at = now;

        let encrypted = self.is_encrypted();
        match &mut self.rx_ctr_state {
            Some(state) => state.post_recv(msg_ctr, encrypted),
            None => {
                self.rx_ctr_state = Some(RxCtrState::new(msg_ctr));
                true
            }
        }
    }

    pub fn touch(&mut self, now: Duration) {
        self.last_use = now;
    }

    /// Base retransmission interval, depending on whether the peer was heard
    /// from recently.
    pub fn retrans_base(&self, now: Duration) -> Duration {
        if now.saturating_sub(self.peer_active_at) < self.rmp.active_threshold {
            self.rmp.active_retrans_timeout
        } else {
            self.rmp.idle_retrans_timeout
        }
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} LSID:{:x} PSID:{:x} peer:{:?}/{} refs:{}",
            self.mode,
            self.local_sess_id,
            self.peer_sess_id,
            self.peer_nodeid,
            self.peer_addr,
            self.refcount
        )
    }
}

/// Told about every session leaving the table, before its slot is reused.
pub trait SessionReleaseListener {
    fn on_session_released(&self, handle: SessionHandle, session: &Session);
}

pub struct SessionMgr<'a> {
    sessions: Pool<Session, MAX_SESSIONS>,
    listeners: heapless::Vec<&'a dyn SessionReleaseListener, MAX_SESSION_LISTENERS>,
    group_ctrs: GroupCtrStore,
    next_sess_id: u16,
    epoch: Epoch,
    rand: Rand,
}

impl<'a> SessionMgr<'a> {
    pub const fn new(epoch: Epoch, rand: Rand) -> Self {
        Self {
            sessions: Pool::new(),
            listeners: heapless::Vec::new(),
            group_ctrs: GroupCtrStore::new(),
            next_sess_id: 1,
            epoch,
            rand,
        }
    }

    pub fn add_listener(&mut self, listener: &'a dyn SessionReleaseListener) -> Result<(), Error> {
        self.listeners
            .push(listener)
            .map_err(|_| ErrorCode::ResourceExhausted.into())
    }

    pub fn capacity(&self) -> usize {
        self.sessions.capacity()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Installs a session. Fails with `ResourceExhausted` when the table is
    /// full; making room is up to the caller.
    pub fn alloc_entry(&mut self, params: NewSession) -> Result<SessionHandle, Error> {
        let mut ctr = [0; 4];
        (self.rand)(&mut ctr);
        // Counters start at a random value in the lower 28 bits, plus one
        let msg_ctr = (u32::from_le_bytes(ctr) & MATTER_MSG_CTR_RANGE) + 1;

        let session = Session::new(params, msg_ctr, (self.epoch)());

        let handle = self.sessions.alloc(session).map_err(|_| {
            warn!("Session table full");
            ErrorCode::ResourceExhausted
        })?;

        debug!("Session {:?} allocated", handle);

        Ok(handle)
    }

    pub fn find_entry(&self, key: &SessionKey) -> Option<SessionHandle> {
        self.sessions
            .iter()
            .find(|(_, s)| match *key {
                SessionKey::LocalId(id) => s.mode.is_secure() && s.local_sess_id == id,
                SessionKey::Group(id) => {
                    matches!(s.mode, SessionMode::Group { .. }) && s.local_sess_id == id
                }
                SessionKey::Peer { fab_idx, nodeid } => {
                    matches!(s.mode, SessionMode::Case { .. })
                        && s.fab_idx() == fab_idx
                        && s.peer_nodeid == Some(nodeid)
                }
                SessionKey::Unsecured { nodeid, addr } => {
                    s.mode == SessionMode::PlainText
                        && s.peer_nodeid == nodeid
                        && s.peer_addr == addr
                }
            })
            .map(|(handle, _)| handle)
    }

    /// Finds or creates the unauthenticated session of a peer. When the
    /// table is full, the least recently used idle unauthenticated session is
    /// recycled; secure sessions are never evicted implicitly.
    pub fn get_or_add_unsecured(
        &mut self,
        nodeid: Option<u64>,
        addr: Address,
        rmp: RmpConfig,
        notify: &mut dyn FnMut(SessionHandle, &Session),
    ) -> Result<SessionHandle, Error> {
        if let Some(handle) = self.find_entry(&SessionKey::Unsecured { nodeid, addr }) {
            return Ok(handle);
        }

        if self.sessions.is_full() {
            let victim = self
                .sessions
                .iter()
                .filter(|(_, s)| s.mode == SessionMode::PlainText && s.refcount == 1)
                .min_by_key(|(_, s)| s.last_use)
                .map(|(handle, _)| handle);

            if let Some(victim) = victim {
                info!("Evicting unauthenticated session {:?}", victim);
                self.remove(victim, notify)?;
            }
        }

        self.alloc_entry(NewSession {
            mode: SessionMode::PlainText,
            peer_addr: addr,
            local_nodeid: UNSPECIFIED_NODE_ID,
            peer_nodeid: nodeid,
            local_sess_id: 0,
            peer_sess_id: 0,
            keys: None,
            rmp,
        })
    }

    /// Installs a group session keyed by the session id derived from the
    /// operational group key.
    pub fn add_group_session(
        &mut self,
        fab_idx: u8,
        group_id: u16,
        local_nodeid: u64,
        op_key: &AeadKey,
        addr: Address,
    ) -> Result<SessionHandle, Error> {
        let sess_id = derive_group_session_id(op_key)?;

        self.alloc_entry(NewSession {
            mode: SessionMode::Group { fab_idx, group_id },
            peer_addr: addr,
            local_nodeid,
            peer_nodeid: None,
            local_sess_id: sess_id,
            peer_sess_id: sess_id,
            keys: Some(SessionKeys {
                enc_key: *op_key,
                dec_key: *op_key,
                att_challenge: [0; ATT_CHALLENGE_LEN],
            }),
            rmp: RmpConfig::new(),
        })
    }

    /// Duplicate detection for group traffic, which is tracked per sender
    /// rather than per session.
    pub fn post_recv_group(
        &mut self,
        handle: SessionHandle,
        src_nodeid: u64,
        msg_ctr: u32,
    ) -> bool {
        let now = (self.epoch)();
        match self.sessions.get_mut(handle) {
            Some(session) => {
                session.touch(now);
                let fab_idx = session.fab_idx();
                self.group_ctrs.post_recv(fab_idx, src_nodeid, msg_ctr)
            }
            None => false,
        }
    }

    pub fn get(&self, handle: SessionHandle) -> Option<&Session> {
        self.sessions.get(handle)
    }

    pub fn get_mut(&mut self, handle: SessionHandle) -> Option<&mut Session> {
        self.sessions.get_mut(handle)
    }

    pub fn iter(&self) -> impl Iterator<Item = (SessionHandle, &Session)> {
        self.sessions.iter()
    }

    pub fn retain(&mut self, handle: SessionHandle) -> Result<(), Error> {
        let session = self.sessions.get_mut(handle).ok_or(ErrorCode::NoSession)?;
        session.refcount += 1;
        Ok(())
    }

    /// Drops one reference, freeing the session when none are left.
    /// Returns whether the session was freed.
    ///
    /// Releasing a session that is already gone is a programming error.
    pub fn release(
        &mut self,
        handle: SessionHandle,
        notify: &mut dyn FnMut(SessionHandle, &Session),
    ) -> Result<bool, Error> {
        let Some(session) = self.sessions.get_mut(handle) else {
            debug_assert!(false, "Release of a dead session {:?}", handle);
            return Err(ErrorCode::NoSession.into());
        };

        session.refcount -= 1;
        if session.refcount > 0 {
            return Ok(false);
        }

        self.remove(handle, notify)?;

        Ok(true)
    }

    /// Removes a session regardless of outstanding references. Holders of
    /// those references learn about it through the release notification and
    /// must not release them afterwards.
    pub fn remove(
        &mut self,
        handle: SessionHandle,
        notify: &mut dyn FnMut(SessionHandle, &Session),
    ) -> Result<(), Error> {
        let session = self.sessions.get(handle).ok_or(ErrorCode::NoSession)?;

        notify(handle, session);
        for listener in &self.listeners {
            listener.on_session_released(handle, session);
        }

        if let Some(session) = self.sessions.free(handle) {
            info!("Session {:?} released: {}", handle, session);
        }

        Ok(())
    }

    /// Secure sessions of a fabric, for removal when the fabric goes away.
    pub fn handles_for_fabric(&self, fab_idx: u8) -> heapless::Vec<SessionHandle, MAX_SESSIONS> {
        self.sessions
            .handles_where(|s| s.mode != SessionMode::PlainText && s.fab_idx() == fab_idx)
    }

    /// The least recently used secure session without exchanges running on
    /// it, the candidate to make room for a new one.
    pub fn lru_candidate(&self) -> Option<SessionHandle> {
        self.sessions
            .iter()
            .filter(|(_, s)| s.mode.is_secure() && s.refcount == 1)
            .min_by_key(|(_, s)| s.last_use)
            .map(|(handle, _)| handle)
    }

    /// A local session id not used by any live session.
    pub fn get_next_sess_id(&mut self) -> u16 {
        loop {
            let next = self.next_sess_id;

            self.next_sess_id = self.next_sess_id.wrapping_add(1);
            if self.next_sess_id == 0 {
                self.next_sess_id = 1;
            }

            if self
                .sessions
                .iter()
                .all(|(_, s)| !s.mode.is_secure() || s.local_sess_id != next)
            {
                break next;
            }
        }
    }

    pub fn remove_group_senders(&mut self, fab_idx: u8) {
        self.group_ctrs.remove_fabric(fab_idx);
    }
}

impl fmt::Display for SessionMgr<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{{[")?;
        for (handle, s) in self.sessions.iter() {
            writeln!(f, "{{ {:?}: {} }},", handle, s)?;
        }
        write!(f, "]}}")
    }
}

/// GroupSessionId = first two bytes of HKDF(key, info "GroupKeyHash"),
/// big-endian.
pub fn derive_group_session_id(op_key: &AeadKey) -> Result<u16, Error> {
    const GRP_KEY_HASH_INFO: &[u8] = b"GroupKeyHash";

    let mut hash = [0; 2];
    crypto::hkdf_sha256(&[], op_key, GRP_KEY_HASH_INFO, &mut hash)?;

    Ok(u16::from_be_bytes(hash))
}
