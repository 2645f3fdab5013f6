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

//! Ties the layers together: the node's fabrics and persistence, the
//! secure channel and interaction model services, and the exchange manager
//! that carries them.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, Ordering};
use core::time::Duration;

use log::{debug, error, info, warn};

use crate::dm::{ClusterId, EndptId, Provider};
use crate::error::{Error, ErrorCode};
use crate::fabric::{Fabric, FabricMgr};
use crate::im::resumption::{ScopedNodeId, SubscriptionStore, MAX_SUBSCRIBED_PEERS};
use crate::im::InteractionModel;
use crate::persist::KvStore;
use crate::sc::case::{CaseInitiator, CaseResponder};
use crate::sc::pairing::{PairingDelegate, PairingError};
use crate::sc::pase::PaseResponder;
use crate::sc::spake2p::VerifierData;
use crate::sc::{OpCode, PROTO_ID_SECURE_CHANNEL};
use crate::transport::exchange::ExchangeMgr;
use crate::transport::mrp::RmpConfig;
use crate::transport::network::{
    Address, NetworkReceive, NetworkSend, MATTER_PORT, MAX_RX_PACKET_SIZE,
};
use crate::transport::session::{SessionHandle, SessionMode, MAX_SESSIONS};
use crate::utils::epoch::Epoch;
use crate::utils::rand::Rand;
use crate::utils::sync::{StackLock, WorkQueue};

/// Handshakes that completed but were not yet looked at by the stack.
const MAX_PENDING_SESSIONS: usize = 4;

/// The longest the event loop sleeps, so that scheduled work is picked up
/// even when the network is quiet.
const MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Node configuration.
#[derive(Debug, Clone)]
pub struct StackConfig {
    pub port: u16,
    /// Reliable message protocol parameters advertised to and used with
    /// every peer, unless a handshake negotiates others
    pub rmp: RmpConfig,
    /// Opens a commissioning window at start-up when the node belongs to
    /// no fabric yet
    pub passcode: Option<u32>,
    pub discriminator: u16,
}

impl StackConfig {
    pub const fn new() -> Self {
        Self {
            port: MATTER_PORT,
            rmp: RmpConfig::new(),
            passcode: None,
            discriminator: 0,
        }
    }
}

impl Default for StackConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// State shared by all services of a node.
pub struct Matter<'a> {
    config: StackConfig,
    fabrics: RefCell<FabricMgr>,
    kv: &'a RefCell<dyn KvStore + 'a>,
    epoch: Epoch,
    rand: Rand,
    established: RefCell<heapless::Deque<SessionHandle, MAX_PENDING_SESSIONS>>,
    last_error: RefCell<Option<PairingError>>,
}

impl<'a> Matter<'a> {
    pub fn new(
        config: StackConfig,
        kv: &'a RefCell<dyn KvStore + 'a>,
        epoch: Epoch,
        rand: Rand,
    ) -> Self {
        Self {
            config,
            fabrics: RefCell::new(FabricMgr::new()),
            kv,
            epoch,
            rand,
            established: RefCell::new(heapless::Deque::new()),
            last_error: RefCell::new(None),
        }
    }

    pub fn config(&self) -> &StackConfig {
        &self.config
    }

    pub fn fabrics(&self) -> &RefCell<FabricMgr> {
        &self.fabrics
    }

    pub fn kv(&self) -> &'a RefCell<dyn KvStore + 'a> {
        self.kv
    }

    pub fn epoch(&self) -> Epoch {
        self.epoch
    }

    pub fn rand(&self) -> Rand {
        self.rand
    }

    /// The outcome of the last failed handshake, if any.
    pub fn last_pairing_error(&self) -> Option<PairingError> {
        *self.last_error.borrow()
    }

    pub fn load_fabrics(&self) -> Result<(), Error> {
        self.fabrics.borrow_mut().load(&*self.kv.borrow())
    }

    pub fn store_fabrics(&self) -> Result<(), Error> {
        let mut fabrics = self.fabrics.borrow_mut();
        if fabrics.is_changed() {
            fabrics.store(&mut *self.kv.borrow_mut())?;
        }

        Ok(())
    }

    fn take_established(&self) -> Option<SessionHandle> {
        self.established.borrow_mut().pop_front()
    }
}

impl PairingDelegate for Matter<'_> {
    fn on_pairing_complete(&self, session: SessionHandle) {
        debug!("Session {:?} established", session);

        if self.established.borrow_mut().push_back(session).is_err() {
            warn!("Too many new sessions, {:?} will not resume subscriptions", session);
        }
    }

    fn on_pairing_error(&self, error: PairingError) {
        match error {
            PairingError::Timeout => warn!("Handshake timed out"),
            PairingError::Failed(code) => warn!("Handshake failed: {:?}", code),
            PairingError::Rejected {
                general_code,
                proto_code,
            } => warn!(
                "Handshake rejected by peer: {:?}/{:#06x}",
                general_code, proto_code
            ),
        }

        *self.last_error.borrow_mut() = Some(error);
    }
}

/// The protocol handlers of a node.
pub struct Services<'a> {
    pub pase: PaseResponder<'a>,
    pub case: CaseResponder<'a>,
    pub case_initiator: CaseInitiator<'a>,
    pub im: InteractionModel<'a>,
}

impl<'a> Services<'a> {
    pub fn new(matter: &'a Matter<'a>, provider: &'a dyn Provider) -> Self {
        Self {
            pase: PaseResponder::new(matter),
            case: CaseResponder::new(&matter.fabrics, matter),
            case_initiator: CaseInitiator::new(&matter.fabrics, matter),
            im: InteractionModel::new(provider, matter.kv, matter.rand),
        }
    }
}

/// A peer whose subscriptions we re-establish after a restart.
#[derive(Debug, Clone, Copy)]
struct Resumption {
    peer: ScopedNodeId,
    addr: Address,
}

/// A running node.
///
/// All of its state is reached through `&mut self`, so only one thread
/// drives it at a time. Threads that cannot own it post work to a
/// [`WorkQueue`] drained by [`Stack::run`], or share it behind a
/// [`StackLock`].
pub struct Stack<'a> {
    matter: &'a Matter<'a>,
    services: &'a Services<'a>,
    exchanges: ExchangeMgr<'a>,
    resumptions: heapless::Deque<Resumption, MAX_SUBSCRIBED_PEERS>,
    resuming: Option<ScopedNodeId>,
}

impl<'a> Stack<'a> {
    pub fn new(
        matter: &'a Matter<'a>,
        services: &'a Services<'a>,
        network: &'a dyn NetworkSend,
    ) -> Result<Self, Error> {
        let mut exchanges =
            ExchangeMgr::new(network, matter.config.rmp.clone(), matter.epoch, matter.rand);

        exchanges.register_unsolicited_handler(
            PROTO_ID_SECURE_CHANNEL,
            Some(OpCode::PBKDFParamRequest as u8),
            &services.pase,
        )?;
        exchanges.register_unsolicited_handler(
            PROTO_ID_SECURE_CHANNEL,
            Some(OpCode::CASESigma1 as u8),
            &services.case,
        )?;
        services.im.register(&mut exchanges)?;

        Ok(Self {
            matter,
            services,
            exchanges,
            resumptions: heapless::Deque::new(),
            resuming: None,
        })
    }

    /// Loads the persisted fabrics and opens the commissioning window when
    /// the node is not commissioned yet.
    pub fn init(&mut self) -> Result<(), Error> {
        self.matter.load_fabrics()?;

        let fabrics = self.matter.fabrics.borrow().len();
        info!("Node starting with {} fabric(s)", fabrics);

        if fabrics == 0 {
            if let Some(passcode) = self.matter.config.passcode {
                self.open_commissioning_window(passcode);
            }
        }

        Ok(())
    }

    pub fn matter(&self) -> &'a Matter<'a> {
        self.matter
    }

    pub fn services(&self) -> &'a Services<'a> {
        self.services
    }

    pub fn exchanges(&mut self) -> &mut ExchangeMgr<'a> {
        &mut self.exchanges
    }

    pub fn open_commissioning_window(&self, passcode: u32) {
        info!(
            "Commissioning window open, discriminator {}",
            self.matter.config.discriminator
        );
        self.services
            .pase
            .enable(VerifierData::new_with_pw(passcode, self.matter.rand));
    }

    pub fn close_commissioning_window(&self) {
        self.services.pase.disable();
    }

    /// Joins a fabric. The commissioning window closes.
    pub fn add_fabric(&mut self, fabric: Fabric) -> Result<u8, Error> {
        let fab_idx = self.matter.fabrics.borrow_mut().add(fabric)?;
        self.matter.store_fabrics()?;
        self.close_commissioning_window();

        info!("Joined fabric {}", fab_idx);

        Ok(fab_idx)
    }

    /// Leaves a fabric: its sessions are closed and its subscriptions
    /// forgotten.
    pub fn remove_fabric(&mut self, fab_idx: u8) -> Result<(), Error> {
        self.exchanges.remove_sessions_for_fabric(fab_idx)?;
        self.services.im.remove_fabric(fab_idx)?;
        self.matter.fabrics.borrow_mut().remove(fab_idx)?;
        self.matter.store_fabrics()?;

        info!("Left fabric {}", fab_idx);

        Ok(())
    }

    /// Joins `group_id` under the fabric's IPK group key. Messages sent on
    /// the returned session go to `addr`, usually the group's multicast
    /// address.
    pub fn join_group(
        &mut self,
        fab_idx: u8,
        group_id: u16,
        addr: Address,
    ) -> Result<SessionHandle, Error> {
        let (node_id, op_key) = {
            let fabrics = self.matter.fabrics.borrow();
            let fabric = fabrics.get(fab_idx).ok_or(ErrorCode::NoFabric)?;
            (fabric.node_id(), *fabric.ipk().op_key())
        };

        let session = self
            .exchanges
            .sessions_mut()
            .add_group_session(fab_idx, group_id, node_id, &op_key, addr)?;

        info!("Joined group {:04x} on fabric {}", group_id, fab_idx);

        Ok(session)
    }

    pub fn notify_changed(&self, endpoint: EndptId, cluster: ClusterId) {
        self.services.im.notify_changed(endpoint, cluster);
    }

    /// Re-establishes the subscriptions persisted before a restart.
    ///
    /// `resolve` maps a subscriber to its current address; peers it cannot
    /// resolve are skipped. Returns the number of peers queued.
    pub fn start_resumption<F>(&mut self, mut resolve: F) -> Result<usize, Error>
    where
        F: FnMut(u8, u64) -> Option<Address>,
    {
        let peers = SubscriptionStore::new(&mut *self.matter.kv.borrow_mut()).peers()?;

        for (fab_idx, node_id) in peers {
            let Some(addr) = resolve(fab_idx, node_id) else {
                debug!("No address for subscriber {:x}, not resuming", node_id);
                continue;
            };

            if self
                .resumptions
                .push_back(Resumption {
                    peer: (fab_idx, node_id),
                    addr,
                })
                .is_err()
            {
                break;
            }
        }

        Ok(self.resumptions.len())
    }

    /// Processes one received packet.
    pub fn handle_rx(&mut self, packet: &mut [u8], peer: Address) -> Result<(), Error> {
        let result = self.exchanges.handle_rx(packet, peer);
        self.on_new_sessions();

        result
    }

    /// Runs timers: retransmissions, handshake and response timeouts, and
    /// subscription reports. Call at least at [`Stack::next_wakeup`].
    pub fn poll(&mut self) -> Result<(), Error> {
        self.exchanges.process_timers()?;
        self.on_new_sessions();
        self.next_resumption();
        self.services.im.process_subscriptions(&mut self.exchanges)?;
        self.matter.store_fabrics()
    }

    pub fn next_wakeup(&self) -> Option<Duration> {
        match (self.exchanges.next_wakeup(), self.services.im.next_wakeup()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Closes every session and drops all live subscriptions. Persisted
    /// subscriptions survive for the next start.
    pub fn shutdown(&mut self) -> Result<(), Error> {
        self.services.im.shutdown();
        self.services.pase.disable();

        let sessions: heapless::Vec<SessionHandle, MAX_SESSIONS> = self
            .exchanges
            .sessions()
            .iter()
            .filter(|(_, s)| s.mode().is_secure())
            .map(|(handle, _)| handle)
            .collect();
        for session in sessions {
            self.exchanges.close_session(session)?;
        }

        self.matter.store_fabrics()
    }

    /// Drives the node until `stop` is set: receives packets, runs the
    /// timers and the work scheduled on `work`.
    ///
    /// The stack is locked while it processes and unlocked while it waits
    /// for the network.
    pub fn run<R, const N: usize>(
        lock: &StackLock<Self>,
        recv: &R,
        work: &WorkQueue<Self, N>,
        stop: &AtomicBool,
    ) -> Result<(), Error>
    where
        R: NetworkReceive,
    {
        let mut buf = [0; MAX_RX_PACKET_SIZE];

        while !stop.load(Ordering::Relaxed) {
            let timeout = {
                let mut stack = lock.lock();
                work.drain(&mut *stack);
                stack.poll()?;

                let now = (stack.matter.epoch)();
                stack
                    .next_wakeup()
                    .map(|at| at.saturating_sub(now))
                    .unwrap_or(MAX_POLL_INTERVAL)
                    .clamp(Duration::from_millis(1), MAX_POLL_INTERVAL)
            };

            if let Some((len, peer)) = recv.recv_from(&mut buf, Some(timeout))? {
                let mut stack = lock.lock();
                if let Err(e) = stack.handle_rx(&mut buf[..len], peer) {
                    debug!("Dropped packet from {}: {:?}", peer, e);
                }
            }
        }

        info!("Stack stopped");

        lock.lock().shutdown()
    }

    fn on_new_sessions(&mut self) {
        while let Some(session) = self.matter.take_established() {
            let Some(info) = self.exchanges.sessions().get(session) else {
                continue;
            };

            if !matches!(info.mode(), SessionMode::Case { .. }) {
                continue;
            }

            let peer = (info.fab_idx(), info.get_peer_nodeid().unwrap_or(0));
            if self.resuming != Some(peer) {
                continue;
            }
            self.resuming = None;

            if let Err(e) = self
                .services
                .im
                .resume_subscriptions(&mut self.exchanges, session)
            {
                error!("Resuming subscriptions of {:x} failed: {:?}", peer.1, e);
            }
        }
    }

    fn next_resumption(&mut self) {
        if self.services.case_initiator.is_busy() {
            return;
        }

        if let Some(peer) = self.resuming.take() {
            debug!("Could not reach subscriber {:x}", peer.1);
        }

        while let Some(next) = self.resumptions.pop_front() {
            let (fab_idx, node_id) = next.peer;
            match self
                .services
                .case_initiator
                .start(&mut self.exchanges, next.addr, fab_idx, node_id)
            {
                Ok(()) => {
                    self.resuming = Some(next.peer);
                    return;
                }
                Err(e) => warn!("Cannot reach subscriber {:x}: {:?}", node_id, e),
            }
        }
    }
}
