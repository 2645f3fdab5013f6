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

//! PASE and CASE handshakes between a controller and a device.

use core::cell::RefCell;
use core::time::Duration;

use rs_matter_core::error::{Error, ErrorCode};
use rs_matter_core::fabric::FabricMgr;
use rs_matter_core::persist::MemKvStore;
use rs_matter_core::sc::case::CaseInitiator;
use rs_matter_core::sc::pairing::PairingError;
use rs_matter_core::sc::pase::PaseInitiator;
use rs_matter_core::sc::OpCode;
use rs_matter_core::tlv::{TLVWriter, TagType};
use rs_matter_core::transport::exchange::{
    ExchangeCtx, ExchangeDelegate, ExchangeHandle, ExchangeMgr, RxMessage,
};
use rs_matter_core::transport::network::NetworkSend;
use rs_matter_core::transport::plain_hdr::PlainHdr;
use rs_matter_core::transport::proto_hdr::ProtoHdr;
use rs_matter_core::transport::session::SessionMode;
use rs_matter_core::utils::rand::sys_rand;
use rs_matter_core::utils::storage::{ParseBuf, WriteBuf};
use rs_matter_core::{Matter, Services, Stack};

use common::*;

mod common;

/// Runs the controller's timers until something gives up, dropping
/// everything it sends.
fn run_silent(mgr: &mut ExchangeMgr, net: &Outbox, log: &PairingLog) {
    for _ in 0..100 {
        net.take();
        if !log.errors.borrow().is_empty() {
            return;
        }

        let Some(at) = mgr.next_wakeup() else {
            return;
        };
        set_now(at.max(now()));
        mgr.process_timers().unwrap();
    }

    panic!("The handshake never timed out");
}

/// A controller that speaks the secure channel by hand, one message at a
/// time. It keeps what the device sends and only closes on a StatusReport.
#[derive(Default)]
struct Scripted {
    received: RefCell<Vec<(u8, Vec<u8>)>>,
}

impl Scripted {
    fn open<'d>(&'d self, ctrl: &mut ExchangeMgr<'d>) -> ExchangeHandle {
        let session = ctrl.open_unsecured(device_addr()).unwrap();
        ctrl.new_exchange(session, self).unwrap()
    }

    fn send(
        &self,
        ctrl: &mut ExchangeMgr,
        exchange: ExchangeHandle,
        opcode: OpCode,
        payload: &[u8],
    ) {
        ExchangeCtx::new(ctrl, exchange).send(opcode, payload).unwrap();
    }

    fn opcodes(&self) -> Vec<u8> {
        self.received.borrow().iter().map(|(op, _)| *op).collect()
    }
}

impl ExchangeDelegate for Scripted {
    fn on_message_received(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        self.received
            .borrow_mut()
            .push((rx.proto.proto_opcode, rx.payload.to_vec()));

        if rx.proto.proto_opcode == OpCode::StatusReport as u8 {
            ctx.close()?;
        }

        Ok(())
    }

    fn on_response_timeout(&self, _ctx: &mut ExchangeCtx) {}
}

fn pbkdf_param_request() -> Vec<u8> {
    let mut buf = vec![0; 128];
    let mut wb = WriteBuf::new(&mut buf);
    let mut tw = TLVWriter::new(&mut wb);
    tw.start_struct(TagType::Anonymous).unwrap();
    tw.str8(TagType::Context(1), &[0x5a; 32]).unwrap();
    tw.u16(TagType::Context(2), 0x1234).unwrap();
    tw.u16(TagType::Context(3), 0).unwrap();
    tw.bool(TagType::Context(4), false).unwrap();
    tw.end_container().unwrap();

    wb.as_slice().to_vec()
}

/// A handshake message with a single 32-byte octet string under tag 1.
fn opaque_message() -> Vec<u8> {
    let mut buf = vec![0; 64];
    let mut wb = WriteBuf::new(&mut buf);
    let mut tw = TLVWriter::new(&mut wb);
    tw.start_struct(TagType::Anonymous).unwrap();
    tw.str8(TagType::Context(1), &[0xa5; 32]).unwrap();
    tw.end_container().unwrap();

    wb.as_slice().to_vec()
}

/// The secure channel opcode and payload of an unencrypted packet.
fn unsecured_payload(packet: &[u8]) -> (u8, Vec<u8>) {
    let mut packet = packet.to_vec();
    let mut pb = ParseBuf::new(&mut packet);

    let mut plain = PlainHdr::new();
    plain.decode(&mut pb).unwrap();
    assert!(!plain.is_encrypted());

    let mut proto = ProtoHdr::new();
    proto.decrypt_and_decode(&mut pb, None, None).unwrap();

    (proto.proto_opcode, pb.as_slice().to_vec())
}

/// Like `shuttle`, but flips a bit near the end of the first controller
/// message with the given opcode.
fn shuttle_corrupting(
    device: &mut Stack,
    dev_net: &Outbox,
    ctrl: &mut ExchangeMgr,
    ctrl_net: &Outbox,
    target: OpCode,
) {
    let mut corrupted = false;

    for _ in 0..200 {
        device.poll().unwrap();
        ctrl.process_timers().unwrap();

        if !corrupted {
            for (mut packet, addr) in ctrl_net.take() {
                if unsecured_payload(&packet).0 == target as u8 {
                    let at = packet.len() - 2;
                    packet[at] ^= 0x01;
                    corrupted = true;
                }
                ctrl_net.send_to(&packet, addr).unwrap();
            }
        }

        let moved = deliver_to_device(device, ctrl_net) + deliver_to_controller(ctrl, dev_net);
        if moved == 0 && dev_net.is_empty() && ctrl_net.is_empty() {
            assert!(corrupted, "{:?} was never sent", target);
            return;
        }
    }

    panic!("The nodes never stopped talking");
}

/// Runs a fresh PASE with the right passcode and checks it succeeds.
fn pase_still_works(device: &mut Stack, dev_net: &Outbox) {
    let log = PairingLog::default();
    let pase = PaseInitiator::new(&log);
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);

    pase.start(&mut ctrl, device_addr(), PASSCODE).unwrap();
    shuttle(device, dev_net, &mut ctrl, &ctrl_net);

    assert!(log.errors.borrow().is_empty());
    assert_eq!(log.sessions.borrow().len(), 1);
    assert_eq!(secure_sessions(device.exchanges()), 1);
}

/// Runs a fresh CASE from the controller's fabric and checks it succeeds.
fn case_still_works(device: &mut Stack, dev_net: &Outbox, chain: &Chain) {
    let fabrics = RefCell::new(FabricMgr::new());
    let ctrl_fab = fabrics
        .borrow_mut()
        .add(chain.fabric(FABRIC_ID, CONTROLLER_NODE))
        .unwrap();

    let log = PairingLog::default();
    let case = CaseInitiator::new(&fabrics, &log);
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);

    case.start(&mut ctrl, device_addr(), ctrl_fab, DEVICE_NODE).unwrap();
    shuttle(device, dev_net, &mut ctrl, &ctrl_net);

    assert!(log.errors.borrow().is_empty());
    assert_eq!(log.sessions.borrow().len(), 1);
    assert_eq!(secure_sessions(device.exchanges()), 1);
}

#[test]
fn pase_establishes_session() {
    init_env_logger();

    let kv = RefCell::new(MemKvStore::new());
    let node = TestNode::new();
    let dev_net = Outbox::new();
    let matter = Matter::new(device_config(Some(PASSCODE)), &kv, now, sys_rand);
    let services = Services::new(&matter, &node);
    let mut device = Stack::new(&matter, &services, &dev_net).unwrap();
    device.init().unwrap();
    assert!(services.pase.is_enabled());

    let log = PairingLog::default();
    let pase = PaseInitiator::new(&log);
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);

    pase.start(&mut ctrl, device_addr(), PASSCODE).unwrap();
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    assert!(log.errors.borrow().is_empty());
    assert_eq!(log.sessions.borrow().len(), 1);

    let session = ctrl.sessions().get(log.last_session()).unwrap();
    assert_eq!(session.mode(), SessionMode::Pase { fab_idx: 0 });
    assert!(session.is_encrypted());

    assert_eq!(secure_sessions(&ctrl), 1);
    assert_eq!(secure_sessions(device.exchanges()), 1);
    assert_eq!(matter.last_pairing_error(), None);
    assert!(!services.pase.is_busy());
    assert!(!pase.is_busy());
}

#[test]
fn pase_wrong_passcode_installs_nothing() {
    init_env_logger();

    let kv = RefCell::new(MemKvStore::new());
    let node = TestNode::new();
    let dev_net = Outbox::new();
    let matter = Matter::new(device_config(Some(PASSCODE)), &kv, now, sys_rand);
    let services = Services::new(&matter, &node);
    let mut device = Stack::new(&matter, &services, &dev_net).unwrap();
    device.init().unwrap();

    let log = PairingLog::default();
    let pase = PaseInitiator::new(&log);
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);

    pase.start(&mut ctrl, device_addr(), PASSCODE + 1).unwrap();
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    assert!(log.sessions.borrow().is_empty());
    assert!(matches!(
        log.errors.borrow().as_slice(),
        [PairingError::Failed(_)]
    ));
    assert!(matches!(
        matter.last_pairing_error(),
        Some(PairingError::Rejected { .. })
    ));

    assert_eq!(secure_sessions(&ctrl), 0);
    assert_eq!(secure_sessions(device.exchanges()), 0);

    // The window stays open for another attempt
    log.errors.borrow_mut().clear();
    pase.start(&mut ctrl, device_addr(), PASSCODE).unwrap();
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    assert!(log.errors.borrow().is_empty());
    assert_eq!(secure_sessions(&ctrl), 1);
    assert_eq!(secure_sessions(device.exchanges()), 1);
}

#[test]
fn pase_initiator_times_out() {
    init_env_logger();

    let log = PairingLog::default();
    let pase = PaseInitiator::new(&log);
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);

    pase.start(&mut ctrl, device_addr(), PASSCODE).unwrap();
    run_silent(&mut ctrl, &ctrl_net, &log);

    assert_eq!(log.errors.borrow().as_slice(), &[PairingError::Timeout]);
    assert!(log.sessions.borrow().is_empty());
    assert!(!pase.is_busy());
    assert_eq!(ctrl.exchange_count(), 0);
    assert_eq!(secure_sessions(&ctrl), 0);
}

#[test]
fn pase_responder_times_out() {
    init_env_logger();

    let kv = RefCell::new(MemKvStore::new());
    let node = TestNode::new();
    let dev_net = Outbox::new();
    let matter = Matter::new(device_config(Some(PASSCODE)), &kv, now, sys_rand);
    let services = Services::new(&matter, &node);
    let mut device = Stack::new(&matter, &services, &dev_net).unwrap();
    device.init().unwrap();

    let log = PairingLog::default();
    let pase = PaseInitiator::new(&log);
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);

    // The device answers the first message, then the controller vanishes
    pase.start(&mut ctrl, device_addr(), PASSCODE).unwrap();
    deliver_to_device(&mut device, &ctrl_net);
    assert!(services.pase.is_busy());

    for _ in 0..100 {
        dev_net.take();
        if matter.last_pairing_error().is_some() {
            break;
        }

        let at = device.next_wakeup().expect("nothing scheduled");
        set_now(at.max(now()));
        device.poll().unwrap();
    }

    assert_eq!(matter.last_pairing_error(), Some(PairingError::Timeout));
    assert!(!services.pase.is_busy());
    assert_eq!(secure_sessions(device.exchanges()), 0);
}

#[test]
fn pase_rejected_without_commissioning_window() {
    init_env_logger();

    let kv = RefCell::new(MemKvStore::new());
    let node = TestNode::new();
    let dev_net = Outbox::new();
    let matter = Matter::new(device_config(None), &kv, now, sys_rand);
    let services = Services::new(&matter, &node);
    let mut device = Stack::new(&matter, &services, &dev_net).unwrap();
    device.init().unwrap();
    assert!(!services.pase.is_enabled());

    let log = PairingLog::default();
    let pase = PaseInitiator::new(&log);
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);

    pase.start(&mut ctrl, device_addr(), PASSCODE).unwrap();
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    assert!(matches!(
        log.errors.borrow().as_slice(),
        [PairingError::Rejected { .. }]
    ));
    assert_eq!(secure_sessions(&ctrl), 0);
    assert_eq!(secure_sessions(device.exchanges()), 0);
}

#[test]
fn case_establishes_operational_session() {
    init_env_logger();

    let chain = Chain::new(1);

    let kv = RefCell::new(MemKvStore::new());
    let node = TestNode::new();
    let dev_net = Outbox::new();
    let matter = Matter::new(device_config(None), &kv, now, sys_rand);
    let services = Services::new(&matter, &node);
    let mut device = Stack::new(&matter, &services, &dev_net).unwrap();
    device.init().unwrap();
    let dev_fab = device.add_fabric(chain.fabric(FABRIC_ID, DEVICE_NODE)).unwrap();

    let fabrics = RefCell::new(FabricMgr::new());
    let ctrl_fab = fabrics
        .borrow_mut()
        .add(chain.fabric(FABRIC_ID, CONTROLLER_NODE))
        .unwrap();

    let log = PairingLog::default();
    let case = CaseInitiator::new(&fabrics, &log);
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);

    case.start(&mut ctrl, device_addr(), ctrl_fab, DEVICE_NODE).unwrap();
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    assert!(log.errors.borrow().is_empty());
    let session = ctrl.sessions().get(log.last_session()).unwrap();
    assert_eq!(session.mode(), SessionMode::Case { fab_idx: ctrl_fab });
    assert_eq!(session.get_peer_nodeid(), Some(DEVICE_NODE));
    assert_eq!(session.get_local_nodeid(), CONTROLLER_NODE);

    let exchanges = device.exchanges();
    let (_, session) = exchanges
        .sessions()
        .iter()
        .find(|(_, s)| s.mode().is_secure())
        .expect("no session on the device");
    assert_eq!(session.mode(), SessionMode::Case { fab_idx: dev_fab });
    assert_eq!(session.get_peer_nodeid(), Some(CONTROLLER_NODE));

    assert_eq!(matter.last_pairing_error(), None);
    assert_eq!(services.case.handshakes_in_progress(), 0);
}

#[test]
fn case_with_foreign_root_installs_nothing() {
    init_env_logger();

    let kv = RefCell::new(MemKvStore::new());
    let node = TestNode::new();
    let dev_net = Outbox::new();
    let matter = Matter::new(device_config(None), &kv, now, sys_rand);
    let services = Services::new(&matter, &node);
    let mut device = Stack::new(&matter, &services, &dev_net).unwrap();
    device.init().unwrap();
    device
        .add_fabric(Chain::new(1).fabric(FABRIC_ID, DEVICE_NODE))
        .unwrap();

    // Same fabric and node ids, but another root of trust
    let fabrics = RefCell::new(FabricMgr::new());
    let ctrl_fab = fabrics
        .borrow_mut()
        .add(Chain::new(2).fabric(FABRIC_ID, CONTROLLER_NODE))
        .unwrap();

    let log = PairingLog::default();
    let case = CaseInitiator::new(&fabrics, &log);
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);

    case.start(&mut ctrl, device_addr(), ctrl_fab, DEVICE_NODE).unwrap();
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    assert!(log.sessions.borrow().is_empty());
    assert!(matches!(
        log.errors.borrow().as_slice(),
        [PairingError::Rejected { .. }]
    ));
    assert!(!case.is_busy());
    assert_eq!(
        matter.last_pairing_error(),
        Some(PairingError::Failed(ErrorCode::NoFabric))
    );

    assert_eq!(secure_sessions(&ctrl), 0);
    assert_eq!(secure_sessions(device.exchanges()), 0);
    assert_eq!(services.case.handshakes_in_progress(), 0);
}

#[test]
fn case_timeout_is_reported_as_timeout() {
    init_env_logger();

    let fabrics = RefCell::new(FabricMgr::new());
    let ctrl_fab = fabrics
        .borrow_mut()
        .add(Chain::new(1).fabric(FABRIC_ID, CONTROLLER_NODE))
        .unwrap();

    let log = PairingLog::default();
    let case = CaseInitiator::new(&fabrics, &log);
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);

    case.start(&mut ctrl, device_addr(), ctrl_fab, DEVICE_NODE).unwrap();
    advance(Duration::from_millis(1));
    run_silent(&mut ctrl, &ctrl_net, &log);

    assert_eq!(log.errors.borrow().as_slice(), &[PairingError::Timeout]);
    assert!(!case.is_busy());
    assert_eq!(secure_sessions(&ctrl), 0);
}

#[test]
fn pase_repeated_parameters_abort_only_that_handshake() {
    init_env_logger();

    let kv = RefCell::new(MemKvStore::new());
    let node = TestNode::new();
    let dev_net = Outbox::new();
    let matter = Matter::new(device_config(Some(PASSCODE)), &kv, now, sys_rand);
    let services = Services::new(&matter, &node);
    let mut device = Stack::new(&matter, &services, &dev_net).unwrap();
    device.init().unwrap();

    let script = Scripted::default();
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);
    let exchange = script.open(&mut ctrl);

    script.send(&mut ctrl, exchange, OpCode::PBKDFParamRequest, &pbkdf_param_request());
    deliver_to_device(&mut device, &ctrl_net);
    deliver_to_controller(&mut ctrl, &dev_net);
    assert_eq!(script.opcodes(), vec![OpCode::PBKDFParamResponse as u8]);
    assert!(services.pase.is_busy());

    script.send(&mut ctrl, exchange, OpCode::PBKDFParamRequest, &pbkdf_param_request());
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    assert_eq!(script.opcodes().last(), Some(&(OpCode::StatusReport as u8)));
    assert_eq!(
        matter.last_pairing_error(),
        Some(PairingError::Failed(ErrorCode::InvalidState))
    );
    assert!(!services.pase.is_busy());
    assert_eq!(secure_sessions(device.exchanges()), 0);

    pase_still_works(&mut device, &dev_net);
}

#[test]
fn pase_pake3_before_pake1_installs_nothing() {
    init_env_logger();

    let kv = RefCell::new(MemKvStore::new());
    let node = TestNode::new();
    let dev_net = Outbox::new();
    let matter = Matter::new(device_config(Some(PASSCODE)), &kv, now, sys_rand);
    let services = Services::new(&matter, &node);
    let mut device = Stack::new(&matter, &services, &dev_net).unwrap();
    device.init().unwrap();

    let script = Scripted::default();
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);
    let exchange = script.open(&mut ctrl);

    script.send(&mut ctrl, exchange, OpCode::PBKDFParamRequest, &pbkdf_param_request());
    deliver_to_device(&mut device, &ctrl_net);
    deliver_to_controller(&mut ctrl, &dev_net);

    script.send(&mut ctrl, exchange, OpCode::PASEPake3, &opaque_message());
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    assert_eq!(script.opcodes().last(), Some(&(OpCode::StatusReport as u8)));
    assert!(!services.pase.is_busy());
    assert_eq!(secure_sessions(device.exchanges()), 0);

    pase_still_works(&mut device, &dev_net);
}

#[test]
fn pase_corrupted_pake3_installs_nothing() {
    init_env_logger();

    let kv = RefCell::new(MemKvStore::new());
    let node = TestNode::new();
    let dev_net = Outbox::new();
    let matter = Matter::new(device_config(Some(PASSCODE)), &kv, now, sys_rand);
    let services = Services::new(&matter, &node);
    let mut device = Stack::new(&matter, &services, &dev_net).unwrap();
    device.init().unwrap();

    let log = PairingLog::default();
    let pase = PaseInitiator::new(&log);
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);

    pase.start(&mut ctrl, device_addr(), PASSCODE).unwrap();
    shuttle_corrupting(&mut device, &dev_net, &mut ctrl, &ctrl_net, OpCode::PASEPake3);

    assert!(log.sessions.borrow().is_empty());
    assert_eq!(log.errors.borrow().len(), 1);
    assert_eq!(secure_sessions(&ctrl), 0);
    assert_eq!(secure_sessions(device.exchanges()), 0);
    assert!(!services.pase.is_busy());

    pase_still_works(&mut device, &dev_net);
}

#[test]
fn case_sigma3_without_sigma1_installs_nothing() {
    init_env_logger();

    let chain = Chain::new(1);

    let kv = RefCell::new(MemKvStore::new());
    let node = TestNode::new();
    let dev_net = Outbox::new();
    let matter = Matter::new(device_config(None), &kv, now, sys_rand);
    let services = Services::new(&matter, &node);
    let mut device = Stack::new(&matter, &services, &dev_net).unwrap();
    device.init().unwrap();
    device.add_fabric(chain.fabric(FABRIC_ID, DEVICE_NODE)).unwrap();

    let script = Scripted::default();
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);
    let exchange = script.open(&mut ctrl);

    script.send(&mut ctrl, exchange, OpCode::CASESigma3, &opaque_message());
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    // Nothing handles a Sigma3 that opens an exchange; it is only acked
    assert!(script.opcodes().is_empty());
    assert_eq!(services.case.handshakes_in_progress(), 0);
    assert_eq!(secure_sessions(device.exchanges()), 0);

    case_still_works(&mut device, &dev_net, &chain);
}

#[test]
fn case_repeated_sigma1_aborts_only_that_handshake() {
    init_env_logger();

    let chain = Chain::new(1);

    let kv = RefCell::new(MemKvStore::new());
    let node = TestNode::new();
    let dev_net = Outbox::new();
    let matter = Matter::new(device_config(None), &kv, now, sys_rand);
    let services = Services::new(&matter, &node);
    let mut device = Stack::new(&matter, &services, &dev_net).unwrap();
    device.init().unwrap();
    device.add_fabric(chain.fabric(FABRIC_ID, DEVICE_NODE)).unwrap();

    // A genuine Sigma1, taken off the wire of an initiator nobody answers
    let fabrics = RefCell::new(FabricMgr::new());
    let ctrl_fab = fabrics
        .borrow_mut()
        .add(chain.fabric(FABRIC_ID, CONTROLLER_NODE))
        .unwrap();
    let spare_log = PairingLog::default();
    let spare_case = CaseInitiator::new(&fabrics, &spare_log);
    let spare_net = Outbox::new();
    let mut spare = controller_mgr(&spare_net);
    spare_case
        .start(&mut spare, device_addr(), ctrl_fab, DEVICE_NODE)
        .unwrap();
    let (opcode, sigma1) = unsecured_payload(&spare_net.take()[0].0);
    assert_eq!(opcode, OpCode::CASESigma1 as u8);

    let script = Scripted::default();
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);
    let exchange = script.open(&mut ctrl);

    script.send(&mut ctrl, exchange, OpCode::CASESigma1, &sigma1);
    deliver_to_device(&mut device, &ctrl_net);
    deliver_to_controller(&mut ctrl, &dev_net);
    assert_eq!(script.opcodes(), vec![OpCode::CASESigma2 as u8]);
    assert_eq!(services.case.handshakes_in_progress(), 1);

    script.send(&mut ctrl, exchange, OpCode::CASESigma1, &sigma1);
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    assert_eq!(script.opcodes().last(), Some(&(OpCode::StatusReport as u8)));
    assert_eq!(
        matter.last_pairing_error(),
        Some(PairingError::Failed(ErrorCode::InvalidState))
    );
    assert_eq!(services.case.handshakes_in_progress(), 0);
    assert_eq!(secure_sessions(device.exchanges()), 0);

    case_still_works(&mut device, &dev_net, &chain);
}

#[test]
fn case_corrupted_sigma3_installs_nothing() {
    init_env_logger();

    let chain = Chain::new(1);

    let kv = RefCell::new(MemKvStore::new());
    let node = TestNode::new();
    let dev_net = Outbox::new();
    let matter = Matter::new(device_config(None), &kv, now, sys_rand);
    let services = Services::new(&matter, &node);
    let mut device = Stack::new(&matter, &services, &dev_net).unwrap();
    device.init().unwrap();
    device.add_fabric(chain.fabric(FABRIC_ID, DEVICE_NODE)).unwrap();

    let fabrics = RefCell::new(FabricMgr::new());
    let ctrl_fab = fabrics
        .borrow_mut()
        .add(chain.fabric(FABRIC_ID, CONTROLLER_NODE))
        .unwrap();

    let log = PairingLog::default();
    let case = CaseInitiator::new(&fabrics, &log);
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);

    case.start(&mut ctrl, device_addr(), ctrl_fab, DEVICE_NODE).unwrap();
    shuttle_corrupting(&mut device, &dev_net, &mut ctrl, &ctrl_net, OpCode::CASESigma3);

    assert!(log.sessions.borrow().is_empty());
    assert_eq!(log.errors.borrow().len(), 1);
    assert!(!case.is_busy());
    assert_eq!(secure_sessions(&ctrl), 0);
    assert_eq!(secure_sessions(device.exchanges()), 0);
    assert_eq!(services.case.handshakes_in_progress(), 0);

    case_still_works(&mut device, &dev_net, &chain);
}
