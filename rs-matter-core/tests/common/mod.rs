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

//! Shared fixtures for the integration tests: a controller and a device
//! talking through in-memory outboxes, on a clock the tests move by hand.

#![allow(dead_code)]

use core::cell::{Cell, RefCell};
use core::time::Duration;
use std::net::SocketAddr;

use rs_matter_core::crypto::{KeyPair, EC_POINT_LEN_BYTES};
use rs_matter_core::dm::{
    AttrDetails, AttrId, AttrValueDecoder, AttrValueEncoder, Attribute, ClusterId, CmdDetails,
    CmdId, Cluster, Command, CommandHandler, EndptId, Endpoint, ListOperation, Provider, Quality,
};
use rs_matter_core::error::{Error, ErrorCode};
use rs_matter_core::fabric::Fabric;
use rs_matter_core::im::{
    parse_status_response, write_status_response, AttrPath, CmdPath, IMStatusCode, OpCode,
};
use rs_matter_core::sc::cert::{CertBuf, CertBuilder, DistNames, DnAttr};
use rs_matter_core::sc::pairing::{PairingDelegate, PairingError};
use rs_matter_core::tlv::{get_root_node_struct, TLVElement, TLVWriter, TagType, ToTLV};
use rs_matter_core::transport::exchange::{
    ExchangeCtx, ExchangeDelegate, ExchangeHandle, ExchangeMgr, RxMessage,
};
use rs_matter_core::transport::mrp::RmpConfig;
use rs_matter_core::transport::network::{Address, NetworkSend};
use rs_matter_core::transport::session::SessionHandle;
use rs_matter_core::utils::rand::sys_rand;
use rs_matter_core::utils::storage::WriteBuf;
use rs_matter_core::{Stack, StackConfig};

pub const PASSCODE: u32 = 20202021;

pub const FABRIC_ID: u64 = 0x2906_c908_d115_d362;
pub const CONTROLLER_NODE: u64 = 0x1;
pub const DEVICE_NODE: u64 = 0x2;
const IPK: [u8; 16] = [0x4a; 16];

pub fn init_env_logger() {
    let _ = env_logger::try_init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );
}

thread_local! {
    static NOW: Cell<Duration> = const { Cell::new(Duration::from_secs(1_000)) };
}

/// The test clock, shared by both nodes of a test.
pub fn now() -> Duration {
    NOW.with(|now| now.get())
}

pub fn set_now(at: Duration) {
    NOW.with(|now| now.set(at));
}

pub fn advance(by: Duration) {
    set_now(now() + by);
}

pub fn device_addr() -> Address {
    Address::Udp(SocketAddr::from(([127, 0, 0, 1], 5540)))
}

pub fn controller_addr() -> Address {
    Address::Udp(SocketAddr::from(([127, 0, 0, 1], 5541)))
}

pub fn device_config(passcode: Option<u32>) -> StackConfig {
    StackConfig {
        passcode,
        discriminator: 3840,
        ..StackConfig::new()
    }
}

/// Collects what a node sends instead of putting it on the wire.
#[derive(Default)]
pub struct Outbox(RefCell<Vec<(Vec<u8>, Address)>>);

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn take(&self) -> Vec<(Vec<u8>, Address)> {
        core::mem::take(&mut *self.0.borrow_mut())
    }

    pub fn is_empty(&self) -> bool {
        self.0.borrow().is_empty()
    }
}

impl NetworkSend for Outbox {
    fn send_to(&self, data: &[u8], addr: Address) -> Result<(), Error> {
        self.0.borrow_mut().push((data.to_vec(), addr));
        Ok(())
    }
}

pub fn controller_mgr(net: &Outbox) -> ExchangeMgr<'_> {
    ExchangeMgr::new(net, RmpConfig::new(), now, sys_rand)
}

pub fn deliver_to_device(device: &mut Stack, ctrl_net: &Outbox) -> usize {
    let packets = ctrl_net.take();
    for (mut packet, addr) in packets.iter().cloned() {
        assert_eq!(addr, device_addr());
        if let Err(e) = device.handle_rx(&mut packet, controller_addr()) {
            log::info!("Device dropped a packet: {:?}", e);
        }
    }

    packets.len()
}

pub fn deliver_to_controller(ctrl: &mut ExchangeMgr, dev_net: &Outbox) -> usize {
    let packets = dev_net.take();
    for (mut packet, addr) in packets.iter().cloned() {
        assert_eq!(addr, controller_addr());
        if let Err(e) = ctrl.handle_rx(&mut packet, device_addr()) {
            log::info!("Controller dropped a packet: {:?}", e);
        }
    }

    packets.len()
}

/// Moves packets both ways, running timers that are due, until both sides
/// fall silent.
pub fn shuttle(device: &mut Stack, dev_net: &Outbox, ctrl: &mut ExchangeMgr, ctrl_net: &Outbox) {
    for _ in 0..200 {
        device.poll().unwrap();
        ctrl.process_timers().unwrap();

        let moved = deliver_to_device(device, ctrl_net) + deliver_to_controller(ctrl, dev_net);
        if moved == 0 && dev_net.is_empty() && ctrl_net.is_empty() {
            return;
        }
    }

    panic!("The nodes never stopped talking");
}

pub fn secure_sessions(mgr: &ExchangeMgr) -> usize {
    mgr.sessions()
        .iter()
        .filter(|(_, s)| s.mode().is_secure())
        .count()
}

/// Records the outcome of handshakes.
#[derive(Default)]
pub struct PairingLog {
    pub sessions: RefCell<Vec<SessionHandle>>,
    pub errors: RefCell<Vec<PairingError>>,
}

impl PairingLog {
    pub fn last_session(&self) -> SessionHandle {
        *self.sessions.borrow().last().expect("no session established")
    }
}

impl PairingDelegate for PairingLog {
    fn on_pairing_complete(&self, session: SessionHandle) {
        self.sessions.borrow_mut().push(session);
    }

    fn on_pairing_error(&self, error: PairingError) {
        self.errors.borrow_mut().push(error);
    }
}

/// A root CA that issues operational certificates on one fabric.
pub struct Chain {
    rca_id: u64,
    root_key: KeyPair,
    root: CertBuf,
}

impl Chain {
    pub fn new(rca_id: u64) -> Self {
        let root_key = KeyPair::new(sys_rand);
        let mut pubkey = [0; EC_POINT_LEN_BYTES];
        root_key.get_public_key(&mut pubkey).unwrap();

        let dn = DistNames::new(&[DnAttr::RcaId(rca_id)]).unwrap();
        let root = CertBuilder {
            serial: &[1],
            issuer: dn.clone(),
            subject: dn,
            not_before: 0,
            not_after: 0,
            pubkey: &pubkey,
            is_ca: true,
        }
        .sign(&root_key)
        .unwrap();

        Self {
            rca_id,
            root_key,
            root,
        }
    }

    pub fn fabric(&self, fabric_id: u64, node_id: u64) -> Fabric {
        let key = KeyPair::new(sys_rand);
        let mut pubkey = [0; EC_POINT_LEN_BYTES];
        key.get_public_key(&mut pubkey).unwrap();

        let noc = CertBuilder {
            serial: &node_id.to_be_bytes(),
            issuer: DistNames::new(&[DnAttr::RcaId(self.rca_id)]).unwrap(),
            subject: DistNames::new(&[DnAttr::NodeId(node_id), DnAttr::FabricId(fabric_id)])
                .unwrap(),
            not_before: 0,
            not_after: 0,
            pubkey: &pubkey,
            is_ca: false,
        }
        .sign(&self.root_key)
        .unwrap();

        Fabric::new(key, &self.root, None, &noc, &IPK, 0xfff1, "test").unwrap()
    }
}

pub const ON_OFF: ClusterId = 0x0006;
pub const LEVEL_CONTROL: ClusterId = 0x0008;

pub const ATTR_ON_OFF: AttrId = 0x0000;
pub const ATTR_ON_TIME: AttrId = 0x4001;
pub const ATTR_OFF_WAIT_TIME: AttrId = 0x4002;
/// Vendor specific list attribute
pub const ATTR_TAGS: AttrId = 0x0010;
pub const ATTR_CURRENT_LEVEL: AttrId = 0x0000;

pub const CMD_OFF: CmdId = 0x00;
pub const CMD_ON: CmdId = 0x01;
pub const CMD_TOGGLE: CmdId = 0x02;
pub const CMD_OFF_WITH_EFFECT: CmdId = 0x40;
/// Vendor specific: answers with the current level plus the `offset` field
pub const CMD_QUERY_LEVEL: CmdId = 0xF0;
pub const CMD_QUERY_LEVEL_RESPONSE: CmdId = 0xF1;

const ON_OFF_ATTRS: &[Attribute] = &[
    Attribute::new(ATTR_ON_OFF, Quality::empty()),
    Attribute::new(ATTR_TAGS, Quality::WRITABLE.union(Quality::LIST)),
    Attribute::new(ATTR_ON_TIME, Quality::WRITABLE),
    Attribute::new(ATTR_OFF_WAIT_TIME, Quality::WRITABLE.union(Quality::TIMED_WRITE)),
];

const ON_OFF_CMDS: &[Command] = &[
    Command::new(CMD_OFF, None),
    Command::new(CMD_ON, None),
    Command::new(CMD_TOGGLE, None),
    Command::new(CMD_OFF_WITH_EFFECT, None).timed(),
];

const LEVEL_ATTRS: &[Attribute] = &[Attribute::new(ATTR_CURRENT_LEVEL, Quality::empty())];
const LEVEL_CMDS: &[Command] = &[Command::new(CMD_QUERY_LEVEL, Some(CMD_QUERY_LEVEL_RESPONSE))];

const ROOT_CLUSTERS: &[Cluster<'static>] = &[Cluster::new(ON_OFF, 5, 0, ON_OFF_ATTRS, ON_OFF_CMDS)];
const LIGHT_CLUSTERS: &[Cluster<'static>] = &[
    Cluster::new(ON_OFF, 5, 0, ON_OFF_ATTRS, ON_OFF_CMDS),
    Cluster::new(LEVEL_CONTROL, 5, 0, LEVEL_ATTRS, LEVEL_CMDS),
];
const ENDPOINTS: &[Endpoint<'static>] =
    &[Endpoint::new(0, ROOT_CLUSTERS), Endpoint::new(1, LIGHT_CLUSTERS)];

/// Attributes reported per endpoint on a wildcard read, globals included.
pub const WILDCARD_ATTR_COUNT: usize = (ON_OFF_ATTRS.len() + 6) * 2 + LEVEL_ATTRS.len() + 6;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Light {
    pub on: bool,
    pub on_time: u16,
    pub off_wait_time: u16,
    pub tags: Vec<u32>,
    pub level: u8,
    pub version: u32,
}

/// Two endpoints with an on/off light each; the second one is dimmable.
pub struct TestNode {
    lights: RefCell<[Light; 2]>,
}

impl TestNode {
    pub fn new() -> Self {
        let light = |level, version| Light {
            level,
            version,
            ..Default::default()
        };

        Self {
            lights: RefCell::new([light(0, 1), light(128, 100)]),
        }
    }

    pub fn light(&self, endpoint: EndptId) -> Light {
        self.lights.borrow()[endpoint as usize].clone()
    }

    /// A change made locally, as by a physical switch.
    pub fn set_on(&self, endpoint: EndptId, on: bool) {
        let mut lights = self.lights.borrow_mut();
        let light = &mut lights[endpoint as usize];
        light.on = on;
        light.version += 1;
    }
}

impl Provider for TestNode {
    fn endpoints(&self) -> &[Endpoint<'_>] {
        ENDPOINTS
    }

    fn data_version(&self, endpoint: EndptId, _cluster: ClusterId) -> u32 {
        self.lights
            .borrow()
            .get(endpoint as usize)
            .map(|light| light.version)
            .unwrap_or(0)
    }

    fn read_attribute(
        &self,
        attr: &AttrDetails,
        encoder: AttrValueEncoder<'_, '_, '_>,
    ) -> Result<(), Error> {
        let lights = self.lights.borrow();
        let light = lights
            .get(attr.endpoint_id as usize)
            .ok_or(ErrorCode::EndpointNotFound)?;

        match (attr.cluster_id, attr.attr_id) {
            (ON_OFF, ATTR_ON_OFF) => encoder.encode(&light.on),
            (ON_OFF, ATTR_ON_TIME) => encoder.encode(&light.on_time),
            (ON_OFF, ATTR_OFF_WAIT_TIME) => encoder.encode(&light.off_wait_time),
            (ON_OFF, ATTR_TAGS) => encoder.encode_list(|le| {
                for tag in &light.tags {
                    le.encode(tag)?;
                }
                Ok(())
            }),
            (LEVEL_CONTROL, ATTR_CURRENT_LEVEL) => encoder.encode(&light.level),
            _ => Err(ErrorCode::AttributeNotFound.into()),
        }
    }

    fn write_attribute(
        &self,
        attr: &AttrDetails,
        decoder: &AttrValueDecoder<'_>,
    ) -> Result<(), Error> {
        let mut lights = self.lights.borrow_mut();
        let light = lights
            .get_mut(attr.endpoint_id as usize)
            .ok_or(ErrorCode::EndpointNotFound)?;

        match (attr.cluster_id, attr.attr_id) {
            (ON_OFF, ATTR_ON_TIME) => light.on_time = decoder.decode()?,
            (ON_OFF, ATTR_OFF_WAIT_TIME) => light.off_wait_time = decoder.decode()?,
            (ON_OFF, ATTR_TAGS) => match decoder.op() {
                ListOperation::Replace => {
                    light.tags = decoder
                        .element()
                        .enter()?
                        .map(|e| e.and_then(|e| e.u32()))
                        .collect::<Result<_, _>>()?;
                }
                ListOperation::Append => light.tags.push(decoder.decode()?),
            },
            _ => Err(ErrorCode::UnsupportedWrite)?,
        }

        light.version += 1;

        Ok(())
    }

    fn invoke(
        &self,
        cmd: &CmdDetails,
        fields: &TLVElement<'_>,
        handler: &mut CommandHandler<'_, '_, '_>,
    ) -> Option<IMStatusCode> {
        let mut lights = self.lights.borrow_mut();
        let light = &mut lights[cmd.endpoint_id as usize];

        if cmd.cluster_id == LEVEL_CONTROL {
            if cmd.cmd_id != CMD_QUERY_LEVEL {
                return Some(IMStatusCode::UnsupportedCommand);
            }

            let level = light.level;
            let answered = fields.ctx::<u8>(0).and_then(|offset| {
                handler.add_response(CMD_QUERY_LEVEL_RESPONSE, |tw, tag| {
                    tw.start_struct(tag)?;
                    tw.u8(TagType::Context(0), level.saturating_add(offset))?;
                    tw.end_container()
                })
            });

            return answered.err().map(|e| e.code().into());
        }

        light.on = match cmd.cmd_id {
            CMD_OFF | CMD_OFF_WITH_EFFECT => false,
            CMD_ON => true,
            CMD_TOGGLE => !light.on,
            _ => return Some(IMStatusCode::UnsupportedCommand),
        };
        light.version += 1;

        Some(IMStatusCode::Success)
    }
}

/// The controller's side of the interaction model: sends requests and
/// keeps every message the device sends back.
///
/// Reports are confirmed with a StatusResponse unless they suppress it.
#[derive(Default)]
pub struct ImClient {
    messages: RefCell<Vec<(OpCode, Vec<u8>)>>,
    follow_up: RefCell<Option<(OpCode, Vec<u8>)>>,
    subscribing: Cell<bool>,
}

impl ImClient {
    pub fn request<'d>(
        &'d self,
        mgr: &mut ExchangeMgr<'d>,
        session: SessionHandle,
        opcode: OpCode,
        payload: &[u8],
    ) -> ExchangeHandle {
        if opcode == OpCode::SubscribeRequest {
            self.subscribing.set(true);
        }

        let exchange = mgr.new_exchange(session, self).unwrap();
        ExchangeCtx::new(mgr, exchange).send(opcode, payload).unwrap();

        exchange
    }

    /// Sends a TimedRequest, then the action on the same exchange once the
    /// device accepted it.
    pub fn timed_request<'d>(
        &'d self,
        mgr: &mut ExchangeMgr<'d>,
        session: SessionHandle,
        timeout_ms: u16,
        opcode: OpCode,
        payload: &[u8],
    ) -> ExchangeHandle {
        *self.follow_up.borrow_mut() = Some((opcode, payload.to_vec()));
        self.request(mgr, session, OpCode::TimedRequest, &timed_request(timeout_ms))
    }

    pub fn take(&self) -> Vec<(OpCode, Vec<u8>)> {
        core::mem::take(&mut *self.messages.borrow_mut())
    }

    /// The payloads of the received messages with the given opcode,
    /// consuming everything received so far.
    pub fn take_of(&self, opcode: OpCode) -> Vec<Vec<u8>> {
        self.take()
            .into_iter()
            .filter(|(op, _)| *op == opcode)
            .map(|(_, payload)| payload)
            .collect()
    }
}

impl ExchangeDelegate for ImClient {
    fn on_message_received(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let opcode: OpCode = rx.opcode()?;
        self.messages
            .borrow_mut()
            .push((opcode, rx.payload.to_vec()));

        match opcode {
            OpCode::ReportData => {
                let root = get_root_node_struct(rx.payload)?;
                if root.ctx::<Option<bool>>(4)?.unwrap_or(false) {
                    return ctx.close();
                }

                ctx.send(OpCode::StatusResponse, &status_response(IMStatusCode::Success))?;

                let more = root.ctx::<Option<bool>>(3)?.unwrap_or(false);
                if !more && !self.subscribing.get() {
                    ctx.close()?;
                }

                Ok(())
            }
            OpCode::StatusResponse => {
                let follow_up = self.follow_up.borrow_mut().take();
                match follow_up {
                    Some((opcode, payload))
                        if parse_status_response(rx.payload)? == IMStatusCode::Success =>
                    {
                        ctx.send(opcode, &payload)
                    }
                    _ => ctx.close(),
                }
            }
            OpCode::SubscribeResponse => {
                self.subscribing.set(false);
                ctx.close()
            }
            _ => ctx.close(),
        }
    }

    fn on_response_timeout(&self, _ctx: &mut ExchangeCtx) {}
}

fn encode<F>(f: F) -> Vec<u8>
where
    F: FnOnce(&mut TLVWriter) -> Result<(), Error>,
{
    let mut buf = vec![0; 1024];
    let mut wb = WriteBuf::new(&mut buf);
    let mut tw = TLVWriter::new(&mut wb);
    f(&mut tw).unwrap();

    wb.as_slice().to_vec()
}

pub fn attr_path(
    endpoint: Option<EndptId>,
    cluster: Option<ClusterId>,
    attr: Option<AttrId>,
) -> AttrPath {
    AttrPath {
        endpoint,
        cluster,
        attr,
        ..Default::default()
    }
}

pub fn status_response(status: IMStatusCode) -> Vec<u8> {
    let mut buf = vec![0; 16];
    let mut wb = WriteBuf::new(&mut buf);
    write_status_response(&mut wb, status).unwrap();

    wb.as_slice().to_vec()
}

pub fn timed_request(timeout_ms: u16) -> Vec<u8> {
    encode(|tw| {
        tw.start_struct(TagType::Anonymous)?;
        tw.u16(TagType::Context(0), timeout_ms)?;
        tw.end_container()
    })
}

pub fn read_request(paths: &[AttrPath]) -> Vec<u8> {
    encode(|tw| {
        tw.start_struct(TagType::Anonymous)?;
        tw.start_array(TagType::Context(0))?;
        for path in paths {
            path.to_tlv(tw, TagType::Anonymous)?;
        }
        tw.end_container()?;
        tw.bool(TagType::Context(3), true)?;
        tw.end_container()
    })
}

pub fn subscribe_request(min_interval: u16, max_interval: u16, paths: &[AttrPath]) -> Vec<u8> {
    encode(|tw| {
        tw.start_struct(TagType::Anonymous)?;
        tw.bool(TagType::Context(0), false)?;
        tw.u16(TagType::Context(1), min_interval)?;
        tw.u16(TagType::Context(2), max_interval)?;
        tw.start_array(TagType::Context(3))?;
        for path in paths {
            path.to_tlv(tw, TagType::Anonymous)?;
        }
        tw.end_container()?;
        tw.bool(TagType::Context(7), true)?;
        tw.end_container()
    })
}

/// One AttributeDataIB of a write.
pub struct AttrWrite<'a> {
    pub path: AttrPath,
    pub data_version: Option<u32>,
    pub value: &'a dyn ToTLV,
}

pub fn write_request(timed: bool, writes: &[AttrWrite]) -> Vec<u8> {
    encode(|tw| {
        tw.start_struct(TagType::Anonymous)?;
        tw.bool(TagType::Context(0), false)?;
        tw.bool(TagType::Context(1), timed)?;
        tw.start_array(TagType::Context(2))?;
        for write in writes {
            tw.start_struct(TagType::Anonymous)?;
            write.data_version.to_tlv(tw, TagType::Context(0))?;
            write.path.to_tlv(tw, TagType::Context(1))?;
            write.value.to_tlv(tw, TagType::Context(2))?;
            tw.end_container()?;
        }
        tw.end_container()?;
        tw.end_container()
    })
}

pub fn invoke_request(timed: bool, paths: &[CmdPath]) -> Vec<u8> {
    encode(|tw| {
        tw.start_struct(TagType::Anonymous)?;
        tw.bool(TagType::Context(0), false)?;
        tw.bool(TagType::Context(1), timed)?;
        tw.start_array(TagType::Context(2))?;
        for path in paths {
            tw.start_struct(TagType::Anonymous)?;
            path.to_tlv(tw, TagType::Context(0))?;
            tw.start_struct(TagType::Context(1))?;
            tw.end_container()?;
            tw.end_container()?;
        }
        tw.end_container()?;
        tw.end_container()
    })
}

/// One command carrying a single u8 field under tag 0.
pub fn invoke_request_u8(path: CmdPath, value: u8) -> Vec<u8> {
    encode(|tw| {
        tw.start_struct(TagType::Anonymous)?;
        tw.bool(TagType::Context(0), false)?;
        tw.bool(TagType::Context(1), false)?;
        tw.start_array(TagType::Context(2))?;
        tw.start_struct(TagType::Anonymous)?;
        path.to_tlv(tw, TagType::Context(0))?;
        tw.start_struct(TagType::Context(1))?;
        tw.u8(TagType::Context(0), value)?;
        tw.end_container()?;
        tw.end_container()?;
        tw.end_container()?;
        tw.end_container()
    })
}

/// A list of u32 values, for writing list attributes.
pub struct U32List<'a>(pub &'a [u32]);

impl ToTLV for U32List<'_> {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.start_array(tag)?;
        for v in self.0 {
            tw.u32(TagType::Anonymous, *v)?;
        }
        tw.end_container()
    }
}

pub type ConcretePath = (EndptId, ClusterId, AttrId);

/// One AttributeReportIB: data, or the status of a path that failed.
#[derive(Debug)]
pub struct Reported {
    pub path: ConcretePath,
    pub data: Option<Vec<u8>>,
    pub status: Option<IMStatusCode>,
}

impl Reported {
    pub fn value(&self) -> TLVElement<'_> {
        TLVElement::new(self.data.as_deref().expect("no data reported")).unwrap()
    }
}

fn concrete(path: &AttrPath) -> ConcretePath {
    (
        path.endpoint.unwrap_or(0xffff),
        path.cluster.unwrap_or(0xffff_ffff),
        path.attr.unwrap_or(0xffff_ffff),
    )
}

pub struct Report {
    pub subscription_id: Option<u32>,
    pub more: bool,
    pub suppress: bool,
    pub attrs: Vec<Reported>,
}

pub fn parse_report(payload: &[u8]) -> Report {
    let root = get_root_node_struct(payload).unwrap();

    let mut attrs = Vec::new();
    if let Some(reports) = root.ctx::<Option<TLVElement>>(1).unwrap() {
        for report in reports.enter().unwrap() {
            let report = report.unwrap();

            if let Some(status) = report.ctx::<Option<TLVElement>>(0).unwrap() {
                let path: AttrPath = status.ctx(0).unwrap();
                let code: IMStatusCode = status.find_ctx(1).unwrap().ctx(0).unwrap();
                attrs.push(Reported {
                    path: concrete(&path),
                    data: None,
                    status: Some(code),
                });
            } else {
                let data = report.find_ctx(1).unwrap();
                let path: AttrPath = data.ctx(1).unwrap();
                attrs.push(Reported {
                    path: concrete(&path),
                    data: Some(data.find_ctx(2).unwrap().raw().to_vec()),
                    status: None,
                });
            }
        }
    }

    Report {
        subscription_id: root.ctx(0).unwrap(),
        more: root.ctx::<Option<bool>>(3).unwrap().unwrap_or(false),
        suppress: root.ctx::<Option<bool>>(4).unwrap().unwrap_or(false),
        attrs,
    }
}

pub fn write_statuses(payload: &[u8]) -> Vec<(ConcretePath, IMStatusCode)> {
    let root = get_root_node_struct(payload).unwrap();

    root.find_ctx(0)
        .unwrap()
        .enter()
        .unwrap()
        .map(|status| {
            let status = status.unwrap();
            let path: AttrPath = status.ctx(0).unwrap();
            let code: IMStatusCode = status.find_ctx(1).unwrap().ctx(0).unwrap();
            (concrete(&path), code)
        })
        .collect()
}

pub fn invoke_statuses(payload: &[u8]) -> Vec<((EndptId, ClusterId, CmdId), IMStatusCode)> {
    let root = get_root_node_struct(payload).unwrap();

    root.find_ctx(1)
        .unwrap()
        .enter()
        .unwrap()
        .map(|resp| {
            let resp = resp.unwrap();
            let (ib, code) = match resp.ctx::<Option<TLVElement>>(1).unwrap() {
                Some(status) => {
                    let code = status.find_ctx(1).unwrap().ctx::<IMStatusCode>(0).unwrap();
                    (status, code)
                }
                None => (resp.find_ctx(0).unwrap(), IMStatusCode::Success),
            };
            let path: CmdPath = ib.ctx(0).unwrap();
            (
                (
                    path.endpoint.unwrap_or(0xffff),
                    path.cluster.unwrap_or(0xffff_ffff),
                    path.cmd.unwrap_or(0xffff_ffff),
                ),
                code,
            )
        })
        .collect()
}
