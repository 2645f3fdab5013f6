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

//! Interaction model exchanges between a controller and a device, over a
//! PASE or CASE session.

use core::cell::RefCell;
use core::time::Duration;
use std::collections::BTreeSet;

use rs_matter_core::fabric::FabricMgr;
use rs_matter_core::im::{
    parse_status_response, AttrPath, CmdPath, IMStatusCode, OpCode, PROTO_ID_INTERACTION_MODEL,
};
use rs_matter_core::persist::{keys, MemKvStore};
use rs_matter_core::sc::case::{CaseInitiator, CaseResponder};
use rs_matter_core::sc::pase::PaseInitiator;
use rs_matter_core::sc::{OpCode as ScOpCode, PROTO_ID_SECURE_CHANNEL};
use rs_matter_core::tlv::{get_root_node_struct, Nullable, ToTLV};
use rs_matter_core::transport::exchange::ExchangeMgr;
use rs_matter_core::transport::session::SessionHandle;
use rs_matter_core::utils::rand::sys_rand;
use rs_matter_core::{Matter, Services, Stack};

use common::*;

mod common;

fn commission<'d>(
    pase: &'d PaseInitiator<'_>,
    log: &PairingLog,
    device: &mut Stack,
    dev_net: &Outbox,
    ctrl: &mut ExchangeMgr<'d>,
    ctrl_net: &Outbox,
) -> SessionHandle {
    pase.start(ctrl, device_addr(), PASSCODE).unwrap();
    shuttle(device, dev_net, ctrl, ctrl_net);

    log.last_session()
}

fn take_reports(client: &ImClient) -> Vec<Report> {
    client
        .take_of(OpCode::ReportData)
        .iter()
        .map(|payload| parse_report(payload))
        .collect()
}

fn last_status(client: &ImClient) -> IMStatusCode {
    let statuses = client.take_of(OpCode::StatusResponse);
    parse_status_response(statuses.last().expect("no StatusResponse")).unwrap()
}

#[test]
fn wildcard_read_reports_every_attribute() {
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
    let client = ImClient::default();
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);
    let session = commission(&pase, &log, &mut device, &dev_net, &mut ctrl, &ctrl_net);

    client.request(
        &mut ctrl,
        session,
        OpCode::ReadRequest,
        &read_request(&[attr_path(None, None, None)]),
    );
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let reports = take_reports(&client);
    assert!(reports.last().unwrap().suppress);
    assert!(reports.iter().all(|r| r.subscription_id.is_none()));

    let attrs: Vec<&Reported> = reports.iter().flat_map(|r| r.attrs.iter()).collect();
    // Paths reached through a wildcard never report errors
    assert!(attrs.iter().all(|a| a.status.is_none()));

    let paths: BTreeSet<ConcretePath> = attrs.iter().map(|a| a.path).collect();
    assert_eq!(paths.len(), WILDCARD_ATTR_COUNT);
    assert!(paths.contains(&(0, ON_OFF, 0xFFFD)));
    assert!(!paths.contains(&(0, LEVEL_CONTROL, ATTR_CURRENT_LEVEL)));

    let level = attrs
        .iter()
        .find(|a| a.path == (1, LEVEL_CONTROL, ATTR_CURRENT_LEVEL))
        .unwrap();
    assert_eq!(level.value().u8().unwrap(), 128);

    assert_eq!(services.im.handler_count(), 0);
}

#[test]
fn concrete_read_reports_missing_paths() {
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
    let client = ImClient::default();
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);
    let session = commission(&pase, &log, &mut device, &dev_net, &mut ctrl, &ctrl_net);

    node.set_on(1, true);

    client.request(
        &mut ctrl,
        session,
        OpCode::ReadRequest,
        &read_request(&[
            attr_path(Some(5), Some(ON_OFF), Some(ATTR_ON_OFF)),
            attr_path(Some(0), Some(0x99), Some(0)),
            attr_path(Some(0), Some(ON_OFF), Some(0x77)),
            attr_path(Some(1), Some(ON_OFF), Some(ATTR_ON_OFF)),
        ]),
    );
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let reports = take_reports(&client);
    assert_eq!(reports.len(), 1);

    let attrs = &reports[0].attrs;
    assert_eq!(attrs.len(), 4);
    assert_eq!(attrs[0].status, Some(IMStatusCode::UnsupportedEndpoint));
    assert_eq!(attrs[1].status, Some(IMStatusCode::UnsupportedCluster));
    assert_eq!(attrs[2].status, Some(IMStatusCode::UnsupportedAttribute));
    assert_eq!(attrs[3].path, (1, ON_OFF, ATTR_ON_OFF));
    assert!(attrs[3].value().bool().unwrap());
}

#[test]
fn write_checks_data_version() {
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
    let client = ImClient::default();
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);
    let session = commission(&pase, &log, &mut device, &dev_net, &mut ctrl, &ctrl_net);

    let version = node.light(1).version;
    let write = |value: u16| {
        write_request(
            false,
            &[AttrWrite {
                path: attr_path(Some(1), Some(ON_OFF), Some(ATTR_ON_TIME)),
                data_version: Some(version),
                value: &value,
            }],
        )
    };

    client.request(&mut ctrl, session, OpCode::WriteRequest, &write(30));
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let responses = client.take_of(OpCode::WriteResponse);
    assert_eq!(
        write_statuses(&responses[0]),
        vec![((1, ON_OFF, ATTR_ON_TIME), IMStatusCode::Success)]
    );
    assert_eq!(node.light(1).on_time, 30);
    assert_eq!(node.light(1).version, version + 1);

    // The same version is now stale
    client.request(&mut ctrl, session, OpCode::WriteRequest, &write(40));
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let responses = client.take_of(OpCode::WriteResponse);
    assert_eq!(
        write_statuses(&responses[0]),
        vec![((1, ON_OFF, ATTR_ON_TIME), IMStatusCode::DataVersionMismatch)]
    );
    assert_eq!(node.light(1).on_time, 30);
}

#[test]
fn write_reports_status_per_path() {
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
    let client = ImClient::default();
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);
    let session = commission(&pase, &log, &mut device, &dev_net, &mut ctrl, &ctrl_net);

    let write = |endpoint, attr, value: &'static dyn ToTLV| AttrWrite {
        path: attr_path(Some(endpoint), Some(ON_OFF), Some(attr)),
        data_version: None,
        value,
    };

    client.request(
        &mut ctrl,
        session,
        OpCode::WriteRequest,
        &write_request(
            false,
            &[
                write(0, ATTR_ON_OFF, &true),
                write(0, ATTR_OFF_WAIT_TIME, &5u16),
                write(0, 0x77, &5u16),
                write(7, ATTR_ON_TIME, &5u16),
                write(0, ATTR_ON_TIME, &5u16),
            ],
        ),
    );
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let responses = client.take_of(OpCode::WriteResponse);
    assert_eq!(
        write_statuses(&responses[0]),
        vec![
            ((0, ON_OFF, ATTR_ON_OFF), IMStatusCode::UnsupportedWrite),
            ((0, ON_OFF, ATTR_OFF_WAIT_TIME), IMStatusCode::NeedsTimedInteraction),
            ((0, ON_OFF, 0x77), IMStatusCode::UnsupportedAttribute),
            ((7, ON_OFF, ATTR_ON_TIME), IMStatusCode::UnsupportedEndpoint),
            ((0, ON_OFF, ATTR_ON_TIME), IMStatusCode::Success),
        ]
    );

    let light = node.light(0);
    assert!(!light.on);
    assert_eq!(light.off_wait_time, 0);
    assert_eq!(light.on_time, 5);
}

#[test]
fn list_write_replaces_then_appends() {
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
    let client = ImClient::default();
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);
    let session = commission(&pase, &log, &mut device, &dev_net, &mut ctrl, &ctrl_net);

    let tags = attr_path(Some(0), Some(ON_OFF), Some(ATTR_TAGS));
    let append = AttrPath {
        list_index: Some(Nullable::Null),
        ..tags
    };

    client.request(
        &mut ctrl,
        session,
        OpCode::WriteRequest,
        &write_request(
            false,
            &[
                AttrWrite {
                    path: tags,
                    data_version: None,
                    value: &U32List(&[1, 2]),
                },
                AttrWrite {
                    path: append,
                    data_version: None,
                    value: &3u32,
                },
            ],
        ),
    );
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let responses = client.take_of(OpCode::WriteResponse);
    assert!(write_statuses(&responses[0])
        .iter()
        .all(|(_, status)| *status == IMStatusCode::Success));
    assert_eq!(node.light(0).tags, vec![1, 2, 3]);

    client.request(&mut ctrl, session, OpCode::ReadRequest, &read_request(&[tags]));
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let reports = take_reports(&client);
    let values: Vec<u32> = reports[0].attrs[0]
        .value()
        .enter()
        .unwrap()
        .map(|e| e.unwrap().u32().unwrap())
        .collect();
    assert_eq!(values, vec![1, 2, 3]);
}

#[test]
fn timed_write_follows_timed_request() {
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
    let client = ImClient::default();
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);
    let session = commission(&pase, &log, &mut device, &dev_net, &mut ctrl, &ctrl_net);

    let write = write_request(
        true,
        &[AttrWrite {
            path: attr_path(Some(0), Some(ON_OFF), Some(ATTR_OFF_WAIT_TIME)),
            data_version: None,
            value: &7u16,
        }],
    );

    client.timed_request(&mut ctrl, session, 500, OpCode::WriteRequest, &write);
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let messages = client.take();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].0, OpCode::StatusResponse);
    assert_eq!(
        parse_status_response(&messages[0].1).unwrap(),
        IMStatusCode::Success
    );
    assert_eq!(messages[1].0, OpCode::WriteResponse);
    assert_eq!(
        write_statuses(&messages[1].1),
        vec![((0, ON_OFF, ATTR_OFF_WAIT_TIME), IMStatusCode::Success)]
    );
    assert_eq!(node.light(0).off_wait_time, 7);

    // Claiming a timed write without the TimedRequest
    client.request(&mut ctrl, session, OpCode::WriteRequest, &write);
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);
    assert_eq!(last_status(&client), IMStatusCode::TimedRequestMisMatch);
}

#[test]
fn expired_timed_request_fails_action() {
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
    let client = ImClient::default();
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);
    let session = commission(&pase, &log, &mut device, &dev_net, &mut ctrl, &ctrl_net);

    let write = write_request(
        true,
        &[AttrWrite {
            path: attr_path(Some(0), Some(ON_OFF), Some(ATTR_OFF_WAIT_TIME)),
            data_version: None,
            value: &9u16,
        }],
    );

    client.timed_request(&mut ctrl, session, 50, OpCode::WriteRequest, &write);
    deliver_to_device(&mut device, &ctrl_net);
    // The write goes out as soon as the device accepts the TimedRequest...
    deliver_to_controller(&mut ctrl, &dev_net);
    // ...but reaches it too late
    advance(Duration::from_millis(100));
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    assert_eq!(last_status(&client), IMStatusCode::Timeout);
    assert_eq!(node.light(0).off_wait_time, 0);
}

#[test]
fn invoke_runs_commands() {
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
    let client = ImClient::default();
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);
    let session = commission(&pase, &log, &mut device, &dev_net, &mut ctrl, &ctrl_net);

    client.request(
        &mut ctrl,
        session,
        OpCode::InvokeRequest,
        &invoke_request(
            false,
            &[
                CmdPath::new(Some(1), Some(ON_OFF), Some(CMD_TOGGLE)),
                CmdPath::new(Some(0), Some(LEVEL_CONTROL), Some(0)),
                CmdPath::new(Some(0), Some(ON_OFF), Some(0x99)),
            ],
        ),
    );
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let responses = client.take_of(OpCode::InvokeResponse);
    assert_eq!(
        invoke_statuses(&responses[0]),
        vec![
            ((1, ON_OFF, CMD_TOGGLE), IMStatusCode::Success),
            ((0, LEVEL_CONTROL, 0), IMStatusCode::UnsupportedCluster),
            ((0, ON_OFF, 0x99), IMStatusCode::UnsupportedCommand),
        ]
    );
    assert!(node.light(1).on);

    // A wildcard endpoint reaches every endpoint with the command
    client.request(
        &mut ctrl,
        session,
        OpCode::InvokeRequest,
        &invoke_request(false, &[CmdPath::new(None, Some(ON_OFF), Some(CMD_ON))]),
    );
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let responses = client.take_of(OpCode::InvokeResponse);
    assert_eq!(
        invoke_statuses(&responses[0]),
        vec![
            ((0, ON_OFF, CMD_ON), IMStatusCode::Success),
            ((1, ON_OFF, CMD_ON), IMStatusCode::Success),
        ]
    );
    assert!(node.light(0).on);

    // Commands with a response carry data instead of a status
    let query = CmdPath::new(Some(1), Some(LEVEL_CONTROL), Some(CMD_QUERY_LEVEL));
    client.request(
        &mut ctrl,
        session,
        OpCode::InvokeRequest,
        &invoke_request_u8(query, 2),
    );
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let responses = client.take_of(OpCode::InvokeResponse);
    assert_eq!(
        invoke_statuses(&responses[0]),
        vec![((1, LEVEL_CONTROL, CMD_QUERY_LEVEL_RESPONSE), IMStatusCode::Success)]
    );
    let root = get_root_node_struct(&responses[0]).unwrap();
    let resp = root.find_ctx(1).unwrap().enter().unwrap().next().unwrap().unwrap();
    let level = resp
        .find_ctx(0)
        .unwrap()
        .find_ctx(1)
        .unwrap()
        .ctx::<u8>(0)
        .unwrap();
    assert_eq!(level, 130);

    // Missing fields are reported as a malformed command
    client.request(
        &mut ctrl,
        session,
        OpCode::InvokeRequest,
        &invoke_request(false, &[query]),
    );
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let responses = client.take_of(OpCode::InvokeResponse);
    assert_eq!(
        invoke_statuses(&responses[0]),
        vec![((1, LEVEL_CONTROL, CMD_QUERY_LEVEL), IMStatusCode::InvalidCommand)]
    );
}

#[test]
fn timed_command_needs_timed_request() {
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
    let client = ImClient::default();
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);
    let session = commission(&pase, &log, &mut device, &dev_net, &mut ctrl, &ctrl_net);

    node.set_on(0, true);
    let path = CmdPath::new(Some(0), Some(ON_OFF), Some(CMD_OFF_WITH_EFFECT));

    client.request(
        &mut ctrl,
        session,
        OpCode::InvokeRequest,
        &invoke_request(false, &[path]),
    );
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let responses = client.take_of(OpCode::InvokeResponse);
    assert_eq!(
        invoke_statuses(&responses[0]),
        vec![((0, ON_OFF, CMD_OFF_WITH_EFFECT), IMStatusCode::NeedsTimedInteraction)]
    );
    assert!(node.light(0).on);

    client.timed_request(
        &mut ctrl,
        session,
        500,
        OpCode::InvokeRequest,
        &invoke_request(true, &[path]),
    );
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let responses = client.take_of(OpCode::InvokeResponse);
    assert_eq!(
        invoke_statuses(&responses[0]),
        vec![((0, ON_OFF, CMD_OFF_WITH_EFFECT), IMStatusCode::Success)]
    );
    assert!(!node.light(0).on);
}

#[test]
fn subscribe_rejects_inverted_intervals() {
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
    let client = ImClient::default();
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);
    let session = commission(&pase, &log, &mut device, &dev_net, &mut ctrl, &ctrl_net);

    client.request(
        &mut ctrl,
        session,
        OpCode::SubscribeRequest,
        &subscribe_request(10, 5, &[attr_path(Some(1), Some(ON_OFF), None)]),
    );
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    assert_eq!(last_status(&client), IMStatusCode::InvalidAction);
    assert_eq!(services.im.subscription_count(), 0);
    assert_eq!(services.im.handler_count(), 0);
}

#[test]
fn subscription_reports_changes() {
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
    let client = ImClient::default();
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);
    ctrl.register_unsolicited_handler(PROTO_ID_INTERACTION_MODEL, None, &client)
        .unwrap();

    case.start(&mut ctrl, device_addr(), ctrl_fab, DEVICE_NODE).unwrap();
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);
    let session = log.last_session();

    client.request(
        &mut ctrl,
        session,
        OpCode::SubscribeRequest,
        &subscribe_request(1, 30, &[attr_path(Some(1), Some(ON_OFF), Some(ATTR_ON_OFF))]),
    );
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    // Priming report first, then the response carrying the same id
    let messages = client.take();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].0, OpCode::ReportData);
    assert_eq!(messages[1].0, OpCode::SubscribeResponse);

    let priming = parse_report(&messages[0].1);
    let id = priming.subscription_id.expect("no subscription id");
    assert!(!priming.suppress);
    assert_eq!(priming.attrs.len(), 1);
    assert!(!priming.attrs[0].value().bool().unwrap());

    let response = get_root_node_struct(&messages[1].1).unwrap();
    assert_eq!(response.ctx::<u32>(0).unwrap(), id);
    assert_eq!(response.ctx::<u16>(2).unwrap(), 30);

    assert_eq!(services.im.subscription_count(), 1);
    assert!(kv
        .borrow()
        .contains(&keys::subscriptions(dev_fab, CONTROLLER_NODE)));

    // A change on the subscribed cluster is reported after the floor
    node.set_on(1, true);
    device.notify_changed(1, ON_OFF);
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);
    advance(Duration::from_secs(2));
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let reports = take_reports(&client);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].subscription_id, Some(id));
    assert_eq!(reports[0].attrs[0].path, (1, ON_OFF, ATTR_ON_OFF));
    assert!(reports[0].attrs[0].value().bool().unwrap());

    // Nothing is reported for clusters outside the subscription
    node.set_on(0, true);
    device.notify_changed(0, ON_OFF);
    advance(Duration::from_secs(2));
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);
    assert!(client.take().is_empty());

    // The ceiling forces a report even without changes
    advance(Duration::from_secs(30));
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let reports = take_reports(&client);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].subscription_id, Some(id));
    assert_eq!(services.im.subscription_count(), 1);

    // Leaving the fabric forgets the subscription everywhere
    device.remove_fabric(dev_fab).unwrap();
    assert_eq!(services.im.subscription_count(), 0);
    assert_eq!(secure_sessions(device.exchanges()), 0);
    assert!(!kv
        .borrow()
        .contains(&keys::subscriptions(dev_fab, CONTROLLER_NODE)));
}

#[test]
fn subscription_resumes_after_restart() {
    init_env_logger();

    let chain = Chain::new(1);

    let kv = RefCell::new(MemKvStore::new());
    let node = TestNode::new();
    let dev_net = Outbox::new();

    let fabrics = RefCell::new(FabricMgr::new());
    let ctrl_fab = fabrics
        .borrow_mut()
        .add(chain.fabric(FABRIC_ID, CONTROLLER_NODE))
        .unwrap();

    let log = PairingLog::default();
    let case = CaseInitiator::new(&fabrics, &log);
    let case_responder = CaseResponder::new(&fabrics, &log);
    let client = ImClient::default();
    let ctrl_net = Outbox::new();
    let mut ctrl = controller_mgr(&ctrl_net);
    ctrl.register_unsolicited_handler(
        PROTO_ID_SECURE_CHANNEL,
        Some(ScOpCode::CASESigma1 as u8),
        &case_responder,
    )
    .unwrap();
    ctrl.register_unsolicited_handler(PROTO_ID_INTERACTION_MODEL, None, &client)
        .unwrap();

    let id = {
        let matter = Matter::new(device_config(None), &kv, now, sys_rand);
        let services = Services::new(&matter, &node);
        let mut device = Stack::new(&matter, &services, &dev_net).unwrap();
        device.init().unwrap();
        device
            .add_fabric(chain.fabric(FABRIC_ID, DEVICE_NODE))
            .unwrap();

        case.start(&mut ctrl, device_addr(), ctrl_fab, DEVICE_NODE).unwrap();
        shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

        client.request(
            &mut ctrl,
            log.last_session(),
            OpCode::SubscribeRequest,
            &subscribe_request(1, 60, &[attr_path(Some(1), Some(ON_OFF), None)]),
        );
        shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

        let responses = client.take_of(OpCode::SubscribeResponse);
        let id = get_root_node_struct(&responses[0])
            .unwrap()
            .ctx::<u32>(0)
            .unwrap();

        device.shutdown().unwrap();
        assert_eq!(services.im.subscription_count(), 0);

        id
    };
    dev_net.take();
    advance(Duration::from_secs(5));

    let matter = Matter::new(device_config(None), &kv, now, sys_rand);
    let services = Services::new(&matter, &node);
    let mut device = Stack::new(&matter, &services, &dev_net).unwrap();
    device.init().unwrap();
    assert_eq!(matter.fabrics().borrow().len(), 1);

    let established = log.sessions.borrow().len();
    let queued = device
        .start_resumption(|_, node_id| (node_id == CONTROLLER_NODE).then(controller_addr))
        .unwrap();
    assert_eq!(queued, 1);

    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    // The device opened CASE towards the controller on its own
    assert_eq!(log.sessions.borrow().len(), established + 1);
    assert!(log.errors.borrow().is_empty());

    let messages = client.take();
    assert!(messages
        .iter()
        .all(|(opcode, _)| *opcode != OpCode::SubscribeResponse));

    let reports: Vec<Report> = messages
        .iter()
        .filter(|(opcode, _)| *opcode == OpCode::ReportData)
        .map(|(_, payload)| parse_report(payload))
        .collect();
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].subscription_id, Some(id));
    assert!(reports[0]
        .attrs
        .iter()
        .any(|a| a.path == (1, ON_OFF, ATTR_ON_OFF)));
    assert_eq!(services.im.subscription_count(), 1);

    // The resumed subscription keeps reporting
    node.set_on(1, true);
    device.notify_changed(1, ON_OFF);
    advance(Duration::from_secs(2));
    shuttle(&mut device, &dev_net, &mut ctrl, &ctrl_net);

    let reports = take_reports(&client);
    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].subscription_id, Some(id));
}
