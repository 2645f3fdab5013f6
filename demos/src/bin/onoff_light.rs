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

//! A Matter on/off light reachable over UDP.
//!
//! Type `t` and Enter to flip the light as a physical switch would, `q` to
//! stop the node. Fabrics and subscriptions persist under `MATTER_STORAGE`
//! (`.matter-light` by default), so a restart keeps the node commissioned.

use core::cell::RefCell;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use std::io::BufRead;

use log::{error, info};

use rs_matter_core::dm::{
    AttrDetails, AttrValueEncoder, Attribute, Cluster, ClusterId, CmdDetails, CmdId, Command,
    CommandHandler, EndptId, Endpoint, Provider, Quality,
};
use rs_matter_core::error::{Error, ErrorCode};
use rs_matter_core::im::IMStatusCode;
use rs_matter_core::persist::FileKvStore;
use rs_matter_core::tlv::TLVElement;
use rs_matter_core::transport::network::udp::UdpTransport;
use rs_matter_core::transport::network::{Ipv6Addr, SocketAddr, MATTER_PORT};
use rs_matter_core::utils::epoch::sys_epoch;
use rs_matter_core::utils::rand::sys_rand;
use rs_matter_core::utils::sync::{StackLock, WorkQueue};
use rs_matter_core::{Matter, Services, Stack, StackConfig};

const LIGHT_ENDPOINT: EndptId = 1;
const ON_OFF: ClusterId = 0x0006;

const CMD_OFF: CmdId = 0x00;
const CMD_ON: CmdId = 0x01;
const CMD_TOGGLE: CmdId = 0x02;

const ON_OFF_CLUSTER: Cluster<'static> = Cluster::new(
    ON_OFF,
    5,
    0,
    &[Attribute::new(0x0000, Quality::empty())],
    &[
        Command::new(CMD_OFF, None),
        Command::new(CMD_ON, None),
        Command::new(CMD_TOGGLE, None),
    ],
);

const ENDPOINTS: &[Endpoint<'static>] = &[Endpoint::new(LIGHT_ENDPOINT, &[ON_OFF_CLUSTER])];

struct OnOffLight {
    on: AtomicBool,
    dataver: AtomicU32,
}

impl OnOffLight {
    const fn new() -> Self {
        Self {
            on: AtomicBool::new(false),
            dataver: AtomicU32::new(0),
        }
    }

    fn set(&self, on: bool) {
        self.on.store(on, Ordering::Relaxed);
        self.dataver.fetch_add(1, Ordering::Relaxed);
        info!("Light is {}", if on { "ON" } else { "OFF" });
    }

    fn toggle(&self) {
        self.set(!self.on.load(Ordering::Relaxed));
    }
}

impl Provider for OnOffLight {
    fn endpoints(&self) -> &[Endpoint<'_>] {
        ENDPOINTS
    }

    fn data_version(&self, _endpoint: EndptId, _cluster: ClusterId) -> u32 {
        self.dataver.load(Ordering::Relaxed)
    }

    fn read_attribute(
        &self,
        attr: &AttrDetails,
        encoder: AttrValueEncoder<'_, '_, '_>,
    ) -> Result<(), Error> {
        match attr.attr_id {
            0x0000 => encoder.encode(&self.on.load(Ordering::Relaxed)),
            _ => Err(ErrorCode::AttributeNotFound.into()),
        }
    }

    fn invoke(
        &self,
        cmd: &CmdDetails,
        _fields: &TLVElement<'_>,
        _handler: &mut CommandHandler<'_, '_, '_>,
    ) -> Option<IMStatusCode> {
        match cmd.cmd_id {
            CMD_OFF => self.set(false),
            CMD_ON => self.set(true),
            CMD_TOGGLE => self.toggle(),
            _ => return Some(IMStatusCode::UnsupportedCommand),
        }

        Some(IMStatusCode::Success)
    }
}

static LIGHT: OnOffLight = OnOffLight::new();

fn main() -> Result<(), Error> {
    env_logger::init_from_env(
        env_logger::Env::default().filter_or(env_logger::DEFAULT_FILTER_ENV, "info"),
    );

    let storage = std::env::var("MATTER_STORAGE").unwrap_or_else(|_| ".matter-light".into());
    let kv = RefCell::new(FileKvStore::new(storage)?);

    let config = StackConfig {
        passcode: Some(20202021),
        discriminator: 3840,
        ..StackConfig::new()
    };
    let udp = UdpTransport::bind(SocketAddr::new(Ipv6Addr::UNSPECIFIED.into(), config.port))?;

    let matter = Matter::new(config, &kv, sys_epoch, sys_rand);
    let services = Services::new(&matter, &LIGHT);

    let mut stack = Stack::new(&matter, &services, &udp)?;
    stack.init()?;
    info!(
        "On/off light on UDP port {}, passcode 20202021, discriminator 3840",
        MATTER_PORT
    );

    let lock = StackLock::new(stack);
    let work = WorkQueue::<Stack, 8>::new();
    let stop = AtomicBool::new(false);

    std::thread::scope(|s| {
        s.spawn(|| {
            for line in std::io::stdin().lock().lines() {
                let Ok(line) = line else {
                    break;
                };

                match line.trim() {
                    "t" => {
                        let scheduled = work.schedule_work(|stack| {
                            LIGHT.toggle();
                            stack.notify_changed(LIGHT_ENDPOINT, ON_OFF);
                        });
                        if let Err(e) = scheduled {
                            error!("Could not flip the light: {:?}", e);
                        }
                    }
                    "q" => break,
                    _ => info!("t: toggle, q: quit"),
                }
            }

            stop.store(true, Ordering::Relaxed);
        });

        Stack::run(&lock, &udp, &work, &stop)
    })
}
