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

//! The secure session, exchange and interaction model core of a Matter node.
//!
//! Packets enter through [`Stack::handle_rx`]. The exchange manager decrypts
//! them, runs the reliable message protocol and hands each message to the
//! delegate of its exchange: the PASE and CASE handshakes of the secure
//! channel, or the [`InteractionModel`](im::InteractionModel) answering from
//! an application [`Provider`](dm::Provider).
//!
//! # Example
//! ```no_run
//! use core::cell::RefCell;
//!
//! use rs_matter_core::dm::{AttrDetails, AttrValueEncoder, Endpoint, Provider};
//! use rs_matter_core::error::Error;
//! use rs_matter_core::persist::MemKvStore;
//! use rs_matter_core::transport::network::udp::UdpTransport;
//! use rs_matter_core::utils::{epoch::sys_epoch, rand::sys_rand};
//! use rs_matter_core::{Matter, Services, Stack, StackConfig};
//!
//! struct Empty;
//!
//! impl Provider for Empty {
//!     fn endpoints(&self) -> &[Endpoint<'_>] {
//!         &[]
//!     }
//!
//!     fn read_attribute(&self, _: &AttrDetails, _: AttrValueEncoder) -> Result<(), Error> {
//!         Ok(())
//!     }
//! }
//!
//! let kv = RefCell::new(MemKvStore::new());
//! let udp = UdpTransport::bind("0.0.0.0:5540".parse().unwrap()).unwrap();
//!
//! let config = StackConfig {
//!     passcode: Some(20202021),
//!     ..StackConfig::new()
//! };
//! let matter = Matter::new(config, &kv, sys_epoch, sys_rand);
//! let services = Services::new(&matter, &Empty);
//! let mut stack = Stack::new(&matter, &services, &udp).unwrap();
//! stack.init().unwrap();
//! ```

pub mod core;
pub mod crypto;
pub mod dm;
pub mod error;
pub mod fabric;
pub mod im;
pub mod persist;
pub mod sc;
pub mod tlv;
pub mod transport;
pub mod utils;

pub use crate::core::*;
