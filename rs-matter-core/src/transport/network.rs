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

use core::fmt;

pub use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::error::Error;

pub mod btp;
pub mod tcp;
pub mod udp;

pub const MATTER_PORT: u16 = 5540;

// Largest UDP datagram accepted on receive
pub const MAX_RX_PACKET_SIZE: usize = 1583;

// IPv6 minimum MTU minus the IPv6 and UDP headers
pub const MAX_TX_PACKET_SIZE: usize = 1280 - 40/*IPV6 header size*/ - 8/*UDP header size*/;

/// A BLE peer's device address.
#[derive(Eq, PartialEq, Copy, Clone, Hash)]
pub struct BtAddr(pub [u8; 6]);

impl fmt::Display for BtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

impl fmt::Debug for BtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[derive(Eq, PartialEq, Copy, Clone, Hash)]
pub enum Address {
    Udp(SocketAddr),
    Tcp(SocketAddr),
    Btp(BtAddr),
}

impl Address {
    pub const fn new() -> Self {
        Self::Udp(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0))
    }

    /// Whether the medium itself guarantees delivery, in which case the
    /// reliable message protocol is not used on top of it.
    pub fn is_reliable(&self) -> bool {
        matches!(self, Self::Tcp(_) | Self::Btp(_))
    }

    pub fn udp(&self) -> Option<SocketAddr> {
        match self {
            Self::Udp(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn tcp(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(addr) => Some(*addr),
            _ => None,
        }
    }

    pub fn btp(&self) -> Option<BtAddr> {
        match self {
            Self::Btp(addr) => Some(*addr),
            _ => None,
        }
    }
}

impl Default for Address {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Udp(addr) => write!(f, "UDP {}", addr),
            Address::Tcp(addr) => write!(f, "TCP {}", addr),
            Address::Btp(addr) => write!(f, "BTP {}", addr),
        }
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Sends one Matter message to a peer.
pub trait NetworkSend {
    fn send_to(&self, data: &[u8], addr: Address) -> Result<(), Error>;
}

impl<T> NetworkSend for &T
where
    T: NetworkSend + ?Sized,
{
    fn send_to(&self, data: &[u8], addr: Address) -> Result<(), Error> {
        (*self).send_to(data, addr)
    }
}

/// Receives one Matter message, waiting at most `timeout`.
///
/// `Ok(None)` means the timeout elapsed without traffic.
pub trait NetworkReceive {
    fn recv_from(
        &self,
        buffer: &mut [u8],
        timeout: Option<core::time::Duration>,
    ) -> Result<Option<(usize, Address)>, Error>;
}

impl<T> NetworkReceive for &T
where
    T: NetworkReceive + ?Sized,
{
    fn recv_from(
        &self,
        buffer: &mut [u8],
        timeout: Option<core::time::Duration>,
    ) -> Result<Option<(usize, Address)>, Error> {
        (*self).recv_from(buffer, timeout)
    }
}
