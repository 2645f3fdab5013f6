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

//! UDP transport over a blocking std socket

use std::io::ErrorKind;
use std::net::UdpSocket;
use std::time::Duration;

use log::{debug, info};

use crate::error::{Error, ErrorCode};

use super::{Address, NetworkReceive, NetworkSend, SocketAddr};

pub struct UdpTransport {
    socket: UdpSocket,
}

impl UdpTransport {
    pub fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let socket = UdpSocket::bind(addr)?;
        info!("Listening on {:?}", socket.local_addr()?);

        Ok(Self { socket })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.socket.local_addr()?)
    }
}

impl NetworkSend for UdpTransport {
    fn send_to(&self, data: &[u8], addr: Address) -> Result<(), Error> {
        let addr = addr.udp().ok_or(ErrorCode::NoNetworkInterface)?;
        self.socket.send_to(data, addr)?;
        debug!("Sent {} bytes to {}", data.len(), addr);

        Ok(())
    }
}

impl NetworkReceive for UdpTransport {
    fn recv_from(
        &self,
        buffer: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<Option<(usize, Address)>, Error> {
        // A zero timeout is rejected by the socket API
        let timeout = timeout.map(|t| t.max(Duration::from_millis(1)));
        self.socket.set_read_timeout(timeout)?;

        match self.socket.recv_from(buffer) {
            Ok((len, addr)) => Ok(Some((len, Address::Udp(addr)))),
            Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }
}
