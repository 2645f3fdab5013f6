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

//! TCP transport. Each Matter message is framed with a 32-bit little-endian
//! length prefix.

use core::cell::RefCell;
use std::io::{ErrorKind, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::{Error, ErrorCode};

use super::{Address, NetworkReceive, NetworkSend, SocketAddr, MAX_RX_PACKET_SIZE};

pub const MAX_TCP_CONNECTIONS: usize = 4;

const FRAME_LEN_SIZE: usize = 4;
const POLL_INTERVAL: Duration = Duration::from_millis(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type FrameBuf = heapless::Vec<u8, { FRAME_LEN_SIZE + MAX_RX_PACKET_SIZE }>;

struct TcpConn {
    peer: SocketAddr,
    stream: TcpStream,
    rx: FrameBuf,
}

pub struct TcpTransport {
    listener: TcpListener,
    conns: RefCell<heapless::Vec<TcpConn, MAX_TCP_CONNECTIONS>>,
}

impl TcpTransport {
    pub fn bind(addr: SocketAddr) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("Listening on TCP {:?}", listener.local_addr()?);

        Ok(Self {
            listener,
            conns: RefCell::new(heapless::Vec::new()),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        Ok(self.listener.local_addr()?)
    }

    fn add_conn(&self, peer: SocketAddr, stream: TcpStream) -> Result<(), Error> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;

        let mut conns = self.conns.borrow_mut();
        conns.retain(|c| c.peer != peer);
        conns
            .push(TcpConn {
                peer,
                stream,
                rx: FrameBuf::new(),
            })
            .map_err(|_| ErrorCode::ResourceExhausted)?;

        Ok(())
    }

    fn accept_pending(&self) -> Result<(), Error> {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    debug!("Accepted TCP connection from {}", peer);
                    if let Err(e) = self.add_conn(peer, stream) {
                        warn!("Dropping TCP connection from {}: {}", peer, e);
                    }
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => return Ok(()),
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn poll_conns(&self, buffer: &mut [u8]) -> Result<Option<(usize, Address)>, Error> {
        let mut conns = self.conns.borrow_mut();
        let mut closed = None;
        let mut found = None;

        for (index, conn) in conns.iter_mut().enumerate() {
            let mut chunk = [0; 256];
            let free = conn.rx.capacity() - conn.rx.len();
            let want = free.min(chunk.len());

            if want > 0 {
                match conn.stream.read(&mut chunk[..want]) {
                    Ok(0) => {
                        closed = Some(index);
                        continue;
                    }
                    Ok(n) => {
                        // Cannot overflow, `want` is bounded by the free space
                        let _ = conn.rx.extend_from_slice(&chunk[..n]);
                    }
                    Err(e) if e.kind() == ErrorKind::WouldBlock => (),
                    Err(e) => {
                        warn!("TCP read from {} failed: {}", conn.peer, e);
                        closed = Some(index);
                        continue;
                    }
                }
            }

            match take_frame(&mut conn.rx, buffer) {
                Ok(Some(len)) => {
                    found = Some((len, Address::Tcp(conn.peer)));
                    break;
                }
                Ok(None) => (),
                Err(e) => {
                    warn!("Invalid TCP frame from {}: {}", conn.peer, e);
                    closed = Some(index);
                }
            }
        }

        if let Some(index) = closed {
            let conn = conns.swap_remove(index);
            debug!("TCP connection to {} closed", conn.peer);
        }

        Ok(found)
    }
}

/// Extracts one complete frame from `rx` into `out`, leaving any trailing
/// bytes of the next frame in `rx`.
fn take_frame(rx: &mut FrameBuf, out: &mut [u8]) -> Result<Option<usize>, Error> {
    if rx.len() < FRAME_LEN_SIZE {
        return Ok(None);
    }

    let mut len_bytes = [0; FRAME_LEN_SIZE];
    len_bytes.copy_from_slice(&rx[..FRAME_LEN_SIZE]);
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_RX_PACKET_SIZE || len > out.len() {
        Err(ErrorCode::BufferTooSmall)?;
    }

    if rx.len() < FRAME_LEN_SIZE + len {
        return Ok(None);
    }

    out[..len].copy_from_slice(&rx[FRAME_LEN_SIZE..FRAME_LEN_SIZE + len]);

    let rest = rx.len() - FRAME_LEN_SIZE - len;
    rx.copy_within(FRAME_LEN_SIZE + len.., 0);
    rx.truncate(rest);

    Ok(Some(len))
}

impl NetworkSend for TcpTransport {
    fn send_to(&self, data: &[u8], addr: Address) -> Result<(), Error> {
        let peer = addr.tcp().ok_or(ErrorCode::NoNetworkInterface)?;

        let connected = self.conns.borrow().iter().any(|c| c.peer == peer);
        if !connected {
            let stream = TcpStream::connect_timeout(&peer, CONNECT_TIMEOUT)?;
            self.add_conn(peer, stream)?;
        }

        let len = u32::try_from(data.len()).map_err(|_| ErrorCode::InvalidArgument)?;

        let mut conns = self.conns.borrow_mut();
        let conn = conns
            .iter_mut()
            .find(|c| c.peer == peer)
            .ok_or(ErrorCode::NoNetworkInterface)?;

        // The socket is non-blocking for reads; writes of a single frame are
        // short enough to go out in one go on a healthy connection
        conn.stream.set_nonblocking(false)?;
        let res = conn
            .stream
            .write_all(&len.to_le_bytes())
            .and_then(|_| conn.stream.write_all(data));
        conn.stream.set_nonblocking(true)?;
        res?;

        debug!("Sent {} bytes to TCP {}", data.len(), peer);

        Ok(())
    }
}

impl NetworkReceive for TcpTransport {
    fn recv_from(
        &self,
        buffer: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<Option<(usize, Address)>, Error> {
        let start = Instant::now();

        loop {
            self.accept_pending()?;

            if let Some(found) = self.poll_conns(buffer)? {
                return Ok(Some(found));
            }

            if timeout.map(|t| start.elapsed() >= t).unwrap_or(false) {
                return Ok(None);
            }

            std::thread::sleep(POLL_INTERVAL);
        }
    }
}
