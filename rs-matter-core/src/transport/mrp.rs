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

//! Reliable message protocol: per-exchange retransmission and
//! acknowledgement bookkeeping.

use core::time::Duration;

use log::{error, warn};

use crate::error::*;

use super::proto_hdr::ProtoHdr;

/// Timing and retry parameters of the reliable message protocol.
///
/// The interval fields are the local defaults, advertised to peers during
/// session establishment; a session uses the values its peer advertised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmpConfig {
    /// Retransmission base interval while the peer is idle.
    pub idle_retrans_timeout: Duration,
    /// Retransmission base interval while the peer is active.
    pub active_retrans_timeout: Duration,
    /// How long a peer is considered active after it was last heard from.
    pub active_threshold: Duration,
    /// Retransmissions after the initial send, before giving up.
    pub max_retransmissions: u8,
    /// How long a received reliable message may wait for a piggy-backed ack
    /// before a standalone one is sent.
    pub ack_timeout: Duration,
    /// Retransmissions sent before exponential backoff kicks in.
    pub backoff_threshold: u8,
    /// Backoff factor as (numerator, denominator).
    pub backoff_base: (u64, u64),
    /// Safety margin applied on top of the base interval.
    pub backoff_margin: (u64, u64),
    /// Maximum random extension of each interval.
    pub backoff_jitter: (u64, u64),
}

impl RmpConfig {
    pub const fn new() -> Self {
        Self {
            idle_retrans_timeout: Duration::from_millis(500),
            active_retrans_timeout: Duration::from_millis(300),
            active_threshold: Duration::from_millis(4000),
            max_retransmissions: 4,
            ack_timeout: Duration::from_millis(200),
            backoff_threshold: 1,
            backoff_base: (16, 10),
            backoff_margin: (11, 10),
            backoff_jitter: (25, 100),
        }
    }

    /// Delay until the next transmission of a message that has already been
    /// sent `sent` times, `rand` picking the jitter.
    pub fn retrans_delay(&self, base: Duration, sent: u8, rand: u8) -> Duration {
        let mut ms = base.as_millis() as u64;

        ms = ms * self.backoff_margin.0 / self.backoff_margin.1;

        let exp = sent.saturating_sub(1).saturating_sub(self.backoff_threshold);
        for _ in 0..exp {
            ms = ms * self.backoff_base.0 / self.backoff_base.1;
        }

        let jitter = ms * self.backoff_jitter.0 * rand as u64 / (self.backoff_jitter.1 * 256);

        Duration::from_millis(ms + jitter)
    }
}

impl Default for RmpConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct RetransEntry {
    msg_ctr: u32,
    sent: u8,
    due_at: Duration,
}

impl RetransEntry {
    pub fn msg_ctr(&self) -> u32 {
        self.msg_ctr
    }

    /// How many times the message went out, the initial send included.
    pub fn sent(&self) -> u8 {
        self.sent
    }

    pub fn due_at(&self) -> Duration {
        self.due_at
    }
}

#[derive(Debug, Clone)]
pub struct AckEntry {
    msg_ctr: u32,
    due_at: Duration,
}

impl AckEntry {
    pub fn msg_ctr(&self) -> u32 {
        self.msg_ctr
    }
}

/// What the timer pass needs to do for one exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RmpAction {
    SendAck(u32),
    Retransmit,
    GiveUp,
}

#[derive(Default, Debug, Clone)]
pub struct ReliableMessage {
    retrans: Option<RetransEntry>,
    ack: Option<AckEntry>,
}

impl ReliableMessage {
    pub const fn new() -> Self {
        Self {
            retrans: None,
            ack: None,
        }
    }

    pub fn is_retrans_pending(&self) -> bool {
        self.retrans.is_some()
    }

    pub fn retrans(&self) -> Option<&RetransEntry> {
        self.retrans.as_ref()
    }

    pub fn is_ack_pending(&self) -> bool {
        self.ack.is_some()
    }

    pub fn pending_ack(&self) -> Option<u32> {
        self.ack.as_ref().map(AckEntry::msg_ctr)
    }

    pub fn clear_ack(&mut self) {
        self.ack = None;
    }

    pub fn clear_retrans(&mut self) {
        self.retrans = None;
    }

    /// Prepares an outgoing message: piggy-backs any pending ack and arms
    /// retransmission if the message asks for reliability.
    pub fn pre_send(
        &mut self,
        msg_ctr: u32,
        tx_proto: &mut ProtoHdr,
        now: Duration,
        first_delay: Duration,
    ) -> Result<(), Error> {
        if let Some(ack) = self.ack.take() {
            tx_proto.set_ack(Some(ack.msg_ctr));
        }

        if tx_proto.is_reliable() {
            if self.retrans.is_some() {
                // Only one reliable message may be in flight per exchange
                error!("Exchange already has an unacknowledged message");
                Err(ErrorCode::InvalidState)?;
            }

            self.retrans = Some(RetransEntry {
                msg_ctr,
                sent: 1,
                due_at: now + first_delay,
            });
        }

        Ok(())
    }

    /// Records a retransmission that just went out.
    pub fn on_retransmitted(&mut self, now: Duration, next_delay: Duration) {
        if let Some(retrans) = &mut self.retrans {
            retrans.sent = retrans.sent.saturating_add(1);
            retrans.due_at = now + next_delay;
        }
    }

    /// Updates the ack and retransmission state from an incoming message.
    ///
    /// A mismatched ack means the peer is still retransmitting an older
    /// message; the caller should drop it as a duplicate.
    pub fn post_recv(
        &mut self,
        rx_ctr: u32,
        rx_proto: &ProtoHdr,
        now: Duration,
        ack_timeout: Duration,
    ) -> Result<(), Error> {
        if let Some(ack_msg_ctr) = rx_proto.get_ack() {
            if let Some(entry) = &self.retrans {
                if entry.msg_ctr != ack_msg_ctr {
                    warn!(
                        "Ack for counter {:x} while waiting for {:x}",
                        ack_msg_ctr, entry.msg_ctr
                    );
                    Err(ErrorCode::Duplicate)?;
                }

                self.retrans = None;
            }
        }

        if rx_proto.is_reliable() {
            if let Some(ack) = &self.ack {
                warn!(
                    "Replacing pending ack {:x} with {:x}",
                    ack.msg_ctr, rx_ctr
                );
            }

            self.ack = Some(AckEntry {
                msg_ctr: rx_ctr,
                due_at: now + ack_timeout,
            });
        }

        Ok(())
    }

    /// The earliest instant this exchange needs attention.
    pub fn next_due(&self) -> Option<Duration> {
        let ack = self.ack.as_ref().map(|a| a.due_at);
        let retrans = self.retrans.as_ref().map(|r| r.due_at);

        match (ack, retrans) {
            (Some(a), Some(r)) => Some(a.min(r)),
            (a, r) => a.or(r),
        }
    }

    /// The work due at `now`. A standalone ack takes precedence so that the
    /// peer stops retransmitting before we do anything else.
    pub fn poll(&self, now: Duration, max_retransmissions: u8) -> Option<RmpAction> {
        if let Some(ack) = &self.ack {
            if ack.due_at <= now {
                return Some(RmpAction::SendAck(ack.msg_ctr));
            }
        }

        match &self.retrans {
            Some(r) if r.due_at <= now => {
                if r.sent > max_retransmissions {
                    Some(RmpAction::GiveUp)
                } else {
                    Some(RmpAction::Retransmit)
                }
            }
            _ => None,
        }
    }
}
