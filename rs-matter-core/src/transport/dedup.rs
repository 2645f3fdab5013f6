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

//! Duplicate message detection over a sliding counter window.

const WINDOW: u32 = 16;

/// Receive-side counter state of one peer.
///
/// Tracks the highest counter seen plus a bitmap of the `WINDOW` counters
/// right below it; bit `n` set means `max_ctr - 1 - n` was already received.
#[derive(Debug, Clone)]
pub struct RxCtrState {
    max_ctr: u32,
    window: u16,
}

impl RxCtrState {
    /// Starts tracking from the first counter received, which counts as seen.
    pub const fn new(first_ctr: u32) -> Self {
        Self {
            max_ctr: first_ctr,
            window: u16::MAX,
        }
    }

    fn seen(&self, behind: u32) -> bool {
        self.window & (1 << behind) != 0
    }

    fn mark(&mut self, behind: u32) {
        self.window |= 1 << behind;
    }

    /// Records `msg_ctr`, returning `false` if it is a duplicate, in which
    /// case the state is left as is.
    ///
    /// Unencrypted peers may reboot and restart from a lower counter, which
    /// resets the window instead of being rejected.
    pub fn post_recv(&mut self, msg_ctr: u32, is_encrypted: bool) -> bool {
        let delta = msg_ctr.wrapping_sub(self.max_ctr) as i32;

        if delta == 0 {
            false
        } else if delta < 0 && delta.unsigned_abs() <= WINDOW {
            let behind = delta.unsigned_abs() - 1;
            if self.seen(behind) {
                false
            } else {
                self.mark(behind);
                true
            }
        } else if msg_ctr > self.max_ctr {
            let advance = msg_ctr - self.max_ctr;
            self.max_ctr = msg_ctr;
            if advance <= WINDOW {
                self.window = self.window.checked_shl(advance).unwrap_or(0);
                self.mark(advance - 1);
            } else {
                self.window = 0;
            }
            true
        } else if !is_encrypted {
            self.max_ctr = msg_ctr;
            self.window = u16::MAX;
            true
        } else {
            false
        }
    }
}

pub const MAX_GROUP_SENDERS: usize = 16;

#[derive(Debug)]
struct GroupSender {
    fab_idx: u8,
    src_nodeid: u64,
    rx: RxCtrState,
    last_used: u32,
}

/// Counter state for group senders. It outlives the group sessions, as
/// group messages share one session per group key. The least recently
/// heard sender is forgotten when the store is full.
#[derive(Debug, Default)]
pub struct GroupCtrStore {
    senders: heapless::Vec<GroupSender, MAX_GROUP_SENDERS>,
    clock: u32,
}

impl GroupCtrStore {
    pub const fn new() -> Self {
        Self {
            senders: heapless::Vec::new(),
            clock: 0,
        }
    }

    /// Returns `false` for a duplicate. A sender heard for the first time is
    /// trusted.
    pub fn post_recv(&mut self, fab_idx: u8, src_nodeid: u64, msg_ctr: u32) -> bool {
        self.clock = self.clock.wrapping_add(1);

        if let Some(sender) = self
            .senders
            .iter_mut()
            .find(|s| s.fab_idx == fab_idx && s.src_nodeid == src_nodeid)
        {
            sender.last_used = self.clock;
            return sender.rx.post_recv(msg_ctr, true);
        }

        let sender = GroupSender {
            fab_idx,
            src_nodeid,
            rx: RxCtrState::new(msg_ctr),
            last_used: self.clock,
        };

        if let Err(sender) = self.senders.push(sender) {
            if let Some(lru) = self.senders.iter_mut().min_by_key(|s| s.last_used) {
                *lru = sender;
            }
        }

        true
    }

    /// Forgets all senders of a removed fabric.
    pub fn remove_fabric(&mut self, fab_idx: u8) {
        self.senders.retain(|s| s.fab_idx != fab_idx);
    }
}
