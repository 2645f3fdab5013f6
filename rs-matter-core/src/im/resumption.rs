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

//! Persistence of subscriptions, so that a node coming back from a restart
//! can re-establish them without its subscribers asking again.
//!
//! All subscriptions of one peer live in a single record keyed by the
//! peer's fabric index and node id. A separate index record lists the
//! peers that have one.

use log::{debug, warn};

use crate::error::{Error, ErrorCode};
use crate::persist::{keys, KvStore};
use crate::tlv::{get_root_node_array, FromTLV, TLVElement, TLVWriter, TagType, ToTLV};
use crate::utils::storage::WriteBuf;

use super::report::{MAX_ATTR_PATHS, MAX_EVENT_PATHS};
use super::{AttrPath, EventPath};

/// Subscriptions kept per peer. Saving one more drops the oldest.
pub const MAX_SUBSCRIPTIONS_PER_PEER: usize = 3;

/// Peers with persisted subscriptions.
pub const MAX_SUBSCRIBED_PEERS: usize = 16;

const MAX_RECORD_LEN: usize = 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub fab_idx: u8,
    pub node_id: u64,
    pub subscription_id: u32,
    pub min_interval: u16,
    pub max_interval: u16,
    pub fabric_filtered: bool,
    pub attr_paths: heapless::Vec<AttrPath, MAX_ATTR_PATHS>,
    pub event_paths: heapless::Vec<EventPath, MAX_EVENT_PATHS>,
}

impl SubscriptionInfo {
    fn from_tlv(fab_idx: u8, node_id: u64, t: &TLVElement) -> Result<Self, Error> {
        t.confirm_struct()?;

        let mut attr_paths = heapless::Vec::new();
        for path in t.find_ctx(4)?.enter()? {
            attr_paths
                .push(AttrPath::from_tlv(&path?)?)
                .map_err(|_| ErrorCode::InvalidData)?;
        }

        let mut event_paths = heapless::Vec::new();
        for path in t.find_ctx(5)?.enter()? {
            event_paths
                .push(EventPath::from_tlv(&path?)?)
                .map_err(|_| ErrorCode::InvalidData)?;
        }

        Ok(Self {
            fab_idx,
            node_id,
            subscription_id: t.ctx(0)?,
            min_interval: t.ctx(1)?,
            max_interval: t.ctx(2)?,
            fabric_filtered: t.ctx(3)?,
            attr_paths,
            event_paths,
        })
    }

    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.start_struct(tag)?;
        tw.u32(TagType::Context(0), self.subscription_id)?;
        tw.u16(TagType::Context(1), self.min_interval)?;
        tw.u16(TagType::Context(2), self.max_interval)?;
        tw.bool(TagType::Context(3), self.fabric_filtered)?;
        tw.start_array(TagType::Context(4))?;
        for path in &self.attr_paths {
            path.to_tlv(tw, TagType::Anonymous)?;
        }
        tw.end_container()?;
        tw.start_array(TagType::Context(5))?;
        for path in &self.event_paths {
            path.to_tlv(tw, TagType::Anonymous)?;
        }
        tw.end_container()?;
        tw.end_container()
    }
}

pub type PeerSubscriptions = heapless::Vec<SubscriptionInfo, MAX_SUBSCRIPTIONS_PER_PEER>;

/// A peer is identified by its fabric index and node id.
pub type ScopedNodeId = (u8, u64);

pub struct SubscriptionStore<'s> {
    kv: &'s mut dyn KvStore,
}

impl<'s> SubscriptionStore<'s> {
    pub fn new(kv: &'s mut dyn KvStore) -> Self {
        Self { kv }
    }

    /// The peers that have persisted subscriptions.
    pub fn peers(&self) -> Result<heapless::Vec<ScopedNodeId, MAX_SUBSCRIBED_PEERS>, Error> {
        let mut buf = [0; MAX_RECORD_LEN];
        let mut peers = heapless::Vec::new();

        if let Some(data) = self.kv.load(keys::SUBSCRIPTION_INDEX, &mut buf)? {
            for peer in get_root_node_array(data)?.enter()? {
                let peer = peer?;
                peers
                    .push((peer.ctx(0)?, peer.ctx(1)?))
                    .map_err(|_| ErrorCode::InvalidData)?;
            }
        }

        Ok(peers)
    }

    pub fn load(&self, fab_idx: u8, node_id: u64) -> Result<PeerSubscriptions, Error> {
        let mut buf = [0; MAX_RECORD_LEN];
        let mut subs = PeerSubscriptions::new();

        if let Some(data) = self
            .kv
            .load(&keys::subscriptions(fab_idx, node_id), &mut buf)?
        {
            for sub in get_root_node_array(data)?.enter()? {
                subs.push(SubscriptionInfo::from_tlv(fab_idx, node_id, &sub?)?)
                    .map_err(|_| ErrorCode::InvalidData)?;
            }
        }

        Ok(subs)
    }

    /// Persists a subscription, replacing the one with the same id if any.
    pub fn save(&mut self, info: &SubscriptionInfo) -> Result<(), Error> {
        let mut subs = self.load(info.fab_idx, info.node_id)?;

        if let Some(pos) = subs
            .iter()
            .position(|sub| sub.subscription_id == info.subscription_id)
        {
            subs.remove(pos);
        } else if subs.is_full() {
            let oldest = subs.remove(0);
            warn!(
                "Dropping persisted subscription {:x} of {:x}",
                oldest.subscription_id, info.node_id
            );
        }

        subs.push(info.clone())
            .map_err(|_| ErrorCode::ResourceExhausted)?;

        self.store(info.fab_idx, info.node_id, &subs)
    }

    pub fn delete(&mut self, fab_idx: u8, node_id: u64, subscription_id: u32) -> Result<(), Error> {
        let mut subs = self.load(fab_idx, node_id)?;

        let Some(pos) = subs
            .iter()
            .position(|sub| sub.subscription_id == subscription_id)
        else {
            return Ok(());
        };
        subs.remove(pos);

        self.store(fab_idx, node_id, &subs)
    }

    pub fn delete_peer(&mut self, fab_idx: u8, node_id: u64) -> Result<(), Error> {
        self.store(fab_idx, node_id, &[])
    }

    pub fn delete_fabric(&mut self, fab_idx: u8) -> Result<(), Error> {
        for (peer_fab_idx, node_id) in self.peers()? {
            if peer_fab_idx == fab_idx {
                self.delete_peer(peer_fab_idx, node_id)?;
            }
        }

        Ok(())
    }

    fn store(&mut self, fab_idx: u8, node_id: u64, subs: &[SubscriptionInfo]) -> Result<(), Error> {
        let key = keys::subscriptions(fab_idx, node_id);

        if subs.is_empty() {
            self.kv.remove(&key)?;
        } else {
            let mut buf = [0; MAX_RECORD_LEN];
            let mut wb = WriteBuf::new(&mut buf);
            let mut tw = TLVWriter::new(&mut wb);

            tw.start_array(TagType::Anonymous)?;
            for sub in subs {
                sub.to_tlv(&mut tw, TagType::Anonymous)?;
            }
            tw.end_container()?;

            self.kv.store(&key, wb.as_slice())?;
        }

        debug!(
            "Persisted {} subscriptions of {:x} on fabric {}",
            subs.len(),
            node_id,
            fab_idx
        );

        self.update_index((fab_idx, node_id), !subs.is_empty())
    }

    fn update_index(&mut self, peer: ScopedNodeId, present: bool) -> Result<(), Error> {
        let mut peers = self.peers()?;
        let pos = peers.iter().position(|p| *p == peer);

        match (pos, present) {
            (Some(_), true) | (None, false) => return Ok(()),
            (Some(pos), false) => {
                peers.remove(pos);
            }
            (None, true) => peers
                .push(peer)
                .map_err(|_| ErrorCode::ResourceExhausted)?,
        }

        if peers.is_empty() {
            return self.kv.remove(keys::SUBSCRIPTION_INDEX);
        }

        let mut buf = [0; MAX_RECORD_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);

        tw.start_array(TagType::Anonymous)?;
        for (fab_idx, node_id) in &peers {
            tw.start_struct(TagType::Anonymous)?;
            tw.u8(TagType::Context(0), *fab_idx)?;
            tw.u64(TagType::Context(1), *node_id)?;
            tw.end_container()?;
        }
        tw.end_container()?;

        self.kv.store(keys::SUBSCRIPTION_INDEX, wb.as_slice())
    }
}
