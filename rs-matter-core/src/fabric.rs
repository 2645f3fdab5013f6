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

//! The fabric table.
//!
//! A fabric is the administrative domain a node joined during
//! commissioning: its operational key pair, the certificate chain rooted in
//! the fabric's trust anchor and the identity protection key (IPK) used to
//! address it during CASE.

use core::fmt;

use log::{info, warn};

use crate::crypto::{self, hkdf_sha256, HmacSha256, KeyPair, BIGNUM_LEN_BYTES};
use crate::error::{Error, ErrorCode};
use crate::persist::{keys, KvStore};
use crate::sc::cert::{Cert, CertBuf, MAX_CERT_TLV_LEN};
use crate::tlv::{get_root_node_struct, FromTLV, OctetStr, TLVElement, TLVWriter, TagType, ToTLV};
use crate::transport::session::AeadKey;
use crate::utils::storage::WriteBuf;

pub const COMPRESSED_FABRIC_ID_LEN: usize = 8;

pub const MAX_LABEL_LEN: usize = 32;

cfg_if::cfg_if! {
    if #[cfg(feature = "small-pools")] {
        pub const MAX_SUPPORTED_FABRICS: usize = 3;
    } else {
        pub const MAX_SUPPORTED_FABRICS: usize = 5;
    }
}

const MAX_FABRIC_TLV_LEN: usize = 3 * MAX_CERT_TLV_LEN + 128;

/// The epoch key a group key set was provisioned with, and the
/// operational key derived from it for one fabric.
#[derive(Clone)]
pub struct KeySet {
    epoch_key: AeadKey,
    op_key: AeadKey,
}

impl KeySet {
    pub fn new(epoch_key: &[u8], compressed_id: &[u8]) -> Result<Self, Error> {
        const GRP_KEY_INFO: &[u8] = b"GroupKey v1.0";

        let epoch_key: AeadKey = epoch_key
            .try_into()
            .map_err(|_| ErrorCode::InvalidKeyLength)?;

        let mut op_key = AeadKey::default();
        hkdf_sha256(compressed_id, &epoch_key, GRP_KEY_INFO, &mut op_key)?;

        Ok(Self { epoch_key, op_key })
    }

    pub fn epoch_key(&self) -> &AeadKey {
        &self.epoch_key
    }

    pub fn op_key(&self) -> &AeadKey {
        &self.op_key
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("KeySet { .. }")
    }
}

pub struct Fabric {
    fab_idx: u8,
    node_id: u64,
    fabric_id: u64,
    vendor_id: u16,
    key_pair: KeyPair,
    root_ca: CertBuf,
    icac: Option<CertBuf>,
    noc: CertBuf,
    ipk: KeySet,
    compressed_id: [u8; COMPRESSED_FABRIC_ID_LEN],
    label: heapless::String<MAX_LABEL_LEN>,
}

impl Fabric {
    /// Builds a fabric from the credentials handed over during
    /// commissioning. The chain is validated before anything is kept.
    pub fn new(
        key_pair: KeyPair,
        root_ca: &[u8],
        icac: Option<&[u8]>,
        noc: &[u8],
        ipk: &[u8],
        vendor_id: u16,
        label: &str,
    ) -> Result<Self, Error> {
        let (node_id, fabric_id, compressed_id) = {
            let noc_p = Cert::new(noc)?;
            let root_p = Cert::new(root_ca)?;
            let icac_p = icac.map(Cert::new).transpose()?;

            noc_p.verify_chain(icac_p.as_ref(), &root_p)?;

            let mut pubkey = [0; crypto::EC_POINT_LEN_BYTES];
            key_pair.get_public_key(&mut pubkey)?;
            if pubkey != noc_p.get_pubkey() {
                warn!("Operational key does not match the NOC");
                Err(ErrorCode::InvalidData)?;
            }

            let fabric_id = noc_p.get_fabric_id()?;
            if let Some(root_fabric_id) = root_p.subject().fabric_id() {
                if root_fabric_id != fabric_id {
                    Err(ErrorCode::InvalidData)?;
                }
            }

            let mut compressed_id = [0; COMPRESSED_FABRIC_ID_LEN];
            compressed_fabric_id(root_p.get_pubkey(), fabric_id, &mut compressed_id)?;

            (noc_p.get_node_id()?, fabric_id, compressed_id)
        };

        Ok(Self {
            fab_idx: 0,
            node_id,
            fabric_id,
            vendor_id,
            key_pair,
            root_ca: to_cert_buf(root_ca)?,
            icac: icac.map(to_cert_buf).transpose()?,
            noc: to_cert_buf(noc)?,
            ipk: KeySet::new(ipk, &compressed_id)?,
            compressed_id,
            label: label.try_into().map_err(|_| ErrorCode::InvalidArgument)?,
        })
    }

    pub fn fab_idx(&self) -> u8 {
        self.fab_idx
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    pub fn fabric_id(&self) -> u64 {
        self.fabric_id
    }

    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn compressed_id(&self) -> &[u8; COMPRESSED_FABRIC_ID_LEN] {
        &self.compressed_id
    }

    pub fn ipk(&self) -> &KeySet {
        &self.ipk
    }

    pub fn root_ca(&self) -> Result<Cert<'_>, Error> {
        Cert::new(&self.root_ca)
    }

    pub fn icac(&self) -> Option<&[u8]> {
        self.icac.as_deref()
    }

    pub fn noc(&self) -> &[u8] {
        &self.noc
    }

    pub fn key_pair(&self) -> &KeyPair {
        &self.key_pair
    }

    pub fn sign_msg(&self, msg: &[u8], signature: &mut [u8]) -> Result<usize, Error> {
        self.key_pair.sign_msg(msg, signature)
    }

    /// The destination identifier an initiator puts in Sigma1 to address
    /// `node_id` on this fabric.
    pub fn dest_id(&self, random: &[u8], node_id: u64, out: &mut [u8]) -> Result<(), Error> {
        let mut mac = HmacSha256::new(self.ipk.op_key())?;

        mac.update(random);
        mac.update(self.root_ca()?.get_pubkey());
        mac.update(&self.fabric_id.to_le_bytes());
        mac.update(&node_id.to_le_bytes());

        mac.finish(out)
    }

    pub fn match_dest_id(&self, random: &[u8], target: &[u8]) -> Result<(), Error> {
        let mut id = [0; crypto::SHA256_HASH_LEN_BYTES];
        self.dest_id(random, self.node_id, &mut id)?;

        if id.as_slice() == target {
            Ok(())
        } else {
            Err(ErrorCode::NotFound.into())
        }
    }

    fn store(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut key = [0; BIGNUM_LEN_BYTES];
        self.key_pair.get_private_key(&mut key)?;

        let mut wb = WriteBuf::new(buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous)?;
        tw.u16(TagType::Context(1), self.vendor_id)?;
        tw.str8(TagType::Context(2), &key)?;
        tw.str16(TagType::Context(3), &self.root_ca)?;
        if let Some(icac) = &self.icac {
            tw.str16(TagType::Context(4), icac)?;
        }
        tw.str16(TagType::Context(5), &self.noc)?;
        tw.str8(TagType::Context(6), self.ipk.epoch_key())?;
        tw.utf8(TagType::Context(7), self.label.as_bytes())?;
        tw.end_container()?;

        Ok(tw.get_tail())
    }

    fn load(fab_idx: u8, data: &[u8]) -> Result<Self, Error> {
        let root = get_root_node_struct(data)?;

        let key = root.ctx::<OctetStr>(2)?.0;
        let mut fabric = Self::new(
            KeyPair::new_from_private(key)?,
            root.ctx::<OctetStr>(3)?.0,
            root.ctx::<Option<OctetStr>>(4)?.map(|o| o.0),
            root.ctx::<OctetStr>(5)?.0,
            root.ctx::<OctetStr>(6)?.0,
            root.ctx(1)?,
            root.ctx::<&str>(7)?,
        )?;
        fabric.fab_idx = fab_idx;

        Ok(fabric)
    }
}

impl fmt::Debug for Fabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fabric")
            .field("fab_idx", &self.fab_idx)
            .field("fabric_id", &format_args!("{:x}", self.fabric_id))
            .field("node_id", &format_args!("{:x}", self.node_id))
            .field("vendor_id", &self.vendor_id)
            .field("label", &self.label)
            .finish()
    }
}

fn to_cert_buf(data: &[u8]) -> Result<CertBuf, Error> {
    CertBuf::from_slice(data).map_err(|_| ErrorCode::NoSpace.into())
}

/// CompressedFabricId = HKDF(salt = fabric id, big-endian; ikm = root public
/// key without its format byte; info "CompressedFabric").
pub fn compressed_fabric_id(
    root_pubkey: &[u8],
    fabric_id: u64,
    out: &mut [u8],
) -> Result<(), Error> {
    const COMPRESSED_FABRIC_ID_INFO: &[u8] = b"CompressedFabric";

    let root_pubkey = root_pubkey.get(1..).ok_or(ErrorCode::InvalidData)?;
    hkdf_sha256(
        &fabric_id.to_be_bytes(),
        root_pubkey,
        COMPRESSED_FABRIC_ID_INFO,
        out,
    )
}

/// The persisted summary of which fabric indices are in use.
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq)]
pub struct FabricList {
    pub first: u8,
    pub last: u8,
    pub count: u8,
}

impl<'a> FromTLV<'a> for FabricList {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        t.confirm_struct()?;

        Ok(Self {
            first: t.ctx(1)?,
            last: t.ctx(2)?,
            count: t.ctx(3)?,
        })
    }
}

impl ToTLV for FabricList {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.start_struct(tag)?;
        tw.u8(TagType::Context(1), self.first)?;
        tw.u8(TagType::Context(2), self.last)?;
        tw.u8(TagType::Context(3), self.count)?;
        tw.end_container()
    }
}

pub struct FabricMgr {
    fabrics: heapless::Vec<Fabric, MAX_SUPPORTED_FABRICS>,
    next_idx: u8,
    changed: bool,
}

impl Default for FabricMgr {
    fn default() -> Self {
        Self::new()
    }
}

impl FabricMgr {
    pub const fn new() -> Self {
        Self {
            fabrics: heapless::Vec::new(),
            next_idx: 1,
            changed: false,
        }
    }

    pub fn is_changed(&self) -> bool {
        self.changed
    }

    pub fn is_empty(&self) -> bool {
        self.fabrics.is_empty()
    }

    pub fn len(&self) -> usize {
        self.fabrics.len()
    }

    /// Adds a fabric, returning the fabric index assigned to it. Indices are
    /// handed out in increasing order and only wrap around once 254 is
    /// reached, so a removed fabric's index is not immediately reused.
    pub fn add(&mut self, mut fabric: Fabric) -> Result<u8, Error> {
        if self.fabrics.is_full() {
            Err(ErrorCode::ResourceExhausted)?;
        }

        if self
            .fabrics
            .iter()
            .any(|f| f.fabric_id == fabric.fabric_id && f.root_ca == fabric.root_ca)
        {
            Err(ErrorCode::Duplicate)?;
        }

        let mut fab_idx = self.next_idx;
        while self.get(fab_idx).is_some() {
            fab_idx = next_fab_idx(fab_idx);
        }
        self.next_idx = next_fab_idx(fab_idx);

        fabric.fab_idx = fab_idx;
        info!("Adding fabric {}: {:?}", fab_idx, fabric);

        self.fabrics
            .push(fabric)
            .map_err(|_| ErrorCode::ResourceExhausted)?;
        self.changed = true;

        Ok(fab_idx)
    }

    pub fn remove(&mut self, fab_idx: u8) -> Result<Fabric, Error> {
        let pos = self
            .fabrics
            .iter()
            .position(|f| f.fab_idx == fab_idx)
            .ok_or(ErrorCode::NoFabric)?;

        info!("Removing fabric {}", fab_idx);
        self.changed = true;

        Ok(self.fabrics.swap_remove(pos))
    }

    pub fn get(&self, fab_idx: u8) -> Option<&Fabric> {
        self.fabrics.iter().find(|f| f.fab_idx == fab_idx)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fabric> {
        self.fabrics.iter()
    }

    /// Finds the fabric a Sigma1 destination identifier addresses.
    pub fn match_dest_id(&self, random: &[u8], target: &[u8]) -> Result<u8, Error> {
        self.fabrics
            .iter()
            .find(|f| f.match_dest_id(random, target).is_ok())
            .map(|f| f.fab_idx)
            .ok_or(ErrorCode::NotFound.into())
    }

    pub fn set_label(&mut self, fab_idx: u8, label: &str) -> Result<(), Error> {
        if !label.is_empty()
            && self
                .fabrics
                .iter()
                .any(|f| f.fab_idx != fab_idx && f.label == label)
        {
            Err(ErrorCode::Invalid)?;
        }

        let fabric = self
            .fabrics
            .iter_mut()
            .find(|f| f.fab_idx == fab_idx)
            .ok_or(ErrorCode::NoFabric)?;
        fabric.label = label.try_into().map_err(|_| ErrorCode::InvalidArgument)?;
        self.changed = true;

        Ok(())
    }

    pub fn fabric_list(&self) -> FabricList {
        let indices = || self.fabrics.iter().map(|f| f.fab_idx);

        FabricList {
            first: indices().min().unwrap_or(0),
            last: indices().max().unwrap_or(0),
            count: self.fabrics.len() as u8,
        }
    }

    /// Writes the fabric records and the fabric list, and drops the records
    /// of fabrics removed since the previous store.
    pub fn store(&mut self, kv: &mut dyn KvStore) -> Result<(), Error> {
        if !self.changed {
            return Ok(());
        }

        let mut buf = [0; MAX_FABRIC_TLV_LEN];

        let mut prev_buf = [0; 16];
        if let Some(data) = kv.load(keys::FABRIC_LIST, &mut prev_buf)? {
            let prev = FabricList::from_tlv(&get_root_node_struct(data)?)?;
            if prev.count > 0 {
                for fab_idx in prev.first..=prev.last {
                    if self.get(fab_idx).is_none() {
                        kv.remove(&keys::fabric(fab_idx))?;
                    }
                }
            }
        }

        for fabric in &self.fabrics {
            let len = fabric.store(&mut buf)?;
            kv.store(&keys::fabric(fabric.fab_idx), &buf[..len])?;
        }

        let mut wb = WriteBuf::new(&mut buf);
        self.fabric_list()
            .to_tlv(&mut TLVWriter::new(&mut wb), TagType::Anonymous)?;
        kv.store(keys::FABRIC_LIST, wb.as_slice())?;

        self.changed = false;

        Ok(())
    }

    pub fn load(&mut self, kv: &dyn KvStore) -> Result<(), Error> {
        self.fabrics.clear();

        let mut buf = [0; MAX_FABRIC_TLV_LEN];

        let list = match kv.load(keys::FABRIC_LIST, &mut buf)? {
            Some(data) => FabricList::from_tlv(&get_root_node_struct(data)?)?,
            None => FabricList::default(),
        };

        if list.count > 0 {
            for fab_idx in list.first..=list.last {
                if let Some(data) = kv.load(&keys::fabric(fab_idx), &mut buf)? {
                    self.fabrics
                        .push(Fabric::load(fab_idx, data)?)
                        .map_err(|_| ErrorCode::ResourceExhausted)?;
                }
            }
        }

        if self.fabrics.len() != list.count as usize {
            warn!(
                "Fabric list expects {} fabrics, found {}",
                list.count,
                self.fabrics.len()
            );
        }

        self.next_idx = next_fab_idx(list.last);
        self.changed = false;

        info!("Loaded {} fabrics", self.fabrics.len());

        Ok(())
    }
}

fn next_fab_idx(fab_idx: u8) -> u8 {
    if fab_idx >= 254 {
        1
    } else {
        fab_idx + 1
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::persist::MemKvStore;
    use crate::sc::cert::tests::{noc, root_cert};
    use crate::utils::rand::sys_rand;

    pub fn test_fabric(fabric_id: u64, node_id: u64) -> Fabric {
        let chain = root_cert(1);
        let key = KeyPair::new(sys_rand);
        let noc = noc(&chain, 1, fabric_id, node_id, &key);

        Fabric::new(key, &chain.root, None, &noc, &[0x11; 16], 0xfff1, "").unwrap()
    }

    #[test]
    fn dest_id_matches_own_node_only() {
        let fabric = test_fabric(0x2906, 0x0a);
        let random = [7; 32];

        let mut id = [0; 32];
        fabric.dest_id(&random, 0x0a, &mut id).unwrap();
        fabric.match_dest_id(&random, &id).unwrap();

        fabric.dest_id(&random, 0x0b, &mut id).unwrap();
        assert!(fabric.match_dest_id(&random, &id).is_err());
    }

    #[test]
    fn wrong_operational_key_rejected() {
        let chain = root_cert(1);
        let noc = noc(&chain, 1, 1, 2, &KeyPair::new(sys_rand));

        let key = KeyPair::new(sys_rand);
        assert!(Fabric::new(key, &chain.root, None, &noc, &[0; 16], 0, "").is_err());
    }

    #[test]
    fn indices_are_not_reused_right_away() {
        let mut mgr = FabricMgr::new();

        assert_eq!(mgr.add(test_fabric(1, 1)).unwrap(), 1);
        assert_eq!(mgr.add(test_fabric(2, 1)).unwrap(), 2);
        mgr.remove(1).unwrap();
        assert_eq!(mgr.add(test_fabric(3, 1)).unwrap(), 3);

        assert_eq!(
            mgr.fabric_list(),
            FabricList {
                first: 2,
                last: 3,
                count: 2
            }
        );
    }

    #[test]
    fn table_full() {
        let mut mgr = FabricMgr::new();
        for i in 0..MAX_SUPPORTED_FABRICS {
            mgr.add(test_fabric(i as u64 + 1, 1)).unwrap();
        }

        assert_eq!(
            mgr.add(test_fabric(100, 1)).unwrap_err().code(),
            ErrorCode::ResourceExhausted
        );
    }

    #[test]
    fn store_and_load() {
        let mut kv = MemKvStore::new();
        let mut mgr = FabricMgr::new();

        mgr.add(test_fabric(1, 0x10)).unwrap();
        mgr.add(test_fabric(2, 0x20)).unwrap();
        mgr.set_label(2, "kitchen").unwrap();
        mgr.store(&mut kv).unwrap();
        assert!(!mgr.is_changed());

        mgr.remove(1).unwrap();
        mgr.store(&mut kv).unwrap();
        assert!(!kv.contains(&keys::fabric(1)));

        let mut loaded = FabricMgr::new();
        loaded.load(&kv).unwrap();

        assert_eq!(loaded.len(), 1);
        let fabric = loaded.get(2).unwrap();
        assert_eq!(fabric.node_id(), 0x20);
        assert_eq!(fabric.label(), "kitchen");
        assert_eq!(fabric.compressed_id(), mgr.get(2).unwrap().compressed_id());
        assert_eq!(loaded.add(test_fabric(3, 1)).unwrap(), 3);
    }
}
