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

//! Operational certificates in their compact TLV form.
//!
//! A certificate is a TLV struct carrying the issuer and subject
//! distinguished names, the validity window, the subject's P-256 public key,
//! the basic constraints and an ECDSA signature. The signature covers the
//! TLV encoding of every other member, in order.

use core::fmt;

use log::error;

use crate::crypto::{KeyPair, EC_POINT_LEN_BYTES, EC_SIGNATURE_LEN_BYTES};
use crate::error::*;
use crate::tlv::{get_root_node_struct, OctetStr, TLVElement, TLVWriter, TagType};
use crate::utils::storage::WriteBuf;

pub const MAX_CERT_TLV_LEN: usize = 400;

pub type CertBuf = heapless::Vec<u8, MAX_CERT_TLV_LEN>;

const SIG_ALGO_ECDSA_WITH_SHA256: u8 = 1;
const PUBKEY_ALGO_EC: u8 = 1;
const CURVE_PRIME256V1: u8 = 1;

const MAX_DN_ATTRS: usize = 5;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
enum CertTag {
    Serial = 1,
    SignAlgo = 2,
    Issuer = 3,
    NotBefore = 4,
    NotAfter = 5,
    Subject = 6,
    PubKeyAlgo = 7,
    EcCurveId = 8,
    EcPubKey = 9,
    Extensions = 10,
    Signature = 11,
}

/// Distinguished name attributes, with their TLV context tags.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum DnAttr {
    NodeId(u64),
    FirmwareSignerId(u64),
    IcaId(u64),
    RcaId(u64),
    FabricId(u64),
    NocCat(u32),
}

impl DnAttr {
    fn tag(&self) -> u8 {
        match self {
            Self::NodeId(_) => 17,
            Self::FirmwareSignerId(_) => 18,
            Self::IcaId(_) => 19,
            Self::RcaId(_) => 20,
            Self::FabricId(_) => 21,
            Self::NocCat(_) => 22,
        }
    }

    fn from_tlv(e: &TLVElement) -> Result<Self, Error> {
        let TagType::Context(tag) = e.tag() else {
            return Err(ErrorCode::InvalidData.into());
        };

        Ok(match tag {
            17 => Self::NodeId(e.u64()?),
            18 => Self::FirmwareSignerId(e.u64()?),
            19 => Self::IcaId(e.u64()?),
            20 => Self::RcaId(e.u64()?),
            21 => Self::FabricId(e.u64()?),
            22 => Self::NocCat(e.u32()?),
            _ => Err(ErrorCode::InvalidData)?,
        })
    }

    fn to_tlv(&self, tw: &mut TLVWriter) -> Result<(), Error> {
        let tag = TagType::Context(self.tag());
        match *self {
            Self::NocCat(v) => tw.u32(tag, v),
            Self::NodeId(v)
            | Self::FirmwareSignerId(v)
            | Self::IcaId(v)
            | Self::RcaId(v)
            | Self::FabricId(v) => tw.u64(tag, v),
        }
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DistNames {
    attrs: heapless::Vec<DnAttr, MAX_DN_ATTRS>,
}

impl DistNames {
    pub fn new(attrs: &[DnAttr]) -> Result<Self, Error> {
        Ok(Self {
            attrs: heapless::Vec::from_slice(attrs).map_err(|_| ErrorCode::NoSpace)?,
        })
    }

    fn parse(e: &TLVElement) -> Result<Self, Error> {
        e.confirm_list()?;

        let mut attrs = heapless::Vec::new();
        for attr in e.enter()? {
            attrs
                .push(DnAttr::from_tlv(&attr?)?)
                .map_err(|_| ErrorCode::NoSpace)?;
        }

        Ok(Self { attrs })
    }

    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.start_list(tag)?;
        for attr in &self.attrs {
            attr.to_tlv(tw)?;
        }
        tw.end_container()
    }

    fn find<T>(&self, f: impl Fn(&DnAttr) -> Option<T>) -> Option<T> {
        self.attrs.iter().find_map(f)
    }

    pub fn node_id(&self) -> Option<u64> {
        self.find(|a| match a {
            DnAttr::NodeId(v) => Some(*v),
            _ => None,
        })
    }

    pub fn fabric_id(&self) -> Option<u64> {
        self.find(|a| match a {
            DnAttr::FabricId(v) => Some(*v),
            _ => None,
        })
    }

    pub fn ca_id(&self) -> Option<u64> {
        self.find(|a| match a {
            DnAttr::RcaId(v) | DnAttr::IcaId(v) => Some(*v),
            _ => None,
        })
    }
}

/// A parsed certificate, borrowing its encoding.
pub struct Cert<'a> {
    raw: &'a [u8],
    serial: &'a [u8],
    issuer: DistNames,
    subject: DistNames,
    not_before: u32,
    not_after: u32,
    pubkey: &'a [u8],
    is_ca: bool,
    signature: &'a [u8],
}

impl<'a> Cert<'a> {
    pub fn new(raw: &'a [u8]) -> Result<Self, Error> {
        let root = get_root_node_struct(raw)?;

        if root.ctx::<u8>(CertTag::SignAlgo as u8)? != SIG_ALGO_ECDSA_WITH_SHA256
            || root.ctx::<u8>(CertTag::PubKeyAlgo as u8)? != PUBKEY_ALGO_EC
            || root.ctx::<u8>(CertTag::EcCurveId as u8)? != CURVE_PRIME256V1
        {
            error!("Unsupported certificate algorithm");
            Err(ErrorCode::InvalidData)?;
        }

        let pubkey = root.ctx::<OctetStr>(CertTag::EcPubKey as u8)?.0;
        let signature = root.ctx::<OctetStr>(CertTag::Signature as u8)?.0;
        if pubkey.len() != EC_POINT_LEN_BYTES || signature.len() != EC_SIGNATURE_LEN_BYTES {
            Err(ErrorCode::InvalidData)?;
        }

        let is_ca = match root.find_ctx(CertTag::Extensions as u8) {
            Ok(ext) => ext
                .find_ctx(1)
                .and_then(|bc| bc.ctx::<Option<bool>>(1))?
                .unwrap_or(false),
            Err(_) => false,
        };

        Ok(Self {
            raw,
            serial: root.ctx::<OctetStr>(CertTag::Serial as u8)?.0,
            issuer: DistNames::parse(&root.find_ctx(CertTag::Issuer as u8)?)?,
            subject: DistNames::parse(&root.find_ctx(CertTag::Subject as u8)?)?,
            not_before: root.ctx(CertTag::NotBefore as u8)?,
            not_after: root.ctx(CertTag::NotAfter as u8)?,
            pubkey,
            is_ca,
            signature,
        })
    }

    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    pub fn serial(&self) -> &'a [u8] {
        self.serial
    }

    pub fn get_pubkey(&self) -> &'a [u8] {
        self.pubkey
    }

    pub fn subject(&self) -> &DistNames {
        &self.subject
    }

    pub fn issuer(&self) -> &DistNames {
        &self.issuer
    }

    pub fn is_ca(&self) -> bool {
        self.is_ca
    }

    pub fn validity(&self) -> (u32, u32) {
        (self.not_before, self.not_after)
    }

    pub fn get_node_id(&self) -> Result<u64, Error> {
        self.subject.node_id().ok_or(ErrorCode::NotFound.into())
    }

    pub fn get_fabric_id(&self) -> Result<u64, Error> {
        self.subject.fabric_id().ok_or(ErrorCode::NotFound.into())
    }

    /// Checks that `issuer` signed this certificate.
    pub fn verify_signed_by(&self, issuer: &Cert) -> Result<(), Error> {
        if !issuer.is_ca || issuer.subject.ca_id() != self.issuer.ca_id() {
            Err(ErrorCode::InvalidSignature)?;
        }

        let mut buf = [0; MAX_CERT_TLV_LEN];
        let len = self.tbs(&mut buf)?;

        KeyPair::new_from_public(issuer.pubkey)?.verify_msg(&buf[..len], self.signature)
    }

    /// Validates a node certificate against a root and an optional
    /// intermediate.
    pub fn verify_chain(&self, icac: Option<&Cert>, root: &Cert) -> Result<(), Error> {
        root.verify_signed_by(root)?;

        match icac {
            Some(icac) => {
                icac.verify_signed_by(root)?;
                self.verify_signed_by(icac)?;
            }
            None => self.verify_signed_by(root)?,
        }

        Ok(())
    }

    // Re-encodes the signed portion; parsing keeps it verbatim
    fn tbs(&self, buf: &mut [u8]) -> Result<usize, Error> {
        let root = get_root_node_struct(self.raw)?;

        let mut wb = WriteBuf::new(buf);
        let mut tw = TLVWriter::new(&mut wb);
        tw.start_struct(TagType::Anonymous)?;
        for e in root.enter()? {
            let e = e?;
            if !e.check_ctx_tag(CertTag::Signature as u8) {
                tw.raw(e.raw())?;
            }
        }
        tw.end_container()?;

        Ok(tw.get_tail())
    }
}

impl fmt::Display for Cert<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Cert {{ serial: {:02x?}, issuer: {:?}, subject: {:?}, ca: {} }}",
            self.serial, self.issuer.attrs, self.subject.attrs, self.is_ca
        )
    }
}

/// What goes into a new certificate.
pub struct CertBuilder<'a> {
    pub serial: &'a [u8],
    pub issuer: DistNames,
    pub subject: DistNames,
    pub not_before: u32,
    pub not_after: u32,
    pub pubkey: &'a [u8],
    pub is_ca: bool,
}

impl CertBuilder<'_> {
    /// Encodes the certificate and signs it with the issuer's key.
    pub fn sign(&self, issuer_key: &KeyPair) -> Result<CertBuf, Error> {
        let mut buf = [0; MAX_CERT_TLV_LEN];
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);

        tw.start_struct(TagType::Anonymous)?;
        tw.str8(TagType::Context(CertTag::Serial as u8), self.serial)?;
        tw.u8(TagType::Context(CertTag::SignAlgo as u8), SIG_ALGO_ECDSA_WITH_SHA256)?;
        self.issuer
            .to_tlv(&mut tw, TagType::Context(CertTag::Issuer as u8))?;
        tw.u32(TagType::Context(CertTag::NotBefore as u8), self.not_before)?;
        tw.u32(TagType::Context(CertTag::NotAfter as u8), self.not_after)?;
        self.subject
            .to_tlv(&mut tw, TagType::Context(CertTag::Subject as u8))?;
        tw.u8(TagType::Context(CertTag::PubKeyAlgo as u8), PUBKEY_ALGO_EC)?;
        tw.u8(TagType::Context(CertTag::EcCurveId as u8), CURVE_PRIME256V1)?;
        tw.str8(TagType::Context(CertTag::EcPubKey as u8), self.pubkey)?;
        tw.start_list(TagType::Context(CertTag::Extensions as u8))?;
        tw.start_struct(TagType::Context(1))?;
        tw.bool(TagType::Context(1), self.is_ca)?;
        tw.end_container()?;
        tw.end_container()?;
        tw.end_container()?;

        let tbs_len = tw.get_tail();
        let mut signature = [0; EC_SIGNATURE_LEN_BYTES];
        issuer_key.sign_msg(&buf[..tbs_len], &mut signature)?;

        // Splice the signature in before the closing tag of the struct
        let mut out = CertBuf::new();
        out.extend_from_slice(&buf[..tbs_len - 1])
            .map_err(|_| ErrorCode::NoSpace)?;

        let mut sig_buf = [0; EC_SIGNATURE_LEN_BYTES + 4];
        let mut wb = WriteBuf::new(&mut sig_buf);
        TLVWriter::new(&mut wb).str8(TagType::Context(CertTag::Signature as u8), &signature)?;
        out.extend_from_slice(wb.as_slice())
            .map_err(|_| ErrorCode::NoSpace)?;
        out.extend_from_slice(&buf[tbs_len - 1..tbs_len])
            .map_err(|_| ErrorCode::NoSpace)?;

        Ok(out)
    }
}
