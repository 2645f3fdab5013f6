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

//! The interaction model: reads, subscriptions, writes and invokes carried
//! over exchanges and answered from a data model [`Provider`].
//!
//! [`Provider`]: crate::dm::Provider

use core::fmt;

use num::FromPrimitive;
use num_derive::FromPrimitive;

use crate::dm::{AttrId, ClusterId, CmdId, EndptId};
use crate::error::*;
use crate::tlv::{FromTLV, Nullable, TLVElement, TLVWriter, TagType, ToTLV};
use crate::transport::exchange::MessageMeta;
use crate::utils::storage::WriteBuf;

pub use engine::*;
pub use path::*;

pub mod engine;
pub mod invoke;
pub mod path;
pub mod report;
pub mod resumption;
pub mod write;

pub const PROTO_ID_INTERACTION_MODEL: u16 = 0x01;

/// Revision of the interaction model we speak, sent under tag 0xFF of
/// every message.
pub const IM_REVISION: u8 = 11;
pub const IM_REVISION_TAG: u8 = 0xFF;

pub type EventId = u32;

#[derive(FromPrimitive, Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpCode {
    Reserved = 0,
    StatusResponse = 1,
    ReadRequest = 2,
    SubscribeRequest = 3,
    SubscribeResponse = 4,
    ReportData = 5,
    WriteRequest = 6,
    WriteResponse = 7,
    InvokeRequest = 8,
    InvokeResponse = 9,
    TimedRequest = 10,
}

impl OpCode {
    pub fn meta(&self) -> MessageMeta {
        MessageMeta {
            proto_id: PROTO_ID_INTERACTION_MODEL,
            proto_opcode: *self as u8,
            reliable: true,
        }
    }
}

impl From<OpCode> for MessageMeta {
    fn from(opcode: OpCode) -> Self {
        opcode.meta()
    }
}

#[derive(FromPrimitive, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IMStatusCode {
    Success = 0,
    Failure = 1,
    InvalidSubscription = 0x7D,
    UnsupportedAccess = 0x7E,
    UnsupportedEndpoint = 0x7F,
    InvalidAction = 0x80,
    UnsupportedCommand = 0x81,
    InvalidCommand = 0x85,
    UnsupportedAttribute = 0x86,
    ConstraintError = 0x87,
    UnsupportedWrite = 0x88,
    ResourceExhausted = 0x89,
    NotFound = 0x8b,
    UnreportableAttribute = 0x8c,
    InvalidDataType = 0x8d,
    UnsupportedRead = 0x8f,
    DataVersionMismatch = 0x92,
    Timeout = 0x94,
    Busy = 0x9c,
    UnsupportedCluster = 0xc3,
    NoUpstreamSubscription = 0xc5,
    NeedsTimedInteraction = 0xc6,
    UnsupportedEvent = 0xc7,
    PathsExhausted = 0xc8,
    TimedRequestMisMatch = 0xc9,
}

impl From<ErrorCode> for IMStatusCode {
    fn from(e: ErrorCode) -> Self {
        match e {
            ErrorCode::EndpointNotFound => IMStatusCode::UnsupportedEndpoint,
            ErrorCode::ClusterNotFound => IMStatusCode::UnsupportedCluster,
            ErrorCode::AttributeNotFound => IMStatusCode::UnsupportedAttribute,
            ErrorCode::CommandNotFound => IMStatusCode::UnsupportedCommand,
            ErrorCode::InvalidAction => IMStatusCode::InvalidAction,
            ErrorCode::InvalidCommand | ErrorCode::TLVNotFound => IMStatusCode::InvalidCommand,
            ErrorCode::InvalidDataType | ErrorCode::TLVTypeMismatch => {
                IMStatusCode::InvalidDataType
            }
            ErrorCode::UnsupportedAccess => IMStatusCode::UnsupportedAccess,
            ErrorCode::UnsupportedWrite => IMStatusCode::UnsupportedWrite,
            ErrorCode::ConstraintError => IMStatusCode::ConstraintError,
            ErrorCode::NeedsTimedInteraction => IMStatusCode::NeedsTimedInteraction,
            ErrorCode::TimedRequestMismatch => IMStatusCode::TimedRequestMisMatch,
            ErrorCode::InvalidSubscription => IMStatusCode::InvalidSubscription,
            ErrorCode::NotFound => IMStatusCode::NotFound,
            ErrorCode::Timeout => IMStatusCode::Timeout,
            ErrorCode::Busy => IMStatusCode::Busy,
            ErrorCode::DataVersionMismatch => IMStatusCode::DataVersionMismatch,
            ErrorCode::ResourceExhausted | ErrorCode::NoSpace | ErrorCode::BufferTooSmall => {
                IMStatusCode::ResourceExhausted
            }
            _ => IMStatusCode::Failure,
        }
    }
}

impl From<Error> for IMStatusCode {
    fn from(value: Error) -> Self {
        Self::from(value.code())
    }
}

impl FromTLV<'_> for IMStatusCode {
    fn from_tlv(t: &TLVElement) -> Result<Self, Error> {
        FromPrimitive::from_u16(t.u16()?).ok_or_else(|| ErrorCode::Invalid.into())
    }
}

impl ToTLV for IMStatusCode {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.u16(tag, *self as u16)
    }
}

/// A path whose parts may each be wildcarded.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GenericPath {
    pub endpoint: Option<EndptId>,
    pub cluster: Option<ClusterId>,
    pub leaf: Option<u32>,
}

impl GenericPath {
    pub const fn new(
        endpoint: Option<EndptId>,
        cluster: Option<ClusterId>,
        leaf: Option<u32>,
    ) -> Self {
        Self {
            endpoint,
            cluster,
            leaf,
        }
    }

    /// The concrete endpoint, cluster and leaf, or an error if any of them is
    /// a wildcard.
    pub fn not_wildcard(&self) -> Result<(EndptId, ClusterId, u32), Error> {
        match *self {
            GenericPath {
                endpoint: Some(e),
                cluster: Some(c),
                leaf: Some(l),
            } => Ok((e, c, l)),
            _ => Err(ErrorCode::Invalid.into()),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.endpoint.is_none() || self.cluster.is_none() || self.leaf.is_none()
    }

    pub fn matches(&self, endpoint: EndptId, cluster: ClusterId, leaf: u32) -> bool {
        self.endpoint.map(|id| id == endpoint).unwrap_or(true)
            && self.cluster.map(|id| id == cluster).unwrap_or(true)
            && self.leaf.map(|id| id == leaf).unwrap_or(true)
    }

    /// Whether the path reaches into the given cluster.
    pub fn covers_cluster(&self, endpoint: EndptId, cluster: ClusterId) -> bool {
        self.endpoint.map(|id| id == endpoint).unwrap_or(true)
            && self.cluster.map(|id| id == cluster).unwrap_or(true)
    }
}

impl fmt::Display for GenericPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn part(f: &mut fmt::Formatter<'_>, v: Option<u32>) -> fmt::Result {
            match v {
                Some(v) => write!(f, "{:x}", v),
                None => write!(f, "*"),
            }
        }

        part(f, self.endpoint.map(u32::from))?;
        write!(f, "/")?;
        part(f, self.cluster)?;
        write!(f, "/")?;
        part(f, self.leaf)
    }
}

/// AttributePathIB: a TLV list.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttrPath {
    pub node: Option<u64>,
    pub endpoint: Option<EndptId>,
    pub cluster: Option<ClusterId>,
    pub attr: Option<AttrId>,
    /// Absent: the whole attribute. Null: append to a list.
    pub list_index: Option<Nullable<u16>>,
}

impl AttrPath {
    pub fn new(path: &GenericPath) -> Self {
        Self {
            endpoint: path.endpoint,
            cluster: path.cluster,
            attr: path.leaf,
            ..Default::default()
        }
    }

    pub fn to_gp(&self) -> GenericPath {
        GenericPath::new(self.endpoint, self.cluster, self.attr)
    }
}

impl<'a> FromTLV<'a> for AttrPath {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        t.confirm_list()?;

        Ok(Self {
            node: t.ctx(1)?,
            endpoint: t.ctx(2)?,
            cluster: t.ctx(3)?,
            attr: t.ctx(4)?,
            list_index: t.ctx(5)?,
        })
    }
}

impl ToTLV for AttrPath {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.start_list(tag)?;
        self.node.to_tlv(tw, TagType::Context(1))?;
        self.endpoint.to_tlv(tw, TagType::Context(2))?;
        self.cluster.to_tlv(tw, TagType::Context(3))?;
        self.attr.to_tlv(tw, TagType::Context(4))?;
        self.list_index.to_tlv(tw, TagType::Context(5))?;
        tw.end_container()
    }
}

/// CommandPathIB: a TLV list.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct CmdPath {
    pub endpoint: Option<EndptId>,
    pub cluster: Option<ClusterId>,
    pub cmd: Option<CmdId>,
}

impl CmdPath {
    pub const fn new(
        endpoint: Option<EndptId>,
        cluster: Option<ClusterId>,
        cmd: Option<CmdId>,
    ) -> Self {
        Self {
            endpoint,
            cluster,
            cmd,
        }
    }

    pub fn to_gp(&self) -> GenericPath {
        GenericPath::new(self.endpoint, self.cluster, self.cmd)
    }
}

impl<'a> FromTLV<'a> for CmdPath {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        t.confirm_list()?;

        Ok(Self {
            endpoint: t.ctx(0)?,
            cluster: t.ctx(1)?,
            cmd: t.ctx(2)?,
        })
    }
}

impl ToTLV for CmdPath {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.start_list(tag)?;
        self.endpoint.to_tlv(tw, TagType::Context(0))?;
        self.cluster.to_tlv(tw, TagType::Context(1))?;
        self.cmd.to_tlv(tw, TagType::Context(2))?;
        tw.end_container()
    }
}

/// EventPathIB: a TLV list.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventPath {
    pub node: Option<u64>,
    pub endpoint: Option<EndptId>,
    pub cluster: Option<ClusterId>,
    pub event: Option<EventId>,
    pub is_urgent: Option<bool>,
}

impl<'a> FromTLV<'a> for EventPath {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        t.confirm_list()?;

        Ok(Self {
            node: t.ctx(0)?,
            endpoint: t.ctx(1)?,
            cluster: t.ctx(2)?,
            event: t.ctx(3)?,
            is_urgent: t.ctx(4)?,
        })
    }
}

impl ToTLV for EventPath {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.start_list(tag)?;
        self.node.to_tlv(tw, TagType::Context(0))?;
        self.endpoint.to_tlv(tw, TagType::Context(1))?;
        self.cluster.to_tlv(tw, TagType::Context(2))?;
        self.event.to_tlv(tw, TagType::Context(3))?;
        self.is_urgent.to_tlv(tw, TagType::Context(4))?;
        tw.end_container()
    }
}

/// DataVersionFilterIB: skip a cluster whose data the client already has.
#[derive(Default, Clone, Copy, Debug, PartialEq, Eq)]
pub struct DataVersionFilter {
    pub endpoint: EndptId,
    pub cluster: ClusterId,
    pub data_ver: u32,
}

impl<'a> FromTLV<'a> for DataVersionFilter {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        t.confirm_struct()?;
        let path = t.find_ctx(0)?;
        path.confirm_list()?;

        Ok(Self {
            endpoint: path.ctx(1)?,
            cluster: path.ctx(2)?,
            data_ver: t.ctx(1)?,
        })
    }
}

impl ToTLV for DataVersionFilter {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.start_struct(tag)?;
        tw.start_list(TagType::Context(0))?;
        tw.u16(TagType::Context(1), self.endpoint)?;
        tw.u32(TagType::Context(2), self.cluster)?;
        tw.end_container()?;
        tw.u32(TagType::Context(1), self.data_ver)?;
        tw.end_container()
    }
}

/// StatusIB
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Status {
    pub status: IMStatusCode,
    pub cluster_status: Option<u16>,
}

impl Status {
    pub const fn new(status: IMStatusCode) -> Self {
        Self {
            status,
            cluster_status: None,
        }
    }
}

impl<'a> FromTLV<'a> for Status {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        Ok(Self {
            status: t.ctx(0)?,
            cluster_status: t.ctx(1)?,
        })
    }
}

impl ToTLV for Status {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.start_struct(tag)?;
        self.status.to_tlv(tw, TagType::Context(0))?;
        self.cluster_status.to_tlv(tw, TagType::Context(1))?;
        tw.end_container()
    }
}

/// AttributeStatusIB
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AttrStatus {
    pub path: AttrPath,
    pub status: Status,
}

impl AttrStatus {
    pub fn new(path: &GenericPath, status: IMStatusCode) -> Self {
        Self {
            path: AttrPath::new(path),
            status: Status::new(status),
        }
    }
}

impl<'a> FromTLV<'a> for AttrStatus {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        Ok(Self {
            path: t.ctx(0)?,
            status: t.ctx(1)?,
        })
    }
}

impl ToTLV for AttrStatus {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.start_struct(tag)?;
        self.path.to_tlv(tw, TagType::Context(0))?;
        self.status.to_tlv(tw, TagType::Context(1))?;
        tw.end_container()
    }
}

/// Writes a StatusResponseMessage.
pub fn write_status_response(wb: &mut WriteBuf, status: IMStatusCode) -> Result<(), Error> {
    let mut tw = TLVWriter::new(wb);

    tw.start_struct(TagType::Anonymous)?;
    status.to_tlv(&mut tw, TagType::Context(0))?;
    tw.u8(TagType::Context(IM_REVISION_TAG), IM_REVISION)?;
    tw.end_container()
}

pub fn parse_status_response(payload: &[u8]) -> Result<IMStatusCode, Error> {
    crate::tlv::get_root_node_struct(payload)?.ctx(0)
}
