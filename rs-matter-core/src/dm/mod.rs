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

//! Data model metadata and the [`Provider`] seam through which cluster
//! logic plugs into the interaction model.
//!
//! The interaction model never stores attribute values. It only knows the
//! shape of the node (its endpoints, their clusters, and the attributes and
//! commands of those) and asks the provider to read, write or invoke.

use core::fmt;

use bitflags::bitflags;
use num_derive::FromPrimitive;

use crate::error::{Error, ErrorCode};
use crate::im::{GenericPath, IMStatusCode};
use crate::tlv::{Nullable, TLVElement};

pub use encoder::*;

pub mod encoder;

pub type EndptId = u16;
pub type ClusterId = u32;
pub type AttrId = u32;
pub type CmdId = u32;

bitflags! {
    #[repr(transparent)]
    #[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Quality: u8 {
        const LIST = 0x01;
        const WRITABLE = 0x02;
        const FABRIC_SCOPED = 0x04;
        /// Writes are only accepted as part of a timed interaction
        const TIMED_WRITE = 0x08;
        const NULLABLE = 0x10;
        const FIXED = 0x20;
    }
}

/// Attributes every cluster carries, served by the interaction model itself
/// from the cluster metadata.
#[derive(FromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
pub enum GlobalElements {
    GeneratedCmdList = 0xFFF8,
    AcceptedCmdList = 0xFFF9,
    EventList = 0xFFFA,
    AttributeList = 0xFFFB,
    FeatureMap = 0xFFFC,
    ClusterRevision = 0xFFFD,
}

pub const GLOBAL_ATTRIBUTES: &[Attribute] = &[
    Attribute::new(GlobalElements::GeneratedCmdList as AttrId, Quality::LIST),
    Attribute::new(GlobalElements::AcceptedCmdList as AttrId, Quality::LIST),
    Attribute::new(GlobalElements::EventList as AttrId, Quality::LIST),
    Attribute::new(GlobalElements::AttributeList as AttrId, Quality::LIST),
    Attribute::new(GlobalElements::FeatureMap as AttrId, Quality::FIXED),
    Attribute::new(GlobalElements::ClusterRevision as AttrId, Quality::FIXED),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attribute {
    pub id: AttrId,
    pub quality: Quality,
}

impl Attribute {
    pub const fn new(id: AttrId, quality: Quality) -> Self {
        Self { id, quality }
    }

    pub fn is_global(id: AttrId) -> bool {
        id >= GlobalElements::GeneratedCmdList as AttrId
    }

    pub fn is_list(&self) -> bool {
        self.quality.contains(Quality::LIST)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}", self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    pub id: CmdId,
    /// The command sent back in response, if any
    pub resp_id: Option<CmdId>,
    pub timed: bool,
}

impl Command {
    pub const fn new(id: CmdId, resp_id: Option<CmdId>) -> Self {
        Self {
            id,
            resp_id,
            timed: false,
        }
    }

    pub const fn timed(self) -> Self {
        Self {
            timed: true,
            ..self
        }
    }
}

#[derive(Debug, Clone)]
pub struct Cluster<'a> {
    pub id: ClusterId,
    pub revision: u16,
    pub feature_map: u32,
    pub attributes: &'a [Attribute],
    pub commands: &'a [Command],
}

impl<'a> Cluster<'a> {
    pub const fn new(
        id: ClusterId,
        revision: u16,
        feature_map: u32,
        attributes: &'a [Attribute],
        commands: &'a [Command],
    ) -> Self {
        Self {
            id,
            revision,
            feature_map,
            attributes,
            commands,
        }
    }
}

impl fmt::Display for Cluster<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "id: {:x}, attrs [", self.id)?;
        for (index, attr) in self.attributes.iter().enumerate() {
            if index > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{}", attr)?;
        }
        write!(f, "], cmds {}", self.commands.len())
    }
}

#[derive(Debug, Clone)]
pub struct Endpoint<'a> {
    pub id: EndptId,
    pub clusters: &'a [Cluster<'a>],
}

impl<'a> Endpoint<'a> {
    pub const fn new(id: EndptId, clusters: &'a [Cluster<'a>]) -> Self {
        Self { id, clusters }
    }
}

pub fn find_endpoint<'e>(
    endpoints: &'e [Endpoint<'e>],
    id: EndptId,
) -> Result<&'e Endpoint<'e>, Error> {
    endpoints
        .iter()
        .find(|ep| ep.id == id)
        .ok_or_else(|| ErrorCode::EndpointNotFound.into())
}

pub fn find_cluster<'e>(
    endpoints: &'e [Endpoint<'e>],
    endpoint: EndptId,
    cluster: ClusterId,
) -> Result<&'e Cluster<'e>, Error> {
    find_endpoint(endpoints, endpoint)?
        .clusters
        .iter()
        .find(|cl| cl.id == cluster)
        .ok_or_else(|| ErrorCode::ClusterNotFound.into())
}

/// The attribute ids of a cluster in expansion order: its own attributes,
/// then the global ones it does not list itself.
pub fn attribute_ids(attributes: &[Attribute]) -> impl Iterator<Item = AttrId> + '_ {
    attributes.iter().map(|attr| attr.id).chain(
        GLOBAL_ATTRIBUTES
            .iter()
            .map(|attr| attr.id)
            .filter(|id| !attributes.iter().any(|attr| attr.id == *id)),
    )
}

/// Looks an attribute up among the cluster's own attributes, falling back
/// to the global ones.
pub fn find_attribute(attributes: &[Attribute], id: AttrId) -> Result<&Attribute, Error> {
    attributes
        .iter()
        .chain(GLOBAL_ATTRIBUTES.iter())
        .find(|attr| attr.id == id)
        .ok_or_else(|| ErrorCode::AttributeNotFound.into())
}

/// One concrete attribute being read or written.
#[derive(Debug, Clone)]
pub struct AttrDetails {
    pub endpoint_id: EndptId,
    pub cluster_id: ClusterId,
    pub attr_id: AttrId,
    pub list_index: Option<Nullable<u16>>,
    pub fab_idx: u8,
    /// Only entries of the accessing fabric should be reported
    pub fab_filter: bool,
    /// Reached through a wildcard path: errors are not reported
    pub wildcard: bool,
    pub timed: bool,
}

impl AttrDetails {
    pub fn path(&self) -> GenericPath {
        GenericPath::new(
            Some(self.endpoint_id),
            Some(self.cluster_id),
            Some(self.attr_id),
        )
    }
}

/// One concrete command being invoked.
#[derive(Debug, Clone)]
pub struct CmdDetails {
    pub endpoint_id: EndptId,
    pub cluster_id: ClusterId,
    pub cmd_id: CmdId,
    pub fab_idx: u8,
    pub wildcard: bool,
    pub timed: bool,
}

impl CmdDetails {
    pub fn path(&self) -> GenericPath {
        GenericPath::new(
            Some(self.endpoint_id),
            Some(self.cluster_id),
            Some(self.cmd_id),
        )
    }
}

/// The data model as seen by the interaction model.
///
/// All calls happen on the stack's thread with the stack lock held, so
/// implementations only need interior mutability, not synchronization.
pub trait Provider {
    /// Every endpoint of the node, in the order wildcard paths visit them.
    fn endpoints(&self) -> &[Endpoint<'_>];

    /// The attributes a cluster currently exposes, global ones excluded.
    fn attributes(&self, endpoint: EndptId, cluster: ClusterId) -> Result<&[Attribute], Error> {
        find_cluster(self.endpoints(), endpoint, cluster).map(|cl| cl.attributes)
    }

    fn accepted_commands(
        &self,
        endpoint: EndptId,
        cluster: ClusterId,
    ) -> Result<&[Command], Error> {
        find_cluster(self.endpoints(), endpoint, cluster).map(|cl| cl.commands)
    }

    /// The data version of a cluster, bumped on every change of any of its
    /// attributes.
    fn data_version(&self, _endpoint: EndptId, _cluster: ClusterId) -> u32 {
        0
    }

    /// Encodes the value of an attribute.
    ///
    /// An out-of-space error is not a failure: the interaction model sends
    /// what fits and calls again for the next chunk.
    fn read_attribute(
        &self,
        attr: &AttrDetails,
        encoder: AttrValueEncoder<'_, '_, '_>,
    ) -> Result<(), Error>;

    fn write_attribute(
        &self,
        _attr: &AttrDetails,
        _decoder: &AttrValueDecoder<'_>,
    ) -> Result<(), Error> {
        Err(ErrorCode::UnsupportedWrite.into())
    }

    /// Runs a command.
    ///
    /// `None` means a response or a status was already added to `handler`;
    /// a status is added by the caller otherwise.
    fn invoke(
        &self,
        _cmd: &CmdDetails,
        _fields: &TLVElement<'_>,
        _handler: &mut CommandHandler<'_, '_, '_>,
    ) -> Option<IMStatusCode> {
        Some(IMStatusCode::UnsupportedCommand)
    }
}

impl<T> Provider for &T
where
    T: Provider,
{
    fn endpoints(&self) -> &[Endpoint<'_>] {
        (**self).endpoints()
    }

    fn attributes(&self, endpoint: EndptId, cluster: ClusterId) -> Result<&[Attribute], Error> {
        (**self).attributes(endpoint, cluster)
    }

    fn accepted_commands(
        &self,
        endpoint: EndptId,
        cluster: ClusterId,
    ) -> Result<&[Command], Error> {
        (**self).accepted_commands(endpoint, cluster)
    }

    fn data_version(&self, endpoint: EndptId, cluster: ClusterId) -> u32 {
        (**self).data_version(endpoint, cluster)
    }

    fn read_attribute(
        &self,
        attr: &AttrDetails,
        encoder: AttrValueEncoder<'_, '_, '_>,
    ) -> Result<(), Error> {
        (**self).read_attribute(attr, encoder)
    }

    fn write_attribute(
        &self,
        attr: &AttrDetails,
        decoder: &AttrValueDecoder<'_>,
    ) -> Result<(), Error> {
        (**self).write_attribute(attr, decoder)
    }

    fn invoke(
        &self,
        cmd: &CmdDetails,
        fields: &TLVElement<'_>,
        handler: &mut CommandHandler<'_, '_, '_>,
    ) -> Option<IMStatusCode> {
        (**self).invoke(cmd, fields, handler)
    }
}

/// Serves the global attributes from what the provider enumerates.
pub fn read_global(
    provider: &dyn Provider,
    attr: &AttrDetails,
    encoder: AttrValueEncoder<'_, '_, '_>,
) -> Result<(), Error> {
    let (ep, cl) = (attr.endpoint_id, attr.cluster_id);
    let cluster = find_cluster(provider.endpoints(), ep, cl)?;
    let global: GlobalElements =
        num::FromPrimitive::from_u32(attr.attr_id).ok_or(ErrorCode::AttributeNotFound)?;

    match global {
        GlobalElements::GeneratedCmdList => {
            let cmds = provider.accepted_commands(ep, cl)?;
            encoder.encode_list(|le| {
                for id in cmds.iter().filter_map(|cmd| cmd.resp_id) {
                    le.encode(&id)?;
                }
                Ok(())
            })
        }
        GlobalElements::AcceptedCmdList => {
            let cmds = provider.accepted_commands(ep, cl)?;
            encoder.encode_list(|le| {
                for cmd in cmds {
                    le.encode(&cmd.id)?;
                }
                Ok(())
            })
        }
        // No events are reported
        GlobalElements::EventList => encoder.encode_list(|_| Ok(())),
        GlobalElements::AttributeList => {
            let attrs = provider.attributes(ep, cl)?;
            encoder.encode_list(|le| {
                for id in attribute_ids(attrs) {
                    le.encode(&id)?;
                }
                Ok(())
            })
        }
        GlobalElements::FeatureMap => encoder.encode(&cluster.feature_map),
        GlobalElements::ClusterRevision => encoder.encode(&cluster.revision),
    }
}
