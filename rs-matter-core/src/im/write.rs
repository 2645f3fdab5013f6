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

//! WriteRequest handling.

use log::{debug, info};

use crate::dm::{find_attribute, AttrDetails, AttrValueDecoder, ListOperation, Quality};
use crate::error::{Error, ErrorCode};
use crate::tlv::{get_root_node_struct, Nullable, TLVElement, TLVWriter, TagType, ToTLV};
use crate::transport::exchange::{ExchangeCtx, RxMessage};
use crate::transport::network::MAX_TX_PACKET_SIZE;
use crate::utils::storage::WriteBuf;

use super::{
    AttrPath, AttrStatus, IMStatusCode, InteractionModel, OpCode, IM_REVISION, IM_REVISION_TAG,
    IM_RESPONSE_TIMEOUT,
};

enum WriteReqTag {
    SuppressResponse = 0,
    TimedRequest = 1,
    WriteRequests = 2,
    MoreChunked = 3,
}

enum AttrDataTag {
    DataVer = 0,
    Path = 1,
    Data = 2,
}

impl InteractionModel<'_> {
    pub(super) fn handle_write(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let root = get_root_node_struct(rx.payload)?;

        let suppress = root
            .ctx::<Option<bool>>(WriteReqTag::SuppressResponse as u8)?
            .unwrap_or(false);
        let request_timed = root
            .ctx::<Option<bool>>(WriteReqTag::TimedRequest as u8)?
            .unwrap_or(false);
        let more = root
            .ctx::<Option<bool>>(WriteReqTag::MoreChunked as u8)?
            .unwrap_or(false);

        let timed = self.take_timed(ctx, request_timed)?;
        if timed && more {
            self.extend_timed(ctx)?;
        }

        let fab_idx = ctx.session_info()?.fab_idx();

        let mut buf = [0; MAX_TX_PACKET_SIZE];
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);

        tw.start_struct(TagType::Anonymous)?;
        tw.start_array(TagType::Context(0))?;
        for data in root.find_ctx(WriteReqTag::WriteRequests as u8)?.enter()? {
            self.write_data(&mut tw, &data?, fab_idx, timed)?;
        }
        tw.end_container()?;
        tw.u8(TagType::Context(IM_REVISION_TAG), IM_REVISION)?;
        tw.end_container()?;

        // A chunked write is acknowledged chunk by chunk regardless
        if !suppress || more {
            ctx.send(OpCode::WriteResponse, wb.as_slice())?;
        }

        if more {
            ctx.set_response_timeout(Some(IM_RESPONSE_TIMEOUT))
        } else {
            ctx.close()
        }
    }

    /// Applies one AttributeDataIB and writes the AttributeStatusIB(s) for it.
    ///
    /// A wildcard endpoint writes every endpoint carrying the cluster. Only
    /// successes are reported for those.
    fn write_data(
        &self,
        tw: &mut TLVWriter,
        data: &TLVElement,
        fab_idx: u8,
        timed: bool,
    ) -> Result<(), Error> {
        let path: AttrPath = data.ctx(AttrDataTag::Path as u8)?;
        let dataver: Option<u32> = data.ctx(AttrDataTag::DataVer as u8)?;
        let value = data.find_ctx(AttrDataTag::Data as u8)?;
        let gp = path.to_gp();

        let (Some(cluster), Some(attr)) = (gp.cluster, gp.leaf) else {
            let status = if gp.cluster.is_none() {
                IMStatusCode::UnsupportedCluster
            } else {
                IMStatusCode::UnsupportedAttribute
            };
            return AttrStatus::new(&gp, status).to_tlv(tw, TagType::Anonymous);
        };

        let details = |endpoint_id, wildcard| AttrDetails {
            endpoint_id,
            cluster_id: cluster,
            attr_id: attr,
            list_index: path.list_index,
            fab_idx,
            fab_filter: false,
            wildcard,
            timed,
        };

        match gp.endpoint {
            Some(endpoint) => {
                let status = match self.write_one(&details(endpoint, false), dataver, value) {
                    Ok(()) => IMStatusCode::Success,
                    Err(e) => {
                        info!("Write of {} failed: {:?}", gp, e);
                        e.into()
                    }
                };
                AttrStatus::new(&gp, status).to_tlv(tw, TagType::Anonymous)
            }
            None => {
                let provider = self.provider();
                let endpoints = provider
                    .endpoints()
                    .iter()
                    .filter(|ep| ep.clusters.iter().any(|cl| cl.id == cluster))
                    .map(|ep| ep.id);

                for endpoint in endpoints {
                    let details = details(endpoint, true);
                    match self.write_one(&details, dataver, value) {
                        Ok(()) => AttrStatus::new(&details.path(), IMStatusCode::Success)
                            .to_tlv(tw, TagType::Anonymous)?,
                        Err(e) => debug!("Skipping {}: {:?}", details.path(), e),
                    }
                }

                Ok(())
            }
        }
    }

    fn write_one(
        &self,
        details: &AttrDetails,
        dataver: Option<u32>,
        value: TLVElement,
    ) -> Result<(), Error> {
        let provider = self.provider();
        let attributes = provider.attributes(details.endpoint_id, details.cluster_id)?;
        let attr = find_attribute(attributes, details.attr_id)?;

        if !attr.quality.contains(Quality::WRITABLE) {
            Err(ErrorCode::UnsupportedWrite)?;
        }
        if attr.quality.contains(Quality::TIMED_WRITE) && !details.timed {
            Err(ErrorCode::NeedsTimedInteraction)?;
        }
        if let Some(ver) = dataver {
            if ver != provider.data_version(details.endpoint_id, details.cluster_id) {
                Err(ErrorCode::DataVersionMismatch)?;
            }
        }

        let op = match details.list_index {
            None => ListOperation::Replace,
            Some(Nullable::Null) if attr.is_list() => ListOperation::Append,
            Some(_) => Err(ErrorCode::InvalidAction)?,
        };

        provider.write_attribute(details, &AttrValueDecoder::new(value, op))?;
        self.notify_changed(details.endpoint_id, details.cluster_id);

        Ok(())
    }
}
