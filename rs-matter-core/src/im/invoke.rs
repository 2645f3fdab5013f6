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

//! InvokeRequest handling.

use log::{debug, warn};

use crate::dm::{CmdDetails, CommandHandler, Provider};
use crate::error::{Error, ErrorCode};
use crate::tlv::{get_root_node_struct, TLVElement, TLVWriter, TagType};
use crate::transport::exchange::{ExchangeCtx, RxMessage};
use crate::transport::network::MAX_TX_PACKET_SIZE;
use crate::utils::storage::WriteBuf;

use super::{CmdPath, IMStatusCode, InteractionModel, OpCode, IM_REVISION, IM_REVISION_TAG};

enum InvokeReqTag {
    SuppressResponse = 0,
    TimedRequest = 1,
    InvokeRequests = 2,
}

enum InvokeRespTag {
    SuppressResponse = 0,
    InvokeResponses = 1,
}

/// An empty struct, for commands sent without fields.
const EMPTY_FIELDS: &[u8] = &[0x15, 0x18];

impl InteractionModel<'_> {
    pub(super) fn handle_invoke(&self, ctx: &mut ExchangeCtx, rx: &RxMessage) -> Result<(), Error> {
        let root = get_root_node_struct(rx.payload)?;

        let suppress = root
            .ctx::<Option<bool>>(InvokeReqTag::SuppressResponse as u8)?
            .unwrap_or(false);
        let request_timed = root
            .ctx::<Option<bool>>(InvokeReqTag::TimedRequest as u8)?
            .unwrap_or(false);
        let timed = self.take_timed(ctx, request_timed)?;

        let fab_idx = ctx.session_info()?.fab_idx();

        let mut buf = [0; MAX_TX_PACKET_SIZE];
        let mut wb = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut wb);

        tw.start_struct(TagType::Anonymous)?;
        tw.bool(TagType::Context(InvokeRespTag::SuppressResponse as u8), false)?;
        tw.start_array(TagType::Context(InvokeRespTag::InvokeResponses as u8))?;
        for cmd in root.find_ctx(InvokeReqTag::InvokeRequests as u8)?.enter()? {
            self.invoke_data(&mut tw, &cmd?, fab_idx, timed)?;
        }
        tw.end_container()?;
        tw.u8(TagType::Context(IM_REVISION_TAG), IM_REVISION)?;
        tw.end_container()?;

        if !suppress {
            ctx.send(OpCode::InvokeResponse, wb.as_slice())?;
        }

        ctx.close()
    }

    fn invoke_data(
        &self,
        tw: &mut TLVWriter,
        data: &TLVElement,
        fab_idx: u8,
        timed: bool,
    ) -> Result<(), Error> {
        let path: CmdPath = data.ctx(0)?;
        let fields = match data.ctx::<Option<TLVElement>>(1)? {
            Some(fields) => fields,
            None => TLVElement::new(EMPTY_FIELDS)?,
        };

        let (Some(cluster), Some(cmd)) = (path.cluster, path.cmd) else {
            return CommandHandler::new(tw, path).add_status(IMStatusCode::InvalidAction);
        };

        let details = |endpoint_id, wildcard| CmdDetails {
            endpoint_id,
            cluster_id: cluster,
            cmd_id: cmd,
            fab_idx,
            wildcard,
            timed,
        };

        match path.endpoint {
            Some(endpoint) => self.invoke_one(tw, &details(endpoint, false), &fields),
            None => {
                let provider = self.provider();
                let endpoints = provider
                    .endpoints()
                    .iter()
                    .filter(|ep| {
                        ep.clusters
                            .iter()
                            .any(|cl| cl.id == cluster && cl.commands.iter().any(|c| c.id == cmd))
                    })
                    .map(|ep| ep.id);

                for endpoint in endpoints {
                    self.invoke_one(tw, &details(endpoint, true), &fields)?;
                }

                Ok(())
            }
        }
    }

    fn invoke_one(
        &self,
        tw: &mut TLVWriter,
        details: &CmdDetails,
        fields: &TLVElement,
    ) -> Result<(), Error> {
        let provider = self.provider();
        let version = provider.data_version(details.endpoint_id, details.cluster_id);

        let path = CmdPath::new(
            Some(details.endpoint_id),
            Some(details.cluster_id),
            Some(details.cmd_id),
        );
        let mut handler = CommandHandler::new(tw, path);

        let status = match validate(provider, details) {
            Ok(()) => provider.invoke(details, fields, &mut handler),
            Err(e) => {
                debug!("Rejecting {}: {:?}", details.path(), e);
                Some(e.into())
            }
        };

        match (handler.has_response(), status) {
            (true, Some(status)) => {
                warn!("{} answered twice, dropping status {:?}", details.path(), status)
            }
            (true, None) => (),
            (false, Some(status)) => handler.add_status(status)?,
            (false, None) => {
                warn!("{} left without an answer", details.path());
                handler.add_status(IMStatusCode::Failure)?;
            }
        }

        if provider.data_version(details.endpoint_id, details.cluster_id) != version {
            self.notify_changed(details.endpoint_id, details.cluster_id);
        }

        Ok(())
    }
}

fn validate(provider: &dyn Provider, details: &CmdDetails) -> Result<(), Error> {
    let command = provider
        .accepted_commands(details.endpoint_id, details.cluster_id)?
        .iter()
        .find(|c| c.id == details.cmd_id)
        .ok_or(ErrorCode::CommandNotFound)?;

    if command.timed && !details.timed {
        Err(ErrorCode::NeedsTimedInteraction)?;
    }

    Ok(())
}
