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

//! The secure channel protocol: session establishment over PASE and CASE,
//! and the status reports that conclude them.

use num_derive::FromPrimitive;

use crate::error::*;
use crate::tlv::TLVWriter;
use crate::transport::exchange::{ExchangeCtx, MessageMeta};
use crate::utils::storage::WriteBuf;

use self::status_report::{GeneralCode, StatusReport};

pub mod case;
pub mod cert;
pub mod pairing;
pub mod pase;
pub mod spake2p;
pub mod status_report;

pub const PROTO_ID_SECURE_CHANNEL: u16 = 0x00;

#[derive(FromPrimitive, Debug, Copy, Clone, Eq, PartialEq)]
pub enum OpCode {
    MsgCounterSyncReq = 0x00,
    MsgCounterSyncResp = 0x01,
    MRPStandAloneAck = 0x10,
    PBKDFParamRequest = 0x20,
    PBKDFParamResponse = 0x21,
    PASEPake1 = 0x22,
    PASEPake2 = 0x23,
    PASEPake3 = 0x24,
    CASESigma1 = 0x30,
    CASESigma2 = 0x31,
    CASESigma3 = 0x32,
    CASESigma2Resume = 0x33,
    StatusReport = 0x40,
}

impl OpCode {
    pub fn meta(&self) -> MessageMeta {
        MessageMeta {
            proto_id: PROTO_ID_SECURE_CHANNEL,
            proto_opcode: *self as u8,
            reliable: !matches!(self, Self::MRPStandAloneAck),
        }
    }
}

impl From<OpCode> for MessageMeta {
    fn from(op: OpCode) -> Self {
        op.meta()
    }
}

#[derive(FromPrimitive, Debug, Copy, Clone, PartialEq, Eq)]
pub enum SCStatusCodes {
    SessionEstablishmentSuccess = 0,
    NoSharedTrustRoots = 1,
    InvalidParameter = 2,
    CloseSession = 3,
    Busy = 4,
    SessionNotFound = 5,
}

impl SCStatusCodes {
    pub fn reliable(&self) -> bool {
        // CloseSession and Busy are sent without the R flag raised
        !matches!(self, SCStatusCodes::CloseSession | SCStatusCodes::Busy)
    }

    pub fn as_report<'a>(&self, payload: &'a [u8]) -> StatusReport<'a> {
        let general_code = match self {
            SCStatusCodes::SessionEstablishmentSuccess => GeneralCode::Success,
            SCStatusCodes::CloseSession => GeneralCode::Success,
            SCStatusCodes::Busy => GeneralCode::Busy,
            SCStatusCodes::InvalidParameter
            | SCStatusCodes::NoSharedTrustRoots
            | SCStatusCodes::SessionNotFound => GeneralCode::Failure,
        };

        StatusReport {
            general_code,
            proto_id: PROTO_ID_SECURE_CHANNEL as u32,
            proto_code: *self as u16,
            proto_data: payload,
        }
    }

    /// The secure channel code carried by a report, if it is one of ours.
    pub fn from_report(report: &StatusReport) -> Option<Self> {
        if report.proto_id != PROTO_ID_SECURE_CHANNEL as u32 {
            return None;
        }

        num::FromPrimitive::from_u16(report.proto_code)
    }
}

pub fn sc_write(
    wb: &mut WriteBuf,
    status_code: SCStatusCodes,
    payload: &[u8],
) -> Result<(), Error> {
    status_code.as_report(payload).write(wb)
}

/// Sends a secure channel status report on the exchange.
pub fn complete_with_status(
    ctx: &mut ExchangeCtx,
    status_code: SCStatusCodes,
    payload: &[u8],
) -> Result<(), Error> {
    let meta = MessageMeta {
        reliable: status_code.reliable(),
        ..OpCode::StatusReport.meta()
    };

    ctx.send_with(meta, |wb| sc_write(wb, status_code, payload))
}

/// Encodes a TLV payload into `buf`, returning the encoded length.
pub(crate) fn write_tlv<F>(buf: &mut [u8], f: F) -> Result<usize, Error>
where
    F: FnOnce(&mut TLVWriter) -> Result<(), Error>,
{
    let mut wb = WriteBuf::new(buf);
    f(&mut TLVWriter::new(&mut wb))?;

    Ok(wb.as_slice().len())
}
