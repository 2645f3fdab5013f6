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

use num_derive::FromPrimitive;

use crate::error::*;
use crate::utils::storage::{ParseBuf, WriteBuf};

#[derive(FromPrimitive, PartialEq, Eq, Debug, Copy, Clone)]
pub enum GeneralCode {
    Success = 0,
    Failure = 1,
    BadPrecondition = 2,
    OutOfRange = 3,
    BadRequest = 4,
    Unsupported = 5,
    Unexpected = 6,
    ResourceExhausted = 7,
    Busy = 8,
    Timeout = 9,
    Continue = 10,
    Aborted = 11,
    InvalidArgument = 12,
    NotFound = 13,
    AlreadyExists = 14,
    PermissionDenied = 15,
    DataLoss = 16,
}

/// A Status Report message: a general code, the protocol the report is
/// about, a protocol specific code and optional protocol specific data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport<'a> {
    pub general_code: GeneralCode,
    pub proto_id: u32,
    pub proto_code: u16,
    pub proto_data: &'a [u8],
}

impl<'a> StatusReport<'a> {
    pub const fn new(general_code: GeneralCode, proto_id: u32, proto_code: u16) -> Self {
        Self {
            general_code,
            proto_id,
            proto_code,
            proto_data: &[],
        }
    }

    pub fn read(pb: &'a ParseBuf) -> Result<Self, Error> {
        Self::decode(pb.as_slice())
    }

    /// Decodes a report from a message payload; anything after the fixed
    /// part is the protocol data.
    pub fn decode(data: &'a [u8]) -> Result<Self, Error> {
        if data.len() < 8 {
            Err(ErrorCode::TruncatedPacket)?;
        }

        let general_code = u16::from_le_bytes([data[0], data[1]]);

        Ok(Self {
            general_code: num::FromPrimitive::from_u16(general_code)
                .ok_or(ErrorCode::InvalidData)?,
            proto_id: u32::from_le_bytes([data[2], data[3], data[4], data[5]]),
            proto_code: u16::from_le_bytes([data[6], data[7]]),
            proto_data: &data[8..],
        })
    }

    pub fn write(&self, wb: &mut WriteBuf) -> Result<(), Error> {
        wb.le_u16(self.general_code as u16)?;
        wb.le_u32(self.proto_id)?;
        wb.le_u16(self.proto_code)?;
        wb.append(self.proto_data)?;

        Ok(())
    }

    pub fn is_success(&self) -> bool {
        self.general_code == GeneralCode::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_data() {
        let report = StatusReport::new(GeneralCode::Busy, 0, 4);

        let mut buf = [0; 32];
        let mut wb = WriteBuf::new(&mut buf);
        report.write(&mut wb).unwrap();
        assert_eq!(wb.as_slice(), [8, 0, 0, 0, 0, 0, 4, 0]);

        let decoded = StatusReport::decode(wb.as_slice()).unwrap();
        assert_eq!(decoded, report);
        assert!(decoded.proto_data.is_empty());
    }

    #[test]
    fn with_data() {
        let report = StatusReport {
            general_code: GeneralCode::Failure,
            proto_id: 0xfff1_0001,
            proto_code: 0x1234,
            proto_data: &[0xde, 0xad],
        };

        let mut buf = [0; 32];
        let mut wb = WriteBuf::new(&mut buf);
        report.write(&mut wb).unwrap();
        assert_eq!(
            wb.as_slice(),
            [1, 0, 0x01, 0x00, 0xf1, 0xff, 0x34, 0x12, 0xde, 0xad]
        );
        assert_eq!(StatusReport::decode(wb.as_slice()).unwrap(), report);
    }

    #[test]
    fn rejects_short_and_unknown() {
        assert_eq!(
            StatusReport::decode(&[0, 0, 0]).unwrap_err().code(),
            ErrorCode::TruncatedPacket
        );
        assert_eq!(
            StatusReport::decode(&[99, 0, 0, 0, 0, 0, 0, 0]).unwrap_err().code(),
            ErrorCode::InvalidData
        );
    }
}
