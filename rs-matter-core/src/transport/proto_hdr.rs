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

use core::fmt;

use log::{trace, warn};

use crate::crypto;
use crate::error::*;
use crate::utils::storage::{ParseBuf, WriteBuf};

use super::network::Address;

bitflags::bitflags! {
    #[repr(transparent)]
    #[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct ExchFlags: u8 {
        const VENDOR = 0x10;
        const SECEX = 0x08;
        const RELIABLE = 0x04;
        const ACK = 0x02;
        const INITIATOR = 0x01;
    }
}

impl fmt::Display for ExchFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut sep = false;
        for (flag, str) in [
            (Self::INITIATOR, "I"),
            (Self::ACK, "A"),
            (Self::RELIABLE, "R"),
            (Self::SECEX, "SX"),
            (Self::VENDOR, "V"),
        ] {
            if self.contains(flag) {
                if sep {
                    write!(f, "|")?;
                }
                write!(f, "{}", str)?;
                sep = true;
            }
        }

        Ok(())
    }
}

/// The (possibly encrypted) protocol header that follows the plain header.
#[derive(Debug, Clone, Default)]
pub struct ProtoHdr {
    pub exch_id: u16,
    exch_flags: ExchFlags,
    pub proto_id: u16,
    pub proto_opcode: u8,
    proto_vendor_id: u16,
    ack_msg_ctr: u32,
}

impl ProtoHdr {
    pub const fn new() -> Self {
        Self {
            exch_id: 0,
            exch_flags: ExchFlags::empty(),
            proto_id: 0,
            proto_opcode: 0,
            proto_vendor_id: 0,
            ack_msg_ctr: 0,
        }
    }

    pub fn opcode<T: num::FromPrimitive>(&self) -> Result<T, Error> {
        num::FromPrimitive::from_u8(self.proto_opcode).ok_or(ErrorCode::InvalidOpcode.into())
    }

    pub fn get_vendor(&self) -> Option<u16> {
        self.exch_flags
            .contains(ExchFlags::VENDOR)
            .then_some(self.proto_vendor_id)
    }

    pub fn is_reliable(&self) -> bool {
        self.exch_flags.contains(ExchFlags::RELIABLE)
    }

    pub fn set_reliable(&mut self, reliable: bool) {
        self.exch_flags.set(ExchFlags::RELIABLE, reliable);
    }

    pub fn get_ack(&self) -> Option<u32> {
        self.exch_flags
            .contains(ExchFlags::ACK)
            .then_some(self.ack_msg_ctr)
    }

    pub fn set_ack(&mut self, ack_msg_ctr: Option<u32>) {
        if let Some(ack_msg_ctr) = ack_msg_ctr {
            self.exch_flags |= ExchFlags::ACK;
            self.ack_msg_ctr = ack_msg_ctr;
        } else {
            self.exch_flags.remove(ExchFlags::ACK);
            self.ack_msg_ctr = 0;
        }
    }

    pub fn is_initiator(&self) -> bool {
        self.exch_flags.contains(ExchFlags::INITIATOR)
    }

    pub fn set_initiator(&mut self, initiator: bool) {
        self.exch_flags.set(ExchFlags::INITIATOR, initiator);
    }

    /// Drops the R and A flags when the medium is itself reliable.
    ///
    /// Incoming messages carrying them over such a medium are a protocol
    /// violation, which is logged but tolerated.
    pub fn adjust_reliability(&mut self, rx: bool, addr: &Address) {
        if addr.is_reliable() {
            if rx && (self.is_reliable() || self.get_ack().is_some()) {
                warn!("Reliability flags over a reliable transport will be ignored");
            }

            self.set_reliable(false);
            self.set_ack(None);
        }
    }

    pub fn decrypt_and_decode(
        &mut self,
        parsebuf: &mut ParseBuf,
        nonce: Option<&Nonce>,
        dec_key: Option<&[u8]>,
    ) -> Result<(), Error> {
        if let (Some(key), Some(nonce)) = (dec_key, nonce) {
            decrypt_in_place(nonce, parsebuf, key)?;
        }

        self.exch_flags = ExchFlags::from_bits(parsebuf.le_u8()?).ok_or(ErrorCode::Invalid)?;
        self.proto_opcode = parsebuf.le_u8()?;
        self.exch_id = parsebuf.le_u16()?;
        self.proto_id = parsebuf.le_u16()?;

        if self.exch_flags.contains(ExchFlags::VENDOR) {
            self.proto_vendor_id = parsebuf.le_u16()?;
        }
        if self.exch_flags.contains(ExchFlags::ACK) {
            self.ack_msg_ctr = parsebuf.le_u32()?;
        }
        if self.exch_flags.contains(ExchFlags::SECEX) {
            // Skip the secured extensions block
            let len = parsebuf.le_u16()? as usize;
            parsebuf.parse_head_with(len, |_| ())?;
        }

        trace!("[decode] {}", self);
        Ok(())
    }

    pub fn encode(&self, resp_buf: &mut WriteBuf) -> Result<(), Error> {
        trace!("[encode] {}", self);
        resp_buf.le_u8((self.exch_flags - ExchFlags::SECEX).bits())?;
        resp_buf.le_u8(self.proto_opcode)?;
        resp_buf.le_u16(self.exch_id)?;
        resp_buf.le_u16(self.proto_id)?;
        if let Some(vendor_id) = self.get_vendor() {
            resp_buf.le_u16(vendor_id)?;
        }
        if let Some(ack_msg_ctr) = self.get_ack() {
            resp_buf.le_u32(ack_msg_ctr)?;
        }
        Ok(())
    }
}

impl fmt::Display for ProtoHdr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.exch_flags.is_empty() {
            write!(f, "{},", self.exch_flags)?;
        }

        write!(
            f,
            "EID:{:x},PROTO:{:x},OP:{:x}",
            self.exch_id, self.proto_id, self.proto_opcode
        )?;

        if let Some(ack_msg_ctr) = self.get_ack() {
            write!(f, ",ACTR:{:x}", ack_msg_ctr)?;
        }

        if let Some(vendor_id) = self.get_vendor() {
            write!(f, ",VID:{:x}", vendor_id)?;
        }

        Ok(())
    }
}

/// The AES-CCM nonce: security flags, message counter and the sender's
/// node id.
pub type Nonce = [u8; crypto::AEAD_NONCE_LEN_BYTES];

pub fn nonce(sec_flags: u8, ctr: u32, sender_nodeid: u64) -> Nonce {
    let mut iv = [0; crypto::AEAD_NONCE_LEN_BYTES];
    iv[0] = sec_flags;
    iv[1..5].copy_from_slice(&ctr.to_le_bytes());
    iv[5..].copy_from_slice(&sender_nodeid.to_le_bytes());
    iv
}

/// Encrypts everything written to `writebuf` so far and appends the MIC.
/// `plain_hdr` is the encoded plain header, authenticated as AAD.
pub fn encrypt_in_place(
    nonce: &Nonce,
    plain_hdr: &[u8],
    writebuf: &mut WriteBuf,
    key: &[u8],
) -> Result<(), Error> {
    let tag_space = [0u8; crypto::AEAD_MIC_LEN_BYTES];
    writebuf.append(&tag_space)?;
    let cipher_text = writebuf.as_mut_slice();
    let len = cipher_text.len() - crypto::AEAD_MIC_LEN_BYTES;

    crypto::encrypt_in_place(key, nonce, plain_hdr, cipher_text, len)?;

    Ok(())
}

/// Decrypts the unparsed remainder of `parsebuf`, using the already parsed
/// plain header as AAD, and strips the MIC.
fn decrypt_in_place(nonce: &Nonce, parsebuf: &mut ParseBuf, key: &[u8]) -> Result<(), Error> {
    let (start, end) = parsebuf.slice_range();
    if end - start < crypto::AEAD_MIC_LEN_BYTES {
        Err(ErrorCode::TruncatedPacket)?;
    }

    let mut aad = [0_u8; super::plain_hdr::max_plain_hdr_len()];
    let aad_len = parsebuf.parsed_as_slice().len();
    aad[..aad_len].copy_from_slice(parsebuf.parsed_as_slice());

    crypto::decrypt_in_place(key, nonce, &aad[..aad_len], parsebuf.as_mut_slice())?;
    parsebuf.tail(crypto::AEAD_MIC_LEN_BYTES)?;

    Ok(())
}

pub const fn max_proto_hdr_len() -> usize {
    // exchange flags
    1 +
    // protocol opcode
        1 +
    // exchange ID
        2 +
    // protocol ID
        2 +
    // [optional] protocol vendor ID
        2 +
    // [optional] acknowledged message counter
        4
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decrypt_success() {
        // Captured from a chip-tool run
        let recvd_ctr = 15287282;
        let mut input_buf: [u8; 71] = [
            0x0, 0x2, 0x0, 0x0, 0xf2, 0x43, 0xe9, 0x0, 0x31, 0xb5, 0x66, 0xec, 0x8b, 0x5b, 0xf4,
            0x17, 0xe4, 0x80, 0xf3, 0xd5, 0x11, 0x59, 0x19, 0xb5, 0x23, 0x91, 0x35, 0x37, 0xb,
            0xf9, 0xbf, 0x69, 0x55, 0x11, 0x75, 0x87, 0x77, 0x19, 0xfc, 0xf3, 0x5d, 0x4b, 0x47,
            0x1f, 0xb0, 0x5e, 0xbe, 0xb5, 0x10, 0xad, 0xc6, 0x78, 0x94, 0x50, 0xe5, 0xd2, 0xe0,
            0x80, 0xef, 0xa8, 0x3a, 0xf0, 0xa6, 0xaf, 0x1b, 0x2, 0x35, 0xa7, 0xd1, 0xc6, 0x32,
        ];
        let mut parsebuf = ParseBuf::new(&mut input_buf);
        let key = [
            0x66, 0x63, 0x31, 0x97, 0x43, 0x9c, 0x17, 0xb9, 0x7e, 0x10, 0xee, 0x47, 0xc8, 0x8,
            0x80, 0x4a,
        ];

        let mut plain = super::super::plain_hdr::PlainHdr::new();
        plain.decode(&mut parsebuf).unwrap();
        assert_eq!(plain.ctr, recvd_ctr);

        let mut proto = ProtoHdr::new();
        proto
            .decrypt_and_decode(&mut parsebuf, Some(&nonce(0, recvd_ctr, 0)), Some(&key))
            .unwrap();
        assert_eq!(proto.proto_id, 1);
        assert_eq!(proto.proto_opcode, 8);
        assert_eq!(proto.exch_id, 0x70);
        assert!(proto.is_reliable());
        assert!(proto.is_initiator());
        assert_eq!(
            parsebuf.as_slice(),
            [
                0x15, 0x28, 0x0, 0x28, 0x1, 0x36, 0x2, 0x15, 0x37, 0x0, 0x24, 0x0, 0x0, 0x24, 0x1,
                0x30, 0x24, 0x2, 0x2, 0x18, 0x35, 0x1, 0x24, 0x0, 0x0, 0x2c, 0x1, 0x2, 0x57, 0x57,
                0x24, 0x2, 0x3, 0x25, 0x3, 0xb8, 0xb, 0x18, 0x18, 0x18, 0x18
            ]
        );
    }

    #[test]
    fn encrypt_success() {
        // Captured from a chip-tool run
        let send_ctr = 41;

        let mut main_buf: [u8; 52] = [0; 52];
        let mut writebuf = WriteBuf::new(&mut main_buf);

        let plain_hdr: [u8; 8] = [0x0, 0x11, 0x0, 0x0, 0x29, 0x0, 0x0, 0x0];

        let plain_text: [u8; 28] = [
            5, 8, 0x58, 0x28, 0x01, 0x00, 0x15, 0x36, 0x00, 0x15, 0x37, 0x00, 0x24, 0x00, 0x01,
            0x24, 0x02, 0x06, 0x24, 0x03, 0x01, 0x18, 0x35, 0x01, 0x18, 0x18, 0x18, 0x18,
        ];
        writebuf.append(&plain_text).unwrap();

        let key = [
            0x44, 0xd4, 0x3c, 0x91, 0xd2, 0x27, 0xf3, 0xba, 0x08, 0x24, 0xc5, 0xd8, 0x7c, 0xb8,
            0x1b, 0x33,
        ];

        encrypt_in_place(&nonce(0, send_ctr, 0), &plain_hdr, &mut writebuf, &key).unwrap();
        assert_eq!(
            writebuf.as_slice(),
            [
                189, 83, 250, 121, 38, 87, 97, 17, 153, 78, 243, 20, 36, 11, 131, 142, 136, 165,
                227, 107, 204, 129, 193, 153, 42, 131, 138, 254, 22, 190, 76, 244, 116, 45, 156,
                215, 229, 130, 215, 147, 73, 21, 88, 216
            ]
        );
    }

    #[test]
    fn mic_mismatch_is_rejected() {
        let key = [1; 16];
        let mut buf = [0; 64];
        let mut wb = WriteBuf::new(&mut buf);
        let hdr = [0u8, 1, 0, 0, 5, 0, 0, 0];
        wb.append(&hdr).unwrap();
        let mut body_buf = [0; 32];
        let mut body = WriteBuf::new(&mut body_buf);
        ProtoHdr::new().encode(&mut body).unwrap();
        encrypt_in_place(&nonce(0, 5, 0), &hdr, &mut body, &key).unwrap();
        wb.append(body.as_slice()).unwrap();

        let mut raw = wb.as_slice().to_vec();
        let last = raw.len() - 1;
        raw[last] ^= 0x80;

        let mut pb = ParseBuf::new(&mut raw);
        super::super::plain_hdr::PlainHdr::new()
            .decode(&mut pb)
            .unwrap();
        assert_eq!(
            ProtoHdr::new()
                .decrypt_and_decode(&mut pb, Some(&nonce(0, 5, 0)), Some(&key))
                .unwrap_err()
                .code(),
            ErrorCode::Crypto
        );
    }
}
