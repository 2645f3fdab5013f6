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

use crate::error::*;

/// A cursor over a received byte slice.
///
/// Headers are consumed from the front with the `le_*` accessors while a
/// trailing MIC can be split off with [`ParseBuf::tail`].
pub struct ParseBuf<'a> {
    buf: &'a mut [u8],
    read_off: usize,
    left: usize,
}

impl<'a> ParseBuf<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        let left = buf.len();

        Self {
            buf,
            read_off: 0,
            left,
        }
    }

    pub fn slice_range(&self) -> (usize, usize) {
        (self.read_off, self.read_off + self.left)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.read_off..(self.read_off + self.left)]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.read_off..(self.read_off + self.left)]
    }

    /// The part of the buffer that was already consumed.
    pub fn parsed_as_slice(&self) -> &[u8] {
        &self.buf[0..self.read_off]
    }

    pub fn tail(&mut self, size: usize) -> Result<&[u8], Error> {
        if size <= self.left {
            let end_offset = self.read_off + self.left;
            let tail = &self.buf[(end_offset - size)..end_offset];
            self.left -= size;
            return Ok(tail);
        }
        Err(ErrorCode::TruncatedPacket.into())
    }

    fn advance(&mut self, len: usize) {
        self.read_off += len;
        self.left -= len;
    }

    pub fn parse_head_with<F, R>(&mut self, size: usize, f: F) -> Result<R, Error>
    where
        F: FnOnce(&mut Self) -> R,
    {
        if self.left >= size {
            let data = f(self);
            self.advance(size);
            return Ok(data);
        }
        Err(ErrorCode::TruncatedPacket.into())
    }

    fn parse_as_array<const N: usize>(&mut self) -> Result<[u8; N], Error> {
        if self.left >= N {
            let mut out = [0; N];
            out.copy_from_slice(&self.buf[self.read_off..self.read_off + N]);
            self.advance(N);
            return Ok(out);
        }
        Err(ErrorCode::TruncatedPacket.into())
    }

    pub fn le_u8(&mut self) -> Result<u8, Error> {
        self.parse_head_with(1, |x| x.buf[x.read_off])
    }

    pub fn le_u16(&mut self) -> Result<u16, Error> {
        self.parse_as_array().map(u16::from_le_bytes)
    }

    pub fn le_u32(&mut self) -> Result<u32, Error> {
        self.parse_as_array().map(u32::from_le_bytes)
    }

    pub fn le_u64(&mut self) -> Result<u64, Error> {
        self.parse_as_array().map(u64::from_le_bytes)
    }
}
