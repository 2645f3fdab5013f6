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

use byteorder::{ByteOrder, LittleEndian};

use crate::error::*;

/// A bounded, append-mostly write buffer.
///
/// Headers are prepended into a reserved area in front of the payload, and a
/// trailer area can be held back from the writers with [`WriteBuf::shrink`] so
/// that closing tags (or a MIC) are guaranteed to fit once the payload is done.
#[derive(Debug)]
pub struct WriteBuf<'a> {
    buf: &'a mut [u8],
    buf_size: usize,
    start: usize,
    end: usize,
}

impl<'a> WriteBuf<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        let buf_size = buf.len();

        Self {
            buf,
            buf_size,
            start: 0,
            end: 0,
        }
    }

    pub fn get_start(&self) -> usize {
        self.start
    }

    pub fn get_tail(&self) -> usize {
        self.end
    }

    /// Drop everything written after `new_end`; used to roll back a partially
    /// encoded element.
    pub fn rewind_tail_to(&mut self, new_end: usize) {
        self.end = new_end.max(self.start);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf[self.start..self.end]
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buf[self.start..self.end]
    }

    /// Number of bytes that can still be appended.
    pub fn remaining(&self) -> usize {
        self.buf_size - self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn reserve(&mut self, reserve: usize) -> Result<(), Error> {
        if self.end != 0 || self.start != 0 || self.buf_size != self.buf.len() {
            Err(ErrorCode::Invalid.into())
        } else if reserve > self.buf_size {
            Err(ErrorCode::NoSpace.into())
        } else {
            self.start = reserve;
            self.end = reserve;
            Ok(())
        }
    }

    /// Hide `with` bytes at the end of the buffer from subsequent appends.
    pub fn shrink(&mut self, with: usize) -> Result<(), Error> {
        if self.end + with <= self.buf_size {
            self.buf_size -= with;
            Ok(())
        } else {
            Err(ErrorCode::NoSpace.into())
        }
    }

    /// Give back bytes previously hidden with [`WriteBuf::shrink`].
    pub fn expand(&mut self, by: usize) -> Result<(), Error> {
        if self.buf.len() - self.buf_size >= by {
            self.buf_size += by;
            Ok(())
        } else {
            Err(ErrorCode::NoSpace.into())
        }
    }

    pub fn prepend_with<F>(&mut self, size: usize, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Self),
    {
        if size <= self.start {
            f(self);
            self.start -= size;
            return Ok(());
        }
        Err(ErrorCode::NoSpace.into())
    }

    pub fn prepend(&mut self, src: &[u8]) -> Result<(), Error> {
        self.prepend_with(src.len(), |x| {
            let dst_slice = &mut x.buf[(x.start - src.len())..x.start];
            dst_slice.copy_from_slice(src);
        })
    }

    pub fn append_with<F>(&mut self, size: usize, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut Self),
    {
        if self.end + size <= self.buf_size {
            f(self);
            self.end += size;
            return Ok(());
        }
        Err(ErrorCode::NoSpace.into())
    }

    pub fn append(&mut self, src: &[u8]) -> Result<(), Error> {
        self.append_with(src.len(), |x| {
            x.buf[x.end..(x.end + src.len())].copy_from_slice(src);
        })
    }

    pub fn le_u8(&mut self, data: u8) -> Result<(), Error> {
        self.append_with(1, |x| {
            x.buf[x.end] = data;
        })
    }

    pub fn le_u16(&mut self, data: u16) -> Result<(), Error> {
        self.append_with(2, |x| {
            LittleEndian::write_u16(&mut x.buf[x.end..], data);
        })
    }

    pub fn le_u32(&mut self, data: u32) -> Result<(), Error> {
        self.append_with(4, |x| {
            LittleEndian::write_u32(&mut x.buf[x.end..], data);
        })
    }

    pub fn le_u64(&mut self, data: u64) -> Result<(), Error> {
        self.append_with(8, |x| {
            LittleEndian::write_u64(&mut x.buf[x.end..], data);
        })
    }

    pub fn le_uint(&mut self, nbytes: usize, data: u64) -> Result<(), Error> {
        self.append_with(nbytes, |x| {
            LittleEndian::write_uint(&mut x.buf[x.end..], data, nbytes);
        })
    }
}

#[cfg(test)]
mod tests {
    use super::WriteBuf;

    #[test]
    fn test_append_after_reserve() {
        let mut test_slice = [0; 12];
        let mut buf = WriteBuf::new(&mut test_slice);
        buf.reserve(3).unwrap();

        buf.le_u8(1).unwrap();
        buf.le_u16(0x0241).unwrap();
        buf.le_uint(3, 0x030201).unwrap();
        buf.prepend(&[0xa, 0xb]).unwrap();

        assert_eq!(buf.as_slice(), [0xa, 0xb, 1, 0x41, 0x02, 1, 2, 3]);
    }

    #[test]
    fn test_overrun_leaves_buffer_untouched() {
        let mut test_slice = [0; 8];
        let mut buf = WriteBuf::new(&mut test_slice[..5]);
        buf.reserve(1).unwrap();

        assert!(buf.le_u64(0xcafebabecafebabe).is_err());
        assert!(buf.le_u32(0xcafebabe).is_ok());
        assert!(buf.le_u8(1).is_err());
        assert_eq!(test_slice, [0, 0xbe, 0xba, 0xfe, 0xca, 0, 0, 0]);
    }

    #[test]
    fn test_shrink_holds_back_trailer() {
        let mut test_slice = [0; 8];
        let mut buf = WriteBuf::new(&mut test_slice);

        buf.shrink(2).unwrap();
        buf.le_u32(1).unwrap();
        buf.le_u16(2).unwrap();
        assert!(buf.le_u8(3).is_err());
        assert_eq!(buf.remaining(), 0);

        buf.expand(2).unwrap();
        buf.le_u16(0x1818).unwrap();
        assert_eq!(buf.as_slice(), [1, 0, 0, 0, 2, 0, 0x18, 0x18]);
        assert!(buf.expand(1).is_err());
    }

    #[test]
    fn test_rewind_tail() {
        let mut test_slice = [0; 20];
        let mut buf = WriteBuf::new(&mut test_slice);
        buf.reserve(5).unwrap();

        buf.le_u16(65).unwrap();

        let anchor = buf.get_tail();

        buf.append(&[0xaa, 0xbb, 0xcc]).unwrap();
        assert_eq!(buf.as_slice(), [65, 0, 0xaa, 0xbb, 0xcc]);

        buf.rewind_tail_to(anchor);
        buf.le_u16(66).unwrap();
        assert_eq!(buf.as_slice(), [65, 0, 66, 0]);

        // Never rewinds into the reserved header area
        buf.rewind_tail_to(0);
        assert!(buf.is_empty());
    }
}
