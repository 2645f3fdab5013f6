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

use crate::error::{Error, ErrorCode};
use crate::utils::storage::WriteBuf;

use super::{TLVElement, ElementType, TagType, WireType, TAG_SHIFT_BITS, TAG_SIZE_MAP};

/// Encodes elements into a [`WriteBuf`].
///
/// Every element is written atomically: if it does not fit, the buffer is
/// left exactly as it was before the call. Integers are written in their
/// narrowest encoding.
pub struct TLVWriter<'a, 'b> {
    buf: &'a mut WriteBuf<'b>,
}

impl<'a, 'b> TLVWriter<'a, 'b> {
    pub fn new(buf: &'a mut WriteBuf<'b>) -> Self {
        TLVWriter { buf }
    }

    fn put(
        &mut self,
        tag: TagType,
        wire: WireType,
        len: Option<(usize, usize)>,
        data: &[u8],
    ) -> Result<(), Error> {
        let ctl = tag.control();
        let tag_size = TAG_SIZE_MAP[ctl as usize];
        let len_size = len.map(|(size, _)| size).unwrap_or(0);
        let total = 1 + tag_size + len_size + data.len();

        if self.buf.remaining() < total {
            Err(ErrorCode::NoSpace)?;
        }

        let anchor = self.buf.get_tail();
        let res = (|| {
            self.buf.le_u8((ctl << TAG_SHIFT_BITS) | wire as u8)?;
            if tag_size > 0 {
                self.buf.le_uint(tag_size, tag.value())?;
            }
            if let Some((size, val)) = len {
                self.buf.le_uint(size, val as u64)?;
            }
            self.buf.append(data)
        })();

        if res.is_err() {
            self.buf.rewind_tail_to(anchor);
        }

        res
    }

    pub fn i8(&mut self, tag: TagType, data: i8) -> Result<(), Error> {
        self.put(tag, WireType::S8, None, &data.to_le_bytes())
    }

    pub fn u8(&mut self, tag: TagType, data: u8) -> Result<(), Error> {
        self.put(tag, WireType::U8, None, &[data])
    }

    pub fn i16(&mut self, tag: TagType, data: i16) -> Result<(), Error> {
        if let Ok(v) = i8::try_from(data) {
            self.i8(tag, v)
        } else {
            self.put(tag, WireType::S16, None, &data.to_le_bytes())
        }
    }

    pub fn u16(&mut self, tag: TagType, data: u16) -> Result<(), Error> {
        if let Ok(v) = u8::try_from(data) {
            self.u8(tag, v)
        } else {
            self.put(tag, WireType::U16, None, &data.to_le_bytes())
        }
    }

    pub fn i32(&mut self, tag: TagType, data: i32) -> Result<(), Error> {
        if let Ok(v) = i16::try_from(data) {
            self.i16(tag, v)
        } else {
            self.put(tag, WireType::S32, None, &data.to_le_bytes())
        }
    }

    pub fn u32(&mut self, tag: TagType, data: u32) -> Result<(), Error> {
        if let Ok(v) = u16::try_from(data) {
            self.u16(tag, v)
        } else {
            self.put(tag, WireType::U32, None, &data.to_le_bytes())
        }
    }

    pub fn i64(&mut self, tag: TagType, data: i64) -> Result<(), Error> {
        if let Ok(v) = i32::try_from(data) {
            self.i32(tag, v)
        } else {
            self.put(tag, WireType::S64, None, &data.to_le_bytes())
        }
    }

    pub fn u64(&mut self, tag: TagType, data: u64) -> Result<(), Error> {
        if let Ok(v) = u32::try_from(data) {
            self.u32(tag, v)
        } else {
            self.put(tag, WireType::U64, None, &data.to_le_bytes())
        }
    }

    pub fn f32(&mut self, tag: TagType, data: f32) -> Result<(), Error> {
        self.put(tag, WireType::F32, None, &data.to_bits().to_le_bytes())
    }

    pub fn str8(&mut self, tag: TagType, data: &[u8]) -> Result<(), Error> {
        if data.len() > u8::MAX as usize {
            Err(ErrorCode::InvalidArgument)?;
        }
        self.put(tag, WireType::Str8l, Some((1, data.len())), data)
    }

    /// Octet string, picking the 1 or 2 byte length form.
    pub fn str16(&mut self, tag: TagType, data: &[u8]) -> Result<(), Error> {
        if data.len() <= u8::MAX as usize {
            self.str8(tag, data)
        } else if data.len() <= u16::MAX as usize {
            self.put(tag, WireType::Str16l, Some((2, data.len())), data)
        } else {
            Err(ErrorCode::InvalidArgument.into())
        }
    }

    pub fn utf8(&mut self, tag: TagType, data: &[u8]) -> Result<(), Error> {
        if data.len() > u8::MAX as usize {
            Err(ErrorCode::InvalidArgument)?;
        }
        self.put(tag, WireType::Utf8l, Some((1, data.len())), data)
    }

    pub fn utf16(&mut self, tag: TagType, data: &[u8]) -> Result<(), Error> {
        if data.len() <= u8::MAX as usize {
            self.utf8(tag, data)
        } else if data.len() <= u16::MAX as usize {
            self.put(tag, WireType::Utf16l, Some((2, data.len())), data)
        } else {
            Err(ErrorCode::InvalidArgument.into())
        }
    }

    pub fn start_struct(&mut self, tag: TagType) -> Result<(), Error> {
        self.put(tag, WireType::Struct, None, &[])
    }

    pub fn start_array(&mut self, tag: TagType) -> Result<(), Error> {
        self.put(tag, WireType::Array, None, &[])
    }

    pub fn start_list(&mut self, tag: TagType) -> Result<(), Error> {
        self.put(tag, WireType::List, None, &[])
    }

    pub fn end_container(&mut self) -> Result<(), Error> {
        self.put(TagType::Anonymous, WireType::EndCnt, None, &[])
    }

    pub fn null(&mut self, tag: TagType) -> Result<(), Error> {
        self.put(tag, WireType::Null, None, &[])
    }

    pub fn bool(&mut self, tag: TagType, val: bool) -> Result<(), Error> {
        let wire = if val { WireType::True } else { WireType::False };
        self.put(tag, wire, None, &[])
    }

    /// Re-encodes a parsed element under a new tag.
    pub fn element(&mut self, tag: TagType, e: &TLVElement) -> Result<(), Error> {
        let anchor = self.get_tail();
        let res = self.element_inner(tag, e);
        if res.is_err() {
            self.rewind_to(anchor);
        }
        res
    }

    fn element_inner(&mut self, tag: TagType, e: &TLVElement) -> Result<(), Error> {
        match e.element_type() {
            ElementType::S8(v) => self.i8(tag, v),
            ElementType::S16(v) => self.i16(tag, v),
            ElementType::S32(v) => self.i32(tag, v),
            ElementType::S64(v) => self.i64(tag, v),
            ElementType::U8(v) => self.u8(tag, v),
            ElementType::U16(v) => self.u16(tag, v),
            ElementType::U32(v) => self.u32(tag, v),
            ElementType::U64(v) => self.u64(tag, v),
            ElementType::False => self.bool(tag, false),
            ElementType::True => self.bool(tag, true),
            ElementType::F32(v) => self.f32(tag, v),
            ElementType::F64(v) => self.put(tag, WireType::F64, None, &v.to_bits().to_le_bytes()),
            ElementType::Utf(s) => self.utf16(tag, s),
            ElementType::Str(s) => self.str16(tag, s),
            ElementType::Null => self.null(tag),
            ElementType::Struct(inner) => {
                self.start_struct(tag)?;
                self.raw(inner)?;
                self.end_container()
            }
            ElementType::Array(inner) => {
                self.start_array(tag)?;
                self.raw(inner)?;
                self.end_container()
            }
            ElementType::List(inner) => {
                self.start_list(tag)?;
                self.raw(inner)?;
                self.end_container()
            }
            ElementType::EndCnt => self.end_container(),
        }
    }

    /// Appends pre-encoded TLV bytes verbatim.
    pub fn raw(&mut self, data: &[u8]) -> Result<(), Error> {
        self.buf.append(data)
    }

    pub fn get_tail(&self) -> usize {
        self.buf.get_tail()
    }

    pub fn rewind_to(&mut self, anchor: usize) {
        self.buf.rewind_tail_to(anchor);
    }

    pub fn get_buf(&mut self) -> &mut WriteBuf<'b> {
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::{TLVWriter, TagType};
    use crate::error::ErrorCode;
    use crate::utils::storage::WriteBuf;

    #[test]
    fn write_success() {
        let mut buf = [0; 20];
        let mut writebuf = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut writebuf);

        tw.start_struct(TagType::Anonymous).unwrap();
        tw.u8(TagType::Anonymous, 12).unwrap();
        tw.u8(TagType::Context(1), 13).unwrap();
        tw.u16(TagType::Anonymous, 0x1212).unwrap();
        tw.u16(TagType::Context(2), 0x1313).unwrap();
        tw.start_array(TagType::Context(3)).unwrap();
        tw.bool(TagType::Anonymous, true).unwrap();
        tw.end_container().unwrap();
        tw.end_container().unwrap();
        assert_eq!(
            buf,
            [21, 4, 12, 36, 1, 13, 5, 0x12, 0x12, 37, 2, 0x13, 0x13, 54, 3, 9, 24, 24, 0, 0]
        );
    }

    #[test]
    fn write_overflow_is_atomic() {
        let mut buf = [0; 6];
        let mut writebuf = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut writebuf);

        tw.u8(TagType::Anonymous, 12).unwrap();
        tw.u8(TagType::Context(1), 13).unwrap();
        // 1 control + 1 tag + 2 value, only 1 byte left
        assert_eq!(
            tw.u16(TagType::Context(2), 0x1212).unwrap_err().code(),
            ErrorCode::NoSpace
        );
        assert_eq!(tw.get_tail(), 5);
        tw.bool(TagType::Anonymous, true).unwrap();
        assert_eq!(buf, [4, 12, 36, 1, 13, 9]);
    }

    #[test]
    fn narrowest_integer_form() {
        let mut buf = [0; 20];
        let mut writebuf = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut writebuf);

        tw.u64(TagType::Anonymous, 5).unwrap();
        tw.i32(TagType::Anonymous, -2).unwrap();
        tw.u32(TagType::Anonymous, 0x10000).unwrap();
        assert_eq!(
            writebuf.as_slice(),
            &[0x04, 5, 0x00, 0xfe, 0x06, 0x00, 0x00, 0x01, 0x00]
        );
    }

    #[test]
    fn put_str8() {
        let mut buf = [0; 20];
        let mut writebuf = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut writebuf);

        tw.u8(TagType::Context(1), 13).unwrap();
        tw.str8(TagType::Anonymous, &[10, 11, 12, 13, 14]).unwrap();
        tw.u16(TagType::Context(2), 0x1313).unwrap();
        tw.str8(TagType::Context(3), &[20, 21, 22]).unwrap();
        assert_eq!(
            buf,
            [36, 1, 13, 16, 5, 10, 11, 12, 13, 14, 37, 2, 0x13, 0x13, 48, 3, 3, 20, 21, 22]
        );
    }

    #[test]
    fn element_copy_retags() {
        use crate::tlv::get_root_node_struct;

        let src = [0x15, 0x24, 0x00, 0x05, 0x18];
        let root = get_root_node_struct(&src).unwrap();

        let mut buf = [0; 8];
        let mut writebuf = WriteBuf::new(&mut buf);
        let mut tw = TLVWriter::new(&mut writebuf);
        tw.element(TagType::Context(2), &root).unwrap();
        assert_eq!(writebuf.as_slice(), &[0x35, 0x02, 0x24, 0x00, 0x05, 0x18]);
    }
}
