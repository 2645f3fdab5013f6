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

use log::trace;

use crate::error::{Error, ErrorCode};

use super::{TagType, TAG_MASK, TAG_SHIFT_BITS, TAG_SIZE_MAP, TYPE_MASK};

/// A decoded element value. Containers carry their inner bytes, without the
/// terminating end-of-container marker.
#[derive(Debug, Copy, Clone, PartialEq)]
pub enum ElementType<'a> {
    S8(i8),
    S16(i16),
    S32(i32),
    S64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    False,
    True,
    F32(f32),
    F64(f64),
    Utf(&'a [u8]),
    Str(&'a [u8]),
    Null,
    Struct(&'a [u8]),
    Array(&'a [u8]),
    List(&'a [u8]),
    EndCnt,
}

impl<'a> ElementType<'a> {
}

#[derive(Debug, Copy, Clone, PartialEq)]
pub struct TLVElement<'a> {
    tag: TagType,
    value: ElementType<'a>,
    raw: &'a [u8],
}

struct Cursor<'a> {
    buf: &'a [u8],
    off: usize,
}

impl<'a> Cursor<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], Error> {
        let end = self
            .off
            .checked_add(len)
            .filter(|end| *end <= self.buf.len())
            .ok_or(ErrorCode::TruncatedPacket)?;
        let s = &self.buf[self.off..end];
        self.off = end;
        Ok(s)
    }

    fn le(&mut self, len: usize) -> Result<u64, Error> {
        let s = self.take(len)?;
        Ok(s.iter()
            .rev()
            .fold(0u64, |acc, b| (acc << 8) | (*b as u64)))
    }

    fn len_prefixed(&mut self, len_size: usize) -> Result<&'a [u8], Error> {
        let len = self.le(len_size)?;
        let len = usize::try_from(len).map_err(|_| ErrorCode::TruncatedPacket)?;
        self.take(len)
    }
}

/// Parses one element (a container in full) from the head of `buf`,
/// returning it with the number of bytes it occupies.
fn parse_element(buf: &[u8], depth: usize) -> Result<(TLVElement<'_>, usize), Error> {
    const MAX_DEPTH: usize = 16;

    let mut c = Cursor { buf, off: 0 };
    let control = c.take(1)?[0];
    let tag_ctl = (control & TAG_MASK) >> TAG_SHIFT_BITS;
    let tag_val = c.le(TAG_SIZE_MAP[tag_ctl as usize])?;

    let tag = match tag_ctl {
        0 => TagType::Anonymous,
        1 => TagType::Context(tag_val as u8),
        2 => TagType::CommonPrf16(tag_val as u16),
        3 => TagType::CommonPrf32(tag_val as u32),
        4 => TagType::ImplPrf16(tag_val as u16),
        5 => TagType::ImplPrf32(tag_val as u32),
        6 => TagType::FullQual48(tag_val),
        _ => TagType::FullQual64(tag_val),
    };

    let value = match control & TYPE_MASK {
        0 => ElementType::S8(c.le(1)? as u8 as i8),
        1 => ElementType::S16(c.le(2)? as u16 as i16),
        2 => ElementType::S32(c.le(4)? as u32 as i32),
        3 => ElementType::S64(c.le(8)? as i64),
        4 => ElementType::U8(c.le(1)? as u8),
        5 => ElementType::U16(c.le(2)? as u16),
        6 => ElementType::U32(c.le(4)? as u32),
        7 => ElementType::U64(c.le(8)?),
        8 => ElementType::False,
        9 => ElementType::True,
        10 => ElementType::F32(f32::from_bits(c.le(4)? as u32)),
        11 => ElementType::F64(f64::from_bits(c.le(8)?)),
        t @ 12..=15 => ElementType::Utf(c.len_prefixed(1 << (t - 12))?),
        t @ 16..=19 => ElementType::Str(c.len_prefixed(1 << (t - 16))?),
        20 => ElementType::Null,
        t @ 21..=23 => {
            if depth >= MAX_DEPTH {
                Err(ErrorCode::InvalidData)?;
            }

            let start = c.off;
            loop {
                let (inner, len) = parse_element(&buf[c.off..], depth + 1)?;
                if inner.value == ElementType::EndCnt {
                    break;
                }
                c.off += len;
            }
            let inner = &buf[start..c.off];
            // Step over the end-of-container byte
            c.off += 1;

            match t {
                21 => ElementType::Struct(inner),
                22 => ElementType::Array(inner),
                _ => ElementType::List(inner),
            }
        }
        24 => ElementType::EndCnt,
        _ => Err(ErrorCode::InvalidData)?,
    };

    let raw = &buf[..c.off];
    Ok((TLVElement { tag, value, raw }, c.off))
}

macro_rules! unsigned {
    ($name:ident, $t:ty) => {
        pub fn $name(&self) -> Result<$t, Error> {
            let v = match self.value {
                ElementType::U8(v) => v as u64,
                ElementType::U16(v) => v as u64,
                ElementType::U32(v) => v as u64,
                ElementType::U64(v) => v,
                _ => Err(ErrorCode::TLVTypeMismatch)?,
            };
            <$t>::try_from(v).map_err(|_| ErrorCode::InvalidData.into())
        }
    };
}

macro_rules! signed {
    ($name:ident, $t:ty) => {
        pub fn $name(&self) -> Result<$t, Error> {
            let v = match self.value {
                ElementType::S8(v) => v as i64,
                ElementType::S16(v) => v as i64,
                ElementType::S32(v) => v as i64,
                ElementType::S64(v) => v,
                _ => Err(ErrorCode::TLVTypeMismatch)?,
            };
            <$t>::try_from(v).map_err(|_| ErrorCode::InvalidData.into())
        }
    };
}

impl<'a> TLVElement<'a> {
    pub fn new(buf: &'a [u8]) -> Result<Self, Error> {
        parse_element(buf, 0).map(|(e, _)| e)
    }

    pub fn tag(&self) -> TagType {
        self.tag
    }

    pub fn element_type(&self) -> ElementType<'a> {
        self.value
    }

    /// The encoded bytes of the element, including its control byte and tag.
    pub fn raw(&self) -> &'a [u8] {
        self.raw
    }

    pub fn check_ctx_tag(&self, tag: u8) -> bool {
        self.tag == TagType::Context(tag)
    }

    unsigned!(u8, u8);
    unsigned!(u16, u16);
    unsigned!(u32, u32);
    unsigned!(u64, u64);

    signed!(i8, i8);
    signed!(i16, i16);
    signed!(i32, i32);
    signed!(i64, i64);

    pub fn f32(&self) -> Result<f32, Error> {
        match self.value {
            ElementType::F32(v) => Ok(v),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn bool(&self) -> Result<bool, Error> {
        match self.value {
            ElementType::False => Ok(false),
            ElementType::True => Ok(true),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn null(&self) -> Result<(), Error> {
        if self.is_null() {
            Ok(())
        } else {
            Err(ErrorCode::TLVTypeMismatch.into())
        }
    }

    pub fn is_null(&self) -> bool {
        self.value == ElementType::Null
    }

    /// Octet-string or UTF-8 payload bytes.
    pub fn slice(&self) -> Result<&'a [u8], Error> {
        match self.value {
            ElementType::Str(s) | ElementType::Utf(s) => Ok(s),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn str(&self) -> Result<&'a str, Error> {
        match self.value {
            ElementType::Utf(s) => Ok(core::str::from_utf8(s)?),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn confirm_struct(&self) -> Result<&Self, Error> {
        match self.value {
            ElementType::Struct(_) => Ok(self),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn confirm_array(&self) -> Result<&Self, Error> {
        match self.value {
            ElementType::Array(_) => Ok(self),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn confirm_list(&self) -> Result<&Self, Error> {
        match self.value {
            ElementType::List(_) => Ok(self),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    /// Iterates the direct children of a container.
    pub fn enter(&self) -> Result<TLVContainerIterator<'a>, Error> {
        match self.value {
            ElementType::Struct(inner) | ElementType::Array(inner) | ElementType::List(inner) => {
                Ok(TLVContainerIterator { buf: inner })
            }
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }

    pub fn find_ctx(&self, tag: u8) -> Result<TLVElement<'a>, Error> {
        for e in self.enter()? {
            let e = e?;
            if e.check_ctx_tag(tag) {
                return Ok(e);
            }
        }

        Err(ErrorCode::NoTagFound.into())
    }

    /// Decodes the context-tagged member `tag` of a struct, deferring to
    /// `T::tlv_not_found` when the member is absent.
    pub fn ctx<T: super::FromTLV<'a>>(&self, tag: u8) -> Result<T, Error> {
        match self.find_ctx(tag) {
            Ok(e) => T::from_tlv(&e),
            Err(e) if e.code() == ErrorCode::NoTagFound => T::tlv_not_found(),
            Err(e) => Err(e),
        }
    }
}

impl<'a> fmt::Display for TLVElement<'a> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag {
            TagType::Anonymous => (),
            TagType::Context(t) => write!(f, "{}: ", t)?,
            _ => write!(f, "{:?}: ", self.tag)?,
        }
        match self.value {
            ElementType::Struct(_) => write!(f, "{{"),
            ElementType::Array(_) | ElementType::List(_) => write!(f, "["),
            ElementType::Utf(s) => match core::str::from_utf8(s) {
                Ok(s) => write!(f, "\"{}\"", s),
                Err(_) => write!(f, "{:02x?}", s),
            },
            ElementType::Str(s) => write!(f, "{:02x?}", s),
            v => write!(f, "{:?}", v),
        }
    }
}

/// Iterator over the direct children of a container, stepping over nested
/// content. Malformed input yields one error and then ends.
#[derive(Debug, Clone)]
pub struct TLVContainerIterator<'a> {
    buf: &'a [u8],
}

impl<'a> Iterator for TLVContainerIterator<'a> {
    type Item = Result<TLVElement<'a>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.buf.is_empty() {
            return None;
        }

        match parse_element(self.buf, 1) {
            Ok((e, len)) => {
                self.buf = &self.buf[len..];
                Some(Ok(e))
            }
            Err(e) => {
                self.buf = &[];
                Some(Err(e))
            }
        }
    }
}

pub fn get_root_node(b: &[u8]) -> Result<TLVElement<'_>, Error> {
    TLVElement::new(b)
}

pub fn get_root_node_struct(b: &[u8]) -> Result<TLVElement<'_>, Error> {
    let root = TLVElement::new(b)?;
    root.confirm_struct()?;
    Ok(root)
}

pub fn get_root_node_list(b: &[u8]) -> Result<TLVElement<'_>, Error> {
    let root = TLVElement::new(b)?;
    root.confirm_list()?;
    Ok(root)
}

pub fn get_root_node_array(b: &[u8]) -> Result<TLVElement<'_>, Error> {
    let root = TLVElement::new(b)?;
    root.confirm_array()?;
    Ok(root)
}

/// Dumps an encoded element tree at trace level.
pub fn print_tlv_list(b: &[u8]) {
    fn dump(e: &TLVElement, depth: usize) {
        trace!("{:width$}{}", "", e, width = depth * 4);
        if let Ok(iter) = e.enter() {
            for child in iter {
                match child {
                    Ok(child) => dump(&child, depth + 1),
                    Err(err) => trace!("{:width$}<{}>", "", err, width = (depth + 1) * 4),
                }
            }
            let close = if matches!(e.element_type(), ElementType::Struct(_)) {
                "}"
            } else {
                "]"
            };
            trace!("{:width$}{}", "", close, width = depth * 4);
        }
    }

    match TLVElement::new(b) {
        Ok(root) => dump(&root, 0),
        Err(e) => trace!("Undecodable TLV: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_length_tag() {
        // Array with a context tag, but the tag byte is missing
        let b = [0x36];
        assert_eq!(
            TLVElement::new(&b).unwrap_err().code(),
            ErrorCode::TruncatedPacket
        );
    }

    #[test]
    fn invalid_value_type() {
        let b = [0x1f, 0x00];
        assert!(TLVElement::new(&b).is_err());
    }

    #[test]
    fn unterminated_container() {
        let b = [0x15, 0x24, 0x01, 0x05];
        assert!(TLVElement::new(&b).is_err());
    }

    #[test]
    fn string_length_exceeds_buffer() {
        let b = [0x10, 0x09, 0x01, 0x02];
        assert!(TLVElement::new(&b).is_err());
    }

    #[test]
    fn struct_members_by_tag() {
        // {0: 5, 1: [1, 2], 2: "ab", 3: true}
        let b = [
            0x15, 0x24, 0x00, 0x05, 0x36, 0x01, 0x04, 0x01, 0x04, 0x02, 0x18, 0x2c, 0x02, 0x02,
            b'a', b'b', 0x29, 0x03, 0x18,
        ];
        let root = get_root_node_struct(&b).unwrap();

        assert_eq!(root.find_ctx(0).unwrap().u8().unwrap(), 5);
        assert_eq!(root.find_ctx(2).unwrap().str().unwrap(), "ab");
        assert!(root.find_ctx(3).unwrap().bool().unwrap());
        assert_eq!(
            root.find_ctx(9).unwrap_err().code(),
            ErrorCode::NoTagFound
        );

        let arr: Vec<u8> = root
            .find_ctx(1)
            .unwrap()
            .enter()
            .unwrap()
            .map(|e| e.unwrap().u8().unwrap())
            .collect();
        assert_eq!(arr, vec![1, 2]);

        // Nested array content must not leak into the outer iteration
        let tags: Vec<TagType> = root.enter().unwrap().map(|e| e.unwrap().tag()).collect();
        assert_eq!(
            tags,
            vec![
                TagType::Context(0),
                TagType::Context(1),
                TagType::Context(2),
                TagType::Context(3)
            ]
        );
    }

    #[test]
    fn widening_reads() {
        // u16 value 0x0102 read as u32 and u64, but not as u8
        let b = [0x05, 0x02, 0x01];
        let e = TLVElement::new(&b).unwrap();
        assert_eq!(e.u32().unwrap(), 0x0102);
        assert_eq!(e.u64().unwrap(), 0x0102);
        assert_eq!(e.u8().unwrap_err().code(), ErrorCode::InvalidData);
        assert_eq!(e.i16().unwrap_err().code(), ErrorCode::TLVTypeMismatch);
    }

    #[test]
    fn empty_containers() {
        let b = [0x17, 0x18];
        let e = get_root_node_list(&b).unwrap();
        assert_eq!(e.enter().unwrap().count(), 0);
        assert_eq!(e.raw(), &b);
    }
}
