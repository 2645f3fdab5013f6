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

use core::fmt::Debug;

use crate::error::{Error, ErrorCode};

use super::{ElementType, TLVContainerIterator, TLVElement, TLVWriter, TagType};

pub trait FromTLV<'a> {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error>
    where
        Self: Sized;

    /// Called instead of `from_tlv` when a struct member is absent.
    fn tlv_not_found() -> Result<Self, Error>
    where
        Self: Sized,
    {
        Err(ErrorCode::TLVNotFound.into())
    }
}

pub trait ToTLV {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error>;
}

macro_rules! fromtlv_for {
    ($($t:ident)*) => {
        $(
            impl<'a> FromTLV<'a> for $t {
                fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
                    t.$t()
                }
            }
        )*
    };
}

macro_rules! totlv_for {
    ($($t:ident)*) => {
        $(
            impl ToTLV for $t {
                fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
                    tw.$t(tag, *self)
                }
            }
        )*
    };
}

fromtlv_for!(i8 u8 i16 u16 i32 u32 i64 u64 f32 bool);
totlv_for!(i8 u8 i16 u16 i32 u32 i64 u64 f32 bool);

impl<T: ToTLV + ?Sized> ToTLV for &T {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        (*self).to_tlv(tw, tag)
    }
}

/// UTF-8 string borrowed from the decoded buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct UtfStr<'a>(pub &'a [u8]);

impl<'a> UtfStr<'a> {
    pub const fn new(str: &'a [u8]) -> Self {
        Self(str)
    }

    pub fn as_str(&self) -> Result<&'a str, Error> {
        Ok(core::str::from_utf8(self.0)?)
    }
}

/// Keeps the element itself, for members decoded later or not at all.
impl<'a> FromTLV<'a> for TLVElement<'a> {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        Ok(*t)
    }
}

impl<'a> FromTLV<'a> for UtfStr<'a> {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        match t.element_type() {
            ElementType::Utf(s) => Ok(Self(s)),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }
}

impl<'a> ToTLV for UtfStr<'a> {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.utf16(tag, self.0)
    }
}

impl<'a> FromTLV<'a> for &'a str {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        t.str()
    }
}

impl ToTLV for str {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.utf16(tag, self.as_bytes())
    }
}

/// Octet string borrowed from the decoded buffer.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct OctetStr<'a>(pub &'a [u8]);

impl<'a> OctetStr<'a> {
    pub const fn new(str: &'a [u8]) -> Self {
        Self(str)
    }
}

impl<'a> FromTLV<'a> for OctetStr<'a> {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        match t.element_type() {
            ElementType::Str(s) => Ok(Self(s)),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }
}

impl<'a> ToTLV for OctetStr<'a> {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.str16(tag, self.0)
    }
}

impl<'a, const N: usize> FromTLV<'a> for heapless::Vec<u8, N> {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        heapless::Vec::from_slice(OctetStr::from_tlv(t)?.0)
            .map_err(|_| ErrorCode::NoSpace.into())
    }
}

impl<const N: usize> ToTLV for heapless::Vec<u8, N> {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.str16(tag, self)
    }
}

impl<'a, const N: usize> FromTLV<'a> for heapless::String<N> {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        let mut s = heapless::String::new();
        s.push_str(t.str()?).map_err(|_| ErrorCode::NoSpace)?;
        Ok(s)
    }
}

impl<const N: usize> ToTLV for heapless::String<N> {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        tw.utf16(tag, self.as_bytes())
    }
}

impl<'a, T: FromTLV<'a>> FromTLV<'a> for Option<T> {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        Ok(Some(T::from_tlv(t)?))
    }

    fn tlv_not_found() -> Result<Self, Error> {
        Ok(None)
    }
}

impl<T: ToTLV> ToTLV for Option<T> {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        match self {
            Some(s) => s.to_tlv(tw, tag),
            None => Ok(()),
        }
    }
}

/// A value that may be encoded as null.
///
/// Null is different from absent: an optional nullable member is
/// `Option<Nullable<T>>`.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum Nullable<T> {
    Null,
    NotNull(T),
}

impl<T> Nullable<T> {
    pub fn is_null(&self) -> bool {
        matches!(self, Nullable::Null)
    }
}

impl<'a, T: FromTLV<'a>> FromTLV<'a> for Nullable<T> {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        if t.is_null() {
            Ok(Nullable::Null)
        } else {
            Ok(Nullable::NotNull(T::from_tlv(t)?))
        }
    }
}

impl<T: ToTLV> ToTLV for Nullable<T> {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        match self {
            Nullable::Null => tw.null(tag),
            Nullable::NotNull(s) => s.to_tlv(tw, tag),
        }
    }
}

/// A TLV array (or list) decoded lazily, or a slice to be encoded.
#[derive(Copy, Clone)]
pub enum TLVArray<'a, T> {
    Slice(&'a [T]),
    Ptr(TLVElement<'a>),
}

impl<'a, T> TLVArray<'a, T> {
    pub const fn new(slice: &'a [T]) -> Self {
        Self::Slice(slice)
    }
}

impl<'a, T: FromTLV<'a> + Clone> TLVArray<'a, T> {
    pub fn iter(&self) -> TLVArrayIter<'a, T> {
        match *self {
            Self::Slice(s) => TLVArrayIter::Slice(s.iter()),
            Self::Ptr(p) => TLVArrayIter::Ptr(p.enter().ok()),
        }
    }
}

pub enum TLVArrayIter<'a, T> {
    Slice(core::slice::Iter<'a, T>),
    Ptr(Option<TLVContainerIterator<'a>>),
}

impl<'a, T: FromTLV<'a> + Clone> Iterator for TLVArrayIter<'a, T> {
    type Item = Result<T, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self {
            Self::Slice(s) => s.next().cloned().map(Ok),
            Self::Ptr(p) => {
                let e = p.as_mut()?.next()?;
                Some(e.and_then(|e| T::from_tlv(&e)))
            }
        }
    }
}

impl<'a, T: ToTLV> ToTLV for TLVArray<'a, T> {
    fn to_tlv(&self, tw: &mut TLVWriter, tag: TagType) -> Result<(), Error> {
        match *self {
            Self::Slice(s) => {
                tw.start_array(tag)?;
                for a in s {
                    a.to_tlv(tw, TagType::Anonymous)?;
                }
                tw.end_container()
            }
            Self::Ptr(p) => tw.element(tag, &p),
        }
    }
}

impl<'a, T> FromTLV<'a> for TLVArray<'a, T> {
    fn from_tlv(t: &TLVElement<'a>) -> Result<Self, Error> {
        match t.element_type() {
            ElementType::Array(_) | ElementType::List(_) => Ok(Self::Ptr(*t)),
            _ => Err(ErrorCode::TLVTypeMismatch.into()),
        }
    }
}

impl<'a, T: Debug + FromTLV<'a> + Clone> Debug for TLVArray<'a, T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_list().entries(self.iter().flatten()).finish()
    }
}
