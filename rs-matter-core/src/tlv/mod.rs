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

//! The Matter tag-length-value codec.
//!
//! A control byte carries the tag form in its upper three bits and the
//! element type in the lower five; the tag (if any) follows, then the value.

pub use parser::*;
pub use traits::*;
pub use writer::*;

mod parser;
mod traits;
mod writer;

pub const TAG_SHIFT_BITS: u8 = 5;
pub const TAG_MASK: u8 = 0xe0;
pub const TYPE_MASK: u8 = 0x1f;

/// Tag payload size in bytes, indexed by tag control.
pub static TAG_SIZE_MAP: [usize; 8] = [
    0, // Anonymous
    1, // Context
    2, // CommonPrf16
    4, // CommonPrf32
    2, // ImplPrf16
    4, // ImplPrf32
    6, // FullQual48
    8, // FullQual64
];

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TagType {
    Anonymous,
    Context(u8),
    CommonPrf16(u16),
    CommonPrf32(u32),
    ImplPrf16(u16),
    ImplPrf32(u32),
    FullQual48(u64),
    FullQual64(u64),
}

impl TagType {
    pub const fn control(&self) -> u8 {
        match self {
            TagType::Anonymous => 0,
            TagType::Context(_) => 1,
            TagType::CommonPrf16(_) => 2,
            TagType::CommonPrf32(_) => 3,
            TagType::ImplPrf16(_) => 4,
            TagType::ImplPrf32(_) => 5,
            TagType::FullQual48(_) => 6,
            TagType::FullQual64(_) => 7,
        }
    }

    pub const fn value(&self) -> u64 {
        match *self {
            TagType::Anonymous => 0,
            TagType::Context(v) => v as u64,
            TagType::CommonPrf16(v) | TagType::ImplPrf16(v) => v as u64,
            TagType::CommonPrf32(v) | TagType::ImplPrf32(v) => v as u64,
            TagType::FullQual48(v) | TagType::FullQual64(v) => v,
        }
    }
}

/// Wire element types, as carried in the low bits of the control byte.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[repr(u8)]
pub enum WireType {
    S8 = 0,
    S16 = 1,
    S32 = 2,
    S64 = 3,
    U8 = 4,
    U16 = 5,
    U32 = 6,
    U64 = 7,
    False = 8,
    True = 9,
    F32 = 10,
    F64 = 11,
    Utf8l = 12,
    Utf16l = 13,
    Utf32l = 14,
    Utf64l = 15,
    Str8l = 16,
    Str16l = 17,
    Str32l = 18,
    Str64l = 19,
    Null = 20,
    Struct = 21,
    Array = 22,
    List = 23,
    EndCnt = 24,
}
