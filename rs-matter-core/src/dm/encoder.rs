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

//! Attribute value encoding with chunking, write decoding, and the command
//! response builder handed to providers.
//!
//! Every report element is written as a unit: if it does not fit in what is
//! left of the message, the writer is rolled back to where the element
//! started, so a message never carries a partial structure.
//!
//! Lists too large for one message are split across chunks. The first chunk
//! carries the attribute as an empty list; each item then follows as its
//! own append report (list index null). Where a chunk fills up, the index of
//! the first item that did not fit is kept in a cursor owned by the caller,
//! and encoding resumes from there in the next chunk.

use crate::error::{Error, ErrorCode};
use crate::im::{CmdPath, ConcreteAttrPath, IMStatusCode, Status};
use crate::tlv::{FromTLV, TLVElement, TLVWriter, TagType, ToTLV};

use super::CmdId;

/// AttributeReportIB: 0 status, 1 data
const REPORT_DATA_TAG: u8 = 1;
/// AttributeDataIB: 0 data version, 1 path, 2 data
const DATA_VER_TAG: u8 = 0;
const DATA_PATH_TAG: u8 = 1;
const DATA_TAG: u8 = 2;

/// Runs `f`, rewinding the writer to where it was if `f` fails.
pub fn atomically<F>(tw: &mut TLVWriter, f: F) -> Result<(), Error>
where
    F: FnOnce(&mut TLVWriter) -> Result<(), Error>,
{
    let anchor = tw.get_tail();
    let result = f(tw);
    if result.is_err() {
        tw.rewind_to(anchor);
    }

    result
}

fn start_report(
    tw: &mut TLVWriter,
    path: &ConcreteAttrPath,
    dataver: u32,
    append: bool,
) -> Result<(), Error> {
    tw.start_struct(TagType::Anonymous)?;
    tw.start_struct(TagType::Context(REPORT_DATA_TAG))?;
    tw.u32(TagType::Context(DATA_VER_TAG), dataver)?;
    tw.start_list(TagType::Context(DATA_PATH_TAG))?;
    tw.u16(TagType::Context(2), path.endpoint)?;
    tw.u32(TagType::Context(3), path.cluster)?;
    tw.u32(TagType::Context(4), path.attr)?;
    if append {
        tw.null(TagType::Context(5))?;
    }
    tw.end_container()
}

fn end_report(tw: &mut TLVWriter) -> Result<(), Error> {
    tw.end_container()?;
    tw.end_container()
}

/// Writes the value of one attribute as AttributeReportIBs.
pub struct AttrValueEncoder<'a, 'b, 'c> {
    tw: &'a mut TLVWriter<'b, 'c>,
    path: ConcreteAttrPath,
    dataver: u32,
    list_cursor: &'a mut Option<u16>,
}

impl<'a, 'b, 'c> AttrValueEncoder<'a, 'b, 'c> {
    /// `list_cursor` is `None` unless a previous chunk already carried part
    /// of this attribute's list, in which case it holds the index of the
    /// next item to send.
    pub fn new(
        tw: &'a mut TLVWriter<'b, 'c>,
        path: ConcreteAttrPath,
        dataver: u32,
        list_cursor: &'a mut Option<u16>,
    ) -> Self {
        Self {
            tw,
            path,
            dataver,
            list_cursor,
        }
    }

    pub fn path(&self) -> ConcreteAttrPath {
        self.path
    }

    pub fn encode<T: ToTLV + ?Sized>(self, value: &T) -> Result<(), Error> {
        self.encode_with(|tw, tag| value.to_tlv(tw, tag))
    }

    /// Encodes a value written by `f` under the tag it is given.
    pub fn encode_with<F>(self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut TLVWriter, TagType) -> Result<(), Error>,
    {
        let (path, dataver) = (self.path, self.dataver);

        atomically(self.tw, |tw| {
            start_report(tw, &path, dataver, false)?;
            f(tw, TagType::Context(DATA_TAG))?;
            end_report(tw)
        })
    }

    /// Encodes a list attribute whose items `f` feeds to the [`ListEncoder`].
    ///
    /// `f` may be called more than once and must produce the same items in
    /// the same order every time. Returns an out-of-space error when the
    /// rest of the list has to go into the next chunk.
    pub fn encode_list<F>(self, mut f: F) -> Result<(), Error>
    where
        F: FnMut(&mut ListEncoder<'_, '_, '_>) -> Result<(), Error>,
    {
        let Self {
            tw,
            path,
            dataver,
            list_cursor,
        } = self;

        let resume_from = match *list_cursor {
            Some(index) => index,
            None => {
                let whole = atomically(tw, |tw| {
                    start_report(tw, &path, dataver, false)?;
                    tw.start_array(TagType::Context(DATA_TAG))?;
                    f(&mut ListEncoder::new(tw, None, 0))?;
                    tw.end_container()?;
                    end_report(tw)
                });

                match whole {
                    Err(e) if e.is_out_of_space() => (),
                    other => return other,
                }

                atomically(tw, |tw| {
                    start_report(tw, &path, dataver, false)?;
                    tw.start_array(TagType::Context(DATA_TAG))?;
                    tw.end_container()?;
                    end_report(tw)
                })?;

                *list_cursor = Some(0);
                0
            }
        };

        let mut le = ListEncoder::new(tw, Some((path, dataver)), resume_from);
        let result = f(&mut le);

        match (result, le.failed_at) {
            (Ok(()), None) => {
                *list_cursor = None;
                Ok(())
            }
            (Err(e), _) if !e.is_out_of_space() => Err(e),
            (_, failed_at) => {
                *list_cursor = Some(failed_at.unwrap_or(le.index));
                Err(ErrorCode::NoSpace.into())
            }
        }
    }
}

/// Feeds the items of a list attribute to an [`AttrValueEncoder`].
pub struct ListEncoder<'a, 'b, 'c> {
    tw: &'a mut TLVWriter<'b, 'c>,
    // Set when every item goes into its own append report
    append: Option<(ConcreteAttrPath, u32)>,
    resume_from: u16,
    index: u16,
    failed_at: Option<u16>,
}

impl<'a, 'b, 'c> ListEncoder<'a, 'b, 'c> {
    fn new(
        tw: &'a mut TLVWriter<'b, 'c>,
        append: Option<(ConcreteAttrPath, u32)>,
        resume_from: u16,
    ) -> Self {
        Self {
            tw,
            append,
            resume_from,
            index: 0,
            failed_at: None,
        }
    }

    pub fn encode<T: ToTLV + ?Sized>(&mut self, item: &T) -> Result<(), Error> {
        self.encode_with(|tw, tag| item.to_tlv(tw, tag))
    }

    pub fn encode_with<F>(&mut self, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut TLVWriter, TagType) -> Result<(), Error>,
    {
        let index = self.index;

        match self.append {
            None => f(self.tw, TagType::Anonymous)?,
            Some(_) if self.failed_at.is_some() => Err(ErrorCode::NoSpace)?,
            Some(_) if index < self.resume_from => (),
            Some((path, dataver)) => {
                let result = atomically(self.tw, |tw| {
                    start_report(tw, &path, dataver, true)?;
                    f(tw, TagType::Context(DATA_TAG))?;
                    end_report(tw)
                });

                if let Err(e) = result {
                    if e.is_out_of_space() {
                        self.failed_at = Some(index);
                    }
                    return Err(e);
                }
            }
        }

        self.index += 1;

        Ok(())
    }
}

/// How a write request changes a list attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListOperation {
    /// The value replaces the whole attribute
    Replace,
    /// The value is one item to add at the end of the list
    Append,
}

/// The value of one attribute write.
pub struct AttrValueDecoder<'a> {
    data: TLVElement<'a>,
    op: ListOperation,
}

impl<'a> AttrValueDecoder<'a> {
    pub const fn new(data: TLVElement<'a>, op: ListOperation) -> Self {
        Self { data, op }
    }

    pub fn element(&self) -> &TLVElement<'a> {
        &self.data
    }

    pub fn op(&self) -> ListOperation {
        self.op
    }

    pub fn decode<T: FromTLV<'a>>(&self) -> Result<T, Error> {
        T::from_tlv(&self.data)
    }
}

/// InvokeResponseIB: 0 command, 1 status
const INVOKE_RESP_COMMAND_TAG: u8 = 0;
const INVOKE_RESP_STATUS_TAG: u8 = 1;

/// Collects the outcome of one command into an InvokeResponseMessage.
pub struct CommandHandler<'a, 'b, 'c> {
    tw: &'a mut TLVWriter<'b, 'c>,
    path: CmdPath,
    responded: bool,
}

impl<'a, 'b, 'c> CommandHandler<'a, 'b, 'c> {
    pub fn new(tw: &'a mut TLVWriter<'b, 'c>, path: CmdPath) -> Self {
        Self {
            tw,
            path,
            responded: false,
        }
    }

    pub fn path(&self) -> CmdPath {
        self.path
    }

    pub fn has_response(&self) -> bool {
        self.responded
    }

    /// Answers with a response command whose fields `f` writes as a struct
    /// under the tag it is given.
    pub fn add_response<F>(&mut self, cmd_id: CmdId, f: F) -> Result<(), Error>
    where
        F: FnOnce(&mut TLVWriter, TagType) -> Result<(), Error>,
    {
        if self.responded {
            Err(ErrorCode::InvalidState)?;
        }

        let path = CmdPath {
            cmd: Some(cmd_id),
            ..self.path
        };

        atomically(self.tw, |tw| {
            tw.start_struct(TagType::Anonymous)?;
            tw.start_struct(TagType::Context(INVOKE_RESP_COMMAND_TAG))?;
            path.to_tlv(tw, TagType::Context(0))?;
            f(tw, TagType::Context(1))?;
            tw.end_container()?;
            tw.end_container()
        })?;

        self.responded = true;

        Ok(())
    }

    pub fn add_status(&mut self, status: IMStatusCode) -> Result<(), Error> {
        if self.responded {
            Err(ErrorCode::InvalidState)?;
        }

        let path = self.path;

        atomically(self.tw, |tw| {
            tw.start_struct(TagType::Anonymous)?;
            tw.start_struct(TagType::Context(INVOKE_RESP_STATUS_TAG))?;
            path.to_tlv(tw, TagType::Context(0))?;
            Status::new(status).to_tlv(tw, TagType::Context(1))?;
            tw.end_container()?;
            tw.end_container()
        })?;

        self.responded = true;

        Ok(())
    }
}
