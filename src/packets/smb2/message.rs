//! Full SMB2 frames: a plain message with an opaque body, or an encrypted
//! (transformed) message.
//!
//! Command bodies are carried as raw bytes: this crate routes and protects
//! messages, it does not interpret operation payloads. Offset fields inside
//! bodies are relative to the start of the SMB2 header, so bodies are packed
//! and unpacked through [`encode_body`]/[`decode_body`], which keep the
//! header-sized gap in place.

use std::io::{Cursor, Seek, SeekFrom};

use binrw::prelude::*;
use binrw::Endian;

use super::encrypted::EncryptedMessage;
use super::header::*;

/// A plain, single, SMB2 message: header and raw body bytes.
#[binrw::binrw]
#[derive(Debug, Clone, PartialEq, Eq)]
#[brw(little)]
pub struct PlainMessage {
    pub header: Header,
    #[br(parse_with = binrw::helpers::until_eof)]
    pub data: Vec<u8>,
}

impl PlainMessage {
    /// A fresh request frame. Message id, credits and protection are filled
    /// in on the send path.
    pub fn new(command: Command, data: Vec<u8>) -> PlainMessage {
        PlainMessage {
            header: Header {
                credit_charge: 0,
                status: Status::U32_SUCCESS,
                command,
                credit_request: 0,
                flags: HeaderFlags::new(),
                next_command: 0,
                message_id: u64::MAX,
                tree_id: Some(0),
                async_id: None,
                session_id: 0,
                signature: 0,
            },
            data,
        }
    }

    pub fn to_bytes(&self) -> crate::Result<Vec<u8>> {
        let mut cursor = Cursor::new(Vec::new());
        self.write(&mut cursor)?;
        Ok(cursor.into_inner())
    }
}

/// Any SMB2 frame arriving from, or going to, the wire.
#[binrw::binrw]
#[derive(Debug)]
#[brw(little)]
pub enum Message {
    Plain(PlainMessage),
    Encrypted(EncryptedMessage),
}

/// Packs a message body on its own, placing it after a header-sized gap so
/// that offset fields resolve relative to the start of the SMB2 header.
/// Returns the body bytes only.
pub fn encode_body<T>(body: &T) -> crate::Result<Vec<u8>>
where
    T: for<'a> BinWrite<Args<'a> = ()>,
{
    let mut cursor = Cursor::new(Vec::new());
    cursor.seek(SeekFrom::Start(Header::STRUCT_SIZE as u64))?;
    body.write_options(&mut cursor, Endian::Little, ())?;
    Ok(cursor.into_inner()[Header::STRUCT_SIZE..].to_vec())
}

/// Unpacks a message body from a full packed frame (header included), so
/// that offset fields resolve relative to the start of the SMB2 header.
pub fn decode_body<T>(raw_frame: &[u8]) -> crate::Result<T>
where
    T: for<'a> BinRead<Args<'a> = ()>,
{
    let mut cursor = Cursor::new(raw_frame);
    cursor.seek(SeekFrom::Start(Header::STRUCT_SIZE as u64))?;
    Ok(T::read_options(&mut cursor, Endian::Little, ())?)
}
