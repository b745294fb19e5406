//! SMBv1 negotiation packet support.
//!
//! For multi-protocol negotiation only: an SMB1 NEGOTIATE is the first frame
//! on the wire, and the server answers it with an SMB2 message.

use binrw::io::TakeSeekExt;
use binrw::prelude::*;
use modular_bitfield::prelude::*;

use super::binrw_util::prelude::*;
use super::smb2::negotiate::Dialect;

pub const SMB1_COMMAND_NEGOTIATE: u8 = 0x72;

/// SMB1 packet header [MS-CIFS] 2.2.3.1.
#[binrw::binrw]
#[derive(Debug, PartialEq, Eq)]
#[brw(little, magic(b"\xffSMB"))]
pub struct Smb1Header {
    pub command: u8,
    pub status: u32,
    pub flags: u8,
    pub flags2: Smb1Flags2,
    #[bw(calc = 0)]
    #[br(assert(_pid_high == 0))]
    _pid_high: u16,
    pub security_features: [u8; 8],
    #[bw(calc = 0)]
    #[br(assert(_reserved == 0))]
    _reserved: u16,
    pub tid: u16,
    pub pid_low: u16,
    pub uid: u16,
    pub mid: u16,
}

#[bitfield]
#[derive(BinRead, BinWrite, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[bw(map = |&x| Self::into_bytes(x))]
#[br(map = Self::from_bytes)]
pub struct Smb1Flags2 {
    pub long_names: bool,
    #[skip]
    __: B10,
    pub extended_security: bool,
    #[skip]
    __: B2,
    pub nt_status: bool,
    pub unicode: bool,
}

/// SMB1 NEGOTIATE request body: a word count of zero and a buffer of
/// `0x02`-prefixed, null-terminated dialect strings.
#[binrw::binrw]
#[derive(Debug, PartialEq, Eq)]
#[brw(little)]
pub struct Smb1NegotiateRequest {
    #[bw(calc = 0)]
    #[br(assert(_word_count == 0))]
    _word_count: u8,
    #[bw(calc = PosMarker::default())]
    byte_count: PosMarker<u16>,
    #[br(map_stream = |s| s.take_seek(byte_count.value.into()), parse_with = binrw::helpers::until_eof)]
    #[bw(write_with = PosMarker::write_size, args(&byte_count))]
    pub dialects: Vec<Smb1Dialect>,
}

#[binrw::binrw]
#[derive(Debug, PartialEq, Eq)]
#[brw(magic(b"\x02"))]
pub struct Smb1Dialect {
    pub name: binrw::NullString,
}

/// A full SMB1 NEGOTIATE message, header and body.
#[binrw::binrw]
#[derive(Debug, PartialEq, Eq)]
#[brw(little)]
pub struct Smb1NegotiateMessage {
    pub header: Smb1Header,
    pub negotiate: Smb1NegotiateRequest,
}

impl Smb1NegotiateMessage {
    const SMB2_DIALECT_2002: &'static str = "SMB 2.002";
    const SMB2_DIALECT_WILDCARD: &'static str = "SMB 2.???";

    /// Builds the multi-protocol negotiate message. The wildcard dialect
    /// string is omitted when the caller pinned the connection to 2.0.2.
    pub fn new(pinned_dialect: Option<Dialect>) -> Self {
        let mut dialects = vec![Smb1Dialect {
            name: binrw::NullString::from(Self::SMB2_DIALECT_2002),
        }];
        if pinned_dialect != Some(Dialect::Smb0202) {
            dialects.push(Smb1Dialect {
                name: binrw::NullString::from(Self::SMB2_DIALECT_WILDCARD),
            });
        }

        Self {
            header: Smb1Header {
                command: SMB1_COMMAND_NEGOTIATE,
                status: 0,
                flags: 0x18,
                flags2: Smb1Flags2::new()
                    .with_long_names(true)
                    .with_extended_security(true)
                    .with_nt_status(true)
                    .with_unicode(true),
                security_features: [0; 8],
                tid: 0xffff,
                pid_low: 1,
                uid: 0,
                mid: 0,
            },
            negotiate: Smb1NegotiateRequest { dialects },
        }
    }
}
