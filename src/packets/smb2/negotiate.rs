use binrw::io::{SeekFrom, TakeSeekExt};
use binrw::prelude::*;
use modular_bitfield::prelude::*;

use crate::packets::{binrw_util::prelude::*, guid::Guid};
use crate::Error;

#[binrw::binrw]
#[derive(Debug, PartialEq, Eq)]
#[brw(little)]
pub struct NegotiateRequest {
    #[bw(calc = 0x24)]
    #[br(assert(_structure_size == 0x24))]
    _structure_size: u16,
    #[bw(try_calc(u16::try_from(dialects.len())))]
    dialect_count: u16,
    pub security_mode: NegotiateSecurityMode,
    #[bw(calc = 0)]
    #[br(assert(_reserved == 0))]
    _reserved: u16,
    pub capabilities: GlobalCapabilities,
    pub client_guid: Guid,

    #[bw(calc = PosMarker::default())]
    negotiate_context_offset: PosMarker<u32>,
    #[bw(try_calc(u16::try_from(negotiate_context_list.as_ref().map(|v| v.len()).unwrap_or(0))))]
    negotiate_context_count: u16,
    #[bw(calc = 0)]
    #[br(assert(_reserved2 == 0))]
    _reserved2: u16,
    #[br(count = dialect_count)]
    pub dialects: Vec<Dialect>,
    // Negotiation contexts are present only when SMB 3.1.1 is offered.
    // The list is 8-byte aligned.
    #[brw(if(dialects.contains(&Dialect::Smb0311)), align_before = 8)]
    #[br(count = negotiate_context_count, seek_before = SeekFrom::Start(negotiate_context_offset.value as u64))]
    #[bw(write_with = PosMarker::write_aoff, args(&negotiate_context_offset))]
    pub negotiate_context_list: Option<Vec<NegotiateContext>>,
}

impl NegotiateRequest {
    /// The highest dialect offered by this request.
    pub fn highest_dialect(&self) -> Option<Dialect> {
        self.dialects.iter().max().copied()
    }
}

#[bitfield]
#[derive(BinRead, BinWrite, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[bw(map = |&x| Self::into_bytes(x))]
#[br(map = Self::from_bytes)]
pub struct NegotiateSecurityMode {
    pub signing_enabled: bool,
    pub signing_required: bool,
    #[skip]
    __: B14,
}

#[bitfield]
#[derive(BinRead, BinWrite, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[bw(map = |&x| Self::into_bytes(x))]
#[br(map = Self::from_bytes)]
pub struct GlobalCapabilities {
    pub dfs: bool,
    pub leasing: bool,
    pub large_mtu: bool,
    pub multi_channel: bool,

    pub persistent_handles: bool,
    pub directory_leasing: bool,
    pub encryption: bool,
    pub notifications: bool,

    #[skip]
    __: B24,
}

#[binrw::binrw]
#[derive(Debug, PartialEq, Eq)]
#[brw(little)]
pub struct NegotiateResponse {
    #[br(assert(_structure_size == 0x41))]
    #[bw(calc = 0x41)]
    _structure_size: u16,
    pub security_mode: NegotiateSecurityMode,
    pub dialect_revision: NegotiateDialect,
    #[bw(try_calc(u16::try_from(negotiate_context_list.as_ref().map(|v| v.len()).unwrap_or(0))))]
    #[br(assert(if dialect_revision == NegotiateDialect::Smb0311 { negotiate_context_count > 0 } else { negotiate_context_count == 0 }))]
    negotiate_context_count: u16,
    pub server_guid: Guid,
    pub capabilities: GlobalCapabilities,
    pub max_transact_size: u32,
    pub max_read_size: u32,
    pub max_write_size: u32,
    pub system_time: FileTime,
    pub server_start_time: FileTime,
    #[bw(calc = PosMarker::default())]
    _security_buffer_offset: PosMarker<u16>,
    #[bw(try_calc(u16::try_from(buffer.len())))]
    security_buffer_length: u16,
    #[bw(calc = PosMarker::default())]
    negotiate_context_offset: PosMarker<u32>,
    #[br(count = security_buffer_length, seek_before = SeekFrom::Start(_security_buffer_offset.value as u64))]
    #[bw(write_with = PosMarker::write_aoff, args(&_security_buffer_offset))]
    pub buffer: Vec<u8>,

    #[brw(if(matches!(dialect_revision, NegotiateDialect::Smb0311)), align_before = 8)]
    #[br(count = negotiate_context_count, seek_before = SeekFrom::Start(negotiate_context_offset.value as u64))]
    #[bw(write_with = PosMarker::write_aoff, args(&negotiate_context_offset))]
    pub negotiate_context_list: Option<Vec<NegotiateContext>>,
}

impl NegotiateResponse {
    /// The first hash algorithm offered by the server's preauth integrity
    /// context, if any.
    pub fn get_ctx_integrity_algo(&self) -> Option<HashAlgorithm> {
        self.negotiate_context_list.as_ref().and_then(|contexts| {
            contexts.iter().find_map(|context| match &context.data {
                NegotiateContextValue::PreauthIntegrityCapabilities(caps) => {
                    caps.hash_algorithms.first().copied()
                }
                _ => None,
            })
        })
    }

    /// The server's cipher choice from the encryption context, if any.
    pub fn get_ctx_encrypt_cipher(&self) -> Option<EncryptionCipher> {
        self.negotiate_context_list.as_ref().and_then(|contexts| {
            contexts.iter().find_map(|context| match &context.data {
                NegotiateContextValue::EncryptionCapabilities(caps) => caps.ciphers.first().copied(),
                _ => None,
            })
        })
    }
}

#[derive(BinRead, BinWrite, Debug, PartialEq, Eq, PartialOrd, Ord, Copy, Clone)]
#[brw(repr(u16))]
pub enum Dialect {
    Smb0202 = 0x0202,
    Smb021 = 0x0210,
    Smb030 = 0x0300,
    Smb0302 = 0x0302,
    Smb0311 = 0x0311,
}

impl Dialect {
    pub const MAX: Dialect = Dialect::Smb0311;
    pub const MIN: Dialect = Dialect::Smb0202;
    pub const ALL: [Dialect; 5] = [
        Dialect::Smb0202,
        Dialect::Smb021,
        Dialect::Smb030,
        Dialect::Smb0302,
        Dialect::Smb0311,
    ];

    #[inline]
    pub fn is_smb3(&self) -> bool {
        matches!(self, Dialect::Smb030 | Dialect::Smb0302 | Dialect::Smb0311)
    }
}

/// Dialects that may appear in a NEGOTIATE response.
/// The same as [Dialect] but with the SMB 2.??? wildcard.
#[derive(BinRead, BinWrite, Debug, PartialEq, Eq, Clone, Copy)]
#[brw(repr(u16))]
pub enum NegotiateDialect {
    Smb0202 = Dialect::Smb0202 as isize,
    Smb021 = Dialect::Smb021 as isize,
    Smb030 = Dialect::Smb030 as isize,
    Smb0302 = Dialect::Smb0302 as isize,
    Smb0311 = Dialect::Smb0311 as isize,
    Smb02Wildcard = 0x02FF,
}

impl TryFrom<NegotiateDialect> for Dialect {
    type Error = Error;

    fn try_from(value: NegotiateDialect) -> Result<Self, Self::Error> {
        match value {
            NegotiateDialect::Smb0202 => Ok(Dialect::Smb0202),
            NegotiateDialect::Smb021 => Ok(Dialect::Smb021),
            NegotiateDialect::Smb030 => Ok(Dialect::Smb030),
            NegotiateDialect::Smb0302 => Ok(Dialect::Smb0302),
            NegotiateDialect::Smb0311 => Ok(Dialect::Smb0311),
            _ => Err(Error::UnsupportedDialect(value as u16)),
        }
    }
}

impl From<Dialect> for NegotiateDialect {
    fn from(value: Dialect) -> Self {
        match value {
            Dialect::Smb0202 => NegotiateDialect::Smb0202,
            Dialect::Smb021 => NegotiateDialect::Smb021,
            Dialect::Smb030 => NegotiateDialect::Smb030,
            Dialect::Smb0302 => NegotiateDialect::Smb0302,
            Dialect::Smb0311 => NegotiateDialect::Smb0311,
        }
    }
}

#[binrw::binrw]
#[derive(Debug, PartialEq, Eq)]
#[brw(little)]
pub struct NegotiateContext {
    // The entire context is 8-byte aligned.
    #[brw(align_before = 8)]
    pub context_type: u16,
    #[bw(calc = PosMarker::default())]
    data_length: PosMarker<u16>,
    #[bw(calc = 0)]
    #[br(assert(_reserved == 0))]
    _reserved: u32,
    #[br(args(context_type))]
    #[br(map_stream = |s| s.take_seek(data_length.value as u64))]
    #[bw(write_with = PosMarker::write_size, args(&data_length))]
    pub data: NegotiateContextValue,
}

impl NegotiateContext {
    pub const PREAUTH_INTEGRITY_CAPABILITIES: u16 = 0x0001;
    pub const ENCRYPTION_CAPABILITIES: u16 = 0x0002;

    pub fn preauth_integrity(caps: PreauthIntegrityCapabilities) -> Self {
        Self {
            context_type: Self::PREAUTH_INTEGRITY_CAPABILITIES,
            data: NegotiateContextValue::PreauthIntegrityCapabilities(caps),
        }
    }

    pub fn encryption(caps: EncryptionCapabilities) -> Self {
        Self {
            context_type: Self::ENCRYPTION_CAPABILITIES,
            data: NegotiateContextValue::EncryptionCapabilities(caps),
        }
    }
}

#[derive(BinRead, BinWrite, Debug, PartialEq, Eq)]
#[br(import(context_type: u16))]
pub enum NegotiateContextValue {
    #[br(pre_assert(context_type == NegotiateContext::PREAUTH_INTEGRITY_CAPABILITIES))]
    PreauthIntegrityCapabilities(PreauthIntegrityCapabilities),
    #[br(pre_assert(context_type == NegotiateContext::ENCRYPTION_CAPABILITIES))]
    EncryptionCapabilities(EncryptionCapabilities),
    /// Context types this client does not consume, preserved raw.
    Unknown(#[br(parse_with = binrw::helpers::until_eof)] Vec<u8>),
}

#[derive(BinRead, BinWrite, Debug, PartialEq, Eq, Clone, Copy)]
#[brw(repr(u16))]
pub enum HashAlgorithm {
    Sha512 = 0x01,
}

#[binrw::binrw]
#[derive(Debug, PartialEq, Eq)]
#[brw(little)]
pub struct PreauthIntegrityCapabilities {
    #[bw(try_calc(u16::try_from(hash_algorithms.len())))]
    hash_algorithm_count: u16,
    #[bw(try_calc(u16::try_from(salt.len())))]
    salt_length: u16,
    #[br(count = hash_algorithm_count)]
    pub hash_algorithms: Vec<HashAlgorithm>,
    #[br(count = salt_length)]
    pub salt: Vec<u8>,
}

#[binrw::binrw]
#[derive(Debug, PartialEq, Eq)]
#[brw(little)]
pub struct EncryptionCapabilities {
    #[bw(try_calc(u16::try_from(ciphers.len())))]
    cipher_count: u16,
    #[br(count = cipher_count)]
    pub ciphers: Vec<EncryptionCipher>,
}

#[derive(BinRead, BinWrite, Debug, PartialEq, Eq, Clone, Copy)]
#[brw(repr(u16))]
pub enum EncryptionCipher {
    /// A server that supports the context but no common cipher answers 0.
    None = 0x0000,
    Aes128Ccm = 0x0001,
    Aes128Gcm = 0x0002,
}
