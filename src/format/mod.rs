//! Layout:
//! [Header] of [Header::SIZE] bytes
//! Then `entry_count` descriptors, each a `u8` name length, the name bytes and a [DescriptorTail]
//! Then the payload at `data_origin`, `raw_size` bytes, optionally one zlib stream
//! Then, if [Header::FLAG_CRC] is set, `entry_count` little-endian CRC32 values at `crc_origin`

use std::io::Read;

use bytes::BufMut;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, LittleEndian, Unaligned, U32};

use crate::error::{Error, Result};

pub const MAGIC: [u8; 4] = *b"STPA";
pub const VERSION_MAJOR: u8 = 1;
pub const VERSION_MINOR: u8 = 0;

/// Longest entry name that fits the one-byte length prefix
pub const MAX_NAME_LEN: usize = 254;

#[derive(Debug, Clone, PartialEq, Eq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct Header {
    pub magic: [u8; 4],
    pub version_major: u8,
    pub version_minor: u8,
    pub reserved: u8,
    pub flags: u8,
    pub raw_size: U32<LittleEndian>,
    pub uncompressed_size: U32<LittleEndian>,
    pub data_origin: U32<LittleEndian>,
    pub crc_origin: U32<LittleEndian>,
    pub entry_count: U32<LittleEndian>,
}

impl Header {
    pub const SIZE: usize = 28;

    pub const FLAG_COMPRESSED: u8 = 1 << 0;
    pub const FLAG_CRC: u8 = 1 << 1;

    /// Header for the current format version, all sizes zeroed
    pub fn new(compressed: bool, crc: bool) -> Self {
        let mut header = Self::new_zeroed();
        header.magic = MAGIC;
        header.version_major = VERSION_MAJOR;
        header.version_minor = VERSION_MINOR;
        if compressed {
            header.flags |= Self::FLAG_COMPRESSED;
        }
        if crc {
            header.flags |= Self::FLAG_CRC;
        }
        header
    }

    /// Reads the fixed header and checks the magic. Nothing else is validated.
    pub fn read(mut reader: impl Read) -> Result<Self> {
        let mut header = Self::new_zeroed();
        reader
            .read_exact(header.as_mut_bytes())
            .map_err(Error::read("archive header"))?;

        if header.magic != MAGIC {
            return Err(Error::IdentifierMismatch(header.magic));
        }

        Ok(header)
    }

    pub fn is_compressed(&self) -> bool {
        self.flags & Self::FLAG_COMPRESSED != 0
    }

    pub fn has_crc(&self) -> bool {
        self.flags & Self::FLAG_CRC != 0
    }
}

/// Fixed-size tail of an entry descriptor, following the name bytes
#[derive(Debug, Clone, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
#[repr(C)]
pub struct DescriptorTail {
    /// Offset within the uncompressed payload
    pub offset: U32<LittleEndian>,
    pub length: U32<LittleEndian>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Descriptor {
    pub name: Vec<u8>,
    pub offset: u32,
    pub length: u32,
}

impl Descriptor {
    pub fn read(mut reader: impl Read) -> Result<Self> {
        let mut name_len = 0u8;
        reader
            .read_exact(name_len.as_mut_bytes())
            .map_err(Error::read("entry name length"))?;

        if name_len == 0 {
            return Err(Error::OutOfRange("entry name length must be more than zero".into()));
        }

        let mut name = vec![0u8; name_len as usize];
        reader
            .read_exact(&mut name)
            .map_err(Error::read("entry name"))?;

        let mut tail = DescriptorTail::new_zeroed();
        reader
            .read_exact(tail.as_mut_bytes())
            .map_err(Error::read("entry location"))?;

        Ok(Self {
            name,
            offset: tail.offset.get(),
            length: tail.length.get(),
        })
    }

    pub fn write(&self, mut buf: impl BufMut) {
        debug_assert!(!self.name.is_empty() && self.name.len() <= MAX_NAME_LEN);

        buf.put_u8(self.name.len() as u8);
        buf.put_slice(&self.name);
        let tail = DescriptorTail {
            offset: self.offset.into(),
            length: self.length.into(),
        };
        buf.put_slice(tail.as_bytes());
    }

    /// Size on disk
    pub fn encoded_len(name_len: usize) -> usize {
        1 + name_len + size_of::<DescriptorTail>()
    }
}

/// CRC32 (IEEE, the zlib polynomial) of `data`
pub fn crc32(data: &[u8]) -> u32 {
    crc32fast::hash(data)
}

/// Cuts `name` down to [MAX_NAME_LEN] bytes.
pub fn truncate_name(name: &[u8]) -> &[u8] {
    &name[..name.len().min(MAX_NAME_LEN)]
}
