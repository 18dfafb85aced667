//! Immutable in-memory archive: one payload buffer plus an index of named ranges into it

use core::{fmt::Debug, ops::Range};
use std::{
    borrow::Cow,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

use bytes::{BufMut, Bytes};
use flate2::Compression;
use log::debug;
use zerocopy::{IntoBytes, LittleEndian, U32};

use crate::{
    compression::PayloadCompression,
    error::{Error, Result},
    format::{self, Descriptor, Header},
};

mod reader;

/// A named view into an [Archive]'s payload.
///
/// Entries hold no data of their own; they are only meaningful together with the archive that
/// produced them, and live exactly as long as it does.
#[derive(Clone, PartialEq, Eq)]
pub struct Entry {
    name: Box<[u8]>,
    offset: usize,
    len: usize,
}

impl Entry {
    /// Raw name bytes. Names have no mandated encoding.
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn name_lossy(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.name)
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.offset + self.len
    }
}

impl Debug for Entry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Entry")
            .field("name", &self.name_lossy())
            .field("offset", &self.offset)
            .field("len", &self.len)
            .finish()
    }
}

/// Serialization settings for [Archive::write_to]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteOptions {
    /// Store the payload as a single zlib stream
    pub compressed: bool,
    /// Append a CRC32 table, verified when the archive is opened
    pub crc: bool,
    /// zlib level, only used when `compressed` is set
    pub level: Compression,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            compressed: false,
            crc: false,
            level: Compression::default(),
        }
    }
}

impl WriteOptions {
    pub fn compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    pub fn crc(mut self, crc: bool) -> Self {
        self.crc = crc;
        self
    }

    pub fn level(mut self, level: Compression) -> Self {
        self.level = level;
        self
    }

    fn payload_compression(&self) -> PayloadCompression {
        if self.compressed {
            PayloadCompression::Zlib(self.level)
        } else {
            PayloadCompression::None
        }
    }
}

/// Immutable collection of named entries backed by one contiguous payload.
///
/// Entry ranges tile the payload in order, without gaps or overlap. Cloning is cheap, the payload
/// is reference counted.
#[derive(Clone, Default)]
pub struct Archive {
    payload: Bytes,
    entries: Vec<Entry>,
}

impl Debug for Archive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Archive")
            .field("payload.len()", &self.payload.len())
            .field("entries", &self.entries)
            .finish()
    }
}

impl Archive {
    /// Builds an archive over `payload` from `(name, len)` pairs laid out back to back.
    pub(crate) fn from_parts<N>(payload: Bytes, layout: impl IntoIterator<Item = (N, usize)>) -> Self
    where
        N: Into<Box<[u8]>>,
    {
        let mut offset = 0;
        let entries: Vec<Entry> = layout
            .into_iter()
            .map(|(name, len)| {
                let entry = Entry {
                    name: name.into(),
                    offset,
                    len,
                };
                offset += len;
                entry
            })
            .collect();

        debug_assert_eq!(offset, payload.len());
        Self { payload, entries }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Total size of the uncompressed payload
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    pub fn has_entry(&self, name: impl AsRef<[u8]>) -> bool {
        self.find(name.as_ref()).is_some()
    }

    /// First entry whose name equals `name` byte for byte.
    pub fn entry(&self, name: impl AsRef<[u8]>) -> Result<&Entry> {
        let name = name.as_ref();
        self.find(name)
            .ok_or_else(|| Error::EntryNotFound(String::from_utf8_lossy(name).into_owned()))
    }

    fn find(&self, name: &[u8]) -> Option<&Entry> {
        self.entries.iter().find(|entry| &*entry.name == name)
    }

    /// Bytes of `entry`, which must come from this archive.
    ///
    /// An entry whose range lies outside the payload is rejected. An entry from another archive
    /// whose range happens to fit is not detected and yields unrelated bytes.
    pub fn entry_data(&self, entry: &Entry) -> Result<&[u8]> {
        self.payload.get(entry.range()).ok_or_else(|| {
            Error::OutOfRange(format!(
                "entry {:?} lies outside of a {} byte payload",
                entry.name_lossy(),
                self.payload.len()
            ))
        })
    }

    /// Copies up to `buffer.len()` bytes of `entry` into `buffer` and returns the count copied.
    pub fn read_entry(&self, entry: &Entry, buffer: &mut [u8]) -> Result<usize> {
        if buffer.is_empty() {
            return Err(Error::OutOfRange(format!(
                "buffer for entry {:?} cannot be zero sized",
                entry.name_lossy()
            )));
        }

        let data = self.entry_data(entry)?;
        let len = data.len().min(buffer.len());
        buffer[..len].copy_from_slice(&data[..len]);
        Ok(len)
    }

    pub fn extract_entry(&self, entry: &Entry, mut writer: impl Write) -> Result<()> {
        let data = self.entry_data(entry)?;
        writer
            .write_all(data)
            .and_then(|_| writer.flush())
            .map_err(Error::write(format!("data of entry {:?}", entry.name_lossy())))
    }

    /// Writes the entry to a newly created (or truncated) file at `path`.
    pub fn extract_entry_to_path(&self, entry: &Entry, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file = File::create(path).map_err(Error::open(path))?;
        self.extract_entry(entry, BufWriter::new(file))
    }

    pub fn write_to(&self, mut writer: impl Write, options: &WriteOptions) -> Result<()> {
        let crc = options.crc.then(|| self.checksums());
        let encoded = self.encode(options.payload_compression(), crc.as_deref())?;

        writer
            .write_all(&encoded)
            .and_then(|_| writer.flush())
            .map_err(Error::write("archive"))
    }

    /// Writes the archive to `path`. A file left behind by a failed write is removed.
    pub fn write_to_path(&self, path: impl AsRef<Path>, options: &WriteOptions) -> Result<()> {
        let crc = options.crc.then(|| self.checksums());
        self.encode_to_path(path.as_ref(), options.payload_compression(), crc.as_deref())
    }

    pub(crate) fn encode_to_path(
        &self,
        path: &Path,
        compression: PayloadCompression,
        crc: Option<&[u32]>,
    ) -> Result<()> {
        let encoded = self.encode(compression, crc)?;
        let mut file = File::create(path).map_err(Error::open(path))?;

        let written = file.write_all(&encoded).and_then(|_| file.flush());
        drop(file);

        written
            .map_err(Error::write(path.display().to_string()))
            .inspect_err(|_| {
                std::fs::remove_file(path)
                    .inspect_err(|e| log::warn!("unable to remove {}: {e}", path.display()))
                    .ok();
            })
    }

    /// CRC32 of every entry, in entry order
    pub fn checksums(&self) -> Vec<u32> {
        self.entries
            .iter()
            .map(|entry| format::crc32(&self.payload[entry.range()]))
            .collect()
    }

    /// Produces the complete on-disk image.
    pub(crate) fn encode(&self, compression: PayloadCompression, crc: Option<&[u32]>) -> Result<Vec<u8>> {
        if let Some(crc) = crc {
            if crc.len() != self.entries.len() {
                return Err(Error::InvalidArgument(format!(
                    "{} checksums given for {} entries",
                    crc.len(),
                    self.entries.len()
                )));
            }
        }

        let table_len: usize = self
            .entries
            .iter()
            .map(|entry| Descriptor::encoded_len(entry.name.len()))
            .sum();
        let data_origin = Header::SIZE + table_len;

        let mut stored = vec![];
        compression.compress(&self.payload, &mut stored)?;

        let mut header = Header::new(compression.is_compressed(), crc.is_some());
        header.raw_size = to_u32(stored.len(), "payload size")?.into();
        header.uncompressed_size = to_u32(self.payload.len(), "uncompressed payload size")?.into();
        header.data_origin = to_u32(data_origin, "data origin")?.into();
        header.crc_origin = match crc {
            Some(_) => to_u32(data_origin + stored.len(), "CRC origin")?,
            None => 0,
        }
        .into();
        header.entry_count = to_u32(self.entries.len(), "entry count")?.into();

        let crc_len = crc.map_or(0, |crc| crc.len() * size_of::<u32>());
        let mut out = Vec::with_capacity(data_origin + stored.len() + crc_len);
        out.put_slice(header.as_bytes());

        for entry in &self.entries {
            Descriptor {
                name: entry.name.to_vec(),
                offset: to_u32(entry.offset, "entry offset")?,
                length: to_u32(entry.len, "entry length")?,
            }
            .write(&mut out);
        }
        debug_assert_eq!(out.len(), data_origin);

        out.put_slice(&stored);
        if let Some(crc) = crc {
            for value in crc {
                out.put_slice(U32::<LittleEndian>::new(*value).as_bytes());
            }
        }

        debug!(
            "encoded {} entries: {} payload bytes stored as {}, {} bytes total",
            self.entries.len(),
            self.payload.len(),
            stored.len(),
            out.len()
        );
        Ok(out)
    }
}

fn to_u32(value: usize, what: &str) -> Result<u32> {
    u32::try_from(value).map_err(|_| Error::OutOfRange(format!("{what} {value} doesn't fit in 32 bits")))
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use zerocopy::FromBytes;

    use super::{Archive, WriteOptions};
    use crate::{
        error::ErrorKind,
        format::{Descriptor, Header},
    };

    fn sample() -> Archive {
        Archive::from_parts(
            Bytes::from_static(b"hello\x00\x01\x02\x03"),
            [(b"a.txt".to_vec(), 5), (b"b.bin".to_vec(), 4)],
        )
    }

    #[test]
    fn entries_tile_payload() {
        let archive = sample();
        let a = archive.entry("a.txt").unwrap();
        let b = archive.entry("b.bin").unwrap();

        assert_eq!(a.range(), 0..5);
        assert_eq!(b.range(), 5..9);
        assert_eq!(archive.payload_len(), 9);
        assert_eq!(archive.entry_data(b).unwrap(), &[0, 1, 2, 3]);
    }

    #[test]
    fn lookup() {
        let archive = sample();
        assert!(archive.has_entry("a.txt"));
        assert!(!archive.has_entry("a.tx"));
        assert!(!archive.has_entry(""));

        let err = archive.entry("c.txt").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::EntryNotFound);

        let empty = Archive::default();
        assert!(!empty.has_entry("a.txt"));
        assert_eq!(empty.entry("a.txt").unwrap_err().kind(), ErrorKind::EntryNotFound);
    }

    #[test]
    fn duplicate_names_resolve_to_first() {
        let archive = Archive::from_parts(
            Bytes::from_static(b"firstsecond"),
            [(b"dup".to_vec(), 5), (b"dup".to_vec(), 6)],
        );
        let entry = archive.entry("dup").unwrap();
        assert_eq!(archive.entry_data(entry).unwrap(), b"first");
    }

    #[test]
    fn partial_read_is_bounded() {
        let archive = sample();
        let entry = archive.entry("a.txt").unwrap();

        let mut small = [0u8; 3];
        assert_eq!(archive.read_entry(entry, &mut small).unwrap(), 3);
        assert_eq!(&small, b"hel");

        let mut large = [0xFFu8; 8];
        assert_eq!(archive.read_entry(entry, &mut large).unwrap(), 5);
        assert_eq!(&large[..5], b"hello");
        assert_eq!(large[5], 0xFF);

        let err = archive.read_entry(entry, &mut []).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn foreign_entry_is_rejected() {
        let archive = sample();
        let other = Archive::from_parts(Bytes::from(vec![0u8; 64]), [(b"big".to_vec(), 64)]);
        let entry = other.entry("big").unwrap();

        let err = archive.entry_data(entry).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn extract_reports_sink_failure() {
        struct Refuse;
        impl std::io::Write for Refuse {
            fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
                Err(std::io::ErrorKind::BrokenPipe.into())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let archive = sample();
        let entry = archive.entry("a.txt").unwrap();
        let err = archive.extract_entry(entry, Refuse).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Write);

        let mut out = vec![];
        archive.extract_entry(entry, &mut out).unwrap();
        assert_eq!(out, b"hello");
    }

    #[test]
    fn encoded_header_bookkeeping() {
        let archive = sample();
        let image = archive
            .encode(WriteOptions::default().payload_compression(), Some(&archive.checksums()))
            .unwrap();

        let (header, _) = Header::read_from_prefix(&image).unwrap();
        let data_origin = Header::SIZE + Descriptor::encoded_len(5) * 2;

        assert_eq!(header.entry_count.get(), 2);
        assert_eq!(header.raw_size.get(), 9);
        assert_eq!(header.uncompressed_size.get(), 9);
        assert_eq!(header.data_origin.get() as usize, data_origin);
        assert_eq!(header.crc_origin.get() as usize, data_origin + 9);
        assert!(header.has_crc());
        assert!(!header.is_compressed());
        assert_eq!(image.len(), data_origin + 9 + 8);
        assert_eq!(&image[data_origin..data_origin + 9], b"hello\x00\x01\x02\x03");
    }

    #[test]
    fn encode_rejects_mismatched_checksums() {
        let archive = sample();
        let err = archive
            .encode(WriteOptions::default().payload_compression(), Some(&[0]))
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidArgument);
    }

    #[test]
    fn archive_is_shareable() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<Archive>();
    }
}
