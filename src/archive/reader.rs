use std::{
    fs::File,
    io::{BufReader, Cursor, Read, Seek, SeekFrom},
    path::Path,
};

use bytes::Bytes;
use log::{debug, trace, warn};
use zerocopy::{IntoBytes, LittleEndian, U32};

use super::{Archive, Entry};
use crate::{
    compression::PayloadCompression,
    error::{try_alloc, Error, Result},
    format::{self, Descriptor, Header},
};

const MAX_PREALLOCATED_ENTRIES: usize = 4096;

impl Archive {
    /// Opens the archive stored at `path`.
    pub fn open_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(Error::open(path))?;
        Self::open(BufReader::new(file))
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        Self::open(Cursor::new(data))
    }

    /// Parses a complete archive from `reader`.
    ///
    /// Either every check passes and the whole archive is returned, or nothing is: a single
    /// corrupt descriptor or CRC value fails the entire open.
    pub fn open<R: Read + Seek>(mut reader: R) -> Result<Self> {
        let header = Header::read(&mut reader)?;
        let entry_count = header.entry_count.get() as usize;
        debug!(
            "archive v{}.{}: {} entries, flags {:#04b}, {} stored payload bytes",
            header.version_major,
            header.version_minor,
            entry_count,
            header.flags,
            header.raw_size.get()
        );

        // The count is untrusted; the table only grows as descriptors are actually read.
        let mut descriptors = try_alloc::<Descriptor>(entry_count.min(MAX_PREALLOCATED_ENTRIES))?;
        for _ in 0..entry_count {
            descriptors.push(Descriptor::read(&mut reader)?);
        }

        let expected_origin: usize = Header::SIZE
            + descriptors
                .iter()
                .map(|d| Descriptor::encoded_len(d.name.len()))
                .sum::<usize>();
        if header.data_origin.get() as usize != expected_origin {
            warn!(
                "data origin is {}, descriptor table ends at {expected_origin}",
                header.data_origin.get()
            );
        }

        reader
            .seek(SeekFrom::Start(header.data_origin.get().into()))
            .map_err(Error::read("payload"))?;
        let raw_size = header.raw_size.get() as usize;
        let raw = reader.read_section(raw_size, "payload")?;

        let (compression, payload_len) = if header.is_compressed() {
            (
                PayloadCompression::from_flag(true),
                header.uncompressed_size.get() as usize,
            )
        } else {
            let described = descriptors
                .iter()
                .fold(0usize, |total, d| total.saturating_add(d.length as usize));
            (PayloadCompression::None, described)
        };
        let payload = compression.decompress(raw, payload_len)?;

        let entries = index_entries(descriptors, payload.len())?;
        let archive = Archive {
            payload: Bytes::from(payload),
            entries,
        };

        if header.has_crc() {
            reader
                .seek(SeekFrom::Start(header.crc_origin.get().into()))
                .map_err(Error::read("CRC table"))?;
            let table = reader.read_crc_table(entry_count)?;
            verify_checksums(&archive, &table)?;
        }

        Ok(archive)
    }
}

/// Turns descriptors into entries, checking they tile a payload of `payload_len` bytes in order.
fn index_entries(descriptors: Vec<Descriptor>, payload_len: usize) -> Result<Vec<Entry>> {
    let mut entries = try_alloc::<Entry>(descriptors.len())?;
    let mut expected_offset = 0usize;

    for descriptor in descriptors {
        let offset = descriptor.offset as usize;
        let len = descriptor.length as usize;
        let name = String::from_utf8_lossy(&descriptor.name).into_owned();

        if offset != expected_offset {
            return Err(Error::OutOfRange(format!(
                "entry {name:?} starts at {offset}, expected {expected_offset}"
            )));
        }
        let end = offset
            .checked_add(len)
            .filter(|end| *end <= payload_len)
            .ok_or_else(|| {
                Error::OutOfRange(format!(
                    "entry {name:?} ({len} bytes at {offset}) exceeds {payload_len} byte payload"
                ))
            })?;

        trace!("entry {name:?}: {len} bytes at {offset}");
        entries.push(Entry {
            name: descriptor.name.into_boxed_slice(),
            offset,
            len,
        });
        expected_offset = end;
    }

    if expected_offset != payload_len {
        return Err(Error::OutOfRange(format!(
            "entries cover {expected_offset} of {payload_len} payload bytes"
        )));
    }

    Ok(entries)
}

fn verify_checksums(archive: &Archive, table: &[u32]) -> Result<()> {
    for (entry, expected) in archive.entries.iter().zip(table) {
        let actual = format::crc32(&archive.payload[entry.range()]);
        if actual != *expected {
            return Err(Error::CrcMismatch {
                name: entry.name_lossy().into_owned(),
                expected: *expected,
                actual,
            });
        }
    }
    Ok(())
}

trait ReadSection {
    /// Reads exactly `len` bytes, failing on a short read.
    fn read_section(&mut self, len: usize, what: &'static str) -> Result<Vec<u8>>;

    fn read_crc_table(&mut self, count: usize) -> Result<Vec<u32>>;
}

impl<R: Read> ReadSection for R {
    fn read_section(&mut self, len: usize, what: &'static str) -> Result<Vec<u8>> {
        let mut buf = try_alloc(len)?;
        let copied = self
            .by_ref()
            .take(len as u64)
            .read_to_end(&mut buf)
            .map_err(Error::read(what))?;

        if copied != len {
            return Err(Error::Read {
                what,
                source: std::io::Error::from(std::io::ErrorKind::UnexpectedEof),
            });
        }
        Ok(buf)
    }

    fn read_crc_table(&mut self, count: usize) -> Result<Vec<u32>> {
        let mut table = try_alloc::<U32<LittleEndian>>(count)?;
        table.resize(count, U32::ZERO);
        self.read_exact(table.as_mut_slice().as_mut_bytes())
            .map_err(Error::read("CRC table"))?;

        Ok(table.into_iter().map(|value| value.get()).collect())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use zerocopy::FromBytes;

    use crate::{
        archive::{Archive, WriteOptions},
        error::ErrorKind,
        format::{Descriptor, Header},
    };

    fn sample() -> Archive {
        Archive::from_parts(
            Bytes::from_static(b"hello\x00\x01\x02\x03"),
            [(b"a.txt".to_vec(), 5), (b"b.bin".to_vec(), 4)],
        )
    }

    fn image(options: WriteOptions) -> Vec<u8> {
        let mut out = vec![];
        sample().write_to(&mut out, &options).unwrap();
        out
    }

    fn patch_header(image: &mut [u8], patch: impl FnOnce(&mut Header)) {
        let (header, _) = Header::mut_from_prefix(image).unwrap();
        patch(header);
    }

    #[test]
    fn plain_round_trip() {
        let archive = Archive::from_bytes(&image(WriteOptions::default())).unwrap();

        assert_eq!(archive.len(), 2);
        let a = archive.entry("a.txt").unwrap();
        let b = archive.entry("b.bin").unwrap();
        assert_eq!(archive.entry_data(a).unwrap(), b"hello");
        assert_eq!(archive.entry_data(b).unwrap(), &[0, 1, 2, 3]);
    }

    #[test]
    fn compressed_round_trip_with_crc() {
        let image = image(WriteOptions::default().compressed(true).crc(true));
        let (header, _) = Header::read_from_prefix(&image[..]).unwrap();
        assert!(header.is_compressed());
        assert_eq!(header.uncompressed_size.get(), 9);

        let archive = Archive::from_bytes(&image).unwrap();
        let b = archive.entry("b.bin").unwrap();
        assert_eq!(archive.entry_data(b).unwrap(), &[0, 1, 2, 3]);
    }

    #[test]
    fn flipped_payload_byte_fails_crc() {
        let mut image = image(WriteOptions::default().crc(true));
        let data_origin = Header::SIZE + Descriptor::encoded_len(5) * 2;

        for i in 0..9 {
            let mut corrupt = image.clone();
            corrupt[data_origin + i] ^= 0x40;
            let err = Archive::from_bytes(&corrupt).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Crc, "byte {i}");
        }

        // Same corruption without a CRC table goes unnoticed.
        patch_header(&mut image, |h| h.flags &= !Header::FLAG_CRC);
        image[data_origin] ^= 0x40;
        let archive = Archive::from_bytes(&image).unwrap();
        let a = archive.entry("a.txt").unwrap();
        assert_eq!(archive.entry_data(a).unwrap(), b"(ello");
    }

    #[test]
    fn bad_magic() {
        let mut image = image(WriteOptions::default());
        image[..4].copy_from_slice(b"APTS");
        let err = Archive::from_bytes(&image).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::IdentifierMismatch);
    }

    #[test]
    fn truncation_anywhere_is_a_read_error() {
        let image = image(WriteOptions::default().crc(true));
        for len in [0, Header::SIZE - 1, Header::SIZE + 3, image.len() - 12, image.len() - 1] {
            let err = Archive::from_bytes(&image[..len]).unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Read, "length {len}");
        }
    }

    #[test]
    fn zero_name_length() {
        let mut image = image(WriteOptions::default());
        image[Header::SIZE] = 0;
        let err = Archive::from_bytes(&image).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn descriptor_outside_payload() {
        let mut image = image(WriteOptions::default());
        // length field of the second descriptor
        let at = Header::SIZE + Descriptor::encoded_len(5) + 1 + 5 + 4;
        image[at..at + 4].copy_from_slice(&5u32.to_le_bytes());
        let err = Archive::from_bytes(&image).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn plain_payload_shorter_than_entries() {
        let mut image = image(WriteOptions::default());
        patch_header(&mut image, |h| h.raw_size = 8u32.into());
        let err = Archive::from_bytes(&image).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
        assert!(err.to_string().contains("entries describe 9"), "{err}");
    }

    #[test]
    fn overlapping_descriptors() {
        let mut image = image(WriteOptions::default());
        // offset field of the second descriptor
        let at = Header::SIZE + Descriptor::encoded_len(5) + 1 + 5;
        image[at..at + 4].copy_from_slice(&4u32.to_le_bytes());
        let err = Archive::from_bytes(&image).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfRange);
    }

    #[test]
    fn huge_entry_count_fails_cleanly() {
        let mut image = image(WriteOptions::default());
        patch_header(&mut image, |h| h.entry_count = u32::MAX.into());
        let err = Archive::from_bytes(&image).unwrap_err();
        // Runs out of input right after the two real descriptors.
        assert_eq!(err.kind(), ErrorKind::Read);
    }

    #[test]
    fn empty_archive_round_trip() {
        let mut out = vec![];
        Archive::default()
            .write_to(&mut out, &WriteOptions::default().compressed(true).crc(true))
            .unwrap();

        let (header, _) = Header::read_from_prefix(&out[..]).unwrap();
        assert_eq!(header.entry_count.get(), 0);
        assert_eq!(header.uncompressed_size.get(), 0);

        let archive = Archive::from_bytes(&out).unwrap();
        assert!(archive.is_empty());
        assert_eq!(archive.payload_len(), 0);
    }
}
