//! Mutable accumulator of entries that compiles into an [Archive]

use core::fmt::Debug;
use std::{
    fs::File,
    io::{BufReader, Read, Write},
    path::Path,
};

use bytes::Bytes;
use log::{debug, trace};
use tap::Pipe;

use crate::{
    archive::Archive,
    compression::PayloadCompression,
    error::{try_alloc, Error, Result},
    format::{self, MAX_NAME_LEN},
};

/// Number of slots added when appending to a full builder
pub const GROW_STEP: usize = 5;

struct BuilderEntry {
    name: Box<[u8]>,
    data: Vec<u8>,
}

/// Collects named byte buffers, then turns them into an [Archive] or writes them out directly.
///
/// Capacity is tracked explicitly: it only grows through [ArchiveBuilder::reserve] or by
/// [GROW_STEP] when an append finds the builder full, and drops back to zero whenever the
/// builder is cleared.
#[derive(Default)]
pub struct ArchiveBuilder {
    entries: Vec<BuilderEntry>,
    capacity: usize,
    /// One slot per unit of capacity when checksums were requested
    crc: Option<Vec<u32>>,
    generate_crc: bool,
    reject_duplicates: bool,
}

impl Debug for ArchiveBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ArchiveBuilder")
            .field("len()", &self.entries.len())
            .field("capacity", &self.capacity)
            .field("generate_crc", &self.generate_crc)
            .field("reject_duplicates", &self.reject_duplicates)
            .finish()
    }
}

impl ArchiveBuilder {
    /// Preallocates `capacity` entry slots, and as many CRC slots if `generate_crc` is set.
    pub fn new(capacity: usize, generate_crc: bool) -> Result<Self> {
        let mut builder = Self {
            crc: generate_crc.then(Vec::new),
            generate_crc,
            ..Self::default()
        };
        if capacity > 0 {
            builder.reserve(capacity)?;
        }
        Ok(builder)
    }

    /// When set, appending a name that is already present fails with
    /// [Error::EntryRedefinition]. Off by default: duplicates are kept and lookups return the
    /// first one.
    pub fn reject_duplicates(mut self, reject: bool) -> Self {
        self.reject_duplicates = reject;
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn generates_crc(&self) -> bool {
        self.generate_crc
    }

    /// Entry names in append order
    pub fn names(&self) -> impl Iterator<Item = &[u8]> {
        self.entries.iter().map(|entry| &*entry.name)
    }

    /// Grows the builder to `capacity` slots.
    ///
    /// Asking for no more than the current capacity is an error and leaves the builder as it
    /// was, except on a builder with no storage yet, which takes `capacity` as given.
    pub fn reserve(&mut self, capacity: usize) -> Result<()> {
        if self.capacity != 0 && capacity <= self.capacity {
            return Err(Error::InvalidArgument(format!(
                "capacity must be more than the current {}, got {capacity}",
                self.capacity
            )));
        }

        let additional = capacity - self.entries.len();
        self.entries
            .try_reserve_exact(additional)
            .map_err(|_| {
                Error::OutOfMemory(additional.saturating_mul(size_of::<BuilderEntry>()))
            })?;
        if let Some(crc) = self.crc.as_mut() {
            crc.try_reserve_exact(capacity - crc.len())
                .map_err(|_| Error::OutOfMemory(capacity.saturating_mul(size_of::<u32>())))?;
            crc.resize(capacity, 0);
        }

        trace!("builder capacity {} -> {capacity}", self.capacity);
        self.capacity = capacity;
        Ok(())
    }

    /// Appends a copy of `data`. Names longer than [MAX_NAME_LEN] bytes are truncated.
    pub fn append_bytes(&mut self, name: impl AsRef<[u8]>, data: impl AsRef<[u8]>) -> Result<()> {
        let data = data.as_ref();
        let mut owned = try_alloc(data.len())?;
        owned.extend_from_slice(data);
        self.push(name.as_ref(), owned)
    }

    /// Appends `data` without copying it.
    pub fn append_vec(&mut self, name: impl AsRef<[u8]>, data: Vec<u8>) -> Result<()> {
        self.push(name.as_ref(), data)
    }

    /// Appends the UTF-8 bytes of `value`, without a terminator.
    pub fn append_str(&mut self, name: impl AsRef<[u8]>, value: &str) -> Result<()> {
        self.append_bytes(name, value)
    }

    /// Appends everything `reader` yields until end of stream.
    pub fn append_reader(&mut self, name: impl AsRef<[u8]>, mut reader: impl Read) -> Result<()> {
        let mut data = vec![];
        reader
            .read_to_end(&mut data)
            .map_err(Error::read("entry source"))?;
        self.push(name.as_ref(), data)
    }

    /// Appends the contents of the file at `path`, named after the file's base name.
    pub fn append_file(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let name = path.file_name().ok_or_else(|| {
            Error::InvalidArgument(format!("{} doesn't name a file", path.display()))
        })?;
        self.append_file_as(path, name.as_encoded_bytes())
    }

    /// Appends the contents of the file at `path` under `name`.
    pub fn append_file_as(&mut self, path: impl AsRef<Path>, name: impl AsRef<[u8]>) -> Result<()> {
        let path = path.as_ref();
        let name = name.as_ref();
        if name.is_empty() {
            return Err(Error::OutOfRange(format!(
                "entry name for {} must not be empty",
                path.display()
            )));
        }

        File::open(path)
            .map_err(Error::open(path))?
            .pipe(BufReader::new)
            .pipe(|reader| self.append_reader(name, reader))
    }

    /// Re-appends every entry of `archive`, in order.
    ///
    /// Not transactional: if an append fails part-way, the entries before it stay appended.
    pub fn append_archive(&mut self, archive: &Archive) -> Result<()> {
        for entry in archive.entries() {
            self.append_bytes(entry.name(), archive.entry_data(entry)?)?;
        }
        Ok(())
    }

    fn push(&mut self, name: &[u8], data: Vec<u8>) -> Result<()> {
        if name.is_empty() {
            return Err(Error::OutOfRange("entry name must not be empty".into()));
        }
        if name.len() > MAX_NAME_LEN {
            debug!(
                "truncating {} byte entry name to {MAX_NAME_LEN}",
                name.len()
            );
        }
        let name = format::truncate_name(name);

        if self.reject_duplicates && self.names().any(|existing| existing == name) {
            return Err(Error::EntryRedefinition(
                String::from_utf8_lossy(name).into_owned(),
            ));
        }

        if self.entries.len() >= self.capacity {
            self.reserve(self.entries.len() + GROW_STEP)?;
        }

        trace!(
            "append {:?}: {} bytes",
            String::from_utf8_lossy(name),
            data.len()
        );
        self.entries.push(BuilderEntry {
            name: name.into(),
            data,
        });
        Ok(())
    }

    /// Drops every entry and CRC slot, leaving the builder empty with no capacity.
    pub fn clear(&mut self) {
        self.entries = Vec::new();
        self.capacity = 0;
        self.crc = self.generate_crc.then(Vec::new);
    }

    /// Copies every entry into one contiguous payload, in append order, and clears the builder.
    ///
    /// No checksums are computed here; they are produced when writing.
    pub fn finalize(&mut self) -> Result<Archive> {
        let total = self
            .entries
            .iter()
            .try_fold(0usize, |total, entry| total.checked_add(entry.data.len()))
            .ok_or_else(|| Error::OutOfRange("total payload size overflows".into()))?;

        let mut payload = try_alloc::<u8>(total)?;
        for entry in &self.entries {
            payload.extend_from_slice(&entry.data);
        }

        let layout: Vec<_> = std::mem::take(&mut self.entries)
            .into_iter()
            .map(|entry| (entry.name, entry.data.len()))
            .collect();
        debug!("finalized {} entries, {total} payload bytes", layout.len());

        self.clear();
        Ok(payload
            .pipe(Bytes::from)
            .pipe(|payload| Archive::from_parts(payload, layout)))
    }

    /// Finalizes the builder and writes the archive to `writer`.
    ///
    /// Nothing reaches `writer` unless the whole archive could be encoded.
    pub fn finalize_to_sink(&mut self, mut writer: impl Write, compressed: bool) -> Result<()> {
        let crc = self.fill_checksums();
        let archive = self.finalize()?;
        let encoded = archive.encode(PayloadCompression::from_flag(compressed), crc.as_deref())?;
        drop(archive);

        writer
            .write_all(&encoded)
            .and_then(|_| writer.flush())
            .map_err(Error::write("archive"))
    }

    /// Finalizes the builder and writes the archive to a file at `path`, removing the file again
    /// if writing fails.
    pub fn finalize_to_path(&mut self, path: impl AsRef<Path>, compressed: bool) -> Result<()> {
        let crc = self.fill_checksums();
        self.finalize()?
            .encode_to_path(path.as_ref(), PayloadCompression::from_flag(compressed), crc.as_deref())
    }

    /// Computes the CRC slot of every entry, if checksums were requested.
    fn fill_checksums(&mut self) -> Option<Vec<u32>> {
        let slots = self.crc.as_mut()?;
        for (slot, entry) in slots.iter_mut().zip(&self.entries) {
            *slot = format::crc32(&entry.data);
        }
        Some(slots[..self.entries.len()].to_vec())
    }
}
