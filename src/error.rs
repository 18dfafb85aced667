//! Error types for reading and building stockpile archives

use std::{io, path::PathBuf};

use thiserror::Error;

use crate::format::MAGIC;

/// Result type for stockpile operations
pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], stable across releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    InvalidArgument,
    OutOfMemory,
    OutOfRange,
    NotFound,
    Open,
    Read,
    Write,
    IdentifierMismatch,
    Crc,
    EntryRedefinition,
    EntryNotFound,
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Argument has an unexpected value
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An allocation sized from archive metadata or caller input failed
    #[error("failed to allocate {0} bytes")]
    OutOfMemory(usize),

    /// Value is out of range, e.g. a zero-length name or buffer
    #[error("out of range: {0}")]
    OutOfRange(String),

    #[error("file {} doesn't exist", .0.display())]
    NotFound(PathBuf),

    /// Opening a file failed for a reason other than it not existing
    #[error("failed to open {}: {source}", path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Short read, unexpected end of data or a corrupt compressed stream
    #[error("failed to read {what}: {source}")]
    Read {
        what: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("failed to write {what}: {source}")]
    Write {
        what: String,
        #[source]
        source: io::Error,
    },

    #[error("identifier mismatch: expected {:?}, found {:?}", MAGIC, .0)]
    IdentifierMismatch([u8; 4]),

    #[error("CRC of entry {name:?} doesn't match: stored {expected:#010x}, computed {actual:#010x}")]
    CrcMismatch {
        name: String,
        expected: u32,
        actual: u32,
    },

    #[error("entry {0:?} is already defined")]
    EntryRedefinition(String),

    #[error("entry {0:?} not found")]
    EntryNotFound(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::InvalidArgument(_) => ErrorKind::InvalidArgument,
            Error::OutOfMemory(_) => ErrorKind::OutOfMemory,
            Error::OutOfRange(_) => ErrorKind::OutOfRange,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::Open { .. } => ErrorKind::Open,
            Error::Read { .. } => ErrorKind::Read,
            Error::Write { .. } => ErrorKind::Write,
            Error::IdentifierMismatch(_) => ErrorKind::IdentifierMismatch,
            Error::CrcMismatch { .. } => ErrorKind::Crc,
            Error::EntryRedefinition(_) => ErrorKind::EntryRedefinition,
            Error::EntryNotFound(_) => ErrorKind::EntryNotFound,
        }
    }

    pub(crate) fn read(what: &'static str) -> impl FnOnce(io::Error) -> Self {
        move |source| Error::Read { what, source }
    }

    pub(crate) fn write(what: impl Into<String>) -> impl FnOnce(io::Error) -> Self {
        let what = what.into();
        move |source| Error::Write { what, source }
    }

    /// Maps a failure to open `path`, distinguishing a missing file.
    pub(crate) fn open(path: impl Into<PathBuf>) -> impl FnOnce(io::Error) -> Self {
        let path = path.into();
        move |source| {
            if source.kind() == io::ErrorKind::NotFound {
                Error::NotFound(path)
            } else {
                Error::Open { path, source }
            }
        }
    }
}

/// Vec allocation that reports [`Error::OutOfMemory`] instead of aborting.
pub(crate) fn try_alloc<T>(len: usize) -> Result<Vec<T>> {
    let mut v = Vec::new();
    v.try_reserve_exact(len)
        .map_err(|_| Error::OutOfMemory(len.saturating_mul(size_of::<T>())))?;
    Ok(v)
}

#[cfg(test)]
mod tests {
    use std::io;

    use super::{Error, ErrorKind};

    #[test]
    fn open_maps_missing_file_to_not_found() {
        let err = Error::open("missing.bin")(io::Error::from(io::ErrorKind::NotFound));
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let err = Error::open("locked.bin")(io::Error::from(io::ErrorKind::PermissionDenied));
        assert_eq!(err.kind(), ErrorKind::Open);
        assert!(err.to_string().contains("locked.bin"));
    }

    #[test]
    fn magic_mismatch_message_names_both_identifiers() {
        let msg = Error::IdentifierMismatch(*b"PK\x03\x04").to_string();
        assert!(msg.contains("[83, 84, 80, 65]"), "{msg}");
    }

    #[test]
    fn try_alloc_reports_out_of_memory() {
        let err = super::try_alloc::<u64>(usize::MAX / 4).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
    }
}
