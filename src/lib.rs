//! Stockpile: a flat container format that bundles named byte blobs into a single file,
//! with optional whole-payload zlib compression and optional per-entry CRC32 checks.
//!
//! ```no_run
//! use stockpile::{Archive, ArchiveBuilder};
//!
//! # fn main() -> stockpile::Result<()> {
//! let mut builder = ArchiveBuilder::new(2, true)?;
//! builder.append_str("greeting.txt", "hello")?;
//! builder.append_file("assets/logo.png")?;
//! builder.finalize_to_path("assets.stp", true)?;
//!
//! let archive = Archive::open_path("assets.stp")?;
//! let entry = archive.entry("greeting.txt")?;
//! assert_eq!(archive.entry_data(entry)?, b"hello");
//! # Ok(())
//! # }
//! ```

pub mod archive;
pub mod builder;
pub mod compression;
pub mod diagnostics;
pub mod error;
pub mod format;

pub use archive::{Archive, Entry, WriteOptions};
pub use builder::ArchiveBuilder;
pub use diagnostics::{Diagnostics, ResultExt};
pub use error::{Error, ErrorKind, Result};
