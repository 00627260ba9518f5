//! Tick Record Store & Archive
//!
//! Stores every live price the feed client observes in append-only daily
//! files per symbol, and compresses finished days with a shared trained
//! dictionary.
//!
//! # Modules
//! - `record`: binary record file format, daily file layout, store
//! - `archive`: zstd dictionary training, whole-file compress/decompress

pub mod record;
pub mod archive;

pub use archive::{ArchiveCodec, ArchiveError};
pub use record::{Record, RecordError, RecordFile, RecordStore};
