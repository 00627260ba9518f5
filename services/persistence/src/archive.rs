//! Archive Codec — Dictionary compression for record files
//!
//! Daily record files are small and highly similar, so they compress far
//! better with a shared zstd dictionary trained on sample files than one
//! by one.
//!
//! # Archive Format
//! ```text
//! [magic: 4 bytes = "FDA1"]
//! [dictionary digest: 32 bytes, SHA-256 of the dictionary]
//! [zstd frame compressed with that dictionary]
//! ```
//!
//! The digest lets decompression refuse an archive produced with a
//! different dictionary instead of returning garbage.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::path::Path;
use thiserror::Error;

use crate::record::{self, Record};

const MAGIC: &[u8; 4] = b"FDA1";
const DIGEST_SIZE: usize = 32;
const PREAMBLE_SIZE: usize = MAGIC.len() + DIGEST_SIZE;

/// Default compression level.
pub const DEFAULT_LEVEL: i32 = 3;

/// Default dictionary capacity in bytes.
pub const DEFAULT_DICT_SIZE: usize = 16 * 1024;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Dictionary training failed: {0}")]
    Training(String),

    #[error("Not an archive: {0}")]
    BadHeader(String),

    #[error("Archive was written with a different dictionary")]
    DictionaryMismatch,

    #[error("Record error: {0}")]
    Record(#[from] record::RecordError),
}

// ── Codec ───────────────────────────────────────────────────────────

/// Compressor/decompressor bound to one trained dictionary.
#[derive(Debug, Clone)]
pub struct ArchiveCodec {
    dictionary: Vec<u8>,
    digest: [u8; DIGEST_SIZE],
    level: i32,
}

impl ArchiveCodec {
    /// Train a dictionary from sample file images.
    pub fn train(samples: &[Vec<u8>], max_dict_size: usize) -> Result<Self, ArchiveError> {
        let dictionary = zstd::dict::from_samples(samples, max_dict_size)
            .map_err(|e| ArchiveError::Training(e.to_string()))?;
        Ok(Self::from_dictionary(dictionary))
    }

    /// Train from record files on disk.
    pub fn train_from_files<P: AsRef<Path>>(
        paths: &[P],
        max_dict_size: usize,
    ) -> Result<Self, ArchiveError> {
        let samples = paths
            .iter()
            .map(fs::read)
            .collect::<Result<Vec<_>, _>>()?;
        Self::train(&samples, max_dict_size)
    }

    /// Use an existing dictionary (e.g. one loaded from disk).
    pub fn from_dictionary(dictionary: Vec<u8>) -> Self {
        let digest: [u8; DIGEST_SIZE] = Sha256::digest(&dictionary).into();
        Self {
            dictionary,
            digest,
            level: DEFAULT_LEVEL,
        }
    }

    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    pub fn dictionary(&self) -> &[u8] {
        &self.dictionary
    }

    pub fn digest(&self) -> &[u8; DIGEST_SIZE] {
        &self.digest
    }

    /// Compress a file image into an archive.
    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, ArchiveError> {
        let mut compressor = zstd::bulk::Compressor::with_dictionary(self.level, &self.dictionary)
            .map_err(|e| ArchiveError::Compression(e.to_string()))?;
        let frame = compressor
            .compress(data)
            .map_err(|e| ArchiveError::Compression(e.to_string()))?;

        let mut out = Vec::with_capacity(PREAMBLE_SIZE + frame.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&self.digest);
        out.extend_from_slice(&frame);
        Ok(out)
    }

    /// Decompress an archive back into the original file image.
    pub fn decompress(&self, archive: &[u8]) -> Result<Vec<u8>, ArchiveError> {
        if archive.len() < PREAMBLE_SIZE {
            return Err(ArchiveError::BadHeader(format!(
                "{} bytes is shorter than the preamble",
                archive.len()
            )));
        }
        if &archive[..MAGIC.len()] != MAGIC {
            return Err(ArchiveError::BadHeader("magic mismatch".to_string()));
        }
        if archive[MAGIC.len()..PREAMBLE_SIZE] != self.digest {
            return Err(ArchiveError::DictionaryMismatch);
        }

        let mut decoder =
            zstd::stream::read::Decoder::with_dictionary(&archive[PREAMBLE_SIZE..], &self.dictionary)
                .map_err(|e| ArchiveError::Compression(e.to_string()))?;
        let mut out = Vec::new();
        decoder
            .read_to_end(&mut out)
            .map_err(|e| ArchiveError::Compression(e.to_string()))?;
        Ok(out)
    }

    /// Compress the record file at `src` into `dst`.
    ///
    /// The source must parse as a record file; returns the archive size.
    pub fn compress_file(&self, src: impl AsRef<Path>, dst: impl AsRef<Path>) -> Result<usize, ArchiveError> {
        let data = fs::read(src)?;
        record::decode(&data)?;
        let archive = self.compress(&data)?;
        if let Some(parent) = dst.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(dst, &archive)?;
        Ok(archive.len())
    }

    /// Decompress the archive at `src` and parse its records.
    pub fn decompress_file(&self, src: impl AsRef<Path>) -> Result<Vec<Record>, ArchiveError> {
        let archive = fs::read(src)?;
        let data = self.decompress(&archive)?;
        Ok(record::decode(&data)?)
    }
}

// ── Tests ───────────────────────────────────────────────────────────
