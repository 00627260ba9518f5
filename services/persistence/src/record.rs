//! Record Store — Append-only daily tick files
//!
//! One file per symbol per UTC day, holding every live price observed for
//! that symbol in arrival order.
//!
//! # Binary Format (little-endian)
//! ```text
//! [count: u32]
//! count × [price: f64][epoch: u64]
//! ```
//!
//! Appends write the new records at the end of the file, then rewrite the
//! `count` header in place. A file whose length disagrees with its header
//! is reported as corrupt rather than silently truncated.

use chrono::{DateTime, NaiveDate};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use types::ids::Symbol;

/// Bytes in the `count` header.
pub const HEADER_SIZE: usize = 4;

/// Bytes per `(price, epoch)` record.
pub const RECORD_SIZE: usize = 16;

// ── Errors ──────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Corrupt record file: {0}")]
    Corrupt(String),

    #[error("Record count overflow: {0} records")]
    CountOverflow(u64),

    #[error("Epoch out of range: {0}")]
    InvalidEpoch(i64),
}

// ── Record ──────────────────────────────────────────────────────────

/// One live price observation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Record {
    pub price: f64,
    pub epoch: u64,
}

impl Record {
    pub fn new(price: f64, epoch: u64) -> Self {
        Self { price, epoch }
    }

    pub fn to_bytes(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];
        buf[..8].copy_from_slice(&self.price.to_le_bytes());
        buf[8..].copy_from_slice(&self.epoch.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; RECORD_SIZE]) -> Self {
        let mut price = [0u8; 8];
        let mut epoch = [0u8; 8];
        price.copy_from_slice(&buf[..8]);
        epoch.copy_from_slice(&buf[8..]);
        Self {
            price: f64::from_le_bytes(price),
            epoch: u64::from_le_bytes(epoch),
        }
    }
}

/// Serialize a whole file image.
pub fn encode(records: &[Record]) -> Result<Vec<u8>, RecordError> {
    let count = u32::try_from(records.len())
        .map_err(|_| RecordError::CountOverflow(records.len() as u64))?;
    let mut buf = Vec::with_capacity(HEADER_SIZE + records.len() * RECORD_SIZE);
    buf.extend_from_slice(&count.to_le_bytes());
    for record in records {
        buf.extend_from_slice(&record.to_bytes());
    }
    Ok(buf)
}

/// Parse a whole file image.
pub fn decode(data: &[u8]) -> Result<Vec<Record>, RecordError> {
    if data.len() < HEADER_SIZE {
        return Err(RecordError::Corrupt(format!(
            "{} bytes is shorter than the header",
            data.len()
        )));
    }
    let mut header = [0u8; HEADER_SIZE];
    header.copy_from_slice(&data[..HEADER_SIZE]);
    let count = u32::from_le_bytes(header) as usize;

    let body = &data[HEADER_SIZE..];
    if body.len() != count * RECORD_SIZE {
        return Err(RecordError::Corrupt(format!(
            "header says {} records, body holds {} bytes",
            count,
            body.len()
        )));
    }

    Ok(body
        .chunks_exact(RECORD_SIZE)
        .map(|chunk| {
            let mut buf = [0u8; RECORD_SIZE];
            buf.copy_from_slice(chunk);
            Record::from_bytes(&buf)
        })
        .collect())
}

// ── Record File ─────────────────────────────────────────────────────

/// An open daily record file.
#[derive(Debug)]
pub struct RecordFile {
    path: PathBuf,
    file: File,
    count: u32,
}

impl RecordFile {
    /// Open `path`, creating it (and its parent directories) if missing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RecordError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;

        let len = file.metadata()?.len();
        let count = if len == 0 {
            file.write_all(&0u32.to_le_bytes())?;
            0
        } else {
            let mut header = [0u8; HEADER_SIZE];
            file.seek(SeekFrom::Start(0))?;
            file.read_exact(&mut header)?;
            let count = u32::from_le_bytes(header);
            let expected = (HEADER_SIZE + count as usize * RECORD_SIZE) as u64;
            if len != expected {
                return Err(RecordError::Corrupt(format!(
                    "{}: header says {} records ({} bytes), file is {} bytes",
                    path.display(),
                    count,
                    expected,
                    len
                )));
            }
            count
        };

        Ok(Self { path, file, count })
    }

    /// Append one record and update the header.
    pub fn append(&mut self, record: Record) -> Result<(), RecordError> {
        self.append_batch(std::slice::from_ref(&record))
    }

    /// Append records in order and update the header once.
    pub fn append_batch(&mut self, records: &[Record]) -> Result<(), RecordError> {
        if records.is_empty() {
            return Ok(());
        }
        let total = self.count as u64 + records.len() as u64;
        let new_count = u32::try_from(total).map_err(|_| RecordError::CountOverflow(total))?;

        let mut buf = Vec::with_capacity(records.len() * RECORD_SIZE);
        for record in records {
            buf.extend_from_slice(&record.to_bytes());
        }
        self.file.seek(SeekFrom::End(0))?;
        self.file.write_all(&buf)?;
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&new_count.to_le_bytes())?;
        self.file.flush()?;

        self.count = new_count;
        Ok(())
    }

    /// Flush to durable storage.
    pub fn sync(&mut self) -> Result<(), RecordError> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every record of a file.
    pub fn read_all(path: impl AsRef<Path>) -> Result<Vec<Record>, RecordError> {
        decode(&fs::read(path)?)
    }
}

// ── Record Store ────────────────────────────────────────────────────

/// Directory of daily record files, `<root>/<symbol>/<YYYY-MM-DD>.bin`.
#[derive(Debug)]
pub struct RecordStore {
    root: PathBuf,
    open: HashMap<(Symbol, NaiveDate), RecordFile>,
}

impl RecordStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            open: HashMap::new(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// UTC calendar day of an epoch.
    pub fn day_of(epoch: i64) -> Result<NaiveDate, RecordError> {
        DateTime::from_timestamp(epoch, 0)
            .map(|dt| dt.date_naive())
            .ok_or(RecordError::InvalidEpoch(epoch))
    }

    /// Path of the file holding `symbol`'s records for `day`.
    pub fn path_for(&self, symbol: &Symbol, day: NaiveDate) -> PathBuf {
        self.root
            .join(symbol.as_str())
            .join(format!("{}.bin", day.format("%Y-%m-%d")))
    }

    /// Append a price to the file for the epoch's UTC day.
    ///
    /// Files for earlier days are closed once a later day is written.
    pub fn append(&mut self, symbol: &Symbol, price: f64, epoch: i64) -> Result<(), RecordError> {
        let day = Self::day_of(epoch)?;
        let epoch = u64::try_from(epoch).map_err(|_| RecordError::InvalidEpoch(epoch))?;
        let key = (symbol.clone(), day);

        if !self.open.contains_key(&key) {
            self.open.retain(|(s, d), _| s != symbol || *d > day);
            let file = RecordFile::open(self.path_for(symbol, day))?;
            self.open.insert(key.clone(), file);
        }
        match self.open.get_mut(&key) {
            Some(file) => file.append(Record::new(price, epoch)),
            None => Err(RecordError::Corrupt("record file vanished".to_string())),
        }
    }

    /// Records for one symbol and day; empty if the file does not exist.
    pub fn read_day(&self, symbol: &Symbol, day: NaiveDate) -> Result<Vec<Record>, RecordError> {
        let path = self.path_for(symbol, day);
        if !path.exists() {
            return Ok(Vec::new());
        }
        RecordFile::read_all(path)
    }

    /// Sync every open file.
    pub fn sync_all(&mut self) -> Result<(), RecordError> {
        for file in self.open.values_mut() {
            file.sync()?;
        }
        Ok(())
    }

    pub fn open_files(&self) -> usize {
        self.open.len()
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::TempDir;

    #[test]
    fn test_encode_layout() {
        let bytes = encode(&[Record::new(1.5, 60)]).unwrap();
        assert_eq!(bytes.len(), HEADER_SIZE + RECORD_SIZE);
        assert_eq!(&bytes[..4], &1u32.to_le_bytes());
        assert_eq!(&bytes[4..12], &1.5f64.to_le_bytes());
        assert_eq!(&bytes[12..20], &60u64.to_le_bytes());
    }

    #[test]
    fn test_decode_rejects_length_mismatch() {
        let mut bytes = encode(&[Record::new(1.0, 1), Record::new(2.0, 2)]).unwrap();
        bytes.truncate(bytes.len() - 3);
        assert!(matches!(decode(&bytes), Err(RecordError::Corrupt(_))));
        assert!(matches!(decode(&[0u8, 0]), Err(RecordError::Corrupt(_))));
    }

    #[test]
    fn test_empty_file_image() {
        assert_eq!(decode(&encode(&[]).unwrap()).unwrap(), vec![]);
    }

    #[test]
    fn test_append_updates_header() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("R_50").join("2024-01-01.bin");

        let mut file = RecordFile::open(&path).unwrap();
        file.append(Record::new(100.0, 1_704_067_200)).unwrap();
        file.append_batch(&[Record::new(100.5, 1_704_067_201), Record::new(101.0, 1_704_067_202)])
            .unwrap();
        assert_eq!(file.count(), 3);
        drop(file);

        let records = RecordFile::read_all(&path).unwrap();
        assert_eq!(records.len(), 3);
        assert_eq!(records[2], Record::new(101.0, 1_704_067_202));

        // Reopening continues where the file left off.
        let mut file = RecordFile::open(&path).unwrap();
        assert_eq!(file.count(), 3);
        file.append(Record::new(99.0, 1_704_067_260)).unwrap();
        assert_eq!(RecordFile::read_all(&path).unwrap().len(), 4);
    }

    #[test]
    fn test_open_rejects_corrupt_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("bad.bin");
        fs::write(&path, [5u8, 0, 0, 0, 1, 2, 3]).unwrap();
        assert!(matches!(RecordFile::open(&path), Err(RecordError::Corrupt(_))));
    }

    #[test]
    fn test_store_daily_paths() {
        let dir = TempDir::new().unwrap();
        let mut store = RecordStore::new(dir.path());
        let symbol = Symbol::new("R_50");

        // 2024-01-01T23:59:59Z and 2024-01-02T00:00:00Z
        store.append(&symbol, 1.0, 1_704_153_599).unwrap();
        store.append(&symbol, 2.0, 1_704_153_600).unwrap();
        assert_eq!(store.open_files(), 1);

        let day1 = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        let day2 = NaiveDate::from_ymd_opt(2024, 1, 2).unwrap();
        assert!(store.path_for(&symbol, day1).ends_with("R_50/2024-01-01.bin"));
        assert_eq!(store.read_day(&symbol, day1).unwrap(), vec![Record::new(1.0, 1_704_153_599)]);
        assert_eq!(store.read_day(&symbol, day2).unwrap(), vec![Record::new(2.0, 1_704_153_600)]);
        assert!(store
            .read_day(&Symbol::new("R_100"), day1)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_store_rejects_negative_epoch() {
        let dir = TempDir::new().unwrap();
        let mut store = RecordStore::new(dir.path());
        assert!(matches!(
            store.append(&Symbol::new("R_50"), 1.0, -5),
            Err(RecordError::InvalidEpoch(-5))
        ));
    }

    proptest! {
        #[test]
        fn test_decode_inverts_encode(
            records in prop::collection::vec((-1e9f64..1e9, any::<u64>()), 0..64)
        ) {
            let records: Vec<Record> = records.into_iter().map(|(p, e)| Record::new(p, e)).collect();
            prop_assert_eq!(decode(&encode(&records).unwrap()).unwrap(), records);
        }
    }
}
