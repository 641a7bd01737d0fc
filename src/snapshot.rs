//! Versioned, checksummed snapshot envelope
//!
//! Layout (little-endian):
//!
//! | bytes | field                         |
//! |-------|-------------------------------|
//! | 4     | magic `PSNP`                  |
//! | 2     | format version                |
//! | 1     | payload kind                  |
//! | 8     | payload length                |
//! | 8     | FNV-1a 64 checksum of payload |
//! | n     | bincode payload               |
//!
//! Any mismatch is reported as a [`SnapshotError`]; callers map it to the
//! corrupt-store or corrupt-index error of their layer.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::{Result, SearchError};

pub const MAGIC: [u8; 4] = *b"PSNP";
pub const FORMAT_VERSION: u16 = 1;
pub const HEADER_LEN: usize = 4 + 2 + 1 + 8 + 8;

/// Snapshot file extension
pub const EXTENSION: &str = "snap";

/// What a snapshot holds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PayloadKind {
    Store = 1,
    Index = 2,
}

impl PayloadKind {
    fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(PayloadKind::Store),
            2 => Some(PayloadKind::Index),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("blob too short: {0} bytes")]
    Truncated(usize),

    #[error("bad magic")]
    BadMagic,

    #[error("unsupported format version {0}")]
    Version(u16),

    #[error("expected {expected:?} payload, found kind byte {found}")]
    Kind { expected: PayloadKind, found: u8 },

    #[error("payload length {declared} does not match {actual} bytes present")]
    Length { declared: u64, actual: usize },

    #[error("checksum mismatch")]
    Checksum,

    #[error("payload decode failed: {0}")]
    Decode(#[from] bincode::Error),
}

/// Incremental FNV-1a, 64 bit
#[derive(Debug, Clone, Copy)]
pub struct Fnv1a64(u64);

impl Default for Fnv1a64 {
    fn default() -> Self {
        Self(0xcbf2_9ce4_8422_2325)
    }
}

impl Fnv1a64 {
    const PRIME: u64 = 0x0100_0000_01b3;

    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn write(&mut self, bytes: &[u8]) {
        self.0 = bytes
            .iter()
            .fold(self.0, |hash, &b| (hash ^ b as u64).wrapping_mul(Self::PRIME));
    }

    #[inline]
    pub fn finish(&self) -> u64 {
        self.0
    }
}

/// FNV-1a, 64 bit
pub fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hasher = Fnv1a64::new();
    hasher.write(bytes);
    hasher.finish()
}

/// Serialize `value` into an enveloped blob
pub fn encode<T: Serialize + ?Sized>(kind: PayloadKind, value: &T) -> Result<Vec<u8>> {
    let payload = bincode::serialize(value)
        .map_err(|e| SearchError::CorruptSnapshot(format!("encode failed: {e}")))?;

    let mut blob = Vec::with_capacity(HEADER_LEN + payload.len());
    blob.extend_from_slice(&MAGIC);
    blob.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    blob.push(kind as u8);
    blob.extend_from_slice(&(payload.len() as u64).to_le_bytes());
    blob.extend_from_slice(&fnv1a64(&payload).to_le_bytes());
    blob.extend_from_slice(&payload);
    Ok(blob)
}

/// Verify the envelope and decode its payload
pub fn decode<T: DeserializeOwned>(kind: PayloadKind, blob: &[u8]) -> std::result::Result<T, SnapshotError> {
    if blob.len() < HEADER_LEN {
        return Err(SnapshotError::Truncated(blob.len()));
    }
    let (header, payload) = blob.split_at(HEADER_LEN);

    if header[0..4] != MAGIC {
        return Err(SnapshotError::BadMagic);
    }
    let version = u16::from_le_bytes([header[4], header[5]]);
    if version != FORMAT_VERSION {
        return Err(SnapshotError::Version(version));
    }
    if PayloadKind::from_byte(header[6]) != Some(kind) {
        return Err(SnapshotError::Kind {
            expected: kind,
            found: header[6],
        });
    }

    let declared = u64::from_le_bytes(le_array(&header[7..15]));
    if declared != payload.len() as u64 {
        return Err(SnapshotError::Length {
            declared,
            actual: payload.len(),
        });
    }
    let checksum = u64::from_le_bytes(le_array(&header[15..23]));
    if checksum != fnv1a64(payload) {
        return Err(SnapshotError::Checksum);
    }

    Ok(bincode::deserialize(payload)?)
}

fn le_array(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    out
}

// ============================================================
// FILES
// ============================================================

/// Identifies a snapshot by what it was built from and the day it was built
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotKey {
    pub symbols_digest: u64,
    pub period_years: u32,
    pub interval_days: u32,
    /// `None` for store snapshots
    pub window_size: Option<usize>,
    pub date: NaiveDate,
}

impl SnapshotKey {
    pub fn store(symbols: &[String], period_years: u32, interval_days: u32, date: NaiveDate) -> Self {
        Self {
            symbols_digest: symbols_digest(symbols),
            period_years,
            interval_days,
            window_size: None,
            date,
        }
    }

    pub fn index(
        symbols: &[String],
        period_years: u32,
        interval_days: u32,
        window_size: usize,
        date: NaiveDate,
    ) -> Self {
        Self {
            window_size: Some(window_size),
            ..Self::store(symbols, period_years, interval_days, date)
        }
    }

    /// e.g. `store_2y_1d_9f3ab1c04e2d7710_2024_01_31.snap`
    pub fn file_name(&self) -> String {
        let date = format_date(self.date);
        match self.window_size {
            None => format!(
                "store_{}y_{}d_{:016x}_{}.{}",
                self.period_years, self.interval_days, self.symbols_digest, date, EXTENSION
            ),
            Some(w) => format!(
                "index_{}y_{}d_{:016x}_{}w_{}.{}",
                self.period_years, self.interval_days, self.symbols_digest, w, date, EXTENSION
            ),
        }
    }

    pub fn path_in(&self, dir: &Path) -> PathBuf {
        dir.join(self.file_name())
    }
}

/// Order-sensitive digest of a symbol list; labels depend on the order
pub fn symbols_digest(symbols: &[String]) -> u64 {
    let joined = symbols.join("\n");
    fnv1a64(joined.as_bytes())
}

/// `%Y_%m_%d`, the date format used in file names and match dates
pub fn format_date(date: NaiveDate) -> String {
    date.format("%Y_%m_%d").to_string()
}

/// Write `blob` to `path` through a temporary file and rename
pub fn save(path: &Path, blob: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, blob)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// Read a snapshot file, `None` when it does not exist
pub fn load(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}
