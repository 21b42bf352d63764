//! Run identity and report record schemas.
//!
//! Records are what a run handle persists for each report call. They are
//! serialized one per line (NDJSON) by the local backend and kept in memory by
//! the recording backend.

use core::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use sha2::{Digest, Sha256};

/// Schema version stamped on every record.
pub const RECORD_SCHEMA_V1: u32 = 1;

/// Error parsing a hex-encoded run id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ParseIdError {
    #[error("invalid id length")]
    InvalidLength,
    #[error("invalid hex in id")]
    InvalidHex,
    #[error("all-zero id is invalid")]
    AllZeroInvalid,
}

const HEX_LOWER: &[u8; 16] = b"0123456789abcdef";

fn decode_hex_nibble(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

/// Lowercase hex encoding.
pub fn hex_lower(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX_LOWER[(b >> 4) as usize] as char);
        out.push(HEX_LOWER[(b & 0x0f) as usize] as char);
    }
    out
}

/// Nanoseconds since the Unix epoch (saturating, zero before the epoch).
pub fn unix_nanos_now() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default();
    now.as_nanos().min(u64::MAX as u128) as u64
}

static RUN_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// A 16-byte run identifier (32 lowercase hex chars when displayed).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct RunId(pub [u8; 16]);

impl RunId {
    pub const fn from_bytes(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_valid(&self) -> bool {
        self.0.iter().any(|b| *b != 0)
    }

    /// Derive a run id: `sha256(project || 0 || name || 0 || ts_nanos_be || seq_be)[0..16]`.
    ///
    /// The process-wide sequence keeps ids distinct for runs opened within the
    /// same clock tick.
    pub fn derive(project: &str, name: &str, ts_nanos: u64) -> Self {
        let seq = RUN_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        let mut hasher = Sha256::new();
        hasher.update(project.as_bytes());
        hasher.update([0u8]);
        hasher.update(name.as_bytes());
        hasher.update([0u8]);
        hasher.update(ts_nanos.to_be_bytes());
        hasher.update(seq.to_be_bytes());
        let hash = hasher.finalize();
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(&hash[..16]);
        if !bytes.iter().any(|b| *b != 0) {
            bytes[15] = 1;
        }
        Self(bytes)
    }

    pub fn parse_hex(s: &str) -> Result<Self, ParseIdError> {
        if s.len() != 32 {
            return Err(ParseIdError::InvalidLength);
        }
        let raw = s.as_bytes();
        let mut out = [0u8; 16];
        for (i, slot) in out.iter_mut().enumerate() {
            let hi = decode_hex_nibble(raw[i * 2]).ok_or(ParseIdError::InvalidHex)?;
            let lo = decode_hex_nibble(raw[i * 2 + 1]).ok_or(ParseIdError::InvalidHex)?;
            *slot = (hi << 4) | lo;
        }
        let id = Self(out);
        if !id.is_valid() {
            return Err(ParseIdError::AllZeroInvalid);
        }
        Ok(id)
    }
}

impl fmt::Debug for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex_lower(&self.0))
    }
}

impl serde::Serialize for RunId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> serde::Deserialize<'de> for RunId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = <String as serde::Deserialize>::deserialize(deserializer)?;
        RunId::parse_hex(&s).map_err(serde::de::Error::custom)
    }
}

/// A scalar point on a `(title, series)` time series.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ScalarRecord {
    pub schema_version: u32,
    pub ts_unix_nanos: u64,
    pub title: String,
    pub series: String,
    pub value: f64,
    pub x: f64,
}

/// A console text line.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct TextRecord {
    pub schema_version: u32,
    pub ts_unix_nanos: u64,
    pub text: String,
}

/// A debug image sample. The payload itself is stored by reference.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ImageRecord {
    pub schema_version: u32,
    pub ts_unix_nanos: u64,
    pub title: String,
    pub series: String,
    pub x: f64,
    pub file_name: String,
    pub sha256: String,
    pub bytes: u64,
}

/// A chart (plot) report carrying its figure JSON inline.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct ChartRecord {
    pub schema_version: u32,
    pub ts_unix_nanos: u64,
    pub title: String,
    pub series: String,
    pub x: f64,
    pub figure: serde_json::Value,
}
