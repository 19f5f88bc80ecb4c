//! Persisted bucket state and its fixed binary record.
//!
//! Record layout (28 bytes, big-endian, versionless):
//!
//! | offset | size | field                          |
//! |--------|------|--------------------------------|
//! | 0      | 4    | `remaining` (`u32`)            |
//! | 4      | 8    | `last_refilled_at` secs (`i64`)|
//! | 12     | 4    | `last_refilled_at` nanos (`u32`)|
//! | 16     | 8    | `last_reduced_at` secs (`i64`) |
//! | 24     | 4    | `last_reduced_at` nanos (`u32`)|
//!
//! Adding a field means a new storage key scheme or an explicit migration.

use chrono::{DateTime, Utc};

use crate::error::DecodeError;

/// Size of an encoded [`BucketState`].
pub const RECORD_LEN: usize = 28;

/// Per-bucket state, one per storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketState {
    pub remaining: u32,
    pub last_refilled_at: DateTime<Utc>,
    /// Audit only; never read by the refill math.
    pub last_reduced_at: DateTime<Utc>,
}

impl BucketState {
    /// A full bucket created at `now`.
    pub fn full(capacity: u32, now: DateTime<Utc>) -> Self {
        Self { remaining: capacity, last_refilled_at: now, last_reduced_at: now }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(RECORD_LEN);
        out.extend_from_slice(&self.remaining.to_be_bytes());
        put_timestamp(&mut out, self.last_refilled_at);
        put_timestamp(&mut out, self.last_reduced_at);
        out
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let record: &[u8; RECORD_LEN] = data
            .try_into()
            .map_err(|_| DecodeError::Length { expected: RECORD_LEN, actual: data.len() })?;

        let remaining = u32::from_be_bytes([record[0], record[1], record[2], record[3]]);
        let last_refilled_at = read_timestamp(&record[4..16], "last_refilled_at")?;
        let last_reduced_at = read_timestamp(&record[16..28], "last_reduced_at")?;
        Ok(Self { remaining, last_refilled_at, last_reduced_at })
    }
}

fn put_timestamp(out: &mut Vec<u8>, instant: DateTime<Utc>) {
    out.extend_from_slice(&instant.timestamp().to_be_bytes());
    out.extend_from_slice(&instant.timestamp_subsec_nanos().to_be_bytes());
}

fn read_timestamp(bytes: &[u8], field: &'static str) -> Result<DateTime<Utc>, DecodeError> {
    let mut secs = [0u8; 8];
    secs.copy_from_slice(&bytes[..8]);
    let mut nanos = [0u8; 4];
    nanos.copy_from_slice(&bytes[8..12]);
    let nanos = u32::from_be_bytes(nanos);
    // chrono accepts nanos up to 2e9 for leap seconds, which encode never produces.
    if nanos >= 1_000_000_000 {
        return Err(DecodeError::Timestamp { field });
    }
    DateTime::from_timestamp(i64::from_be_bytes(secs), nanos).ok_or(DecodeError::Timestamp { field })
}
