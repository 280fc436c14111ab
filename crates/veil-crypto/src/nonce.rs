//! Nonce arithmetic: monotonic advancement and range splitting.
//!
//! Nonces are 8-byte big-endian counters. They only ever move forward; the
//! range-split operation hands the upper half of a device's remaining range
//! to a newly authorized device so two devices can never collide.

use veil_core::{VeilError, VeilResult};

use crate::{Nonce, NONCE_LENGTH};

/// Minimum number of nonces that must remain in a range before it can be
/// split for device authorization.
pub const MIN_RANGE_FOR_SPLIT: u64 = 256;

pub fn to_u64(nonce: &Nonce) -> u64 {
    u64::from_be_bytes(*nonce)
}

pub fn from_u64(value: u64) -> Nonce {
    value.to_be_bytes()
}

/// Advance a nonce by one, failing when the range is exhausted.
///
/// The maximum itself is never handed out: a sequence whose next nonce has
/// reached `max` is spent.
pub fn increase_nonce(nonce: &Nonce, max: &Nonce) -> VeilResult<Nonce> {
    let value = to_u64(nonce);
    let max = to_u64(max);
    let next = value
        .checked_add(1)
        .ok_or_else(|| VeilError::RangeExceeded("nonce counter overflow".into()))?;
    if next > max {
        return Err(VeilError::RangeExceeded(format!(
            "nonce sequence exhausted at {value}, max {max}"
        )));
    }
    Ok(from_u64(next))
}

/// Return the midpoint of `[start, end)`, the pivot that splits a device's
/// remaining range in half for authorization export.
///
/// A small reserve is kept so a device can never be left without usable
/// nonces after repeated exports.
pub fn split_nonce_range(start: &Nonce, end: &Nonce) -> VeilResult<Nonce> {
    let start = to_u64(start);
    let end = to_u64(end);
    if end < start || end - start < MIN_RANGE_FOR_SPLIT {
        return Err(VeilError::RangeExceeded(format!(
            "not enough nonces left to authorize another device ({} remaining)",
            end.saturating_sub(start)
        )));
    }
    Ok(from_u64(start + (end - start) / 2))
}

/// Fixed-size nonce view of a byte slice.
pub fn from_slice(bytes: &[u8]) -> VeilResult<Nonce> {
    bytes
        .try_into()
        .map_err(|_| VeilError::Format(format!("nonce must be {NONCE_LENGTH} bytes")))
}
