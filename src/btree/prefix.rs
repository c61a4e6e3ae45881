//! # Prefix-Sharing Key Codec
//!
//! This module implements the compressed encoding for the sorted 64-bit
//! key array of a node. All keys in a node share their high-order bits
//! with the node's smallest and largest key; the shared prefix is stored
//! once and each key contributes only its distinct suffix.
//!
//! ## Encoding Format
//!
//! For a sorted key array with `prefix_bits` shared high bits:
//!
//! ```text
//! metadata (11 bytes, carried by the node header):
//!   prefix value   8 bytes   high bits, low (64 - prefix_bits) bits zero
//!   suffix width   1 byte    64 - prefix_bits
//!   entry count    2 bytes
//! payload:
//!   packed suffixes, MSB-first, ceil(suffix_bits * num_keys / 8) bytes
//! ```
//!
//! Keys are treated as **unsigned** bit patterns throughout. The prefix
//! of a node holding both negative and non-negative keys is empty (the
//! sign bit differs), which degrades gracefully to storing full keys.
//!
//! ## Boundary Values
//!
//! - equal min and max: 64 shared bits, zero payload bytes
//! - `min XOR max` with the top bit set: 0 shared bits, 8 bytes per key
//! - empty array: by convention 0 shared bits and no payload
//!
//! ## Split Position
//!
//! [`compute_index_for_split_after_insert`] enumerates candidate split
//! points for an overfull-to-be array and predicts the serialized size of
//! both halves, each charged with one additional entry (the insert that
//! triggered the split may land on either side). A candidate is viable
//! only if both halves fit the page; among viable candidates the one with
//! the smallest larger half wins, ties broken so the left half is no
//! smaller than the right.

use eyre::Result;

use crate::config::PREFIX_METADATA_SIZE;
use crate::error::IndexError;

/// Number of high-order bits shared by every key between `min` and `max`
/// in the unsigned ordering.
#[inline]
pub fn prefix_bits(min: i64, max: i64) -> u8 {
    ((min as u64) ^ (max as u64)).leading_zeros() as u8
}

/// The shared prefix value: `min` with the low `64 - bits` bits cleared.
#[inline]
pub fn prefix_value(min: i64, bits: u8) -> u64 {
    if bits == 0 {
        0
    } else if bits >= 64 {
        min as u64
    } else {
        (min as u64) & !(suffix_mask(bits))
    }
}

/// Mask covering the low `64 - bits` suffix bits.
#[inline]
pub fn suffix_mask(bits: u8) -> u64 {
    if bits == 0 {
        u64::MAX
    } else if bits >= 64 {
        0
    } else {
        (1u64 << (64 - bits)) - 1
    }
}

/// Serialized size of a key array with `num_keys` entries sharing
/// `bits` prefix bits, metadata included.
#[inline]
pub fn encoded_array_size(num_keys: usize, bits: u8) -> usize {
    let suffix_bits = 64 - bits.min(64) as usize;
    PREFIX_METADATA_SIZE + (suffix_bits * num_keys + 7) / 8
}

/// Packs the suffixes of `keys` into `out`, MSB-first. `out` must hold at
/// least `ceil((64 - bits) * keys.len() / 8)` bytes.
pub fn pack_suffixes(keys: &[i64], bits: u8, out: &mut [u8]) {
    let suffix_bits = 64 - bits.min(64) as usize;
    let mask = suffix_mask(bits);
    let mut cursor = 0usize;

    for &key in keys {
        let suffix = (key as u64) & mask;
        for i in (0..suffix_bits).rev() {
            if (suffix >> i) & 1 != 0 {
                out[cursor / 8] |= 1 << (7 - (cursor % 8));
            }
            cursor += 1;
        }
    }
}

/// Reassembles `num_keys` keys from a shared prefix and packed suffixes.
pub fn unpack_suffixes(prefix: u64, bits: u8, num_keys: usize, data: &[u8]) -> Vec<i64> {
    let suffix_bits = 64 - bits.min(64) as usize;
    let mut keys = Vec::with_capacity(num_keys);
    let mut cursor = 0usize;

    for _ in 0..num_keys {
        let mut suffix = 0u64;
        for _ in 0..suffix_bits {
            suffix <<= 1;
            if data[cursor / 8] & (1 << (7 - (cursor % 8))) != 0 {
                suffix |= 1;
            }
            cursor += 1;
        }
        keys.push((prefix | suffix) as i64);
    }

    keys
}

/// Number of bytes of packed suffix payload for `num_keys` keys.
#[inline]
pub fn packed_payload_size(num_keys: usize, bits: u8) -> usize {
    let suffix_bits = 64 - bits.min(64) as usize;
    (suffix_bits * num_keys + 7) / 8
}

/// Picks the number of keys the left half keeps when splitting `keys`.
///
/// `header_bytes` is charged to each half, `weight_per_key` covers the
/// per-entry bytes outside the key array (value element, if any), and
/// `weight_per_child` covers one child slot (zero for leaves, which have
/// none). Each half is predicted with one extra entry, since the insert
/// that forced the split may land on either side.
///
/// Fails with [`IndexError::InvariantViolation`] when no split point
/// leaves both halves within `page_size`; under the tree's invariants
/// that state is unreachable.
pub fn compute_index_for_split_after_insert(
    keys: &[i64],
    header_bytes: usize,
    weight_per_key: usize,
    weight_per_child: usize,
    page_size: usize,
) -> Result<usize> {
    let num_keys = keys.len();
    if num_keys < 2 {
        return Err(IndexError::InvariantViolation("cannot split fewer than two keys").into());
    }

    let mut best: Option<(usize, usize)> = None;

    for k in 1..num_keys {
        let left = predicted_half_size(&keys[..k], header_bytes, weight_per_key, weight_per_child);
        let right = predicted_half_size(&keys[k..], header_bytes, weight_per_key, weight_per_child);

        if left > page_size || right > page_size {
            continue;
        }

        let larger = left.max(right);
        best = match best {
            None => Some((k, larger)),
            Some((_, best_larger)) if larger < best_larger => Some((k, larger)),
            // on equal maxima keep the left half no smaller than the right
            Some((best_k, best_larger)) if larger == best_larger && k > best_k => {
                Some((k, larger))
            }
            other => other,
        };
    }

    match best {
        Some((k, _)) => Ok(k),
        None => Err(IndexError::InvariantViolation("no split point fits both halves").into()),
    }
}

fn predicted_half_size(
    half: &[i64],
    header_bytes: usize,
    weight_per_key: usize,
    weight_per_child: usize,
) -> usize {
    let bits = prefix_bits(half[0], half[half.len() - 1]);
    let entries = half.len() + 1;
    let children = if weight_per_child > 0 { entries + 1 } else { 0 };

    header_bytes
        + encoded_array_size(entries, bits)
        + entries * weight_per_key
        + children * weight_per_child
}
