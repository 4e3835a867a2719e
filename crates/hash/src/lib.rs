//! Robin Hood open-addressed hash tables for Kestrel.
//!
//! This crate provides the family of hash tables used throughout the VM for
//! symbol tables, deduplication and interned-string indexes. All variants are
//! built from one layout recipe and share the same probing discipline; they
//! differ only in key shape:
//!
//! - [`PtrHashTable`]: machine-word keys (pointers, object handles) mapped to
//!   values.
//! - [`IndexHashTable`]: string keys held in an external interned list; the
//!   table stores only indexes into that list.
//! - [`FixKeyHashTable`]: string keys with an indirection to a boxed payload,
//!   so payload addresses stay stable across table growth.
//!
//! **These are not general purpose replacements for the standard library's
//! `HashMap`.** The tradeoffs are different:
//!
//! - Open addressing with Robin Hood displacement keeps the variance of probe
//!   distances low, so worst-case probes stay short even at a 3/4 load factor.
//! - Probe sequences never wrap: a run of overflow slots past the official
//!   bucket range absorbs displacement at the high end, so the probe loop has
//!   no modulo and no branch on wrap-around.
//! - Per-slot metadata is a single byte holding the probe distance, walked
//!   independently of the entries themselves.
//!
//! Tables are single-writer: callers must not interleave writes with reads
//! from other handles. There is no internal locking.

#![deny(missing_docs, trivial_numeric_casts, unused_extern_crates)]
#![warn(unused_import_braces)]

use core::hash::Hasher;

mod fixkey;
mod index;
mod ptr;
mod raw;

pub use self::fixkey::FixKeyHashTable;
pub use self::index::IndexHashTable;
pub use self::ptr::{PtrHashTable, PtrKey};
pub use self::raw::FsckError;

/// The hard cap on probe distances, and the largest value a metadata byte can
/// hold. A probe distance reaching this cap is a programming error; the
/// insertion path arranges a grow *before* any distance can get here.
pub const MAX_PROBE_DISTANCE: u32 = 255;

/// Number of official buckets allocated by the first insertion into a
/// pointer-keyed table.
pub const PTR_INITIAL_SIZE: u32 = 8;

/// Log2 of the number of official buckets allocated by the first insertion
/// into a string-keyed table.
pub const UNI_MIN_SIZE_BASE_2: u32 = 3;

/// Fibonacci hashing multiplier: 2^64 divided by the golden ratio.
///
/// Multiplying a key by this constant mixes low-order key bits into the high
/// bits of the hash word, which is where bucket indexes are taken from.
pub const GOLDEN_RATIO_64: u64 = 11400714819323198485;

/// Hash a string key.
///
/// The content hash comes from the same Fx hasher the rest of the VM uses for
/// string hashing; the golden-ratio post-multiply mixes it further so that the
/// top bits, which select the bucket, depend on the whole word.
pub(crate) fn str_hash(s: &str) -> u64 {
    let mut hasher = rustc_hash::FxHasher::default();
    hasher.write(s.as_bytes());
    hasher.finish().wrapping_mul(GOLDEN_RATIO_64)
}
