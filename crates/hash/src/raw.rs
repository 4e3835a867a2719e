//! The layout recipe and probing discipline shared by every table variant.
//!
//! A table is three regions with one addressing scheme:
//!
//! 1. The entry region. Slot `s` lives at array index `allocated − 1 − s`,
//!    i.e. entries are laid out in *descending* slot order. Shifting a run of
//!    entries one slot up or down is then a single contiguous rotate of the
//!    underlying array.
//! 2. The control block: live count, load-factor threshold, official bucket
//!    count, the right shift deriving bucket indexes from hash words, and the
//!    overflow run length.
//! 3. The metadata byte array, one byte of probe distance per slot (zero
//!    means empty), bracketed by a sentinel byte of `1` at each end so scans
//!    stop at the boundary without a bounds branch.
//!
//! Probing starts at the bucket the top bits of the hash select and walks
//! forward with distance 1, 2, 3, ... It never wraps: `probe_overflow_size`
//! trailing slots past the official range absorb displacement at the high
//! end. An entry's stored metadata byte is exactly `1 + slot − ideal_slot`,
//! and entries are kept in non-decreasing ideal-slot order (the Robin Hood
//! invariant), which is what lets a lookup declare a miss as soon as it finds
//! a slot whose distance is shorter than its own current probe distance.

use crate::MAX_PROBE_DISTANCE;
use core::mem;
use log::debug;
use thiserror::Error;

/// A consistency violation reported by [`RawTable::fsck`].
///
/// The self-check is a debugging tool: a healthy table never produces any of
/// these, and the variants' tests assert exactly that.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FsckError {
    /// A sentinel byte was overwritten.
    #[error("sentinel at metadata index {index} is {value}, expected 1")]
    BadSentinel {
        /// Index into the metadata byte array.
        index: usize,
        /// The value found there.
        value: u8,
    },
    /// An entry is stored below the bucket its hash selects.
    #[error("slot {slot}: entry sits before its ideal slot {ideal}")]
    EntryBeforeIdeal {
        /// Slot holding the entry.
        slot: usize,
        /// Bucket the entry's hash selects.
        ideal: usize,
    },
    /// A metadata byte disagrees with the entry's actual displacement.
    #[error("slot {slot}: stored probe distance {stored}, but ideal slot {ideal} implies {expected}")]
    WrongProbeDistance {
        /// Slot holding the entry.
        slot: usize,
        /// The metadata byte.
        stored: u8,
        /// Bucket the entry's hash selects.
        ideal: usize,
        /// The distance implied by slot and ideal slot.
        expected: u32,
    },
    /// Probe distances rise by more than one across adjacent occupied slots,
    /// or an entry sits at distance greater than one just after a gap.
    #[error("slot {slot}: probe distance {stored} after predecessor distance {prev}")]
    BrokenOrdering {
        /// Slot holding the offending entry.
        slot: usize,
        /// Its metadata byte.
        stored: u8,
        /// The predecessor slot's metadata byte.
        prev: u8,
    },
    /// The control block's live count is out of sync with the metadata.
    #[error("{counted} occupied slots, but the control block records {recorded}")]
    WrongItemCount {
        /// Occupied slots counted from metadata.
        counted: u32,
        /// `cur_items` from the control block.
        recorded: u32,
    },
}

/// The control block.
#[derive(Clone, Copy, Debug, Default)]
struct Control {
    /// Number of live entries.
    cur_items: u32,
    /// Load-factor threshold: an insertion at or past this grows first.
    /// Forced to zero when any probe distance reaches the cap, so the next
    /// insertion grows *before* it tries to place anything.
    max_items: u32,
    /// Official bucket count; always a power of two.
    official_size: u32,
    /// Bucket index is `hash >> key_right_shift`.
    key_right_shift: u8,
    /// Trailing slots past the official range, absorbing displacement so
    /// probing never wraps.
    probe_overflow_size: u32,
}

/// The shared table core: control block, entry region, metadata bytes.
///
/// Hashing and key equality are supplied by the variant on every call, in the
/// manner of an externally-contexted hash map: the core never looks inside an
/// entry itself.
pub(crate) struct RawTable<E> {
    control: Control,
    /// Slot `s` is at `entries[allocated − 1 − s]`.
    entries: Vec<E>,
    /// `allocated + 2` bytes: sentinel, one byte per slot, sentinel.
    metadata: Vec<u8>,
}

impl<E: Default> RawTable<E> {
    /// An empty table. No allocation happens until the first insertion.
    pub fn new() -> Self {
        Self {
            control: Control::default(),
            entries: Vec::new(),
            metadata: Vec::new(),
        }
    }

    fn allocate(official_size: u32) -> Self {
        debug_assert!(official_size.is_power_of_two());
        let overflow = (official_size - 1).min(MAX_PROBE_DISTANCE - 1);
        let allocated = (official_size + overflow) as usize;
        let mut metadata = vec![0u8; allocated + 2];
        metadata[0] = 1;
        metadata[allocated + 1] = 1;
        Self {
            control: Control {
                cur_items: 0,
                max_items: official_size / 4 * 3,
                official_size,
                key_right_shift: (u64::BITS - official_size.trailing_zeros()) as u8,
                probe_overflow_size: overflow,
            },
            entries: core::iter::repeat_with(E::default).take(allocated).collect(),
            metadata,
        }
    }

    /// Number of live entries.
    pub fn count(&self) -> u32 {
        self.control.cur_items
    }

    /// Official bucket count (zero before the first insertion).
    pub fn official_size(&self) -> u32 {
        self.control.official_size
    }

    /// The longest probe distance currently stored in the table.
    pub fn longest_probe(&self) -> u8 {
        let allocated = self.allocated();
        if allocated == 0 {
            return 0;
        }
        self.metadata[1..=allocated].iter().copied().max().unwrap_or(0)
    }

    fn allocated(&self) -> usize {
        self.entries.len()
    }

    /// Metadata byte for `slot`. `slot == allocated` reads the trailing
    /// sentinel, which is what terminates forward scans.
    fn meta(&self, slot: usize) -> u8 {
        self.metadata[slot + 1]
    }

    fn set_meta(&mut self, slot: usize, value: u8) {
        self.metadata[slot + 1] = value;
    }

    fn entry_index(&self, slot: usize) -> usize {
        self.allocated() - 1 - slot
    }

    fn entry(&self, slot: usize) -> &E {
        &self.entries[self.entry_index(slot)]
    }

    fn entry_mut(&mut self, slot: usize) -> &mut E {
        let index = self.entry_index(slot);
        &mut self.entries[index]
    }

    fn ideal_slot(&self, hash: u64) -> usize {
        (hash >> self.control.key_right_shift) as usize
    }

    /// Probe for a present key. Returns its slot, or `None` on a miss.
    ///
    /// The miss condition is the Robin Hood one: as soon as the stored probe
    /// distance at the current slot is shorter than our own, a present key
    /// would have displaced the occupant, so the key cannot be further along.
    pub fn find_slot(&self, hash: u64, mut eq: impl FnMut(&E) -> bool) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let mut slot = self.ideal_slot(hash);
        let mut probe: u32 = 1;
        loop {
            let stored = self.meta(slot) as u32;
            if stored < probe {
                return None;
            }
            if stored == probe && eq(self.entry(slot)) {
                return Some(slot);
            }
            slot += 1;
            probe += 1;
            assert!(
                probe <= MAX_PROBE_DISTANCE,
                "kestrel-hash: probe distance exceeded the cap during lookup"
            );
        }
    }

    /// Probe for a present key and return a borrow of its entry.
    pub fn find(&self, hash: u64, eq: impl FnMut(&E) -> bool) -> Option<&E> {
        self.find_slot(hash, eq).map(|slot| self.entry(slot))
    }

    /// Probe for a present key and return a mutable borrow of its entry.
    pub fn find_mut(&mut self, hash: u64, eq: impl FnMut(&E) -> bool) -> Option<&mut E> {
        match self.find_slot(hash, eq) {
            Some(slot) => Some(self.entry_mut(slot)),
            None => None,
        }
    }

    /// Fetch the entry for a key, inserting a default-initialized one if the
    /// key is absent. Returns the entry and whether it is freshly inserted.
    ///
    /// `initial_size` is the official bucket count allocated by the very
    /// first insertion. `rehash` recomputes the hash of a stored entry; it is
    /// only called while growing.
    pub fn lvalue_fetch(
        &mut self,
        initial_size: u32,
        hash: u64,
        mut eq: impl FnMut(&E) -> bool,
        mut rehash: impl FnMut(&E) -> u64,
    ) -> (&mut E, bool) {
        if self.entries.is_empty() {
            *self = Self::allocate(initial_size);
        } else if self.control.cur_items >= self.control.max_items {
            // A pure lookup first: growing moves every entry, and a fetch of
            // a key that is already present must never invalidate anything.
            if self.find_slot(hash, &mut eq).is_none() {
                self.grow(&mut rehash);
            }
        }
        let (slot, fresh) = self.probe_place(hash, eq);
        (self.entry_mut(slot), fresh)
    }

    /// The combined probe-or-insert walk. Returns the slot holding the key
    /// (fresh slots hold a default entry for the caller to fill in) and
    /// whether it was freshly reserved.
    ///
    /// Callers are responsible for capacity: this never grows.
    fn probe_place(&mut self, hash: u64, mut eq: impl FnMut(&E) -> bool) -> (usize, bool) {
        let mut slot = self.ideal_slot(hash);
        let mut probe: u32 = 1;
        loop {
            let stored = self.meta(slot) as u32;
            if stored < probe {
                debug_assert!(slot < self.allocated());
                if probe >= MAX_PROBE_DISTANCE {
                    self.control.max_items = 0;
                }
                if stored == 0 {
                    self.set_meta(slot, probe as u8);
                    self.control.cur_items += 1;
                    return (slot, true);
                }
                self.displace(slot);
                self.set_meta(slot, probe as u8);
                self.control.cur_items += 1;
                return (slot, true);
            }
            if stored == probe && eq(self.entry(slot)) {
                return (slot, false);
            }
            slot += 1;
            probe += 1;
            assert!(
                probe <= MAX_PROBE_DISTANCE,
                "kestrel-hash: probe distance exceeded the cap during insertion"
            );
        }
    }

    /// Make room at `slot` by shifting the occupied run starting there one
    /// slot up, into the first gap beyond it.
    ///
    /// Every shifted entry's probe distance grows by one. If any would reach
    /// the cap, `max_items` drops to zero so the *next* insertion grows
    /// before placing anything; that is what guarantees this loop never has
    /// to handle distance overflow itself.
    fn displace(&mut self, slot: usize) {
        let mut gap = slot + 1;
        while self.meta(gap) != 0 {
            gap += 1;
            assert!(
                gap < self.allocated(),
                "kestrel-hash: no free slot in the overflow run"
            );
        }
        for s in (slot..gap).rev() {
            let bumped = self.meta(s) as u32 + 1;
            debug_assert!(bumped <= MAX_PROBE_DISTANCE);
            if bumped >= MAX_PROBE_DISTANCE {
                self.control.max_items = 0;
            }
            self.set_meta(s + 1, bumped as u8);
        }
        // With entries descending in memory, "everything one slot up" is a
        // single left rotation of the contiguous range between the gap and
        // the insertion point; the gap's (empty) entry lands at `slot`.
        let lo = self.entry_index(gap);
        let hi = self.entry_index(slot);
        self.entries[lo..=hi].rotate_left(1);
    }

    /// Remove the entry for a key and return it.
    pub fn delete(&mut self, hash: u64, eq: impl FnMut(&E) -> bool) -> Option<E> {
        let slot = self.find_slot(hash, eq)?;
        let taken = mem::take(self.entry_mut(slot));
        // Walk forward shifting back every entry displaced past its ideal
        // slot; the trailing sentinel (value 1) stops the walk at the end of
        // the region without a bounds branch.
        let mut last = slot;
        loop {
            let next_meta = self.meta(last + 1);
            if next_meta <= 1 {
                break;
            }
            self.set_meta(last, next_meta - 1);
            last += 1;
        }
        if last > slot {
            let lo = self.entry_index(last);
            let hi = self.entry_index(slot);
            self.entries[lo..=hi].rotate_right(1);
        }
        self.set_meta(last, 0);
        self.control.cur_items -= 1;
        Some(taken)
    }

    fn grow(&mut self, rehash: &mut impl FnMut(&E) -> u64) {
        let new_size = self.control.official_size * 2;
        debug!(
            "growing table: {} -> {} official buckets, {} live entries",
            self.control.official_size, new_size, self.control.cur_items
        );
        let old = mem::replace(self, Self::allocate(new_size));
        let allocated = old.allocated();
        let mut old_entries = old.entries;
        for slot in 0..allocated {
            if old.metadata[slot + 1] == 0 {
                continue;
            }
            let entry = mem::take(&mut old_entries[allocated - 1 - slot]);
            let hash = rehash(&entry);
            let (dst, fresh) = self.probe_place(hash, |_| false);
            debug_assert!(fresh);
            *self.entry_mut(dst) = entry;
        }
    }

    /// Iterate over the live entries in slot order.
    pub fn iter(&self) -> impl Iterator<Item = &E> + '_ {
        (0..self.allocated()).filter_map(move |slot| {
            if self.meta(slot) != 0 {
                Some(self.entry(slot))
            } else {
                None
            }
        })
    }

    /// Walk the whole table checking its layout invariants.
    pub fn fsck(&self, mut rehash: impl FnMut(&E) -> u64) -> Vec<FsckError> {
        let mut errors = Vec::new();
        if self.entries.is_empty() {
            return errors;
        }
        let allocated = self.allocated();
        for index in [0, allocated + 1] {
            let value = self.metadata[index];
            if value != 1 {
                errors.push(FsckError::BadSentinel { index, value });
            }
        }
        let mut counted = 0u32;
        let mut prev: u8 = 0;
        for slot in 0..allocated {
            let stored = self.meta(slot);
            if stored == 0 {
                prev = 0;
                continue;
            }
            counted += 1;
            let ideal = self.ideal_slot(rehash(self.entry(slot)));
            if slot < ideal {
                errors.push(FsckError::EntryBeforeIdeal { slot, ideal });
            } else {
                let expected = (slot - ideal) as u32 + 1;
                if expected != stored as u32 {
                    errors.push(FsckError::WrongProbeDistance {
                        slot,
                        stored,
                        ideal,
                        expected,
                    });
                }
            }
            if stored as u32 > prev as u32 + 1 {
                errors.push(FsckError::BrokenOrdering { slot, stored, prev });
            }
            prev = stored;
        }
        if counted != self.control.cur_items {
            errors.push(FsckError::WrongItemCount {
                counted,
                recorded: self.control.cur_items,
            });
        }
        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Entry for exercising the core directly: `.0` is the full hash word
    /// and the identity of the key, `.1` a payload.
    type E = (u64, u32);

    fn fetch(table: &mut RawTable<E>, hash: u64) -> (&mut E, bool) {
        table.lvalue_fetch(8, hash, |e| e.0 == hash, |e| e.0)
    }

    /// A hash that lands in bucket `bucket` of an 8-bucket table, with `tag`
    /// disambiguating distinct keys in the same bucket.
    fn in_bucket(bucket: u64, tag: u64) -> u64 {
        (bucket << 61) | tag
    }

    #[test]
    fn empty_table() {
        let table = RawTable::<E>::new();
        assert_eq!(table.count(), 0);
        assert_eq!(table.official_size(), 0);
        assert_eq!(table.find_slot(42, |_| true), None);
        assert!(table.fsck(|e| e.0).is_empty());
        assert_eq!(table.iter().count(), 0);
    }

    #[test]
    fn first_insert_allocates() {
        let mut table = RawTable::<E>::new();
        let h = in_bucket(3, 0);
        let (entry, fresh) = fetch(&mut table, h);
        assert!(fresh);
        *entry = (h, 7);
        assert_eq!(table.official_size(), 8);
        assert_eq!(table.count(), 1);
        let (entry, fresh) = fetch(&mut table, h);
        assert!(!fresh);
        assert_eq!(entry.1, 7);
        assert!(table.fsck(|e| e.0).is_empty());
    }

    #[test]
    fn collision_chain_metadata() {
        let mut table = RawTable::<E>::new();
        for tag in 0..4 {
            let h = in_bucket(2, tag);
            let (entry, fresh) = fetch(&mut table, h);
            assert!(fresh);
            *entry = (h, tag as u32);
        }
        // Four same-bucket keys occupy slots 2..6 with distances 1..=4.
        for (i, expected) in (2..6).zip(1u8..) {
            assert_eq!(table.meta(i), expected);
        }
        assert_eq!(table.longest_probe(), 4);
        assert!(table.fsck(|e| e.0).is_empty());
    }

    #[test]
    fn robin_hood_displacement() {
        let mut table = RawTable::<E>::new();
        // A key in bucket 3 first, then two keys in bucket 2. The second
        // bucket-2 key must displace the bucket-3 key from slot 3.
        let a = in_bucket(3, 0);
        let b = in_bucket(2, 0);
        let c = in_bucket(2, 1);
        for h in [a, b, c] {
            let (entry, fresh) = fetch(&mut table, h);
            assert!(fresh);
            *entry = (h, 0);
        }
        assert_eq!(table.meta(2), 1); // b at its ideal slot
        assert_eq!(table.meta(3), 2); // c displaced a
        assert_eq!(table.meta(4), 2); // a pushed one slot along
        assert_eq!(table.find(a, |e| e.0 == a).unwrap().0, a);
        assert!(table.fsck(|e| e.0).is_empty());
    }

    #[test]
    fn delete_shifts_back() {
        let mut table = RawTable::<E>::new();
        let keys: Vec<u64> = (0..4).map(|tag| in_bucket(5, tag)).collect();
        for &h in &keys {
            let (entry, _) = fetch(&mut table, h);
            *entry = (h, 1);
        }
        let deleted = table.delete(keys[0], |e| e.0 == keys[0]);
        assert_eq!(deleted, Some((keys[0], 1)));
        assert_eq!(table.count(), 3);
        // The survivors all shifted back to distances 1..=3.
        for (i, expected) in (5..8).zip(1u8..) {
            assert_eq!(table.meta(i), expected);
        }
        for &h in &keys[1..] {
            assert!(table.find_slot(h, |e| e.0 == h).is_some());
        }
        assert!(table.fsck(|e| e.0).is_empty());
    }

    #[test]
    fn grow_preserves_entries() {
        let mut table = RawTable::<E>::new();
        // 8 official buckets hold 6 entries at the 3/4 load factor; the
        // seventh insertion grows.
        for tag in 0..16 {
            let h = in_bucket(tag % 8, tag);
            let (entry, fresh) = fetch(&mut table, h);
            assert!(fresh);
            *entry = (h, tag as u32);
        }
        assert!(table.official_size() > 8);
        assert_eq!(table.count(), 16);
        for tag in 0..16 {
            let h = in_bucket(tag % 8, tag);
            assert_eq!(table.find(h, |e| e.0 == h).unwrap().1, tag as u32);
        }
        assert!(table.fsck(|e| e.0).is_empty());
    }

    #[test]
    fn zero_max_items_grows_before_insert() {
        let mut table = RawTable::<E>::new();
        let h = in_bucket(0, 0);
        *fetch(&mut table, h).0 = (h, 1);
        table.control.max_items = 0;
        let h2 = in_bucket(1, 0);
        *fetch(&mut table, h2).0 = (h2, 2);
        assert_eq!(table.official_size(), 16);
        assert_eq!(table.count(), 2);
        assert!(table.fsck(|e| e.0).is_empty());
    }

    #[test]
    fn lookup_at_capacity_does_not_grow() {
        let mut table = RawTable::<E>::new();
        let h = in_bucket(0, 0);
        *fetch(&mut table, h).0 = (h, 1);
        table.control.max_items = 0;
        // Fetching a key that is already present must not reallocate.
        let (_, fresh) = fetch(&mut table, h);
        assert!(!fresh);
        assert_eq!(table.official_size(), 8);
    }

    #[test]
    fn sentinels_survive_churn() {
        let mut table = RawTable::<E>::new();
        for tag in 0..32 {
            let h = in_bucket(tag % 8, tag);
            *fetch(&mut table, h).0 = (h, 0);
        }
        for tag in (0..32).step_by(2) {
            let h = in_bucket(tag % 8, tag);
            assert!(table.delete(h, |e| e.0 == h).is_some());
        }
        let allocated = table.allocated();
        assert_eq!(table.metadata[0], 1);
        assert_eq!(table.metadata[allocated + 1], 1);
        assert!(table.fsck(|e| e.0).is_empty());
    }
}
