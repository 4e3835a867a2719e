//! Index hash: string keys held in an external interned list.
//!
//! The table stores only `u32` indexes into a list the caller owns (the VM's
//! interned-string array); every operation takes that list as a parameter and
//! key equality re-reads the interned string through it. Entries cache the
//! key's hash so most probe collisions are rejected without touching the
//! list at all.

use crate::raw::{FsckError, RawTable};
use crate::{str_hash, UNI_MIN_SIZE_BASE_2};

#[derive(Clone, Copy, Default)]
struct IndexEntry {
    hash: u64,
    index: u32,
}

/// A Robin Hood hash table from interned strings to their list indexes.
pub struct IndexHashTable {
    raw: RawTable<IndexEntry>,
}

impl IndexHashTable {
    /// An empty table. Nothing is allocated until the first insertion.
    pub fn new() -> Self {
        Self {
            raw: RawTable::new(),
        }
    }

    /// Number of live entries.
    pub fn count(&self) -> u32 {
        self.raw.count()
    }

    /// Record that `list[index]` is the interned copy of its string.
    ///
    /// Inserting an index whose string is already present leaves the
    /// existing entry in place.
    pub fn insert<S: AsRef<str>>(&mut self, list: &[S], index: u32) {
        let key = list[index as usize].as_ref();
        let hash = str_hash(key);
        let (entry, fresh) = self.raw.lvalue_fetch(
            1 << UNI_MIN_SIZE_BASE_2,
            hash,
            |e| e.hash == hash && list[e.index as usize].as_ref() == key,
            |e| e.hash,
        );
        if fresh {
            *entry = IndexEntry { hash, index };
        }
    }

    /// Look up the index interned for `key`.
    pub fn fetch<S: AsRef<str>>(&self, list: &[S], key: &str) -> Option<u32> {
        let hash = str_hash(key);
        self.raw
            .find(hash, |e| {
                e.hash == hash && list[e.index as usize].as_ref() == key
            })
            .map(|e| e.index)
    }

    /// Remove the entry for `key` and return the index it held.
    pub fn delete<S: AsRef<str>>(&mut self, list: &[S], key: &str) -> Option<u32> {
        let hash = str_hash(key);
        self.raw
            .delete(hash, |e| {
                e.hash == hash && list[e.index as usize].as_ref() == key
            })
            .map(|e| e.index)
    }

    /// Iterate over the live indexes in slot order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        self.raw.iter().map(|e| e.index)
    }

    /// Check the table's layout invariants.
    pub fn fsck(&self) -> Vec<FsckError> {
        self.raw.fsck(|e| e.hash)
    }

    /// The longest probe distance currently stored in the table.
    pub fn longest_probe(&self) -> u8 {
        self.raw.longest_probe()
    }
}

impl Default for IndexHashTable {
    fn default() -> Self {
        Self::new()
    }
}
