//! Fixkey hash: string keys with stable payload addresses.
//!
//! Each entry is an indirection to a boxed record holding the key and a
//! fixed-shape payload. The box is what growth moves around, so the payload's
//! address never changes for as long as the key stays in the table; callers
//! are free to keep references into payloads across later insertions.

use crate::raw::{FsckError, RawTable};
use crate::{str_hash, UNI_MIN_SIZE_BASE_2};

struct FixKeyEntry<V> {
    key: Box<str>,
    payload: V,
}

type Slot<V> = Option<Box<FixKeyEntry<V>>>;

fn slot_hash<V>(slot: &Slot<V>) -> u64 {
    str_hash(&slot.as_ref().expect("occupied slot with no record").key)
}

/// A Robin Hood hash table from strings to boxed fixed-shape payloads.
pub struct FixKeyHashTable<V> {
    raw: RawTable<Slot<V>>,
}

impl<V: Default> FixKeyHashTable<V> {
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

    /// Fetch the payload for `key`, inserting a default-initialized record
    /// if the key is absent.
    pub fn fetch_or_insert(&mut self, key: &str) -> &mut V {
        let hash = str_hash(key);
        let (slot, fresh) = self.raw.lvalue_fetch(
            1 << UNI_MIN_SIZE_BASE_2,
            hash,
            |s| s.as_ref().is_some_and(|r| &*r.key == key),
            slot_hash,
        );
        if fresh {
            *slot = Some(Box::new(FixKeyEntry {
                key: key.into(),
                payload: V::default(),
            }));
        }
        &mut slot.as_mut().expect("occupied slot with no record").payload
    }

    /// Look up the payload for `key`.
    pub fn fetch(&self, key: &str) -> Option<&V> {
        let hash = str_hash(key);
        self.raw
            .find(hash, |s| s.as_ref().is_some_and(|r| &*r.key == key))
            .map(|s| &s.as_ref().expect("occupied slot with no record").payload)
    }

    /// Look up the payload for `key`, mutable edition.
    pub fn fetch_mut(&mut self, key: &str) -> Option<&mut V> {
        let hash = str_hash(key);
        self.raw
            .find_mut(hash, |s| s.as_ref().is_some_and(|r| &*r.key == key))
            .map(|s| &mut s.as_mut().expect("occupied slot with no record").payload)
    }

    /// Remove the entry for `key` and return its payload.
    pub fn delete(&mut self, key: &str) -> Option<V> {
        let hash = str_hash(key);
        self.raw
            .delete(hash, |s| s.as_ref().is_some_and(|r| &*r.key == key))
            .map(|s| s.expect("occupied slot with no record").payload)
    }

    /// Iterate over the live key/payload pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &V)> + '_ {
        self.raw.iter().map(|s| {
            let record = s.as_ref().expect("occupied slot with no record");
            (&*record.key, &record.payload)
        })
    }

    /// Check the table's layout invariants.
    pub fn fsck(&self) -> Vec<FsckError> {
        self.raw.fsck(slot_hash)
    }

    /// The longest probe distance currently stored in the table.
    pub fn longest_probe(&self) -> u8 {
        self.raw.longest_probe()
    }
}

impl<V: Default> Default for FixKeyHashTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default, Debug, PartialEq)]
    struct Payload {
        uses: u32,
    }

    #[test]
    fn fetch_or_insert_defaults() {
        let mut table = FixKeyHashTable::<Payload>::new();
        table.fetch_or_insert("alpha").uses += 1;
        table.fetch_or_insert("alpha").uses += 1;
        table.fetch_or_insert("beta").uses += 1;
        assert_eq!(table.fetch("alpha"), Some(&Payload { uses: 2 }));
        assert_eq!(table.fetch("beta"), Some(&Payload { uses: 1 }));
        assert_eq!(table.fetch("gamma"), None);
        assert_eq!(table.count(), 2);
    }

    #[test]
    fn payload_addresses_stable_across_grow() {
        let mut table = FixKeyHashTable::<Payload>::new();
        let first = table.fetch_or_insert("stable") as *const Payload;
        // Push the table through at least one grow.
        for i in 0..64 {
            table.fetch_or_insert(&format!("key-{i}")).uses = i;
        }
        let after = table.fetch("stable").unwrap() as *const Payload;
        assert_eq!(first, after);
        assert!(table.fsck().is_empty());
    }

    #[test]
    fn delete_drops_record() {
        let mut table = FixKeyHashTable::<Payload>::new();
        table.fetch_or_insert("gone").uses = 3;
        assert_eq!(table.delete("gone"), Some(Payload { uses: 3 }));
        assert_eq!(table.fetch("gone"), None);
        assert_eq!(table.count(), 0);
    }
}
