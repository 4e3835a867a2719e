//! Pointer-keyed hash table.
//!
//! Keys are machine words with identity semantics (raw pointers, tagged
//! object handles, interned ids); the hash is a single golden-ratio multiply
//! over the address word. This is not a cryptographic hash and is not meant
//! to be: the keys come from an allocator, not an adversary.

use crate::raw::{FsckError, RawTable};
use crate::{GOLDEN_RATIO_64, PTR_INITIAL_SIZE};

/// A key usable in a [`PtrHashTable`]: copyable, compared by identity, and
/// reducible to the address word fed to the hash function.
pub trait PtrKey: Copy + Eq {
    /// The word the hash is computed from.
    fn addr(self) -> usize;
}

impl PtrKey for usize {
    fn addr(self) -> usize {
        self
    }
}

impl<T> PtrKey for *const T {
    fn addr(self) -> usize {
        self as usize
    }
}

impl<T> PtrKey for *mut T {
    fn addr(self) -> usize {
        self as usize
    }
}

fn hash_key<K: PtrKey>(key: K) -> u64 {
    (key.addr() as u64).wrapping_mul(GOLDEN_RATIO_64)
}

struct PtrEntry<K, V> {
    key: Option<K>,
    value: V,
}

impl<K, V: Default> Default for PtrEntry<K, V> {
    fn default() -> Self {
        Self {
            key: None,
            value: V::default(),
        }
    }
}

impl<K: PtrKey, V> PtrEntry<K, V> {
    fn hash(&self) -> u64 {
        hash_key(self.key.expect("occupied slot with no key"))
    }
}

/// A Robin Hood hash table from machine-word keys to values.
pub struct PtrHashTable<K: PtrKey, V> {
    raw: RawTable<PtrEntry<K, V>>,
}

impl<K: PtrKey, V: Default> PtrHashTable<K, V> {
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

    /// Fetch the value slot for `key`, inserting a default value if the key
    /// is absent.
    pub fn lvalue_fetch(&mut self, key: K) -> &mut V {
        let hash = hash_key(key);
        let (entry, fresh) =
            self.raw
                .lvalue_fetch(PTR_INITIAL_SIZE, hash, |e| e.key == Some(key), PtrEntry::hash);
        if fresh {
            entry.key = Some(key);
        }
        &mut entry.value
    }

    /// Insert a key/value pair. The key must either be absent or already
    /// mapped to an equal value; anything else is a caller bug.
    pub fn insert(&mut self, key: K, value: V)
    where
        V: PartialEq,
    {
        let hash = hash_key(key);
        let (entry, fresh) =
            self.raw
                .lvalue_fetch(PTR_INITIAL_SIZE, hash, |e| e.key == Some(key), PtrEntry::hash);
        if fresh {
            entry.key = Some(key);
            entry.value = value;
        } else if entry.value != value {
            panic!("kestrel-hash: insert of a duplicate key with a conflicting value");
        }
    }

    /// Look up the value for `key`.
    pub fn fetch(&self, key: K) -> Option<&V> {
        let hash = hash_key(key);
        self.raw
            .find(hash, |e| e.key == Some(key))
            .map(|e| &e.value)
    }

    /// Remove `key` and return the value it mapped to.
    pub fn fetch_and_delete(&mut self, key: K) -> Option<V> {
        let hash = hash_key(key);
        self.raw.delete(hash, |e| e.key == Some(key)).map(|e| e.value)
    }

    /// Iterate over the live key/value pairs in slot order.
    pub fn iter(&self) -> impl Iterator<Item = (K, &V)> + '_ {
        self.raw.iter().map(|e| {
            let key = e.key.expect("occupied slot with no key");
            (key, &e.value)
        })
    }

    /// Check the table's layout invariants.
    pub fn fsck(&self) -> Vec<FsckError> {
        self.raw.fsck(PtrEntry::hash)
    }

    /// The longest probe distance currently stored in the table.
    pub fn longest_probe(&self) -> u8 {
        self.raw.longest_probe()
    }
}

impl<K: PtrKey, V: Default> Default for PtrHashTable<K, V> {
    fn default() -> Self {
        Self::new()
    }
}
