//! Open-addressed hash table keyed by interned strings.
//!
//! Linear probing with tombstones. An entry is empty (no key, nil
//! value), a tombstone (no key, `true` value), or live. `count` includes
//! tombstones so the load factor accounts for them; growing rehashes
//! only live entries and resets the count.

use crate::heap::GcRef;
use crate::value::Value;

const TABLE_MAX_LOAD: f64 = 0.75;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Option<GcRef>,
    hash: u32,
    value: Value,
}

impl Entry {
    fn empty() -> Self {
        Entry {
            key: None,
            hash: 0,
            value: Value::nil(),
        }
    }

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && self.value.as_bool() == Some(true)
    }
}

/// String-keyed hash table. Key equality is handle identity, which is
/// byte equality because string objects are interned. Each entry caches
/// the key's hash so the table can rehash without consulting the heap.
#[derive(Debug, Clone, Default)]
pub struct Table {
    /// Live entries plus tombstones.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Self {
        Table::default()
    }

    fn capacity(&self) -> usize {
        self.entries.len()
    }

    /// Probe for `key`, returning the index of its live entry or of the
    /// slot an insert should use (the first tombstone seen, else the
    /// terminating empty slot). Capacity must be nonzero.
    fn find_entry(entries: &[Entry], key: GcRef, hash: u32) -> usize {
        let mask = entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            match entry.key {
                Some(k) if k == key => return index,
                Some(_) => {}
                None => {
                    if entry.is_tombstone() {
                        if tombstone.is_none() {
                            tombstone = Some(index);
                        }
                    } else {
                        return tombstone.unwrap_or(index);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    pub fn get(&self, key: GcRef, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &self.entries[index];
        entry.key.map(|_| entry.value)
    }

    /// Insert or update. Returns true if the key was not present.
    pub fn set(&mut self, key: GcRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) as f64 > self.capacity() as f64 * TABLE_MAX_LOAD {
            let new_capacity = if self.capacity() < 8 {
                8
            } else {
                self.capacity() * 2
            };
            self.adjust_capacity(new_capacity);
        }

        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_none();
        // A reused tombstone was already counted.
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        *entry = Entry {
            key: Some(key),
            hash,
            value,
        };
        is_new
    }

    /// Remove a key by replacing its entry with a tombstone.
    pub fn delete(&mut self, key: GcRef, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key, hash);
        let entry = &mut self.entries[index];
        if entry.key.is_none() {
            return false;
        }
        *entry = Entry {
            key: None,
            hash: 0,
            value: Value::bool(true),
        };
        true
    }

    /// Probe for a key by hash and a caller-supplied equality check on
    /// the key object. Used by string interning, where the candidate key
    /// does not exist as an object yet.
    pub fn find_key(&self, hash: u32, mut eq: impl FnMut(GcRef) -> bool) -> Option<GcRef> {
        if self.count == 0 {
            return None;
        }
        let mask = self.capacity() - 1;
        let mut index = hash as usize & mask;
        loop {
            let entry = &self.entries[index];
            match entry.key {
                Some(k) => {
                    if entry.hash == hash && eq(k) {
                        return Some(k);
                    }
                }
                None => {
                    if !entry.is_tombstone() {
                        return None;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Tombstone every entry whose key fails the predicate. The GC uses
    /// this to prune dead strings from the intern pool before sweeping.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(GcRef) -> bool) {
        for entry in &mut self.entries {
            if let Some(key) = entry.key {
                if !keep(key) {
                    *entry = Entry {
                        key: None,
                        hash: 0,
                        value: Value::bool(true),
                    };
                }
            }
        }
    }

    /// Snapshot of the live entries.
    pub fn pairs(&self) -> Vec<(GcRef, Value)> {
        self.entries
            .iter()
            .filter_map(|e| e.key.map(|k| (k, e.value)))
            .collect()
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.iter().filter(|e| e.key.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn byte_estimate(&self) -> usize {
        self.capacity() * std::mem::size_of::<Entry>()
    }

    fn adjust_capacity(&mut self, new_capacity: usize) {
        let old = std::mem::replace(&mut self.entries, vec![Entry::empty(); new_capacity]);
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let index = Self::find_entry(&self.entries, key, entry.hash);
                self.entries[index] = entry;
                self.count += 1;
            }
        }
    }
}
