use std::mem;

use crate::{Gc, Heap, ObjString, Value};

/// Grow when the table is more than three quarters full, tombstones included.
const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

#[derive(Debug, Clone, Copy)]
struct Entry {
    key: Option<Gc<ObjString>>,
    value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry {
        key: None,
        value: Value::Nil,
    };

    // A tombstone keeps probe sequences that passed through a deleted slot intact.
    const TOMBSTONE: Entry = Entry {
        key: None,
        value: Value::Bool(true),
    };

    fn is_tombstone(&self) -> bool {
        self.key.is_none() && matches!(self.value, Value::Bool(true))
    }
}

/// A hash table mapping interned strings to values, using open addressing with
/// linear probing over a power-of-two capacity.
///
/// Keys are compared by pointer, which is content comparison because strings
/// are interned.
#[derive(Debug, Default)]
pub struct Table {
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the value bound to the key.
    pub fn get(&self, key: Gc<ObjString>) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let entry = &self.entries[self.find_entry(key)];
        entry.key.map(|_| entry.value)
    }

    /// Bind the key to the value, returning whether the key was newly added.
    pub fn set(&mut self, key: Gc<ObjString>, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.entries.len() * MAX_LOAD_NUM {
            self.grow();
        }
        let idx = self.find_entry(key);
        let entry = &mut self.entries[idx];
        let is_new = entry.key.is_none();
        // Reused tombstones were already included in the count.
        if is_new && !entry.is_tombstone() {
            self.count += 1;
        }
        *entry = Entry {
            key: Some(key),
            value,
        };
        is_new
    }

    /// Unbind the key, returning whether it was present.
    pub fn remove(&mut self, key: Gc<ObjString>) -> bool {
        if self.count == 0 {
            return false;
        }
        let idx = self.find_entry(key);
        if self.entries[idx].key.is_none() {
            return false;
        }
        self.entries[idx] = Entry::TOMBSTONE;
        true
    }

    /// Copy every binding of the other table into this one.
    pub fn add_all(&mut self, other: &Table) {
        for (key, value) in other.iter() {
            self.set(key, value);
        }
    }

    /// Look up an interned string by content. This is the only lookup that
    /// compares keys by hash and content instead of by pointer.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<Gc<ObjString>> {
        if self.count == 0 {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut idx = hash as usize & mask;
        loop {
            let entry = &self.entries[idx];
            match entry.key {
                None if !entry.is_tombstone() => return None,
                Some(key) if key.hash() == hash
                    && key.as_str().len() == chars.len()
                    && key.as_str() == chars =>
                {
                    return Some(key)
                }
                _ => {}
            }
            idx = (idx + 1) & mask;
        }
    }

    /// Iterate over the live entries of the table.
    pub fn iter(&self) -> impl Iterator<Item = (Gc<ObjString>, Value)> + '_ {
        self.entries
            .iter()
            .filter_map(|entry| entry.key.map(|key| (key, entry.value)))
    }

    /// Mark every key and value in the table.
    pub fn mark(&self, heap: &mut Heap) {
        for (key, value) in self.iter() {
            heap.mark(key);
            heap.mark_value(value);
        }
    }

    /// Approximate number of heap bytes backing the table's buffer
    pub fn size_bytes(&self) -> usize {
        self.entries.capacity() * mem::size_of::<Entry>()
    }

    /// Delete every entry whose key has not been marked by the current
    /// collection. Called on the interner between tracing and sweeping.
    pub(crate) fn remove_white(&mut self) {
        for idx in 0..self.entries.len() {
            if let Some(key) = self.entries[idx].key {
                if !key.is_marked() {
                    self.entries[idx] = Entry::TOMBSTONE;
                }
            }
        }
    }

    /// Slot holding the key, or the slot where it should be inserted. The
    /// table always keeps at least one empty entry, so probing terminates.
    fn find_entry(&self, key: Gc<ObjString>) -> usize {
        let mask = self.entries.len() - 1;
        let mut idx = key.hash() as usize & mask;
        let mut tombstone = None;
        loop {
            let entry = &self.entries[idx];
            match entry.key {
                Some(existing) if Gc::ptr_eq(&existing, &key) => return idx,
                None if entry.is_tombstone() => {
                    tombstone.get_or_insert(idx);
                }
                None => return tombstone.unwrap_or(idx),
                Some(_) => {}
            }
            idx = (idx + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let capacity = if self.entries.is_empty() {
            8
        } else {
            self.entries.len() * 2
        };
        let old = mem::replace(&mut self.entries, vec![Entry::EMPTY; capacity]);
        // Tombstones are dropped on the way, so the count is rebuilt too.
        self.count = 0;
        for entry in old {
            if let Some(key) = entry.key {
                let idx = self.find_entry(key);
                self.entries[idx] = entry;
                self.count += 1;
            }
        }
    }
}
