//! Open-addressed hash table keyed by interned strings.
//!
//! One table type serves four roles: the intern table itself, the globals
//! table, map object storage, and the module cache. Keys are pointers to
//! interned `ObjStr`s, so key comparison is pointer identity; the byte-wise
//! probe (`find_string`) exists only for the interning lookup that
//! establishes that identity in the first place.
//!
//! Layout invariants the global inline cache depends on:
//! - entry indices are stable until the next rehash;
//! - `capacity()` changes on (and only on) a rehash.
//!
//! Deletion leaves a tombstone (null key, `true` value) so probe chains
//! stay intact; tombstones count toward the load factor.

use super::object::{str_ref, Obj};
use super::value::Value;

const MAX_LOAD_NUM: usize = 3;
const MAX_LOAD_DEN: usize = 4;

#[derive(Clone, Copy)]
pub struct Entry {
    pub key: *mut Obj,
    pub value: Value,
}

impl Entry {
    const EMPTY: Entry = Entry {
        key: std::ptr::null_mut(),
        value: Value::NIL,
    };

    fn is_tombstone(&self) -> bool {
        self.key.is_null() && !self.value.is_nil()
    }
}

pub struct Table {
    /// Live entries plus tombstones.
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    pub fn new() -> Table {
        Table {
            count: 0,
            entries: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|entry| !entry.key.is_null())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn get(&self, key: *mut Obj) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &self.entries[index];
        if entry.key.is_null() {
            None
        } else {
            Some(entry.value)
        }
    }

    /// Index of the live entry for `key`, for the inline cache.
    pub fn get_entry_index(&self, key: *mut Obj) -> Option<usize> {
        if self.count == 0 {
            return None;
        }
        let index = Self::find_entry(&self.entries, key);
        if self.entries[index].key.is_null() {
            None
        } else {
            Some(index)
        }
    }

    pub fn key_at(&self, index: usize) -> *mut Obj {
        self.entries[index].key
    }

    pub fn value_at(&self, index: usize) -> Value {
        self.entries[index].value
    }

    pub fn set_value_at(&mut self, index: usize, value: Value) {
        debug_assert!(!self.entries[index].key.is_null());
        self.entries[index].value = value;
    }

    /// Insert or update. Returns true when the key was not present.
    pub fn set(&mut self, key: *mut Obj, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DEN > self.entries.len() * MAX_LOAD_NUM {
            let new_capacity = if self.entries.is_empty() {
                8
            } else {
                self.entries.len() * 2
            };
            self.adjust_capacity(new_capacity);
        }

        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        let is_new = entry.key.is_null();
        // A recycled tombstone was already counted toward the load factor.
        if is_new && entry.value.is_nil() {
            self.count += 1;
        }
        entry.key = key;
        entry.value = value;
        is_new
    }

    pub fn delete(&mut self, key: *mut Obj) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = Self::find_entry(&self.entries, key);
        let entry = &mut self.entries[index];
        if entry.key.is_null() {
            return false;
        }
        entry.key = std::ptr::null_mut();
        entry.value = Value::TRUE;
        true
    }

    /// Copy every live entry of `self` into `target`.
    pub fn add_all_into(&self, target: &mut Table) {
        for entry in &self.entries {
            if !entry.key.is_null() {
                target.set(entry.key, entry.value);
            }
        }
    }

    /// Byte-wise lookup used by the interner: find an already-interned
    /// string with these contents.
    pub fn find_string(&self, chars: &str, hash: u32) -> Option<*mut Obj> {
        if self.count == 0 {
            return None;
        }
        let capacity = self.entries.len();
        let mut index = hash as usize & (capacity - 1);
        loop {
            let entry = &self.entries[index];
            if entry.key.is_null() {
                if !entry.is_tombstone() {
                    return None;
                }
            } else {
                let s = str_ref(entry.key);
                if s.hash == hash && &*s.chars == chars {
                    return Some(entry.key);
                }
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    /// Drop entries whose key string is unmarked. Runs between mark and
    /// sweep so the intern table never holds a pointer the sweeper is
    /// about to free.
    pub fn remove_unmarked_keys(&mut self) {
        for i in 0..self.entries.len() {
            let key = self.entries[i].key;
            if !key.is_null() && !unsafe { (*key).marked } {
                self.entries[i].key = std::ptr::null_mut();
                self.entries[i].value = Value::TRUE;
            }
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (*mut Obj, Value)> + '_ {
        self.entries
            .iter()
            .filter(|entry| !entry.key.is_null())
            .map(|entry| (entry.key, entry.value))
    }

    fn find_entry(entries: &[Entry], key: *mut Obj) -> usize {
        let capacity = entries.len();
        let mut index = str_ref(key).hash as usize & (capacity - 1);
        let mut tombstone: Option<usize> = None;
        loop {
            let entry = &entries[index];
            if entry.key.is_null() {
                if entry.value.is_nil() {
                    // Truly empty: reuse the first tombstone on the chain.
                    return tombstone.unwrap_or(index);
                }
                if tombstone.is_none() {
                    tombstone = Some(index);
                }
            } else if entry.key == key {
                return index;
            }
            index = (index + 1) & (capacity - 1);
        }
    }

    fn adjust_capacity(&mut self, capacity: usize) {
        let old = std::mem::replace(&mut self.entries, vec![Entry::EMPTY; capacity]);
        self.count = 0;
        for entry in old {
            if entry.key.is_null() {
                continue;
            }
            let index = Self::find_entry(&self.entries, entry.key);
            self.entries[index] = entry;
            self.count += 1;
        }
    }
}

impl Default for Table {
    fn default() -> Table {
        Table::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::object::{hash_str, Obj, ObjBody, ObjStr};

    // Tests allocate bare string objects without a VM; they free them at
    // the end so the leak checker stays quiet under sanitizers.
    fn raw_string(s: &str) -> *mut Obj {
        Box::into_raw(Box::new(Obj {
            marked: false,
            next: std::ptr::null_mut(),
            body: ObjBody::Str(ObjStr {
                chars: s.into(),
                hash: hash_str(s.as_bytes()),
            }),
        }))
    }

    fn free_all(keys: Vec<*mut Obj>) {
        for key in keys {
            drop(unsafe { Box::from_raw(key) });
        }
    }

    #[test]
    fn set_get_update() {
        let key = raw_string("alpha");
        let mut table = Table::new();
        assert!(table.set(key, Value::number(1.0)));
        assert_eq!(table.get(key), Some(Value::number(1.0)));
        assert!(!table.set(key, Value::number(2.0)));
        assert_eq!(table.get(key), Some(Value::number(2.0)));
        free_all(vec![key]);
    }

    #[test]
    fn missing_key_is_none() {
        let a = raw_string("a");
        let b = raw_string("b");
        let mut table = Table::new();
        table.set(a, Value::TRUE);
        assert_eq!(table.get(b), None);
        free_all(vec![a, b]);
    }

    #[test]
    fn delete_leaves_chain_intact() {
        let mut keys = Vec::new();
        let mut table = Table::new();
        for i in 0..32 {
            let key = raw_string(&format!("key{}", i));
            table.set(key, Value::number(i as f64));
            keys.push(key);
        }
        assert!(table.delete(keys[7]));
        assert_eq!(table.get(keys[7]), None);
        for (i, &key) in keys.iter().enumerate() {
            if i != 7 {
                assert_eq!(table.get(key), Some(Value::number(i as f64)), "key{}", i);
            }
        }
        // Re-inserting recycles the tombstone.
        table.set(keys[7], Value::number(99.0));
        assert_eq!(table.get(keys[7]), Some(Value::number(99.0)));
        free_all(keys);
    }

    #[test]
    fn growth_preserves_entries() {
        let mut keys = Vec::new();
        let mut table = Table::new();
        for i in 0..200 {
            let key = raw_string(&format!("k{}", i));
            table.set(key, Value::number(i as f64));
            keys.push(key);
        }
        assert_eq!(table.len(), 200);
        for (i, &key) in keys.iter().enumerate() {
            assert_eq!(table.get(key), Some(Value::number(i as f64)));
        }
        free_all(keys);
    }

    #[test]
    fn find_string_matches_by_contents() {
        let key = raw_string("shared");
        let mut table = Table::new();
        table.set(key, Value::NIL);
        let hash = hash_str(b"shared");
        assert_eq!(table.find_string("shared", hash), Some(key));
        assert_eq!(table.find_string("other", hash_str(b"other")), None);
        free_all(vec![key]);
    }

    #[test]
    fn entry_indices_stable_until_rehash() {
        let mut keys = Vec::new();
        let mut table = Table::new();
        for i in 0..4 {
            let key = raw_string(&format!("s{}", i));
            table.set(key, Value::number(i as f64));
            keys.push(key);
        }
        let capacity = table.capacity();
        let index = table.get_entry_index(keys[2]).unwrap();
        // Updating a value must not move the entry while capacity holds.
        table.set(keys[2], Value::number(42.0));
        assert_eq!(table.capacity(), capacity);
        assert_eq!(table.get_entry_index(keys[2]), Some(index));
        assert_eq!(table.value_at(index), Value::number(42.0));
        free_all(keys);
    }

    #[test]
    fn remove_unmarked_keys_drops_white_strings() {
        let live = raw_string("live");
        let dead = raw_string("dead");
        unsafe { (*live).marked = true };
        let mut table = Table::new();
        table.set(live, Value::TRUE);
        table.set(dead, Value::TRUE);
        table.remove_unmarked_keys();
        assert_eq!(table.get(live), Some(Value::TRUE));
        assert_eq!(table.get(dead), None);
        free_all(vec![live, dead]);
    }
}
