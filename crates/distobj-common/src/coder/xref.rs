//! Cross-reference tables.
//!
//! Indices are assigned sequentially from 1 within each table; 0 on the wire
//! means nil. Classes, objects and the shared "pointer" table (C strings,
//! opaque pointers and selectors) are numbered independently.

use std::collections::{HashMap, HashSet};
use std::hash::Hash;

use crate::coder::graph::{BlobId, ObjectId};

/// Writer-side map from an identity key to its assigned index.
#[derive(Debug)]
pub struct XrefTable<K> {
    indexes: HashMap<K, u32>,
}

impl<K: Eq + Hash> XrefTable<K> {
    pub fn new() -> Self {
        Self {
            indexes: HashMap::new(),
        }
    }

    pub fn get(&self, key: &K) -> Option<u32> {
        self.indexes.get(key).copied()
    }

    /// Assigns the next index to `key`. Returns the existing index if the key
    /// was already present.
    pub fn assign(&mut self, key: K) -> u32 {
        let next = self.indexes.len() as u32 + 1;
        *self.indexes.entry(key).or_insert(next)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.indexes.contains_key(key)
    }

    pub fn len(&self) -> u32 {
        self.indexes.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.indexes.keys()
    }

    pub fn clear(&mut self) {
        self.indexes.clear();
    }
}

impl<K: Eq + Hash> Default for XrefTable<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Identity of an entry in the shared pointer table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PointerKey {
    Blob(BlobId),
    Selector(String),
}

/// Everything an archive writer remembers about what it has written.
#[derive(Debug, Default)]
pub struct WriterTables {
    /// Archived class name to class index.
    pub classes: XrefTable<String>,
    /// Objects written with their contents.
    pub unconditional: XrefTable<ObjectId>,
    /// Objects seen only through conditional references so far.
    pub conditional: HashSet<ObjectId>,
    pub pointers: XrefTable<PointerKey>,
    /// True class name to the name written in its place.
    pub names: HashMap<String, String>,
    /// Object to the object encoded in its place.
    pub replacements: HashMap<ObjectId, ObjectId>,
}

impl WriterTables {
    /// Forgets per-pass identity state. Name substitutions and replacements
    /// are configuration and survive.
    pub fn clear_pass(&mut self) {
        self.classes.clear();
        self.unconditional.clear();
        self.conditional.clear();
        self.pointers.clear();
    }
}

/// Reader-side list of decoded entries, addressed by 1-based index.
#[derive(Debug)]
pub struct SlotTable<T> {
    slots: Vec<T>,
}

impl<T> SlotTable<T> {
    pub fn new() -> Self {
        Self { slots: Vec::new() }
    }

    /// Index the next registered entry will receive.
    pub fn next_index(&self) -> u32 {
        self.slots.len() as u32 + 1
    }

    pub fn register(&mut self, entry: T) -> u32 {
        self.slots.push(entry);
        self.slots.len() as u32
    }

    pub fn get(&self, index: u32) -> Option<&T> {
        match index {
            0 => None,
            i => self.slots.get(i as usize - 1),
        }
    }

    pub fn len(&self) -> u32 {
        self.slots.len() as u32
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn clear(&mut self) {
        self.slots.clear();
    }
}

impl<T> Default for SlotTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// A decoded class record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassSlot {
    pub name: String,
    pub version: u32,
}

/// A decoded pointer-table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PointerSlot {
    Blob(BlobId),
    Selector(String),
}

#[derive(Debug, Default)]
pub struct ReaderTables {
    pub classes: SlotTable<ClassSlot>,
    pub objects: SlotTable<ObjectId>,
    pub pointers: SlotTable<PointerSlot>,
}

impl ReaderTables {
    pub fn clear(&mut self) {
        self.classes.clear();
        self.objects.clear();
        self.pointers.clear();
    }
}
