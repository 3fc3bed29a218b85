//! Insertion-ordered key → encoded-document container with transactions.
//!
//! The [`DocumentMap`] is the only mutable shared state in a [`Store`]
//! (see [`crate::store`]). A transaction stages writes against a
//! copy-on-write clone and swaps it in atomically at `commit`; readers
//! outside the transaction see the pre-transaction state until that swap.

use indexmap::IndexMap;

use crate::error::Error;
use crate::field::{EncodedDocument, EncodedField, EncodedNode, DELETED_KEY};
use crate::clock::Eventstamp;

/// Insertion-ordered map from key to encoded document, including
/// tombstones. Entries are never removed by the core.
#[derive(Debug, Clone, Default)]
pub struct DocumentMap {
    entries: IndexMap<String, EncodedDocument>,
}

impl DocumentMap {
    /// Creates an empty map.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the encoded document at `key`, if present.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&EncodedDocument> {
        self.entries.get(key)
    }

    /// Whether `key` has ever been written (tombstones count).
    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Iterates all entries in insertion order, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &EncodedDocument)> {
        self.entries.iter()
    }

    /// Number of keys ever written, including tombstones.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the map holds no entries at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Overwrites `key` with `doc` directly, without merging.
    ///
    /// Used only for pre-encoded ingests such as a persistence snapshot
    /// load, where the incoming document is already the authoritative
    /// merged state.
    pub fn put(&mut self, key: String, doc: EncodedDocument) {
        self.entries.insert(key, doc);
    }

    /// Merges `doc` into the existing document at `key` (or inserts it if
    /// absent). Returns whether the stored document changed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StructureMismatch`] if `doc` conflicts in shape with
    /// the existing document at `key`.
    pub fn merge(&mut self, key: String, doc: EncodedDocument) -> Result<bool, Error> {
        match self.entries.get(&key) {
            Some(existing) => {
                let (merged, changed) = crate::merge::merge_doc(existing, &doc)?;
                if changed {
                    self.entries.insert(key, merged);
                }
                Ok(changed)
            }
            None => {
                self.entries.insert(key, doc);
                Ok(true)
            }
        }
    }

    /// Merges a fresh tombstone field into `key`'s document.
    ///
    /// Returns whether the document changed (it may already be a
    /// tombstone with an equal-or-newer stamp, in which case this is a
    /// no-op).
    pub fn del(&mut self, key: String, eventstamp: Eventstamp) -> Result<bool, Error> {
        let mut tombstone = EncodedDocument::new();
        tombstone.insert(
            DELETED_KEY.to_string(),
            EncodedNode::Field(EncodedField {
                value: crate::value::Value::Bool(true),
                eventstamp,
            }),
        );
        self.merge(key, tombstone)
    }

    /// Begins a copy-on-write transaction over a clone of the current map.
    ///
    /// The returned [`Transaction`] owns its staged copy outright (no
    /// borrow of `self` is held), so callers — notably [`Store::begin`]
    /// (see `crate::store`) — can hold it alongside other mutable borrows
    /// of the map's owner without fighting the borrow checker.
    #[must_use]
    pub fn begin(&self) -> Transaction {
        Transaction {
            staged: self.entries.clone(),
        }
    }

    /// Atomically replaces the entire entry set with `staged`, the result
    /// of a committed [`Transaction`]. No intermediate state is observable
    /// to readers between the previous and new entries.
    pub fn apply_staged(&mut self, staged: IndexMap<String, EncodedDocument>) {
        self.entries = staged;
    }
}

/// A staged, not-yet-committed set of mutations, seeded from a clone of a
/// [`DocumentMap`]'s entries at [`DocumentMap::begin`] time.
///
/// Reads through the owning `DocumentMap` continue to see the
/// pre-transaction state until [`Transaction::commit`] swaps the staged
/// copy in. [`Transaction::rollback`] discards the staged copy entirely.
pub struct Transaction {
    staged: IndexMap<String, EncodedDocument>,
}

impl Transaction {
    /// Overwrites `key` in the staged copy, without merging.
    pub fn put(&mut self, key: String, doc: EncodedDocument) {
        self.staged.insert(key, doc);
    }

    /// Merges `doc` into the staged copy at `key`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StructureMismatch`] on a shape conflict.
    pub fn merge(&mut self, key: String, doc: EncodedDocument) -> Result<bool, Error> {
        match self.staged.get(&key) {
            Some(existing) => {
                let (merged, changed) = crate::merge::merge_doc(existing, &doc)?;
                if changed {
                    self.staged.insert(key, merged);
                }
                Ok(changed)
            }
            None => {
                self.staged.insert(key, doc);
                Ok(true)
            }
        }
    }

    /// Merges a tombstone field into the staged copy at `key`.
    pub fn del(&mut self, key: String, eventstamp: Eventstamp) -> Result<bool, Error> {
        let mut tombstone = EncodedDocument::new();
        tombstone.insert(
            DELETED_KEY.to_string(),
            EncodedNode::Field(EncodedField {
                value: crate::value::Value::Bool(true),
                eventstamp,
            }),
        );
        self.merge(key, tombstone)
    }

    /// Reads the staged value at `key`, falling back to nothing if absent.
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&EncodedDocument> {
        self.staged.get(key)
    }

    /// Atomically swaps the staged copy into the owning map, consuming the
    /// transaction. Returns the staged entries so the caller (the `Store`)
    /// can diff against the pre-transaction state to build a `Change`.
    #[must_use]
    pub fn commit(self) -> IndexMap<String, EncodedDocument> {
        self.staged
    }

    /// Discards all staged mutations; the owning map is left untouched.
    pub fn rollback(self) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::field::EncodedNode;
    use crate::value::Value;

    fn es(n: u32) -> Eventstamp {
        Eventstamp::parse(&format!("2025-01-02T03:04:05.006Z|{n:08x}")).unwrap()
    }

    fn doc_with(key: &str, value: Value, stamp: u32) -> EncodedDocument {
        let mut d = EncodedDocument::new();
        d.insert(
            key.to_string(),
            EncodedNode::Field(EncodedField {
                value,
                eventstamp: es(stamp),
            }),
        );
        d
    }

    #[test]
    fn put_overwrites_without_merging() {
        let mut map = DocumentMap::new();
        map.put("k".to_string(), doc_with("a", Value::Int(1), 0));
        map.put("k".to_string(), doc_with("b", Value::Int(2), 1));
        let doc = map.get("k").unwrap();
        assert_eq!(doc.len(), 1);
        assert!(doc.contains_key("b"));
    }

    #[test]
    fn merge_combines_with_existing_document() {
        let mut map = DocumentMap::new();
        map.put("k".to_string(), doc_with("a", Value::Int(1), 0));
        let changed = map.merge("k".to_string(), doc_with("b", Value::Int(2), 1)).unwrap();
        assert!(changed);
        assert_eq!(map.get("k").unwrap().len(), 2);
    }

    #[test]
    fn del_marks_tombstone_but_keeps_entry() {
        let mut map = DocumentMap::new();
        map.put("k".to_string(), doc_with("a", Value::Int(1), 0));
        map.del("k".to_string(), es(1)).unwrap();
        assert!(map.contains_key("k"));
        assert!(crate::field::is_tombstone(map.get("k").unwrap()));
    }

    #[test]
    fn transaction_commit_swaps_atomically() {
        let mut map = DocumentMap::new();
        map.put("a".to_string(), doc_with("x", Value::Int(1), 0));

        let mut tx = map.begin();
        tx.put("b".to_string(), doc_with("y", Value::Int(2), 1));
        assert!(!map.contains_key("b"));

        let staged = tx.commit();
        map.apply_staged(staged);
        assert!(map.contains_key("a"));
        assert!(map.contains_key("b"));
    }

    #[test]
    fn transaction_rollback_discards_staged_mutations() {
        let mut map = DocumentMap::new();
        map.put("a".to_string(), doc_with("x", Value::Int(1), 0));

        let mut tx = map.begin();
        tx.put("b".to_string(), doc_with("y", Value::Int(2), 1));
        tx.rollback();

        assert!(map.contains_key("a"));
        assert!(!map.contains_key("b"));
    }
}
