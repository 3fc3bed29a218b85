//! Merge kernel: deterministic, commutative combination of encoded documents.
//!
//! This is the piece that must deliver the same result regardless of which
//! replica's document is passed as `a` and which as `b`, so two peers that
//! exchange documents in either order converge to the same state.

use std::collections::HashMap;

use crate::error::Error;
use crate::field::{EncodedDocument, EncodedField, EncodedNode};

/// Merges two fields, keeping the one with the greater eventstamp. Ties
/// favor `a`.
///
/// Ties only arise from the same clock instance (eventstamps are strictly
/// monotone within one clock), so favoring `a` is a deterministic, arbitrary
/// but stable choice rather than a source of divergence.
#[must_use]
pub fn merge_field(a: &EncodedField, b: &EncodedField) -> EncodedField {
    if b.eventstamp > a.eventstamp {
        b.clone()
    } else {
        a.clone()
    }
}

/// Merges two encoded documents, returning the merged document and whether
/// the result differs from `a`.
///
/// # Errors
///
/// Returns [`Error::StructureMismatch`] if the same path holds a leaf field
/// on one side and a nested document on the other. The merge aborts without
/// partially applying either side.
pub fn merge_doc(a: &EncodedDocument, b: &EncodedDocument) -> Result<(EncodedDocument, bool), Error> {
    merge_doc_at("", a, b)
}

fn merge_doc_at(
    path: &str,
    a: &EncodedDocument,
    b: &EncodedDocument,
) -> Result<(EncodedDocument, bool), Error> {
    let mut result = EncodedDocument::new();
    let mut changed = false;

    for (k, a_node) in a {
        let child_path = join_path(path, k);
        match b.get(k) {
            Some(b_node) => match (a_node, b_node) {
                (EncodedNode::Field(af), EncodedNode::Field(bf)) => {
                    if bf.eventstamp > af.eventstamp {
                        changed = true;
                    }
                    result.insert(k.clone(), EncodedNode::Field(merge_field(af, bf)));
                }
                (EncodedNode::Doc(ad), EncodedNode::Doc(bd)) => {
                    let (merged, child_changed) = merge_doc_at(&child_path, ad, bd)?;
                    changed |= child_changed;
                    result.insert(k.clone(), EncodedNode::Doc(merged));
                }
                _ => {
                    return Err(Error::StructureMismatch { path: child_path });
                }
            },
            None => {
                result.insert(k.clone(), a_node.clone());
            }
        }
    }

    for (k, b_node) in b {
        if !result.contains_key(k) {
            result.insert(k.clone(), b_node.clone());
            changed = true;
        }
    }

    Ok((result, changed))
}

fn join_path(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

/// Merges a batch of keyed documents against an existing set, in bulk.
///
/// For each key present on only one side, that side's document is taken
/// (an update-only key counts as changed). For keys present on both sides,
/// [`merge_doc`] combines them. Runs in `O((|current| + |updates|) ·
/// avg_fields)` via a hash lookup on `updates`.
///
/// # Errors
///
/// Returns the first [`Error::StructureMismatch`] encountered.
pub fn merge_batch(
    current: &[(String, EncodedDocument)],
    updates: Vec<(String, EncodedDocument)>,
) -> Result<(Vec<(String, EncodedDocument)>, bool), Error> {
    let mut updates_by_key: HashMap<String, EncodedDocument> = updates.into_iter().collect();
    let mut any_changed = false;
    let mut result = Vec::with_capacity(current.len());

    for (key, doc) in current {
        if let Some(update) = updates_by_key.remove(key) {
            let (merged, changed) = merge_doc(doc, &update)?;
            any_changed |= changed;
            result.push((key.clone(), merged));
        } else {
            result.push((key.clone(), doc.clone()));
        }
    }

    for (key, doc) in updates_by_key {
        any_changed = true;
        result.push((key, doc));
    }

    Ok((result, any_changed))
}
