//! Encoded field model: the tagged per-field form documents are merged in.
//!
//! A user [`Value::Map`] is walked depth-first by [`encode`] into an
//! [`EncodedDocument`], a tree whose leaves are [`EncodedField`]s, each
//! carrying the eventstamp that last wrote it. [`decode`] is the inverse.
//! Everything other than a plain map (scalars, arrays, bytes, null) is an
//! opaque leaf; only maps recurse.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::clock::Eventstamp;
use crate::value::Value;

/// Reserved key marking a document as a tombstone. Present with value
/// `true` when the document has been deleted; absent otherwise.
pub const DELETED_KEY: &str = "__deleted";

/// The atomic unit of LWW merge: a value tagged with the eventstamp that
/// produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncodedField {
    /// The leaf value.
    pub value: Value,
    /// The eventstamp that last wrote this field.
    pub eventstamp: Eventstamp,
}

/// One node of an [`EncodedDocument`] tree: either a leaf field or a nested
/// document.
///
/// Serializes untagged so the wire form matches the plain-JSON shape
/// described by the snapshot contract (`EncodedField | EncodedDoc`, not an
/// externally-tagged enum).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum EncodedNode {
    /// A leaf `{value, eventstamp}` pair.
    Field(EncodedField),
    /// A nested document.
    Doc(EncodedDocument),
}

/// A recursively nested mapping from string keys to either an
/// [`EncodedField`] or another [`EncodedDocument`].
///
/// Insertion-ordered so re-encoding and snapshot iteration are deterministic.
pub type EncodedDocument = IndexMap<String, EncodedNode>;

/// True if `node` is a leaf field rather than a nested document.
#[must_use]
pub fn is_field(node: &EncodedNode) -> bool {
    matches!(node, EncodedNode::Field(_))
}

/// Encodes a user document into its tagged per-field form, stamping every
/// leaf with `eventstamp`.
///
/// Only [`Value::Map`] values recurse; everything else (including arrays)
/// becomes a single opaque leaf field.
#[must_use]
pub fn encode(document: &IndexMap<String, Value>, eventstamp: &Eventstamp) -> EncodedDocument {
    document
        .iter()
        .map(|(k, v)| (k.clone(), encode_value(v, eventstamp)))
        .collect()
}

fn encode_value(value: &Value, eventstamp: &Eventstamp) -> EncodedNode {
    match value {
        Value::Map(m) => EncodedNode::Doc(encode(m, eventstamp)),
        other => EncodedNode::Field(EncodedField {
            value: other.clone(),
            eventstamp: eventstamp.clone(),
        }),
    }
}

/// Decodes an [`EncodedDocument`] back into a user document.
///
/// The reserved [`DELETED_KEY`] is dropped; it carries no user-visible
/// field.
#[must_use]
pub fn decode(doc: &EncodedDocument) -> IndexMap<String, Value> {
    doc.iter()
        .filter(|(k, _)| k.as_str() != DELETED_KEY)
        .map(|(k, node)| (k.clone(), decode_node(node)))
        .collect()
}

fn decode_node(node: &EncodedNode) -> Value {
    match node {
        EncodedNode::Field(f) => f.value.clone(),
        EncodedNode::Doc(d) => Value::Map(decode(d)),
    }
}

/// Wire form of [`EncodedField`]: the eventstamp travels as a raw string so
/// a malformed one can be rejected per-document during [`from_wire`]
/// instead of failing the whole snapshot's deserialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireField {
    /// The leaf value.
    pub value: Value,
    /// The eventstamp, not yet validated against the canonical wire form.
    pub eventstamp: String,
}

/// Wire form of [`EncodedNode`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireNode {
    /// A leaf field.
    Field(WireField),
    /// A nested document.
    Doc(WireDocument),
}

/// Wire form of [`EncodedDocument`]: what actually crosses the persistence
/// and sync adapter boundary as JSON.
pub type WireDocument = IndexMap<String, WireNode>;

/// Converts an in-memory document to its wire form.
#[must_use]
pub fn to_wire(doc: &EncodedDocument) -> WireDocument {
    doc.iter()
        .map(|(k, node)| (k.clone(), node_to_wire(node)))
        .collect()
}

fn node_to_wire(node: &EncodedNode) -> WireNode {
    match node {
        EncodedNode::Field(f) => WireNode::Field(WireField {
            value: f.value.clone(),
            eventstamp: f.eventstamp.as_str().to_string(),
        }),
        EncodedNode::Doc(d) => WireNode::Doc(to_wire(d)),
    }
}

/// Validates and converts a wire document into its in-memory form.
///
/// # Errors
///
/// Returns [`Error::MalformedEventstamp`] on the first field whose
/// eventstamp does not match the canonical wire form. Callers ingesting a
/// whole snapshot should catch this per top-level entry so one malformed
/// document doesn't corrupt ingestion of the rest (see [`crate::persistence`]
/// and [`crate::sync`]).
pub fn from_wire(doc: &WireDocument) -> Result<EncodedDocument, crate::error::Error> {
    doc.iter()
        .map(|(k, node)| Ok((k.clone(), node_from_wire(node)?)))
        .collect()
}

fn node_from_wire(node: &WireNode) -> Result<EncodedNode, crate::error::Error> {
    match node {
        WireNode::Field(f) => Ok(EncodedNode::Field(EncodedField {
            value: f.value.clone(),
            eventstamp: crate::clock::Eventstamp::parse(&f.eventstamp)?,
        })),
        WireNode::Doc(d) => Ok(EncodedNode::Doc(from_wire(d)?)),
    }
}

/// Whether `doc` is currently a tombstone (its `__deleted` field is present
/// and `true`).
#[must_use]
pub fn is_tombstone(doc: &EncodedDocument) -> bool {
    matches!(
        doc.get(DELETED_KEY),
        Some(EncodedNode::Field(EncodedField {
            value: Value::Bool(true),
            ..
        }))
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn es(n: u32) -> Eventstamp {
        Eventstamp::parse(&format!("2025-01-02T03:04:05.006Z|{n:08x}")).unwrap()
    }

    #[test]
    fn encode_then_decode_flat_document() {
        let mut doc = IndexMap::new();
        doc.insert("name".to_string(), Value::String("Alice".into()));
        doc.insert("age".to_string(), Value::Int(30));
        let encoded = encode(&doc, &es(0));
        assert_eq!(decode(&encoded), doc);
    }

    #[test]
    fn encode_recurses_into_nested_maps() {
        let mut inner = IndexMap::new();
        inner.insert("city".to_string(), Value::String("NYC".into()));
        let mut doc = IndexMap::new();
        doc.insert("address".to_string(), Value::Map(inner));
        let encoded = encode(&doc, &es(0));
        match encoded.get("address").unwrap() {
            EncodedNode::Doc(_) => {}
            EncodedNode::Field(_) => panic!("expected nested doc, got leaf field"),
        }
        assert_eq!(decode(&encoded), doc);
    }

    #[test]
    fn arrays_are_opaque_leaves() {
        let mut doc = IndexMap::new();
        doc.insert(
            "tags".to_string(),
            Value::Array(vec![Value::String("a".into()), Value::String("b".into())]),
        );
        let encoded = encode(&doc, &es(0));
        assert!(is_field(encoded.get("tags").unwrap()));
    }

    #[test]
    fn is_tombstone_detects_deleted_marker() {
        let mut doc = EncodedDocument::new();
        doc.insert(
            DELETED_KEY.to_string(),
            EncodedNode::Field(EncodedField {
                value: Value::Bool(true),
                eventstamp: es(0),
            }),
        );
        assert!(is_tombstone(&doc));

        let empty = EncodedDocument::new();
        assert!(!is_tombstone(&empty));
    }

    #[test]
    fn decode_drops_deleted_marker() {
        let mut doc = EncodedDocument::new();
        doc.insert(
            "name".to_string(),
            EncodedNode::Field(EncodedField {
                value: Value::String("Alice".into()),
                eventstamp: es(0),
            }),
        );
        doc.insert(
            DELETED_KEY.to_string(),
            EncodedNode::Field(EncodedField {
                value: Value::Bool(true),
                eventstamp: es(1),
            }),
        );
        let decoded = decode(&doc);
        assert!(!decoded.contains_key(DELETED_KEY));
        assert_eq!(decoded.get("name"), Some(&Value::String("Alice".into())));
    }

    fn arb_value(depth: u32) -> impl Strategy<Value = Value> {
        let leaf = prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::Int),
            "[a-z]{1,8}".prop_map(Value::String),
        ];
        if depth == 0 {
            leaf.boxed()
        } else {
            leaf.prop_recursive(2, 8, 4, move |inner| {
                prop::collection::btree_map("[a-z]{1,6}", inner, 0..4)
                    .prop_map(|m| Value::Map(m.into_iter().collect()))
            })
            .boxed()
        }
    }

    proptest! {
        #[test]
        fn round_trip_holds_for_arbitrary_plain_object_documents(
            fields in prop::collection::btree_map("[a-z]{1,6}", arb_value(3), 0..6)
        ) {
            let doc: IndexMap<String, Value> = fields.into_iter().collect();
            let encoded = encode(&doc, &es(0));
            prop_assert_eq!(decode(&encoded), doc);
        }
    }

    #[test]
    fn wire_round_trip_preserves_document() {
        let mut doc = IndexMap::new();
        doc.insert("name".to_string(), Value::String("Alice".into()));
        let encoded = encode(&doc, &es(0));
        let wire = to_wire(&encoded);
        let json = serde_json::to_string(&wire).unwrap();
        let back: WireDocument = serde_json::from_str(&json).unwrap();
        let restored = from_wire(&back).unwrap();
        assert_eq!(restored, encoded);
    }

    #[test]
    fn from_wire_rejects_malformed_eventstamp() {
        let mut wire = WireDocument::new();
        wire.insert(
            "name".to_string(),
            WireNode::Field(WireField {
                value: Value::String("Alice".into()),
                eventstamp: "not-a-timestamp".to_string(),
            }),
        );
        let err = from_wire(&wire).unwrap_err();
        assert!(matches!(err, crate::error::Error::MalformedEventstamp { .. }));
    }
}
