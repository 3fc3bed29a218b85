//! In-memory, local-first key-value document store with a Last-Write-Wins
//! per-field CRDT merge kernel, a reactive incremental query engine, and a
//! plugin lifecycle for persistence and push/pull synchronization.
//!
//! # Layout
//!
//! - [`clock`]: monotonic eventstamp generation.
//! - [`value`]: the JSON-shaped document value model.
//! - [`field`]: the encoded (per-field tagged) document form, and its
//!   wire representation.
//! - [`merge`]: the deterministic, commutative merge kernel.
//! - [`docmap`]: the insertion-ordered transactional container.
//! - [`store`]: the public mutation façade and change event model.
//! - [`query`]: incremental materialized views.
//! - [`plugin`]: ordered init/dispose and hook dispatch.
//! - [`persistence`] / [`sync`]: contract-only adapters the plugin
//!   lifecycle drives.
//! - [`config`]: typed options for the persistence and sync plugins.
//! - [`error`]: the crate-wide error taxonomy.

pub mod clock;
pub mod config;
pub mod docmap;
pub mod error;
pub mod field;
pub mod merge;
pub mod persistence;
pub mod plugin;
pub mod query;
pub mod store;
pub mod sync;
pub mod value;

pub use clock::{Clock, Eventstamp};
pub use error::Error;
pub use field::{decode, encode, EncodedDocument, EncodedField, EncodedNode};
pub use plugin::Plugin;
pub use query::Query;
pub use store::{Change, MergeOptions, Store, Tx, WeakStore};
pub use value::Value;

#[cfg(test)]
mod tests {
    use super::*;
    use indexmap::IndexMap;

    #[test]
    fn crate_loads_and_round_trips_a_document() {
        let store = Store::new();
        let mut doc = IndexMap::new();
        doc.insert("name".to_string(), Value::String("Alice".into()));
        store.put("u1", doc.clone()).unwrap();
        assert_eq!(store.values(), vec![("u1".to_string(), doc)]);
    }

    #[test]
    fn json_wire_shape_matches_snapshot_contract() {
        use crate::field::{encode, to_wire};

        let mut doc = IndexMap::new();
        doc.insert("name".to_string(), Value::String("Alice".into()));
        let mut clock = Clock::new();
        let es = clock.now();
        let encoded = encode(&doc, &es);
        let wire = to_wire(&encoded);
        let json = serde_json::to_value(&wire).unwrap();

        let name_field = &json["name"];
        assert_eq!(name_field["value"], "Alice");
        assert!(name_field["eventstamp"].is_string());
    }
}
