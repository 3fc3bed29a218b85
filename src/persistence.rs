//! Persistence adapter contract and the core's persistence plugin.
//!
//! The backend itself (file, SQLite, IndexedDB, in-memory...) is an
//! external collaborator; this module defines only the [`PersistenceBackend`]
//! contract it must satisfy and the plugin that drives it.

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::PersistenceConfig;
use crate::error::Error;
use crate::field::{from_wire, to_wire, EncodedDocument, WireDocument};
use crate::plugin::Plugin;
use crate::store::{MergeOptions, Store, WeakStore};
use crate::value::Value;

/// One entry of a [`Snapshot`]: a key paired with its raw encoded document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    /// The document's key.
    pub key: String,
    /// The document's wire-form encoded value.
    pub value: WireDocument,
}

/// The full wire form exchanged with a [`PersistenceBackend`] or a sync
/// `push`/`pull` pair: an ordered sequence of `{key, value}` entries,
/// tombstones included.
pub type Snapshot = Vec<SnapshotEntry>;

/// Key-value back-end contract used by both the persistence and sync
/// plugins.
///
/// Implementations are external collaborators (file, SQLite, IndexedDB,
/// an in-memory map for tests); this crate only depends on the contract.
#[async_trait(?Send)]
pub trait PersistenceBackend {
    /// Loads the snapshot stored at `key`, or `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterFailure`] on any backend-level failure.
    async fn get(&self, key: &str) -> Result<Option<Snapshot>, Error>;

    /// Stores `value` at `key`, overwriting any previous snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`Error::AdapterFailure`] on any backend-level failure.
    async fn set(&self, key: &str, value: Snapshot) -> Result<(), Error>;
}

/// Converts a store snapshot into its wire form.
#[must_use]
pub fn to_snapshot(entries: &[(String, EncodedDocument)]) -> Snapshot {
    entries
        .iter()
        .map(|(k, d)| SnapshotEntry {
            key: k.clone(),
            value: to_wire(d),
        })
        .collect()
}

/// Converts a wire snapshot into `(key, EncodedDocument)` pairs, skipping
/// (and logging) any entry whose eventstamp is malformed rather than
/// failing the whole ingestion.
#[must_use]
pub fn ingest_snapshot(snapshot: Snapshot) -> Vec<(String, EncodedDocument)> {
    let mut result = Vec::with_capacity(snapshot.len());
    for entry in snapshot {
        match from_wire(&entry.value) {
            Ok(doc) => result.push((entry.key, doc)),
            Err(err) => warn!(key = %entry.key, error = %err, "rejecting malformed snapshot entry"),
        }
    }
    result
}

/// The core's built-in persistence plugin.
///
/// At `init`, loads the saved snapshot (if any) and merges it in silently.
/// On every `Change`, schedules a trailing-edge-debounced write of the
/// store's current snapshot.
pub struct PersistencePlugin {
    store: WeakStore,
    backend: Rc<dyn PersistenceBackend>,
    config: PersistenceConfig,
    collection: String,
    on_error: Rc<dyn Fn(Error)>,
    generation: Rc<Cell<u64>>,
}

impl PersistencePlugin {
    /// Creates a persistence plugin for `collection`, backed by `backend`.
    ///
    /// Holds only a weak reference back to `store` — `store` itself owns
    /// this plugin once registered via [`Store::use_plugin`], and a strong
    /// reference here would form a reference cycle that never drops.
    #[must_use]
    pub fn new(
        store: &Store,
        collection: impl Into<String>,
        backend: Rc<dyn PersistenceBackend>,
        config: PersistenceConfig,
    ) -> Self {
        Self {
            store: store.downgrade(),
            backend,
            config,
            collection: collection.into(),
            on_error: Rc::new(|err| warn!(%err, "unhandled persistence adapter error")),
            generation: Rc::new(Cell::new(0)),
        }
    }

    /// Installs a custom handler for [`Error::AdapterFailure`]s raised by
    /// the backend, replacing the default (log and continue) behavior.
    pub fn on_error(&mut self, handler: impl Fn(Error) + 'static) {
        self.on_error = Rc::new(handler);
    }

    fn schedule_write(&self) {
        let generation = self.generation.get().wrapping_add(1);
        self.generation.set(generation);

        let backend = Rc::clone(&self.backend);
        let store = self.store.clone();
        let debounce = Duration::from_millis(self.config.debounce_ms);
        let key = self.config.resolve_key(&self.collection);
        let watch = Rc::clone(&self.generation);
        let on_error = Rc::clone(&self.on_error);

        tokio::task::spawn_local(async move {
            tokio::time::sleep(debounce).await;
            if watch.get() != generation {
                // Superseded by a later change; that write will flush this one.
                return;
            }
            let Some(store) = store.upgrade() else {
                // Store has been dropped; nothing left to persist.
                return;
            };
            let snapshot = to_snapshot(&store.snapshot());
            if let Err(err) = backend.set(&key, snapshot).await {
                warn!(error = %err, "persistence write failed");
                on_error(err);
            }
        });
    }
}

#[async_trait(?Send)]
impl Plugin for PersistencePlugin {
    fn name(&self) -> &str {
        "persistence"
    }

    async fn init(&mut self) -> Result<(), Error> {
        let Some(store) = self.store.upgrade() else {
            return Ok(());
        };
        let key = self.config.resolve_key(&self.collection);
        match self.backend.get(&key).await {
            Ok(Some(snapshot)) => {
                let entries = ingest_snapshot(snapshot);
                store.merge(entries, MergeOptions { silent: true })?;
            }
            Ok(None) => {}
            Err(err) => {
                (self.on_error)(err.clone());
                return Err(err);
            }
        }
        Ok(())
    }

    async fn dispose(&mut self) -> Result<(), Error> {
        // Bump the generation so any in-flight debounced write observes a
        // mismatch on wake and no-ops instead of writing after disposal.
        self.generation.set(self.generation.get().wrapping_add(1));
        Ok(())
    }

    fn on_put(&self, _puts: &[(String, IndexMap<String, Value>)]) {
        self.schedule_write();
    }

    fn on_patch(&self, _patches: &[(String, IndexMap<String, Value>)]) {
        self.schedule_write();
    }

    fn on_delete(&self, _deletes: &[String]) {
        self.schedule_write();
    }
}
