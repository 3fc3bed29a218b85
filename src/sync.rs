//! Sync adapter contract and the core's sync plugin.
//!
//! `push`, `pull`, and the optional `preprocess` hook are supplied by the
//! caller (HTTP, WebSocket, or any other transport is an external
//! collaborator); this module only defines the contract and the plugin
//! that drives periodic pulls and change-triggered pushes.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use tracing::warn;

use crate::config::SyncConfig;
use crate::error::Error;
use crate::persistence::{ingest_snapshot, to_snapshot, Snapshot};
use crate::plugin::Plugin;
use crate::store::{MergeOptions, Store, WeakStore};
use crate::value::Value;

/// Direction a [`Preprocessor`] is invoked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// The snapshot is about to be sent via `push`.
    Push,
    /// The snapshot was just received via `pull`.
    Pull,
}

/// Pushes a local snapshot to a remote peer.
#[async_trait(?Send)]
pub trait Push {
    /// # Errors
    ///
    /// Returns [`Error::AdapterFailure`] on any transport-level failure.
    async fn push(&self, snapshot: Snapshot) -> Result<(), Error>;
}

/// Pulls the remote peer's current snapshot.
#[async_trait(?Send)]
pub trait Pull {
    /// # Errors
    ///
    /// Returns [`Error::AdapterFailure`] on any transport-level failure.
    async fn pull(&self) -> Result<Snapshot, Error>;
}

/// Optional transform layered over the wire form, e.g. encryption,
/// compression, or compaction the core never learns about.
pub trait Preprocessor {
    /// Transforms `data` for `direction`.
    fn preprocess(&self, direction: Direction, data: Snapshot) -> Snapshot;
}

/// The core's built-in sync plugin.
///
/// On `init`, pulls once, preprocesses, and merges the result; then installs
/// a periodic puller. On every `Change` (after init), pushes the current
/// snapshot if `push_on_change` is set. On `dispose`, stops the periodic
/// timer.
pub struct SyncPlugin {
    store: WeakStore,
    push: Rc<dyn Push>,
    pull: Rc<dyn Pull>,
    preprocess: Option<Rc<dyn Preprocessor>>,
    config: SyncConfig,
    on_error: Rc<dyn Fn(Error)>,
    generation: Rc<Cell<u64>>,
    puller_running: Rc<Cell<bool>>,
}

impl SyncPlugin {
    /// Creates a sync plugin from user-supplied push/pull functions and an
    /// optional preprocessor.
    ///
    /// Holds only a weak reference back to `store` — `store` itself owns
    /// this plugin once registered via [`Store::use_plugin`], and a strong
    /// reference here would form a reference cycle that never drops.
    #[must_use]
    pub fn new(
        store: &Store,
        push: Rc<dyn Push>,
        pull: Rc<dyn Pull>,
        preprocess: Option<Rc<dyn Preprocessor>>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store: store.downgrade(),
            push,
            pull,
            preprocess,
            config,
            on_error: Rc::new(|err| warn!(%err, "unhandled sync adapter error")),
            generation: Rc::new(Cell::new(0)),
            puller_running: Rc::new(Cell::new(false)),
        }
    }

    /// Installs a custom handler for [`Error::AdapterFailure`]s raised by
    /// `push`/`pull`, replacing the default (log and continue) behavior.
    pub fn on_error(&mut self, handler: impl Fn(Error) + 'static) {
        self.on_error = Rc::new(handler);
    }

    async fn pull_and_merge(&self) -> Result<(), Error> {
        let raw = self.pull.pull().await?;
        let processed = match &self.preprocess {
            Some(p) => p.preprocess(Direction::Pull, raw),
            None => raw,
        };
        let entries = ingest_snapshot(processed);
        let Some(store) = self.store.upgrade() else {
            return Ok(());
        };
        store.merge(entries, MergeOptions::default())?;
        Ok(())
    }

    fn start_periodic_puller(&self) {
        if self.puller_running.get() {
            return;
        }
        self.puller_running.set(true);

        let pull = Rc::clone(&self.pull);
        let preprocess = self.preprocess.clone();
        let store = self.store.clone();
        let interval = Duration::from_millis(self.config.pull_interval_ms);
        let generation = Rc::clone(&self.generation);
        let running = Rc::clone(&self.puller_running);
        let on_error = Rc::clone(&self.on_error);
        let started_at_generation = self.generation.get();

        tokio::task::spawn_local(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await; // first tick fires immediately; skip it, init already pulled once
            loop {
                ticker.tick().await;
                if generation.get() != started_at_generation || !running.get() {
                    return;
                }
                let Some(store) = store.upgrade() else {
                    // Store has been dropped; nothing left to sync into.
                    return;
                };
                let result: Result<(), Error> = async {
                    let raw = pull.pull().await?;
                    let processed = match &preprocess {
                        Some(p) => p.preprocess(Direction::Pull, raw),
                        None => raw,
                    };
                    let entries = ingest_snapshot(processed);
                    store.merge(entries, MergeOptions::default())?;
                    Ok(())
                }
                .await;
                if let Err(err) = result {
                    warn!(error = %err, "periodic sync pull failed");
                    on_error(err);
                }
            }
        });
    }

    fn push_now(&self) {
        if !self.config.push_on_change {
            return;
        }
        let push = Rc::clone(&self.push);
        let preprocess = self.preprocess.clone();
        let store = self.store.clone();
        let on_error = Rc::clone(&self.on_error);

        // The snapshot is captured inside the spawned task, after upgrading
        // the weak store, rather than synchronously here: this hook runs
        // from inside `Store::emit`, and a `Store::snapshot` call made
        // synchronously from that call stack would race its borrow.
        tokio::task::spawn_local(async move {
            let Some(store) = store.upgrade() else {
                return;
            };
            let snapshot = to_snapshot(&store.snapshot());
            let processed = match &preprocess {
                Some(p) => p.preprocess(Direction::Push, snapshot),
                None => snapshot,
            };
            if let Err(err) = push.push(processed).await {
                warn!(error = %err, "sync push failed");
                on_error(err);
            }
        });
    }
}

#[async_trait(?Send)]
impl Plugin for SyncPlugin {
    fn name(&self) -> &str {
        "sync"
    }

    async fn init(&mut self) -> Result<(), Error> {
        self.pull_and_merge().await?;
        self.start_periodic_puller();
        Ok(())
    }

    async fn dispose(&mut self) -> Result<(), Error> {
        self.puller_running.set(false);
        self.generation.set(self.generation.get().wrapping_add(1));
        Ok(())
    }

    fn on_put(&self, _puts: &[(String, IndexMap<String, Value>)]) {
        self.push_now();
    }

    fn on_patch(&self, _patches: &[(String, IndexMap<String, Value>)]) {
        self.push_now();
    }

    fn on_delete(&self, _deletes: &[String]) {
        self.push_now();
    }
}

/// A [`Preprocessor`] that passes data through unchanged. Equivalent to
/// passing `None`, provided for callers that want a concrete type to plug
/// into a generic pipeline.
pub struct NoopPreprocessor;

impl Preprocessor for NoopPreprocessor {
    fn preprocess(&self, _direction: Direction, data: Snapshot) -> Snapshot {
        data
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    struct RecordingPush {
        pushed: RefCell<Vec<Snapshot>>,
    }

    #[async_trait(?Send)]
    impl Push for RecordingPush {
        async fn push(&self, snapshot: Snapshot) -> Result<(), Error> {
            self.pushed.borrow_mut().push(snapshot);
            Ok(())
        }
    }

    struct FixedPull {
        snapshot: RefCell<Snapshot>,
    }

    #[async_trait(?Send)]
    impl Pull for FixedPull {
        async fn pull(&self) -> Result<Snapshot, Error> {
            Ok(self.snapshot.borrow().clone())
        }
    }

    fn doc(pairs: &[(&str, Value)]) -> IndexMap<String, Value> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[tokio::test(flavor = "current_thread")]
    async fn init_pulls_and_merges_remote_snapshot() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let remote = Store::new();
                remote.put("u1", doc(&[("name", Value::String("Alice".into()))])).unwrap();

                let push = Rc::new(RecordingPush { pushed: RefCell::new(Vec::new()) });
                let pull = Rc::new(FixedPull {
                    snapshot: RefCell::new(to_snapshot(&remote.snapshot())),
                });

                let store = Store::new();
                let mut plugin = SyncPlugin::new(&store, push, pull, None, SyncConfig::default());
                plugin.init().await.unwrap();

                assert_eq!(store.values().len(), 1);
            })
            .await;
    }

    #[tokio::test(flavor = "current_thread")]
    async fn on_change_pushes_current_snapshot() {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let push = Rc::new(RecordingPush { pushed: RefCell::new(Vec::new()) });
                let pull = Rc::new(FixedPull { snapshot: RefCell::new(Vec::new()) });

                let store = Store::new();
                let plugin = SyncPlugin::new(&store, Rc::clone(&push) as Rc<dyn Push>, pull, None, SyncConfig::default());

                store.put("u1", doc(&[("name", Value::String("Alice".into()))])).unwrap();
                plugin.on_put(&[]);
                tokio::task::yield_now().await;

                assert_eq!(push.pushed.borrow().len(), 1);
            })
            .await;
    }

    #[test]
    fn noop_preprocessor_is_identity() {
        let p = NoopPreprocessor;
        let snapshot = vec![];
        assert_eq!(p.preprocess(Direction::Push, snapshot.clone()), snapshot);
    }
}
