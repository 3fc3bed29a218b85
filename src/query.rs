//! Reactive query engine: incremental materialized views over a store.
//!
//! A [`Query`] is registered with a [`Store`] via [`Store::query`] and
//! maintains a `matching` key set that is updated incrementally from each
//! store [`Change`] rather than rescanned from scratch, see
//! [`QueryInner::on_change`].

use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use indexmap::{IndexMap, IndexSet};
use tracing::warn;

use crate::error::Error;
use crate::store::{Change, Store};
use crate::value::Value;

type Predicate = dyn Fn(&IndexMap<String, Value>) -> bool;
type Subscriber = dyn Fn();
type ErrorHandler = dyn Fn(Error);

pub(crate) struct QueryInner {
    store: Store,
    predicate: Box<Predicate>,
    matching: IndexSet<String>,
    subscribers: Vec<(u64, Box<Subscriber>)>,
    on_error: Box<ErrorHandler>,
    next_subscriber_id: u64,
}

impl QueryInner {
    fn evaluate(&self, value: &IndexMap<String, Value>) -> bool {
        match panic::catch_unwind(AssertUnwindSafe(|| (self.predicate)(value))) {
            Ok(matched) => matched,
            Err(payload) => {
                let message = panic_message(&payload);
                warn!(error = %message, "query predicate faulted; treating as non-match");
                (self.on_error)(Error::PredicateFault { message });
                false
            }
        }
    }

    /// Applies one store `Change` to `inner`'s matching set in
    /// `puts → patches → deletes` order, firing every subscriber at most
    /// once if anything changed.
    pub(crate) fn on_change(inner: &Rc<RefCell<QueryInner>>, change: &Change) {
        let mut dirty = false;
        {
            let mut q = inner.borrow_mut();

            for (key, value) in &change.puts {
                if q.evaluate(value) {
                    q.matching.insert(key.clone());
                    dirty = true;
                }
            }

            for (key, value) in &change.patches {
                if q.evaluate(value) {
                    // Even if `key` was already in `matching`, its content
                    // changed, so subscribers still need to fire.
                    q.matching.insert(key.clone());
                    dirty = true;
                } else if q.matching.shift_remove(key) {
                    dirty = true;
                }
            }

            for key in &change.deletes {
                if q.matching.shift_remove(key) {
                    dirty = true;
                }
            }
        }

        if dirty {
            let q = inner.borrow();
            for (_, cb) in &q.subscribers {
                cb();
            }
        }
    }
}

fn panic_message(payload: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "predicate panicked".to_string()
    }
}

/// An unsubscribe handle returned by [`Query::on_change`].
///
/// Dropping it does nothing; call [`Unsubscribe::cancel`] explicitly to
/// remove the callback.
pub struct Unsubscribe {
    query: Rc<RefCell<QueryInner>>,
    id: u64,
}

impl Unsubscribe {
    /// Removes the associated subscriber callback.
    pub fn cancel(self) {
        self.query.borrow_mut().subscribers.retain(|(id, _)| *id != self.id);
    }
}

/// A live materialized view over a store for a client-supplied predicate.
pub struct Query {
    inner: Rc<RefCell<QueryInner>>,
}

impl Query {
    pub(crate) fn new(
        store: &Store,
        predicate: impl Fn(&IndexMap<String, Value>) -> bool + 'static,
    ) -> Self {
        let mut matching = IndexSet::new();
        for (key, value) in store.values() {
            if predicate(&value) {
                matching.insert(key);
            }
        }

        let inner = Rc::new(RefCell::new(QueryInner {
            store: store.clone(),
            predicate: Box::new(predicate),
            matching,
            subscribers: Vec::new(),
            on_error: Box::new(|err| warn!(%err, "unhandled query error")),
            next_subscriber_id: 0,
        }));
        store.register_query(&inner);
        Self { inner }
    }

    /// Installs a custom error handler, replacing the default (log and
    /// continue) behavior for [`Error::PredicateFault`]s raised by this
    /// query's predicate.
    pub fn on_error(&self, handler: impl Fn(Error) + 'static) {
        self.inner.borrow_mut().on_error = Box::new(handler);
    }

    /// Returns the current materialized view: every key whose decoded
    /// value satisfies the predicate, paired with that value.
    #[must_use]
    pub fn results(&self) -> IndexMap<String, IndexMap<String, Value>> {
        let q = self.inner.borrow();
        let store_values: IndexMap<_, _> = q.store.values().into_iter().collect();
        q.matching
            .iter()
            .filter_map(|k| store_values.get(k).map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Registers a callback invoked once per store `Change` that affects
    /// this query's matching set.
    pub fn on_change(&self, cb: impl Fn() + 'static) -> Unsubscribe {
        let mut q = self.inner.borrow_mut();
        let id = q.next_subscriber_id;
        q.next_subscriber_id += 1;
        q.subscribers.push((id, Box::new(cb)));
        drop(q);
        Unsubscribe {
            query: Rc::clone(&self.inner),
            id,
        }
    }

    /// Drops all callbacks. The query self-unregisters from the store once
    /// every clone of this handle is dropped (the store only holds a weak
    /// reference).
    pub fn dispose(self) {
        self.inner.borrow_mut().subscribers.clear();
    }
}
