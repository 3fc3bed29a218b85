//! Plugin lifecycle: ordered init/dispose and hook dispatch.
//!
//! A plugin is a factory `Store -> Handle`. The store owns every handle it
//! registers; a handle holds a `Store` clone only for the duration of its
//! own hook callbacks, never the other way around. There is no back-pointer
//! graph (mirrors the fan-out `CompositeMutationObserver` pattern this
//! crate's hook dispatch is patterned on).

use async_trait::async_trait;
use indexmap::IndexMap;

use crate::error::Error;
use crate::value::Value;

/// A registered plugin handle.
///
/// `init` and `dispose` may suspend (persistence/sync adapters do I/O);
/// the hook methods are synchronous and fire inline as part of the
/// store's change dispatch, which itself never suspends.
#[async_trait(?Send)]
pub trait Plugin {
    /// A short name used in lifecycle log lines.
    fn name(&self) -> &str;

    /// Runs once, in registration order, before the plugin observes any
    /// hooks.
    async fn init(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Runs once, in reverse registration order, when the store (or an
    /// explicit dispose call) tears plugins down.
    async fn dispose(&mut self) -> Result<(), Error> {
        Ok(())
    }

    /// Called with the `puts` vector of every store `Change`.
    fn on_put(&self, _puts: &[(String, IndexMap<String, Value>)]) {}

    /// Called with the `patches` vector of every store `Change`.
    fn on_patch(&self, _patches: &[(String, IndexMap<String, Value>)]) {}

    /// Called with the `deletes` vector of every store `Change`.
    fn on_delete(&self, _deletes: &[String]) {}
}
