//! Crate-level error taxonomy.
//!
//! Every fallible public operation returns a typed [`Result<_, Error>`]
//! rather than a string or a boxed trait object, so callers (and the
//! `onError` callbacks plugins forward faults through) can match on the
//! variant and decide programmatically.

use thiserror::Error;

/// The full set of faults the store, merge kernel, query engine, and plugin
/// lifecycle can surface.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum Error {
    /// A field at `path` is a leaf on one side of a merge and a nested
    /// document on the other. Fatal: the merge aborts without partially
    /// applying either side.
    #[error("structure mismatch at `{path}`: field on one side, document on the other")]
    StructureMismatch {
        /// Dot-joined path to the offending key, from the document root.
        path: String,
    },

    /// A snapshot entry carried an eventstamp that did not match the
    /// canonical wire form. The offending document is rejected; ingestion
    /// of the remaining snapshot continues.
    #[error("malformed eventstamp: `{value}`")]
    MalformedEventstamp {
        /// The raw string that failed to parse.
        value: String,
    },

    /// A persistence or sync adapter call failed. The core never retries;
    /// the adapter is responsible for its own retry policy.
    #[error("adapter failure: {message}")]
    AdapterFailure {
        /// Description of the underlying adapter failure.
        message: String,
    },

    /// A query predicate faulted while being evaluated. The item is treated
    /// as non-matching; the fault is reported, never propagated to the
    /// caller of the mutation that triggered re-evaluation.
    #[error("predicate fault: {message}")]
    PredicateFault {
        /// Description of the underlying predicate fault.
        message: String,
    },
}
