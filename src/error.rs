//! Fatal and caller-surfaced error conditions.
//!
//! Most ingest-time problems are *not* represented here: unmatched
//! leaves, non-monotonic events, and duplicate zone creates are
//! recoverable conditions handled inline by the ingest path and reported
//! through [`crate::listener::DbEvent::SourceError`], never by returning
//! `Err`. The variants below cover the two classes of fatal programmer
//! error (misuse of the batch protocol), plus the one path a caller must
//! be able to fail on: an unparsable query.

use thiserror::Error;

/// Errors surfaced by the public `tracedb` API.
#[derive(Debug, Error)]
pub enum TraceDbError {
    /// `begin_event_batch` was called while a batch was already open.
    #[error("begin_event_batch called while a batch is already in progress")]
    NestedBatch,

    /// `trace_event` or `end_event_batch` was called without an open batch.
    #[error("insert attempted outside an open batch")]
    InsertOutsideBatch,

    /// `query` was given a string that could not be parsed as a filter
    /// regex or as a tree expression.
    #[error("invalid query {query:?}: {reason}")]
    InvalidQuery {
        /// The offending query string.
        query: String,
        /// Why it failed to parse.
        reason: String,
    },
}

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, TraceDbError>;
