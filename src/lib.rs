//! `tracedb` — an in-memory, append-oriented event-trace analysis
//! database.
//!
//! A [`Database`] ingests batches of timestamped tracing events (scope
//! enter/leave, zone creation, user-defined instant events, asynchronous
//! flow markers) from one or more sources, reconstructs a hierarchical
//! execution model (scope-nesting trees per zone, correlated flows), and
//! exposes that model for time-range iteration and query between
//! ingestion batches.
//!
//! Wire parsing of whatever on-disk or streamed trace format a caller
//! uses is out of scope: a *source adapter* parses bytes and calls
//! [`Database::begin_event_batch`] / [`Database::trace_event`] /
//! [`Database::end_event_batch`].

pub mod error;
pub mod event;
pub mod event_index;
pub mod flow;
pub mod frame;
pub mod listener;
pub mod query;
pub mod summary;
pub mod zone;

pub use error::{Result, TraceDbError};
pub use event::{ArgKind, ArgSpec, ArgValue, Event, EventType, EventTypeFlags, EventTypeId, EventTypeRegistry};
pub use event_index::EventIndex;
pub use flow::{Flow, FlowId, FlowTracker};
pub use frame::{Frame, FrameIndex};
pub use listener::{ContextInfo, Database, DbEvent, RawEvent, Source};
pub use query::{CompiledQuery, QueryKind, QueryMatch, QueryResult};
pub use summary::SummaryIndex;
pub use zone::{Scope, ScopeId, Zone, ZoneId, ZoneIndex, ZoneIndexConfig};

/// Monotonic event time, in microseconds relative to a source's
/// [`timebase`](Database::timebase).
pub type Time = i64;

/// A dense, database-wide ordinal. Position `0` is reserved for the
/// database root node; real events are numbered from `1`.
pub type Position = u64;
