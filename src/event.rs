//! Canonical value objects: [`EventType`], [`Event`], and argument values.
//!
//! Arguments are stored schema-aligned in a small inline vector rather
//! than a dynamic string map: a dynamic map on the hot ingest path would
//! force an allocation and a hash per argument per event.

use bitflags::bitflags;
use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::zone::ZoneId;
use crate::{Position, Time};

bitflags! {
    /// Classification bits carried by an [`EventType`]. Serializes as its
    /// bit pattern via the `bitflags` crate's `serde` feature.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct EventTypeFlags: u16 {
        /// Excluded from user totals and from filter query result sets.
        const INTERNAL        = 0b0000_0000_0001;
        /// A pre-registered, hot-path-recognized type.
        const BUILTIN         = 0b0000_0000_0010;
        /// Opens a scope.
        const SCOPE_ENTER     = 0b0000_0000_0100;
        /// Closes a scope.
        const SCOPE_LEAVE     = 0b0000_0000_1000;
        /// Declares a zone.
        const ZONE_CREATE     = 0b0000_0001_0000;
        /// Starts a flow.
        const FLOW_BRANCH     = 0b0000_0010_0000;
        /// Extends a flow.
        const FLOW_EXTEND     = 0b0000_0100_0000;
        /// Closes a flow.
        const FLOW_TERMINATE  = 0b0000_1000_0000;
        /// Appends data to a flow.
        const FLOW_DATA       = 0b0001_0000_0000;
        /// Opens or closes a frame.
        const FRAME           = 0b0010_0000_0000;
        /// Starts a frame.
        const FRAME_START     = 0b0100_0000_0000;
        /// Ends a frame.
        const FRAME_END       = 0b1000_0000_0000;
    }
}

/// The kind of value an argument slot may hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArgKind {
    Int,
    Float,
    Str,
    Bool,
}

/// A single argument value, tagged by the kind its schema declares.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ArgValue {
    Int(i64),
    Float(f64),
    Str(Box<str>),
    Bool(bool),
}

impl ArgValue {
    /// A loose textual rendering used by the substring query filter.
    pub fn as_filter_text(&self) -> String {
        match self {
            ArgValue::Int(v) => v.to_string(),
            ArgValue::Float(v) => v.to_string(),
            ArgValue::Str(v) => v.to_string(),
            ArgValue::Bool(v) => v.to_string(),
        }
    }
}

/// One named, typed slot in an [`EventType`]'s argument schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArgSpec {
    pub name: Box<str>,
    pub kind: ArgKind,
}

/// A stable, interned handle to an [`EventType`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EventTypeId(pub(crate) u32);

/// The interned schema of one event class: a fully-qualified name, an
/// ordered argument schema, and classification flags.
#[derive(Debug, Clone)]
pub struct EventType {
    pub id: EventTypeId,
    pub name: Box<str>,
    pub args: Vec<ArgSpec>,
    pub flags: EventTypeFlags,
}

impl EventType {
    pub fn is_internal(&self) -> bool {
        self.flags.contains(EventTypeFlags::INTERNAL)
    }
}

/// Fully-qualified names of the event types the listener must recognize
/// without a string comparison on the hot path.
pub mod builtin {
    pub const SCOPE_ENTER: &str = "wtf.scope#enter";
    pub const SCOPE_LEAVE: &str = "wtf.scope#leave";
    pub const ZONE_CREATE: &str = "wtf.zone#create";
    pub const FLOW_BRANCH: &str = "wtf.flow#branch";
    pub const FLOW_EXTEND: &str = "wtf.flow#extend";
    pub const FLOW_TERMINATE: &str = "wtf.flow#terminate";
    pub const FLOW_DATA: &str = "wtf.flow#data";
    pub const FRAME_START: &str = "wtf.frame#start";
    pub const FRAME_END: &str = "wtf.frame#end";
}

/// Interns event schemas and returns a stable handle for each.
///
/// Built-in types are pre-registered by [`EventTypeRegistry::new`] so the
/// listener can classify `wtf.*` events by flag rather than by comparing
/// strings for every event it ingests.
#[derive(Debug, Clone)]
pub struct EventTypeRegistry {
    by_name: FnvHashMap<Box<str>, EventTypeId>,
    types: Vec<EventType>,
}

impl Default for EventTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl EventTypeRegistry {
    pub fn new() -> Self {
        let mut registry = EventTypeRegistry {
            by_name: FnvHashMap::default(),
            types: Vec::new(),
        };
        use builtin::*;
        use ArgKind::*;
        registry.register_builtin(SCOPE_ENTER, vec![], EventTypeFlags::BUILTIN | EventTypeFlags::SCOPE_ENTER);
        registry.register_builtin(SCOPE_LEAVE, vec![], EventTypeFlags::BUILTIN | EventTypeFlags::SCOPE_LEAVE);
        registry.register_builtin(
            ZONE_CREATE,
            vec![arg("name", Str), arg("type", Str), arg("location", Str)],
            EventTypeFlags::BUILTIN | EventTypeFlags::INTERNAL | EventTypeFlags::ZONE_CREATE,
        );
        registry.register_builtin(
            FLOW_BRANCH,
            vec![arg("id", Int), arg("parent", Int)],
            EventTypeFlags::BUILTIN | EventTypeFlags::FLOW_BRANCH,
        );
        registry.register_builtin(
            FLOW_EXTEND,
            vec![arg("id", Int)],
            EventTypeFlags::BUILTIN | EventTypeFlags::FLOW_EXTEND,
        );
        registry.register_builtin(
            FLOW_TERMINATE,
            vec![arg("id", Int)],
            EventTypeFlags::BUILTIN | EventTypeFlags::FLOW_TERMINATE,
        );
        registry.register_builtin(
            FLOW_DATA,
            vec![arg("id", Int), arg("name", Str), arg("value", Str)],
            EventTypeFlags::BUILTIN | EventTypeFlags::INTERNAL | EventTypeFlags::FLOW_DATA,
        );
        registry.register_builtin(
            FRAME_START,
            vec![],
            EventTypeFlags::BUILTIN | EventTypeFlags::FRAME | EventTypeFlags::FRAME_START,
        );
        registry.register_builtin(
            FRAME_END,
            vec![],
            EventTypeFlags::BUILTIN | EventTypeFlags::FRAME | EventTypeFlags::FRAME_END,
        );
        registry
    }

    fn register_builtin(&mut self, name: &str, args: Vec<ArgSpec>, flags: EventTypeFlags) {
        self.intern(name, args, flags);
    }

    /// Looks up a type by name, returning its handle, in O(1).
    pub fn lookup(&self, name: &str) -> Option<EventTypeId> {
        self.by_name.get(name).copied()
    }

    /// Returns the interned [`EventType`] for a handle.
    pub fn get(&self, id: EventTypeId) -> &EventType {
        &self.types[id.0 as usize]
    }

    /// Interns a schema on first sight, returning a stable handle; a
    /// second call with the same name returns the existing handle
    /// (flags/args from the first registration win).
    pub fn intern(&mut self, name: &str, args: Vec<ArgSpec>, flags: EventTypeFlags) -> EventTypeId {
        if let Some(&id) = self.by_name.get(name) {
            return id;
        }
        let id = EventTypeId(self.types.len() as u32);
        self.types.push(EventType {
            id,
            name: name.into(),
            args,
            flags,
        });
        self.by_name.insert(name.into(), id);
        id
    }
}

fn arg(name: &str, kind: ArgKind) -> ArgSpec {
    ArgSpec { name: name.into(), kind }
}

/// An immutable, timestamped record of an instrumented action.
///
/// `position` is a provisional insertion-order tag until the next
/// `end_event_batch`'s renumbering pass assigns dense, database-wide
/// positions; readers outside a batch always see post-renumber values.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub time: Time,
    pub ty: EventTypeId,
    /// The zone this event belongs to, if any. `None` for events that are
    /// not nested inside any zone's stream (they are still visible to the
    /// summary index and to event-name indices).
    pub zone: Option<ZoneId>,
    pub args: SmallVec<[ArgValue; 4]>,
    pub position: Position,
    /// A copy of the event type's classification flags, stamped on at
    /// construction so per-zone and per-name indices can classify an
    /// event without a registry lookup on the hot path (the same design
    /// note that keeps arguments schema-aligned rather than dynamic).
    pub flags: EventTypeFlags,
}

impl Event {
    pub fn new(
        time: Time,
        ty: EventTypeId,
        zone: Option<ZoneId>,
        args: SmallVec<[ArgValue; 4]>,
        flags: EventTypeFlags,
    ) -> Self {
        Event { time, ty, zone, args, position: 0, flags }
    }

    pub fn is_internal(&self) -> bool {
        self.flags.contains(EventTypeFlags::INTERNAL)
    }

    /// Value of the named argument, if the event's schema declares one
    /// with that name.
    pub fn arg<'a>(&'a self, registry: &EventTypeRegistry, name: &str) -> Option<&'a ArgValue> {
        let schema = &registry.get(self.ty).args;
        schema.iter().position(|spec| &*spec.name == name).and_then(|i| self.args.get(i))
    }
}

/// Orders events the way every index in the database must: by time, with
/// position as the tie-break. Every index in this crate sorts and
/// compares events with this single comparator.
#[inline]
pub fn event_order(a: &Event, b: &Event) -> std::cmp::Ordering {
    a.time.cmp(&b.time).then(a.position.cmp(&b.position))
}
