//! [`EventIndex`]: a time-ordered view over every event of one type name.

use std::collections::HashMap;

use crate::event::{Event, EventTypeId};
use crate::zone::ZoneId;
use crate::{Position, Time};

/// A time-ordered sequence of events whose type name matches exactly one
/// string.
///
/// Created lazily by [`crate::Database::create_event_index`]. An index
/// created after ingestion has already begun is *not* back-filled from
/// history: retroactively replaying every zone to populate it would
/// contradict the rule that a snapshot never sees indices change shape
/// underneath it.
pub struct EventIndex {
    name: Box<str>,
    events: Vec<Event>,
    dirty: bool,
    inserting: bool,
}

impl EventIndex {
    pub fn new(name: impl Into<Box<str>>) -> Self {
        EventIndex { name: name.into(), events: Vec::new(), dirty: false, inserting: false }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn begin_inserting(&mut self) {
        debug_assert!(!self.inserting);
        self.inserting = true;
    }

    /// Appends `e` if its type name matches this index; events destined
    /// for other names are ignored, mirroring how `ZoneIndex` filters by
    /// zone membership.
    pub fn insert_event(&mut self, e: &Event, type_name: &str) {
        debug_assert!(self.inserting);
        if type_name != &*self.name {
            return;
        }
        if let Some(last) = self.events.last() {
            if e.time < last.time {
                self.dirty = true;
            }
        }
        self.events.push(e.clone());
    }

    /// Stably sorts by `(time, position)` if any out-of-order arrival was
    /// observed since the last `end_inserting`.
    pub fn end_inserting(&mut self) {
        debug_assert!(self.inserting);
        self.inserting = false;
        if self.dirty {
            self.events.sort_by(|a, b| a.time.cmp(&b.time).then(a.position.cmp(&b.position)));
            self.dirty = false;
        }
    }

    /// Iterates matching events in `[t_start, t_end)`, using a binary
    /// search for the lower bound.
    pub fn for_each(&self, t_start: Time, t_end: Time, mut f: impl FnMut(&Event)) {
        let lower = self.events.partition_point(|e| e.time < t_start);
        for e in &self.events[lower..] {
            if e.time >= t_end {
                break;
            }
            f(e);
        }
    }

    pub fn count(&self) -> usize {
        self.events.len()
    }

    /// Refreshes stored events' positions from the just-renumbered
    /// canonical copies, keyed by `(zone, time, type)`. Mirrors
    /// `ZoneIndex::sync_scope_positions`: positions are unique per key
    /// in arrival order, so walking this index's events in arena order
    /// and popping from the front of each key's bucket reproduces the
    /// same identity the canonical events carry.
    pub fn sync_positions(&mut self, canonical: &HashMap<(Option<ZoneId>, Time, EventTypeId), Vec<Position>>) {
        let mut cursors: HashMap<(Option<ZoneId>, Time, EventTypeId), usize> = HashMap::new();
        for e in &mut self.events {
            let key = (e.zone, e.time, e.ty);
            let Some(positions) = canonical.get(&key) else { continue };
            let cursor = cursors.entry(key).or_insert(0);
            if let Some(&p) = positions.get(*cursor) {
                e.position = p;
                *cursor += 1;
            }
        }
    }
}
