//! Zone identity and the [`ZoneIndex`]: scope-tree reconstruction from a
//! flat, possibly out-of-order enter/leave event stream.
//!
//! Scopes are kept in a per-zone arena (`Vec<Scope>` indexed by
//! [`ScopeId`]) rather than linked by owning pointers: this turns the
//! parent/child relationship into two plain integer fields and makes the
//! rebuild-and-renumber passes linear scans instead of pointer-chasing.

use serde::{Deserialize, Serialize};

use crate::event::{builtin, Event, EventTypeFlags, EventTypeId};
use crate::{Position, Time};

/// A stable handle to a [`Zone`], allocated by the listener in creation
/// order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ZoneId(pub(crate) u32);

/// A logical trace context — a thread, a process shard, or similar —
/// identified by `(name, type, location)` and created by a
/// `wtf.zone#create` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Zone {
    pub id: ZoneId,
    pub name: Box<str>,
    pub type_: Box<str>,
    pub location: Box<str>,
}

/// A stable arena index into a [`ZoneIndex`]'s scope slab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ScopeId(pub u32);

/// A reconstructed scope: an enter event, an optional matching leave
/// event, and derived durations.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scope {
    pub parent: Option<ScopeId>,
    pub children: Vec<ScopeId>,
    pub depth: u32,
    pub enter: Event,
    pub leave: Option<Event>,
    /// `leave.time - enter.time`, once closed.
    pub total_duration: Option<Time>,
    /// `total_duration` minus the sum of direct children's
    /// `total_duration`, once closed.
    pub user_duration: Option<Time>,
}

impl Scope {
    pub fn is_closed(&self) -> bool {
        self.leave.is_some()
    }

    /// `[enter.time, leave.time)`, or `[enter.time, +inf)` if unclosed.
    pub fn contains_time(&self, t: Time) -> bool {
        if t < self.enter.time {
            return false;
        }
        match &self.leave {
            Some(leave) => t < leave.time,
            None => true,
        }
    }
}

/// Tunable limits that keep pathological out-of-order ingestion bounded.
#[derive(Debug, Clone, Copy)]
pub struct ZoneIndexConfig {
    /// Upper bound, in scopes, on how far back a dirty `end_inserting`
    /// pass will rewind to rebuild the scope forest. Left unbounded, a
    /// single badly-timed late arrival could force a rebuild of the
    /// entire history, so this crate caps it and surfaces a warning
    /// instead of diverging.
    pub max_rebuild_scopes: usize,
}

impl Default for ZoneIndexConfig {
    fn default() -> Self {
        ZoneIndexConfig { max_rebuild_scopes: 4096 }
    }
}

/// One ingestion-time error surfaced by [`ZoneIndex::end_inserting`].
/// Never aborts ingestion; the listener turns these into
/// `DbEvent::SourceError` notifications.
#[derive(Debug, Clone)]
pub enum ZoneIndexWarning {
    /// A `wtf.scope#leave` had no matching open enter in this zone, or
    /// arrived before the enter it would have matched; it was dropped.
    UnmatchedLeave { time: Time },
    /// A dirty rebuild needed to rewind further than
    /// `ZoneIndexConfig::max_rebuild_scopes` allows; the rebuild window
    /// was capped and the forest may not exactly reflect pathological
    /// interleavings beyond the cap.
    RebuildWindowExceeded { requested: usize, capped_to: usize },
}

/// Owns the ordered event list for one zone and the scope forest derived
/// from it.
pub struct ZoneIndex {
    pub zone: Zone,
    config: ZoneIndexConfig,

    events: Vec<Event>,
    /// Set by `insert_event` when an arrival is out of order relative to
    /// the previous arrival; cleared by `end_inserting`.
    dirty: bool,
    /// High-water mark recorded by `begin_inserting`: the event count
    /// before this batch's insertions began.
    batch_start: usize,
    inserting: bool,

    scopes: Vec<Scope>,
    roots: Vec<ScopeId>,
    /// Per-zone stack of currently-open scopes, innermost last.
    open_stack: Vec<ScopeId>,

    frame_index: crate::frame::FrameIndex,

    pub warnings: Vec<ZoneIndexWarning>,
}

impl ZoneIndex {
    pub fn new(zone: Zone, config: ZoneIndexConfig) -> Self {
        ZoneIndex {
            zone,
            config,
            events: Vec::new(),
            dirty: false,
            batch_start: 0,
            inserting: false,
            scopes: Vec::new(),
            roots: Vec::new(),
            open_stack: Vec::new(),
            frame_index: crate::frame::FrameIndex::new(),
            warnings: Vec::new(),
        }
    }

    pub fn frame_index(&self) -> &crate::frame::FrameIndex {
        &self.frame_index
    }

    pub fn id(&self) -> ZoneId {
        self.zone.id
    }

    pub fn event_count(&self) -> usize {
        self.events.len()
    }

    /// Enters the mutable phase of a batch: records the current tail as
    /// a high-water mark so `end_inserting` knows how much of the
    /// forest might need rebuilding.
    pub fn begin_inserting(&mut self) {
        debug_assert!(!self.inserting, "begin_inserting called while already inserting");
        self.batch_start = self.events.len();
        self.inserting = true;
        self.frame_index.begin_inserting();
    }

    /// Appends an event belonging to this zone. Events addressed to a
    /// different zone are ignored — every event is offered to every
    /// zone index by the listener's fixed fan-out, and each index keeps
    /// only what belongs to it.
    pub fn insert_event(&mut self, e: &Event) {
        debug_assert!(self.inserting, "insert_event called outside a batch");
        if e.zone != Some(self.zone.id) {
            return;
        }
        if let Some(last) = self.events.last() {
            if e.time < last.time {
                self.dirty = true;
            }
        }
        if e.flags.contains(EventTypeFlags::FRAME) {
            self.frame_index.insert(e);
        }
        self.events.push(e.clone());
    }

    /// Sorts (if dirty) and rebuilds the scope forest for the portion of
    /// the event list that may have changed.
    pub fn end_inserting(&mut self) {
        debug_assert!(self.inserting, "end_inserting called outside a batch");
        self.inserting = false;
        self.frame_index.end_inserting();

        if self.events.len() == self.batch_start {
            return;
        }

        if self.dirty {
            self.events[self.batch_start..].sort_by(|a, b| a.time.cmp(&b.time));
            // Stable sort above already preserves arrival order among
            // ties; merge the freshly-sorted tail back against the
            // (already sorted) prefix with a stable merge so the whole
            // vector is ordered by time with arrival order as tie-break.
            self.events[..].sort_by(stable_time_order());
            self.dirty = false;
        }

        let rewind_to = self.rewind_point();
        self.rebuild_from(rewind_to);
    }

    /// Finds the earliest index the forest rebuild must start from: the
    /// deepest still-open scope whose enter time is strictly less than
    /// the earliest event in this batch, capped by `max_rebuild_scopes`.
    fn rewind_point(&mut self) -> usize {
        if self.batch_start == 0 {
            return 0;
        }
        let earliest_new = self.events[self.batch_start..]
            .iter()
            .map(|e| e.time)
            .min()
            .unwrap_or(Time::MAX);

        let mut cut = self.batch_start;
        while cut > 0 && self.events[cut - 1].time >= earliest_new {
            cut -= 1;
        }

        let requested = self.batch_start - cut;
        if requested > self.config.max_rebuild_scopes {
            let capped = self.batch_start - self.config.max_rebuild_scopes;
            self.warnings.push(ZoneIndexWarning::RebuildWindowExceeded {
                requested,
                capped_to: self.config.max_rebuild_scopes,
            });
            return capped;
        }
        cut
    }

    /// Rebuilds the scope forest from event index `from` onward. Scopes
    /// entirely before `from` are left untouched; everything at or after
    /// `from` is discarded and reconstructed from the (already
    /// time-ordered) event list.
    fn rebuild_from(&mut self, from: usize) {
        self.truncate_scopes_from(from);

        // Re-seed the open stack with whatever was still open strictly
        // before `from`.
        self.open_stack = self
            .scopes
            .iter()
            .enumerate()
            .filter(|(_, s)| s.leave.is_none())
            .map(|(i, _)| ScopeId(i as u32))
            .collect();
        // `filter`'s order follows arena order, which is insertion (and
        // therefore nesting) order, so the stack already reads
        // outermost-first; that's exactly what a freshly reconstructed
        // open stack looks like.

        for event in &self.events[from..] {
            let registry_flags = event_flags(event);
            if registry_flags.contains(EventTypeFlags::SCOPE_ENTER) {
                let id = ScopeId(self.scopes.len() as u32);
                let parent = self.open_stack.last().copied();
                let depth = parent.map_or(0, |p| self.scopes[p.0 as usize].depth + 1);
                self.scopes.push(Scope {
                    parent,
                    children: Vec::new(),
                    depth,
                    enter: event.clone(),
                    leave: None,
                    total_duration: None,
                    user_duration: None,
                });
                match parent {
                    Some(p) => self.scopes[p.0 as usize].children.push(id),
                    None => self.roots.push(id),
                }
                self.open_stack.push(id);
            } else if registry_flags.contains(EventTypeFlags::SCOPE_LEAVE) {
                match self.open_stack.pop() {
                    Some(id) if self.scopes[id.0 as usize].enter.time <= event.time => {
                        let total = event.time - self.scopes[id.0 as usize].enter.time;
                        self.scopes[id.0 as usize].leave = Some(event.clone());
                        self.scopes[id.0 as usize].total_duration = Some(total);
                    }
                    Some(id) => {
                        // Leave precedes its matched enter: drop it and
                        // put the scope back on the stack, unclosed.
                        self.open_stack.push(id);
                        self.warnings.push(ZoneIndexWarning::UnmatchedLeave { time: event.time });
                    }
                    None => {
                        self.warnings.push(ZoneIndexWarning::UnmatchedLeave { time: event.time });
                    }
                }
            }
        }

        self.recompute_user_durations();
    }

    fn truncate_scopes_from(&mut self, from_event_index: usize) {
        // Any scope whose enter arrived at or after `from_event_index`'s
        // event is being rebuilt; find the arena split point. Since
        // scopes were built from the same prefix of events, the live
        // scope count for the retained prefix equals the number of
        // SCOPE_ENTER events strictly before `from_event_index` that are
        // still reachable (i.e. all of them — scopes are append-only
        // until a rebuild discards a suffix).
        let keep = self.events[..from_event_index]
            .iter()
            .filter(|e| event_flags(e).contains(EventTypeFlags::SCOPE_ENTER))
            .count();
        if keep < self.scopes.len() {
            self.scopes.truncate(keep);
            for scope in &mut self.scopes {
                scope.children.retain(|c| (c.0 as usize) < keep);
            }
            self.roots.retain(|r| (r.0 as usize) < keep);
        }
    }

    fn recompute_user_durations(&mut self) {
        for i in 0..self.scopes.len() {
            let Some(total) = self.scopes[i].total_duration else { continue };
            let children_total: Time = self.scopes[i]
                .children
                .iter()
                .filter_map(|c| self.scopes[c.0 as usize].total_duration)
                .sum();
            self.scopes[i].user_duration = Some(total - children_total);
        }
    }

    /// Assigns dense positions, in time order, starting from
    /// `start_position`; returns the next free position.
    pub fn renumber(&mut self, start_position: Position) -> Position {
        let mut order: Vec<usize> = (0..self.events.len()).collect();
        order.sort_by(|&a, &b| stable_time_order()(&self.events[a], &self.events[b]));
        let mut next = start_position;
        for idx in order {
            self.events[idx].position = next;
            next += 1;
        }
        // Scopes hold clones of their enter/leave events; refresh their
        // positions to match the canonical, just-renumbered copies.
        self.sync_scope_positions();
        next
    }

    fn sync_scope_positions(&mut self) {
        use std::collections::HashMap;
        let mut by_identity: HashMap<(Time, EventTypeId), Vec<Position>> = HashMap::new();
        for e in &self.events {
            by_identity.entry((e.time, e.ty)).or_default().push(e.position);
        }
        // Positions are unique per (time, type) bucket in arrival order;
        // walking scopes in arena order and popping from the front of
        // each bucket reproduces the same pairing `rebuild_from` used.
        let mut cursors: HashMap<(Time, EventTypeId), usize> = HashMap::new();
        for scope in &mut self.scopes {
            let key = (scope.enter.time, scope.enter.ty);
            if let Some(positions) = by_identity.get(&key) {
                let cursor = cursors.entry(key).or_insert(0);
                if let Some(&p) = positions.get(*cursor) {
                    scope.enter.position = p;
                    *cursor += 1;
                }
            }
            if let Some(leave) = &mut scope.leave {
                let key = (leave.time, leave.ty);
                if let Some(positions) = by_identity.get(&key) {
                    let cursor = cursors.entry(key).or_insert(0);
                    if let Some(&p) = positions.get(*cursor) {
                        leave.position = p;
                        *cursor += 1;
                    }
                }
            }
        }
    }

    /// Iterates events in `[t_start, t_end)` in time order.
    pub fn for_each(&self, t_start: Time, t_end: Time, mut f: impl FnMut(&Event)) {
        let lower = self.events.partition_point(|e| e.time < t_start);
        for e in &self.events[lower..] {
            if e.time >= t_end {
                break;
            }
            f(e);
        }
    }

    pub fn get_root_scopes(&self) -> &[ScopeId] {
        &self.roots
    }

    pub fn scope(&self, id: ScopeId) -> &Scope {
        &self.scopes[id.0 as usize]
    }

    pub fn scopes(&self) -> &[Scope] {
        &self.scopes
    }

    /// The scope whose enter event is `(time, position)`, if any —
    /// used to reconstruct a scope from a filter-matched enter event.
    pub fn find_scope_by_enter(&self, time: Time, position: Position) -> Option<ScopeId> {
        self.scopes
            .iter()
            .position(|s| s.enter.time == time && s.enter.position == position)
            .map(|i| ScopeId(i as u32))
    }

    /// The innermost scope whose live interval contains `t`, if any.
    pub fn get_scope_at(&self, t: Time) -> Option<ScopeId> {
        let mut best: Option<ScopeId> = None;
        let mut frontier: Vec<ScopeId> = self.roots.clone();
        loop {
            let candidate = frontier.iter().copied().find(|id| self.scopes[id.0 as usize].contains_time(t));
            match candidate {
                Some(id) => {
                    best = Some(id);
                    frontier = self.scopes[id.0 as usize].children.clone();
                }
                None => break,
            }
        }
        best
    }
}

fn event_flags(e: &Event) -> EventTypeFlags {
    e.flags
}

fn stable_time_order() -> impl Fn(&Event, &Event) -> std::cmp::Ordering {
    |a, b| a.time.cmp(&b.time).then(a.position.cmp(&b.position))
}

/// A human-readable label for a builtin event type name, used only for
/// diagnostics.
pub fn builtin_label(name: &str) -> &'static str {
    match name {
        builtin::SCOPE_ENTER => "scope#enter",
        builtin::SCOPE_LEAVE => "scope#leave",
        builtin::ZONE_CREATE => "zone#create",
        _ => "event",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ArgValue, EventTypeRegistry};
    use smallvec::SmallVec;

    fn zone_index() -> (EventTypeRegistry, ZoneIndex) {
        let registry = EventTypeRegistry::new();
        let zone = Zone { id: ZoneId(0), name: "Z".into(), type_: "thread".into(), location: "main".into() };
        (registry, ZoneIndex::new(zone, ZoneIndexConfig::default()))
    }

    fn enter(registry: &EventTypeRegistry, time: Time, zone: ZoneId) -> Event {
        let ty = registry.lookup(builtin::SCOPE_ENTER).unwrap();
        Event::new(time, ty, Some(zone), SmallVec::<[ArgValue; 4]>::new(), EventTypeFlags::SCOPE_ENTER)
    }

    fn leave(registry: &EventTypeRegistry, time: Time, zone: ZoneId) -> Event {
        let ty = registry.lookup(builtin::SCOPE_LEAVE).unwrap();
        Event::new(time, ty, Some(zone), SmallVec::<[ArgValue; 4]>::new(), EventTypeFlags::SCOPE_LEAVE)
    }

    #[test]
    fn s1_single_zone_nested_scopes() {
        let (registry, mut zi) = zone_index();
        let z = zi.id();
        zi.begin_inserting();
        zi.insert_event(&enter(&registry, 10, z)); // A
        zi.insert_event(&enter(&registry, 20, z)); // B
        zi.insert_event(&leave(&registry, 30, z)); // B leaves
        zi.insert_event(&leave(&registry, 50, z)); // A leaves
        zi.end_inserting();

        assert_eq!(zi.get_root_scopes().len(), 1);
        let a = zi.scope(zi.get_root_scopes()[0]);
        assert_eq!(a.total_duration, Some(40));
        assert_eq!(a.user_duration, Some(30));
        assert_eq!(a.children.len(), 1);
        let b = zi.scope(a.children[0]);
        assert_eq!(b.total_duration, Some(10));
        assert_eq!(b.user_duration, Some(10));
    }

    #[test]
    fn s2_out_of_order_batch_matches_in_order_result() {
        let (registry, mut zi) = zone_index();
        let z = zi.id();
        zi.begin_inserting();
        // Reverse arrival order within one batch.
        zi.insert_event(&leave(&registry, 50, z));
        zi.insert_event(&leave(&registry, 30, z));
        zi.insert_event(&enter(&registry, 20, z));
        zi.insert_event(&enter(&registry, 10, z));
        zi.end_inserting();

        let a = zi.scope(zi.get_root_scopes()[0]);
        assert_eq!(a.total_duration, Some(40));
        assert_eq!(a.user_duration, Some(30));
        let b = zi.scope(a.children[0]);
        assert_eq!(b.total_duration, Some(10));
    }

    #[test]
    fn s3_unmatched_leave_is_dropped_with_warning() {
        let (registry, mut zi) = zone_index();
        let z = zi.id();
        zi.begin_inserting();
        zi.insert_event(&leave(&registry, 10, z));
        zi.end_inserting();

        assert!(zi.get_root_scopes().is_empty());
        assert_eq!(zi.warnings.len(), 1);
        assert!(matches!(zi.warnings[0], ZoneIndexWarning::UnmatchedLeave { .. }));
    }

    #[test]
    fn positions_strictly_increase_after_renumber() {
        let (registry, mut zi) = zone_index();
        let z = zi.id();
        zi.begin_inserting();
        zi.insert_event(&leave(&registry, 50, z));
        zi.insert_event(&enter(&registry, 10, z));
        zi.end_inserting();
        zi.renumber(1);

        let mut last = 0;
        zi.for_each(Time::MIN, Time::MAX, |e| {
            assert!(e.position > last);
            last = e.position;
        });
    }
}
