//! [`FrameIndex`]: the repeating start/end (or instant) events that
//! delimit one zone's frames of work — e.g. a render loop's ticks.

use crate::event::{Event, EventTypeFlags};
use crate::Time;

/// One reconstructed frame: a start event and, once closed, an end
/// event.
#[derive(Debug, Clone)]
pub struct Frame {
    pub start: Event,
    pub end: Option<Event>,
}

impl Frame {
    pub fn duration(&self) -> Option<Time> {
        self.end.as_ref().map(|end| end.time - self.start.time)
    }

    fn contains_time(&self, t: Time) -> bool {
        if t < self.start.time {
            return false;
        }
        match &self.end {
            Some(end) => t < end.time,
            None => true,
        }
    }
}

/// Holds the subset of one zone's events that mark frame boundaries,
/// paired into [`Frame`]s the same way `ZoneIndex` pairs scope
/// enter/leave events, but as a flat sequence rather than a tree.
///
/// Mirrors `EventIndex`'s batch discipline: `insert` only buffers raw
/// events in arrival order, and pairing is (re)derived from scratch in
/// `end_inserting`, once the batch's events are known to be
/// time-ordered. Frames never nest, so unlike `ZoneIndex` there is no
/// incremental rewind window — the whole buffered history is re-paired
/// every time.
#[derive(Default)]
pub struct FrameIndex {
    events: Vec<Event>,
    dirty: bool,
    inserting: bool,
    frames: Vec<Frame>,
}

impl FrameIndex {
    pub fn new() -> Self {
        FrameIndex::default()
    }

    pub fn begin_inserting(&mut self) {
        debug_assert!(!self.inserting, "begin_inserting called while already inserting");
        self.inserting = true;
    }

    /// Buffers one frame-flagged event in arrival order; pairing is
    /// deferred until `end_inserting`.
    pub fn insert(&mut self, e: &Event) {
        debug_assert!(self.inserting, "insert called outside a batch");
        if let Some(last) = self.events.last() {
            if e.time < last.time {
                self.dirty = true;
            }
        }
        self.events.push(e.clone());
    }

    /// Sorts (if dirty) and rebuilds the paired frame list from the full
    /// buffered event history.
    pub fn end_inserting(&mut self) {
        debug_assert!(self.inserting, "end_inserting called outside a batch");
        self.inserting = false;
        if self.dirty {
            self.events.sort_by(|a, b| a.time.cmp(&b.time));
            self.dirty = false;
        }
        self.rebuild();
    }

    /// Re-derives `frames` from `events`, pairing a `FRAME_START` with
    /// the next `FRAME_END`. A `FRAME_START` that arrives with one
    /// already open closes the previous frame against it, recording it
    /// as an instant marker; a `FRAME_END` with nothing open is
    /// dropped.
    fn rebuild(&mut self) {
        self.frames.clear();
        let mut open: Option<usize> = None;
        for e in &self.events {
            if e.flags.contains(EventTypeFlags::FRAME_START) {
                if let Some(prev) = open.take() {
                    self.frames[prev].end = Some(e.clone());
                }
                open = Some(self.frames.len());
                self.frames.push(Frame { start: e.clone(), end: None });
            } else if e.flags.contains(EventTypeFlags::FRAME_END) {
                if let Some(prev) = open.take() {
                    self.frames[prev].end = Some(e.clone());
                }
            }
        }
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    /// The frame containing timestamp `t`, if any.
    pub fn get_frame_in_range(&self, t: Time) -> Option<&Frame> {
        self.frames.iter().find(|f| f.contains_time(t))
    }
}
