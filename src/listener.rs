//! The single writer: batched ingestion orchestration across every
//! index, position renumbering, and the outbound notification stream.

use std::sync::mpsc::{channel, Receiver, Sender};

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;
use tracing::{debug, warn};

use crate::error::{Result, TraceDbError};
use crate::event::{ArgSpec, ArgValue, Event, EventTypeFlags, EventTypeId, EventTypeRegistry};
use crate::event_index::EventIndex;
use crate::flow::FlowTracker;
use crate::frame::FrameIndex;
use crate::query::{self, QueryResult};
use crate::summary::SummaryIndex;
use crate::zone::{Zone, ZoneId, ZoneIndex, ZoneIndexConfig, ZoneIndexWarning};
use crate::{Position, Time};

/// Opaque, source-supplied context handed back unchanged on
/// `SOURCES_CHANGED`/batch notifications.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ContextInfo(pub Option<String>);

/// One registered trace source.
#[derive(Debug, Clone)]
pub struct Source {
    pub timebase: Time,
    pub context: ContextInfo,
}

/// A raw, not-yet-positioned event as a source adapter constructs it.
/// `zone` is a source-chosen key shared by every event in one zone's
/// stream (including the `wtf.zone#create` event that establishes it);
/// `0` means "no zone": a source-chosen key rather than deriving zone
/// membership structurally, since zones can be created mid-batch.
#[derive(Clone)]
pub struct RawEvent {
    pub type_name: String,
    pub time: Time,
    pub zone_key: u64,
    pub args: SmallVec<[ArgValue; 4]>,
}

/// Notifications the database emits to subscribers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum DbEvent {
    SourcesChanged,
    SourceError { message: String, detail: Option<String> },
    ZonesAdded(Vec<ZoneId>),
    Invalidated,
}

/// The in-memory event-trace database: the single writer (via the
/// `source_added`/`begin_event_batch`/`trace_event`/`end_event_batch`
/// contract) and the read surface consumers query between batches.
pub struct Database {
    registry: EventTypeRegistry,
    sources: Vec<Source>,

    zones: Vec<ZoneIndex>,
    zone_keys: fnv::FnvHashMap<u64, ZoneId>,

    summary: SummaryIndex,
    event_indices: Vec<EventIndex>,
    flow_tracker: FlowTracker,

    total_event_count: u64,
    zone_index_config: ZoneIndexConfig,

    // Batch-scoped state.
    inserting: bool,
    zone_count_at_batch_start: usize,
    events_inserted_this_batch: u64,
    target_zone_range: std::ops::Range<usize>,

    notify_tx: Sender<DbEvent>,
    notify_rx: Receiver<DbEvent>,
}

impl Default for Database {
    fn default() -> Self {
        Self::new(ZoneIndexConfig::default())
    }
}

impl Database {
    pub fn new(zone_index_config: ZoneIndexConfig) -> Self {
        let (notify_tx, notify_rx) = channel();
        Database {
            registry: EventTypeRegistry::new(),
            sources: Vec::new(),
            zones: Vec::new(),
            zone_keys: fnv::FnvHashMap::default(),
            summary: SummaryIndex::new(20),
            event_indices: Vec::new(),
            flow_tracker: FlowTracker::new(),
            total_event_count: 0,
            zone_index_config,
            inserting: false,
            zone_count_at_batch_start: 0,
            events_inserted_this_batch: 0,
            target_zone_range: 0..0,
            notify_tx,
            notify_rx,
        }
    }

    // ---- inbound (source adapter) contract -----------------------------

    pub fn source_added(&mut self, timebase: Time, context: ContextInfo) {
        self.sources.push(Source { timebase, context });
        self.emit(DbEvent::SourcesChanged);
        self.emit(DbEvent::Invalidated);
    }

    pub fn source_error(&mut self, message: impl Into<String>, detail: Option<String>) {
        let message = message.into();
        warn!(%message, ?detail, "source_error");
        self.emit(DbEvent::SourceError { message, detail });
    }

    pub fn begin_event_batch(&mut self, _context: ContextInfo) -> Result<()> {
        if self.inserting {
            return Err(TraceDbError::NestedBatch);
        }
        self.inserting = true;
        self.zone_count_at_batch_start = self.zones.len();
        self.events_inserted_this_batch = 0;
        self.target_zone_range = 0..self.zones.len();

        self.summary.begin_inserting();
        for zone in &mut self.zones {
            zone.begin_inserting();
        }
        for index in &mut self.event_indices {
            index.begin_inserting();
        }
        Ok(())
    }

    pub fn trace_event(&mut self, raw: RawEvent) -> Result<()> {
        if !self.inserting {
            return Err(TraceDbError::InsertOutsideBatch);
        }

        let ty = self.resolve_type(&raw.type_name);
        let flags = self.registry.get(ty).flags;
        let is_zone_create = flags.contains(EventTypeFlags::ZONE_CREATE);
        let resolved = if raw.zone_key == 0 { None } else { self.resolve_zone_for_event(&raw, ty) };
        // `zone#create` establishes a zone but does not itself join that
        // zone's event stream or scope tree.
        let zone = if is_zone_create { None } else { resolved };
        let event = Event::new(raw.time, ty, zone, raw.args, flags);

        if !event.is_internal() && !flags.contains(EventTypeFlags::SCOPE_LEAVE) {
            self.total_event_count += 1;
        }
        self.events_inserted_this_batch += 1;

        if flags.contains(EventTypeFlags::FLOW_BRANCH)
            || flags.contains(EventTypeFlags::FLOW_EXTEND)
            || flags.contains(EventTypeFlags::FLOW_TERMINATE)
            || flags.contains(EventTypeFlags::FLOW_DATA)
        {
            self.flow_tracker.handle_event(&event, &self.registry);
        }

        // Fixed target-list order: summary, every zone index (including
        // ones just appended to the end of the zones sub-range this
        // batch), then every event-name index.
        self.summary.insert_event(event.time);
        for zone in &mut self.zones[self.target_zone_range.clone()] {
            zone.insert_event(&event);
        }
        let type_name = self.registry.get(event.ty).name.to_string();
        for index in &mut self.event_indices {
            index.insert_event(&event, &type_name);
        }

        Ok(())
    }

    pub fn end_event_batch(&mut self) -> Result<()> {
        if !self.inserting {
            return Err(TraceDbError::InsertOutsideBatch);
        }

        // Tear down in the reverse of fan-out order.
        for index in self.event_indices.iter_mut().rev() {
            index.end_inserting();
        }
        for zone in self.zones.iter_mut().rev() {
            zone.end_inserting();
        }
        self.summary.end_inserting();

        let mut next_position: Position = 1;
        for zone in &mut self.zones {
            next_position = zone.renumber(next_position);
        }

        // Event-name indices hold clones of events taken at
        // `trace_event` time, before this renumbering pass ran; refresh
        // them from the now-canonical per-zone positions so readers
        // never observe a stale `position == 0`.
        let mut canonical: std::collections::HashMap<(Option<ZoneId>, Time, EventTypeId), Vec<Position>> =
            std::collections::HashMap::new();
        for zone in &self.zones {
            zone.for_each(Time::MIN, Time::MAX, |e| {
                canonical.entry((e.zone, e.time, e.ty)).or_default().push(e.position);
            });
        }
        for index in &mut self.event_indices {
            index.sync_positions(&canonical);
        }

        for zone in &self.zones {
            for warning in &zone.warnings {
                match warning {
                    ZoneIndexWarning::UnmatchedLeave { time } => {
                        self.notify_tx
                            .send(DbEvent::SourceError {
                                message: format!("unmatched scope leave in zone {:?} at t={}", zone.zone.name, time),
                                detail: None,
                            })
                            .ok();
                    }
                    ZoneIndexWarning::RebuildWindowExceeded { requested, capped_to } => {
                        self.notify_tx
                            .send(DbEvent::SourceError {
                                message: format!(
                                    "zone {:?} rebuild window exceeded ({} > {}), results may diverge",
                                    zone.zone.name, requested, capped_to
                                ),
                                detail: None,
                            })
                            .ok();
                    }
                }
            }
        }
        for zone in &mut self.zones {
            zone.warnings.clear();
        }

        self.inserting = false;
        self.target_zone_range = 0..0;

        if self.zones.len() > self.zone_count_at_batch_start {
            let new_zones: Vec<ZoneId> = self.zones[self.zone_count_at_batch_start..]
                .iter()
                .map(|z| z.id())
                .collect();
            self.emit(DbEvent::ZonesAdded(new_zones));
        }
        if self.events_inserted_this_batch > 0 {
            self.emit(DbEvent::Invalidated);
        }
        debug!(events = self.events_inserted_this_batch, "end_event_batch");
        Ok(())
    }

    fn resolve_type(&mut self, name: &str) -> EventTypeId {
        if let Some(id) = self.registry.lookup(name) {
            return id;
        }
        self.registry.intern(name, Vec::new(), EventTypeFlags::empty())
    }

    /// Resolves the zone an event belongs to, creating a new
    /// [`ZoneIndex`] for `wtf.zone#create` events. Returns `None` for an
    /// event whose zone key has no matching `zone#create` yet — it is
    /// still counted and indexed by name, but lands in no zone's scope
    /// tree.
    fn resolve_zone_for_event(&mut self, raw: &RawEvent, ty: EventTypeId) -> Option<ZoneId> {
        if self.registry.get(ty).flags.contains(EventTypeFlags::ZONE_CREATE) {
            if let Some(&existing) = self.zone_keys.get(&raw.zone_key) {
                debug!(zone_key = raw.zone_key, "duplicate zone create ignored");
                return Some(existing);
            }
            let id = ZoneId(self.zones.len() as u32);
            let zone = Zone {
                id,
                name: arg_str(&raw.args, 0),
                type_: arg_str(&raw.args, 1),
                location: arg_str(&raw.args, 2),
            };
            let mut index = ZoneIndex::new(zone, self.zone_index_config);
            index.begin_inserting();
            self.zones.push(index);
            self.target_zone_range = self.target_zone_range.start..self.zones.len();
            self.zone_keys.insert(raw.zone_key, id);
            return Some(id);
        }
        self.zone_keys.get(&raw.zone_key).copied()
    }

    fn emit(&mut self, event: DbEvent) {
        self.notify_tx.send(event).ok();
    }

    // ---- outbound accessors ---------------------------------------------

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    /// The minimum timebase across all registered sources.
    pub fn timebase(&self) -> Option<Time> {
        self.sources.iter().map(|s| s.timebase).min()
    }

    /// User-visible event count: excludes `INTERNAL` events and
    /// `wtf.scope#leave` events.
    pub fn total_event_count(&self) -> u64 {
        self.total_event_count
    }

    pub fn first_event_time(&self) -> Option<Time> {
        self.summary.first_event_time()
    }

    pub fn last_event_time(&self) -> Option<Time> {
        self.summary.last_event_time()
    }

    pub fn summary_index(&self) -> &SummaryIndex {
        &self.summary
    }

    pub fn zone_indices(&self) -> &[ZoneIndex] {
        &self.zones
    }

    pub fn zone_index(&self, id: ZoneId) -> Option<&ZoneIndex> {
        self.zones.get(id.0 as usize)
    }

    pub fn first_frame_index(&self) -> Option<&FrameIndex> {
        self.zones.first().map(|z| z.frame_index())
    }

    pub fn flow_tracker(&self) -> &FlowTracker {
        &self.flow_tracker
    }

    pub fn registry(&self) -> &EventTypeRegistry {
        &self.registry
    }

    /// Pre-registers a named, schema-bearing event type before any
    /// `trace_event` references it, e.g. a source adapter registering
    /// its own named scope-enter site with a real argument schema.
    /// Idempotent: a second call with a name already interned returns
    /// the existing handle unchanged, per `EventTypeRegistry::intern`.
    pub fn register_event_type(&mut self, name: &str, args: Vec<ArgSpec>, flags: EventTypeFlags) -> EventTypeId {
        self.registry.intern(name, args, flags)
    }

    /// Returns the named event index, creating it if it does not exist.
    /// Idempotent: a second call with the same name returns the same
    /// index. An index created mid-stream starts empty; it is not
    /// back-filled from already-ingested events.
    pub fn create_event_index(&mut self, name: &str) -> usize {
        if let Some(i) = self.event_indices.iter().position(|idx| idx.name() == name) {
            return i;
        }
        let mut index = EventIndex::new(name);
        if self.inserting {
            index.begin_inserting();
        }
        self.event_indices.push(index);
        self.event_indices.len() - 1
    }

    pub fn get_event_index(&self, name: &str) -> Option<&EventIndex> {
        self.event_indices.iter().find(|idx| idx.name() == name)
    }

    pub fn event_index_at(&self, handle: usize) -> &EventIndex {
        &self.event_indices[handle]
    }

    pub fn subscribe(&self) -> &Receiver<DbEvent> {
        &self.notify_rx
    }

    /// Drains and returns every notification emitted since the last
    /// drain.
    pub fn drain_events(&self) -> Vec<DbEvent> {
        self.notify_rx.try_iter().collect()
    }

    /// Parses and evaluates a query string against the current snapshot.
    pub fn query(&self, expr: &str) -> Result<QueryResult> {
        query::run(self, expr)
    }

    /// Like [`Database::query`], but checks `should_cancel` between work
    /// units and returns early with `cancelled: true` and no partial
    /// results.
    pub fn query_cancellable(&self, expr: &str, should_cancel: &dyn Fn() -> bool) -> Result<QueryResult> {
        query::run_cancellable(self, expr, should_cancel)
    }
}

fn arg_str(args: &SmallVec<[ArgValue; 4]>, index: usize) -> Box<str> {
    match args.get(index) {
        Some(ArgValue::Str(s)) => s.clone(),
        _ => "".into(),
    }
}
