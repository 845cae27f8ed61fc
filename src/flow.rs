//! [`FlowTracker`]: correlates asynchronous flow events by id across
//! zones.

use fnv::FnvHashMap;
use serde::{Deserialize, Serialize};

use crate::event::{ArgValue, Event, EventTypeFlags, EventTypeRegistry};

/// A session-unique flow identifier, taken from a flow event's `id`
/// argument.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowId(pub i64);

/// An identifier-linked chain of events correlating asynchronous work,
/// possibly spanning multiple zones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Flow {
    pub id: FlowId,
    /// Weak reference: the parent flow, if any, is independently owned
    /// by the same tracker's map.
    pub parent: Option<FlowId>,
    pub branch: Option<Event>,
    pub extends: Vec<Event>,
    pub terminate: Option<Event>,
    data_events: Vec<Event>,
    pub closed: bool,
}

impl Flow {
    fn new(id: FlowId, parent: Option<FlowId>) -> Self {
        Flow { id, parent, branch: None, extends: Vec::new(), terminate: None, data_events: Vec::new(), closed: false }
    }

    /// Left-folds the data-event list into a key/value map. Builtin
    /// (`INTERNAL`) appenders merge a single `{name, value}` pair; user
    /// appenders merge every argument except the flow id. Later events
    /// override earlier keys.
    pub fn data(&self, registry: &EventTypeRegistry) -> FnvHashMap<String, ArgValue> {
        let mut map = FnvHashMap::default();
        for event in &self.data_events {
            let ty = registry.get(event.ty);
            if ty.is_internal() {
                let name = event.arg(registry, "name").map(|v| v.as_filter_text());
                let value = event.arg(registry, "value").cloned();
                if let (Some(name), Some(value)) = (name, value) {
                    map.insert(name, value);
                }
            } else {
                for (spec, value) in ty.args.iter().zip(event.args.iter()) {
                    if &*spec.name == "id" {
                        continue;
                    }
                    map.insert(spec.name.to_string(), value.clone());
                }
            }
        }
        map
    }
}

/// Maintains `flowId -> Flow` and classifies incoming flow events by
/// their `EventTypeFlags`.
#[derive(Default)]
pub struct FlowTracker {
    flows: FnvHashMap<FlowId, Flow>,
}

impl FlowTracker {
    pub fn new() -> Self {
        FlowTracker::default()
    }

    pub fn get(&self, id: FlowId) -> Option<&Flow> {
        self.flows.get(&id)
    }

    pub fn len(&self) -> usize {
        self.flows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.flows.is_empty()
    }

    /// Routes one flow-classified event. No-op for events without a
    /// flow-related flag.
    pub fn handle_event(&mut self, event: &Event, registry: &EventTypeRegistry) {
        let flags = event.flags;
        let Some(id) = event.arg(registry, "id").and_then(as_flow_id) else {
            return;
        };

        if flags.contains(EventTypeFlags::FLOW_BRANCH) {
            let parent = event.arg(registry, "parent").and_then(as_flow_id).filter(|p| *p != FlowId(0));
            let flow = self.flows.entry(id).or_insert_with(|| Flow::new(id, parent));
            flow.parent = parent;
            flow.branch = Some(event.clone());
            return;
        }

        let Some(flow) = self.flows.get_mut(&id) else {
            tracing::warn!(flow = id.0, "flow event for unknown flow id, dropping");
            return;
        };

        if flow.closed {
            tracing::warn!(flow = id.0, "event on closed flow tolerated but not re-opened");
        }

        if flags.contains(EventTypeFlags::FLOW_EXTEND) {
            flow.extends.push(event.clone());
        } else if flags.contains(EventTypeFlags::FLOW_TERMINATE) {
            flow.terminate = Some(event.clone());
            flow.closed = true;
        } else if flags.contains(EventTypeFlags::FLOW_DATA) {
            flow.data_events.push(event.clone());
        }
    }
}

fn as_flow_id(v: &ArgValue) -> Option<FlowId> {
    match v {
        ArgValue::Int(v) => Some(FlowId(*v)),
        _ => None,
    }
}
