//! The tree-expression query path: a small XPath-like language over the
//! database's natural containment tree (database -> zone -> scope -> event).

use serde::{Deserialize, Serialize};

use crate::error::{Result, TraceDbError};
use crate::event::Event;
use crate::listener::Database;
use crate::zone::{ScopeId, ZoneId};

/// Which kind of node a step may match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NameTest {
    Any,
    Zone,
    Scope,
    Event,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Predicate {
    pub attr: String,
    pub value: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Axis {
    /// Immediate children only.
    Child,
    /// Any depth below, per the leading `//` form.
    Descendant,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub axis: Axis,
    pub test: NameTest,
    pub predicate: Option<Predicate>,
}

/// A parsed tree expression: a sequence of steps applied left to right,
/// starting from the database root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeExpr {
    pub steps: Vec<Step>,
}

/// Parses a leading-`/`-style path into a [`TreeExpr`]. Grammar:
/// `('/' | '//') name ('[' '@' attr '=' '\'' value '\'' ']')?` repeated.
pub fn parse(expr: &str) -> Result<TreeExpr> {
    let mut steps = Vec::new();
    let mut rest = expr;
    while !rest.is_empty() {
        let axis = if let Some(r) = rest.strip_prefix("//") {
            rest = r;
            Axis::Descendant
        } else if let Some(r) = rest.strip_prefix('/') {
            rest = r;
            Axis::Child
        } else {
            return Err(invalid(expr, "expected '/' or '//' before a step"));
        };

        let name_end = rest.find(|c| c == '/' || c == '[').unwrap_or(rest.len());
        let name = &rest[..name_end];
        let test = match name {
            "*" => NameTest::Any,
            "zone" => NameTest::Zone,
            "scope" => NameTest::Scope,
            "event" => NameTest::Event,
            other => return Err(invalid(expr, &format!("unknown node test '{other}'"))),
        };
        rest = &rest[name_end..];

        let predicate = if let Some(r) = rest.strip_prefix('[') {
            let close = r.find(']').ok_or_else(|| invalid(expr, "unterminated predicate"))?;
            let body = &r[..close];
            rest = &r[close + 1..];
            Some(parse_predicate(expr, body)?)
        } else {
            None
        };

        steps.push(Step { axis, test, predicate });
    }
    if steps.is_empty() {
        return Err(invalid(expr, "empty path"));
    }
    Ok(TreeExpr { steps })
}

fn parse_predicate(expr: &str, body: &str) -> Result<Predicate> {
    let body = body.strip_prefix('@').ok_or_else(|| invalid(expr, "predicate must start with '@'"))?;
    let (attr, value) = body.split_once('=').ok_or_else(|| invalid(expr, "predicate must be @attr='value'"))?;
    let value = value
        .strip_prefix('\'')
        .and_then(|v| v.strip_suffix('\''))
        .ok_or_else(|| invalid(expr, "predicate value must be single-quoted"))?;
    Ok(Predicate { attr: attr.to_string(), value: value.to_string() })
}

fn invalid(expr: &str, reason: &str) -> TraceDbError {
    TraceDbError::InvalidQuery { query: expr.to_string(), reason: reason.to_string() }
}

/// A tagged reference into the database's containment tree, borrowed from
/// a `Database` snapshot. Cheap to clone; all variants are either `Copy`
/// handles or a single owned `Event` for leaf nodes.
#[derive(Clone)]
pub enum NodeRef {
    Root,
    Zone(ZoneId),
    Scope(ZoneId, ScopeId),
    Event(ZoneId, Option<ScopeId>, Box<Event>),
}

impl NodeRef {
    pub fn node_type(&self) -> &'static str {
        match self {
            NodeRef::Root => "database",
            NodeRef::Zone(_) => "zone",
            NodeRef::Scope(..) => "scope",
            NodeRef::Event(..) => "event",
        }
    }

    pub fn node_name(&self, db: &Database) -> Option<String> {
        match self {
            NodeRef::Root => None,
            NodeRef::Zone(id) => db.zone_index(*id).map(|z| z.zone.name.to_string()),
            NodeRef::Scope(..) => None,
            NodeRef::Event(_, _, e) => Some(db.registry().get(e.ty).name.to_string()),
        }
    }

    pub fn node_position(&self) -> Option<u64> {
        match self {
            NodeRef::Event(_, _, e) => Some(e.position),
            _ => None,
        }
    }

    fn attr(&self, db: &Database, name: &str) -> Option<String> {
        match self {
            NodeRef::Zone(id) => {
                let zone = &db.zone_index(*id)?.zone;
                match name {
                    "name" => Some(zone.name.to_string()),
                    "type" => Some(zone.type_.to_string()),
                    "location" => Some(zone.location.to_string()),
                    _ => None,
                }
            }
            NodeRef::Event(_, _, e) => match name {
                "type" => Some(db.registry().get(e.ty).name.to_string()),
                "time" => Some(e.time.to_string()),
                _ => {
                    let registry = db.registry();
                    e.arg(registry, name).map(|v| v.as_filter_text())
                }
            },
            _ => None,
        }
    }

    fn children(&self, db: &Database) -> Vec<NodeRef> {
        match self {
            NodeRef::Root => db.zone_indices().iter().map(|z| NodeRef::Zone(z.id())).collect(),
            NodeRef::Zone(id) => {
                let Some(zone) = db.zone_index(*id) else { return Vec::new() };
                zone.get_root_scopes().iter().map(|s| NodeRef::Scope(*id, *s)).collect()
            }
            NodeRef::Scope(zone_id, scope_id) => {
                let Some(zone) = db.zone_index(*zone_id) else { return Vec::new() };
                let scope = zone.scope(*scope_id);
                let mut out: Vec<NodeRef> =
                    scope.children.iter().map(|c| NodeRef::Scope(*zone_id, *c)).collect();
                out.push(NodeRef::Event(*zone_id, Some(*scope_id), Box::new(scope.enter.clone())));
                if let Some(leave) = &scope.leave {
                    out.push(NodeRef::Event(*zone_id, Some(*scope_id), Box::new(leave.clone())));
                }
                out
            }
            NodeRef::Event(..) => Vec::new(),
        }
    }

    fn descendants(&self, db: &Database) -> Vec<NodeRef> {
        let mut out = Vec::new();
        let mut stack = self.children(db);
        while let Some(node) = stack.pop() {
            stack.extend(node.children(db));
            out.push(node);
        }
        out
    }
}

/// Evaluates a parsed tree expression against a database snapshot,
/// returning every node matched by the final step.
pub fn evaluate(db: &Database, expr: &TreeExpr) -> Vec<NodeRef> {
    evaluate_cancellable(db, expr, &|| false)
}

pub fn evaluate_cancellable(db: &Database, expr: &TreeExpr, should_cancel: &dyn Fn() -> bool) -> Vec<NodeRef> {
    let mut frontier = vec![NodeRef::Root];
    for step in &expr.steps {
        if should_cancel() {
            return Vec::new();
        }
        let mut next = Vec::new();
        for node in &frontier {
            let candidates = match step.axis {
                Axis::Child => node.children(db),
                Axis::Descendant => node.descendants(db),
            };
            for candidate in candidates {
                if step.test != NameTest::Any && candidate.node_type() != name_test_str(step.test) {
                    continue;
                }
                if let Some(pred) = &step.predicate {
                    if candidate.attr(db, &pred.attr).as_deref() != Some(pred.value.as_str()) {
                        continue;
                    }
                }
                next.push(candidate);
            }
        }
        frontier = next;
    }
    frontier
}

fn name_test_str(test: NameTest) -> &'static str {
    match test {
        NameTest::Any => "*",
        NameTest::Zone => "zone",
        NameTest::Scope => "scope",
        NameTest::Event => "event",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_path_with_predicate() {
        let expr = parse("/zone[@name='Main']/scope").unwrap();
        assert_eq!(expr.steps.len(), 2);
        assert_eq!(expr.steps[0].test, NameTest::Zone);
        assert_eq!(expr.steps[0].predicate.as_ref().unwrap().value, "Main");
        assert_eq!(expr.steps[1].test, NameTest::Scope);
    }

    #[test]
    fn rejects_unknown_node_test() {
        assert!(parse("/bogus").is_err());
    }

    #[test]
    fn descendant_axis_is_recognized() {
        let expr = parse("//event").unwrap();
        assert_eq!(expr.steps[0].axis, Axis::Descendant);
    }
}
