//! The query engine: classifies a query string as a filter or a tree
//! expression, compiles it, and evaluates it against a `Database`
//! snapshot.

mod filter;
mod tree;

use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::event::{event_order, EventTypeFlags};
use crate::listener::Database;
use crate::zone::{ScopeId, ZoneId};
use crate::{Position, Time};

pub use filter::FilterEvaluator;
pub use tree::{evaluate_cancellable, parse as parse_tree_expr, NodeRef, TreeExpr};

/// The three-way classification of a query string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueryKind {
    FilterSubstring,
    FilterRegex,
    TreeExpr,
}

/// A compiled query, kept alongside its result so callers can inspect
/// what the engine actually ran (the parsed AST for a tree expression,
/// not just its source text).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum CompiledQuery {
    Filter(String),
    TreeExpr(TreeExpr),
}

/// One matched item. Filter queries yield events in time order; tree
/// expressions yield the nodes their final step selected.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueryMatch {
    Event { zone: Option<ZoneId>, time: Time, position: Position, type_name: String },
    /// A filter-matched event that is itself a scope-enter: its
    /// reconstructed scope is pushed instead of the bare event, so
    /// callers get the scope's full reconstructed span.
    Scope { zone: ZoneId, scope: ScopeId, enter_time: Time, leave_time: Option<Time> },
    Node { node_type: &'static str, name: Option<String>, position: Option<Position> },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub expression: String,
    pub compiled: CompiledQuery,
    pub duration: Duration,
    pub results: Vec<QueryMatch>,
    pub cancelled: bool,
}

/// Classifies `expr` without compiling it, purely by syntactic shape: a
/// string with no leading `/` and no `(` is a substring filter; a
/// leading `/pattern/flags` that parses as a regex literal is a regex
/// filter; everything else (anything starting with `/`) is a tree
/// expression, whose own parser is the one that decides whether it is
/// well-formed.
pub fn classify(expr: &str) -> QueryKind {
    let trimmed = expr.trim();
    if !trimmed.starts_with('/') && !trimmed.contains('(') {
        return QueryKind::FilterSubstring;
    }
    if looks_like_regex_literal(trimmed) {
        return QueryKind::FilterRegex;
    }
    QueryKind::TreeExpr
}

fn looks_like_regex_literal(expr: &str) -> bool {
    let Some(rest) = expr.strip_prefix('/') else { return false };
    let bytes = rest.as_bytes();
    let mut i = 0;
    let mut escaped = false;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if !escaped => escaped = true,
            b'/' if !escaped => {
                let flags = &rest[i + 1..];
                return flags.chars().all(|c| matches!(c, 'g' | 'i' | 'm'));
            }
            _ => escaped = false,
        }
        i += 1;
    }
    false
}

/// Runs `expr` to completion against `db`.
pub fn run(db: &Database, expr: &str) -> Result<QueryResult> {
    run_cancellable(db, expr, &|| false)
}

/// Runs `expr` against `db`, checking `should_cancel` between work units.
/// A cancelled run returns `cancelled: true` with an empty result set,
/// never a partial one.
pub fn run_cancellable(db: &Database, expr: &str, should_cancel: &dyn Fn() -> bool) -> Result<QueryResult> {
    let start = Instant::now();
    match classify(expr) {
        QueryKind::TreeExpr => {
            let parsed = tree::parse(expr)?;
            if should_cancel() {
                return Ok(cancelled_result(expr, CompiledQuery::TreeExpr(parsed), start));
            }
            let nodes = tree::evaluate_cancellable(db, &parsed, should_cancel);
            if should_cancel() {
                return Ok(cancelled_result(expr, CompiledQuery::TreeExpr(parsed), start));
            }
            let results = nodes
                .iter()
                .map(|n| QueryMatch::Node {
                    node_type: n.node_type(),
                    name: n.node_name(db),
                    position: n.node_position(),
                })
                .collect();
            Ok(QueryResult {
                expression: expr.to_string(),
                compiled: CompiledQuery::TreeExpr(parsed),
                duration: start.elapsed(),
                results,
                cancelled: false,
            })
        }
        QueryKind::FilterSubstring | QueryKind::FilterRegex => {
            let evaluator = FilterEvaluator::compile(expr)?;
            let registry = db.registry();
            let mut events: Vec<_> = db
                .zone_indices()
                .iter()
                .flat_map(|z| {
                    let mut v = Vec::new();
                    z.for_each(Time::MIN, Time::MAX, |e| v.push((z.id(), e.clone())));
                    v
                })
                .collect();
            events.sort_by(|a, b| event_order(&a.1, &b.1));

            let mut results = Vec::new();
            for (zone_id, event) in &events {
                if should_cancel() {
                    return Ok(cancelled_result(expr, CompiledQuery::Filter(expr.to_string()), start));
                }
                if event.is_internal() {
                    continue;
                }
                if evaluator.matches(event, registry) {
                    let scope_match = event.flags.contains(EventTypeFlags::SCOPE_ENTER)
                        .then(|| db.zone_index(*zone_id))
                        .flatten()
                        .and_then(|zone| zone.find_scope_by_enter(event.time, event.position).map(|s| (zone, s)));
                    match scope_match {
                        Some((zone, scope_id)) => {
                            let scope = zone.scope(scope_id);
                            results.push(QueryMatch::Scope {
                                zone: *zone_id,
                                scope: scope_id,
                                enter_time: scope.enter.time,
                                leave_time: scope.leave.as_ref().map(|e| e.time),
                            });
                        }
                        None => {
                            results.push(QueryMatch::Event {
                                zone: Some(*zone_id),
                                time: event.time,
                                position: event.position,
                                type_name: registry.get(event.ty).name.to_string(),
                            });
                        }
                    }
                }
            }
            Ok(QueryResult {
                expression: expr.to_string(),
                compiled: CompiledQuery::Filter(expr.to_string()),
                duration: start.elapsed(),
                results,
                cancelled: false,
            })
        }
    }
}

fn cancelled_result(expr: &str, compiled: CompiledQuery, start: Instant) -> QueryResult {
    QueryResult {
        expression: expr.to_string(),
        compiled,
        duration: start.elapsed(),
        results: Vec::new(),
        cancelled: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_substring_filter() {
        assert_eq!(classify("render"), QueryKind::FilterSubstring);
    }

    #[test]
    fn classifies_regex_filter() {
        assert_eq!(classify("/^render/i"), QueryKind::FilterRegex);
    }

    #[test]
    fn classifies_tree_expression() {
        assert_eq!(classify("/zone[@name='Main']/scope"), QueryKind::TreeExpr);
        assert_eq!(classify("//event"), QueryKind::TreeExpr);
    }

    #[test]
    fn classifies_malformed_slash_prefixed_string_as_tree_expr_not_substring() {
        // No known node test and no closing regex delimiter: still
        // routed to the tree-expression parser by syntax alone, which
        // is the one that gets to say it's invalid.
        assert_eq!(classify("/no-closing-slash"), QueryKind::TreeExpr);
    }

    #[test]
    fn a_leading_slash_with_no_valid_path_or_regex_is_an_invalid_query() {
        let db = Database::default();
        let err = run(&db, "/no-closing-slash").unwrap_err();
        assert!(matches!(err, crate::error::TraceDbError::InvalidQuery { .. }));
    }
}
