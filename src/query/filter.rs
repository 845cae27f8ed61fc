//! The two filter-query evaluators: plain substring and `/regex/flags`.

use regex::{Regex, RegexBuilder};

use crate::error::{Result, TraceDbError};
use crate::event::{Event, EventTypeRegistry};

/// A compiled filter predicate, built once per `query()` call and applied
/// to every non-`INTERNAL` event in time order.
pub enum FilterEvaluator {
    Substring(String),
    Regex(Regex),
}

impl FilterEvaluator {
    pub fn compile(body: &str) -> Result<FilterEvaluator> {
        match parse_regex_literal(body) {
            Some((pattern, flags)) => {
                let mut builder = RegexBuilder::new(pattern);
                builder.case_insensitive(flags.contains('i'));
                builder.multi_line(flags.contains('m'));
                builder.build().map(FilterEvaluator::Regex).map_err(|e| TraceDbError::InvalidQuery {
                    query: body.to_string(),
                    reason: e.to_string(),
                })
            }
            None => Ok(FilterEvaluator::Substring(body.to_lowercase())),
        }
    }

    /// True if the event's type name or any string-valued argument
    /// matches the predicate.
    pub fn matches(&self, event: &Event, registry: &EventTypeRegistry) -> bool {
        let ty = registry.get(event.ty);
        match self {
            FilterEvaluator::Substring(needle) => {
                if ty.name.to_lowercase().contains(needle.as_str()) {
                    return true;
                }
                event.args.iter().any(|v| v.as_filter_text().to_lowercase().contains(needle.as_str()))
            }
            FilterEvaluator::Regex(re) => {
                if re.is_match(&ty.name) {
                    return true;
                }
                event.args.iter().any(|v| re.is_match(&v.as_filter_text()))
            }
        }
    }
}

/// Recognizes a `/pattern/flags` literal and splits it into its pattern
/// and flags. `flags` must be a run of `g`, `i`, `m` with no other
/// characters; `g` is parse-accepted but has no effect (a filter query
/// already returns every match, so "global" is meaningless per event).
/// Unescaped internal `/` must be backslash-escaped, as in a normal regex
/// literal.
fn parse_regex_literal(body: &str) -> Option<(&str, &str)> {
    let rest = body.strip_prefix('/')?;
    let bytes = rest.as_bytes();
    let mut i = 0;
    let mut escaped = false;
    let mut close = None;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if !escaped => escaped = true,
            b'/' if !escaped => {
                close = Some(i);
                break;
            }
            _ => escaped = false,
        }
        i += 1;
    }
    let close = close?;
    let flags = &rest[close + 1..];
    if !flags.chars().all(|c| matches!(c, 'g' | 'i' | 'm')) {
        return None;
    }
    Some((&rest[..close], flags))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{builtin, ArgValue, EventTypeFlags};
    use smallvec::SmallVec;

    fn scope_enter_event(registry: &EventTypeRegistry, arg: &str) -> Event {
        let ty = registry.lookup(builtin::SCOPE_ENTER).unwrap();
        let mut args = SmallVec::<[ArgValue; 4]>::new();
        args.push(ArgValue::Str(arg.into()));
        Event::new(0, ty, None, args, EventTypeFlags::SCOPE_ENTER)
    }

    #[test]
    fn substring_matches_event_name_or_arg() {
        let registry = EventTypeRegistry::new();
        let f = FilterEvaluator::compile("scope#enter").unwrap();
        assert!(f.matches(&scope_enter_event(&registry, "x"), &registry));
        let f = FilterEvaluator::compile("needle").unwrap();
        assert!(f.matches(&scope_enter_event(&registry, "has a needle in it"), &registry));
        assert!(!f.matches(&scope_enter_event(&registry, "nothing"), &registry));
    }

    #[test]
    fn regex_literal_is_parsed_and_compiled() {
        let registry = EventTypeRegistry::new();
        let f = FilterEvaluator::compile("/^has/i").unwrap();
        assert!(f.matches(&scope_enter_event(&registry, "HAS a needle"), &registry));
    }

    #[test]
    fn malformed_regex_is_invalid_query() {
        let err = FilterEvaluator::compile("/[unterminated/").unwrap_err();
        assert!(matches!(err, TraceDbError::InvalidQuery { .. }));
    }

    #[test]
    fn compile_falls_back_to_substring_for_non_regex_bodies() {
        // `FilterEvaluator::compile` is a low-level primitive: it falls
        // back to substring for anything that isn't a `/regex/flags`
        // literal, regardless of a leading slash. `classify` is what
        // keeps a `/`-prefixed, non-regex string out of this path in
        // practice — such strings route to the tree-expression parser
        // instead, which surfaces its own `InvalidQuery` for malformed
        // paths.
        let f = FilterEvaluator::compile("/no-closing-slash").unwrap();
        assert!(matches!(f, FilterEvaluator::Substring(_)));
    }
}
