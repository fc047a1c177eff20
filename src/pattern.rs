//! Event-name pattern matching for the Pub/Sub Service.
//!
//! Deliberately hand-written rather than built on a glob crate: the
//! contract here is narrower than what `glob`/`globset` implement — `*`
//! matches within exactly one dot-separated segment and never crosses a
//! `.` boundary, and there is no support for `**`, character classes, or
//! brace expansion. A generic glob engine would silently accept and
//! misinterpret patterns this contract says must behave differently
//! (`state.*` must not match `state.changed.extra`), so matching is
//! implemented directly against the dotted-segment grammar instead.

use std::collections::HashMap;

use serde_json::Value;

use crate::pubsub::types::{Publication, Subscription};

/// A pattern compiled once at subscription-creation time.
///
/// An invalid pattern (currently: one containing an empty segment, e.g.
/// `a..b` or a leading/trailing dot) compiles to [`CompiledPattern::Never`],
/// which matches nothing. This is a deliberate no-panic contract: nothing
/// in this crate rejects a subscription for an unparsable pattern at
/// runtime, it simply never fires.
#[derive(Debug, Clone)]
pub enum CompiledPattern {
    Segments(Vec<SegmentOwned>),
    Never,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentOwned {
    Literal(String),
    Wildcard,
}

/// Compile a dotted-segment glob pattern. Never panics.
pub fn compile_pattern(pattern: &str) -> CompiledPattern {
    if pattern.is_empty() {
        return CompiledPattern::Never;
    }
    let mut segments = Vec::new();
    for raw in pattern.split('.') {
        if raw.is_empty() {
            return CompiledPattern::Never;
        }
        if raw == "*" {
            segments.push(SegmentOwned::Wildcard);
        } else if raw.contains('*') {
            // The grammar only allows a whole-segment `*`; a segment that
            // mixes a literal with a wildcard (e.g. `foo*bar`) is not part
            // of the contract and compiles to "never match".
            return CompiledPattern::Never;
        } else {
            segments.push(SegmentOwned::Literal(raw.to_string()));
        }
    }
    CompiledPattern::Segments(segments)
}

/// Whether `name` satisfies `pattern`, per the dotted-segment single-`*`
/// grammar. Never panics, even on malformed patterns.
pub fn matches_pattern(name: &str, pattern: &str) -> bool {
    let compiled = compile_pattern(pattern);
    matches_compiled(name, &compiled)
}

fn matches_compiled(name: &str, compiled: &CompiledPattern) -> bool {
    let segments = match compiled {
        CompiledPattern::Never => return false,
        CompiledPattern::Segments(s) => s,
    };
    let name_segments: Vec<&str> = name.split('.').collect();
    if name_segments.len() != segments.len() {
        return false;
    }
    name_segments
        .iter()
        .zip(segments.iter())
        .all(|(actual, expected)| match expected {
            SegmentOwned::Wildcard => !actual.is_empty(),
            SegmentOwned::Literal(lit) => actual == lit,
        })
}

/// Whether a publication payload satisfies a subscription's
/// `filter_conditions`: every key in the filter must exist in the payload
/// with an equal value. String/string comparisons are case-insensitive;
/// every other type comparison is strict equality.
fn matches_filter_conditions(
    payload: &HashMap<String, Value>,
    filters: &HashMap<String, Value>,
) -> bool {
    filters.iter().all(|(key, expected)| match payload.get(key) {
        None => false,
        Some(actual) => match (expected, actual) {
            (Value::String(e), Value::String(a)) => e.eq_ignore_ascii_case(a),
            _ => expected == actual,
        },
    })
}

/// Whether `sub` matches `publication`, per all six criteria in §4.2.
pub fn subscription_matches(sub: &Subscription, publication: &Publication) -> bool {
    if !sub.active {
        return false;
    }
    if let Some(publisher_id) = &sub.publisher_agent_id {
        if publisher_id != &publication.publisher_agent_id {
            return false;
        }
    }
    if let Some(publisher_type) = &sub.publisher_agent_type {
        if publisher_type != &publication.publisher_agent_type {
            return false;
        }
    }
    if let Some(kinds) = &sub.publication_types {
        if !kinds.is_empty() && !kinds.contains(&publication.publication_type) {
            return false;
        }
    }
    if !matches_pattern(&publication.event_name, &sub.event_pattern) {
        return false;
    }
    if let Some(filters) = &sub.filter_conditions {
        if !matches_filter_conditions(&publication.payload, filters) {
            return false;
        }
    }
    true
}

/// Returns every publication matched by at least one subscription in
/// `subs`, each appearing at most once, preserving input order.
pub fn filter_publications<'a>(
    pubs: &'a [Publication],
    subs: &[Subscription],
) -> Vec<&'a Publication> {
    pubs.iter()
        .filter(|p| subs.iter().any(|s| subscription_matches(s, p)))
        .collect()
}

/// Returns every subscription in `subs` that matches `publication`.
pub fn matching_subscriptions<'a>(
    publication: &Publication,
    subs: &'a [Subscription],
) -> Vec<&'a Subscription> {
    subs.iter()
        .filter(|s| subscription_matches(s, publication))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn literal_pattern_matches_exact_name_only() {
        assert!(matches_pattern("state.changed", "state.changed"));
        assert!(!matches_pattern("state.changed.extra", "state.changed"));
    }

    #[test]
    fn single_segment_wildcard_does_not_cross_dots() {
        assert!(matches_pattern("state.changed", "state.*"));
        assert!(!matches_pattern("state.changed.extra", "state.*"));
        assert!(matches_pattern("task.completed", "*.completed"));
        assert!(!matches_pattern("task.ignored", "*.completed"));
    }

    #[test]
    fn bare_star_matches_single_segment_names_only() {
        assert!(matches_pattern("x", "*"));
        assert!(!matches_pattern("x.y", "*"));
    }

    #[test]
    fn mid_segment_wildcard_never_matches() {
        assert!(!matches_pattern("foobar", "foo*"));
    }

    #[test]
    fn empty_segments_never_match() {
        assert!(!matches_pattern("a.b", "a..b"));
        assert!(!matches_pattern("a.b", ".a.b"));
    }

    #[test]
    fn deep_pattern_from_spec_scenario() {
        assert!(matches_pattern(
            "zone.north.pump.efficiency",
            "zone.*.pump.efficiency"
        ));
        assert!(!matches_pattern(
            "zone.north.pump.vibration",
            "zone.*.pump.efficiency"
        ));
    }

    #[test]
    fn filter_conditions_are_case_insensitive_for_strings() {
        let payload = HashMap::from([(
            "status".to_string(),
            Value::String("ACTIVE".to_string()),
        )]);
        let filters = HashMap::from([("status".to_string(), Value::String("active".to_string()))]);
        assert!(matches_filter_conditions(&payload, &filters));
    }

    #[test]
    fn filter_conditions_are_strict_for_non_strings() {
        let payload = HashMap::from([("count".to_string(), Value::from(3))]);
        let filters = HashMap::from([("count".to_string(), Value::from(4))]);
        assert!(!matches_filter_conditions(&payload, &filters));
    }
}
