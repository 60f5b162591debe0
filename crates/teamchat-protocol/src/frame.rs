//! The wire envelope carried over the WebSocket connection, and the
//! [`Filter`] predicate used to match inbound frames against pending
//! waiters.

use std::sync::atomic::{AtomicI64, Ordering};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Source tag attached to every outbound frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FrameSource {
    pub name: String,
    pub version: String,
}

impl Default for FrameSource {
    fn default() -> Self {
        Self {
            name: "Teamwork Chat Rust API".into(),
            version: env!("CARGO_PKG_VERSION").into(),
        }
    }
}

/// A single request, response, or push frame exchanged over the socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "contentType")]
    pub content_type: String,
    pub name: String,
    pub contents: Value,
    pub nonce: Option<i64>,
    pub source: FrameSource,
    pub uid: Option<String>,
    #[serde(rename = "nodeId")]
    pub node_id: Option<String>,
}

/// Process-wide... no — per-[`NonceCounter`] monotonic nonce generator.
///
/// Scoped per `Session` rather than globally: a process hosting several
/// sessions gets independent, non-interfering nonce streams.
#[derive(Debug, Default)]
pub struct NonceCounter(AtomicI64);

impl NonceCounter {
    pub fn new() -> Self {
        Self(AtomicI64::new(0))
    }

    pub fn next(&self) -> i64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl Frame {
    /// Build an outbound frame. Pass `nonced = false` for pure fire-and-forget
    /// events that expect no correlated response.
    pub fn new(name: impl Into<String>, contents: Value, nonce: Option<&NonceCounter>) -> Self {
        Self {
            content_type: "object".into(),
            name: name.into(),
            contents,
            nonce: nonce.map(NonceCounter::next),
            source: FrameSource::default(),
            uid: None,
            node_id: None,
        }
    }
}

/// A predicate over an inbound [`Frame`].
///
/// Construct with [`Filter::any`], [`Filter::name`], or the builder methods;
/// combinations are conjunctive (every populated field must match).
#[derive(Debug, Clone, Default)]
pub struct Filter {
    wildcard: bool,
    name: Option<FrameName>,
    nonce: Option<i64>,
    contents: Option<Value>,
}

#[derive(Debug, Clone)]
enum FrameName {
    Exact(String),
    Pattern(regex::Regex),
}

impl Filter {
    /// Matches every frame.
    pub fn any() -> Self {
        Self {
            wildcard: true,
            ..Self::default()
        }
    }

    pub fn name(name: impl Into<String>) -> Self {
        Self {
            name: Some(FrameName::Exact(name.into())),
            ..Self::default()
        }
    }

    pub fn pattern(pattern: regex::Regex) -> Self {
        Self {
            name: Some(FrameName::Pattern(pattern)),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_nonce(mut self, nonce: i64) -> Self {
        self.nonce = Some(nonce);
        self
    }

    #[must_use]
    pub fn with_contents(mut self, contents: Value) -> Self {
        self.contents = Some(contents);
        self
    }

    /// Whether this filter carries no constraint at all. Matching on an
    /// empty, non-wildcard filter is a caller error — listen on
    /// [`Filter::any`] for a generic stream instead.
    pub fn is_empty(&self) -> bool {
        !self.wildcard && self.name.is_none() && self.nonce.is_none() && self.contents.is_none()
    }

    pub fn matches(&self, frame: &Frame) -> bool {
        if self.wildcard {
            return true;
        }
        if let Some(name) = &self.name {
            let matched = match name {
                FrameName::Exact(n) => frame.name == *n,
                FrameName::Pattern(re) => re.is_match(&frame.name),
            };
            if !matched {
                return false;
            }
        }
        if let Some(nonce) = self.nonce
            && frame.nonce != Some(nonce)
        {
            return false;
        }
        if let Some(contents) = &self.contents
            && !is_subset(contents, &frame.contents)
        {
            return false;
        }
        true
    }
}

/// True iff every key/value in `subset` is present and equal in `superset`.
/// Nested objects recurse; arrays compare by value (order-sensitive).
pub fn is_subset(subset: &Value, superset: &Value) -> bool {
    match (subset, superset) {
        (Value::Object(sub), Value::Object(sup)) => sub
            .iter()
            .all(|(k, v)| sup.get(k).is_some_and(|sv| is_subset(v, sv))),
        (Value::Array(sub), Value::Array(sup)) => sub == sup,
        (a, b) => a == b,
    }
}

#[cfg(test)]
mod tests {
    use rstest::rstest;
    use serde_json::json;

    use super::*;

    fn frame(name: &str, nonce: Option<i64>, contents: Value) -> Frame {
        Frame {
            content_type: "object".into(),
            name: name.into(),
            contents,
            nonce,
            source: FrameSource::default(),
            uid: None,
            node_id: None,
        }
    }

    #[test]
    fn nonce_counter_is_monotonic() {
        let counter = NonceCounter::new();
        let a = counter.next();
        let b = counter.next();
        assert!(a < b);
    }

    #[rstest]
    #[case(json!({"roomId":"3735","ids":[488566]}), json!({"roomId":"3735","ids":[488566],"installationId":385654,"shard":7}), true)]
    #[case(json!({"roomId":"3735"}), json!({"ids":[488566]}), false)]
    #[case(json!({"ids":[1,2]}), json!({"ids":[1,2,3]}), false)]
    fn subset_matching(#[case] subset: Value, #[case] superset: Value, #[case] expected: bool) {
        assert_eq!(is_subset(&subset, &superset), expected);
    }

    #[test]
    fn filter_matches_by_name() {
        let f = Filter::name("ping");
        assert!(f.matches(&frame("ping", None, json!({}))));
        assert!(!f.matches(&frame("pong", None, json!({}))));
    }

    #[test]
    fn filter_matches_nonce_by_equality() {
        let f = Filter::name("room.message.created").with_nonce(7);
        assert!(f.matches(&frame("room.message.created", Some(7), json!({}))));
        assert!(!f.matches(&frame("room.message.created", Some(8), json!({}))));
    }

    #[test]
    fn wildcard_matches_anything() {
        let f = Filter::any();
        assert!(f.matches(&frame("anything.at.all", Some(1), json!({"x":1}))));
    }

    #[test]
    fn empty_filter_is_rejected() {
        assert!(Filter::default().is_empty());
        assert!(!Filter::any().is_empty());
    }
}
