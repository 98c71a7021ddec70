//! Routing rule engine: decides, before a record reaches the dispatch
//! pipeline's primary stage, which target it is headed for and whether it
//! should be dispatched at all.
//!
//! Rules are evaluated first-match-wins against an ordered list; if none
//! match, the configured default rule (if any) applies. A record with no
//! matching rule and no default is dispatched unchanged to its declared
//! `payload_type` handler.

use std::collections::BTreeMap;

use obx_schemas::Record;

/// What a rule matches against.
#[derive(Clone)]
pub enum Selector {
    /// Matches records whose `payload_type` equals this string exactly.
    PayloadType(String),
    /// Matches records carrying this key in their context map, with any
    /// value (or the given value if `Some`).
    ContextKey { key: String, value: Option<String> },
    /// Arbitrary predicate over the record. Used for anything the
    /// declarative selectors above can't express.
    Predicate(fn(&Record) -> bool),
    /// Matches every record; only useful as the final, catch-all rule.
    Always,
}

impl Selector {
    fn matches(&self, record: &Record) -> bool {
        match self {
            Selector::PayloadType(t) => &record.payload_type == t,
            Selector::ContextKey { key, value } => match record.context.get(key) {
                Some(v) => value.as_ref().map(|want| want == v).unwrap_or(true),
                None => false,
            },
            Selector::Predicate(f) => f(record),
            Selector::Always => true,
        }
    }
}

/// Outcome of routing a record: where it goes, under what key, with what
/// extra headers, and whether it should be dispatched at all.
#[derive(Debug, Clone)]
pub struct RoutedRecord {
    pub target: String,
    pub key: String,
    pub headers: BTreeMap<String, String>,
    pub payload: serde_json::Value,
    pub dispatch: bool,
}

/// A single routing rule. `target` is an opaque string interpreted by the
/// handler registry (typically a payload type or handler id); `key_fn`,
/// `headers_fn`, and `payload_fn` default to identity transforms when
/// absent so a rule can override just the piece it cares about.
pub struct RoutingRule {
    pub name: String,
    pub selector: Selector,
    pub target: String,
    pub key_fn: Option<fn(&Record) -> String>,
    pub headers_fn: Option<fn(&Record) -> BTreeMap<String, String>>,
    pub payload_fn: Option<fn(&Record) -> serde_json::Value>,
    /// If `false`, matching records are routed but never dispatched — they
    /// are marked completed without invoking any handler.
    pub dispatch: bool,
}

impl RoutingRule {
    pub fn new(name: impl Into<String>, selector: Selector, target: impl Into<String>) -> Self {
        RoutingRule {
            name: name.into(),
            selector,
            target: target.into(),
            key_fn: None,
            headers_fn: None,
            payload_fn: None,
            dispatch: true,
        }
    }

    pub fn with_key_fn(mut self, f: fn(&Record) -> String) -> Self {
        self.key_fn = Some(f);
        self
    }

    pub fn with_headers_fn(mut self, f: fn(&Record) -> BTreeMap<String, String>) -> Self {
        self.headers_fn = Some(f);
        self
    }

    pub fn with_payload_fn(mut self, f: fn(&Record) -> serde_json::Value) -> Self {
        self.payload_fn = Some(f);
        self
    }

    pub fn filtered_out(mut self) -> Self {
        self.dispatch = false;
        self
    }

    fn apply(&self, record: &Record) -> RoutedRecord {
        RoutedRecord {
            target: self.target.clone(),
            key: self.key_fn.map(|f| f(record)).unwrap_or_else(|| record.key.clone()),
            headers: self.headers_fn.map(|f| f(record)).unwrap_or_default(),
            payload: self.payload_fn.map(|f| f(record)).unwrap_or_else(|| record.payload.clone()),
            dispatch: self.dispatch,
        }
    }
}

/// Ordered set of routing rules plus an optional default applied when
/// nothing else matches.
pub struct RoutingTable {
    rules: Vec<RoutingRule>,
    default: Option<RoutingRule>,
}

impl RoutingTable {
    pub fn new(rules: Vec<RoutingRule>) -> Self {
        RoutingTable { rules, default: None }
    }

    pub fn with_default(mut self, default: RoutingRule) -> Self {
        self.default = Some(default);
        self
    }

    /// Finds the first matching rule, falling back to the default, and
    /// applies it to `record`. Returns `None` only if there is no match
    /// and no default — callers should treat that as "route unchanged".
    pub fn route(&self, record: &Record) -> Option<RoutedRecord> {
        self.rules
            .iter()
            .find(|r| r.selector.matches(record))
            .or(self.default.as_ref())
            .map(|r| r.apply(record))
    }

    /// Routes `record`, falling back to an identity route (dispatch to the
    /// record's own `payload_type`, unchanged key/payload/headers) when no
    /// rule and no default apply.
    pub fn route_or_identity(&self, record: &Record) -> RoutedRecord {
        self.route(record).unwrap_or_else(|| RoutedRecord {
            target: record.payload_type.clone(),
            key: record.key.clone(),
            headers: BTreeMap::new(),
            payload: record.payload.clone(),
            dispatch: true,
        })
    }
}
