//! Traces and their metadata.
//!
//! A trace is a 64-bit id plus a typed metadata map. The reserved string
//! keys are used across service boundaries in network protocols and cannot
//! change.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::registry::SpanObserver;

/// Process-wide unique identifier of a trace root.
pub type TraceId = i64;
/// Identifier of a span, locally unique within its trace.
pub type SpanId = i64;

/// Metadata key carrying the trace id across processes.
pub const TRACE_ID: &str = "trace-id";
/// Metadata key carrying the remote parent's span id.
pub const PARENT_ID: &str = "parent-id";
/// Metadata key carrying the sampling decision.
pub const SAMPLED: &str = "sampled";
/// Metadata key naming the host to send the traces to. If unprovided, the
/// default collector is used.
pub const TRACE_HOST: &str = "trace-host";

/// Internal key holding the sampling observer's callback slot.
pub(crate) const SAMPLED_CALLBACK: &str = "sampled-callback";
/// Internal key marking a trace as already observed by some registrar.
pub(crate) const OBSERVED_MARKER: &str = "observed-marker";
/// Internal key holding propagated B3 flags.
pub(crate) const FLAGS: &str = "flags";

/// Draws a fresh non-negative 63-bit identifier.
pub fn new_id() -> i64 {
    (rand::random::<u64>() >> 1) as i64
}

/// Callback slot stored in trace metadata by a sampling observer.
///
/// Downstream registrars resolve the slot to let the original observer
/// install its finish hook. Held weakly so the slot never keeps an
/// unregistered observer alive.
pub trait SampledCallback: Send + Sync {
    /// Installs the owning observer's finish hook on `trace`.
    fn install(&self, trace: &Arc<Trace>);
}

/// A typed value stored in trace metadata.
#[derive(Clone)]
pub enum MetaValue {
    /// UTF-8 string value.
    Str(String),
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer value.
    I64(i64),
    /// 64-bit float value.
    F64(f64),
    /// Sampling-observer callback slot.
    Callback(Weak<dyn SampledCallback>),
    /// Presence-only marker.
    Marker,
}

impl std::fmt::Debug for MetaValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MetaValue::Str(v) => f.debug_tuple("Str").field(v).finish(),
            MetaValue::Bool(v) => f.debug_tuple("Bool").field(v).finish(),
            MetaValue::I64(v) => f.debug_tuple("I64").field(v).finish(),
            MetaValue::F64(v) => f.debug_tuple("F64").field(v).finish(),
            MetaValue::Callback(_) => f.write_str("Callback(..)"),
            MetaValue::Marker => f.write_str("Marker"),
        }
    }
}

/// A logical end-to-end request identified by a single [`TraceId`].
///
/// Created when the trace is first seen, destroyed when the last span handle
/// drops. Metadata is mutated by the sampling observer on first visit and by
/// context propagation; steady-state reads take the map lock briefly.
pub struct Trace {
    id: TraceId,
    meta: Mutex<HashMap<String, MetaValue>>,
    span_observers: Mutex<Vec<Arc<dyn SpanObserver>>>,
    dispatched: AtomicBool,
}

impl Trace {
    /// Creates a trace with the given id and empty metadata.
    pub fn new(id: TraceId) -> Arc<Self> {
        Arc::new(Self {
            id,
            meta: Mutex::new(HashMap::new()),
            span_observers: Mutex::new(Vec::new()),
            dispatched: AtomicBool::new(false),
        })
    }

    /// The trace identifier.
    pub fn id(&self) -> TraceId {
        self.id
    }

    /// Returns a clone of the value stored under `key`.
    pub fn get(&self, key: &str) -> Option<MetaValue> {
        self.meta.lock().unwrap().get(key).cloned()
    }

    /// Stores `value` under `key`, replacing any previous value.
    pub fn set(&self, key: impl Into<String>, value: MetaValue) {
        self.meta.lock().unwrap().insert(key.into(), value);
    }

    /// Returns the bool stored under `key`, if any.
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        match self.get(key) {
            Some(MetaValue::Bool(v)) => Some(v),
            _ => None,
        }
    }

    /// Returns the i64 stored under `key`, if any.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        match self.get(key) {
            Some(MetaValue::I64(v)) => Some(v),
            _ => None,
        }
    }

    /// Returns the string stored under `key`, if any.
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.get(key) {
            Some(MetaValue::Str(v)) => Some(v),
            _ => None,
        }
    }

    /// Snapshot of all string-valued metadata entries.
    pub fn string_meta(&self) -> Vec<(String, String)> {
        self.meta
            .lock()
            .unwrap()
            .iter()
            .filter_map(|(k, v)| match v {
                MetaValue::Str(s) => Some((k.clone(), s.clone())),
                _ => None,
            })
            .collect()
    }

    /// Installs a finish-time observer for spans of this trace.
    pub fn observe_spans(&self, observer: Arc<dyn SpanObserver>) {
        self.span_observers.lock().unwrap().push(observer);
    }

    pub(crate) fn span_observers(&self) -> Vec<Arc<dyn SpanObserver>> {
        self.span_observers.lock().unwrap().clone()
    }

    /// Marks the trace as dispatched to trace observers.
    ///
    /// Returns true exactly once, for the caller that should dispatch.
    pub(crate) fn mark_dispatched(&self) -> bool {
        !self.dispatched.swap(true, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for Trace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Trace").field("id", &self.id).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_is_non_negative() {
        for _ in 0..64 {
            assert!(new_id() >= 0);
        }
    }

    #[test]
    fn test_meta_typed_accessors() {
        let trace = Trace::new(7);
        trace.set("s", MetaValue::Str("v".into()));
        trace.set("b", MetaValue::Bool(true));
        trace.set("i", MetaValue::I64(-3));
        assert_eq!(trace.get_str("s").as_deref(), Some("v"));
        assert_eq!(trace.get_bool("b"), Some(true));
        assert_eq!(trace.get_i64("i"), Some(-3));
        assert_eq!(trace.get_bool("s"), None);
        assert_eq!(trace.get_str("missing"), None);
    }

    #[test]
    fn test_set_replaces_value() {
        let trace = Trace::new(1);
        trace.set(SAMPLED, MetaValue::Bool(false));
        trace.set(SAMPLED, MetaValue::Bool(true));
        assert_eq!(trace.get_bool(SAMPLED), Some(true));
    }

    #[test]
    fn test_string_meta_skips_non_strings() {
        let trace = Trace::new(1);
        trace.set("foo", MetaValue::Str("bar".into()));
        trace.set("n", MetaValue::I64(1));
        trace.set("m", MetaValue::Marker);
        let meta = trace.string_meta();
        assert_eq!(meta, vec![("foo".to_owned(), "bar".to_owned())]);
    }

    #[test]
    fn test_mark_dispatched_fires_once() {
        let trace = Trace::new(1);
        assert!(trace.mark_dispatched());
        assert!(!trace.mark_dispatched());
    }
}
