//! Cross-process trace context: B3-style headers and metadata mappings.
//!
//! Two propagation forms exist. Request-style RPC uses the `X-B3-*` headers
//! with hex-encoded signed 64-bit ids. Metadata-style propagation carries
//! the reserved trace keys as decimal strings in an opaque mapping and is
//! parsed by [`remote_trace_handler`].

use std::collections::HashMap;
use std::sync::Arc;

use crate::registry::Span;
use crate::trace::{new_id, MetaValue, SpanId, Trace, FLAGS, PARENT_ID, SAMPLED, TRACE_HOST, TRACE_ID};

/// Header carrying the hex trace id.
pub const HEADER_TRACE_ID: &str = "X-B3-TraceId";
/// Header carrying the hex span id.
pub const HEADER_SPAN_ID: &str = "X-B3-SpanId";
/// Header carrying the hex parent span id.
pub const HEADER_PARENT_SPAN_ID: &str = "X-B3-ParentSpanId";
/// Header carrying the boolean sampling decision.
pub const HEADER_SAMPLED: &str = "X-B3-Sampled";
/// Header carrying the hex flags word.
pub const HEADER_FLAGS: &str = "X-B3-Flags";

/// Read access to a header map. `http::HeaderMap`-style types adapt to this
/// in a line or two.
pub trait HeaderGetter {
    /// Returns the value of `key`, if present.
    fn get(&self, key: &str) -> Option<&str>;
}

/// Write access to a header map.
pub trait HeaderSetter {
    /// Sets `key` to `value`, replacing any previous value.
    fn set(&mut self, key: &str, value: String);
}

impl HeaderGetter for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<&str> {
        HashMap::get(self, key).map(String::as_str)
    }
}

impl HeaderSetter for HashMap<String, String> {
    fn set(&mut self, key: &str, value: String) {
        self.insert(key.to_owned(), value);
    }
}

/// An incoming RPC request's trace context. Every field is optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Request {
    /// Trace identifier.
    pub trace_id: Option<i64>,
    /// Span identifier of the caller.
    pub span_id: Option<i64>,
    /// Parent span identifier.
    pub parent_id: Option<i64>,
    /// Sampling decision.
    pub sampled: Option<bool>,
    /// B3 flags word.
    pub flags: Option<i64>,
}

impl Request {
    /// Parses a request from B3 headers; malformed fields read as absent.
    pub fn from_header(header: &impl HeaderGetter) -> Self {
        Self {
            trace_id: header.get(HEADER_TRACE_ID).and_then(from_hex),
            span_id: header.get(HEADER_SPAN_ID).and_then(from_hex),
            parent_id: header.get(HEADER_PARENT_SPAN_ID).and_then(from_hex),
            sampled: header.get(HEADER_SAMPLED).and_then(|v| v.parse().ok()),
            flags: header.get(HEADER_FLAGS).and_then(from_hex),
        }
    }

    /// Builds the outgoing request for a span.
    ///
    /// Unsampled traces advertise only `sampled=false`, so downstream hops
    /// skip their own shaping without learning anything else.
    pub fn from_span(span: &Span) -> Self {
        let trace = span.trace();
        let sampled = trace.get_bool(SAMPLED).unwrap_or(false);
        if !sampled {
            return Self {
                sampled: Some(false),
                ..Default::default()
            };
        }
        Self {
            trace_id: Some(trace.id()),
            span_id: Some(span.id()),
            parent_id: span.parent_id().or_else(|| trace.get_i64(PARENT_ID)),
            sampled: Some(true),
            flags: Some(trace.get_i64(FLAGS).unwrap_or(0)),
        }
    }

    /// Writes the present fields as B3 headers.
    pub fn set_header(&self, header: &mut impl HeaderSetter) {
        if let Some(trace_id) = self.trace_id {
            header.set(HEADER_TRACE_ID, to_hex(trace_id));
        }
        if let Some(span_id) = self.span_id {
            header.set(HEADER_SPAN_ID, to_hex(span_id));
        }
        if let Some(parent_id) = self.parent_id {
            header.set(HEADER_PARENT_SPAN_ID, to_hex(parent_id));
        }
        if let Some(sampled) = self.sampled {
            header.set(HEADER_SAMPLED, sampled.to_string());
        }
        if let Some(flags) = self.flags {
            header.set(HEADER_FLAGS, to_hex(flags));
        }
    }

    /// Builds a local trace from this request.
    ///
    /// Absent ids are replaced with fresh ones; present fields land in trace
    /// metadata so the sampling observer and shaper see them.
    pub fn trace(&self) -> (Arc<Trace>, SpanId) {
        let trace = Trace::new(self.trace_id.unwrap_or_else(new_id));
        let span_id = self.span_id.unwrap_or_else(new_id);
        if let Some(parent_id) = self.parent_id {
            trace.set(PARENT_ID, MetaValue::I64(parent_id));
        }
        if let Some(sampled) = self.sampled {
            trace.set(SAMPLED, MetaValue::Bool(sampled));
        }
        if let Some(flags) = self.flags {
            trace.set(FLAGS, MetaValue::I64(flags));
        }
        (trace, span_id)
    }
}

/// Builds a trace and parent span id from metadata-style remote context.
///
/// `parent-id` and `trace-id` must parse as decimal signed 64-bit integers
/// and `sampled` as a boolean; any failure means no trace is built. A
/// present `trace-host` is copied into the new trace's metadata.
pub fn remote_trace_handler(remote: &HashMap<String, String>) -> Option<(Arc<Trace>, SpanId)> {
    let parent_id: i64 = remote.get(PARENT_ID)?.parse().ok()?;
    let trace_id: i64 = remote.get(TRACE_ID)?.parse().ok()?;
    let sampled: bool = remote.get(SAMPLED)?.parse().ok()?;

    let trace = Trace::new(trace_id);
    if let Some(host) = remote.get(TRACE_HOST) {
        trace.set(TRACE_HOST, MetaValue::Str(host.clone()));
    }
    trace.set(SAMPLED, MetaValue::Bool(sampled));
    trace.set(PARENT_ID, MetaValue::I64(parent_id));
    Some((trace, parent_id))
}

/// Reads a signed int64 that was formatted as a hex uint64.
fn from_hex(s: &str) -> Option<i64> {
    u64::from_str_radix(s, 16).ok().map(|v| v as i64)
}

/// Writes a signed int64 as a hex uint64.
fn to_hex(v: i64) -> String {
    format!("{:x}", v as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_negative_ids_roundtrip() {
        for v in [0i64, 1, -1, i64::MIN, i64::MAX] {
            assert_eq!(from_hex(&to_hex(v)), Some(v));
        }
    }

    #[test]
    fn test_header_roundtrip() {
        let request = Request {
            trace_id: Some(-42),
            span_id: Some(7),
            parent_id: None,
            sampled: Some(true),
            flags: Some(1),
        };
        let mut headers = HashMap::new();
        request.set_header(&mut headers);
        assert_eq!(Request::from_header(&headers), request);
        assert!(!headers.contains_key(HEADER_PARENT_SPAN_ID));
    }

    #[test]
    fn test_malformed_header_fields_read_as_absent() {
        let mut headers = HashMap::new();
        headers.insert(HEADER_TRACE_ID.to_owned(), "not-hex".to_owned());
        headers.insert(HEADER_SAMPLED.to_owned(), "yes".to_owned());
        let request = Request::from_header(&headers);
        assert_eq!(request.trace_id, None);
        assert_eq!(request.sampled, None);
    }

    #[test]
    fn test_request_trace_sets_metadata() {
        let request = Request {
            trace_id: Some(33),
            span_id: Some(44),
            parent_id: Some(55),
            sampled: Some(true),
            flags: None,
        };
        let (trace, span_id) = request.trace();
        assert_eq!(trace.id(), 33);
        assert_eq!(span_id, 44);
        assert_eq!(trace.get_i64(PARENT_ID), Some(55));
        assert_eq!(trace.get_bool(SAMPLED), Some(true));
    }

    #[test]
    fn test_request_trace_fills_missing_ids() {
        let (trace, span_id) = Request::default().trace();
        assert!(trace.id() >= 0);
        assert!(span_id >= 0);
        assert_eq!(trace.get_bool(SAMPLED), None);
    }

    #[test]
    fn test_remote_trace_handler_happy_path() {
        let mut remote = HashMap::new();
        remote.insert(TRACE_ID.to_owned(), "12345".to_owned());
        remote.insert(PARENT_ID.to_owned(), "678".to_owned());
        remote.insert(SAMPLED.to_owned(), "true".to_owned());
        remote.insert(TRACE_HOST.to_owned(), "agent.example:6831".to_owned());

        let (trace, parent_id) = remote_trace_handler(&remote).unwrap();
        assert_eq!(trace.id(), 12345);
        assert_eq!(parent_id, 678);
        assert_eq!(trace.get_bool(SAMPLED), Some(true));
        assert_eq!(
            trace.get_str(TRACE_HOST).as_deref(),
            Some("agent.example:6831")
        );
    }

    #[test]
    fn test_remote_trace_handler_rejects_malformed_fields() {
        let base: HashMap<String, String> = [
            (TRACE_ID.to_owned(), "1".to_owned()),
            (PARENT_ID.to_owned(), "2".to_owned()),
            (SAMPLED.to_owned(), "false".to_owned()),
        ]
        .into();
        assert!(remote_trace_handler(&base).is_some());

        for (key, bad) in [
            (TRACE_ID, "0x10"),
            (PARENT_ID, "twelve"),
            (SAMPLED, "1"),
        ] {
            let mut remote = base.clone();
            remote.insert(key.to_owned(), bad.to_owned());
            assert!(remote_trace_handler(&remote).is_none(), "{key}={bad}");
        }

        let mut missing = base.clone();
        missing.remove(SAMPLED);
        assert!(remote_trace_handler(&missing).is_none());
    }
}
