//! Shaping finished span records into agent wire spans.

use std::time::{SystemTime, UNIX_EPOCH};

use spanrelay_wire as wire;
use tracing::debug;

use crate::filter;
use crate::metrics::CollectorMetrics;
use crate::registry::{AnnotationValue, SpanRecord};
use crate::trace::{PARENT_ID, SAMPLED, TRACE_HOST, TRACE_ID};

/// Metadata keys that travel across process boundaries and are never
/// re-emitted as span tags.
const RESERVED_KEYS: [&str; 4] = [TRACE_ID, PARENT_ID, SAMPLED, TRACE_HOST];

/// Coerces an annotation value into a wire tag value.
///
/// Total on strings, bools, integers, and floats; byte blobs have no wire
/// representation and coerce to `None`.
pub fn coerce_tag_value(value: &AnnotationValue) -> Option<wire::TagValue> {
    match value {
        AnnotationValue::Str(v) => Some(wire::TagValue::Str(v.clone())),
        AnnotationValue::Bool(v) => Some(wire::TagValue::Bool(*v)),
        AnnotationValue::I64(v) => Some(wire::TagValue::I64(*v)),
        AnnotationValue::F64(v) => Some(wire::TagValue::F64(*v)),
        AnnotationValue::Bytes(_) => None,
    }
}

fn micros_since_epoch(t: SystemTime) -> i64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_micros() as i64
}

/// Transforms a finish-time record into the agent's wire form.
///
/// Annotations become tags in recording order, then arguments as `arg_<n>`
/// tags. A root span additionally carries the trace's string metadata
/// (reserved keys excluded), a status tag when the span failed, and an error
/// tag plus log when the privacy filter produced a summary.
pub fn shape_record(record: &SpanRecord, metrics: &CollectorMetrics) -> wire::Span {
    let trace = &record.trace;
    let parent_span_id = record
        .parent_id
        .or_else(|| trace.get_i64(PARENT_ID))
        .unwrap_or(0);

    let mut tags = Vec::with_capacity(record.annotations.len() + record.args.len());
    for annotation in &record.annotations {
        match coerce_tag_value(&annotation.value) {
            Some(value) => tags.push(wire::Tag {
                key: annotation.name.clone(),
                value,
            }),
            None => {
                metrics.inc_failed_to_convert_tag();
                debug!(key = %annotation.name, "failed to convert tag to jaeger format");
            }
        }
    }
    for (idx, arg) in record.args.iter().enumerate() {
        match coerce_tag_value(arg) {
            Some(value) => tags.push(wire::Tag {
                key: format!("arg_{idx}"),
                value,
            }),
            None => {
                metrics.inc_failed_to_convert_tag();
                debug!(index = idx, "failed to convert argument to jaeger format");
            }
        }
    }

    if parent_span_id == 0 {
        let mut meta = trace.string_meta();
        meta.sort();
        for (key, value) in meta {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            tags.push(wire::Tag {
                key,
                value: wire::TagValue::Str(value),
            });
        }
    }

    fn as_dyn_error<'a>(
        e: &'a (dyn std::error::Error + Send + Sync + 'static),
    ) -> &'a (dyn std::error::Error + 'static) {
        e
    }
    let error = record.error.as_deref().map(as_dyn_error);

    if let Some(status) = filter::span_status(error, record.panicked) {
        tags.push(wire::Tag::new("status", status));
    }

    let mut logs = Vec::new();
    if let Some(summary) = filter::filter_error(error, record.panicked) {
        tags.push(wire::Tag::new("error", true));
        logs.push(wire::Log {
            timestamp_us: micros_since_epoch(record.finish),
            fields: vec![wire::Tag::new("error", summary)],
        });
    }

    wire::Span {
        trace_id_low: trace.id(),
        trace_id_high: 0,
        span_id: record.span_id,
        parent_span_id,
        operation_name: record.operation_name.clone(),
        flags: 0,
        start_time_us: micros_since_epoch(record.start),
        duration_us: record
            .finish
            .duration_since(record.start)
            .unwrap_or_default()
            .as_micros() as i64,
        tags,
        logs,
    }
}
