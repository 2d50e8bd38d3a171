//! Counters observing silent data loss in the pipeline.
//!
//! Silent loss is the expected failure mode of the relay; these counters are
//! how operators see it. The field names of [`MetricsSnapshot`] are a stable
//! monitoring contract and must not be renamed.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Snapshot of relay counters at a point in time.
#[derive(Debug, Clone, Default, Serialize)]
pub struct MetricsSnapshot {
    /// Spans that failed inside the flusher (probe, flush, or send error).
    pub jaeger_span_handling_failure: u64,
    /// Spans dropped because they exceed the per-span byte budget.
    pub jaeger_span_too_large: u64,
    /// Batches refused because their serialized form exceeds the packet size.
    pub jaeger_exceeds_packet_size: u64,
    /// Spans dropped because the submission queue was full.
    pub jaeger_buffer_full: u64,
    /// Tags omitted because their value kind has no wire representation.
    pub failed_to_convert_tag_to_jaeger_format: u64,
}

/// Thread-safe relay counters.
pub struct CollectorMetrics {
    span_handling_failure: AtomicU64,
    span_too_large: AtomicU64,
    exceeds_packet_size: AtomicU64,
    buffer_full: AtomicU64,
    failed_to_convert_tag: AtomicU64,
}

impl Default for CollectorMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CollectorMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CollectorMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl CollectorMetrics {
    /// Creates a new counter set with everything at zero.
    #[must_use]
    pub fn new() -> Self {
        Self {
            span_handling_failure: AtomicU64::new(0),
            span_too_large: AtomicU64::new(0),
            exceeds_packet_size: AtomicU64::new(0),
            buffer_full: AtomicU64::new(0),
            failed_to_convert_tag: AtomicU64::new(0),
        }
    }

    /// Increments the span-handling-failure counter.
    pub fn inc_span_handling_failure(&self) {
        self.span_handling_failure.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the span-too-large counter.
    pub fn inc_span_too_large(&self) {
        self.span_too_large.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the exceeds-packet-size counter.
    pub fn inc_exceeds_packet_size(&self) {
        self.exceeds_packet_size.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the buffer-full counter.
    pub fn inc_buffer_full(&self) {
        self.buffer_full.fetch_add(1, Ordering::Relaxed);
    }

    /// Increments the tag-conversion-failure counter.
    pub fn inc_failed_to_convert_tag(&self) {
        self.failed_to_convert_tag.fetch_add(1, Ordering::Relaxed);
    }

    /// Returns a snapshot of the current counter values.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jaeger_span_handling_failure: self.span_handling_failure.load(Ordering::Relaxed),
            jaeger_span_too_large: self.span_too_large.load(Ordering::Relaxed),
            jaeger_exceeds_packet_size: self.exceeds_packet_size.load(Ordering::Relaxed),
            jaeger_buffer_full: self.buffer_full.load(Ordering::Relaxed),
            failed_to_convert_tag_to_jaeger_format: self.failed_to_convert_tag.load(Ordering::Relaxed),
        }
    }
}
