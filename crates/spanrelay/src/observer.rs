//! The sampling observer: decides which traces are recorded and feeds their
//! finished spans into the pipeline.
//!
//! The sampling decision is made once per trace, on first sight, and written
//! into trace metadata so every downstream hop sees the same choice. A
//! callback slot in the metadata lets a later registrar hand the trace back
//! to the observer that first saw it, and a marker key guards against two
//! registrars both attaching finish hooks.

use std::sync::{Arc, Mutex, Weak};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use regex::Regex;

use crate::collector::SubCollector;
use crate::metrics::CollectorMetrics;
use crate::pool::{CollectorFactory, CollectorPool};
use crate::registry::{Registry, RegistrationHandle, SpanObserver, SpanRecord, TraceObserver};
use crate::shape::shape_record;
use crate::trace::{
    MetaValue, SampledCallback, Trace, OBSERVED_MARKER, SAMPLED, SAMPLED_CALLBACK, TRACE_HOST,
};

/// Serializes the first-visit critical section across every observer in the
/// process, so concurrent registrars agree on who owns a trace.
static OBSERVE_TRACE_LOCK: Mutex<()> = Mutex::new(());

/// Span-level filter; spans it matches are never shaped.
pub type ExcludedPredicate = Arc<dyn Fn(&SpanRecord) -> bool + Send + Sync>;

/// Configuration for [`register`].
#[derive(Default, Clone)]
pub struct ObserverOptions {
    /// Probability in [0, 1] that a trace without an upstream decision is
    /// sampled.
    pub fraction: f64,
    /// Optional span-level filter bypassing the shaper.
    pub excluded: Option<ExcludedPredicate>,
    /// Optional factory building per-destination sub-collectors.
    pub collector_factory: Option<CollectorFactory>,
    /// Optional allowlist limiting which destination hosts may instantiate
    /// sub-collectors.
    pub host_match: Option<Regex>,
    /// Fixed rng seed for deterministic tests; None seeds from OS entropy.
    pub seed: Option<u64>,
}

impl std::fmt::Debug for ObserverOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObserverOptions")
            .field("fraction", &self.fraction)
            .field("excluded", &self.excluded.is_some())
            .field("collector_factory", &self.collector_factory.is_some())
            .field("host_match", &self.host_match)
            .finish()
    }
}

/// Observes new traces, samples them, and ships their finished spans.
pub struct SamplingObserver {
    fraction: f64,
    excluded: Option<ExcludedPredicate>,
    pool: CollectorPool,
    metrics: Arc<CollectorMetrics>,
    rng: Mutex<StdRng>,
    self_weak: Weak<SamplingObserver>,
}

impl SamplingObserver {
    fn sample(&self) -> bool {
        let draw: f64 = self.rng.lock().unwrap().gen();
        draw < self.fraction
    }
}

impl TraceObserver for SamplingObserver {
    fn observe_trace(&self, trace: &Arc<Trace>) {
        let _guard = OBSERVE_TRACE_LOCK.lock().unwrap();

        // If the trace was sampled upstream by a different observer, the
        // callback slot makes sure a downstream registrar still runs that
        // observer's finish hook.
        if trace.get(SAMPLED_CALLBACK).is_none() {
            let callback: Weak<dyn SampledCallback> = self.self_weak.clone();
            trace.set(SAMPLED_CALLBACK, MetaValue::Callback(callback));
        }

        let sampled = match trace.get_bool(SAMPLED) {
            Some(decision) => decision,
            None => {
                let decision = self.sample();
                trace.set(SAMPLED, MetaValue::Bool(decision));
                decision
            }
        };
        if !sampled {
            return;
        }

        if trace.get(OBSERVED_MARKER).is_some() {
            return;
        }
        trace.set(OBSERVED_MARKER, MetaValue::Marker);

        let installer = match trace.get(SAMPLED_CALLBACK) {
            Some(MetaValue::Callback(weak)) => weak.upgrade(),
            _ => None,
        };
        match installer {
            Some(callback) => callback.install(trace),
            // The slot's observer is gone; attach our own hook instead.
            None => self.install(trace),
        }
    }
}

impl SampledCallback for SamplingObserver {
    fn install(&self, trace: &Arc<Trace>) {
        if let Some(observer) = self.self_weak.upgrade() {
            trace.observe_spans(observer);
        }
    }
}

impl SpanObserver for SamplingObserver {
    fn span_finished(&self, record: &SpanRecord) {
        if let Some(excluded) = &self.excluded {
            if excluded(record) {
                return;
            }
        }
        let span = shape_record(record, &self.metrics);
        let host = record.trace.get_str(TRACE_HOST);
        self.pool.route(host.as_deref()).collect(span);
    }
}

/// Registers a sampling observer on `registry`, shipping spans of sampled
/// traces to `collector` (or to per-destination sub-collectors built by the
/// configured factory).
///
/// Must be called within a tokio runtime. The returned handle tears the
/// observer down; sub-collectors already built keep draining until closed.
pub fn register(
    registry: &Registry,
    collector: Arc<SubCollector>,
    options: ObserverOptions,
) -> RegistrationHandle {
    let metrics = collector.metrics().clone();
    let pool = CollectorPool::new(collector, options.collector_factory, options.host_match);
    let rng = match options.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let observer = Arc::new_cyclic(|self_weak| SamplingObserver {
        fraction: options.fraction,
        excluded: options.excluded,
        pool,
        metrics,
        rng: Mutex::new(rng),
        self_weak: self_weak.clone(),
    });
    registry.observe_traces(observer)
}
