//! The span lifecycle seam between a host application and the relay.
//!
//! The relay does not own instrumentation; a host registry does. This module
//! is the narrow interface the relay needs from it: trace observation on
//! first sight, span handles with annotations and arguments, and a
//! finish-time record dispatched to per-trace span observers. The in-repo
//! [`Registry`] is deliberately slim but complete enough to drive the whole
//! pipeline in production or under test.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::SystemTime;

use crate::trace::{new_id, SpanId, Trace};

/// A dynamically typed value attached to a span as an annotation or argument.
///
/// Byte blobs can be recorded locally but have no wire representation; tag
/// coercion drops them and counts the loss.
#[derive(Debug, Clone, PartialEq)]
pub enum AnnotationValue {
    /// UTF-8 string value.
    Str(String),
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer value.
    I64(i64),
    /// 64-bit float value.
    F64(f64),
    /// Raw bytes; not representable on the wire.
    Bytes(Vec<u8>),
}

impl From<&str> for AnnotationValue {
    fn from(v: &str) -> Self {
        AnnotationValue::Str(v.to_owned())
    }
}

impl From<String> for AnnotationValue {
    fn from(v: String) -> Self {
        AnnotationValue::Str(v)
    }
}

impl From<bool> for AnnotationValue {
    fn from(v: bool) -> Self {
        AnnotationValue::Bool(v)
    }
}

impl From<i64> for AnnotationValue {
    fn from(v: i64) -> Self {
        AnnotationValue::I64(v)
    }
}

impl From<f64> for AnnotationValue {
    fn from(v: f64) -> Self {
        AnnotationValue::F64(v)
    }
}

/// A named value recorded on a span while it runs.
#[derive(Debug, Clone, PartialEq)]
pub struct Annotation {
    /// Annotation name; becomes the tag key.
    pub name: String,
    /// Annotation value.
    pub value: AnnotationValue,
}

/// Everything known about a span at finish time.
pub struct SpanRecord {
    /// The trace this span belongs to.
    pub trace: Arc<Trace>,
    /// Span identifier.
    pub span_id: SpanId,
    /// Parent span identifier, if the span had a local parent.
    pub parent_id: Option<SpanId>,
    /// Fully-qualified operation name.
    pub operation_name: String,
    /// Wall-clock start time.
    pub start: SystemTime,
    /// Wall-clock finish time.
    pub finish: SystemTime,
    /// Error the operation finished with, if any.
    pub error: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
    /// Whether the operation panicked.
    pub panicked: bool,
    /// Annotations in recording order.
    pub annotations: Vec<Annotation>,
    /// Call arguments in declaration order.
    pub args: Vec<AnnotationValue>,
}

impl std::fmt::Debug for SpanRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpanRecord")
            .field("trace", &self.trace.id())
            .field("span_id", &self.span_id)
            .field("operation_name", &self.operation_name)
            .field("panicked", &self.panicked)
            .finish()
    }
}

/// Observes traces the first time the registry sees them.
pub trait TraceObserver: Send + Sync {
    /// Called once per trace, before its first span runs.
    fn observe_trace(&self, trace: &Arc<Trace>);
}

/// Observes finished spans of a trace it was installed on.
pub trait SpanObserver: Send + Sync {
    /// Called with the finish-time record of each span.
    fn span_finished(&self, record: &SpanRecord);
}

struct RegistryInner {
    observers: RwLock<Vec<(u64, Arc<dyn TraceObserver>)>>,
    next_registration: AtomicU64,
}

/// Dispatches trace and span lifecycle events to registered observers.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<RegistryInner>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                observers: RwLock::new(Vec::new()),
                next_registration: AtomicU64::new(1),
            }),
        }
    }

    /// Registers a trace observer and returns its unregister handle.
    pub fn observe_traces(&self, observer: Arc<dyn TraceObserver>) -> RegistrationHandle {
        let id = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);
        self.inner.observers.write().unwrap().push((id, observer));
        RegistrationHandle {
            registry: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Starts a span.
    ///
    /// With `trace` absent a fresh root trace is created. The first span
    /// started on a trace dispatches it to every registered trace observer
    /// before the span handle is returned, so finish hooks are in place by
    /// the time the span completes.
    pub fn start_span(
        &self,
        operation_name: impl Into<String>,
        trace: Option<Arc<Trace>>,
        parent_id: Option<SpanId>,
    ) -> Span {
        let trace = trace.unwrap_or_else(|| Trace::new(new_id()));
        if trace.mark_dispatched() {
            let observers = self.inner.observers.read().unwrap().clone();
            for (_, observer) in observers {
                observer.observe_trace(&trace);
            }
        }
        Span {
            trace,
            id: new_id(),
            parent_id,
            operation_name: operation_name.into(),
            start: SystemTime::now(),
            annotations: Mutex::new(Vec::new()),
            args: Mutex::new(Vec::new()),
        }
    }

    /// Starts a child span of `parent` within the same trace.
    pub fn start_child(&self, operation_name: impl Into<String>, parent: &Span) -> Span {
        self.start_span(operation_name, Some(parent.trace.clone()), Some(parent.id))
    }
}

/// Handle returned by [`Registry::observe_traces`]; tears the observer down.
pub struct RegistrationHandle {
    registry: Weak<RegistryInner>,
    id: u64,
}

impl RegistrationHandle {
    /// Removes the observer from the registry.
    ///
    /// Traces observed before unregistration keep their installed finish
    /// hooks; new traces no longer reach the observer.
    pub fn unregister(self) {
        if let Some(inner) = self.registry.upgrade() {
            inner.observers.write().unwrap().retain(|(id, _)| *id != self.id);
        }
    }
}

/// One in-flight operation within a trace.
pub struct Span {
    trace: Arc<Trace>,
    id: SpanId,
    parent_id: Option<SpanId>,
    operation_name: String,
    start: SystemTime,
    annotations: Mutex<Vec<Annotation>>,
    args: Mutex<Vec<AnnotationValue>>,
}

impl Span {
    /// The trace this span belongs to.
    pub fn trace(&self) -> &Arc<Trace> {
        &self.trace
    }

    /// The span identifier.
    pub fn id(&self) -> SpanId {
        self.id
    }

    /// The local parent span id, if any.
    pub fn parent_id(&self) -> Option<SpanId> {
        self.parent_id
    }

    /// The fully-qualified operation name.
    pub fn operation_name(&self) -> &str {
        &self.operation_name
    }

    /// Records a named annotation on the span.
    pub fn annotate(&self, name: impl Into<String>, value: impl Into<AnnotationValue>) {
        self.annotations.lock().unwrap().push(Annotation {
            name: name.into(),
            value: value.into(),
        });
    }

    /// Records a positional call argument on the span.
    pub fn arg(&self, value: impl Into<AnnotationValue>) {
        self.args.lock().unwrap().push(value.into());
    }

    /// Finishes the span successfully.
    pub fn finish_ok(self) {
        self.finish(None, false);
    }

    /// Finishes the span, dispatching its record to the trace's observers.
    pub fn finish(
        self,
        error: Option<Arc<dyn std::error::Error + Send + Sync + 'static>>,
        panicked: bool,
    ) {
        let record = SpanRecord {
            span_id: self.id,
            parent_id: self.parent_id,
            operation_name: self.operation_name,
            start: self.start,
            finish: SystemTime::now(),
            error,
            panicked,
            annotations: self.annotations.into_inner().unwrap(),
            args: self.args.into_inner().unwrap(),
            trace: self.trace,
        };
        for observer in record.trace.span_observers() {
            observer.span_finished(&record);
        }
    }
}

impl std::fmt::Debug for Span {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Span")
            .field("trace", &self.trace.id())
            .field("id", &self.id)
            .field("operation_name", &self.operation_name)
            .finish()
    }
}
