#![warn(missing_docs)]

//! Sampling span pipeline shipping traces to Jaeger agents.
//!
//! The relay sits between an in-process span registry and one or more remote
//! trace-aggregation agents. A sampling observer decides per trace whether
//! anything is recorded; finished spans of sampled traces are shaped into the
//! agent's compact wire form, batched under a strict per-packet size
//! envelope, and shipped over UDP datagrams or HTTP posts. Delivery is best
//! effort: queues are bounded, oversized spans and full queues drop data, and
//! counters are how operators see the loss.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use spanrelay::{
//!     register, CollectorConfig, CollectorMetrics, ObserverOptions, Registry, SubCollector,
//! };
//!
//! #[tokio::main]
//! async fn main() -> spanrelay::Result<()> {
//!     let registry = Registry::new();
//!     let collector = SubCollector::new(
//!         CollectorConfig::new("127.0.0.1:6831", "my-service"),
//!         Arc::new(CollectorMetrics::new()),
//!     )?;
//!     let handle = register(
//!         &registry,
//!         collector.clone(),
//!         ObserverOptions {
//!             fraction: 1.0,
//!             ..Default::default()
//!         },
//!     );
//!
//!     let span = registry.start_span("my-service/handle_request", None, None);
//!     span.finish_ok();
//!
//!     handle.unregister();
//!     collector.shutdown().await;
//!     Ok(())
//! }
//! ```

pub mod collector;
pub mod error;
pub mod filter;
pub mod metrics;
pub mod observer;
pub mod pool;
pub mod propagate;
pub mod registry;
pub mod shape;
pub mod trace;
pub mod transport;

pub use collector::{CollectorConfig, SubCollector};
pub use error::{RelayError, Result};
pub use filter::{filter_error, Canceled, RpcStatus};
pub use metrics::{CollectorMetrics, MetricsSnapshot};
pub use observer::{register, ExcludedPredicate, ObserverOptions, SamplingObserver};
pub use pool::{CollectorFactory, CollectorPool, DEFAULT_MAX_HOSTS};
pub use propagate::{remote_trace_handler, HeaderGetter, HeaderSetter, Request};
pub use registry::{
    Annotation, AnnotationValue, RegistrationHandle, Registry, Span, SpanObserver, SpanRecord,
    TraceObserver,
};
pub use shape::{coerce_tag_value, shape_record};
pub use trace::{
    new_id, MetaValue, SampledCallback, SpanId, Trace, TraceId, PARENT_ID, SAMPLED, TRACE_HOST,
    TRACE_ID,
};
pub use transport::{detect_transport, HttpTransport, Transport, TransportKind, UdpTransport};
