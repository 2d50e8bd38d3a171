//! The per-destination sub-collector: bounded queue, batched flusher, and
//! packet-budget accounting.
//!
//! Each sub-collector owns a fixed-capacity span queue consumed by exactly
//! one flusher task. The flusher accumulates spans into a pending batch under
//! a strict wire-size budget, flushes on size pressure or a jittered timer,
//! and drains the queue on shutdown. Overflow anywhere means dropping spans,
//! never blocking the producer.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use rand_distr::{Distribution, Normal};
use spanrelay_wire as wire;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TrySendError, TryRecvError};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{RelayError, Result};
use crate::metrics::CollectorMetrics;
use crate::transport::{detect_transport, HttpTransport, Transport, TransportKind, UdpTransport};

/// Max bytes of a single UDP datagram the stock agent accepts.
const MAX_PACKET_SIZE_UDP: usize = 1000;
/// Max body bytes for an HTTP collector post.
const MAX_PACKET_SIZE_HTTP: usize = 1_000_000;
/// Fixed envelope cost of an emitBatch call around the span payload.
const EMIT_BATCH_OVERHEAD: usize = 30;
/// Default capacity of the span queue.
const DEFAULT_QUEUE_SIZE: usize = 1000;
/// Default flush interval.
const DEFAULT_FLUSH_INTERVAL: Duration = Duration::from_secs(15);
/// Pre-allocation for the span size probe buffer.
const SPAN_SIZE_ESTIMATE: usize = 600;

/// Configuration of one sub-collector.
///
/// Zero values select the documented defaults, so callers only set what
/// they care about.
#[derive(Debug, Clone)]
pub struct CollectorConfig {
    /// Destination agent address: `host:port` for UDP, a URL for HTTP.
    pub agent_addr: String,
    /// Service name reported in the process descriptor.
    pub service_name: String,
    /// Static process-wide tags.
    pub process_tags: Vec<wire::Tag>,
    /// Per-packet byte ceiling; 0 means the scheme default (1000 UDP,
    /// 1_000_000 HTTP).
    pub packet_size: usize,
    /// Span queue capacity; 0 means 1000.
    pub queue_size: usize,
    /// Flush timer interval; zero means 15 seconds.
    pub flush_interval: Duration,
}

impl CollectorConfig {
    /// Creates a config with all knobs at their defaults.
    pub fn new(agent_addr: impl Into<String>, service_name: impl Into<String>) -> Self {
        Self {
            agent_addr: agent_addr.into(),
            service_name: service_name.into(),
            process_tags: Vec::new(),
            packet_size: 0,
            queue_size: 0,
            flush_interval: Duration::ZERO,
        }
    }
}

/// Pending-batch state shared between the flusher task and the explicit
/// [`SubCollector::flush`] API.
struct Pending {
    spans: Vec<wire::Span>,
    bytes: usize,
    seq_no: i64,
    encode_buf: Vec<u8>,
}

struct FlushState {
    transport: Box<dyn Transport>,
    kind: TransportKind,
    process: wire::Process,
    packet_size: usize,
    max_span_bytes: usize,
    flush_interval: Duration,
    agent_addr: String,
    metrics: Arc<CollectorMetrics>,
    pending: tokio::sync::Mutex<Pending>,
}

impl FlushState {
    /// Adds a probed span to the pending batch, flushing first when the
    /// batch would otherwise exceed the budget.
    async fn handle_span(&self, span: wire::Span, probe: &mut Vec<u8>) -> Result<()> {
        let span_bytes = span.encoded_len(probe);
        if span_bytes > self.max_span_bytes {
            self.metrics.inc_span_too_large();
            return Err(RelayError::SpanTooLarge {
                size: span_bytes,
                max: self.max_span_bytes,
            });
        }

        let mut pending = self.pending.lock().await;
        let mut flush_result = Ok(());
        if pending.bytes + span_bytes > self.max_span_bytes {
            flush_result = self.flush_locked(&mut pending).await;
        }
        pending.bytes += span_bytes;
        pending.spans.push(span);
        flush_result
    }

    async fn flush(&self) -> Result<()> {
        let mut pending = self.pending.lock().await;
        self.flush_locked(&mut pending).await
    }

    /// Sends the pending batch. The buffer and byte counter are reset before
    /// the send completes, so a failed send loses one batch instead of
    /// wedging the flusher.
    async fn flush_locked(&self, pending: &mut Pending) -> Result<()> {
        if pending.spans.is_empty() {
            return Ok(());
        }

        pending.seq_no += 1;
        let batch = wire::Batch {
            process: self.process.clone(),
            spans: std::mem::take(&mut pending.spans),
            seq_no: Some(pending.seq_no),
        };
        pending.bytes = 0;

        pending.encode_buf.clear();
        match self.kind {
            TransportKind::Udp => {
                wire::encode_emit_batch(&batch, pending.seq_no as i32, &mut pending.encode_buf)
            }
            TransportKind::Http => wire::encode_batch(&batch, &mut pending.encode_buf),
        }

        if pending.encode_buf.len() > self.packet_size {
            self.metrics.inc_exceeds_packet_size();
            return Err(RelayError::ExceedsPacketSize {
                size: pending.encode_buf.len(),
                max: self.packet_size,
            });
        }

        let deadline = self.flush_interval;
        match tokio::time::timeout(deadline, self.transport.send(&pending.encode_buf)).await {
            Ok(result) => result,
            Err(_) => Err(RelayError::SendTimeout {
                timeout_ms: deadline.as_millis() as u64,
            }),
        }
    }
}

/// A queue + flusher + transport unit bound to one destination.
///
/// Shared between the routing path and its flusher task; cheap to clone via
/// `Arc`. Construction opens the transport and spawns the flusher, so it
/// must happen within a tokio runtime.
pub struct SubCollector {
    tx: mpsc::Sender<wire::Span>,
    state: Arc<FlushState>,
    cancel: CancellationToken,
    flusher: Mutex<Option<JoinHandle<()>>>,
    metrics: Arc<CollectorMetrics>,
}

impl SubCollector {
    /// Opens the transport for `config` and starts the flusher task.
    ///
    /// Transport failures surface here; once running, all errors are
    /// recovered internally and only visible through [`Self::metrics`].
    pub fn new(config: CollectorConfig, metrics: Arc<CollectorMetrics>) -> Result<Arc<Self>> {
        let kind = detect_transport(&config.agent_addr);
        let packet_size = if config.packet_size == 0 {
            match kind {
                TransportKind::Udp => MAX_PACKET_SIZE_UDP,
                TransportKind::Http => MAX_PACKET_SIZE_HTTP,
            }
        } else {
            config.packet_size
        };
        let queue_size = if config.queue_size == 0 {
            DEFAULT_QUEUE_SIZE
        } else {
            config.queue_size
        };
        let flush_interval = if config.flush_interval.is_zero() {
            DEFAULT_FLUSH_INTERVAL
        } else {
            config.flush_interval
        };

        let transport: Box<dyn Transport> = match kind {
            TransportKind::Udp => Box::new(UdpTransport::open(&config.agent_addr, packet_size)?),
            TransportKind::Http => Box::new(HttpTransport::open(&config.agent_addr)?),
        };

        let process = wire::Process {
            service_name: config.service_name,
            tags: config.process_tags,
        };
        let mut scratch = Vec::with_capacity(SPAN_SIZE_ESTIMATE);
        let process_bytes = process.encoded_len(&mut scratch);
        let max_span_bytes = packet_size.saturating_sub(EMIT_BATCH_OVERHEAD + process_bytes);

        let (tx, rx) = mpsc::channel(queue_size);
        let state = Arc::new(FlushState {
            transport,
            kind,
            process,
            packet_size,
            max_span_bytes,
            flush_interval,
            agent_addr: config.agent_addr,
            metrics: metrics.clone(),
            pending: tokio::sync::Mutex::new(Pending {
                spans: Vec::new(),
                bytes: 0,
                seq_no: 0,
                encode_buf: Vec::new(),
            }),
        });

        let cancel = CancellationToken::new();
        let flusher = tokio::spawn(run_flusher(state.clone(), rx, cancel.clone()));

        Ok(Arc::new(Self {
            tx,
            state,
            cancel,
            flusher: Mutex::new(Some(flusher)),
            metrics,
        }))
    }

    /// Submits a shaped span, never blocking.
    ///
    /// Dropped with a `jaeger_buffer_full` count when the queue is full, and
    /// silently once the collector has shut down.
    pub fn collect(&self, span: wire::Span) {
        if self.cancel.is_cancelled() {
            return;
        }
        match self.tx.try_send(span) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                self.metrics.inc_buffer_full();
                debug!(agent = %self.state.agent_addr, "span queue full, dropping span");
            }
            Err(TrySendError::Closed(_)) => {}
        }
    }

    /// Number of spans currently queued. Exposed for testing.
    pub fn len(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Returns true if no spans are queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sends whatever is pending right now, serialized with the flusher.
    pub async fn flush(&self) -> Result<()> {
        self.state.flush().await
    }

    /// The counters this collector reports into.
    pub fn metrics(&self) -> &Arc<CollectorMetrics> {
        &self.metrics
    }

    /// Destination address this collector ships to.
    pub fn agent_addr(&self) -> &str {
        &self.state.agent_addr
    }

    /// Signals shutdown without waiting. The flusher drains the queue, sends
    /// one final batch, and closes the transport on its own time.
    pub fn close(&self) {
        self.cancel.cancel();
    }

    /// Shuts down and waits for the flusher to finish its drain.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let flusher = self.flusher.lock().unwrap().take();
        if let Some(task) = flusher {
            let _ = task.await;
        }
    }
}

impl std::fmt::Debug for SubCollector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubCollector")
            .field("agent_addr", &self.state.agent_addr)
            .field("queued", &self.len())
            .finish()
    }
}

/// The single consumer of a sub-collector's queue.
async fn run_flusher(
    state: Arc<FlushState>,
    mut rx: mpsc::Receiver<wire::Span>,
    cancel: CancellationToken,
) {
    debug!(agent = %state.agent_addr, "tracing collector started");
    let mut probe = Vec::with_capacity(SPAN_SIZE_ESTIMATE);
    let timer = tokio::time::sleep(jitter(state.flush_interval));
    tokio::pin!(timer);

    loop {
        tokio::select! {
            received = rx.recv() => match received {
                Some(span) => {
                    if let Err(e) = state.handle_span(span, &mut probe).await {
                        state.metrics.inc_span_handling_failure();
                        debug!(agent = %state.agent_addr, error = %e, "failed to handle span");
                    }
                }
                None => {
                    // Every sender is gone; nothing more can arrive.
                    if let Err(e) = state.flush().await {
                        debug!(agent = %state.agent_addr, error = %e, "failed to flush on channel close");
                    }
                    break;
                }
            },
            () = &mut timer => {
                if let Err(e) = state.flush().await {
                    debug!(agent = %state.agent_addr, error = %e, "failed to flush on timer");
                }
                // A fresh deadline each round keeps flushes jittered and
                // cannot leave a stale tick behind.
                timer.as_mut().reset(Instant::now() + jitter(state.flush_interval));
            }
            () = cancel.cancelled() => {
                drain(&state, &mut rx, &mut probe).await;
                if let Err(e) = state.flush().await {
                    debug!(agent = %state.agent_addr, error = %e, "failed to flush on close");
                }
                state.transport.close();
                break;
            }
        }
    }
    debug!(agent = %state.agent_addr, "tracing collector stopped");
}

/// Drains the spans already queued at shutdown, ignoring cancellation.
async fn drain(state: &FlushState, rx: &mut mpsc::Receiver<wire::Span>, probe: &mut Vec<u8>) {
    let left = rx.len();
    for _ in 0..left {
        match rx.try_recv() {
            Ok(span) => {
                if let Err(e) = state.handle_span(span, probe).await {
                    state.metrics.inc_span_handling_failure();
                    debug!(agent = %state.agent_addr, error = %e, "failed to handle span during drain");
                }
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
        }
    }
}

/// Perturbs an interval with a normal distribution (sigma = interval/4),
/// clamped to stay strictly positive.
fn jitter(interval: Duration) -> Duration {
    let mean = interval.as_secs_f64();
    let normal = match Normal::new(mean, mean / 4.0) {
        Ok(n) => n,
        Err(_) => return interval,
    };
    let secs = normal.sample(&mut rand::thread_rng());
    if secs <= 0.0 {
        Duration::from_nanos(1)
    } else {
        Duration::from_secs_f64(secs)
    }
}
