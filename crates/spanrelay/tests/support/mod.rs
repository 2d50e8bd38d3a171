//! Shared test support: a mock Jaeger agent on a local UDP port.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use spanrelay_wire as wire;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

/// Opt-in `RUST_LOG` output while debugging test runs.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
}

/// Collects `emitBatch` datagrams the way a real agent would.
pub struct MockAgent {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<(usize, wire::Batch)>>>,
    task: JoinHandle<()>,
}

impl MockAgent {
    /// Binds an ephemeral local port and starts decoding datagrams.
    pub async fn start() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let task = tokio::spawn(async move {
            let mut buf = vec![0u8; 65_535];
            loop {
                match socket.recv(&mut buf).await {
                    Ok(n) => {
                        if let Ok(batch) = wire::decode_emit_batch(&buf[..n]) {
                            sink.lock().unwrap().push((n, batch));
                        }
                    }
                    Err(_) => break,
                }
            }
        });
        Self {
            addr,
            received,
            task,
        }
    }

    /// The `host:port` address of the agent.
    pub fn addr(&self) -> String {
        self.addr.to_string()
    }

    /// Batches received so far.
    pub fn batches(&self) -> Vec<wire::Batch> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(_, b)| b.clone())
            .collect()
    }

    /// Datagram sizes received so far, in arrival order.
    pub fn datagram_sizes(&self) -> Vec<usize> {
        self.received.lock().unwrap().iter().map(|(n, _)| *n).collect()
    }

    /// Polls until at least `n` batches arrived or `timeout` elapsed.
    pub async fn wait_for_batches(&self, n: usize, timeout: Duration) -> Vec<wire::Batch> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let got = self.batches();
            if got.len() >= n || tokio::time::Instant::now() >= deadline {
                return got;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    /// Total spans across all received batches.
    pub fn span_count(&self) -> usize {
        self.received
            .lock()
            .unwrap()
            .iter()
            .map(|(_, b)| b.spans.len())
            .sum()
    }
}

impl Drop for MockAgent {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// A small span with a distinguishable operation name.
pub fn test_span(span_id: i64, operation_name: &str) -> wire::Span {
    wire::Span {
        trace_id_low: spanrelay::new_id(),
        trace_id_high: 0,
        span_id,
        parent_span_id: 0,
        operation_name: operation_name.to_owned(),
        flags: 0,
        start_time_us: 1_600_000_000_000_000,
        duration_us: 1_000_000,
        tags: Vec::new(),
        logs: Vec::new(),
    }
}
