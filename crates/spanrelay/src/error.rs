//! Error types for the span relay pipeline.
//!
//! Only construction-time failures surface to callers. Everything that can go
//! wrong during steady state is recovered locally: the offending span or
//! batch is dropped, a counter is incremented, and the pipeline keeps going.

use thiserror::Error;

/// Errors produced while building or running a collector.
#[derive(Error, Debug)]
pub enum RelayError {
    /// The configured agent address could not be understood.
    #[error("invalid agent address {addr:?}: {reason}")]
    InvalidAgentAddr {
        /// Address as configured.
        addr: String,
        /// Why it was rejected.
        reason: String,
    },

    /// Opening the transport to the agent failed.
    #[error("failed to open transport to {addr}: {source}")]
    TransportOpen {
        /// Agent address being dialed.
        addr: String,
        /// Underlying I/O failure.
        source: std::io::Error,
    },

    /// A single span's serialized form exceeds the per-span byte budget.
    #[error("span is too large: expected no bigger than {max} bytes, got {size}")]
    SpanTooLarge {
        /// Serialized span length in bytes.
        size: usize,
        /// Per-span byte budget.
        max: usize,
    },

    /// A serialized batch exceeds the configured packet size.
    #[error("batch of {size} bytes exceeds packet size {max}")]
    ExceedsPacketSize {
        /// Serialized batch length in bytes.
        size: usize,
        /// Configured packet size in bytes.
        max: usize,
    },

    /// A transport send did not complete within its deadline.
    #[error("send timed out after {timeout_ms}ms")]
    SendTimeout {
        /// Deadline in milliseconds.
        timeout_ms: u64,
    },

    /// The agent answered an HTTP post with an error status.
    #[error("agent returned HTTP {status}")]
    HttpStatus {
        /// Response status code.
        status: u16,
    },

    /// HTTP client failure.
    #[error("HTTP send failed: {0}")]
    Http(#[from] reqwest::Error),

    /// I/O error from the standard library.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;
