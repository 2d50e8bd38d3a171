#![warn(missing_docs)]

//! Spanrelay wire subsystem: the Jaeger agent's data model and a hand-rolled
//! Thrift compact-protocol codec.
//!
//! The agent side of Jaeger speaks the Thrift compact protocol. This crate
//! carries just enough of it for the relay: the span/batch model, the
//! `emitBatch` one-way envelope a UDP agent expects, and a size probe so the
//! flusher can account for serialized bytes before committing a span to the
//! outbound buffer.

pub mod model;
pub mod protocol;

pub use model::{
    decode_batch, decode_emit_batch, encode_batch, encode_emit_batch, Batch, Log, Process, Span,
    Tag, TagValue, EMIT_BATCH_METHOD,
};
pub use protocol::{CompactReader, CompactWriter, Result, WireError};
