//! Jaeger agent data model and batch codec.
//!
//! Mirrors the agent's thrift IDL: `Tag`, `Log`, `Span`, `Process`, `Batch`,
//! plus the `emitBatch` one-way envelope a UDP agent consumes. Field ids and
//! type codes are fixed by the agent protocol and must not change.

use crate::protocol::{ctype, CompactReader, CompactWriter, Result, WireError};
use crate::protocol::{MSG_CALL, MSG_ONEWAY, PROTOCOL_ID, VERSION};

/// Method name of the agent's batch ingestion call.
pub const EMIT_BATCH_METHOD: &str = "emitBatch";

const TAG_TYPE_STRING: i32 = 0;
const TAG_TYPE_DOUBLE: i32 = 1;
const TAG_TYPE_BOOL: i32 = 2;
const TAG_TYPE_LONG: i32 = 3;

/// A tag value, shaped per the agent protocol's type codes.
#[derive(Debug, Clone, PartialEq)]
pub enum TagValue {
    /// UTF-8 string value.
    Str(String),
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer value.
    I64(i64),
    /// 64-bit float value.
    F64(f64),
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        TagValue::Str(v.to_owned())
    }
}

impl From<String> for TagValue {
    fn from(v: String) -> Self {
        TagValue::Str(v)
    }
}

impl From<bool> for TagValue {
    fn from(v: bool) -> Self {
        TagValue::Bool(v)
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        TagValue::I64(v)
    }
}

impl From<f64> for TagValue {
    fn from(v: f64) -> Self {
        TagValue::F64(v)
    }
}

/// A key/value annotation attached to a span or process.
#[derive(Debug, Clone, PartialEq)]
pub struct Tag {
    /// Tag key.
    pub key: String,
    /// Typed tag value.
    pub value: TagValue,
}

impl Tag {
    /// Creates a tag from a key and any supported value kind.
    pub fn new(key: impl Into<String>, value: impl Into<TagValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub(crate) fn write(&self, w: &mut CompactWriter<'_>) {
        w.begin_struct();
        w.string_field(1, &self.key);
        match &self.value {
            TagValue::Str(s) => {
                w.i32_field(2, TAG_TYPE_STRING);
                w.string_field(3, s);
            }
            TagValue::F64(v) => {
                w.i32_field(2, TAG_TYPE_DOUBLE);
                w.double_field(4, *v);
            }
            TagValue::Bool(b) => {
                w.i32_field(2, TAG_TYPE_BOOL);
                w.bool_field(5, *b);
            }
            TagValue::I64(v) => {
                w.i32_field(2, TAG_TYPE_LONG);
                w.i64_field(6, *v);
            }
        }
        w.end_struct();
    }

    pub(crate) fn read(r: &mut CompactReader<'_>) -> Result<Tag> {
        let mut key = String::new();
        let mut vtype = TAG_TYPE_STRING;
        let mut vstr = None;
        let mut vdouble = None;
        let mut vbool = None;
        let mut vlong = None;

        r.begin_struct();
        while let Some((id, ty)) = r.read_field_header()? {
            match id {
                1 => key = r.read_string()?,
                2 => vtype = r.read_i32()?,
                3 => vstr = Some(r.read_string()?),
                4 => vdouble = Some(r.read_double()?),
                5 => vbool = Some(ty == ctype::BOOL_TRUE),
                6 => vlong = Some(r.read_i64()?),
                _ => r.skip(ty)?,
            }
        }
        r.end_struct();

        let value = match vtype {
            TAG_TYPE_STRING => TagValue::Str(vstr.unwrap_or_default()),
            TAG_TYPE_DOUBLE => TagValue::F64(vdouble.unwrap_or_default()),
            TAG_TYPE_BOOL => TagValue::Bool(vbool.unwrap_or_default()),
            TAG_TYPE_LONG => TagValue::I64(vlong.unwrap_or_default()),
            _ => return Err(WireError::Malformed("unsupported tag type")),
        };
        Ok(Tag { key, value })
    }
}

/// A timestamped set of fields attached to a span.
#[derive(Debug, Clone, PartialEq)]
pub struct Log {
    /// Microseconds since the epoch.
    pub timestamp_us: i64,
    /// Fields recorded at that instant.
    pub fields: Vec<Tag>,
}

impl Log {
    pub(crate) fn write(&self, w: &mut CompactWriter<'_>) {
        w.begin_struct();
        w.i64_field(1, self.timestamp_us);
        w.list_field(2, ctype::STRUCT, self.fields.len());
        for f in &self.fields {
            f.write(w);
        }
        w.end_struct();
    }

    pub(crate) fn read(r: &mut CompactReader<'_>) -> Result<Log> {
        let mut timestamp_us = 0;
        let mut fields = Vec::new();
        r.begin_struct();
        while let Some((id, ty)) = r.read_field_header()? {
            match id {
                1 => timestamp_us = r.read_i64()?,
                2 => {
                    let (_, size) = r.read_list_header()?;
                    fields.reserve(size);
                    for _ in 0..size {
                        fields.push(Tag::read(r)?);
                    }
                }
                _ => r.skip(ty)?,
            }
        }
        r.end_struct();
        Ok(Log {
            timestamp_us,
            fields,
        })
    }
}

/// One finished operation within a trace, in agent wire form.
#[derive(Debug, Clone, PartialEq)]
pub struct Span {
    /// Low 64 bits of the trace id.
    pub trace_id_low: i64,
    /// High 64 bits of the trace id; always 0 for this relay.
    pub trace_id_high: i64,
    /// Span id, locally unique within the trace.
    pub span_id: i64,
    /// Parent span id; 0 means no parent.
    pub parent_span_id: i64,
    /// Fully-qualified operation name.
    pub operation_name: String,
    /// Agent span flags.
    pub flags: i32,
    /// Start time in microseconds since the epoch.
    pub start_time_us: i64,
    /// Duration in microseconds.
    pub duration_us: i64,
    /// Span tags, in emission order.
    pub tags: Vec<Tag>,
    /// Span logs, in emission order.
    pub logs: Vec<Log>,
}

impl Span {
    pub(crate) fn write(&self, w: &mut CompactWriter<'_>) {
        w.begin_struct();
        w.i64_field(1, self.trace_id_low);
        w.i64_field(2, self.trace_id_high);
        w.i64_field(3, self.span_id);
        w.i64_field(4, self.parent_span_id);
        w.string_field(5, &self.operation_name);
        w.i32_field(7, self.flags);
        w.i64_field(8, self.start_time_us);
        w.i64_field(9, self.duration_us);
        if !self.tags.is_empty() {
            w.list_field(10, ctype::STRUCT, self.tags.len());
            for t in &self.tags {
                t.write(w);
            }
        }
        if !self.logs.is_empty() {
            w.list_field(11, ctype::STRUCT, self.logs.len());
            for l in &self.logs {
                l.write(w);
            }
        }
        w.end_struct();
    }

    pub(crate) fn read(r: &mut CompactReader<'_>) -> Result<Span> {
        let mut span = Span {
            trace_id_low: 0,
            trace_id_high: 0,
            span_id: 0,
            parent_span_id: 0,
            operation_name: String::new(),
            flags: 0,
            start_time_us: 0,
            duration_us: 0,
            tags: Vec::new(),
            logs: Vec::new(),
        };
        r.begin_struct();
        while let Some((id, ty)) = r.read_field_header()? {
            match id {
                1 => span.trace_id_low = r.read_i64()?,
                2 => span.trace_id_high = r.read_i64()?,
                3 => span.span_id = r.read_i64()?,
                4 => span.parent_span_id = r.read_i64()?,
                5 => span.operation_name = r.read_string()?,
                7 => span.flags = r.read_i32()?,
                8 => span.start_time_us = r.read_i64()?,
                9 => span.duration_us = r.read_i64()?,
                10 => {
                    let (_, size) = r.read_list_header()?;
                    span.tags.reserve(size);
                    for _ in 0..size {
                        span.tags.push(Tag::read(r)?);
                    }
                }
                11 => {
                    let (_, size) = r.read_list_header()?;
                    span.logs.reserve(size);
                    for _ in 0..size {
                        span.logs.push(Log::read(r)?);
                    }
                }
                _ => r.skip(ty)?,
            }
        }
        r.end_struct();
        Ok(span)
    }

    /// Serialized length of this span, using a caller-owned scratch buffer.
    ///
    /// The scratch is cleared and reused so probing never touches the
    /// outbound buffer.
    pub fn encoded_len(&self, scratch: &mut Vec<u8>) -> usize {
        scratch.clear();
        let mut w = CompactWriter::new(scratch);
        self.write(&mut w);
        scratch.len()
    }
}

/// The immutable descriptor of the process emitting spans.
#[derive(Debug, Clone, PartialEq)]
pub struct Process {
    /// Service name reported to the agent.
    pub service_name: String,
    /// Static process-wide tag set.
    pub tags: Vec<Tag>,
}

impl Process {
    pub(crate) fn write(&self, w: &mut CompactWriter<'_>) {
        w.begin_struct();
        w.string_field(1, &self.service_name);
        if !self.tags.is_empty() {
            w.list_field(2, ctype::STRUCT, self.tags.len());
            for t in &self.tags {
                t.write(w);
            }
        }
        w.end_struct();
    }

    pub(crate) fn read(r: &mut CompactReader<'_>) -> Result<Process> {
        let mut process = Process {
            service_name: String::new(),
            tags: Vec::new(),
        };
        r.begin_struct();
        while let Some((id, ty)) = r.read_field_header()? {
            match id {
                1 => process.service_name = r.read_string()?,
                2 => {
                    let (_, size) = r.read_list_header()?;
                    process.tags.reserve(size);
                    for _ in 0..size {
                        process.tags.push(Tag::read(r)?);
                    }
                }
                _ => r.skip(ty)?,
            }
        }
        r.end_struct();
        Ok(process)
    }

    /// Serialized length of this process descriptor.
    pub fn encoded_len(&self, scratch: &mut Vec<u8>) -> usize {
        scratch.clear();
        let mut w = CompactWriter::new(scratch);
        self.write(&mut w);
        scratch.len()
    }
}

/// A group of spans flushed to one destination under a sequence number.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// Shared process descriptor.
    pub process: Process,
    /// Spans in queue-arrival order.
    pub spans: Vec<Span>,
    /// Monotonic per-collector batch sequence number.
    pub seq_no: Option<i64>,
}

impl Batch {
    pub(crate) fn write(&self, w: &mut CompactWriter<'_>) {
        w.begin_struct();
        w.struct_field(1);
        self.process.write(w);
        w.list_field(2, ctype::STRUCT, self.spans.len());
        for s in &self.spans {
            s.write(w);
        }
        if let Some(seq) = self.seq_no {
            w.i64_field(3, seq);
        }
        w.end_struct();
    }

    pub(crate) fn read(r: &mut CompactReader<'_>) -> Result<Batch> {
        let mut process = None;
        let mut spans = Vec::new();
        let mut seq_no = None;
        r.begin_struct();
        while let Some((id, ty)) = r.read_field_header()? {
            match id {
                1 => process = Some(Process::read(r)?),
                2 => {
                    let (_, size) = r.read_list_header()?;
                    spans.reserve(size);
                    for _ in 0..size {
                        spans.push(Span::read(r)?);
                    }
                }
                3 => seq_no = Some(r.read_i64()?),
                _ => r.skip(ty)?,
            }
        }
        r.end_struct();
        Ok(Batch {
            process: process.ok_or(WireError::Malformed("batch missing process"))?,
            spans,
            seq_no,
        })
    }
}

/// Encodes a bare `Batch` struct, the body an HTTP collector endpoint accepts.
pub fn encode_batch(batch: &Batch, buf: &mut Vec<u8>) {
    let mut w = CompactWriter::new(buf);
    batch.write(&mut w);
}

/// Decodes a bare `Batch` struct.
pub fn decode_batch(data: &[u8]) -> Result<Batch> {
    let mut r = CompactReader::new(data);
    Batch::read(&mut r)
}

/// Encodes a one-way `emitBatch` call, the datagram body a UDP agent accepts.
pub fn encode_emit_batch(batch: &Batch, seq_id: i32, buf: &mut Vec<u8>) {
    let mut w = CompactWriter::new(buf);
    w.write_byte(PROTOCOL_ID);
    w.write_byte((VERSION & 0x1F) | (MSG_ONEWAY << 5));
    w.write_varint(seq_id as u32 as u64);
    w.write_string(EMIT_BATCH_METHOD);
    w.begin_struct();
    w.struct_field(1);
    batch.write(&mut w);
    w.end_struct();
}

/// Decodes an `emitBatch` call envelope back into its batch argument.
pub fn decode_emit_batch(data: &[u8]) -> Result<Batch> {
    let mut r = CompactReader::new(data);
    if r.read_byte()? != PROTOCOL_ID {
        return Err(WireError::Malformed("bad protocol id"));
    }
    let type_byte = r.read_byte()?;
    if type_byte & 0x1F != VERSION {
        return Err(WireError::Malformed("unsupported protocol version"));
    }
    let msg_type = (type_byte >> 5) & 0x07;
    if msg_type != MSG_CALL && msg_type != MSG_ONEWAY {
        return Err(WireError::Malformed("unexpected message type"));
    }
    let _seq_id = r.read_varint()?;
    if r.read_string()? != EMIT_BATCH_METHOD {
        return Err(WireError::Malformed("unexpected method"));
    }

    let mut batch = None;
    r.begin_struct();
    while let Some((id, ty)) = r.read_field_header()? {
        match id {
            1 => batch = Some(Batch::read(&mut r)?),
            _ => r.skip(ty)?,
        }
    }
    r.end_struct();
    batch.ok_or(WireError::Malformed("missing batch argument"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_span() -> Span {
        Span {
            trace_id_low: 0x1234_5678_9abc_def0u64 as i64,
            trace_id_high: 0,
            span_id: 42,
            parent_span_id: 7,
            operation_name: "svc/op".to_owned(),
            flags: 0,
            start_time_us: 1_600_000_000_000_000,
            duration_us: 1500,
            tags: vec![
                Tag::new("str", "v"),
                Tag::new("flag", true),
                Tag::new("count", 9i64),
                Tag::new("ratio", 0.25f64),
            ],
            logs: vec![Log {
                timestamp_us: 1_600_000_000_001_500,
                fields: vec![Tag::new("error", "end of stream")],
            }],
        }
    }

    fn sample_batch() -> Batch {
        Batch {
            process: Process {
                service_name: "relay-test".to_owned(),
                tags: vec![Tag::new("region", "local")],
            },
            spans: vec![sample_span()],
            seq_no: Some(3),
        }
    }

    #[test]
    fn test_tag_roundtrip_all_kinds() {
        for tag in [
            Tag::new("a", "text"),
            Tag::new("b", false),
            Tag::new("c", -88i64),
            Tag::new("d", 2.5f64),
        ] {
            let mut buf = Vec::new();
            let mut w = CompactWriter::new(&mut buf);
            tag.write(&mut w);
            let mut r = CompactReader::new(&buf);
            assert_eq!(Tag::read(&mut r).unwrap(), tag);
        }
    }

    #[test]
    fn test_span_roundtrip() {
        let span = sample_span();
        let mut buf = Vec::new();
        let mut w = CompactWriter::new(&mut buf);
        span.write(&mut w);
        let mut r = CompactReader::new(&buf);
        assert_eq!(Span::read(&mut r).unwrap(), span);
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn test_span_without_tags_or_logs() {
        let mut span = sample_span();
        span.tags.clear();
        span.logs.clear();
        let mut buf = Vec::new();
        let mut w = CompactWriter::new(&mut buf);
        span.write(&mut w);
        let mut r = CompactReader::new(&buf);
        assert_eq!(Span::read(&mut r).unwrap(), span);
    }

    #[test]
    fn test_batch_roundtrip() {
        let batch = sample_batch();
        let mut buf = Vec::new();
        encode_batch(&batch, &mut buf);
        assert_eq!(decode_batch(&buf).unwrap(), batch);
    }

    #[test]
    fn test_emit_batch_envelope_roundtrip() {
        let batch = sample_batch();
        let mut buf = Vec::new();
        encode_emit_batch(&batch, 17, &mut buf);
        assert_eq!(decode_emit_batch(&buf).unwrap(), batch);
    }

    #[test]
    fn test_emit_batch_rejects_wrong_method() {
        let mut buf = Vec::new();
        let mut w = CompactWriter::new(&mut buf);
        w.write_byte(0x82);
        w.write_byte(0x81);
        w.write_varint(1);
        w.write_string("somethingElse");
        assert!(decode_emit_batch(&buf).is_err());
    }

    #[test]
    fn test_probe_length_matches_encoded_length() {
        let span = sample_span();
        let mut scratch = Vec::new();
        let probed = span.encoded_len(&mut scratch);

        let mut out = Vec::new();
        let mut w = CompactWriter::new(&mut out);
        span.write(&mut w);
        assert_eq!(probed, out.len());

        // Probing again with a dirty scratch gives the same answer.
        assert_eq!(span.encoded_len(&mut scratch), probed);
    }

    #[test]
    fn test_large_batch_uses_long_list_form() {
        let mut batch = sample_batch();
        batch.spans = (0..40)
            .map(|i| {
                let mut s = sample_span();
                s.span_id = i;
                s.tags.clear();
                s.logs.clear();
                s
            })
            .collect();
        let mut buf = Vec::new();
        encode_batch(&batch, &mut buf);
        let decoded = decode_batch(&buf).unwrap();
        assert_eq!(decoded.spans.len(), 40);
        assert_eq!(decoded.spans[39].span_id, 39);
    }
}
