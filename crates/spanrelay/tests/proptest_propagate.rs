//! Property tests for B3 header propagation.

use std::collections::HashMap;

use proptest::prelude::*;
use spanrelay::Request;

proptest! {
    /// Any request whose fields are absent or valid 64-bit values survives a
    /// header encode/decode round trip unchanged.
    #[test]
    fn header_roundtrip(
        trace_id in proptest::option::of(any::<i64>()),
        span_id in proptest::option::of(any::<i64>()),
        parent_id in proptest::option::of(any::<i64>()),
        sampled in proptest::option::of(any::<bool>()),
        flags in proptest::option::of(any::<i64>()),
    ) {
        let request = Request { trace_id, span_id, parent_id, sampled, flags };
        let mut headers = HashMap::new();
        request.set_header(&mut headers);
        prop_assert_eq!(Request::from_header(&headers), request);
    }

    /// Malformed header values never panic and read as absent fields.
    #[test]
    fn malformed_headers_are_absent(value in "[^0-9a-fA-F]*") {
        let mut headers = HashMap::new();
        headers.insert("X-B3-TraceId".to_owned(), value.clone());
        headers.insert("X-B3-Sampled".to_owned(), value);
        let request = Request::from_header(&headers);
        prop_assert_eq!(request.trace_id, None);
        prop_assert_eq!(request.sampled, None);
        prop_assert_eq!(request.span_id, None);
    }
}
