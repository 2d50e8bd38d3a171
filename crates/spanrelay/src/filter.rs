//! Privacy filtering of span errors.
//!
//! Span errors may carry user data in their messages, so nothing from an
//! error's `Display` output ever reaches the wire. The filter walks the
//! `source()` chain for recognized cause types and emits only fixed,
//! privacy-safe components; an unrecognized error produces no summary at
//! all.

use std::io;

use thiserror::Error;

/// A structured RPC status code recoverable from an error chain.
///
/// Hosts that want status codes surfaced in traces embed this type in their
/// error sources; only the numeric code is forwarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("rpc status {code}")]
pub struct RpcStatus {
    /// Numeric status code.
    pub code: i32,
}

/// Sentinel marking an operation as canceled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Error)]
#[error("operation canceled")]
pub struct Canceled;

/// Status classification of a finished span.
pub(crate) fn span_status(
    error: Option<&(dyn std::error::Error + 'static)>,
    panicked: bool,
) -> Option<&'static str> {
    if panicked {
        return Some("panicked");
    }
    let err = error?;
    if find_cause::<Canceled>(err).is_some() {
        Some("canceled")
    } else {
        Some("errored")
    }
}

/// Builds the privacy-safe error summary for a finished span.
///
/// Returns `None` when nothing recognizable is in the chain; the caller then
/// emits no error tag and no log.
pub fn filter_error(
    error: Option<&(dyn std::error::Error + 'static)>,
    panicked: bool,
) -> Option<String> {
    let mut parts: Vec<String> = Vec::new();
    if panicked {
        parts.push("panicked".to_owned());
    }
    if let Some(err) = error {
        if let Some(status) = find_cause::<RpcStatus>(err) {
            parts.push(format!("rpc status {}", status.code));
        }
        let io_cause = find_cause::<io::Error>(err);
        if let Some(io_err) = io_cause {
            if io_err.kind() == io::ErrorKind::UnexpectedEof {
                parts.push("end of stream".to_owned());
            }
        }
        if find_cause::<Canceled>(err).is_some() {
            parts.push("canceled".to_owned());
        }
        if let Some(io_err) = io_cause {
            if let Some(net) = classify_network(io_err.kind()) {
                parts.push(net.to_owned());
            }
        }
    }
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("; "))
    }
}

fn classify_network(kind: io::ErrorKind) -> Option<&'static str> {
    use io::ErrorKind::*;
    match kind {
        UnexpectedEof => None,
        TimedOut | WouldBlock => Some("encountered a network timeout issue"),
        Interrupted | ConnectionReset | ConnectionAborted | ConnectionRefused | BrokenPipe
        | NotConnected | AddrInUse | AddrNotAvailable => {
            Some("encountered a temporary network issue")
        }
        _ => Some("encountered an unknown network issue"),
    }
}

fn find_cause<'a, T: std::error::Error + 'static>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a T> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<T>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("user data: secret credit card number")]
    struct Opaque;

    #[derive(Debug, Error)]
    #[error("request to /private/path failed")]
    struct Wrapped<E: std::error::Error + 'static> {
        #[source]
        source: E,
    }

    fn wrap<E: std::error::Error + 'static>(source: E) -> Wrapped<E> {
        Wrapped { source }
    }

    #[test]
    fn test_unrecognized_error_yields_no_summary() {
        assert_eq!(filter_error(Some(&Opaque), false), None);
    }

    #[test]
    fn test_panicked_without_error() {
        assert_eq!(filter_error(None, true).as_deref(), Some("panicked"));
    }

    #[test]
    fn test_rpc_status_is_found_through_the_chain() {
        let err = wrap(wrap(RpcStatus { code: 5 }));
        assert_eq!(
            filter_error(Some(&err), false).as_deref(),
            Some("rpc status 5")
        );
    }

    #[test]
    fn test_end_of_stream() {
        let err = wrap(io::Error::new(io::ErrorKind::UnexpectedEof, Opaque));
        assert_eq!(
            filter_error(Some(&err), false).as_deref(),
            Some("end of stream")
        );
    }

    #[test]
    fn test_canceled_sentinel() {
        let err = wrap(Canceled);
        assert_eq!(filter_error(Some(&err), false).as_deref(), Some("canceled"));
    }

    #[test]
    fn test_network_timeout_classification() {
        let err = io::Error::new(io::ErrorKind::TimedOut, Opaque);
        assert_eq!(
            filter_error(Some(&err), false).as_deref(),
            Some("encountered a network timeout issue")
        );
    }

    #[test]
    fn test_network_temporary_classification() {
        let err = io::Error::new(io::ErrorKind::ConnectionReset, Opaque);
        assert_eq!(
            filter_error(Some(&err), false).as_deref(),
            Some("encountered a temporary network issue")
        );
    }

    #[test]
    fn test_network_unknown_classification() {
        let err = io::Error::new(io::ErrorKind::Other, Opaque);
        assert_eq!(
            filter_error(Some(&err), false).as_deref(),
            Some("encountered an unknown network issue")
        );
    }

    #[test]
    fn test_raw_messages_never_forwarded() {
        let err = wrap(io::Error::new(io::ErrorKind::TimedOut, Opaque));
        let summary = filter_error(Some(&err), true).unwrap();
        assert!(!summary.contains("secret"));
        assert!(!summary.contains("/private/path"));
        assert_eq!(summary, "panicked; encountered a network timeout issue");
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(span_status(None, true), Some("panicked"));
        assert_eq!(span_status(Some(&Opaque), true), Some("panicked"));
        assert_eq!(span_status(Some(&wrap(Canceled)), false), Some("canceled"));
        assert_eq!(span_status(Some(&Opaque), false), Some("errored"));
        assert_eq!(span_status(None, false), None);
    }
}
