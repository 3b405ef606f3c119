//! Canonical failure vocabulary
//!
//! Every network error observed during a measurement is reduced to one of a
//! small, closed set of strings. Downstream analysis compares these strings,
//! so they are part of the wire contract and must never change.
//!
//! - [`NetError`] is a classified failure plus the operation that failed.
//! - [`classify`] holds the per-operation classifiers.
//! - [`legacy`] re-buckets canonical strings into the legacy vocabulary.

pub mod classify;
pub mod legacy;

pub use classify::{
    classify_generic_error, classify_quic_handshake_error, classify_resolver_error,
    classify_tls_handshake_error, Classifier,
};
pub use legacy::{dns_map_failure, http_map_failure, http_map_net_error, tcp_map_failure};

use serde::{Deserialize, Serialize};
use std::error::Error as StdError;
use std::fmt;
use std::io;

// ============ System call failures ============

/// `EADDRNOTAVAIL`
pub const ADDRESS_NOT_AVAILABLE: &str = "address_not_available";
/// `EADDRINUSE`
pub const ADDRESS_IN_USE: &str = "address_in_use";
/// `EISCONN`
pub const ALREADY_CONNECTED: &str = "already_connected";
/// `ECONNABORTED`
pub const CONNECTION_ABORTED: &str = "connection_aborted";
/// `ECONNREFUSED`
pub const CONNECTION_REFUSED: &str = "connection_refused";
/// `ECONNRESET`
pub const CONNECTION_RESET: &str = "connection_reset";
/// `EHOSTUNREACH`
pub const HOST_UNREACHABLE: &str = "host_unreachable";
/// `EINTR`
pub const INTERRUPTED: &str = "interrupted";
/// `EINVAL`
pub const INVALID_ARGUMENT: &str = "invalid_argument";
/// `ENETDOWN`
pub const NETWORK_DOWN: &str = "network_down";
/// `ENETUNREACH`
pub const NETWORK_UNREACHABLE: &str = "network_unreachable";
/// `ENOTCONN`
pub const NOT_CONNECTED: &str = "not_connected";
/// `EWOULDBLOCK`
pub const OPERATION_WOULD_BLOCK: &str = "operation_would_block";
/// `EACCES`
pub const PERMISSION_DENIED: &str = "permission_denied";
/// `EPIPE`
pub const BROKEN_PIPE: &str = "broken_pipe";
/// `ETIMEDOUT`
pub const TIMED_OUT: &str = "timed_out";

// ============ Library failures ============

/// Writing or reading on a connection we already closed
pub const CONNECTION_ALREADY_CLOSED: &str = "connection_already_closed";
/// A DNS answer contained a bogon address
pub const DNS_BOGON_ERROR: &str = "dns_bogon_error";
/// The resolver returned no usable records
pub const DNS_NO_ANSWER: &str = "dns_no_answer";
/// The resolver says the name does not exist
pub const DNS_NXDOMAIN_ERROR: &str = "dns_nxdomain_error";
/// `EAI_FAIL`
pub const DNS_NON_RECOVERABLE_FAILURE: &str = "dns_non_recoverable_failure";
/// The resolver refused to answer
pub const DNS_REFUSED_ERROR: &str = "dns_refused_error";
/// The reply carried an unexpected query ID
pub const DNS_REPLY_WITH_WRONG_QUERY_ID: &str = "dns_reply_with_wrong_query_ID";
/// The resolver answered with a malformed or unexpected reply
pub const DNS_SERVER_MISBEHAVING: &str = "dns_server_misbehaving";
/// The resolver answered SERVFAIL
pub const DNS_SERVFAIL_ERROR: &str = "dns_servfail_error";
/// `EAI_AGAIN`
pub const DNS_TEMPORARY_FAILURE: &str = "dns_temporary_failure";
/// Peer closed the stream before we expected it
pub const EOF_ERROR: &str = "eof_error";
/// Any deadline or timeout expiring
pub const GENERIC_TIMEOUT_ERROR: &str = "generic_timeout_error";
/// Cannot parse a JSON document
pub const JSON_PARSE_ERROR: &str = "json_parse_error";
/// The QUIC peer does not speak a version we support
pub const QUIC_INCOMPATIBLE_VERSION: &str = "quic_incompatible_version";
/// The TLS handshake failed for reasons other than the certificate
pub const SSL_FAILED_HANDSHAKE: &str = "ssl_failed_handshake";
/// The certificate is not valid for the requested name
pub const SSL_INVALID_HOSTNAME: &str = "ssl_invalid_hostname";
/// The certificate was issued by an unknown authority
pub const SSL_UNKNOWN_AUTHORITY: &str = "ssl_unknown_authority";
/// The certificate is otherwise invalid (expired, malformed, ...)
pub const SSL_INVALID_CERTIFICATE: &str = "ssl_invalid_certificate";
/// Negotiated an ALPN we do not have a transport for
pub const HTTP_UNSUPPORTED_PROTOCOL: &str = "http_unsupported_protocol";

/// Prefix of failures we could not map to a canonical string
pub const UNKNOWN_FAILURE_PREFIX: &str = "unknown_failure: ";

/// The network operation a failure is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Resolving a domain name
    Resolve,
    /// Establishing a TCP connection or a UDP socket
    Connect,
    /// TLS handshake over an established connection
    TlsHandshake,
    /// QUIC handshake
    QuicHandshake,
    /// Whole HTTP round trip, including the body snapshot
    HttpRoundTrip,
    /// Reading from a stream
    Read,
    /// Writing to a stream
    Write,
    /// Reading a datagram
    ReadFrom,
    /// Writing a datagram
    WriteTo,
    /// Closing a connection
    Close,
    /// Failure not attributed to any network primitive
    TopLevel,
}

impl Operation {
    /// Name used inside archival records
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Resolve => "resolve",
            Self::Connect => "connect",
            Self::TlsHandshake => "tls_handshake",
            Self::QuicHandshake => "quic_handshake",
            Self::HttpRoundTrip => "http_round_trip",
            Self::Read => "read",
            Self::Write => "write",
            Self::ReadFrom => "read_from",
            Self::WriteTo => "write_to",
            Self::Close => "close",
            Self::TopLevel => "top_level",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified measurement failure.
///
/// `Display` yields exactly the canonical failure string so that a
/// `NetError` embedded in an [`io::Error`] classifies to itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetError {
    /// Canonical failure string
    pub failure: String,
    /// Operation that failed
    pub operation: Operation,
    /// Text of the underlying error, kept for logging only
    pub detail: String,
}

impl NetError {
    /// Create a failure with no underlying error text
    pub fn new(operation: Operation, failure: impl Into<String>) -> Self {
        let failure = failure.into();
        Self {
            detail: failure.clone(),
            failure,
            operation,
        }
    }

    /// Classify `err` with `classifier` and attribute it to `operation`
    pub fn from_error(
        operation: Operation,
        classifier: Classifier,
        err: &(dyn StdError + 'static),
    ) -> Self {
        Self {
            failure: classifier(err),
            operation,
            detail: err.to_string(),
        }
    }

    /// Shorthand for classifying an [`io::Error`]
    pub fn from_io(operation: Operation, classifier: Classifier, err: &io::Error) -> Self {
        Self::from_error(operation, classifier, err)
    }

    /// Wrap into an [`io::Error`] of a fitting kind
    pub fn into_io(self) -> io::Error {
        let kind = match self.failure.as_str() {
            GENERIC_TIMEOUT_ERROR | TIMED_OUT => io::ErrorKind::TimedOut,
            INTERRUPTED => io::ErrorKind::Interrupted,
            CONNECTION_REFUSED => io::ErrorKind::ConnectionRefused,
            CONNECTION_RESET => io::ErrorKind::ConnectionReset,
            EOF_ERROR => io::ErrorKind::UnexpectedEof,
            _ => io::ErrorKind::Other,
        };
        io::Error::new(kind, self)
    }

    /// The failure string
    pub fn failure(&self) -> &str {
        &self.failure
    }
}

impl fmt::Display for NetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.failure)
    }
}

impl StdError for NetError {}

/// Build the `failure` field of an archival record.
///
/// `None` stays `None`. An empty failure string never escapes: it is
/// replaced by an `unknown_failure` sentinel.
pub fn new_failure(err: Option<&NetError>) -> Option<String> {
    let err = err?;
    if err.failure.is_empty() {
        return Some(format!("{UNKNOWN_FAILURE_PREFIX}failure string is empty"));
    }
    Some(err.failure.clone())
}

/// Classify an arbitrary error into its canonical failure string.
///
/// Total and deterministic. `None` maps to `None`.
pub fn classify(err: Option<&(dyn StdError + 'static)>) -> Option<String> {
    let err = err?;
    let failure = classify_generic_error(err);
    if failure.is_empty() {
        return Some(format!("{UNKNOWN_FAILURE_PREFIX}failure string is empty"));
    }
    Some(failure)
}

/// Attribute an error to an operation and classify it at the same time.
///
/// Already classified errors keep their failure string and operation,
/// except that failures raised outside any primitive (a cancelled context,
/// an expired deadline) are attributed to `operation`.
pub fn new_net_error(operation: Operation, classifier: Classifier, err: &io::Error) -> NetError {
    match find_net_error(err) {
        Some(wrapped) if wrapped.operation == Operation::TopLevel => NetError {
            operation,
            ..wrapped.clone()
        },
        Some(wrapped) => wrapped.clone(),
        None => NetError::from_io(operation, classifier, err),
    }
}

/// Look for an already classified failure in the error chain.
pub(crate) fn find_net_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a NetError> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(net) = e.downcast_ref::<NetError>() {
            return Some(net);
        }
        if let Some(inner) = e.downcast_ref::<io::Error>().and_then(io::Error::get_ref) {
            let inner: &(dyn StdError + 'static) = inner;
            if let Some(net) = find_net_error(inner) {
                return Some(net);
            }
        }
        current = e.source();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_failure_none() {
        assert_eq!(new_failure(None), None);
    }

    #[test]
    fn test_new_failure_some() {
        let err = NetError::new(Operation::Connect, CONNECTION_REFUSED);
        assert_eq!(new_failure(Some(&err)).as_deref(), Some("connection_refused"));
    }

    #[test]
    fn test_new_failure_empty_string() {
        let err = NetError::new(Operation::Connect, "");
        let failure = new_failure(Some(&err)).unwrap();
        assert!(failure.starts_with(UNKNOWN_FAILURE_PREFIX));
    }

    #[test]
    fn test_classify_none() {
        assert_eq!(classify(None), None);
    }

    #[test]
    fn test_display_is_failure() {
        let err = NetError::new(Operation::Resolve, DNS_NXDOMAIN_ERROR);
        assert_eq!(err.to_string(), "dns_nxdomain_error");
        assert_eq!(Operation::Resolve.to_string(), "resolve");
    }

    #[test]
    fn test_wrapped_error_keeps_failure() {
        let inner = NetError::new(Operation::TlsHandshake, SSL_UNKNOWN_AUTHORITY);
        let io_err = inner.clone().into_io();
        let err = new_net_error(Operation::Read, classify_generic_error, &io_err);
        assert_eq!(err, inner);
    }

    #[test]
    fn test_top_level_failure_is_attributed() {
        let io_err = NetError::new(Operation::TopLevel, GENERIC_TIMEOUT_ERROR).into_io();
        let err = new_net_error(Operation::Resolve, classify_generic_error, &io_err);
        assert_eq!(err.operation, Operation::Resolve);
        assert_eq!(err.failure, GENERIC_TIMEOUT_ERROR);
    }

    #[test]
    fn test_into_io_kind() {
        let err = NetError::new(Operation::Connect, GENERIC_TIMEOUT_ERROR).into_io();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }
}
