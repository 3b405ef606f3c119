//! Legacy failure vocabulary
//!
//! Older consumers of the web-connectivity control protocol expect a
//! narrower set of failure strings. Each phase (DNS, TCP, HTTP) has its own
//! table. The HTTP table widens every DNS failure into `dns_lookup_error`
//! while the DNS table keeps NXDOMAIN distinct; consumers depend on this
//! asymmetry so it is kept as is.

use super::*;

/// Legacy DNS-phase name error
pub const LEGACY_DNS_NAME_ERROR: &str = "dns_name_error";
/// Legacy DNS-phase server failure
pub const LEGACY_DNS_SERVER_FAILURE: &str = "dns_server_failure";
/// Legacy HTTP-phase DNS failure
pub const LEGACY_DNS_LOOKUP_ERROR: &str = "dns_lookup_error";
/// Legacy connection refused
pub const LEGACY_CONNECTION_REFUSED_ERROR: &str = "connection_refused_error";
/// Legacy catch-all for TCP connect
pub const LEGACY_CONNECT_ERROR: &str = "connect_error";
/// Legacy catch-all
pub const LEGACY_UNKNOWN_ERROR: &str = "unknown_error";

/// Map a DNS-phase failure.
///
/// A lookup without answers is not a failure for the legacy consumer.
pub fn dns_map_failure(failure: Option<&str>) -> Option<String> {
    let mapped = match failure? {
        DNS_NXDOMAIN_ERROR => LEGACY_DNS_NAME_ERROR,
        DNS_NO_ANSWER => return None,
        DNS_NON_RECOVERABLE_FAILURE
        | DNS_REFUSED_ERROR
        | DNS_SERVER_MISBEHAVING
        | DNS_TEMPORARY_FAILURE => LEGACY_DNS_SERVER_FAILURE,
        _ => LEGACY_UNKNOWN_ERROR,
    };
    Some(mapped.to_string())
}

/// Map a TCP-connect failure.
pub fn tcp_map_failure(failure: Option<&str>) -> Option<String> {
    let mapped = match failure? {
        GENERIC_TIMEOUT_ERROR => GENERIC_TIMEOUT_ERROR,
        CONNECTION_REFUSED => LEGACY_CONNECTION_REFUSED_ERROR,
        _ => LEGACY_CONNECT_ERROR,
    };
    Some(mapped.to_string())
}

/// Map an HTTP-phase failure.
///
/// `failed_operation` tells a timeout while resolving the URL host apart
/// from a timeout later in the transaction.
pub fn http_map_failure(failure: Option<&str>, failed_operation: Option<Operation>) -> Option<String> {
    let mapped = match failure? {
        DNS_NXDOMAIN_ERROR
        | DNS_NO_ANSWER
        | DNS_NON_RECOVERABLE_FAILURE
        | DNS_REFUSED_ERROR
        | DNS_SERVER_MISBEHAVING
        | DNS_TEMPORARY_FAILURE => LEGACY_DNS_LOOKUP_ERROR,
        GENERIC_TIMEOUT_ERROR if failed_operation == Some(Operation::Resolve) => {
            LEGACY_DNS_LOOKUP_ERROR
        }
        GENERIC_TIMEOUT_ERROR => GENERIC_TIMEOUT_ERROR,
        CONNECTION_REFUSED => LEGACY_CONNECTION_REFUSED_ERROR,
        _ => LEGACY_UNKNOWN_ERROR,
    };
    Some(mapped.to_string())
}

/// Map an HTTP-phase [`NetError`]
pub fn http_map_net_error(err: Option<&NetError>) -> Option<String> {
    let err = err?;
    http_map_failure(new_failure(Some(err)).as_deref(), Some(err.operation))
}
