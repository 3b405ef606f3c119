//! Error classifiers
//!
//! Each classifier reduces an error to a canonical failure string. The
//! protocol-specific ones look for errors they know about and fall back to
//! [`classify_generic_error`].

use super::*;
use crate::netx::{DnsError, QuicError};
use rustls::{AlertDescription, CertificateError};
use std::net::{IpAddr, SocketAddr};

/// Signature shared by all classifiers
pub type Classifier = fn(&(dyn StdError + 'static)) -> String;

/// Error message suffixes and the failure they map to, checked in order
const SUFFIXES: &[(&str, &str)] = &[
    ("operation was canceled", INTERRUPTED),
    ("EOF", EOF_ERROR),
    ("context deadline exceeded", GENERIC_TIMEOUT_ERROR),
    ("transaction is timed out", GENERIC_TIMEOUT_ERROR),
    ("i/o timeout", GENERIC_TIMEOUT_ERROR),
    ("TLS handshake timeout", GENERIC_TIMEOUT_ERROR),
    ("deadline has elapsed", GENERIC_TIMEOUT_ERROR),
    ("no such host", DNS_NXDOMAIN_ERROR),
    ("server misbehaving", DNS_SERVER_MISBEHAVING),
    ("no answer from DNS server", DNS_NO_ANSWER),
    ("use of closed network connection", CONNECTION_ALREADY_CLOSED),
];

/// OS error strings for errno values `io::ErrorKind` cannot express on
/// our minimum supported toolchain. Matched against the lowercased text.
const OS_MESSAGES: &[(&str, &str)] = &[
    ("network is unreachable", NETWORK_UNREACHABLE),
    ("no route to host", HOST_UNREACHABLE),
    ("host is unreachable", HOST_UNREACHABLE),
    ("network is down", NETWORK_DOWN),
    ("connection timed out", TIMED_OUT),
    ("operation timed out", TIMED_OUT),
    ("socket is already connected", ALREADY_CONNECTED),
    ("transport endpoint is already connected", ALREADY_CONNECTED),
];

/// getaddrinfo messages (`gai_strerror`) on glibc, musl and the BSDs
const GAI_MESSAGES: &[(&str, &str)] = &[
    ("name or service not known", DNS_NXDOMAIN_ERROR),
    ("nodename nor servname provided, or not known", DNS_NXDOMAIN_ERROR),
    ("no address associated with hostname", DNS_NO_ANSWER),
    ("temporary failure in name resolution", DNS_TEMPORARY_FAILURE),
    ("non-recoverable failure in name resolution", DNS_NON_RECOVERABLE_FAILURE),
];

/// Classify any error.
///
/// Already classified errors return their stored failure. Then system
/// errors, then well-known message suffixes. Anything else becomes
/// `unknown_failure: <text>` with IP addresses scrubbed.
pub fn classify_generic_error(err: &(dyn StdError + 'static)) -> String {
    if let Some(net) = find_net_error(err) {
        return net.failure.clone();
    }

    if let Some(io_err) = err.downcast_ref::<io::Error>() {
        if let Some(failure) = classify_io_error(io_err) {
            return failure.to_string();
        }
    }

    let text = err.to_string();
    if let Some(failure) = classify_with_suffix(&text) {
        return failure.to_string();
    }

    scrub(&format!("{UNKNOWN_FAILURE_PREFIX}{text}"))
}

/// Classify resolver errors, including getaddrinfo messages.
pub fn classify_resolver_error(err: &(dyn StdError + 'static)) -> String {
    if let Some(net) = find_net_error(err) {
        return net.failure.clone();
    }

    if let Some(dns) = find_in_chain::<DnsError>(err) {
        return dns.failure().to_string();
    }

    let text = err.to_string().to_lowercase();
    for (needle, failure) in GAI_MESSAGES {
        if text.contains(needle) {
            return (*failure).to_string();
        }
    }

    classify_generic_error(err)
}

/// Classify TLS handshake errors.
pub fn classify_tls_handshake_error(err: &(dyn StdError + 'static)) -> String {
    if let Some(net) = find_net_error(err) {
        return net.failure.clone();
    }

    if let Some(tls) = find_in_chain::<rustls::Error>(err) {
        if let Some(failure) = classify_rustls_error(tls) {
            return failure.to_string();
        }
    }

    classify_generic_error(err)
}

/// Classify QUIC handshake errors.
pub fn classify_quic_handshake_error(err: &(dyn StdError + 'static)) -> String {
    if let Some(net) = find_net_error(err) {
        return net.failure.clone();
    }

    if let Some(quic) = find_in_chain::<QuicError>(err) {
        if let Some(failure) = classify_quic_error(quic) {
            return failure.to_string();
        }
    }

    classify_generic_error(err)
}

fn classify_io_error(err: &io::Error) -> Option<&'static str> {
    use io::ErrorKind;

    let by_kind = match err.kind() {
        ErrorKind::ConnectionRefused => Some(CONNECTION_REFUSED),
        ErrorKind::ConnectionReset => Some(CONNECTION_RESET),
        ErrorKind::ConnectionAborted => Some(CONNECTION_ABORTED),
        ErrorKind::NotConnected => Some(NOT_CONNECTED),
        ErrorKind::AddrInUse => Some(ADDRESS_IN_USE),
        ErrorKind::AddrNotAvailable => Some(ADDRESS_NOT_AVAILABLE),
        ErrorKind::BrokenPipe => Some(BROKEN_PIPE),
        ErrorKind::PermissionDenied => Some(PERMISSION_DENIED),
        ErrorKind::WouldBlock => Some(OPERATION_WOULD_BLOCK),
        ErrorKind::UnexpectedEof => Some(EOF_ERROR),
        ErrorKind::Interrupted => Some(INTERRUPTED),
        ErrorKind::TimedOut if err.raw_os_error().is_some() => Some(TIMED_OUT),
        ErrorKind::TimedOut => Some(GENERIC_TIMEOUT_ERROR),
        _ => None,
    };
    if by_kind.is_some() {
        return by_kind;
    }

    if err.raw_os_error().is_some() {
        let text = err.to_string().to_lowercase();
        for (needle, failure) in OS_MESSAGES {
            if text.contains(needle) {
                return Some(failure);
            }
        }
    }

    None
}

fn classify_with_suffix(text: &str) -> Option<&'static str> {
    SUFFIXES
        .iter()
        .find(|(suffix, _)| text.ends_with(suffix))
        .map(|(_, failure)| *failure)
}

fn classify_rustls_error(err: &rustls::Error) -> Option<&'static str> {
    match err {
        rustls::Error::InvalidCertificate(cert) => Some(match cert {
            CertificateError::NotValidForName => SSL_INVALID_HOSTNAME,
            CertificateError::UnknownIssuer => SSL_UNKNOWN_AUTHORITY,
            _ => SSL_INVALID_CERTIFICATE,
        }),
        rustls::Error::AlertReceived(alert) => classify_tls_alert(*alert),
        rustls::Error::PeerIncompatible(_)
        | rustls::Error::PeerMisbehaved(_)
        | rustls::Error::InappropriateMessage { .. }
        | rustls::Error::InappropriateHandshakeMessage { .. }
        | rustls::Error::NoApplicationProtocol => Some(SSL_FAILED_HANDSHAKE),
        _ => None,
    }
}

fn classify_tls_alert(alert: AlertDescription) -> Option<&'static str> {
    match alert {
        AlertDescription::BadCertificate
        | AlertDescription::UnsupportedCertificate
        | AlertDescription::CertificateRevoked
        | AlertDescription::CertificateExpired
        | AlertDescription::CertificateUnknown => Some(SSL_INVALID_CERTIFICATE),
        AlertDescription::HandshakeFailure | AlertDescription::DecryptError => {
            Some(SSL_FAILED_HANDSHAKE)
        }
        AlertDescription::UnknownCA => Some(SSL_UNKNOWN_AUTHORITY),
        AlertDescription::UnrecognisedName => Some(SSL_INVALID_HOSTNAME),
        _ => None,
    }
}

/// Map a TLS alert code carried by a QUIC CRYPTO_ERROR
fn classify_tls_alert_code(code: u8) -> Option<&'static str> {
    match code {
        42..=46 => Some(SSL_INVALID_CERTIFICATE),
        40 | 51 => Some(SSL_FAILED_HANDSHAKE),
        48 => Some(SSL_UNKNOWN_AUTHORITY),
        112 => Some(SSL_INVALID_HOSTNAME),
        _ => None,
    }
}

fn classify_quic_error(err: &QuicError) -> Option<&'static str> {
    match err {
        QuicError::VersionNegotiation => Some(QUIC_INCOMPATIBLE_VERSION),
        QuicError::StatelessReset => Some(CONNECTION_RESET),
        QuicError::HandshakeTimeout | QuicError::IdleTimeout => Some(GENERIC_TIMEOUT_ERROR),
        QuicError::Crypto { alert } => classify_tls_alert_code(*alert),
        QuicError::Transport { .. } => None,
    }
}

fn find_in_chain<'a, T: StdError + 'static>(err: &'a (dyn StdError + 'static)) -> Option<&'a T> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<T>() {
            return Some(found);
        }
        if let Some(inner) = e.downcast_ref::<io::Error>().and_then(io::Error::get_ref) {
            let inner: &(dyn StdError + 'static) = inner;
            if let Some(found) = find_in_chain::<T>(inner) {
                return Some(found);
            }
        }
        current = e.source();
    }
    None
}

/// Replace IP addresses and endpoints with `[scrubbed]`
pub fn scrub(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut token = String::new();
    for ch in text.chars() {
        if is_address_char(ch) {
            token.push(ch);
            continue;
        }
        flush_token(&mut out, &mut token);
        out.push(ch);
    }
    flush_token(&mut out, &mut token);
    out
}

fn is_address_char(ch: char) -> bool {
    ch.is_ascii_hexdigit() || matches!(ch, '.' | ':' | '[' | ']' | '%')
}

fn flush_token(out: &mut String, token: &mut String) {
    if token.is_empty() {
        return;
    }
    // a trailing ':' or '.' usually belongs to the sentence, not the address
    let trimmed = token.trim_end_matches([':', '.']);
    if looks_like_address(trimmed) {
        out.push_str("[scrubbed]");
        out.push_str(&token[trimmed.len()..]);
    } else {
        out.push_str(token);
    }
    token.clear();
}

fn looks_like_address(candidate: &str) -> bool {
    candidate.parse::<IpAddr>().is_ok() || candidate.parse::<SocketAddr>().is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn io(kind: io::ErrorKind, msg: &str) -> io::Error {
        io::Error::new(kind, msg.to_string())
    }

    #[test]
    fn test_io_kinds() {
        let cases = [
            (io::ErrorKind::ConnectionRefused, CONNECTION_REFUSED),
            (io::ErrorKind::ConnectionReset, CONNECTION_RESET),
            (io::ErrorKind::UnexpectedEof, EOF_ERROR),
            (io::ErrorKind::Interrupted, INTERRUPTED),
            (io::ErrorKind::TimedOut, GENERIC_TIMEOUT_ERROR),
        ];
        for (kind, expected) in cases {
            assert_eq!(classify_generic_error(&io(kind, "x")), expected, "{kind:?}");
        }
    }

    #[test]
    fn test_os_error_kinds() {
        let err = io::Error::from(io::ErrorKind::ConnectionRefused);
        assert_eq!(classify_generic_error(&err), CONNECTION_REFUSED);
    }

    #[test]
    fn test_suffixes() {
        let cases = [
            ("read: operation was canceled", INTERRUPTED),
            ("unexpected EOF", EOF_ERROR),
            ("dial tcp: i/o timeout", GENERIC_TIMEOUT_ERROR),
            ("lookup x: no such host", DNS_NXDOMAIN_ERROR),
            ("lookup x: server misbehaving", DNS_SERVER_MISBEHAVING),
            ("no answer from DNS server", DNS_NO_ANSWER),
            ("write: use of closed network connection", CONNECTION_ALREADY_CLOSED),
        ];
        for (msg, expected) in cases {
            assert_eq!(classify_generic_error(&io(io::ErrorKind::Other, msg)), expected);
        }
    }

    #[test]
    fn test_unknown_failure_is_scrubbed() {
        let err = io(io::ErrorKind::Other, "weird thing from 8.8.4.4:53 happened");
        let failure = classify_generic_error(&err);
        assert_eq!(failure, "unknown_failure: weird thing from [scrubbed] happened");
    }

    #[test]
    fn test_scrub_ipv6() {
        assert_eq!(scrub("peer [2001:db8::1]:443 reset"), "peer [scrubbed] reset");
        assert_eq!(scrub("peer 2001:db8::1."), "peer [scrubbed].");
        assert_eq!(scrub("no address here"), "no address here");
    }

    #[test]
    fn test_resolver_gai_messages() {
        let err = io(
            io::ErrorKind::Other,
            "failed to lookup address information: Name or service not known",
        );
        assert_eq!(classify_resolver_error(&err), DNS_NXDOMAIN_ERROR);

        let err = io(
            io::ErrorKind::Other,
            "failed to lookup address information: Temporary failure in name resolution",
        );
        assert_eq!(classify_resolver_error(&err), DNS_TEMPORARY_FAILURE);
    }

    #[test]
    fn test_resolver_dns_errors() {
        let err = io::Error::new(io::ErrorKind::Other, DnsError::Refused);
        assert_eq!(classify_resolver_error(&err), DNS_REFUSED_ERROR);

        let err = io::Error::new(io::ErrorKind::Other, DnsError::Bogon);
        assert_eq!(classify_resolver_error(&err), DNS_BOGON_ERROR);
    }

    #[test]
    fn test_tls_errors() {
        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(CertificateError::UnknownIssuer),
        );
        assert_eq!(classify_tls_handshake_error(&err), SSL_UNKNOWN_AUTHORITY);

        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(CertificateError::NotValidForName),
        );
        assert_eq!(classify_tls_handshake_error(&err), SSL_INVALID_HOSTNAME);

        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::InvalidCertificate(CertificateError::Expired),
        );
        assert_eq!(classify_tls_handshake_error(&err), SSL_INVALID_CERTIFICATE);

        let err = io::Error::new(
            io::ErrorKind::InvalidData,
            rustls::Error::AlertReceived(AlertDescription::HandshakeFailure),
        );
        assert_eq!(classify_tls_handshake_error(&err), SSL_FAILED_HANDSHAKE);
    }

    #[test]
    fn test_tls_falls_back_to_generic() {
        let err = io::Error::from(io::ErrorKind::ConnectionReset);
        assert_eq!(classify_tls_handshake_error(&err), CONNECTION_RESET);
    }

    #[test]
    fn test_quic_errors() {
        let cases = [
            (QuicError::VersionNegotiation, QUIC_INCOMPATIBLE_VERSION),
            (QuicError::StatelessReset, CONNECTION_RESET),
            (QuicError::IdleTimeout, GENERIC_TIMEOUT_ERROR),
            (QuicError::Crypto { alert: 48 }, SSL_UNKNOWN_AUTHORITY),
            (QuicError::Crypto { alert: 112 }, SSL_INVALID_HOSTNAME),
            (QuicError::Crypto { alert: 44 }, SSL_INVALID_CERTIFICATE),
        ];
        for (err, expected) in cases {
            let err = io::Error::new(io::ErrorKind::Other, err);
            assert_eq!(classify_quic_handshake_error(&err), expected);
        }
    }

    #[test]
    fn test_wrapped_wins_over_protocol() {
        let err = NetError::new(Operation::Resolve, DNS_NXDOMAIN_ERROR).into_io();
        assert_eq!(classify_tls_handshake_error(&err), DNS_NXDOMAIN_ERROR);
    }

    proptest! {
        #[test]
        fn prop_classify_total(msg in ".*") {
            let err = io(io::ErrorKind::Other, &msg);
            let failure = classify_generic_error(&err);
            prop_assert!(!failure.is_empty());
            prop_assert_eq!(failure.clone(), classify_generic_error(&err));
        }

        #[test]
        fn prop_scrub_never_panics(msg in ".*") {
            let _ = scrub(&msg);
        }
    }
}
