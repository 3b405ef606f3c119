//! Archival data model
//!
//! Plain records describing what happened on the wire, in the shape the
//! measurement JSON format expects. Timestamps are seconds relative to the
//! zero time of the measurement. `failure` is either `null` or a canonical
//! failure string, never an empty string.

mod builders;

pub use builders::*;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::de::Deserializer;
use serde::ser::{SerializeStruct, Serializer};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Operation name of cumulative bytes-received samples
pub const BYTES_RECEIVED_CUMULATIVE_OPERATION: &str = "bytes_received_cumulative";

fn is_zero_i64(value: &i64) -> bool {
    *value == 0
}

fn is_zero_f64(value: &f64) -> bool {
    *value == 0.0
}

/// Bytes that serialize as a string when they are valid UTF-8 and as a
/// `{"data": <base64>, "format": "base64"}` object otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MaybeBinaryValue(pub Vec<u8>);

impl MaybeBinaryValue {
    /// Borrow the raw bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Length in bytes
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether there are no bytes
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for MaybeBinaryValue {
    fn from(value: &str) -> Self {
        Self(value.as_bytes().to_vec())
    }
}

impl From<String> for MaybeBinaryValue {
    fn from(value: String) -> Self {
        Self(value.into_bytes())
    }
}

impl From<Vec<u8>> for MaybeBinaryValue {
    fn from(value: Vec<u8>) -> Self {
        Self(value)
    }
}

impl Serialize for MaybeBinaryValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match std::str::from_utf8(&self.0) {
            Ok(text) => serializer.serialize_str(text),
            Err(_) => BinaryData(self.0.clone()).serialize(serializer),
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MaybeBinaryRepr {
    Text(String),
    Binary(BinaryData),
}

impl<'de> Deserialize<'de> for MaybeBinaryValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(match MaybeBinaryRepr::deserialize(deserializer)? {
            MaybeBinaryRepr::Text(text) => Self(text.into_bytes()),
            MaybeBinaryRepr::Binary(data) => Self(data.0),
        })
    }
}

/// Bytes that always serialize as `{"data": <base64>, "format": "base64"}`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BinaryData(pub Vec<u8>);

impl Serialize for BinaryData {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("BinaryData", 2)?;
        state.serialize_field("data", &BASE64.encode(&self.0))?;
        state.serialize_field("format", "base64")?;
        state.end()
    }
}

impl<'de> Deserialize<'de> for BinaryData {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Repr {
            data: String,
            format: String,
        }

        let repr = Repr::deserialize(deserializer)?;
        if repr.format != "base64" {
            return Err(serde::de::Error::custom(format!(
                "unsupported binary format: {}",
                repr.format
            )));
        }
        BASE64
            .decode(repr.data.as_bytes())
            .map(Self)
            .map_err(serde::de::Error::custom)
    }
}

/// One low-level I/O event or lifecycle annotation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchivalNetworkEvent {
    /// Remote endpoint, when known
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    /// Canonical failure
    pub failure: Option<String>,
    /// Bytes transferred
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub num_bytes: i64,
    /// What happened (`read`, `connect`, `tls_handshake_start`, ...)
    pub operation: String,
    /// `tcp` or `udp`
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub proto: String,
    /// Start time
    #[serde(default, skip_serializing_if = "is_zero_f64")]
    pub t0: f64,
    /// Finish time
    pub t: f64,
    /// Index of the trace that produced this event
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub transaction_id: i64,
    /// Tags of the trace that produced this event
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,
}

/// One DNS answer.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivalDnsAnswer {
    /// Autonomous system number, when known
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub asn: i64,
    /// Autonomous system organization, when known
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub as_org_name: String,
    /// `A`, `AAAA` or `CNAME`
    pub answer_type: String,
    /// CNAME target
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub hostname: String,
    /// IPv4 address for `A` answers
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ipv4: String,
    /// IPv6 address for `AAAA` answers
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub ipv6: String,
    /// Time to live, when known
    pub ttl: Option<u32>,
}

/// Result of one DNS lookup.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchivalDnsLookupResult {
    /// Answers, possibly empty
    pub answers: Vec<ArchivalDnsAnswer>,
    /// Resolver kind (`getaddrinfo`, `udp`, ...)
    pub engine: String,
    /// Canonical failure
    pub failure: Option<String>,
    /// Raw getaddrinfo return code, when known
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub getaddrinfo_error: i64,
    /// Queried domain
    pub hostname: String,
    /// `A`, `AAAA` or `ANY`
    pub query_type: String,
    /// Raw DNS reply
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_response: Option<BinaryData>,
    /// DNS RCODE of the reply
    #[serde(default, skip_serializing_if = "is_zero_i64")]
    pub rcode: i64,
    /// Always null, kept for schema compatibility
    pub resolver_hostname: Option<String>,
    /// Always null, kept for schema compatibility
    pub resolver_port: Option<String>,
    /// Resolver endpoint, empty for getaddrinfo
    pub resolver_address: String,
    /// Start time
    pub t0: f64,
    /// Finish time
    pub t: f64,
    /// Tags of the producing trace
    pub tags: Vec<String>,
    /// Index of the producing trace
    pub transaction_id: i64,
}

/// Outcome of a TCP connect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchivalTcpConnectStatus {
    /// Set by analysis, never by collection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub blocked: Option<bool>,
    /// Canonical failure
    pub failure: Option<String>,
    /// Whether the connect succeeded
    pub success: bool,
}

/// Result of one TCP connect attempt.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchivalTcpConnectResult {
    /// Remote IP address
    pub ip: String,
    /// Remote port
    pub port: i64,
    /// Outcome
    pub status: ArchivalTcpConnectStatus,
    /// Start time
    pub t0: f64,
    /// Finish time
    pub t: f64,
    /// Tags of the producing trace
    pub tags: Vec<String>,
    /// Index of the producing trace
    pub transaction_id: i64,
}

/// Result of one TLS or QUIC handshake.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchivalTlsOrQuicHandshakeResult {
    /// `tcp` for TLS, `udp` for QUIC
    pub network: String,
    /// Remote endpoint
    pub address: String,
    /// Negotiated cipher suite
    pub cipher_suite: String,
    /// Canonical failure
    pub failure: Option<String>,
    /// Socket error observed after a failed handshake
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub so_error: Option<String>,
    /// Negotiated ALPN
    pub negotiated_protocol: String,
    /// Whether certificate verification was disabled
    pub no_tls_verify: bool,
    /// Certificate chain sent by the peer, leaf first
    pub peer_certificates: Vec<BinaryData>,
    /// SNI
    pub server_name: String,
    /// Start time
    pub t0: f64,
    /// Finish time
    pub t: f64,
    /// Tags of the producing trace
    pub tags: Vec<String>,
    /// Negotiated protocol version
    pub tls_version: String,
    /// Index of the producing trace
    pub transaction_id: i64,
}

/// A header name and value.
pub type ArchivalHttpHeader = (String, MaybeBinaryValue);

/// Tor information attached to requests. Never set by this crate.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivalHttpTor {
    /// Exit IP
    pub exit_ip: Option<String>,
    /// Exit name
    pub exit_name: Option<String>,
    /// Whether the request went through tor
    pub is_tor: bool,
}

/// The request half of an HTTP transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivalHttpRequest {
    /// Request body
    pub body: MaybeBinaryValue,
    /// Whether the body was truncated
    pub body_is_truncated: bool,
    /// Headers sorted by name
    pub headers_list: Vec<ArchivalHttpHeader>,
    /// First value of each header
    pub headers: BTreeMap<String, MaybeBinaryValue>,
    /// Request method
    pub method: String,
    /// Tor information
    pub tor: ArchivalHttpTor,
    /// Transport network (`tcp` or `udp`)
    pub x_transport: String,
    /// Request URL
    pub url: String,
}

/// The response half of an HTTP transaction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivalHttpResponse {
    /// Response body snapshot
    pub body: MaybeBinaryValue,
    /// Whether the snapshot hit the size limit
    pub body_is_truncated: bool,
    /// Status code, zero when there is no response
    pub code: i64,
    /// Headers sorted by name
    pub headers_list: Vec<ArchivalHttpHeader>,
    /// First value of each header
    pub headers: BTreeMap<String, MaybeBinaryValue>,
    /// Absolute redirect targets. Not serialized.
    #[serde(skip)]
    pub locations: Vec<String>,
}

/// One HTTP transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArchivalHttpRequestResult {
    /// Network of the underlying connection
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub network: String,
    /// Remote endpoint
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub address: String,
    /// Negotiated ALPN
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub alpn: String,
    /// Canonical failure
    pub failure: Option<String>,
    /// Request
    pub request: ArchivalHttpRequest,
    /// Response
    pub response: ArchivalHttpResponse,
    /// Start time
    pub t0: f64,
    /// Finish time
    pub t: f64,
    /// Tags of the producing trace
    pub tags: Vec<String>,
    /// Index of the producing trace
    pub transaction_id: i64,
}
