//! Addresses and endpoints
//!
//! Resolved addresses are merged into an [`AddressSet`], filtered and
//! expanded into the [`Endpoint`]s that later steps connect to.

use super::dns::ResolvedAddresses;
use super::fxcore::Maybe;
use crate::netx::bogon::is_bogon;
use bitflags::bitflags;
use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use tracing::debug;

/// `host:port`, bracketing IPv6 hosts
pub fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Something a step can connect to.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Endpoint {
    /// `ip:port`
    pub address: String,
    /// `tcp` or `udp`
    pub network: String,
    /// Domain the address was resolved from, possibly empty
    pub domain: String,
    /// Tags copied onto every trace created for this endpoint
    pub tags: Vec<String>,
}

impl Endpoint {
    /// An endpoint without domain and tags
    pub fn new(network: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            network: network.into(),
            ..Self::default()
        }
    }

    /// Set the domain
    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = domain.into();
        self
    }

    /// Set the tags
    #[must_use]
    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }
}

/// Deduplicated set of IP addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AddressSet {
    addresses: BTreeSet<String>,
}

impl AddressSet {
    /// The addresses of every successful lookup among `results`
    pub fn new<'a>(results: impl IntoIterator<Item = &'a Maybe<ResolvedAddresses>>) -> Self {
        let addresses = results
            .into_iter()
            .filter_map(Maybe::state)
            .flat_map(|resolved| resolved.addresses.iter().cloned())
            .collect();
        Self { addresses }
    }

    /// Add addresses
    pub fn add<I, S>(&mut self, addresses: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.addresses.extend(addresses.into_iter().map(Into::into));
        self
    }

    /// Drop every reserved or non-routable address
    pub fn remove_bogons(&mut self) -> &mut Self {
        self.addresses.retain(|addr| {
            let bogon = is_bogon(addr);
            if bogon {
                debug!("AddressSet: removing bogon {addr}");
            }
            !bogon
        });
        self
    }

    /// Whether `address` is in the set
    pub fn contains(&self, address: &str) -> bool {
        self.addresses.contains(address)
    }

    /// Number of addresses
    pub fn len(&self) -> usize {
        self.addresses.len()
    }

    /// Whether the set is empty
    pub fn is_empty(&self) -> bool {
        self.addresses.is_empty()
    }

    /// Addresses in lexicographic order
    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.addresses.iter().map(String::as_str)
    }

    /// One endpoint per address at `port`
    pub fn to_endpoints(&self, network: &str, port: u16, domain: &str, tags: &[String]) -> Vec<Endpoint> {
        self.iter()
            .map(|addr| {
                Endpoint::new(network, join_host_port(addr, port))
                    .with_domain(domain)
                    .with_tags(tags.to_vec())
            })
            .collect()
    }
}

bitflags! {
    /// How an address was discovered.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct IpInfoFlags: i64 {
        /// The probe resolved it
        const RESOLVED_BY_PROBE = 1 << 0;
        /// The test helper resolved it
        const RESOLVED_BY_TH = 1 << 1;
        /// It is a bogon
        const IS_BOGON = 1 << 2;
    }
}

/// What is known about one address.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IpInfo {
    /// Discovery flags
    pub flags: IpInfoFlags,
}

/// Merge the addresses the probe connected to (`probe_endpoints`, as
/// `ip:port`) with those the test helper resolved (`th_addresses`).
pub fn new_ip_info(probe_endpoints: &[String], th_addresses: &[String]) -> BTreeMap<String, IpInfo> {
    let mut discovered: BTreeMap<String, IpInfoFlags> = BTreeMap::new();
    for endpoint in probe_endpoints {
        match endpoint.parse::<SocketAddr>() {
            Ok(addr) => {
                *discovered.entry(addr.ip().to_string()).or_default() |= IpInfoFlags::RESOLVED_BY_PROBE;
            }
            Err(_) => debug!("new_ip_info: skipping malformed endpoint {endpoint:?}"),
        }
    }
    for addr in th_addresses {
        *discovered.entry(addr.clone()).or_default() |= IpInfoFlags::RESOLVED_BY_TH;
    }

    discovered
        .into_iter()
        .map(|(addr, mut flags)| {
            if is_bogon(&addr) {
                flags |= IpInfoFlags::IS_BOGON;
            }
            (addr, IpInfo { flags })
        })
        .collect()
}

/// An endpoint the test helper should measure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointInfo {
    /// IP address
    pub addr: String,
    /// `ip:port`
    pub epnt: String,
    /// Whether to handshake TLS after connecting
    pub tls: bool,
}

/// The port written in the authority of `raw`, if any.
///
/// [`url::Url`] forgets a port equal to the scheme default, so
/// `https://example.com:443/` and `https://example.com/` parse the same.
/// Look at the text instead.
fn explicit_port(raw: &str, url: &url::Url) -> Option<u16> {
    if let Some(port) = url.port() {
        return Some(port);
    }
    let rest = raw.trim().split_once("://")?.1;
    let authority = rest.split(['/', '?', '#']).next()?;
    let host_port = authority.rsplit_once('@').map_or(authority, |(_, hp)| hp);
    let port = match host_port.rfind(']') {
        Some(end) => host_port[end + 1..].strip_prefix(':')?,
        None => host_port.rsplit_once(':')?.1,
    };
    port.parse().ok()
}

/// Expand every non-bogon address into endpoints for the URL `raw`.
///
/// A URL with a port yields that port only, even when it is the default
/// port of the scheme. Otherwise both 443 and 80 are used. TLS is used on
/// port 443 only. The result is sorted by endpoint.
pub fn ip_info_to_endpoints(raw: &str, info: &BTreeMap<String, IpInfo>) -> crate::Result<Vec<EndpointInfo>> {
    let url = url::Url::parse(raw)?;
    let ports = match explicit_port(raw, &url) {
        Some(port) => vec![port],
        None => vec![443, 80],
    };
    let mut out: Vec<EndpointInfo> = info
        .iter()
        .filter(|(_, info)| !info.flags.contains(IpInfoFlags::IS_BOGON))
        .flat_map(|(addr, _)| {
            ports.iter().map(move |&port| EndpointInfo {
                addr: addr.clone(),
                epnt: join_host_port(addr, port),
                tls: port == 443,
            })
        })
        .collect();
    out.sort_by(|a, b| a.epnt.cmp(&b.epnt));
    Ok(out)
}
