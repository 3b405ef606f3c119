//! Integration tests for resolving a domain with several resolvers at once

use probe_core::dslx::{
    dns_lookup_getaddrinfo, dns_lookup_udp, extract_observations, merge_resolved_addresses, parallel,
    AddressSet, Context, DomainToResolve, Func, Maybe, ResolvedAddresses, Runtime,
};
use probe_core::failure::DNS_NXDOMAIN_ERROR;
use probe_core::netx::{DpiRule, Netem};
use std::sync::Arc;

fn netem() -> Netem {
    let netem = Netem::new();
    netem.add_record("dns.google", &["8.8.8.8", "8.8.4.4", "2001:4860:4860::8888"]);
    netem
}

async fn resolve(netem: Netem) -> (Vec<Maybe<ResolvedAddresses>>, Arc<Runtime>) {
    let rt = Arc::new(Runtime::new(Arc::new(netem)));
    let lookups: Vec<Arc<dyn Func<DomainToResolve, ResolvedAddresses>>> = vec![
        Arc::new(dns_lookup_getaddrinfo(&rt)),
        Arc::new(dns_lookup_udp(&rt, "8.8.4.4:53")),
    ];
    let input = DomainToResolve::new("dns.google").with_tags(vec!["dns".to_string()]);
    let results = parallel(&Context::new(), 2, input, lookups).await;
    (results, rt)
}

#[tokio::test]
async fn test_resolve_dns_google() {
    let (results, rt) = resolve(netem()).await;
    assert_eq!(results.len(), 2);
    assert!(results.iter().all(Maybe::is_ok));

    // one query per resolver, whatever the completion order
    let observations = extract_observations(&results);
    let mut engines: Vec<_> = observations
        .iter()
        .flat_map(|o| &o.queries)
        .map(|q| q.engine.as_str())
        .collect();
    engines.sort_unstable();
    assert_eq!(engines, vec!["getaddrinfo", "udp"]);

    let merged = merge_resolved_addresses(results);
    let addresses = AddressSet::new([&merged]);
    assert!(addresses.contains("8.8.8.8"));
    assert_eq!(addresses.len(), 3);
    assert_eq!(merged.observations.len(), 2);

    let endpoints = addresses.to_endpoints("tcp", 443, "dns.google", &[]);
    assert!(endpoints.iter().any(|e| e.address == "8.8.8.8:443"));
    rt.close();
}

#[tokio::test]
async fn test_resolve_with_nxdomain_injection() {
    let netem = netem();
    netem.add_dpi_rule(DpiRule::SpoofNxdomain {
        domain: "dns.google".to_string(),
    });
    let (results, _rt) = resolve(netem).await;

    let merged = merge_resolved_addresses(results);
    let err = merged.error().expect("lookup should fail");
    assert_eq!(err.failure, DNS_NXDOMAIN_ERROR);
    assert!(AddressSet::new([&merged]).is_empty());

    let failures: Vec<_> = merged
        .observations
        .iter()
        .flat_map(|o| &o.queries)
        .filter_map(|q| q.failure.as_deref())
        .collect();
    assert_eq!(failures, vec![DNS_NXDOMAIN_ERROR, DNS_NXDOMAIN_ERROR]);
}

#[tokio::test]
async fn test_isp_resolver_lies() {
    let netem = netem();
    netem.add_getaddrinfo_record("dns.google", &["10.10.34.35"]);
    let (results, _rt) = resolve(netem).await;

    let mut addresses = AddressSet::new(&results);
    assert!(addresses.contains("10.10.34.35"));
    addresses.remove_bogons();
    assert!(!addresses.contains("10.10.34.35"));
    assert!(addresses.contains("8.8.8.8"));
}

#[tokio::test]
async fn test_lookup_in_pipeline() {
    let rt = Arc::new(Runtime::new(Arc::new(netem())));
    let out = dns_lookup_udp(&rt, "8.8.8.8:53")
        .apply(&Context::new(), Maybe::ok(DomainToResolve::new("dns.google")))
        .await;
    let resolved = out.state().expect("lookup should succeed");
    assert_eq!(resolved.domain, "dns.google");
    assert_eq!(resolved.trace.index(), 1);
}
