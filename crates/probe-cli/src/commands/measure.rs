//! Measure command - resolve, connect to and fetch a URL

use anyhow::{bail, Context as _, Result};
use clap::Args;
use colored::Colorize;
use probe_core::compose;
use probe_core::config::Config;
use probe_core::dslx::{
    collect, dns_lookup_getaddrinfo, dns_lookup_udp, extract_observations, first_error_excluding_broken_ipv6,
    http_request, http_transport_tcp, http_transport_tls, map_parallel, merge_resolved_addresses, parallel,
    quic_handshake, stream_list, tcp_connect, tls_handshake, AddressSet, Context, DomainToResolve, Func,
    HttpExchange, HttpRequestOptions, Maybe, Observations, QuicConnection, QuicHandshakeOptions,
    ResolvedAddresses, Runtime, TlsHandshakeOptions,
};
use probe_core::netx::SystemNetwork;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::config::load_config;

/// Measure command arguments
#[derive(Args, Debug)]
pub struct MeasureArgs {
    /// URL to measure (http or https)
    pub url: String,

    /// DNS-over-UDP resolver, as ip:port
    #[arg(long, value_name = "ENDPOINT")]
    pub resolver: Option<String>,

    /// Endpoints measured at once
    #[arg(short = 'j', long)]
    pub parallelism: Option<i64>,

    /// Also handshake QUIC with every address
    #[arg(long)]
    pub quic: bool,

    /// Write the report to a file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Pretty-print the JSON report
    #[arg(long)]
    pub pretty: bool,
}

/// What to measure, extracted from the URL
#[derive(Debug, Clone, PartialEq, Eq)]
struct Target {
    scheme: String,
    domain: String,
    port: u16,
    path: String,
}

impl Target {
    fn parse(input: &str) -> Result<Self> {
        let url = url::Url::parse(input).with_context(|| format!("Invalid URL: {input}"))?;
        let scheme = url.scheme().to_string();
        if scheme != "http" && scheme != "https" {
            bail!("Unsupported scheme: {scheme}");
        }
        let domain = url
            .host_str()
            .with_context(|| format!("URL has no host: {input}"))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        let port = url
            .port_or_known_default()
            .with_context(|| format!("URL has no port: {input}"))?;
        let path = match url.query() {
            Some(query) => format!("{}?{query}", url.path()),
            None => url.path().to_string(),
        };
        Ok(Self {
            scheme,
            domain,
            port,
            path,
        })
    }
}

/// The JSON document printed by the command
#[derive(Debug, Serialize)]
struct Report {
    input: String,
    resolved: Vec<String>,
    failure: Option<String>,
    test_keys: Observations,
}

/// Execute the measure command
pub fn execute(args: MeasureArgs, config_path: Option<&Path>, quiet: bool) -> Result<()> {
    let target = Target::parse(&args.url)?;
    let mut config = load_config(config_path)?;
    if let Some(resolver) = &args.resolver {
        config.pipeline.udp_resolver.clone_from(resolver);
    }
    if let Some(parallelism) = args.parallelism {
        config.pipeline.parallelism = parallelism;
    }
    config.validate().context("Invalid command line settings")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to start async runtime")?;
    let (report, http) = runtime.block_on(measure(&args.url, &target, config, args.quic));

    let json = if args.pretty {
        serde_json::to_string_pretty(&report)
    } else {
        serde_json::to_string(&report)
    }
    .context("Failed to serialize report")?;

    match &args.output {
        Some(path) => {
            std::fs::write(path, json).with_context(|| format!("Failed to write report to {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{json}"),
    }

    if !quiet {
        print_summary(&report, &http);
    }
    Ok(())
}

async fn measure(input: &str, target: &Target, config: Config, quic: bool) -> (Report, Vec<Maybe<HttpExchange>>) {
    let rt = Arc::new(Runtime::with_config(Arc::new(SystemNetwork::new()), config));
    let ctx = Context::new();
    {
        let ctx = ctx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling the measurement");
                ctx.cancel();
            }
        });
    }

    let parallelism = rt.config().pipeline.parallelism;
    let tags = vec!["depth=0".to_string()];

    info!("Resolving {}", target.domain);
    let lookups: Vec<Arc<dyn Func<DomainToResolve, ResolvedAddresses>>> = vec![
        Arc::new(dns_lookup_getaddrinfo(&rt)),
        Arc::new(dns_lookup_udp(&rt, rt.config().pipeline.udp_resolver.clone())),
    ];
    let lookup = DomainToResolve::new(target.domain.clone()).with_tags(tags.clone());
    let dns = merge_resolved_addresses(parallel(&ctx, parallelism, lookup, lookups).await);
    let mut addresses = AddressSet::new([&dns]);
    addresses.remove_bogons();
    info!("Resolved {} usable addresses", addresses.len());

    let options = HttpRequestOptions {
        url_path: Some(target.path.clone()),
        ..HttpRequestOptions::default()
    };
    let endpoints = addresses.to_endpoints("tcp", target.port, &target.domain, &tags);
    let http = if target.scheme == "https" {
        // no HTTP/2 transport: only offer HTTP/1.1
        let tls = TlsHandshakeOptions::default().next_protos(["http/1.1"]);
        let pipeline = Arc::new(compose!(
            tcp_connect(&rt),
            tls_handshake(&rt, tls),
            http_transport_tls(&rt),
            http_request(&rt, options),
        ));
        collect(map_parallel(&ctx, parallelism, pipeline, stream_list(endpoints))).await
    } else {
        let pipeline = Arc::new(compose!(
            tcp_connect(&rt),
            http_transport_tcp(&rt),
            http_request(&rt, options),
        ));
        collect(map_parallel(&ctx, parallelism, pipeline, stream_list(endpoints))).await
    };

    let quic: Vec<Maybe<QuicConnection>> = if quic && target.scheme == "https" {
        let endpoints = addresses.to_endpoints("udp", target.port, &target.domain, &tags);
        let handshake = Arc::new(quic_handshake(&rt, QuicHandshakeOptions::default()));
        collect(map_parallel(&ctx, parallelism, handshake, stream_list(endpoints))).await
    } else {
        Vec::new()
    };
    rt.close();

    let failure = dns
        .error()
        .or_else(|| first_error_excluding_broken_ipv6(&http))
        .map(|e| e.failure.clone());
    let mut observations = dns.observations.clone();
    observations.extend(extract_observations(&http));
    observations.extend(extract_observations(&quic));
    debug!("Collected {} observation lists", observations.len());

    let report = Report {
        input: input.to_string(),
        resolved: addresses.iter().map(ToString::to_string).collect(),
        failure,
        test_keys: flatten(observations),
    };
    (report, http)
}

/// Concatenate observation lists, keeping their order
fn flatten(lists: impl IntoIterator<Item = Observations>) -> Observations {
    lists.into_iter().fold(Observations::default(), |mut acc, o| {
        acc.network_events.extend(o.network_events);
        acc.queries.extend(o.queries);
        acc.tcp_connect.extend(o.tcp_connect);
        acc.tls_handshakes.extend(o.tls_handshakes);
        acc.quic_handshakes.extend(o.quic_handshakes);
        acc.requests.extend(o.requests);
        acc
    })
}

fn endpoint_of<T>(result: &Maybe<T>) -> String {
    result
        .observations
        .iter()
        .flat_map(|o| &o.tcp_connect)
        .next()
        .map_or_else(|| "?".to_string(), |c| format!("{}:{}", c.ip, c.port))
}

fn print_summary(report: &Report, http: &[Maybe<HttpExchange>]) {
    eprintln!();
    eprintln!("{} {}", "Input:".bold(), report.input);
    eprintln!("{} {}", "Addresses:".bold(), report.resolved.join(", "));
    for result in http {
        match (&result.result, result.state()) {
            (_, Some(exchange)) => eprintln!(
                "  {} {} {}",
                "✓".green(),
                exchange.address,
                exchange.response.status_code
            ),
            (Err(err), None) => eprintln!("  {} {} {}", "✗".red(), endpoint_of(result), err.failure.red()),
            (Ok(_), None) => {}
        }
    }
    match &report.failure {
        Some(failure) => eprintln!("{} {}", "Failure:".bold(), failure.red()),
        None => eprintln!("{} {}", "Failure:".bold(), "none".green()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use probe_core::archival::{ArchivalDnsLookupResult, ArchivalTcpConnectResult};

    #[test]
    fn test_target_defaults() {
        let target = Target::parse("https://www.example.com").unwrap();
        assert_eq!(
            target,
            Target {
                scheme: "https".to_string(),
                domain: "www.example.com".to_string(),
                port: 443,
                path: "/".to_string(),
            }
        );
    }

    #[test]
    fn test_target_port_and_query() {
        let target = Target::parse("http://[::1]:8080/search?q=x").unwrap();
        assert_eq!(target.domain, "::1");
        assert_eq!(target.port, 8080);
        assert_eq!(target.path, "/search?q=x");
    }

    #[test]
    fn test_target_rejects_other_schemes() {
        assert!(Target::parse("ftp://example.com/").is_err());
        assert!(Target::parse("not a url").is_err());
    }

    #[test]
    fn test_flatten_keeps_order() {
        let first = Observations {
            queries: vec![ArchivalDnsLookupResult {
                engine: "getaddrinfo".to_string(),
                ..Default::default()
            }],
            ..Observations::default()
        };
        let second = Observations {
            queries: vec![ArchivalDnsLookupResult {
                engine: "udp".to_string(),
                ..Default::default()
            }],
            tcp_connect: vec![ArchivalTcpConnectResult::default()],
            ..Observations::default()
        };
        let merged = flatten([first, second]);
        let engines: Vec<_> = merged.queries.iter().map(|q| q.engine.as_str()).collect();
        assert_eq!(engines, vec!["getaddrinfo", "udp"]);
        assert_eq!(merged.tcp_connect.len(), 1);
    }
}
