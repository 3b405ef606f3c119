//! Configuration management for netprobe
//!
//! A strongly-typed configuration with TOML support. Every section has
//! defaults, so an empty file is a valid configuration.

use crate::error::{Error, Result};
use crate::memoryless;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Per-operation timeouts
    pub timeouts: TimeoutsConfig,

    /// Trace queue capacities
    pub trace: TraceConfig,

    /// Throughput sampler timing
    pub sampler: SamplerConfig,

    /// Pipeline defaults
    pub pipeline: PipelineConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|_| Error::ConfigNotFound {
            path: path.display().to_string(),
        })?;
        Self::from_toml(&content)
    }

    /// Parse configuration from TOML string
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(Error::from)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let timeouts = [
            ("timeouts.dns_ms", self.timeouts.dns_ms),
            ("timeouts.tcp_connect_ms", self.timeouts.tcp_connect_ms),
            ("timeouts.tls_handshake_ms", self.timeouts.tls_handshake_ms),
            ("timeouts.quic_handshake_ms", self.timeouts.quic_handshake_ms),
            ("timeouts.http_transaction_ms", self.timeouts.http_transaction_ms),
        ];
        for (key, value) in timeouts {
            if value == 0 {
                return Err(Error::config_value(key, "Must be greater than zero"));
            }
        }

        let capacities = [
            ("trace.network_events", self.trace.network_events),
            ("trace.dns_lookups", self.trace.dns_lookups),
            ("trace.tcp_connects", self.trace.tcp_connects),
            ("trace.tls_handshakes", self.trace.tls_handshakes),
            ("trace.quic_handshakes", self.trace.quic_handshakes),
        ];
        for (key, value) in capacities {
            if value == 0 {
                return Err(Error::config_value(key, "Must be greater than zero"));
            }
        }

        self.sampler
            .memoryless()
            .check()
            .map_err(|e| Error::config_value("sampler", e.to_string()))?;

        if self.pipeline.max_body_bytes == 0 {
            return Err(Error::config_value(
                "pipeline.max_body_bytes",
                "Must be greater than zero",
            ));
        }
        if self.pipeline.udp_resolver.parse::<SocketAddr>().is_err() {
            return Err(Error::config_value(
                "pipeline.udp_resolver",
                format!("Not an ip:port endpoint: {}", self.pipeline.udp_resolver),
            ));
        }

        Ok(())
    }

    /// Serialize to TOML string
    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Per-operation timeouts, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutsConfig {
    /// DNS lookup
    pub dns_ms: u64,
    /// TCP connect
    pub tcp_connect_ms: u64,
    /// TLS handshake
    pub tls_handshake_ms: u64,
    /// QUIC handshake
    pub quic_handshake_ms: u64,
    /// HTTP transaction, body included
    pub http_transaction_ms: u64,
}

impl Default for TimeoutsConfig {
    fn default() -> Self {
        Self {
            dns_ms: 4_000,
            tcp_connect_ms: 15_000,
            tls_handshake_ms: 10_000,
            quic_handshake_ms: 10_000,
            http_transaction_ms: 10_000,
        }
    }
}

impl TimeoutsConfig {
    /// DNS lookup timeout
    pub fn dns(&self) -> Duration {
        Duration::from_millis(self.dns_ms)
    }

    /// TCP connect timeout
    pub fn tcp_connect(&self) -> Duration {
        Duration::from_millis(self.tcp_connect_ms)
    }

    /// TLS handshake timeout
    pub fn tls_handshake(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_ms)
    }

    /// QUIC handshake timeout
    pub fn quic_handshake(&self) -> Duration {
        Duration::from_millis(self.quic_handshake_ms)
    }

    /// HTTP transaction timeout
    pub fn http_transaction(&self) -> Duration {
        Duration::from_millis(self.http_transaction_ms)
    }
}

/// Capacity of each trace queue
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraceConfig {
    /// I/O events and annotations
    pub network_events: usize,
    /// DNS lookup results
    pub dns_lookups: usize,
    /// TCP connect results
    pub tcp_connects: usize,
    /// TLS handshake results
    pub tls_handshakes: usize,
    /// QUIC handshake results
    pub quic_handshakes: usize,
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            network_events: 64,
            dns_lookups: 8,
            tcp_connects: 8,
            tls_handshakes: 8,
            quic_handshakes: 8,
        }
    }
}

/// Throughput sampler timing, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SamplerConfig {
    /// Mean interval between samples
    pub expected_ms: u64,
    /// Shortest interval
    pub min_ms: u64,
    /// Longest interval
    pub max_ms: u64,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            expected_ms: 250,
            min_ms: 25,
            max_ms: 650,
        }
    }
}

impl SamplerConfig {
    /// Timing parameters for the sampler loop
    pub fn memoryless(&self) -> memoryless::Config {
        memoryless::Config {
            expected: Duration::from_millis(self.expected_ms),
            min: Duration::from_millis(self.min_ms),
            max: Duration::from_millis(self.max_ms),
        }
    }
}

/// Pipeline defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Workers used by parallel combinators (values below one mean one)
    pub parallelism: i64,
    /// Largest HTTP body snapshot
    pub max_body_bytes: usize,
    /// DNS-over-UDP server
    pub udp_resolver: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            parallelism: 2,
            max_body_bytes: 1 << 19,
            udp_resolver: "8.8.8.8:53".to_string(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
    /// Enable JSON format logging
    pub json_format: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json_format: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // =========== Default Config Tests ===========

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.timeouts.dns(), Duration::from_secs(4));
        assert_eq!(config.timeouts.tcp_connect(), Duration::from_secs(15));
        assert_eq!(config.pipeline.parallelism, 2);
        assert_eq!(config.pipeline.max_body_bytes, 524_288);
    }

    #[test]
    fn test_default_trace_config() {
        let config = TraceConfig::default();
        assert_eq!(config.network_events, 64);
        assert_eq!(config.tcp_connects, 8);
        assert_eq!(config.quic_handshakes, 8);
    }

    #[test]
    fn test_default_sampler_config() {
        let sampler = SamplerConfig::default().memoryless();
        assert_eq!(sampler.expected, Duration::from_millis(250));
        assert_eq!(sampler.min, Duration::from_millis(25));
        assert_eq!(sampler.max, Duration::from_millis(650));
    }

    // =========== Validation Tests ===========

    #[test]
    fn test_config_validation() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn test_config_validation_zero_timeout() {
        let mut config = Config::default();
        config.timeouts.tls_handshake_ms = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("timeouts.tls_handshake_ms"));
    }

    #[test]
    fn test_config_validation_zero_capacity() {
        let mut config = Config::default();
        config.trace.dns_lookups = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_sampler_order() {
        let mut config = Config::default();
        config.sampler.min_ms = 300;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_validation_bad_resolver() {
        let mut config = Config::default();
        config.pipeline.udp_resolver = "dns.google".to_string();
        assert!(config.validate().is_err());
    }

    // =========== TOML Serialization Tests ===========

    #[test]
    fn test_toml_roundtrip() {
        let mut config = Config::default();
        config.pipeline.udp_resolver = "1.1.1.1:53".to_string();
        let toml = config.to_toml().unwrap();
        let parsed = Config::from_toml(&toml).unwrap();
        assert_eq!(parsed.pipeline.udp_resolver, "1.1.1.1:53");
        assert_eq!(parsed.sampler.expected_ms, 250);
    }

    #[test]
    fn test_toml_parse_minimal() {
        let toml_content = r#"
[timeouts]
dns_ms = 2000

[pipeline]
parallelism = 8
"#;
        let config = Config::from_toml(toml_content).unwrap();
        assert_eq!(config.timeouts.dns_ms, 2000);
        assert_eq!(config.timeouts.http_transaction_ms, 10_000);
        assert_eq!(config.pipeline.parallelism, 8);
        assert_eq!(config.trace.network_events, 64);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load("/nonexistent/netprobe.toml").unwrap_err();
        assert!(matches!(err, Error::ConfigNotFound { .. }));
    }
}
