//! Service configuration.
//!
//! The embedding process deserializes this from its own configuration file;
//! every option has the documented default so an empty table is a working
//! UDP listener on `:8125`.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};

pub const DEFAULT_SERVICE_ADDRESS: &str = ":8125";
pub const DEFAULT_SEPARATOR: &str = "_";
pub const DEFAULT_ALLOWED_PENDING_MESSAGES: usize = 10_000;

#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("unable to resolve service address {address:?}: {source}"))]
    ResolveAddress {
        address: String,
        source: std::io::Error,
    },

    #[snafu(display("service address {address:?} did not resolve to any socket address"))]
    EmptyResolution { address: String },
}

/// Runtime configuration for the statsd service.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct StatsdConfig {
    /// `"udp"` (including `"udp4"`/`"udp6"`) or `"tcp"`.
    pub protocol: String,

    /// Bind address; a bare `":port"` means all interfaces.
    pub service_address: String,

    /// Depth of the ingress queue between the listener and the parser
    /// workers. Payloads arriving while it is full are dropped.
    pub allowed_pending_messages: usize,
    pub number_worker_threads: usize,

    /// Percentiles calculated for timing and histogram stats.
    pub percentiles: Vec<f64>,
    pub percentile_limit: usize,

    pub delete_gauges: bool,
    pub delete_counters: bool,
    pub delete_sets: bool,
    pub delete_timings: bool,

    /// Rewrite `.` to `_` and `-` to `__` in measurement names.
    pub convert_names: bool,

    pub float_counters: bool,
    pub float_timings: bool,
    pub float_sets: bool,

    /// Inject the `start_time` field and `temporality` tag on emission.
    pub enable_aggregation_temporality: bool,

    /// Separator handed to the name mapper.
    pub metric_separator: String,

    /// Parse the DataDog statsd extensions: `#tags`, `_e` events and the
    /// `c:` container segment.
    pub datadog_extensions: bool,

    /// Parse DataDog distribution (`d`) metrics. Requires
    /// `datadog_extensions`.
    pub datadog_distributions: bool,

    /// Keep the container id from `c:` as the `container` tag. Requires
    /// `datadog_extensions`.
    pub datadog_keep_container_tag: bool,

    /// UDP `SO_RCVBUF` size in bytes; `0` leaves the kernel default.
    pub read_buffer_size: usize,

    /// `""` or `"upstream"`.
    pub sanitize_names_method: String,

    /// Graphite-style mapping templates, interpreted by the name mapper.
    pub templates: Vec<String>,

    pub max_tcp_connections: usize,
    pub tcp_keep_alive: bool,
    /// Keepalive probe period in seconds; `None` uses the OS default.
    pub tcp_keep_alive_period: Option<u64>,

    /// Seconds a cache entry may stay idle before eviction; `0` disables.
    pub max_ttl: u64,
}

impl Default for StatsdConfig {
    fn default() -> Self {
        Self {
            protocol: "udp".to_owned(),
            service_address: DEFAULT_SERVICE_ADDRESS.to_owned(),
            allowed_pending_messages: DEFAULT_ALLOWED_PENDING_MESSAGES,
            number_worker_threads: 5,
            percentiles: Vec::new(),
            percentile_limit: 1000,
            delete_gauges: true,
            delete_counters: true,
            delete_sets: true,
            delete_timings: true,
            convert_names: false,
            float_counters: false,
            float_timings: false,
            float_sets: false,
            enable_aggregation_temporality: false,
            metric_separator: DEFAULT_SEPARATOR.to_owned(),
            datadog_extensions: false,
            datadog_distributions: false,
            datadog_keep_container_tag: false,
            read_buffer_size: 0,
            sanitize_names_method: String::new(),
            templates: Vec::new(),
            max_tcp_connections: 250,
            tcp_keep_alive: false,
            tcp_keep_alive_period: None,
            max_ttl: 0,
        }
    }
}

impl StatsdConfig {
    /// `udp`, `udp4` and `udp6` all select the datagram listener.
    pub fn is_udp(&self) -> bool {
        self.protocol.starts_with("udp")
    }

    pub fn max_ttl(&self) -> Option<Duration> {
        (self.max_ttl > 0).then(|| Duration::from_secs(self.max_ttl))
    }

    pub fn keep_alive_period(&self) -> Option<Duration> {
        self.tcp_keep_alive_period.map(Duration::from_secs)
    }

    /// Resolves `service_address`, accepting the `":8125"` all-interfaces
    /// shorthand.
    pub fn resolve_service_address(&self) -> Result<SocketAddr, ConfigError> {
        let address = if self.service_address.starts_with(':') {
            format!("0.0.0.0{}", self.service_address)
        } else {
            self.service_address.clone()
        };
        let mut resolved = address.to_socket_addrs().context(ResolveAddressSnafu {
            address: self.service_address.clone(),
        })?;
        resolved.next().context(EmptyResolutionSnafu {
            address: self.service_address.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_documented_table() {
        let config = StatsdConfig::default();
        assert_eq!(config.protocol, "udp");
        assert!(config.is_udp());
        assert_eq!(config.service_address, ":8125");
        assert_eq!(config.allowed_pending_messages, 10_000);
        assert_eq!(config.number_worker_threads, 5);
        assert_eq!(config.percentile_limit, 1000);
        assert_eq!(config.metric_separator, "_");
        assert_eq!(config.max_tcp_connections, 250);
        assert!(config.delete_gauges);
        assert!(config.delete_counters);
        assert!(config.delete_sets);
        assert!(config.delete_timings);
        assert_eq!(config.max_ttl(), None);
        assert_eq!(config.keep_alive_period(), None);
    }

    #[test]
    fn deserializes_with_partial_tables() {
        let config: StatsdConfig = toml::from_str(
            r#"
            protocol = "tcp"
            service_address = "127.0.0.1:8125"
            percentiles = [50, 90.5]
            max_tcp_connections = 5
            tcp_keep_alive = true
            tcp_keep_alive_period = 120
            max_ttl = 300
            "#,
        )
        .unwrap();

        assert!(!config.is_udp());
        assert_eq!(config.percentiles, vec![50.0, 90.5]);
        assert_eq!(config.max_tcp_connections, 5);
        assert_eq!(config.keep_alive_period(), Some(Duration::from_secs(120)));
        assert_eq!(config.max_ttl(), Some(Duration::from_secs(300)));
        // Unset options keep their defaults.
        assert_eq!(config.allowed_pending_messages, 10_000);
    }

    #[test]
    fn rejects_unknown_options() {
        assert!(toml::from_str::<StatsdConfig>("no_such_option = true").is_err());
    }

    #[test]
    fn udp_variants_select_the_datagram_listener() {
        for protocol in ["udp", "udp4", "udp6"] {
            let config = StatsdConfig {
                protocol: protocol.to_owned(),
                ..StatsdConfig::default()
            };
            assert!(config.is_udp());
        }
    }

    #[test]
    fn bare_port_addresses_resolve_to_all_interfaces() {
        let config = StatsdConfig::default();
        let address = config.resolve_service_address().unwrap();
        assert_eq!(address.port(), 8125);
        assert!(address.ip().is_unspecified());
    }
}
