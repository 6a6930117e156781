//! Configuration snapshot for the streaming service.
//!
//! The snapshot is produced by the embedding agent's configuration layer and
//! consumed atomically at validation time. Validation logs every invalid
//! field individually; any single invalid field disables the service without
//! raising an error.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// Default collector endpoint port.
const DEFAULT_ENDPOINT_PORT: u32 = 443;

/// Default number of consumer tasks draining the outbound queue.
const DEFAULT_CONSUMER_COUNT: usize = 10;

/// Default channel/stream connect timeout in milliseconds.
const DEFAULT_CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Default per-record send timeout in milliseconds.
const DEFAULT_SEND_TIMEOUT_MS: u64 = 10_000;

/// Hostnames may not exceed this many characters.
const MAX_HOSTNAME_LEN: usize = 253;

/// Read-only configuration snapshot for the streaming service.
///
/// An empty `endpoint_host` means streaming is not configured; that disables
/// the service without being a validation failure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Collector endpoint hostname. Empty leaves the service disabled.
    pub endpoint_host: String,

    /// Collector endpoint port. Valid range is 1-65535; kept as a wider
    /// integer so an out-of-range value from the configuration layer reaches
    /// validation instead of failing to parse.
    pub endpoint_port: u32,

    /// Number of consumer tasks draining the outbound queue.
    pub consumer_count: usize,

    /// Channel and stream connect timeout in milliseconds.
    pub connect_timeout_ms: u64,

    /// Per-record send timeout in milliseconds.
    pub send_timeout_ms: u64,

    /// License key sent as call metadata on every RPC.
    pub license_key: String,

    /// Agent run token sent as call metadata on every RPC.
    pub run_token: String,

    /// Percentage (0-100) of sends the test collector should fail.
    #[cfg(feature = "test-faults")]
    pub test_flaky: Option<f32>,

    /// Delay in milliseconds the test collector should inject per record.
    #[cfg(feature = "test-faults")]
    pub test_delay_ms: Option<u64>,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            endpoint_host: String::new(),
            endpoint_port: DEFAULT_ENDPOINT_PORT,
            consumer_count: DEFAULT_CONSUMER_COUNT,
            connect_timeout_ms: DEFAULT_CONNECT_TIMEOUT_MS,
            send_timeout_ms: DEFAULT_SEND_TIMEOUT_MS,
            license_key: String::new(),
            run_token: String::new(),
            #[cfg(feature = "test-faults")]
            test_flaky: None,
            #[cfg(feature = "test-faults")]
            test_delay_ms: None,
        }
    }
}

impl StreamingConfig {
    /// Validate the snapshot, logging every invalid field.
    ///
    /// Returns true when the service can run. An empty host is reported as
    /// "not configured" and returns false without any field diagnostics.
    pub fn validate(&self) -> bool {
        if self.endpoint_host.trim().is_empty() {
            debug!("streaming endpoint host is empty, streaming service stays disabled");
            return false;
        }

        let mut valid = true;

        if !is_valid_hostname(&self.endpoint_host) {
            info!(
                host = %self.endpoint_host,
                "invalid configuration: endpoint host is not a valid hostname, streaming will not be started"
            );
            valid = false;
        }

        if self.endpoint_port == 0 || self.endpoint_port > 65_535 {
            info!(
                port = self.endpoint_port,
                "invalid configuration: endpoint port is outside 1-65535, streaming will not be started"
            );
            valid = false;
        }

        if self.connect_timeout_ms == 0 {
            info!("invalid configuration: connect timeout must be positive, streaming will not be started");
            valid = false;
        }

        if self.send_timeout_ms == 0 {
            info!("invalid configuration: send timeout must be positive, streaming will not be started");
            valid = false;
        }

        if self.consumer_count == 0 {
            info!("invalid configuration: consumer count must be positive, streaming will not be started");
            valid = false;
        }

        #[cfg(feature = "test-faults")]
        if let Some(flaky) = self.test_flaky {
            if !(0.0..=100.0).contains(&flaky) {
                info!(
                    flaky,
                    "invalid test configuration: flaky percentage is outside 0-100, streaming will not be started"
                );
                valid = false;
            }
        }

        valid
    }

    /// Channel/stream connect timeout.
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Per-record send timeout.
    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}

/// Syntactic hostname check: dot-separated labels of alphanumerics and
/// hyphens, no label starting or ending with a hyphen.
fn is_valid_hostname(host: &str) -> bool {
    if host.is_empty() || host.len() > MAX_HOSTNAME_LEN {
        return false;
    }

    host.split('.').all(|label| {
        !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
    })
}
