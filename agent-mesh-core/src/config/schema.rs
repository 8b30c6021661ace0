//! Configuration schema definitions

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

/// Root configuration for agent-mesh
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Message bus configuration
    #[serde(default)]
    pub bus: BusConfig,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Log format (text, json)
    #[serde(default = "default_log_format")]
    pub format: String,
    /// Directory for log files
    #[serde(default = "default_log_dir")]
    pub dir: String,
    /// Module-specific overrides
    #[serde(default)]
    pub overrides: HashMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_log_dir() -> String {
    "logs".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            dir: default_log_dir(),
            overrides: HashMap::new(),
        }
    }
}

/// Message bus configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct BusConfig {
    #[serde(default)]
    pub mailbox: MailboxConfig,
    #[serde(default)]
    pub governor: GovernorConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub tuning: TuningConfig,
    #[serde(default)]
    pub request: RequestConfig,
}

/// What `send` does when a bounded mailbox is full
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FullMailboxPolicy {
    /// Wait for space (backpressure)
    #[default]
    Block,
    /// Fail fast with `Error::MailboxFull`
    Reject,
}

/// Mailbox defaults
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxConfig {
    /// Capacity used by `register_default`; 0 means unbounded
    #[serde(default)]
    pub default_capacity: usize,
    #[serde(default)]
    pub full_mailbox_policy: FullMailboxPolicy,
    /// How long each `subscribe` poll waits before silently retrying
    #[serde(default = "default_subscribe_poll_ms")]
    pub subscribe_poll_ms: u64,
}

fn default_subscribe_poll_ms() -> u64 {
    1000
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            default_capacity: 0,
            full_mailbox_policy: FullMailboxPolicy::Block,
            subscribe_poll_ms: default_subscribe_poll_ms(),
        }
    }
}

impl MailboxConfig {
    pub fn subscribe_poll(&self) -> Duration {
        Duration::from_millis(self.subscribe_poll_ms)
    }
}

/// Concurrency governor settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GovernorConfig {
    /// Ceiling on simultaneous `receive` operations across the bus
    #[serde(default = "default_max_concurrent_receives")]
    pub max_concurrent_receives: usize,
    /// Permit waits longer than this are logged as concurrency pressure
    #[serde(default = "default_wait_warn_ms")]
    pub wait_warn_ms: u64,
}

fn default_max_concurrent_receives() -> usize {
    1000
}

fn default_wait_warn_ms() -> u64 {
    100
}

impl Default for GovernorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_receives: default_max_concurrent_receives(),
            wait_warn_ms: default_wait_warn_ms(),
        }
    }
}

/// Telemetry retention settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryConfig {
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,
    /// Latency samples kept per message type
    #[serde(default = "default_latency_samples_per_type")]
    pub latency_samples_per_type: usize,
    /// Window used for "recent" throughput in performance snapshots
    #[serde(default = "default_throughput_window_secs")]
    pub throughput_window_secs: u64,
}

fn default_history_capacity() -> usize {
    100
}

fn default_latency_samples_per_type() -> usize {
    1000
}

fn default_throughput_window_secs() -> u64 {
    60
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            history_capacity: default_history_capacity(),
            latency_samples_per_type: default_latency_samples_per_type(),
            throughput_window_secs: default_throughput_window_secs(),
        }
    }
}

/// Thresholds used by `optimize_performance`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuningConfig {
    /// Fraction of capacity above which a mailbox is flagged
    #[serde(default = "default_mailbox_utilization_warn")]
    pub mailbox_utilization_warn: f64,
    /// Fraction of governor permits in use above which concurrency is flagged
    #[serde(default = "default_concurrency_utilization_warn")]
    pub concurrency_utilization_warn: f64,
    #[serde(default = "default_latency_warn_ms")]
    pub latency_warn_ms: f64,
    /// History is trimmed once it exceeds `history_capacity * history_trim_factor`
    #[serde(default = "default_history_trim_factor")]
    pub history_trim_factor: f64,
}

fn default_mailbox_utilization_warn() -> f64 {
    0.8
}

fn default_concurrency_utilization_warn() -> f64 {
    0.9
}

fn default_latency_warn_ms() -> f64 {
    100.0
}

fn default_history_trim_factor() -> f64 {
    1.5
}

impl Default for TuningConfig {
    fn default() -> Self {
        Self {
            mailbox_utilization_warn: default_mailbox_utilization_warn(),
            concurrency_utilization_warn: default_concurrency_utilization_warn(),
            latency_warn_ms: default_latency_warn_ms(),
            history_trim_factor: default_history_trim_factor(),
        }
    }
}

/// Request/response settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    /// Timeout used by `send_request_default`
    #[serde(default = "default_request_timeout_ms")]
    pub default_timeout_ms: u64,
    /// Stash unrelated messages consumed while a request is outstanding and
    /// re-enqueue them afterwards instead of discarding them
    #[serde(default)]
    pub preserve_unmatched: bool,
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_request_timeout_ms(),
            preserve_unmatched: false,
        }
    }
}

impl RequestConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: Config =
            serde_json::from_str(r#"{"bus":{"mailbox":{"full_mailbox_policy":"reject"}}}"#)
                .unwrap();
        assert_eq!(
            config.bus.mailbox.full_mailbox_policy,
            FullMailboxPolicy::Reject
        );
        assert_eq!(config.bus.mailbox.subscribe_poll_ms, 1000);
        assert_eq!(config.bus.governor.max_concurrent_receives, 1000);
        assert_eq!(config.bus.telemetry.history_capacity, 100);
        assert_eq!(config.logging.level, "info");
    }
}
