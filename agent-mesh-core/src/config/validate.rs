//! Configuration validation rules.

use super::schema::Config;

/// Validate configuration and return aggregated validation errors.
pub fn validate_config(config: &Config) -> crate::Result<()> {
    let mut errors = Vec::new();
    let bus = &config.bus;

    if bus.mailbox.subscribe_poll_ms == 0 {
        errors.push("bus.mailbox.subscribe_poll_ms must be > 0".to_string());
    }
    if bus.governor.max_concurrent_receives == 0 {
        errors.push("bus.governor.max_concurrent_receives must be > 0".to_string());
    }
    if bus.governor.max_concurrent_receives > tokio::sync::Semaphore::MAX_PERMITS {
        errors.push(format!(
            "bus.governor.max_concurrent_receives must be <= {}",
            tokio::sync::Semaphore::MAX_PERMITS
        ));
    }
    if bus.telemetry.history_capacity == 0 {
        errors.push("bus.telemetry.history_capacity must be > 0".to_string());
    }
    if bus.telemetry.latency_samples_per_type == 0 {
        errors.push("bus.telemetry.latency_samples_per_type must be > 0".to_string());
    }
    if bus.telemetry.throughput_window_secs == 0 {
        errors.push("bus.telemetry.throughput_window_secs must be > 0".to_string());
    }
    if !(0.0..=1.0).contains(&bus.tuning.mailbox_utilization_warn) {
        errors.push("bus.tuning.mailbox_utilization_warn must be in [0.0, 1.0]".to_string());
    }
    if !(0.0..=1.0).contains(&bus.tuning.concurrency_utilization_warn) {
        errors.push("bus.tuning.concurrency_utilization_warn must be in [0.0, 1.0]".to_string());
    }
    if bus.tuning.latency_warn_ms < 0.0 {
        errors.push("bus.tuning.latency_warn_ms must be >= 0".to_string());
    }
    if bus.tuning.history_trim_factor < 1.0 {
        errors.push("bus.tuning.history_trim_factor must be >= 1.0".to_string());
    }
    if bus.request.default_timeout_ms == 0 {
        errors.push("bus.request.default_timeout_ms must be > 0".to_string());
    }

    let level = config.logging.level.to_ascii_lowercase();
    if !matches!(
        level.as_str(),
        "trace" | "debug" | "info" | "warn" | "error"
    ) {
        errors.push(format!("logging.level '{}' is not a valid level", config.logging.level));
    }
    let format = config.logging.format.to_ascii_lowercase();
    if format != "text" && format != "json" {
        errors.push("logging.format must be 'text' or 'json'".to_string());
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(crate::Error::Config(errors.join("; ")))
    }
}
