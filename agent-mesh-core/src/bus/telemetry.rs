//! Message history, latency aggregation and performance reports

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use super::governor::ConcurrencySnapshot;
use super::message::{HistoryEntry, Message};
use crate::config::TelemetryConfig;

/// Latencies observed for one message type
///
/// Recent samples are kept in a fixed-size ring; count/sum/min/max cover
/// every sample ever recorded.
#[derive(Debug, Clone, Default)]
struct LatencyRecord {
    samples: VecDeque<f64>,
    count: u64,
    sum_ms: f64,
    min_ms: f64,
    max_ms: f64,
}

impl LatencyRecord {
    fn record(&mut self, latency_ms: f64, keep: usize) {
        if self.count == 0 {
            self.min_ms = latency_ms;
            self.max_ms = latency_ms;
        } else {
            self.min_ms = self.min_ms.min(latency_ms);
            self.max_ms = self.max_ms.max(latency_ms);
        }
        self.count += 1;
        self.sum_ms += latency_ms;

        if self.samples.len() >= keep {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    fn summary(&self) -> LatencySummary {
        LatencySummary {
            count: self.count,
            avg_ms: if self.count == 0 {
                0.0
            } else {
                self.sum_ms / self.count as f64
            },
            min_ms: self.min_ms,
            max_ms: self.max_ms,
            recent_samples: self.samples.len(),
        }
    }
}

/// Latency summary for one message type
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LatencySummary {
    pub count: u64,
    pub avg_ms: f64,
    pub min_ms: f64,
    pub max_ms: f64,
    /// Samples currently retained in the ring
    pub recent_samples: usize,
}

/// Full bus statistics
#[derive(Debug, Clone, Serialize)]
pub struct BusStats {
    pub started_at: DateTime<Utc>,
    pub uptime_secs: f64,
    pub total_messages: u64,
    /// `total_messages / uptime_secs`
    pub throughput_per_sec: f64,
    pub latency: HashMap<String, LatencySummary>,
    pub queue_depths: HashMap<String, usize>,
    pub pending_requests: usize,
    pub history_size: usize,
    pub concurrency: ConcurrencySnapshot,
    /// Messages consumed and discarded while waiting for a reply
    pub mismatched_replies: u64,
    pub active_handlers: usize,
}

/// Cheap dashboard view of the bus
#[derive(Debug, Clone, Serialize)]
pub struct PerformanceSnapshot {
    pub window_secs: u64,
    /// Messages per second sent within the window
    pub recent_throughput_per_sec: f64,
    /// Percent full, per participant; unbounded mailboxes report 0
    pub mailbox_utilization_pct: HashMap<String, f64>,
    pub concurrency_utilization_pct: f64,
    /// Average over every latency sample of every message type
    pub average_latency_ms: f64,
}

/// Condition flagged by `optimize_performance`
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Advisory {
    MailboxPressure {
        participant: String,
        utilization_pct: f64,
    },
    ConcurrencyPressure {
        utilization_pct: f64,
    },
    HighLatency {
        average_ms: f64,
        threshold_ms: f64,
    },
}

/// Outcome of one maintenance pass
#[derive(Debug, Clone, Serialize, Default)]
pub struct OptimizationReport {
    /// History entries evicted by this pass
    pub history_trimmed: usize,
    pub advisories: Vec<Advisory>,
}

pub(crate) struct Telemetry {
    started: Instant,
    started_at: DateTime<Utc>,
    total_messages: AtomicU64,
    mismatched: AtomicU64,
    history: Mutex<VecDeque<HistoryEntry>>,
    history_capacity: usize,
    latencies: Mutex<HashMap<String, LatencyRecord>>,
    samples_per_type: usize,
    window: Duration,
}

impl Telemetry {
    pub(crate) fn new(config: &TelemetryConfig) -> Self {
        let history_capacity = config.history_capacity.max(1);
        Self {
            started: Instant::now(),
            started_at: Utc::now(),
            total_messages: AtomicU64::new(0),
            mismatched: AtomicU64::new(0),
            history: Mutex::new(VecDeque::with_capacity(history_capacity)),
            history_capacity,
            latencies: Mutex::new(HashMap::new()),
            samples_per_type: config.latency_samples_per_type.max(1),
            window: Duration::from_secs(config.throughput_window_secs.max(1)),
        }
    }

    /// Count a delivered message and append it to the history ring
    pub(crate) fn record_sent(&self, entry: HistoryEntry) {
        self.total_messages.fetch_add(1, Ordering::Relaxed);
        let mut history = self.history.lock();
        while history.len() >= self.history_capacity {
            history.pop_front();
        }
        history.push_back(entry);
    }

    /// Record receive-time latency for a message
    pub(crate) fn record_received(&self, message: &Message) {
        let elapsed = Utc::now() - message.timestamp();
        let latency_ms = elapsed
            .num_microseconds()
            .map(|us| us as f64 / 1000.0)
            .unwrap_or(elapsed.num_milliseconds() as f64)
            .max(0.0);
        self.latencies
            .lock()
            .entry(message.message_type().to_string())
            .or_default()
            .record(latency_ms, self.samples_per_type);
    }

    pub(crate) fn record_mismatch(&self) {
        self.mismatched.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn total_messages(&self) -> u64 {
        self.total_messages.load(Ordering::Relaxed)
    }

    pub(crate) fn mismatched(&self) -> u64 {
        self.mismatched.load(Ordering::Relaxed)
    }

    pub(crate) fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub(crate) fn uptime(&self) -> Duration {
        self.started.elapsed()
    }

    pub(crate) fn window(&self) -> Duration {
        self.window
    }

    pub(crate) fn history_len(&self) -> usize {
        self.history.lock().len()
    }

    /// Most recent `limit` entries (all when `None`), oldest first
    pub(crate) fn history(&self, limit: Option<usize>) -> Vec<HistoryEntry> {
        let history = self.history.lock();
        let skip = limit.map_or(0, |limit| history.len().saturating_sub(limit));
        history.iter().skip(skip).cloned().collect()
    }

    pub(crate) fn latency_summaries(&self) -> HashMap<String, LatencySummary> {
        self.latencies
            .lock()
            .iter()
            .map(|(message_type, record)| (message_type.clone(), record.summary()))
            .collect()
    }

    /// Mean over every retained sample of every type
    pub(crate) fn average_latency_ms(&self) -> f64 {
        let latencies = self.latencies.lock();
        let (sum, count) = latencies
            .values()
            .flat_map(|record| record.samples.iter())
            .fold((0.0, 0usize), |(sum, count), ms| (sum + ms, count + 1));
        if count == 0 {
            0.0
        } else {
            sum / count as f64
        }
    }

    /// Sends per second over the throughput window, measured from history
    ///
    /// Entries carry creation time, which is not monotonic in send order, so
    /// every retained entry is checked.
    pub(crate) fn recent_throughput(&self) -> f64 {
        let Ok(window) = chrono::Duration::from_std(self.window) else {
            return 0.0;
        };
        let cutoff = Utc::now() - window;
        let recent = self
            .history
            .lock()
            .iter()
            .filter(|entry| entry.timestamp >= cutoff)
            .count();
        recent as f64 / self.window.as_secs_f64()
    }

    /// Drop all but the newest `history_capacity` entries once the history
    /// grows past `history_capacity * factor`; returns the number evicted.
    /// Factors below 1.0 act as 1.0.
    pub(crate) fn trim_history(&self, factor: f64) -> usize {
        let mut history = self.history.lock();
        let limit = (self.history_capacity as f64 * factor.max(1.0)) as usize;
        if history.len() <= limit {
            return 0;
        }
        let excess = history.len().saturating_sub(self.history_capacity);
        history.drain(..excess);
        excess
    }
}
