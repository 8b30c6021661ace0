//! Async priority message bus

use futures::Stream;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use super::governor::ConcurrencyGovernor;
use super::handler::{FnHandler, HandlerId, HandlerRegistry, MessageHandler};
use super::mailbox::{MailboxRegistry, PushError};
use super::message::{HistoryEntry, Message, Priority};
use super::request::PendingRequests;
use super::telemetry::{
    Advisory, BusStats, OptimizationReport, PerformanceSnapshot, Telemetry,
};
use crate::config::{BusConfig, FullMailboxPolicy};
use crate::utils::preview_json;
use crate::{Error, Result};

const PREVIEW_LEN: usize = 80;

/// How long a send may wait for space in a bounded mailbox
#[derive(Clone, Copy)]
enum SendWait {
    Forever,
    Until(Instant, Duration),
    Never,
}

/// In-process message bus routing prioritized messages between participants
///
/// Each participant owns a mailbox that dequeues in priority order, then
/// creation time. Cloning the bus is cheap; all clones share state.
#[derive(Clone)]
pub struct MessageBus {
    config: Arc<BusConfig>,
    registry: Arc<MailboxRegistry>,
    governor: Arc<ConcurrencyGovernor>,
    telemetry: Arc<Telemetry>,
    pending: Arc<PendingRequests>,
    handlers: Arc<HandlerRegistry>,
}

impl MessageBus {
    /// Create a new message bus with default settings
    pub fn new() -> Self {
        Self::with_config(BusConfig::default())
    }

    /// Create a new message bus from configuration
    pub fn with_config(config: BusConfig) -> Self {
        Self {
            governor: Arc::new(ConcurrencyGovernor::new(&config.governor)),
            telemetry: Arc::new(Telemetry::new(&config.telemetry)),
            registry: Arc::new(MailboxRegistry::default()),
            pending: Arc::new(PendingRequests::default()),
            handlers: Arc::new(HandlerRegistry::default()),
            config: Arc::new(config),
        }
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    // ----- registration -------------------------------------------------

    /// Create a mailbox for `id`; `capacity == 0` means unbounded.
    /// Registering an existing id logs a warning and changes nothing.
    pub async fn register(&self, id: impl Into<String>, capacity: usize) {
        let id = id.into();
        if self.registry.register(&id, capacity).await {
            info!(participant = %id, capacity, "Registered participant");
        } else {
            warn!(participant = %id, "Participant already registered");
        }
    }

    /// Register with the configured default mailbox capacity
    pub async fn register_default(&self, id: impl Into<String>) {
        self.register(id, self.config.mailbox.default_capacity)
            .await;
    }

    /// Remove a participant, discarding undelivered messages.
    /// Returns false (with a warning) if `id` was not registered.
    pub async fn unregister(&self, id: &str) -> bool {
        match self.registry.unregister(id).await {
            Some(dropped) => {
                info!(participant = %id, dropped, "Unregistered participant");
                true
            }
            None => {
                warn!(participant = %id, "Cannot unregister unknown participant");
                false
            }
        }
    }

    /// Hard reset: replace the mailbox with an empty one of the same capacity
    pub async fn clear(&self, id: &str) -> Result<()> {
        match self.registry.reset(id).await {
            Some(dropped) => {
                info!(participant = %id, dropped, "Cleared mailbox");
                Ok(())
            }
            None => Err(self.registry.get(id).await.err().unwrap_or_else(|| {
                Error::Internal(format!("mailbox '{}' vanished during clear", id))
            })),
        }
    }

    pub async fn is_registered(&self, id: &str) -> bool {
        self.registry.contains(id).await
    }

    /// Registered participant ids, sorted
    pub async fn participants(&self) -> Vec<String> {
        let mut ids = self.registry.ids().await;
        ids.sort();
        ids
    }

    // ----- send / receive -----------------------------------------------

    /// Enqueue a message for its recipient
    ///
    /// On a full bounded mailbox this waits for space, or fails with
    /// [`Error::MailboxFull`] when the bus is configured to reject.
    pub async fn send(&self, message: Message) -> Result<()> {
        let wait = match self.config.mailbox.full_mailbox_policy {
            FullMailboxPolicy::Block => SendWait::Forever,
            FullMailboxPolicy::Reject => SendWait::Never,
        };
        self.deliver(message, wait).await
    }

    /// Enqueue without waiting; fails with [`Error::MailboxFull`] when full
    pub async fn try_send(&self, message: Message) -> Result<()> {
        self.deliver(message, SendWait::Never).await
    }

    /// Enqueue, waiting at most `timeout` for space in a bounded mailbox
    pub async fn send_timeout(&self, message: Message, timeout: Duration) -> Result<()> {
        self.deliver(message, SendWait::Until(Instant::now() + timeout, timeout))
            .await
    }

    async fn deliver(&self, mut message: Message, wait: SendWait) -> Result<()> {
        let entry = HistoryEntry::from(&message);
        trace!(
            from = %entry.from,
            to = %entry.to,
            content = %preview_json(message.content(), PREVIEW_LEN),
            "Sending message"
        );

        loop {
            let mailbox = self.registry.get(message.recipient()).await?;
            let pushed = match wait {
                SendWait::Forever => mailbox.push(message).await,
                SendWait::Never => mailbox.try_push(message),
                SendWait::Until(deadline, after) => {
                    match tokio::time::timeout_at(deadline, mailbox.push(message)).await {
                        Ok(pushed) => pushed,
                        Err(_) => {
                            return Err(Error::Timeout {
                                operation: "send",
                                after,
                            })
                        }
                    }
                }
            };

            match pushed {
                Ok(()) => break,
                // Mailbox was cleared or unregistered under us; look it up again.
                Err(PushError::Closed(returned)) => message = returned,
                Err(PushError::Full(_)) => {
                    return Err(Error::MailboxFull {
                        id: mailbox.owner().to_string(),
                        capacity: mailbox.capacity(),
                    })
                }
            }
        }

        debug!(
            from = %entry.from,
            to = %entry.to,
            message_type = %entry.message_type,
            priority = %entry.priority,
            "Message sent"
        );
        self.telemetry.record_sent(entry);
        Ok(())
    }

    /// Dequeue the most urgent message for `id`
    ///
    /// Waits until a message is available, or fails with [`Error::Timeout`]
    /// once `timeout` elapses. `None` waits indefinitely.
    pub async fn receive(&self, id: &str, timeout: Option<Duration>) -> Result<Message> {
        // Unknown ids fail before taking a governor permit.
        self.registry.get(id).await?;
        let deadline = timeout.map(|after| (Instant::now() + after, after));
        let timed_out = |after| Error::Timeout {
            operation: "receive",
            after,
        };

        let _permit = match deadline {
            Some((deadline, after)) => tokio::time::timeout_at(deadline, self.governor.acquire())
                .await
                .map_err(|_| timed_out(after))??,
            None => self.governor.acquire().await?,
        };

        loop {
            let mailbox = self.registry.get(id).await?;
            let popped = match deadline {
                Some((deadline, after)) => tokio::time::timeout_at(deadline, mailbox.pop())
                    .await
                    .map_err(|_| timed_out(after))?,
                None => mailbox.pop().await,
            };

            // `None` means the mailbox was replaced or removed; retry the lookup.
            if let Some(message) = popped {
                self.telemetry.record_received(&message);
                debug!(
                    participant = %id,
                    from = %message.sender(),
                    message_type = %message.message_type(),
                    "Message received"
                );
                return Ok(message);
            }
        }
    }

    /// Endless stream of messages for `id`
    ///
    /// Polls with the configured interval and silently retries on timeout.
    /// Dropping the stream leaves the mailbox untouched; the stream ends only
    /// when `id` is unregistered.
    pub fn subscribe(&self, id: impl Into<String>) -> impl Stream<Item = Message> + Send + 'static {
        let poll = self.config.mailbox.subscribe_poll();
        futures::stream::unfold((self.clone(), id.into()), move |(bus, id)| async move {
            loop {
                match bus.receive(&id, Some(poll)).await {
                    Ok(message) => return Some((message, (bus, id))),
                    Err(e) if e.is_timeout() => continue,
                    Err(e) => {
                        debug!(participant = %id, error = %e, "Subscription ended");
                        return None;
                    }
                }
            }
        })
    }

    // ----- request / response -------------------------------------------

    /// Send a request and wait for the reply carrying the same correlation id
    ///
    /// While the request is outstanding the caller's mailbox is consumed by a
    /// background receiver; unrelated messages arriving meanwhile are
    /// discarded unless `request.preserve_unmatched` is set. `timeout`
    /// defaults to `request.default_timeout_ms`.
    pub async fn send_request(
        &self,
        from: &str,
        to: &str,
        message_type: &str,
        content: Value,
        priority: Priority,
        timeout: Option<Duration>,
    ) -> Result<Message> {
        // The reply listener consumes the requester's own mailbox.
        self.registry.get(from).await?;
        let timeout = timeout.unwrap_or_else(|| self.config.request.default_timeout());
        let deadline = Instant::now() + timeout;
        let correlation_id = Uuid::new_v4().to_string();
        let mut reply_rx = self.pending.insert(&correlation_id);

        let token = CancellationToken::new();
        let listener = tokio::spawn(self.clone().await_reply(
            from.to_string(),
            correlation_id.clone(),
            token.clone(),
        ));

        let request = Message::new(from, to, message_type, content)
            .with_priority(priority)
            .with_correlation_id(correlation_id.clone());
        debug!(%correlation_id, %from, %to, %message_type, "Sending request");

        let sent = match tokio::time::timeout_at(deadline, self.send(request)).await {
            Ok(sent) => sent,
            Err(_) => Err(Error::Timeout {
                operation: "send_request",
                after: timeout,
            }),
        };
        if let Err(e) = sent {
            self.pending.remove(&correlation_id);
            stop_listener(token, listener).await;
            return Err(e);
        }

        match tokio::time::timeout_at(deadline, &mut reply_rx).await {
            Ok(Ok(Ok(reply))) => {
                debug!(%correlation_id, "Request resolved");
                stop_listener(token, listener).await;
                Ok(reply)
            }
            Ok(Ok(Err(e))) => {
                stop_listener(token, listener).await;
                Err(e)
            }
            Ok(Err(_)) => {
                stop_listener(token, listener).await;
                Err(Error::Internal(format!(
                    "reply channel for {} closed unexpectedly",
                    correlation_id
                )))
            }
            Err(_) => {
                self.pending.remove(&correlation_id);
                stop_listener(token, listener).await;
                // A reply may have landed between the deadline and the cancel.
                if let Ok(Ok(reply)) = reply_rx.try_recv() {
                    return Ok(reply);
                }
                warn!(%correlation_id, ?timeout, "Request timed out");
                Err(Error::Timeout {
                    operation: "send_request",
                    after: timeout,
                })
            }
        }
    }

    /// Background receiver for one outstanding request
    async fn await_reply(self, owner: String, correlation_id: String, token: CancellationToken) {
        let mut stash = Vec::new();
        loop {
            let received = tokio::select! {
                biased;
                _ = token.cancelled() => break,
                received = self.receive(&owner, None) => received,
            };
            match received {
                Ok(message) if message.correlation_id() == Some(correlation_id.as_str()) => {
                    self.pending.resolve(&correlation_id, message);
                    break;
                }
                Ok(message) => {
                    self.telemetry.record_mismatch();
                    warn!(
                        participant = %owner,
                        expected = %correlation_id,
                        got = ?message.correlation_id(),
                        message_type = %message.message_type(),
                        "Mismatched correlation id while awaiting reply"
                    );
                    if self.config.request.preserve_unmatched {
                        stash.push(message);
                    }
                }
                Err(e) => {
                    self.pending.fail(&correlation_id, e);
                    break;
                }
            }
        }
        if !stash.is_empty() {
            self.restore_unmatched(&owner, stash).await;
        }
    }

    /// Put stashed messages back into the requester's mailbox
    async fn restore_unmatched(&self, owner: &str, stash: Vec<Message>) {
        let Ok(mailbox) = self.registry.get(owner).await else {
            warn!(participant = %owner, count = stash.len(), "Dropping stashed messages, participant gone");
            return;
        };
        let count = stash.len();
        for message in stash {
            if let Err(PushError::Full(message) | PushError::Closed(message)) =
                mailbox.try_push(message)
            {
                warn!(
                    participant = %owner,
                    message_type = %message.message_type(),
                    "Could not restore stashed message"
                );
            }
        }
        debug!(participant = %owner, count, "Restored unmatched messages");
    }

    /// Reply to a request; defaults to HIGH priority so replies are not
    /// starved behind bulk traffic
    pub async fn send_response(
        &self,
        from: &str,
        to: &str,
        message_type: &str,
        content: Value,
        correlation_id: &str,
    ) -> Result<()> {
        self.send_response_with_priority(
            from,
            to,
            message_type,
            content,
            correlation_id,
            Priority::High,
        )
        .await
    }

    pub async fn send_response_with_priority(
        &self,
        from: &str,
        to: &str,
        message_type: &str,
        content: Value,
        correlation_id: &str,
        priority: Priority,
    ) -> Result<()> {
        let reply = Message::new(from, to, message_type, content)
            .with_correlation_id(correlation_id)
            .with_priority(priority);
        self.send(reply).await
    }

    /// Cancel an outstanding request; its caller receives
    /// [`Error::RequestCancelled`]
    pub fn cancel_request(&self, correlation_id: &str) -> bool {
        self.pending.cancel(correlation_id)
    }

    pub fn pending_requests(&self) -> usize {
        self.pending.len()
    }

    // ----- broadcast -----------------------------------------------------

    /// Deliver a copy of `message` to every participant except its sender
    /// and `exclude`; returns the number of copies delivered
    ///
    /// Copies go through [`MessageBus::send`] one after another, in no
    /// particular order. Recipients that vanish or reject mid-fan-out are
    /// skipped with a warning.
    pub async fn broadcast(&self, message: Message, exclude: Option<&str>) -> Result<usize> {
        let mut delivered = 0;
        for id in self.registry.ids().await {
            if id == message.sender() || exclude == Some(id.as_str()) {
                continue;
            }
            match self.send(message.readdressed(&id)).await {
                Ok(()) => delivered += 1,
                Err(e @ (Error::UnknownParticipant { .. } | Error::MailboxFull { .. })) => {
                    warn!(participant = %id, error = %e, "Broadcast copy skipped");
                }
                Err(e) => return Err(e),
            }
        }
        debug!(
            from = %message.sender(),
            message_type = %message.message_type(),
            delivered,
            "Broadcast complete"
        );
        Ok(delivered)
    }

    // ----- handlers ------------------------------------------------------

    /// Run `handler` on every message delivered to `participant` in a
    /// tracked background task
    pub fn spawn_handler(
        &self,
        participant: impl Into<String>,
        handler: Arc<dyn MessageHandler>,
    ) -> HandlerId {
        self.handlers
            .spawn(self.clone(), participant.into(), handler)
    }

    /// Callback form of [`MessageBus::spawn_handler`]
    pub fn subscribe_with<F, Fut>(&self, participant: impl Into<String>, callback: F) -> HandlerId
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.spawn_handler(participant, Arc::new(FnHandler::new(callback)))
    }

    /// Cancel a handler and wait for it to stop
    pub async fn stop_handler(&self, id: HandlerId) -> bool {
        self.handlers.stop(id).await
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.active()
    }

    // ----- telemetry ----------------------------------------------------

    pub async fn get_stats(&self) -> BusStats {
        let uptime = self.telemetry.uptime();
        let total_messages = self.telemetry.total_messages();
        let uptime_secs = uptime.as_secs_f64();
        let queue_depths = self
            .registry
            .snapshot()
            .await
            .iter()
            .map(|mailbox| (mailbox.owner().to_string(), mailbox.len()))
            .collect();

        BusStats {
            started_at: self.telemetry.started_at(),
            uptime_secs,
            total_messages,
            throughput_per_sec: if uptime_secs > 0.0 {
                total_messages as f64 / uptime_secs
            } else {
                0.0
            },
            latency: self.telemetry.latency_summaries(),
            queue_depths,
            pending_requests: self.pending.len(),
            history_size: self.telemetry.history_len(),
            concurrency: self.governor.snapshot(),
            mismatched_replies: self.telemetry.mismatched(),
            active_handlers: self.handlers.active(),
        }
    }

    pub async fn get_performance_snapshot(&self) -> PerformanceSnapshot {
        let mailbox_utilization_pct: HashMap<String, f64> = self
            .registry
            .snapshot()
            .await
            .iter()
            .map(|mailbox| (mailbox.owner().to_string(), mailbox.utilization() * 100.0))
            .collect();

        PerformanceSnapshot {
            window_secs: self.telemetry.window().as_secs(),
            recent_throughput_per_sec: self.telemetry.recent_throughput(),
            mailbox_utilization_pct,
            concurrency_utilization_pct: self.governor.utilization() * 100.0,
            average_latency_ms: self.telemetry.average_latency_ms(),
        }
    }

    /// Maintenance pass: trims oversized history and reports pressure
    ///
    /// Only the history trim changes state; everything else is advisory.
    pub async fn optimize_performance(&self) -> OptimizationReport {
        let tuning = &self.config.tuning;
        let mut report = OptimizationReport {
            history_trimmed: self.telemetry.trim_history(tuning.history_trim_factor),
            advisories: Vec::new(),
        };
        if report.history_trimmed > 0 {
            info!(trimmed = report.history_trimmed, "Trimmed message history");
        }

        let mut mailboxes = self.registry.snapshot().await;
        mailboxes.sort_by(|a, b| a.owner().cmp(b.owner()));
        for mailbox in mailboxes {
            let utilization = mailbox.utilization();
            if utilization > tuning.mailbox_utilization_warn {
                report.advisories.push(Advisory::MailboxPressure {
                    participant: mailbox.owner().to_string(),
                    utilization_pct: utilization * 100.0,
                });
            }
        }

        let concurrency = self.governor.utilization();
        if concurrency > tuning.concurrency_utilization_warn {
            report.advisories.push(Advisory::ConcurrencyPressure {
                utilization_pct: concurrency * 100.0,
            });
        }

        let average_ms = self.telemetry.average_latency_ms();
        if average_ms > tuning.latency_warn_ms {
            report.advisories.push(Advisory::HighLatency {
                average_ms,
                threshold_ms: tuning.latency_warn_ms,
            });
        }

        for advisory in &report.advisories {
            warn!(?advisory, "Performance advisory");
        }
        report
    }

    /// Most recent `limit` history entries (all when `None`), oldest first
    pub fn get_message_history(&self, limit: Option<usize>) -> Vec<HistoryEntry> {
        self.telemetry.history(limit)
    }

    // ----- lifecycle ----------------------------------------------------

    /// Stop handlers, cancel outstanding requests and drop every mailbox
    ///
    /// In-flight messages are discarded. Callers needing a graceful drain
    /// must stop producers and await their receives first.
    pub async fn shutdown(&self) {
        info!("Shutting down message bus");
        let handlers = self.handlers.stop_all().await;
        let cancelled = self.pending.cancel_all();
        let (participants, dropped) = self.registry.close_all().await;
        let concurrency = self.governor.snapshot();

        info!(
            total_messages = self.telemetry.total_messages(),
            participants,
            dropped,
            cancelled_requests = cancelled,
            stopped_handlers = handlers,
            receives = concurrency.acquired,
            uptime_secs = self.telemetry.uptime().as_secs_f64(),
            "Message bus shut down"
        );
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn stop_listener(token: CancellationToken, listener: tokio::task::JoinHandle<()>) {
    token.cancel();
    if let Err(e) = listener.await {
        warn!(error = %e, "Reply listener ended abnormally");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_message_bus_creation() {
        let bus = MessageBus::new();
        assert!(bus.participants().await.is_empty());
        assert_eq!(bus.pending_requests(), 0);
        assert_eq!(bus.handler_count(), 0);
    }

    #[tokio::test]
    async fn test_register_is_idempotent() {
        let bus = MessageBus::new();
        bus.register("a", 2).await;
        bus.send(Message::new("x", "a", "t", json!(1))).await.unwrap();
        bus.register("a", 0).await;

        // Second registration must not replace the mailbox or its contents.
        let stats = bus.get_stats().await;
        assert_eq!(stats.queue_depths["a"], 1);
        assert_eq!(bus.participants().await, vec!["a".to_string()]);
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_non_fatal() {
        let bus = MessageBus::new();
        assert!(!bus.unregister("nobody").await);
        bus.register("a", 0).await;
        assert!(bus.unregister("a").await);
        assert!(!bus.is_registered("a").await);
    }

    #[tokio::test]
    async fn test_clear_drops_pending_messages() {
        let bus = MessageBus::new();
        bus.register("a", 0).await;
        bus.send(Message::new("x", "a", "t", json!(1))).await.unwrap();
        bus.clear("a").await.unwrap();

        let err = bus
            .receive("a", Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(bus.clear("ghost").await.unwrap_err().is_unknown_participant());
    }

    #[tokio::test]
    async fn test_clear_moves_blocked_receiver_to_fresh_mailbox() {
        let bus = MessageBus::new();
        bus.register("a", 0).await;

        let receiver = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.receive("a", Some(Duration::from_secs(2))).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.clear("a").await.unwrap();
        bus.send(Message::new("x", "a", "after-clear", json!(null)))
            .await
            .unwrap();

        let message = receiver.await.unwrap().unwrap();
        assert_eq!(message.message_type(), "after-clear");
    }

    #[tokio::test]
    async fn test_receive_records_latency_and_history() {
        let bus = MessageBus::new();
        bus.register("a", 0).await;
        bus.send(Message::new("x", "a", "ping", json!({})))
            .await
            .unwrap();
        bus.receive("a", Some(Duration::from_secs(1))).await.unwrap();

        let stats = bus.get_stats().await;
        assert_eq!(stats.total_messages, 1);
        assert_eq!(stats.latency["ping"].count, 1);
        assert_eq!(stats.history_size, 1);
        assert_eq!(stats.concurrency.acquired, 1);
        assert_eq!(stats.concurrency.released, 1);
        assert_eq!(bus.get_message_history(None)[0].to, "a");
    }

    #[tokio::test]
    async fn test_unregister_wakes_blocked_receiver() {
        let bus = MessageBus::new();
        bus.register("a", 0).await;
        let receiver = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.receive("a", None).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.unregister("a").await;

        let err = receiver.await.unwrap().unwrap_err();
        assert!(err.is_unknown_participant());
        assert_eq!(bus.get_stats().await.concurrency.in_use, 0);
    }

    #[tokio::test]
    async fn test_optimize_flags_full_mailbox() {
        let bus = MessageBus::new();
        bus.register("a", 5).await;
        bus.register("b", 0).await;
        for i in 0..5 {
            bus.send(Message::new("x", "a", "t", json!(i))).await.unwrap();
        }

        let report = bus.optimize_performance().await;
        assert_eq!(report.history_trimmed, 0);
        assert_eq!(
            report.advisories,
            vec![Advisory::MailboxPressure {
                participant: "a".to_string(),
                utilization_pct: 100.0,
            }]
        );

        let snapshot = bus.get_performance_snapshot().await;
        assert!((snapshot.mailbox_utilization_pct["a"] - 100.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.mailbox_utilization_pct["b"], 0.0);
    }

    #[tokio::test]
    async fn test_optimize_flags_high_latency() {
        let mut config = BusConfig::default();
        config.tuning.latency_warn_ms = 5.0;
        let bus = MessageBus::with_config(config);
        bus.register("a", 0).await;
        let stale = Message::new("x", "a", "slow", json!(null))
            .with_timestamp(chrono::Utc::now() - chrono::Duration::milliseconds(50));
        bus.send(stale).await.unwrap();
        bus.receive("a", Some(Duration::from_secs(1))).await.unwrap();

        let report = bus.optimize_performance().await;
        assert!(report
            .advisories
            .iter()
            .any(|a| matches!(a, Advisory::HighLatency { average_ms, .. } if *average_ms >= 50.0)));
    }

    #[tokio::test]
    async fn test_stale_message_does_not_hide_recent_throughput() {
        let bus = MessageBus::new();
        bus.register("a", 0).await;
        for i in 0..30 {
            bus.send(Message::new("x", "a", "fresh", json!(i))).await.unwrap();
        }
        let before = bus.get_performance_snapshot().await.recent_throughput_per_sec;

        let stale = Message::new("x", "a", "stale", json!(null))
            .with_timestamp(chrono::Utc::now() - chrono::Duration::seconds(120));
        bus.send(stale).await.unwrap();
        let after = bus.get_performance_snapshot().await.recent_throughput_per_sec;

        assert!((before - 0.5).abs() < 1e-9);
        assert!((after - before).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_optimize_with_low_trim_factor_does_not_panic() {
        let mut config = BusConfig::default();
        config.tuning.history_trim_factor = 0.5;
        let bus = MessageBus::with_config(config);
        bus.register("a", 0).await;
        for i in 0..60 {
            bus.send(Message::new("x", "a", "t", json!(i))).await.unwrap();
        }

        let report = bus.optimize_performance().await;
        assert_eq!(report.history_trimmed, 0);
        assert_eq!(bus.get_message_history(None).len(), 60);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_optimize_flags_concurrency_pressure() {
        let mut config = BusConfig::default();
        config.governor.max_concurrent_receives = 2;
        let bus = MessageBus::with_config(config);
        bus.register("a", 0).await;

        let mut receivers = Vec::new();
        for _ in 0..2 {
            let bus = bus.clone();
            receivers.push(tokio::spawn(async move {
                bus.receive("a", Some(Duration::from_secs(5))).await
            }));
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while bus.get_stats().await.concurrency.in_use < 2 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let report = bus.optimize_performance().await;
        assert!(report.advisories.iter().any(|a| matches!(
            a,
            Advisory::ConcurrencyPressure { utilization_pct } if (*utilization_pct - 100.0).abs() < f64::EPSILON
        )));

        for i in 0..2 {
            bus.send(Message::new("x", "a", "t", json!(i))).await.unwrap();
        }
        for receiver in receivers {
            receiver.await.unwrap().unwrap();
        }
        let report = bus.optimize_performance().await;
        assert!(!report
            .advisories
            .iter()
            .any(|a| matches!(a, Advisory::ConcurrencyPressure { .. })));
    }

    #[tokio::test]
    async fn test_broadcast_skips_full_recipient() {
        let mut config = BusConfig::default();
        config.mailbox.full_mailbox_policy = FullMailboxPolicy::Reject;
        let bus = MessageBus::with_config(config);
        bus.register("src", 0).await;
        bus.register("full", 1).await;
        bus.register("open", 0).await;
        bus.send(Message::new("x", "full", "filler", json!(null)))
            .await
            .unwrap();

        let delivered = bus
            .broadcast(Message::new("src", "", "news", json!(1)), None)
            .await
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(bus.get_stats().await.queue_depths["full"], 1);
        let copy = bus.receive("open", Some(Duration::from_millis(50))).await.unwrap();
        assert_eq!(copy.message_type(), "news");
    }
}
