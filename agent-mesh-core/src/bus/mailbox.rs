//! Per-participant priority mailboxes and the registry that owns them

use parking_lot::Mutex;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::sync::Arc;
use tokio::sync::{RwLock, Semaphore};

use super::message::Message;

/// Heap entry; the sequence number keeps equal-rank messages FIFO
struct Queued {
    seq: u64,
    message: Message,
}

impl PartialEq for Queued {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Queued {}

impl PartialOrd for Queued {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Queued {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap pops the greatest entry, so the most urgent must compare greatest
        other
            .message
            .queue_cmp(&self.message)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

#[derive(Default)]
struct QueueState {
    heap: BinaryHeap<Queued>,
    next_seq: u64,
    closed: bool,
}

/// Why a push did not enqueue; the message is handed back to the caller
#[derive(Debug)]
pub(crate) enum PushError {
    /// Bounded mailbox has no free slot
    Full(Message),
    /// Mailbox was replaced or discarded
    Closed(Message),
}

/// Ordered queue of pending messages for one participant
///
/// `ready` carries one permit per queued message and `slots` one permit per
/// free place in a bounded mailbox, so waiting on either is cancel-safe.
pub(crate) struct Mailbox {
    owner: String,
    capacity: usize,
    state: Mutex<QueueState>,
    ready: Semaphore,
    slots: Option<Semaphore>,
}

impl Mailbox {
    /// `capacity == 0` means unbounded
    pub(crate) fn new(owner: impl Into<String>, capacity: usize) -> Self {
        let capacity = capacity.min(Semaphore::MAX_PERMITS);
        Self {
            owner: owner.into(),
            capacity,
            state: Mutex::new(QueueState::default()),
            ready: Semaphore::new(0),
            slots: (capacity > 0).then(|| Semaphore::new(capacity)),
        }
    }

    pub(crate) fn owner(&self) -> &str {
        &self.owner
    }

    pub(crate) fn capacity(&self) -> usize {
        self.capacity
    }

    pub(crate) fn len(&self) -> usize {
        self.state.lock().heap.len()
    }

    /// Fill ratio in [0, 1]; always 0 for unbounded mailboxes
    pub(crate) fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.len() as f64 / self.capacity as f64
        }
    }

    /// Enqueue, waiting for a free slot if the mailbox is bounded and full
    pub(crate) async fn push(&self, message: Message) -> Result<(), PushError> {
        if let Some(slots) = &self.slots {
            match slots.acquire().await {
                Ok(permit) => permit.forget(),
                Err(_) => return Err(PushError::Closed(message)),
            }
        }
        self.enqueue(message)
    }

    /// Enqueue without waiting
    pub(crate) fn try_push(&self, message: Message) -> Result<(), PushError> {
        if let Some(slots) = &self.slots {
            match slots.try_acquire() {
                Ok(permit) => permit.forget(),
                Err(tokio::sync::TryAcquireError::NoPermits) => {
                    return Err(PushError::Full(message))
                }
                Err(tokio::sync::TryAcquireError::Closed) => {
                    return Err(PushError::Closed(message))
                }
            }
        }
        self.enqueue(message)
    }

    fn enqueue(&self, message: Message) -> Result<(), PushError> {
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(PushError::Closed(message));
            }
            let seq = state.next_seq;
            state.next_seq += 1;
            state.heap.push(Queued { seq, message });
        }
        self.ready.add_permits(1);
        Ok(())
    }

    /// Wait for the most urgent message; `None` once the mailbox is closed
    pub(crate) async fn pop(&self) -> Option<Message> {
        let permit = self.ready.acquire().await.ok()?;
        permit.forget();
        let queued = self.state.lock().heap.pop()?;
        if let Some(slots) = &self.slots {
            slots.add_permits(1);
        }
        Some(queued.message)
    }

    /// Close the mailbox, waking every blocked sender and receiver.
    /// Returns the number of undelivered messages that were dropped.
    pub(crate) fn close(&self) -> usize {
        let dropped = {
            let mut state = self.state.lock();
            state.closed = true;
            let dropped = state.heap.len();
            state.heap.clear();
            dropped
        };
        self.ready.close();
        if let Some(slots) = &self.slots {
            slots.close();
        }
        dropped
    }
}

/// Owns the participant -> mailbox map
#[derive(Default)]
pub(crate) struct MailboxRegistry {
    mailboxes: RwLock<HashMap<String, Arc<Mailbox>>>,
}

impl MailboxRegistry {
    /// Returns false if `id` was already registered
    pub(crate) async fn register(&self, id: &str, capacity: usize) -> bool {
        let mut mailboxes = self.mailboxes.write().await;
        if mailboxes.contains_key(id) {
            return false;
        }
        mailboxes.insert(id.to_string(), Arc::new(Mailbox::new(id, capacity)));
        true
    }

    /// Remove and close a mailbox; returns the dropped message count
    pub(crate) async fn unregister(&self, id: &str) -> Option<usize> {
        let removed = self.mailboxes.write().await.remove(id);
        removed.map(|mailbox| mailbox.close())
    }

    /// Swap in a fresh mailbox of the same capacity and close the old one
    pub(crate) async fn reset(&self, id: &str) -> Option<usize> {
        let old = {
            let mut mailboxes = self.mailboxes.write().await;
            let capacity = mailboxes.get(id)?.capacity();
            mailboxes.insert(id.to_string(), Arc::new(Mailbox::new(id, capacity)))?
        };
        Some(old.close())
    }

    pub(crate) async fn get(&self, id: &str) -> crate::Result<Arc<Mailbox>> {
        let mailboxes = self.mailboxes.read().await;
        match mailboxes.get(id) {
            Some(mailbox) => Ok(Arc::clone(mailbox)),
            None => {
                let mut known: Vec<String> = mailboxes.keys().cloned().collect();
                known.sort();
                Err(crate::Error::UnknownParticipant {
                    id: id.to_string(),
                    known,
                })
            }
        }
    }

    pub(crate) async fn contains(&self, id: &str) -> bool {
        self.mailboxes.read().await.contains_key(id)
    }

    /// Registered ids in map iteration order (unspecified)
    pub(crate) async fn ids(&self) -> Vec<String> {
        self.mailboxes.read().await.keys().cloned().collect()
    }

    pub(crate) async fn snapshot(&self) -> Vec<Arc<Mailbox>> {
        self.mailboxes.read().await.values().cloned().collect()
    }

    /// Remove every registration; returns (participants, dropped messages)
    pub(crate) async fn close_all(&self) -> (usize, usize) {
        let drained: Vec<Arc<Mailbox>> = {
            let mut mailboxes = self.mailboxes.write().await;
            mailboxes.drain().map(|(_, mailbox)| mailbox).collect()
        };
        let dropped = drained.iter().map(|mailbox| mailbox.close()).sum();
        (drained.len(), dropped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::message::Priority;
    use chrono::Utc;
    use std::time::Duration;

    fn msg(priority: Priority, tag: &str) -> Message {
        Message::new("a", "b", tag, serde_json::Value::Null).with_priority(priority)
    }

    #[tokio::test]
    async fn test_pop_priority_then_fifo() {
        let mailbox = Mailbox::new("b", 0);
        let ts = Utc::now();
        for (priority, tag) in [
            (Priority::Low, "low"),
            (Priority::Normal, "normal-1"),
            (Priority::High, "high"),
            (Priority::Normal, "normal-2"),
        ] {
            mailbox
                .try_push(msg(priority, tag).with_timestamp(ts))
                .unwrap();
        }

        let mut order = Vec::new();
        for _ in 0..4 {
            order.push(mailbox.pop().await.unwrap().message_type().to_string());
        }
        assert_eq!(order, vec!["high", "normal-1", "normal-2", "low"]);
    }

    #[tokio::test]
    async fn test_bounded_try_push_reports_full() {
        let mailbox = Mailbox::new("b", 2);
        mailbox.try_push(msg(Priority::Normal, "1")).unwrap();
        mailbox.try_push(msg(Priority::Normal, "2")).unwrap();
        assert!((mailbox.utilization() - 1.0).abs() < f64::EPSILON);

        match mailbox.try_push(msg(Priority::Normal, "3")) {
            Err(PushError::Full(returned)) => assert_eq!(returned.message_type(), "3"),
            other => panic!("expected Full, got {:?}", other),
        }

        mailbox.pop().await.unwrap();
        mailbox.try_push(msg(Priority::Normal, "3")).unwrap();
        assert_eq!(mailbox.len(), 2);
    }

    #[tokio::test]
    async fn test_blocked_push_resumes_after_pop() {
        let mailbox = Arc::new(Mailbox::new("b", 1));
        mailbox.try_push(msg(Priority::Normal, "first")).unwrap();

        let pusher = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move { mailbox.push(msg(Priority::Normal, "second")).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!pusher.is_finished());

        assert_eq!(mailbox.pop().await.unwrap().message_type(), "first");
        pusher.await.unwrap().unwrap();
        assert_eq!(mailbox.pop().await.unwrap().message_type(), "second");
    }

    #[tokio::test]
    async fn test_close_wakes_waiters_and_drops_messages() {
        let mailbox = Arc::new(Mailbox::new("b", 0));
        let receiver = {
            let mailbox = Arc::clone(&mailbox);
            tokio::spawn(async move { mailbox.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        mailbox.try_push(msg(Priority::Normal, "x")).unwrap();
        assert!(receiver.await.unwrap().is_some());

        mailbox.try_push(msg(Priority::Normal, "y")).unwrap();
        assert_eq!(mailbox.close(), 1);
        assert!(mailbox.pop().await.is_none());
        assert!(matches!(
            mailbox.try_push(msg(Priority::Normal, "z")),
            Err(PushError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_registry_reset_keeps_capacity() {
        let registry = MailboxRegistry::default();
        assert!(registry.register("b", 3).await);
        assert!(!registry.register("b", 9).await);

        let mailbox = registry.get("b").await.unwrap();
        mailbox.try_push(msg(Priority::Normal, "x")).unwrap();

        assert_eq!(registry.reset("b").await, Some(1));
        let fresh = registry.get("b").await.unwrap();
        assert_eq!(fresh.capacity(), 3);
        assert_eq!(fresh.len(), 0);
        assert!(registry.reset("ghost").await.is_none());
    }

    #[tokio::test]
    async fn test_registry_unknown_lists_sorted_ids() {
        let registry = MailboxRegistry::default();
        registry.register("zed", 0).await;
        registry.register("amy", 0).await;

        match registry.get("ghost").await {
            Err(crate::Error::UnknownParticipant { id, known }) => {
                assert_eq!(id, "ghost");
                assert_eq!(known, vec!["amy".to_string(), "zed".to_string()]);
            }
            other => panic!("expected UnknownParticipant, got {:?}", other.map(|_| ())),
        }
    }
}
