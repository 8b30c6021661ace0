//! Correlation-id keyed promises for request/response exchanges

use parking_lot::Mutex;
use std::collections::HashMap;
use tokio::sync::oneshot;

use super::message::Message;

type ReplySender = oneshot::Sender<crate::Result<Message>>;
pub(crate) type ReplyReceiver = oneshot::Receiver<crate::Result<Message>>;

/// Outstanding requests awaiting a reply
///
/// Every settle operation removes the entry first, so a correlation id is
/// resolved, failed or cancelled at most once.
#[derive(Default)]
pub(crate) struct PendingRequests {
    waiting: Mutex<HashMap<String, ReplySender>>,
}

impl PendingRequests {
    /// Register a promise for `correlation_id`
    pub(crate) fn insert(&self, correlation_id: &str) -> ReplyReceiver {
        let (tx, rx) = oneshot::channel();
        self.waiting.lock().insert(correlation_id.to_string(), tx);
        rx
    }

    /// Deliver the matching reply; false if the request is no longer pending
    pub(crate) fn resolve(&self, correlation_id: &str, reply: Message) -> bool {
        self.settle(correlation_id, Ok(reply))
    }

    pub(crate) fn fail(&self, correlation_id: &str, error: crate::Error) -> bool {
        self.settle(correlation_id, Err(error))
    }

    pub(crate) fn cancel(&self, correlation_id: &str) -> bool {
        self.fail(
            correlation_id,
            crate::Error::RequestCancelled {
                correlation_id: correlation_id.to_string(),
            },
        )
    }

    /// Cancel every outstanding request; returns how many were cancelled
    pub(crate) fn cancel_all(&self) -> usize {
        let drained: Vec<(String, ReplySender)> = self.waiting.lock().drain().collect();
        let count = drained.len();
        for (correlation_id, tx) in drained {
            let _ = tx.send(Err(crate::Error::RequestCancelled { correlation_id }));
        }
        count
    }

    /// Forget a request without notifying the waiter
    pub(crate) fn remove(&self, correlation_id: &str) -> bool {
        self.waiting.lock().remove(correlation_id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.waiting.lock().len()
    }

    fn settle(&self, correlation_id: &str, outcome: crate::Result<Message>) -> bool {
        let Some(tx) = self.waiting.lock().remove(correlation_id) else {
            return false;
        };
        // The caller may already have given up; that still counts as settled.
        let _ = tx.send(outcome);
        true
    }
}
