//! Message handlers driven by tracked, cancellable background tasks

use async_trait::async_trait;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::message::Message;
use super::queue::MessageBus;

/// Identifies a running handler task
pub type HandlerId = u64;

/// Consumer of a participant's mailbox
///
/// Errors and panics raised by `handle` are logged; the handler keeps
/// receiving afterwards.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, message: Message) -> crate::Result<()>;
}

/// Adapts an async closure into a [`MessageHandler`]
pub(crate) struct FnHandler<F> {
    callback: F,
}

impl<F> FnHandler<F> {
    pub(crate) fn new(callback: F) -> Self {
        Self { callback }
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = crate::Result<()>> + Send + 'static,
{
    async fn handle(&self, message: Message) -> crate::Result<()> {
        (self.callback)(message).await
    }
}

struct HandlerTask {
    participant: String,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Running handler tasks, keyed by id
#[derive(Default)]
pub(crate) struct HandlerRegistry {
    next_id: AtomicU64,
    tasks: Mutex<HashMap<HandlerId, HandlerTask>>,
}

impl HandlerRegistry {
    pub(crate) fn spawn(
        &self,
        bus: MessageBus,
        participant: String,
        handler: Arc<dyn MessageHandler>,
    ) -> HandlerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let token = CancellationToken::new();
        let handle = tokio::spawn(run_handler(
            bus,
            participant.clone(),
            handler,
            token.clone(),
            id,
        ));

        info!(handler = id, %participant, "Started handler");
        self.tasks.lock().insert(
            id,
            HandlerTask {
                participant,
                token,
                handle,
            },
        );
        id
    }

    /// Cancel one handler and wait for its task to finish
    pub(crate) async fn stop(&self, id: HandlerId) -> bool {
        let Some(task) = self.tasks.lock().remove(&id) else {
            return false;
        };
        task.token.cancel();
        if let Err(e) = task.handle.await {
            warn!(handler = id, participant = %task.participant, error = %e, "Handler ended abnormally");
        }
        true
    }

    /// Cancel every handler and wait for all of them; returns the count
    pub(crate) async fn stop_all(&self) -> usize {
        let drained: Vec<(HandlerId, HandlerTask)> = self.tasks.lock().drain().collect();
        for (_, task) in &drained {
            task.token.cancel();
        }
        let count = drained.len();
        for (id, task) in drained {
            if let Err(e) = task.handle.await {
                warn!(handler = id, participant = %task.participant, error = %e, "Handler ended abnormally");
            }
        }
        count
    }

    /// Handlers whose task is still running
    pub(crate) fn active(&self) -> usize {
        let mut tasks = self.tasks.lock();
        tasks.retain(|_, task| !task.handle.is_finished());
        tasks.len()
    }
}

async fn run_handler(
    bus: MessageBus,
    participant: String,
    handler: Arc<dyn MessageHandler>,
    token: CancellationToken,
    id: HandlerId,
) {
    let poll = bus.config().mailbox.subscribe_poll();
    loop {
        let received = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            received = bus.receive(&participant, Some(poll)) => received,
        };

        let message = match received {
            Ok(message) => message,
            Err(e) if e.is_timeout() => continue,
            Err(e) => {
                warn!(handler = id, %participant, error = %e, "Handler stopping");
                break;
            }
        };

        let message_type = message.message_type().to_string();
        let outcome = tokio::select! {
            biased;
            _ = token.cancelled() => break,
            outcome = AssertUnwindSafe(handler.handle(message)).catch_unwind() => outcome,
        };
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(
                handler = id,
                %participant,
                %message_type,
                error = %e,
                "Handler failed"
            ),
            Err(_) => error!(handler = id, %participant, %message_type, "Handler panicked"),
        }
    }
    debug!(handler = id, %participant, "Handler stopped");
}
