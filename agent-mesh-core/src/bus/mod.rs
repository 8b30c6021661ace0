//! Message bus for decoupled communication
//!
//! Participants register a mailbox and exchange prioritized messages.
//! Ordering within a mailbox is priority-major, FIFO-minor; request/response
//! exchanges are correlated by id over the same mailboxes.

mod governor;
pub mod handler;
mod mailbox;
pub mod message;
pub mod queue;
mod request;
pub mod telemetry;

pub use governor::ConcurrencySnapshot;
pub use handler::{HandlerId, MessageHandler};
pub use message::{HistoryEntry, Message, Priority};
pub use queue::MessageBus;
pub use telemetry::{
    Advisory, BusStats, LatencySummary, OptimizationReport, PerformanceSnapshot,
};
