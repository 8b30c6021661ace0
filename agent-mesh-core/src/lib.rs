//! Core of agent-mesh
//!
//! An in-process, asynchronous, priority-aware message bus routing typed
//! messages between independently scheduled participants, with the
//! configuration, error and logging layers around it.

pub mod bus;
pub mod config;
pub mod error;
pub mod logging;
pub mod utils;

pub use bus::{Message, MessageBus, Priority};
pub use error::{Error, Result};
