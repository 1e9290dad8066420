//! Loxone Miniserver protocol client.
//!
//! Connects to the Miniserver over its WebSocket, authenticates with a
//! token handshake, fetches the structure file, and decodes pushed state
//! changes into [`Event`]s.

pub mod auth;
pub mod client;
pub mod codec;
pub mod crypto;
pub mod multiplexer;
pub mod response;
pub mod structure;

#[cfg(test)]
pub(crate) mod testing;

use crate::error::Result;
use async_trait::async_trait;

pub use auth::{Credentials, Token};
pub use client::LoxoneClient;
pub use codec::{DeviceId, Event, EventValue};
pub use structure::{Control, Room, StateRef, StructureCache, Topology};

/// Anything that can send a text command to the Miniserver.
///
/// Replies are not returned here; they arrive on the response queue and
/// are correlated by [`response::ResponseQueue::wait_for`].
#[async_trait]
pub trait CommandSink: Send + Sync {
    async fn send_command(&self, command: &str) -> Result<()>;
}
