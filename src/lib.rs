//! Loxone Miniserver to MQTT bridge library.
//!
//! The [`loxone`] module speaks the Miniserver's WebSocket protocol, the
//! [`mqtt`] module wraps the broker client, and [`bridge`] maps state
//! changes to topics and inbound command topics back to Miniserver
//! commands.

pub mod bridge;
pub mod config;
pub mod error;
pub mod loxone;
pub mod mqtt;
