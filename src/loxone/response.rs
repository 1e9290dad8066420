//! Solicited-response correlation.
//!
//! Miniserver replies carry no request ID. A reply is matched to its
//! command by a substring of the `LL.control` field, so waiting for a
//! reply means draining the response queue until a matching message shows
//! up. Non-matching messages are consumed and dropped.

use crate::error::{BridgeError, Result};
use log::{debug, trace};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;

/// Reply timeout for ordinary commands.
pub const RESPONSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Generic `{"LL": {...}}` reply envelope.
#[derive(Debug, Clone, Deserialize)]
pub struct LoxResponse {
    #[serde(rename = "LL")]
    pub ll: LoxResponseBody,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoxResponseBody {
    #[serde(default)]
    pub control: String,
    #[serde(default)]
    pub value: serde_json::Value,
    /// Older firmware sends `Code`, newer `code`; either may be a number or a string.
    #[serde(default, rename = "Code", alias = "code")]
    pub code: Option<serde_json::Value>,
}

impl LoxResponse {
    /// Parse a raw message as a reply envelope.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        serde_json::from_slice(bytes).ok()
    }

    /// Numeric status code, if the reply carries one.
    pub fn code(&self) -> Option<u16> {
        match self.ll.code.as_ref()? {
            serde_json::Value::Number(n) => n.as_u64().and_then(|c| u16::try_from(c).ok()),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Decode the `value` field into a typed structure.
    pub fn value_as<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.ll.value.clone()).map_err(|e| {
            BridgeError::MalformedResponse(format!("{}: {}", self.ll.control, e))
        })
    }
}

/// Receiving half of the solicited-response queue.
pub struct ResponseQueue {
    rx: Mutex<mpsc::Receiver<Vec<u8>>>,
}

impl ResponseQueue {
    pub fn new(rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self { rx: Mutex::new(rx) }
    }

    /// Create a bounded queue, returning the sender for the read loop.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Vec<u8>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self::new(rx))
    }

    /// Drop everything already queued, e.g. unread replies to I/O commands.
    pub async fn discard_pending(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut dropped = 0;
        while rx.try_recv().is_ok() {
            dropped += 1;
        }
        if dropped > 0 {
            debug!("Discarded {} stale replies", dropped);
        }
        dropped
    }

    /// Wait for a reply whose control field contains `tag`.
    pub async fn wait_for(&self, tag: &str, timeout: Duration) -> Result<LoxResponse> {
        let deadline = Instant::now() + timeout;
        let mut rx = self.rx.lock().await;

        loop {
            let message = match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(message)) => message,
                Ok(None) => return Err(BridgeError::NotConnected),
                Err(_) => return Err(BridgeError::HandshakeTimeout(tag.to_string())),
            };

            match LoxResponse::parse(&message) {
                Some(response) if response.ll.control.contains(tag) => {
                    debug!("Reply for {}: code={:?}", tag, response.code());
                    return Ok(response);
                }
                Some(response) => trace!("Skipping reply for {}", response.ll.control),
                None => trace!("Skipping non-reply message ({} bytes)", message.len()),
            }
        }
    }

    /// Wait for the first raw message accepted by `matches`.
    ///
    /// Returns `None` on timeout or when the read loop has gone away.
    pub async fn wait_for_raw<F>(&self, matches: F, timeout: Duration) -> Option<Vec<u8>>
    where
        F: Fn(&[u8]) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut rx = self.rx.lock().await;

        loop {
            match tokio::time::timeout_at(deadline, rx.recv()).await {
                Ok(Some(message)) if matches(&message) => return Some(message),
                Ok(Some(message)) => {
                    trace!("Skipping message ({} bytes)", message.len());
                }
                Ok(None) | Err(_) => return None,
            }
        }
    }
}
