//! Scripted Miniserver stand-in for unit tests.

use super::CommandSink;
use super::response::ResponseQueue;
use crate::error::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

/// Records every command and answers the ones it has a script for by
/// pushing the scripted messages into the response queue.
pub struct FakeMiniserver {
    tx: mpsc::Sender<Vec<u8>>,
    replies: Mutex<Vec<(String, Vec<Vec<u8>>)>>,
    sent: Mutex<Vec<String>>,
}

impl FakeMiniserver {
    pub fn new() -> (Self, ResponseQueue) {
        let (tx, queue) = ResponseQueue::channel(64);
        let fake = Self {
            tx,
            replies: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
        };
        (fake, queue)
    }

    /// Answer commands starting with `prefix` with `messages`, in order.
    pub fn reply(&self, prefix: &str, messages: Vec<Vec<u8>>) {
        self.replies.lock().push((prefix.to_string(), messages));
    }

    /// Answer commands starting with `prefix` with an `LL` envelope.
    pub fn reply_ll(&self, prefix: &str, control: &str, value: serde_json::Value) {
        let body = serde_json::json!({
            "LL": { "control": control, "value": value, "Code": "200" }
        });
        self.reply(prefix, vec![body.to_string().into_bytes()]);
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().clone()
    }
}

#[async_trait]
impl CommandSink for FakeMiniserver {
    async fn send_command(&self, command: &str) -> Result<()> {
        self.sent.lock().push(command.to_string());

        let messages = self
            .replies
            .lock()
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, messages)| messages.clone())
            .unwrap_or_default();

        for message in messages {
            let _ = self.tx.try_send(message);
        }
        Ok(())
    }
}
