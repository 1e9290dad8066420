//! MQTT topic naming and payloads.

use super::registry::{State, sanitize};
use crate::loxone::EventValue;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;

/// Topic builder rooted at `{prefix}/{serial}`.
#[derive(Debug, Clone)]
pub struct TopicScheme {
    root: String,
}

impl TopicScheme {
    pub fn new(prefix: &str, serial: &str) -> Self {
        Self {
            root: format!("{}/{}", prefix, serial),
        }
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn controller_info(&self) -> String {
        format!("{}/_info", self.root)
    }

    pub fn room_info(&self, room: &str) -> String {
        format!("{}/{}/_info", self.root, sanitize(room))
    }

    pub fn control_info(&self, room: &str, control: &str) -> String {
        format!("{}/{}/{}/_info", self.root, sanitize(room), sanitize(control))
    }

    /// `{root}/{room}/{control}/{type}_{state}`
    pub fn state(&self, state: &State) -> String {
        format!(
            "{}/{}/{}/{}_{}",
            self.root,
            sanitize(&state.room_name),
            sanitize(&state.control.name),
            sanitize(&state.control.control_type),
            sanitize(&state.name)
        )
    }

    pub fn command_filter(&self) -> String {
        format!("{}/+/+/command", self.root)
    }

    /// Split an inbound command topic into its room and control segments.
    ///
    /// The topic must be `{root}/{room}/{control}/command` exactly.
    pub fn parse_command<'a>(&self, topic: &'a str) -> Option<(&'a str, &'a str)> {
        let suffix = topic.strip_prefix(self.root.as_str())?.strip_prefix('/')?;
        let mut parts = suffix.split('/');
        match (parts.next(), parts.next(), parts.next(), parts.next()) {
            (Some(room), Some(control), Some("command"), None) => Some((room, control)),
            _ => None,
        }
    }
}

/// Body published on state topics.
#[derive(Debug, Serialize)]
pub struct StatePayload<'a> {
    pub value: PayloadValue<'a>,
    pub ts: String,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum PayloadValue<'a> {
    Number(f64),
    Text(&'a str),
}

impl<'a> StatePayload<'a> {
    pub fn new(value: &'a EventValue, at: DateTime<Utc>) -> Self {
        let value = match value {
            EventValue::Value(v) => PayloadValue::Number(*v),
            EventValue::Text(text) => PayloadValue::Text(text),
        };
        Self {
            value,
            ts: at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}
