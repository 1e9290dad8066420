//! Structure file (`LoxAPP3.json`) model and version-checked cache.

use super::CommandSink;
use super::response::{RESPONSE_TIMEOUT, ResponseQueue};
use crate::error::{BridgeError, Result};
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

/// The structure file is large; give the Miniserver time to send it.
const STRUCTURE_TIMEOUT: Duration = Duration::from_secs(30);

const VERSION_COMMAND: &str = "jdev/sps/LoxAPPversion3";
const DOCUMENT_COMMAND: &str = "data/LoxAPP3.json";

/// Root of the structure file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Topology {
    #[serde(default)]
    pub last_modified: String,
    /// Miniserver info block, republished verbatim.
    #[serde(default)]
    pub ms_info: serde_json::Value,
    #[serde(default)]
    pub rooms: BTreeMap<String, Room>,
    #[serde(default)]
    pub cats: BTreeMap<String, Category>,
    #[serde(default)]
    pub controls: BTreeMap<String, Control>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Room {
    pub name: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    #[serde(rename = "type", default)]
    pub category_type: String,
    #[serde(default)]
    pub uuid: String,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A function block (switch, dimmer, blind, ...), possibly with sub-controls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Control {
    pub name: String,
    #[serde(rename = "type", default)]
    pub control_type: String,
    #[serde(default)]
    pub uuid_action: String,
    /// Room UUID
    #[serde(default)]
    pub room: String,
    /// Category UUID
    #[serde(default)]
    pub cat: String,
    #[serde(default)]
    pub states: BTreeMap<String, StateRef>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub sub_controls: BTreeMap<String, Control>,
}

impl Control {
    /// Identifier that accepts commands for this control, if any.
    pub fn action_id(&self) -> Option<&str> {
        Some(self.uuid_action.as_str()).filter(|id| !id.is_empty())
    }
}

/// Value of a `states` entry: one identifier, or several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateRef {
    Single(String),
    Many(Vec<serde_json::Value>),
    /// Objects and other shapes some blocks use; not addressable.
    Other(serde_json::Value),
}

impl StateRef {
    /// Identifier strings in declaration order.
    pub fn identifiers(&self) -> Vec<&str> {
        match self {
            StateRef::Single(id) => vec![id.as_str()],
            StateRef::Many(items) => items.iter().filter_map(|item| item.as_str()).collect(),
            StateRef::Other(_) => Vec::new(),
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|window| window == needle)
}

/// The structure file arrives unwrapped on the shared channel, so it is
/// recognised by its top-level fields rather than by a control tag.
fn is_structure_document(message: &[u8]) -> bool {
    contains(message, b"lastModified") && contains(message, b"msInfo")
}

/// In-memory structure cache keyed by the file's `lastModified` version.
#[derive(Default)]
pub struct StructureCache {
    cached: Mutex<Option<Arc<Topology>>>,
}

impl StructureCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Last topology fetched, if any.
    pub fn cached(&self) -> Option<Arc<Topology>> {
        self.cached.lock().clone()
    }

    /// Return the current topology, fetching it only when the version changed.
    pub async fn get_topology(
        &self,
        sink: &dyn CommandSink,
        responses: &ResponseQueue,
    ) -> Result<Arc<Topology>> {
        sink.send_command(VERSION_COMMAND).await?;
        let response = responses
            .wait_for("LoxAPPversion3", RESPONSE_TIMEOUT)
            .await
            .map_err(|e| match e {
                BridgeError::HandshakeTimeout(_) => BridgeError::StructureTimeout,
                other => other,
            })?;

        let version = match response.value_as::<String>() {
            Ok(version) => version,
            Err(e) => {
                warn!("Could not read structure version, fetching anyway: {}", e);
                String::new()
            }
        };

        if !version.is_empty()
            && let Some(cached) = self.cached()
            && cached.last_modified == version
        {
            return Ok(cached);
        }

        sink.send_command(DOCUMENT_COMMAND).await?;
        let document = responses
            .wait_for_raw(is_structure_document, STRUCTURE_TIMEOUT)
            .await
            .ok_or(BridgeError::StructureTimeout)?;

        let topology: Topology = serde_json::from_slice(&document)
            .map_err(|e| BridgeError::MalformedResponse(format!("structure file: {}", e)))?;
        let topology = Arc::new(topology);

        *self.cached.lock() = Some(topology.clone());
        info!(
            "Structure updated: version {}, {} controls",
            topology.last_modified,
            topology.controls.len()
        );

        Ok(topology)
    }
}
