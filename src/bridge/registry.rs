//! Flattened index over a [`Topology`].
//!
//! Controls (including nested sub-controls) are laid out in one table; each
//! addressable state is keyed both by its [`DeviceId`] and by its sanitized
//! `room/control/state` path. A registry is immutable once built; a new
//! topology produces a new registry.

use crate::loxone::{Control, DeviceId, Topology};
use log::warn;
use std::collections::HashMap;
use std::sync::Arc;

/// Room name used when a control's room is missing from the topology.
pub const UNKNOWN_ROOM: &str = "unknown";

/// Path component normalisation: lowercase, spaces become hyphens.
pub fn sanitize(name: &str) -> String {
    name.to_lowercase().replace(' ', "-")
}

fn control_key(room: &str, control: &str) -> String {
    format!("{}/{}", sanitize(room), sanitize(control))
}

fn state_key(room: &str, control: &str, state: &str) -> String {
    format!("{}/{}/{}", sanitize(room), sanitize(control), sanitize(state))
}

/// A flattened control with its resolved room name.
#[derive(Debug, Clone)]
pub struct ControlEntry {
    pub control: Arc<Control>,
    pub room_name: String,
}

/// One addressable state.
#[derive(Debug, Clone)]
pub struct State {
    pub control: Arc<Control>,
    pub name: String,
    pub id: DeviceId,
    pub room_name: String,
}

#[derive(Debug, Default)]
pub struct Registry {
    version: String,
    controls: Vec<ControlEntry>,
    control_paths: HashMap<String, usize>,
    states: HashMap<DeviceId, State>,
    state_paths: HashMap<String, DeviceId>,
}

impl Registry {
    pub fn build(topology: &Topology) -> Self {
        let mut registry = Self {
            version: topology.last_modified.clone(),
            ..Self::default()
        };

        for control in topology.controls.values() {
            let room_name = topology
                .rooms
                .get(&control.room)
                .map(|room| room.name.as_str())
                .unwrap_or(UNKNOWN_ROOM);
            registry.register(control, room_name);
        }

        registry
    }

    fn register(&mut self, control: &Control, room_name: &str) {
        let shared = Arc::new(control.clone());
        let index = self.controls.len();
        self.controls.push(ControlEntry {
            control: shared.clone(),
            room_name: room_name.to_string(),
        });
        self.control_paths
            .insert(control_key(room_name, &control.name), index);

        for (state_name, state_ref) in &control.states {
            let path = state_key(room_name, &control.name, state_name);

            // Every element of an array-valued state gets its own id entry;
            // the path key ends up pointing at the last one.
            for raw in state_ref.identifiers() {
                let id: DeviceId = match raw.parse() {
                    Ok(id) => id,
                    Err(e) => {
                        warn!(
                            "Skipping state {} of {}: bad identifier {:?}: {}",
                            state_name, control.name, raw, e
                        );
                        continue;
                    }
                };

                self.states.insert(
                    id,
                    State {
                        control: shared.clone(),
                        name: state_name.clone(),
                        id,
                        room_name: room_name.to_string(),
                    },
                );
                self.state_paths.insert(path.clone(), id);
            }
        }

        // Sub-controls live in the parent's room.
        for sub_control in control.sub_controls.values() {
            self.register(sub_control, room_name);
        }
    }

    /// `lastModified` of the topology this registry was built from.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn lookup_by_id(&self, id: &DeviceId) -> Option<&State> {
        self.states.get(id)
    }

    pub fn lookup_by_path(&self, room: &str, control: &str, state: &str) -> Option<&State> {
        let id = self.state_paths.get(&state_key(room, control, state))?;
        self.states.get(id)
    }

    pub fn lookup_control_by_path(&self, room: &str, control: &str) -> Option<&ControlEntry> {
        let index = *self.control_paths.get(&control_key(room, control))?;
        self.controls.get(index)
    }

    pub fn controls(&self) -> &[ControlEntry] {
        &self.controls
    }

    /// Controls reachable by path, one per sanitized room/control key, in path order.
    pub fn mapped_controls(&self) -> Vec<&ControlEntry> {
        let mut paths: Vec<(&String, &usize)> = self.control_paths.iter().collect();
        paths.sort();
        paths
            .into_iter()
            .filter_map(|(_, &index)| self.controls.get(index))
            .collect()
    }

    pub fn states(&self) -> impl Iterator<Item = &State> {
        self.states.values()
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }
}
