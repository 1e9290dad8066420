//! Event and command pumps between the Miniserver and the broker.

use super::registry::Registry;
use super::topics::{StatePayload, TopicScheme};
use super::{Controller, MessageBus};
use crate::error::{BridgeError, Result};
use crate::loxone::{Event, Topology};
use crate::mqtt::MqttMessage;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use parking_lot::RwLock;
use rumqttc::QoS;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::time::{Instant, interval_at};
use tokio_util::sync::CancellationToken;

/// Why an inbound message did not become a Miniserver command.
#[derive(Debug, Error, PartialEq)]
pub enum Rejection {
    #[error("topic outside of {0}")]
    OutsideRoot(String),
    #[error("expected <room>/<control>/command")]
    Malformed,
    #[error("unknown control {room}/{control}")]
    UnknownControl { room: String, control: String },
    #[error("control {0} accepts no commands")]
    NoAction(String),
}

/// Translate an inbound command message into a Miniserver I/O command.
pub fn command_for(
    topics: &TopicScheme,
    registry: &Registry,
    topic: &str,
    payload: &[u8],
) -> std::result::Result<String, Rejection> {
    let inside_root = topic
        .strip_prefix(topics.root())
        .is_some_and(|rest| rest.starts_with('/'));
    if !inside_root {
        return Err(Rejection::OutsideRoot(topics.root().to_string()));
    }

    let (room, control) = topics.parse_command(topic).ok_or(Rejection::Malformed)?;
    let entry = registry
        .lookup_control_by_path(room, control)
        .ok_or_else(|| Rejection::UnknownControl {
            room: room.to_string(),
            control: control.to_string(),
        })?;
    let action = entry
        .control
        .action_id()
        .ok_or_else(|| Rejection::NoAction(entry.control.name.clone()))?;
    let value = String::from_utf8_lossy(payload);

    Ok(format!("jdev/sps/io/{}/{}", action, value))
}

/// Topic and body for an event, or `None` if the id is not mapped.
pub fn state_publication(
    topics: &TopicScheme,
    registry: &Registry,
    event: &Event,
    at: DateTime<Utc>,
) -> Option<(String, Vec<u8>)> {
    let state = registry.lookup_by_id(&event.id)?;
    let body = serde_json::to_vec(&StatePayload::new(&event.value, at)).ok()?;
    Some((topics.state(state), body))
}

/// Retained info messages for the controller, every room and every
/// path-addressable control.
pub fn info_publications(
    topics: &TopicScheme,
    topology: &Topology,
    registry: &Registry,
) -> Vec<(String, Vec<u8>)> {
    let controller = serde_json::to_vec(&topology.ms_info)
        .map(|body| (topics.controller_info(), body));
    let rooms = topology.rooms.values().map(|room| {
        serde_json::to_vec(room).map(|body| (topics.room_info(&room.name), body))
    });
    let controls = registry.mapped_controls().into_iter().map(|entry| {
        serde_json::to_vec(entry.control.as_ref())
            .map(|body| (topics.control_info(&entry.room_name, &entry.control.name), body))
    });

    std::iter::once(controller)
        .chain(rooms)
        .chain(controls)
        .filter_map(|encoded| match encoded {
            Ok(publication) => Some(publication),
            Err(e) => {
                warn!("Skipping info payload: {}", e);
                None
            }
        })
        .collect()
}

type SharedRegistry = Arc<RwLock<Arc<Registry>>>;

/// Runs one Miniserver against one broker.
pub struct Bridge<C, B> {
    controller: Arc<C>,
    bus: Arc<B>,
    topics: TopicScheme,
    registry: SharedRegistry,
    refresh: Option<Duration>,
}

impl<C, B> Bridge<C, B>
where
    C: Controller + 'static,
    B: MessageBus + 'static,
{
    pub fn new(controller: Arc<C>, bus: Arc<B>, topics: TopicScheme) -> Self {
        Self {
            controller,
            bus,
            topics,
            registry: Arc::new(RwLock::new(Arc::new(Registry::default()))),
            refresh: None,
        }
    }

    /// Re-check the structure file on this interval while running.
    pub fn with_refresh(mut self, interval: Option<Duration>) -> Self {
        self.refresh = interval;
        self
    }

    /// Current registry snapshot.
    pub fn registry(&self) -> Arc<Registry> {
        self.registry.read().clone()
    }

    /// Load the topology, enable push updates, publish info topics and
    /// subscribe to commands. The controller must already be connected.
    pub async fn start(&self) -> Result<()> {
        let topology = self.controller.get_topology().await?;
        let registry = Arc::new(Registry::build(&topology));
        info!(
            "Registry initialized: {} controls, {} states",
            registry.controls().len(),
            registry.len()
        );
        *self.registry.write() = registry.clone();

        self.controller.enable_status_updates().await?;
        publish_info(self.bus.as_ref(), &self.topics, &topology, &registry).await;

        self.bus
            .subscribe(&self.topics.command_filter(), QoS::AtLeastOnce)
            .await?;
        Ok(())
    }

    /// Pump events to the broker and commands to the Miniserver until `done`
    /// is cancelled or the Miniserver connection goes away.
    pub async fn run(
        &self,
        commands: mpsc::Receiver<MqttMessage>,
        done: CancellationToken,
    ) -> Result<()> {
        let mut events = self
            .controller
            .take_events()
            .ok_or_else(|| BridgeError::Transport("event stream already taken".to_string()))?;

        let command_task = tokio::spawn(run_command_loop(
            self.controller.clone(),
            self.registry.clone(),
            self.topics.clone(),
            commands,
            done.clone(),
        ));

        let refresh_task = self.refresh.map(|period| {
            tokio::spawn(run_refresh_loop(
                self.controller.clone(),
                self.bus.clone(),
                self.topics.clone(),
                self.registry.clone(),
                period,
                done.clone(),
            ))
        });

        info!("Starting event loop");
        let result = loop {
            tokio::select! {
                _ = done.cancelled() => break Ok(()),
                event = events.recv() => match event {
                    Some(event) => self.forward_event(&event).await,
                    None => {
                        error!("Miniserver event stream ended");
                        break Err(BridgeError::NotConnected);
                    }
                },
            }
        };

        command_task.abort();
        if let Some(task) = refresh_task {
            task.abort();
        }
        result
    }

    async fn forward_event(&self, event: &Event) {
        let registry = self.registry();
        let Some((topic, body)) = state_publication(&self.topics, &registry, event, Utc::now())
        else {
            return;
        };

        if let Err(e) = self.bus.publish(&topic, QoS::AtMostOnce, true, body).await {
            error!("Failed to publish {}: {}", topic, e);
        }
    }
}

async fn publish_info<B: MessageBus + ?Sized>(
    bus: &B,
    topics: &TopicScheme,
    topology: &Topology,
    registry: &Registry,
) {
    for (topic, body) in info_publications(topics, topology, registry) {
        if let Err(e) = bus.publish(&topic, QoS::AtLeastOnce, true, body).await {
            error!("Failed to publish {}: {}", topic, e);
        }
    }
}

/// Periodically re-check the structure file and swap in a new registry when
/// its version changed. Runs as its own task beside the event loop.
async fn run_refresh_loop<C: Controller, B: MessageBus>(
    controller: Arc<C>,
    bus: Arc<B>,
    topics: TopicScheme,
    registry: SharedRegistry,
    period: Duration,
    done: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);

    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let topology = tokio::select! {
            _ = done.cancelled() => return,
            fetched = controller.get_topology() => match fetched {
                Ok(topology) => topology,
                Err(e) => {
                    warn!("Structure refresh failed: {}", e);
                    continue;
                }
            },
        };

        if topology.last_modified == registry.read().version() {
            debug!("Structure unchanged");
            continue;
        }

        let rebuilt = Arc::new(Registry::build(&topology));
        *registry.write() = rebuilt.clone();
        info!(
            "Structure changed to {}, registry rebuilt with {} states",
            topology.last_modified,
            rebuilt.len()
        );
        publish_info(bus.as_ref(), &topics, &topology, &rebuilt).await;
    }
}

async fn run_command_loop<C: Controller>(
    controller: Arc<C>,
    registry: SharedRegistry,
    topics: TopicScheme,
    mut commands: mpsc::Receiver<MqttMessage>,
    done: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = done.cancelled() => return,
            message = commands.recv() => match message {
                Some(message) => message,
                None => return,
            },
        };

        let snapshot = registry.read().clone();
        match command_for(&topics, &snapshot, &message.topic, &message.payload) {
            Ok(command) => {
                info!("Sending command to Miniserver: {}", command);
                if let Err(e) = controller.send_command(&command).await {
                    error!("Failed to send command: {}", e);
                }
            }
            Err(rejection) => warn!("Ignoring {}: {}", message.topic, rejection),
        }
    }
}
