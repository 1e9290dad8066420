//! Glue between the Miniserver and the MQTT broker.

mod orchestrator;
pub mod registry;
pub mod topics;

pub use orchestrator::{Bridge, Rejection, command_for, info_publications, state_publication};
pub use registry::{Registry, State, sanitize};
pub use topics::TopicScheme;

use crate::error::Result;
use crate::loxone::{CommandSink, Event, LoxoneClient, Topology};
use crate::mqtt::MqttHandle;
use async_trait::async_trait;
use rumqttc::QoS;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Miniserver operations the bridge needs once the connection is up.
#[async_trait]
pub trait Controller: CommandSink {
    async fn get_topology(&self) -> Result<Arc<Topology>>;
    async fn enable_status_updates(&self) -> Result<()>;
    fn take_events(&self) -> Option<mpsc::Receiver<Event>>;
}

#[async_trait]
impl Controller for LoxoneClient {
    async fn get_topology(&self) -> Result<Arc<Topology>> {
        LoxoneClient::get_topology(self).await
    }

    async fn enable_status_updates(&self) -> Result<()> {
        LoxoneClient::enable_status_updates(self).await
    }

    fn take_events(&self) -> Option<mpsc::Receiver<Event>> {
        LoxoneClient::take_events(self)
    }
}

/// Publish side of the broker.
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()>;
    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()>;
}

#[async_trait]
impl MessageBus for MqttHandle {
    async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        MqttHandle::publish(self, topic, qos, retain, payload).await
    }

    async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        MqttHandle::subscribe(self, filter, qos).await
    }
}
