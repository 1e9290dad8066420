//! MQTT side of the bridge.

mod client;

pub use client::{MqttClient, MqttHandle, MqttMessage, mqtt_options};
