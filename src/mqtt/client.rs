//! MQTT client wrapper for the broker side of the bridge.

use crate::config::{MqttConfig, MqttProtocol};
use crate::error::Result;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, Transport};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// Message received from the MQTT broker.
#[derive(Debug, Clone, PartialEq)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Broker options for the configured transport.
pub fn mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut options = if config.protocol.is_websocket() {
        // Websocket transports take the full URL as the broker address.
        let url = format!(
            "{}://{}:{}{}",
            config.protocol, config.host, config.port, config.path
        );
        MqttOptions::new(&config.client_id, url, config.port)
    } else {
        MqttOptions::new(&config.client_id, &config.host, config.port)
    };
    options.set_keep_alive(Duration::from_secs(30));

    match config.protocol {
        MqttProtocol::Tcp => {}
        MqttProtocol::Ssl => {
            options.set_transport(Transport::tls_with_default_config());
        }
        MqttProtocol::Ws => {
            options.set_transport(Transport::Ws);
        }
        MqttProtocol::Wss => {
            options.set_transport(Transport::wss_with_default_config());
        }
    }

    if let Some((username, password)) = config.credentials() {
        options.set_credentials(username, password);
    }

    options
}

type Subscriptions = Arc<Mutex<Vec<(String, QoS)>>>;

/// MQTT client owning the event loop.
pub struct MqttClient {
    client: AsyncClient,
    event_loop: EventLoop,
    subscriptions: Subscriptions,
}

impl MqttClient {
    /// Create a new MQTT client from configuration.
    pub fn new(config: &MqttConfig) -> Self {
        info!(
            "MQTT broker {}:{} over {}",
            config.host, config.port, config.protocol
        );
        let (client, event_loop) = AsyncClient::new(mqtt_options(config), 100);

        Self {
            client,
            event_loop,
            subscriptions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Cloneable handle for publishing and subscribing from other tasks.
    pub fn handle(&self) -> MqttHandle {
        MqttHandle {
            client: self.client.clone(),
            subscriptions: self.subscriptions.clone(),
        }
    }

    /// Run the MQTT event loop and forward incoming publishes to `tx`.
    ///
    /// `connected` fires on the first ConnAck. Every later ConnAck re-issues
    /// the recorded subscriptions. Runs until a DISCONNECT has been written,
    /// `done` is cancelled, or the receiving side of `tx` goes away.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<MqttMessage>,
        mut connected: Option<oneshot::Sender<()>>,
        done: CancellationToken,
    ) {
        info!("Starting MQTT event loop");

        loop {
            let polled = tokio::select! {
                _ = done.cancelled() => break,
                polled = self.event_loop.poll() => polled,
            };

            match polled {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("Connected to MQTT broker ({:?})", ack.code);
                    if let Some(signal) = connected.take() {
                        let _ = signal.send(());
                    }
                    self.resubscribe();
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let msg = MqttMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    };
                    debug!("Received MQTT message on {} ({} bytes)", msg.topic, msg.payload.len());

                    if tx.send(msg).await.is_err() {
                        error!("MQTT message channel closed");
                        break;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                    info!("Disconnected from MQTT broker");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("MQTT connection error: {:?}", e);
                    // Wait before reconnecting
                    tokio::select! {
                        _ = done.cancelled() => break,
                        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
                    }
                }
            }
        }

        info!("MQTT event loop stopped");
    }

    fn resubscribe(&self) {
        let subscriptions = self.subscriptions.lock().clone();
        for (topic, qos) in subscriptions {
            // The request channel is drained by this loop, so never await here.
            if let Err(e) = self.client.try_subscribe(&topic, qos) {
                warn!("Failed to re-subscribe to {}: {}", topic, e);
            }
        }
    }
}

/// Publish/subscribe handle shared with the bridge.
#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
    subscriptions: Subscriptions,
}

impl MqttHandle {
    /// Publish a message to a topic.
    pub async fn publish(&self, topic: &str, qos: QoS, retain: bool, payload: Vec<u8>) -> Result<()> {
        debug!("Publishing to {} ({} bytes)", topic, payload.len());
        self.client.publish(topic, qos, retain, payload).await?;
        Ok(())
    }

    /// Subscribe to a topic filter and remember it for reconnects.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        info!("Subscribing to MQTT topic: {}", filter);
        {
            let mut subscriptions = self.subscriptions.lock();
            if !subscriptions.iter().any(|(topic, _)| topic == filter) {
                subscriptions.push((filter.to_string(), qos));
            }
        }
        self.client.subscribe(filter, qos).await?;
        Ok(())
    }

    /// Queue a DISCONNECT. The event loop writes it and then stops.
    pub async fn disconnect(&self) -> Result<()> {
        self.client.disconnect().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(protocol: MqttProtocol) -> MqttConfig {
        let mut config = MqttConfig {
            host: "broker.local".to_string(),
            port: 8883,
            protocol,
            ..MqttConfig::default()
        };
        config.validate().unwrap();
        config
    }

    #[test]
    fn test_tcp_options() {
        let options = mqtt_options(&config(MqttProtocol::Tcp));
        assert_eq!(
            options.broker_address(),
            ("broker.local".to_string(), 8883)
        );
        assert_eq!(options.client_id(), "lox-bridge");
        assert!(matches!(options.transport(), Transport::Tcp));
    }

    #[test]
    fn test_ssl_options() {
        let options = mqtt_options(&config(MqttProtocol::Ssl));
        assert_eq!(options.broker_address().0, "broker.local");
        assert!(matches!(options.transport(), Transport::Tls(_)));
    }

    #[test]
    fn test_websocket_options_use_url() {
        let options = mqtt_options(&config(MqttProtocol::Ws));
        assert_eq!(
            options.broker_address(),
            ("ws://broker.local:8883/mqtt".to_string(), 8883)
        );
        assert!(matches!(options.transport(), Transport::Ws));

        let options = mqtt_options(&config(MqttProtocol::Wss));
        assert_eq!(
            options.broker_address().0,
            "wss://broker.local:8883/mqtt"
        );
        assert!(matches!(options.transport(), Transport::Wss(_)));
    }

    #[tokio::test]
    async fn test_subscriptions_are_recorded_once() {
        let client = MqttClient::new(&config(MqttProtocol::Tcp));
        let handle = client.handle();

        handle.subscribe("lox/504F94A00000/+/+/command", QoS::AtLeastOnce).await.unwrap();
        handle.subscribe("lox/504F94A00000/+/+/command", QoS::AtLeastOnce).await.unwrap();

        let recorded = client.subscriptions.lock().clone();
        assert_eq!(
            recorded,
            vec![("lox/504F94A00000/+/+/command".to_string(), QoS::AtLeastOnce)]
        );
    }

    #[tokio::test]
    async fn test_disconnect_reaches_broker_before_loop_exits() {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        use tokio::net::TcpListener;

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let broker = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            // CONNECT: fixed header byte plus a one-byte remaining length
            let mut header = [0u8; 2];
            socket.read_exact(&mut header).await.unwrap();
            assert_eq!(header[0], 0x10);
            let mut connect = vec![0u8; header[1] as usize];
            socket.read_exact(&mut connect).await.unwrap();

            socket.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            let mut rest = Vec::new();
            socket.read_to_end(&mut rest).await.unwrap();
            rest
        });

        let config = MqttConfig {
            host: "127.0.0.1".to_string(),
            port,
            protocol: MqttProtocol::Tcp,
            ..MqttConfig::default()
        };
        let client = MqttClient::new(&config);
        let handle = client.handle();
        let (tx, _rx) = mpsc::channel(8);
        let (connected_tx, connected_rx) = oneshot::channel();
        let done = CancellationToken::new();
        let task = tokio::spawn(client.run(tx, Some(connected_tx), done.clone()));

        connected_rx.await.unwrap();
        handle.disconnect().await.unwrap();

        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .expect("event loop did not stop after disconnect")
            .unwrap();
        assert!(!done.is_cancelled());

        let rest = tokio::time::timeout(Duration::from_secs(5), broker)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rest, vec![0xE0, 0x00]);
    }
}
