use log::{error, info, warn};
use loxone_mqtt_bridge::bridge::{Bridge, TopicScheme};
use loxone_mqtt_bridge::config::{self, Config};
use loxone_mqtt_bridge::error::{BridgeError, Result};
use loxone_mqtt_bridge::loxone::LoxoneClient;
use loxone_mqtt_bridge::mqtt::MqttClient;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

/// How long to wait for the first broker ConnAck.
const MQTT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long the MQTT loop gets to flush DISCONNECT on shutdown.
const MQTT_DISCONNECT_TIMEOUT: Duration = Duration::from_secs(5);

fn init_logger(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_millis()
        .init();
}

/// Resolves on SIGINT or, on Unix, SIGTERM.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut terminate) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = terminate.recv() => {}
                }
                return;
            }
            Err(e) => warn!("Failed to listen for SIGTERM: {}", e),
        }
    }

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {}", e);
    }
}

async fn run(config: Config, done: CancellationToken) -> Result<()> {
    // MQTT first so state published at startup has somewhere to go.
    let mqtt = MqttClient::new(&config.mqtt);
    let bus = Arc::new(mqtt.handle());
    let (message_tx, message_rx) = mpsc::channel(100);
    let (connected_tx, connected_rx) = oneshot::channel();
    // The MQTT loop outlives `done` so that DISCONNECT still gets written.
    let mqtt_done = CancellationToken::new();
    let mut mqtt_task = tokio::spawn(mqtt.run(message_tx, Some(connected_tx), mqtt_done.clone()));

    match tokio::time::timeout(MQTT_CONNECT_TIMEOUT, connected_rx).await {
        Ok(Ok(())) => {}
        _ => {
            mqtt_done.cancel();
            return Err(BridgeError::Transport(format!(
                "could not connect to MQTT broker {}:{}",
                config.mqtt.host, config.mqtt.port
            )));
        }
    }

    let client = Arc::new(LoxoneClient::new(config.loxone.clone())?);
    info!("Connecting to Miniserver {}...", client.serial());

    let topics = TopicScheme::new(&config.mqtt.topic_prefix, &config.loxone.serial);
    let bridge = Bridge::new(client.clone(), bus.clone(), topics)
        .with_refresh(config.system.structure_refresh);

    let startup = async {
        client.connect().await?;
        bridge.start().await
    };
    let result = tokio::select! {
        started = startup => match started {
            Ok(()) => {
                info!("Bridge is running");
                bridge.run(message_rx, done.clone()).await
            }
            Err(e) => Err(e),
        },
        _ = done.cancelled() => Ok(()),
    };

    done.cancel();
    client.close().await;
    if let Err(e) = bus.disconnect().await {
        warn!("MQTT disconnect failed: {}", e);
        mqtt_done.cancel();
    }
    if tokio::time::timeout(MQTT_DISCONNECT_TIMEOUT, &mut mqtt_task)
        .await
        .is_err()
    {
        warn!("MQTT event loop did not stop after disconnect");
        mqtt_done.cancel();
        let _ = mqtt_task.await;
    }

    result
}

#[tokio::main]
async fn main() {
    config::load_dotenv();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(e) => {
            init_logger("info");
            error!("{}", e);
            std::process::exit(1);
        }
    };
    init_logger(&config.system.log_level);

    info!("Starting Loxone MQTT bridge");
    info!("  Miniserver: {} ({})", config.loxone.serial, config.loxone.ip);
    info!(
        "  Broker: {}:{} over {}",
        config.mqtt.host, config.mqtt.port, config.mqtt.protocol
    );
    info!("  Topic prefix: {}", config.mqtt.topic_prefix);

    let done = CancellationToken::new();
    let signal_done = done.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Received shutdown signal");
        signal_done.cancel();
    });

    if let Err(e) = run(config, done).await {
        error!("Bridge stopped: {}", e);
        std::process::exit(1);
    }

    info!("Shutdown complete");
}
