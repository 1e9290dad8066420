//! Miniserver connection lifecycle.
//!
//! [`LoxoneClient::connect`] probes the Miniserver through its CloudDNS
//! name, opens the `remotecontrol` WebSocket, starts the read loop and the
//! keepalive task, then runs the token handshake. The write half and the
//! connected/closed flags share one lock so nothing is written to a socket
//! that is being torn down.

use super::auth::{self, Token};
use super::multiplexer::{Sinks, run_read_loop};
use super::response::{LoxResponse, RESPONSE_TIMEOUT, ResponseQueue};
use super::structure::{StructureCache, Topology};
use super::{CommandSink, Event};
use crate::config::LoxoneConfig;
use crate::error::{BridgeError, Result};
use async_trait::async_trait;
use futures_util::{Sink, SinkExt, StreamExt};
use log::{debug, info, warn};
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc};
use tokio::time::{Instant, interval_at};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

/// Bound of the solicited-response queue.
const RESPONSE_QUEUE_CAPACITY: usize = 100;

/// Bound of the event queue.
const EVENT_QUEUE_CAPACITY: usize = 1000;

/// The Miniserver drops idle sessions after five minutes.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(240);

const KEEPALIVE_COMMAND: &str = "keepalive";
const STATUS_UPDATE_COMMAND: &str = "jdev/sps/enablebinstatusupdate";
const PROBE_TIMEOUT: Duration = Duration::from_secs(10);
const WS_PROTOCOL: &str = "remotecontrol";

/// Longest a single outgoing frame may hold the link lock.
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);
/// Budget for the Close frame and the socket shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(2);

type WsWriter = Pin<Box<dyn Sink<Message, Error = tungstenite::Error> + Send>>;

/// CloudDNS host name for a Miniserver: `192-168-1-77.504F94A00000.dyndns.loxonecloud.com`.
pub fn cloud_dns_host(ip: &str, serial: &str) -> String {
    let ip = ip.replace(['.', ':'], "-");
    format!("{}.{}.dyndns.loxonecloud.com", ip, serial)
}

/// Write half plus lifecycle flags, guarded together.
#[derive(Default)]
struct Link {
    writer: Option<WsWriter>,
    connected: bool,
    closed: bool,
}

impl Link {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        if self.closed || !self.connected {
            return Err(BridgeError::NotConnected);
        }
        let writer = self.writer.as_mut().ok_or(BridgeError::NotConnected)?;
        tokio::time::timeout(WRITE_TIMEOUT, writer.send(Message::text(text.to_owned())))
            .await
            .map_err(|_| BridgeError::Transport("write timed out".to_string()))?
            .map_err(|e| BridgeError::Transport(e.to_string()))
    }
}

/// Connection to one Miniserver.
pub struct LoxoneClient {
    config: LoxoneConfig,
    http: reqwest::Client,
    link: Arc<Mutex<Link>>,
    done: CancellationToken,
    /// Handed to the read loop on attach.
    sinks: parking_lot::Mutex<Option<Sinks>>,
    responses: ResponseQueue,
    events: parking_lot::Mutex<Option<mpsc::Receiver<Event>>>,
    structure: StructureCache,
    token: parking_lot::RwLock<Option<Token>>,
}

impl LoxoneClient {
    pub fn new(config: LoxoneConfig) -> Result<Self> {
        // The probe talks to the Miniserver's self-signed local certificate.
        let http = reqwest::Client::builder()
            .timeout(PROBE_TIMEOUT)
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| BridgeError::Transport(format!("HTTP client: {}", e)))?;

        let (response_tx, responses) = ResponseQueue::channel(RESPONSE_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);

        Ok(Self {
            config,
            http,
            link: Arc::new(Mutex::new(Link::default())),
            done: CancellationToken::new(),
            sinks: parking_lot::Mutex::new(Some(Sinks {
                responses: response_tx,
                events: event_tx,
            })),
            responses,
            events: parking_lot::Mutex::new(Some(event_rx)),
            structure: StructureCache::new(),
            token: parking_lot::RwLock::new(None),
        })
    }

    pub fn host(&self) -> String {
        cloud_dns_host(&self.config.ip, &self.config.serial)
    }

    pub fn serial(&self) -> &str {
        &self.config.serial
    }

    /// Probe, dial, start background tasks and authenticate.
    pub async fn connect(&self) -> Result<()> {
        let host = self.host();
        self.probe(&host).await?;

        let url = format!("wss://{}/ws/rfc6455", host);
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| BridgeError::DialFailed(e.to_string()))?;
        request
            .headers_mut()
            .insert("Sec-WebSocket-Protocol", HeaderValue::from_static(WS_PROTOCOL));

        info!("Connecting to Miniserver at {}", url);
        let (ws_stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| BridgeError::DialFailed(e.to_string()))?;

        self.attach(ws_stream).await?;

        let token = auth::authenticate(self, &self.responses, &self.config.credentials).await?;
        *self.token.write() = Some(token);
        Ok(())
    }

    /// Check the Miniserver answers plain HTTPS before opening the socket.
    async fn probe(&self, host: &str) -> Result<()> {
        let url = format!("https://{}:443/jdev/cfg/apiKey", host);
        debug!("Probing {}", url);

        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| BridgeError::Unreachable(e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::OK {
            return Err(BridgeError::Unreachable(format!(
                "{} returned {}",
                url, status
            )));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| BridgeError::Unreachable(e.to_string()))?;
        LoxResponse::parse(&body)
            .map(|_| ())
            .ok_or_else(|| BridgeError::Unreachable(format!("{} returned an unexpected body", url)))
    }

    /// Take over an open WebSocket: start the read loop and keepalive.
    pub(crate) async fn attach<S>(&self, ws_stream: WebSocketStream<S>) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let sinks = self
            .sinks
            .lock()
            .take()
            .ok_or_else(|| BridgeError::Transport("connection already used".to_string()))?;

        let (writer, reader) = ws_stream.split();
        {
            let mut link = self.link.lock().await;
            if link.closed {
                return Err(BridgeError::NotConnected);
            }
            link.writer = Some(Box::pin(writer));
            link.connected = true;
        }

        let link = self.link.clone();
        let done = self.done.clone();
        tokio::spawn(async move {
            // Keep the queues open until the flag is down so consumers that
            // see a closed queue also see a dead link.
            let guard = sinks.clone();
            run_read_loop(reader, sinks, done).await;
            link.lock().await.connected = false;
            drop(guard);
            debug!("Read loop stopped");
        });

        tokio::spawn(run_keepalive(self.link.clone(), self.done.clone()));
        Ok(())
    }

    /// Ask the Miniserver to push binary state updates.
    pub async fn enable_status_updates(&self) -> Result<()> {
        self.send_command(STATUS_UPDATE_COMMAND).await?;
        let response = self
            .responses
            .wait_for("enablebinstatusupdate", RESPONSE_TIMEOUT)
            .await?;
        debug!("Status updates enabled (code {:?})", response.code());
        Ok(())
    }

    /// Current topology, refetched only when the Miniserver's version changed.
    pub async fn get_topology(&self) -> Result<Arc<Topology>> {
        self.responses.discard_pending().await;
        self.structure.get_topology(self, &self.responses).await
    }

    /// Send a command and return the raw reply whose control field contains `tag`.
    pub async fn request(&self, command: &str, tag: &str) -> Result<LoxResponse> {
        self.responses.discard_pending().await;
        self.send_command(command).await?;
        self.responses.wait_for(tag, RESPONSE_TIMEOUT).await
    }

    /// Event receiver; available once.
    pub fn take_events(&self) -> Option<mpsc::Receiver<Event>> {
        self.events.lock().take()
    }

    pub fn token(&self) -> Option<Token> {
        self.token.read().clone()
    }

    pub async fn is_connected(&self) -> bool {
        let link = self.link.lock().await;
        link.connected && !link.closed
    }

    /// Cancelled when the connection is closed.
    pub fn done(&self) -> CancellationToken {
        self.done.clone()
    }

    /// Stop all tasks and release the socket. Safe to call more than once.
    pub async fn close(&self) {
        let mut link = self.link.lock().await;
        if link.closed {
            return;
        }
        link.closed = true;
        link.connected = false;
        self.done.cancel();

        if let Some(mut writer) = link.writer.take() {
            let shutdown = async {
                if let Err(e) = writer.send(Message::Close(None)).await {
                    debug!("Close frame not sent: {}", e);
                }
                let _ = writer.close().await;
            };
            if tokio::time::timeout(CLOSE_TIMEOUT, shutdown).await.is_err() {
                debug!("Close frame not flushed in time, dropping socket");
            }
        }
        info!("Miniserver connection closed");
    }
}

#[async_trait]
impl CommandSink for LoxoneClient {
    async fn send_command(&self, command: &str) -> Result<()> {
        debug!("-> {}", command);
        self.link.lock().await.send_text(command).await
    }
}

async fn run_keepalive(link: Arc<Mutex<Link>>, done: CancellationToken) {
    let mut ticker = interval_at(Instant::now() + KEEPALIVE_INTERVAL, KEEPALIVE_INTERVAL);

    loop {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = ticker.tick() => {}
        }

        if let Err(e) = link.lock().await.send_text(KEEPALIVE_COMMAND).await {
            warn!("Keepalive failed, connection presumed dead: {}", e);
            return;
        }
        debug!("Keepalive sent");
    }
}
