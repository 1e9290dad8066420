//! Frame multiplexer for the Miniserver WebSocket.
//!
//! The Miniserver announces every payload with an 8-byte binary header
//! message, then sends the payload as the next WebSocket message. This
//! module pairs headers with payloads and routes each payload either to the
//! solicited-response queue (command replies, files) or to the event queue
//! (decoded state changes).

use super::codec::{
    FrameHeader, FrameKind, decode_frame_header, decode_text_events, decode_value_events,
    is_frame_header,
};
use super::Event;
use futures_util::{Stream, StreamExt};
use log::{debug, trace, warn};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

/// Where a single inbound message ended up.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    /// Reply or file for the correlation layer.
    Response(Vec<u8>),
    /// Decoded state changes, in wire order.
    Events(Vec<Event>),
    /// Header, control frame, or a payload nobody consumes.
    Nothing,
}

/// Header/payload state machine.
#[derive(Debug, Default)]
pub struct Demultiplexer {
    pending: Option<FrameHeader>,
}

impl Demultiplexer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether a header has been seen and its payload is still expected.
    pub fn awaiting_payload(&self) -> bool {
        self.pending.is_some()
    }

    /// Route one WebSocket message.
    pub fn route(&mut self, message: Message) -> Routed {
        let (is_text, bytes) = match message {
            Message::Text(text) => (true, text.as_bytes().to_vec()),
            Message::Binary(data) => (false, data.to_vec()),
            // Ping/pong/close never carry protocol payloads
            _ => return Routed::Nothing,
        };

        if !is_text && is_frame_header(&bytes) {
            self.accept_header(&bytes);
            return Routed::Nothing;
        }

        match self.pending.take() {
            Some(header) => Self::dispatch_payload(header, bytes),
            None if is_text => Routed::Response(bytes),
            None => {
                debug!(
                    "Discarding {} byte binary message without header",
                    bytes.len()
                );
                Routed::Nothing
            }
        }
    }

    fn accept_header(&mut self, bytes: &[u8]) {
        let header = match decode_frame_header(bytes) {
            Ok(header) => header,
            Err(e) => {
                warn!("Ignoring frame header: {}", e);
                return;
            }
        };

        trace!(
            "Frame header: kind={:?} length={} estimated={}",
            header.kind, header.length, header.estimated
        );

        if header.kind == FrameKind::OutOfService {
            warn!("Miniserver indicates Out-Of-Service");
        }

        // An exact header replaces an estimated one still pending
        self.pending = header.kind.has_payload().then_some(header);
    }

    fn dispatch_payload(header: FrameHeader, bytes: Vec<u8>) -> Routed {
        match header.kind {
            FrameKind::Text | FrameKind::BinaryFile => Routed::Response(bytes),
            FrameKind::ValueEvents => Routed::Events(decode_value_events(&bytes)),
            FrameKind::TextEvents => Routed::Events(decode_text_events(&bytes)),
            other => {
                debug!("Skipping {:?} payload ({} bytes)", other, bytes.len());
                Routed::Nothing
            }
        }
    }
}

/// Sending halves of the two bounded queues fed by the read loop.
#[derive(Clone)]
pub struct Sinks {
    pub responses: mpsc::Sender<Vec<u8>>,
    pub events: mpsc::Sender<Event>,
}

impl Sinks {
    /// Push a routed message. Never blocks: a full queue drops the item.
    pub fn deliver(&self, routed: Routed) {
        match routed {
            Routed::Response(bytes) => {
                if let Err(TrySendError::Full(_)) = self.responses.try_send(bytes) {
                    debug!("Response queue full, dropping message");
                }
            }
            Routed::Events(events) => {
                for event in events {
                    debug!("Event {} = {:?}", event.id, event.value);
                    if let Err(TrySendError::Full(_)) = self.events.try_send(event) {
                        warn!("Events channel full, dropping event");
                    }
                }
            }
            Routed::Nothing => {}
        }
    }
}

/// Read the WebSocket until it fails, closes, or `done` is cancelled.
pub async fn run_read_loop<S>(mut stream: S, sinks: Sinks, done: CancellationToken)
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    let mut demux = Demultiplexer::new();

    loop {
        let message = tokio::select! {
            biased;
            _ = done.cancelled() => return,
            message = stream.next() => message,
        };

        match message {
            Some(Ok(Message::Close(frame))) => {
                debug!("Miniserver closed the WebSocket: {:?}", frame);
                return;
            }
            Some(Ok(message)) => sinks.deliver(demux.route(message)),
            Some(Err(e)) => {
                warn!("WebSocket read error: {}", e);
                return;
            }
            None => {
                debug!("WebSocket stream ended");
                return;
            }
        }
    }
}
