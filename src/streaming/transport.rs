//! Socket seam between the connection manager and the network
//!
//! The manager never touches a WebSocket directly. It asks a [`Connector`]
//! to open a socket for one attempt and gets back a [`Socket`] it can write
//! to and close. Everything the socket observes (open, error, close, inbound
//! text) is reported through [`SocketEvents`], tagged with the attempt id.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::connection::LinkEvent;
use super::protocol::ConnectRequest;

/// Outbound frames buffered per socket before writes start failing
pub const DEFAULT_OUTBOUND_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteError {
    /// Outbound queue is full (server not keeping up)
    Full,
    /// Socket has been closed
    Closed,
}

impl std::fmt::Display for WriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WriteError::Full => write!(f, "outbound queue full"),
            WriteError::Closed => write!(f, "socket closed"),
        }
    }
}

/// An open (or opening) socket owned by the connection manager.
pub trait Socket: Send + Sync {
    /// Queue one binary message. Must not block.
    fn write(&self, payload: Vec<u8>) -> Result<(), WriteError>;

    /// Close the socket. Idempotent. No further events are expected after
    /// a manager-initiated close.
    fn close(&self);
}

/// Opens sockets. Implementations report progress through `events`.
pub trait Connector: Send + Sync + 'static {
    fn open(&self, request: &ConnectRequest, events: SocketEvents) -> Arc<dyn Socket>;
}

/// Callback side of one connection attempt.
#[derive(Clone)]
pub struct SocketEvents {
    attempt: Uuid,
    tx: mpsc::UnboundedSender<LinkEvent>,
}

impl SocketEvents {
    pub(crate) fn new(attempt: Uuid, tx: mpsc::UnboundedSender<LinkEvent>) -> Self {
        Self { attempt, tx }
    }

    pub fn attempt(&self) -> Uuid {
        self.attempt
    }

    pub fn opened(&self) {
        self.emit(LinkEvent::Opened {
            attempt: self.attempt,
        });
    }

    pub fn failed(&self, detail: impl Into<String>) {
        self.emit(LinkEvent::Failed {
            attempt: self.attempt,
            detail: detail.into(),
        });
    }

    pub fn closed(&self) {
        self.emit(LinkEvent::Closed {
            attempt: self.attempt,
        });
    }

    pub fn text(&self, text: impl Into<String>) {
        self.emit(LinkEvent::Text {
            attempt: self.attempt,
            text: text.into(),
        });
    }

    fn emit(&self, event: LinkEvent) {
        if self.tx.send(event).is_err() {
            log::trace!("Socket event for attempt {} after manager exit", self.attempt);
        }
    }
}

/// [`Connector`] backed by tokio-tungstenite.
///
/// Each socket runs as one task that owns the stream: it performs the
/// handshake, drains the outbound queue and reads inbound messages until
/// closed, cancelled or failed.
pub struct WsConnector {
    outbound_capacity: usize,
}

impl WsConnector {
    pub fn new() -> Self {
        Self::with_outbound_capacity(DEFAULT_OUTBOUND_CAPACITY)
    }

    pub fn with_outbound_capacity(outbound_capacity: usize) -> Self {
        // wss:// needs a process-wide rustls provider; a second install is a no-op
        let _ = rustls::crypto::ring::default_provider().install_default();
        Self {
            outbound_capacity: outbound_capacity.max(1),
        }
    }
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for WsConnector {
    fn open(&self, request: &ConnectRequest, events: SocketEvents) -> Arc<dyn Socket> {
        let (outbound_tx, outbound_rx) = mpsc::channel(self.outbound_capacity);
        let cancel = CancellationToken::new();

        tokio::spawn(run_socket(
            request.clone(),
            outbound_rx,
            cancel.clone(),
            events,
        ));

        Arc::new(WsSocket {
            outbound: outbound_tx,
            cancel,
        })
    }
}

struct WsSocket {
    outbound: mpsc::Sender<Vec<u8>>,
    cancel: CancellationToken,
}

impl Socket for WsSocket {
    fn write(&self, payload: Vec<u8>) -> Result<(), WriteError> {
        if self.cancel.is_cancelled() {
            return Err(WriteError::Closed);
        }
        self.outbound.try_send(payload).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => WriteError::Full,
            mpsc::error::TrySendError::Closed(_) => WriteError::Closed,
        })
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

async fn run_socket(
    request: ConnectRequest,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    cancel: CancellationToken,
    events: SocketEvents,
) {
    let mut ws_request = match request.url.as_str().into_client_request() {
        Ok(r) => r,
        Err(e) => {
            events.failed(e.to_string());
            return;
        }
    };
    if let Some(auth) = &request.authorization {
        match HeaderValue::from_str(auth) {
            Ok(value) => {
                ws_request.headers_mut().insert("Authorization", value);
            }
            Err(e) => {
                events.failed(format!("Invalid authorization header: {}", e));
                return;
            }
        }
    }

    log::info!("Opening WebSocket to {}", request.url);

    let connected = tokio::select! {
        _ = cancel.cancelled() => {
            log::debug!("Connect to {} abandoned", request.url);
            return;
        }
        result = connect_async_with_config(ws_request, None, true) => result,
    };

    let ws_stream = match connected {
        Ok((stream, _response)) => stream,
        Err(e) => {
            events.failed(e.to_string());
            return;
        }
    };

    events.opened();

    let (mut write, mut read) = ws_stream.split();
    let mut frames_written: u64 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                if let Err(e) = write.close().await {
                    log::debug!("Error closing WebSocket: {}", e);
                }
                break;
            }
            payload = outbound.recv() => match payload {
                Some(bytes) => {
                    if let Err(e) = write.send(Message::Binary(bytes)).await {
                        events.failed(e.to_string());
                        break;
                    }
                    frames_written += 1;
                }
                None => {
                    let _ = write.close().await;
                    break;
                }
            },
            incoming = read.next() => match incoming {
                Some(Ok(Message::Text(text))) => events.text(text),
                Some(Ok(Message::Close(frame))) => {
                    log::info!("WebSocket closed by server: {:?}", frame);
                    events.closed();
                    break;
                }
                Some(Ok(Message::Binary(bytes))) => {
                    log::trace!("Ignoring {} byte binary message", bytes.len());
                }
                Some(Ok(_)) => {} // ping/pong answered by tungstenite
                Some(Err(e)) => {
                    events.failed(e.to_string());
                    break;
                }
                None => {
                    events.closed();
                    break;
                }
            }
        }
    }

    log::debug!(
        "Socket task for attempt {} exiting ({} frames written)",
        events.attempt(),
        frames_written
    );
}
