//! Connection manager for the streaming endpoint
//!
//! One tokio task owns the connection state and applies every transition
//! through [`reduce`], which returns the next state and a list of effects.
//! Callers, socket callbacks and the connect watchdog only send events.
//!
//! The audio path never waits on that task. It writes through a
//! [`FrameSender`], which reads a shared send slot that the task republishes
//! after every transition: the slot holds a socket only while `Connected`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

use super::protocol::{decode_text, ConnectRequest, EndpointKind, Inbound, Transcript};
use super::transport::{Connector, Socket, SocketEvents};
use super::StreamingError;
use crate::audio::PcmFrame;
use crate::diagnostics::{DiagnosticsLog, LogCategory};

/// Time allowed between connect and the socket's open event
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Longest inbound text copied into a diagnostics entry
const PREVIEW_CHARS: usize = 200;

/// Externally visible connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Error => "error",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Internal state of the link. Authoritative; only [`reduce`] produces it.
#[derive(Debug, Clone, Default)]
pub enum Link {
    #[default]
    Disconnected,
    Connecting {
        attempt: Uuid,
        url: String,
    },
    Connected {
        attempt: Uuid,
        url: String,
    },
    Error {
        message: String,
    },
}

impl Link {
    pub fn state(&self) -> ConnectionState {
        match self {
            Link::Disconnected => ConnectionState::Disconnected,
            Link::Connecting { .. } => ConnectionState::Connecting,
            Link::Connected { .. } => ConnectionState::Connected,
            Link::Error { .. } => ConnectionState::Error,
        }
    }

    /// Attempt currently allowed to report socket events
    pub fn attempt(&self) -> Option<Uuid> {
        match self {
            Link::Connecting { attempt, .. } | Link::Connected { attempt, .. } => Some(*attempt),
            Link::Disconnected | Link::Error { .. } => None,
        }
    }
}

/// Inputs to the reducer.
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Connect { request: ConnectRequest },
    Disconnect,
    /// Stop the connection task (handled outside the reducer)
    Shutdown,

    // Socket events, tagged with the attempt that produced them
    Opened { attempt: Uuid },
    Failed { attempt: Uuid, detail: String },
    Closed { attempt: Uuid },
    Text { attempt: Uuid, text: String },

    /// Connect timeout fired for this attempt
    WatchdogExpired { attempt: Uuid },
}

/// Side effects requested by the reducer, applied in order.
#[derive(Debug, Clone)]
pub enum LinkEffect {
    OpenSocket {
        attempt: Uuid,
        request: ConnectRequest,
    },
    ArmWatchdog {
        attempt: Uuid,
    },
    DisarmWatchdog,
    CloseSocket,
    HandleText {
        text: String,
    },
    Log {
        category: LogCategory,
        message: String,
    },
}

/// Reducer function: (link, event) -> (next_link, effects)
///
/// Key rules:
/// - Never mutate state directly
/// - Socket and watchdog events from any attempt other than the current one
///   are ignored
/// - Every exit from `Connecting`/`Connected` closes the socket
pub fn reduce(link: &Link, event: LinkEvent) -> (Link, Vec<LinkEffect>) {
    use LinkEffect::*;
    use LinkEvent::*;

    match (link, event) {
        // -----------------
        // Connect
        // -----------------
        (Link::Disconnected | Link::Error { .. }, Connect { request }) => {
            let attempt = Uuid::new_v4();
            let url = request.url.clone();
            (
                Link::Connecting {
                    attempt,
                    url: url.clone(),
                },
                vec![
                    Log {
                        category: LogCategory::Websocket,
                        message: format!("Connecting to {}", url),
                    },
                    OpenSocket { attempt, request },
                    ArmWatchdog { attempt },
                ],
            )
        }
        (Link::Connecting { .. } | Link::Connected { .. }, Connect { request }) => (
            link.clone(),
            vec![Log {
                category: LogCategory::Info,
                message: format!(
                    "Connect to {} ignored: already {}",
                    request.url,
                    link.state()
                ),
            }],
        ),

        // -----------------
        // Connecting
        // -----------------
        (Link::Connecting { attempt, url }, Opened { attempt: a }) if *attempt == a => (
            Link::Connected {
                attempt: a,
                url: url.clone(),
            },
            vec![
                DisarmWatchdog,
                Log {
                    category: LogCategory::Success,
                    message: format!("WebSocket connected to {}", url),
                },
            ],
        ),
        (Link::Connecting { attempt, url }, WatchdogExpired { attempt: a }) if *attempt == a => (
            Link::Error {
                message: StreamingError::ConnectionTimeout.to_string(),
            },
            vec![
                CloseSocket,
                Log {
                    category: LogCategory::Error,
                    message: format!("Connection to {} timed out", url),
                },
            ],
        ),

        // -----------------
        // Connecting or Connected
        // -----------------
        (
            Link::Connecting { attempt, .. } | Link::Connected { attempt, .. },
            Failed { attempt: a, detail },
        ) if *attempt == a => {
            let message = StreamingError::TransportError(detail).to_string();
            (
                Link::Error {
                    message: message.clone(),
                },
                vec![
                    DisarmWatchdog,
                    CloseSocket,
                    Log {
                        category: LogCategory::Error,
                        message,
                    },
                ],
            )
        }
        (
            Link::Connecting { attempt, .. } | Link::Connected { attempt, .. },
            Closed { attempt: a },
        ) if *attempt == a => (
            Link::Disconnected,
            vec![
                DisarmWatchdog,
                CloseSocket,
                Log {
                    category: LogCategory::Websocket,
                    message: "WebSocket closed by server".to_string(),
                },
            ],
        ),
        (Link::Connecting { .. } | Link::Connected { .. }, Disconnect) => (
            Link::Disconnected,
            vec![
                DisarmWatchdog,
                CloseSocket,
                Log {
                    category: LogCategory::Info,
                    message: "Disconnected".to_string(),
                },
            ],
        ),

        // -----------------
        // Connected
        // -----------------
        (Link::Connected { attempt, .. }, Text { attempt: a, text }) if *attempt == a => {
            (link.clone(), vec![HandleText { text }])
        }

        // -----------------
        // Error (manual reset only)
        // -----------------
        (Link::Error { .. }, Disconnect) => (
            Link::Disconnected,
            vec![Log {
                category: LogCategory::Info,
                message: "Connection reset".to_string(),
            }],
        ),

        // -----------------
        // Stale attempts, disconnect while idle, shutdown
        // -----------------
        _ => (link.clone(), vec![]),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ConnectionConfig {
    /// Decides how inbound text is decoded
    pub endpoint: EndpointKind,
    pub connect_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoint: EndpointKind::Raw,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

/// Frame counters for one manager
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StreamStats {
    pub frames_sent: u64,
    pub frames_dropped: u64,
}

struct SendSlot {
    state: ConnectionState,
    socket: Option<Arc<dyn Socket>>,
}

struct Shared {
    slot: Mutex<SendSlot>,
    frames_sent: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Shared {
    fn slot(&self) -> MutexGuard<'_, SendSlot> {
        match self.slot.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

/// Non-blocking frame writer, cheap to clone into the capture thread.
#[derive(Clone)]
pub struct FrameSender {
    shared: Arc<Shared>,
    log: Arc<DiagnosticsLog>,
}

impl FrameSender {
    /// Hand one frame to the socket if connected.
    ///
    /// Never blocks and never queues while disconnected: a frame that cannot
    /// be written now is dropped and logged.
    pub fn send(&self, frame: PcmFrame) -> Result<(), StreamingError> {
        let sequence = frame.sequence();

        // Write under the slot lock so a concurrent close cannot interleave
        let result = {
            let slot = self.shared.slot();
            match (slot.state, &slot.socket) {
                (ConnectionState::Connected, Some(socket)) => socket
                    .write(frame.into_payload())
                    .map_err(|e| e.to_string()),
                (state, _) => Err(format!("not connected ({})", state)),
            }
        };

        match result {
            Ok(()) => {
                self.shared.frames_sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(reason) => {
                self.shared.frames_dropped.fetch_add(1, Ordering::Relaxed);
                log::trace!("Dropped frame {}: {}", sequence, reason);
                let err = StreamingError::SendDropped(reason);
                self.log.error(err.to_string());
                Err(err)
            }
        }
    }

    pub fn stats(&self) -> StreamStats {
        StreamStats {
            frames_sent: self.shared.frames_sent.load(Ordering::Relaxed),
            frames_dropped: self.shared.frames_dropped.load(Ordering::Relaxed),
        }
    }
}

/// Handle to the connection task.
///
/// Must be created inside a tokio runtime. Dropping the handle stops the
/// task and closes any open socket.
pub struct ConnectionManager {
    events: mpsc::UnboundedSender<LinkEvent>,
    state_rx: watch::Receiver<ConnectionState>,
    sender: FrameSender,
    transcripts: Option<mpsc::UnboundedReceiver<Transcript>>,
    task: Option<JoinHandle<()>>,
}

impl ConnectionManager {
    pub fn spawn(
        connector: Arc<dyn Connector>,
        log: Arc<DiagnosticsLog>,
        config: ConnectionConfig,
    ) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);
        let (transcript_tx, transcript_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared {
            slot: Mutex::new(SendSlot {
                state: ConnectionState::Disconnected,
                socket: None,
            }),
            frames_sent: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        });

        let task = LinkTask {
            link: Link::Disconnected,
            connector,
            config,
            socket: None,
            watchdog: None,
            events: events_tx.clone(),
            shared: shared.clone(),
            state_tx,
            transcripts: transcript_tx,
            log: log.clone(),
        };
        let handle = tokio::spawn(task.run(events_rx));

        Self {
            events: events_tx,
            state_rx,
            sender: FrameSender { shared, log },
            transcripts: Some(transcript_rx),
            task: Some(handle),
        }
    }

    /// Start a connection attempt. Ignored (with a log entry) while
    /// connecting or connected.
    pub fn connect(&self, request: ConnectRequest) {
        self.dispatch(LinkEvent::Connect { request });
    }

    /// Close the socket and return to `Disconnected`. Also clears `Error`.
    pub fn disconnect(&self) {
        self.dispatch(LinkEvent::Disconnect);
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    /// Wait until the state equals `target`. Returns false if the task has
    /// exited first.
    pub async fn wait_for(&self, target: ConnectionState) -> bool {
        let mut rx = self.state_rx.clone();
        let reached = rx.wait_for(|s| *s == target).await;
        reached.is_ok()
    }

    /// Connect and wait for the attempt to settle (anything but
    /// `Connecting`). Returns at once if already connected.
    pub async fn connect_and_wait(&self, request: ConnectRequest) -> ConnectionState {
        let mut rx = self.state_rx.clone();
        let before = *rx.borrow_and_update();

        self.connect(request);
        match before {
            ConnectionState::Connected => return before,
            ConnectionState::Connecting => {}
            ConnectionState::Disconnected | ConnectionState::Error => {
                // The state only changes on transitions; the first one is Connecting
                if rx.changed().await.is_err() {
                    return ConnectionState::Disconnected;
                }
            }
        }

        let settled = rx
            .wait_for(|s| *s != ConnectionState::Connecting)
            .await
            .map(|state| *state);
        settled.unwrap_or(ConnectionState::Disconnected)
    }

    pub fn sender(&self) -> FrameSender {
        self.sender.clone()
    }

    pub fn send(&self, frame: PcmFrame) -> Result<(), StreamingError> {
        self.sender.send(frame)
    }

    pub fn stats(&self) -> StreamStats {
        self.sender.stats()
    }

    /// Transcripts decoded from inbound messages. Can be taken once.
    pub fn take_transcripts(&mut self) -> Option<mpsc::UnboundedReceiver<Transcript>> {
        self.transcripts.take()
    }

    /// Stop the task, closing any open socket, and wait for it to exit.
    pub async fn shutdown(mut self) {
        self.dispatch(LinkEvent::Shutdown);
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::warn!("Connection task ended abnormally: {}", e);
            }
        }
    }

    fn dispatch(&self, event: LinkEvent) {
        if let Err(e) = self.events.send(event) {
            log::warn!("Connection task has exited; dropping {:?}", e.0);
        }
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        let _ = self.events.send(LinkEvent::Shutdown);
    }
}

/// Single writer of the link state.
struct LinkTask {
    link: Link,
    connector: Arc<dyn Connector>,
    config: ConnectionConfig,
    socket: Option<Arc<dyn Socket>>,
    watchdog: Option<JoinHandle<()>>,
    events: mpsc::UnboundedSender<LinkEvent>,
    shared: Arc<Shared>,
    state_tx: watch::Sender<ConnectionState>,
    transcripts: mpsc::UnboundedSender<Transcript>,
    log: Arc<DiagnosticsLog>,
}

impl LinkTask {
    async fn run(mut self, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        while let Some(event) = events.recv().await {
            if matches!(event, LinkEvent::Shutdown) {
                log::debug!("Connection task: shutdown requested");
                break;
            }

            let before = self.link.state();
            let (next, effects) = reduce(&self.link, event);
            self.link = next;
            let after = self.link.state();
            if before != after {
                log::info!("Connection: {} -> {}", before, after);
            }

            // Slot first so no frame reaches a socket that is about to close
            self.publish_slot();
            for effect in effects {
                self.apply(effect);
            }
            self.state_tx.send_if_modified(|state| {
                let changed = *state != after;
                *state = after;
                changed
            });
        }

        self.disarm_watchdog();
        self.link = Link::Disconnected;
        self.publish_slot();
        self.close_socket();
        self.state_tx.send_replace(ConnectionState::Disconnected);
        log::debug!("Connection task exiting");
    }

    fn publish_slot(&self) {
        let state = self.link.state();
        let mut slot = self.shared.slot();
        slot.state = state;
        slot.socket = match state {
            ConnectionState::Connected => self.socket.clone(),
            _ => None,
        };
    }

    fn apply(&mut self, effect: LinkEffect) {
        match effect {
            LinkEffect::OpenSocket { attempt, request } => {
                self.close_socket();
                let events = SocketEvents::new(attempt, self.events.clone());
                self.socket = Some(self.connector.open(&request, events));
            }
            LinkEffect::ArmWatchdog { attempt } => {
                self.disarm_watchdog();
                let tx = self.events.clone();
                let timeout = self.config.connect_timeout;
                self.watchdog = Some(tokio::spawn(async move {
                    tokio::time::sleep(timeout).await;
                    let _ = tx.send(LinkEvent::WatchdogExpired { attempt });
                }));
            }
            LinkEffect::DisarmWatchdog => self.disarm_watchdog(),
            LinkEffect::CloseSocket => self.close_socket(),
            LinkEffect::HandleText { text } => self.handle_text(&text),
            LinkEffect::Log { category, message } => {
                self.log.append(category, message, None);
            }
        }
    }

    fn disarm_watchdog(&mut self) {
        if let Some(watchdog) = self.watchdog.take() {
            watchdog.abort();
        }
    }

    fn close_socket(&mut self) {
        if let Some(socket) = self.socket.take() {
            socket.close();
        }
    }

    fn handle_text(&self, text: &str) {
        match decode_text(self.config.endpoint, text) {
            Ok(Inbound::Transcript(transcript)) => {
                log::debug!(
                    "Transcript (final={}): {}",
                    transcript.is_final,
                    transcript.text
                );
                if self.transcripts.send(transcript).is_err() {
                    log::trace!("No transcript receiver");
                }
            }
            Ok(Inbound::Json(value)) => {
                self.log
                    .append(LogCategory::Websocket, "Message received", Some(value));
            }
            Ok(Inbound::Text(text)) => {
                let preview: String = text.chars().take(PREVIEW_CHARS).collect();
                self.log.websocket(format!("Message received: {}", preview));
            }
            Err(e) => {
                self.log.error(e.to_string());
            }
        }
    }
}
