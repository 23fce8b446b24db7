//! Integration tests for recording sessions
//!
//! A fake input backend stands in for the microphone and a mock connector for
//! the network, so these run anywhere:
//!
//! ```bash
//! cargo test --test session_lifecycle
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use micstream::audio::{
    encode_sample, CaptureConfig, CaptureError, CaptureTaps, DeviceHandle, InputBackend, Surface,
};
use micstream::diagnostics::{DiagnosticsLog, LogCategory};
use micstream::session::{
    Recorder, RecordingSession, SessionConfig, SessionDeps, SessionError, TeardownStep,
};
use micstream::settings::{AppSettings, SettingsStore};
use micstream::streaming::{ConnectRequest, ConnectionState, Connector, Socket, SocketEvents, WriteError};
use tempfile::TempDir;

// ============================================================================
// Fakes
// ============================================================================

#[derive(Default)]
struct FakeMic {
    fail_with: Option<CaptureError>,
    fail_release: bool,
    /// Device open blocks until this is set
    open_gate: Option<Arc<AtomicBool>>,
    /// Device release blocks until this is set
    release_gate: Option<Arc<AtomicBool>>,
    released: Arc<AtomicUsize>,
    taps: Mutex<Option<CaptureTaps>>,
}

struct FakeDevice {
    fail_release: bool,
    release_gate: Option<Arc<AtomicBool>>,
    released: Arc<AtomicUsize>,
}

impl DeviceHandle for FakeDevice {
    fn sample_rate(&self) -> u32 {
        16000
    }

    fn release(self: Box<Self>) -> Result<(), CaptureError> {
        if let Some(gate) = &self.release_gate {
            if !wait_for_gate(gate) {
                return Err(CaptureError::ReleaseFailed("release gate never opened".to_string()));
            }
        }
        self.released.fetch_add(1, Ordering::SeqCst);
        if self.fail_release {
            Err(CaptureError::ReleaseFailed("device busy".to_string()))
        } else {
            Ok(())
        }
    }
}

impl InputBackend for FakeMic {
    fn open(
        &self,
        _config: &CaptureConfig,
        taps: CaptureTaps,
    ) -> Result<Box<dyn DeviceHandle>, CaptureError> {
        if let Some(e) = &self.fail_with {
            return Err(e.clone());
        }
        if let Some(gate) = &self.open_gate {
            if !wait_for_gate(gate) {
                return Err(CaptureError::StreamCreationFailed(
                    "open gate never opened".to_string(),
                ));
            }
        }
        taps.set_sample_rate(16000);
        *self.taps.lock().unwrap() = Some(taps);
        Ok(Box::new(FakeDevice {
            fail_release: self.fail_release,
            release_gate: self.release_gate.clone(),
            released: self.released.clone(),
        }))
    }
}

/// Block the calling thread until `gate` is set, giving up after two seconds.
///
/// Runs on whatever thread the session uses for device calls. If that were a
/// runtime worker of a current-thread runtime, the task that sets the gate
/// could never run and this would give up.
fn wait_for_gate(gate: &AtomicBool) -> bool {
    for _ in 0..2000 {
        if gate.load(Ordering::SeqCst) {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    false
}

/// Set `gate` after `delay`, from a runtime task.
fn open_later(gate: Arc<AtomicBool>, delay: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        gate.store(true, Ordering::SeqCst);
    })
}

impl FakeMic {
    /// Simulate one device callback.
    fn speak(&self, samples: &[f32]) {
        if let Some(taps) = self.taps.lock().unwrap().as_ref() {
            taps.push_interleaved(samples, 1);
        }
    }

    fn released(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct FakeSocket {
    writes: Mutex<Vec<Vec<u8>>>,
    closed: AtomicBool,
}

impl Socket for FakeSocket {
    fn write(&self, payload: Vec<u8>) -> Result<(), WriteError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(WriteError::Closed);
        }
        self.writes.lock().unwrap().push(payload);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct FakeServer {
    opened: Mutex<Vec<(ConnectRequest, SocketEvents, Arc<FakeSocket>)>>,
}

impl Connector for FakeServer {
    fn open(&self, request: &ConnectRequest, events: SocketEvents) -> Arc<dyn Socket> {
        let socket = Arc::new(FakeSocket::default());
        self.opened
            .lock()
            .unwrap()
            .push((request.clone(), events, socket.clone()));
        socket
    }
}

impl FakeServer {
    fn attempts(&self) -> usize {
        self.opened.lock().unwrap().len()
    }

    /// Accept the most recent connection attempt.
    fn accept(&self) -> Arc<FakeSocket> {
        let opened = self.opened.lock().unwrap();
        let (_, events, socket) = opened.last().expect("no connection attempt");
        events.opened();
        socket.clone()
    }

    /// Fail the most recent connection attempt with a transport error.
    fn fail(&self, detail: &str) {
        let opened = self.opened.lock().unwrap();
        let (_, events, _) = opened.last().expect("no connection attempt");
        events.failed(detail);
    }

    fn last_request(&self) -> ConnectRequest {
        self.opened.lock().unwrap().last().unwrap().0.clone()
    }
}

struct CountingSurface {
    draws: Arc<AtomicU64>,
}

impl Surface for CountingSurface {
    fn size(&self) -> (usize, usize) {
        (32, 8)
    }

    fn fade(&mut self, _alpha: f32) {}

    fn stroke(&mut self, _points: &[(f32, f32)]) {
        self.draws.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    mic: Arc<FakeMic>,
    server: Arc<FakeServer>,
    log: Arc<DiagnosticsLog>,
    draws: Arc<AtomicU64>,
}

impl Harness {
    fn new(mic: FakeMic) -> Self {
        Self {
            mic: Arc::new(mic),
            server: Arc::new(FakeServer::default()),
            log: Arc::new(DiagnosticsLog::default()),
            draws: Arc::new(AtomicU64::new(0)),
        }
    }

    fn deps(&self, store: Option<SettingsStore>) -> SessionDeps {
        SessionDeps {
            backend: self.mic.clone(),
            connector: self.server.clone(),
            log: self.log.clone(),
            surface: Some(Box::new(CountingSurface {
                draws: self.draws.clone(),
            })),
            store,
        }
    }
}

fn config(url: &str) -> SessionConfig {
    let settings = AppSettings {
        ws_url: url.to_string(),
        buffer_size: 4,
        ..Default::default()
    };
    SessionConfig::from_settings(&settings).unwrap()
}

async fn started(harness: &Harness) -> (RecordingSession, Arc<FakeSocket>) {
    let session = RecordingSession::start(config("ws://localhost:8080"), harness.deps(None))
        .await
        .unwrap();
    assert!(session.wait_for_state(ConnectionState::Connecting).await);
    let socket = harness.server.accept();
    assert!(session.wait_for_state(ConnectionState::Connected).await);
    (session, socket)
}

fn pcm_bytes(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| encode_sample(s).to_le_bytes())
        .collect()
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn frames_are_streamed_in_capture_order() {
    let harness = Harness::new(FakeMic::default());
    let (session, socket) = started(&harness).await;

    let first = [0.0, 0.5, -0.5, 1.0];
    let second = [-1.0, 0.25, -0.25, 0.0];
    // Callback buffers need not line up with frame boundaries
    harness.mic.speak(&first[..3]);
    harness.mic.speak(&[first[3], second[0]]);
    harness.mic.speak(&second[1..]);

    let writes = socket.writes.lock().unwrap().clone();
    assert_eq!(writes, vec![pcm_bytes(&first), pcm_bytes(&second)]);

    let report = session.stop().await;
    assert_eq!(report.stream.frames_sent, 2);
    assert_eq!(report.stream.frames_dropped, 0);
}

#[tokio::test]
async fn stop_tears_down_everything_in_order() {
    let harness = Harness::new(FakeMic::default());
    let (session, socket) = started(&harness).await;
    assert_eq!(harness.server.last_request().url, "ws://localhost:8080/");

    // Let the scope draw a few frames
    tokio::time::sleep(Duration::from_millis(100)).await;

    let report = session.stop().await;
    assert_eq!(
        report.steps,
        vec![
            TeardownStep::StopRender,
            TeardownStep::DisconnectTaps,
            TeardownStep::ReleaseDevice,
            TeardownStep::CloseSocket,
        ]
    );
    assert!(report.is_clean());
    assert!(report.frames_drawn > 0);

    assert_eq!(harness.mic.released(), 1);
    assert!(socket.closed.load(Ordering::SeqCst));

    // Device callbacks after stop go nowhere
    harness.mic.speak(&[0.1, 0.2, 0.3, 0.4]);
    assert!(socket.writes.lock().unwrap().is_empty());

    // Renderer no longer draws
    let draws = harness.draws.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.draws.load(Ordering::SeqCst), draws);
}

#[tokio::test]
async fn transport_error_mid_stream_still_tears_down_cleanly() {
    let harness = Harness::new(FakeMic::default());
    let (session, socket) = started(&harness).await;

    harness.mic.speak(&[0.1, 0.2, 0.3, 0.4]);
    assert_eq!(socket.writes.lock().unwrap().len(), 1);

    harness.server.fail("connection reset by peer");
    assert!(session.wait_for_state(ConnectionState::Error).await);
    assert!(socket.closed.load(Ordering::SeqCst));

    // Frames after the error are dropped, not written
    harness.mic.speak(&[0.5, 0.6, 0.7, 0.8]);
    assert_eq!(socket.writes.lock().unwrap().len(), 1);

    let report = session.stop().await;
    assert_eq!(report.steps.len(), 4);
    assert_eq!(report.stream.frames_sent, 1);
    assert_eq!(report.stream.frames_dropped, 1);
    assert_eq!(harness.mic.released(), 1);

    let draws = harness.draws.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(harness.draws.load(Ordering::SeqCst), draws);
}

#[tokio::test]
async fn release_failure_does_not_skip_socket_close() {
    let harness = Harness::new(FakeMic {
        fail_release: true,
        ..Default::default()
    });
    let (session, socket) = started(&harness).await;

    let report = session.stop().await;
    assert!(!report.is_clean());
    assert_eq!(report.errors.len(), 1);
    assert!(report.errors[0].contains("device busy"));
    assert_eq!(report.steps.last(), Some(&TeardownStep::CloseSocket));
    assert!(socket.closed.load(Ordering::SeqCst));
    assert!(!harness.log.by_category(LogCategory::Error).is_empty());
}

#[tokio::test]
async fn permission_denied_starts_nothing() {
    let harness = Harness::new(FakeMic {
        fail_with: Some(CaptureError::PermissionDenied),
        ..Default::default()
    });

    let result = RecordingSession::start(config("ws://localhost:8080"), harness.deps(None)).await;
    assert_eq!(
        result.err(),
        Some(SessionError::Capture(CaptureError::PermissionDenied))
    );
    assert_eq!(harness.server.attempts(), 0);
    assert!(harness
        .log
        .by_category(LogCategory::Error)
        .iter()
        .any(|e| e.message.contains("Microphone access denied")));
}

#[tokio::test]
async fn frames_before_connect_are_dropped_not_queued() {
    let harness = Harness::new(FakeMic::default());
    let session = RecordingSession::start(config("ws://localhost:8080"), harness.deps(None))
        .await
        .unwrap();
    assert!(session.wait_for_state(ConnectionState::Connecting).await);
    assert_eq!(session.connection_state(), ConnectionState::Connecting);

    harness.mic.speak(&[0.1; 8]);
    assert_eq!(session.stream_stats().frames_dropped, 2);

    let socket = harness.server.accept();
    assert!(session.wait_for_state(ConnectionState::Connected).await);
    harness.mic.speak(&[0.2; 4]);

    assert_eq!(socket.writes.lock().unwrap().len(), 1);
    // Two identical drop messages within the dedup window collapse into one
    assert_eq!(harness.log.by_category(LogCategory::Error).len(), 1);

    session.stop().await;
}

#[tokio::test]
async fn recorder_allows_one_session_at_a_time() {
    let harness = Harness::new(FakeMic::default());
    let mut recorder = Recorder::new();

    let session = recorder
        .start(config("ws://localhost:8080"), harness.deps(None))
        .await
        .unwrap();
    assert!(session.wait_for_state(ConnectionState::Connecting).await);
    assert!(recorder.is_recording());

    let second = recorder
        .start(config("ws://localhost:8080"), harness.deps(None))
        .await;
    assert_eq!(second.err(), Some(SessionError::AlreadyRecording));
    assert_eq!(harness.server.attempts(), 1);

    let report = recorder.stop().await.unwrap();
    assert!(report.is_clean());
    assert!(!recorder.is_recording());
    assert_eq!(recorder.stop().await.err(), Some(SessionError::NotRecording));

    // A fresh session can start once the first is gone
    recorder
        .start(config("ws://localhost:8080"), harness.deps(None))
        .await
        .unwrap();
    recorder.stop().await.unwrap();
}

#[tokio::test]
async fn url_is_saved_after_first_connect() {
    let dir = TempDir::new().unwrap();
    let store = SettingsStore::new(dir.path().join("settings.json"));
    let harness = Harness::new(FakeMic::default());

    let session = RecordingSession::start(
        config("ws://192.168.1.20:9000"),
        harness.deps(Some(store.clone())),
    )
    .await
    .unwrap();
    assert!(session.wait_for_state(ConnectionState::Connecting).await);
    assert_eq!(store.load().ws_url, "ws://localhost:8080");

    harness.server.accept();
    assert!(session.wait_for_state(ConnectionState::Connected).await);

    let mut saved = false;
    for _ in 0..50 {
        if store.load().ws_url == "ws://192.168.1.20:9000" {
            saved = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(saved, "endpoint URL was not persisted");

    session.stop().await;
}

#[tokio::test]
async fn slow_device_open_does_not_block_the_runtime() {
    let gate = Arc::new(AtomicBool::new(false));
    let harness = Harness::new(FakeMic {
        open_gate: Some(gate.clone()),
        ..Default::default()
    });
    let opener = open_later(gate, Duration::from_millis(50));

    let session = RecordingSession::start(config("ws://localhost:8080"), harness.deps(None))
        .await
        .unwrap();
    opener.await.unwrap();
    assert!(session.is_recording());

    let report = session.stop().await;
    assert!(report.is_clean());
}

#[tokio::test]
async fn slow_device_release_does_not_block_the_runtime() {
    let gate = Arc::new(AtomicBool::new(false));
    let harness = Harness::new(FakeMic {
        release_gate: Some(gate.clone()),
        ..Default::default()
    });
    let (session, socket) = started(&harness).await;

    let opener = open_later(gate, Duration::from_millis(50));
    let report = session.stop().await;
    opener.await.unwrap();

    assert!(report.is_clean(), "{:?}", report.errors);
    assert_eq!(harness.mic.released(), 1);
    assert!(socket.closed.load(Ordering::SeqCst));
}

#[tokio::test]
async fn dropping_a_session_still_releases_resources() {
    let harness = Harness::new(FakeMic::default());
    let (session, socket) = started(&harness).await;

    drop(session);
    assert_eq!(harness.mic.released(), 1);

    let mut closed = false;
    for _ in 0..50 {
        if socket.closed.load(Ordering::SeqCst) {
            closed = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(closed, "socket left open after drop");
}
