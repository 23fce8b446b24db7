//! Recording session: one microphone, one socket, one scope
//!
//! A [`RecordingSession`] owns every handle a recording needs (capture
//! session, connection manager, render loop) and tears them down together.
//! [`Recorder`] guarantees at most one active session.
//!
//! Teardown order is fixed: render loop, taps, device, socket. Every step
//! runs even if an earlier one fails.
//!
//! Opening and releasing the device can block on the audio server, so both
//! run on tokio's blocking pool.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::audio::{
    encode_frame, spawn_renderer, AudioFrame, CaptureConfig, CaptureError, CaptureSession,
    InputBackend, RenderHandle, Surface,
};
use crate::diagnostics::DiagnosticsLog;
use crate::settings::{AppSettings, SettingsStore};
use crate::streaming::{
    fetch_stream_token, ConnectionConfig, ConnectionManager, ConnectionState, Connector,
    Endpoint, EndpointKind, StreamStats, StreamingError, Transcript,
};

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    AlreadyRecording,
    NotRecording,
    Capture(CaptureError),
    /// Endpoint URL rejected before anything was started
    Endpoint(StreamingError),
    Credentials(StreamingError),
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::AlreadyRecording => write!(f, "A recording session is already active"),
            SessionError::NotRecording => write!(f, "No recording session is active"),
            SessionError::Capture(e) => write!(f, "{}", e),
            SessionError::Endpoint(e) => write!(f, "{}", e),
            SessionError::Credentials(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for SessionError {}

impl From<CaptureError> for SessionError {
    fn from(e: CaptureError) -> Self {
        SessionError::Capture(e)
    }
}

/// Everything a session needs to know up front.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub endpoint: Endpoint,
    pub capture: CaptureConfig,
    pub connect_timeout: Duration,
    pub render_fps: u32,
    /// Stream token for the handshake, if the endpoint needs one
    pub token: Option<String>,
}

impl SessionConfig {
    /// Validate the configured endpoint. Does not fetch a token.
    pub fn from_settings(settings: &AppSettings) -> Result<Self, SessionError> {
        let endpoint =
            Endpoint::parse(settings.endpoint, &settings.ws_url).map_err(SessionError::Endpoint)?;

        Ok(Self {
            endpoint,
            capture: CaptureConfig {
                buffer_size: settings.buffer_size,
                sample_rate: settings.sample_rate,
                ..Default::default()
            },
            connect_timeout: settings.connect_timeout(),
            render_fps: settings.render_fps,
            token: None,
        })
    }

    /// [`SessionConfig::from_settings`], plus a stream token when the
    /// endpoint is a transcription service and a token URL is configured.
    pub async fn prepare(settings: &AppSettings) -> Result<Self, SessionError> {
        let mut config = Self::from_settings(settings)?;

        if config.endpoint.kind() == EndpointKind::Transcription {
            match settings.token_url.as_deref() {
                Some(token_url) => {
                    let token = fetch_stream_token(token_url)
                        .await
                        .map_err(SessionError::Credentials)?;
                    config.token = Some(token);
                }
                None => log::info!("No token URL configured; connecting without credentials"),
            }
        }

        Ok(config)
    }
}

/// Collaborators injected into a session.
pub struct SessionDeps {
    pub backend: Arc<dyn InputBackend>,
    pub connector: Arc<dyn Connector>,
    pub log: Arc<DiagnosticsLog>,
    /// Waveform target; no render loop when absent
    pub surface: Option<Box<dyn Surface>>,
    /// Where the endpoint URL is saved after the first successful connect
    pub store: Option<SettingsStore>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TeardownStep {
    StopRender,
    DisconnectTaps,
    ReleaseDevice,
    CloseSocket,
}

/// What `stop` did.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TeardownReport {
    /// Steps in the order they ran
    pub steps: Vec<TeardownStep>,
    pub errors: Vec<String>,
    pub frames_drawn: u64,
    pub stream: StreamStats,
    pub recorded_ms: u64,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

pub struct RecordingSession {
    /// `None` only while the device is being released
    capture: Option<CaptureSession>,
    manager: Option<ConnectionManager>,
    renderer: Option<RenderHandle>,
    url_saver: Option<JoinHandle<()>>,
    log: Arc<DiagnosticsLog>,
    sample_rate: u32,
    started_at: Instant,
}

impl RecordingSession {
    /// Start capture, the render loop and a connection attempt.
    ///
    /// Must be called inside a tokio runtime. If the microphone cannot be
    /// acquired nothing is left running.
    pub async fn start(config: SessionConfig, deps: SessionDeps) -> Result<Self, SessionError> {
        let SessionDeps {
            backend,
            connector,
            log,
            surface,
            store,
        } = deps;

        let manager = ConnectionManager::spawn(
            connector,
            log.clone(),
            ConnectionConfig {
                endpoint: config.endpoint.kind(),
                connect_timeout: config.connect_timeout,
            },
        );

        let mut capture = CaptureSession::new(backend, config.capture.clone());
        let sender = manager.sender();
        let sink = Box::new(move |frame: AudioFrame| {
            // Drops are counted and logged by the sender
            let _ = sender.send(encode_frame(&frame));
        });

        let opened = tokio::task::spawn_blocking(move || {
            let result = capture.start(sink);
            (capture, result)
        })
        .await;

        let (capture, sample_rate) = match opened {
            Ok((capture, Ok(rate))) => (capture, rate),
            Ok((_, Err(e))) => {
                log.error(format!("Recording not started: {}", e));
                return Err(SessionError::Capture(e));
            }
            Err(join_err) => {
                let e = CaptureError::StreamCreationFailed(format!(
                    "device open task failed: {}",
                    join_err
                ));
                log.error(format!("Recording not started: {}", e));
                return Err(SessionError::Capture(e));
            }
        };
        log.info(format!("Microphone capture started ({} Hz)", sample_rate));

        let renderer = surface.map(|surface| {
            spawn_renderer(
                capture.analysis_tap(),
                surface,
                config.render_fps,
                CancellationToken::new(),
            )
        });

        let url_saver = store.map(|store| {
            spawn_url_saver(
                manager.subscribe(),
                store,
                config.endpoint.url().to_string(),
                log.clone(),
            )
        });

        manager.connect(
            config
                .endpoint
                .request(sample_rate, config.token.as_deref()),
        );

        Ok(Self {
            capture: Some(capture),
            manager: Some(manager),
            renderer,
            url_saver,
            log,
            sample_rate,
            started_at: Instant::now(),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn is_recording(&self) -> bool {
        self.capture.as_ref().is_some_and(|c| c.is_recording())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.manager
            .as_ref()
            .map(|m| m.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub async fn wait_for_state(&self, target: ConnectionState) -> bool {
        match &self.manager {
            Some(manager) => manager.wait_for(target).await,
            None => false,
        }
    }

    pub fn stream_stats(&self) -> StreamStats {
        self.manager
            .as_ref()
            .map(|m| m.stats())
            .unwrap_or_default()
    }

    pub fn take_transcripts(&mut self) -> Option<mpsc::UnboundedReceiver<Transcript>> {
        self.manager.as_mut().and_then(|m| m.take_transcripts())
    }

    /// Tear everything down in order and report what happened.
    pub async fn stop(mut self) -> TeardownReport {
        let mut report = TeardownReport {
            recorded_ms: self.started_at.elapsed().as_millis() as u64,
            ..Default::default()
        };

        // 1. Render loop
        if let Some(renderer) = self.renderer.take() {
            report.frames_drawn = renderer.join().await;
        }
        report.steps.push(TeardownStep::StopRender);

        // 2. Taps
        if let Some(capture) = self.capture.as_mut() {
            capture.disconnect_taps();
        }
        report.steps.push(TeardownStep::DisconnectTaps);

        // 3. Device
        if let Some(mut capture) = self.capture.take() {
            let released = tokio::task::spawn_blocking(move || capture.release_device())
                .await
                .unwrap_or_else(|e| Err(CaptureError::ReleaseFailed(e.to_string())));
            if let Err(e) = released {
                let message = format!("Releasing microphone failed: {}", e);
                self.log.error(message.clone());
                report.errors.push(message);
            }
        }
        report.steps.push(TeardownStep::ReleaseDevice);

        // 4. Socket
        if let Some(saver) = self.url_saver.take() {
            saver.abort();
        }
        if let Some(manager) = self.manager.take() {
            report.stream = manager.stats();
            manager.shutdown().await;
        }
        report.steps.push(TeardownStep::CloseSocket);

        self.log.info(format!(
            "Recording stopped after {} ms ({} frames sent, {} dropped)",
            report.recorded_ms, report.stream.frames_sent, report.stream.frames_dropped
        ));
        report
    }
}

impl Drop for RecordingSession {
    fn drop(&mut self) {
        if let Some(renderer) = self.renderer.take() {
            renderer.abort();
        }
        if let Some(mut capture) = self.capture.take() {
            if let Err(e) = capture.stop() {
                log::warn!("Session teardown on drop: {}", e);
            }
        }
        if let Some(saver) = self.url_saver.take() {
            saver.abort();
        }
        // Dropping the manager stops its task, which closes the socket
        self.manager.take();
    }
}

/// Save `url` once the connection first reaches `Connected`.
fn spawn_url_saver(
    mut state: tokio::sync::watch::Receiver<ConnectionState>,
    store: SettingsStore,
    url: String,
    log: Arc<DiagnosticsLog>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let connected = state
            .wait_for(|s| *s == ConnectionState::Connected)
            .await
            .is_ok();
        if !connected {
            return;
        }
        if let Err(e) = store.save_ws_url(&url) {
            log.error(format!("Could not save endpoint URL: {}", e));
        }
    })
}

/// Holds at most one active [`RecordingSession`].
#[derive(Default)]
pub struct Recorder {
    active: Option<RecordingSession>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_recording(&self) -> bool {
        self.active.is_some()
    }

    pub async fn start(
        &mut self,
        config: SessionConfig,
        deps: SessionDeps,
    ) -> Result<&mut RecordingSession, SessionError> {
        if self.active.is_some() {
            log::warn!("Start ignored: a session is already active");
            return Err(SessionError::AlreadyRecording);
        }
        let session = RecordingSession::start(config, deps).await?;
        Ok(self.active.insert(session))
    }

    pub fn session(&mut self) -> Option<&mut RecordingSession> {
        self.active.as_mut()
    }

    pub async fn stop(&mut self) -> Result<TeardownReport, SessionError> {
        match self.active.take() {
            Some(session) => Ok(session.stop().await),
            None => Err(SessionError::NotRecording),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stop_without_session() {
        let mut recorder = Recorder::new();
        assert!(!recorder.is_recording());
        assert_eq!(recorder.stop().await.unwrap_err(), SessionError::NotRecording);
    }

    #[test]
    fn test_config_rejects_bad_url() {
        let settings = AppSettings {
            ws_url: "http://localhost:8080".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            SessionConfig::from_settings(&settings),
            Err(SessionError::Endpoint(StreamingError::InvalidUrl(_)))
        ));
    }

    #[test]
    fn test_config_from_settings() {
        let settings = AppSettings {
            buffer_size: 2048,
            sample_rate: Some(44100),
            connect_timeout_ms: 1500,
            ..Default::default()
        };
        let config = SessionConfig::from_settings(&settings).unwrap();
        assert_eq!(config.capture.buffer_size, 2048);
        assert_eq!(config.capture.sample_rate, Some(44100));
        assert_eq!(config.connect_timeout, Duration::from_millis(1500));
        assert_eq!(config.endpoint.kind(), EndpointKind::Raw);
        assert!(config.token.is_none());
    }

    #[tokio::test]
    async fn test_prepare_raw_endpoint_skips_token() {
        let settings = AppSettings {
            token_url: Some("http://127.0.0.1:1/unreachable".to_string()),
            ..Default::default()
        };
        let config = SessionConfig::prepare(&settings).await.unwrap();
        assert!(config.token.is_none());
    }

    #[tokio::test]
    async fn test_prepare_surfaces_credential_failure() {
        let settings = AppSettings {
            ws_url: "wss://stt.example.com/listen".to_string(),
            endpoint: EndpointKind::Transcription,
            token_url: Some("http://127.0.0.1:1/unreachable".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            SessionConfig::prepare(&settings).await,
            Err(SessionError::Credentials(_))
        ));
    }

    #[test]
    fn test_error_display() {
        assert_eq!(
            SessionError::Capture(CaptureError::PermissionDenied).to_string(),
            "Microphone access denied"
        );
        assert!(SessionError::AlreadyRecording.to_string().contains("already"));
    }
}
