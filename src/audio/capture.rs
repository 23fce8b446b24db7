//! Microphone capture session
//!
//! A [`CaptureSession`] owns the input device handle and the fixed tap
//! pipeline: device callback → analysis tap → frame tap. The frame tap cuts
//! the callback stream into [`AudioFrame`]s of `buffer_size` samples and
//! hands each to the session's sink inside the callback.
//!
//! Device access sits behind [`InputBackend`] so the session can be driven by
//! a fake device in tests. [`CpalBackend`] is the real one.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{FromSample, Sample, SampleFormat, SizedSample, Stream, StreamConfig};

use super::analysis::{AnalysisTap, DEFAULT_WINDOW};
use super::frame::{AudioFrame, FrameAssembler};

/// Samples per frame (stable delivery without excessive latency)
pub const DEFAULT_BUFFER_SIZE: usize = 4096;

/// How long the capture thread gets to open and start the device stream
const DEVICE_OPEN_TIMEOUT: Duration = Duration::from_secs(5);

/// Receives every completed frame, in production order, on the capture thread.
pub type FrameSink = Box<dyn FnMut(AudioFrame) + Send + 'static>;

/// Errors that can occur while acquiring or releasing the microphone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CaptureError {
    /// The device exists but access was refused or it is unavailable
    PermissionDenied,
    NoInputDevice,
    NoSupportedConfig,
    StreamCreationFailed(String),
    /// `start` was called on a session that is already recording
    AlreadyRecording,
    ReleaseFailed(String),
}

impl std::fmt::Display for CaptureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CaptureError::PermissionDenied => write!(f, "Microphone access denied"),
            CaptureError::NoInputDevice => write!(f, "No audio input device found"),
            CaptureError::NoSupportedConfig => write!(f, "No supported audio configuration"),
            CaptureError::StreamCreationFailed(e) => {
                write!(f, "Failed to create audio stream: {}", e)
            }
            CaptureError::AlreadyRecording => write!(f, "Capture is already running"),
            CaptureError::ReleaseFailed(e) => write!(f, "Failed to release audio device: {}", e),
        }
    }
}

impl std::error::Error for CaptureError {}

/// Capture parameters, fixed for the lifetime of a session.
#[derive(Debug, Clone)]
pub struct CaptureConfig {
    /// Samples per emitted frame
    pub buffer_size: usize,
    /// Requested device rate; `None` uses the device default
    pub sample_rate: Option<u32>,
    /// Samples kept in the analysis window
    pub analysis_window: usize,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            sample_rate: None,
            analysis_window: DEFAULT_WINDOW,
        }
    }
}

struct FrameTap {
    assembler: FrameAssembler,
    sink: FrameSink,
}

struct TapsInner {
    connected: AtomicBool,
    sample_rate: AtomicU32,
    analysis: AnalysisTap,
    frames: Mutex<Option<FrameTap>>,
}

/// The tap pipeline a backend feeds from its device callback.
///
/// Exactly one analysis tap and one frame tap are wired per session. After
/// [`CaptureTaps::disconnect`] the callback becomes a no-op.
#[derive(Clone)]
pub struct CaptureTaps {
    inner: Arc<TapsInner>,
}

impl CaptureTaps {
    fn new(analysis: AnalysisTap, buffer_size: usize, sink: FrameSink) -> Self {
        Self {
            inner: Arc::new(TapsInner {
                connected: AtomicBool::new(true),
                sample_rate: AtomicU32::new(0),
                analysis,
                frames: Mutex::new(Some(FrameTap {
                    assembler: FrameAssembler::new(buffer_size, 0),
                    sink,
                })),
            }),
        }
    }

    /// Record the device rate. Backends call this before the stream starts.
    pub fn set_sample_rate(&self, sample_rate: u32) {
        self.inner.sample_rate.store(sample_rate, Ordering::SeqCst);
        if let Ok(mut guard) = self.inner.frames.lock() {
            if let Some(tap) = guard.as_mut() {
                tap.assembler = FrameAssembler::new(tap.assembler.frame_size(), sample_rate);
            }
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.inner.sample_rate.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Feed interleaved device samples. Only channel 0 is used.
    pub fn push_interleaved(&self, samples: &[f32], channels: usize) {
        if !self.is_connected() {
            return;
        }

        let mono: Vec<f32> = if channels <= 1 {
            samples.to_vec()
        } else {
            samples.chunks(channels).map(|frame| frame[0]).collect()
        };

        self.inner.analysis.push_samples(&mono);

        let Ok(mut guard) = self.inner.frames.lock() else {
            return;
        };
        if let Some(tap) = guard.as_mut() {
            let FrameTap { assembler, sink } = tap;
            assembler.push(&mono, |frame| sink(frame));
        }
    }

    /// Detach both taps. Returns false if they were already detached.
    pub fn disconnect(&self) -> bool {
        let was_connected = self.inner.connected.swap(false, Ordering::SeqCst);
        if let Ok(mut guard) = self.inner.frames.lock() {
            // Dropping the sink releases whatever it captured
            guard.take();
        }
        self.inner.analysis.clear();
        was_connected
    }
}

/// An acquired input device. Dropping it without `release` still stops capture.
pub trait DeviceHandle: Send {
    fn sample_rate(&self) -> u32;

    /// Stop the device stream and give the device back.
    fn release(self: Box<Self>) -> Result<(), CaptureError>;
}

/// Source of input devices.
pub trait InputBackend: Send + Sync + 'static {
    /// Acquire the default input device and start feeding `taps`.
    fn open(
        &self,
        config: &CaptureConfig,
        taps: CaptureTaps,
    ) -> Result<Box<dyn DeviceHandle>, CaptureError>;
}

/// Owns the device handle and taps for one recording.
pub struct CaptureSession {
    backend: Arc<dyn InputBackend>,
    config: CaptureConfig,
    analysis: AnalysisTap,
    taps: Option<CaptureTaps>,
    device: Option<Box<dyn DeviceHandle>>,
}

impl CaptureSession {
    pub fn new(backend: Arc<dyn InputBackend>, config: CaptureConfig) -> Self {
        let analysis = AnalysisTap::new(config.analysis_window);
        Self {
            backend,
            config,
            analysis,
            taps: None,
            device: None,
        }
    }

    /// Read-only view of the live sample window for the renderer
    pub fn analysis_tap(&self) -> AnalysisTap {
        self.analysis.clone()
    }

    pub fn is_recording(&self) -> bool {
        self.device.is_some()
    }

    pub fn sample_rate(&self) -> Option<u32> {
        self.device.as_ref().map(|d| d.sample_rate())
    }

    /// Acquire the device and start emitting frames into `sink`.
    ///
    /// Returns the device sample rate.
    pub fn start(&mut self, sink: FrameSink) -> Result<u32, CaptureError> {
        if self.device.is_some() {
            log::warn!("Capture start ignored: already recording");
            return Err(CaptureError::AlreadyRecording);
        }

        let taps = CaptureTaps::new(self.analysis.clone(), self.config.buffer_size, sink);

        match self.backend.open(&self.config, taps.clone()) {
            Ok(device) => {
                let rate = device.sample_rate();
                log::info!(
                    "Capture started: {} Hz, {} samples per frame",
                    rate,
                    self.config.buffer_size
                );
                self.taps = Some(taps);
                self.device = Some(device);
                Ok(rate)
            }
            Err(e) => {
                taps.disconnect();
                log::error!("Capture start failed: {}", e);
                Err(e)
            }
        }
    }

    /// Stop frame emission and clear the analysis window. Idempotent.
    pub fn disconnect_taps(&mut self) -> bool {
        match self.taps.take() {
            Some(taps) => taps.disconnect(),
            None => false,
        }
    }

    /// Give the device back. Idempotent.
    pub fn release_device(&mut self) -> Result<(), CaptureError> {
        match self.device.take() {
            Some(device) => {
                let result = device.release();
                match &result {
                    Ok(()) => log::info!("Capture device released"),
                    Err(e) => log::warn!("Capture device release failed: {}", e),
                }
                result
            }
            None => Ok(()),
        }
    }

    /// Disconnect taps, then release the device. Safe to call when stopped.
    pub fn stop(&mut self) -> Result<(), CaptureError> {
        self.disconnect_taps();
        self.release_device()
    }
}

impl Drop for CaptureSession {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            log::warn!("Capture teardown on drop: {}", e);
        }
    }
}

// ============================================================================
// cpal backend
// ============================================================================

/// Default input device through cpal.
///
/// cpal streams are not `Send`, so each opened device lives on its own
/// capture thread; the handle keeps the thread and a stop channel.
#[derive(Debug, Default, Clone, Copy)]
pub struct CpalBackend;

struct CpalHandle {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<JoinHandle<()>>,
    sample_rate: u32,
}

impl DeviceHandle for CpalHandle {
    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn release(mut self: Box<Self>) -> Result<(), CaptureError> {
        self.shutdown()
    }
}

impl CpalHandle {
    fn shutdown(&mut self) -> Result<(), CaptureError> {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
        match self.thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| CaptureError::ReleaseFailed("capture thread panicked".to_string())),
            None => Ok(()),
        }
    }
}

impl Drop for CpalHandle {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl InputBackend for CpalBackend {
    fn open(
        &self,
        config: &CaptureConfig,
        taps: CaptureTaps,
    ) -> Result<Box<dyn DeviceHandle>, CaptureError> {
        let (ready_tx, ready_rx) = std_mpsc::channel::<Result<u32, CaptureError>>();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let requested_rate = config.sample_rate;

        let thread = std::thread::Builder::new()
            .name("mic-capture".to_string())
            .spawn(move || {
                let (stream, rate) = match open_default_stream(requested_rate, taps) {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let _ = ready_tx.send(Ok(rate));

                // Park until released (or the handle is dropped)
                let _ = stop_rx.recv();
                drop(stream);
                log::debug!("Capture thread exiting");
            })
            .map_err(|e| CaptureError::StreamCreationFailed(e.to_string()))?;

        // On failure the thread is left to exit on its own: dropping
        // stop_tx ends its park once (if ever) the device call returns.
        let sample_rate = wait_until_ready(&ready_rx, DEVICE_OPEN_TIMEOUT)?;

        Ok(Box::new(CpalHandle {
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            sample_rate,
        }))
    }
}

/// Wait for the capture thread to report the opened stream's rate.
fn wait_until_ready(
    ready_rx: &std_mpsc::Receiver<Result<u32, CaptureError>>,
    timeout: Duration,
) -> Result<u32, CaptureError> {
    match ready_rx.recv_timeout(timeout) {
        Ok(result) => result,
        Err(std_mpsc::RecvTimeoutError::Timeout) => {
            log::error!("Audio device did not open within {:?}", timeout);
            Err(CaptureError::StreamCreationFailed(format!(
                "device did not open within {} ms",
                timeout.as_millis()
            )))
        }
        Err(std_mpsc::RecvTimeoutError::Disconnected) => Err(CaptureError::StreamCreationFailed(
            "capture thread exited before the stream started".to_string(),
        )),
    }
}

fn open_default_stream(
    requested_rate: Option<u32>,
    taps: CaptureTaps,
) -> Result<(Stream, u32), CaptureError> {
    let host = cpal::default_host();
    let device = host
        .default_input_device()
        .ok_or(CaptureError::NoInputDevice)?;

    log::info!("Using audio input device: {:?}", device.name());

    let supported = device.default_input_config().map_err(|e| match e {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => CaptureError::PermissionDenied,
        _ => CaptureError::NoSupportedConfig,
    })?;

    log::info!(
        "Audio config: {} Hz, {} channels, {:?}",
        supported.sample_rate().0,
        supported.channels(),
        supported.sample_format()
    );

    let sample_format = supported.sample_format();
    let mut config: StreamConfig = supported.into();
    if let Some(rate) = requested_rate {
        config.sample_rate = cpal::SampleRate(rate);
    }
    let rate = config.sample_rate.0;
    taps.set_sample_rate(rate);

    let stream = match sample_format {
        SampleFormat::F32 => build_stream_typed::<f32>(&device, &config, taps),
        SampleFormat::I16 => build_stream_typed::<i16>(&device, &config, taps),
        SampleFormat::U16 => build_stream_typed::<u16>(&device, &config, taps),
        _ => Err(CaptureError::NoSupportedConfig),
    }?;

    stream.play().map_err(|e| match e {
        cpal::PlayStreamError::DeviceNotAvailable => CaptureError::PermissionDenied,
        other => CaptureError::StreamCreationFailed(format!("Failed to start stream: {}", other)),
    })?;

    Ok((stream, rate))
}

fn build_stream_typed<T>(
    device: &cpal::Device,
    config: &StreamConfig,
    taps: CaptureTaps,
) -> Result<Stream, CaptureError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    let channels = config.channels as usize;
    let mut scratch: Vec<f32> = Vec::new();
    let err_fn = |err| log::error!("Audio stream error: {}", err);

    device
        .build_input_stream(
            config,
            move |data: &[T], _: &cpal::InputCallbackInfo| {
                scratch.clear();
                scratch.extend(data.iter().map(|&s| f32::from_sample(s)));
                taps.push_interleaved(&scratch, channels);
            },
            err_fn,
            None,
        )
        .map_err(|e| match e {
            cpal::BuildStreamError::DeviceNotAvailable => CaptureError::PermissionDenied,
            cpal::BuildStreamError::StreamConfigNotSupported => CaptureError::NoSupportedConfig,
            other => CaptureError::StreamCreationFailed(other.to_string()),
        })
}
