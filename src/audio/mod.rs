//! Audio side of the pipeline
//!
//! Microphone capture (cpal), fixed-size framing, float to PCM16 encoding and
//! the live waveform scope fed from the analysis tap.

mod analysis;
pub mod capture;
mod frame;
pub mod pcm;
pub mod waveform;

pub use analysis::{AnalysisTap, DEFAULT_WINDOW};
pub use capture::{
    CaptureConfig, CaptureError, CaptureSession, CaptureTaps, CpalBackend, DeviceHandle,
    FrameSink, InputBackend, DEFAULT_BUFFER_SIZE,
};
pub use frame::{AudioFrame, FrameAssembler, PcmFrame};
pub use pcm::{decode_sample, encode_frame, encode_sample};
pub use waveform::{
    spawn_renderer, trace_points, GridSurface, RenderHandle, Surface, TerminalSurface,
};
