//! Float to PCM16 conversion
//!
//! Negative samples scale by 32768 and non-negative samples by 32767, so the
//! full signed 16-bit range is reachable from [-1.0, 1.0]. The receiving
//! transcription services expect exactly this mapping.

use super::frame::{AudioFrame, PcmFrame};

const NEG_SCALE: f32 = 32768.0;
const POS_SCALE: f32 = 32767.0;

/// Convert one normalized sample to a signed 16-bit sample.
///
/// Out-of-range input is clamped to [-1.0, 1.0]. NaN encodes to 0.
pub fn encode_sample(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * NEG_SCALE).round() as i16
    } else {
        // NaN falls through here; the saturating cast maps it to 0
        (s * POS_SCALE).round() as i16
    }
}

/// Inverse of [`encode_sample`] for already-quantized values.
pub fn decode_sample(sample: i16) -> f32 {
    if sample < 0 {
        sample as f32 / NEG_SCALE
    } else {
        sample as f32 / POS_SCALE
    }
}

/// Encode a whole frame. The output has the same length and sequence number.
pub fn encode_frame(frame: &AudioFrame) -> PcmFrame {
    let mut samples = Vec::with_capacity(frame.len());
    samples.extend(frame.samples().iter().map(|&s| encode_sample(s)));
    PcmFrame::new(samples, frame.sequence())
}
