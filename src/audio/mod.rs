//! PCM resampling and voice-activity detection (§4.B).

pub mod resampler;
pub mod vad;

pub use resampler::upsample_16k_to_24k;
pub use vad::{FrameAction, VadState, VoicePipeline};
