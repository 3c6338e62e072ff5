//! Audio plumbing: PCM helpers, WAV clip IO and preview encoding.

pub mod encoder;
pub mod ffmpeg;
pub mod pcm;
pub mod wav;

pub use encoder::{EncodeOutcome, EncodeTier, EncoderSettings, OutputFormat, encode};
