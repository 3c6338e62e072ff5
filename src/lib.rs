//! VoiceReel - render multi-speaker scripts into a single audio file
//!
//! This crate provides the pieces of a script render:
//! - Synthesis backends behind one trait, created through a registry
//! - A bounded pool of loaded backends shared across renders
//! - A content-addressed cache of synthesized clips
//! - Bounded parallel synthesis with cooperative cancellation
//! - Per-line progress events with simulated progress for silent backends
//! - Streaming encode through ffmpeg, with WAV fallbacks

pub mod audio;
pub mod concurrency;
pub mod config;
pub mod events;
pub mod script;
pub mod tts;
pub mod utils;

pub use config::Config;
pub use script::{RenderRequest, RenderResult, ScriptOrchestrator};
