//! Synthesis backend capability trait and shipped implementations.

pub mod command;
pub mod mock;
pub mod voicevox;

use anyhow::Result;
use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;

use crate::script::progress::ProgressReporter;

/// PCM produced by one synthesis call.
#[derive(Debug, Clone)]
pub struct SynthesisOutput {
    /// Interleaved f32 samples in `-1.0..=1.0`.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
}

impl SynthesisOutput {
    pub fn mono(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
            channels: 1,
        }
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / self.channels.max(1) as usize
    }

    pub fn duration_secs(&self) -> f64 {
        if self.sample_rate == 0 {
            return 0.0;
        }
        self.frames() as f64 / self.sample_rate as f64
    }
}

/// Per-call options handed to a backend.
#[derive(Clone, Default)]
pub struct SynthesisOptions {
    /// Extra script fields (prosody hints etc.), forwarded untouched.
    pub extra: Map<String, Value>,
    /// Cooperative cancellation; backends may poll it between stages.
    pub cancel: CancellationToken,
    /// Fine-grained progress sink for backends that can report it.
    pub progress: Option<ProgressReporter>,
}

impl SynthesisOptions {
    pub fn report(&self, fraction: f32, stage: &str) {
        if let Some(p) = &self.progress {
            p.report(fraction, Some(stage));
        }
    }
}

/// A loadable text-to-speech engine.
///
/// `load` may take seconds and hold exclusive resources; the pool calls it
/// at most once per resident instance and never concurrently with `unload`.
#[async_trait]
pub trait SynthesisBackend: Send + Sync {
    async fn load(&self) -> Result<()>;

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        options: &SynthesisOptions,
    ) -> Result<SynthesisOutput>;

    async fn unload(&self) -> Result<()>;

    /// Human-readable backend name.
    fn name(&self) -> &str;

    /// Whether `synthesize` reports intermediate progress itself.
    fn reports_progress(&self) -> bool {
        false
    }
}
