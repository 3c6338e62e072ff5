//! Mock synthesis backend.
//!
//! Generates silence or a sine wave whose duration is derived from the
//! input text length. Call counters are shared between every instance built
//! from the same [`MockCounters`], so tests can observe how often the pool
//! loaded, used and unloaded backends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::{Result, bail};
use async_trait::async_trait;
use tokio::time::sleep;
use tracing::debug;

use super::{SynthesisBackend, SynthesisOptions, SynthesisOutput};

// ── Configuration ────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum MockWaveform {
    Silence,
    Sine { frequency_hz: f32, amplitude: f32 },
}

#[derive(Debug, Clone)]
pub struct MockConfig {
    pub sample_rate: u32,
    pub ms_per_char: f64,
    pub min_duration_ms: f64,
    pub max_duration_ms: f64,
    pub waveform: MockWaveform,
    pub load_latency_ms: u64,
    pub unload_latency_ms: u64,
    pub latency_ms: u64,
    pub fail_load: bool,
    pub fail_synthesize: bool,
    /// Emit this many evenly spaced progress reports during synthesis.
    pub progress_steps: u32,
}

impl Default for MockConfig {
    fn default() -> Self {
        Self {
            sample_rate: 22050,
            ms_per_char: 40.0,
            min_duration_ms: 100.0,
            max_duration_ms: 10_000.0,
            waveform: MockWaveform::Silence,
            load_latency_ms: 0,
            unload_latency_ms: 0,
            latency_ms: 0,
            fail_load: false,
            fail_synthesize: false,
            progress_steps: 0,
        }
    }
}

/// Call counters shared by all mock instances of one test.
#[derive(Debug, Default)]
pub struct MockCounters {
    pub loads: AtomicUsize,
    pub syntheses: AtomicUsize,
    pub unloads: AtomicUsize,
    /// Syntheses currently running.
    pub in_flight: AtomicUsize,
    /// Highest `in_flight` value observed.
    pub peak_in_flight: AtomicUsize,
}

impl MockCounters {
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn syntheses(&self) -> usize {
        self.syntheses.load(Ordering::SeqCst)
    }

    pub fn unloads(&self) -> usize {
        self.unloads.load(Ordering::SeqCst)
    }

    /// Loaded minus unloaded: how many instances are resident right now.
    pub fn resident(&self) -> usize {
        self.loads().saturating_sub(self.unloads())
    }

    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }
}

// ── Provider ─────────────────────────────────────────────────────

pub struct MockProvider {
    config: MockConfig,
    counters: Arc<MockCounters>,
    loaded: AtomicBool,
}

impl MockProvider {
    pub fn new(config: MockConfig, counters: Arc<MockCounters>) -> Self {
        Self {
            config,
            counters,
            loaded: AtomicBool::new(false),
        }
    }

    pub fn silent() -> Self {
        Self::new(MockConfig::default(), Arc::default())
    }

    pub fn sine(frequency_hz: f32) -> Self {
        Self::new(
            MockConfig {
                waveform: MockWaveform::Sine {
                    frequency_hz,
                    amplitude: 0.8,
                },
                ..Default::default()
            },
            Arc::default(),
        )
    }

    pub fn counters(&self) -> &Arc<MockCounters> {
        &self.counters
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::SeqCst)
    }

    fn render(&self, text: &str) -> SynthesisOutput {
        let char_count = text.chars().count() as f64;
        let duration_ms = (char_count * self.config.ms_per_char)
            .clamp(self.config.min_duration_ms, self.config.max_duration_ms);
        let sample_count = (self.config.sample_rate as f64 * duration_ms / 1000.0) as usize;

        let samples = match &self.config.waveform {
            MockWaveform::Silence => vec![0.0f32; sample_count],
            MockWaveform::Sine {
                frequency_hz,
                amplitude,
            } => (0..sample_count)
                .map(|i| {
                    let t = i as f32 / self.config.sample_rate as f32;
                    amplitude * (std::f32::consts::TAU * frequency_hz * t).sin()
                })
                .collect(),
        };

        SynthesisOutput::mono(samples, self.config.sample_rate)
    }
}

#[async_trait]
impl SynthesisBackend for MockProvider {
    async fn load(&self) -> Result<()> {
        if self.config.load_latency_ms > 0 {
            sleep(Duration::from_millis(self.config.load_latency_ms)).await;
        }
        if self.config.fail_load {
            bail!("mock backend configured to fail on load");
        }
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        options: &SynthesisOptions,
    ) -> Result<SynthesisOutput> {
        if !self.is_loaded() {
            bail!("mock backend used before load");
        }
        self.counters.syntheses.fetch_add(1, Ordering::SeqCst);
        let now = self.counters.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let steps = self.config.progress_steps.max(1);
        let step_latency = Duration::from_millis(self.config.latency_ms / steps as u64);
        for step in 1..=self.config.progress_steps {
            sleep(step_latency).await;
            options.report(step as f32 / (steps + 1) as f32, "mock");
        }
        if self.config.progress_steps == 0 && self.config.latency_ms > 0 {
            sleep(Duration::from_millis(self.config.latency_ms)).await;
        }

        self.counters.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.config.fail_synthesize {
            bail!("mock backend configured to fail on synthesize");
        }

        debug!(voice, chars = text.chars().count(), "mock synthesis complete");
        Ok(self.render(text))
    }

    async fn unload(&self) -> Result<()> {
        if self.config.unload_latency_ms > 0 {
            sleep(Duration::from_millis(self.config.unload_latency_ms)).await;
        }
        if self.loaded.swap(false, Ordering::SeqCst) {
            self.counters.unloads.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "mock"
    }

    fn reports_progress(&self) -> bool {
        self.config.progress_steps > 0
    }
}
