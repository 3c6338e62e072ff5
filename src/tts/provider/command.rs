//! Backend that shells out to an external TTS program.
//!
//! The program receives the utterance text on stdin and must write a WAV
//! file to stdout (e.g. `piper --output_file -`). Arguments may contain a
//! `{voice}` placeholder.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;

use anyhow::{Context, Result, anyhow, bail};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use super::{SynthesisBackend, SynthesisOptions, SynthesisOutput};
use crate::audio::ffmpeg::resolve_executable;
use crate::audio::pcm::{int_sample_to_i16, pcm_i16_to_f32};
use crate::config::CommandBackendConfig;

pub struct CommandProvider {
    config: CommandBackendConfig,
    /// Resolved program path, set by `load`.
    resolved: Mutex<Option<PathBuf>>,
}

impl CommandProvider {
    pub fn new(config: CommandBackendConfig) -> Self {
        Self {
            config,
            resolved: Mutex::new(None),
        }
    }

    fn args_for(&self, voice: &str) -> Vec<String> {
        self.config
            .args
            .iter()
            .map(|a| a.replace("{voice}", voice))
            .collect()
    }

    fn program(&self) -> Result<PathBuf> {
        self.resolved
            .lock()
            .map_err(|_| anyhow!("command backend state poisoned"))?
            .clone()
            .ok_or_else(|| anyhow!("command backend used before load"))
    }
}

fn decode_wav(bytes: &[u8]) -> Result<SynthesisOutput> {
    let reader = hound::WavReader::new(std::io::Cursor::new(bytes))
        .context("TTS program did not produce a WAV stream")?;
    let spec = reader.spec();
    let samples = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read float WAV samples")?,
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample;
            let ints = reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| int_sample_to_i16(v, bits)))
                .collect::<Result<Vec<_>, _>>()
                .context("failed to read WAV samples")?;
            pcm_i16_to_f32(&ints)
        }
    };
    Ok(SynthesisOutput {
        samples,
        sample_rate: spec.sample_rate,
        channels: spec.channels,
    })
}

#[async_trait]
impl SynthesisBackend for CommandProvider {
    async fn load(&self) -> Result<()> {
        let path = resolve_executable(&self.config.program)
            .with_context(|| format!("TTS program not found: {}", self.config.program.display()))?;
        info!(program = %path.display(), "command backend ready");
        *self
            .resolved
            .lock()
            .map_err(|_| anyhow!("command backend state poisoned"))? = Some(path);
        Ok(())
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        options: &SynthesisOptions,
    ) -> Result<SynthesisOutput> {
        let program = self.program()?;
        let mut child = Command::new(&program)
            .args(self.args_for(voice))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn {}", program.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(text.as_bytes())
                .await
                .context("failed to write text to TTS program")?;
            // stdin dropped here so the program sees EOF
        }

        let output = tokio::select! {
            out = child.wait_with_output() => out.context("TTS program failed")?,
            _ = options.cancel.cancelled() => bail!("synthesis cancelled"),
        };

        if !output.status.success() {
            bail!(
                "TTS program exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let decoded = decode_wav(&output.stdout)?;
        debug!(voice, frames = decoded.frames(), "command synthesis complete");
        Ok(decoded)
    }

    async fn unload(&self) -> Result<()> {
        if let Ok(mut guard) = self.resolved.lock() {
            *guard = None;
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "command"
    }
}
