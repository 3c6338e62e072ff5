//! Assemble per-utterance clips into the final preview artifact.
//!
//! Tiers, best first:
//! 1. `wav` requested: concatenate directly.
//! 2. Encoder found and every clip shares rate/channels: stream s16le PCM
//!    into the encoder clip by clip, never materialising the whole show.
//! 3. Otherwise concatenate to an intermediate WAV and run one conversion.
//! 4. If conversion is impossible or fails, keep the WAV and set a warning.
//!
//! Every tier that returns `Ok` leaves a non-empty artifact behind.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::ffmpeg::{self, FfmpegInput, FfmpegProcess};
use super::wav::{self, S16leChunks, WavInfo};
use crate::config::ConfigError;

pub const ARTIFACT_STEM: &str = "script_preview";

/// PCM chunks buffered between the clip reader and the encoder.
const PCM_QUEUE_DEPTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Wav,
    /// AAC in a fragmented, fast-start MP4 container.
    Mp4,
    Mp3,
}

impl OutputFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Wav => "wav",
            Self::Mp4 => "mp4",
            Self::Mp3 => "mp3",
        }
    }

    /// Audio codec passed to the encoder; `None` for raw output.
    pub fn codec(&self) -> Option<&'static str> {
        match self {
            Self::Wav => None,
            Self::Mp4 => Some("aac"),
            Self::Mp3 => Some("libmp3lame"),
        }
    }

    /// Container flags placed before the codec options.
    pub fn extra_args(&self) -> &'static [&'static str] {
        match self {
            Self::Mp4 => &["-movflags", "+faststart+frag_keyframe+empty_moov"],
            Self::Wav | Self::Mp3 => &[],
        }
    }
}

impl fmt::Display for OutputFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for OutputFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "wav" | "raw" => Ok(Self::Wav),
            "mp4" | "m4a" | "aac" => Ok(Self::Mp4),
            "mp3" => Ok(Self::Mp3),
            _ => Err(ConfigError::Unknown {
                what: "output format",
                value: s.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EncoderSettings {
    pub format: OutputFormat,
    pub bitrate: String,
    /// Explicit encoder binary; `None` searches the usual places.
    pub ffmpeg_path: Option<PathBuf>,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            format: OutputFormat::Mp4,
            bitrate: "192k".to_string(),
            ffmpeg_path: None,
        }
    }
}

/// Which strategy produced the artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeTier {
    Concat,
    Stream,
    ConcatConvert,
    RawFallback,
}

#[derive(Debug, Clone)]
pub struct EncodeOutcome {
    pub path: PathBuf,
    pub tier: EncodeTier,
    /// Set whenever the artifact is degraded relative to the request.
    pub warning: Option<String>,
}

pub fn artifact_path(out_dir: &Path, format: OutputFormat) -> PathBuf {
    out_dir.join(format!("{}.{}", ARTIFACT_STEM, format.extension()))
}

async fn ensure_non_empty(path: &Path) -> Result<()> {
    let meta = tokio::fs::metadata(path)
        .await
        .with_context(|| format!("encoder produced no file at {}", path.display()))?;
    if meta.len() == 0 {
        bail!("encoder produced an empty file at {}", path.display());
    }
    Ok(())
}

async fn concat_blocking(sources: &[PathBuf], dest: PathBuf) -> Result<wav::ConcatOutcome> {
    let sources = sources.to_vec();
    tokio::task::spawn_blocking(move || {
        let refs: Vec<&Path> = sources.iter().map(PathBuf::as_path).collect();
        wav::concat(&refs, &dest)
    })
    .await
    .context("concatenation task panicked")?
}

fn normalized_note(info: &WavInfo) -> String {
    format!(
        "clips had mismatched formats and were converted to {} Hz / {} ch",
        info.sample_rate, info.channels
    )
}

/// Feed every clip's PCM into one encoder process.
async fn stream_encode(
    ffmpeg: &Path,
    sources: &[PathBuf],
    first: &WavInfo,
    settings: &EncoderSettings,
    target: &Path,
) -> Result<()> {
    let args = ffmpeg::encode_args(
        FfmpegInput::RawPcm {
            sample_rate: first.sample_rate,
            channels: first.channels,
        },
        settings.format,
        &settings.bitrate,
        target,
    );
    let mut process = FfmpegProcess::spawn(ffmpeg, &args, true)?;

    // Clip files are read on the blocking pool; the channel bounds how far
    // reading runs ahead of the encoder.
    let (tx, mut rx) = mpsc::channel::<Result<Vec<u8>>>(PCM_QUEUE_DEPTH);
    let sources = sources.to_vec();
    let reader = tokio::task::spawn_blocking(move || {
        for source in &sources {
            let chunks = match S16leChunks::open(source) {
                Ok(chunks) => chunks,
                Err(e) => {
                    let _ = tx.blocking_send(Err(e));
                    return;
                }
            };
            for chunk in chunks {
                let failed = chunk.is_err();
                if tx.blocking_send(chunk).is_err() || failed {
                    return;
                }
            }
        }
    });

    while let Some(chunk) = rx.recv().await {
        process.write_pcm(&chunk?).await?;
    }
    reader.await.context("PCM reader task panicked")?;
    process.finish().await?;
    ensure_non_empty(target).await
}

/// Build the preview artifact from `sources`, in order.
pub async fn encode(
    sources: &[PathBuf],
    out_dir: &Path,
    settings: &EncoderSettings,
) -> Result<EncodeOutcome> {
    if sources.is_empty() {
        bail!("no clips to encode");
    }
    tokio::fs::create_dir_all(out_dir)
        .await
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let wav_path = artifact_path(out_dir, OutputFormat::Wav);

    if settings.format == OutputFormat::Wav {
        let outcome = concat_blocking(sources, wav_path.clone()).await?;
        info!(path = %wav_path.display(), clips = sources.len(), "wrote WAV preview");
        return Ok(EncodeOutcome {
            path: wav_path,
            tier: EncodeTier::Concat,
            warning: outcome.normalized.then(|| normalized_note(&outcome.info)),
        });
    }

    let target = artifact_path(out_dir, settings.format);
    let ffmpeg = ffmpeg::find_ffmpeg(settings.ffmpeg_path.as_deref());
    let mut notes: Vec<String> = Vec::new();

    let infos = sources
        .iter()
        .map(|s| wav::probe(s))
        .collect::<Result<Vec<_>>>()?;
    let first = infos[0];
    let uniform = infos.iter().all(|i| i.compatible_with(&first));

    match (&ffmpeg, uniform) {
        (Some(ff), true) => match stream_encode(ff, sources, &first, settings, &target).await {
            Ok(()) => {
                info!(path = %target.display(), clips = sources.len(), "streamed preview through encoder");
                return Ok(EncodeOutcome {
                    path: target,
                    tier: EncodeTier::Stream,
                    warning: None,
                });
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "streaming encode failed; falling back to concatenation");
                tokio::fs::remove_file(&target).await.ok();
                notes.push(format!("streaming encode failed ({e})"));
            }
        },
        (Some(_), false) => {
            info!("clip formats differ; concatenating before conversion");
            notes.push("clips had mismatched sample rates or channel counts".to_string());
        }
        (None, _) => {
            warn!("ffmpeg not found; preview will be WAV");
            notes.push("ffmpeg not found".to_string());
        }
    }

    let concat = concat_blocking(sources, wav_path.clone()).await?;
    if concat.normalized {
        notes.push(normalized_note(&concat.info));
    }

    if let Some(ff) = &ffmpeg {
        let converted = match ffmpeg::convert(ff, &wav_path, settings.format, &settings.bitrate, &target).await {
            Ok(()) => ensure_non_empty(&target).await,
            Err(e) => Err(e),
        };
        match converted {
            Ok(()) => {
                tokio::fs::remove_file(&wav_path).await.ok();
                info!(path = %target.display(), "converted concatenated preview");
                return Ok(EncodeOutcome {
                    path: target,
                    tier: EncodeTier::ConcatConvert,
                    warning: Some(notes.join("; ")),
                });
            }
            Err(e) => {
                warn!(error = %format!("{e:#}"), "conversion failed; keeping WAV");
                tokio::fs::remove_file(&target).await.ok();
                notes.push(format!("conversion to {} failed ({e})", settings.format));
            }
        }
    }

    notes.push(format!("wrote uncompressed WAV instead of {}", settings.format));
    Ok(EncodeOutcome {
        path: wav_path,
        tier: EncodeTier::RawFallback,
        warning: Some(notes.join("; ")),
    })
}
