//! VOICEVOX-compatible HTTP synthesis backend.
//!
//! Flow per utterance:
//! 1. POST `/audio_query?text=X&speaker=ID` → JSON query parameters
//! 2. Apply speed/pitch/intonation/volume scales from config, then any
//!    per-utterance overrides forwarded from the script
//! 3. POST `/synthesis?speaker=ID` with the JSON body → WAV audio
//!
//! `load` checks that the engine answers `GET /version`.

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info};

use super::{SynthesisBackend, SynthesisOptions, SynthesisOutput};
use crate::audio::pcm::pcm_i16_to_f32;
use crate::config::VoicevoxConfig;

/// Script fields that may override the configured scales per utterance.
const OVERRIDABLE_KEYS: &[&str] = &["speedScale", "pitchScale", "intonationScale", "volumeScale"];

pub struct VoicevoxProvider {
    config: VoicevoxConfig,
    client: reqwest::Client,
    loaded: AtomicBool,
}

impl VoicevoxProvider {
    pub fn new(config: VoicevoxConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
            loaded: AtomicBool::new(false),
        }
    }

    fn base(&self) -> &str {
        self.config.endpoint.trim_end_matches('/')
    }

    fn apply_scales(&self, query: &mut Value, extra: &Map<String, Value>) {
        let Some(obj) = query.as_object_mut() else {
            return;
        };
        obj.insert("speedScale".into(), self.config.speed_scale.into());
        obj.insert("pitchScale".into(), self.config.pitch_scale.into());
        obj.insert("intonationScale".into(), self.config.intonation_scale.into());
        obj.insert("volumeScale".into(), self.config.volume_scale.into());

        for key in OVERRIDABLE_KEYS {
            if let Some(v) = extra.get(*key).filter(|v| v.is_number()) {
                obj.insert((*key).to_string(), v.clone());
            }
        }
    }

    /// Parse a WAV body into f32 samples, sample rate and channel count.
    fn parse_wav(wav_bytes: &[u8]) -> Result<SynthesisOutput> {
        let reader =
            hound::WavReader::new(Cursor::new(wav_bytes)).context("failed to parse WAV response")?;
        let spec = reader.spec();
        let samples: Vec<i16> = reader
            .into_samples::<i16>()
            .collect::<Result<Vec<_>, _>>()
            .context("failed to read WAV samples")?;
        Ok(SynthesisOutput {
            samples: pcm_i16_to_f32(&samples),
            sample_rate: spec.sample_rate,
            channels: spec.channels,
        })
    }
}

#[async_trait]
impl SynthesisBackend for VoicevoxProvider {
    async fn load(&self) -> Result<()> {
        let version: String = self
            .client
            .get(format!("{}/version", self.base()))
            .send()
            .await
            .context("engine not reachable")?
            .error_for_status()
            .context("version endpoint returned error status")?
            .text()
            .await
            .context("failed to read version response")?;
        info!(endpoint = %self.config.endpoint, version = %version.trim(), "VOICEVOX engine ready");
        self.loaded.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn synthesize(
        &self,
        text: &str,
        voice: &str,
        options: &SynthesisOptions,
    ) -> Result<SynthesisOutput> {
        if !self.loaded.load(Ordering::SeqCst) {
            bail!("VOICEVOX backend used before load");
        }
        let base = self.base();

        let mut query: Value = self
            .client
            .post(format!("{}/audio_query", base))
            .query(&[("text", text), ("speaker", voice)])
            .send()
            .await
            .context("audio_query request failed")?
            .error_for_status()
            .context("audio_query returned error status")?
            .json()
            .await
            .context("failed to parse audio_query response as JSON")?;
        options.report(0.3, "audio_query");

        self.apply_scales(&mut query, &options.extra);

        let wav_bytes = self
            .client
            .post(format!("{}/synthesis", base))
            .query(&[("speaker", voice)])
            .json(&query)
            .send()
            .await
            .context("synthesis request failed")?
            .error_for_status()
            .context("synthesis returned error status")?
            .bytes()
            .await
            .context("failed to read synthesis response body")?;
        options.report(0.9, "synthesis");

        let output = Self::parse_wav(&wav_bytes)?;
        debug!(
            frames = output.frames(),
            sample_rate = output.sample_rate,
            "VOICEVOX synthesis complete"
        );
        Ok(output)
    }

    async fn unload(&self) -> Result<()> {
        self.loaded.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn name(&self) -> &str {
        "voicevox"
    }

    fn reports_progress(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> VoicevoxProvider {
        VoicevoxProvider::new(VoicevoxConfig::default())
    }

    fn wav_bytes(sample_rate: u32, channels: u16, frames: usize) -> Vec<u8> {
        let spec = hound::WavSpec {
            channels,
            sample_rate,
            bits_per_sample: 16,
            sample_format: hound::SampleFormat::Int,
        };
        let mut buf = Vec::new();
        {
            let mut writer = hound::WavWriter::new(Cursor::new(&mut buf), spec).unwrap();
            for i in 0..frames * channels as usize {
                writer.write_sample(((i % 100) as i16) * 100).unwrap();
            }
            writer.finalize().unwrap();
        }
        buf
    }

    #[test]
    fn provider_name() {
        assert_eq!(provider().name(), "voicevox");
        assert!(provider().reports_progress());
    }

    #[test]
    fn apply_scales_sets_config_values() {
        let p = VoicevoxProvider::new(VoicevoxConfig {
            speed_scale: 1.5,
            pitch_scale: 0.1,
            ..Default::default()
        });
        let mut query = serde_json::json!({"accent_phrases": []});
        p.apply_scales(&mut query, &Map::new());
        assert_eq!(query["speedScale"], 1.5);
        assert_eq!(query["pitchScale"], 0.1);
        assert_eq!(query["intonationScale"], 1.0);
        assert_eq!(query["volumeScale"], 1.0);
    }

    #[test]
    fn script_fields_override_scales() {
        let mut extra = Map::new();
        extra.insert("speedScale".into(), serde_json::json!(0.8));
        extra.insert("volumeScale".into(), serde_json::json!("loud"));
        extra.insert("emotion".into(), serde_json::json!("happy"));

        let mut query = serde_json::json!({});
        provider().apply_scales(&mut query, &extra);
        assert_eq!(query["speedScale"], 0.8);
        // non-numeric override ignored
        assert_eq!(query["volumeScale"], 1.0);
        assert!(query.get("emotion").is_none());
    }

    #[test]
    fn apply_scales_non_object_is_noop() {
        let mut query = serde_json::json!("not an object");
        provider().apply_scales(&mut query, &Map::new());
        assert_eq!(query, serde_json::json!("not an object"));
    }

    #[test]
    fn parse_wav_mono() {
        let out = VoicevoxProvider::parse_wav(&wav_bytes(24000, 1, 240)).unwrap();
        assert_eq!(out.sample_rate, 24000);
        assert_eq!(out.channels, 1);
        assert_eq!(out.samples.len(), 240);
        assert!(out.samples.iter().all(|&s| (-1.0..=1.0).contains(&s)));
    }

    #[test]
    fn parse_wav_stereo() {
        let out = VoicevoxProvider::parse_wav(&wav_bytes(48000, 2, 100)).unwrap();
        assert_eq!(out.channels, 2);
        assert_eq!(out.frames(), 100);
    }

    #[test]
    fn parse_wav_invalid_data() {
        assert!(VoicevoxProvider::parse_wav(b"not a wav file").is_err());
    }

    #[tokio::test]
    async fn synthesize_before_load_fails() {
        let err = provider()
            .synthesize("hi", "1", &SynthesisOptions::default())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("before load"));
    }
}
