//! Content-addressed cache of synthesized clips.
//!
//! One 16-bit WAV per key, stored as `{dir}/{key}.wav`. The key is the
//! SHA-256 of the normalised text, the voice and the backend kind, so a
//! repeated (text, voice, backend) triple is never synthesized twice.
//!
//! Writes go to a unique temporary name and are renamed into place, so a
//! reader never observes a half-written file and concurrent stores of the
//! same key (identical content) simply race to the same result.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use super::provider::SynthesisOutput;
use super::registry::BackendKind;
use crate::audio::wav;
use crate::utils::normalize_text;

/// Fields hashed into a [`CacheKey`].
#[derive(Debug, Serialize)]
struct CacheKeyParams<'a> {
    text: &'a str,
    voice: &'a str,
    backend: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CacheKey(String);

impl CacheKey {
    pub fn compute(text: &str, voice: &str, backend: BackendKind) -> Self {
        let text = normalize_text(text);
        let params = CacheKeyParams {
            text: &text,
            voice,
            backend: backend.as_str(),
        };
        let canonical = serde_json::to_string(&params).unwrap_or_default();
        Self(hex::encode(Sha256::digest(canonical.as_bytes())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A clip present in the cache.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub path: PathBuf,
    pub duration_secs: f64,
}

#[derive(Debug, Clone)]
pub struct ResultCache {
    dir: PathBuf,
}

impl ResultCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub async fn ensure_dir(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("failed to create cache dir {}", self.dir.display()))
    }

    pub fn path_for(&self, key: &CacheKey) -> PathBuf {
        self.dir.join(format!("{key}.wav"))
    }

    /// Path of the cached clip, if present.
    pub fn lookup(&self, key: &CacheKey) -> Option<PathBuf> {
        let path = self.path_for(key);
        if path.is_file() {
            debug!(key = %key, "cache hit");
            Some(path)
        } else {
            debug!(key = %key, "cache miss");
            None
        }
    }

    /// Cached clip with its duration, if present and readable.
    pub fn entry(&self, key: &CacheKey) -> Option<CacheEntry> {
        let path = self.lookup(key)?;
        let info = wav::probe(&path).ok()?;
        Some(CacheEntry {
            key: key.clone(),
            path,
            duration_secs: info.duration_secs(),
        })
    }

    /// Persist a synthesis result under `key`.
    pub async fn store(&self, key: &CacheKey, output: SynthesisOutput) -> Result<CacheEntry> {
        let path = self.path_for(key);
        let tmp = self
            .dir
            .join(format!("{key}.wav.tmp-{}", uuid::Uuid::new_v4().simple()));
        let duration_secs = output.duration_secs();

        let (write_tmp, write_path) = (tmp.clone(), path.clone());
        let written = tokio::task::spawn_blocking(move || -> Result<()> {
            wav::write_output(&write_tmp, &output)?;
            std::fs::rename(&write_tmp, &write_path).with_context(|| {
                format!("failed to move clip into cache at {}", write_path.display())
            })
        })
        .await
        .context("cache write task panicked")?;

        if let Err(e) = written {
            tokio::fs::remove_file(&tmp).await.ok();
            return Err(e);
        }

        debug!(key = %key, duration_secs, "cache store");
        Ok(CacheEntry {
            key: key.clone(),
            path,
            duration_secs,
        })
    }

    /// Number of cached clips.
    pub fn entry_count(&self) -> usize {
        std::fs::read_dir(&self.dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().is_some_and(|x| x == "wav"))
                    .count()
            })
            .unwrap_or(0)
    }
}
