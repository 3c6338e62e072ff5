//! Configuration loaded from `config.toml`.
//!
//! Every section has defaults, so an empty or missing file yields a usable
//! configuration. Command-line flags override individual values.

pub mod schema;

use std::path::{Path, PathBuf};
use std::time::Duration;

use directories::ProjectDirs;
use serde::{Deserialize, Serialize};

pub use schema::{ConfigError, parse_duration, validate_worker_count};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pool: PoolConfig,
    pub render: RenderConfig,
    pub progress: ProgressConfig,
    pub encoder: EncoderConfig,
    pub backends: BackendsConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Maximum number of simultaneously loaded backends.
    pub max_resident: usize,
    /// Backend kind tried once when the requested one fails to load.
    pub fallback_backend: String,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_resident: 2,
            fallback_backend: "default-fast".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub backend: String,
    /// Signed so that a bad value in the file is reported, not wrapped.
    pub max_workers: i64,
    pub output_format: String,
    pub bitrate: String,
    /// Overall wait limit, e.g. "90s". Unset means `max(30s, 5s * pending)`.
    pub timeout: Option<String>,
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            backend: "default-fast".to_string(),
            max_workers: 2,
            output_format: "mp4".to_string(),
            bitrate: "192k".to_string(),
            timeout: None,
        }
    }
}

/// Simulated-progress tunables for backends that report nothing while busy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressConfig {
    pub ceiling: f32,
    pub cadence_ms: u64,
    pub step: f32,
}

impl Default for ProgressConfig {
    fn default() -> Self {
        Self {
            ceiling: 0.95,
            cadence_ms: 500,
            step: 0.02,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EncoderConfig {
    /// Explicit encoder binary. When set and missing, no PATH search happens.
    pub ffmpeg_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendsConfig {
    pub voicevox: VoicevoxConfig,
    pub command: Option<CommandBackendConfig>,
}

/// VOICEVOX-compatible HTTP engine settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoicevoxConfig {
    pub endpoint: String,
    pub speed_scale: f64,
    pub pitch_scale: f64,
    pub intonation_scale: f64,
    pub volume_scale: f64,
}

impl Default for VoicevoxConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:50021".to_string(),
            speed_scale: 1.0,
            pitch_scale: 0.0,
            intonation_scale: 1.0,
            volume_scale: 1.0,
        }
    }
}

/// External TTS program: reads text on stdin, writes WAV to stdout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandBackendConfig {
    pub program: PathBuf,
    /// Arguments; `{voice}` is replaced with the voice id.
    #[serde(default)]
    pub args: Vec<String>,
}

impl Config {
    /// Load from an explicit path, or from the platform config directory.
    ///
    /// A missing default file is not an error; a missing explicit file is.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let (path, required) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => match default_config_path() {
                Some(p) => (p, false),
                None => return Ok(Self::default()),
            },
        };

        let content = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if !required && e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                });
            }
        };

        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_worker_count(self.render.max_workers)?;
        if self.pool.max_resident == 0 {
            return Err(ConfigError::InvalidPoolSize);
        }
        if !(self.progress.ceiling > 0.0 && self.progress.ceiling < 1.0) {
            return Err(ConfigError::InvalidCeiling(self.progress.ceiling));
        }
        if let Some(t) = &self.render.timeout {
            parse_duration(t)?;
        }
        Ok(())
    }

    pub fn timeout(&self) -> Result<Option<Duration>, ConfigError> {
        self.render.timeout.as_deref().map(parse_duration).transpose()
    }
}

/// `<config dir>/voicereel/config.toml`, if the platform has one.
pub fn default_config_path() -> Option<PathBuf> {
    ProjectDirs::from("", "", "voicereel").map(|dirs| dirs.config_dir().join("config.toml"))
}
