//! Backend kinds and the factory registry that constructs them.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use super::provider::SynthesisBackend;
use super::provider::command::CommandProvider;
use super::provider::mock::{MockConfig, MockCounters, MockProvider};
use super::provider::voicevox::VoicevoxProvider;
use crate::config::{BackendsConfig, ConfigError};

/// Which synthesis engine to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BackendKind {
    /// Fast CPU engine used for previews and as the load-failure fallback.
    DefaultFast,
    Voicevox,
    Command,
    Mock,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DefaultFast => "default-fast",
            Self::Voicevox => "voicevox",
            Self::Command => "command",
            Self::Mock => "mock",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "default-fast" | "default" | "fast" => Ok(Self::DefaultFast),
            "voicevox" => Ok(Self::Voicevox),
            "command" | "cmd" => Ok(Self::Command),
            "mock" => Ok(Self::Mock),
            _ => Err(ConfigError::Unknown {
                what: "backend kind",
                value: s.to_string(),
            }),
        }
    }
}

/// Instance configuration. Equal configs share one loaded backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BackendConfig {
    pub model: Option<String>,
    /// Sorted so the fingerprint is independent of insertion order.
    #[serde(default)]
    pub options: BTreeMap<String, Value>,
}

impl BackendConfig {
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            ..Default::default()
        }
    }

    /// Short stable digest of this configuration.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let hash = Sha256::digest(canonical.as_bytes());
        hex::encode(&hash[..6])
    }
}

/// Identity of one loaded backend instance: `kind:config-fingerprint`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendKey(String);

impl BackendKey {
    pub fn new(kind: BackendKind, config: &BackendConfig) -> Self {
        Self(format!("{}:{}", kind, config.fingerprint()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BackendKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

type Factory = Arc<dyn Fn(&BackendConfig) -> Arc<dyn SynthesisBackend> + Send + Sync>;

/// Maps each [`BackendKind`] to a constructor.
#[derive(Clone, Default)]
pub struct BackendRegistry {
    factories: HashMap<BackendKind, Factory>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the constructor for `kind`.
    pub fn register<F>(&mut self, kind: BackendKind, factory: F) -> &mut Self
    where
        F: Fn(&BackendConfig) -> Arc<dyn SynthesisBackend> + Send + Sync + 'static,
    {
        self.factories.insert(kind, Arc::new(factory));
        self
    }

    /// Construct an unloaded backend, or `None` if `kind` is not registered.
    pub fn create(
        &self,
        kind: BackendKind,
        config: &BackendConfig,
    ) -> Option<Arc<dyn SynthesisBackend>> {
        self.factories.get(&kind).map(|f| f(config))
    }

    pub fn contains(&self, kind: BackendKind) -> bool {
        self.factories.contains_key(&kind)
    }

    pub fn kinds(&self) -> Vec<BackendKind> {
        let mut kinds: Vec<_> = self.factories.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    /// Registry with every shipped backend, wired from configuration.
    ///
    /// `default-fast` runs the configured command backend when one exists,
    /// otherwise the mock backend (dry run producing silence).
    pub fn from_config(backends: &BackendsConfig) -> Self {
        let mut registry = Self::new();

        let voicevox = backends.voicevox.clone();
        registry.register(BackendKind::Voicevox, move |_| {
            Arc::new(VoicevoxProvider::new(voicevox.clone())) as Arc<dyn SynthesisBackend>
        });

        let mock_counters = Arc::new(MockCounters::default());
        let counters = Arc::clone(&mock_counters);
        registry.register(BackendKind::Mock, move |_| {
            Arc::new(MockProvider::new(MockConfig::default(), Arc::clone(&counters)))
                as Arc<dyn SynthesisBackend>
        });

        match backends.command.clone() {
            Some(command) => {
                let cmd = command.clone();
                registry.register(BackendKind::Command, move |_| {
                    Arc::new(CommandProvider::new(cmd.clone())) as Arc<dyn SynthesisBackend>
                });
                registry.register(BackendKind::DefaultFast, move |_| {
                    Arc::new(CommandProvider::new(command.clone())) as Arc<dyn SynthesisBackend>
                });
            }
            None => {
                registry.register(BackendKind::DefaultFast, move |_| {
                    Arc::new(MockProvider::new(
                        MockConfig::default(),
                        Arc::clone(&mock_counters),
                    )) as Arc<dyn SynthesisBackend>
                });
            }
        }

        registry
    }
}
