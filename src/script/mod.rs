//! Multi-speaker scripts: parsing, the utterance model, and per-clip
//! metadata reported back to callers.
//!
//! A script is a JSON or YAML list of `{speaker, text, ...}` records. Extra
//! fields are kept verbatim and forwarded to the backend as options.

pub mod orchestrator;
pub mod progress;

#[cfg(test)]
mod e2e_test;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

pub use orchestrator::{RenderRequest, RenderResult, ScriptOrchestrator};
pub use progress::{ProgressReporter, ProgressSettings};

/// Speaker used when an entry does not name one.
pub const DEFAULT_SPEAKER: &str = "narrator";

/// Script speaker id → backend voice id.
pub type SpeakerMap = HashMap<String, String>;

#[derive(Debug, Error)]
pub enum ScriptError {
    #[error("script not found: {}", .0.display())]
    NotFound(PathBuf),

    #[error("failed to read script {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse script: {0}")]
    Parse(String),

    #[error("script must be a list of {{speaker,text}} entries")]
    NotAList,

    #[error("script entry {index} is invalid: {reason}")]
    InvalidEntry { index: usize, reason: String },

    #[error("script entry {index} ({speaker}) has no text")]
    EmptyText { index: usize, speaker: String },

    #[error("script has no entries")]
    Empty,
}

/// On-disk encoding of a script, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptFormat {
    Json,
    Yaml,
}

impl ScriptFormat {
    /// `.json` is JSON; anything else is read as YAML (a superset of JSON).
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

fn default_speaker() -> String {
    DEFAULT_SPEAKER.to_string()
}

/// One raw script record. A missing or `null` field takes its default.
#[derive(Debug, Clone, Deserialize)]
struct ScriptEntry {
    #[serde(default)]
    speaker: Option<String>,
    #[serde(default)]
    text: Option<String>,
    #[serde(flatten)]
    extra: Map<String, Value>,
}

/// One line of the script, immutable once parsed.
#[derive(Debug, Clone, PartialEq)]
pub struct Utterance {
    /// 1-based position in the script; the only ordering key.
    pub index: usize,
    pub speaker_id: String,
    pub voice_id: String,
    pub text: String,
    /// Unrecognised entry fields, forwarded to the backend.
    pub options: Map<String, Value>,
}

impl Utterance {
    /// Stable task id used in events and reports (`s001`, `s002`, ...).
    pub fn task_id(&self) -> String {
        task_id(self.index)
    }
}

pub fn task_id(index: usize) -> String {
    format!("s{index:03}")
}

/// Metadata for one clip of a finished (or partial) render.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClipInfo {
    pub idx: usize,
    pub speaker: String,
    pub voice: String,
    pub file: PathBuf,
    /// Seconds.
    pub duration: f64,
}

/// Parse script text in the given format.
pub fn parse_script_str(
    content: &str,
    format: ScriptFormat,
    speaker_map: &SpeakerMap,
) -> Result<Vec<Utterance>, ScriptError> {
    let value: Value = match format {
        ScriptFormat::Json => {
            serde_json::from_str(content).map_err(|e| ScriptError::Parse(e.to_string()))?
        }
        ScriptFormat::Yaml => {
            serde_yaml::from_str(content).map_err(|e| ScriptError::Parse(e.to_string()))?
        }
    };

    let Value::Array(records) = value else {
        return Err(ScriptError::NotAList);
    };
    if records.is_empty() {
        return Err(ScriptError::Empty);
    }

    records
        .into_iter()
        .enumerate()
        .map(|(i, record)| {
            let index = i + 1;
            let entry: ScriptEntry =
                serde_json::from_value(record).map_err(|e| ScriptError::InvalidEntry {
                    index,
                    reason: e.to_string(),
                })?;
            let speaker = entry.speaker.unwrap_or_else(default_speaker);
            let text = entry.text.unwrap_or_default();
            if text.trim().is_empty() {
                return Err(ScriptError::EmptyText { index, speaker });
            }
            let voice_id = speaker_map
                .get(&speaker)
                .cloned()
                .unwrap_or_else(|| speaker.clone());
            Ok(Utterance {
                index,
                speaker_id: speaker,
                voice_id,
                text,
                options: entry.extra,
            })
        })
        .collect()
}

/// Read and parse a script file.
pub fn parse_script(path: &Path, speaker_map: &SpeakerMap) -> Result<Vec<Utterance>, ScriptError> {
    if !path.is_file() {
        return Err(ScriptError::NotFound(path.to_path_buf()));
    }
    let content = std::fs::read_to_string(path).map_err(|source| ScriptError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    parse_script_str(&content, ScriptFormat::from_path(path), speaker_map)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DUET: &str = r#"[
        {"speaker": "Host", "text": "Hallo Welt."},
        {"speaker": "Guest", "text": "Dies ist ein Test.", "speedScale": 1.2}
    ]"#;

    #[test]
    fn parses_json_with_indices_and_options() {
        let utts = parse_script_str(DUET, ScriptFormat::Json, &SpeakerMap::new()).unwrap();
        assert_eq!(utts.len(), 2);
        assert_eq!(utts[0].index, 1);
        assert_eq!(utts[1].index, 2);
        assert_eq!(utts[1].task_id(), "s002");
        assert_eq!(utts[1].options["speedScale"], 1.2);
        assert!(utts[0].options.is_empty());
    }

    #[test]
    fn speaker_map_resolves_voices() {
        let map = SpeakerMap::from([("Host".to_string(), "de_DE-thorsten".to_string())]);
        let utts = parse_script_str(DUET, ScriptFormat::Json, &map).unwrap();
        assert_eq!(utts[0].voice_id, "de_DE-thorsten");
        // unmapped speakers are used as voice ids directly
        assert_eq!(utts[1].voice_id, "Guest");
    }

    #[test]
    fn parses_yaml_and_defaults_speaker() {
        let yaml = "- text: Guten Morgen\n- speaker: Anna\n  text: Hallo\n";
        let utts = parse_script_str(yaml, ScriptFormat::Yaml, &SpeakerMap::new()).unwrap();
        assert_eq!(utts[0].speaker_id, DEFAULT_SPEAKER);
        assert_eq!(utts[1].speaker_id, "Anna");
    }

    #[test]
    fn null_speaker_falls_back_to_narrator() {
        let utts = parse_script_str(
            r#"[{"speaker": null, "text": "Es war einmal."}]"#,
            ScriptFormat::Json,
            &SpeakerMap::new(),
        )
        .unwrap();
        assert_eq!(utts[0].speaker_id, DEFAULT_SPEAKER);
        assert_eq!(utts[0].voice_id, DEFAULT_SPEAKER);

        let yaml = "- speaker: ~
  text: Hallo
";
        let utts = parse_script_str(yaml, ScriptFormat::Yaml, &SpeakerMap::new()).unwrap();
        assert_eq!(utts[0].speaker_id, DEFAULT_SPEAKER);
    }

    #[test]
    fn null_text_is_reported_as_empty() {
        let err = parse_script_str(
            r#"[{"speaker": "A", "text": null}]"#,
            ScriptFormat::Json,
            &SpeakerMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ScriptError::EmptyText { index: 1, .. }));
    }

    #[test]
    fn rejects_non_list() {
        let err = parse_script_str(r#"{"text": "x"}"#, ScriptFormat::Json, &SpeakerMap::new())
            .unwrap_err();
        assert!(matches!(err, ScriptError::NotAList));
        assert_eq!(err.to_string(), "script must be a list of {speaker,text} entries");
    }

    #[test]
    fn rejects_empty_text() {
        let err = parse_script_str(
            r#"[{"speaker": "A", "text": "ok"}, {"speaker": "B", "text": "  "}]"#,
            ScriptFormat::Json,
            &SpeakerMap::new(),
        )
        .unwrap_err();
        assert!(matches!(err, ScriptError::EmptyText { index: 2, .. }));
    }

    #[test]
    fn rejects_malformed_entries_and_syntax() {
        assert!(matches!(
            parse_script_str(r#"[{"text": 5}]"#, ScriptFormat::Json, &SpeakerMap::new()),
            Err(ScriptError::InvalidEntry { index: 1, .. })
        ));
        assert!(matches!(
            parse_script_str("[{", ScriptFormat::Json, &SpeakerMap::new()),
            Err(ScriptError::Parse(_))
        ));
        assert!(matches!(
            parse_script_str("[]", ScriptFormat::Json, &SpeakerMap::new()),
            Err(ScriptError::Empty)
        ));
    }

    #[test]
    fn format_from_extension() {
        assert_eq!(ScriptFormat::from_path(Path::new("a.JSON")), ScriptFormat::Json);
        assert_eq!(ScriptFormat::from_path(Path::new("a.yml")), ScriptFormat::Yaml);
        assert_eq!(ScriptFormat::from_path(Path::new("script")), ScriptFormat::Yaml);
    }

    #[test]
    fn missing_file_is_reported() {
        let err = parse_script(Path::new("/no/such/script.json"), &SpeakerMap::new()).unwrap_err();
        assert!(matches!(err, ScriptError::NotFound(_)));
    }
}
