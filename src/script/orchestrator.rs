//! Render a script into one preview artifact.
//!
//! Flow: validate the request, parse the script, resolve each utterance
//! against the result cache, synthesize the misses on the task scheduler
//! (backends drawn from the shared pool), then hand the clips, in index
//! order, to the encoder. Every failure is folded into [`RenderResult`].

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::progress::{ProgressSettings, ProgressTracker};
use super::{ClipInfo, ScriptError, SpeakerMap, Utterance, parse_script};
use crate::audio::encoder::{self, EncoderSettings, OutputFormat};
use crate::concurrency::{ScheduledTask, SchedulerError, TaskScheduler, TaskStatus, checkpoint};
use crate::config::{ConfigError, validate_worker_count};
use crate::events::{Event, EventBus, PreviewReadyEvent, ProgressEvent, ProgressStatus, now_ms};
use crate::tts::provider::SynthesisOptions;
use crate::tts::{
    BackendConfig, BackendKind, BackendPool, CacheEntry, CacheKey, PoolError, ResultCache,
};
use crate::utils::preview;

/// Parameters of one render. Build with [`RenderRequest::new`] and adjust
/// the public fields.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub script_path: PathBuf,
    pub out_dir: PathBuf,
    pub speaker_map: SpeakerMap,
    /// Backend kind name, e.g. `"default-fast"` or `"voicevox"`.
    pub backend: String,
    pub backend_config: BackendConfig,
    /// Defaults to `out_dir/cache`.
    pub cache_dir: Option<PathBuf>,
    /// Signed so that zero and negative counts can be rejected.
    pub max_workers: i64,
    pub cancel: CancellationToken,
    pub output_format: OutputFormat,
    pub bitrate: String,
    /// Overall wait for synthesis. Defaults to `max(30s, 5s * tasks)`.
    pub timeout: Option<Duration>,
}

impl RenderRequest {
    pub fn new(script_path: impl Into<PathBuf>, out_dir: impl Into<PathBuf>) -> Self {
        Self {
            script_path: script_path.into(),
            out_dir: out_dir.into(),
            speaker_map: SpeakerMap::new(),
            backend: BackendKind::DefaultFast.to_string(),
            backend_config: BackendConfig::default(),
            cache_dir: None,
            max_workers: 2,
            cancel: CancellationToken::new(),
            output_format: OutputFormat::Mp4,
            bitrate: "192k".to_string(),
            timeout: None,
        }
    }

    fn cache_dir(&self) -> PathBuf {
        self.cache_dir
            .clone()
            .unwrap_or_else(|| self.out_dir.join("cache"))
    }
}

/// Outcome of a render. `ok` is always set; failures carry `message`,
/// degraded successes carry `warning`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RenderResult {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artifact_path: Option<PathBuf>,
    pub clips: Vec<ClipInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The run stopped because cancellation was requested.
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub cancelled: bool,
}

impl RenderResult {
    fn failure(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: Some(message.into()),
            ..Default::default()
        }
    }
}

/// Default overall synthesis timeout for `pending` tasks.
pub fn default_timeout(pending: usize) -> Duration {
    Duration::from_secs((5 * pending as u64).max(30))
}

#[derive(Debug, Error)]
enum RenderError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Script(#[from] ScriptError),

    #[error("failed to prepare output directories: {0}")]
    Io(String),

    #[error("timeout waiting for synth tasks: {}", .0.join(", "))]
    Timeout(Vec<String>),

    #[error("TTS synth failed: {task_id}: {reason}")]
    Synthesis { task_id: String, reason: String },

    #[error("{}", cancelled_message(.task_ids))]
    Cancelled {
        task_ids: Vec<String>,
        clips: Vec<ClipInfo>,
    },

    #[error("failed to build preview: {0}")]
    Encode(String),
}

fn cancelled_message(task_ids: &[String]) -> String {
    if task_ids.is_empty() {
        "cancelled".to_string()
    } else {
        format!("cancelled: {}", task_ids.join(", "))
    }
}

impl From<SchedulerError> for RenderError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::Timeout { outstanding, .. } => Self::Timeout(outstanding),
            SchedulerError::Panicked(task_id) => Self::Synthesis {
                task_id,
                reason: "worker panicked".to_string(),
            },
        }
    }
}

impl From<RenderError> for RenderResult {
    fn from(err: RenderError) -> Self {
        let message = err.to_string();
        match err {
            RenderError::Cancelled { clips, .. } => Self {
                ok: false,
                clips,
                message: Some(message),
                cancelled: true,
                ..Default::default()
            },
            _ => Self::failure(message),
        }
    }
}

/// Error raised inside one synthesis task.
#[derive(Debug, Error)]
enum TaskError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("{0:#}")]
    Backend(anyhow::Error),
}

/// One cache miss scheduled for synthesis.
#[derive(Debug, Clone)]
pub struct SynthesisTask {
    pub utterance: Utterance,
    pub cache_key: CacheKey,
    pub status: TaskStatus,
    pub result_path: Option<PathBuf>,
}

/// What a worker hands back to the orchestrator.
#[derive(Debug)]
enum TaskOutcome {
    Done(CacheEntry),
    Cancelled,
    Failed(String),
}

/// Shared state every worker of one render needs.
struct WorkerContext {
    pool: BackendPool,
    bus: EventBus,
    cache: ResultCache,
    kind: BackendKind,
    backend_config: BackendConfig,
    progress: ProgressSettings,
}

impl WorkerContext {
    fn publish_status(&self, utterance: &Utterance, status: ProgressStatus) {
        self.bus.publish(Event::progress(ProgressEvent::status(
            &utterance.task_id(),
            utterance.index,
            status,
        )));
    }

    /// Synthesize one utterance and store it in the cache.
    ///
    /// Cancellation is checked before any work and again after the backend
    /// returns; a result produced after cancellation is discarded, not cached.
    async fn synthesize(
        self: Arc<Self>,
        utterance: Utterance,
        key: CacheKey,
        cancel: CancellationToken,
    ) -> TaskOutcome {
        let task_id = utterance.task_id();
        if checkpoint(&cancel).is_err() {
            debug!(task = %task_id, "cancelled before start");
            self.publish_status(&utterance, ProgressStatus::Cancelled);
            return TaskOutcome::Cancelled;
        }

        info!(task = %task_id, index = utterance.index, text = %preview(&utterance.text, 40), "synthesis started");
        let tracker = ProgressTracker::start(
            self.bus.clone(),
            task_id.clone(),
            utterance.index,
            self.progress,
            &cancel,
        );
        let reporter = tracker.reporter();
        let options = SynthesisOptions {
            extra: utterance.options.clone(),
            cancel: cancel.clone(),
            progress: Some(reporter.clone()),
        };
        let (text, voice) = (utterance.text.clone(), utterance.voice_id.clone());

        let result = self
            .pool
            .scoped(self.kind, &self.backend_config, |backend| async move {
                reporter.set_simulated(!backend.reports_progress());
                backend
                    .synthesize(&text, &voice, &options)
                    .await
                    .map_err(TaskError::Backend)
            })
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) if cancel.is_cancelled() => {
                debug!(task = %task_id, error = %e, "synthesis interrupted by cancellation");
                tracker.abort(ProgressStatus::Cancelled).await;
                return TaskOutcome::Cancelled;
            }
            Err(e) => {
                error!(task = %task_id, error = %e, "synthesis failed");
                tracker.abort(ProgressStatus::Failed).await;
                // a missing clip fails the run, so stop the other workers early
                cancel.cancel();
                return TaskOutcome::Failed(e.to_string());
            }
        };

        if checkpoint(&cancel).is_err() {
            debug!(task = %task_id, "cancelled after synthesis; result discarded");
            tracker.abort(ProgressStatus::Cancelled).await;
            return TaskOutcome::Cancelled;
        }

        match self.cache.store(&key, output).await {
            Ok(entry) => {
                tracker.finish().await;
                info!(task = %task_id, duration_secs = entry.duration_secs, "synthesis done");
                TaskOutcome::Done(entry)
            }
            Err(e) => {
                error!(task = %task_id, error = %format!("{e:#}"), "failed to store clip");
                tracker.abort(ProgressStatus::Failed).await;
                cancel.cancel();
                TaskOutcome::Failed(format!("{e:#}"))
            }
        }
    }
}

/// Renders scripts using a shared backend pool.
#[derive(Clone)]
pub struct ScriptOrchestrator {
    pool: BackendPool,
    bus: EventBus,
    progress: ProgressSettings,
    ffmpeg_path: Option<PathBuf>,
}

impl ScriptOrchestrator {
    pub fn new(pool: BackendPool, bus: EventBus) -> Self {
        Self {
            pool,
            bus,
            progress: ProgressSettings::default(),
            ffmpeg_path: None,
        }
    }

    pub fn with_progress(mut self, progress: ProgressSettings) -> Self {
        self.progress = progress;
        self
    }

    /// Use this encoder binary instead of searching for one.
    pub fn with_ffmpeg_path(mut self, path: Option<PathBuf>) -> Self {
        self.ffmpeg_path = path;
        self
    }

    pub fn pool(&self) -> &BackendPool {
        &self.pool
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    /// Render `req.script_path` into `req.out_dir`.
    ///
    /// Never returns an error: the result's `ok` flag and `message` report
    /// failures.
    pub async fn synthesize_script_preview(&self, req: RenderRequest) -> RenderResult {
        match self.render(req).await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "render did not complete");
                e.into()
            }
        }
    }

    async fn render(&self, req: RenderRequest) -> Result<RenderResult, RenderError> {
        // configuration errors are reported before anything touches disk
        let workers = validate_worker_count(req.max_workers)?;
        let kind: BackendKind = req.backend.parse()?;
        let utterances = parse_script(&req.script_path, &req.speaker_map)?;

        let cache = ResultCache::new(req.cache_dir());
        tokio::fs::create_dir_all(&req.out_dir)
            .await
            .map_err(|e| RenderError::Io(e.to_string()))?;
        cache
            .ensure_dir()
            .await
            .map_err(|e| RenderError::Io(format!("{e:#}")))?;

        info!(
            script = %req.script_path.display(),
            utterances = utterances.len(),
            backend = %kind,
            workers = workers.get(),
            "rendering script"
        );

        // resolve cache hits and deduplicate identical misses
        let mut entries: HashMap<CacheKey, CacheEntry> = HashMap::new();
        let mut tasks: BTreeMap<CacheKey, SynthesisTask> = BTreeMap::new();
        let mut keys = Vec::with_capacity(utterances.len());
        for utterance in &utterances {
            let key = CacheKey::compute(&utterance.text, &utterance.voice_id, kind);
            keys.push(key.clone());
            if entries.contains_key(&key) || tasks.contains_key(&key) {
                continue;
            }
            match cache.entry(&key) {
                Some(entry) => {
                    entries.insert(key, entry);
                }
                None => {
                    tasks.insert(
                        key.clone(),
                        SynthesisTask {
                            utterance: utterance.clone(),
                            cache_key: key,
                            status: TaskStatus::Pending,
                            result_path: None,
                        },
                    );
                }
            }
        }
        let mut tasks: Vec<SynthesisTask> = tasks.into_values().collect();
        tasks.sort_by_key(|t| t.utterance.index);
        info!(cached = entries.len(), to_synthesize = tasks.len(), "cache resolved");

        if !tasks.is_empty() {
            let synthesized = self
                .run_tasks(&req, workers, kind, cache.clone(), &mut tasks)
                .await?;
            entries.extend(synthesized.into_iter().map(|e| (e.key.clone(), e)));
        }

        let clips: Vec<ClipInfo> = utterances
            .iter()
            .zip(&keys)
            .filter_map(|(u, key)| {
                entries.get(key).map(|entry| ClipInfo {
                    idx: u.index,
                    speaker: u.speaker_id.clone(),
                    voice: u.voice_id.clone(),
                    file: entry.path.clone(),
                    duration: entry.duration_secs,
                })
            })
            .collect();

        let cancelled: Vec<String> = tasks
            .iter()
            .filter(|t| t.status == TaskStatus::Cancelled)
            .map(|t| t.utterance.task_id())
            .collect();
        if !cancelled.is_empty() || checkpoint(&req.cancel).is_err() {
            info!(?cancelled, "render cancelled");
            return Err(RenderError::Cancelled {
                task_ids: cancelled,
                clips,
            });
        }

        let sources: Vec<PathBuf> = clips.iter().map(|c| c.file.clone()).collect();
        let settings = EncoderSettings {
            format: req.output_format,
            bitrate: req.bitrate.clone(),
            ffmpeg_path: self.ffmpeg_path.clone(),
        };
        let outcome = encoder::encode(&sources, &req.out_dir, &settings)
            .await
            .map_err(|e| RenderError::Encode(format!("{e:#}")))?;
        if let Some(warning) = &outcome.warning {
            warn!(%warning, "preview degraded");
        }

        self.bus.publish(Event::preview_ready(PreviewReadyEvent {
            ts: now_ms(),
            preview: outcome.path.clone(),
            clips: clips.clone(),
            warning: outcome.warning.clone(),
        }));
        info!(path = %outcome.path.display(), clips = clips.len(), "preview ready");

        Ok(RenderResult {
            ok: true,
            artifact_path: Some(outcome.path),
            clips,
            warning: outcome.warning,
            message: None,
            cancelled: false,
        })
    }

    /// Synthesize every pending task, updating statuses in place. Returns the
    /// cache entries written by this run.
    async fn run_tasks(
        &self,
        req: &RenderRequest,
        workers: std::num::NonZeroUsize,
        kind: BackendKind,
        cache: ResultCache,
        tasks: &mut [SynthesisTask],
    ) -> Result<Vec<CacheEntry>, RenderError> {
        let ctx = Arc::new(WorkerContext {
            pool: self.pool.clone(),
            bus: self.bus.clone(),
            cache,
            kind,
            backend_config: req.backend_config.clone(),
            progress: self.progress,
        });
        // child token: a failing task stops its siblings without marking
        // the caller's token
        let run_cancel = req.cancel.child_token();
        // stops watchdogs of tasks aborted by a timeout
        let _stop_on_exit = run_cancel.clone().drop_guard();
        let timeout = req.timeout.unwrap_or_else(|| default_timeout(tasks.len()));

        let scheduled: Vec<_> = tasks
            .iter_mut()
            .map(|task| {
                task.status = TaskStatus::Running;
                ScheduledTask::new(
                    task.utterance.task_id(),
                    Arc::clone(&ctx).synthesize(
                        task.utterance.clone(),
                        task.cache_key.clone(),
                        run_cancel.clone(),
                    ),
                )
            })
            .collect();

        let scheduler = TaskScheduler::new(workers);
        let outcomes = scheduler.run(scheduled, Some(timeout)).await?;

        let mut first_failure = None;
        let mut synthesized = Vec::new();
        for (task, outcome) in tasks.iter_mut().zip(outcomes) {
            match outcome {
                TaskOutcome::Done(entry) => {
                    task.status = TaskStatus::Done;
                    task.result_path = Some(entry.path.clone());
                    synthesized.push(entry);
                }
                TaskOutcome::Cancelled => task.status = TaskStatus::Cancelled,
                TaskOutcome::Failed(reason) => {
                    task.status = TaskStatus::Failed;
                    first_failure.get_or_insert((task.utterance.task_id(), reason));
                }
            }
        }

        match first_failure {
            Some((task_id, reason)) => Err(RenderError::Synthesis { task_id, reason }),
            None => Ok(synthesized),
        }
    }
}
