//! End-to-end render tests against the mock backend.
//!
//! Every test points the encoder at a missing ffmpeg binary so the preview
//! deterministically falls back to WAV, independent of the host.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use super::orchestrator::{RenderRequest, ScriptOrchestrator};
use super::progress::ProgressSettings;
use crate::audio::OutputFormat;
use crate::events::{
    Event, EventBus, EventPayload, ProgressStatus, TOPIC_PREVIEW_READY, TOPIC_TTS_PROGRESS,
};
use crate::tts::provider::mock::{MockConfig, MockCounters, MockProvider};
use crate::tts::{BackendKind, BackendPool, BackendRegistry, ResultCache, SynthesisBackend};

const DUET: &str = r#"[
    {"speaker": "Host", "text": "Willkommen zu unserer Sendung."},
    {"speaker": "Guest", "text": "Danke für die Einladung!"}
]"#;

struct Harness {
    dir: TempDir,
    orchestrator: ScriptOrchestrator,
    counters: Arc<MockCounters>,
    bus: EventBus,
}

impl Harness {
    fn new(mock: MockConfig) -> Self {
        Self::with_fallback(mock.clone(), mock)
    }

    fn with_fallback(mock: MockConfig, fallback: MockConfig) -> Self {
        let counters = Arc::new(MockCounters::default());
        let mut registry = BackendRegistry::new();
        let c = Arc::clone(&counters);
        registry.register(BackendKind::Mock, move |_| {
            Arc::new(MockProvider::new(mock.clone(), Arc::clone(&c))) as Arc<dyn SynthesisBackend>
        });
        let c = Arc::clone(&counters);
        registry.register(BackendKind::DefaultFast, move |_| {
            Arc::new(MockProvider::new(fallback.clone(), Arc::clone(&c)))
                as Arc<dyn SynthesisBackend>
        });

        let dir = tempfile::tempdir().unwrap();
        let bus = EventBus::new();
        let orchestrator = ScriptOrchestrator::new(BackendPool::new(registry, 2), bus.clone())
            .with_progress(ProgressSettings {
                ceiling: 0.95,
                cadence: Duration::from_millis(10),
                step: 0.02,
            })
            .with_ffmpeg_path(Some(dir.path().join("no-ffmpeg-here")));

        Self {
            dir,
            orchestrator,
            counters,
            bus,
        }
    }

    fn script(&self, name: &str, content: &str) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, content).unwrap();
        path
    }

    fn out_dir(&self) -> PathBuf {
        self.dir.path().join("out")
    }

    fn request(&self, script: &Path) -> RenderRequest {
        let mut req = RenderRequest::new(script, self.out_dir());
        req.backend = "mock".to_string();
        req
    }

    fn cached_clips(&self) -> usize {
        ResultCache::new(self.out_dir().join("cache")).entry_count()
    }
}

fn slow(latency_ms: u64) -> MockConfig {
    MockConfig {
        latency_ms,
        ..Default::default()
    }
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<Event>) -> Vec<Event> {
    let mut out = Vec::new();
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

#[tokio::test]
async fn duet_renders_ordered_preview() {
    let h = Harness::new(MockConfig::default());
    let script = h.script("duet.json", DUET);
    let mut req = h.request(&script);
    req.max_workers = 2;
    req.output_format = OutputFormat::Mp4;

    let result = h.orchestrator.synthesize_script_preview(req).await;
    assert!(result.ok, "render failed: {:?}", result.message);

    let idx: Vec<usize> = result.clips.iter().map(|c| c.idx).collect();
    assert_eq!(idx, vec![1, 2]);
    assert_eq!(result.clips[0].speaker, "Host");
    assert_eq!(result.clips[1].voice, "Guest");
    assert!(result.clips.iter().all(|c| c.duration > 0.0 && c.file.is_file()));

    let artifact = result.artifact_path.unwrap();
    assert!(std::fs::metadata(&artifact).unwrap().len() > 0);
    assert_eq!(artifact.extension().unwrap(), "wav");
    assert!(result.warning.unwrap().contains("ffmpeg not found"));
    assert_eq!(h.counters.syntheses(), 2);
    assert_eq!(h.cached_clips(), 2);
}

#[tokio::test]
async fn second_run_is_served_from_cache() {
    let h = Harness::new(MockConfig::default());
    let script = h.script("duet.json", DUET);

    let first = h.orchestrator.synthesize_script_preview(h.request(&script)).await;
    assert!(first.ok);
    let second = h.orchestrator.synthesize_script_preview(h.request(&script)).await;
    assert!(second.ok);

    assert_eq!(h.counters.syntheses(), 2);
    assert_eq!(first.clips, second.clips);
}

#[tokio::test]
async fn speaker_map_changes_cache_identity() {
    let h = Harness::new(MockConfig::default());
    let script = h.script("duet.json", DUET);
    assert!(h.orchestrator.synthesize_script_preview(h.request(&script)).await.ok);

    let mut req = h.request(&script);
    req.speaker_map.insert("Host".into(), "de_DE-thorsten".into());
    let result = h.orchestrator.synthesize_script_preview(req).await;
    assert!(result.ok);
    assert_eq!(result.clips[0].voice, "de_DE-thorsten");
    // only the remapped line is synthesized again
    assert_eq!(h.counters.syntheses(), 3);
}

#[tokio::test]
async fn invalid_worker_count_is_rejected_before_any_io() {
    let h = Harness::new(MockConfig::default());
    let script = h.script("duet.json", DUET);

    for workers in [0, -3] {
        let mut req = h.request(&script);
        req.max_workers = workers;
        let result = h.orchestrator.synthesize_script_preview(req).await;
        assert!(!result.ok);
        assert!(result.message.unwrap().contains("max_workers"));
    }
    assert!(!h.out_dir().exists());
    assert_eq!(h.counters.loads(), 0);
}

#[tokio::test]
async fn unknown_backend_is_rejected() {
    let h = Harness::new(MockConfig::default());
    let script = h.script("duet.json", DUET);
    let mut req = h.request(&script);
    req.backend = "espeak-deluxe".into();

    let result = h.orchestrator.synthesize_script_preview(req).await;
    assert!(!result.ok);
    assert!(result.message.unwrap().contains("espeak-deluxe"));
    assert!(!h.out_dir().exists());
}

#[tokio::test]
async fn script_errors_are_reported() {
    let h = Harness::new(MockConfig::default());

    let missing = h
        .orchestrator
        .synthesize_script_preview(h.request(&h.dir.path().join("nope.json")))
        .await;
    assert!(missing.message.unwrap().starts_with("script not found"));

    let not_a_list = h.script("obj.json", r#"{"speaker": "A", "text": "x"}"#);
    let result = h.orchestrator.synthesize_script_preview(h.request(&not_a_list)).await;
    assert_eq!(
        result.message.as_deref(),
        Some("script must be a list of {speaker,text} entries")
    );

    let broken = h.script("broken.yaml", "- speaker: [unclosed\n");
    let result = h.orchestrator.synthesize_script_preview(h.request(&broken)).await;
    assert!(result.message.unwrap().starts_with("failed to parse script"));
    assert!(!h.out_dir().exists());
}

#[tokio::test]
async fn clips_follow_script_order_under_parallelism() {
    let h = Harness::new(slow(30));
    let script = h.script(
        "four.yaml",
        "- {speaker: A, text: eins}\n\
         - {speaker: B, text: zwei zwei zwei zwei zwei zwei}\n\
         - {speaker: A, text: drei}\n\
         - {speaker: C, text: vier vier}\n",
    );
    let mut req = h.request(&script);
    req.max_workers = 3;
    req.output_format = OutputFormat::Wav;

    let result = h.orchestrator.synthesize_script_preview(req).await;
    assert!(result.ok, "{:?}", result.message);
    let idx: Vec<usize> = result.clips.iter().map(|c| c.idx).collect();
    assert_eq!(idx, vec![1, 2, 3, 4]);
    assert!(h.counters.peak_in_flight() <= 3);
    assert!(result.warning.is_none());

    let expected: f64 = result.clips.iter().map(|c| c.duration).sum();
    let info = crate::audio::wav::probe(&result.artifact_path.unwrap()).unwrap();
    assert!((info.duration_secs() - expected).abs() < 0.01);
}

#[tokio::test]
async fn identical_lines_are_synthesized_once() {
    let h = Harness::new(MockConfig::default());
    let script = h.script(
        "dup.json",
        r#"[
            {"speaker": "Host", "text": "Hallo."},
            {"speaker": "Guest", "text": "Hallo."},
            {"speaker": "Host", "text": "Hallo."}
        ]"#,
    );

    let result = h.orchestrator.synthesize_script_preview(h.request(&script)).await;
    assert!(result.ok);
    assert_eq!(result.clips.len(), 3);
    assert_eq!(result.clips[0].file, result.clips[2].file);
    assert_ne!(result.clips[0].file, result.clips[1].file);
    assert_eq!(h.counters.syntheses(), 2);
}

#[tokio::test]
async fn cancel_before_start_writes_nothing() {
    let h = Harness::new(MockConfig::default());
    let script = h.script("duet.json", DUET);
    let req = h.request(&script);
    req.cancel.cancel();

    let result = h.orchestrator.synthesize_script_preview(req).await;
    assert!(!result.ok);
    assert!(result.cancelled);
    assert!(result.artifact_path.is_none());
    assert_eq!(h.counters.syntheses(), 0);
    assert_eq!(h.cached_clips(), 0);
}

#[tokio::test]
async fn cancel_mid_run_discards_unfinished_work() {
    let h = Harness::new(slow(200));
    let script = h.script(
        "three.json",
        r#"[{"text": "eins"}, {"text": "zwei"}, {"text": "drei"}]"#,
    );
    let mut req = h.request(&script);
    req.max_workers = 1;
    let cancel = req.cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });

    let result = h.orchestrator.synthesize_script_preview(req).await;
    assert!(result.cancelled);
    assert!(!result.ok);
    assert!(result.message.unwrap().starts_with("cancelled"));
    // the in-flight line finishes but is not cached; the rest never start
    assert!(h.counters.syntheses() <= 1);
    assert_eq!(h.cached_clips(), 0);
    assert!(!h.out_dir().join("script_preview.mp4").exists());
    assert!(h.orchestrator.pool().stats().resident.iter().all(|e| e.ref_count == 0));
}

#[tokio::test]
async fn synthesis_failure_fails_the_run() {
    let h = Harness::new(MockConfig {
        fail_synthesize: true,
        ..Default::default()
    });
    let script = h.script("duet.json", DUET);
    let mut req = h.request(&script);
    req.max_workers = 1;

    let result = h.orchestrator.synthesize_script_preview(req).await;
    assert!(!result.ok);
    assert!(!result.cancelled);
    let message = result.message.unwrap();
    assert!(message.starts_with("TTS synth failed: s001"), "{message}");
    assert!(result.artifact_path.is_none());
    assert_eq!(h.cached_clips(), 0);
    // the second line is skipped once the first fails
    assert_eq!(h.counters.syntheses(), 1);
}

#[tokio::test]
async fn load_failure_falls_back_to_default_backend() {
    let h = Harness::with_fallback(
        MockConfig {
            fail_load: true,
            ..Default::default()
        },
        MockConfig::default(),
    );
    let script = h.script("duet.json", DUET);

    let result = h.orchestrator.synthesize_script_preview(h.request(&script)).await;
    assert!(result.ok, "{:?}", result.message);
    assert_eq!(h.counters.syntheses(), 2);
    assert_eq!(h.counters.loads(), 1);
}

#[tokio::test]
async fn timeout_names_outstanding_tasks() {
    let h = Harness::new(slow(2_000));
    let script = h.script("duet.json", DUET);
    let mut req = h.request(&script);
    req.max_workers = 2;
    req.timeout = Some(Duration::from_millis(100));

    let result = h.orchestrator.synthesize_script_preview(req).await;
    assert!(!result.ok);
    assert_eq!(
        result.message.as_deref(),
        Some("timeout waiting for synth tasks: s001, s002")
    );
}

#[tokio::test]
async fn timeout_during_backend_load_leaves_pool_clean() {
    let h = Harness::new(MockConfig {
        load_latency_ms: 500,
        ..Default::default()
    });
    let script = h.script("duet.json", DUET);
    let mut req = h.request(&script);
    req.max_workers = 2;
    req.timeout = Some(Duration::from_millis(50));

    let result = h.orchestrator.synthesize_script_preview(req).await;
    assert!(!result.ok);
    assert!(result.message.unwrap().starts_with("timeout waiting for synth tasks"));

    let pool = h.orchestrator.pool();
    let stats = pool.stats();
    assert!(stats.resident.iter().all(|e| e.ref_count == 0), "{stats:?}");
    assert!(pool.resident_count() <= pool.max_resident());

    // the same orchestrator still renders once loads are given time
    let retry = h.orchestrator.synthesize_script_preview(h.request(&script)).await;
    assert!(retry.ok, "{:?}", retry.message);
    assert!(pool.stats().resident.iter().all(|e| e.ref_count == 0));

    pool.shutdown().await;
    assert_eq!(pool.resident_count(), 0);
    assert_eq!(h.counters.resident(), 0);
}

#[tokio::test]
async fn progress_and_preview_events_are_published() {
    let h = Harness::new(MockConfig {
        latency_ms: 60,
        progress_steps: 2,
        ..Default::default()
    });
    let mut progress = h.bus.subscribe_channel(TOPIC_TTS_PROGRESS);
    let mut ready = h.bus.subscribe_channel(TOPIC_PREVIEW_READY);
    let script = h.script("duet.json", DUET);

    let result = h.orchestrator.synthesize_script_preview(h.request(&script)).await;
    assert!(result.ok);

    let events = drain(&mut progress);
    for task in ["s001", "s002"] {
        let mine: Vec<_> = events
            .iter()
            .filter_map(Event::as_progress)
            .filter(|e| e.task_id == task)
            .collect();
        assert_eq!(mine.first().unwrap().status, ProgressStatus::Start);
        assert_eq!(mine.last().unwrap().status, ProgressStatus::Done);
        assert!(mine.iter().any(|e| e.stage.as_deref() == Some("mock")));
        let fractions: Vec<f32> = mine.iter().filter_map(|e| e.progress).collect();
        assert!(fractions.windows(2).all(|w| w[0] < w[1]));
    }

    let ready = drain(&mut ready);
    assert_eq!(ready.len(), 1);
    match &ready[0].payload {
        EventPayload::PreviewReady(ev) => {
            assert_eq!(Some(&ev.preview), result.artifact_path.as_ref());
            assert_eq!(ev.clips.len(), 2);
        }
        other => panic!("unexpected payload: {other:?}"),
    }
}

#[tokio::test]
async fn result_serializes_without_empty_fields() {
    let h = Harness::new(MockConfig::default());
    let script = h.script("duet.json", DUET);
    let mut req = h.request(&script);
    req.output_format = OutputFormat::Wav;

    let result = h.orchestrator.synthesize_script_preview(req).await;
    let json = serde_json::to_value(&result).unwrap();
    assert_eq!(json["ok"], true);
    assert!(json.get("message").is_none());
    assert!(json.get("cancelled").is_none());
    assert_eq!(json["clips"][1]["idx"], 2);
}
