//! In-process publish/subscribe bus for render progress.
//!
//! Producers (render workers, the orchestrator) publish typed events under
//! stable topic names; observers subscribe with a callback or a channel.
//! Publishing never fails: a subscriber that panics is logged and skipped,
//! and channel subscribers receive events through an unbounded queue so a
//! slow consumer never stalls a worker.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;

use crate::script::ClipInfo;

/// Per-utterance progress and lifecycle updates.
pub const TOPIC_TTS_PROGRESS: &str = "script.tts_progress";

/// Published once per successful run when the final artifact exists.
pub const TOPIC_PREVIEW_READY: &str = "script.preview_ready";

/// Lifecycle status carried by progress events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    Start,
    Processing,
    Done,
    Failed,
    Cancelled,
}

/// Payload of [`TOPIC_TTS_PROGRESS`].
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    /// Milliseconds since the Unix epoch.
    pub ts: i64,
    pub task_id: String,
    /// 1-based utterance index.
    pub idx: usize,
    pub status: ProgressStatus,
    /// Fraction in `[0, 1]`, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<String>,
}

impl ProgressEvent {
    pub fn status(task_id: &str, idx: usize, status: ProgressStatus) -> Self {
        Self {
            ts: now_ms(),
            task_id: task_id.to_string(),
            idx,
            status,
            progress: None,
            stage: None,
        }
    }

    pub fn fraction(task_id: &str, idx: usize, progress: f32, stage: Option<&str>) -> Self {
        let status = if progress >= 1.0 {
            ProgressStatus::Done
        } else {
            ProgressStatus::Processing
        };
        Self {
            progress: Some(progress.clamp(0.0, 1.0)),
            stage: stage.map(str::to_string),
            ..Self::status(task_id, idx, status)
        }
    }
}

/// Payload of [`TOPIC_PREVIEW_READY`].
#[derive(Debug, Clone, Serialize)]
pub struct PreviewReadyEvent {
    pub ts: i64,
    pub preview: PathBuf,
    pub clips: Vec<ClipInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum EventPayload {
    Progress(ProgressEvent),
    PreviewReady(PreviewReadyEvent),
}

/// A published event: a topic plus its payload.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    pub topic: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn progress(event: ProgressEvent) -> Self {
        Self {
            topic: TOPIC_TTS_PROGRESS.to_string(),
            payload: EventPayload::Progress(event),
        }
    }

    pub fn preview_ready(event: PreviewReadyEvent) -> Self {
        Self {
            topic: TOPIC_PREVIEW_READY.to_string(),
            payload: EventPayload::PreviewReady(event),
        }
    }

    pub fn as_progress(&self) -> Option<&ProgressEvent> {
        match &self.payload {
            EventPayload::Progress(p) => Some(p),
            _ => None,
        }
    }
}

/// Identifies one subscription for [`EventBus::unsubscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Callback = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Default)]
struct BusInner {
    listeners: RwLock<HashMap<String, Vec<(SubscriptionId, Callback)>>>,
    next_id: AtomicU64,
}

/// Thread-safe topic bus. Cloning shares the same subscriber table.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<BusInner>,
}

static GLOBAL_BUS: Lazy<EventBus> = Lazy::new(EventBus::new);

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide bus for callers that do not inject their own.
    pub fn global() -> &'static EventBus {
        &GLOBAL_BUS
    }

    /// Register a callback for `topic`.
    pub fn subscribe<F>(&self, topic: &str, callback: F) -> SubscriptionId
    where
        F: Fn(&Event) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        if let Ok(mut guard) = self.inner.listeners.write() {
            guard
                .entry(topic.to_string())
                .or_default()
                .push((id, Arc::new(callback)));
        }
        id
    }

    /// Subscribe through an unbounded channel.
    ///
    /// Sends into a dropped receiver are ignored.
    pub fn subscribe_channel(&self, topic: &str) -> mpsc::UnboundedReceiver<Event> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribe(topic, move |event| {
            let _ = tx.send(event.clone());
        });
        rx
    }

    /// Remove a subscription. Returns `false` if it was not registered.
    pub fn unsubscribe(&self, topic: &str, id: SubscriptionId) -> bool {
        let Ok(mut guard) = self.inner.listeners.write() else {
            return false;
        };
        let Some(list) = guard.get_mut(topic) else {
            return false;
        };
        let before = list.len();
        list.retain(|(sid, _)| *sid != id);
        before != list.len()
    }

    /// Deliver `event` to every subscriber of its topic.
    ///
    /// Callbacks run on the caller's thread, outside the subscriber lock.
    pub fn publish(&self, event: Event) {
        let listeners: Vec<Callback> = match self.inner.listeners.read() {
            Ok(guard) => guard
                .get(&event.topic)
                .map(|list| list.iter().map(|(_, cb)| Arc::clone(cb)).collect())
                .unwrap_or_default(),
            Err(_) => return,
        };

        for cb in listeners {
            if catch_unwind(AssertUnwindSafe(|| cb(&event))).is_err() {
                warn!(topic = %event.topic, "event subscriber panicked; ignoring");
            }
        }
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.inner
            .listeners
            .read()
            .map(|guard| guard.get(topic).map_or(0, Vec::len))
            .unwrap_or(0)
    }
}

/// Current time in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}
