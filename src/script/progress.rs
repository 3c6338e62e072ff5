//! Per-task progress reporting with a simulated-progress watchdog.
//!
//! Each running task owns a [`ProgressTracker`]: a small actor task that
//! receives real progress over a channel and publishes it to the event bus.
//! While the backend is silent, the actor nudges the fraction upward by
//! `step` every `cadence`, never past `ceiling`. Only [`ProgressTracker::finish`]
//! reports 1.0. Published fractions are monotonic per task.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::config::ProgressConfig;
use crate::events::{Event, EventBus, ProgressEvent, ProgressStatus};

/// Watchdog tunables.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProgressSettings {
    /// Simulated progress never reaches this value.
    pub ceiling: f32,
    pub cadence: Duration,
    pub step: f32,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            ceiling: 0.95,
            cadence: Duration::from_millis(500),
            step: 0.02,
        }
    }
}

impl From<&ProgressConfig> for ProgressSettings {
    fn from(cfg: &ProgressConfig) -> Self {
        Self {
            ceiling: cfg.ceiling,
            cadence: Duration::from_millis(cfg.cadence_ms.max(1)),
            step: cfg.step,
        }
    }
}

#[derive(Debug)]
enum ProgressMsg {
    Report { fraction: f32, stage: Option<String> },
    Simulate(bool),
}

/// Cheap, cloneable sink handed to backends. Never blocks.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    tx: mpsc::UnboundedSender<ProgressMsg>,
}

impl ProgressReporter {
    /// Report real progress in `[0, 1]`. Values at or below what was
    /// already published are dropped.
    pub fn report(&self, fraction: f32, stage: Option<&str>) {
        let _ = self.tx.send(ProgressMsg::Report {
            fraction: fraction.clamp(0.0, 0.999),
            stage: stage.map(str::to_string),
        });
    }

    /// Turn simulated progress on or off (e.g. once the backend is known to
    /// report on its own).
    pub fn set_simulated(&self, enabled: bool) {
        let _ = self.tx.send(ProgressMsg::Simulate(enabled));
    }
}

struct Watchdog {
    bus: EventBus,
    task_id: String,
    idx: usize,
    settings: ProgressSettings,
    current: f32,
    /// Value at the previous tick; no change since then means "silent".
    last_tick_value: f32,
    simulate: bool,
}

impl Watchdog {
    fn publish(&mut self, fraction: f32, stage: Option<&str>) {
        if fraction <= self.current {
            return;
        }
        self.current = fraction;
        self.bus.publish(Event::progress(ProgressEvent::fraction(
            &self.task_id,
            self.idx,
            fraction,
            stage,
        )));
    }

    fn handle(&mut self, msg: ProgressMsg) {
        match msg {
            ProgressMsg::Report { fraction, stage } => self.publish(fraction, stage.as_deref()),
            ProgressMsg::Simulate(enabled) => self.simulate = enabled,
        }
    }

    fn tick(&mut self) {
        if self.simulate && self.current <= self.last_tick_value {
            let next = (self.current + self.settings.step).min(self.settings.ceiling);
            trace!(task = %self.task_id, next, "simulated progress");
            self.publish(next, Some("simulated"));
        }
        self.last_tick_value = self.current;
    }

    async fn run(
        mut self,
        mut rx: mpsc::UnboundedReceiver<ProgressMsg>,
        stop: CancellationToken,
    ) {
        let cadence = self.settings.cadence;
        let mut ticker = time::interval_at(time::Instant::now() + cadence, cadence);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = stop.cancelled() => {
                    // deliver reports sent just before the stop
                    while let Ok(msg) = rx.try_recv() {
                        self.handle(msg);
                    }
                    break;
                }
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg),
                    None => break,
                },
                _ = ticker.tick() => self.tick(),
            }
        }
    }
}

/// Progress publisher for one task.
pub struct ProgressTracker {
    bus: EventBus,
    task_id: String,
    idx: usize,
    reporter: ProgressReporter,
    stop: CancellationToken,
    actor: JoinHandle<()>,
}

impl ProgressTracker {
    /// Publish the `start` event and launch the watchdog.
    ///
    /// The watchdog also stops when `cancel` fires.
    pub fn start(
        bus: EventBus,
        task_id: String,
        idx: usize,
        settings: ProgressSettings,
        cancel: &CancellationToken,
    ) -> Self {
        bus.publish(Event::progress(ProgressEvent {
            progress: Some(0.0),
            stage: Some("start".to_string()),
            ..ProgressEvent::status(&task_id, idx, ProgressStatus::Start)
        }));

        let (tx, rx) = mpsc::unbounded_channel();
        let stop = cancel.child_token();
        let watchdog = Watchdog {
            bus: bus.clone(),
            task_id: task_id.clone(),
            idx,
            settings,
            current: 0.0,
            last_tick_value: 0.0,
            simulate: true,
        };
        let actor = tokio::spawn(watchdog.run(rx, stop.clone()));

        Self {
            bus,
            task_id,
            idx,
            reporter: ProgressReporter { tx },
            stop,
            actor,
        }
    }

    pub fn reporter(&self) -> ProgressReporter {
        self.reporter.clone()
    }

    async fn shutdown(&mut self) {
        self.stop.cancel();
        let _ = (&mut self.actor).await;
    }

    /// Stop the watchdog, then publish completion (1.0).
    pub async fn finish(mut self) {
        self.shutdown().await;
        self.bus.publish(Event::progress(ProgressEvent::fraction(
            &self.task_id,
            self.idx,
            1.0,
            Some("done"),
        )));
    }

    /// Stop the watchdog and publish a terminal failed/cancelled status.
    pub async fn abort(mut self, status: ProgressStatus) {
        self.shutdown().await;
        self.bus
            .publish(Event::progress(ProgressEvent::status(&self.task_id, self.idx, status)));
    }
}

impl Drop for ProgressTracker {
    // an aborted task drops its tracker without finishing it
    fn drop(&mut self) {
        self.stop.cancel();
    }
}
