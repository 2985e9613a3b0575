//! Drain scheduling.
//!
//! While running, a background task wakes the [`Coordinator`] on three
//! occasions:
//!
//! - every `syncIntervalMs`, if the network is reachable and no drain is active
//! - `reconnectDebounceMs` after the network comes back
//! - never on its own after `stop()`
//!
//! Manual drains bypass the scheduler and go to the coordinator directly.
//! `stop()` waits for the task, so an in-flight drain finishes first.

use crate::{
    coordinator::Coordinator, events::EventBus, reachability::Reachability, Error, SyncConfig,
    SyncEvent,
};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SchedulerState {
    Stopped,
    Running,
}

struct Task {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Scheduler {
    coordinator: Arc<Coordinator>,
    reachability: Arc<dyn Reachability>,
    events: EventBus,
    config: watch::Receiver<SyncConfig>,
    task: Mutex<Option<Task>>,
}

impl Scheduler {
    pub fn new(
        coordinator: Arc<Coordinator>,
        reachability: Arc<dyn Reachability>,
        events: EventBus,
        config: watch::Receiver<SyncConfig>,
    ) -> Self {
        Self {
            coordinator,
            reachability,
            events,
            config,
            task: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SchedulerState {
        let task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match task.as_ref() {
            Some(task) if !task.handle.is_finished() => SchedulerState::Running,
            _ => SchedulerState::Stopped,
        }
    }

    /// Spawn the scheduling task. Returns `false` if it was already running.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> bool {
        let mut task = self.task.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return false;
        }

        let (shutdown, shutdown_rx) = oneshot::channel();
        let worker = Worker {
            coordinator: self.coordinator.clone(),
            reachability: self.reachability.subscribe(),
            events: self.events.clone(),
            config: self.config.clone(),
        };
        let handle = tokio::spawn(worker.run(shutdown_rx));
        *task = Some(Task { shutdown, handle });

        tracing::info!("Scheduler started");
        true
    }

    /// Stop the scheduling task and wait for it to exit. Returns `false` if
    /// it was not running.
    pub async fn stop(&self) -> bool {
        let task = self
            .task
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(task) = task else {
            return false;
        };

        // The worker may already be gone; a closed channel is fine.
        let _ = task.shutdown.send(());
        if let Err(err) = task.handle.await {
            tracing::error!(error = %err, "Scheduler task ended abnormally");
        }
        tracing::info!("Scheduler stopped");
        true
    }
}

struct Worker {
    coordinator: Arc<Coordinator>,
    reachability: watch::Receiver<bool>,
    events: EventBus,
    config: watch::Receiver<SyncConfig>,
}

impl Worker {
    async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        let mut ticker = tick_interval(&self.config.borrow_and_update());
        let mut reconnect_at: Option<Instant> = None;
        let mut reachability_open = true;
        let mut config_open = true;

        loop {
            tokio::select! {
                _ = &mut shutdown => break,

                _ = ticker.tick() => {
                    if *self.reachability.borrow() && !self.coordinator.is_active() {
                        self.drain("tick").await;
                    }
                }

                changed = self.reachability.changed(), if reachability_open => {
                    if changed.is_err() {
                        tracing::warn!("Reachability source closed");
                        reachability_open = false;
                        continue;
                    }
                    let reachable = *self.reachability.borrow_and_update();
                    self.events.emit(SyncEvent::ReachabilityChanged { reachable });

                    reconnect_at = if reachable {
                        let debounce = self.config.borrow().reconnect_debounce();
                        tracing::debug!(debounce_ms = debounce.as_millis() as u64, "Network regained");
                        Some(Instant::now() + debounce)
                    } else {
                        tracing::debug!("Network lost");
                        None
                    };
                }

                _ = wait_until(reconnect_at) => {
                    reconnect_at = None;
                    self.drain("reconnect").await;
                }

                changed = self.config.changed(), if config_open => {
                    if changed.is_err() {
                        config_open = false;
                        continue;
                    }
                    let config = self.config.borrow_and_update().clone();
                    if config.sync_interval() != ticker.period() {
                        tracing::info!(sync_interval_ms = config.sync_interval_ms, "Sync interval changed");
                        ticker = tick_interval(&config);
                    }
                }
            }
        }

        tracing::debug!("Scheduler loop exited");
    }

    async fn drain(&self, trigger: &'static str) {
        match self.coordinator.drain().await {
            Ok(summary) => {
                tracing::debug!(trigger, attempted = summary.attempted, "Scheduled drain finished");
            }
            Err(Error::Offline | Error::SyncInProgress) => {
                tracing::debug!(trigger, "Scheduled drain skipped");
            }
            Err(err) => {
                tracing::error!(trigger, error = %err, "Scheduled drain failed");
            }
        }
    }
}

/// Interval whose first tick is one full period away.
fn tick_interval(config: &SyncConfig) -> Interval {
    let period = config.sync_interval();
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    interval
}

/// Sleep until `deadline`, or forever when there is none.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
