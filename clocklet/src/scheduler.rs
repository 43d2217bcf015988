//! Auto-sync scheduler.
//!
//! A repeating timer that drives `run_sync` through the bridge, with
//! pause/resume and a manual trigger. Reconfiguration is always
//! cancel-then-restart of the timer task, never a live mutation. Pass
//! execution is spawned off the timer task, so pausing cancels future
//! ticks but never an in-flight pass.
//!
//! Manual and scheduled passes may overlap; the worker serializes sync
//! runs internally and answers an overlapping trigger with
//! `{"status": "already_running"}`.

use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::bridge::{Bridge, CallError};
use crate::events::{AgentEvent, EventBus};

/// Seam between the scheduler and the bridge, so timer behavior is
/// testable without a worker process.
#[async_trait]
pub trait SyncRunner: Send + Sync + 'static {
    async fn run_sync(&self) -> Result<serde_json::Value, CallError>;
}

#[async_trait]
impl SyncRunner for Bridge {
    async fn run_sync(&self) -> Result<serde_json::Value, CallError> {
        self.call("run_sync", serde_json::json!({})).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Stopped,
    Running { interval: Duration },
    Paused { interval: Duration },
}

struct TimerSlot {
    state: SchedulerState,
    task: Option<JoinHandle<()>>,
}

pub struct SyncScheduler {
    runner: Arc<dyn SyncRunner>,
    events: EventBus,
    slot: StdMutex<TimerSlot>,
}

impl SyncScheduler {
    pub fn new(runner: Arc<dyn SyncRunner>, events: EventBus) -> Self {
        Self {
            runner,
            events,
            slot: StdMutex::new(TimerSlot {
                state: SchedulerState::Stopped,
                task: None,
            }),
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.lock_slot().state
    }

    /// Start (or reconfigure) the repeating timer. The first pass runs one
    /// full interval after this call.
    pub fn enable(&self, interval: Duration) {
        let mut slot = self.lock_slot();
        Self::cancel_timer(&mut slot);
        slot.task = Some(self.spawn_timer(interval));
        slot.state = SchedulerState::Running { interval };
        tracing::info!(interval_secs = interval.as_secs(), "Auto-sync enabled");
    }

    /// Cancel the timer but remember the interval.
    pub fn pause(&self) {
        let mut slot = self.lock_slot();
        if let SchedulerState::Running { interval } = slot.state {
            Self::cancel_timer(&mut slot);
            slot.state = SchedulerState::Paused { interval };
            tracing::info!("Auto-sync paused");
        }
    }

    /// Restart the timer with the remembered interval.
    pub fn resume(&self) {
        let mut slot = self.lock_slot();
        if let SchedulerState::Paused { interval } = slot.state {
            Self::cancel_timer(&mut slot);
            slot.task = Some(self.spawn_timer(interval));
            slot.state = SchedulerState::Running { interval };
            tracing::info!("Auto-sync resumed");
        }
    }

    /// Turn auto-sync off entirely.
    pub fn disable(&self) {
        let mut slot = self.lock_slot();
        Self::cancel_timer(&mut slot);
        slot.state = SchedulerState::Stopped;
        tracing::info!("Auto-sync disabled");
    }

    /// Run one sync pass right now, independent of the timer. The timer's
    /// own schedule is unaffected; an overlapping scheduled pass is
    /// allowed.
    pub async fn trigger_once(&self) -> Result<serde_json::Value, CallError> {
        run_pass(self.runner.as_ref(), &self.events).await
    }

    fn spawn_timer(&self, interval: Duration) -> JoinHandle<()> {
        let runner = Arc::clone(&self.runner);
        let events = self.events.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The interval yields once immediately; consume it so the first
            // pass lands one full period from now.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let runner = Arc::clone(&runner);
                let events = events.clone();
                tokio::spawn(async move {
                    let _ = run_pass(runner.as_ref(), &events).await;
                });
            }
        })
    }

    fn cancel_timer(slot: &mut TimerSlot) {
        if let Some(task) = slot.task.take() {
            task.abort();
        }
    }

    fn lock_slot(&self) -> std::sync::MutexGuard<'_, TimerSlot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Drop for SyncScheduler {
    fn drop(&mut self) {
        Self::cancel_timer(&mut self.lock_slot());
    }
}

/// One sync pass: events around a single `run_sync` bridge call. A failed
/// pass emits `sync:error` and leaves the timer alone.
async fn run_pass(
    runner: &dyn SyncRunner,
    events: &EventBus,
) -> Result<serde_json::Value, CallError> {
    events.publish(AgentEvent::SyncStarted);
    match runner.run_sync().await {
        Ok(result) => {
            let records_synced = result
                .get("records_synced")
                .and_then(serde_json::Value::as_u64)
                .unwrap_or(0);
            tracing::info!(target: "clocklet::sync", records_synced, "Sync pass completed");
            events.publish(AgentEvent::SyncCompleted {
                records_synced,
                result: result.clone(),
            });
            Ok(result)
        }
        Err(err) => {
            tracing::warn!(target: "clocklet::sync", error = %err, "Sync pass failed");
            events.publish(AgentEvent::SyncFailed {
                message: err.to_string(),
            });
            Err(err)
        }
    }
}
