//! Scheduler: one run at a time, interval or manual signal
//!
//! The loop performs a `startup` run, then waits for whichever fires first:
//! the configured interval (`scheduled`) or a manual trigger (`manual`).
//! Stop is cooperative via a cancellation token and joins within a bounded
//! timeout.

use avocado_core::models::Trigger;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::engine::SyncEngine;

const STOP_JOIN_TIMEOUT: Duration = Duration::from_secs(10);

pub struct Scheduler {
    engine: Arc<SyncEngine>,
    manual: Arc<Notify>,
    cancel: CancellationToken,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        Scheduler {
            engine,
            manual: Arc::new(Notify::new()),
            cancel: CancellationToken::new(),
            handle: Mutex::new(None),
        }
    }

    /// Spawn the loop; a second call while it is alive is a no-op.
    pub fn start(&self) {
        let mut guard = self.handle.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = guard.as_ref() {
            if !handle.is_finished() {
                return;
            }
        }
        let engine = Arc::clone(&self.engine);
        let manual = Arc::clone(&self.manual);
        let cancel = self.cancel.clone();
        *guard = Some(tokio::spawn(async move {
            run_loop(engine, manual, cancel).await;
        }));
    }

    /// Queue a manual run; never overlaps an in-flight run.
    pub fn trigger_manual(&self) {
        self.manual.notify_one();
    }

    /// Cooperative stop: cancel, release any waiter, join bounded.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.manual.notify_one();
        let handle = {
            let mut guard = self.handle.lock().unwrap_or_else(|e| e.into_inner());
            guard.take()
        };
        if let Some(handle) = handle {
            if tokio::time::timeout(STOP_JOIN_TIMEOUT, handle).await.is_err() {
                warn!("scheduler loop did not stop within the join timeout");
            }
        }
    }
}

fn interval_of(engine: &SyncEngine) -> Duration {
    let seconds = engine
        .config_store()
        .load()
        .map(|config| config.sync.interval_seconds)
        .unwrap_or(300);
    Duration::from_secs(seconds.max(30))
}

async fn run_loop(engine: Arc<SyncEngine>, manual: Arc<Notify>, cancel: CancellationToken) {
    // Initial run so state converges quickly after boot.
    let outcome = engine.run_once(Trigger::Startup, None).await;
    info!(status = outcome.status.as_str(), "startup run complete");

    loop {
        if cancel.is_cancelled() {
            break;
        }
        let interval = interval_of(&engine);
        let trigger = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = manual.notified() => Trigger::Manual,
            _ = tokio::time::sleep(interval) => Trigger::Scheduled,
        };
        if cancel.is_cancelled() {
            break;
        }
        let outcome = engine.run_once(trigger, None).await;
        info!(
            trigger = trigger.as_str(),
            status = outcome.status.as_str(),
            "run complete"
        );
    }
    info!("scheduler loop stopped");
}
