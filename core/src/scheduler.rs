//! Background trigger loop: runs a sync pass on a fixed interval, when the app
//! comes to the foreground, and when connectivity returns.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::sync::{SyncEngine, SyncOutcome};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Interval,
    Foreground,
    Reconnected,
}

impl Trigger {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Interval => "interval",
            Trigger::Foreground => "foreground",
            Trigger::Reconnected => "reconnected",
        }
    }
}

enum Wake {
    Run(Trigger),
    Idle,
    Stop,
}

pub struct SyncScheduler;

impl SyncScheduler {
    /// Start the loop for `user_uid`. The first interval tick fires at once,
    /// so a pass runs right after spawning.
    #[must_use]
    pub fn spawn(engine: Arc<SyncEngine>, user_uid: String) -> SchedulerHandle {
        let foreground = Arc::new(Notify::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (passes_tx, passes_rx) = watch::channel(0u64);

        let task = tokio::spawn(run_loop(
            engine,
            user_uid,
            foreground.clone(),
            shutdown_rx,
            passes_tx,
        ));
        SchedulerHandle {
            foreground,
            shutdown: shutdown_tx,
            passes: passes_rx,
            task,
        }
    }
}

pub struct SchedulerHandle {
    foreground: Arc<Notify>,
    shutdown: watch::Sender<bool>,
    passes: watch::Receiver<u64>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Request a pass. Coalesces with a pass already requested but not started.
    pub fn app_foregrounded(&self) {
        self.foreground.notify_one();
    }

    /// Count of passes attempted so far, whatever their outcome.
    #[must_use]
    pub fn passes(&self) -> watch::Receiver<u64> {
        self.passes.clone()
    }

    /// Stop the loop, letting a pass in progress finish first.
    pub async fn shutdown(self) {
        self.shutdown.send_replace(true);
        if let Err(err) = self.task.await {
            tracing::error!(error = %err, "sync scheduler task failed");
        }
    }
}

async fn run_loop(
    engine: Arc<SyncEngine>,
    user_uid: String,
    foreground: Arc<Notify>,
    mut shutdown: watch::Receiver<bool>,
    passes: watch::Sender<u64>,
) {
    let period = engine.config().sync_interval.max(Duration::from_secs(1));
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut online = engine.connectivity().subscribe();
    let mut was_online = *online.borrow_and_update();
    let mut watching = true;

    tracing::info!(user = %user_uid, interval_secs = period.as_secs(), "sync scheduler started");
    loop {
        let wake = tokio::select! {
            biased;
            changed = shutdown.changed() => match changed {
                Ok(()) if !*shutdown.borrow() => Wake::Idle,
                _ => Wake::Stop,
            },
            () = foreground.notified() => Wake::Run(Trigger::Foreground),
            changed = online.changed(), if watching => match changed {
                Ok(()) => {
                    let now_online = *online.borrow_and_update();
                    let came_back = now_online && !was_online;
                    was_online = now_online;
                    if came_back { Wake::Run(Trigger::Reconnected) } else { Wake::Idle }
                }
                Err(_) => {
                    watching = false;
                    Wake::Idle
                }
            },
            _ = ticker.tick() => Wake::Run(Trigger::Interval),
        };

        let trigger = match wake {
            Wake::Run(trigger) => trigger,
            Wake::Idle => continue,
            Wake::Stop => break,
        };

        match engine.sync_user(&user_uid).await {
            Ok(SyncOutcome::Completed(report)) => tracing::debug!(
                user = %user_uid,
                trigger = trigger.as_str(),
                pushed = report.push.applied,
                "scheduled sync finished"
            ),
            Ok(SyncOutcome::Offline) => {
                tracing::debug!(user = %user_uid, trigger = trigger.as_str(), "offline, sync deferred");
            }
            Ok(SyncOutcome::AlreadyRunning) => {
                tracing::debug!(user = %user_uid, trigger = trigger.as_str(), "sync already in flight");
            }
            Err(err) => {
                tracing::error!(user = %user_uid, trigger = trigger.as_str(), error = %err, "scheduled sync failed");
            }
        }
        passes.send_modify(|n| *n += 1);
    }
    tracing::info!(user = %user_uid, "sync scheduler stopped");
}
