//! In-process daily trigger for the aggregation job.
//!
//! One tokio task sleeps until the next business-time trigger, runs the job on
//! a blocking thread, logs the outcome and goes back to sleep. A failed run is
//! not retried here; the operator replays it through `POST /api/aggregation/run`.

use std::sync::Arc;
use std::time::Duration;

use chrono::{NaiveTime, Utc};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::aggregation;
use crate::business_time::BusinessClock;
use crate::db::DbState;

pub struct SchedulerHandle {
    stop: Arc<Notify>,
    task: JoinHandle<()>,
}

impl SchedulerHandle {
    /// Stop the loop and wait for it. An in-flight run finishes first.
    pub async fn shutdown(self) {
        self.stop.notify_one();
        if let Err(e) = self.task.await {
            error!("Aggregation scheduler task failed: {e}");
        }
    }
}

pub fn start_daily_scheduler(
    db: Arc<DbState>,
    clock: BusinessClock,
    at: NaiveTime,
) -> SchedulerHandle {
    let stop = Arc::new(Notify::new());
    let stop_signal = stop.clone();

    let task = tokio::spawn(async move {
        info!(trigger = %at.format("%H:%M"), offset = %clock.offset(), "Aggregation scheduler started");

        loop {
            let now = Utc::now();
            let next = clock.next_trigger_after(now, at);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(next_run = %next.to_rfc3339(), "Next daily aggregation scheduled");

            tokio::select! {
                _ = stop_signal.notified() => {
                    info!("Aggregation scheduler stopped");
                    break;
                }
                _ = tokio::time::sleep(wait) => {}
            }

            // The trigger instant decides the business day, not the wake-up
            // time, so a late wake-up still aggregates the right date.
            let db = db.clone();
            let run = tokio::task::spawn_blocking(move || {
                aggregation::run_daily_aggregation(&db, &clock, next)
            })
            .await;

            match run {
                Ok(Ok(outcome)) => info!(
                    date_id = %outcome.date_id,
                    events = outcome.events,
                    branches = outcome.branches,
                    "Scheduled aggregation finished"
                ),
                Ok(Err(e)) => error!(
                    date_id = %clock.business_date(next).format("%Y-%m-%d"),
                    error = %e,
                    "Scheduled aggregation failed"
                ),
                Err(e) => error!("Scheduled aggregation task panicked: {e}"),
            }
        }
    });

    SchedulerHandle { stop, task }
}
