//! Crash recovery for per-task control loops.
//!
//! A control loop ends one of two ways: cleanly, because the task was
//! deactivated or deleted (`Ok(())`), or with an error, because something
//! it depends on (usually the database) misbehaved. Only the latter is
//! retried, with a doubling backoff capped at a bounded number of attempts
//! so a permanently-broken dependency doesn't spin forever — the
//! scheduler's next reconciliation tick will try again regardless.

use std::sync::Arc;

use shared::retry::RetryPolicy;
use tracing::{error, warn};

use crate::scheduler::{run_single_task, TaskScheduler};

pub(crate) async fn supervise(scheduler: Arc<TaskScheduler>, task_id: i64) {
    let policy = RetryPolicy::scheduler_recovery();
    let mut attempt = 0u32;

    loop {
        match run_single_task(scheduler.clone(), task_id).await {
            Ok(()) => return,
            Err(e) => {
                warn!(task_id, attempt, error = %e, "control loop crashed");
                match policy.delay_for(attempt) {
                    Some(delay) => {
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    None => {
                        error!(task_id, attempts = attempt, "control loop exhausted recovery attempts, giving up until next reconciliation tick");
                        return;
                    }
                }
            }
        }
    }
}
