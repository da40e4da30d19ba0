//! Per-task control loops and the reconciliation sweep that keeps them in
//! sync with the task table.
//!
//! Rather than a single loop iterating over every task, each active task
//! gets its own lightweight `tokio::spawn`ed control loop, and a periodic
//! reconciliation tick starts loops for newly activated tasks and tears
//! down loops for deactivated or deleted ones. A crashed control loop is
//! respawned by [`crate::recovery::supervise`] with exponential backoff
//! instead of taking the whole scheduler down with it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use shared::bus::Bus;
use shared::model::CheckRequest;
use shared::store::{tasks, Store};
use shared::time::now_unix;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// A running per-task control loop.
struct TaskHandle {
    join_handle: JoinHandle<()>,
}

pub struct TaskScheduler {
    pub(crate) store: Store,
    pub(crate) bus: Bus,
    tick_interval: Duration,
    running: Mutex<HashMap<i64, TaskHandle>>,
}

impl TaskScheduler {
    pub fn new(store: Store, bus: Bus, tick_interval: Duration) -> Self {
        Self {
            store,
            bus,
            tick_interval,
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Runs the reconciliation loop until `shutdown` fires, then aborts
    /// every outstanding control loop.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) -> shared::Result<()> {
        info!("scheduler reconciliation loop starting");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("scheduler received shutdown signal");
                    break;
                }
                _ = tokio::time::sleep(self.tick_interval) => {
                    if let Err(e) = self.reconcile().await {
                        warn!(error = %e, "reconciliation tick failed");
                    }
                }
            }
        }

        let mut running = self.running.lock().await;
        for (task_id, handle) in running.drain() {
            debug!(task_id, "aborting control loop for shutdown");
            handle.join_handle.abort();
        }
        Ok(())
    }

    /// Starts control loops for newly active tasks, and stops loops for
    /// tasks that are no longer active (deactivated or deleted). Also
    /// restarts loops that exited or were permanently given up on by
    /// [`crate::recovery::supervise`], so a task is never silently
    /// abandoned for longer than one tick interval.
    async fn reconcile(self: &Arc<Self>) -> shared::Result<()> {
        let conn = self.store.open_session()?;
        let active_tasks = tasks::list_tasks(&conn, None)?
            .into_iter()
            .filter(|t| t.is_active)
            .collect::<Vec<_>>();
        drop(conn);

        let active_ids: std::collections::HashSet<i64> = active_tasks.iter().map(|t| t.id).collect();

        let mut running = self.running.lock().await;

        let stale: Vec<i64> = running
            .keys()
            .copied()
            .filter(|id| !active_ids.contains(id))
            .collect();
        for task_id in stale {
            if let Some(handle) = running.remove(&task_id) {
                debug!(task_id, "stopping control loop for inactive/deleted task");
                handle.join_handle.abort();
            }
        }

        for task in &active_tasks {
            let needs_spawn = match running.get(&task.id) {
                Some(handle) => handle.join_handle.is_finished(),
                None => true,
            };
            if needs_spawn {
                debug!(task_id = task.id, "spawning control loop");
                let join_handle = tokio::spawn(crate::recovery::supervise(self.clone(), task.id));
                running.insert(task.id, TaskHandle { join_handle });
            }
        }

        Ok(())
    }
}

/// How a single control-loop tick resolved.
enum TickOutcome {
    /// The task was deactivated or deleted; the control loop should exit.
    Exited,
    /// Not due yet; the loop slept until `next_check` and should try again.
    SleptUntilDue,
    /// A check request was published and the schedule advanced.
    Dispatched,
}

/// Tolerate this many consecutive tick failures (typically a transient store
/// error) before giving up and handing the task back to
/// [`crate::recovery::supervise`]'s own backoff. Kept low enough that a
/// genuinely broken dependency still surfaces quickly.
const MAX_CONSECUTIVE_TICK_ERRORS: u32 = 5;

/// Runs the control loop for a single task until it is deactivated or
/// deleted. Sleeps until `next_check`, publishes a check request, and
/// records the check as completed — actual fetching and result handling
/// happen asynchronously in the worker process.
///
/// A single tick failing (usually a transient store error) doesn't
/// immediately unwind the whole loop into recovery's own backoff: up to
/// [`MAX_CONSECUTIVE_TICK_ERRORS`] in a row are absorbed here, each one
/// followed by a best-effort attempt to push `next_check` forward anyway
/// (see [`safe_advance`]) so the task doesn't pile up a backlog of missed
/// checks while the loop is stuck retrying. Only once that budget is
/// exhausted does the error propagate out to the caller.
pub(crate) async fn run_single_task(scheduler: Arc<TaskScheduler>, task_id: i64) -> shared::Result<()> {
    let mut consecutive_errors = 0u32;

    loop {
        match run_single_tick(&scheduler, task_id).await {
            Ok(TickOutcome::Exited) => return Ok(()),
            Ok(_) => {
                consecutive_errors = 0;
            }
            Err(e) => {
                consecutive_errors += 1;
                warn!(task_id, consecutive_errors, error = %e, "control loop tick failed");

                if let Err(advance_err) = safe_advance(&scheduler.store, task_id) {
                    warn!(task_id, error = %advance_err, "safe-advance after tick failure also failed");
                }

                if consecutive_errors >= MAX_CONSECUTIVE_TICK_ERRORS {
                    error!(task_id, consecutive_errors, "exceeded consecutive tick failure budget, handing off to recovery backoff");
                    return Err(e);
                }
            }
        }
    }
}

async fn run_single_tick(scheduler: &Arc<TaskScheduler>, task_id: i64) -> shared::Result<TickOutcome> {
    let conn = scheduler.store.open_session()?;
    let task = match tasks::get_task(&conn, task_id)? {
        Some(t) if t.is_active => t,
        _ => {
            debug!(task_id, "task no longer active, exiting control loop");
            return Ok(TickOutcome::Exited);
        }
    };
    drop(conn);

    let now = now_unix();
    if task.next_check > now {
        tokio::time::sleep(Duration::from_secs((task.next_check - now) as u64)).await;
        return Ok(TickOutcome::SleptUntilDue);
    }

    let request = CheckRequest {
        task_id: task.id,
        url: task.url.clone(),
        filters: task.filters.clone(),
        attempt: 0,
        correlation_id: Uuid::new_v4(),
    };
    scheduler.bus.publish_check_request(&request)?;

    let conn = scheduler.store.open_session()?;
    tasks::advance_schedule(&conn, task.id)?;
    debug!(task_id, correlation_id = %request.correlation_id, "published check request");
    Ok(TickOutcome::Dispatched)
}

/// Pushes `next_check` forward in its own short-lived session, independent of
/// whatever the failed tick was doing. Best-effort: if the store is down
/// entirely this will also fail, and the caller just logs and keeps counting
/// toward the consecutive-failure budget.
fn safe_advance(store: &Store, task_id: i64) -> shared::Result<()> {
    let conn = store.open_session()?;
    tasks::advance_schedule(&conn, task_id)
}
