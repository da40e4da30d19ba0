//! Persistence for [`crate::model::MonitoringTask`].

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::filters::FilterDoc;
use crate::model::MonitoringTask;
use crate::time::now_unix;

fn row_to_task(row: &Row) -> rusqlite::Result<MonitoringTask> {
    let filters_json: String = row.get("filters")?;
    let filters = FilterDoc::from_json(&filters_json).unwrap_or_default();

    Ok(MonitoringTask {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        name: row.get("name")?,
        url: row.get("url")?,
        filters,
        check_interval_seconds: row.get("check_interval_seconds")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        total_checks: row.get("total_checks")?,
        last_check: row.get("last_check")?,
        next_check: row.get("next_check")?,
        updated_at: row.get("updated_at")?,
        created_at: row.get("created_at")?,
    })
}

/// Floor for `check_interval_seconds`. A caller-supplied interval below this
/// is clamped up rather than rejected, so a misconfigured `0` or negative
/// value can't turn a task's control loop into a busy-spin.
pub const MINIMUM_CHECK_INTERVAL_SECONDS: i64 = 30;

/// Creates a new task, due for its first check immediately.
pub fn create_task(
    conn: &Connection,
    owner_id: &str,
    name: &str,
    url: &str,
    filters: &FilterDoc,
    check_interval_seconds: i64,
) -> crate::Result<i64> {
    let now = now_unix();
    let filters_json = filters.to_json()?;
    let check_interval_seconds = check_interval_seconds.max(MINIMUM_CHECK_INTERVAL_SECONDS);

    conn.execute(
        "INSERT INTO monitoring_tasks
            (owner_id, name, url, filters, check_interval_seconds, is_active,
             total_checks, last_check, next_check, updated_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, 1, 0, NULL, ?6, ?6, ?6)",
        params![owner_id, name, url, filters_json, check_interval_seconds, now],
    )
    .map_err(|e| crate::MonitoringError::Store(format!("failed to create task: {e}")))?;

    Ok(conn.last_insert_rowid())
}

pub fn get_task(conn: &Connection, task_id: i64) -> crate::Result<Option<MonitoringTask>> {
    conn.query_row(
        "SELECT * FROM monitoring_tasks WHERE id = ?1",
        params![task_id],
        row_to_task,
    )
    .optional()
    .map_err(|e| crate::MonitoringError::Store(format!("failed to load task {task_id}: {e}")).into())
}

pub fn list_tasks(conn: &Connection, owner_id: Option<&str>) -> crate::Result<Vec<MonitoringTask>> {
    let mut stmt = match owner_id {
        Some(_) => conn.prepare("SELECT * FROM monitoring_tasks WHERE owner_id = ?1 ORDER BY id")?,
        None => conn.prepare("SELECT * FROM monitoring_tasks ORDER BY id")?,
    };

    let rows = match owner_id {
        Some(owner) => stmt.query_map(params![owner], row_to_task)?,
        None => stmt.query_map([], row_to_task)?,
    };

    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row.map_err(|e| crate::MonitoringError::Store(format!("failed to read task row: {e}")))?);
    }
    Ok(tasks)
}

/// Returns every active task whose `next_check` has arrived, ordered so the
/// most overdue tasks are returned first.
pub fn due_tasks(conn: &Connection, now: i64) -> crate::Result<Vec<MonitoringTask>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM monitoring_tasks
         WHERE is_active = 1 AND next_check <= ?1
         ORDER BY next_check ASC",
    )?;
    let rows = stmt.query_map(params![now], row_to_task)?;

    let mut tasks = Vec::new();
    for row in rows {
        tasks.push(row.map_err(|e| crate::MonitoringError::Store(format!("failed to read due task row: {e}")))?);
    }
    Ok(tasks)
}

/// Records that the scheduler dispatched a check for `task_id`: advances
/// `next_check` by `check_interval_seconds` and stamps `last_check`. Owned
/// exclusively by the scheduler's control loop — `total_checks` is a
/// separate counter, incremented only by the result processor on result
/// receipt, so that it reflects completed work rather than issued work.
pub fn advance_schedule(conn: &Connection, task_id: i64) -> crate::Result<()> {
    let now = now_unix();
    conn.execute(
        "UPDATE monitoring_tasks
         SET last_check = ?2,
             next_check = ?2 + check_interval_seconds,
             updated_at = ?2
         WHERE id = ?1",
        params![task_id, now],
    )
    .map_err(|e| crate::MonitoringError::Store(format!("failed to advance schedule for task {task_id}: {e}")))?;
    Ok(())
}

/// Bumps `total_checks` for `task_id`. Owned exclusively by the result
/// processor, in a separate `UPDATE` from any scheduler-side book-keeping to
/// avoid a lost update between the two writers.
pub fn increment_total_checks(conn: &Connection, task_id: i64) -> crate::Result<()> {
    conn.execute(
        "UPDATE monitoring_tasks SET total_checks = total_checks + 1, updated_at = ?2 WHERE id = ?1",
        params![task_id, now_unix()],
    )
    .map_err(|e| crate::MonitoringError::Store(format!("failed to increment total_checks for task {task_id}: {e}")))?;
    Ok(())
}

pub fn set_active(conn: &Connection, task_id: i64, is_active: bool) -> crate::Result<()> {
    conn.execute(
        "UPDATE monitoring_tasks SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
        params![task_id, is_active as i64, now_unix()],
    )
    .map_err(|e| crate::MonitoringError::Store(format!("failed to update task {task_id}: {e}")))?;
    Ok(())
}

pub fn delete_task(conn: &Connection, task_id: i64) -> crate::Result<()> {
    conn.execute("DELETE FROM found_items WHERE task_id = ?1", params![task_id])
        .map_err(|e| crate::MonitoringError::Store(format!("failed to delete found_items for task {task_id}: {e}")))?;
    conn.execute("DELETE FROM monitoring_tasks WHERE id = ?1", params![task_id])
        .map_err(|e| crate::MonitoringError::Store(format!("failed to delete task {task_id}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Store;
    use std::time::Duration;

    fn test_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("test.db"), Duration::from_secs(5));
        store.migrate().unwrap();
        (dir, store)
    }

    #[test]
    fn create_and_load_round_trips() {
        let (_dir, store) = test_store();
        let conn = store.open_session().unwrap();

        let id = create_task(&conn, "owner-1", "AK redlines", "https://example/market", &FilterDoc::default(), 60).unwrap();
        let task = get_task(&conn, id).unwrap().unwrap();

        assert_eq!(task.owner_id, "owner-1");
        assert_eq!(task.total_checks, 0);
        assert!(task.is_active);
        assert!(task.last_check.is_none());
    }

    #[test]
    fn create_task_clamps_a_too_small_check_interval_to_the_minimum() {
        let (_dir, store) = test_store();
        let conn = store.open_session().unwrap();

        let id = create_task(&conn, "owner-1", "t", "u", &FilterDoc::default(), 0).unwrap();
        let task = get_task(&conn, id).unwrap().unwrap();
        assert_eq!(task.check_interval_seconds, MINIMUM_CHECK_INTERVAL_SECONDS);

        let negative_id = create_task(&conn, "owner-1", "t2", "u2", &FilterDoc::default(), -60).unwrap();
        let task = get_task(&conn, negative_id).unwrap().unwrap();
        assert_eq!(task.check_interval_seconds, MINIMUM_CHECK_INTERVAL_SECONDS);
    }

    #[test]
    fn create_task_leaves_an_interval_above_the_minimum_untouched() {
        let (_dir, store) = test_store();
        let conn = store.open_session().unwrap();

        let id = create_task(&conn, "owner-1", "t", "u", &FilterDoc::default(), 600).unwrap();
        let task = get_task(&conn, id).unwrap().unwrap();
        assert_eq!(task.check_interval_seconds, 600);
    }

    #[test]
    fn due_tasks_only_returns_active_and_overdue() {
        let (_dir, store) = test_store();
        let conn = store.open_session().unwrap();

        let id = create_task(&conn, "owner-1", "t", "u", &FilterDoc::default(), 60).unwrap();
        let far_future_id = create_task(&conn, "owner-1", "t2", "u2", &FilterDoc::default(), 60).unwrap();
        conn.execute(
            "UPDATE monitoring_tasks SET next_check = ?2 WHERE id = ?1",
            params![far_future_id, now_unix() + 10_000],
        )
        .unwrap();
        set_active(&conn, id, true).unwrap();

        let due = due_tasks(&conn, now_unix() + 1).unwrap();
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].id, id);
    }

    #[test]
    fn advance_schedule_moves_next_check_without_touching_total_checks() {
        let (_dir, store) = test_store();
        let conn = store.open_session().unwrap();

        let id = create_task(&conn, "owner-1", "t", "u", &FilterDoc::default(), 60).unwrap();
        let before = get_task(&conn, id).unwrap().unwrap();

        advance_schedule(&conn, id).unwrap();
        let after = get_task(&conn, id).unwrap().unwrap();

        assert_eq!(after.total_checks, before.total_checks);
        assert!(after.next_check >= before.next_check);
        assert!(after.last_check.is_some());
    }

    #[test]
    fn increment_total_checks_bumps_counter_only() {
        let (_dir, store) = test_store();
        let conn = store.open_session().unwrap();

        let id = create_task(&conn, "owner-1", "t", "u", &FilterDoc::default(), 60).unwrap();
        let before = get_task(&conn, id).unwrap().unwrap();

        increment_total_checks(&conn, id).unwrap();
        let after = get_task(&conn, id).unwrap().unwrap();

        assert_eq!(after.total_checks, before.total_checks + 1);
        assert_eq!(after.next_check, before.next_check);
    }

    #[test]
    fn set_active_false_excludes_task_from_due_set() {
        let (_dir, store) = test_store();
        let conn = store.open_session().unwrap();

        let id = create_task(&conn, "owner-1", "t", "u", &FilterDoc::default(), 60).unwrap();
        set_active(&conn, id, false).unwrap();

        let due = due_tasks(&conn, now_unix() + 1_000_000).unwrap();
        assert!(due.is_empty());
    }

    #[test]
    fn delete_task_removes_task_and_its_found_items() {
        let (_dir, store) = test_store();
        let conn = store.open_session().unwrap();

        let id = create_task(&conn, "owner-1", "t", "u", &FilterDoc::default(), 60).unwrap();
        crate::store::found_items::record_match(&conn, id, "fp-1", 100, "summary").unwrap();

        delete_task(&conn, id).unwrap();

        assert!(get_task(&conn, id).unwrap().is_none());
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM found_items WHERE task_id = ?1", params![id], |r| r.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }
}
