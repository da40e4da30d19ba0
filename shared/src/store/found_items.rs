//! Persistence for de-duplication records ([`crate::model::FoundItem`]).
//!
//! The `(task_id, listing_fingerprint)` unique constraint is what makes
//! match notification idempotent: `record_match` uses `INSERT OR IGNORE`
//! and reports whether a row was actually inserted, so a caller can decide
//! to notify exactly once even if the same listing is processed twice
//! (duplicate delivery on the results bus, a retried worker, etc).

use rusqlite::{params, Connection};

use crate::time::now_unix;

/// Attempts to record a first sighting of `listing_fingerprint` for
/// `task_id`. Returns `true` if this call actually inserted the row (i.e.
/// this is genuinely the first time the listing has been seen for this
/// task), `false` if it was already recorded.
pub fn record_match(
    conn: &Connection,
    task_id: i64,
    listing_fingerprint: &str,
    price_cents: i64,
    raw_summary: &str,
) -> crate::Result<bool> {
    let affected = conn
        .execute(
            "INSERT OR IGNORE INTO found_items
                (task_id, listing_fingerprint, price_cents, first_seen_at, raw_summary)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![task_id, listing_fingerprint, price_cents, now_unix(), raw_summary],
        )
        .map_err(|e| crate::MonitoringError::Store(format!("failed to record found item: {e}")))?;

    Ok(affected == 1)
}

pub fn count_for_task(conn: &Connection, task_id: i64) -> crate::Result<i64> {
    conn.query_row(
        "SELECT COUNT(*) FROM found_items WHERE task_id = ?1",
        params![task_id],
        |row| row.get(0),
    )
    .map_err(|e| crate::MonitoringError::Store(format!("failed to count found items for task {task_id}: {e}")).into())
}

/// Deletes found-item records older than `older_than_days`. Disabled by
/// default — the admin surface must invoke this explicitly, since
/// `found_items` doubles as the permanent de-duplication ledger and pruning
/// it allows a previously-notified listing to be re-notified.
pub fn prune_older_than(conn: &Connection, older_than_days: i64) -> crate::Result<usize> {
    let cutoff = now_unix() - older_than_days.saturating_mul(86_400);
    let affected = conn
        .execute(
            "DELETE FROM found_items WHERE first_seen_at < ?1",
            params![cutoff],
        )
        .map_err(|e| crate::MonitoringError::Store(format!("failed to prune found items: {e}")))?;
    Ok(affected)
}
