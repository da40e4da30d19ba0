//! Persistence for [`crate::model::Proxy`].
//!
//! Selection logic (LRU with a success-ratio tie-break) lives in
//! [`crate::proxy_manager`], which wraps these functions in a short
//! transaction so the "pick a candidate, then mark it leased" sequence is
//! atomic across concurrent worker sessions.

use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::model::Proxy;
use crate::time::now_unix;

fn row_to_proxy(row: &Row) -> rusqlite::Result<Proxy> {
    Ok(Proxy {
        id: row.get("id")?,
        endpoint: row.get("endpoint")?,
        is_active: row.get::<_, i64>("is_active")? != 0,
        blocked_until: row.get("blocked_until")?,
        successes: row.get("successes")?,
        failures: row.get("failures")?,
        last_used_at: row.get("last_used_at")?,
        created_at: row.get("created_at")?,
    })
}

pub fn create_proxy(conn: &Connection, endpoint: &str) -> crate::Result<i64> {
    conn.execute(
        "INSERT INTO proxies (endpoint, is_active, successes, failures, created_at)
         VALUES (?1, 1, 0, 0, ?2)",
        params![endpoint, now_unix()],
    )
    .map_err(|e| crate::MonitoringError::Store(format!("failed to create proxy {endpoint}: {e}")))?;
    Ok(conn.last_insert_rowid())
}

pub fn get_proxy(conn: &Connection, proxy_id: i64) -> crate::Result<Option<Proxy>> {
    conn.query_row("SELECT * FROM proxies WHERE id = ?1", params![proxy_id], row_to_proxy)
        .optional()
        .map_err(|e| crate::MonitoringError::Store(format!("failed to load proxy {proxy_id}: {e}")).into())
}

pub fn list_proxies(conn: &Connection) -> crate::Result<Vec<Proxy>> {
    let mut stmt = conn.prepare("SELECT * FROM proxies ORDER BY id")?;
    let rows = stmt.query_map([], row_to_proxy)?;
    let mut proxies = Vec::new();
    for row in rows {
        proxies.push(row.map_err(|e| crate::MonitoringError::Store(format!("failed to read proxy row: {e}")))?);
    }
    Ok(proxies)
}

/// Candidate proxies eligible for leasing right now, ordered least-recently
/// used first and, among ties, by the best observed success ratio. Callers
/// should take the first result and immediately mark it leased within the
/// same transaction to avoid a second caller picking the same proxy.
pub fn leasable_candidates(conn: &Connection, now: i64, limit: i64) -> crate::Result<Vec<Proxy>> {
    let mut stmt = conn.prepare(
        "SELECT * FROM proxies
         WHERE is_active = 1 AND (blocked_until IS NULL OR blocked_until <= ?1)
         ORDER BY
            (last_used_at IS NOT NULL) ASC, last_used_at ASC,
            CAST(successes AS REAL) / MAX(successes + failures, 1) DESC
         LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![now, limit], row_to_proxy)?;
    let mut proxies = Vec::new();
    for row in rows {
        proxies.push(row.map_err(|e| crate::MonitoringError::Store(format!("failed to read proxy candidate row: {e}")))?);
    }
    Ok(proxies)
}

pub fn mark_leased(conn: &Connection, proxy_id: i64) -> crate::Result<()> {
    conn.execute(
        "UPDATE proxies SET last_used_at = ?2 WHERE id = ?1",
        params![proxy_id, now_unix()],
    )
    .map_err(|e| crate::MonitoringError::Store(format!("failed to mark proxy {proxy_id} leased: {e}")))?;
    Ok(())
}

pub fn record_success(conn: &Connection, proxy_id: i64) -> crate::Result<()> {
    conn.execute(
        "UPDATE proxies SET successes = successes + 1 WHERE id = ?1",
        params![proxy_id],
    )
    .map_err(|e| crate::MonitoringError::Store(format!("failed to record success for proxy {proxy_id}: {e}")))?;
    Ok(())
}

pub fn record_failure(conn: &Connection, proxy_id: i64) -> crate::Result<()> {
    conn.execute(
        "UPDATE proxies SET failures = failures + 1 WHERE id = ?1",
        params![proxy_id],
    )
    .map_err(|e| crate::MonitoringError::Store(format!("failed to record failure for proxy {proxy_id}: {e}")))?;
    Ok(())
}

pub fn block_until(conn: &Connection, proxy_id: i64, blocked_until: i64) -> crate::Result<()> {
    conn.execute(
        "UPDATE proxies SET blocked_until = ?2 WHERE id = ?1",
        params![proxy_id, blocked_until],
    )
    .map_err(|e| crate::MonitoringError::Store(format!("failed to block proxy {proxy_id}: {e}")))?;
    Ok(())
}

pub fn unblock(conn: &Connection, proxy_id: i64) -> crate::Result<()> {
    conn.execute(
        "UPDATE proxies SET blocked_until = NULL WHERE id = ?1",
        params![proxy_id],
    )
    .map_err(|e| crate::MonitoringError::Store(format!("failed to unblock proxy {proxy_id}: {e}")))?;
    Ok(())
}

pub fn set_active(conn: &Connection, proxy_id: i64, is_active: bool) -> crate::Result<()> {
    conn.execute(
        "UPDATE proxies SET is_active = ?2 WHERE id = ?1",
        params![proxy_id, is_active as i64],
    )
    .map_err(|e| crate::MonitoringError::Store(format!("failed to set proxy {proxy_id} active={is_active}: {e}")))?;
    Ok(())
}

/// A point-in-time snapshot of the proxy pool's health, derived from a
/// single fresh read so concurrent callers always see a consistent count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProxyStats {
    pub total: i64,
    pub active: i64,
    pub inactive: i64,
    /// Proxies currently blocked (`blocked_until > now`), regardless of
    /// `is_active`.
    pub blocked: i64,
    /// Proxies that are both active and currently blocked — the subset an
    /// operator cares about, since an inactive-and-blocked proxy was never
    /// going to be leased anyway.
    pub active_blocked: i64,
}

pub fn stats(conn: &Connection, now: i64) -> crate::Result<ProxyStats> {
    conn.query_row(
        "SELECT
            COUNT(*),
            SUM(CASE WHEN is_active = 1 THEN 1 ELSE 0 END),
            SUM(CASE WHEN is_active = 0 THEN 1 ELSE 0 END),
            SUM(CASE WHEN blocked_until IS NOT NULL AND blocked_until > ?1 THEN 1 ELSE 0 END),
            SUM(CASE WHEN is_active = 1 AND blocked_until IS NOT NULL AND blocked_until > ?1 THEN 1 ELSE 0 END)
         FROM proxies",
        params![now],
        |row| {
            Ok(ProxyStats {
                total: row.get(0)?,
                active: row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                inactive: row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                blocked: row.get::<_, Option<i64>>(3)?.unwrap_or(0),
                active_blocked: row.get::<_, Option<i64>>(4)?.unwrap_or(0),
            })
        },
    )
    .map_err(|e| crate::MonitoringError::Store(format!("failed to compute proxy stats: {e}")).into())
}
