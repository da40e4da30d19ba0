//! Durable, at-least-once message bus.
//!
//! Each of the two queues — `check.requests` (scheduler → parsing worker)
//! and `check.results` (parsing worker → result processor) — is a plain SQL
//! table with a pending/sending/sent status column, `next_retry_at` backoff,
//! and `INSERT OR IGNORE` for publisher-side idempotency. There is no broker
//! process: delivery is a `SELECT ... FOR lease` style claim done inside a
//! transaction so two consumer loops never win the same row.

use std::time::Duration;

use rusqlite::{params, Connection, OptionalExtension};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;
use uuid::Uuid;

use crate::model::{CheckRequest, CheckResult};
use crate::retry::RetryPolicy;
use crate::store::Store;
use crate::time::now_unix;

/// A message claimed off a queue, still pending acknowledgement.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery<T> {
    pub row_id: i64,
    pub attempt: u32,
    pub message: T,
}

#[derive(Debug, Clone)]
pub struct Bus {
    store: Store,
}

const REQUESTS_TABLE: &str = "bus_check_requests";
const RESULTS_TABLE: &str = "bus_check_results";

impl Bus {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    pub fn publish_check_request(&self, request: &CheckRequest) -> crate::Result<()> {
        let conn = self.store.open_session()?;
        enqueue(&conn, REQUESTS_TABLE, request.task_id, &request.correlation_id, request)
    }

    pub fn lease_check_request(&self, lease: Duration) -> crate::Result<Option<Delivery<CheckRequest>>> {
        let mut conn = self.store.open_session()?;
        lease_one(&mut conn, REQUESTS_TABLE, lease)
    }

    pub fn ack_check_request(&self, row_id: i64) -> crate::Result<()> {
        let conn = self.store.open_session()?;
        ack(&conn, REQUESTS_TABLE, row_id)
    }

    pub fn nack_check_request(&self, row_id: i64, policy: &RetryPolicy, error: &str) -> crate::Result<()> {
        let conn = self.store.open_session()?;
        nack(&conn, REQUESTS_TABLE, row_id, policy, error)
    }

    pub fn publish_check_result(&self, result: &CheckResult) -> crate::Result<()> {
        let conn = self.store.open_session()?;
        enqueue(&conn, RESULTS_TABLE, result.task_id, &result.correlation_id, result)
    }

    pub fn lease_check_result(&self, lease: Duration) -> crate::Result<Option<Delivery<CheckResult>>> {
        let mut conn = self.store.open_session()?;
        lease_one(&mut conn, RESULTS_TABLE, lease)
    }

    pub fn ack_check_result(&self, row_id: i64) -> crate::Result<()> {
        let conn = self.store.open_session()?;
        ack(&conn, RESULTS_TABLE, row_id)
    }

    pub fn nack_check_result(&self, row_id: i64, policy: &RetryPolicy, error: &str) -> crate::Result<()> {
        let conn = self.store.open_session()?;
        nack(&conn, RESULTS_TABLE, row_id, policy, error)
    }

    /// Sweeps both queues for rows whose delivery lease has expired without
    /// an ack or nack (a consumer crashed mid-processing) and returns them
    /// to `pending` so another consumer can pick them up.
    pub fn reclaim_expired_leases(&self) -> crate::Result<usize> {
        let conn = self.store.open_session()?;
        let now = now_unix();
        let mut reclaimed = 0;
        for table in [REQUESTS_TABLE, RESULTS_TABLE] {
            reclaimed += conn
                .execute(
                    &format!(
                        "UPDATE {table}
                         SET status = 'pending', updated_at = ?1
                         WHERE status = 'sending' AND lease_expires_at IS NOT NULL AND lease_expires_at <= ?1"
                    ),
                    params![now],
                )
                .map_err(|e| crate::MonitoringError::Store(format!("failed to reclaim leases on {table}: {e}")))?;
        }
        Ok(reclaimed)
    }
}

fn enqueue<T: Serialize>(
    conn: &Connection,
    table: &str,
    task_id: i64,
    correlation_id: &Uuid,
    message: &T,
) -> crate::Result<()> {
    let payload = serde_json::to_string(message)?;
    let now = now_unix();
    conn.execute(
        &format!(
            "INSERT OR IGNORE INTO {table}
                (task_id, correlation_id, payload, status, attempt, next_retry_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, 'pending', 0, ?4, ?4, ?4)"
        ),
        params![task_id, correlation_id.to_string(), payload, now],
    )
    .map_err(|e| crate::MonitoringError::Store(format!("failed to enqueue onto {table}: {e}")))?;
    Ok(())
}

fn lease_one<T: DeserializeOwned>(
    conn: &mut Connection,
    table: &str,
    lease: Duration,
) -> crate::Result<Option<Delivery<T>>> {
    let tx = conn
        .transaction()
        .map_err(|e| crate::MonitoringError::Store(format!("failed to start lease transaction on {table}: {e}")))?;

    let now = now_unix();
    let candidate: Option<(i64, String, i64)> = tx
        .query_row(
            &format!(
                "SELECT id, payload, attempt FROM {table}
                 WHERE status = 'pending' AND next_retry_at <= ?1
                 ORDER BY created_at ASC LIMIT 1"
            ),
            params![now],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()
        .map_err(|e| crate::MonitoringError::Store(format!("failed to select lease candidate from {table}: {e}")))?;

    let Some((row_id, payload, attempt)) = candidate else {
        return Ok(None);
    };

    let lease_expires_at = now + lease.as_secs() as i64;
    tx.execute(
        &format!(
            "UPDATE {table}
             SET status = 'sending', attempt = attempt + 1, lease_expires_at = ?2, updated_at = ?3
             WHERE id = ?1"
        ),
        params![row_id, lease_expires_at, now],
    )
    .map_err(|e| crate::MonitoringError::Store(format!("failed to mark {table} row {row_id} sending: {e}")))?;

    tx.commit()
        .map_err(|e| crate::MonitoringError::Store(format!("failed to commit lease transaction on {table}: {e}")))?;

    let message: T = serde_json::from_str(&payload)?;
    debug!(table, row_id, attempt, "leased bus message");
    Ok(Some(Delivery {
        row_id,
        attempt: attempt as u32,
        message,
    }))
}

fn ack(conn: &Connection, table: &str, row_id: i64) -> crate::Result<()> {
    conn.execute(
        &format!("UPDATE {table} SET status = 'sent', updated_at = ?2 WHERE id = ?1"),
        params![row_id, now_unix()],
    )
    .map_err(|e| crate::MonitoringError::Store(format!("failed to ack {table} row {row_id}: {e}")))?;
    Ok(())
}

fn nack(conn: &Connection, table: &str, row_id: i64, policy: &RetryPolicy, error: &str) -> crate::Result<()> {
    let attempt: i64 = conn
        .query_row(&format!("SELECT attempt FROM {table} WHERE id = ?1"), params![row_id], |row| row.get(0))
        .map_err(|e| crate::MonitoringError::Store(format!("failed to read attempt for {table} row {row_id}: {e}")))?;

    let now = now_unix();
    match policy.delay_for(attempt as u32) {
        Some(delay) => {
            conn.execute(
                &format!(
                    "UPDATE {table}
                     SET status = 'pending', next_retry_at = ?2, last_error = ?3, updated_at = ?4
                     WHERE id = ?1"
                ),
                params![row_id, now + delay.as_secs() as i64, error, now],
            )
        }
        None => conn.execute(
            &format!("UPDATE {table} SET status = 'failed', last_error = ?2, updated_at = ?3 WHERE id = ?1"),
            params![row_id, error, now],
        ),
    }
    .map_err(|e| crate::MonitoringError::Store(format!("failed to nack {table} row {row_id}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::FilterDoc;

    fn test_bus() -> (tempfile::TempDir, Bus) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("test.db"), Duration::from_secs(5));
        store.migrate().unwrap();
        (dir, Bus::new(store))
    }

    fn sample_request() -> CheckRequest {
        CheckRequest {
            task_id: 1,
            url: "https://example/market".to_string(),
            filters: FilterDoc::default(),
            attempt: 0,
            correlation_id: Uuid::new_v4(),
        }
    }

    #[test]
    fn publish_then_lease_round_trips_the_message() {
        let (_dir, bus) = test_bus();
        let request = sample_request();
        bus.publish_check_request(&request).unwrap();

        let delivery = bus.lease_check_request(Duration::from_secs(30)).unwrap().unwrap();
        assert_eq!(delivery.message, request);
        assert_eq!(delivery.attempt, 1);
    }

    #[test]
    fn leased_message_is_not_handed_to_a_second_consumer() {
        let (_dir, bus) = test_bus();
        bus.publish_check_request(&sample_request()).unwrap();

        assert!(bus.lease_check_request(Duration::from_secs(30)).unwrap().is_some());
        assert!(bus.lease_check_request(Duration::from_secs(30)).unwrap().is_none());
    }

    #[test]
    fn nack_with_remaining_attempts_schedules_redelivery() {
        let (_dir, bus) = test_bus();
        bus.publish_check_request(&sample_request()).unwrap();
        let delivery = bus.lease_check_request(Duration::from_secs(30)).unwrap().unwrap();

        bus.nack_check_request(delivery.row_id, &RetryPolicy::bus_redelivery(), "transport error").unwrap();

        // Not immediately available (next_retry_at is in the future).
        assert!(bus.lease_check_request(Duration::from_secs(30)).unwrap().is_none());
    }

    #[test]
    fn nack_past_max_attempts_marks_failed_not_pending() {
        let (_dir, bus) = test_bus();
        bus.publish_check_request(&sample_request()).unwrap();
        let delivery = bus.lease_check_request(Duration::from_secs(30)).unwrap().unwrap();

        let policy = RetryPolicy {
            base_delay: Duration::from_secs(1),
            factor: 1.0,
            cap: Duration::from_secs(1),
            max_attempts: 1,
            jitter: 0.0,
        };
        bus.nack_check_request(delivery.row_id, &policy, "permanent failure").unwrap();

        let conn = bus.store.open_session().unwrap();
        let status: String = conn
            .query_row("SELECT status FROM bus_check_requests WHERE id = ?1", params![delivery.row_id], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "failed");
    }

    #[test]
    fn ack_marks_message_sent() {
        let (_dir, bus) = test_bus();
        bus.publish_check_request(&sample_request()).unwrap();
        let delivery = bus.lease_check_request(Duration::from_secs(30)).unwrap().unwrap();
        bus.ack_check_request(delivery.row_id).unwrap();

        let conn = bus.store.open_session().unwrap();
        let status: String = conn
            .query_row("SELECT status FROM bus_check_requests WHERE id = ?1", params![delivery.row_id], |r| r.get(0))
            .unwrap();
        assert_eq!(status, "sent");
    }

    #[test]
    fn reclaim_expired_leases_returns_stuck_message_to_pending() {
        let (_dir, bus) = test_bus();
        bus.publish_check_request(&sample_request()).unwrap();
        bus.lease_check_request(Duration::from_secs(30)).unwrap().unwrap();

        // Force the lease into the past to simulate a crashed consumer.
        {
            let conn = bus.store.open_session().unwrap();
            conn.execute("UPDATE bus_check_requests SET lease_expires_at = 1", []).unwrap();
        }

        let reclaimed = bus.reclaim_expired_leases().unwrap();
        assert_eq!(reclaimed, 1);
        assert!(bus.lease_check_request(Duration::from_secs(30)).unwrap().is_some());
    }

    #[test]
    fn duplicate_publish_with_same_correlation_id_is_ignored() {
        let (_dir, bus) = test_bus();
        let request = sample_request();
        bus.publish_check_request(&request).unwrap();
        bus.publish_check_request(&request).unwrap();

        let conn = bus.store.open_session().unwrap();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM bus_check_requests", [], |r| r.get(0)).unwrap();
        assert_eq!(count, 1);
    }
}
