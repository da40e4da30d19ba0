//! Core domain types shared by every component of the monitoring backend.
//!
//! `MonitoringTask` is the user-owned subscription, `FoundItem` is the
//! de-duplication record of an already-notified match, and `Proxy` is a
//! managed egress endpoint. `Listing` and the bus envelopes are the wire
//! shapes that flow between the scheduler, the parsing workers, and the
//! result processor.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::filters::FilterDoc;

/// A user-owned subscription to a Steam Market listing page.
///
/// Invariants:
/// - if `is_active` then `next_check` is meaningful and only ever advances
///   forward except on an explicit reschedule.
/// - `total_checks` never decreases.
/// - `filters` is always a well-formed [`FilterDoc`].
/// - at most one scheduler control loop owns a given task id at a time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonitoringTask {
    pub id: i64,
    pub owner_id: String,
    pub name: String,
    pub url: String,
    pub filters: FilterDoc,
    pub check_interval_seconds: i64,
    pub is_active: bool,
    pub total_checks: i64,
    pub last_check: Option<i64>,
    pub next_check: i64,
    pub updated_at: i64,
    pub created_at: i64,
}

/// A de-duplication record for a listing that has already been notified for
/// a given task. One row exists per `(task_id, listing_fingerprint)` pair,
/// and it is never rewritten after insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FoundItem {
    pub id: i64,
    pub task_id: i64,
    pub listing_fingerprint: String,
    pub price_cents: i64,
    pub first_seen_at: i64,
    /// Opaque, human-readable summary of the listing at match time (not a
    /// full historical record — the system keeps only what de-duplication
    /// and notification require).
    pub raw_summary: String,
}

/// A managed egress endpoint used by parsing workers to reach the upstream
/// market pages.
///
/// A proxy is leasable iff `is_active` and `blocked_until` is either absent
/// or in the past. `blocked_until` only ever advances via rate-limit
/// handling and is cleared on explicit unblock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proxy {
    pub id: i64,
    pub endpoint: String,
    pub is_active: bool,
    pub blocked_until: Option<i64>,
    pub successes: i64,
    pub failures: i64,
    pub last_used_at: Option<i64>,
    pub created_at: i64,
}

impl Proxy {
    /// Leasable iff active and not currently blocked.
    pub fn is_leasable_at(&self, now: i64) -> bool {
        self.is_active && self.blocked_until.map(|b| b <= now).unwrap_or(true)
    }
}

/// A single market listing as reported by the (opaque) Fetcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    #[serde(default)]
    pub listing_id: Option<String>,
    pub item_name: String,
    pub price_cents: i64,
    #[serde(default)]
    pub wear: Option<f64>,
    #[serde(default)]
    pub pattern_seed: Option<i64>,
    #[serde(default)]
    pub stickers: Option<Vec<String>>,
    #[serde(default)]
    pub seller_opaque_id: Option<String>,
    #[serde(default)]
    pub raw: Option<serde_json::Value>,
}

/// Message published by the scheduler on the `check.requests` queue and
/// consumed by a parsing worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckRequest {
    pub task_id: i64,
    pub url: String,
    pub filters: FilterDoc,
    pub attempt: u32,
    pub correlation_id: Uuid,
}

/// The classified outcome kind carried on a failed `CheckResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckResultKind {
    RateLimited,
    Parse,
    Transport,
}

/// Message published by a parsing worker on the `check.results` queue and
/// consumed by the result processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub task_id: i64,
    pub correlation_id: Uuid,
    pub ok: bool,
    #[serde(default)]
    pub kind: Option<CheckResultKind>,
    #[serde(default)]
    pub listings: Option<Vec<Listing>>,
    pub fetched_at: String,
}

/// A match event handed to the [`crate::notifier::Notifier`] collaborator
/// the first time a listing is observed for a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchNotification {
    pub task_id: i64,
    pub owner_id: String,
    pub task_name: String,
    pub item_name: String,
    pub price_cents: i64,
    pub listing_fingerprint: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_proxy(is_active: bool, blocked_until: Option<i64>) -> Proxy {
        Proxy {
            id: 1,
            endpoint: "http://proxy.example:8080".to_string(),
            is_active,
            blocked_until,
            successes: 0,
            failures: 0,
            last_used_at: None,
            created_at: 0,
        }
    }

    #[test]
    fn proxy_leasable_when_active_and_unblocked() {
        let proxy = sample_proxy(true, None);
        assert!(proxy.is_leasable_at(1_000));
    }

    #[test]
    fn proxy_not_leasable_when_inactive() {
        let proxy = sample_proxy(false, None);
        assert!(!proxy.is_leasable_at(1_000));
    }

    #[test]
    fn proxy_not_leasable_while_blocked() {
        let proxy = sample_proxy(true, Some(2_000));
        assert!(!proxy.is_leasable_at(1_000));
    }

    #[test]
    fn proxy_leasable_once_block_expires() {
        let proxy = sample_proxy(true, Some(500));
        assert!(proxy.is_leasable_at(1_000));
    }
}
