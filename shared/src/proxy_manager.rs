//! Proxy pool: leasing, health bookkeeping, and rate-limit cooloff.
//!
//! Every `acquire()` opens a fresh [`crate::store::Store`] session rather
//! than reusing a cached connection or an in-process identity map — the
//! same anti-caching discipline as the rest of this crate, so a proxy's
//! blocked/active state is always read fresh and two worker loops racing
//! to acquire never see stale data. Selection and the "mark leased" update
//! happen inside one immediate transaction so two concurrent callers can
//! never be handed the same proxy.

use std::time::Duration;

use tracing::warn;

use crate::model::Proxy;
use crate::store::proxies::ProxyStats;
use crate::store::{proxies, Store};
use crate::time::now_unix;

/// A proxy checked out for the duration of a single fetch.
#[derive(Debug, Clone, PartialEq)]
pub struct LeasedProxy {
    pub id: i64,
    pub endpoint: String,
}

#[derive(Debug, Clone)]
pub struct ProxyManager {
    store: Store,
    rate_limit_cooloff: Duration,
}

impl ProxyManager {
    pub fn new(store: Store, rate_limit_cooloff: Duration) -> Self {
        Self {
            store,
            rate_limit_cooloff,
        }
    }

    /// Leases the best available proxy: least-recently used, tie-broken by
    /// success ratio. Returns [`crate::MonitoringError::ProxyUnavailable`]
    /// when no proxy is currently active and unblocked.
    pub fn acquire(&self) -> crate::Result<LeasedProxy> {
        let mut conn = self.store.open_session()?;
        let tx = conn
            .transaction()
            .map_err(|e| crate::MonitoringError::Store(format!("failed to start lease transaction: {e}")))?;

        let now = now_unix();
        let mut candidates = proxies::leasable_candidates(&tx, now, 1)?;
        let Some(candidate) = candidates.pop() else {
            return Err(crate::MonitoringError::ProxyUnavailable.into());
        };

        proxies::mark_leased(&tx, candidate.id)?;
        tx.commit()
            .map_err(|e| crate::MonitoringError::Store(format!("failed to commit lease transaction: {e}")))?;

        Ok(LeasedProxy {
            id: candidate.id,
            endpoint: candidate.endpoint,
        })
    }

    /// Records a successful fetch through the leased proxy.
    pub fn report_success(&self, proxy_id: i64) -> crate::Result<()> {
        let conn = self.store.open_session()?;
        proxies::record_success(&conn, proxy_id)
    }

    /// Records an upstream rate-limit response and blocks the proxy for the
    /// configured cooloff window.
    pub fn report_rate_limited(&self, proxy_id: i64) -> crate::Result<()> {
        let conn = self.store.open_session()?;
        proxies::record_failure(&conn, proxy_id)?;
        let blocked_until = now_unix() + self.rate_limit_cooloff.as_secs() as i64;
        proxies::block_until(&conn, proxy_id, blocked_until)?;
        warn!(proxy_id, blocked_until, "proxy rate-limited, blocking");
        Ok(())
    }

    /// Records a transport-level failure (timeout, connection refused) that
    /// does not by itself indicate the proxy is burned, just unlucky.
    pub fn report_transport_failure(&self, proxy_id: i64) -> crate::Result<()> {
        let conn = self.store.open_session()?;
        proxies::record_failure(&conn, proxy_id)
    }

    pub fn register(&self, endpoint: &str) -> crate::Result<i64> {
        let conn = self.store.open_session()?;
        proxies::create_proxy(&conn, endpoint)
    }

    pub fn list(&self) -> crate::Result<Vec<Proxy>> {
        let conn = self.store.open_session()?;
        proxies::list_proxies(&conn)
    }

    pub fn unblock(&self, proxy_id: i64) -> crate::Result<()> {
        let conn = self.store.open_session()?;
        proxies::unblock(&conn, proxy_id)
    }

    pub fn deactivate(&self, proxy_id: i64) -> crate::Result<()> {
        let conn = self.store.open_session()?;
        proxies::set_active(&conn, proxy_id, false)
    }

    pub fn activate(&self, proxy_id: i64) -> crate::Result<()> {
        let conn = self.store.open_session()?;
        proxies::set_active(&conn, proxy_id, true)
    }

    /// A fresh snapshot of pool health: total/active/inactive/blocked counts
    /// plus `active_blocked`, the subset an operator actually needs to act
    /// on. Derived from a single read against the current session, so a
    /// block committed by another process a moment ago is always visible.
    pub fn get_stats(&self) -> crate::Result<ProxyStats> {
        let conn = self.store.open_session()?;
        proxies::stats(&conn, now_unix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_manager() -> (tempfile::TempDir, ProxyManager) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::new(dir.path().join("test.db"), Duration::from_secs(5));
        store.migrate().unwrap();
        let manager = ProxyManager::new(store, Duration::from_secs(300));
        (dir, manager)
    }

    #[test]
    fn acquire_fails_with_empty_pool() {
        let (_dir, manager) = test_manager();
        let err = manager.acquire().unwrap_err();
        assert!(err.to_string().contains("no leasable proxy"));
    }

    #[test]
    fn acquire_leases_the_only_registered_proxy() {
        let (_dir, manager) = test_manager();
        manager.register("http://proxy-a:8080").unwrap();

        let leased = manager.acquire().unwrap();
        assert_eq!(leased.endpoint, "http://proxy-a:8080");
    }

    #[test]
    fn rate_limited_proxy_becomes_unleasable_until_cooloff_passes() {
        let (_dir, manager) = test_manager();
        let id = manager.register("http://proxy-a:8080").unwrap();

        manager.report_rate_limited(id).unwrap();
        assert!(manager.acquire().is_err());

        manager.unblock(id).unwrap();
        assert!(manager.acquire().is_ok());
    }

    #[test]
    fn deactivated_proxy_is_never_leased() {
        let (_dir, manager) = test_manager();
        let id = manager.register("http://proxy-a:8080").unwrap();
        manager.deactivate(id).unwrap();

        assert!(manager.acquire().is_err());

        manager.activate(id).unwrap();
        assert!(manager.acquire().is_ok());
    }

    #[test]
    fn get_stats_reflects_a_rate_limit_recorded_moments_ago() {
        let (_dir, manager) = test_manager();
        let id = manager.register("http://proxy-a:8080").unwrap();

        manager.report_rate_limited(id).unwrap();

        let stats = manager.get_stats().unwrap();
        assert_eq!(stats.total, 1);
        assert_eq!(stats.active, 1);
        assert_eq!(stats.active_blocked, 1);
    }
}
