//! The parsing worker: leases a check request, fetches the page through a
//! leased proxy, and publishes a classified result for the processor.
//!
//! Stateless between iterations by design — every lease, proxy acquisition,
//! and store update opens its own session, so any number of these can run
//! concurrently as a thin, cloneable shell around a shared client rather
//! than a stateful actor.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use shared::bus::{Bus, Delivery};
use shared::fetcher::{FetchOutcome, Fetcher};
use shared::model::{CheckRequest, CheckResult, CheckResultKind};
use shared::proxy_manager::ProxyManager;
use shared::retry::RetryPolicy;
use tracing::{debug, info, warn};

pub struct ParsingWorker {
    bus: Bus,
    proxy_manager: ProxyManager,
    fetcher: Arc<dyn Fetcher>,
    fetch_retry_policy: RetryPolicy,
    lease_duration: Duration,
    poll_interval: Duration,
}

impl ParsingWorker {
    pub fn new(bus: Bus, proxy_manager: ProxyManager, fetcher: Arc<dyn Fetcher>, poll_interval: Duration) -> Self {
        Self {
            bus,
            proxy_manager,
            fetcher,
            fetch_retry_policy: RetryPolicy::worker_fetch_retry(),
            lease_duration: Duration::from_secs(60),
            poll_interval,
        }
    }

    /// Runs until `shutdown` fires, leasing and handling one check request
    /// per iteration, or sleeping briefly when the request queue is empty.
    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("parsing worker shutting down");
                    return;
                }
                _ = self.run_once_or_sleep() => {}
            }
        }
    }

    async fn run_once_or_sleep(&self) {
        match self.bus.lease_check_request(self.lease_duration) {
            Ok(Some(delivery)) => self.handle(delivery).await,
            Ok(None) => tokio::time::sleep(self.poll_interval).await,
            Err(e) => {
                warn!(error = %e, "failed to lease check request");
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    async fn handle(&self, delivery: Delivery<CheckRequest>) {
        let request = &delivery.message;

        let leased_proxy = match self.proxy_manager.acquire() {
            Ok(p) => p,
            Err(e) => {
                debug!(task_id = request.task_id, error = %e, "no proxy available, redelivering request");
                self.nack(delivery.row_id, &e.to_string());
                return;
            }
        };

        let outcome = self.fetcher.fetch(&request.url, &leased_proxy.endpoint).await;

        match outcome {
            FetchOutcome::Ok(listings) => {
                if let Err(e) = self.proxy_manager.report_success(leased_proxy.id) {
                    warn!(error = %e, "failed to record proxy success");
                }
                self.publish_result_and_ack(delivery.row_id, request, true, None, Some(listings));
            }
            FetchOutcome::RateLimited => {
                if let Err(e) = self.proxy_manager.report_rate_limited(leased_proxy.id) {
                    warn!(error = %e, "failed to record proxy rate-limit");
                }
                self.nack_or_publish_failure(&delivery, request, CheckResultKind::RateLimited, "rate limited");
            }
            FetchOutcome::Upstream5xx => {
                if let Err(e) = self.proxy_manager.report_transport_failure(leased_proxy.id) {
                    warn!(error = %e, "failed to record proxy failure");
                }
                self.nack_or_publish_failure(&delivery, request, CheckResultKind::Transport, "upstream 5xx");
            }
            FetchOutcome::Transport(e) => {
                if let Err(e) = self.proxy_manager.report_transport_failure(leased_proxy.id) {
                    warn!(error = %e, "failed to record proxy failure");
                }
                self.nack_or_publish_failure(&delivery, request, CheckResultKind::Transport, &e);
            }
            FetchOutcome::Parse(e) => {
                warn!(task_id = request.task_id, error = %e, "listing parse failure");
                self.publish_result_and_ack(delivery.row_id, request, false, Some(CheckResultKind::Parse), None);
            }
        }
    }

    /// Redelivers the request if the worker's own fetch-retry schedule
    /// (1s/2s/4s, up to 3 attempts) still allows another try; otherwise the
    /// failure becomes a terminal `CheckResult` so the result processor's
    /// `total_checks` counter still advances for work that was genuinely
    /// attempted and exhausted, rather than silently vanishing into the
    /// bus's own `failed` status.
    fn nack_or_publish_failure(&self, delivery: &Delivery<CheckRequest>, request: &CheckRequest, kind: CheckResultKind, error: &str) {
        if self.fetch_retry_policy.delay_for(delivery.attempt).is_some() {
            self.nack(delivery.row_id, error);
        } else {
            warn!(task_id = request.task_id, kind = ?kind, "exhausted redelivery attempts, publishing terminal failure");
            self.publish_result_and_ack(delivery.row_id, request, false, Some(kind), None);
        }
    }

    fn publish_result_and_ack(
        &self,
        row_id: i64,
        request: &CheckRequest,
        ok: bool,
        kind: Option<CheckResultKind>,
        listings: Option<Vec<shared::model::Listing>>,
    ) {
        let result = CheckResult {
            task_id: request.task_id,
            correlation_id: request.correlation_id,
            ok,
            kind,
            listings,
            fetched_at: Utc::now().to_rfc3339(),
        };

        if let Err(e) = self.bus.publish_check_result(&result) {
            warn!(error = %e, "failed to publish check result");
            self.nack(row_id, &e.to_string());
            return;
        }

        if let Err(e) = self.bus.ack_check_request(row_id) {
            warn!(error = %e, "failed to ack check request");
        }
    }

    fn nack(&self, row_id: i64, error: &str) {
        if let Err(e) = self.bus.nack_check_request(row_id, &self.fetch_retry_policy, error) {
            warn!(error = %e, "failed to nack check request");
        }
    }
}
