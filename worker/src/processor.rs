//! The result processor: turns classified check results into de-duplicated
//! match notifications.
//!
//! Like [`crate::worker::ParsingWorker`], every iteration opens its own
//! store session — there is no processor-local cache of tasks or matches,
//! so a task edited by the admin CLI mid-flight is always read fresh.

use std::sync::Arc;
use std::time::Duration;

use shared::bus::{Bus, Delivery};
use shared::fingerprint;
use shared::model::{CheckResult, MatchNotification};
use shared::notifier::Notifier;
use shared::retry::RetryPolicy;
use shared::store::{found_items, tasks, Store};
use tracing::{debug, info, warn};

pub struct ResultProcessor {
    store: Store,
    bus: Bus,
    notifier: Arc<dyn Notifier>,
    redelivery_policy: RetryPolicy,
    lease_duration: Duration,
    poll_interval: Duration,
}

impl ResultProcessor {
    pub fn new(store: Store, bus: Bus, notifier: Arc<dyn Notifier>, poll_interval: Duration) -> Self {
        Self {
            store,
            bus,
            notifier,
            redelivery_policy: RetryPolicy::bus_redelivery(),
            lease_duration: Duration::from_secs(60),
            poll_interval,
        }
    }

    pub async fn run(self, mut shutdown: tokio::sync::broadcast::Receiver<()>) {
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("result processor shutting down");
                    return;
                }
                _ = self.run_once_or_sleep() => {}
            }
        }
    }

    async fn run_once_or_sleep(&self) {
        match self.bus.lease_check_result(self.lease_duration) {
            Ok(Some(delivery)) => self.handle(delivery).await,
            Ok(None) => tokio::time::sleep(self.poll_interval).await,
            Err(e) => {
                warn!(error = %e, "failed to lease check result");
                tokio::time::sleep(self.poll_interval).await;
            }
        }
    }

    async fn handle(&self, delivery: Delivery<CheckResult>) {
        let result = &delivery.message;

        let task = match self.store.open_session().and_then(|conn| tasks::get_task(&conn, result.task_id)) {
            Ok(Some(task)) if task.is_active => task,
            Ok(_) => {
                debug!(task_id = result.task_id, "task inactive or deleted, dropping result");
                self.ack(delivery.row_id);
                return;
            }
            Err(e) => {
                warn!(error = %e, "failed to load task for check result");
                self.nack(delivery.row_id, &e.to_string());
                return;
            }
        };

        // Counts completed work, separately from the scheduler's own
        // next_check/last_check book-keeping, so a check that was issued but
        // never produced a result never gets counted.
        if let Err(e) = self.store.open_session().and_then(|conn| tasks::increment_total_checks(&conn, task.id)) {
            warn!(error = %e, "failed to increment total_checks");
            self.nack(delivery.row_id, &e.to_string());
            return;
        }

        if !result.ok {
            debug!(task_id = result.task_id, kind = ?result.kind, "dropping failed check result, nothing to process");
            self.ack(delivery.row_id);
            return;
        }

        for listing in result.listings.iter().flatten() {
            if !task.filters.matches(listing) {
                continue;
            }

            let listing_fingerprint = fingerprint::fingerprint(task.id, listing);
            let raw_summary = format!("{} @ {} cents", listing.item_name, listing.price_cents);

            let conn = match self.store.open_session() {
                Ok(conn) => conn,
                Err(e) => {
                    warn!(error = %e, "failed to open session to record found item");
                    self.nack(delivery.row_id, &e.to_string());
                    return;
                }
            };

            let first_sighting =
                match found_items::record_match(&conn, task.id, &listing_fingerprint, listing.price_cents, &raw_summary) {
                    Ok(first) => first,
                    Err(e) => {
                        warn!(error = %e, "failed to record found item");
                        self.nack(delivery.row_id, &e.to_string());
                        return;
                    }
                };

            if first_sighting {
                let notification = MatchNotification {
                    task_id: task.id,
                    owner_id: task.owner_id.clone(),
                    task_name: task.name.clone(),
                    item_name: listing.item_name.clone(),
                    price_cents: listing.price_cents,
                    listing_fingerprint,
                };
                self.notifier.notify(&notification).await;
            }
        }

        self.ack(delivery.row_id);
    }

    fn ack(&self, row_id: i64) {
        if let Err(e) = self.bus.ack_check_result(row_id) {
            warn!(error = %e, "failed to ack check result");
        }
    }

    fn nack(&self, row_id: i64, error: &str) {
        if let Err(e) = self.bus.nack_check_result(row_id, &self.redelivery_policy, error) {
            warn!(error = %e, "failed to nack check result");
        }
    }
}
