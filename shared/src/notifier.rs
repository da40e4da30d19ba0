//! Delivering match notifications to the outside world.
//!
//! A notification failure must never be allowed to unwind back into the
//! result processor and block de-duplication bookkeeping — by the time
//! `notify` runs, the match has already been durably recorded in
//! `found_items`. So every implementation here only ever logs failures.

use std::time::Duration;

use async_trait::async_trait;
use tracing::warn;

use crate::model::MatchNotification;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &MatchNotification);
}

/// Posts each match as a JSON body to a configured webhook URL. Best-effort:
/// a non-2xx response or a transport error is logged and swallowed.
pub struct WebhookNotifier {
    client: reqwest::Client,
    webhook_url: String,
}

impl WebhookNotifier {
    pub fn new(webhook_url: String, timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| crate::MonitoringError::Config(format!("failed to build webhook client: {e}")))?;
        Ok(Self { client, webhook_url })
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, notification: &MatchNotification) {
        let response = self.client.post(&self.webhook_url).json(notification).send().await;

        match response {
            Ok(resp) if resp.status().is_success() => {}
            Ok(resp) => warn!(
                status = %resp.status(),
                task_id = notification.task_id,
                "webhook notification rejected by receiver"
            ),
            Err(e) => warn!(
                error = %e,
                task_id = notification.task_id,
                "failed to deliver webhook notification"
            ),
        }
    }
}

/// A notifier that only logs — used when no webhook is configured, and in
/// tests.
pub struct LoggingNotifier;

#[async_trait]
impl Notifier for LoggingNotifier {
    async fn notify(&self, notification: &MatchNotification) {
        tracing::info!(
            task_id = notification.task_id,
            item_name = %notification.item_name,
            price_cents = notification.price_cents,
            "match found"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_notification() -> MatchNotification {
        MatchNotification {
            task_id: 1,
            owner_id: "owner-1".to_string(),
            task_name: "AK redlines".to_string(),
            item_name: "AK-47 | Redline".to_string(),
            price_cents: 1500,
            listing_fingerprint: "fp-1".to_string(),
        }
    }

    #[tokio::test]
    async fn logging_notifier_never_panics_on_notify() {
        LoggingNotifier.notify(&sample_notification()).await;
    }

    #[tokio::test]
    async fn webhook_notifier_swallows_connection_errors() {
        // Port 0 never accepts connections; this must not panic or propagate.
        let notifier = WebhookNotifier::new("http://127.0.0.1:0/webhook".to_string(), Duration::from_millis(200)).unwrap();
        notifier.notify(&sample_notification()).await;
    }
}
