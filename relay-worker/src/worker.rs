use std::sync::Arc;
use std::time;

use relay_common::health::HealthHandle;
use relay_common::retry::RetryPolicy;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::client::{DeliveryClient, DeliveryOutcome};
use crate::encoder::PayloadEncoder;
use crate::queue::{DeliveryQueue, PendingItem};
use crate::resolver::EndpointResolver;

/// How often liveness is reported while idle or paused.
const HEARTBEAT_INTERVAL: time::Duration = time::Duration::from_secs(5);

/// A single worker draining a `DeliveryQueue` one item at a time, in order.
pub struct DeliveryWorker {
    queue: Arc<DeliveryQueue>,
    resolver: Arc<EndpointResolver>,
    encoder: PayloadEncoder,
    client: Arc<dyn DeliveryClient>,
    /// Minimum time between a successful delivery and the next attempt.
    delivery_interval: time::Duration,
    retry_policy: RetryPolicy,
    liveness: Option<HealthHandle>,
}

impl DeliveryWorker {
    pub fn new(
        queue: Arc<DeliveryQueue>,
        resolver: Arc<EndpointResolver>,
        encoder: PayloadEncoder,
        client: Arc<dyn DeliveryClient>,
    ) -> Self {
        Self {
            queue,
            resolver,
            encoder,
            client,
            delivery_interval: time::Duration::from_secs(1),
            retry_policy: RetryPolicy::default(),
            liveness: None,
        }
    }

    pub fn delivery_interval(mut self, interval: time::Duration) -> Self {
        self.delivery_interval = interval;
        self
    }

    pub fn retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    pub fn liveness(mut self, liveness: HealthHandle) -> Self {
        self.liveness = Some(liveness);
        self
    }

    /// Deliver queued items until `shutdown` is cancelled. An attempt already in flight is
    /// allowed to finish, but waits between attempts are cut short.
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_ms = self.delivery_interval.as_millis() as u64,
            "delivery worker started"
        );
        let mut last_invalid = None;

        loop {
            self.report_healthy();

            let item = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                item = self.queue.wait_for_head() => item,
                _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => continue,
            };

            if let Some(wait) = self.deliver(&item, &mut last_invalid).await {
                if !self.pause(wait, &shutdown).await {
                    break;
                }
            }
        }

        info!(pending = self.queue.len(), "delivery worker stopped");
    }

    /// Make one delivery attempt for `item` and settle its fate. Returns how long to wait
    /// before the next attempt, if at all.
    ///
    /// `last_invalid` holds the id of the item whose previous attempt hit an invalid endpoint,
    /// so a second 404 in a row backs off instead of refreshing in a tight loop.
    async fn deliver(
        &self,
        item: &PendingItem,
        last_invalid: &mut Option<u64>,
    ) -> Option<time::Duration> {
        let endpoint = self.resolver.current().await;

        let payload = match self.encoder.encode(&item.record, &endpoint.overrides) {
            Ok(payload) => payload,
            Err(error) => {
                self.give_up(item, item.attempts, "unencodable", &error.to_string());
                return None;
            }
        };

        // The item may have been evicted by an overflowing producer.
        let attempt = self.queue.record_attempt(item.id)?;

        let now = tokio::time::Instant::now();
        let outcome = self.client.send(&endpoint, &payload).await;
        let elapsed = now.elapsed().as_secs_f64();

        let labels = [("outcome", outcome.label())];
        metrics::counter!("webhook_relay_deliveries_total", &labels).increment(1);
        metrics::histogram!("webhook_relay_delivery_duration_seconds", &labels).record(elapsed);

        let repeated_invalid = match outcome {
            DeliveryOutcome::EndpointInvalid => last_invalid.replace(item.id) == Some(item.id),
            _ => {
                *last_invalid = None;
                false
            }
        };

        match outcome {
            DeliveryOutcome::Success => {
                self.queue.remove(item.id);
                debug!(
                    item_id = item.id,
                    attempt,
                    host = endpoint.host(),
                    queued_ms = item.enqueued_at.elapsed().as_millis() as u64,
                    "record delivered"
                );
                Some(self.delivery_interval)
            }
            DeliveryOutcome::EndpointInvalid => {
                warn!(
                    item_id = item.id,
                    attempt,
                    host = endpoint.host(),
                    "webhook endpoint not found, refreshing configuration"
                );
                self.resolver.invalidate();

                if self.retry_policy.is_exhausted(attempt) {
                    self.give_up(item, attempt, "max_attempts", "webhook endpoint not found");
                    None
                } else if repeated_invalid {
                    Some(self.retry_policy.retry_interval(attempt, None))
                } else {
                    None
                }
            }
            DeliveryOutcome::RetryableFailure {
                status,
                retry_after,
                reason,
            } => {
                if self.retry_policy.is_exhausted(attempt) {
                    self.give_up(item, attempt, "max_attempts", &reason);
                    return None;
                }

                let interval = self.retry_policy.retry_interval(attempt, retry_after);
                warn!(
                    item_id = item.id,
                    attempt,
                    status = status.map(|status| status.as_u16()),
                    retry_in_ms = interval.as_millis() as u64,
                    "delivery failed: {}",
                    reason
                );
                Some(interval)
            }
            DeliveryOutcome::PermanentFailure(reason) => {
                self.give_up(item, attempt, "permanent_failure", &reason);
                None
            }
        }
    }

    fn give_up(&self, item: &PendingItem, attempts: u32, reason: &'static str, detail: &str) {
        if self.queue.remove(item.id).is_none() {
            return;
        }

        metrics::counter!("webhook_relay_items_dropped_total", "reason" => reason).increment(1);
        error!(
            item_id = item.id,
            attempts,
            reason,
            "dropping record: {}",
            detail
        );
    }

    /// Sleep for `duration` unless shut down first. Returns false on shutdown.
    async fn pause(&self, duration: time::Duration, shutdown: &CancellationToken) -> bool {
        let deadline = tokio::time::Instant::now() + duration;

        loop {
            self.report_healthy();

            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return true;
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => return false,
                _ = tokio::time::sleep(remaining.min(HEARTBEAT_INTERVAL)) => {}
            }
        }
    }

    fn report_healthy(&self) {
        if let Some(liveness) = &self.liveness {
            liveness.report_healthy();
        }
    }
}
