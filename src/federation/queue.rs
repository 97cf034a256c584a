//! Persisted delivery queue
//!
//! Jobs live in the `delivery_jobs` table. A single poller leases due jobs
//! and hands each to a task holding one permit of a bounded semaphore, so
//! at most `delivery_workers` POSTs are in flight. A job whose worker dies
//! becomes due again once its lease expires.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinHandle;

use super::delivery::ActivityDelivery;
use crate::config::FederationConfig;
use crate::data::{DeliveryJob, DomainStore};
use crate::error::AppError;
use crate::metrics::{DELIVERIES_TOTAL, DELIVERY_DURATION_SECONDS, DELIVERY_WORKERS_BUSY};

/// What happened to a job after one attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Delivered,
    /// Transient failure, scheduled again
    Retrying,
    /// Permanent failure, attempts exhausted, or unusable sender
    Dropped,
}

impl JobOutcome {
    fn as_str(&self) -> &'static str {
        match self {
            Self::Delivered => "success",
            Self::Retrying => "retry",
            Self::Dropped => "dropped",
        }
    }
}

/// Delay before retry number `attempt` (0-based), without jitter
///
/// `min(base * 2^attempt, max)`
pub fn backoff_delay(attempt: u32, base_secs: u64, max_secs: u64) -> Duration {
    let factor = 2u64.saturating_pow(attempt);
    Duration::from_secs(base_secs.saturating_mul(factor).min(max_secs))
}

/// Add up to 25% random jitter
fn with_jitter(delay: Duration) -> Duration {
    let max_jitter_ms = (delay.as_millis() / 4) as u64;
    if max_jitter_ms == 0 {
        return delay;
    }
    delay + Duration::from_millis(rand::thread_rng().gen_range(0..=max_jitter_ms))
}

pub struct DeliveryQueue {
    store: Arc<dyn DomainStore>,
    delivery: ActivityDelivery,
    config: Arc<FederationConfig>,
    notify: Notify,
    permits: Arc<Semaphore>,
}

impl DeliveryQueue {
    pub fn new(
        store: Arc<dyn DomainStore>,
        http_client: Arc<reqwest::Client>,
        config: Arc<FederationConfig>,
    ) -> Self {
        Self {
            delivery: ActivityDelivery::new(http_client, config.clone()),
            permits: Arc::new(Semaphore::new(config.delivery_workers)),
            notify: Notify::new(),
            store,
            config,
        }
    }

    /// Persist a job and wake the poller
    pub async fn enqueue(&self, job: DeliveryJob) -> Result<(), AppError> {
        self.store.enqueue_delivery(&job).await?;
        self.notify.notify_one();
        Ok(())
    }

    /// Start the poller. Runs until the runtime shuts down.
    pub fn start(self: &Arc<Self>) -> JoinHandle<()> {
        let queue = self.clone();
        tokio::spawn(async move {
            tracing::info!(
                workers = queue.config.delivery_workers,
                "Delivery queue started"
            );
            let poll = Duration::from_secs(queue.config.queue_poll_interval_secs);
            loop {
                if let Err(error) = queue.dispatch_due().await {
                    tracing::error!(%error, "Failed to lease delivery jobs");
                }
                tokio::select! {
                    _ = queue.notify.notified() => {}
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        })
    }

    /// Lease as many due jobs as there are idle workers and start them
    ///
    /// Returns the number of jobs started.
    pub async fn dispatch_due(self: &Arc<Self>) -> Result<usize, AppError> {
        let mut started = 0;
        loop {
            let idle = self.permits.available_permits();
            if idle == 0 {
                break;
            }

            let jobs = self.lease(idle as i64).await?;
            if jobs.is_empty() {
                break;
            }

            for job in jobs {
                let permit = match self.permits.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return Ok(started),
                };
                let queue = self.clone();
                tokio::spawn(async move {
                    queue.process(job).await;
                    drop(permit);
                    // A freed worker may have due jobs waiting
                    queue.notify.notify_one();
                });
                started += 1;
            }
        }
        Ok(started)
    }

    /// Process every due job and wait for the attempts to finish
    ///
    /// Used by callers that need delivery to have happened before moving
    /// on, and by tests.
    pub async fn drain(&self) -> Result<Vec<JobOutcome>, AppError> {
        let mut outcomes = Vec::new();
        loop {
            let jobs = self.lease(self.config.delivery_workers as i64).await?;
            if jobs.is_empty() {
                return Ok(outcomes);
            }
            let attempts = jobs.into_iter().map(|job| self.process(job));
            outcomes.extend(futures::future::join_all(attempts).await);
        }
    }

    async fn lease(&self, limit: i64) -> Result<Vec<DeliveryJob>, AppError> {
        let now = Utc::now();
        let lease = chrono::Duration::from_std(self.config.request_timeout() * 2)
            .unwrap_or_else(|_| chrono::Duration::seconds(60))
            + chrono::Duration::seconds(30);
        self.store
            .claim_due_deliveries(now, now + lease, limit)
            .await
    }

    /// Attempt one job and record the result
    ///
    /// Never returns an error: failures are logged and the job is either
    /// rescheduled or removed.
    pub async fn process(&self, job: DeliveryJob) -> JobOutcome {
        DELIVERY_WORKERS_BUSY.inc();
        let started = Instant::now();
        let outcome = self.attempt(&job).await;
        DELIVERY_WORKERS_BUSY.dec();

        DELIVERIES_TOTAL
            .with_label_values(&[outcome.as_str()])
            .inc();
        DELIVERY_DURATION_SECONDS
            .with_label_values(&[outcome.as_str()])
            .observe(started.elapsed().as_secs_f64());

        outcome
    }

    async fn attempt(&self, job: &DeliveryJob) -> JobOutcome {
        let sender = match self.store.get_actor(&job.sender).await {
            Ok(Some(sender)) if sender.local && sender.private_key_pem.is_some() => sender,
            Ok(_) => {
                tracing::error!(
                    job = %job.id,
                    sender = %job.sender,
                    "Dropping delivery: sender is not a local actor with a private key (configuration error)"
                );
                return self.drop_job(job).await;
            }
            Err(error) => {
                tracing::warn!(job = %job.id, %error, "Could not load sender, retrying");
                return self.retry_or_drop(job, &error).await;
            }
        };

        match self
            .delivery
            .deliver(&sender, &job.inbox, job.activity.as_bytes())
            .await
        {
            Ok(()) => {
                tracing::debug!(job = %job.id, inbox = %job.inbox, "Delivered activity");
                if let Err(error) = self.store.complete_delivery(&job.id).await {
                    tracing::error!(job = %job.id, %error, "Failed to remove delivered job");
                }
                JobOutcome::Delivered
            }
            Err(error) if error.is_retryable() => self.retry_or_drop(job, &error).await,
            Err(error) => {
                tracing::warn!(
                    job = %job.id,
                    inbox = %job.inbox,
                    %error,
                    "Permanent delivery failure, dropping job"
                );
                self.drop_job(job).await
            }
        }
    }

    async fn retry_or_drop(&self, job: &DeliveryJob, error: &AppError) -> JobOutcome {
        let attempts = job.attempts + 1;
        if attempts >= i64::from(self.config.max_delivery_attempts) {
            tracing::warn!(
                job = %job.id,
                inbox = %job.inbox,
                attempts,
                %error,
                "Delivery attempts exhausted, dropping job"
            );
            return self.drop_job(job).await;
        }

        let delay = with_jitter(backoff_delay(
            job.attempts.max(0) as u32,
            self.config.base_backoff_secs,
            self.config.max_backoff_secs,
        ));
        let next_attempt_at = Utc::now()
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::hours(1));

        tracing::info!(
            job = %job.id,
            inbox = %job.inbox,
            attempts,
            retry_in_secs = delay.as_secs(),
            %error,
            "Delivery failed, will retry"
        );

        match self
            .store
            .reschedule_delivery(&job.id, attempts, next_attempt_at)
            .await
        {
            Ok(()) => JobOutcome::Retrying,
            Err(error) => {
                // The lease expires on its own and the job is retried then
                tracing::error!(job = %job.id, %error, "Failed to reschedule delivery");
                JobOutcome::Retrying
            }
        }
    }

    async fn drop_job(&self, job: &DeliveryJob) -> JobOutcome {
        if let Err(error) = self.store.complete_delivery(&job.id).await {
            tracing::error!(job = %job.id, %error, "Failed to remove dropped job");
        }
        JobOutcome::Dropped
    }
}
