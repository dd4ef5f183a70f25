use crate::{pipeline::RunOutcome, AccessPolicy, Engine, Notifier, SearchIndex};
use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::stream::StreamExt;
use models::{Alert, Checkpoints, Id};
use std::sync::Arc;
use std::time::Duration;

/// Configuration of the alert scheduler and its per-alert pipeline.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct SchedulerConfig {
    /// Interval between scheduler passes. Real-time alerts are evaluated
    /// once per pass.
    #[serde(with = "humantime_serde")]
    pub poll_interval: Duration,
    /// Duration of an alert lease. Leases are renewed at half this interval
    /// while an alert is being processed.
    #[serde(with = "humantime_serde")]
    pub lease_ttl: Duration,
    /// Maximum number of alerts processed concurrently.
    pub permits: u32,
    /// Maximum number of alerts leased by one pass.
    pub batch_limit: u32,
    /// UTC hour of day at which daily, weekly and monthly checkpoints fall.
    pub checkpoint_hour: u32,
    #[serde(with = "humantime_serde")]
    pub search_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub notify_timeout: Duration,
    /// Backoff after the first consecutive index failure of an alert.
    /// It doubles with each further failure, up to `max_retry_backoff`.
    #[serde(with = "humantime_serde")]
    pub retry_backoff: Duration,
    #[serde(with = "humantime_serde")]
    pub max_retry_backoff: Duration,
    /// Notification records older than this are pruned.
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            lease_ttl: Duration::from_secs(120),
            permits: 8,
            batch_limit: 500,
            checkpoint_hour: 0,
            search_timeout: Duration::from_secs(30),
            notify_timeout: Duration::from_secs(30),
            retry_backoff: Duration::from_secs(60),
            max_retry_backoff: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(365 * 24 * 60 * 60),
        }
    }
}

impl SchedulerConfig {
    pub fn checkpoints(&self) -> Checkpoints {
        Checkpoints::at_hour(self.checkpoint_hour)
    }

    /// Backoff before retrying an alert after its `failures`'th consecutive
    /// index failure, jittered by 10% in either direction.
    pub fn retry_backoff(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        let backoff = self
            .retry_backoff
            .saturating_mul(1 << exponent)
            .min(self.max_retry_backoff);

        let jitter = 0.9 + rand::random::<f64>() * 0.2; // [0.9, 1.1)
        backoff.mul_f64(jitter)
    }

    pub(crate) fn lease_ttl_chrono(&self) -> anyhow::Result<chrono::Duration> {
        chrono::Duration::from_std(self.lease_ttl).context("lease TTL is out of range")
    }
}

/// PassSummary tallies the outcomes of one scheduler pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct PassSummary {
    /// Alerts which were leased and processed.
    pub leased: usize,
    /// Alerts which notified their owner.
    pub notified: usize,
    /// Documents notified across all alerts.
    pub documents: usize,
    pub demoted: usize,
    pub index_failures: usize,
    pub rejected: usize,
    /// Alerts whose processing failed with an error, or lost its lease.
    pub failed: usize,
    /// Notification records pruned.
    pub pruned: u64,
}

impl PassSummary {
    fn add(&mut self, outcome: &anyhow::Result<RunOutcome>) {
        self.leased += 1;

        match outcome {
            Ok(RunOutcome::Notified { documents }) => {
                self.notified += 1;
                self.documents += documents;
            }
            Ok(RunOutcome::Demoted { .. }) => self.demoted += 1,
            Ok(RunOutcome::IndexUnavailable { .. }) => self.index_failures += 1,
            Ok(RunOutcome::Rejected { .. }) => self.rejected += 1,
            Ok(_) => (),
            Err(_) => self.failed += 1,
        }
    }
}

/// Server drives scheduler passes over due alerts.
pub struct Server<I, N, P> {
    engine: Arc<Engine<I, N, P>>,
    worker: String,
}

impl<I: SearchIndex, N: Notifier, P: AccessPolicy> Server<I, N, P> {
    /// Build a Server with a unique worker identity, which distinguishes its
    /// leases from those of other Servers sharing the database.
    pub fn new(engine: Arc<Engine<I, N, P>>) -> Self {
        Self {
            engine,
            worker: uuid::Uuid::new_v4().to_string(),
        }
    }

    pub fn worker(&self) -> &str {
        &self.worker
    }

    pub fn engine(&self) -> &Engine<I, N, P> {
        &self.engine
    }

    /// Run a single pass at `now`: lease due alerts, process them
    /// concurrently, and prune expired notification records.
    #[tracing::instrument(skip_all, fields(worker = %self.worker, %now))]
    pub async fn run_pass(&self, now: DateTime<Utc>) -> anyhow::Result<PassSummary> {
        let config = self.engine.config();
        let started = std::time::Instant::now();
        let expires_at = now + config.lease_ttl_chrono()?;

        let alerts = alerts_sql::lease_due_alerts(
            &self.worker,
            &config.checkpoints(),
            now,
            expires_at,
            config.batch_limit,
            self.engine.pool(),
        )
        .await
        .context("leasing due alerts")?;

        let mut summary = PassSummary::default();

        let mut outcomes = futures::stream::iter(alerts)
            .map(|alert| self.process(alert, now, started))
            .buffer_unordered(config.permits.max(1) as usize);

        while let Some((alert_id, outcome)) = outcomes.next().await {
            match &outcome {
                Ok(outcome) => {
                    tracing::debug!(%alert_id, outcome = outcome.name(), "processed alert")
                }
                Err(error) => tracing::warn!(
                    %alert_id,
                    ?error,
                    "alert processing failed and will be retried after its lease expires"
                ),
            }
            summary.add(&outcome);
        }

        let retention = chrono::Duration::from_std(config.retention)
            .context("retention is out of range")?;
        summary.pruned = alerts_sql::prune_notifications(now - retention, self.engine.pool())
            .await
            .context("pruning notification records")?;

        tracing::info!(
            leased = summary.leased,
            notified = summary.notified,
            documents = summary.documents,
            failed = summary.failed,
            "completed scheduler pass"
        );
        Ok(summary)
    }

    /// Serve scheduler passes until signaled to stop by `shutdown`.
    /// A pass which is underway when `shutdown` resolves is completed.
    pub async fn serve(self, shutdown: impl std::future::Future<Output = ()>) {
        tokio::pin!(shutdown);

        loop {
            if let Err(error) = self.run_pass(Utc::now()).await {
                tracing::error!(?error, "scheduler pass failed (will retry)");
            }

            // Jitter passes by 10% in either direction, to spread passes of
            // multiple agents across the interval.
            let jitter = 0.9 + rand::random::<f64>() * 0.2; // [0.9, 1.1)
            let interval = self.engine.config().poll_interval.mul_f64(jitter);

            tokio::select! {
                () = tokio::time::sleep(interval) => (),
                () = &mut shutdown => break,
            }
        }
        tracing::info!(worker = %self.worker, "scheduler signaled to stop");
    }

    async fn process(
        &self,
        alert: Alert,
        now: DateTime<Utc>,
        started: std::time::Instant,
    ) -> (Id, anyhow::Result<RunOutcome>) {
        let alert_id = alert.id;

        let run = self.engine.run_alert(alert, &self.worker, now);
        let heartbeat = self.maintain_lease(alert_id, now, started);
        tokio::pin!(run, heartbeat);

        // Poll the run and its heartbeat in tandem, so that a lost lease
        // also cancels the run.
        let outcome = tokio::select! {
            outcome = &mut run => outcome,
            err = &mut heartbeat => Err(err),
        };

        if let Err(error) =
            alerts_sql::release_lease(alert_id, &self.worker, self.engine.pool()).await
        {
            tracing::warn!(%alert_id, ?error, "failed to release alert lease");
        }
        (alert_id, outcome)
    }

    /// Renew the lease of an alert at half its TTL, forever or until it fails.
    /// Lease expiry is measured from the pass time `now`, so that it stays
    /// consistent with the clock with which the alert was leased.
    async fn maintain_lease(
        &self,
        alert_id: Id,
        now: DateTime<Utc>,
        started: std::time::Instant,
    ) -> anyhow::Error {
        let ttl = self.engine.config().lease_ttl;
        let mut ticks = tokio::time::interval((ttl / 2).max(Duration::from_millis(1)));
        let _instant = ticks.tick().await; // Discard immediate first tick.

        loop {
            let _instant = ticks.tick().await;

            let expires_at = match chrono::Duration::from_std(started.elapsed() + ttl) {
                Ok(extension) => now + extension,
                Err(err) => return anyhow::anyhow!(err).context("lease TTL is out of range"),
            };
            let renew = alerts_sql::renew_lease(alert_id, &self.worker, expires_at, self.engine.pool());

            match tokio::time::timeout(ttl / 4, renew).await {
                Ok(Ok(true)) => (),
                Ok(Ok(false)) => return anyhow::anyhow!("alert lease was taken by another worker"),
                Ok(Err(err)) => return anyhow::anyhow!(err).context("failed to renew alert lease"),
                Err(err) => return anyhow::anyhow!(err).context("timed out renewing alert lease"),
            }
        }
    }
}
