use crate::{
    policy::{Access, AccessPolicy},
    search::{SearchError, SearchIndex},
    Delivery, Error, Forbidden, Notifier, SchedulerConfig,
};
use chrono::{DateTime, Utc};
use models::{Alert, AlertState, Cadence, Checkpoints, Id, PendingNotice};

/// Consecutive index failures after which an alert's failures are escalated
/// to operators.
pub const ESCALATE_AFTER_FAILURES: u32 = 3;

/// RunOutcome is the result of running one alert through the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// A batch of new documents was accepted by the Notifier and committed.
    Notified { documents: usize },
    /// The query ran, but matched no documents which weren't already notified.
    NothingNew,
    /// The alert isn't due. Only its pending notices, if any, were delivered.
    NotDue,
    /// The alert isn't active.
    Inactive,
    /// A real-time alert's owner no longer qualifies, and it was demoted.
    Demoted { to: Cadence },
    /// The alert's query is rejected by the index, and wasn't run.
    QueryError,
    /// The index was unavailable, and the alert will be retried after a backoff.
    IndexUnavailable { failures: u32, escalated: bool },
    /// Access of the alert's owner could not be determined. Retried next pass.
    PolicyUnavailable,
    /// The Notifier didn't accept the batch. Nothing was committed, and the
    /// same documents are attempted again on the next run.
    Rejected { reason: String },
}

impl RunOutcome {
    pub fn name(&self) -> &'static str {
        match self {
            RunOutcome::Notified { .. } => "notified",
            RunOutcome::NothingNew => "nothing_new",
            RunOutcome::NotDue => "not_due",
            RunOutcome::Inactive => "inactive",
            RunOutcome::Demoted { .. } => "demoted",
            RunOutcome::QueryError => "query_error",
            RunOutcome::IndexUnavailable { .. } => "index_unavailable",
            RunOutcome::PolicyUnavailable => "policy_unavailable",
            RunOutcome::Rejected { .. } => "rejected",
        }
    }
}

/// Whether an alert runs because the scheduler found it due,
/// or because its owner asked for it to run now.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Trigger {
    Scheduled,
    Manual,
}

/// Engine runs alerts through the notification pipeline.
pub struct Engine<I, N, P> {
    pool: sqlx::SqlitePool,
    index: I,
    notifier: N,
    policy: P,
    config: SchedulerConfig,
}

impl<I: SearchIndex, N: Notifier, P: AccessPolicy> Engine<I, N, P> {
    pub fn new(
        pool: sqlx::SqlitePool,
        index: I,
        notifier: N,
        policy: P,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            pool,
            index,
            notifier,
            policy,
            config,
        }
    }

    pub fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }
    pub fn index(&self) -> &I {
        &self.index
    }
    pub fn notifier(&self) -> &N {
        &self.notifier
    }
    pub fn policy(&self) -> &P {
        &self.policy
    }
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }
    pub fn checkpoints(&self) -> Checkpoints {
        self.config.checkpoints()
    }

    /// Run `alert`, which `worker` has leased, through the pipeline at `now`.
    ///
    /// Errors are failures of the alert store, including a lease which was
    /// taken by another worker before the run's results were recorded.
    /// Every other failure is classified into the returned RunOutcome.
    /// In either case the alert is left in a state from which a later run
    /// completes the work.
    pub async fn run_alert(
        &self,
        alert: Alert,
        worker: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RunOutcome> {
        self.evaluate(alert, worker, now, Trigger::Scheduled).await
    }

    /// Run an alert on behalf of its owner, whether or not it's due.
    /// Failures are returned as errors the owner can act upon.
    pub async fn run_alert_now(
        &self,
        alert_id: Id,
        caller: uuid::Uuid,
        now: DateTime<Utc>,
    ) -> crate::Result<RunOutcome> {
        let Some(alert) = alerts_sql::fetch_alert(alert_id, &self.pool).await? else {
            return Err(Error::NotFound(alert_id));
        };
        if alert.owner.id != caller {
            return Err(Error::Forbidden(Forbidden::NotOwner(alert_id)));
        }
        match alert.state {
            AlertState::Active => (),
            AlertState::Paused => return Err(Error::Validation("alert is paused".to_string())),
            AlertState::Disabled => {
                return Err(Error::Validation("alert is disabled".to_string()))
            }
        }

        let worker = format!("manual-{}", uuid::Uuid::new_v4());
        let expires_at = now + self.config.lease_ttl_chrono()?;
        if !alerts_sql::try_acquire_lease(alert_id, &worker, now, expires_at, &self.pool).await? {
            return Err(Error::ConcurrentModification(alert_id));
        }

        let outcome = self.evaluate(alert, &worker, now, Trigger::Manual).await;
        if let Err(error) = alerts_sql::release_lease(alert_id, &worker, &self.pool).await {
            tracing::warn!(%alert_id, ?error, "failed to release manual alert lease");
        }

        let outcome = outcome.map_err(|err| match err.downcast::<alerts_sql::Error>() {
            Ok(err) => Error::from(err),
            Err(err) => Error::Internal(err),
        })?;

        match outcome {
            RunOutcome::IndexUnavailable { failures, .. } => Err(Error::IndexUnavailable(
                anyhow::anyhow!("search index failed {failures} consecutive times"),
            )),
            RunOutcome::QueryError => {
                let message = alerts_sql::fetch_alert(alert_id, &self.pool)
                    .await?
                    .and_then(|alert| alert.query_error)
                    .unwrap_or_default();
                Err(Error::QuerySyntax(message))
            }
            RunOutcome::Rejected { reason } => Err(Error::DeliveryRejected(reason)),
            outcome => Ok(outcome),
        }
    }

    #[tracing::instrument(
        skip_all,
        fields(alert_id = %alert.id, cadence = %alert.cadence, ?trigger)
    )]
    async fn evaluate(
        &self,
        mut alert: Alert,
        worker: &str,
        now: DateTime<Utc>,
        trigger: Trigger,
    ) -> anyhow::Result<RunOutcome> {
        if alert.state != AlertState::Active {
            return Ok(RunOutcome::Inactive);
        }

        // Step 0: notices are delivered before, and independent of, any run.
        for pending in std::mem::take(&mut alert.notices) {
            self.flush_notice(&alert, &pending).await?;
        }
        if alert.query_error.is_some() {
            return Ok(RunOutcome::QueryError);
        }
        if trigger == Trigger::Scheduled {
            let backing_off = alert.retry_at.is_some_and(|retry_at| retry_at > now);
            let due = self
                .checkpoints()
                .is_due(alert.cadence, alert.last_evaluated(), now);

            if backing_off || !due {
                return Ok(RunOutcome::NotDue);
            }
        }

        // Step 1: real-time access is re-validated on every run.
        if alert.cadence.is_gated() {
            match self.policy.can_use(alert.owner.id, alert.cadence).await {
                Ok(Access::Allowed) => (),
                Ok(Access::Denied) => return self.demote(alert, now).await,
                Err(error) => {
                    tracing::warn!(?error, "failed to check real-time access (will retry)");
                    return Ok(RunOutcome::PolicyUnavailable);
                }
            }
        }

        // Step 2: run the query from the watermark, inclusive.
        let hits = match tokio::time::timeout(
            self.config.search_timeout,
            self.index.run(&alert.query, alert.watermark),
        )
        .await
        {
            Ok(Ok(hits)) => hits,
            Ok(Err(SearchError::QuerySyntax(message))) => {
                return self.query_error(&alert, &message, now).await
            }
            Ok(Err(SearchError::IndexUnavailable(error))) => {
                return self.index_failure(&alert, worker, error, now).await
            }
            Err(_elapsed) => {
                let error = anyhow::anyhow!(
                    "search timed out after {:?}",
                    self.config.search_timeout
                );
                return self.index_failure(&alert, worker, error, now).await;
            }
        };
        let observed = hits.iter().map(|hit| hit.timestamp).max();
        let returned = hits.len();

        // Step 3: drop documents already in the ledger.
        let batch = alerts_sql::unseen_documents(alert.id, hits, &self.pool).await?;

        if batch.is_empty() {
            alerts_sql::record_run(alert.id, worker, observed, false, now, &self.pool).await?;
            tracing::debug!(returned, "alert matched nothing new");
            return Ok(RunOutcome::NothingNew);
        }

        // Step 4: one delivery covers the whole batch.
        let delivery = tokio::time::timeout(
            self.config.notify_timeout,
            self.notifier.deliver(&alert.owner, &alert, &batch),
        )
        .await
        .unwrap_or_else(|_elapsed| {
            Delivery::Rejected(format!(
                "delivery timed out after {:?}",
                self.config.notify_timeout
            ))
        });

        if let Delivery::Rejected(reason) = delivery {
            tracing::warn!(%reason, documents = batch.len(), "alert notification was rejected (will retry)");
            return Ok(RunOutcome::Rejected { reason });
        }

        // Step 5: record delivered documents and advance the watermark together.
        alerts_sql::commit_delivery(alert.id, worker, &batch, observed, now, &self.pool).await?;

        tracing::info!(
            documents = batch.len(),
            returned,
            "notified owner of new documents"
        );
        Ok(RunOutcome::Notified {
            documents: batch.len(),
        })
    }

    /// Deliver a pending notice to the owner of `alert`, clearing it once accepted.
    async fn flush_notice(&self, alert: &Alert, pending: &PendingNotice) -> anyhow::Result<bool> {
        let notice = &pending.notice;
        let delivery = tokio::time::timeout(
            self.config.notify_timeout,
            self.notifier.notice(&alert.owner, alert, pending),
        )
        .await
        .unwrap_or_else(|_elapsed| Delivery::Rejected("notice delivery timed out".to_string()));

        match delivery {
            Delivery::Accepted => {
                alerts_sql::clear_notice(alert.id, pending, &self.pool).await?;
                tracing::info!(?notice, "delivered alert notice");
                Ok(true)
            }
            Delivery::Rejected(reason) => {
                tracing::warn!(?notice, %reason, "alert notice was rejected (will retry)");
                Ok(false)
            }
        }
    }

    async fn demote(&self, mut alert: Alert, now: DateTime<Utc>) -> anyhow::Result<RunOutcome> {
        let to = Cadence::Daily;

        let Some(notice) = alerts_sql::demote_alert(alert.id, to, now, &self.pool).await? else {
            // Another writer changed the cadence first.
            return Ok(RunOutcome::NotDue);
        };
        tracing::info!(%to, "owner no longer qualifies for real-time alerts");

        alert.cadence = to;
        self.flush_notice(&alert, &notice).await?;
        Ok(RunOutcome::Demoted { to })
    }

    async fn query_error(
        &self,
        alert: &Alert,
        message: &str,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RunOutcome> {
        tracing::warn!(%message, "search index rejected alert query");

        let mut alert = alert.clone();
        alert.query_error = Some(message.to_string());

        if let Some(notice) =
            alerts_sql::record_query_error(alert.id, message, now, &self.pool).await?
        {
            self.flush_notice(&alert, &notice).await?;
        }
        Ok(RunOutcome::QueryError)
    }

    async fn index_failure(
        &self,
        alert: &Alert,
        worker: &str,
        error: anyhow::Error,
        now: DateTime<Utc>,
    ) -> anyhow::Result<RunOutcome> {
        let backoff = self.config.retry_backoff(alert.index_failures + 1);
        let retry_at = now + chrono::Duration::from_std(backoff)?;

        let failures =
            alerts_sql::record_index_failure(alert.id, worker, retry_at, now, &self.pool).await?;
        let escalated = failures >= ESCALATE_AFTER_FAILURES;

        if escalated {
            tracing::error!(
                ?error,
                failures,
                %retry_at,
                "search index has been unavailable for alert repeatedly"
            );
        } else {
            tracing::warn!(?error, failures, %retry_at, "search index is unavailable (will retry)");
        }
        Ok(RunOutcome::IndexUnavailable {
            failures,
            escalated,
        })
    }
}
