use crate::alerts::{alert_columns, AlertRow};
use crate::{to_millis, Error, Result};
use chrono::{DateTime, Utc};
use models::{Alert, Cadence, Checkpoints, Id};

/// Lease up to `limit` active alerts which are due at `now` to `worker`,
/// until `expires_at`. Alerts are leased least-recently-evaluated first.
///
/// An alert is due if it has a pending notice, or if it has no query error,
/// isn't backing off from index failures, and either is real-time or hasn't
/// been evaluated since the latest checkpoint of its cadence.
/// Alerts already leased to another worker are skipped.
#[tracing::instrument(skip(checkpoints, pool), err)]
pub async fn lease_due_alerts(
    worker: &str,
    checkpoints: &Checkpoints,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    limit: u32,
    pool: &sqlx::SqlitePool,
) -> Result<Vec<Alert>> {
    let checkpoint = |cadence| {
        checkpoints
            .latest(cadence, now)
            .map(to_millis)
            .unwrap_or(i64::MIN)
    };
    let now_ms = to_millis(now);
    let expires_ms = to_millis(expires_at);

    let mut txn = pool.begin().await?;

    sqlx::query(
        r#"update alerts set lease_holder = ?, lease_expires_at = ?
        where id in (
            select id from alerts
            where state = 'active'
              and lease_expires_at <= ?
              and (
                notices != '[]'
                or (
                  query_error is null
                  and retry_at <= ?
                  and (
                    cadence = 'real_time'
                    or (cadence = 'daily' and coalesce(last_run_at, created_at) < ?)
                    or (cadence = 'weekly' and coalesce(last_run_at, created_at) < ?)
                    or (cadence = 'monthly' and coalesce(last_run_at, created_at) < ?)
                  )
                )
              )
            order by coalesce(last_run_at, created_at) asc, id asc
            limit ?
        )
        "#,
    )
    .bind(worker)
    .bind(expires_ms)
    .bind(now_ms)
    .bind(now_ms)
    .bind(checkpoint(Cadence::Daily))
    .bind(checkpoint(Cadence::Weekly))
    .bind(checkpoint(Cadence::Monthly))
    .bind(limit as i64)
    .execute(&mut *txn)
    .await?;

    let rows = sqlx::query_as::<_, AlertRow>(concat!(
        "select ",
        alert_columns!(),
        r#" from alerts where lease_holder = ? and lease_expires_at = ?
        order by coalesce(last_run_at, created_at) asc, id asc"#
    ))
    .bind(worker)
    .bind(expires_ms)
    .fetch_all(&mut *txn)
    .await?;

    txn.commit().await?;

    let alerts = rows
        .into_iter()
        .map(Alert::try_from)
        .collect::<anyhow::Result<Vec<_>>>()
        .map_err(Error::Codec)?;

    if !alerts.is_empty() {
        tracing::debug!(leased = alerts.len(), "leased due alerts");
    }
    Ok(alerts)
}

/// Lease a single active alert to `worker`, if no other worker holds it.
pub async fn try_acquire_lease(
    id: Id,
    worker: &str,
    now: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> Result<bool> {
    let acquired = sqlx::query(
        r#"update alerts set lease_holder = ?, lease_expires_at = ?
        where id = ? and state = 'active'
          and (lease_expires_at <= ? or lease_holder = ?)
        "#,
    )
    .bind(worker)
    .bind(to_millis(expires_at))
    .bind(id)
    .bind(to_millis(now))
    .bind(worker)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(acquired != 0)
}

/// Extend the lease of `worker` over an alert until `expires_at`.
/// Returns false if the worker no longer holds the lease.
pub async fn renew_lease(
    id: Id,
    worker: &str,
    expires_at: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> Result<bool> {
    let renewed = sqlx::query(
        "update alerts set lease_expires_at = ? where id = ? and lease_holder = ?",
    )
    .bind(to_millis(expires_at))
    .bind(id)
    .bind(worker)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(renewed != 0)
}

/// Release the lease of `worker` over an alert, if it still holds it.
pub async fn release_lease(id: Id, worker: &str, pool: &sqlx::SqlitePool) -> Result<()> {
    sqlx::query(
        r#"update alerts set lease_holder = null, lease_expires_at = 0
        where id = ? and lease_holder = ?
        "#,
    )
    .bind(id)
    .bind(worker)
    .execute(pool)
    .await?;

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::test_support::{lease, new_alert, owner, pool, ts};
    use crate::{
        create_alert, record_index_failure, record_query_error, record_run, update_alert,
        AlertUpdate,
    };
    use models::AlertState;
    use pretty_assertions::assert_eq;

    fn ids(alerts: &[Alert]) -> Vec<Id> {
        alerts.iter().map(|a| a.id).collect()
    }

    #[tokio::test]
    async fn due_alerts_follow_cadence_checkpoints() {
        let pool = pool().await;
        let alice = owner(1);
        let checkpoints = Checkpoints::at_hour(6);
        let created = ts("2024-03-09T12:00:00Z"); // A Saturday.

        for (id, cadence) in [
            (1, Cadence::RealTime),
            (2, Cadence::Daily),
            (3, Cadence::Weekly),
            (4, Cadence::Monthly),
        ] {
            create_alert(Id::new(id), &new_alert(&alice, cadence), created, &pool)
                .await
                .unwrap();
        }

        // Later the same day, only the real-time alert is due.
        let now = ts("2024-03-09T18:00:00Z");
        let leased = lease_due_alerts("w", &checkpoints, now, now, 10, &pool)
            .await
            .unwrap();
        assert_eq!(ids(&leased), vec![Id::new(1)]);

        // After Sunday's daily checkpoint, the daily alert is also due.
        let now = ts("2024-03-10T06:00:00Z");
        let leased = lease_due_alerts("w", &checkpoints, now, now, 10, &pool)
            .await
            .unwrap();
        assert_eq!(ids(&leased), vec![Id::new(1), Id::new(2)]);

        // Monday brings the weekly checkpoint, but not yet the monthly one.
        let now = ts("2024-03-11T07:00:00Z");
        let leased = lease_due_alerts("w", &checkpoints, now, now, 10, &pool)
            .await
            .unwrap();
        assert_eq!(ids(&leased), vec![Id::new(1), Id::new(2), Id::new(3)]);

        let now = ts("2024-04-01T06:30:00Z");
        let leased = lease_due_alerts("w", &checkpoints, now, now, 10, &pool)
            .await
            .unwrap();
        assert_eq!(leased.len(), 4);

        // Once evaluated after the checkpoint, the daily alert waits for the next.
        record_run(Id::new(2), "w", None, false, now, &pool)
            .await
            .unwrap();
        let later = ts("2024-04-01T23:00:00Z");
        let leased = lease_due_alerts("w", &checkpoints, later, later, 10, &pool)
            .await
            .unwrap();
        assert_eq!(ids(&leased), vec![Id::new(1), Id::new(3), Id::new(4)]);
    }

    #[tokio::test]
    async fn blocked_alerts_are_not_due() {
        let pool = pool().await;
        let alice = owner(1);
        let created = ts("2024-03-01T00:00:00Z");
        let now = ts("2024-03-01T00:01:00Z");
        let checkpoints = Checkpoints::default();

        for id in 1..=4 {
            create_alert(Id::new(id), &new_alert(&alice, Cadence::RealTime), created, &pool)
                .await
                .unwrap();
        }
        // Paused.
        update_alert(
            Id::new(1),
            alice.id,
            &AlertUpdate {
                state: Some(AlertState::Paused),
                ..Default::default()
            },
            created,
            &pool,
        )
        .await
        .unwrap();
        // Backing off from an index failure.
        lease(Id::new(2), created, &pool).await;
        let retry_at = ts("2024-03-01T00:05:00Z");
        record_index_failure(Id::new(2), "test-worker", retry_at, created, &pool)
            .await
            .unwrap();
        // Rejected query, with its notice already delivered.
        let notice = record_query_error(Id::new(3), "bad query", created, &pool)
            .await
            .unwrap()
            .unwrap();
        crate::clear_notice(Id::new(3), &notice, &pool).await.unwrap();

        let leased = lease_due_alerts("w", &checkpoints, now, now, 10, &pool)
            .await
            .unwrap();
        assert_eq!(ids(&leased), vec![Id::new(4)]);

        // The back-off passes.
        let now = ts("2024-03-01T00:06:00Z");
        let leased = lease_due_alerts("w", &checkpoints, now, now, 10, &pool)
            .await
            .unwrap();
        assert_eq!(ids(&leased), vec![Id::new(2), Id::new(4)]);
    }

    #[tokio::test]
    async fn pending_notices_make_an_alert_due() {
        let pool = pool().await;
        let alice = owner(1);
        let created = ts("2024-03-01T12:00:00Z");
        let now = ts("2024-03-01T13:00:00Z");
        create_alert(Id::new(1), &new_alert(&alice, Cadence::Monthly), created, &pool)
            .await
            .unwrap();
        record_query_error(Id::new(1), "bad query", created, &pool)
            .await
            .unwrap();

        let leased = lease_due_alerts("w", &Checkpoints::default(), now, now, 10, &pool)
            .await
            .unwrap();
        assert_eq!(ids(&leased), vec![Id::new(1)]);
        assert_eq!(leased[0].notices.len(), 1);
    }

    #[tokio::test]
    async fn leases_exclude_other_workers_until_expiry() {
        let pool = pool().await;
        let alice = owner(1);
        let created = ts("2024-03-01T00:00:00Z");
        let checkpoints = Checkpoints::default();
        for id in 1..=3 {
            create_alert(Id::new(id), &new_alert(&alice, Cadence::RealTime), created, &pool)
                .await
                .unwrap();
        }

        let now = ts("2024-03-01T00:01:00Z");
        let expires = ts("2024-03-01T00:02:00Z");

        let first = lease_due_alerts("one", &checkpoints, now, expires, 2, &pool)
            .await
            .unwrap();
        assert_eq!(ids(&first), vec![Id::new(1), Id::new(2)]);

        let second = lease_due_alerts("two", &checkpoints, now, expires, 10, &pool)
            .await
            .unwrap();
        assert_eq!(ids(&second), vec![Id::new(3)]);

        assert!(!try_acquire_lease(Id::new(1), "two", now, expires, &pool)
            .await
            .unwrap());
        assert!(!renew_lease(Id::new(1), "two", expires, &pool).await.unwrap());
        assert!(renew_lease(Id::new(1), "one", ts("2024-03-01T00:10:00Z"), &pool)
            .await
            .unwrap());

        // Worker "one" stops heartbeating alert 2, and its lease lapses.
        let later = ts("2024-03-01T00:03:00Z");
        assert!(try_acquire_lease(Id::new(2), "two", later, expires, &pool)
            .await
            .unwrap());
        assert!(!try_acquire_lease(Id::new(1), "two", later, expires, &pool)
            .await
            .unwrap());

        // Released leases may be taken immediately.
        release_lease(Id::new(1), "one", &pool).await.unwrap();
        assert!(try_acquire_lease(Id::new(1), "two", later, expires, &pool)
            .await
            .unwrap());
    }
}
