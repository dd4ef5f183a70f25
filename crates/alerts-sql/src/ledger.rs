//! The ledger records each document an alert has notified its owner of.
//! A document is notified at most once per alert, no matter how many times
//! it's matched by the alert's query.
use crate::{to_millis, Result};
use chrono::{DateTime, Utc};
use models::{DocumentHit, Id};
use std::collections::HashSet;

// Bounds the number of bound parameters of a single ledger lookup.
const LOOKUP_CHUNK: usize = 500;

/// Filter `hits` to those which `alert_id` has not yet notified.
/// Duplicate document ids within `hits` are also removed, keeping the first.
/// Order of the remaining hits is preserved.
pub async fn unseen_documents(
    alert_id: Id,
    hits: Vec<DocumentHit>,
    pool: &sqlx::SqlitePool,
) -> Result<Vec<DocumentHit>> {
    let mut batch = HashSet::new();
    let hits: Vec<DocumentHit> = hits
        .into_iter()
        .filter(|hit| batch.insert(hit.id.clone()))
        .collect();

    let mut seen = HashSet::new();
    for chunk in hits.chunks(LOOKUP_CHUNK) {
        let placeholders = vec!["?"; chunk.len()].join(", ");
        let sql = format!(
            "select document_id from alert_notifications where alert_id = ? and document_id in ({placeholders})"
        );

        let mut query = sqlx::query_scalar::<_, String>(&sql).bind(alert_id);
        for hit in chunk {
            query = query.bind(hit.id.as_str());
        }
        seen.extend(query.fetch_all(pool).await?);
    }

    Ok(hits
        .into_iter()
        .filter(|hit| !seen.contains(&hit.id))
        .collect())
}

/// Commit a delivery which was accepted for `alert_id`: the delivered
/// documents are recorded in the ledger, and the alert's run is recorded
/// with its watermark advanced to `observed`. Both happen atomically, and
/// only while `worker` holds the alert's lease.
///
/// Committing the same delivery twice is harmless.
#[tracing::instrument(skip(delivered, pool), fields(documents = delivered.len()), err)]
pub async fn commit_delivery(
    alert_id: Id,
    worker: &str,
    delivered: &[DocumentHit],
    observed: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> Result<()> {
    let mut txn = pool.begin().await?;

    crate::alerts::record_run_on(alert_id, worker, observed, true, now, &mut *txn).await?;

    for hit in delivered {
        sqlx::query(
            r#"insert or ignore into alert_notifications (alert_id, document_id, document_ts, notified_at)
            values (?, ?, ?, ?)
            "#,
        )
        .bind(alert_id)
        .bind(hit.id.as_str())
        .bind(to_millis(hit.timestamp))
        .bind(to_millis(now))
        .execute(&mut *txn)
        .await?;
    }

    txn.commit().await?;
    Ok(())
}

/// Document ids which have been notified for `alert_id`, in the order they were notified.
pub async fn notified_documents(alert_id: Id, pool: &sqlx::SqlitePool) -> Result<Vec<String>> {
    let ids = sqlx::query_scalar::<_, String>(
        r#"select document_id from alert_notifications
        where alert_id = ?
        order by notified_at asc, rowid asc
        "#,
    )
    .bind(alert_id)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

/// Remove ledger entries which were notified before `before`.
/// An entry is kept while its document is at or after the watermark of its
/// alert, because the index may still return that document to the alert.
/// Returns the number of removed entries.
pub async fn prune_notifications(before: DateTime<Utc>, pool: &sqlx::SqlitePool) -> Result<u64> {
    let pruned = sqlx::query(
        r#"delete from alert_notifications
        where notified_at < ?
          and document_ts < (
            select a.watermark from alerts a where a.id = alert_notifications.alert_id
          )
        "#,
    )
    .bind(to_millis(before))
    .execute(pool)
    .await?
    .rows_affected();

    if pruned != 0 {
        tracing::info!(pruned, %before, "pruned alert notification records");
    }
    Ok(pruned)
}
