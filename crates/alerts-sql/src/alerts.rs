use crate::{from_millis, to_millis, Error, Result};
use anyhow::Context;
use chrono::{DateTime, Utc};
use models::{Alert, AlertState, Cadence, Id, Notice, Owner, PendingNotice};

/// Columns of the `alerts` table which make up an `Alert`.
macro_rules! alert_columns {
    () => {
        r#"id, owner_id, owner_email, name, query, cadence, state, watermark,
        created_at, last_run_at, last_notified_at, index_failures, retry_at,
        query_error, notices"#
    };
}
pub(crate) use alert_columns;

/// An alert which has been submitted, but not yet stored.
#[derive(Debug, Clone)]
pub struct NewAlert {
    pub owner: Owner,
    pub name: String,
    pub query: String,
    pub cadence: Cadence,
}

/// Fields of an alert which its owner may change. `None` leaves a field as-is.
#[derive(Debug, Clone, Default)]
pub struct AlertUpdate {
    pub name: Option<String>,
    pub query: Option<String>,
    pub cadence: Option<Cadence>,
    pub state: Option<AlertState>,
}

#[derive(Debug, sqlx::FromRow)]
pub(crate) struct AlertRow {
    id: Id,
    owner_id: String,
    owner_email: String,
    name: String,
    query: String,
    cadence: String,
    state: String,
    watermark: i64,
    created_at: i64,
    last_run_at: Option<i64>,
    last_notified_at: Option<i64>,
    index_failures: i64,
    retry_at: i64,
    query_error: Option<String>,
    notices: String,
}

impl TryFrom<AlertRow> for Alert {
    type Error = anyhow::Error;

    fn try_from(row: AlertRow) -> anyhow::Result<Self> {
        let AlertRow {
            id,
            owner_id,
            owner_email,
            name,
            query,
            cadence,
            state,
            watermark,
            created_at,
            last_run_at,
            last_notified_at,
            index_failures,
            retry_at,
            query_error,
            notices,
        } = row;

        Ok(Alert {
            id,
            owner: Owner {
                id: uuid::Uuid::parse_str(&owner_id)
                    .with_context(|| format!("parsing owner id {owner_id:?}"))?,
                email: owner_email,
            },
            name,
            query,
            cadence: Cadence::from_str(&cadence)
                .with_context(|| format!("unknown cadence {cadence:?}"))?,
            state: AlertState::from_str(&state)
                .with_context(|| format!("unknown alert state {state:?}"))?,
            watermark: from_millis(watermark)?,
            created_at: from_millis(created_at)?,
            last_run_at: last_run_at.map(from_millis).transpose()?,
            last_notified_at: last_notified_at.map(from_millis).transpose()?,
            index_failures: u32::try_from(index_failures).unwrap_or(u32::MAX),
            retry_at: if retry_at == 0 {
                None
            } else {
                Some(from_millis(retry_at)?)
            },
            query_error,
            notices: decode_notices(&notices)?,
        })
    }
}

fn decode_notices(notices: &str) -> anyhow::Result<Vec<PendingNotice>> {
    serde_json::from_str(notices).context("decoding alert notices")
}

fn encode_notices(notices: &[PendingNotice]) -> Result<String> {
    serde_json::to_string(notices)
        .context("encoding alert notices")
        .map_err(Error::Codec)
}

/// Resolve an update of alert `id`, fenced on its lease, which matched no rows.
/// Either the alert is gone, or another worker has taken its lease.
pub(crate) async fn lease_lost(id: Id, conn: &mut sqlx::SqliteConnection) -> Error {
    let exists = sqlx::query_scalar::<_, i64>("select 1 from alerts where id = ?")
        .bind(id)
        .fetch_optional(conn)
        .await;

    match exists {
        Ok(Some(_)) => Error::LeaseLost(id),
        Ok(None) => Error::NotFound(id),
        Err(err) => Error::Database(err),
    }
}

/// Queue `notice` for delivery to the owner of alert `id`, replacing any
/// pending notice of the same kind.
async fn queue_notice(
    id: Id,
    notice: Notice,
    now: DateTime<Utc>,
    conn: &mut sqlx::SqliteConnection,
) -> Result<PendingNotice> {
    let stored: Option<String> = sqlx::query_scalar("select notices from alerts where id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    let Some(stored) = stored else {
        return Err(Error::NotFound(id));
    };
    let mut notices = decode_notices(&stored).map_err(Error::Codec)?;

    let pending = PendingNotice {
        notice,
        queued_at: now,
    };
    notices.retain(|queued| queued.notice.kind() != pending.notice.kind());
    notices.push(pending.clone());

    sqlx::query("update alerts set notices = ? where id = ?")
        .bind(encode_notices(&notices)?)
        .bind(id)
        .execute(&mut *conn)
        .await?;

    Ok(pending)
}

fn validate_name(name: &str) -> Result<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(Error::Validation("alert name must not be empty".to_string()));
    }
    if name.chars().count() > models::MAX_ALERT_NAME_LEN {
        return Err(Error::Validation(format!(
            "alert name must be at most {} characters",
            models::MAX_ALERT_NAME_LEN
        )));
    }
    Ok(name.to_string())
}

fn validate_query(query: &str) -> Result<String> {
    if query.trim().is_empty() {
        return Err(Error::Validation("alert query must not be empty".to_string()));
    }
    // The query is opaque to the engine, and is stored verbatim.
    Ok(query.to_string())
}

/// Store a new alert with the given `id`. Its watermark begins at `now`,
/// so that only documents which appear after its creation are notified.
pub async fn create_alert(
    id: Id,
    new: &NewAlert,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> Result<Alert> {
    let name = validate_name(&new.name)?;
    let query = validate_query(&new.query)?;
    if new.owner.email.trim().is_empty() {
        return Err(Error::Validation(
            "alert owner must have an email address".to_string(),
        ));
    }
    let now = to_millis(now);

    sqlx::query(
        r#"insert into alerts (
            id, owner_id, owner_email, name, query, cadence, state,
            watermark, created_at, updated_at
        ) values (?, ?, ?, ?, ?, ?, 'active', ?, ?, ?)
        "#,
    )
    .bind(id)
    .bind(new.owner.id.to_string())
    .bind(new.owner.email.as_str())
    .bind(name.as_str())
    .bind(query.as_str())
    .bind(new.cadence.name())
    .bind(now)
    .bind(now)
    .bind(now)
    .execute(pool)
    .await?;

    tracing::info!(alert_id = %id, owner = %new.owner.id, cadence = %new.cadence, "created alert");

    fetch_alert(id, pool).await?.ok_or(Error::NotFound(id))
}

pub async fn fetch_alert<'c, E>(id: Id, db: E) -> Result<Option<Alert>>
where
    E: sqlx::Executor<'c, Database = sqlx::Sqlite>,
{
    let row = sqlx::query_as::<_, AlertRow>(concat!(
        "select ",
        alert_columns!(),
        " from alerts where id = ?"
    ))
    .bind(id)
    .fetch_optional(db)
    .await?;

    row.map(Alert::try_from).transpose().map_err(Error::Codec)
}

pub async fn list_alerts_for_owner(
    owner_id: uuid::Uuid,
    pool: &sqlx::SqlitePool,
) -> Result<Vec<Alert>> {
    let rows = sqlx::query_as::<_, AlertRow>(concat!(
        "select ",
        alert_columns!(),
        " from alerts where owner_id = ? order by created_at asc, id asc"
    ))
    .bind(owner_id.to_string())
    .fetch_all(pool)
    .await?;

    rows.into_iter()
        .map(Alert::try_from)
        .collect::<anyhow::Result<_>>()
        .map_err(Error::Codec)
}

/// Apply an owner's edit to an alert. Editing the query clears any
/// outstanding query error, which allows the alert to be evaluated again.
pub async fn update_alert(
    id: Id,
    caller: uuid::Uuid,
    update: &AlertUpdate,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> Result<Alert> {
    let mut txn = pool.begin().await?;

    let Some(current) = fetch_alert(id, &mut *txn).await? else {
        return Err(Error::NotFound(id));
    };
    if current.owner.id != caller {
        return Err(Error::Forbidden(id));
    }
    if current.state == AlertState::Disabled {
        return Err(Error::Validation(
            "alert is disabled and can no longer be edited".to_string(),
        ));
    }

    let name = match &update.name {
        Some(name) => validate_name(name)?,
        None => current.name.clone(),
    };
    let query = match &update.query {
        Some(query) => validate_query(query)?,
        None => current.query.clone(),
    };
    let state = match update.state {
        Some(AlertState::Disabled) => {
            return Err(Error::Validation(
                "alerts are disabled by deletion, not by edit".to_string(),
            ))
        }
        Some(state) => state,
        None => current.state,
    };
    let cadence = update.cadence.unwrap_or(current.cadence);

    let (query_error, notices, index_failures) = if query != current.query {
        let mut notices = current.notices;
        notices.retain(|pending| !matches!(pending.notice, Notice::QueryError { .. }));
        (None, notices, 0)
    } else {
        (current.query_error, current.notices, current.index_failures)
    };

    sqlx::query(
        r#"update alerts set
            name = ?,
            query = ?,
            cadence = ?,
            state = ?,
            query_error = ?,
            notices = ?,
            index_failures = ?,
            updated_at = ?
        where id = ?
        "#,
    )
    .bind(name.as_str())
    .bind(query.as_str())
    .bind(cadence.name())
    .bind(state.name())
    .bind(query_error)
    .bind(encode_notices(&notices)?)
    .bind(index_failures as i64)
    .bind(to_millis(now))
    .bind(id)
    .execute(&mut *txn)
    .await?;

    let updated = fetch_alert(id, &mut *txn)
        .await?
        .ok_or(Error::NotFound(id))?;
    txn.commit().await?;

    tracing::info!(alert_id = %id, cadence = %updated.cadence, state = %updated.state, "updated alert");
    Ok(updated)
}

/// Delete an alert and its notification records.
pub async fn delete_alert(id: Id, caller: uuid::Uuid, pool: &sqlx::SqlitePool) -> Result<()> {
    let mut txn = pool.begin().await?;

    let Some(current) = fetch_alert(id, &mut *txn).await? else {
        return Err(Error::NotFound(id));
    };
    if current.owner.id != caller {
        return Err(Error::Forbidden(id));
    }

    sqlx::query("delete from alert_notifications where alert_id = ?")
        .bind(id)
        .execute(&mut *txn)
        .await?;
    sqlx::query("delete from alerts where id = ?")
        .bind(id)
        .execute(&mut *txn)
        .await?;
    txn.commit().await?;

    tracing::info!(alert_id = %id, "deleted alert");
    Ok(())
}

/// Disable every alert of an owner who has been removed.
/// Returns the number of alerts which were disabled.
pub async fn disable_alerts_for_owner(
    owner_id: uuid::Uuid,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> Result<u64> {
    let disabled = sqlx::query(
        r#"update alerts set state = 'disabled', updated_at = ?
        where owner_id = ? and state != 'disabled'
        "#,
    )
    .bind(to_millis(now))
    .bind(owner_id.to_string())
    .execute(pool)
    .await?
    .rows_affected();

    tracing::info!(owner = %owner_id, disabled, "disabled alerts of removed owner");
    Ok(disabled)
}

/// Move the watermark of an alert forward to `watermark`.
/// Fails with `ConcurrentModification` if the stored watermark is already
/// after `watermark`, in which case it's left unchanged.
pub async fn advance_watermark(
    id: Id,
    watermark: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> Result<()> {
    let requested = to_millis(watermark);

    let updated = sqlx::query("update alerts set watermark = ? where id = ? and watermark <= ?")
        .bind(requested)
        .bind(id)
        .bind(requested)
        .execute(pool)
        .await?
        .rows_affected();

    if updated != 0 {
        return Ok(());
    }

    let stored: Option<i64> = sqlx::query_scalar("select watermark from alerts where id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    match stored {
        None => Err(Error::NotFound(id)),
        Some(stored) => Err(Error::ConcurrentModification {
            id,
            stored: from_millis(stored).map_err(Error::Codec)?,
            requested: watermark,
        }),
    }
}

/// Record a completed run of an alert's query by `worker`, which must
/// still hold the alert's lease. The watermark moves to the latest `observed`
/// document timestamp, but never backward, and the consecutive index failure
/// count resets.
pub async fn record_run(
    id: Id,
    worker: &str,
    observed: Option<DateTime<Utc>>,
    notified: bool,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> Result<()> {
    let mut conn = pool.acquire().await?;
    record_run_on(id, worker, observed, notified, now, &mut *conn).await
}

pub(crate) async fn record_run_on(
    id: Id,
    worker: &str,
    observed: Option<DateTime<Utc>>,
    notified: bool,
    now: DateTime<Utc>,
    conn: &mut sqlx::SqliteConnection,
) -> Result<()> {
    let now = to_millis(now);

    let updated = sqlx::query(
        r#"update alerts set
            watermark = max(watermark, coalesce(?, watermark)),
            last_run_at = ?,
            last_notified_at = case when ? then ? else last_notified_at end,
            index_failures = 0,
            retry_at = 0,
            updated_at = ?
        where id = ? and lease_holder = ?
        "#,
    )
    .bind(observed.map(to_millis))
    .bind(now)
    .bind(notified)
    .bind(now)
    .bind(now)
    .bind(id)
    .bind(worker)
    .execute(&mut *conn)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(lease_lost(id, conn).await);
    }
    Ok(())
}

/// Record that the search index was unavailable for a run of the alert by
/// `worker`, and that it's not retried before `retry_at`.
/// Returns the number of consecutive failures.
pub async fn record_index_failure(
    id: Id,
    worker: &str,
    retry_at: DateTime<Utc>,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> Result<u32> {
    let mut txn = pool.begin().await?;

    let updated = sqlx::query(
        r#"update alerts set
            index_failures = index_failures + 1,
            retry_at = ?,
            updated_at = ?
        where id = ? and lease_holder = ?
        "#,
    )
    .bind(to_millis(retry_at))
    .bind(to_millis(now))
    .bind(id)
    .bind(worker)
    .execute(&mut *txn)
    .await?
    .rows_affected();

    if updated == 0 {
        return Err(lease_lost(id, &mut *txn).await);
    }

    let failures: i64 = sqlx::query_scalar("select index_failures from alerts where id = ?")
        .bind(id)
        .fetch_one(&mut *txn)
        .await?;
    txn.commit().await?;

    Ok(u32::try_from(failures).unwrap_or(u32::MAX))
}

/// Record that the search index rejected the alert's query.
/// The first error queues a notice for the owner, and returns it.
/// Later errors, before the query is edited, return None.
pub async fn record_query_error(
    id: Id,
    message: &str,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> Result<Option<PendingNotice>> {
    let mut txn = pool.begin().await?;

    let updated = sqlx::query(
        r#"update alerts set query_error = ?, updated_at = ?
        where id = ? and query_error is null
        "#,
    )
    .bind(message)
    .bind(to_millis(now))
    .bind(id)
    .execute(&mut *txn)
    .await?
    .rows_affected();

    if updated == 0 {
        return Ok(None);
    }
    let notice = Notice::QueryError {
        message: message.to_string(),
    };
    let pending = queue_notice(id, notice, now, &mut *txn).await?;
    txn.commit().await?;

    Ok(Some(pending))
}

/// Demote a real-time alert to the `to` cadence, queueing a notice for its
/// owner. Returns the notice, or None if the alert was not real-time.
pub async fn demote_alert(
    id: Id,
    to: Cadence,
    now: DateTime<Utc>,
    pool: &sqlx::SqlitePool,
) -> Result<Option<PendingNotice>> {
    let mut txn = pool.begin().await?;

    let updated = sqlx::query(
        r#"update alerts set cadence = ?, updated_at = ?
        where id = ? and cadence = ?
        "#,
    )
    .bind(to.name())
    .bind(to_millis(now))
    .bind(id)
    .bind(Cadence::RealTime.name())
    .execute(&mut *txn)
    .await?
    .rows_affected();

    if updated == 0 {
        return Ok(None);
    }
    let notice = Notice::CadenceDemoted {
        from: Cadence::RealTime,
        to,
    };
    let pending = queue_notice(id, notice, now, &mut *txn).await?;
    txn.commit().await?;

    tracing::info!(alert_id = %id, %to, "demoted real-time alert");
    Ok(Some(pending))
}

/// Remove `delivered` from the pending notices of an alert.
/// Returns false if it was no longer pending.
pub async fn clear_notice(
    id: Id,
    delivered: &PendingNotice,
    pool: &sqlx::SqlitePool,
) -> Result<bool> {
    let mut txn = pool.begin().await?;

    let stored: Option<String> = sqlx::query_scalar("select notices from alerts where id = ?")
        .bind(id)
        .fetch_optional(&mut *txn)
        .await?;
    let Some(stored) = stored else {
        return Ok(false);
    };
    let mut notices = decode_notices(&stored).map_err(Error::Codec)?;

    let before = notices.len();
    notices.retain(|pending| pending != delivered);
    if notices.len() == before {
        return Ok(false);
    }

    sqlx::query("update alerts set notices = ? where id = ?")
        .bind(encode_notices(&notices)?)
        .bind(id)
        .execute(&mut *txn)
        .await?;
    txn.commit().await?;

    Ok(true)
}
