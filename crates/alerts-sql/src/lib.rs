//! Low-level functions for storing alerts, recording which documents each
//! alert has notified (the dedup ledger), and leasing due alerts to scheduler
//! workers.
//!
//! All timestamps are stored as integer milliseconds since the Unix epoch,
//! which keeps comparisons in SQL exact and cheap.
use anyhow::Context;
use chrono::{DateTime, TimeZone, Utc};

pub mod alerts;
pub mod leases;
pub mod ledger;

pub use alerts::{
    advance_watermark, clear_notice, create_alert, delete_alert, demote_alert,
    disable_alerts_for_owner, fetch_alert, list_alerts_for_owner, record_index_failure,
    record_query_error, record_run, update_alert, AlertUpdate, NewAlert,
};
pub use leases::{lease_due_alerts, release_lease, renew_lease, try_acquire_lease};
pub use ledger::{
    commit_delivery, notified_documents, prune_notifications, unseen_documents,
};

/// Error is the taxonomy of failures returned by the alert store.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid alert: {0}")]
    Validation(String),
    #[error("alert {0} is not owned by the caller")]
    Forbidden(models::Id),
    #[error("alert {0} was not found")]
    NotFound(models::Id),
    #[error("watermark of alert {id} is already {stored}, which is after {requested}")]
    ConcurrentModification {
        id: models::Id,
        stored: DateTime<Utc>,
        requested: DateTime<Utc>,
    },
    #[error("lease of alert {0} is held by another worker")]
    LeaseLost(models::Id),
    #[error("failed to encode or decode a stored alert")]
    Codec(#[source] anyhow::Error),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

const SCHEMA: &[&str] = &[
    r#"
    create table if not exists alerts (
        id               integer primary key,
        owner_id         text    not null,
        owner_email      text    not null,
        name             text    not null,
        query            text    not null,
        cadence          text    not null,
        state            text    not null default 'active',
        watermark        integer not null,
        created_at       integer not null,
        updated_at       integer not null,
        last_run_at      integer,
        last_notified_at integer,
        index_failures   integer not null default 0,
        retry_at         integer not null default 0,
        query_error      text,
        notices          text    not null default '[]',
        lease_holder     text,
        lease_expires_at integer not null default 0
    )
    "#,
    "create index if not exists alerts_owner_id on alerts (owner_id)",
    "create index if not exists alerts_state_cadence on alerts (state, cadence)",
    r#"
    create table if not exists alert_notifications (
        alert_id    integer not null,
        document_id text    not null,
        document_ts integer not null,
        notified_at integer not null,
        primary key (alert_id, document_id)
    )
    "#,
    "create index if not exists alert_notifications_notified_at on alert_notifications (notified_at)",
];

/// Create the alert tables and indices, if they don't already exist.
pub async fn migrate(pool: &sqlx::SqlitePool) -> anyhow::Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .with_context(|| format!("applying schema statement: {statement}"))?;
    }
    tracing::debug!(statements = SCHEMA.len(), "applied alert schema");
    Ok(())
}

/// Connect to the database at `url`, and ensure its schema is current.
///
/// An in-memory database exists only within its connection, so its pool is
/// restricted to a single connection which is never recycled.
pub async fn connect(url: &str, max_connections: u32) -> anyhow::Result<sqlx::SqlitePool> {
    use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
    use std::str::FromStr;

    let in_memory = url.contains(":memory:") || url.contains("mode=memory");

    let mut options = SqliteConnectOptions::from_str(url)
        .with_context(|| format!("parsing database URL {url}"))?
        .create_if_missing(true)
        .busy_timeout(std::time::Duration::from_secs(10));
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }

    let pool_options = if in_memory {
        SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
    } else {
        SqlitePoolOptions::new().max_connections(max_connections.max(1))
    };

    let pool = pool_options
        .connect_with(options)
        .await
        .context("connecting to database")?;

    migrate(&pool).await?;
    Ok(pool)
}

pub(crate) fn to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn from_millis(millis: i64) -> anyhow::Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .with_context(|| format!("timestamp {millis} is out of range"))
}
