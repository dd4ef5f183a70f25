//! Handling of alert requests made by owners through the alert form.
use crate::{Access, AccessPolicy, Error, Forbidden, Result};
use alerts_sql::{AlertUpdate, NewAlert};
use anyhow::Context;
use chrono::{DateTime, Utc};
use models::{Alert, AlertState, Cadence, Id, IdGenerator, Owner};

/// A request to create an alert, or to edit one if `edit_alert_id` is set.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlertRequest {
    pub query: String,
    pub name: String,
    /// Cadence as submitted by the form, such as "daily" or "rt".
    pub cadence: String,
    #[serde(default)]
    pub edit_alert_id: Option<Id>,
}

/// Create or edit an alert of `owner`. A real-time alert is only stored if
/// the owner currently qualifies for real-time alerts.
#[tracing::instrument(skip_all, fields(owner = %owner.id, edit_alert_id = ?request.edit_alert_id))]
pub async fn submit<P: AccessPolicy>(
    pool: &sqlx::SqlitePool,
    policy: &P,
    id_gen: &mut IdGenerator,
    owner: &Owner,
    request: AlertRequest,
    now: DateTime<Utc>,
) -> Result<Alert> {
    let AlertRequest {
        query,
        name,
        cadence,
        edit_alert_id,
    } = request;

    let Some(cadence) = Cadence::from_str(&cadence) else {
        return Err(Error::Validation(format!("unrecognized cadence {cadence:?}")));
    };

    if cadence.is_gated() {
        let access = policy
            .can_use(owner.id, cadence)
            .await
            .context("checking real-time access")?;

        if access == Access::Denied {
            tracing::info!("owner does not qualify for real-time alerts");
            return Err(Error::Forbidden(Forbidden::RealTimeDenied));
        }
    }

    let alert = match edit_alert_id {
        Some(alert_id) => {
            let update = AlertUpdate {
                name: Some(name),
                query: Some(query),
                cadence: Some(cadence),
                state: None,
            };
            alerts_sql::update_alert(alert_id, owner.id, &update, now, pool).await?
        }
        None => {
            let new = NewAlert {
                owner: owner.clone(),
                name,
                query,
                cadence,
            };
            alerts_sql::create_alert(id_gen.next(), &new, now, pool).await?
        }
    };
    Ok(alert)
}

/// Pause or resume an alert of `caller`.
pub async fn set_paused(
    pool: &sqlx::SqlitePool,
    alert_id: Id,
    caller: uuid::Uuid,
    paused: bool,
    now: DateTime<Utc>,
) -> Result<Alert> {
    let update = AlertUpdate {
        state: Some(if paused {
            AlertState::Paused
        } else {
            AlertState::Active
        }),
        ..Default::default()
    };
    Ok(alerts_sql::update_alert(alert_id, caller, &update, now, pool).await?)
}

/// Delete an alert of `caller`, along with its notification records.
pub async fn delete(pool: &sqlx::SqlitePool, alert_id: Id, caller: uuid::Uuid) -> Result<()> {
    Ok(alerts_sql::delete_alert(alert_id, caller, pool).await?)
}

/// List the alerts of `owner_id`.
pub async fn list(pool: &sqlx::SqlitePool, owner_id: uuid::Uuid) -> Result<Vec<Alert>> {
    Ok(alerts_sql::list_alerts_for_owner(owner_id, pool).await?)
}

/// Disable every alert of an owner whose account was removed.
pub async fn remove_owner(
    pool: &sqlx::SqlitePool,
    owner_id: uuid::Uuid,
    now: DateTime<Utc>,
) -> Result<u64> {
    Ok(alerts_sql::disable_alerts_for_owner(owner_id, now, pool).await?)
}
