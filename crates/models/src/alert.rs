use crate::{Cadence, Id};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Owner of an alert. The engine doesn't manage user accounts, and only
/// keeps the address to which an owner's notifications are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Owner {
    pub id: uuid::Uuid,
    pub email: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertState {
    /// Evaluated on its cadence.
    Active,
    /// Suspended by its owner, and may be resumed.
    Paused,
    /// Terminal. The alert is never evaluated again.
    Disabled,
}

impl std::fmt::Display for AlertState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl AlertState {
    pub fn name(&self) -> &'static str {
        match self {
            AlertState::Active => "active",
            AlertState::Paused => "paused",
            AlertState::Disabled => "disabled",
        }
    }

    pub fn from_str(name: &str) -> Option<AlertState> {
        [AlertState::Active, AlertState::Paused, AlertState::Disabled]
            .into_iter()
            .find(|s| name.eq_ignore_ascii_case(s.name()))
    }
}

/// A one-time message to an alert's owner about the alert itself,
/// rather than about its matched documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Notice {
    /// The owner no longer qualifies for real-time alerts,
    /// and the alert was moved to a slower cadence.
    CadenceDemoted { from: Cadence, to: Cadence },
    /// The alert's query is rejected by the search index, and the alert
    /// will not be evaluated again until its query is edited.
    QueryError { message: String },
}

impl Notice {
    /// Kind of the notice. A queue holds at most one pending notice of each kind.
    pub fn kind(&self) -> &'static str {
        match self {
            Notice::CadenceDemoted { .. } => "cadenceDemoted",
            Notice::QueryError { .. } => "queryError",
        }
    }
}

/// A notice which awaits delivery, and the time at which it was queued.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingNotice {
    pub notice: Notice,
    pub queued_at: DateTime<Utc>,
}

/// Alert is a saved search query, evaluated on a cadence on behalf of its owner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Id,
    pub owner: Owner,
    pub name: String,
    /// Query passed verbatim to the search index.
    pub query: String,
    pub cadence: Cadence,
    pub state: AlertState,
    /// Documents at or after the watermark have not yet been fully evaluated.
    /// It never moves backward.
    pub watermark: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_notified_at: Option<DateTime<Utc>>,
    /// Number of consecutive runs which failed because the index was unavailable.
    #[serde(default)]
    pub index_failures: u32,
    /// The alert is not retried before this time, after index failures.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_at: Option<DateTime<Utc>>,
    /// Error of the alert's query, if the index last rejected it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_error: Option<String>,
    /// Notices which await delivery to the owner, oldest first.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notices: Vec<PendingNotice>,
}

impl Alert {
    /// The reference time from which periodic due-ness is computed.
    pub fn last_evaluated(&self) -> DateTime<Utc> {
        self.last_run_at.unwrap_or(self.created_at)
    }
}

/// A document matched by an alert query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentHit {
    /// Stable identifier of the document within the search index.
    pub id: String,
    pub title: String,
    /// Highlighted excerpt of the document which matched the query.
    #[serde(default)]
    pub snippet: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Time at which the document became visible in the index.
    pub timestamp: DateTime<Utc>,
}
