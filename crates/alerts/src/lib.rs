//! The alert engine evaluates saved search queries on their cadence and
//! notifies each owner of newly matched documents.
//!
//! A scheduler pass leases the alerts which are due, and runs each through
//! the per-alert pipeline:
//!
//! - Deliver any notice which is pending for the alert's owner.
//! - Re-check that a real-time owner may still use real-time alerts,
//!   demoting the alert to daily if they may not.
//! - Run the alert's query against the search index, from its watermark.
//! - Drop documents which the alert has already notified.
//! - Deliver the remaining documents to the owner as a single batch.
//! - Only once the batch is accepted, record its documents and advance the
//!   alert's watermark in one transaction.
//!
//! A failure of any step leaves the alert as it was, and it's retried on a
//! later pass. An owner is therefore never notified twice of one document by
//! one alert, and never misses a document.
use models::Id;

pub mod notifier;
pub mod pipeline;
pub mod policy;
pub mod requests;
pub mod scheduler;
pub mod search;

pub use notifier::{Delivery, EmailNotifier, EmailSender, Notifier, Sender};
pub use pipeline::{Engine, RunOutcome};
pub use policy::{Access, AccessPolicy, DonationGate, DonationStatus};
pub use requests::AlertRequest;
pub use scheduler::{PassSummary, SchedulerConfig, Server};
pub use search::{SearchError, SearchIndex};

/// Reasons for which an owner may not perform a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum Forbidden {
    #[error("alert {0} belongs to another owner")]
    NotOwner(Id),
    #[error("real-time alerts are only available to donating members")]
    RealTimeDenied,
}

/// Error is returned by engine operations which act on behalf of an owner.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid alert: {0}")]
    Validation(String),
    #[error(transparent)]
    Forbidden(Forbidden),
    #[error("alert {0} was not found")]
    NotFound(Id),
    #[error("alert {0} was modified concurrently")]
    ConcurrentModification(Id),
    #[error("search index is unavailable")]
    IndexUnavailable(#[source] anyhow::Error),
    #[error("the search index rejected the alert query: {0}")]
    QuerySyntax(String),
    #[error("notification was not accepted for delivery: {0}")]
    DeliveryRejected(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<alerts_sql::Error> for Error {
    fn from(err: alerts_sql::Error) -> Self {
        match err {
            alerts_sql::Error::Validation(message) => Error::Validation(message),
            alerts_sql::Error::Forbidden(id) => Error::Forbidden(Forbidden::NotOwner(id)),
            alerts_sql::Error::NotFound(id) => Error::NotFound(id),
            alerts_sql::Error::ConcurrentModification { id, .. }
            | alerts_sql::Error::LeaseLost(id) => Error::ConcurrentModification(id),
            err @ (alerts_sql::Error::Codec(_) | alerts_sql::Error::Database(_)) => {
                Error::Internal(anyhow::Error::new(err))
            }
        }
    }
}

impl From<SearchError> for Error {
    fn from(err: SearchError) -> Self {
        match err {
            SearchError::IndexUnavailable(err) => Error::IndexUnavailable(err),
            SearchError::QuerySyntax(message) => Error::QuerySyntax(message),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
