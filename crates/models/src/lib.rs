//! Domain types shared by the alert store, the notification renderer,
//! and the alert engine.
mod alert;
mod cadence;
mod id;

pub use alert::{Alert, AlertState, DocumentHit, Notice, Owner, PendingNotice};
pub use cadence::{Cadence, Checkpoints};
pub use id::{Id, IdGenerator};

/// Maximum length of an alert's display name, in characters.
pub const MAX_ALERT_NAME_LEN: usize = 200;
