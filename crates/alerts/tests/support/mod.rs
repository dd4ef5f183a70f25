#![allow(dead_code)]

use alerts::{Delivery, Engine, Notifier, RunOutcome, SchedulerConfig, SearchError, SearchIndex};
use chrono::{DateTime, Utc};
use models::{Alert, DocumentHit, Notice, Owner, PendingNotice};
use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

pub type TestEngine = Engine<ScriptedIndex, RecordingNotifier, TogglePolicy>;

pub fn ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
}

pub fn owner(n: u128) -> Owner {
    Owner {
        id: uuid::Uuid::from_u128(n),
        email: format!("owner-{n}@example.test"),
    }
}

pub fn doc(id: &str, at: &str) -> DocumentHit {
    DocumentHit {
        id: id.to_string(),
        title: format!("Opinion {id}"),
        snippet: format!("snippet of {id}"),
        url: Some(format!("https://search.example.test/opinion/{id}/")),
        timestamp: ts(at),
    }
}

pub fn ids(docs: &[DocumentHit]) -> Vec<&str> {
    docs.iter().map(|d| d.id.as_str()).collect()
}

pub async fn engine(config: SchedulerConfig) -> TestEngine {
    let pool = alerts_sql::connect("sqlite::memory:", 1).await.unwrap();
    Engine::new(
        pool,
        ScriptedIndex::default(),
        RecordingNotifier::default(),
        TogglePolicy::default(),
        config,
    )
}

pub async fn create(engine: &TestEngine, id: u64, owner: &Owner, cadence: models::Cadence, at: &str) -> Alert {
    let new = alerts_sql::NewAlert {
        owner: owner.clone(),
        name: format!("Alert {id}"),
        query: "\"qualified immunity\"".to_string(),
        cadence,
    };
    alerts_sql::create_alert(models::Id::new(id), &new, ts(at), engine.pool())
        .await
        .unwrap()
}

pub async fn fetch(engine: &TestEngine, id: u64) -> Alert {
    alerts_sql::fetch_alert(models::Id::new(id), engine.pool())
        .await
        .unwrap()
        .unwrap()
}

/// Worker under which `run_leased` runs alerts.
pub const TEST_WORKER: &str = "test-worker";

/// Run `alert` as a scheduler would: under a lease which is released afterwards.
/// Inactive alerts can't be leased, and run without one.
pub async fn run_leased(
    engine: &TestEngine,
    alert: Alert,
    now: DateTime<Utc>,
) -> anyhow::Result<RunOutcome> {
    let id = alert.id;
    let expires_at = now + chrono::Duration::from_std(engine.config().lease_ttl).unwrap();
    alerts_sql::try_acquire_lease(id, TEST_WORKER, now, expires_at, engine.pool())
        .await
        .unwrap();

    let outcome = engine.run_alert(alert, TEST_WORKER, now).await;
    alerts_sql::release_lease(id, TEST_WORKER, engine.pool())
        .await
        .unwrap();
    outcome
}

/// A scripted response of the ScriptedIndex.
pub enum Response {
    Hits(Vec<DocumentHit>),
    Unavailable,
    Syntax(&'static str),
    Hang,
}

/// ScriptedIndex answers each query with the next scripted response,
/// or with no documents once the script is exhausted.
#[derive(Default)]
pub struct ScriptedIndex {
    script: Mutex<VecDeque<Response>>,
    calls: Mutex<Vec<(String, DateTime<Utc>)>>,
}

impl ScriptedIndex {
    pub fn push(&self, response: Response) {
        self.script.lock().unwrap().push_back(response);
    }

    /// Queries and `since` cursors which the index was called with.
    pub fn calls(&self) -> Vec<(String, DateTime<Utc>)> {
        self.calls.lock().unwrap().clone()
    }
}

impl SearchIndex for ScriptedIndex {
    async fn run<'s>(
        &'s self,
        query: &'s str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DocumentHit>, SearchError> {
        self.calls.lock().unwrap().push((query.to_string(), since));
        let next = self.script.lock().unwrap().pop_front();

        match next {
            None => Ok(Vec::new()),
            Some(Response::Hits(hits)) => Ok(hits),
            Some(Response::Unavailable) => Err(SearchError::IndexUnavailable(anyhow::anyhow!(
                "connection refused"
            ))),
            Some(Response::Syntax(message)) => Err(SearchError::QuerySyntax(message.to_string())),
            Some(Response::Hang) => {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Delivered {
    pub alert_id: models::Id,
    pub to: String,
    pub documents: Vec<String>,
}

/// RecordingNotifier records every delivery and notice it accepts.
/// While `reject` is set, it rejects everything instead.
/// Deliveries of documents take `delay` to be accepted.
#[derive(Default)]
pub struct RecordingNotifier {
    pub reject: Mutex<bool>,
    delay: Mutex<Duration>,
    delivered: Mutex<Vec<Delivered>>,
    notices: Mutex<Vec<(models::Id, Notice)>>,
}

impl RecordingNotifier {
    pub fn set_reject(&self, reject: bool) {
        *self.reject.lock().unwrap() = reject;
    }
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }
    pub fn delivered(&self) -> Vec<Delivered> {
        self.delivered.lock().unwrap().clone()
    }
    pub fn notices(&self) -> Vec<(models::Id, Notice)> {
        self.notices.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    async fn deliver<'s>(
        &'s self,
        owner: &'s Owner,
        alert: &'s Alert,
        batch: &'s [DocumentHit],
    ) -> Delivery {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if *self.reject.lock().unwrap() {
            return Delivery::Rejected("mailbox is full".to_string());
        }
        self.delivered.lock().unwrap().push(Delivered {
            alert_id: alert.id,
            to: owner.email.clone(),
            documents: batch.iter().map(|d| d.id.clone()).collect(),
        });
        Delivery::Accepted
    }

    async fn notice<'s>(
        &'s self,
        _owner: &'s Owner,
        alert: &'s Alert,
        pending: &'s PendingNotice,
    ) -> Delivery {
        if *self.reject.lock().unwrap() {
            return Delivery::Rejected("mailbox is full".to_string());
        }
        self.notices
            .lock()
            .unwrap()
            .push((alert.id, pending.notice.clone()));
        Delivery::Accepted
    }
}

/// TogglePolicy denies real-time alerts to owners in its denied set,
/// and fails every real-time check while `failing` is set.
#[derive(Default)]
pub struct TogglePolicy {
    denied: Mutex<HashSet<uuid::Uuid>>,
    failing: Mutex<bool>,
}

impl TogglePolicy {
    pub fn deny(&self, owner: &Owner) {
        self.denied.lock().unwrap().insert(owner.id);
    }
    pub fn allow(&self, owner: &Owner) {
        self.denied.lock().unwrap().remove(&owner.id);
    }
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock().unwrap() = failing;
    }
}

impl alerts::AccessPolicy for TogglePolicy {
    async fn can_use<'s>(
        &'s self,
        owner_id: uuid::Uuid,
        cadence: models::Cadence,
    ) -> anyhow::Result<alerts::Access> {
        if !cadence.is_gated() {
            return Ok(alerts::Access::Allowed);
        }
        if *self.failing.lock().unwrap() {
            anyhow::bail!("donations ledger timed out");
        }
        Ok(if self.denied.lock().unwrap().contains(&owner_id) {
            alerts::Access::Denied
        } else {
            alerts::Access::Allowed
        })
    }
}
