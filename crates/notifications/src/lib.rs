//! Rendering of the emails which alerts send to their owners.
//!
//! Each kind of email has a module which registers a subject and a body
//! template. Bodies are HTML, and are rendered with HTML escaping.
//! Subjects are plain text and must use triple-stash expressions.
use anyhow::Context;
use handlebars::{handlebars_helper, Handlebars};
use models::{Alert, DocumentHit, Notice, Owner, PendingNotice};
use serde::Serialize;
use sha2::Digest;

mod cadence_demoted;
mod new_results;
mod query_error;

/// Maximum number of documents listed in the body of a new-results email.
/// Further documents are summarized by count.
pub const MAX_LISTED_DOCUMENTS: usize = 20;

/// A rendered email, ready to be sent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NotificationEmail {
    /// Stable key of this email's content. Re-sending an email with the same
    /// key must not produce a duplicate message.
    pub idempotency_key: String,
    pub to: String,
    pub subject: String,
    pub body: String,
}

/// Returns the (subject, body) template names of the email `kind`.
pub(crate) fn template_names(kind: &str) -> (String, String) {
    (format!("{kind}-subject"), format!("{kind}-body"))
}

handlebars_helper!(pluralize: |count: u64, word: String| {
    if count == 1 { word } else { format!("{word}s") }
});

#[derive(Serialize)]
struct AlertArgs<'a> {
    id: String,
    name: &'a str,
    query: &'a str,
    cadence: &'a str,
}

impl<'a> From<&'a Alert> for AlertArgs<'a> {
    fn from(alert: &'a Alert) -> Self {
        AlertArgs {
            id: alert.id.to_string(),
            name: &alert.name,
            query: &alert.query,
            cadence: cadence_label(alert.cadence),
        }
    }
}

fn cadence_label(cadence: models::Cadence) -> &'static str {
    match cadence {
        models::Cadence::RealTime => "real time",
        models::Cadence::Daily => "daily",
        models::Cadence::Weekly => "weekly",
        models::Cadence::Monthly => "monthly",
    }
}

#[derive(Debug)]
pub struct Renderer {
    registry: Handlebars<'static>,
}

impl Renderer {
    /// Build a Renderer whose emails link to alerts under `dashboard_base_url`.
    pub fn try_new(dashboard_base_url: &url::Url) -> anyhow::Result<Self> {
        let mut registry = Handlebars::new();
        registry.set_strict_mode(true);
        registry.register_helper("pluralize", Box::new(pluralize));

        let alerts_url = dashboard_base_url
            .join("alerts/")
            .context("building alerts dashboard URL")?;
        registry
            .register_partial("alert_url", format!("{alerts_url}{{{{alert.id}}}}"))
            .context("registering alert_url partial")?;
        registry
            .register_partial(
                "footer",
                r#"<p class="footer-text">You are receiving this email because you created the alert <span class="identifier">{{alert.name}}</span>. <a href="{{> alert_url}}">Edit or delete this alert</a>.</p>"#,
            )
            .context("registering footer partial")?;

        new_results::register_templates(&mut registry)?;
        cadence_demoted::register_templates(&mut registry)?;
        query_error::register_templates(&mut registry)?;

        Ok(Self { registry })
    }

    /// Render the email which notifies `owner` of new `documents` matched by `alert`.
    pub fn render_new_results(
        &self,
        owner: &Owner,
        alert: &Alert,
        documents: &[DocumentHit],
    ) -> anyhow::Result<NotificationEmail> {
        let listed = &documents[..documents.len().min(MAX_LISTED_DOCUMENTS)];

        let args = serde_json::json!({
            "alert": AlertArgs::from(alert),
            "count": documents.len(),
            "documents": listed.iter().map(|doc| serde_json::json!({
                "title": doc.title,
                "snippet": doc.snippet,
                "url": doc.url,
                "date": doc.timestamp.format("%B %-d, %Y").to_string(),
            })).collect::<Vec<_>>(),
            "more": documents.len() - listed.len(),
        });

        let mut hasher = sha2::Sha256::new();
        hasher.update(b"new_results\0");
        hasher.update(alert.id.to_string().as_bytes());
        let mut ids: Vec<&str> = documents.iter().map(|doc| doc.id.as_str()).collect();
        ids.sort_unstable();
        for id in ids {
            hasher.update(b"\0");
            hasher.update(id.as_bytes());
        }

        self.render(new_results::KIND, owner, &args, hasher)
    }

    /// Render the email which delivers a pending notice about `alert` to its `owner`.
    /// Each queued notice has its own idempotency key, even if an earlier
    /// notice of the alert had identical content.
    pub fn render_notice(
        &self,
        owner: &Owner,
        alert: &Alert,
        pending: &PendingNotice,
    ) -> anyhow::Result<NotificationEmail> {
        let (kind, args) = match &pending.notice {
            Notice::CadenceDemoted { from, to } => (
                cadence_demoted::KIND,
                serde_json::json!({
                    "alert": AlertArgs::from(alert),
                    "from": cadence_label(*from),
                    "to": cadence_label(*to),
                }),
            ),
            Notice::QueryError { message } => (
                query_error::KIND,
                serde_json::json!({
                    "alert": AlertArgs::from(alert),
                    "message": message,
                }),
            ),
        };

        let mut hasher = sha2::Sha256::new();
        hasher.update(b"notice\0");
        hasher.update(alert.id.to_string().as_bytes());
        hasher.update(b"\0");
        hasher.update(serde_json::to_vec(&pending.notice).context("encoding notice")?);
        hasher.update(b"\0");
        hasher.update(pending.queued_at.timestamp_millis().to_be_bytes());

        self.render(kind, owner, &args, hasher)
    }

    fn render(
        &self,
        kind: &str,
        owner: &Owner,
        args: &serde_json::Value,
        hasher: sha2::Sha256,
    ) -> anyhow::Result<NotificationEmail> {
        let (subject_name, body_name) = template_names(kind);

        let subject = self
            .registry
            .render(&subject_name, args)
            .with_context(|| format!("rendering {subject_name} template"))?;
        let body = self
            .registry
            .render(&body_name, args)
            .with_context(|| format!("rendering {body_name} template"))?;

        Ok(NotificationEmail {
            idempotency_key: hex::encode(hasher.finalize()),
            to: owner.email.clone(),
            subject: subject.trim().to_string(),
            body,
        })
    }
}
