use anyhow::Context;
use models::{Alert, DocumentHit, Owner, PendingNotice};
use notifications::{NotificationEmail, Renderer};

/// Delivery is the Notifier's answer to a request to notify an owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// The notification was durably accepted, and will reach the owner.
    Accepted,
    /// The notification was not accepted, and should be attempted again later.
    Rejected(String),
}

/// Notifier delivers notifications to alert owners.
pub trait Notifier: Send + Sync + 'static {
    /// Deliver one notification to `owner` covering every document of `batch`,
    /// which are new matches of `alert`. `batch` is never empty.
    fn deliver<'s>(
        &'s self,
        owner: &'s Owner,
        alert: &'s Alert,
        batch: &'s [DocumentHit],
    ) -> impl std::future::Future<Output = Delivery> + Send + 's;

    /// Deliver a pending notice about `alert` itself to its `owner`.
    fn notice<'s>(
        &'s self,
        owner: &'s Owner,
        alert: &'s Alert,
        pending: &'s PendingNotice,
    ) -> impl std::future::Future<Output = Delivery> + Send + 's;
}

pub trait EmailSender: std::fmt::Debug + Send + Sync + 'static {
    fn send<'s>(
        &'s self,
        email: NotificationEmail,
    ) -> impl std::future::Future<Output = anyhow::Result<()>> + Send + 's;
}

/// EmailNotifier renders notifications as emails, and sends them.
/// An email is accepted once its sender has accepted it.
#[derive(Debug)]
pub struct EmailNotifier<ES> {
    renderer: Renderer,
    sender: ES,
}

impl<ES: EmailSender> EmailNotifier<ES> {
    pub fn new(dashboard_base_url: &url::Url, sender: ES) -> anyhow::Result<Self> {
        let renderer = Renderer::try_new(dashboard_base_url)?;
        Ok(Self { renderer, sender })
    }

    async fn send(&self, email: anyhow::Result<NotificationEmail>) -> Delivery {
        let result = async {
            let email = email.context("rendering alert email")?;
            let idempotency_key = email.idempotency_key.clone();
            self.sender.send(email).await.with_context(|| {
                format!("sending alert email with idempotency key '{idempotency_key}'")
            })
        }
        .await;

        match result {
            Ok(()) => Delivery::Accepted,
            Err(error) => {
                tracing::warn!(?error, "alert email was not sent");
                Delivery::Rejected(format!("{error:#}"))
            }
        }
    }
}

impl<ES: EmailSender> Notifier for EmailNotifier<ES> {
    async fn deliver<'s>(
        &'s self,
        owner: &'s Owner,
        alert: &'s Alert,
        batch: &'s [DocumentHit],
    ) -> Delivery {
        self.send(self.renderer.render_new_results(owner, alert, batch))
            .await
    }

    async fn notice<'s>(
        &'s self,
        owner: &'s Owner,
        alert: &'s Alert,
        pending: &'s PendingNotice,
    ) -> Delivery {
        self.send(self.renderer.render_notice(owner, alert, pending))
            .await
    }
}

/// Posts each email as JSON to a webhook of the mail transport, which
/// de-duplicates deliveries by their `Idempotency-Key` header.
#[derive(Debug)]
pub struct WebhookSender {
    client: reqwest::Client,
    url: url::Url,
}

impl WebhookSender {
    async fn send(&self, email: NotificationEmail) -> anyhow::Result<()> {
        let response = self
            .client
            .post(self.url.clone())
            .header("Idempotency-Key", email.idempotency_key.as_str())
            .json(&email)
            .send()
            .await
            .context("calling email webhook")?;

        response
            .error_for_status()
            .context("email webhook refused the email")?;

        tracing::debug!(idempotency_key = %email.idempotency_key, to = %email.to, "successfully sent alert email");
        Ok(())
    }
}

#[derive(Debug)]
pub enum Sender {
    Disabled,
    Webhook(WebhookSender),
}

impl Sender {
    pub fn webhook(url: url::Url, client: reqwest::Client) -> Sender {
        Sender::Webhook(WebhookSender { client, url })
    }
}

impl EmailSender for Sender {
    async fn send<'s>(&'s self, email: NotificationEmail) -> anyhow::Result<()> {
        match self {
            Sender::Disabled => {
                tracing::warn!(
                    to = %email.to,
                    subject = %email.subject,
                    idempotency_key = %email.idempotency_key,
                    "skipping sending alert email (disabled)"
                );
                Ok(())
            }
            Sender::Webhook(webhook) => webhook.send(email).await,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeZone, Utc};
    use models::{AlertState, Cadence, Id, Notice};
    use std::sync::Mutex;

    #[derive(Debug, Default)]
    struct Outbox {
        sent: Mutex<Vec<NotificationEmail>>,
        fail: bool,
    }

    impl EmailSender for Outbox {
        async fn send<'s>(&'s self, email: NotificationEmail) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("mail transport is down");
            }
            self.sent.lock().unwrap().push(email);
            Ok(())
        }
    }

    fn fixture() -> (Owner, Alert, Vec<DocumentHit>) {
        let owner = Owner {
            id: uuid::Uuid::from_u128(7),
            email: "reader@example.test".to_string(),
        };
        let at = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let alert = Alert {
            id: Id::new(99),
            owner: owner.clone(),
            name: "Habeas".to_string(),
            query: "habeas corpus".to_string(),
            cadence: Cadence::Weekly,
            state: AlertState::Active,
            watermark: at,
            created_at: at,
            last_run_at: None,
            last_notified_at: None,
            index_failures: 0,
            retry_at: None,
            query_error: None,
            notices: Vec::new(),
        };
        let docs = vec![DocumentHit {
            id: "d1".to_string(),
            title: "Ex parte Doe".to_string(),
            snippet: String::new(),
            url: None,
            timestamp: at,
        }];
        (owner, alert, docs)
    }

    #[tokio::test]
    async fn emails_are_accepted_once_sent() {
        let (owner, alert, docs) = fixture();
        let base = url::Url::parse("https://search.example.test/").unwrap();

        let notifier = EmailNotifier::new(&base, Outbox::default()).unwrap();
        assert_eq!(notifier.deliver(&owner, &alert, &docs).await, Delivery::Accepted);

        let sent = notifier.sender.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].to, "reader@example.test");
        assert_eq!(sent[0].subject, "1 new result for your alert Habeas");
    }

    #[tokio::test]
    async fn send_failures_are_rejections() {
        let (owner, alert, docs) = fixture();
        let base = url::Url::parse("https://search.example.test/").unwrap();
        let outbox = Outbox {
            fail: true,
            ..Default::default()
        };

        let notifier = EmailNotifier::new(&base, outbox).unwrap();
        let Delivery::Rejected(reason) = notifier.deliver(&owner, &alert, &docs).await else {
            panic!("expected a rejection");
        };
        assert!(reason.contains("mail transport is down"));

        let notice = PendingNotice {
            notice: Notice::CadenceDemoted {
                from: Cadence::RealTime,
                to: Cadence::Daily,
            },
            queued_at: alert.created_at,
        };
        assert!(matches!(
            notifier.notice(&owner, &alert, &notice).await,
            Delivery::Rejected(_)
        ));
    }

    #[tokio::test]
    async fn disabled_sender_accepts_everything() {
        let (owner, alert, docs) = fixture();
        let base = url::Url::parse("https://search.example.test/").unwrap();

        let notifier = EmailNotifier::new(&base, Sender::Disabled).unwrap();
        assert_eq!(notifier.deliver(&owner, &alert, &docs).await, Delivery::Accepted);
    }
}
