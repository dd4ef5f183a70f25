use anyhow::Context;
use models::Cadence;

/// Access is the answer of an AccessPolicy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied,
}

/// AccessPolicy decides which cadences an owner may use.
pub trait AccessPolicy: Send + Sync + 'static {
    /// May `owner_id` use `cadence`? An error means the answer isn't known
    /// right now, and is distinct from Denied.
    fn can_use<'s>(
        &'s self,
        owner_id: uuid::Uuid,
        cadence: Cadence,
    ) -> impl std::future::Future<Output = anyhow::Result<Access>> + Send + 's;
}

/// DonationStatus is the external record of owners' donations.
pub trait DonationStatus: Send + Sync + 'static {
    fn meets_real_time_threshold<'s>(
        &'s self,
        owner_id: uuid::Uuid,
    ) -> impl std::future::Future<Output = anyhow::Result<bool>> + Send + 's;
}

/// DonationGate allows real-time alerts to owners whose donations meet the
/// real-time threshold. All other cadences are free. Donation status is
/// consulted on every check and never cached.
#[derive(Debug)]
pub struct DonationGate<D> {
    donations: D,
}

impl<D: DonationStatus> DonationGate<D> {
    pub fn new(donations: D) -> Self {
        Self { donations }
    }

    pub fn donations(&self) -> &D {
        &self.donations
    }
}

impl<D: DonationStatus> AccessPolicy for DonationGate<D> {
    async fn can_use<'s>(&'s self, owner_id: uuid::Uuid, cadence: Cadence) -> anyhow::Result<Access> {
        if !cadence.is_gated() {
            return Ok(Access::Allowed);
        }
        let meets = self
            .donations
            .meets_real_time_threshold(owner_id)
            .await
            .with_context(|| format!("checking donation status of owner {owner_id}"))?;

        Ok(if meets { Access::Allowed } else { Access::Denied })
    }
}

/// Answers every donation check the same way.
#[derive(Debug, Clone, Copy)]
pub struct FixedDonations(pub bool);

impl DonationStatus for FixedDonations {
    async fn meets_real_time_threshold<'s>(&'s self, _owner_id: uuid::Uuid) -> anyhow::Result<bool> {
        Ok(self.0)
    }
}

/// Queries a donations API over HTTP, as
/// `GET {base}/owners/{owner_id}/real-time` returning `{"qualified": bool}`.
/// Unknown owners (404) have not donated.
#[derive(Debug, Clone)]
pub struct HttpDonationStatus {
    client: reqwest::Client,
    base_url: url::Url,
}

#[derive(serde::Deserialize)]
struct DonationResponse {
    qualified: bool,
}

impl HttpDonationStatus {
    pub fn new(client: reqwest::Client, base_url: url::Url) -> Self {
        Self { client, base_url }
    }

    fn owner_url(&self, owner_id: uuid::Uuid) -> anyhow::Result<url::Url> {
        self.base_url
            .join(&format!("owners/{owner_id}/real-time"))
            .context("building donation status URL")
    }
}

impl DonationStatus for HttpDonationStatus {
    async fn meets_real_time_threshold<'s>(&'s self, owner_id: uuid::Uuid) -> anyhow::Result<bool> {
        let response = self
            .client
            .get(self.owner_url(owner_id)?)
            .send()
            .await
            .context("requesting donation status")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        let DonationResponse { qualified } = response
            .error_for_status()
            .context("donation status request failed")?
            .json()
            .await
            .context("decoding donation status response")?;

        Ok(qualified)
    }
}

/// The donation sources which the alert agent may be configured with.
#[derive(Debug)]
pub enum ConfiguredDonations {
    Fixed(FixedDonations),
    Http(HttpDonationStatus),
}

impl DonationStatus for ConfiguredDonations {
    async fn meets_real_time_threshold<'s>(&'s self, owner_id: uuid::Uuid) -> anyhow::Result<bool> {
        match self {
            ConfiguredDonations::Fixed(fixed) => fixed.meets_real_time_threshold(owner_id).await,
            ConfiguredDonations::Http(http) => http.meets_real_time_threshold(owner_id).await,
        }
    }
}
