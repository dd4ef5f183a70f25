use anyhow::Context;
use chrono::{DateTime, Utc};
use models::DocumentHit;

#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    /// The index could not be reached or failed. The query may be retried.
    #[error("search index is unavailable")]
    IndexUnavailable(#[source] anyhow::Error),
    /// The index rejected the query itself. Retrying it cannot succeed.
    #[error("query was rejected by the search index: {0}")]
    QuerySyntax(String),
}

/// SearchIndex runs alert queries against the live document index.
pub trait SearchIndex: Send + Sync + 'static {
    /// Run `query`, returning documents which became visible at or after
    /// `since`, ordered by their timestamp. Repeated calls may return
    /// documents which were returned before.
    fn run<'s>(
        &'s self,
        query: &'s str,
        since: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<Vec<DocumentHit>, SearchError>> + Send + 's;
}

/// Runs queries against a JSON search API which is paged by cursor:
/// `GET {endpoint}?q=..&since=..&order_by=timestamp+asc[&cursor=..]` returning
/// `{"results": [DocumentHit..], "next": "cursor"}`.
///
/// Pages are requested oldest first. Results beyond `max_pages` are then all
/// at or after the latest returned timestamp, and remain ahead of the watermark.
#[derive(Debug, Clone)]
pub struct HttpSearchIndex {
    client: reqwest::Client,
    endpoint: url::Url,
    max_pages: usize,
}

#[derive(serde::Deserialize)]
struct SearchPage {
    results: Vec<DocumentHit>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(serde::Deserialize)]
struct SearchFailure {
    #[serde(alias = "detail", alias = "message")]
    error: String,
}

impl HttpSearchIndex {
    pub fn new(client: reqwest::Client, endpoint: url::Url, max_pages: usize) -> Self {
        Self {
            client,
            endpoint,
            max_pages: max_pages.max(1),
        }
    }

    fn page_url(&self, query: &str, since: DateTime<Utc>, cursor: Option<&str>) -> url::Url {
        let mut url = self.endpoint.clone();
        {
            let mut params = url.query_pairs_mut();
            params.append_pair("q", query);
            params.append_pair(
                "since",
                &since.to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            );
            params.append_pair("order_by", "timestamp asc");
            if let Some(cursor) = cursor {
                params.append_pair("cursor", cursor);
            }
        }
        url
    }

    async fn fetch_page(&self, url: url::Url) -> Result<SearchPage, SearchError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .context("requesting search page")
            .map_err(SearchError::IndexUnavailable)?;

        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST {
            let body = response.text().await.unwrap_or_default();
            return Err(SearchError::QuerySyntax(syntax_message(&body)));
        }
        let response = response
            .error_for_status()
            .context("search request failed")
            .map_err(SearchError::IndexUnavailable)?;

        response
            .json()
            .await
            .context("decoding search page")
            .map_err(SearchError::IndexUnavailable)
    }
}

impl SearchIndex for HttpSearchIndex {
    #[tracing::instrument(skip_all, fields(%since, pages = tracing::field::Empty))]
    async fn run<'s>(
        &'s self,
        query: &'s str,
        since: DateTime<Utc>,
    ) -> Result<Vec<DocumentHit>, SearchError> {
        let mut hits = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0;

        loop {
            let page = self
                .fetch_page(self.page_url(query, since, cursor.as_deref()))
                .await?;
            pages += 1;
            hits.extend(page.results.into_iter().filter(|hit| hit.timestamp >= since));

            match page.next {
                Some(next) if pages < self.max_pages => cursor = Some(next),
                Some(_) => {
                    // Pages are in ascending order, so the remaining pages hold
                    // no document older than those returned. The next run
                    // picks them up from the advanced watermark.
                    tracing::warn!(pages, "search results exceed the page limit");
                    break;
                }
                None => break,
            }
        }
        tracing::Span::current().record("pages", pages);

        sort_hits(&mut hits);
        Ok(hits)
    }
}

/// Order hits by timestamp, breaking ties by document id.
pub(crate) fn sort_hits(hits: &mut [DocumentHit]) {
    hits.sort_by(|l, r| (l.timestamp, &l.id).cmp(&(r.timestamp, &r.id)));
}

fn syntax_message(body: &str) -> String {
    match serde_json::from_str::<SearchFailure>(body) {
        Ok(SearchFailure { error }) => error,
        Err(_) if !body.trim().is_empty() => body.trim().to_string(),
        Err(_) => "the query could not be parsed".to_string(),
    }
}
