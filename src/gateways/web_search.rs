//! Web search backends
//!
//! - [`DuckDuckGoSearch`]: keyless search through daedra
//! - [`BraveSearch`]: Brave Search REST API, subscription token required

use super::{check_status, decode_json, transport_error, WebSearchBackend};
use crate::types::{ErrorKind, WebResult};
use async_trait::async_trait;
use serde::Deserialize;

const BRAVE_ENDPOINT: &str = "https://api.search.brave.com/res/v1/web/search";

/// DuckDuckGo search via daedra.
#[derive(Debug, Default)]
pub struct DuckDuckGoSearch;

impl DuckDuckGoSearch {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl WebSearchBackend for DuckDuckGoSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<WebResult>, ErrorKind> {
        let search_args = daedra::SearchArgs {
            query: query.to_string(),
            options: Some(daedra::SearchOptions {
                num_results: max_results,
                ..Default::default()
            }),
        };

        let response = daedra::tools::search::perform_search(&search_args)
            .await
            .map_err(|e| ErrorKind::Transport(format!("DuckDuckGo search failed: {}", e)))?;

        Ok(response
            .data
            .iter()
            .take(max_results)
            .map(|r| WebResult {
                title: r.title.to_string(),
                url: r.url.to_string(),
                snippet: r.description.to_string(),
            })
            .collect())
    }

    fn name(&self) -> &str {
        "duckduckgo"
    }
}

#[derive(Deserialize)]
struct BraveResponse {
    #[serde(default)]
    web: Option<BraveWeb>,
}

#[derive(Deserialize)]
struct BraveWeb {
    #[serde(default)]
    results: Vec<BraveHit>,
}

#[derive(Deserialize)]
struct BraveHit {
    title: String,
    url: String,
    #[serde(default)]
    description: String,
}

/// Brave Search API client.
pub struct BraveSearch {
    client: reqwest::Client,
    api_key: String,
    endpoint: String,
}

impl BraveSearch {
    pub fn new(client: reqwest::Client, api_key: String) -> Self {
        Self {
            client,
            api_key,
            endpoint: BRAVE_ENDPOINT.to_string(),
        }
    }

    pub fn with_endpoint(mut self, endpoint: String) -> Self {
        self.endpoint = endpoint;
        self
    }
}

#[async_trait]
impl WebSearchBackend for BraveSearch {
    async fn search(&self, query: &str, max_results: usize) -> Result<Vec<WebResult>, ErrorKind> {
        let count = max_results.to_string();
        let response = self
            .client
            .get(&self.endpoint)
            .header("Accept", "application/json")
            .header("X-Subscription-Token", &self.api_key)
            .query(&[
                ("q", query),
                ("count", count.as_str()),
                ("search_lang", "en"),
                ("safesearch", "strict"),
            ])
            .send()
            .await
            .map_err(transport_error)?;

        let body: BraveResponse = decode_json(check_status(response).await?).await?;

        Ok(body
            .web
            .map(|web| web.results)
            .unwrap_or_default()
            .into_iter()
            .take(max_results)
            .map(|hit| WebResult {
                title: hit.title,
                url: hit.url,
                snippet: hit.description,
            })
            .collect())
    }

    fn name(&self) -> &str {
        "brave"
    }
}
