use super::{check_status, decode_json, transport_error, RetrievalBackend};
use crate::types::{ErrorKind, Passage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Serialize)]
struct SearchRequest<'a> {
    query: &'a str,
    top_k: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    collection: Option<&'a str>,
}

#[derive(Deserialize)]
struct SearchResponse {
    #[serde(default)]
    results: Vec<SearchHit>,
}

#[derive(Deserialize)]
struct SearchHit {
    text: String,
    score: f64,
    #[serde(default)]
    source_id: Option<String>,
}

/// Retrieval index reached over HTTP.
///
/// `POST {endpoint}` with `{"query", "top_k", "collection"}`, answered by
/// `{"results": [{"text", "score", "source_id"}]}`.
pub struct HttpRetrievalBackend {
    client: reqwest::Client,
    endpoint: String,
    collection: Option<String>,
}

impl HttpRetrievalBackend {
    pub fn new(client: reqwest::Client, endpoint: String, collection: Option<String>) -> Self {
        Self {
            client,
            endpoint,
            collection,
        }
    }
}

#[async_trait]
impl RetrievalBackend for HttpRetrievalBackend {
    async fn retrieve(&self, query: &str, top_k: usize) -> Result<Vec<Passage>, ErrorKind> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(&SearchRequest {
                query,
                top_k,
                collection: self.collection.as_deref(),
            })
            .send()
            .await
            .map_err(transport_error)?;

        let body: SearchResponse = decode_json(check_status(response).await?).await?;
        normalize_hits(body.results, top_k)
    }

    fn name(&self) -> &str {
        "http-retrieval"
    }
}

/// Sort best first, clamp scores into [0, 1] and keep `top_k`.
fn normalize_hits(hits: Vec<SearchHit>, top_k: usize) -> Result<Vec<Passage>, ErrorKind> {
    let mut passages = Vec::with_capacity(hits.len());
    for (i, hit) in hits.into_iter().enumerate() {
        if !hit.score.is_finite() {
            return Err(ErrorKind::Malformed(format!(
                "non-finite score for result {}",
                i
            )));
        }
        passages.push(Passage {
            text: hit.text,
            score: hit.score.clamp(0.0, 1.0),
            source_id: hit.source_id.unwrap_or_else(|| format!("passage-{}", i + 1)),
        });
    }

    passages.sort_by(|a, b| b.score.total_cmp(&a.score));
    passages.truncate(top_k);
    Ok(passages)
}
