//! Qdrant REST client.
//!
//! | Operation | Request |
//! |-----------|---------|
//! | collection info | `GET /collections/{c}` |
//! | create | `PUT /collections/{c}` with `{"vectors": {"size", "distance": "Cosine"}}` |
//! | upsert | `PUT /collections/{c}/points?wait=true` |
//! | delete | `POST /collections/{c}/points/delete?wait=true` |
//! | search | `POST /collections/{c}/points/search` |
//! | count | `POST /collections/{c}/points/count` |
//!
//! Exact-path and timestamp predicates are sent as a Qdrant `filter`.
//! Prefix matching has no keyword-index equivalent, so it is applied to an
//! over-fetched result set on the client side.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};

use super::{Point, PointPayload, QueryFilter, ScoredPoint, VectorStore};
use crate::config::VectorStoreConfig;
use crate::error::{status_error, BackendError};

const BACKEND: &str = "qdrant";
/// Over-fetch factor when a prefix filter must be applied locally.
const PREFIX_OVERFETCH: usize = 4;

pub struct QdrantStore {
    http: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl QdrantStore {
    pub fn new(config: &VectorStoreConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(env) = &config.api_key_env {
            let key = std::env::var(env)
                .with_context(|| format!("{} environment variable not set", env))?;
            headers.insert("api-key", HeaderValue::from_str(&key)?);
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            http,
            base_url: config.url.trim_end_matches('/').to_string(),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    fn url(&self, collection: &str, suffix: &str) -> String {
        format!("{}/collections/{}{}", self.base_url, collection, suffix)
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, BackendError> {
        request
            .send()
            .await
            .map_err(|e| BackendError::from_reqwest(BACKEND, e, self.timeout))
    }

    async fn json<T: for<'de> Deserialize<'de>>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, BackendError> {
        if !response.status().is_success() {
            return Err(status_error(BACKEND, response).await);
        }
        response
            .json::<T>()
            .await
            .map_err(|e| BackendError::from_reqwest(BACKEND, e, self.timeout))
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct SearchHit {
    id: Value,
    score: f32,
    payload: Option<PointPayload>,
}

#[derive(Deserialize)]
struct CountResult {
    count: u64,
}

/// `result.config.params.vectors.size` of a collection-info response.
fn vector_size(info: &Value) -> Option<usize> {
    info.pointer("/result/config/params/vectors/size")
        .and_then(|v| v.as_u64())
        .map(|v| v as usize)
}

fn build_filter(filter: &QueryFilter) -> Option<Value> {
    let mut must = Vec::new();
    if !filter.paths.is_empty() {
        must.push(json!({"key": "path", "match": {"any": filter.paths}}));
    }
    if let Some(after) = filter.modified_after {
        must.push(json!({"key": "modified_at", "range": {"gt": after}}));
    }
    if let Some(after) = filter.indexed_after {
        must.push(json!({"key": "indexed_at", "range": {"gt": after}}));
    }
    if must.is_empty() {
        None
    } else {
        Some(json!({ "must": must }))
    }
}

fn point_id(id: &Value) -> String {
    match id {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[async_trait]
impl VectorStore for QdrantStore {
    async fn ensure_collection(&self, collection: &str, dims: usize) -> Result<(), BackendError> {
        if let Some(existing) = self.collection_dims(collection).await? {
            if existing != dims {
                return Err(BackendError::Dimension {
                    expected: dims,
                    actual: existing,
                });
            }
            return Ok(());
        }

        let body = json!({
            "vectors": {
                "size": dims,
                "distance": "Cosine"
            }
        });
        let response = self
            .send(self.http.put(self.url(collection, "")).json(&body))
            .await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED | StatusCode::CONFLICT => {
                tracing::info!(collection, dims, "qdrant collection ready");
                Ok(())
            }
            _ => Err(status_error(BACKEND, response).await),
        }
    }

    async fn collection_dims(&self, collection: &str) -> Result<Option<usize>, BackendError> {
        let response = self.send(self.http.get(self.url(collection, ""))).await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let info: Value = self.json(response).await?;
        vector_size(&info)
            .map(Some)
            .ok_or_else(|| BackendError::protocol(BACKEND, "collection info has no vector size"))
    }

    async fn upsert(&self, collection: &str, points: &[Point]) -> Result<(), BackendError> {
        if points.is_empty() {
            return Ok(());
        }
        let points: Vec<Value> = points
            .iter()
            .map(|p| json!({"id": p.id, "vector": p.vector, "payload": p.payload}))
            .collect();
        let response = self
            .send(
                self.http
                    .put(self.url(collection, "/points"))
                    .query(&[("wait", "true")])
                    .json(&json!({ "points": points })),
            )
            .await?;
        let _: Envelope<Value> = self.json(response).await?;
        Ok(())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), BackendError> {
        if ids.is_empty() {
            return Ok(());
        }
        let response = self
            .send(
                self.http
                    .post(self.url(collection, "/points/delete"))
                    .query(&[("wait", "true")])
                    .json(&json!({ "points": ids })),
            )
            .await?;
        let _: Envelope<Value> = self.json(response).await?;
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<ScoredPoint>, BackendError> {
        let limit = if filter.path_prefix.is_some() {
            k.saturating_mul(PREFIX_OVERFETCH)
        } else {
            k
        };
        let mut body = json!({
            "vector": vector,
            "limit": limit.max(1),
            "with_payload": true,
        });
        if let Some(f) = build_filter(filter) {
            body["filter"] = f;
        }

        let response = self
            .send(
                self.http
                    .post(self.url(collection, "/points/search"))
                    .json(&body),
            )
            .await?;
        let envelope: Envelope<Vec<SearchHit>> = self.json(response).await?;

        let mut hits = Vec::with_capacity(k);
        for hit in envelope.result {
            let Some(payload) = hit.payload else {
                return Err(BackendError::protocol(BACKEND, "search hit without payload"));
            };
            if !filter.matches(&payload) {
                continue;
            }
            hits.push(ScoredPoint {
                id: point_id(&hit.id),
                score: hit.score,
                payload,
            });
            if hits.len() == k {
                break;
            }
        }
        Ok(hits)
    }

    async fn count(&self, collection: &str) -> Result<u64, BackendError> {
        let response = self
            .send(
                self.http
                    .post(self.url(collection, "/points/count"))
                    .json(&json!({ "exact": true })),
            )
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(0);
        }
        let envelope: Envelope<CountResult> = self.json(response).await?;
        Ok(envelope.result.count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vector_size_from_collection_info() {
        let info = json!({
            "result": {
                "status": "green",
                "config": {"params": {"vectors": {"size": 384, "distance": "Cosine"}}}
            },
            "status": "ok"
        });
        assert_eq!(vector_size(&info), Some(384));
        assert_eq!(vector_size(&json!({"result": {}})), None);
    }

    #[test]
    fn test_filter_translation() {
        assert!(build_filter(&QueryFilter::default()).is_none());

        let filter = QueryFilter {
            paths: vec!["a.md".to_string()],
            path_prefix: Some("notes/".to_string()),
            modified_after: None,
            indexed_after: Some(1_700_000_000),
        };
        let built = build_filter(&filter).unwrap();
        let must = built["must"].as_array().unwrap();
        assert_eq!(must.len(), 2);
        assert_eq!(must[0]["match"]["any"][0], "a.md");
        assert_eq!(must[1]["key"], "indexed_at");
        assert_eq!(must[1]["range"]["gt"], 1_700_000_000);
    }

    #[test]
    fn test_search_hit_parsing() {
        let body = json!({
            "result": [{
                "id": "5c56c793-69f3-4fbf-87e6-c4bf54c28c26",
                "version": 3,
                "score": 0.87,
                "payload": {
                    "path": "notes/a.md",
                    "ordinal": 2,
                    "text": "hello",
                    "fingerprint": "ab",
                    "format": "markdown",
                    "modified_at": 10,
                    "indexed_at": 20
                }
            }],
            "status": "ok",
            "time": 0.001
        });
        let parsed: Envelope<Vec<SearchHit>> = serde_json::from_value(body).unwrap();
        let hit = &parsed.result[0];
        assert_eq!(point_id(&hit.id), "5c56c793-69f3-4fbf-87e6-c4bf54c28c26");
        assert_eq!(hit.payload.as_ref().unwrap().ordinal, 2);
        assert!(hit.payload.as_ref().unwrap().metadata.is_empty());
    }

    #[test]
    fn test_new_trims_trailing_slash() {
        let config = VectorStoreConfig {
            url: "http://localhost:6333/".to_string(),
            ..VectorStoreConfig::default()
        };
        let store = QdrantStore::new(&config).unwrap();
        assert_eq!(
            store.url("notes", "/points"),
            "http://localhost:6333/collections/notes/points"
        );
    }
}
