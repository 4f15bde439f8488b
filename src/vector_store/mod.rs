//! Vector store abstraction.
//!
//! The synchronizer and the retrieval engine talk to the index only through
//! [`VectorStore`]. Two implementations ship:
//!
//! - [`QdrantStore`]: Qdrant over its REST API (cosine distance).
//! - [`InMemoryVectorStore`]: brute-force cosine search in process memory,
//!   used by tests and for throwaway local runs.
//!
//! Points carry a [`PointPayload`] with the provenance the query path needs
//! (path, ordinal, text) plus the timestamps used by [`QueryFilter`].

mod memory;
mod qdrant;

pub use memory::InMemoryVectorStore;
pub use qdrant::QdrantStore;

use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::VectorStoreConfig;
use crate::error::BackendError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointPayload {
    pub path: String,
    pub ordinal: usize,
    pub text: String,
    pub fingerprint: String,
    pub format: String,
    /// Source file mtime, unix seconds.
    pub modified_at: i64,
    /// When the point was written, unix seconds.
    pub indexed_at: i64,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Point {
    pub id: String,
    pub vector: Vec<f32>,
    pub payload: PointPayload,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScoredPoint {
    pub id: String,
    pub score: f32,
    pub payload: PointPayload,
}

/// Recency and source-path predicates applied at query time. All set
/// fields must match.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueryFilter {
    /// Exact corpus-relative paths.
    pub paths: Vec<String>,
    pub path_prefix: Option<String>,
    pub modified_after: Option<i64>,
    pub indexed_after: Option<i64>,
}

impl QueryFilter {
    pub fn matches(&self, payload: &PointPayload) -> bool {
        if !self.paths.is_empty() && !self.paths.iter().any(|p| p == &payload.path) {
            return false;
        }
        if let Some(prefix) = &self.path_prefix {
            if !payload.path.starts_with(prefix.as_str()) {
                return false;
            }
        }
        if let Some(after) = self.modified_after {
            if payload.modified_at <= after {
                return false;
            }
        }
        if let Some(after) = self.indexed_after {
            if payload.indexed_at <= after {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Create `collection` with cosine distance if it does not exist. An
    /// existing collection with a different dimension is a
    /// [`BackendError::Dimension`].
    async fn ensure_collection(&self, collection: &str, dims: usize) -> Result<(), BackendError>;

    /// Vector size of an existing collection, `None` if it does not exist.
    async fn collection_dims(&self, collection: &str) -> Result<Option<usize>, BackendError>;

    /// Insert or replace points by id.
    async fn upsert(&self, collection: &str, points: &[Point]) -> Result<(), BackendError>;

    /// Delete points by id. Unknown ids are ignored.
    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), BackendError>;

    /// Up to `k` nearest points matching `filter`, best first.
    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<ScoredPoint>, BackendError>;

    /// Number of points in `collection`; 0 if it does not exist.
    async fn count(&self, collection: &str) -> Result<u64, BackendError>;
}

pub fn create_store(config: &VectorStoreConfig) -> Result<Arc<dyn VectorStore>> {
    match config.provider.as_str() {
        "qdrant" => Ok(Arc::new(QdrantStore::new(config)?)),
        "memory" => Ok(Arc::new(InMemoryVectorStore::new())),
        other => bail!("Unknown vector store provider: {}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn payload(path: &str, modified_at: i64, indexed_at: i64) -> PointPayload {
        PointPayload {
            path: path.to_string(),
            ordinal: 0,
            text: String::new(),
            fingerprint: String::new(),
            format: "markdown".to_string(),
            modified_at,
            indexed_at,
            metadata: Default::default(),
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = QueryFilter::default();
        assert!(filter.matches(&payload("a.md", 0, 0)));
    }

    #[test]
    fn test_path_predicates() {
        let filter = QueryFilter {
            path_prefix: Some("journal/".to_string()),
            ..Default::default()
        };
        assert!(filter.matches(&payload("journal/2024-01-01.md", 0, 0)));
        assert!(!filter.matches(&payload("projects/x.md", 0, 0)));

        let filter = QueryFilter {
            paths: vec!["a.md".to_string(), "b.md".to_string()],
            ..Default::default()
        };
        assert!(filter.matches(&payload("b.md", 0, 0)));
        assert!(!filter.matches(&payload("c.md", 0, 0)));
    }

    #[test]
    fn test_recency_predicates() {
        let filter = QueryFilter {
            modified_after: Some(100),
            indexed_after: Some(200),
            ..Default::default()
        };
        assert!(filter.matches(&payload("a.md", 101, 201)));
        assert!(!filter.matches(&payload("a.md", 100, 201)));
        assert!(!filter.matches(&payload("a.md", 101, 150)));
    }

    #[test]
    fn test_create_store_rejects_unknown_provider() {
        let config = VectorStoreConfig {
            provider: "pinecone".to_string(),
            ..VectorStoreConfig::default()
        };
        assert!(create_store(&config).is_err());
    }
}
