//! In-memory [`VectorStore`] for tests and throwaway runs.
//!
//! Collections live in a `HashMap` behind `std::sync::RwLock`; search is
//! brute-force cosine similarity over every stored point. Write counters
//! let tests assert how many points a sync touched.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};

use async_trait::async_trait;

use super::{Point, QueryFilter, ScoredPoint, VectorStore};
use crate::embedding::cosine_similarity;
use crate::error::BackendError;

struct Collection {
    dims: usize,
    points: HashMap<String, Point>,
}

#[derive(Default)]
pub struct InMemoryVectorStore {
    collections: RwLock<HashMap<String, Collection>>,
    upserted: AtomicU64,
    deleted: AtomicU64,
}

impl InMemoryVectorStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Points written by `upsert` since creation (including overwrites).
    pub fn upserted_points(&self) -> u64 {
        self.upserted.load(Ordering::SeqCst)
    }

    /// Ids passed to `delete` since creation.
    pub fn deleted_points(&self) -> u64 {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.upserted_points() + self.deleted_points()
    }

    /// Ids currently stored in `collection`, sorted.
    pub fn ids(&self, collection: &str) -> Vec<String> {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<String> = collections
            .get(collection)
            .map(|c| c.points.keys().cloned().collect())
            .unwrap_or_default();
        ids.sort();
        ids
    }

    pub fn get(&self, collection: &str, id: &str) -> Option<Point> {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        collections.get(collection)?.points.get(id).cloned()
    }
}

fn missing(collection: &str) -> BackendError {
    BackendError::Status {
        backend: "memory",
        status: 404,
        body: format!("collection {} not found", collection),
    }
}

#[async_trait]
impl VectorStore for InMemoryVectorStore {
    async fn ensure_collection(&self, collection: &str, dims: usize) -> Result<(), BackendError> {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        match collections.get(collection) {
            Some(existing) if existing.dims != dims => Err(BackendError::Dimension {
                expected: dims,
                actual: existing.dims,
            }),
            Some(_) => Ok(()),
            None => {
                collections.insert(
                    collection.to_string(),
                    Collection {
                        dims,
                        points: HashMap::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn collection_dims(&self, collection: &str) -> Result<Option<usize>, BackendError> {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        Ok(collections.get(collection).map(|c| c.dims))
    }

    async fn upsert(&self, collection: &str, points: &[Point]) -> Result<(), BackendError> {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| missing(collection))?;
        if let Some(bad) = points.iter().find(|p| p.vector.len() != target.dims) {
            return Err(BackendError::Dimension {
                expected: target.dims,
                actual: bad.vector.len(),
            });
        }
        for point in points {
            target.points.insert(point.id.clone(), point.clone());
        }
        self.upserted.fetch_add(points.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, collection: &str, ids: &[String]) -> Result<(), BackendError> {
        let mut collections = self.collections.write().unwrap_or_else(PoisonError::into_inner);
        let target = collections
            .get_mut(collection)
            .ok_or_else(|| missing(collection))?;
        for id in ids {
            target.points.remove(id);
        }
        self.deleted.fetch_add(ids.len() as u64, Ordering::SeqCst);
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<ScoredPoint>, BackendError> {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        let target = collections.get(collection).ok_or_else(|| missing(collection))?;
        if vector.len() != target.dims {
            return Err(BackendError::Dimension {
                expected: target.dims,
                actual: vector.len(),
            });
        }

        let mut hits: Vec<ScoredPoint> = target
            .points
            .values()
            .filter(|p| filter.matches(&p.payload))
            .map(|p| ScoredPoint {
                id: p.id.clone(),
                score: cosine_similarity(vector, &p.vector),
                payload: p.payload.clone(),
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then_with(|| a.payload.path.cmp(&b.payload.path))
                .then_with(|| a.payload.ordinal.cmp(&b.payload.ordinal))
        });
        hits.truncate(k);
        Ok(hits)
    }

    async fn count(&self, collection: &str) -> Result<u64, BackendError> {
        let collections = self.collections.read().unwrap_or_else(PoisonError::into_inner);
        Ok(collections
            .get(collection)
            .map(|c| c.points.len() as u64)
            .unwrap_or(0))
    }
}
