//! Retrieval engine.
//!
//! Embeds a query with the same backend used for indexing, asks the vector
//! store for the nearest chunks, ranks them and assembles a context block
//! that fits the configured token budget.
//!
//! # Ranking
//!
//! Score descending, then path ascending, then ordinal ascending. Passages
//! below `retrieval.min_score` are discarded before assembly.
//!
//! # Budget
//!
//! Passages are appended in ranked order. The first passage that would push
//! the block over `token_budget` is dropped together with every passage
//! after it; passages are never cut mid-text.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

use crate::chunk::{estimate_tokens, CHARS_PER_TOKEN};
use crate::config::RetrievalConfig;
use crate::error::BackendError;
use crate::orchestrator::EmbeddingOrchestrator;
use crate::retry::RetryPolicy;
use crate::vector_store::{QueryFilter, ScoredPoint, VectorStore};

/// Separator between passages of a question-answering context.
pub const SOURCE_SEPARATOR: &str = "\n\n---\n\n";
const NOTE_SEPARATOR: &str = "\n\n";
/// Query used to pull recently indexed notes for the daily summary.
pub const RECENT_QUERY: &str = "recent updates";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Passage {
    pub path: String,
    pub chunk_id: String,
    pub ordinal: usize,
    pub score: f32,
    pub text: String,
    pub modified_at: i64,
    /// `title` from the note's front matter.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RetrievedContext {
    pub context: String,
    /// Passages included in `context`, in ranked order.
    pub passages: Vec<Passage>,
    /// True when passages were dropped to respect the budget.
    pub truncated: bool,
    pub dropped: usize,
}

impl RetrievedContext {
    pub fn is_empty(&self) -> bool {
        self.passages.is_empty()
    }

    pub fn tokens(&self) -> usize {
        estimate_tokens(&self.context)
    }
}

/// Convert store hits into ranked passages.
pub fn rank(hits: Vec<ScoredPoint>, min_score: Option<f32>) -> Vec<Passage> {
    let mut passages: Vec<Passage> = hits
        .into_iter()
        .filter(|hit| min_score.map_or(true, |min| hit.score >= min))
        .map(|hit| Passage {
            title: hit
                .payload
                .metadata
                .get("title")
                .and_then(|v| v.as_str())
                .map(str::to_string),
            path: hit.payload.path,
            chunk_id: hit.id,
            ordinal: hit.payload.ordinal,
            score: hit.score,
            text: hit.payload.text,
            modified_at: hit.payload.modified_at,
        })
        .collect();

    passages.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| a.path.cmp(&b.path))
            .then_with(|| a.ordinal.cmp(&b.ordinal))
    });
    passages
}

/// Join rendered passages until the next one would exceed `budget` tokens.
pub fn assemble<F>(passages: Vec<Passage>, budget: usize, separator: &str, render: F) -> RetrievedContext
where
    F: Fn(usize, &Passage) -> String,
{
    let total = passages.len();
    let mut context = String::new();
    let mut included = Vec::with_capacity(total);

    for passage in passages {
        let piece = render(included.len(), &passage);
        let added = if context.is_empty() {
            piece.len()
        } else {
            separator.len() + piece.len()
        };
        if (context.len() + added).div_ceil(CHARS_PER_TOKEN) > budget {
            break;
        }
        if !context.is_empty() {
            context.push_str(separator);
        }
        context.push_str(&piece);
        included.push(passage);
    }

    let dropped = total - included.len();
    RetrievedContext {
        context,
        passages: included,
        truncated: dropped > 0,
        dropped,
    }
}

fn render_source(_: usize, passage: &Passage) -> String {
    format!("Source: {}\nContent: {}", passage.path, passage.text)
}

fn render_note(index: usize, passage: &Passage) -> String {
    let modified = Utc
        .timestamp_opt(passage.modified_at, 0)
        .single()
        .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    format!(
        "--- Note {}: {} ---\nSource: {}\nLast Modified: {}\n\n{}",
        index + 1,
        passage.title.as_deref().unwrap_or("Untitled"),
        passage.path,
        modified,
        passage.text
    )
}

#[derive(Clone)]
pub struct RetrievalEngine {
    orchestrator: EmbeddingOrchestrator,
    store: Arc<dyn VectorStore>,
    collection: String,
    policy: RetryPolicy,
    config: RetrievalConfig,
}

impl RetrievalEngine {
    pub fn new(
        orchestrator: EmbeddingOrchestrator,
        store: Arc<dyn VectorStore>,
        collection: impl Into<String>,
        config: &RetrievalConfig,
        policy: RetryPolicy,
    ) -> Self {
        Self {
            orchestrator,
            store,
            collection: collection.into(),
            policy,
            config: config.clone(),
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Top-`k` passages for `query` as a budgeted `Source:/Content:` block.
    pub async fn retrieve(
        &self,
        query: &str,
        k: usize,
        filter: &QueryFilter,
    ) -> Result<RetrievedContext, BackendError> {
        if query.trim().is_empty() || k == 0 {
            return Ok(RetrievedContext::default());
        }
        let vector = self.orchestrator.embed_query(query).await?;
        let hits = self.search(&vector, k, filter).await?;
        let passages = rank(hits, self.config.min_score);
        tracing::debug!(query, k, hits = passages.len(), "retrieved passages");
        Ok(assemble(
            passages,
            self.config.token_budget,
            SOURCE_SEPARATOR,
            render_source,
        ))
    }

    /// Notes indexed after `since`, one passage per path, formatted for
    /// summarization.
    pub async fn recent(&self, since: DateTime<Utc>) -> Result<RetrievedContext, BackendError> {
        let vector = self.orchestrator.embed_query(RECENT_QUERY).await?;
        let filter = QueryFilter {
            indexed_after: Some(since.timestamp()),
            ..QueryFilter::default()
        };
        let hits = self.search(&vector, self.config.summary_k, &filter).await?;

        let mut seen = HashSet::new();
        let passages: Vec<Passage> = rank(hits, None)
            .into_iter()
            .filter(|p| seen.insert(p.path.clone()))
            .collect();
        Ok(assemble(
            passages,
            self.config.token_budget,
            NOTE_SEPARATOR,
            render_note,
        ))
    }

    async fn search(
        &self,
        vector: &[f32],
        k: usize,
        filter: &QueryFilter,
    ) -> Result<Vec<ScoredPoint>, BackendError> {
        let store = self.store.as_ref();
        let collection = self.collection.as_str();

        let dims = self
            .policy
            .run("vector-store", move || store.collection_dims(collection))
            .await?;
        match dims {
            None => return Ok(Vec::new()),
            Some(dims) if dims != vector.len() => {
                return Err(BackendError::Dimension {
                    expected: dims,
                    actual: vector.len(),
                })
            }
            Some(_) => {}
        }

        self.policy
            .run("vector-query", move || store.query(collection, vector, k, filter))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EmbeddingConfig;
    use crate::embedding::EmbeddingBackend;
    use crate::vector_store::{InMemoryVectorStore, Point, PointPayload};
    use async_trait::async_trait;

    /// Two-dimensional embedder: "alpha" points right, anything else up.
    struct Axis {
        dims: usize,
    }

    #[async_trait]
    impl EmbeddingBackend for Axis {
        fn model_name(&self) -> &str {
            "axis"
        }

        fn dims(&self) -> usize {
            self.dims
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, BackendError> {
            Ok(texts
                .iter()
                .map(|t| {
                    let mut v = vec![0.0; self.dims];
                    if t.contains("alpha") {
                        v[0] = 1.0;
                    } else {
                        v[1] = 1.0;
                    }
                    v
                })
                .collect())
        }
    }

    fn passage(path: &str, ordinal: usize, score: f32, text: &str) -> Passage {
        Passage {
            path: path.to_string(),
            chunk_id: format!("{}#{}", path, ordinal),
            ordinal,
            score,
            text: text.to_string(),
            modified_at: 0,
            title: None,
        }
    }

    fn hit(path: &str, ordinal: usize, score: f32) -> ScoredPoint {
        ScoredPoint {
            id: format!("{}#{}", path, ordinal),
            score,
            payload: PointPayload {
                path: path.to_string(),
                ordinal,
                text: String::new(),
                fingerprint: String::new(),
                format: "markdown".to_string(),
                modified_at: 0,
                indexed_at: 0,
                metadata: Default::default(),
            },
        }
    }

    fn engine(store: Arc<InMemoryVectorStore>, dims: usize, budget: usize) -> RetrievalEngine {
        let orchestrator = EmbeddingOrchestrator::new(
            Arc::new(Axis { dims }),
            &EmbeddingConfig::default(),
            RetryPolicy::no_retry(),
        );
        let config = RetrievalConfig {
            token_budget: budget,
            ..RetrievalConfig::default()
        };
        RetrievalEngine::new(orchestrator, store, "notes", &config, RetryPolicy::no_retry())
    }

    async fn seeded_store() -> Arc<InMemoryVectorStore> {
        let store = Arc::new(InMemoryVectorStore::new());
        store.ensure_collection("notes", 2).await.unwrap();
        let point = |id: &str, path: &str, vector: Vec<f32>, text: &str, indexed_at: i64| Point {
            id: id.to_string(),
            vector,
            payload: PointPayload {
                path: path.to_string(),
                ordinal: 0,
                text: text.to_string(),
                fingerprint: "f".to_string(),
                format: "markdown".to_string(),
                modified_at: 0,
                indexed_at,
                metadata: Default::default(),
            },
        };
        store
            .upsert(
                "notes",
                &[
                    point("a", "alpha.md", vec![1.0, 0.0], "alpha notes", 100),
                    point("b", "beta.md", vec![0.0, 1.0], "beta notes", 100),
                    point("c", "mixed.md", vec![0.8, 0.6], "mixed notes", 5),
                ],
            )
            .await
            .unwrap();
        store
    }

    #[test]
    fn test_rank_breaks_ties_by_path_then_ordinal() {
        let ranked = rank(
            vec![
                hit("b.md", 0, 0.5),
                hit("a.md", 2, 0.5),
                hit("c.md", 0, 0.9),
                hit("a.md", 1, 0.5),
            ],
            None,
        );
        let order: Vec<(&str, usize)> = ranked.iter().map(|p| (p.path.as_str(), p.ordinal)).collect();
        assert_eq!(order, vec![("c.md", 0), ("a.md", 1), ("a.md", 2), ("b.md", 0)]);
    }

    #[test]
    fn test_rank_applies_min_score() {
        let ranked = rank(vec![hit("a.md", 0, 0.2), hit("b.md", 0, 0.8)], Some(0.5));
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].path, "b.md");
    }

    #[test]
    fn test_assemble_respects_budget_and_drops_whole_passages() {
        let text = "x".repeat(100);
        let passages = vec![
            passage("a.md", 0, 0.9, &text),
            passage("b.md", 0, 0.8, &text),
            passage("c.md", 0, 0.7, "short"),
        ];
        // One rendered passage is 122 chars (31 tokens); two plus the separator exceed 60.
        let ctx = assemble(passages, 60, SOURCE_SEPARATOR, render_source);
        assert_eq!(ctx.passages.len(), 1);
        assert!(ctx.truncated);
        assert_eq!(ctx.dropped, 2);
        assert!(ctx.tokens() <= 60);
        assert!(ctx.context.starts_with("Source: a.md\nContent: "));
        assert!(ctx.context.ends_with(&text));
    }

    #[test]
    fn test_assemble_joins_with_separator() {
        let ctx = assemble(
            vec![passage("a.md", 0, 0.9, "one"), passage("b.md", 0, 0.8, "two")],
            1000,
            SOURCE_SEPARATOR,
            render_source,
        );
        assert_eq!(
            ctx.context,
            "Source: a.md\nContent: one\n\n---\n\nSource: b.md\nContent: two"
        );
        assert!(!ctx.truncated);
    }

    #[test]
    fn test_render_note_numbers_from_one() {
        let rendered = render_note(0, &passage("journal/today.md", 0, 1.0, "body"));
        assert!(rendered.starts_with("--- Note 1: Untitled ---\nSource: journal/today.md\n"));
        assert!(rendered.contains("Last Modified: 1970-01-01 00:00"));
        assert!(rendered.ends_with("\n\nbody"));

        let mut titled = passage("journal/today.md", 0, 1.0, "body");
        titled.title = Some("Daily log".to_string());
        assert!(render_note(1, &titled).starts_with("--- Note 2: Daily log ---\n"));
    }

    #[test]
    fn test_rank_reads_title_from_front_matter() {
        let mut titled = hit("a.md", 0, 0.9);
        titled
            .payload
            .metadata
            .insert("title".to_string(), serde_json::json!("Weekly review"));
        let mut numeric = hit("b.md", 0, 0.5);
        numeric
            .payload
            .metadata
            .insert("title".to_string(), serde_json::json!(42));

        let ranked = rank(vec![titled, numeric], None);
        assert_eq!(ranked[0].title.as_deref(), Some("Weekly review"));
        assert_eq!(ranked[1].title, None);
    }

    #[tokio::test]
    async fn test_retrieve_returns_nearest_with_provenance() {
        let store = seeded_store().await;
        let engine = engine(store, 2, 1000);
        let ctx = engine
            .retrieve("tell me about alpha", 2, &QueryFilter::default())
            .await
            .unwrap();
        assert_eq!(ctx.passages.len(), 2);
        assert_eq!(ctx.passages[0].path, "alpha.md");
        assert_eq!(ctx.passages[0].chunk_id, "a");
        assert_eq!(ctx.passages[1].path, "mixed.md");
        assert!(ctx.passages[0].score >= ctx.passages[1].score);
    }

    #[tokio::test]
    async fn test_retrieve_with_empty_collection_or_query() {
        let store = Arc::new(InMemoryVectorStore::new());
        let engine = engine(store, 2, 1000);
        let ctx = engine
            .retrieve("anything", 5, &QueryFilter::default())
            .await
            .unwrap();
        assert!(ctx.is_empty());
        let ctx = engine.retrieve("   ", 5, &QueryFilter::default()).await.unwrap();
        assert!(ctx.is_empty());
    }

    #[tokio::test]
    async fn test_retrieve_reports_dimension_mismatch() {
        let store = seeded_store().await;
        let engine = engine(store, 3, 1000);
        let err = engine
            .retrieve("alpha", 5, &QueryFilter::default())
            .await
            .unwrap_err();
        assert!(err.is_configuration());
    }

    #[tokio::test]
    async fn test_recent_filters_by_index_time() {
        let store = seeded_store().await;
        let engine = engine(store, 2, 1000);
        let since = Utc.timestamp_opt(50, 0).single().unwrap();
        let ctx = engine.recent(since).await.unwrap();
        let paths: Vec<&str> = ctx.passages.iter().map(|p| p.path.as_str()).collect();
        assert_eq!(paths.len(), 2);
        assert!(!paths.contains(&"mixed.md"));
        assert!(ctx.context.contains("--- Note 2: "));
    }
}
