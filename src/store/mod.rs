//! Search backend abstraction.
//!
//! The [`SearchBackend`] trait is the whole contract with the external
//! retrieval service: readiness, collection discovery, keyword / semantic /
//! hybrid search, and exact property lookups. Ranking is the backend's
//! business; callers only see [`SearchHit`]s in rank order.
//!
//! | Backend | Module | Use |
//! |---------|--------|-----|
//! | Weaviate (REST + GraphQL) | [`weaviate`] | production |
//! | In-memory JSON fixture | [`memory`] | offline runs and tests |

pub mod memory;
pub mod weaviate;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::sync::Arc;

use crate::config::{BackendKind, Config, Secrets};
use crate::credentials::VertexCredentials;
use crate::models::SearchHit;

/// Retrieval channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Keyword,
    Semantic,
    Hybrid,
}

impl FromStr for SearchMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "keyword" => Ok(SearchMode::Keyword),
            "semantic" => Ok(SearchMode::Semantic),
            "hybrid" => Ok(SearchMode::Hybrid),
            other => bail!(
                "Unknown search mode: {}. Use keyword, semantic, or hybrid.",
                other
            ),
        }
    }
}

/// Bundles all inputs for a single search invocation.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    pub query: &'a str,
    pub mode: SearchMode,
    pub limit: usize,
    /// Vector weight for hybrid mode; ignored otherwise.
    pub alpha: f64,
    /// Properties searched by the keyword channel. Empty means all.
    pub query_properties: &'a [String],
    /// Properties returned on each hit. Empty means all.
    pub return_properties: &'a [String],
}

#[async_trait]
pub trait SearchBackend: Send + Sync {
    /// Short backend identifier (`"weaviate"`, `"fixture"`).
    fn kind(&self) -> &str;

    async fn is_ready(&self) -> Result<bool>;

    /// Sorted, unique collection names.
    async fn list_collections(&self) -> Result<Vec<String>>;

    /// Collection configuration, or `None` if the collection does not exist.
    async fn collection_schema(&self, collection: &str) -> Result<Option<Value>>;

    /// Run a search. Hits come back in rank order, at most `limit` of them.
    async fn search(&self, collection: &str, req: &SearchRequest<'_>) -> Result<Vec<SearchHit>>;

    /// First object whose `property` equals `value` exactly.
    async fn find_by_property(
        &self,
        collection: &str,
        property: &str,
        value: &str,
        return_properties: &[String],
    ) -> Result<Option<SearchHit>>;
}

/// Build the configured backend.
pub fn open_backend(
    config: &Config,
    secrets: &Secrets,
    credentials: Arc<VertexCredentials>,
) -> Result<Arc<dyn SearchBackend>> {
    match config.backend.kind {
        BackendKind::Weaviate => Ok(Arc::new(weaviate::WeaviateBackend::new(
            &config.weaviate,
            secrets,
            credentials,
        )?)),
        BackendKind::Fixture => {
            let path = config
                .backend
                .fixture_path
                .as_ref()
                .context("backend.fixture_path is required for the fixture backend")?;
            Ok(Arc::new(memory::MemoryBackend::from_file(path)?))
        }
    }
}

/// Min-max normalize raw scores to `[0.0, 1.0]`.
///
/// If all scores are equal, they are normalized to `1.0`.
pub fn normalize_scores<K: Clone>(candidates: &[(K, f64)]) -> Vec<(K, f64)> {
    if candidates.is_empty() {
        return Vec::new();
    }

    let s_min = candidates
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::INFINITY, f64::min);
    let s_max = candidates
        .iter()
        .map(|(_, s)| *s)
        .fold(f64::NEG_INFINITY, f64::max);

    candidates
        .iter()
        .map(|(k, s)| {
            let norm = if (s_max - s_min).abs() < f64::EPSILON {
                1.0
            } else {
                (s - s_min) / (s_max - s_min)
            };
            (k.clone(), norm)
        })
        .collect()
}
