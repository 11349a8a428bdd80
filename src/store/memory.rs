//! In-memory [`SearchBackend`] loaded from a JSON fixture.
//!
//! Keyword search is BM25 over the requested query properties. "Semantic"
//! search is cosine similarity of term-frequency vectors over every string
//! property, which is crude but deterministic. Hybrid search fuses the two
//! the way Weaviate's relative-score fusion does: min-max normalize each
//! channel, then `(1-α)·keyword + α·vector`.
//!
//! Fixture format:
//!
//! ```json
//! { "collections": { "WindBilance": [ { "id": "…", "properties": { … } } ] } }
//! ```

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::{normalize_scores, SearchBackend, SearchMode, SearchRequest};
use crate::models::SearchHit;

const BM25_K1: f64 = 1.2;
const BM25_B: f64 = 0.75;

#[derive(Debug, Clone, Deserialize)]
pub struct FixtureObject {
    #[serde(default)]
    pub id: Option<String>,
    pub properties: Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct Fixture {
    collections: BTreeMap<String, Vec<FixtureObject>>,
}

struct StoredObject {
    uuid: String,
    properties: Map<String, Value>,
}

pub struct MemoryBackend {
    collections: BTreeMap<String, Vec<StoredObject>>,
}

impl MemoryBackend {
    pub fn new(collections: BTreeMap<String, Vec<FixtureObject>>) -> Self {
        let collections = collections
            .into_iter()
            .map(|(name, objects)| {
                let stored = objects
                    .into_iter()
                    .map(|o| StoredObject {
                        uuid: o.id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                        properties: o.properties,
                    })
                    .collect();
                (name, stored)
            })
            .collect();
        Self { collections }
    }

    pub fn from_json(content: &str) -> Result<Self> {
        let fixture: Fixture =
            serde_json::from_str(content).with_context(|| "Failed to parse fixture JSON")?;
        Ok(Self::new(fixture.collections))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read fixture: {}", path.display()))?;
        Self::from_json(&content)
    }

    fn objects(&self, collection: &str) -> Result<&[StoredObject]> {
        self.collections
            .get(collection)
            .map(|v| v.as_slice())
            .ok_or_else(|| anyhow::anyhow!("Collection '{}' not found", collection))
    }
}

fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(|t| t.to_lowercase())
        .collect()
}

fn property_text(props: &Map<String, Value>, keys: &[String]) -> String {
    let mut out = String::new();
    let mut push = |v: &Value| {
        if let Some(s) = v.as_str() {
            out.push_str(s);
            out.push(' ');
        }
    };
    if keys.is_empty() {
        props.values().for_each(&mut push);
    } else {
        keys.iter().filter_map(|k| props.get(k)).for_each(&mut push);
    }
    out
}

fn term_freq(tokens: &[String]) -> HashMap<&str, f64> {
    let mut tf = HashMap::new();
    for t in tokens {
        *tf.entry(t.as_str()).or_insert(0.0) += 1.0;
    }
    tf
}

fn bm25_scores(query: &[String], docs: &[Vec<String>]) -> Vec<f64> {
    let n = docs.len() as f64;
    let avg_len = (docs.iter().map(|d| d.len()).sum::<usize>() as f64 / n.max(1.0)).max(1.0);
    let unique_terms: HashSet<&str> = query.iter().map(|s| s.as_str()).collect();

    let idf: HashMap<&str, f64> = unique_terms
        .iter()
        .map(|term| {
            let df = docs
                .iter()
                .filter(|d| d.iter().any(|t| t == term))
                .count() as f64;
            (*term, (1.0 + (n - df + 0.5) / (df + 0.5)).ln())
        })
        .collect();

    docs.iter()
        .map(|doc| {
            let tf = term_freq(doc);
            let len = doc.len() as f64;
            unique_terms
                .iter()
                .map(|term| {
                    let f = tf.get(term).copied().unwrap_or(0.0);
                    if f == 0.0 {
                        return 0.0;
                    }
                    idf[term] * f * (BM25_K1 + 1.0)
                        / (f + BM25_K1 * (1.0 - BM25_B + BM25_B * len / avg_len))
                })
                .sum()
        })
        .collect()
}

fn cosine(a: &HashMap<&str, f64>, b: &HashMap<&str, f64>) -> f64 {
    let dot: f64 = a.iter().map(|(k, v)| v * b.get(k).copied().unwrap_or(0.0)).sum();
    let na: f64 = a.values().map(|v| v * v).sum::<f64>().sqrt();
    let nb: f64 = b.values().map(|v| v * v).sum::<f64>().sqrt();
    if na < f64::EPSILON || nb < f64::EPSILON {
        0.0
    } else {
        dot / (na * nb)
    }
}

fn project(props: &Map<String, Value>, keys: &[String]) -> Map<String, Value> {
    if keys.is_empty() {
        return props.clone();
    }
    keys.iter()
        .filter_map(|k| props.get(k).map(|v| (k.clone(), v.clone())))
        .collect()
}

#[async_trait]
impl SearchBackend for MemoryBackend {
    fn kind(&self) -> &str {
        "fixture"
    }

    async fn is_ready(&self) -> Result<bool> {
        Ok(true)
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        Ok(self.collections.keys().cloned().collect())
    }

    async fn collection_schema(&self, collection: &str) -> Result<Option<Value>> {
        let Some(objects) = self.collections.get(collection) else {
            return Ok(None);
        };
        let mut props: BTreeMap<&str, &str> = BTreeMap::new();
        for o in objects {
            for (k, v) in &o.properties {
                let data_type = match v {
                    Value::Number(n) if n.is_i64() => "int",
                    Value::Number(_) => "number",
                    Value::Bool(_) => "boolean",
                    _ => "text",
                };
                props.entry(k.as_str()).or_insert(data_type);
            }
        }
        let properties: Vec<Value> = props
            .into_iter()
            .map(|(name, dt)| json!({ "name": name, "dataType": [dt] }))
            .collect();
        Ok(Some(json!({
            "class": collection,
            "properties": properties,
            "vectorizer": "none",
        })))
    }

    async fn search(&self, collection: &str, req: &SearchRequest<'_>) -> Result<Vec<SearchHit>> {
        let objects = self.objects(collection)?;
        let query = tokenize(req.query);
        if query.is_empty() || objects.is_empty() {
            return Ok(Vec::new());
        }

        let keyword: Vec<(usize, f64)> = if req.mode != SearchMode::Semantic {
            let docs: Vec<Vec<String>> = objects
                .iter()
                .map(|o| tokenize(&property_text(&o.properties, req.query_properties)))
                .collect();
            bm25_scores(&query, &docs)
                .into_iter()
                .enumerate()
                .filter(|(_, s)| *s > 0.0)
                .collect()
        } else {
            Vec::new()
        };

        let vector: Vec<(usize, f64)> = if req.mode != SearchMode::Keyword {
            let q_tf = term_freq(&query);
            objects
                .iter()
                .enumerate()
                .map(|(i, o)| {
                    let tokens = tokenize(&property_text(&o.properties, &[]));
                    (i, cosine(&q_tf, &term_freq(&tokens)))
                })
                .filter(|(_, s)| *s > 0.0)
                .collect()
        } else {
            Vec::new()
        };

        let similarity: HashMap<usize, f64> = vector.iter().copied().collect();
        let mut ranked: Vec<(usize, f64)> = match req.mode {
            SearchMode::Keyword => keyword,
            SearchMode::Semantic => vector,
            SearchMode::Hybrid => {
                let kw: HashMap<usize, f64> = normalize_scores(&keyword).into_iter().collect();
                let vec: HashMap<usize, f64> = normalize_scores(&vector).into_iter().collect();
                let ids: HashSet<usize> = kw.keys().chain(vec.keys()).copied().collect();
                ids.into_iter()
                    .map(|i| {
                        let k = kw.get(&i).copied().unwrap_or(0.0);
                        let v = vec.get(&i).copied().unwrap_or(0.0);
                        (i, (1.0 - req.alpha) * k + req.alpha * v)
                    })
                    .collect()
            }
        };

        ranked.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| objects[a.0].uuid.cmp(&objects[b.0].uuid))
        });
        ranked.truncate(req.limit);

        Ok(ranked
            .into_iter()
            .map(|(i, score)| {
                let o = &objects[i];
                SearchHit {
                    uuid: o.uuid.clone(),
                    properties: project(&o.properties, req.return_properties),
                    score: (req.mode != SearchMode::Semantic).then_some(score),
                    distance: similarity.get(&i).map(|s| 1.0 - s),
                }
            })
            .collect())
    }

    async fn find_by_property(
        &self,
        collection: &str,
        property: &str,
        value: &str,
        return_properties: &[String],
    ) -> Result<Option<SearchHit>> {
        let objects = self.objects(collection)?;
        Ok(objects
            .iter()
            .find(|o| match o.properties.get(property) {
                Some(Value::String(s)) => s == value,
                Some(Value::Number(n)) => n.to_string() == value,
                _ => false,
            })
            .map(|o| SearchHit {
                uuid: o.uuid.clone(),
                properties: project(&o.properties, return_properties),
                score: None,
                distance: None,
            }))
    }
}
