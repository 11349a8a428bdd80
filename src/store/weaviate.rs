//! Weaviate backend over REST and GraphQL.
//!
//! | Operation | Endpoint |
//! |-----------|----------|
//! | readiness | `GET /v1/.well-known/ready` |
//! | collections | `GET /v1/schema` |
//! | collection config | `GET /v1/schema/{class}` |
//! | bm25 / nearText / hybrid / where | `POST /v1/graphql` |
//!
//! Requests carry `Authorization: Bearer <WEAVIATE_API_KEY>`, the OpenAI and
//! Cohere key headers when set, and the Vertex headers from [`VertexCredentials`] so the
//! cluster can vectorize queries with `text2vec-google`.
//!
//! Transient failures (HTTP 429, 5xx, network errors) are retried with
//! exponential backoff: 1s, 2s, 4s, … capped at 32s.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Map, Value};

use super::{SearchBackend, SearchMode, SearchRequest};
use crate::config::{Secrets, WeaviateConfig};
use crate::credentials::VertexCredentials;
use crate::models::SearchHit;

pub struct WeaviateBackend {
    base_url: String,
    api_key: Option<String>,
    openai_key: Option<String>,
    cohere_key: Option<String>,
    credentials: Arc<VertexCredentials>,
    client: reqwest::Client,
    max_retries: u32,
}

impl WeaviateBackend {
    pub fn new(
        config: &WeaviateConfig,
        secrets: &Secrets,
        credentials: Arc<VertexCredentials>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            base_url: config.url.trim_end_matches('/').to_string(),
            api_key: secrets.weaviate_api_key.clone(),
            openai_key: secrets.openai_api_key.clone(),
            cohere_key: secrets.cohere_api_key.clone(),
            credentials,
            client,
            max_retries: config.max_retries,
        })
    }

    /// Send a request, retrying transient failures.
    ///
    /// Returns the last response for non-retryable statuses so callers can
    /// map 404 and friends themselves.
    async fn send(&self, method: Method, path: &str, body: Option<&Value>) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.base_url, path);
        let module_headers = self.credentials.headers().await;
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = Duration::from_secs(1 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut req = self.client.request(method.clone(), &url);
            if let Some(key) = &self.api_key {
                req = req.bearer_auth(key);
            }
            if let Some(key) = &self.openai_key {
                req = req.header("X-OpenAI-Api-Key", key);
            }
            if let Some(key) = &self.cohere_key {
                req = req.header("X-Cohere-Api-Key", key);
            }
            for (name, value) in &module_headers {
                req = req.header(*name, value);
            }
            if let Some(body) = body {
                req = req.json(body);
            }

            match req.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        let text = resp.text().await.unwrap_or_default();
                        tracing::warn!(%status, attempt, "weaviate transient error");
                        last_err = Some(anyhow::anyhow!("Weaviate error {}: {}", status, text));
                        continue;
                    }
                    return Ok(resp);
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, "weaviate request failed");
                    last_err = Some(e.into());
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Weaviate request failed after retries")))
    }

    async fn graphql(&self, query: &str) -> Result<Value> {
        let resp = self
            .send(Method::POST, "/v1/graphql", Some(&json!({ "query": query })))
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("Weaviate GraphQL error {}: {}", status, text);
        }
        let body: Value = resp.json().await?;
        if let Some(errors) = body.get("errors").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                let messages: Vec<&str> = errors
                    .iter()
                    .filter_map(|e| e.get("message").and_then(|m| m.as_str()))
                    .collect();
                bail!("Weaviate GraphQL error: {}", messages.join("; "));
            }
        }
        Ok(body)
    }
}

#[async_trait]
impl SearchBackend for WeaviateBackend {
    fn kind(&self) -> &str {
        "weaviate"
    }

    async fn is_ready(&self) -> Result<bool> {
        let resp = self.send(Method::GET, "/v1/.well-known/ready", None).await?;
        Ok(resp.status().is_success())
    }

    async fn list_collections(&self) -> Result<Vec<String>> {
        let resp = self.send(Method::GET, "/v1/schema", None).await?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("Weaviate schema error {}: {}", status, text);
        }
        let body: Value = resp.json().await?;
        let mut names: Vec<String> = body
            .get("classes")
            .and_then(|c| c.as_array())
            .map(|classes| {
                classes
                    .iter()
                    .filter_map(|c| c.get("class").and_then(|n| n.as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        names.sort();
        names.dedup();
        Ok(names)
    }

    async fn collection_schema(&self, collection: &str) -> Result<Option<Value>> {
        let class = class_name(collection)?;
        let resp = self
            .send(Method::GET, &format!("/v1/schema/{}", class), None)
            .await?;
        let status = resp.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("Weaviate schema error {}: {}", status, text);
        }
        Ok(Some(resp.json().await?))
    }

    async fn search(&self, collection: &str, req: &SearchRequest<'_>) -> Result<Vec<SearchHit>> {
        let class = class_name(collection)?;
        let query = build_search_query(&class, req)?;
        let body = self.graphql(&query).await?;
        let hits = parse_get_response(&body, &class)?;

        for h in &hits {
            let name = h
                .properties
                .get("name")
                .and_then(|n| n.as_str())
                .unwrap_or("N/A");
            match h.score {
                Some(score) => tracing::debug!(name, score, "hit"),
                None => tracing::debug!(name, "hit"),
            }
        }
        Ok(hits)
    }

    async fn find_by_property(
        &self,
        collection: &str,
        property: &str,
        value: &str,
        return_properties: &[String],
    ) -> Result<Option<SearchHit>> {
        let class = class_name(collection)?;
        validate_identifier(property)?;
        let clause = format!(
            "where: {{path: [{}], operator: Equal, valueText: {}}}",
            serde_json::to_string(property)?,
            serde_json::to_string(value)?
        );
        let query = build_get(&class, &clause, 1, return_properties, &["id"])?;
        let body = self.graphql(&query).await?;
        Ok(parse_get_response(&body, &class)?.into_iter().next())
    }
}

/// Weaviate class names are GraphQL identifiers with an upper-case initial.
pub fn class_name(collection: &str) -> Result<String> {
    validate_identifier(collection)?;
    let mut chars = collection.chars();
    Ok(match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    })
}

fn validate_identifier(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let valid = match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        _ => false,
    };
    if !valid {
        bail!("invalid collection or property name: '{}'", name);
    }
    Ok(())
}

fn string_list(items: &[String]) -> Result<String> {
    for item in items {
        validate_identifier(item)?;
    }
    Ok(serde_json::to_string(items)?)
}

/// Build the GraphQL `Get` query for a search request.
pub fn build_search_query(class: &str, req: &SearchRequest<'_>) -> Result<String> {
    let query = serde_json::to_string(req.query)?;
    let properties = if req.query_properties.is_empty() {
        String::new()
    } else {
        format!(", properties: {}", string_list(req.query_properties)?)
    };

    let (clause, additional): (String, &[&str]) = match req.mode {
        SearchMode::Keyword => (
            format!("bm25: {{query: {}{}}}", query, properties),
            &["id", "score"][..],
        ),
        SearchMode::Semantic => (
            format!("nearText: {{concepts: [{}]}}", query),
            &["id", "distance"][..],
        ),
        SearchMode::Hybrid => (
            format!("hybrid: {{query: {}, alpha: {}{}}}", query, req.alpha, properties),
            &["id", "score", "distance"][..],
        ),
    };

    build_get(class, &clause, req.limit, req.return_properties, additional)
}

fn build_get(
    class: &str,
    clause: &str,
    limit: usize,
    return_properties: &[String],
    additional: &[&str],
) -> Result<String> {
    for p in return_properties {
        validate_identifier(p)?;
    }
    Ok(format!(
        "{{ Get {{ {}({}, limit: {}) {{ {} _additional {{ {} }} }} }} }}",
        class,
        clause,
        limit,
        return_properties.join(" "),
        additional.join(" ")
    ))
}

/// Extract hits from a `{"data": {"Get": {"<Class>": [...]}}}` response.
pub fn parse_get_response(body: &Value, class: &str) -> Result<Vec<SearchHit>> {
    let objects = match body.pointer(&format!("/data/Get/{}", class)) {
        Some(Value::Array(objects)) => objects,
        Some(Value::Null) | None => return Ok(Vec::new()),
        Some(other) => bail!("unexpected GraphQL payload for {}: {}", class, other),
    };

    Ok(objects
        .iter()
        .filter_map(|o| o.as_object())
        .map(|o| {
            let additional = o.get("_additional").cloned().unwrap_or(Value::Null);
            let properties: Map<String, Value> = o
                .iter()
                .filter(|(k, _)| k.as_str() != "_additional")
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            SearchHit {
                uuid: additional
                    .get("id")
                    .and_then(|v| v.as_str())
                    .unwrap_or_default()
                    .to_string(),
                properties,
                score: number_or_string(additional.get("score")),
                distance: number_or_string(additional.get("distance")),
            }
        })
        .collect())
}

/// GraphQL reports `score` as a string and `distance` as a number.
fn number_or_string(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_class_name_capitalizes() {
        assert_eq!(class_name("windBilance").unwrap(), "WindBilance");
        assert!(class_name("Wind Bilance").is_err());
        assert!(class_name("").is_err());
        assert!(class_name("x){ Aggregate").is_err());
    }

    #[test]
    fn test_hybrid_query_shape() {
        let qp = vec!["caption".to_string(), "name".to_string()];
        let rp = vec!["name".to_string(), "page_index".to_string()];
        let q = build_search_query(
            "WindBilance",
            &SearchRequest {
                query: "Err \"04\"",
                mode: SearchMode::Hybrid,
                limit: 10,
                alpha: 0.8,
                query_properties: &qp,
                return_properties: &rp,
            },
        )
        .unwrap();
        assert_eq!(
            q,
            "{ Get { WindBilance(hybrid: {query: \"Err \\\"04\\\"\", alpha: 0.8, properties: [\"caption\",\"name\"]}, limit: 10) { name page_index _additional { id score distance } } } }"
        );
    }

    #[test]
    fn test_semantic_query_has_no_properties() {
        let q = build_search_query(
            "WindBilance",
            &SearchRequest {
                query: "bilancia",
                mode: SearchMode::Semantic,
                limit: 5,
                alpha: 0.0,
                query_properties: &["caption".to_string()],
                return_properties: &[],
            },
        )
        .unwrap();
        assert!(q.contains("nearText: {concepts: [\"bilancia\"]}"));
        assert!(q.contains("_additional { id distance }"));
    }

    #[test]
    fn test_rejects_injected_property() {
        let bad = vec!["name } } }".to_string()];
        let res = build_search_query(
            "WindBilance",
            &SearchRequest {
                query: "x",
                mode: SearchMode::Keyword,
                limit: 5,
                alpha: 0.0,
                query_properties: &bad,
                return_properties: &[],
            },
        );
        assert!(res.is_err());
    }

    #[test]
    fn test_parse_get_response() {
        let body = json!({
            "data": {"Get": {"WindBilance": [
                {"name": "a", "page_index": 2, "_additional": {"id": "u1", "score": "0.75", "distance": 0.2}},
                {"name": "b", "_additional": {"id": "u2", "score": null}}
            ]}}
        });
        let hits = parse_get_response(&body, "WindBilance").unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].uuid, "u1");
        assert_eq!(hits[0].score, Some(0.75));
        assert_eq!(hits[0].distance, Some(0.2));
        assert!(!hits[0].properties.contains_key("_additional"));
        assert_eq!(hits[1].score, None);
    }

    #[test]
    fn test_parse_null_collection() {
        let body = json!({"data": {"Get": {"WindBilance": null}}});
        assert!(parse_get_response(&body, "WindBilance").unwrap().is_empty());
    }
}
