//! Tool trait, registry, and the built-in tools.
//!
//! Every tool is registered in one [`ToolRegistry`] and reached through
//! the same path from MCP (`tools/call`), REST (`POST /tools/{name}`), and
//! the CLI. A tool declares a JSON Schema for its parameters; callers run
//! [`prepare_args`] and [`validate_params`] before [`Tool::execute`].
//!
//! | Tool | Listed | Purpose |
//! |------|--------|---------|
//! | `get_instructions` | yes | Current instructions, description, and their sources |
//! | `reload_instructions` | yes | Re-read instructions and description |
//! | `get_config` | yes | Backend URL and which secrets are set |
//! | `check_connection` | yes | Backend readiness |
//! | `list_collections` | yes | Collection names |
//! | `get_schema` | yes | Collection configuration |
//! | `hybrid_search` | yes | BM25 + vector search on the fragment collection |
//! | `answer_question` | yes | Full assistant cycle for one request |
//! | `keyword_search` | no | BM25 only |
//! | `semantic_search` | no | Vector only |
//! | `diagnose_vertex` | no | Vertex credential state |

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::assistant::Assistant;
use crate::config::{Config, Secrets};
use crate::credentials::VertexCredentials;
use crate::instructions::InstructionStore;
use crate::store::{open_backend, SearchBackend, SearchMode, SearchRequest};

/// Error text returned when `hybrid_search` is called without a query.
pub const MISSING_QUERY: &str =
    "Errore: parametro obbligatorio 'query' mancante per hybrid_search.";

/// A tool that MCP clients and REST callers can discover and call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Route name (`POST /tools/{name}`) and MCP tool name.
    fn name(&self) -> &str;

    /// Human-readable title shown by MCP clients.
    fn title(&self) -> Option<&str> {
        None
    }

    fn description(&self) -> &str;

    /// Hidden tools are callable but left out of tool listings.
    fn is_hidden(&self) -> bool {
        false
    }

    /// JSON Schema for the parameters. Defaults to a free-form object.
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "required": [],
            "additionalProperties": true
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;
}

/// Shared state handed to every tool invocation.
#[derive(Clone)]
pub struct ToolContext {
    pub config: Arc<Config>,
    pub secrets: Arc<Secrets>,
    pub backend: Arc<dyn SearchBackend>,
    pub credentials: Arc<VertexCredentials>,
    pub instructions: Arc<InstructionStore>,
}

impl ToolContext {
    pub fn new(
        config: Arc<Config>,
        secrets: Arc<Secrets>,
        backend: Arc<dyn SearchBackend>,
        credentials: Arc<VertexCredentials>,
        instructions: Arc<InstructionStore>,
    ) -> Self {
        Self {
            config,
            secrets,
            backend,
            credentials,
            instructions,
        }
    }

    /// Wire up credentials, backend and instructions from configuration.
    pub fn from_config(config: Arc<Config>, secrets: Secrets) -> Result<Self> {
        let credentials = Arc::new(VertexCredentials::new(&config.vertex, &secrets)?);
        let backend = open_backend(&config, &secrets, credentials.clone())?;
        let instructions = Arc::new(InstructionStore::load(
            &config.instructions,
            &config.server.name,
        ));
        Ok(Self::new(
            config,
            Arc::new(secrets),
            backend,
            credentials,
            instructions,
        ))
    }

    pub fn assistant(&self) -> Assistant {
        Assistant::new(self.config.clone(), self.backend.clone())
    }

    /// Run one search and shape it as `{count, results}`.
    async fn search(
        &self,
        collection: &str,
        query: &str,
        mode: SearchMode,
        limit: Option<usize>,
        alpha: Option<f64>,
        query_properties: Option<Vec<String>>,
    ) -> Result<Value> {
        if query.trim().is_empty() {
            bail!("query must not be empty");
        }
        let retrieval = &self.config.retrieval;
        let query_properties = query_properties.unwrap_or_else(|| retrieval.query_properties.clone());
        let return_properties = self.config.fragments.return_properties();
        let req = SearchRequest {
            query,
            mode,
            limit: retrieval.clamp_limit(limit),
            alpha: alpha.unwrap_or(retrieval.alpha).clamp(0.0, 1.0),
            query_properties: &query_properties,
            return_properties: &return_properties,
        };
        let hits = self.backend.search(collection, &req).await?;
        Ok(json!({ "count": hits.len(), "results": hits }))
    }
}

/// Clean `hybrid_search` arguments.
///
/// Defaults the collection, requires a non-empty query, keeps only `limit`,
/// `alpha` and `query_properties`, and decodes `query_properties` sent as a
/// JSON-encoded string. A plain property name becomes a one-element list.
pub fn clean_hybrid_args(args: &Map<String, Value>, default_collection: &str) -> Result<Value> {
    let mut clean = Map::new();
    let collection = args
        .get("collection")
        .and_then(|v| v.as_str())
        .filter(|s| !s.is_empty())
        .unwrap_or(default_collection);
    clean.insert("collection".to_string(), Value::String(collection.to_string()));

    match args.get("query") {
        Some(Value::String(q)) if !q.is_empty() => {
            clean.insert("query".to_string(), Value::String(q.clone()));
        }
        Some(Value::Null) | None => bail!(MISSING_QUERY),
        Some(Value::String(_)) => bail!(MISSING_QUERY),
        Some(other) => {
            clean.insert("query".to_string(), other.clone());
        }
    }

    for key in ["limit", "alpha"] {
        if let Some(v) = args.get(key) {
            clean.insert(key.to_string(), v.clone());
        }
    }
    if let Some(qp) = args.get("query_properties") {
        let decoded = match qp {
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(list @ Value::Array(_)) => list,
                Ok(Value::String(name)) => Value::Array(vec![Value::String(name)]),
                _ => Value::Array(vec![qp.clone()]),
            },
            other => other.clone(),
        };
        clean.insert("query_properties".to_string(), decoded);
    }
    Ok(Value::Object(clean))
}

/// Per-tool argument preparation shared by every front end.
pub fn prepare_args(name: &str, args: Value, ctx: &ToolContext) -> Result<Value> {
    if name != "hybrid_search" {
        return Ok(args);
    }
    let map = args.as_object().cloned().unwrap_or_default();
    clean_hybrid_args(&map, &ctx.config.weaviate.collection)
}

/// Validate parameters against a tool's schema.
///
/// Checks required fields, primitive types and `enum` membership, and fills
/// in `default` values for missing properties.
pub fn validate_params(schema: &Value, params: &Value) -> Result<Value> {
    let params_obj = params.as_object().cloned().unwrap_or_default();

    let properties = schema
        .get("properties")
        .and_then(|p| p.as_object())
        .cloned()
        .unwrap_or_default();

    let required: Vec<String> = schema
        .get("required")
        .and_then(|r| r.as_array())
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(|s| s.to_string()))
                .collect()
        })
        .unwrap_or_default();

    let mut result = params_obj.clone();

    for req_field in &required {
        if !params_obj.contains_key(req_field) {
            bail!("missing required parameter: {}", req_field);
        }
    }

    for (prop_name, prop_schema) in &properties {
        if let Some(value) = params_obj.get(prop_name) {
            if let Some(expected_type) = prop_schema.get("type").and_then(|t| t.as_str()) {
                let type_ok = match expected_type {
                    "string" => value.is_string(),
                    "integer" => value.is_i64() || value.is_u64(),
                    "number" => value.is_number(),
                    "boolean" => value.is_boolean(),
                    "array" => value.is_array(),
                    "object" => value.is_object(),
                    _ => true,
                };
                if !type_ok {
                    bail!(
                        "invalid parameter '{}': expected {}, got {}",
                        prop_name,
                        expected_type,
                        json_type_name(value)
                    );
                }
            }

            if let Some(enum_values) = prop_schema.get("enum").and_then(|e| e.as_array()) {
                if !enum_values.contains(value) {
                    let allowed: Vec<String> = enum_values.iter().map(|v| v.to_string()).collect();
                    bail!(
                        "invalid parameter '{}': must be one of [{}], got {}",
                        prop_name,
                        allowed.join(", "),
                        value
                    );
                }
            }
        } else if let Some(default) = prop_schema.get("default") {
            result.insert(prop_name.clone(), default.clone());
        }
    }

    Ok(Value::Object(result))
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str> {
    match params.get(key).and_then(|v| v.as_str()) {
        Some(s) if !s.trim().is_empty() => Ok(s),
        _ => bail!("{} must not be empty", key),
    }
}

fn opt_usize(params: &Value, key: &str) -> Option<usize> {
    params.get(key).and_then(|v| v.as_u64()).map(|n| n as usize)
}

fn string_list(value: Option<&Value>) -> Option<Vec<String>> {
    let items: Vec<String> = value?
        .as_array()?
        .iter()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect();
    (!items.is_empty()).then_some(items)
}

// ── Instructions ─────────────────────────────────────────────────────────

pub struct GetInstructionsTool;

#[async_trait]
impl Tool for GetInstructionsTool {
    fn name(&self) -> &str {
        "get_instructions"
    }

    fn description(&self) -> &str {
        "Return the current server instructions, description, and their source files"
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        Ok(serde_json::to_value(&*ctx.instructions.current())?)
    }
}

pub struct ReloadInstructionsTool;

#[async_trait]
impl Tool for ReloadInstructionsTool {
    fn name(&self) -> &str {
        "reload_instructions"
    }

    fn description(&self) -> &str {
        "Re-read the instructions and description from their files or environment"
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        Ok(serde_json::to_value(&*ctx.instructions.reload())?)
    }
}

// ── Backend and configuration ────────────────────────────────────────────

pub struct GetConfigTool;

#[async_trait]
impl Tool for GetConfigTool {
    fn name(&self) -> &str {
        "get_config"
    }

    fn description(&self) -> &str {
        "Show the backend URL and which API keys are configured (values are never shown)"
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        Ok(json!({
            "weaviate_url": ctx.config.weaviate.url,
            "weaviate_api_key_set": ctx.secrets.weaviate_api_key.is_some(),
            "openai_api_key_set": ctx.secrets.openai_api_key.is_some(),
            "cohere_api_key_set": ctx.secrets.cohere_api_key.is_some(),
            "backend": ctx.backend.kind(),
            "collection": ctx.config.weaviate.collection,
        }))
    }
}

pub struct CheckConnectionTool;

#[async_trait]
impl Tool for CheckConnectionTool {
    fn name(&self) -> &str {
        "check_connection"
    }

    fn description(&self) -> &str {
        "Check whether the search backend is ready"
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        Ok(json!({ "ready": ctx.backend.is_ready().await? }))
    }
}

pub struct ListCollectionsTool;

#[async_trait]
impl Tool for ListCollectionsTool {
    fn name(&self) -> &str {
        "list_collections"
    }

    fn description(&self) -> &str {
        "List the collections available in the search backend"
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        Ok(json!(ctx.backend.list_collections().await?))
    }
}

pub struct GetSchemaTool;

#[async_trait]
impl Tool for GetSchemaTool {
    fn name(&self) -> &str {
        "get_schema"
    }

    fn description(&self) -> &str {
        "Show the configuration of a collection"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "collection": { "type": "string", "description": "Collection name" }
            },
            "required": ["collection"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let collection = required_str(&params, "collection")?;
        Ok(match ctx.backend.collection_schema(collection).await? {
            Some(config) => json!({ "collection": collection, "config": config }),
            None => json!({ "error": format!("Collection '{}' not found", collection) }),
        })
    }
}

// ── Search ───────────────────────────────────────────────────────────────

fn single_channel_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "collection": { "type": "string", "description": "Collection name" },
            "query": { "type": "string", "description": "Search query" },
            "limit": { "type": "integer", "description": "Max results", "default": 10 }
        },
        "required": ["collection", "query"]
    })
}

pub struct KeywordSearchTool;

#[async_trait]
impl Tool for KeywordSearchTool {
    fn name(&self) -> &str {
        "keyword_search"
    }

    fn description(&self) -> &str {
        "BM25 keyword search on a collection"
    }

    fn is_hidden(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        single_channel_schema()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let collection = required_str(&params, "collection")?;
        let query = required_str(&params, "query")?;
        ctx.search(
            collection,
            query,
            SearchMode::Keyword,
            opt_usize(&params, "limit"),
            None,
            None,
        )
        .await
    }
}

pub struct SemanticSearchTool;

#[async_trait]
impl Tool for SemanticSearchTool {
    fn name(&self) -> &str {
        "semantic_search"
    }

    fn description(&self) -> &str {
        "Vector (near-text) search on a collection"
    }

    fn is_hidden(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        single_channel_schema()
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let collection = required_str(&params, "collection")?;
        let query = required_str(&params, "query")?;
        ctx.search(
            collection,
            query,
            SearchMode::Semantic,
            opt_usize(&params, "limit"),
            None,
            None,
        )
        .await
    }
}

pub struct HybridSearchTool;

#[async_trait]
impl Tool for HybridSearchTool {
    fn name(&self) -> &str {
        "hybrid_search"
    }

    fn title(&self) -> Option<&str> {
        Some("Ricerca ibrida (BM25 + vettoriale)")
    }

    fn description(&self) -> &str {
        "Esegue una ricerca ibrida combinando ricerca keyword (BM25) e ricerca vettoriale. \
         Tool principale per cercare nella collection WindBilance.\n\n\
         ISTRUZIONI: Usa SEMPRE collection='WindBilance'. Usa query_properties=['caption','name'] e \
         return_properties=['name','source_pdf','page_index','mediaType']. Mantieni alpha=0.8 e limit=10 \
         salvo richieste diverse."
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "collection": {
                    "type": "string",
                    "description": "Nome della collection (sempre 'WindBilance' per questo assistente)"
                },
                "query": {
                    "type": "string",
                    "description": "Query di ricerca testuale"
                },
                "limit": {
                    "type": "integer",
                    "description": "Numero massimo di risultati da restituire",
                    "default": 10
                },
                "alpha": {
                    "type": "number",
                    "description": "Peso della ricerca vettoriale (0.0 = solo keyword, 1.0 = solo vettoriale)",
                    "default": 0.8
                },
                "query_properties": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Proprietà su cui cercare (default: ['caption', 'name'])"
                },
                "return_properties": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Proprietà da restituire (default: ['name', 'source_pdf', 'page_index', 'mediaType'])"
                }
            },
            "required": ["collection", "query"],
            "additionalProperties": false
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let configured = ctx.config.weaviate.collection.as_str();
        let mut collection = params
            .get("collection")
            .and_then(|v| v.as_str())
            .unwrap_or(configured);
        if ctx.config.weaviate.enforce_collection && collection != configured {
            tracing::warn!(
                requested = collection,
                using = configured,
                "hybrid_search collection overridden"
            );
            collection = configured;
        }
        let query = required_str(&params, "query")?;
        ctx.search(
            collection,
            query,
            SearchMode::Hybrid,
            opt_usize(&params, "limit"),
            params.get("alpha").and_then(|v| v.as_f64()),
            string_list(params.get("query_properties")),
        )
        .await
    }
}

// ── Assistant and diagnostics ────────────────────────────────────────────

pub struct AnswerQuestionTool;

#[async_trait]
impl Tool for AnswerQuestionTool {
    fn name(&self) -> &str {
        "answer_question"
    }

    fn title(&self) -> Option<&str> {
        Some("Risposta dalla documentazione tecnica")
    }

    fn description(&self) -> &str {
        "Answer a support question from the indexed manuals: searches (with one retry), \
         cites file names and pages, and redirects to official support when the \
         documentation is missing, contradictory, or the topic is safety-critical"
    }

    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "question": { "type": "string", "description": "The user's request, verbatim" },
                "clarified": {
                    "type": "boolean",
                    "description": "A clarifying question was already asked in this exchange",
                    "default": false
                }
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let question = required_str(&params, "question")?;
        let clarified = params
            .get("clarified")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);
        let answer = ctx.assistant().ask(question, clarified).await;
        Ok(serde_json::to_value(&answer)?)
    }
}

pub struct DiagnoseVertexTool;

#[async_trait]
impl Tool for DiagnoseVertexTool {
    fn name(&self) -> &str {
        "diagnose_vertex"
    }

    fn description(&self) -> &str {
        "Report Vertex AI project, OAuth and header state"
    }

    fn is_hidden(&self) -> bool {
        true
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        Ok(ctx.credentials.diagnose().await)
    }
}

// ── Registry ─────────────────────────────────────────────────────────────

/// Ordered collection of tools.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Registry with every built-in tool, in listing order.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(GetInstructionsTool));
        registry.register(Box::new(ReloadInstructionsTool));
        registry.register(Box::new(GetConfigTool));
        registry.register(Box::new(CheckConnectionTool));
        registry.register(Box::new(ListCollectionsTool));
        registry.register(Box::new(GetSchemaTool));
        registry.register(Box::new(KeywordSearchTool));
        registry.register(Box::new(SemanticSearchTool));
        registry.register(Box::new(HybridSearchTool));
        registry.register(Box::new(DiagnoseVertexTool));
        registry.register(Box::new(AnswerQuestionTool));
        registry
    }

    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    /// Tools that appear in listings.
    pub fn visible(&self) -> impl Iterator<Item = &dyn Tool> {
        self.tools
            .iter()
            .filter(|t| !t.is_hidden())
            .map(|t| t.as_ref())
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    /// Prepare, validate and execute one call by name.
    pub async fn call(&self, name: &str, args: Value, ctx: &ToolContext) -> Result<Value> {
        let Some(tool) = self.find(name) else {
            bail!("Unknown tool: {}", name);
        };
        let args = prepare_args(name, args, ctx)?;
        let params = validate_params(&tool.parameters_schema(), &args)?;
        tool.execute(params, ctx).await
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: Value) -> Map<String, Value> {
        v.as_object().cloned().unwrap()
    }

    #[test]
    fn test_hidden_tools_are_not_listed() {
        let registry = ToolRegistry::with_builtins();
        let listed: Vec<&str> = registry.visible().map(|t| t.name()).collect();
        assert_eq!(
            listed,
            vec![
                "get_instructions",
                "reload_instructions",
                "get_config",
                "check_connection",
                "list_collections",
                "get_schema",
                "hybrid_search",
                "answer_question"
            ]
        );
        assert!(registry.find("keyword_search").is_some());
        assert!(registry.find("diagnose_vertex").is_some());
    }

    #[test]
    fn test_clean_hybrid_drops_extras_and_defaults_collection() {
        let clean = clean_hybrid_args(
            &args(json!({
                "query": "Err 04",
                "limit": 5,
                "return_properties": ["name"],
                "query_properties": "[\"caption\"]"
            })),
            "WindBilance",
        )
        .unwrap();
        assert_eq!(
            clean,
            json!({
                "collection": "WindBilance",
                "query": "Err 04",
                "limit": 5,
                "query_properties": ["caption"]
            })
        );
    }

    #[test]
    fn test_clean_hybrid_requires_query() {
        let err = clean_hybrid_args(&args(json!({"collection": "X"})), "WindBilance").unwrap_err();
        assert_eq!(err.to_string(), MISSING_QUERY);
        let err = clean_hybrid_args(&args(json!({"query": ""})), "WindBilance").unwrap_err();
        assert_eq!(err.to_string(), MISSING_QUERY);
    }

    #[test]
    fn test_bare_query_property_becomes_a_list() {
        let clean =
            clean_hybrid_args(&args(json!({"query": "q", "query_properties": "caption"})), "W").unwrap();
        assert_eq!(clean["query_properties"], json!(["caption"]));
        let schema = HybridSearchTool.parameters_schema();
        assert!(validate_params(&schema, &clean).is_ok());

        let clean =
            clean_hybrid_args(&args(json!({"query": "q", "query_properties": "\"name\""})), "W").unwrap();
        assert_eq!(clean["query_properties"], json!(["name"]));
    }

    #[test]
    fn test_validate_fills_defaults() {
        let schema = HybridSearchTool.parameters_schema();
        let out = validate_params(&schema, &json!({"collection": "W", "query": "q"})).unwrap();
        assert_eq!(out["limit"], 10);
        assert_eq!(out["alpha"], 0.8);
    }

    #[test]
    fn test_validate_rejects_wrong_type() {
        let schema = HybridSearchTool.parameters_schema();
        let err = validate_params(&schema, &json!({"collection": "W", "query": "q", "limit": "ten"}))
            .unwrap_err();
        assert!(err.to_string().contains("invalid parameter 'limit'"));
    }

    #[test]
    fn test_validate_missing_required() {
        let schema = GetSchemaTool.parameters_schema();
        let err = validate_params(&schema, &json!({})).unwrap_err();
        assert_eq!(err.to_string(), "missing required parameter: collection");
    }
}
