//! MCP JSON-RPC protocol bridge.
//!
//! Adapts the [`ToolRegistry`] to the MCP tool protocol served over
//! streamable HTTP at `/mcp`.
//!
//! * Hidden tools are callable but not listed.
//! * `hybrid_search` arguments are cleaned before validation.
//! * Every call yields a `CallToolResult`: success carries the tool output
//!   in `structuredContent` with a short text pointer, failures and unknown
//!   tools come back as error results rather than protocol errors.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler};
use serde_json::{json, Value};

use crate::tools::{self, ToolContext, ToolRegistry};

/// Bridges the tool registry to the MCP JSON-RPC protocol.
///
/// Each MCP session receives a clone of this struct; everything inside is
/// shared behind `Arc`.
#[derive(Clone)]
pub struct McpBridge {
    ctx: ToolContext,
    tools: Arc<ToolRegistry>,
}

impl McpBridge {
    pub fn new(ctx: ToolContext, tools: Arc<ToolRegistry>) -> Self {
        Self { ctx, tools }
    }

    fn to_mcp_tool(tool: &dyn tools::Tool) -> Tool {
        let input_schema: Arc<serde_json::Map<String, Value>> = match tool.parameters_schema() {
            Value::Object(map) => Arc::new(map),
            _ => Arc::new(serde_json::Map::new()),
        };

        Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: Some(tool.title().unwrap_or(tool.name()).to_string()),
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: Some(
                ToolAnnotations::new()
                    .read_only(false)
                    .destructive(false)
                    .open_world(true),
            ),
            execution: None,
            icons: None,
            meta: None,
        }
    }

    /// Tools advertised by `tools/list`.
    pub fn listed_tools(&self) -> Vec<Tool> {
        self.tools.visible().map(Self::to_mcp_tool).collect()
    }

    /// Run one tool call and shape the result for MCP.
    pub async fn dispatch(&self, name: &str, arguments: Option<JsonObject>) -> CallToolResult {
        let args = Value::Object(arguments.unwrap_or_default());
        tracing::info!(tool = name, args = %args, "call_tool");

        let Some(tool) = self.tools.find(name) else {
            return CallToolResult::error(vec![Content::text(format!("Unknown tool: {}", name))]);
        };

        let args = match tools::prepare_args(name, args, &self.ctx) {
            Ok(a) => a,
            Err(e) => return CallToolResult::error(vec![Content::text(e.to_string())]),
        };

        let outcome = match tools::validate_params(&tool.parameters_schema(), &args) {
            Ok(params) => tool.execute(params, &self.ctx).await,
            Err(e) => Err(e),
        };

        match outcome {
            Ok(value) => {
                let structured = match value {
                    Value::Object(_) => value,
                    other => json!({ "result": other }),
                };
                let mut result = CallToolResult::success(vec![Content::text(format!(
                    "Risultato del tool {} disponibile in structuredContent.",
                    name
                ))]);
                result.structured_content = Some(structured);
                result
            }
            Err(e) => {
                tracing::warn!(tool = name, error = %format!("{:#}", e), "tool failed");
                CallToolResult::error(vec![Content::text(format!(
                    "Errore chiamando tool {}: {:#}",
                    name, e
                ))])
            }
        }
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        let current = self.ctx.instructions.current();
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: self.ctx.config.server.name.clone(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: current.description.clone(),
                icons: None,
                website_url: None,
            },
            instructions: current.instructions.clone(),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        std::future::ready(Ok(ListToolsResult::with_all_items(self.listed_tools())))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tools.find(name).map(Self::to_mcp_tool)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        Ok(self.dispatch(&request.name, request.arguments).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, Secrets};
    use crate::credentials::VertexCredentials;
    use crate::instructions::InstructionStore;
    use crate::store::memory::MemoryBackend;

    fn bridge() -> McpBridge {
        let mut config = Config::default();
        config.instructions.default_prompt_file = "no-such-dir/instructions.md".into();
        config.instructions.default_description_file = "no-such-dir/description.txt".into();
        let config = Arc::new(config);
        let secrets = Arc::new(Secrets::default());
        let backend = MemoryBackend::from_json(
            r#"{"collections": {"WindBilance": [
                {"id": "a", "properties": {"caption": "Err 04 sovraccarico PLB 620-3M", "name": "plb",
                 "source_pdf": "PLB-BA-it.pdf", "page_index": 12, "mediaType": "application/pdf"}}
            ]}}"#,
        )
        .unwrap();
        let credentials =
            Arc::new(VertexCredentials::with_project(&config.vertex, &secrets, None).unwrap());
        let instructions = Arc::new(InstructionStore::load_with(
            &config.instructions,
            &config.server.name,
            |k| (k == "MCP_PROMPT").then(|| "Sei l'assistente.".to_string()),
        ));
        let ctx = ToolContext::new(config, secrets, Arc::new(backend), credentials, instructions);
        McpBridge::new(ctx, Arc::new(ToolRegistry::with_builtins()))
    }

    fn obj(v: Value) -> Option<JsonObject> {
        v.as_object().cloned()
    }

    fn wire(result: &CallToolResult) -> Value {
        serde_json::to_value(result).unwrap()
    }

    #[test]
    fn test_listing_skips_hidden_tools() {
        let names: Vec<String> = bridge()
            .listed_tools()
            .into_iter()
            .map(|t| t.name.to_string())
            .collect();
        assert!(names.contains(&"hybrid_search".to_string()));
        assert!(!names.contains(&"keyword_search".to_string()));
        assert!(!names.contains(&"semantic_search".to_string()));
        assert!(!names.contains(&"diagnose_vertex".to_string()));
    }

    #[test]
    fn test_hybrid_tool_title() {
        let tool = bridge().get_tool("hybrid_search").unwrap();
        assert_eq!(tool.title.as_deref(), Some("Ricerca ibrida (BM25 + vettoriale)"));
    }

    #[tokio::test]
    async fn test_unknown_tool_is_error_result() {
        let out = wire(&bridge().dispatch("nope", None).await);
        assert_eq!(out["isError"], true);
        assert_eq!(out["content"][0]["text"], "Unknown tool: nope");
    }

    #[tokio::test]
    async fn test_hybrid_without_query() {
        let out = wire(
            &bridge()
                .dispatch("hybrid_search", obj(json!({"collection": "WindBilance"})))
                .await,
        );
        assert_eq!(out["isError"], true);
        assert_eq!(out["content"][0]["text"], tools::MISSING_QUERY);
    }

    #[tokio::test]
    async fn test_hybrid_success_is_structured() {
        let out = wire(
            &bridge()
                .dispatch(
                    "hybrid_search",
                    obj(json!({"collection": "Altro", "query": "Err 04", "return_properties": ["x"]})),
                )
                .await,
        );
        assert_ne!(out["isError"], true);
        assert_eq!(
            out["content"][0]["text"],
            "Risultato del tool hybrid_search disponibile in structuredContent."
        );
        assert_eq!(out["structuredContent"]["count"], 1);
        assert_eq!(out["structuredContent"]["results"][0]["uuid"], "a");
    }

    #[tokio::test]
    async fn test_array_results_are_wrapped() {
        let out = wire(&bridge().dispatch("list_collections", None).await);
        assert_eq!(out["structuredContent"], json!({"result": ["WindBilance"]}));
    }

    #[tokio::test]
    async fn test_tool_failure_message() {
        let out = wire(
            &bridge()
                .dispatch("keyword_search", obj(json!({"collection": "Missing", "query": "x"})))
                .await,
        );
        assert_eq!(out["isError"], true);
        let text = out["content"][0]["text"].as_str().unwrap();
        assert!(text.starts_with("Errore chiamando tool keyword_search: "), "{}", text);
    }

    #[test]
    fn test_server_info_carries_instructions() {
        let info = bridge().get_info();
        assert_eq!(info.server_info.name, "weaviate-mcp-http");
        assert_eq!(info.instructions.as_deref(), Some("Sei l'assistente."));
    }
}
