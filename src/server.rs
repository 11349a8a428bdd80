//! HTTP server: MCP over streamable HTTP plus a small JSON API.
//!
//! Every tool is registered in one [`ToolRegistry`] and reached through the
//! same preparation and validation path from `/mcp` and `POST /tools/{name}`.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `*`    | `/mcp` | MCP streamable HTTP transport |
//! | `GET`  | `/tools/list` | Listed (non-hidden) tools with schemas |
//! | `POST` | `/tools/{name}` | Call any registered tool by name |
//! | `GET`  | `/health` | Liveness, service name and version |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "bad_request", "message": "query must not be empty" } }
//! ```
//!
//! Error codes: `bad_request` (400), `not_found` (404), `invalid_host` (421),
//! `timeout` (408), `tool_error` (500).
//!
//! # Host check
//!
//! With `server.dns_rebinding_protection` on, `/mcp` requests whose `Host`
//! header is not in the allowlist are rejected before reaching the transport.
//! An entry `host:*` matches that host on any port.

use axum::{
    extract::{Path, Request, State},
    http::{header::HOST, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::mcp::McpBridge;
use crate::tools::{self, ToolContext, ToolRegistry};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
struct AppState {
    ctx: ToolContext,
    tools: Arc<ToolRegistry>,
}

/// Starts the server on `[server].bind` and runs until Ctrl-C.
///
/// Spawns the Vertex token refresher when OAuth is enabled.
pub async fn run_server(ctx: ToolContext) -> anyhow::Result<()> {
    let bind_addr = ctx.config.server.bind.clone();
    let tools = Arc::new(ToolRegistry::with_builtins());

    let _refresher = ctx.credentials.spawn_refresher();

    for t in tools.tools() {
        let tag = if t.is_hidden() { "hidden" } else { "listed" };
        tracing::info!(tool = t.name(), tag, "registered tool");
    }

    let app = build_router(ctx, tools);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!(addr = %bind_addr, "listening; MCP endpoint at /mcp");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
        })
        .await?;
    Ok(())
}

/// Build the full router. Exposed for tests and embedding.
pub fn build_router(ctx: ToolContext, tools: Arc<ToolRegistry>) -> Router {
    let server = &ctx.config.server;

    let mut transport = StreamableHttpServerConfig::default();
    transport.stateful_mode = !server.stateless;
    let bridge = McpBridge::new(ctx.clone(), tools.clone());
    let mcp_service = StreamableHttpService::new(
        move || Ok(bridge.clone()),
        Arc::new(LocalSessionManager::default()),
        transport,
    );

    let mut mcp = Router::new().nest_service("/mcp", mcp_service);
    if server.dns_rebinding_protection {
        let allowlist = Arc::new(HostAllowlist::new(server.effective_allowed_hosts()));
        mcp = mcp.layer(middleware::from_fn_with_state(allowlist, check_host));
    }

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .route("/health", get(handle_health))
        .with_state(AppState { ctx, tools })
        .merge(mcp)
        .layer(cors)
}

// ============ Host allowlist ============

/// `Host` header allowlist. Entries are `host`, `host:port`, or `host:*`.
#[derive(Debug, Clone)]
pub struct HostAllowlist {
    entries: Vec<String>,
}

impl HostAllowlist {
    pub fn new(entries: Vec<String>) -> Self {
        Self {
            entries: entries.into_iter().map(|e| e.to_lowercase()).collect(),
        }
    }

    pub fn allows(&self, host: &str) -> bool {
        let host = host.trim().to_lowercase();
        self.entries.iter().any(|entry| match entry.strip_suffix(":*") {
            Some(base) => host
                .strip_prefix(base)
                .and_then(|rest| rest.strip_prefix(':'))
                .is_some_and(|port| !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit())),
            None => *entry == host,
        })
    }
}

async fn check_host(
    State(allowlist): State<Arc<HostAllowlist>>,
    request: Request,
    next: Next,
) -> Response {
    let host = request
        .headers()
        .get(HOST)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    if !allowlist.allows(host) {
        tracing::warn!(host, "rejected request with disallowed Host header");
        return invalid_host(format!("Invalid Host header: {}", host)).into_response();
    }
    next.run(request).await
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

fn app_error(status: StatusCode, code: &str, message: impl Into<String>) -> AppError {
    AppError {
        status,
        code: code.to_string(),
        message: message.into(),
    }
}

fn bad_request(message: impl Into<String>) -> AppError {
    app_error(StatusCode::BAD_REQUEST, "bad_request", message)
}

fn not_found(message: impl Into<String>) -> AppError {
    app_error(StatusCode::NOT_FOUND, "not_found", message)
}

fn invalid_host(message: impl Into<String>) -> AppError {
    app_error(StatusCode::MISDIRECTED_REQUEST, "invalid_host", message)
}

fn timeout_error(message: impl Into<String>) -> AppError {
    app_error(StatusCode::REQUEST_TIMEOUT, "timeout", message)
}

fn tool_error(message: impl Into<String>) -> AppError {
    app_error(StatusCode::INTERNAL_SERVER_ERROR, "tool_error", message)
}

/// Map tool errors to a status from their message, so tools can signal
/// client errors without a dedicated error type.
fn classify_tool_error(tool_name: &str, err: anyhow::Error) -> AppError {
    let msg = format!("{:#}", err);
    let message = format!("{}: {}", tool_name, msg);

    if msg.contains("not found") {
        not_found(message)
    } else if msg.contains("must not be empty")
        || msg.contains("invalid")
        || msg.contains("missing required")
    {
        bad_request(message)
    } else if msg.contains("timed out") {
        timeout_error(message)
    } else {
        tool_error(message)
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    service: String,
    version: &'static str,
}

async fn handle_health(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        service: state.ctx.config.server.name.clone(),
        version: env!("CARGO_PKG_VERSION"),
    })
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolInfo {
    name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    description: String,
    parameters: Value,
}

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    let tools = state
        .tools
        .visible()
        .map(|t| ToolInfo {
            name: t.name().to_string(),
            title: t.title().map(str::to_string),
            description: t.description().to_string(),
            parameters: t.parameters_schema(),
        })
        .collect();
    Json(ToolListResponse { tools })
}

// ============ POST /tools/{name} ============

/// Returns `404` for unknown tools, `400` for argument errors, and the
/// classified status for execution errors.
async fn handle_tool_call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(params): Json<Value>,
) -> Result<Json<Value>, AppError> {
    let tool = state
        .tools
        .find(&name)
        .ok_or_else(|| not_found(format!("no tool registered with name: {}", name)))?;

    let params =
        tools::prepare_args(&name, params, &state.ctx).map_err(|e| bad_request(e.to_string()))?;
    let params = tools::validate_params(&tool.parameters_schema(), &params)
        .map_err(|e| bad_request(e.to_string()))?;

    let result = tool
        .execute(params, &state.ctx)
        .await
        .map_err(|e| classify_tool_error(&name, e))?;

    Ok(Json(serde_json::json!({ "result": result })))
}
