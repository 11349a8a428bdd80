//! # Balance Desk
//!
//! An MCP retrieval server over a Weaviate index of weighing-equipment
//! manuals, and the support-assistant policy that answers from it.
//!
//! ## Architecture
//!
//! ```text
//!                ┌──────────────┐
//!  MCP client ──▶│  /mcp (rmcp) │──┐
//!                └──────────────┘  │   ┌─────────────┐   ┌──────────────┐
//!                ┌──────────────┐  ├──▶│ ToolRegistry│──▶│ SearchBackend│──▶ Weaviate
//!  HTTP/CLI ────▶│ /tools/{name}│──┘   └──────┬──────┘   └──────────────┘
//!                └──────────────┘             │
//!                                             ▼
//!                          Assistant: query → aggregate → answer
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! bdesk check                                   # backend readiness
//! bdesk search "Err 04 PLB" --mode hybrid
//! bdesk ask "Err 04 sulla PLB 620-3M, cosa significa?"
//! bdesk serve                                   # MCP at http://0.0.0.0:10000/mcp
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration, environment overrides, secrets |
//! | [`logging`] | Tracing subscriber setup |
//! | [`models`] | Search hits, fragments, file records |
//! | [`store`] | Search backend trait, Weaviate and in-memory backends |
//! | [`credentials`] | Vertex token lifecycle and upstream headers |
//! | [`instructions`] | Served instructions and description |
//! | [`query`] | Request signals and query formulation |
//! | [`aggregate`] | Per-document grouping, strength, conflicts |
//! | [`policy`] | Sensitive topics and critical steps |
//! | [`answer`] | Answer shapes and rendering |
//! | [`assistant`] | The request cycle |
//! | [`tools`] | Tool trait, registry, built-in tools |
//! | [`mcp`] | MCP protocol bridge |
//! | [`server`] | HTTP server |

pub mod aggregate;
pub mod answer;
pub mod assistant;
pub mod config;
pub mod credentials;
pub mod instructions;
pub mod logging;
pub mod mcp;
pub mod models;
pub mod policy;
pub mod query;
pub mod server;
pub mod store;
pub mod tools;
