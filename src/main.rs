//! # Balance Desk CLI (`bdesk`)
//!
//! Runs the MCP server and exposes the same tools from the command line.
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `bdesk serve` | Start the HTTP server (MCP at `/mcp`) |
//! | `bdesk search "<query>"` | Search the fragment collection |
//! | `bdesk ask "<request>"` | Run the assistant on one request |
//! | `bdesk collections` | List backend collections |
//! | `bdesk schema <collection>` | Show a collection's configuration |
//! | `bdesk check` | Backend readiness |
//! | `bdesk instructions` | Show the served instructions and their source |
//! | `bdesk diagnose` | Vertex credential state |
//!
//! ## Examples
//!
//! ```bash
//! bdesk --config ./config/bdesk.toml search "Err 04 PLB" --mode keyword
//! bdesk ask "Err 04 sulla PLB 620-3M, cosa significa?" --json
//! PORT=8000 bdesk serve
//! ```

use anyhow::Result;
use balance_desk::config::{self, Secrets, DEFAULT_CONFIG_PATH};
use balance_desk::logging::init_logging;
use balance_desk::models::Fragment;
use balance_desk::server;
use balance_desk::tools::{ToolContext, ToolRegistry};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;

/// Balance Desk: MCP retrieval server and support assistant for
/// weighing-equipment manuals.
#[derive(Parser)]
#[command(name = "bdesk", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    ///
    /// A missing file is fine at the default path; environment variables
    /// (`WEAVIATE_URL`, `PORT`, `MCP_SERVER_NAME`, ...) override the file.
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Log filter, e.g. `debug` or `balance_desk=trace`. Overrides `RUST_LOG`.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the HTTP server.
    Serve,

    /// Search the configured fragment collection.
    Search {
        query: String,

        /// `keyword`, `semantic` or `hybrid`.
        #[arg(long, default_value = "hybrid")]
        mode: String,

        #[arg(long)]
        limit: Option<usize>,

        /// Vector weight for hybrid mode.
        #[arg(long)]
        alpha: Option<f64>,

        /// Print the raw tool output.
        #[arg(long)]
        json: bool,
    },

    /// Answer one support request from the documentation.
    Ask {
        question: String,

        /// A clarifying question was already asked; search with what is known.
        #[arg(long)]
        clarified: bool,

        #[arg(long)]
        json: bool,
    },

    /// List backend collections.
    Collections,

    /// Show a collection's configuration.
    Schema { collection: String },

    /// Check backend readiness.
    Check,

    /// Show the served instructions, description and their sources.
    Instructions,

    /// Report Vertex project, OAuth and header state.
    Diagnose,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_level.as_deref())?;

    let cfg = Arc::new(config::load_config(&cli.config)?);
    let secrets = Secrets::from_env();

    run_command(cli.command, ToolContext::from_config(cfg, secrets)?).await
}

async fn run_command(command: Commands, ctx: ToolContext) -> Result<()> {
    let tools = ToolRegistry::with_builtins();

    match command {
        Commands::Serve => server::run_server(ctx).await?,
        Commands::Search {
            query,
            mode,
            limit,
            alpha,
            json,
        } => {
            let tool = match mode.as_str() {
                "keyword" => "keyword_search",
                "semantic" => "semantic_search",
                "hybrid" => "hybrid_search",
                other => anyhow::bail!(
                    "Unknown search mode: {}. Use keyword, semantic, or hybrid.",
                    other
                ),
            };
            let mut args = json!({
                "collection": ctx.config.weaviate.collection,
                "query": query,
            });
            if let Some(limit) = limit {
                args["limit"] = json!(limit);
            }
            if let Some(alpha) = alpha {
                args["alpha"] = json!(alpha);
            }
            let out = tools.call(tool, args, &ctx).await?;
            if json {
                print_json(&out)?;
            } else {
                print_results(&out, &ctx);
            }
        }
        Commands::Ask {
            question,
            clarified,
            json,
        } => {
            let answer = ctx.assistant().ask(&question, clarified).await;
            if json {
                print_json(&serde_json::to_value(&answer)?)?;
            } else {
                println!("{}", answer.text);
            }
        }
        Commands::Collections => {
            let out = tools.call("list_collections", json!({}), &ctx).await?;
            for name in out.as_array().into_iter().flatten() {
                println!("{}", name.as_str().unwrap_or_default());
            }
        }
        Commands::Schema { collection } => {
            let out = tools
                .call("get_schema", json!({ "collection": collection }), &ctx)
                .await?;
            print_json(&out)?;
        }
        Commands::Check => {
            let out = tools.call("check_connection", json!({}), &ctx).await?;
            let ready = out["ready"].as_bool().unwrap_or(false);
            println!(
                "{} ({}): {}",
                ctx.backend.kind(),
                ctx.config.weaviate.url,
                if ready { "ready" } else { "NOT ready" }
            );
            if !ready {
                std::process::exit(1);
            }
        }
        Commands::Instructions => {
            let out = tools.call("get_instructions", json!({}), &ctx).await?;
            print_json(&out)?;
        }
        Commands::Diagnose => {
            let out = tools.call("diagnose_vertex", json!({}), &ctx).await?;
            print_json(&out)?;
        }
    }

    Ok(())
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// One block per hit: rank, score, file and page, then a text excerpt.
fn print_results(out: &Value, ctx: &ToolContext) {
    let hits: Vec<balance_desk::models::SearchHit> = out["results"]
        .as_array()
        .into_iter()
        .flatten()
        .filter_map(hit_from_value)
        .collect();

    if hits.is_empty() {
        println!("No results.");
        return;
    }

    for (i, hit) in hits.iter().enumerate() {
        let fragment = Fragment::from_hit(hit, &ctx.config.fragments);
        let score = hit
            .score
            .map(|s| format!("{:.2}", s))
            .unwrap_or_else(|| "-".to_string());
        let page = fragment
            .page
            .page()
            .map(|p| format!(" p.{}", p))
            .unwrap_or_default();
        println!("{}. [{}] {}{}", i + 1, score, fragment.file_name, page);
        println!("   {}", excerpt(&fragment.text, 160));
    }
}

fn hit_from_value(v: &Value) -> Option<balance_desk::models::SearchHit> {
    Some(balance_desk::models::SearchHit {
        uuid: v.get("uuid")?.as_str()?.to_string(),
        properties: v.get("properties")?.as_object()?.clone(),
        score: v.get("bm25_score").and_then(|s| s.as_f64()),
        distance: v.get("distance").and_then(|d| d.as_f64()),
    })
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}…", cut.trim_end())
}
