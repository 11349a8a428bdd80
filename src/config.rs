//! TOML configuration with environment overrides.
//!
//! Every table and field has a default, so an empty file (or no file at all
//! when the default path is used) yields a working configuration pointed at
//! `http://localhost:8080`. The deployment is environment-driven, so
//! [`Config::apply_env`] runs after parsing and wins over the file.
//!
//! Secrets (Weaviate and provider API keys, Vertex tokens) are never read
//! from TOML. See [`Secrets`].

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Default config path used by the CLI.
pub const DEFAULT_CONFIG_PATH: &str = "./config/bdesk.toml";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub instructions: InstructionsConfig,
    pub backend: BackendConfig,
    pub weaviate: WeaviateConfig,
    pub retrieval: RetrievalConfig,
    pub fragments: FragmentFields,
    pub files: FileFields,
    pub support: SupportConfig,
    pub vertex: VertexConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    /// Name advertised in MCP server info and `/health`.
    pub name: String,
    /// Host header allowlist. `host:*` matches any port.
    pub allowed_hosts: Vec<String>,
    /// Externally visible hostname; appended to the allowlist with and without port.
    pub public_host: Option<String>,
    pub dns_rebinding_protection: bool,
    /// Stateless streamable HTTP (no MCP session ids).
    pub stateless: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:10000".to_string(),
            name: "weaviate-mcp-http".to_string(),
            allowed_hosts: vec!["localhost".to_string(), "127.0.0.1:*".to_string()],
            public_host: None,
            dns_rebinding_protection: true,
            stateless: true,
        }
    }
}

impl ServerConfig {
    /// The full Host allowlist, including the public host entries.
    pub fn effective_allowed_hosts(&self) -> Vec<String> {
        let mut hosts = self.allowed_hosts.clone();
        if let Some(host) = &self.public_host {
            hosts.push(host.clone());
            hosts.push(format!("{}:*", host));
        }
        hosts
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct InstructionsConfig {
    pub prompt_file: Option<PathBuf>,
    pub description_file: Option<PathBuf>,
    /// Used when `prompt_file` is unset and this path exists.
    pub default_prompt_file: PathBuf,
    pub default_description_file: PathBuf,
}

impl Default for InstructionsConfig {
    fn default() -> Self {
        Self {
            prompt_file: None,
            description_file: None,
            default_prompt_file: PathBuf::from("prompts/instructions.md"),
            default_description_file: PathBuf::from("prompts/description.txt"),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Weaviate,
    Fixture,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct BackendConfig {
    pub kind: BackendKind,
    /// JSON fixture loaded by the in-memory backend.
    pub fixture_path: Option<PathBuf>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::Weaviate,
            fixture_path: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct WeaviateConfig {
    pub url: String,
    /// Fragment collection searched by `hybrid_search` and the assistant.
    pub collection: String,
    /// Optional collection holding file records.
    pub files_collection: Option<String>,
    /// Replace any other collection requested through `hybrid_search`.
    pub enforce_collection: bool,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

impl Default for WeaviateConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:8080".to_string(),
            collection: "WindBilance".to_string(),
            files_collection: None,
            enforce_collection: true,
            timeout_secs: 30,
            max_retries: 2,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Vector weight: `hybrid = (1-α)*keyword + α*vector`.
    pub alpha: f64,
    pub default_limit: usize,
    pub min_limit: usize,
    pub max_limit: usize,
    pub query_properties: Vec<String>,
    /// Best fused score below this makes a result set weak.
    pub min_score: f64,
    /// Share of the request's content words one document must contain.
    pub min_keyword_coverage: f64,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            alpha: 0.8,
            default_limit: 10,
            min_limit: 5,
            max_limit: 20,
            query_properties: vec!["caption".to_string(), "name".to_string()],
            min_score: 0.3,
            min_keyword_coverage: 0.5,
        }
    }
}

impl RetrievalConfig {
    pub fn clamp_limit(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_limit)
            .clamp(self.min_limit, self.max_limit)
    }
}

/// Property names of the fragment collection.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FragmentFields {
    pub text: String,
    pub name: String,
    pub file: String,
    pub file_id: Option<String>,
    pub page: String,
    pub order: Option<String>,
    pub media_type: String,
    pub url: Option<String>,
}

impl Default for FragmentFields {
    fn default() -> Self {
        Self {
            text: "caption".to_string(),
            name: "name".to_string(),
            file: "source_pdf".to_string(),
            file_id: None,
            page: "page_index".to_string(),
            order: None,
            media_type: "mediaType".to_string(),
            url: None,
        }
    }
}

impl FragmentFields {
    /// Properties requested from the backend, in a stable order.
    pub fn return_properties(&self) -> Vec<String> {
        let mut props = vec![
            self.text.clone(),
            self.name.clone(),
            self.file.clone(),
            self.page.clone(),
            self.media_type.clone(),
        ];
        for extra in [&self.file_id, &self.order, &self.url].into_iter().flatten() {
            props.push(extra.clone());
        }
        props.dedup();
        props
    }
}

/// Property names of the files collection.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FileFields {
    pub id: String,
    pub name: String,
    pub path: String,
    pub url: String,
    pub file_type: String,
    pub modified_at: String,
    pub indexed_at: String,
    pub deleted: String,
    pub note: String,
}

impl Default for FileFields {
    fn default() -> Self {
        Self {
            id: "file_id".to_string(),
            name: "name".to_string(),
            path: "path".to_string(),
            url: "url".to_string(),
            file_type: "file_type".to_string(),
            modified_at: "modified_at".to_string(),
            indexed_at: "indexed_at".to_string(),
            deleted: "deleted".to_string(),
            note: "note".to_string(),
        }
    }
}

impl FileFields {
    pub fn return_properties(&self) -> Vec<String> {
        vec![
            self.id.clone(),
            self.name.clone(),
            self.path.clone(),
            self.url.clone(),
            self.file_type.clone(),
            self.modified_at.clone(),
            self.indexed_at.clone(),
            self.deleted.clone(),
            self.note.clone(),
        ]
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SupportConfig {
    /// How the official support channel is named in answers.
    pub name: String,
    pub url: Option<String>,
    pub email: Option<String>,
}

impl Default for SupportConfig {
    fn default() -> Self {
        Self {
            name: "l'assistenza tecnica ufficiale".to_string(),
            url: None,
            email: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TokenSource {
    /// Mint tokens from a service-account key. Without `path` the key is
    /// looked up in `GOOGLE_APPLICATION_CREDENTIALS_JSON`,
    /// `GOOGLE_APPLICATION_CREDENTIALS`, then `service_account_paths`.
    ServiceAccount {
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// GCE/Cloud Run metadata server.
    Metadata { url: String },
    /// A command printing an access token on stdout.
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
    },
}

impl Default for TokenSource {
    fn default() -> Self {
        TokenSource::ServiceAccount { path: None }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct VertexConfig {
    /// Keep a refreshed OAuth token in the background.
    pub use_oauth: bool,
    pub token_source: TokenSource,
    pub service_account_paths: Vec<PathBuf>,
    pub default_refresh_secs: u64,
    pub retry_secs: u64,
}

impl Default for VertexConfig {
    fn default() -> Self {
        Self {
            use_oauth: false,
            token_source: TokenSource::default(),
            service_account_paths: vec![PathBuf::from("/etc/secrets/weaviate-sa.json")],
            default_refresh_secs: 55 * 60,
            retry_secs: 60,
        }
    }
}

/// Secrets read from the environment at startup.
#[derive(Debug, Clone, Default)]
pub struct Secrets {
    pub weaviate_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub cohere_api_key: Option<String>,
    /// Static Vertex key or bearer token; disables OAuth refresh when set.
    pub vertex_token: Option<String>,
}

impl Secrets {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let first = |keys: &[&str]| keys.iter().find_map(|k| non_empty(lookup(k)));
        Self {
            weaviate_api_key: first(&["WEAVIATE_API_KEY"]),
            openai_api_key: first(&["OPENAI_API_KEY", "OPENAI_APIKEY"]),
            cohere_api_key: first(&["COHERE_API_KEY"]),
            vertex_token: first(&["VERTEX_APIKEY", "VERTEX_BEARER_TOKEN"]),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn truthy(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes")
}

impl Config {
    /// Apply environment overrides on top of the parsed file.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let first = |keys: &[&str]| keys.iter().find_map(|k| non_empty(lookup(k)));

        if let Some(url) = first(&["WEAVIATE_CLUSTER_URL", "WEAVIATE_URL"]) {
            self.weaviate.url = url;
        }
        if let Some(port) = first(&["PORT"]) {
            self.server.bind = format!("0.0.0.0:{}", port);
        }
        if let Some(name) = first(&["MCP_SERVER_NAME"]) {
            self.server.name = name;
        }
        if let Some(path) = first(&["MCP_PROMPT_FILE", "MCP_INSTRUCTIONS_FILE"]) {
            self.instructions.prompt_file = Some(PathBuf::from(path));
        }
        if let Some(path) = first(&["MCP_DESCRIPTION_FILE"]) {
            self.instructions.description_file = Some(PathBuf::from(path));
        }
        if let Some(host) = first(&["RENDER_EXTERNAL_HOSTNAME"]) {
            self.server.public_host = Some(host);
        }
        if let Some(flag) = first(&["VERTEX_USE_OAUTH"]) {
            self.vertex.use_oauth = truthy(&flag);
        }
        if let Some(path) = first(&["VERTEX_SA_PATH"]) {
            self.vertex.service_account_paths.insert(0, PathBuf::from(path));
        }
    }

    fn validate(&self) -> Result<()> {
        if !(0.0..=1.0).contains(&self.retrieval.alpha) {
            bail!("retrieval.alpha must be in [0.0, 1.0]");
        }
        if !(0.0..=1.0).contains(&self.retrieval.min_keyword_coverage) {
            bail!("retrieval.min_keyword_coverage must be in [0.0, 1.0]");
        }
        if self.retrieval.min_limit == 0 {
            bail!("retrieval.min_limit must be >= 1");
        }
        if self.retrieval.min_limit > self.retrieval.max_limit {
            bail!("retrieval.min_limit must not exceed retrieval.max_limit");
        }
        if self.retrieval.query_properties.is_empty() {
            bail!("retrieval.query_properties must not be empty");
        }
        if self.weaviate.collection.trim().is_empty() {
            bail!("weaviate.collection must not be empty");
        }
        if self.backend.kind == BackendKind::Fixture && self.backend.fixture_path.is_none() {
            bail!("backend.fixture_path must be set when backend.kind is 'fixture'");
        }
        if self.server.bind.trim().is_empty() {
            bail!("server.bind must not be empty");
        }
        Ok(())
    }
}

/// Load the config file, apply environment overrides, and validate.
///
/// A missing file is only tolerated at [`DEFAULT_CONFIG_PATH`].
pub fn load_config(path: &Path) -> Result<Config> {
    load_config_with_env(path, |key| std::env::var(key).ok())
}

pub fn load_config_with_env(
    path: &Path,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Config> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str::<Config>(&content).with_context(|| "Failed to parse config file")?
    } else if path == Path::new(DEFAULT_CONFIG_PATH) {
        Config::default()
    } else {
        bail!("Config file not found: {}", path.display());
    };

    if let (Some(fixture), Some(dir)) = (&config.backend.fixture_path, path.parent()) {
        if fixture.is_relative() && path.exists() {
            config.backend.fixture_path = Some(dir.join(fixture));
        }
    }

    config.apply_env(lookup);
    config.validate()?;
    Ok(config)
}
