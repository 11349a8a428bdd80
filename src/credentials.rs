//! Vertex AI credentials forwarded to Weaviate's `text2vec-google` module.
//!
//! Weaviate vectorizes queries itself, so every request must carry a Google
//! access token in `X-Goog-Vertex-Api-Key` (plus `X-Goog-User-Project` when
//! the project is known). The token comes from one of:
//!
//! | Source | When |
//! |--------|------|
//! | `VERTEX_APIKEY` / `VERTEX_BEARER_TOKEN` | static, never refreshed |
//! | service-account key (`gcp_auth`) | `token_source.kind = "service_account"` (default) |
//! | metadata server | `[vertex] token_source.kind = "metadata"` |
//! | command (e.g. `gcloud auth print-access-token`) | `token_source.kind = "command"` |
//!
//! With `use_oauth = true` a background task keeps the cached token fresh:
//! it sleeps until five minutes before expiry (default 55 minutes when the
//! expiry is unknown or too close) and retries after `retry_secs` on error.

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use gcp_auth::{CustomServiceAccount, TokenProvider};
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::{Secrets, TokenSource, VertexConfig};

pub const VERTEX_KEY_HEADER: &str = "X-Goog-Vertex-Api-Key";
pub const USER_PROJECT_HEADER: &str = "X-Goog-User-Project";

/// Seconds subtracted from the reported expiry before refreshing.
const EXPIRY_MARGIN_SECS: u64 = 300;

const CLOUD_PLATFORM_SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";

/// Where a service-account key was found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceAccountKey {
    /// JSON from `GOOGLE_APPLICATION_CREDENTIALS_JSON`.
    Inline(String),
    File(PathBuf),
}

impl fmt::Display for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServiceAccountKey::Inline(_) => write!(f, "GOOGLE_APPLICATION_CREDENTIALS_JSON"),
            ServiceAccountKey::File(path) => write!(f, "{}", path.display()),
        }
    }
}

/// A freshly minted access token.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    pub expires_in: Option<u64>,
}

#[derive(Debug, Default)]
struct TokenState {
    token: Option<String>,
    expires_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

#[derive(Deserialize)]
struct MetadataTokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

pub struct VertexCredentials {
    config: VertexConfig,
    static_token: Option<String>,
    project_id: Option<String>,
    state: RwLock<TokenState>,
    http: reqwest::Client,
    refresher_started: AtomicBool,
}

impl VertexCredentials {
    pub fn new(config: &VertexConfig, secrets: &Secrets) -> Result<Self> {
        let project_id =
            discover_project_id(&config.service_account_paths, |k| std::env::var(k).ok());
        match &project_id {
            Some(p) => tracing::info!(project = %p, "detected service account project"),
            None => tracing::debug!("no service account project found"),
        }
        Self::with_project(config, secrets, project_id)
    }

    pub fn with_project(
        config: &VertexConfig,
        secrets: &Secrets,
        project_id: Option<String>,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            config: config.clone(),
            static_token: secrets.vertex_token.clone(),
            project_id,
            state: RwLock::new(TokenState::default()),
            http,
            refresher_started: AtomicBool::new(false),
        })
    }

    pub fn project_id(&self) -> Option<&str> {
        self.project_id.as_deref()
    }

    /// OAuth refresh applies only when no static token is configured.
    pub fn oauth_enabled(&self) -> bool {
        self.config.use_oauth && self.static_token.is_none()
    }

    /// The token to forward, refreshing once if OAuth is on and the cache is empty.
    pub async fn current_token(&self) -> Option<String> {
        if let Some(token) = &self.static_token {
            return Some(token.clone());
        }
        if let Some(token) = self.state.read().await.token.clone() {
            return Some(token);
        }
        if !self.oauth_enabled() {
            return None;
        }
        match self.refresh().await {
            Ok(t) => Some(t.token),
            Err(e) => {
                tracing::warn!(error = %e, "failed to refresh Vertex token");
                None
            }
        }
    }

    /// Headers to attach to each Weaviate request. Empty without a token.
    pub async fn headers(&self) -> Vec<(&'static str, String)> {
        match self.current_token().await {
            Some(token) => build_header_map(&token, self.project_id()),
            None => Vec::new(),
        }
    }

    /// Mint a new token and cache it.
    pub async fn refresh(&self) -> Result<AccessToken> {
        match self.fetch_token().await {
            Ok(token) => {
                let mut state = self.state.write().await;
                state.token = Some(token.token.clone());
                state.expires_at = token
                    .expires_in
                    .map(|s| Utc::now() + ChronoDuration::seconds(s as i64));
                state.last_error = None;
                tracing::info!(prefix = %preview(&token.token, 10), "Vertex token refreshed");
                Ok(token)
            }
            Err(e) => {
                self.state.write().await.last_error = Some(e.to_string());
                Err(e)
            }
        }
    }

    async fn fetch_token(&self) -> Result<AccessToken> {
        match &self.config.token_source {
            TokenSource::ServiceAccount { path } => {
                let key = locate_service_account(
                    path.as_deref(),
                    &self.config.service_account_paths,
                    |k| std::env::var(k).ok(),
                )
                .context("no service account key found")?;
                let account = match &key {
                    ServiceAccountKey::Inline(json) => CustomServiceAccount::from_json(json),
                    ServiceAccountKey::File(p) => CustomServiceAccount::from_file(p),
                }
                .with_context(|| format!("invalid service account key ({})", key))?;
                let token = account
                    .token(&[CLOUD_PLATFORM_SCOPE])
                    .await
                    .with_context(|| format!("token exchange for {} failed", key))?;
                // A new account has no cache: the token is freshly minted and
                // lives an hour, which the default refresh interval covers.
                Ok(AccessToken {
                    token: token.as_str().to_string(),
                    expires_in: None,
                })
            }
            TokenSource::Metadata { url } => {
                let resp = self
                    .http
                    .get(url)
                    .header("Metadata-Flavor", "Google")
                    .send()
                    .await
                    .with_context(|| format!("token request to {} failed", url))?;
                let status = resp.status();
                if !status.is_success() {
                    let body = resp.text().await.unwrap_or_default();
                    bail!("token endpoint returned {}: {}", status, body);
                }
                let parsed: MetadataTokenResponse = resp.json().await?;
                if parsed.access_token.is_empty() {
                    bail!("token endpoint returned an empty token");
                }
                Ok(AccessToken {
                    token: parsed.access_token,
                    expires_in: parsed.expires_in,
                })
            }
            TokenSource::Command { program, args } => {
                let output = tokio::process::Command::new(program)
                    .args(args)
                    .output()
                    .await
                    .with_context(|| format!("failed to run token command '{}'", program))?;
                if !output.status.success() {
                    bail!(
                        "token command '{}' failed: {}",
                        program,
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                let token = String::from_utf8_lossy(&output.stdout).trim().to_string();
                if token.is_empty() {
                    bail!("token command '{}' printed no token", program);
                }
                Ok(AccessToken {
                    token,
                    expires_in: None,
                })
            }
        }
    }

    /// Start the background refresher once. Returns `None` when OAuth is off
    /// or a refresher is already running.
    pub fn spawn_refresher(self: &Arc<Self>) -> Option<JoinHandle<()>> {
        if !self.oauth_enabled() {
            return None;
        }
        if self.refresher_started.swap(true, Ordering::SeqCst) {
            return None;
        }
        let creds = Arc::clone(self);
        Some(tokio::spawn(async move {
            loop {
                let delay = match creds.refresh().await {
                    Ok(token) => {
                        next_refresh_delay(token.expires_in, creds.config.default_refresh_secs)
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "Vertex token refresh error");
                        Duration::from_secs(creds.config.retry_secs)
                    }
                };
                tokio::time::sleep(delay).await;
            }
        }))
    }

    /// Snapshot for the `diagnose_vertex` tool. Performs a live refresh when
    /// no static token is configured.
    pub async fn diagnose(&self) -> Value {
        let (cached, last_error) = {
            let state = self.state.read().await;
            (state.token.is_some(), state.last_error.clone())
        };
        let mut info = json!({
            "project_id": self.project_id,
            "oauth_enabled": self.config.use_oauth,
            "static_token": self.static_token.is_some(),
            "headers_active": cached || self.static_token.is_some(),
            "last_refresh_error": last_error,
        });

        if let Some(token) = &self.static_token {
            info["token_sample"] = json!(format!("{}...", preview(token, 12)));
            info["token_expiry"] = Value::Null;
            return info;
        }

        match self.refresh().await {
            Ok(token) => {
                info["token_sample"] = json!(format!("{}...", preview(&token.token, 12)));
                info["token_expiry"] = json!(self
                    .state
                    .read()
                    .await
                    .expires_at
                    .map(|t| t.to_rfc3339()));
            }
            Err(e) => {
                info["token_sample"] = Value::Null;
                info["token_expiry"] = Value::Null;
                info["token_error"] = json!(e.to_string());
            }
        }
        info
    }
}

/// Header pairs for Weaviate's Google module.
pub fn build_header_map(token: &str, project_id: Option<&str>) -> Vec<(&'static str, String)> {
    let mut headers = vec![(VERTEX_KEY_HEADER, token.to_string())];
    if let Some(project) = project_id {
        headers.push((USER_PROJECT_HEADER, project.to_string()));
    }
    headers
}

/// Sleep before the next refresh.
///
/// `expires_in - 300` when that leaves more than five minutes, otherwise
/// `default_secs`.
pub fn next_refresh_delay(expires_in: Option<u64>, default_secs: u64) -> Duration {
    match expires_in {
        Some(secs) if secs > 2 * EXPIRY_MARGIN_SECS => Duration::from_secs(secs - EXPIRY_MARGIN_SECS),
        _ => Duration::from_secs(default_secs),
    }
}

/// Find the GCP project id from inline JSON credentials, the
/// `GOOGLE_APPLICATION_CREDENTIALS` file, or the configured candidate paths.
pub fn discover_project_id(
    candidates: &[PathBuf],
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<String> {
    if let Some(inline) = lookup("GOOGLE_APPLICATION_CREDENTIALS_JSON") {
        if let Some(project) = project_from_json(&inline) {
            return Some(project);
        }
    }

    let env_path = lookup("GOOGLE_APPLICATION_CREDENTIALS").map(PathBuf::from);
    env_path
        .iter()
        .chain(candidates.iter())
        .filter(|p| p.exists())
        .find_map(|p| {
            let content = std::fs::read_to_string(p).ok()?;
            let project = project_from_json(&content);
            if project.is_none() {
                tracing::warn!(path = %p.display(), "project_id not found in service account JSON");
            }
            project
        })
}

/// Find the service-account key: an explicit path, then inline JSON, then
/// `GOOGLE_APPLICATION_CREDENTIALS`, then the first existing candidate.
pub fn locate_service_account(
    explicit: Option<&Path>,
    candidates: &[PathBuf],
    lookup: impl Fn(&str) -> Option<String>,
) -> Option<ServiceAccountKey> {
    if let Some(path) = explicit {
        return Some(ServiceAccountKey::File(path.to_path_buf()));
    }
    if let Some(inline) = lookup("GOOGLE_APPLICATION_CREDENTIALS_JSON").filter(|s| !s.trim().is_empty()) {
        return Some(ServiceAccountKey::Inline(inline));
    }
    lookup("GOOGLE_APPLICATION_CREDENTIALS")
        .map(PathBuf::from)
        .into_iter()
        .chain(candidates.iter().cloned())
        .find(|p| p.exists())
        .map(ServiceAccountKey::File)
}

fn project_from_json(content: &str) -> Option<String> {
    let value: Value = serde_json::from_str(content).ok()?;
    ["project_id", "quota_project_id"]
        .iter()
        .find_map(|key| value.get(*key)?.as_str().filter(|s| !s.is_empty()))
        .map(str::to_string)
}

fn preview(token: &str, n: usize) -> String {
    token.chars().take(n).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_map_with_project() {
        let headers = build_header_map("ya29.abc", Some("scales-prod"));
        assert_eq!(headers[0], (VERTEX_KEY_HEADER, "ya29.abc".to_string()));
        assert_eq!(headers[1], (USER_PROJECT_HEADER, "scales-prod".to_string()));
    }

    #[test]
    fn test_header_map_without_project() {
        assert_eq!(build_header_map("t", None).len(), 1);
    }

    #[test]
    fn test_refresh_delay() {
        assert_eq!(next_refresh_delay(Some(3600), 3300), Duration::from_secs(3300));
        assert_eq!(next_refresh_delay(Some(7200), 3300), Duration::from_secs(6900));
        assert_eq!(next_refresh_delay(Some(400), 3300), Duration::from_secs(3300));
        assert_eq!(next_refresh_delay(None, 3300), Duration::from_secs(3300));
    }

    #[test]
    fn test_project_from_inline_json() {
        let project = discover_project_id(&[], |k| {
            (k == "GOOGLE_APPLICATION_CREDENTIALS_JSON")
                .then(|| r#"{"type":"service_account","project_id":"bilance-42"}"#.to_string())
        });
        assert_eq!(project.as_deref(), Some("bilance-42"));
    }

    #[test]
    fn test_project_falls_back_to_quota_project() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sa = tmp.path().join("sa.json");
        std::fs::write(&sa, r#"{"quota_project_id":"quota-1"}"#).unwrap();
        let project = discover_project_id(&[tmp.path().join("missing.json"), sa], |_| None);
        assert_eq!(project.as_deref(), Some("quota-1"));
    }

    #[tokio::test]
    async fn test_static_token_takes_precedence() {
        let secrets = Secrets {
            vertex_token: Some("static-token-value".to_string()),
            ..Default::default()
        };
        let config = VertexConfig {
            use_oauth: true,
            ..Default::default()
        };
        let creds = VertexCredentials::with_project(&config, &secrets, Some("p".into())).unwrap();
        assert!(!creds.oauth_enabled());
        let headers = creds.headers().await;
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[0].1, "static-token-value");
        let info = creds.diagnose().await;
        assert_eq!(info["token_sample"], "static-token...");
    }

    #[tokio::test]
    async fn test_no_token_without_oauth() {
        let creds = VertexCredentials::with_project(
            &VertexConfig::default(),
            &Secrets::default(),
            None,
        )
        .unwrap();
        assert!(creds.headers().await.is_empty());
        assert!(Arc::new(creds).spawn_refresher().is_none());
    }

    #[test]
    fn test_locate_service_account_order() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sa = tmp.path().join("weaviate-sa.json");
        std::fs::write(&sa, "{}").unwrap();
        let candidates = vec![tmp.path().join("missing.json"), sa.clone()];

        assert_eq!(
            locate_service_account(None, &candidates, |_| None),
            Some(ServiceAccountKey::File(sa.clone()))
        );
        assert_eq!(
            locate_service_account(None, &candidates, |k| {
                (k == "GOOGLE_APPLICATION_CREDENTIALS_JSON").then(|| "{\"type\":\"x\"}".to_string())
            }),
            Some(ServiceAccountKey::Inline("{\"type\":\"x\"}".to_string()))
        );
        let explicit = tmp.path().join("explicit.json");
        assert_eq!(
            locate_service_account(Some(explicit.as_path()), &candidates, |_| None),
            Some(ServiceAccountKey::File(explicit))
        );
        assert_eq!(
            locate_service_account(None, &[tmp.path().join("missing.json")], |_| None),
            None
        );
    }

    #[tokio::test]
    async fn test_malformed_service_account_is_reported() {
        let tmp = tempfile::TempDir::new().unwrap();
        let sa = tmp.path().join("weaviate-sa.json");
        std::fs::write(&sa, r#"{"project_id":"p"}"#).unwrap();
        let config = VertexConfig {
            use_oauth: true,
            token_source: TokenSource::ServiceAccount { path: Some(sa) },
            ..Default::default()
        };
        let creds = VertexCredentials::with_project(&config, &Secrets::default(), None).unwrap();
        let err = creds.refresh().await.unwrap_err();
        assert!(err.to_string().contains("invalid service account key"), "{}", err);
        assert!(creds.headers().await.is_empty());
        let info = creds.diagnose().await;
        assert!(info["last_refresh_error"].is_string());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_token_source() {
        let config = VertexConfig {
            use_oauth: true,
            token_source: TokenSource::Command {
                program: "echo".to_string(),
                args: vec!["ya29.from-command".to_string()],
            },
            ..Default::default()
        };
        let creds = VertexCredentials::with_project(&config, &Secrets::default(), None).unwrap();
        assert_eq!(creds.current_token().await.as_deref(), Some("ya29.from-command"));
    }
}
