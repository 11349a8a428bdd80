//! Server instructions and description.
//!
//! The instruction text is the assistant policy handed to MCP clients. It is
//! read from a file when one is configured and exists, otherwise from the
//! `MCP_PROMPT` / `MCP_INSTRUCTIONS` environment variables. The description
//! follows the same rule with `MCP_DESCRIPTION`. [`InstructionStore::reload`]
//! re-resolves both and swaps them in atomically.

use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use crate::config::InstructionsConfig;

/// Snapshot of the served texts and where they came from.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Instructions {
    pub instructions: Option<String>,
    pub description: Option<String>,
    pub server_name: String,
    pub prompt_file: Option<PathBuf>,
    pub description_file: Option<PathBuf>,
}

pub struct InstructionStore {
    config: InstructionsConfig,
    server_name: String,
    current: RwLock<Arc<Instructions>>,
}

impl InstructionStore {
    pub fn load(config: &InstructionsConfig, server_name: &str) -> Self {
        Self::load_with(config, server_name, env_lookup)
    }

    pub fn load_with(
        config: &InstructionsConfig,
        server_name: &str,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Self {
        let current = resolve(config, server_name, &lookup);
        Self {
            config: config.clone(),
            server_name: server_name.to_string(),
            current: RwLock::new(Arc::new(current)),
        }
    }

    pub fn current(&self) -> Arc<Instructions> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn reload(&self) -> Arc<Instructions> {
        self.reload_with(env_lookup)
    }

    pub fn reload_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Arc<Instructions> {
        let fresh = Arc::new(resolve(&self.config, &self.server_name, &lookup));
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = fresh.clone();
        tracing::info!(
            prompt_file = ?fresh.prompt_file,
            has_instructions = fresh.instructions.is_some(),
            "instructions reloaded"
        );
        fresh
    }
}

fn env_lookup(key: &str) -> Option<String> {
    std::env::var(key).ok()
}

fn resolve(
    config: &InstructionsConfig,
    server_name: &str,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Instructions {
    let prompt_file = lookup("MCP_PROMPT_FILE")
        .or_else(|| lookup("MCP_INSTRUCTIONS_FILE"))
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .or_else(|| config.prompt_file.clone())
        .or_else(|| existing(&config.default_prompt_file));
    let description_file = lookup("MCP_DESCRIPTION_FILE")
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .or_else(|| config.description_file.clone())
        .or_else(|| existing(&config.default_description_file));

    Instructions {
        instructions: load_text_source(
            &["MCP_PROMPT", "MCP_INSTRUCTIONS"],
            prompt_file.as_deref(),
            lookup,
        ),
        description: load_text_source(&["MCP_DESCRIPTION"], description_file.as_deref(), lookup),
        server_name: server_name.to_string(),
        prompt_file,
        description_file,
    }
}

fn existing(path: &Path) -> Option<PathBuf> {
    path.exists().then(|| path.to_path_buf())
}

/// File first (when it exists and is readable), then the first non-empty
/// environment variable. Text is trimmed.
fn load_text_source(
    env_keys: &[&str],
    file: Option<&Path>,
    lookup: &impl Fn(&str) -> Option<String>,
) -> Option<String> {
    if let Some(path) = file.filter(|p| p.exists()) {
        match std::fs::read_to_string(path) {
            Ok(text) => return Some(text.trim().to_string()),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "cannot read instructions file");
            }
        }
    }
    env_keys
        .iter()
        .filter_map(|k| lookup(k))
        .find(|v| !v.trim().is_empty())
        .map(|v| v.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    fn config_in(dir: &TempDir) -> InstructionsConfig {
        InstructionsConfig {
            prompt_file: None,
            description_file: None,
            default_prompt_file: dir.path().join("instructions.md"),
            default_description_file: dir.path().join("description.txt"),
        }
    }

    #[test]
    fn test_default_files_are_used_when_present() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("instructions.md"), "  Sei l'assistente.\n").unwrap();
        let store = InstructionStore::load_with(&config_in(&dir), "svc", |_| None);
        let current = store.current();
        assert_eq!(current.instructions.as_deref(), Some("Sei l'assistente."));
        assert_eq!(current.description, None);
        assert_eq!(current.server_name, "svc");
    }

    #[test]
    fn test_env_text_when_no_file() {
        let dir = TempDir::new().unwrap();
        let env: HashMap<&str, &str> = [("MCP_INSTRUCTIONS", "dall'ambiente"), ("MCP_DESCRIPTION", "desc")]
            .into_iter()
            .collect();
        let store = InstructionStore::load_with(&config_in(&dir), "svc", |k| {
            env.get(k).map(|v| v.to_string())
        });
        let current = store.current();
        assert_eq!(current.instructions.as_deref(), Some("dall'ambiente"));
        assert_eq!(current.description.as_deref(), Some("desc"));
        assert_eq!(current.prompt_file, None);
    }

    #[test]
    fn test_file_wins_over_env() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("instructions.md"), "dal file").unwrap();
        let store = InstructionStore::load_with(&config_in(&dir), "svc", |k| {
            (k == "MCP_PROMPT").then(|| "dall'ambiente".to_string())
        });
        assert_eq!(store.current().instructions.as_deref(), Some("dal file"));
    }

    #[test]
    fn test_reload_picks_up_changes() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("instructions.md");
        std::fs::write(&path, "v1").unwrap();
        let store = InstructionStore::load_with(&config_in(&dir), "svc", |_| None);
        std::fs::write(&path, "v2").unwrap();
        let before = store.current();
        let after = store.reload_with(|_| None);
        assert_eq!(before.instructions.as_deref(), Some("v1"));
        assert_eq!(after.instructions.as_deref(), Some("v2"));
        assert_eq!(store.current().instructions.as_deref(), Some("v2"));
    }

    #[test]
    fn test_prompt_file_env_override_on_reload() {
        let dir = TempDir::new().unwrap();
        let other = dir.path().join("altro.md");
        std::fs::write(&other, "altro prompt").unwrap();
        let store = InstructionStore::load_with(&config_in(&dir), "svc", |_| None);
        assert_eq!(store.current().instructions, None);
        let other_str = other.to_string_lossy().to_string();
        let reloaded = store.reload_with(|k| (k == "MCP_PROMPT_FILE").then(|| other_str.clone()));
        assert_eq!(reloaded.instructions.as_deref(), Some("altro prompt"));
        assert_eq!(reloaded.prompt_file.as_deref(), Some(other.as_path()));
    }
}
