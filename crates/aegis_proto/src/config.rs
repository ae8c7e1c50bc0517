//! Application configuration tree.
//!
//! Loaded once at startup and injected by value into each component; no
//! component reads configuration after construction, and there is no
//! global. Unknown file keys are ignored so configs can carry sections for
//! outer layers (model settings, UI preferences) the core never sees.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config file unreadable: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parse error: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssistantConfig {
    /// Hard timeout applied to every tool invocation, seconds.
    #[serde(default = "default_tool_timeout")]
    pub tool_timeout_sec: u64,
    #[serde(default = "default_true")]
    pub allow_web_search: bool,
    #[serde(default)]
    pub allow_code_exec: bool,
    /// When non-empty, web fetches are restricted to these domains.
    #[serde(default)]
    pub allow_domains: Vec<String>,
}

impl Default for AssistantConfig {
    fn default() -> Self {
        Self {
            tool_timeout_sec: default_tool_timeout(),
            allow_web_search: true,
            allow_code_exec: false,
            allow_domains: vec![],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    pub contacts_db: PathBuf,
    pub memory_graph_db: PathBuf,
    pub keys_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeshConfig {
    /// Relay base URL, e.g. `ws://nexus.example:9000`.
    pub nexus_url: String,
    pub peer_id: String,
    /// Sessions older than this are evicted by the maintenance sweep.
    #[serde(default = "default_session_max_age")]
    pub session_max_age_sec: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub assistant: AssistantConfig,
    pub paths: PathsConfig,
    pub mesh: MeshConfig,
}

impl AppConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}

fn default_tool_timeout() -> u64 {
    20
}

fn default_true() -> bool {
    true
}

fn default_session_max_age() -> i64 {
    1800
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                "paths": {
                    "contacts_db": "data/contacts.db",
                    "memory_graph_db": "data/graph.db",
                    "keys_dir": "data/keys"
                },
                "mesh": {"nexus_url": "ws://localhost:9000", "peer_id": "alice"},
                "models": [{"name": "ignored-by-core"}]
            }"#,
        )
        .unwrap();

        let cfg = AppConfig::load(&path).unwrap();
        assert_eq!(cfg.assistant.tool_timeout_sec, 20);
        assert!(cfg.assistant.allow_web_search);
        assert!(!cfg.assistant.allow_code_exec);
        assert_eq!(cfg.mesh.session_max_age_sec, 1800);
    }
}
