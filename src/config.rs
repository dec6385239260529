use crate::error::{RagError, Result};
use log::debug;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Listen on every interface when `server.host` is unset
pub const DEFAULT_SERVER_HOST: &str = "0.0.0.0";
pub const DEFAULT_SERVER_PORT: u16 = 8080;
pub const DEFAULT_QDRANT_HOST: &str = "localhost";
/// Qdrant's REST port. The client speaks gRPC, which Qdrant serves on 6334,
/// so deployments normally set `qdrant.port: 6334`.
pub const DEFAULT_QDRANT_PORT: u16 = 6333;
pub const DEFAULT_COLLECTION_NAME: &str = "senrag_collection";
pub const DEFAULT_MAX_FILE_SIZE: u64 = 50 << 20;
pub const DEFAULT_SAVE_PATH: &str = "./uploads";
pub const DEFAULT_BATCH_SIZE: usize = 32;
/// Dimension of OpenAI `text-embedding-3-small`
pub const DEFAULT_EMBEDDING_DIMENSIONS: u64 = 1536;

/// Locations searched for a config file when none is given explicitly
const CONFIG_SEARCH_PATHS: [&str; 4] = [
    "config.yaml",
    ".config.yaml",
    ".env.yaml",
    "/etc/senrag/config.yaml",
];

/// Service configuration, loaded from YAML with environment overrides
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub llm: LlmConfig,
    pub qdrant: QdrantConfig,
    pub upload: UploadConfig,
    pub embedder: EmbedderConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Settings shared by the chat and embedding clients
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LlmConfig {
    /// openai, ollama, local; informational only
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct QdrantConfig {
    pub host: String,
    pub port: u16,
    pub api_key: String,
    pub use_auth: bool,
    pub collection_name: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct UploadConfig {
    pub max_file_size: u64,
    pub allowed_extensions: Vec<String>,
    pub save_path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EmbedderConfig {
    pub model: String,
    pub batch_size: usize,
    pub dimensions: u64,
}

impl Config {
    /// Load configuration from a YAML file, then apply environment overrides and defaults
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| {
            RagError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;

        Self::from_yaml_with_env(&data, |key| env::var(key).ok())
    }

    /// Parse YAML and resolve overrides through `lookup` instead of the process environment
    pub fn from_yaml_with_env<F>(data: &str, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        // An empty file is a valid, all-defaults config
        let mut config: Config = if data.trim().is_empty() {
            Config::default()
        } else {
            serde_yaml::from_str(data)
                .map_err(|e| RagError::Config(format!("invalid YAML: {}", e)))?
        };

        config.apply_env_overrides(lookup);
        config.apply_defaults();

        Ok(config)
    }

    /// Override values from `LLM_*` and `QDRANT_*` variables; empty values are ignored
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = get("LLM_BASE_URL") {
            debug!("LLM_BASE_URL overrides llm.base_url");
            self.llm.base_url = v;
        }
        if let Some(v) = get("LLM_API_KEY") {
            self.llm.api_key = v;
        }
        if let Some(v) = get("LLM_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("QDRANT_HOST") {
            self.qdrant.host = v;
        }
        if let Some(v) = get("QDRANT_API_KEY") {
            self.qdrant.api_key = v;
        }
    }

    /// Fill unset (zero or empty) values with their defaults
    pub fn apply_defaults(&mut self) {
        if self.server.host.is_empty() {
            self.server.host = DEFAULT_SERVER_HOST.to_string();
        }
        if self.server.port == 0 {
            self.server.port = DEFAULT_SERVER_PORT;
        }
        if self.qdrant.host.is_empty() {
            self.qdrant.host = DEFAULT_QDRANT_HOST.to_string();
        }
        if self.qdrant.port == 0 {
            self.qdrant.port = DEFAULT_QDRANT_PORT;
        }
        if self.qdrant.collection_name.is_empty() {
            self.qdrant.collection_name = DEFAULT_COLLECTION_NAME.to_string();
        }
        if self.upload.max_file_size == 0 {
            self.upload.max_file_size = DEFAULT_MAX_FILE_SIZE;
        }
        if self.upload.save_path.is_empty() {
            self.upload.save_path = DEFAULT_SAVE_PATH.to_string();
        }
        if self.embedder.batch_size == 0 {
            self.embedder.batch_size = DEFAULT_BATCH_SIZE;
        }
        if self.embedder.dimensions == 0 {
            self.embedder.dimensions = DEFAULT_EMBEDDING_DIMENSIONS;
        }
    }

    /// Address the HTTP server binds to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Whether `ext` (with or without the leading dot) may be uploaded
    pub fn is_extension_allowed(&self, ext: &str) -> bool {
        if self.upload.allowed_extensions.is_empty() {
            return true;
        }
        let ext = ext.trim_start_matches('.');
        self.upload
            .allowed_extensions
            .iter()
            .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
    }
}

/// Find the config file: the first existing entry of the search list, else `config.yaml`
pub fn find_config_path() -> PathBuf {
    CONFIG_SEARCH_PATHS
        .iter()
        .map(Path::new)
        .find(|p| p.exists())
        .map(|p| p.canonicalize().unwrap_or_else(|_| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from(CONFIG_SEARCH_PATHS[0]))
}

/// Process-wide configuration handle.
///
/// Cloning shares the same underlying config. Only the LLM endpoint and model
/// can change after startup, and changes are never written back to disk.
#[derive(Debug, Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Config>>,
}

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        SharedConfig {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Copy of the full current configuration
    pub fn snapshot(&self) -> Config {
        self.inner.read().clone()
    }

    /// Copy of the current LLM settings
    pub fn llm(&self) -> LlmConfig {
        self.inner.read().llm.clone()
    }

    pub fn embedder(&self) -> EmbedderConfig {
        self.inner.read().embedder.clone()
    }

    /// Replace the LLM base URL and/or model; `None` and empty values leave the field as is
    pub fn update_llm(&self, base_url: Option<String>, model: Option<String>) {
        let mut config = self.inner.write();
        if let Some(base_url) = base_url.filter(|v| !v.is_empty()) {
            config.llm.base_url = base_url;
        }
        if let Some(model) = model.filter(|v| !v.is_empty()) {
            config.llm.model = model;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_of(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_env_override_and_defaults() {
        let yaml = "llm:\n  model: gpt-4o-mini\n";
        let config =
            Config::from_yaml_with_env(yaml, env_of(&[("LLM_BASE_URL", "http://x")])).unwrap();

        assert_eq!(config.llm.base_url, "http://x");
        assert_eq!(config.llm.model, "gpt-4o-mini");
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.bind_address(), "0.0.0.0:8080");
        assert_eq!(config.qdrant.port, 6333);
        assert_eq!(config.qdrant.collection_name, "senrag_collection");
        assert_eq!(config.upload.max_file_size, 50 * 1024 * 1024);
        assert_eq!(config.upload.save_path, "./uploads");
        assert_eq!(config.embedder.batch_size, 32);
        assert_eq!(config.embedder.dimensions, 1536);
    }

    #[test]
    fn test_empty_env_values_are_ignored() {
        let yaml = "llm:\n  base_url: http://file\nqdrant:\n  host: qdrant.local\n";
        let config = Config::from_yaml_with_env(
            yaml,
            env_of(&[("LLM_BASE_URL", ""), ("QDRANT_HOST", "")]),
        )
        .unwrap();

        assert_eq!(config.llm.base_url, "http://file");
        assert_eq!(config.qdrant.host, "qdrant.local");
    }

    #[test]
    fn test_explicit_values_survive_defaults() {
        let yaml = r#"
server:
  host: 0.0.0.0
  port: 9000
qdrant:
  port: 6334
  use_auth: true
  collection_name: docs
upload:
  allowed_extensions: [".txt", ".md"]
embedder:
  model: text-embedding-3-small
  batch_size: 8
"#;
        let config = Config::from_yaml_with_env(yaml, |_| None).unwrap();

        assert_eq!(config.bind_address(), "0.0.0.0:9000");
        assert_eq!(config.qdrant.port, 6334);
        assert!(config.qdrant.use_auth);
        assert_eq!(config.qdrant.collection_name, "docs");
        assert_eq!(config.embedder.batch_size, 8);
        assert_eq!(config.upload.allowed_extensions, vec![".txt", ".md"]);
    }

    #[test]
    fn test_empty_file_is_all_defaults() {
        let config = Config::from_yaml_with_env("", |_| None).unwrap();
        assert_eq!(config.server.port, DEFAULT_SERVER_PORT);
        assert_eq!(config.qdrant.host, DEFAULT_QDRANT_HOST);
    }

    #[tokio::test]
    async fn test_minimal_config_address_is_bindable() {
        let mut config =
            Config::from_yaml_with_env("llm:\n  model: gpt-4o-mini\n", |_| None).unwrap();
        // Keep the default host, let the OS pick the port
        config.server.port = 0;

        let listener = tokio::net::TcpListener::bind(config.bind_address()).await;
        assert!(listener.is_ok(), "failed to bind {}", config.bind_address());
    }

    #[test]
    fn test_example_config_uses_grpc_port() {
        let config =
            Config::from_yaml_with_env(include_str!("../config.example.yaml"), |_| None).unwrap();

        assert_eq!(config.qdrant.port, 6334);
        assert_ne!(config.qdrant.port, DEFAULT_QDRANT_PORT);
        assert_eq!(config.embedder.dimensions, DEFAULT_EMBEDDING_DIMENSIONS);
    }

    #[test]
    fn test_invalid_yaml() {
        let err = Config::from_yaml_with_env("server: [1, 2", |_| None).unwrap_err();
        assert!(matches!(err, RagError::Config(_)));
    }

    #[test]
    fn test_extension_allow_list() {
        let mut config = Config::default();
        assert!(config.is_extension_allowed(".exe"));

        config.upload.allowed_extensions = vec![".txt".into(), "md".into()];
        assert!(config.is_extension_allowed(".TXT"));
        assert!(config.is_extension_allowed("md"));
        assert!(!config.is_extension_allowed(".pdf"));
        assert!(!config.is_extension_allowed(""));
    }

    #[test]
    fn test_shared_config_update() {
        let shared = SharedConfig::new(Config::default());
        let other = shared.clone();

        other.update_llm(Some("http://new".into()), Some(String::new()));
        assert_eq!(shared.llm().base_url, "http://new");
        assert_eq!(shared.llm().model, "");

        other.update_llm(None, Some("llama3".into()));
        assert_eq!(shared.llm().base_url, "http://new");
        assert_eq!(shared.snapshot().llm.model, "llama3");
    }
}
