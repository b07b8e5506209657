//! toolgate configuration loader.
//!
//! TOML on disk, then environment overrides, then validation.

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Deserialize)]
pub struct ToolgateConfig {
    pub general: GeneralConfig,
    #[serde(default)]
    pub keys: KeysConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GeneralConfig {
    pub model: String,
    #[serde(default)]
    pub system_prompt: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct KeysConfig {
    pub openai_api_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    #[serde(default = "default_llm_request_timeout_seconds")]
    pub request_timeout_seconds: u64,
}

fn default_llm_base_url() -> String {
    gate_llm::DEFAULT_BASE_URL.to_string()
}

fn default_llm_request_timeout_seconds() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            request_timeout_seconds: default_llm_request_timeout_seconds(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    /// Model invocations allowed per turn.
    #[serde(default = "default_agent_max_steps")]
    pub max_steps: usize,
    /// Upper bound on the length of an error written into a tool output.
    #[serde(default = "default_agent_max_error_chars")]
    pub max_error_chars: usize,
    #[serde(default = "default_agent_event_buffer")]
    pub event_buffer: usize,
}

fn default_agent_max_steps() -> usize {
    10
}

fn default_agent_max_error_chars() -> usize {
    500
}

fn default_agent_event_buffer() -> usize {
    256
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_steps: default_agent_max_steps(),
            max_error_chars: default_agent_max_error_chars(),
            event_buffer: default_agent_event_buffer(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    #[serde(default = "default_store_backend")]
    pub backend: StoreBackend,
    /// SQLite database file. Defaults to `~/.toolgate/data/conversations.db`.
    #[serde(default)]
    pub path: Option<PathBuf>,
}

fn default_store_backend() -> StoreBackend {
    StoreBackend::Sqlite
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: default_store_backend(),
            path: None,
        }
    }
}

impl StoreConfig {
    pub fn sqlite_path(&self) -> PathBuf {
        self.path
            .clone()
            .unwrap_or_else(|| default_data_dir().join("conversations.db"))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_runtime_bind_addr")]
    pub bind_addr: String,
    #[serde(default = "default_runtime_http_timeout_seconds")]
    pub http_timeout_seconds: u64,
    #[serde(default = "default_runtime_http_max_in_flight")]
    pub http_max_in_flight: usize,
}

fn default_runtime_bind_addr() -> String {
    "127.0.0.1:3100".to_string()
}

fn default_runtime_http_timeout_seconds() -> u64 {
    300
}

fn default_runtime_http_max_in_flight() -> usize {
    128
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            bind_addr: default_runtime_bind_addr(),
            http_timeout_seconds: default_runtime_http_timeout_seconds(),
            http_max_in_flight: default_runtime_http_max_in_flight(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_true")]
    pub calendar: bool,
    #[serde(default = "default_true")]
    pub clock: bool,
}

fn default_true() -> bool {
    true
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            calendar: true,
            clock: true,
        }
    }
}

impl ToolgateConfig {
    pub async fn load(path: Option<PathBuf>) -> anyhow::Result<Self> {
        let path = path.unwrap_or_else(default_config_path);
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| anyhow::anyhow!("read config {}: {e}", path.display()))?;

        let mut cfg = Self::from_toml(&contents)
            .map_err(|e| anyhow::anyhow!("parse config {}: {e}", path.display()))?;

        cfg.apply_env_overrides();
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_toml(contents: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(contents)
    }

    fn apply_env_overrides(&mut self) {
        if let Some(v) = non_empty_env("TOOLGATE_MODEL") {
            self.general.model = v;
        }
        if let Some(v) = non_empty_env("OPENAI_API_KEY") {
            self.keys.openai_api_key = Some(v);
        }
        if let Some(v) = non_empty_env("OPENAI_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = non_empty_env("TOOLGATE_BIND_ADDR") {
            self.runtime.bind_addr = v;
        }
        if let Some(v) = non_empty_env("TOOLGATE_STORE_PATH") {
            self.store.path = Some(PathBuf::from(v));
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.general.model.trim().is_empty() {
            return Err(anyhow::anyhow!("general.model is required"));
        }
        if !self.llm.base_url.starts_with("http://") && !self.llm.base_url.starts_with("https://") {
            return Err(anyhow::anyhow!(
                "llm.base_url must be an http(s) URL, got {:?}",
                self.llm.base_url
            ));
        }
        if self.llm.request_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("llm.request_timeout_seconds must be > 0"));
        }
        if self.agent.max_steps == 0 {
            return Err(anyhow::anyhow!("agent.max_steps must be > 0"));
        }
        if self.agent.max_error_chars < 16 {
            return Err(anyhow::anyhow!("agent.max_error_chars must be >= 16"));
        }
        if self.agent.event_buffer == 0 {
            return Err(anyhow::anyhow!("agent.event_buffer must be > 0"));
        }
        self.bind_addr()?;
        if self.runtime.http_timeout_seconds == 0 {
            return Err(anyhow::anyhow!("runtime.http_timeout_seconds must be > 0"));
        }
        if self.runtime.http_max_in_flight == 0 {
            return Err(anyhow::anyhow!("runtime.http_max_in_flight must be > 0"));
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> anyhow::Result<SocketAddr> {
        self.runtime.bind_addr.parse().map_err(|e| {
            anyhow::anyhow!(
                "runtime.bind_addr {:?} is not a socket address: {e}",
                self.runtime.bind_addr
            )
        })
    }

    pub fn api_key(&self) -> Option<String> {
        self.keys.openai_api_key.clone().filter(|s| !s.is_empty())
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

pub fn default_config_path() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".toolgate").join("config.toml")
}

pub fn default_data_dir() -> PathBuf {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    Path::new(&home).join(".toolgate").join("data")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg = ToolgateConfig::from_toml(
            r#"
[general]
model = "gpt-4o-mini"
"#,
        )
        .expect("parse");
        cfg.validate().expect("valid");
        assert_eq!(cfg.agent.max_steps, 10);
        assert_eq!(cfg.agent.max_error_chars, 500);
        assert_eq!(cfg.store.backend, StoreBackend::Sqlite);
        assert_eq!(cfg.llm.base_url, gate_llm::DEFAULT_BASE_URL);
        assert!(cfg.tools.calendar && cfg.tools.clock);
        assert_eq!(cfg.bind_addr().expect("addr").port(), 3100);
    }

    #[test]
    fn shipped_template_parses_and_validates() {
        let cfg = ToolgateConfig::from_toml(include_str!("../../config-templates/config.toml"))
            .expect("template parses");
        cfg.validate().expect("template is valid");
    }

    #[test]
    fn validation_rejects_bad_values() {
        let parse = |extra: &str| {
            ToolgateConfig::from_toml(&format!("[general]\nmodel = \"m\"\n{extra}"))
                .expect("parse")
        };
        assert!(parse("[agent]\nmax_steps = 0").validate().is_err());
        assert!(parse("[runtime]\nbind_addr = \"nowhere\"").validate().is_err());
        assert!(parse("[llm]\nbase_url = \"ftp://x\"").validate().is_err());
        assert!(parse("[store]\nbackend = \"memory\"").validate().is_ok());
        assert!(
            ToolgateConfig::from_toml("[general]\nmodel = \"m\"\n[store]\nbackend = \"redis\"")
                .is_err()
        );
    }
}
