//! Configuration management for dustlink.
//!
//! Configuration is layered:
//!
//! 1. Built-in defaults
//! 2. An optional TOML file (`~/.config/dustlink/config.toml`, or the path in
//!    `DUSTLINK_CONFIG`)
//! 3. Environment variables (`DUST_*`, `MCP_*`), which always win
//!
//! The Dust API key is never read from or written to the TOML file. It comes
//! from `DUST_API_KEY` or from the OS keychain (see `dustlink-storage`).
//!
//! # Example
//!
//! ```ignore
//! use dustlink_core::Config;
//!
//! let config = Config::load()?;
//! config.validate()?;
//! println!("tool: {}", config.tool_name());
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{Error, Result};

/// Config file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Config directory name.
const CONFIG_DIR_NAME: &str = "dustlink";

/// Environment variable overriding the config file location.
pub const CONFIG_PATH_ENV: &str = "DUSTLINK_CONFIG";

/// Value shipped in sample `.env` files; treated as "no key".
pub const API_KEY_PLACEHOLDER: &str = "store SECRETS in .env file";

/// Tool reporting the active conversation.
pub const STATUS_TOOL_NAME: &str = "dust_conversation_status";

/// Tool forgetting the active conversation.
pub const RESET_TOOL_NAME: &str = "dust_reset_conversation";

// =============================================================================
// Configuration structures
// =============================================================================

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// MCP server settings
    #[serde(default)]
    pub mcp: McpSettings,

    /// Dust workspace and agent settings
    #[serde(default)]
    pub dust: DustSettings,

    /// Polling and retry tuning
    #[serde(default)]
    pub polling: PollSettings,
}

/// MCP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct McpSettings {
    /// Server name reported in `initialize`
    #[serde(default = "default_mcp_name")]
    pub name: String,
    /// Deadline for a single tool call, in seconds
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Name of the query tool; derived from the agent name when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

/// Dust workspace and agent settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DustSettings {
    #[serde(skip)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub workspace_id: String,
    #[serde(default)]
    pub agent_id: String,
    #[serde(default = "default_domain")]
    pub domain: String,
    #[serde(default)]
    pub workspace_name: String,
    #[serde(default = "default_agent_name")]
    pub agent_name: String,
    #[serde(default = "default_timezone")]
    pub timezone: String,
    #[serde(default = "default_username")]
    pub username: String,
    #[serde(default = "default_fullname")]
    pub fullname: String,
    #[serde(default = "default_model_provider")]
    pub model_provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Per-request HTTP timeout, in seconds
    #[serde(default = "default_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Polling and retry tuning.
///
/// The delay before poll attempt `n` is
/// `min(initial_delay_ms * backoff_factor^n, max_delay_ms)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    /// Retries of a single request on transient failures
    #[serde(default = "default_http_retries")]
    pub http_retries: u32,
}

fn default_mcp_name() -> String {
    "Dust MCP Server".to_string()
}

fn default_timeout_secs() -> u64 {
    30
}

fn default_domain() -> String {
    "https://dust.tt".to_string()
}

fn default_agent_name() -> String {
    "SystemsThinking".to_string()
}

fn default_timezone() -> String {
    "Europe/Berlin".to_string()
}

fn default_username() -> String {
    "systems_analyst".to_string()
}

fn default_fullname() -> String {
    "AI Research Team".to_string()
}

fn default_model_provider() -> String {
    "anthropic".to_string()
}

fn default_max_attempts() -> u32 {
    30
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_backoff_factor() -> f64 {
    1.5
}

fn default_http_retries() -> u32 {
    2
}

impl Default for McpSettings {
    fn default() -> Self {
        Self {
            name: default_mcp_name(),
            timeout_secs: default_timeout_secs(),
            tool_name: None,
        }
    }
}

impl Default for DustSettings {
    fn default() -> Self {
        Self {
            api_key: None,
            workspace_id: String::new(),
            agent_id: String::new(),
            domain: default_domain(),
            workspace_name: String::new(),
            agent_name: default_agent_name(),
            timezone: default_timezone(),
            username: default_username(),
            fullname: default_fullname(),
            model_provider: default_model_provider(),
            model: None,
            request_timeout_secs: default_timeout_secs(),
        }
    }
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            backoff_factor: default_backoff_factor(),
            http_retries: default_http_retries(),
        }
    }
}

impl PollSettings {
    /// Total sleep time of one polling step that runs out of attempts.
    pub fn worst_case_wait(&self) -> Duration {
        let factor = self.backoff_factor.max(1.0);
        let total_ms: u64 = (0..self.max_attempts.saturating_sub(1))
            .map(|attempt| {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let millis = self.initial_delay_ms as f64 * factor.powi(exponent);
                millis.min(self.max_delay_ms as f64) as u64
            })
            .fold(0, u64::saturating_add);
        Duration::from_millis(total_ms)
    }
}

impl DustSettings {
    /// The API key, unless it is absent, blank or the sample placeholder.
    pub fn usable_api_key(&self) -> Option<&str> {
        self.api_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty() && *k != API_KEY_PLACEHOLDER)
    }
}

// =============================================================================
// Config implementation
// =============================================================================

impl Config {
    /// Get the configuration directory path.
    pub fn config_dir() -> Result<PathBuf> {
        dirs::config_dir()
            .map(|p| p.join(CONFIG_DIR_NAME))
            .ok_or_else(|| Error::Config("Could not determine config directory".to_string()))
    }

    /// Get the configuration file path, honoring `DUSTLINK_CONFIG`.
    pub fn config_path() -> Result<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_PATH_ENV) {
            return Ok(PathBuf::from(path));
        }
        Ok(Self::config_dir()?.join(CONFIG_FILE_NAME))
    }

    /// Load the file layer from the default location, then apply the
    /// process environment on top.
    pub fn load() -> Result<Self> {
        let path = Self::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Build a configuration from defaults and an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        config.apply_env(lookup)?;
        Ok(config)
    }

    /// Load the file layer from a specific path.
    ///
    /// Returns a default config if the file doesn't exist.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = ?path, "Config file does not exist, using defaults");
            return Ok(Self::default());
        }

        debug!(path = ?path, "Loading config");

        let contents = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config file: {}", e)))?;

        info!(path = ?path, "Config loaded successfully");
        Ok(config)
    }

    /// Save the file layer to a specific path. The API key is not written.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::Config(format!("Failed to create config directory: {}", e)))?;
        }

        debug!(path = ?path, "Saving config");

        let contents = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, contents)
            .map_err(|e| Error::Config(format!("Failed to write config file: {}", e)))?;

        info!(path = ?path, "Config saved successfully");
        Ok(())
    }

    /// Overlay environment variables. Unset variables keep their current value.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(v) = var("MCP_NAME") {
            self.mcp.name = v;
        }
        if let Some(v) = var("MCP_TIMEOUT") {
            self.mcp.timeout_secs = parse_value("MCP_TIMEOUT", &v)?;
        }
        if let Some(v) = var("MCP_TOOL_NAME") {
            self.mcp.tool_name = Some(v);
        }

        if let Some(v) = var("DUST_API_KEY") {
            self.dust.api_key = Some(v);
        }
        if let Some(v) = var("DUST_WORKSPACE_ID") {
            self.dust.workspace_id = v;
        }
        if let Some(v) = var("DUST_AGENT_ID") {
            self.dust.agent_id = v;
        }
        if let Some(v) = var("DUST_DOMAIN") {
            self.dust.domain = v;
        }
        if let Some(v) = var("DUST_WORKSPACE_NAME") {
            self.dust.workspace_name = v;
        }
        if let Some(v) = var("DUST_AGENT_NAME") {
            self.dust.agent_name = v;
        }
        if let Some(v) = var("DUST_TIMEZONE") {
            self.dust.timezone = v;
        }
        if let Some(v) = var("DUST_USERNAME") {
            self.dust.username = v;
        }
        if let Some(v) = var("DUST_FULLNAME") {
            self.dust.fullname = v;
        }
        if let Some(v) = var("DUST_MODEL_PROVIDER") {
            self.dust.model_provider = v;
        }
        if let Some(v) = var("DUST_MODEL") {
            self.dust.model = Some(v);
        }
        if let Some(v) = var("DUST_REQUEST_TIMEOUT") {
            self.dust.request_timeout_secs = parse_value("DUST_REQUEST_TIMEOUT", &v)?;
        }

        if let Some(v) = var("DUST_POLL_MAX_ATTEMPTS") {
            self.polling.max_attempts = parse_value("DUST_POLL_MAX_ATTEMPTS", &v)?;
        }
        if let Some(v) = var("DUST_POLL_INITIAL_DELAY_MS") {
            self.polling.initial_delay_ms = parse_value("DUST_POLL_INITIAL_DELAY_MS", &v)?;
        }
        if let Some(v) = var("DUST_POLL_MAX_DELAY_MS") {
            self.polling.max_delay_ms = parse_value("DUST_POLL_MAX_DELAY_MS", &v)?;
        }
        if let Some(v) = var("DUST_POLL_BACKOFF") {
            self.polling.backoff_factor = parse_value("DUST_POLL_BACKOFF", &v)?;
        }
        if let Some(v) = var("DUST_HTTP_RETRIES") {
            self.polling.http_retries = parse_value("DUST_HTTP_RETRIES", &v)?;
        }

        self.dust.domain = self.dust.domain.trim_end_matches('/').to_string();
        Ok(())
    }

    /// Check that everything needed to talk to Dust is present.
    ///
    /// Reports the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.dust.usable_api_key().is_none() {
            return Err(Error::Config(
                "Missing DUST_API_KEY environment variable".to_string(),
            ));
        }
        if self.dust.workspace_id.trim().is_empty() {
            return Err(Error::Config(
                "Missing DUST_WORKSPACE_ID environment variable".to_string(),
            ));
        }
        if self.dust.agent_id.trim().is_empty() {
            return Err(Error::Config(
                "Missing DUST_AGENT_ID environment variable".to_string(),
            ));
        }
        if !(self.dust.domain.starts_with("https://") || self.dust.domain.starts_with("http://"))
        {
            return Err(Error::Config(format!(
                "DUST_DOMAIN must start with http:// or https://, got '{}'",
                self.dust.domain
            )));
        }
        if self.mcp.timeout_secs == 0 || self.dust.request_timeout_secs == 0 {
            return Err(Error::Config("Timeouts must be greater than zero".to_string()));
        }
        if self.polling.max_attempts == 0 {
            return Err(Error::Config(
                "DUST_POLL_MAX_ATTEMPTS must be greater than zero".to_string(),
            ));
        }
        let tool_name = self.tool_name();
        if tool_name == STATUS_TOOL_NAME || tool_name == RESET_TOOL_NAME {
            return Err(Error::Config(format!(
                "Tool name '{}' is reserved; set MCP_TOOL_NAME to another name",
                tool_name
            )));
        }
        if self.polling.backoff_factor < 1.0 {
            return Err(Error::Config(
                "DUST_POLL_BACKOFF must be at least 1.0".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a polling step can outlast `MCP_TIMEOUT`, in which case the
    /// tool call times out before polling reports exhaustion.
    pub fn poll_outlasts_timeout(&self) -> bool {
        self.polling.worst_case_wait() >= Duration::from_secs(self.mcp.timeout_secs)
    }

    /// Name under which the query tool is published.
    ///
    /// Defaults to `dust_` followed by the snake-cased agent name, so agent
    /// `SystemsThinking` yields `dust_systems_thinking`.
    pub fn tool_name(&self) -> String {
        if let Some(name) = self.mcp.tool_name.as_deref().filter(|n| !n.is_empty()) {
            return name.to_string();
        }
        let agent = snake_case(&self.dust.agent_name);
        if agent.is_empty() {
            "dust_agent".to_string()
        } else {
            format!("dust_{}", agent)
        }
    }

    /// Copy suitable for printing: the API key is masked.
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();
        copy.dust.api_key = copy.dust.usable_api_key().map(mask_secret);
        copy
    }

    /// Set a file-layer value by key path (`section.field`).
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let (section, field) = split_key(key)?;

        match (section, field) {
            ("mcp", "name") => self.mcp.name = value.to_string(),
            ("mcp", "timeout" | "timeout_secs") => {
                self.mcp.timeout_secs = parse_value(key, value)?
            }
            ("mcp", "tool_name") => self.mcp.tool_name = Some(value.to_string()),
            ("dust", "api_key") => {
                return Err(Error::Config(
                    "The API key is not stored in the config file; use `dustlink auth set-key`"
                        .to_string(),
                ))
            }
            ("dust", "workspace_id" | "workspace") => self.dust.workspace_id = value.to_string(),
            ("dust", "agent_id" | "agent") => self.dust.agent_id = value.to_string(),
            ("dust", "domain" | "url") => {
                self.dust.domain = value.trim_end_matches('/').to_string()
            }
            ("dust", "workspace_name") => self.dust.workspace_name = value.to_string(),
            ("dust", "agent_name") => self.dust.agent_name = value.to_string(),
            ("dust", "timezone") => self.dust.timezone = value.to_string(),
            ("dust", "username") => self.dust.username = value.to_string(),
            ("dust", "fullname") => self.dust.fullname = value.to_string(),
            ("dust", "model_provider") => self.dust.model_provider = value.to_string(),
            ("dust", "model") => self.dust.model = Some(value.to_string()),
            ("dust", "request_timeout" | "request_timeout_secs") => {
                self.dust.request_timeout_secs = parse_value(key, value)?
            }
            ("polling", "max_attempts") => self.polling.max_attempts = parse_value(key, value)?,
            ("polling", "initial_delay_ms") => {
                self.polling.initial_delay_ms = parse_value(key, value)?
            }
            ("polling", "max_delay_ms") => self.polling.max_delay_ms = parse_value(key, value)?,
            ("polling", "backoff_factor" | "backoff") => {
                self.polling.backoff_factor = parse_value(key, value)?
            }
            ("polling", "http_retries") => self.polling.http_retries = parse_value(key, value)?,
            ("mcp" | "dust" | "polling", _) => {
                return Err(Error::Config(format!(
                    "Unknown {} config field: {}",
                    section, field
                )))
            }
            _ => return Err(Error::Config(format!("Unknown config section: {}", section))),
        }

        Ok(())
    }

    /// Get a value by key path (`section.field`).
    pub fn get(&self, key: &str) -> Result<Option<String>> {
        let (section, field) = split_key(key)?;

        let value = match (section, field) {
            ("mcp", "name") => Some(self.mcp.name.clone()),
            ("mcp", "timeout" | "timeout_secs") => Some(self.mcp.timeout_secs.to_string()),
            ("mcp", "tool_name") => Some(self.tool_name()),
            ("dust", "api_key") => self.dust.usable_api_key().map(mask_secret),
            ("dust", "workspace_id" | "workspace") => non_empty(&self.dust.workspace_id),
            ("dust", "agent_id" | "agent") => non_empty(&self.dust.agent_id),
            ("dust", "domain" | "url") => Some(self.dust.domain.clone()),
            ("dust", "workspace_name") => non_empty(&self.dust.workspace_name),
            ("dust", "agent_name") => Some(self.dust.agent_name.clone()),
            ("dust", "timezone") => Some(self.dust.timezone.clone()),
            ("dust", "username") => Some(self.dust.username.clone()),
            ("dust", "fullname") => Some(self.dust.fullname.clone()),
            ("dust", "model_provider") => Some(self.dust.model_provider.clone()),
            ("dust", "model") => self.dust.model.clone(),
            ("dust", "request_timeout" | "request_timeout_secs") => {
                Some(self.dust.request_timeout_secs.to_string())
            }
            ("polling", "max_attempts") => Some(self.polling.max_attempts.to_string()),
            ("polling", "initial_delay_ms") => Some(self.polling.initial_delay_ms.to_string()),
            ("polling", "max_delay_ms") => Some(self.polling.max_delay_ms.to_string()),
            ("polling", "backoff_factor" | "backoff") => {
                Some(self.polling.backoff_factor.to_string())
            }
            ("polling", "http_retries") => Some(self.polling.http_retries.to_string()),
            ("mcp" | "dust" | "polling", _) => {
                return Err(Error::Config(format!(
                    "Unknown {} config field: {}",
                    section, field
                )))
            }
            _ => return Err(Error::Config(format!("Unknown config section: {}", section))),
        };

        Ok(value)
    }
}

fn split_key(key: &str) -> Result<(&str, &str)> {
    let parts: Vec<&str> = key.split('.').collect();
    if parts.len() != 2 {
        return Err(Error::Config(format!(
            "Invalid config key '{}'. Expected format: section.field",
            key
        )));
    }
    Ok((parts[0], parts[1]))
}

fn parse_value<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("Invalid value for {}: '{}'", key, value)))
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

fn mask_secret(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    format!("{}********", visible)
}

/// `SystemsThinking` -> `systems_thinking`, `Deep Dive!` -> `deep_dive`.
fn snake_case(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;

    for c in name.chars() {
        if c.is_ascii_alphanumeric() {
            if c.is_ascii_uppercase() && prev_lower {
                out.push('_');
            }
            out.push(c.to_ascii_lowercase());
            prev_lower = c.is_ascii_lowercase() || c.is_ascii_digit();
        } else {
            if !out.ends_with('_') {
                out.push('_');
            }
            prev_lower = false;
        }
    }

    out.trim_matches('_').to_string()
}

// =============================================================================
// Tests
// =============================================================================
