//! Application configuration.
//!
//! Configuration is loaded from a TOML file at:
//! 1. `$INCOMING_REGISTRY_CONFIG` (environment variable)
//! 2. `~/.config/incoming-registry/config.toml` (Linux/macOS)
//!    `%APPDATA%\incoming-registry\config.toml` (Windows)
//! 3. Built-in defaults
//!
//! Mailbox and summarizer secrets can also be supplied through the
//! environment, which takes precedence over the file.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RegistryError, Result};

/// Environment variable overriding the IMAP user name.
pub const ENV_IMAP_USER: &str = "INCOMING_REGISTRY_IMAP_USER";
/// Environment variable overriding the IMAP password.
pub const ENV_IMAP_PASSWORD: &str = "INCOMING_REGISTRY_IMAP_PASSWORD";
/// Environment variable overriding the summarizer API key.
pub const ENV_SUMMARIZER_KEY: &str = "INCOMING_REGISTRY_SUMMARIZER_KEY";

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// General behavior settings.
    pub general: GeneralConfig,
    /// Mailbox connection settings.
    pub mailbox: MailboxConfig,
    /// Summarization backend settings.
    pub summarizer: SummarizerConfig,
    /// Record defaults applied during ingestion.
    pub ingest: IngestConfig,
}

/// General behavior settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Override the data directory (database, attachments, logs).
    pub data_dir: Option<PathBuf>,
    /// Log level: "error", "warn", "info", "debug", "trace".
    pub log_level: String,
}

/// Mailbox connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// IMAP server host name.
    pub host: String,
    /// IMAPS port.
    pub port: u16,
    /// Folder polled for unread messages.
    pub folder: String,
    /// Login name.
    pub username: String,
    /// Login password (an app password for most hosted providers).
    pub password: String,
    /// Connect, read and write timeout for the server socket.
    pub timeout_secs: u64,
}

/// Summarization backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    /// When false, summaries are always the truncated body.
    pub enabled: bool,
    /// Base URL of an OpenAI-compatible API (`{endpoint}/chat/completions`).
    pub endpoint: String,
    /// Model name sent with every request.
    pub model: String,
    /// Bearer token, if the endpoint needs one.
    pub api_key: Option<String>,
    /// Hard upper bound on a single backend call.
    pub timeout_secs: u64,
    /// Body characters sent to the backend.
    pub max_input_chars: usize,
    /// Maximum summary length in characters.
    pub max_summary_chars: usize,
}

/// Record defaults applied during ingestion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// `responsible` value stored on ingested records.
    pub default_responsible: String,
    /// Days between the received date and the response deadline.
    pub deadline_days: i64,
    /// Mark messages read when they duplicate an existing record.
    pub mark_read_on_duplicate: bool,
    /// Seconds between runs for the `watch` command.
    pub interval_secs: u64,
}

// ── Default implementations ─────────────────────────────────────

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            log_level: "info".to_string(),
        }
    }
}

impl Default for MailboxConfig {
    fn default() -> Self {
        Self {
            host: "imap.gmail.com".to_string(),
            port: 993,
            folder: "INBOX".to_string(),
            username: String::new(),
            password: String::new(),
            timeout_secs: 30,
        }
    }
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: "http://localhost:11434/v1".to_string(),
            model: "llama3.2".to_string(),
            api_key: None,
            timeout_secs: 20,
            max_input_chars: 10_000,
            max_summary_chars: 200,
        }
    }
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_responsible: "Default Responsible".to_string(),
            deadline_days: 10,
            mark_read_on_duplicate: true,
            interval_secs: 300,
        }
    }
}

impl MailboxConfig {
    /// Check that enough is configured to open a session.
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(RegistryError::Config("mailbox.host must not be empty".into()));
        }
        if self.port == 0 {
            return Err(RegistryError::Config("mailbox.port must be non-zero".into()));
        }
        if self.timeout_secs == 0 {
            return Err(RegistryError::Config("mailbox.timeout_secs must be non-zero".into()));
        }
        if self.folder.trim().is_empty() {
            return Err(RegistryError::Config(
                "mailbox.folder must not be empty".into(),
            ));
        }
        if self.username.is_empty() || self.password.is_empty() {
            return Err(RegistryError::Config(format!(
                "mailbox credentials missing; set mailbox.username/password or {ENV_IMAP_USER}/{ENV_IMAP_PASSWORD}"
            )));
        }
        Ok(())
    }

    /// The socket timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl SummarizerConfig {
    /// The backend timeout as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Config {
    /// Apply environment overrides for secrets.
    pub fn apply_env(&mut self) {
        self.apply_env_from(|key| std::env::var(key).ok());
    }

    fn apply_env_from(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(user) = lookup(ENV_IMAP_USER).filter(|v| !v.is_empty()) {
            self.mailbox.username = user;
        }
        if let Some(pass) = lookup(ENV_IMAP_PASSWORD).filter(|v| !v.is_empty()) {
            self.mailbox.password = pass;
        }
        if let Some(key) = lookup(ENV_SUMMARIZER_KEY).filter(|v| !v.is_empty()) {
            self.summarizer.api_key = Some(key);
        }
    }
}

// ── Load / save ─────────────────────────────────────────────────

/// Load configuration, searching standard locations, then apply environment
/// overrides.
///
/// Falls back to the default configuration if no file is found or on parse error.
pub fn load_config() -> Config {
    let mut config = load_config_file();
    config.apply_env();
    config
}

fn load_config_file() -> Config {
    if let Some(path) = config_file_path() {
        if path.exists() {
            match std::fs::read_to_string(&path) {
                Ok(contents) => match toml::from_str::<Config>(&contents) {
                    Ok(cfg) => {
                        tracing::info!(path = %path.display(), "Loaded config");
                        return cfg;
                    }
                    Err(e) => {
                        tracing::warn!(
                            path = %path.display(),
                            error = %e,
                            "Failed to parse config, using defaults"
                        );
                    }
                },
                Err(e) => {
                    tracing::warn!(
                        path = %path.display(),
                        error = %e,
                        "Failed to read config file, using defaults"
                    );
                }
            }
        }
    }
    Config::default()
}

/// Save configuration to the standard location.
pub fn save_config(config: &Config) -> anyhow::Result<()> {
    let path = config_file_path()
        .ok_or_else(|| anyhow::anyhow!("Could not determine config file path"))?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let contents = toml::to_string_pretty(config)?;
    std::fs::write(&path, contents)?;
    tracing::info!(path = %path.display(), "Saved config");
    Ok(())
}

/// Determine the config file path (checking env var first, then standard dirs).
pub fn config_file_path() -> Option<PathBuf> {
    if let Ok(env_path) = std::env::var("INCOMING_REGISTRY_CONFIG") {
        return Some(PathBuf::from(env_path));
    }

    dirs::config_dir().map(|d| d.join("incoming-registry").join("config.toml"))
}

/// Return the data directory for the database, attachment blobs and logs.
pub fn data_dir(config: &Config) -> PathBuf {
    if let Some(ref dir) = config.general.data_dir {
        return dir.clone();
    }
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("incoming-registry")
}

/// Path of the SQLite database.
pub fn database_path(config: &Config) -> PathBuf {
    data_dir(config).join("registry.db")
}

/// Directory holding attachment blobs.
pub fn attachments_dir(config: &Config) -> PathBuf {
    data_dir(config).join("attachments")
}
