//! Configuration loader and validator for the automation service.
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("YAML parse error: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(&'static str),
}

/// Root configuration struct mirroring the YAML schema exactly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Config {
    pub app: App,
    pub scheduler: Scheduler,
    pub telegram: Telegram,
    pub digest: Digest,
    /// SMTP settings. When absent, email sends are logged and skipped.
    #[serde(default)]
    pub email: Option<Email>,
}

/// App-level settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct App {
    pub data_dir: String,
    pub bind_addr: String,
    pub batch_page_size: u32,
}

/// Shared secret the external cron invoker presents as a bearer token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Scheduler {
    pub secret: String,
}

/// Telegram bot settings. An empty token disables the chat channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Telegram {
    #[serde(default)]
    pub bot_token: String,
}

/// Daily digest targeting.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Digest {
    pub department: String,
}

/// SMTP transport settings for the email channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Email {
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    pub from: String,
}

fn default_smtp_port() -> u16 {
    587
}

impl Config {
    /// Ensure required directories exist (creates `app.data_dir` if missing).
    pub fn ensure_dirs(&self) -> Result<(), std::io::Error> {
        if self.app.data_dir.trim().is_empty() {
            return Ok(());
        }
        fs::create_dir_all(&self.app.data_dir)
    }

    /// Bot token with empty strings normalized away.
    pub fn bot_token(&self) -> Option<String> {
        let token = self.telegram.bot_token.trim();
        if token.is_empty() {
            None
        } else {
            Some(token.to_string())
        }
    }
}

/// Load configuration from a YAML file, apply environment overrides, validate.
/// - If `path` is None, uses `config.yaml` in the current working directory.
pub fn load(path: Option<&Path>) -> Result<Config, ConfigError> {
    let path = path.unwrap_or_else(|| Path::new("config.yaml"));
    let content = fs::read_to_string(path)?;
    let mut cfg: Config = serde_yaml::from_str(&content)?;
    apply_env_overrides(&mut cfg);
    validate(&cfg)?;
    Ok(cfg)
}

/// `CRON_SECRET` and `BOT_TOKEN` take precedence over the file so deployments
/// can keep secrets out of the config on disk.
fn apply_env_overrides(cfg: &mut Config) {
    if let Ok(secret) = std::env::var("CRON_SECRET") {
        if !secret.trim().is_empty() {
            cfg.scheduler.secret = secret;
        }
    }
    if let Ok(token) = std::env::var("BOT_TOKEN") {
        if !token.trim().is_empty() {
            cfg.telegram.bot_token = token;
        }
    }
}

/// Validate a configuration instance.
fn validate(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.app.data_dir.trim().is_empty() {
        return Err(ConfigError::Invalid("app.data_dir must be non-empty"));
    }
    if cfg.app.bind_addr.trim().is_empty() {
        return Err(ConfigError::Invalid("app.bind_addr must be non-empty"));
    }
    if cfg.app.batch_page_size == 0 {
        return Err(ConfigError::Invalid("app.batch_page_size must be > 0"));
    }

    if cfg.scheduler.secret.trim().is_empty() {
        return Err(ConfigError::Invalid("scheduler.secret must be non-empty"));
    }

    if cfg.digest.department.trim().is_empty() {
        return Err(ConfigError::Invalid("digest.department must be non-empty"));
    }

    if let Some(email) = &cfg.email {
        if email.smtp_host.trim().is_empty() {
            return Err(ConfigError::Invalid("email.smtp_host must be non-empty"));
        }
        if email.from.trim().is_empty() {
            return Err(ConfigError::Invalid("email.from must be non-empty"));
        }
    }

    Ok(())
}

/// Canonical example configuration document.
pub fn example() -> &'static str {
    r#"app:
  data_dir: "./data"
  bind_addr: "127.0.0.1:8787"
  batch_page_size: 50

scheduler:
  secret: "CHANGE_ME_SHARED_SECRET"

telegram:
  bot_token: ""

digest:
  department: "sales"

# Uncomment to enable real email delivery; without it, email sends are
# logged and reported as skipped.
# email:
#   smtp_host: "smtp.example.edu"
#   smtp_port: 587
#   username: "ops@example.edu"
#   password: "app-password"
#   from: "Campus Ops <ops@example.edu>"
"#
}
