//! Configuration file management for the coordination server.
//!
//! Provides a TOML-based config file at `~/.config/mcs/config.toml` and a
//! resolution chain: env var > config file > default, per spec §9.

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use mcs_core::Config as OrchestrationConfig;
use mcs_db::config::DbConfig;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize, Default)]
pub struct ConfigFile {
    #[serde(default)]
    pub database: Option<DatabaseSection>,
    #[serde(default)]
    pub auth: Option<AuthSection>,
    #[serde(default)]
    pub llm: Option<LlmSection>,
    #[serde(default)]
    pub server: Option<ServerSection>,
    #[serde(default)]
    pub scheduling: Option<SchedulingSection>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DatabaseSection {
    pub url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AuthSection {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LlmSection {
    pub api_base: String,
    pub api_key: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default)]
    pub bind: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SchedulingSection {
    #[serde(default)]
    pub claim_ttl_secs: Option<u64>,
    #[serde(default)]
    pub lock_ttl_secs: Option<u64>,
    #[serde(default)]
    pub max_retries: Option<i32>,
    #[serde(default)]
    pub max_rework_cycles: Option<i32>,
    #[serde(default)]
    pub audit_confidence_threshold: Option<f32>,
    #[serde(default)]
    pub roles: Option<Vec<String>>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the server's config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/mcs` or `~/.config/mcs`. We
/// intentionally ignore the platform-specific `dirs::config_dir()` (which
/// returns `~/Library/Application Support` on macOS).
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("mcs");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("mcs")
}

/// Return the path to the server's config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

/// Load and parse the config file. Returns an error if it does not exist.
pub fn load_config() -> Result<ConfigFile> {
    let path = config_path();
    let contents = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents).context("failed to parse config file")?;
    Ok(config)
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Fully resolved server configuration, ready for use.
#[derive(Debug)]
pub struct ServerConfig {
    pub db_config: DbConfig,
    pub orchestration: OrchestrationConfig,
    pub llm: ResolvedLlm,
    pub bind: String,
    pub port: u16,
}

#[derive(Debug, Clone)]
pub struct ResolvedLlm {
    pub api_base: String,
    pub api_key: String,
}

impl ServerConfig {
    /// Resolve configuration using the chain: env var > config file > default.
    ///
    /// - DB URL: `MCS_DATABASE_URL` env > `config_file.database.url` > `DbConfig::DEFAULT_URL`
    /// - Auth token: `MCS_AUTH_TOKEN` env > `config_file.auth.token` > error
    /// - LLM endpoint: `MCS_LLM_API_BASE`/`MCS_LLM_API_KEY` env > `config_file.llm` > error
    pub fn resolve() -> Result<Self> {
        let file_config = load_config().ok();

        let db_url = if let Ok(url) = std::env::var("MCS_DATABASE_URL") {
            url
        } else if let Some(db) = file_config.as_ref().and_then(|c| c.database.as_ref()) {
            db.url.clone()
        } else {
            DbConfig::DEFAULT_URL.to_string()
        };
        let db_config = DbConfig::new(db_url);

        let auth_token = if let Ok(token) = std::env::var("MCS_AUTH_TOKEN") {
            token
        } else if let Some(auth) = file_config.as_ref().and_then(|c| c.auth.as_ref()) {
            auth.token.clone()
        } else {
            bail!("auth token not found; set MCS_AUTH_TOKEN or add an [auth] section to the config file");
        };

        let (api_base, api_key) = if let (Ok(base), Ok(key)) =
            (std::env::var("MCS_LLM_API_BASE"), std::env::var("MCS_LLM_API_KEY"))
        {
            (base, key)
        } else if let Some(llm) = file_config.as_ref().and_then(|c| c.llm.as_ref()) {
            (llm.api_base.clone(), llm.api_key.clone())
        } else {
            bail!(
                "LLM endpoint not found; set MCS_LLM_API_BASE/MCS_LLM_API_KEY or add an [llm] section to the config file"
            );
        };

        let mut orchestration = OrchestrationConfig {
            auth_token,
            ..OrchestrationConfig::default()
        };

        if let Some(llm) = file_config.as_ref().and_then(|c| c.llm.as_ref()) {
            if let Some(model) = &llm.model {
                orchestration.llm_model = model.clone();
            }
            if let Some(max_tokens) = llm.max_tokens {
                orchestration.llm_max_tokens = max_tokens;
            }
            if let Some(max_attempts) = llm.max_attempts {
                orchestration.llm_max_attempts = max_attempts;
            }
        }
        if let Ok(model) = std::env::var("MCS_LLM_MODEL") {
            orchestration.llm_model = model;
        }

        if let Some(scheduling) = file_config.as_ref().and_then(|c| c.scheduling.as_ref()) {
            if let Some(secs) = scheduling.claim_ttl_secs {
                orchestration.claim_ttl = std::time::Duration::from_secs(secs);
            }
            if let Some(secs) = scheduling.lock_ttl_secs {
                orchestration.lock_ttl = std::time::Duration::from_secs(secs);
            }
            if let Some(max_retries) = scheduling.max_retries {
                orchestration.max_retries = max_retries;
            }
            if let Some(max_rework_cycles) = scheduling.max_rework_cycles {
                orchestration.max_rework_cycles = max_rework_cycles;
            }
            if let Some(threshold) = scheduling.audit_confidence_threshold {
                orchestration.audit_confidence_threshold = threshold;
            }
            if let Some(roles) = &scheduling.roles {
                orchestration.roles = roles.clone();
            }
        }

        let bind = std::env::var("MCS_BIND").ok().unwrap_or_else(|| {
            file_config
                .as_ref()
                .and_then(|c| c.server.as_ref())
                .and_then(|s| s.bind.clone())
                .unwrap_or_else(|| "127.0.0.1".to_string())
        });
        let port = std::env::var("MCS_PORT")
            .ok()
            .and_then(|p| p.parse().ok())
            .or_else(|| file_config.as_ref().and_then(|c| c.server.as_ref()).and_then(|s| s.port))
            .unwrap_or(8080);

        Ok(Self {
            db_config,
            orchestration,
            llm: ResolvedLlm { api_base, api_key },
            bind,
            port,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
