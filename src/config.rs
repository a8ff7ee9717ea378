//! Configuration for the orchestrator.
//!
//! Settings are layered: a `conductor.toml` file supplies the base values
//! and `CONDUCTOR_*` environment variables override individual fields. All
//! sections have working defaults, so an empty file (or none at all) yields
//! an embedded SQLite store with strict budgets disabled.
//!
//! # Configuration File Format
//!
//! ```toml
//! [database]
//! backend = "sqlite"
//! path = "conductor.db"
//! # backend = "remote"
//! # url = "libsql://conductor.example.turso.io"
//! # auth_token = "..."
//!
//! [budget]
//! mode = "strict"
//! max_protocol_tokens = 2000000
//! max_step_tokens = 400000
//!
//! [dispatch]
//! queue_url = "redis://localhost:6379/0"
//! max_inline_trigger_depth = 3
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::budget::BudgetMode;

/// Which storage backend to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseBackend {
    /// Embedded SQLite file (or `:memory:`).
    #[default]
    Sqlite,
    /// Remote sqld/Turso database over libsql.
    Remote,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default)]
    pub backend: DatabaseBackend,
    /// SQLite file path. Ignored for the remote backend.
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
    /// Remote database URL. Required for the remote backend.
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("conductor.db")
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            backend: DatabaseBackend::Sqlite,
            path: default_db_path(),
            url: None,
            auth_token: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BudgetConfig {
    #[serde(default)]
    pub mode: BudgetMode,
    /// Token ceiling per protocol run. `None` disables the protocol check.
    #[serde(default)]
    pub max_protocol_tokens: Option<u64>,
    /// Token ceiling per step run. `None` disables the step check.
    #[serde(default)]
    pub max_step_tokens: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Job queue endpoint. When unset, triggered steps run inline.
    #[serde(default)]
    pub queue_url: Option<String>,
    /// How many inline trigger hops a chain may take before it is refused.
    #[serde(default = "default_max_inline_trigger_depth")]
    pub max_inline_trigger_depth: u32,
}

fn default_max_inline_trigger_depth() -> u32 {
    3
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_url: None,
            max_inline_trigger_depth: default_max_inline_trigger_depth(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SpecConfig {
    /// Fallback root for resolving spec-relative paths when a protocol has
    /// no workspace of its own.
    #[serde(default)]
    pub workspace_root: Option<PathBuf>,
}

/// Top-level orchestrator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrchestratorConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub budget: BudgetConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub specs: SpecConfig,
}

impl OrchestratorConfig {
    /// Load configuration from a TOML file, then apply environment
    /// overrides. A missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                toml::from_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            _ => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    /// Apply `CONDUCTOR_*` overrides from the given lookup. Split out from
    /// [`Self::load`] so tests do not have to mutate the process
    /// environment.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(url) = lookup("CONDUCTOR_DATABASE_URL") {
            self.database.backend = DatabaseBackend::Remote;
            self.database.url = Some(url);
        }
        if let Some(token) = lookup("CONDUCTOR_DATABASE_AUTH_TOKEN") {
            self.database.auth_token = Some(token);
        }
        if let Some(path) = lookup("CONDUCTOR_DATABASE_PATH") {
            self.database.path = PathBuf::from(path);
        }
        if let Some(url) = lookup("CONDUCTOR_QUEUE_URL") {
            self.dispatch.queue_url = Some(url);
        }
        if let Some(mode) = lookup("CONDUCTOR_BUDGET_MODE") {
            self.budget.mode = mode
                .parse()
                .with_context(|| format!("invalid CONDUCTOR_BUDGET_MODE: {mode}"))?;
        }
        if let Some(raw) = lookup("CONDUCTOR_MAX_PROTOCOL_TOKENS") {
            self.budget.max_protocol_tokens = Some(parse_env_u64("CONDUCTOR_MAX_PROTOCOL_TOKENS", &raw)?);
        }
        if let Some(raw) = lookup("CONDUCTOR_MAX_STEP_TOKENS") {
            self.budget.max_step_tokens = Some(parse_env_u64("CONDUCTOR_MAX_STEP_TOKENS", &raw)?);
        }
        if let Some(raw) = lookup("CONDUCTOR_MAX_INLINE_TRIGGER_DEPTH") {
            self.dispatch.max_inline_trigger_depth =
                parse_env_u64("CONDUCTOR_MAX_INLINE_TRIGGER_DEPTH", &raw)? as u32;
        }
        if let Some(root) = lookup("CONDUCTOR_WORKSPACE_ROOT") {
            self.specs.workspace_root = Some(PathBuf::from(root));
        }
        Ok(())
    }
}

fn parse_env_u64(name: &str, raw: &str) -> Result<u64> {
    raw.trim()
        .parse()
        .with_context(|| format!("invalid {name}: {raw}"))
}
