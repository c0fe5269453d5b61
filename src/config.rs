//! Application configuration
//!
//! Layers, lowest priority first: embedded `config/default.toml`, optional
//! `config/local.*`, the `--config` file, then `CADENCE_*` environment
//! variables (`__` separates nested keys).

use anyhow::{bail, Context, Result};
use cadence_core::SchedulerConfig;
use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Embedded default configuration (compiled into binary)
pub const DEFAULT_CONFIG: &str = include_str!("../config/default.toml");

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub triggers: Vec<TriggerSpec>,
    #[serde(default)]
    pub jobs: Vec<JobSpec>,
}

/// A declared timer trigger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSpec {
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    pub interval_ms: u64,
    #[serde(default)]
    pub max_concurrents: Option<usize>,
    #[serde(default)]
    pub max_occurrences: Option<u64>,
    #[serde(default)]
    pub rate_limit_ms: Option<u64>,
    /// Fire only while this path exists; always fire when unset
    #[serde(default)]
    pub fire_if_exists: Option<PathBuf>,
}

/// What a declared job does
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    /// Log the trigger context
    Log,
    /// Run an external command
    Command,
}

/// A declared job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSpec {
    pub name: String,
    #[serde(default)]
    pub group: Option<String>,
    pub kind: JobKind,
    /// Message logged by `log` jobs
    #[serde(default)]
    pub message: Option<String>,
    /// Program run by `command` jobs
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub max_concurrents: Option<usize>,
    #[serde(default)]
    pub rate_limit_ms: Option<u64>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

/// Load configuration from files and environment
pub fn load_config(path: Option<&Path>) -> Result<AppConfig> {
    let mut builder = Config::builder()
        // 1. Embedded defaults (always available)
        .add_source(File::from_str(DEFAULT_CONFIG, FileFormat::Toml))
        // 2. Local overrides (optional)
        .add_source(File::with_name("config/local").required(false));

    // 3. Explicit file
    if let Some(path) = path {
        builder = builder.add_source(File::from(path).required(true));
    }

    // 4. Environment variables (highest priority)
    let config = builder
        .add_source(
            Environment::with_prefix("CADENCE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
        .build()
        .context("Failed to build configuration")?;

    config
        .try_deserialize()
        .context("Failed to deserialize configuration")
}

/// Reject configurations the scheduler cannot run
pub fn validate(config: &AppConfig) -> Result<()> {
    config.scheduler.validate()?;

    if config.triggers.is_empty() {
        bail!("no triggers declared; add at least one [[triggers]] entry");
    }
    if config.jobs.is_empty() {
        bail!("no jobs declared; add at least one [[jobs]] entry");
    }

    let mut names = HashSet::new();
    for trigger in &config.triggers {
        if !names.insert(format!("trigger:{}", trigger.name)) {
            bail!("duplicate trigger name '{}'", trigger.name);
        }
        if trigger.max_concurrents == Some(0) {
            bail!("trigger '{}': max_concurrents must be at least 1", trigger.name);
        }
    }

    for job in &config.jobs {
        if !names.insert(format!("job:{}", job.name)) {
            bail!("duplicate job name '{}'", job.name);
        }
        if job.max_concurrents == Some(0) {
            bail!("job '{}': max_concurrents must be at least 1", job.name);
        }
        if job.kind == JobKind::Command
            && job.command.as_deref().map_or(true, |c| c.trim().is_empty())
        {
            bail!("job '{}': command jobs need a non-empty command", job.name);
        }
    }

    Ok(())
}
