// src/utils/config.rs
//! Toolkit configuration
//!
//! Sources, lowest priority first:
//! 1. Built-in defaults (serde)
//! 2. Config file (YAML, TOML or JSON by extension)
//! 3. Environment variables `AGENT_TOOLKIT__<SECTION>__<KEY>`
//!
//! String values may reference environment variables as `${VAR}`. Unset
//! variables are left verbatim.

use crate::observability::event_bus::DEFAULT_BUFFER_SIZE;
use crate::runtime::resource_limiter::StrategyConfig;
use crate::utils::errors::{Result, ToolkitError};
use config::{Config, Environment, File};
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "AGENT_TOOLKIT";

static ENV_REFERENCE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\$\{([^}]+)\}").unwrap());

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolkitConfig {
    pub meta: MetaConfig,
    pub logging: LoggingConfig,
    pub observability: ObservabilityConfig,
    pub sandbox: SandboxConfig,
    pub dependency_pools: BTreeMap<String, PoolConfig>,
    pub agents: BTreeMap<String, AgentConfig>,
    pub cleanup: CleanupConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    pub environment: String,
    pub version: u32,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            environment: "dev".to_string(),
            version: 1,
        }
    }
}

/// Log output format
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,

    pub format: LogFormat,

    /// Also publish log records on the event bus
    pub forward_to_event_bus: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::default(),
            forward_to_event_bus: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub enable: bool,
    pub event_buffer_size: usize,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            enable: true,
            event_buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub default_strategy: String,
    pub strategies: BTreeMap<String, StrategyConfig>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            default_strategy: "subprocess".to_string(),
            strategies: BTreeMap::from([("subprocess".to_string(), StrategyConfig::default())]),
        }
    }
}

/// Concrete pool implementation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PoolKind {
    Filesystem,
    #[serde(alias = "cursor")]
    CliExecutor,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(rename = "type")]
    pub kind: PoolKind,

    /// Allowed roots (filesystem pools)
    #[serde(default)]
    pub paths: Vec<String>,

    /// CLI binary (cli_executor pools)
    #[serde(default)]
    pub binary_path: Option<String>,

    /// Default CLI arguments (cli_executor pools)
    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default = "default_max_instances")]
    pub max_instances: usize,
}

fn default_max_instances() -> usize {
    5
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Falls back to `sandbox.default_strategy`
    pub sandbox_strategy: Option<String>,
    pub dependency_pools: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub interval_secs: u64,
    pub max_age_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 300,
            max_age_secs: 3600,
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }
}

/// Everything an agent runtime needs, resolved from the config
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedAgent {
    pub name: String,
    pub strategy_name: String,
    pub strategy: StrategyConfig,
    pub dependency_pools: BTreeMap<String, PoolConfig>,
}

impl ToolkitConfig {
    /// Load from `path`, then environment overrides, then validate
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Err(ToolkitError::InvalidConfig(
                format!("config file not found: {}", path.display())
            ));
        }

        let raw: Value = Config::builder()
            .add_source(File::from(path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Self::from_value(raw)
    }

    /// Build from an already parsed document (interpolates and validates)
    pub fn from_value(raw: Value) -> Result<Self> {
        let config: Self = serde_json::from_value(interpolate(raw))
            .map_err(|e| ToolkitError::InvalidConfig(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    /// Cross-check references between sections
    pub fn validate(&self) -> Result<()> {
        let sandbox = &self.sandbox;

        if !sandbox.strategies.contains_key(&sandbox.default_strategy) {
            return Err(ToolkitError::InvalidConfig(
                format!("default strategy '{}' is not defined", sandbox.default_strategy)
            ));
        }

        for (name, strategy) in &sandbox.strategies {
            strategy.validate().map_err(|e| ToolkitError::InvalidConfig(
                format!("strategy '{}': {}", name, e)
            ))?;
        }

        for (name, pool) in &self.dependency_pools {
            if pool.max_instances == 0 {
                return Err(ToolkitError::InvalidConfig(
                    format!("pool '{}': max_instances cannot be 0", name)
                ));
            }
            match pool.kind {
                PoolKind::Filesystem if pool.paths.is_empty() => {
                    return Err(ToolkitError::InvalidConfig(
                        format!("filesystem pool '{}' has no paths", name)
                    ));
                }
                _ => {}
            }
        }

        for (name, agent) in &self.agents {
            if let Some(strategy) = &agent.sandbox_strategy {
                if !sandbox.strategies.contains_key(strategy) {
                    return Err(ToolkitError::InvalidConfig(
                        format!("agent '{}' references unknown strategy '{}'", name, strategy)
                    ));
                }
            }

            if let Some(pool) = agent.dependency_pools.iter().find(|p| !self.dependency_pools.contains_key(*p)) {
                return Err(ToolkitError::InvalidConfig(
                    format!("agent '{}' references unknown dependency pool '{}'", name, pool)
                ));
            }
        }

        if self.observability.event_buffer_size == 0 {
            return Err(ToolkitError::InvalidConfig("event_buffer_size cannot be 0".into()));
        }

        if self.cleanup.interval_secs == 0 {
            return Err(ToolkitError::InvalidConfig("cleanup interval_secs cannot be 0".into()));
        }

        Ok(())
    }

    /// Resolve an agent's strategy and pools
    pub fn resolve_agent(&self, name: &str) -> Result<ResolvedAgent> {
        let agent = self
            .agents
            .get(name)
            .ok_or_else(|| ToolkitError::UnknownAgent(name.to_string()))?;

        let strategy_name = agent
            .sandbox_strategy
            .clone()
            .unwrap_or_else(|| self.sandbox.default_strategy.clone());

        let strategy = self
            .sandbox
            .strategies
            .get(&strategy_name)
            .cloned()
            .ok_or_else(|| ToolkitError::UnknownStrategy(strategy_name.clone()))?;

        let dependency_pools = agent
            .dependency_pools
            .iter()
            .filter_map(|p| self.dependency_pools.get(p).map(|cfg| (p.clone(), cfg.clone())))
            .collect();

        Ok(ResolvedAgent {
            name: name.to_string(),
            strategy_name,
            strategy,
            dependency_pools,
        })
    }
}

/// Replace `${VAR}` in every string of a document
fn interpolate(value: Value) -> Value {
    match value {
        Value::String(s) => Value::String(interpolate_str(&s)),
        Value::Array(items) => Value::Array(items.into_iter().map(interpolate).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, interpolate(v))).collect()),
        other => other,
    }
}

fn interpolate_str(s: &str) -> String {
    ENV_REFERENCE
        .replace_all(s, |caps: &Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .into_owned()
}
