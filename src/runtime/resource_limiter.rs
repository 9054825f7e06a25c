// src/runtime/resource_limiter.rs
//! Resource ceiling profiles for sandboxed commands
//!
//! A strategy names a profile of:
//! - Concurrency (max simultaneous runs)
//! - CPU ceiling (percentage, 100 = one full core)
//! - Memory ceiling (MB, optional)
//! - Network policy (recorded, not enforced)
//! - Wall-clock timeout
//!
//! Ceilings are observed, not enforced: a run is judged against them after it
//! finishes, using the maxima the resource monitor sampled.

use crate::runtime::resource_monitor::ResourceUsage;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Network policy attached to a strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum NetworkPolicy {
    AllowAll,
    DenyAll,
    Restricted,
}

/// Resource ceiling profile for a sandbox strategy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Maximum concurrent runs under this strategy
    pub max_concurrency: usize,

    /// CPU ceiling as percentage
    /// Example: 90 = 90% of one CPU core
    pub hard_cpu_limit_pct: u32,

    /// Resident memory ceiling in megabytes
    pub memory_limit_mb: Option<u64>,

    /// Network policy (informational)
    pub network_policy: Option<NetworkPolicy>,

    /// Wall-clock timeout in seconds
    pub timeout_secs: u64,

    /// Resource sampling interval in milliseconds
    pub sample_interval_ms: u64,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 8,
            hard_cpu_limit_pct: 90,
            memory_limit_mb: None,
            network_policy: None,
            timeout_secs: 30,
            sample_interval_ms: 100,
        }
    }
}

impl StrategyConfig {
    /// Strict profile (for untrusted commands)
    pub fn strict() -> Self {
        Self {
            max_concurrency: 2,
            hard_cpu_limit_pct: 50,
            memory_limit_mb: Some(256),
            network_policy: Some(NetworkPolicy::DenyAll),
            timeout_secs: 10,
            ..Default::default()
        }
    }

    /// Relaxed profile (for development)
    pub fn relaxed() -> Self {
        Self {
            max_concurrency: 16,
            hard_cpu_limit_pct: 400,
            memory_limit_mb: Some(4096),
            network_policy: Some(NetworkPolicy::AllowAll),
            timeout_secs: 300,
            ..Default::default()
        }
    }

    /// Wall-clock timeout
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Sampling interval for the resource monitor
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    /// Validate the profile
    pub fn validate(&self) -> Result<(), String> {
        if self.max_concurrency == 0 {
            return Err("max_concurrency cannot be 0".to_string());
        }

        if self.hard_cpu_limit_pct == 0 {
            return Err("hard_cpu_limit_pct cannot be 0".to_string());
        }
        if self.hard_cpu_limit_pct > 10_000 {
            return Err("hard_cpu_limit_pct cannot exceed 10000% (100 cores)".to_string());
        }

        if self.memory_limit_mb == Some(0) {
            return Err("memory_limit_mb cannot be 0".to_string());
        }

        if self.timeout_secs == 0 {
            return Err("timeout_secs cannot be 0".to_string());
        }

        if self.sample_interval_ms == 0 {
            return Err("sample_interval_ms cannot be 0".to_string());
        }

        Ok(())
    }

    /// Judge sampled usage against the ceilings
    pub fn check(&self, usage: &ResourceUsage) -> CeilingCheck {
        let cpu_exceeded = usage.max_cpu_pct > f64::from(self.hard_cpu_limit_pct);
        let memory_exceeded = self
            .memory_limit_mb
            .map(|limit| usage.max_memory_mb > limit as f64)
            .unwrap_or(false);

        CeilingCheck {
            cpu_exceeded,
            memory_exceeded,
        }
    }
}

/// Outcome of a ceiling check
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CeilingCheck {
    pub cpu_exceeded: bool,
    pub memory_exceeded: bool,
}

impl CeilingCheck {
    /// True if any ceiling was crossed
    pub fn exceeded(&self) -> bool {
        self.cpu_exceeded || self.memory_exceeded
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn usage(cpu: f64, memory: f64) -> ResourceUsage {
        ResourceUsage {
            max_cpu_pct: cpu,
            max_memory_mb: memory,
            samples: 3,
        }
    }

    #[test]
    fn test_default_profile() {
        let config = StrategyConfig::default();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.hard_cpu_limit_pct, 90);
        assert_eq!(config.memory_limit_mb, None);
        assert_eq!(config.timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_presets_validate() {
        assert!(StrategyConfig::strict().validate().is_ok());
        assert!(StrategyConfig::relaxed().validate().is_ok());
        assert_eq!(StrategyConfig::strict().network_policy, Some(NetworkPolicy::DenyAll));
    }

    #[test]
    fn test_validation() {
        let zero_concurrency = StrategyConfig {
            max_concurrency: 0,
            ..Default::default()
        };
        assert!(zero_concurrency.validate().is_err());

        let zero_memory = StrategyConfig {
            memory_limit_mb: Some(0),
            ..Default::default()
        };
        assert!(zero_memory.validate().is_err());

        let zero_timeout = StrategyConfig {
            timeout_secs: 0,
            ..Default::default()
        };
        assert!(zero_timeout.validate().is_err());
    }

    #[test]
    fn test_ceiling_check() {
        let config = StrategyConfig {
            hard_cpu_limit_pct: 50,
            memory_limit_mb: Some(128),
            ..Default::default()
        };

        assert!(!config.check(&usage(10.0, 64.0)).exceeded());
        assert!(config.check(&usage(75.0, 64.0)).cpu_exceeded);

        let check = config.check(&usage(10.0, 200.0));
        assert!(check.memory_exceeded);
        assert!(!check.cpu_exceeded);
        assert!(check.exceeded());
    }

    #[test]
    fn test_no_memory_ceiling() {
        let config = StrategyConfig::default();
        assert!(!config.check(&usage(0.0, 100_000.0)).exceeded());
    }

    #[test]
    fn test_network_policy_serde() {
        let config: StrategyConfig =
            serde_json::from_str(r#"{"network_policy": "deny-all", "memory_limit_mb": 512}"#).unwrap();
        assert_eq!(config.network_policy, Some(NetworkPolicy::DenyAll));
        assert_eq!(config.memory_limit_mb, Some(512));
        assert_eq!(config.hard_cpu_limit_pct, 90);
    }
}
