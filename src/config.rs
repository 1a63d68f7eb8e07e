//! Configuration loading from TOML.
//!
//! Reads `config.toml` and deserializes into strongly-typed structs. Every
//! section falls back to its defaults when absent, so an empty file is a
//! valid configuration.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// Top-level application configuration.
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub engine: EngineConfig,
    pub scan: ScanConfig,
    pub execution: ExecutionConfig,
    pub risk: RiskConfig,
    pub storage: StorageConfig,
    pub dashboard: DashboardConfig,
    pub sandbox: SandboxConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub name: String,
    /// How often the binary logs a status line for running tasks.
    pub status_interval_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            name: "TRIANGULUM-001".into(),
            status_interval_secs: 60,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ScanConfig {
    pub min_chain_length: usize,
    pub max_chain_length: usize,
    /// Quotes older than this are left out of the rate graph.
    pub quote_max_age_secs: i64,
    /// How many scanned chains the service remembers for manual execution.
    pub chain_registry_size: usize,
    /// Task loops reuse a scan result this young for an identical request.
    /// Zero disables the cache. Must stay below the rate staleness limit.
    pub result_cache_secs: i64,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            min_chain_length: 3,
            max_chain_length: 5,
            quote_max_age_secs: 30,
            chain_registry_size: 500,
            result_cache_secs: 5,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ExecutionConfig {
    /// A chain whose rates are older than this is refused.
    pub rate_staleness_secs: i64,
    /// Retries per leg on transient connector errors.
    pub max_retries: u32,
    /// Backoff before retry n is `backoff_base_ms * 2^n`.
    pub backoff_base_ms: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            rate_staleness_secs: 10,
            max_retries: 3,
            backoff_base_ms: 200,
        }
    }
}

/// Engine-wide risk policy constants. Per-task knobs live in `TaskParams`.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RiskConfig {
    /// Share of the current budget committed per trade under smart sizing.
    pub base_position_fraction: f64,
    pub win_scale_step: f64,
    pub max_win_scale_steps: u32,
    /// Drawdown trip point = max_loss_per_trade * this.
    pub drawdown_multiplier: f64,
    /// Threshold added per consecutive loss (percent).
    pub adaptive_profit_step: f64,
    pub adaptive_profit_cap: f64,
    pub chain_failure_threshold: u32,
    pub chain_cooldown_secs: i64,
    /// A chain with fewer attempts than this is unproven.
    pub proven_min_executions: u32,
    /// A chain succeeding less often than this is unproven.
    pub proven_min_success_rate: f64,
    /// Share of the current budget staked on an unproven chain.
    pub trial_position_fraction: f64,
    /// Emergency stop once total loss exceeds this percent of the budget.
    pub max_total_loss_percent: f64,
    /// Emergency stop once net profit falls below minus this percent.
    pub max_net_loss_percent: f64,
    /// A task whose budget falls to this share of its initial budget is
    /// exhausted.
    pub exhausted_budget_fraction: f64,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            base_position_fraction: 0.2,
            win_scale_step: 0.1,
            max_win_scale_steps: 5,
            drawdown_multiplier: 5.0,
            adaptive_profit_step: 0.5,
            adaptive_profit_cap: 2.0,
            chain_failure_threshold: 3,
            chain_cooldown_secs: 300,
            proven_min_executions: 3,
            proven_min_success_rate: 0.5,
            trial_position_fraction: 0.05,
            max_total_loss_percent: 5.0,
            max_net_loss_percent: 2.0,
            exhausted_budget_fraction: 0.01,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub enabled: bool,
    pub tasks_dir: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            tasks_dir: "data/tasks".into(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DashboardConfig {
    pub enabled: bool,
    pub port: u16,
}

impl Default for DashboardConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 8080,
        }
    }
}

/// Settings for the in-memory exchange the binary trades against.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SandboxConfig {
    pub fee_rate: f64,
    pub min_notional: f64,
    /// Starting balances per asset.
    pub balances: HashMap<String, f64>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        let mut balances = HashMap::new();
        balances.insert("USDT".to_string(), 10_000.0);
        Self {
            fee_rate: 0.001,
            min_notional: 10.0,
            balances,
        }
    }
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &str) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {path}"))?;
        let config: AppConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {path}"))?;
        config.validate().with_context(|| format!("Invalid config file: {path}"))?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &str) -> Result<Self> {
        if Path::new(path).exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    fn validate(&self) -> Result<()> {
        if self.scan.min_chain_length < 3 || self.scan.min_chain_length > self.scan.max_chain_length {
            anyhow::bail!(
                "scan chain length range {}..={} is invalid",
                self.scan.min_chain_length,
                self.scan.max_chain_length
            );
        }
        for (name, value) in [
            ("risk.base_position_fraction", self.risk.base_position_fraction),
            ("risk.trial_position_fraction", self.risk.trial_position_fraction),
            ("risk.proven_min_success_rate", self.risk.proven_min_success_rate),
            ("risk.exhausted_budget_fraction", self.risk.exhausted_budget_fraction),
        ] {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{name} must be within [0, 1]");
            }
        }
        if self.scan.result_cache_secs < 0
            || (self.scan.result_cache_secs > 0
                && self.scan.result_cache_secs >= self.execution.rate_staleness_secs)
        {
            anyhow::bail!(
                "scan.result_cache_secs ({}) must be below execution.rate_staleness_secs ({})",
                self.scan.result_cache_secs,
                self.execution.rate_staleness_secs
            );
        }
        if !(0.0..1.0).contains(&self.sandbox.fee_rate) {
            anyhow::bail!("sandbox.fee_rate must be within [0, 1)");
        }
        Ok(())
    }
}
