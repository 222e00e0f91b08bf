//! Runtime configuration.
//!
//! The engine is configured entirely from a single TOML file loaded once at
//! startup via [`Config::load`]; there is no compile-time feature tier. Every
//! key below is recognized; unknown top-level tables are rejected by serde's
//! `deny_unknown_fields` so a typo in an operator's config file fails fast
//! instead of being silently ignored.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    pub engine: EngineConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub wal: WalConfig,
    #[serde(default)]
    pub replication: ReplicationConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing config file {}", path.display()))
    }

    pub fn from_str(text: &str) -> Result<Self> {
        toml::from_str(text).context("parsing config")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineMode {
    Stdio,
    Service,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    pub mode: EngineMode,
    /// Ambient: not named by the core spec, carried the way the teacher
    /// threads `tracing` configuration through its own `Config`.
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub json_logs: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RiskConfig {
    /// Per-symbol position cap; absent symbols fall back to `default_max_position`.
    #[serde(default)]
    pub max_position: HashMap<String, Decimal>,
    #[serde(default = "default_max_position")]
    pub default_max_position: Decimal,
    #[serde(default = "default_max_leverage")]
    pub max_leverage: Decimal,
    #[serde(default = "default_max_price_deviation")]
    pub max_price_deviation: Decimal,
    #[serde(default = "default_order_rate_window_ms")]
    pub order_rate_window_ms: u64,
    #[serde(default = "default_order_rate_max")]
    pub order_rate_max: u32,
    #[serde(default = "default_order_size_min")]
    pub order_size_min: Decimal,
    #[serde(default = "default_order_size_max")]
    pub order_size_max: Decimal,
    #[serde(default = "default_maker_fee_bps")]
    pub maker_fee_bps: Decimal,
    #[serde(default = "default_taker_fee_bps")]
    pub taker_fee_bps: Decimal,
}

impl Default for RiskConfig {
    fn default() -> Self {
        Self {
            max_position: HashMap::new(),
            default_max_position: default_max_position(),
            max_leverage: default_max_leverage(),
            max_price_deviation: default_max_price_deviation(),
            order_rate_window_ms: default_order_rate_window_ms(),
            order_rate_max: default_order_rate_max(),
            order_size_min: default_order_size_min(),
            order_size_max: default_order_size_max(),
            maker_fee_bps: default_maker_fee_bps(),
            taker_fee_bps: default_taker_fee_bps(),
        }
    }
}

impl RiskConfig {
    pub fn max_position_for(&self, symbol: &str) -> Decimal {
        self.max_position
            .get(symbol)
            .copied()
            .unwrap_or(self.default_max_position)
    }
}

fn default_max_position() -> Decimal {
    Decimal::new(10, 0)
}
fn default_max_leverage() -> Decimal {
    Decimal::new(5, 0)
}
fn default_max_price_deviation() -> Decimal {
    Decimal::new(5, 2) // 0.05 == 5%
}
fn default_order_rate_window_ms() -> u64 {
    1_000
}
fn default_order_rate_max() -> u32 {
    50
}
fn default_order_size_min() -> Decimal {
    Decimal::new(1, 3) // 0.001
}
fn default_order_size_max() -> Decimal {
    Decimal::new(100, 0)
}
fn default_maker_fee_bps() -> Decimal {
    Decimal::new(1, 0) // 1bps
}
fn default_taker_fee_bps() -> Decimal {
    Decimal::new(5, 0) // 5bps
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BreakerConfig {
    #[serde(default = "default_daily_loss_pct")]
    pub daily_loss_pct: Decimal,
    #[serde(default = "default_cooldown_ms")]
    pub cooldown_ms: u64,
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u64,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            daily_loss_pct: default_daily_loss_pct(),
            cooldown_ms: default_cooldown_ms(),
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
        }
    }
}

fn default_daily_loss_pct() -> Decimal {
    Decimal::new(10, 2) // 0.10 == 10%
}
fn default_cooldown_ms() -> u64 {
    30_000
}
fn default_failure_threshold() -> u64 {
    3
}
fn default_success_threshold() -> u64 {
    2
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsyncMode {
    Every,
    Interval,
    Off,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct WalConfig {
    #[serde(default = "default_wal_path")]
    pub path: String,
    #[serde(default = "default_segment_bytes")]
    pub segment_bytes: u64,
    #[serde(default = "default_fsync_mode")]
    pub fsync_mode: FsyncMode,
    #[serde(default = "default_fsync_interval_ms")]
    pub fsync_interval_ms: u64,
}

impl Default for WalConfig {
    fn default() -> Self {
        Self {
            path: default_wal_path(),
            segment_bytes: default_segment_bytes(),
            fsync_mode: default_fsync_mode(),
            fsync_interval_ms: default_fsync_interval_ms(),
        }
    }
}

fn default_wal_path() -> String {
    "./veloz.wal".to_string()
}
fn default_segment_bytes() -> u64 {
    256 * 1024 * 1024
}
fn default_fsync_mode() -> FsyncMode {
    FsyncMode::Every
}
fn default_fsync_interval_ms() -> u64 {
    100
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReplicationMode {
    Sync,
    Async,
    Disabled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReplicationConfig {
    #[serde(default = "default_replication_mode")]
    pub mode: ReplicationMode,
    #[serde(default)]
    pub peer: Option<String>,
    #[serde(default = "default_ack_timeout_ms")]
    pub ack_timeout_ms: u64,
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            mode: default_replication_mode(),
            peer: None,
            ack_timeout_ms: default_ack_timeout_ms(),
            max_pending: default_max_pending(),
        }
    }
}

fn default_replication_mode() -> ReplicationMode {
    ReplicationMode::Disabled
}
fn default_ack_timeout_ms() -> u64 {
    2_000
}
fn default_max_pending() -> usize {
    4_096
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SimulationConfig {
    #[serde(default = "default_simulation_enabled")]
    pub enabled: bool,
    #[serde(default = "default_latency_ms")]
    pub latency_ms: u64,
    #[serde(default = "default_slippage_bps")]
    pub slippage_bps: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            enabled: default_simulation_enabled(),
            latency_ms: default_latency_ms(),
            slippage_bps: default_slippage_bps(),
        }
    }
}

fn default_simulation_enabled() -> bool {
    true
}
fn default_latency_ms() -> u64 {
    5
}
fn default_slippage_bps() -> u32 {
    2
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_fills_defaults() {
        let cfg = Config::from_str(
            r#"
            [engine]
            mode = "stdio"
            "#,
        )
        .unwrap();
        assert_eq!(cfg.engine.mode, EngineMode::Stdio);
        assert_eq!(cfg.engine.log_level, "info");
        assert_eq!(cfg.risk.order_rate_max, 50);
        assert_eq!(cfg.replication.mode, ReplicationMode::Disabled);
    }

    #[test]
    fn per_symbol_position_limit_overrides_default() {
        let cfg = Config::from_str(
            r#"
            [engine]
            mode = "stdio"

            [risk.max_position]
            BTCUSDT = "5"
            "#,
        )
        .unwrap();
        assert_eq!(
            cfg.risk.max_position_for("BTCUSDT"),
            Decimal::new(5, 0)
        );
        assert_eq!(
            cfg.risk.max_position_for("ETHUSDT"),
            cfg.risk.default_max_position
        );
    }

    #[test]
    fn unknown_key_is_rejected() {
        let err = Config::from_str(
            r#"
            [engine]
            mode = "stdio"
            bogus = true
            "#,
        )
        .unwrap_err();
        assert!(format!("{err:#}").contains("bogus") || format!("{err:#}").contains("unknown"));
    }
}
