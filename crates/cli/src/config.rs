use anyhow::{Context, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sigtrade_api::ApiConfig;
use sigtrade_brokers_common::simulated::SimulatedTerminalConfig;
use sigtrade_brokers_metatrader::MetaTraderConfig;
use sigtrade_data::LotTrackerConfig;
use sigtrade_engine::{BreakevenConfig, OrchestratorConfig};
use sigtrade_vision::{CaptureConfig, VisionConfig};
use std::path::{Path, PathBuf};

/// Looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "sigtrade.toml";

/// Whole-application configuration, one TOML table per component.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub database_url: String,
    /// Shared latest-signal JSON object.
    pub latest_signal_path: PathBuf,
    pub capture: CaptureConfig,
    pub vision: VisionConfig,
    pub lots: LotTrackerConfig,
    pub trading: OrchestratorConfig,
    pub breakeven: BreakevenConfig,
    pub terminal: MetaTraderConfig,
    pub paper: PaperConfig,
    pub api: ApiConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://signals.db".to_string(),
            latest_signal_path: PathBuf::from("latest_signal.json"),
            capture: CaptureConfig::default(),
            vision: VisionConfig::default(),
            lots: LotTrackerConfig::default(),
            trading: OrchestratorConfig::default(),
            breakeven: BreakevenConfig::default(),
            terminal: MetaTraderConfig::default(),
            paper: PaperConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

/// Simulated terminal used with `--paper`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PaperConfig {
    pub initial_balance: Decimal,
    pub symbol: String,
    pub bid: Decimal,
    pub ask: Decimal,
    /// Lot tracker file for paper runs, kept apart from the live one.
    pub lots_path: PathBuf,
}

impl Default for PaperConfig {
    fn default() -> Self {
        Self {
            initial_balance: Decimal::new(10_000, 0),
            symbol: "XAUUSD".to_string(),
            bid: Decimal::new(240_000, 2),
            ask: Decimal::new(240_020, 2),
            lots_path: PathBuf::from("lot_tracker.paper.json"),
        }
    }
}

impl PaperConfig {
    pub fn terminal_config(&self) -> SimulatedTerminalConfig {
        let mut symbol = SimulatedTerminalConfig::xauusd();
        symbol.name = self.symbol.clone();
        SimulatedTerminalConfig {
            initial_balance: self.initial_balance,
            symbols: vec![symbol],
            ..Default::default()
        }
    }
}

impl AppConfig {
    pub fn from_toml(raw: &str) -> Result<Self> {
        let config: Self = toml::from_str(raw).context("Invalid configuration")?;
        config.trading.validate()?;
        Ok(config)
    }

    /// Lot tracker settings for a live or paper run.
    pub fn lot_tracker(&self, paper: bool) -> LotTrackerConfig {
        if paper {
            LotTrackerConfig {
                path: self.paper.lots_path.clone(),
                ..self.lots.clone()
            }
        } else {
            self.lots.clone()
        }
    }

    /// Load `path`, or `sigtrade.toml` if present, or the built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => {
                let default = PathBuf::from(DEFAULT_CONFIG_FILE);
                if !default.exists() {
                    return Ok(Self::default());
                }
                default
            }
        };
        let raw = std::fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Self::from_toml(&raw).with_context(|| format!("Failed to load {}", path.display()))
    }
}
