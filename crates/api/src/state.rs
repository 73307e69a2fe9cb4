use serde::{Deserialize, Serialize};
use sigtrade_core::TradingTerminal;
use sigtrade_data::SignalStore;
use sigtrade_risk::OrderGuards;
use tokio::sync::Mutex;

/// Control API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub bind: String,
    /// Echo order requests instead of sending them.
    pub dry_run: bool,
    /// Magic number stamped on orders opened through the API.
    pub magic: u64,
    pub deviation: u32,
    pub guards: OrderGuards,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
            dry_run: true,
            magic: 987_654,
            deviation: 20,
            guards: OrderGuards::default(),
        }
    }
}

/// Shared application state accessible by all route handlers.
pub struct AppState {
    /// Terminal calls are serialised through this lock.
    pub terminal: Mutex<Box<dyn TradingTerminal>>,
    pub store: SignalStore,
    pub config: ApiConfig,
}

impl AppState {
    pub fn new(terminal: Box<dyn TradingTerminal>, store: SignalStore, config: ApiConfig) -> Self {
        Self {
            terminal: Mutex::new(terminal),
            store,
            config,
        }
    }
}
