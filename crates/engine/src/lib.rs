pub mod monitor;
pub mod orchestrator;

pub use monitor::{BreakevenConfig, BreakevenMonitor, MonitorSummary};
pub use orchestrator::{CycleOutcome, OpenedSet, Orchestrator, OrchestratorConfig};

use sigtrade_core::{BrokerError, DataError};

/// Errors that abort a trading cycle.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Data(#[from] DataError),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
