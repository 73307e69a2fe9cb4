use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sigtrade_core::DataError;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::write_atomic;

/// Lot escalation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LotTrackerConfig {
    /// JSON file holding the current base lot.
    pub path: PathBuf,
    /// Lot used before any trade set has completed.
    pub base_lot: Decimal,
    /// Added once per fully-closed trade set.
    pub increment: Decimal,
}

impl Default for LotTrackerConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("lot_tracker.json"),
            base_lot: Decimal::new(1, 2),
            increment: Decimal::new(1, 2),
        }
    }
}

/// Persisted tracker state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LotRecord {
    #[serde(alias = "last_lot")]
    pub base_lot_size: Decimal,
    /// A trade set was opened at `base_lot_size` and has not yet been seen
    /// fully closed.
    #[serde(default)]
    pub awaiting_close: bool,
}

/// Flat-file lot escalation tracker.
///
/// The lot grows by `increment` exactly once per trade set: `mark_opened`
/// arms the tracker, and the next `next_lot(true)` consumes it.
#[derive(Debug, Clone)]
pub struct LotTracker {
    config: LotTrackerConfig,
}

impl LotTracker {
    pub fn new(config: LotTrackerConfig) -> Self {
        Self { config }
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Read the tracker file; a missing file yields the configured base lot.
    pub fn load(&self) -> Result<LotRecord, DataError> {
        if !self.config.path.exists() {
            return Ok(LotRecord {
                base_lot_size: self.config.base_lot,
                awaiting_close: false,
            });
        }
        let raw = std::fs::read_to_string(&self.config.path)?;
        let mut record: LotRecord = serde_json::from_str(&raw).map_err(|e| {
            DataError::ParseError(format!("{}: {}", self.config.path.display(), e))
        })?;
        record.base_lot_size = record.base_lot_size.round_dp(2);
        Ok(record)
    }

    pub fn save(&self, record: &LotRecord) -> Result<(), DataError> {
        let record = LotRecord {
            base_lot_size: record.base_lot_size.round_dp(2),
            awaiting_close: record.awaiting_close,
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| DataError::ParseError(e.to_string()))?;
        write_atomic(&self.config.path, json.as_bytes())
    }

    /// Lot size for the next trade set.
    ///
    /// `all_closed` is whether no positions or orders of ours remain on the
    /// symbol. The stored lot is escalated only if a set had been opened
    /// since the last escalation.
    pub fn next_lot(&self, all_closed: bool) -> Result<Decimal, DataError> {
        let mut record = self.load()?;
        if record.awaiting_close && all_closed {
            let previous = record.base_lot_size;
            record.base_lot_size = (previous + self.config.increment).round_dp(2);
            record.awaiting_close = false;
            self.save(&record)?;
            info!(
                previous = %previous,
                lot = %record.base_lot_size,
                "All trades closed, lot increased"
            );
        }
        Ok(record.base_lot_size)
    }

    /// Record that a trade set was opened at the current lot.
    pub fn mark_opened(&self) -> Result<(), DataError> {
        let mut record = self.load()?;
        if !record.awaiting_close {
            record.awaiting_close = true;
            self.save(&record)?;
        }
        Ok(())
    }

    /// Restore the configured base lot.
    pub fn reset(&self) -> Result<LotRecord, DataError> {
        let record = LotRecord {
            base_lot_size: self.config.base_lot,
            awaiting_close: false,
        };
        self.save(&record)?;
        Ok(record)
    }
}
