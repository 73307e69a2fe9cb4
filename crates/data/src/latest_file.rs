use crate::write_atomic;
use serde_json::{Map, Value};
use sigtrade_core::{ChartSignal, DataError, SignalRecord};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Key the chart detector writes.
pub const CHART_SIGNAL_KEY: &str = "Chart_signal";

/// The shared "latest signal" JSON object.
///
/// Several producers write disjoint keys into the same object, so updates
/// merge into what is on disk instead of replacing it.
#[derive(Debug, Clone)]
pub struct LatestSignalFile {
    path: PathBuf,
}

impl LatestSignalFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current contents. Missing, unreadable, or non-object files read as `{}`.
    pub fn read(&self) -> Map<String, Value> {
        if !self.path.exists() {
            return Map::new();
        }
        let parsed = std::fs::read_to_string(&self.path)
            .map_err(|e| e.to_string())
            .and_then(|raw| serde_json::from_str::<Value>(&raw).map_err(|e| e.to_string()));
        match parsed {
            Ok(Value::Object(map)) => map,
            Ok(_) => {
                warn!(path = %self.path.display(), "Latest signal file is not a JSON object, ignoring");
                Map::new()
            }
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Could not read latest signal file");
                Map::new()
            }
        }
    }

    /// Merge `updates` into the stored object.
    pub fn merge(&self, updates: Map<String, Value>) -> Result<(), DataError> {
        let mut current = self.read();
        current.extend(updates);
        let json = serde_json::to_string_pretty(&Value::Object(current))
            .map_err(|e| DataError::ParseError(e.to_string()))?;
        write_atomic(&self.path, json.as_bytes())
    }

    pub fn write_chart_signal(&self, signal: ChartSignal) -> Result<(), DataError> {
        let mut updates = Map::new();
        updates.insert(CHART_SIGNAL_KEY.to_string(), Value::String(signal.to_string()));
        self.merge(updates)
    }

    pub fn chart_signal(&self) -> Option<ChartSignal> {
        self.read()
            .get(CHART_SIGNAL_KEY)
            .and_then(Value::as_str)
            .map(ChartSignal::from_stored)
    }

    /// Build a `signal_history` row from the file; absent keys become `N/A`.
    pub fn to_record(&self, source: &str) -> SignalRecord {
        let data = self.read();
        let text = |key: &str| -> String {
            match data.get(key) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => "N/A".to_string(),
                Some(other) => other.to_string(),
            }
        };

        let mut record = SignalRecord::chart(ChartSignal::from_stored(&text(CHART_SIGNAL_KEY)), source);
        record.signal = text("Signal");
        record.confidence = text("Confidence");
        record.candle_signal = text("candle_Signal");
        record.candle_confidence = text("candle_Confidence");
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::temp_path;
    use serde_json::json;

    #[test]
    fn test_chart_signal_merges_with_existing_keys() {
        let file = LatestSignalFile::new(temp_path("latest.json"));
        std::fs::write(file.path(), r#"{"Signal": "HOLD", "Confidence": "40%"}"#).unwrap();

        file.write_chart_signal(ChartSignal::Sell).unwrap();

        let data = file.read();
        assert_eq!(data["Chart_signal"], json!("SELL"));
        assert_eq!(data["Signal"], json!("HOLD"));
        assert_eq!(file.chart_signal(), Some(ChartSignal::Sell));

        let _ = std::fs::remove_file(file.path());
    }

    #[test]
    fn test_unreadable_file_reads_empty() {
        let file = LatestSignalFile::new(temp_path("garbage.json"));
        std::fs::write(file.path(), "[1, 2").unwrap();
        assert!(file.read().is_empty());

        // Writing replaces the garbage with a valid object.
        file.write_chart_signal(ChartSignal::ApiError).unwrap();
        assert_eq!(file.chart_signal(), Some(ChartSignal::ApiError));

        let _ = std::fs::remove_file(file.path());
    }

    #[test]
    fn test_record_defaults_missing_keys() {
        let file = LatestSignalFile::new(temp_path("record.json"));
        std::fs::write(
            file.path(),
            r#"{"Chart_signal": "BUY", "Confidence": 65, "candle_Signal": null}"#,
        )
        .unwrap();

        let record = file.to_record("pipeline");
        assert_eq!(record.chart_signal, ChartSignal::Buy);
        assert_eq!(record.signal, "N/A");
        assert_eq!(record.confidence, "65");
        assert_eq!(record.candle_signal, "N/A");
        assert_eq!(record.source, "pipeline");

        let _ = std::fs::remove_file(file.path());
    }
}
