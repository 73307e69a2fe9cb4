pub mod db;
pub mod latest_file;
pub mod lot_tracker;

pub use latest_file::LatestSignalFile;
pub use lot_tracker::{LotRecord, LotTracker, LotTrackerConfig};

use async_trait::async_trait;
use sigtrade_core::{ChartSignal, DataError, SignalRecord, SignalSource};
use sqlx::SqlitePool;
use std::path::{Path, PathBuf};
use tracing::info;

/// The SQLite-backed `signal_history` store.
#[derive(Debug, Clone)]
pub struct SignalStore {
    pub pool: SqlitePool,
}

impl SignalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open the database at `database_url`, creating the table if needed.
    pub async fn connect(database_url: &str) -> Result<Self, DataError> {
        let pool = db::connect(database_url)
            .await
            .map_err(|e| DataError::DatabaseError(e.to_string()))?;
        Ok(Self { pool })
    }

    pub async fn append(&self, record: &SignalRecord) -> Result<i64, DataError> {
        let id = db::insert_signal(&self.pool, record)
            .await
            .map_err(|e| DataError::DatabaseError(e.to_string()))?;
        info!(
            id,
            chart_signal = %record.chart_signal,
            source = %record.source,
            "Signal saved to database"
        );
        Ok(id)
    }

    pub async fn latest(&self) -> Result<Option<SignalRecord>, DataError> {
        db::latest_signal(&self.pool)
            .await
            .map_err(|e| DataError::DatabaseError(e.to_string()))
    }

    pub async fn recent(&self, limit: u32) -> Result<Vec<SignalRecord>, DataError> {
        db::recent_signals(&self.pool, limit)
            .await
            .map_err(|e| DataError::DatabaseError(e.to_string()))
    }

    /// Copy the latest-signal JSON file into a new history row.
    pub async fn ingest_latest_file(
        &self,
        file: &LatestSignalFile,
        source: &str,
    ) -> Result<SignalRecord, DataError> {
        let mut record = file.to_record(source);
        record.id = Some(self.append(&record).await?);
        Ok(record)
    }
}

#[async_trait]
impl SignalSource for SignalStore {
    async fn latest_chart_signal(&self) -> Result<Option<ChartSignal>, DataError> {
        Ok(self.latest().await?.map(|r| r.chart_signal))
    }
}

/// Write via a sibling temp file and rename so readers never see a partial file.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), DataError> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, contents)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
pub(crate) fn temp_path(name: &str) -> PathBuf {
    use std::sync::atomic::{AtomicU32, Ordering};
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    let n = COUNTER.fetch_add(1, Ordering::SeqCst);
    std::env::temp_dir().join(format!("sigtrade-{}-{}-{}", std::process::id(), n, name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ingest_then_latest_chart_signal() {
        let store = SignalStore::connect("sqlite::memory:").await.unwrap();
        assert_eq!(store.latest_chart_signal().await.unwrap(), None);

        let file = LatestSignalFile::new(temp_path("ingest.json"));
        file.write_chart_signal(ChartSignal::Sell).unwrap();

        let record = store.ingest_latest_file(&file, "detector").await.unwrap();
        assert!(record.id.is_some());
        assert_eq!(
            store.latest_chart_signal().await.unwrap(),
            Some(ChartSignal::Sell)
        );

        let _ = std::fs::remove_file(file.path());
    }
}
