use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use sigtrade_core::{ChartSignal, SignalRecord};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use std::str::FromStr;

/// Open (creating if missing) the signal database and run embedded migrations.
pub async fn connect(database_url: &str) -> Result<SqlitePool, sqlx::Error> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    // Every connection to `sqlite::memory:` is a separate database.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 4 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;
    run_migrations(&pool).await?;
    Ok(pool)
}

/// Run embedded migrations.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("../../migrations").run(pool).await?;
    Ok(())
}

/// Append a signal row. Returns the new row id.
pub async fn insert_signal(pool: &SqlitePool, record: &SignalRecord) -> Result<i64, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO signal_history
            (timestamp, chart_signal, signal, confidence, candle_signal, candle_confidence, source)
         VALUES (?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(format_timestamp(record.timestamp))
    .bind(record.chart_signal.as_str())
    .bind(&record.signal)
    .bind(&record.confidence)
    .bind(&record.candle_signal)
    .bind(&record.candle_confidence)
    .bind(&record.source)
    .execute(pool)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Load the latest row by timestamp (ties broken by insertion order).
///
/// Rows are ordered by `julianday` so RFC 3339, naive, and offset forms
/// compare as instants rather than as text.
pub async fn latest_signal(pool: &SqlitePool) -> Result<Option<SignalRecord>, sqlx::Error> {
    let row = sqlx::query(
        "SELECT id, timestamp, chart_signal, signal, confidence, candle_signal, candle_confidence, source
         FROM signal_history
         ORDER BY julianday(timestamp) DESC, id DESC
         LIMIT 1",
    )
    .fetch_optional(pool)
    .await?;

    row.map(|r| row_to_record(&r)).transpose()
}

/// Load the most recent `limit` rows, newest first.
pub async fn recent_signals(pool: &SqlitePool, limit: u32) -> Result<Vec<SignalRecord>, sqlx::Error> {
    let rows = sqlx::query(
        "SELECT id, timestamp, chart_signal, signal, confidence, candle_signal, candle_confidence, source
         FROM signal_history
         ORDER BY julianday(timestamp) DESC, id DESC
         LIMIT ?",
    )
    .bind(i64::from(limit))
    .fetch_all(pool)
    .await?;

    rows.iter().map(row_to_record).collect()
}

fn row_to_record(r: &SqliteRow) -> Result<SignalRecord, sqlx::Error> {
    let raw_ts: Option<String> = r.try_get("timestamp")?;
    let timestamp = raw_ts
        .as_deref()
        .and_then(parse_timestamp)
        .ok_or_else(|| sqlx::Error::ColumnDecode {
            index: "timestamp".to_string(),
            source: format!("unrecognised timestamp {:?}", raw_ts).into(),
        })?;
    let text = |name: &str| -> Result<String, sqlx::Error> {
        Ok(r.try_get::<Option<String>, _>(name)?
            .unwrap_or_else(|| "N/A".to_string()))
    };

    Ok(SignalRecord {
        id: Some(r.try_get("id")?),
        timestamp,
        chart_signal: ChartSignal::from_stored(&text("chart_signal")?),
        signal: text("signal")?,
        confidence: text("confidence")?,
        candle_signal: text("candle_signal")?,
        candle_confidence: text("candle_confidence")?,
        source: text("source")?,
    })
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Accepts RFC 3339 and the naive `YYYY-MM-DDTHH:MM:SS` form other writers
/// of this table use; naive values are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}
