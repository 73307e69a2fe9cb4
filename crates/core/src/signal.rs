use crate::models::Side;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ---------------------------------------------------------------------------
// Chart Signal
// ---------------------------------------------------------------------------

/// Value of the `chart_signal` column / `Chart_signal` JSON key.
///
/// `ApiError` and `ResponseError` are sentinels the detector writes instead of
/// failing the cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ChartSignal {
    Buy,
    Sell,
    None,
    ApiError,
    ResponseError,
}

impl ChartSignal {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChartSignal::Buy => "BUY",
            ChartSignal::Sell => "SELL",
            ChartSignal::None => "None",
            ChartSignal::ApiError => "API_ERROR",
            ChartSignal::ResponseError => "RESPONSE_ERROR",
        }
    }

    /// Direction to trade, if the signal is actionable.
    pub fn side(&self) -> Option<Side> {
        match self {
            ChartSignal::Buy => Some(Side::Buy),
            ChartSignal::Sell => Some(Side::Sell),
            _ => None,
        }
    }

    pub fn is_actionable(&self) -> bool {
        self.side().is_some()
    }

    /// Parse a stored value. Unknown text reads as `None`.
    pub fn from_stored(value: &str) -> Self {
        match value.trim().to_ascii_uppercase().as_str() {
            "BUY" => ChartSignal::Buy,
            "SELL" => ChartSignal::Sell,
            "API_ERROR" => ChartSignal::ApiError,
            "RESPONSE_ERROR" => ChartSignal::ResponseError,
            _ => ChartSignal::None,
        }
    }

    /// Extract the signal token from a free-text model reply.
    ///
    /// A bare `A` / `Y` is the chart's buy / sell marker. Otherwise exactly one
    /// of the words BUY or SELL must appear; both or neither reads as `None`.
    pub fn from_model_reply(reply: &str) -> Self {
        let normalized = reply.trim().to_ascii_uppercase();
        let bare = normalized.trim_matches(|c: char| !c.is_ascii_alphanumeric() && c != '_');
        match bare {
            "A" | "BUY" => return ChartSignal::Buy,
            "Y" | "SELL" => return ChartSignal::Sell,
            _ => {}
        }

        let mut found: Option<ChartSignal> = None;
        for word in normalized.split(|c: char| !c.is_ascii_alphanumeric()) {
            let candidate = match word {
                "BUY" => ChartSignal::Buy,
                "SELL" => ChartSignal::Sell,
                _ => continue,
            };
            match found {
                Some(prev) if prev != candidate => return ChartSignal::None,
                _ => found = Some(candidate),
            }
        }
        found.unwrap_or(ChartSignal::None)
    }
}

impl std::fmt::Display for ChartSignal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<String> for ChartSignal {
    fn from(value: String) -> Self {
        ChartSignal::from_stored(&value)
    }
}

impl From<ChartSignal> for String {
    fn from(value: ChartSignal) -> Self {
        value.as_str().to_string()
    }
}

// ---------------------------------------------------------------------------
// Trade Set Tag
// ---------------------------------------------------------------------------

/// MT5 keeps at most this many characters of an order comment.
pub const MAX_COMMENT_LEN: usize = 31;

/// Comment tag shared by every leg of one trade set, e.g. `DB-Signal-BUY-0.02`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TradeSetTag {
    pub prefix: String,
    pub side: Side,
    /// Lot size the set was opened with. Absent on tags written before lot
    /// escalation was tracked.
    pub lot: Option<Decimal>,
}

impl TradeSetTag {
    /// Longest prefix whose tags still parse after comment truncation, for
    /// lots up to `999.99`.
    pub const MAX_PREFIX_LEN: usize = MAX_COMMENT_LEN - "-SELL-999.99".len();

    pub fn new(prefix: &str, side: Side, lot: Decimal) -> Self {
        Self {
            prefix: prefix.to_string(),
            side,
            lot: Some(lot),
        }
    }

    /// Parse a position/order comment written with `prefix`.
    pub fn parse(comment: &str, prefix: &str) -> Option<Self> {
        let rest = comment.trim().strip_prefix(prefix)?.strip_prefix('-')?;
        let mut parts = rest.splitn(2, '-');
        let side = match parts.next()? {
            "BUY" => Side::Buy,
            "SELL" => Side::Sell,
            _ => return None,
        };
        let lot = match parts.next() {
            Some(raw) => Some(Decimal::from_str(raw).ok()?),
            None => None,
        };
        Some(Self {
            prefix: prefix.to_string(),
            side,
            lot,
        })
    }
}

impl std::fmt::Display for TradeSetTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.lot {
            Some(lot) => write!(f, "{}-{}-{:.2}", self.prefix, self.side, lot),
            None => write!(f, "{}-{}", self.prefix, self.side),
        }
    }
}

// ---------------------------------------------------------------------------
// Signal History Row
// ---------------------------------------------------------------------------

/// One row of `signal_history`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    /// Assigned by the database on insert.
    pub id: Option<i64>,
    pub timestamp: DateTime<Utc>,
    pub chart_signal: ChartSignal,
    pub signal: String,
    pub confidence: String,
    pub candle_signal: String,
    pub candle_confidence: String,
    pub source: String,
}

impl SignalRecord {
    /// A chart-only row; the other analysis columns read `N/A`.
    pub fn chart(chart_signal: ChartSignal, source: &str) -> Self {
        Self {
            id: None,
            timestamp: Utc::now(),
            chart_signal,
            signal: "N/A".to_string(),
            confidence: "N/A".to_string(),
            candle_signal: "N/A".to_string(),
            candle_confidence: "N/A".to_string(),
            source: source.to_string(),
        }
    }
}
