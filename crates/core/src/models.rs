use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Direction
// ---------------------------------------------------------------------------

/// Order / position direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }

    /// Upper-case label used in comment tags and the signal table.
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "BUY",
            Side::Sell => "SELL",
        }
    }

    /// Apply a price offset in this direction's favour (up for buys, down for sells).
    pub fn offset(&self, price: Decimal, distance: Decimal) -> Decimal {
        match self {
            Side::Buy => price + distance,
            Side::Sell => price - distance,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Symbols & Pricing
// ---------------------------------------------------------------------------

/// How a symbol may be traded on the terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TradeMode {
    Disabled,
    LongOnly,
    ShortOnly,
    CloseOnly,
    Full,
}

/// Static symbol properties as reported by the terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolInfo {
    pub name: String,
    /// Number of decimal places in quoted prices.
    pub digits: u32,
    pub visible: bool,
    pub trade_mode: TradeMode,
    pub volume_min: Decimal,
    pub volume_max: Decimal,
    pub volume_step: Decimal,
    /// Units per 1.0 lot (100 for XAUUSD, 100_000 for FX majors).
    pub contract_size: Decimal,
}

impl SymbolInfo {
    pub fn is_tradeable(&self) -> bool {
        self.trade_mode == TradeMode::Full
    }

    pub fn pip_size(&self) -> Decimal {
        pip_size(&self.name)
    }

    /// Round a price to the symbol's quoted precision.
    pub fn round_price(&self, price: Decimal) -> Decimal {
        price.round_dp(self.digits)
    }

    /// Convert a pip distance into a price distance for this symbol.
    pub fn pips(&self, pips: Decimal) -> Decimal {
        pips * self.pip_size()
    }
}

/// Size of one pip for a symbol name.
///
/// JPY crosses quote to 2-3 decimals, metals to 2, everything else to 4-5.
pub fn pip_size(symbol: &str) -> Decimal {
    let upper = symbol.to_ascii_uppercase();
    if upper.contains("JPY") {
        Decimal::new(1, 2)
    } else if upper.contains("XAU") || upper.contains("XAG") {
        Decimal::new(1, 1)
    } else {
        Decimal::new(1, 4)
    }
}

/// Latest bid/ask for a symbol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tick {
    pub symbol: String,
    pub time: DateTime<Utc>,
    pub bid: Decimal,
    pub ask: Decimal,
}

impl Tick {
    /// Price a market order in `side` fills at.
    pub fn entry_price(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        }
    }

    /// Price a position of `side` is marked / closed at.
    pub fn exit_price(&self, side: Side) -> Decimal {
        match side {
            Side::Buy => self.bid,
            Side::Sell => self.ask,
        }
    }
}

// ---------------------------------------------------------------------------
// Positions & Orders
// ---------------------------------------------------------------------------

/// An open position on the terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalPosition {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub price_open: Decimal,
    /// `None` when no stop-loss is set (the terminal reports 0.0).
    pub sl: Option<Decimal>,
    pub tp: Option<Decimal>,
    /// Floating profit in account currency.
    pub profit: Decimal,
    pub magic: u64,
    pub comment: String,
    pub opened_at: DateTime<Utc>,
}

impl TerminalPosition {
    /// Favourable price movement since entry, in price units.
    pub fn favourable_move(&self, current: Decimal) -> Decimal {
        match self.side {
            Side::Buy => current - self.price_open,
            Side::Sell => self.price_open - current,
        }
    }
}

/// A working (not yet filled) order on the terminal.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingOrder {
    pub ticket: u64,
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub price: Decimal,
    pub magic: u64,
    pub comment: String,
}

/// Order filling policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum FillPolicy {
    Fok,
    #[default]
    Ioc,
    Return,
}

/// A market deal request (open, or close when `position` is set).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketOrderRequest {
    pub symbol: String,
    pub side: Side,
    pub volume: Decimal,
    pub price: Decimal,
    pub sl: Option<Decimal>,
    pub tp: Option<Decimal>,
    /// Maximum accepted slippage in points.
    pub deviation: u32,
    pub magic: u64,
    pub comment: String,
    pub filling: FillPolicy,
    /// Ticket of the position this deal closes.
    pub position: Option<u64>,
}

impl MarketOrderRequest {
    /// Create a new opening market order without stops or tags.
    pub fn open(symbol: &str, side: Side, volume: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            side,
            volume,
            price,
            sl: None,
            tp: None,
            deviation: 0,
            magic: 0,
            comment: String::new(),
            filling: FillPolicy::default(),
            position: None,
        }
    }

    /// Create the opposite deal that closes `position` at `price`.
    pub fn close(position: &TerminalPosition, price: Decimal) -> Self {
        Self {
            symbol: position.symbol.clone(),
            side: position.side.opposite(),
            volume: position.volume,
            price,
            sl: None,
            tp: None,
            deviation: 0,
            magic: position.magic,
            comment: String::new(),
            filling: FillPolicy::default(),
            position: Some(position.ticket),
        }
    }

    pub fn with_stops(mut self, sl: Option<Decimal>, tp: Option<Decimal>) -> Self {
        self.sl = sl;
        self.tp = tp;
        self
    }

    pub fn with_tag(mut self, magic: u64, comment: impl Into<String>) -> Self {
        self.magic = magic;
        self.comment = comment.into();
        self
    }

    pub fn with_deviation(mut self, deviation: u32) -> Self {
        self.deviation = deviation;
        self
    }
}

/// Request completed.
pub const RETCODE_DONE: u32 = 10009;
/// Request completed partially; the remainder was cancelled.
pub const RETCODE_DONE_REMAINDER: u32 = 10010;

/// Terminal reply to a trade request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeResult {
    pub retcode: u32,
    /// Ticket of the resulting order (0 when rejected).
    pub order: u64,
    pub volume: Decimal,
    pub price: Decimal,
    pub comment: String,
}

impl TradeResult {
    pub fn is_done(&self) -> bool {
        self.retcode == RETCODE_DONE || self.retcode == RETCODE_DONE_REMAINDER
    }
}

// ---------------------------------------------------------------------------
// Account
// ---------------------------------------------------------------------------

/// Snapshot of the trading account.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub login: u64,
    pub server: String,
    pub currency: String,
    pub balance: Decimal,
    pub equity: Decimal,
    pub profit: Decimal,
    pub margin: Decimal,
    pub margin_free: Decimal,
    pub leverage: u32,
}

/// Terminal-level state reported after login.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TerminalInfo {
    pub build: u32,
    pub connected: bool,
    /// The "AutoTrading" switch in the terminal.
    pub trade_allowed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_pip_size_by_symbol_family() {
        assert_eq!(pip_size("USDJPY"), dec!(0.01));
        assert_eq!(pip_size("XAUUSDm"), dec!(0.1));
        assert_eq!(pip_size("xagusd"), dec!(0.1));
        assert_eq!(pip_size("EURUSD"), dec!(0.0001));
    }

    #[test]
    fn test_tick_prices_by_side() {
        let tick = Tick {
            symbol: "XAUUSD".to_string(),
            time: Utc::now(),
            bid: dec!(2400.10),
            ask: dec!(2400.35),
        };
        assert_eq!(tick.entry_price(Side::Buy), dec!(2400.35));
        assert_eq!(tick.entry_price(Side::Sell), dec!(2400.10));
        assert_eq!(tick.exit_price(Side::Buy), dec!(2400.10));
        assert_eq!(tick.exit_price(Side::Sell), dec!(2400.35));
    }

    #[test]
    fn test_close_request_reverses_position() {
        let position = TerminalPosition {
            ticket: 42,
            symbol: "XAUUSD".to_string(),
            side: Side::Sell,
            volume: dec!(0.03),
            price_open: dec!(2401),
            sl: None,
            tp: Some(dec!(2394)),
            profit: Decimal::ZERO,
            magic: 2025,
            comment: "DB-Signal-SELL-0.03".to_string(),
            opened_at: Utc::now(),
        };
        let req = MarketOrderRequest::close(&position, dec!(2400.5));
        assert_eq!(req.side, Side::Buy);
        assert_eq!(req.volume, dec!(0.03));
        assert_eq!(req.position, Some(42));
        assert_eq!(position.favourable_move(dec!(2399)), dec!(2));
    }

    #[test]
    fn test_trade_result_done_codes() {
        let mut result = TradeResult {
            retcode: RETCODE_DONE,
            order: 1,
            volume: dec!(0.01),
            price: dec!(1),
            comment: String::new(),
        };
        assert!(result.is_done());
        result.retcode = RETCODE_DONE_REMAINDER;
        assert!(result.is_done());
        result.retcode = 10019;
        assert!(!result.is_done());
    }
}
