use crate::models::*;
use crate::signal::ChartSignal;
use async_trait::async_trait;
use rust_decimal::Decimal;

// ---------------------------------------------------------------------------
// Trading Terminal Trait
// ---------------------------------------------------------------------------

/// Errors that can occur during terminal operations.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Login failed: {0}")]
    LoginFailed(String),
    #[error("Trading disabled: {0}")]
    TradingDisabled(String),
    #[error("Symbol not found: {0}")]
    SymbolNotFound(String),
    #[error("No tick data for {0}")]
    NoTick(String),
    #[error("Position not found: {0}")]
    PositionNotFound(u64),
    #[error("Order rejected (retcode {retcode}): {message}")]
    OrderRejected { retcode: u32, message: String },
    #[error("Broker error: {0}")]
    Other(String),
}

/// A MetaTrader-style trading terminal.
///
/// Positions and orders are addressed by numeric ticket; trade sets are
/// identified by the magic number and comment on each leg.
#[async_trait]
pub trait TradingTerminal: Send + Sync {
    /// Initialise the terminal session, log in, and require that
    /// automated trading is enabled.
    async fn connect(&mut self) -> Result<TerminalInfo, BrokerError>;

    /// Tear down the session.
    async fn disconnect(&mut self) -> Result<(), BrokerError>;

    fn is_connected(&self) -> bool;

    /// Symbol names matching a terminal glob such as `*XAUUSD*`.
    async fn symbols(&mut self, pattern: &str) -> Result<Vec<String>, BrokerError>;

    /// Show a symbol in Market Watch so its ticks are available.
    async fn select_symbol(&mut self, symbol: &str) -> Result<(), BrokerError>;

    async fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo, BrokerError>;

    async fn tick(&mut self, symbol: &str) -> Result<Tick, BrokerError>;

    async fn account(&mut self) -> Result<AccountInfo, BrokerError>;

    /// Open positions, optionally restricted to one symbol.
    async fn positions(&mut self, symbol: Option<&str>) -> Result<Vec<TerminalPosition>, BrokerError>;

    /// Working orders, optionally restricted to one symbol.
    async fn orders(&mut self, symbol: Option<&str>) -> Result<Vec<PendingOrder>, BrokerError>;

    /// Send a market deal. A reply whose retcode is not "done" is returned as
    /// `BrokerError::OrderRejected`.
    async fn send_order(&mut self, request: &MarketOrderRequest) -> Result<TradeResult, BrokerError>;

    /// Replace the stop-loss / take-profit of an open position.
    async fn modify_stops(
        &mut self,
        ticket: u64,
        sl: Option<Decimal>,
        tp: Option<Decimal>,
    ) -> Result<TradeResult, BrokerError>;

    /// Margin required to open `volume` lots at `price`.
    async fn calc_margin(
        &mut self,
        symbol: &str,
        side: Side,
        volume: Decimal,
        price: Decimal,
    ) -> Result<Decimal, BrokerError>;

    /// Find the first symbol matching `pattern` that is fully tradeable,
    /// selecting hidden symbols along the way.
    async fn find_tradeable_symbol(&mut self, pattern: &str) -> Result<String, BrokerError> {
        for name in self.symbols(pattern).await? {
            let mut info = match self.symbol_info(&name).await {
                Ok(info) => info,
                Err(_) => continue,
            };
            if !info.visible {
                self.select_symbol(&name).await?;
                info = self.symbol_info(&name).await?;
            }
            if info.is_tradeable() {
                tracing::info!(symbol = %name, "Found tradeable symbol");
                return Ok(name);
            }
        }
        Err(BrokerError::SymbolNotFound(pattern.to_string()))
    }

    /// Close a position with an opposite market deal at the current price.
    async fn close_position(
        &mut self,
        position: &TerminalPosition,
        deviation: u32,
        comment: &str,
    ) -> Result<TradeResult, BrokerError> {
        let tick = self.tick(&position.symbol).await?;
        let request = MarketOrderRequest::close(position, tick.exit_price(position.side))
            .with_deviation(deviation)
            .with_tag(position.magic, comment);
        self.send_order(&request).await
    }
}

// ---------------------------------------------------------------------------
// Signal Source Trait
// ---------------------------------------------------------------------------

/// Errors that can occur while reading or writing local signal data.
#[derive(Debug, thiserror::Error)]
pub enum DataError {
    #[error("Data not found: {0}")]
    NotFound(String),
    #[error("Parse error: {0}")]
    ParseError(String),
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Database error: {0}")]
    DatabaseError(String),
}

/// Provides the authoritative (latest) chart signal to the trader.
#[async_trait]
pub trait SignalSource: Send + Sync {
    /// Latest `chart_signal`, or `None` when nothing has been recorded yet.
    async fn latest_chart_signal(&self) -> Result<Option<ChartSignal>, DataError>;
}
