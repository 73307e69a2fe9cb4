use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sigtrade_core::*;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use uuid::Uuid;

/// Frames larger than this are treated as a corrupt stream.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// A request sent from the Rust client TO the bridge. The reply echoes `id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub id: Uuid,
    pub command: Command,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    /// Log into a trading account.
    Login {
        login: u64,
        password: String,
        server: String,
    },
    /// Terminal build / connection / AutoTrading state.
    TerminalInfo,
    /// Symbols matching a terminal glob (`*XAUUSD*`).
    SymbolsGet { pattern: String },
    /// Show a symbol in Market Watch.
    SymbolSelect { symbol: String },
    SymbolInfo { symbol: String },
    SymbolTick { symbol: String },
    AccountInfo,
    PositionsGet { symbol: Option<String> },
    OrdersGet { symbol: Option<String> },
    /// Send a trade request.
    OrderSend { request: WireOrderRequest },
    /// Replace SL/TP on an open position (0 clears a level).
    PositionModify { ticket: u64, sl: Decimal, tp: Decimal },
    OrderCalcMargin {
        symbol: String,
        order_type: u8,
        volume: Decimal,
        price: Decimal,
    },
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// A message received FROM the bridge. `id` is absent on unsolicited messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: Option<Uuid>,
    pub payload: Payload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Payload {
    /// First message after the socket opens.
    Connected { version: String },
    /// Generic success for requests without a result (login, select).
    Ack,
    TerminalInfo(TerminalInfo),
    Symbols { names: Vec<String> },
    SymbolInfo(WireSymbolInfo),
    Tick(WireTick),
    Account(AccountInfo),
    Positions { positions: Vec<WirePosition> },
    Orders { orders: Vec<WireOrder> },
    TradeResult(TradeResult),
    Margin { margin: Decimal },
    /// Request failed inside the terminal (`last_error()`).
    Error { code: i32, message: String },
}

impl Payload {
    pub fn kind(&self) -> &'static str {
        match self {
            Payload::Connected { .. } => "connected",
            Payload::Ack => "ack",
            Payload::TerminalInfo(_) => "terminal_info",
            Payload::Symbols { .. } => "symbols",
            Payload::SymbolInfo(_) => "symbol_info",
            Payload::Tick(_) => "tick",
            Payload::Account(_) => "account",
            Payload::Positions { .. } => "positions",
            Payload::Orders { .. } => "orders",
            Payload::TradeResult(_) => "trade_result",
            Payload::Margin { .. } => "margin",
            Payload::Error { .. } => "error",
        }
    }
}

// ---------------------------------------------------------------------------
// Wire records (MT5 conventions: integer enums, 0.0 for unset stops,
// epoch-second times)
// ---------------------------------------------------------------------------

pub const ORDER_TYPE_BUY: u8 = 0;
pub const ORDER_TYPE_SELL: u8 = 1;

pub fn side_to_wire(side: Side) -> u8 {
    match side {
        Side::Buy => ORDER_TYPE_BUY,
        Side::Sell => ORDER_TYPE_SELL,
    }
}

pub fn side_from_wire(value: u8) -> Option<Side> {
    match value {
        ORDER_TYPE_BUY => Some(Side::Buy),
        ORDER_TYPE_SELL => Some(Side::Sell),
        _ => None,
    }
}

fn level_to_wire(level: Option<Decimal>) -> Decimal {
    level.unwrap_or(Decimal::ZERO)
}

fn level_from_wire(level: Decimal) -> Option<Decimal> {
    if level.is_zero() {
        None
    } else {
        Some(level)
    }
}

fn time_from_wire(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap_or_default()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOrderRequest {
    pub symbol: String,
    pub volume: Decimal,
    #[serde(rename = "type")]
    pub order_type: u8,
    pub price: Decimal,
    pub sl: Decimal,
    pub tp: Decimal,
    pub deviation: u32,
    pub magic: u64,
    pub comment: String,
    /// 0 = FOK, 1 = IOC, 2 = RETURN.
    pub type_filling: u8,
    /// Ticket of the position to close, 0 when opening.
    pub position: u64,
}

impl From<&MarketOrderRequest> for WireOrderRequest {
    fn from(req: &MarketOrderRequest) -> Self {
        Self {
            symbol: req.symbol.clone(),
            volume: req.volume,
            order_type: side_to_wire(req.side),
            price: req.price,
            sl: level_to_wire(req.sl),
            tp: level_to_wire(req.tp),
            deviation: req.deviation,
            magic: req.magic,
            comment: req.comment.chars().take(MAX_COMMENT_LEN).collect(),
            type_filling: match req.filling {
                FillPolicy::Fok => 0,
                FillPolicy::Ioc => 1,
                FillPolicy::Return => 2,
            },
            position: req.position.unwrap_or(0),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireSymbolInfo {
    pub name: String,
    pub digits: u32,
    pub visible: bool,
    /// SYMBOL_TRADE_MODE_*: 0 disabled, 1 long only, 2 short only,
    /// 3 close only, 4 full.
    pub trade_mode: u8,
    pub volume_min: Decimal,
    pub volume_max: Decimal,
    pub volume_step: Decimal,
    pub trade_contract_size: Decimal,
}

impl From<WireSymbolInfo> for SymbolInfo {
    fn from(w: WireSymbolInfo) -> Self {
        Self {
            name: w.name,
            digits: w.digits,
            visible: w.visible,
            trade_mode: match w.trade_mode {
                1 => TradeMode::LongOnly,
                2 => TradeMode::ShortOnly,
                3 => TradeMode::CloseOnly,
                4 => TradeMode::Full,
                _ => TradeMode::Disabled,
            },
            volume_min: w.volume_min,
            volume_max: w.volume_max,
            volume_step: w.volume_step,
            contract_size: w.trade_contract_size,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTick {
    pub time: i64,
    pub bid: Decimal,
    pub ask: Decimal,
}

impl WireTick {
    pub fn into_tick(self, symbol: &str) -> Tick {
        Tick {
            symbol: symbol.to_string(),
            time: time_from_wire(self.time),
            bid: self.bid,
            ask: self.ask,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WirePosition {
    pub ticket: u64,
    pub symbol: String,
    /// POSITION_TYPE_BUY (0) / POSITION_TYPE_SELL (1).
    #[serde(rename = "type")]
    pub position_type: u8,
    pub volume: Decimal,
    pub price_open: Decimal,
    pub sl: Decimal,
    pub tp: Decimal,
    pub profit: Decimal,
    pub magic: u64,
    pub comment: String,
    pub time: i64,
}

impl TryFrom<WirePosition> for TerminalPosition {
    type Error = BrokerError;

    fn try_from(w: WirePosition) -> Result<Self, Self::Error> {
        let side = side_from_wire(w.position_type).ok_or_else(|| {
            BrokerError::Other(format!("Unknown position type {} on #{}", w.position_type, w.ticket))
        })?;
        Ok(Self {
            ticket: w.ticket,
            symbol: w.symbol,
            side,
            volume: w.volume,
            price_open: w.price_open,
            sl: level_from_wire(w.sl),
            tp: level_from_wire(w.tp),
            profit: w.profit,
            magic: w.magic,
            comment: w.comment,
            opened_at: time_from_wire(w.time),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireOrder {
    pub ticket: u64,
    pub symbol: String,
    /// ORDER_TYPE_*; even values are buy-side, odd values sell-side.
    #[serde(rename = "type")]
    pub order_type: u8,
    pub volume_current: Decimal,
    pub price_open: Decimal,
    pub magic: u64,
    pub comment: String,
}

impl From<WireOrder> for PendingOrder {
    fn from(w: WireOrder) -> Self {
        Self {
            ticket: w.ticket,
            symbol: w.symbol,
            side: if w.order_type % 2 == 0 { Side::Buy } else { Side::Sell },
            volume: w.volume_current,
            price: w.price_open,
            magic: w.magic,
            comment: w.comment,
        }
    }
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

/// Frame a message with a 4-byte length prefix (big-endian).
pub fn frame_message(msg: &[u8]) -> Vec<u8> {
    let len = msg.len() as u32;
    let mut framed = Vec::with_capacity(4 + msg.len());
    framed.extend_from_slice(&len.to_be_bytes());
    framed.extend_from_slice(msg);
    framed
}

/// Serialize and write one framed JSON message.
pub async fn write_json<W, T>(writer: &mut W, msg: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(msg)?;
    writer.write_all(&frame_message(&body)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed JSON message.
pub async fn read_json<R, T>(reader: &mut R) -> Result<T, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: for<'de> Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(serde_json::from_slice(&body)?)
}
