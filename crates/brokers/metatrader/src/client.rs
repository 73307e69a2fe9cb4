use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sigtrade_core::*;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::protocol::*;

/// Configuration for connecting to the MetaTrader 5 bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaTraderConfig {
    /// Host address (e.g. "127.0.0.1").
    pub host: String,
    /// Port the bridge is listening on.
    pub port: u16,
    /// Account to log into. When unset the terminal's current session is used.
    pub login: Option<u64>,
    pub password: Option<String>,
    pub server: Option<String>,
    /// How long to wait for each reply.
    pub request_timeout_secs: u64,
}

impl Default for MetaTraderConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5556,
            login: None,
            password: None,
            server: None,
            request_timeout_secs: 15,
        }
    }
}

/// MetaTrader 5 terminal adapter.
///
/// Each call is a request/reply exchange with the bridge over one TCP
/// connection. Replies carry the request id; anything else read while
/// waiting is logged and dropped.
pub struct MetaTraderTerminal {
    config: MetaTraderConfig,
    stream: Option<TcpStream>,
    connected: bool,
}

impl MetaTraderTerminal {
    pub fn new(config: MetaTraderConfig) -> Self {
        Self {
            config,
            stream: None,
            connected: false,
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.config.request_timeout_secs.max(1))
    }

    fn stream(&mut self) -> Result<&mut TcpStream, BrokerError> {
        self.stream
            .as_mut()
            .ok_or_else(|| BrokerError::ConnectionFailed("Not connected".to_string()))
    }

    /// Forget the connection. A frame may have been read only in part, so
    /// the stream cannot be reused.
    fn drop_stream(&mut self) {
        self.stream = None;
        self.connected = false;
    }

    async fn recv(&mut self) -> Result<InboundMessage, BrokerError> {
        let timeout = self.timeout();
        let stream = self.stream()?;
        let result = tokio::time::timeout(timeout, read_json::<_, InboundMessage>(stream)).await;
        match result {
            Ok(Ok(msg)) => Ok(msg),
            // The whole frame was consumed; the stream is still aligned.
            Ok(Err(ProtocolError::Json(e))) => {
                Err(BrokerError::Other(format!("Deserialization error: {}", e)))
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Bridge read failed, dropping connection");
                self.drop_stream();
                Err(BrokerError::ConnectionFailed(format!("Read error: {}", e)))
            }
            Err(_) => {
                warn!(timeout_secs = timeout.as_secs(), "Bridge reply timed out, dropping connection");
                self.drop_stream();
                Err(BrokerError::ConnectionFailed(format!(
                    "No reply within {}s",
                    timeout.as_secs()
                )))
            }
        }
    }

    /// Send `command` and return the matching reply payload as-is.
    async fn exchange(&mut self, command: Command) -> Result<Payload, BrokerError> {
        let request = Request {
            id: Uuid::new_v4(),
            command,
        };
        let stream = self.stream()?;
        if let Err(e) = write_json(stream, &request).await {
            self.drop_stream();
            return Err(BrokerError::ConnectionFailed(format!("Write error: {}", e)));
        }

        loop {
            let msg = self.recv().await?;
            if msg.id == Some(request.id) {
                return Ok(msg.payload);
            }
            debug!(kind = msg.payload.kind(), "Dropping unrelated bridge message");
        }
    }

    /// Like `exchange`, with terminal-side errors mapped to `BrokerError`.
    async fn request(&mut self, command: Command) -> Result<Payload, BrokerError> {
        match self.exchange(command).await? {
            Payload::Error { code, message } => {
                Err(BrokerError::Other(format!("{} (code {})", message, code)))
            }
            payload => Ok(payload),
        }
    }

    fn check_trade(result: TradeResult) -> Result<TradeResult, BrokerError> {
        if result.is_done() {
            Ok(result)
        } else {
            Err(BrokerError::OrderRejected {
                retcode: result.retcode,
                message: result.comment,
            })
        }
    }
}

fn unexpected(expected: &str, payload: &Payload) -> BrokerError {
    BrokerError::Other(format!(
        "Expected {} reply, got {}",
        expected,
        payload.kind()
    ))
}

#[async_trait]
impl TradingTerminal for MetaTraderTerminal {
    async fn connect(&mut self) -> Result<TerminalInfo, BrokerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to MetaTrader at {}", addr);

        let stream = TcpStream::connect(&addr)
            .await
            .map_err(|e| BrokerError::ConnectionFailed(format!("TCP connect failed: {}", e)))?;
        self.stream = Some(stream);

        // The bridge announces itself before accepting requests
        match self.recv().await?.payload {
            Payload::Connected { version } => {
                info!("Connected to MetaTrader bridge v{}", version);
            }
            Payload::Error { message, .. } => {
                self.stream = None;
                return Err(BrokerError::ConnectionFailed(message));
            }
            other => {
                self.stream = None;
                return Err(BrokerError::ConnectionFailed(format!(
                    "Unexpected initial message: {}",
                    other.kind()
                )));
            }
        }

        if let Some(login) = self.config.login {
            let command = Command::Login {
                login,
                password: self.config.password.clone().unwrap_or_default(),
                server: self.config.server.clone().unwrap_or_default(),
            };
            match self.exchange(command).await? {
                Payload::Ack => info!(login, "Logged in"),
                Payload::Error { code, message } => {
                    self.stream = None;
                    return Err(BrokerError::LoginFailed(format!("{} (code {})", message, code)));
                }
                other => return Err(unexpected("ack", &other)),
            }
        }

        let terminal = match self.request(Command::TerminalInfo).await? {
            Payload::TerminalInfo(info) => info,
            other => return Err(unexpected("terminal_info", &other)),
        };
        if !terminal.trade_allowed {
            warn!("AutoTrading is disabled in the terminal");
            self.stream = None;
            return Err(BrokerError::TradingDisabled(
                "enable AutoTrading in the MT5 terminal".to_string(),
            ));
        }

        self.connected = true;
        Ok(terminal)
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.connected = false;
        info!("Disconnected from MetaTrader");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn symbols(&mut self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        match self
            .request(Command::SymbolsGet {
                pattern: pattern.to_string(),
            })
            .await?
        {
            Payload::Symbols { names } => Ok(names),
            other => Err(unexpected("symbols", &other)),
        }
    }

    async fn select_symbol(&mut self, symbol: &str) -> Result<(), BrokerError> {
        match self
            .request(Command::SymbolSelect {
                symbol: symbol.to_string(),
            })
            .await?
        {
            Payload::Ack => Ok(()),
            other => Err(unexpected("ack", &other)),
        }
    }

    async fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo, BrokerError> {
        match self
            .exchange(Command::SymbolInfo {
                symbol: symbol.to_string(),
            })
            .await?
        {
            Payload::SymbolInfo(info) => Ok(info.into()),
            Payload::Error { .. } => Err(BrokerError::SymbolNotFound(symbol.to_string())),
            other => Err(unexpected("symbol_info", &other)),
        }
    }

    async fn tick(&mut self, symbol: &str) -> Result<Tick, BrokerError> {
        match self
            .exchange(Command::SymbolTick {
                symbol: symbol.to_string(),
            })
            .await?
        {
            Payload::Tick(tick) => Ok(tick.into_tick(symbol)),
            Payload::Error { .. } => Err(BrokerError::NoTick(symbol.to_string())),
            other => Err(unexpected("tick", &other)),
        }
    }

    async fn account(&mut self) -> Result<AccountInfo, BrokerError> {
        match self.request(Command::AccountInfo).await? {
            Payload::Account(account) => Ok(account),
            other => Err(unexpected("account", &other)),
        }
    }

    async fn positions(&mut self, symbol: Option<&str>) -> Result<Vec<TerminalPosition>, BrokerError> {
        match self
            .request(Command::PositionsGet {
                symbol: symbol.map(str::to_string),
            })
            .await?
        {
            Payload::Positions { positions } => positions
                .into_iter()
                .map(TerminalPosition::try_from)
                .collect(),
            other => Err(unexpected("positions", &other)),
        }
    }

    async fn orders(&mut self, symbol: Option<&str>) -> Result<Vec<PendingOrder>, BrokerError> {
        match self
            .request(Command::OrdersGet {
                symbol: symbol.map(str::to_string),
            })
            .await?
        {
            Payload::Orders { orders } => Ok(orders.into_iter().map(PendingOrder::from).collect()),
            other => Err(unexpected("orders", &other)),
        }
    }

    async fn send_order(&mut self, request: &MarketOrderRequest) -> Result<TradeResult, BrokerError> {
        let wire = WireOrderRequest::from(request);
        match self.request(Command::OrderSend { request: wire }).await? {
            Payload::TradeResult(result) => Self::check_trade(result),
            other => Err(unexpected("trade_result", &other)),
        }
    }

    async fn modify_stops(
        &mut self,
        ticket: u64,
        sl: Option<Decimal>,
        tp: Option<Decimal>,
    ) -> Result<TradeResult, BrokerError> {
        let command = Command::PositionModify {
            ticket,
            sl: sl.unwrap_or(Decimal::ZERO),
            tp: tp.unwrap_or(Decimal::ZERO),
        };
        match self.request(command).await? {
            Payload::TradeResult(result) => Self::check_trade(result),
            other => Err(unexpected("trade_result", &other)),
        }
    }

    async fn calc_margin(
        &mut self,
        symbol: &str,
        side: Side,
        volume: Decimal,
        price: Decimal,
    ) -> Result<Decimal, BrokerError> {
        let command = Command::OrderCalcMargin {
            symbol: symbol.to_string(),
            order_type: side_to_wire(side),
            volume,
            price,
        };
        match self.request(command).await? {
            Payload::Margin { margin } => Ok(margin),
            other => Err(unexpected("margin", &other)),
        }
    }
}
