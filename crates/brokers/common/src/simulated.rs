use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use sigtrade_core::*;
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::{debug, info};

/// Trade server returned "no money" / generic rejection in the simulator.
pub const RETCODE_REJECTED: u32 = 10006;

/// Configuration for the simulated terminal (paper trading and tests).
#[derive(Debug, Clone)]
pub struct SimulatedTerminalConfig {
    /// Starting account balance.
    pub initial_balance: Decimal,
    pub leverage: u32,
    pub login: u64,
    pub server: String,
    pub currency: String,
    /// State of the terminal's automated-trading switch.
    pub trade_allowed: bool,
    /// Symbols the terminal knows about.
    pub symbols: Vec<SymbolInfo>,
}

impl SimulatedTerminalConfig {
    /// Spot gold as most retail MT5 brokers quote it.
    pub fn xauusd() -> SymbolInfo {
        SymbolInfo {
            name: "XAUUSD".to_string(),
            digits: 2,
            visible: true,
            trade_mode: TradeMode::Full,
            volume_min: Decimal::new(1, 2),
            volume_max: Decimal::new(100, 0),
            volume_step: Decimal::new(1, 2),
            contract_size: Decimal::new(100, 0),
        }
    }
}

impl Default for SimulatedTerminalConfig {
    fn default() -> Self {
        Self {
            initial_balance: Decimal::new(10_000, 0),
            leverage: 100,
            login: 1,
            server: "Simulated".to_string(),
            currency: "USD".to_string(),
            trade_allowed: true,
            symbols: vec![Self::xauusd()],
        }
    }
}

/// An in-memory MetaTrader-like terminal.
///
/// Market deals fill immediately at the current bid/ask. Prices come from
/// `set_tick`, or from a queued path that advances one tick per `tick()` call
/// and then holds the last value.
pub struct SimulatedTerminal {
    config: SimulatedTerminalConfig,
    connected: bool,
    balance: Decimal,
    symbols: HashMap<String, SymbolInfo>,
    ticks: HashMap<String, Tick>,
    tick_paths: HashMap<String, VecDeque<Tick>>,
    positions: Vec<TerminalPosition>,
    orders: Vec<PendingOrder>,
    next_ticket: u64,
    /// Zero-based `send_order` call indices that will be rejected.
    reject_calls: HashSet<usize>,
    send_calls: usize,
    sent: Vec<MarketOrderRequest>,
    modifications: Vec<(u64, Option<Decimal>, Option<Decimal>)>,
}

impl SimulatedTerminal {
    pub fn new(config: SimulatedTerminalConfig) -> Self {
        let symbols = config
            .symbols
            .iter()
            .map(|s| (s.name.clone(), s.clone()))
            .collect();
        Self {
            balance: config.initial_balance,
            config,
            connected: false,
            symbols,
            ticks: HashMap::new(),
            tick_paths: HashMap::new(),
            positions: Vec::new(),
            orders: Vec::new(),
            next_ticket: 1000,
            reject_calls: HashSet::new(),
            send_calls: 0,
            sent: Vec::new(),
            modifications: Vec::new(),
        }
    }

    /// Set the current quote for a symbol.
    pub fn set_tick(&mut self, symbol: &str, bid: Decimal, ask: Decimal) {
        self.ticks.insert(
            symbol.to_string(),
            Tick {
                symbol: symbol.to_string(),
                time: Utc::now(),
                bid,
                ask,
            },
        );
    }

    /// Queue quotes that `tick()` will return one by one.
    pub fn queue_ticks(&mut self, symbol: &str, quotes: impl IntoIterator<Item = (Decimal, Decimal)>) {
        let path = self.tick_paths.entry(symbol.to_string()).or_default();
        for (bid, ask) in quotes {
            path.push_back(Tick {
                symbol: symbol.to_string(),
                time: Utc::now(),
                bid,
                ask,
            });
        }
    }

    /// Reject the `n`th (zero-based) `send_order` call from now on.
    pub fn reject_send(&mut self, n: usize) {
        self.reject_calls.insert(self.send_calls + n);
    }

    /// Seed an already-open position; returns its ticket.
    pub fn insert_position(&mut self, mut position: TerminalPosition) -> u64 {
        if position.ticket == 0 {
            position.ticket = self.allocate_ticket();
        }
        let ticket = position.ticket;
        self.positions.push(position);
        ticket
    }

    pub fn insert_order(&mut self, mut order: PendingOrder) -> u64 {
        if order.ticket == 0 {
            order.ticket = self.allocate_ticket();
        }
        let ticket = order.ticket;
        self.orders.push(order);
        ticket
    }

    /// Drop every position on `symbol` as if their take-profits were hit.
    pub fn hit_all_targets(&mut self, symbol: &str) {
        let (closed, open): (Vec<_>, Vec<_>) = self
            .positions
            .drain(..)
            .partition(|p| p.symbol == symbol);
        for p in &closed {
            if let Some(tp) = p.tp {
                self.balance += self.pnl(p, tp);
            }
        }
        self.positions = open;
    }

    /// Every request that reached `send_order`, accepted or not.
    pub fn sent_orders(&self) -> &[MarketOrderRequest] {
        &self.sent
    }

    /// `(ticket, sl, tp)` for each accepted stop modification.
    pub fn stop_modifications(&self) -> &[(u64, Option<Decimal>, Option<Decimal>)] {
        &self.modifications
    }

    pub fn open_positions(&self) -> &[TerminalPosition] {
        &self.positions
    }

    fn allocate_ticket(&mut self) -> u64 {
        self.next_ticket += 1;
        self.next_ticket
    }

    fn current_tick(&self, symbol: &str) -> Result<&Tick, BrokerError> {
        self.ticks
            .get(symbol)
            .ok_or_else(|| BrokerError::NoTick(symbol.to_string()))
    }

    fn contract_size(&self, symbol: &str) -> Decimal {
        self.symbols
            .get(symbol)
            .map(|s| s.contract_size)
            .unwrap_or(Decimal::ONE)
    }

    fn pnl(&self, position: &TerminalPosition, exit_price: Decimal) -> Decimal {
        position.favourable_move(exit_price) * position.volume * self.contract_size(&position.symbol)
    }

    fn floating_profit(&self, position: &TerminalPosition) -> Decimal {
        match self.ticks.get(&position.symbol) {
            Some(tick) => self.pnl(position, tick.exit_price(position.side)),
            None => Decimal::ZERO,
        }
    }

    fn require_connected(&self) -> Result<(), BrokerError> {
        if self.connected {
            Ok(())
        } else {
            Err(BrokerError::ConnectionFailed("Not connected".to_string()))
        }
    }

    fn rejection(retcode: u32, message: &str) -> BrokerError {
        BrokerError::OrderRejected {
            retcode,
            message: message.to_string(),
        }
    }
}

#[async_trait]
impl TradingTerminal for SimulatedTerminal {
    async fn connect(&mut self) -> Result<TerminalInfo, BrokerError> {
        if !self.config.trade_allowed {
            return Err(BrokerError::TradingDisabled(
                "AutoTrading is disabled in the terminal".to_string(),
            ));
        }
        self.connected = true;
        info!(login = self.config.login, server = %self.config.server, "Simulated terminal ready");
        Ok(TerminalInfo {
            build: 0,
            connected: true,
            trade_allowed: self.config.trade_allowed,
        })
    }

    async fn disconnect(&mut self) -> Result<(), BrokerError> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn symbols(&mut self, pattern: &str) -> Result<Vec<String>, BrokerError> {
        let needle = pattern.trim_matches('*');
        let mut names: Vec<String> = self
            .symbols
            .keys()
            .filter(|name| name.contains(needle))
            .cloned()
            .collect();
        names.sort();
        Ok(names)
    }

    async fn select_symbol(&mut self, symbol: &str) -> Result<(), BrokerError> {
        let info = self
            .symbols
            .get_mut(symbol)
            .ok_or_else(|| BrokerError::SymbolNotFound(symbol.to_string()))?;
        info.visible = true;
        Ok(())
    }

    async fn symbol_info(&mut self, symbol: &str) -> Result<SymbolInfo, BrokerError> {
        self.symbols
            .get(symbol)
            .cloned()
            .ok_or_else(|| BrokerError::SymbolNotFound(symbol.to_string()))
    }

    async fn tick(&mut self, symbol: &str) -> Result<Tick, BrokerError> {
        if let Some(next) = self.tick_paths.get_mut(symbol).and_then(|p| p.pop_front()) {
            self.ticks.insert(symbol.to_string(), next);
        }
        self.current_tick(symbol).cloned()
    }

    async fn account(&mut self) -> Result<AccountInfo, BrokerError> {
        let profit: Decimal = self.positions.iter().map(|p| self.floating_profit(p)).sum();
        let margin: Decimal = self
            .positions
            .iter()
            .map(|p| {
                p.volume * self.contract_size(&p.symbol) * p.price_open
                    / Decimal::from(self.config.leverage.max(1))
            })
            .sum();
        let equity = self.balance + profit;
        Ok(AccountInfo {
            login: self.config.login,
            server: self.config.server.clone(),
            currency: self.config.currency.clone(),
            balance: self.balance,
            equity,
            profit,
            margin,
            margin_free: equity - margin,
            leverage: self.config.leverage,
        })
    }

    async fn positions(&mut self, symbol: Option<&str>) -> Result<Vec<TerminalPosition>, BrokerError> {
        Ok(self
            .positions
            .iter()
            .filter(|p| symbol.map_or(true, |s| p.symbol == s))
            .map(|p| TerminalPosition {
                profit: self.floating_profit(p),
                ..p.clone()
            })
            .collect())
    }

    async fn orders(&mut self, symbol: Option<&str>) -> Result<Vec<PendingOrder>, BrokerError> {
        Ok(self
            .orders
            .iter()
            .filter(|o| symbol.map_or(true, |s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn send_order(&mut self, request: &MarketOrderRequest) -> Result<TradeResult, BrokerError> {
        self.require_connected()?;
        let call = self.send_calls;
        self.send_calls += 1;
        self.sent.push(request.clone());

        if self.reject_calls.remove(&call) {
            return Err(Self::rejection(RETCODE_REJECTED, "Request rejected"));
        }
        if !self.symbols.contains_key(&request.symbol) {
            return Err(BrokerError::SymbolNotFound(request.symbol.clone()));
        }
        let fill_price = self.current_tick(&request.symbol)?.entry_price(request.side);

        match request.position {
            Some(ticket) => {
                let index = self
                    .positions
                    .iter()
                    .position(|p| p.ticket == ticket)
                    .ok_or(BrokerError::PositionNotFound(ticket))?;
                let position = self.positions.remove(index);
                self.balance += self.pnl(&position, fill_price);
                debug!(ticket, price = %fill_price, "Simulated close");
            }
            None => {
                let ticket = self.allocate_ticket();
                self.positions.push(TerminalPosition {
                    ticket,
                    symbol: request.symbol.clone(),
                    side: request.side,
                    volume: request.volume,
                    price_open: fill_price,
                    sl: request.sl,
                    tp: request.tp,
                    profit: Decimal::ZERO,
                    magic: request.magic,
                    comment: request.comment.clone(),
                    opened_at: Utc::now(),
                });
                debug!(ticket, side = %request.side, price = %fill_price, "Simulated fill");
            }
        }

        Ok(TradeResult {
            retcode: RETCODE_DONE,
            order: self.next_ticket,
            volume: request.volume,
            price: fill_price,
            comment: "Request executed".to_string(),
        })
    }

    async fn modify_stops(
        &mut self,
        ticket: u64,
        sl: Option<Decimal>,
        tp: Option<Decimal>,
    ) -> Result<TradeResult, BrokerError> {
        self.require_connected()?;
        let position = self
            .positions
            .iter_mut()
            .find(|p| p.ticket == ticket)
            .ok_or(BrokerError::PositionNotFound(ticket))?;
        position.sl = sl;
        position.tp = tp;
        let volume = position.volume;
        self.modifications.push((ticket, sl, tp));

        Ok(TradeResult {
            retcode: RETCODE_DONE,
            order: 0,
            volume,
            price: Decimal::ZERO,
            comment: "Request executed".to_string(),
        })
    }

    async fn calc_margin(
        &mut self,
        symbol: &str,
        _side: Side,
        volume: Decimal,
        price: Decimal,
    ) -> Result<Decimal, BrokerError> {
        if !self.symbols.contains_key(symbol) {
            return Err(BrokerError::SymbolNotFound(symbol.to_string()));
        }
        Ok(volume * self.contract_size(symbol) * price / Decimal::from(self.config.leverage.max(1)))
    }
}
