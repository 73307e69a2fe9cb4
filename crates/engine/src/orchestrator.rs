use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sigtrade_core::*;
use sigtrade_data::LotTracker;
use tracing::{error, info, warn};

use crate::EngineError;

/// Trade-set parameters.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Terminal glob used to locate the traded symbol.
    pub symbol_pattern: String,
    pub magic: u64,
    /// Maximum slippage in points.
    pub deviation: u32,
    /// One leg per entry, each with its own take-profit distance.
    pub tp_pips: Vec<Decimal>,
    /// Stop-loss distance shared by every leg; `None` opens without a stop.
    pub stop_loss_pips: Option<Decimal>,
    pub comment_prefix: String,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            symbol_pattern: "*XAUUSD*".to_string(),
            magic: 2025,
            deviation: 30,
            tp_pips: [70, 100, 150, 200, 300].into_iter().map(Decimal::from).collect(),
            stop_loss_pips: None,
            comment_prefix: "DB-Signal".to_string(),
        }
    }
}

impl OrchestratorConfig {
    /// Reject settings that would make our own legs unrecognisable.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.comment_prefix.chars().count() > TradeSetTag::MAX_PREFIX_LEN {
            return Err(EngineError::InvalidConfig(format!(
                "comment_prefix {:?} is longer than {} characters",
                self.comment_prefix,
                TradeSetTag::MAX_PREFIX_LEN
            )));
        }
        if self.tp_pips.is_empty() {
            return Err(EngineError::InvalidConfig("tp_pips is empty".to_string()));
        }
        Ok(())
    }
}

/// A trade set opened by one cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenedSet {
    pub symbol: String,
    pub side: Side,
    pub lot: Decimal,
    /// Order tickets of the legs that were accepted.
    pub opened: Vec<u64>,
    pub failed: usize,
    pub closed_opposing: usize,
}

/// Result of one `run_cycle`.
#[derive(Debug, Clone, PartialEq)]
pub enum CycleOutcome {
    /// No row yet, or the latest row is not BUY/SELL.
    NoSignal { signal: Option<ChartSignal> },
    /// A set for this direction is already on the book.
    AlreadyActive { symbol: String, side: Side },
    Opened(OpenedSet),
}

impl CycleOutcome {
    /// Symbol and direction whose legs should be monitored after the cycle.
    pub fn monitor_target(&self) -> Option<(&str, Side)> {
        match self {
            CycleOutcome::NoSignal { .. } => None,
            CycleOutcome::AlreadyActive { symbol, side } => Some((symbol, *side)),
            CycleOutcome::Opened(set) => Some((&set.symbol, set.side)),
        }
    }
}

/// Turns the latest chart signal into at most one open trade set.
pub struct Orchestrator {
    config: OrchestratorConfig,
    lots: LotTracker,
}

impl Orchestrator {
    pub fn new(config: OrchestratorConfig, lots: LotTracker) -> Self {
        Self { config, lots }
    }

    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    pub fn lots(&self) -> &LotTracker {
        &self.lots
    }

    /// Trade-set tag of a leg we own, if `magic` and `comment` are ours.
    pub fn tag_of(&self, magic: u64, comment: &str) -> Option<TradeSetTag> {
        if magic != self.config.magic {
            return None;
        }
        TradeSetTag::parse(comment, &self.config.comment_prefix)
    }

    /// Read the latest signal and act on it.
    pub async fn run_cycle(
        &self,
        terminal: &mut dyn TradingTerminal,
        signals: &dyn SignalSource,
    ) -> Result<CycleOutcome, EngineError> {
        let signal = signals.latest_chart_signal().await?;
        let side = match signal.and_then(|s| s.side()) {
            Some(side) => side,
            None => {
                info!(signal = ?signal, "No actionable signal");
                return Ok(CycleOutcome::NoSignal { signal });
            }
        };
        info!(%side, "Latest signal");

        let symbol = terminal
            .find_tradeable_symbol(&self.config.symbol_pattern)
            .await?;
        self.execute(terminal, &symbol, side).await
    }

    /// Close opposing legs and open a new set for `side` unless one is active.
    pub async fn execute(
        &self,
        terminal: &mut dyn TradingTerminal,
        symbol: &str,
        side: Side,
    ) -> Result<CycleOutcome, EngineError> {
        let positions = terminal.positions(Some(symbol)).await?;
        let orders = terminal.orders(Some(symbol)).await?;

        let active = positions
            .iter()
            .map(|p| (p.magic, p.comment.as_str()))
            .chain(orders.iter().map(|o| (o.magic, o.comment.as_str())))
            .filter_map(|(magic, comment)| self.tag_of(magic, comment))
            .any(|tag| tag.side == side);
        if active {
            info!(%symbol, %side, "Existing trade set still open, waiting for it to close");
            return Ok(CycleOutcome::AlreadyActive {
                symbol: symbol.to_string(),
                side,
            });
        }

        let closed_opposing = self.close_opposing(terminal, &positions, side).await;

        let all_closed = self.our_legs(terminal, symbol).await? == 0;
        let lot = self.lots.next_lot(all_closed)?;

        let info = terminal.symbol_info(symbol).await?;
        let tick = terminal.tick(symbol).await?;
        let price = tick.entry_price(side);
        let sl = self
            .config
            .stop_loss_pips
            .map(|pips| info.round_price(side.opposite().offset(price, info.pips(pips))));
        let tag = TradeSetTag::new(&self.config.comment_prefix, side, lot).to_string();

        info!(
            %symbol,
            %side,
            %lot,
            %price,
            legs = self.config.tp_pips.len(),
            "Opening trade set"
        );

        let mut opened = Vec::new();
        let mut failed = 0;
        for (leg, pips) in self.config.tp_pips.iter().enumerate() {
            let tp = info.round_price(side.offset(price, info.pips(*pips)));
            let request = MarketOrderRequest::open(symbol, side, lot, price)
                .with_stops(sl, Some(tp))
                .with_deviation(self.config.deviation)
                .with_tag(self.config.magic, tag.clone());
            match terminal.send_order(&request).await {
                Ok(result) => {
                    info!(leg = leg + 1, %tp, ticket = result.order, "Leg opened");
                    opened.push(result.order);
                }
                Err(e) => {
                    error!(leg = leg + 1, %tp, error = %e, "Leg failed");
                    failed += 1;
                }
            }
        }

        if !opened.is_empty() {
            self.lots.mark_opened()?;
        }

        Ok(CycleOutcome::Opened(OpenedSet {
            symbol: symbol.to_string(),
            side,
            lot,
            opened,
            failed,
            closed_opposing,
        }))
    }

    async fn close_opposing(
        &self,
        terminal: &mut dyn TradingTerminal,
        positions: &[TerminalPosition],
        side: Side,
    ) -> usize {
        let opposite = side.opposite();
        let comment = format!("Close-Opposite-{}", opposite);
        let mut closed = 0;
        for position in positions {
            let ours = self
                .tag_of(position.magic, &position.comment)
                .is_some_and(|tag| tag.side == opposite);
            if !ours {
                continue;
            }
            match terminal
                .close_position(position, self.config.deviation, &comment)
                .await
            {
                Ok(result) => {
                    info!(
                        ticket = position.ticket,
                        side = %opposite,
                        retcode = result.retcode,
                        "Closed opposite leg"
                    );
                    closed += 1;
                }
                Err(e) => {
                    warn!(ticket = position.ticket, error = %e, "Failed to close opposite leg");
                }
            }
        }
        closed
    }

    /// Number of our positions and orders still on `symbol`.
    async fn our_legs(
        &self,
        terminal: &mut dyn TradingTerminal,
        symbol: &str,
    ) -> Result<usize, BrokerError> {
        let positions = terminal.positions(Some(symbol)).await?;
        let orders = terminal.orders(Some(symbol)).await?;
        Ok(positions
            .iter()
            .map(|p| (p.magic, p.comment.as_str()))
            .chain(orders.iter().map(|o| (o.magic, o.comment.as_str())))
            .filter(|(magic, comment)| self.tag_of(*magic, comment).is_some())
            .count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use sigtrade_brokers_common::simulated::{SimulatedTerminal, SimulatedTerminalConfig};
    use sigtrade_data::{LotRecord, LotTrackerConfig};
    use std::sync::Mutex;

    struct FixedSignal(Mutex<Option<ChartSignal>>);

    impl FixedSignal {
        fn new(signal: Option<ChartSignal>) -> Self {
            Self(Mutex::new(signal))
        }

        fn set(&self, signal: ChartSignal) {
            *self.0.lock().unwrap() = Some(signal);
        }
    }

    #[async_trait]
    impl SignalSource for FixedSignal {
        async fn latest_chart_signal(&self) -> Result<Option<ChartSignal>, DataError> {
            Ok(*self.0.lock().unwrap())
        }
    }

    fn orchestrator(name: &str) -> Orchestrator {
        let path = std::env::temp_dir().join(format!(
            "sigtrade-engine-{}-{}",
            std::process::id(),
            name
        ));
        let _ = std::fs::remove_file(&path);
        Orchestrator::new(
            OrchestratorConfig::default(),
            LotTracker::new(LotTrackerConfig {
                path,
                ..Default::default()
            }),
        )
    }

    async fn terminal() -> SimulatedTerminal {
        let mut terminal = SimulatedTerminal::new(SimulatedTerminalConfig::default());
        terminal.connect().await.unwrap();
        terminal.set_tick("XAUUSD", dec!(2400.00), dec!(2400.20));
        terminal
    }

    fn position(side: Side, magic: u64, comment: &str) -> TerminalPosition {
        TerminalPosition {
            ticket: 0,
            symbol: "XAUUSD".to_string(),
            side,
            volume: dec!(0.01),
            price_open: dec!(2405.00),
            sl: None,
            tp: None,
            profit: Decimal::ZERO,
            magic,
            comment: comment.to_string(),
            opened_at: Utc::now(),
        }
    }

    fn opened(outcome: CycleOutcome) -> OpenedSet {
        match outcome {
            CycleOutcome::Opened(set) => set,
            other => panic!("expected a new set, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_no_actionable_signal() {
        let o = orchestrator("none.json");
        let mut t = terminal().await;

        let outcome = o.run_cycle(&mut t, &FixedSignal::new(None)).await.unwrap();
        assert_eq!(outcome, CycleOutcome::NoSignal { signal: None });

        let source = FixedSignal::new(Some(ChartSignal::ApiError));
        let outcome = o.run_cycle(&mut t, &source).await.unwrap();
        assert!(outcome.monitor_target().is_none());
        assert!(t.sent_orders().is_empty());
    }

    #[tokio::test]
    async fn test_opens_one_leg_per_target() {
        let o = orchestrator("open.json");
        let mut t = terminal().await;
        let source = FixedSignal::new(Some(ChartSignal::Buy));

        let set = opened(o.run_cycle(&mut t, &source).await.unwrap());
        assert_eq!(set.side, Side::Buy);
        assert_eq!(set.lot, dec!(0.01));
        assert_eq!(set.opened.len(), 5);
        assert_eq!(set.failed, 0);

        let tps: Vec<_> = t.sent_orders().iter().map(|r| r.tp.unwrap()).collect();
        assert_eq!(
            tps,
            vec![dec!(2407.20), dec!(2410.20), dec!(2415.20), dec!(2420.20), dec!(2430.20)]
        );
        for request in t.sent_orders() {
            assert_eq!(request.price, dec!(2400.20));
            assert_eq!(request.sl, None);
            assert_eq!(request.magic, 2025);
            assert_eq!(request.deviation, 30);
            assert_eq!(request.comment, "DB-Signal-BUY-0.01");
        }
        assert!(o.lots().load().unwrap().awaiting_close);

        let _ = std::fs::remove_file(o.lots().path());
    }

    #[tokio::test]
    async fn test_sell_targets_and_shared_stop() {
        let path = std::env::temp_dir().join(format!("sigtrade-engine-{}-sl.json", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let o = Orchestrator::new(
            OrchestratorConfig {
                tp_pips: vec![dec!(70), dec!(100)],
                stop_loss_pips: Some(dec!(50)),
                ..Default::default()
            },
            LotTracker::new(LotTrackerConfig {
                path: path.clone(),
                ..Default::default()
            }),
        );
        let mut t = terminal().await;

        o.execute(&mut t, "XAUUSD", Side::Sell).await.unwrap();

        let sent = t.sent_orders();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].price, dec!(2400.00));
        assert_eq!(sent[0].tp, Some(dec!(2393.00)));
        assert_eq!(sent[1].tp, Some(dec!(2390.00)));
        assert!(sent.iter().all(|r| r.sl == Some(dec!(2405.00))));

        let _ = std::fs::remove_file(path);
    }

    #[tokio::test]
    async fn test_duplicate_signal_is_noop() {
        let o = orchestrator("dup.json");
        let mut t = terminal().await;
        let source = FixedSignal::new(Some(ChartSignal::Buy));

        opened(o.run_cycle(&mut t, &source).await.unwrap());
        let outcome = o.run_cycle(&mut t, &source).await.unwrap();

        assert_eq!(
            outcome,
            CycleOutcome::AlreadyActive {
                symbol: "XAUUSD".to_string(),
                side: Side::Buy
            }
        );
        assert_eq!(t.sent_orders().len(), 5);

        let _ = std::fs::remove_file(o.lots().path());
    }

    #[tokio::test]
    async fn test_legacy_tag_counts_as_active() {
        let o = orchestrator("legacy.json");
        let mut t = terminal().await;
        t.insert_position(position(Side::Sell, 2025, "DB-Signal-SELL"));

        let outcome = o.execute(&mut t, "XAUUSD", Side::Sell).await.unwrap();
        assert!(matches!(outcome, CycleOutcome::AlreadyActive { .. }));
    }

    #[tokio::test]
    async fn test_closes_opposing_legs_before_opening() {
        let o = orchestrator("opposite.json");
        o.lots()
            .save(&LotRecord {
                base_lot_size: dec!(0.01),
                awaiting_close: true,
            })
            .unwrap();

        let mut t = terminal().await;
        let ours = t.insert_position(position(Side::Sell, 2025, "DB-Signal-SELL-0.01"));
        let foreign = t.insert_position(position(Side::Sell, 7, "DB-Signal-SELL-0.01"));

        let set = opened(o.execute(&mut t, "XAUUSD", Side::Buy).await.unwrap());
        assert_eq!(set.closed_opposing, 1);
        // The only set we owned is gone, so the lot escalates.
        assert_eq!(set.lot, dec!(0.02));

        let close = &t.sent_orders()[0];
        assert_eq!(close.position, Some(ours));
        assert_eq!(close.side, Side::Buy);
        assert_eq!(close.comment, "Close-Opposite-SELL");

        let tickets: Vec<_> = t.open_positions().iter().map(|p| p.ticket).collect();
        assert!(tickets.contains(&foreign));
        assert!(!tickets.contains(&ours));
        assert_eq!(t.sent_orders()[1].comment, "DB-Signal-BUY-0.02");

        let _ = std::fs::remove_file(o.lots().path());
    }

    #[tokio::test]
    async fn test_lot_escalates_once_per_closed_set() {
        let o = orchestrator("escalate.json");
        let mut t = terminal().await;
        let source = FixedSignal::new(Some(ChartSignal::Buy));

        assert_eq!(opened(o.run_cycle(&mut t, &source).await.unwrap()).lot, dec!(0.01));

        t.hit_all_targets("XAUUSD");
        source.set(ChartSignal::Sell);
        assert_eq!(opened(o.run_cycle(&mut t, &source).await.unwrap()).lot, dec!(0.02));

        // Same direction again while the set is open: no new lot.
        assert!(matches!(
            o.run_cycle(&mut t, &source).await.unwrap(),
            CycleOutcome::AlreadyActive { .. }
        ));
        assert_eq!(o.lots().load().unwrap().base_lot_size, dec!(0.02));

        t.hit_all_targets("XAUUSD");
        assert_eq!(opened(o.run_cycle(&mut t, &source).await.unwrap()).lot, dec!(0.03));

        let _ = std::fs::remove_file(o.lots().path());
    }

    #[tokio::test]
    async fn test_failed_legs_do_not_roll_back() {
        let o = orchestrator("partial.json");
        let mut t = terminal().await;
        t.reject_send(1);
        t.reject_send(3);

        let set = opened(o.execute(&mut t, "XAUUSD", Side::Buy).await.unwrap());
        assert_eq!(set.opened.len(), 3);
        assert_eq!(set.failed, 2);
        assert_eq!(t.open_positions().len(), 3);
        assert!(o.lots().load().unwrap().awaiting_close);

        let _ = std::fs::remove_file(o.lots().path());
    }

    #[tokio::test]
    async fn test_all_legs_failing_leaves_tracker_idle() {
        let o = orchestrator("allfail.json");
        let mut t = terminal().await;
        for n in 0..5 {
            t.reject_send(n);
        }

        let set = opened(o.execute(&mut t, "XAUUSD", Side::Buy).await.unwrap());
        assert!(set.opened.is_empty());
        assert!(!o.lots().load().unwrap().awaiting_close);
    }

    #[tokio::test]
    async fn test_missing_tick_fails_cycle() {
        let o = orchestrator("notick.json");
        let mut t = SimulatedTerminal::new(SimulatedTerminalConfig::default());
        t.connect().await.unwrap();

        let result = o.execute(&mut t, "XAUUSD", Side::Buy).await;
        assert!(matches!(
            result,
            Err(EngineError::Broker(BrokerError::NoTick(_)))
        ));
        assert!(t.sent_orders().is_empty());
    }

    #[test]
    fn test_config_rejects_long_comment_prefix() {
        assert!(OrchestratorConfig::default().validate().is_ok());

        let config = OrchestratorConfig {
            comment_prefix: "Dashboard-Chart-Signal-XAU".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(EngineError::InvalidConfig(_))
        ));

        let config = OrchestratorConfig {
            tp_pips: Vec::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
