use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sigtrade_core::*;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breakeven rule and polling window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakevenConfig {
    /// Favourable move, in pips, that arms the rule.
    pub trigger_pips: Decimal,
    /// Alternatively arm once a leg's floating profit reaches this amount.
    pub trigger_profit: Option<Decimal>,
    /// Stop is placed this many pips beyond entry.
    pub buffer_pips: Decimal,
    pub duration_secs: u64,
    pub poll_interval_secs: u64,
}

impl Default for BreakevenConfig {
    fn default() -> Self {
        Self {
            trigger_pips: Decimal::from(70),
            trigger_profit: None,
            buffer_pips: Decimal::from(5),
            duration_secs: 300,
            poll_interval_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MonitorSummary {
    pub polls: u32,
    /// Stop modifications accepted by the terminal.
    pub modifications: usize,
    /// Polls or modifications that failed.
    pub errors: usize,
}

/// Moves stops on our legs to breakeven once they are far enough in profit.
pub struct BreakevenMonitor {
    config: BreakevenConfig,
    magic: u64,
    comment_prefix: String,
}

impl BreakevenMonitor {
    pub fn new(config: BreakevenConfig, magic: u64, comment_prefix: impl Into<String>) -> Self {
        Self {
            config,
            magic,
            comment_prefix: comment_prefix.into(),
        }
    }

    /// Poll until the window closes. Never fails; errors are counted and logged.
    pub async fn run(
        &self,
        terminal: &mut dyn TradingTerminal,
        symbol: &str,
        side: Side,
    ) -> MonitorSummary {
        let deadline = Instant::now() + Duration::from_secs(self.config.duration_secs);
        let interval = Duration::from_secs(self.config.poll_interval_secs.max(1));
        let mut summary = MonitorSummary::default();

        info!(
            %symbol,
            %side,
            duration_secs = self.config.duration_secs,
            "Monitoring trades for breakeven"
        );

        while Instant::now() < deadline {
            summary.polls += 1;
            match self.adjust_once(terminal, symbol, side).await {
                Ok((modified, failed)) => {
                    summary.modifications += modified;
                    summary.errors += failed;
                }
                Err(e) => {
                    warn!(error = %e, "Breakeven poll failed");
                    summary.errors += 1;
                }
            }
            tokio::time::sleep(interval).await;
        }

        info!(
            polls = summary.polls,
            modifications = summary.modifications,
            errors = summary.errors,
            "Breakeven monitoring finished"
        );
        summary
    }

    /// One pass over our `side` legs on `symbol`.
    ///
    /// Returns `(modified, failed)` stop updates.
    pub async fn adjust_once(
        &self,
        terminal: &mut dyn TradingTerminal,
        symbol: &str,
        side: Side,
    ) -> Result<(usize, usize), BrokerError> {
        let legs: Vec<TerminalPosition> = terminal
            .positions(Some(symbol))
            .await?
            .into_iter()
            .filter(|p| {
                p.magic == self.magic
                    && TradeSetTag::parse(&p.comment, &self.comment_prefix)
                        .is_some_and(|tag| tag.side == side)
            })
            .collect();
        if legs.is_empty() {
            debug!(%symbol, "No legs to monitor");
            return Ok((0, 0));
        }

        let info = terminal.symbol_info(symbol).await?;
        let tick = terminal.tick(symbol).await?;

        let mut modified = 0;
        let mut failed = 0;
        for leg in &legs {
            let Some(new_sl) = self.breakeven_stop(leg, &info, &tick) else {
                continue;
            };
            match terminal.modify_stops(leg.ticket, Some(new_sl), leg.tp).await {
                Ok(_) => {
                    info!(ticket = leg.ticket, sl = %new_sl, "SL moved to breakeven");
                    modified += 1;
                }
                Err(e) => {
                    warn!(ticket = leg.ticket, error = %e, "SL move failed");
                    failed += 1;
                }
            }
        }
        Ok((modified, failed))
    }

    /// New stop for `leg` if the rule is armed and it tightens the current stop.
    pub fn breakeven_stop(
        &self,
        leg: &TerminalPosition,
        info: &SymbolInfo,
        tick: &Tick,
    ) -> Option<Decimal> {
        let current = tick.exit_price(leg.side);
        let by_pips = leg.favourable_move(current) >= info.pips(self.config.trigger_pips);
        let by_profit = self
            .config
            .trigger_profit
            .is_some_and(|threshold| leg.profit >= threshold);
        if !by_pips && !by_profit {
            return None;
        }

        let new_sl = info.round_price(leg.side.offset(leg.price_open, info.pips(self.config.buffer_pips)));
        let improves = match (leg.side, leg.sl) {
            (_, None) => true,
            (Side::Buy, Some(sl)) => sl < new_sl,
            (Side::Sell, Some(sl)) => sl > new_sl,
        };
        improves.then_some(new_sl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use sigtrade_brokers_common::simulated::{SimulatedTerminal, SimulatedTerminalConfig};

    fn monitor(config: BreakevenConfig) -> BreakevenMonitor {
        BreakevenMonitor::new(config, 2025, "DB-Signal")
    }

    fn window(duration_secs: u64) -> BreakevenConfig {
        BreakevenConfig {
            duration_secs,
            ..Default::default()
        }
    }

    fn leg(side: Side, price_open: Decimal, sl: Option<Decimal>, tp: Decimal) -> TerminalPosition {
        TerminalPosition {
            ticket: 0,
            symbol: "XAUUSD".to_string(),
            side,
            volume: dec!(0.01),
            price_open,
            sl,
            tp: Some(tp),
            profit: Decimal::ZERO,
            magic: 2025,
            comment: format!("DB-Signal-{}-0.01", side),
            opened_at: Utc::now(),
        }
    }

    async fn terminal() -> SimulatedTerminal {
        let mut terminal = SimulatedTerminal::new(SimulatedTerminalConfig::default());
        terminal.connect().await.unwrap();
        terminal
    }

    #[tokio::test(start_paused = true)]
    async fn test_buy_leg_moves_to_breakeven_once() {
        let mut t = terminal().await;
        let ticket = t.insert_position(leg(Side::Buy, dec!(2400.20), None, dec!(2430.20)));
        t.queue_ticks(
            "XAUUSD",
            [
                (dec!(2401.00), dec!(2401.20)),
                (dec!(2407.20), dec!(2407.40)),
            ],
        );

        let summary = monitor(window(60)).run(&mut t, "XAUUSD", Side::Buy).await;

        assert_eq!(summary.polls, 6);
        assert_eq!(summary.modifications, 1);
        assert_eq!(summary.errors, 0);
        assert_eq!(
            t.stop_modifications(),
            &[(ticket, Some(dec!(2400.70)), Some(dec!(2430.20)))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sell_stop_never_loosens() {
        let mut t = terminal().await;
        t.insert_position(leg(Side::Sell, dec!(2400.00), Some(dec!(2399.00)), dec!(2370.00)));
        t.set_tick("XAUUSD", dec!(2389.80), dec!(2390.00));

        let summary = monitor(window(30)).run(&mut t, "XAUUSD", Side::Sell).await;
        assert_eq!(summary.modifications, 0);
        assert!(t.stop_modifications().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_sell_leg_without_stop() {
        let mut t = terminal().await;
        let ticket = t.insert_position(leg(Side::Sell, dec!(2400.00), None, dec!(2370.00)));
        t.set_tick("XAUUSD", dec!(2392.80), dec!(2393.00));

        let summary = monitor(window(10)).run(&mut t, "XAUUSD", Side::Sell).await;
        assert_eq!(summary.modifications, 1);
        assert_eq!(
            t.stop_modifications(),
            &[(ticket, Some(dec!(2399.50)), Some(dec!(2370.00)))]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_ignores_other_direction_and_foreign_legs() {
        let mut t = terminal().await;
        t.insert_position(leg(Side::Sell, dec!(2420.00), None, dec!(2390.00)));
        let mut foreign = leg(Side::Buy, dec!(2390.00), None, dec!(2420.00));
        foreign.magic = 99;
        t.insert_position(foreign);
        t.set_tick("XAUUSD", dec!(2410.00), dec!(2410.20));

        let summary = monitor(window(20)).run(&mut t, "XAUUSD", Side::Buy).await;
        assert_eq!(summary.modifications, 0);
        assert!(t.stop_modifications().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_profit_trigger() {
        let mut t = terminal().await;
        let mut position = leg(Side::Buy, dec!(2400.00), None, dec!(2430.00));
        position.volume = dec!(1);
        let ticket = t.insert_position(position);
        // 1.00 move on 1 lot of 100 oz = 100 profit, well short of 70 pips
        t.set_tick("XAUUSD", dec!(2401.00), dec!(2401.20));

        let config = BreakevenConfig {
            trigger_profit: Some(dec!(50)),
            duration_secs: 10,
            ..Default::default()
        };
        let summary = monitor(config).run(&mut t, "XAUUSD", Side::Buy).await;
        assert_eq!(summary.modifications, 1);
        assert_eq!(t.stop_modifications()[0].0, ticket);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stops_at_deadline_despite_errors() {
        let mut t = terminal().await;
        // No quote for the symbol: every poll fails
        t.insert_position(leg(Side::Buy, dec!(2400.00), None, dec!(2430.00)));

        let start = Instant::now();
        let summary = monitor(BreakevenConfig::default())
            .run(&mut t, "XAUUSD", Side::Buy)
            .await;

        assert_eq!(summary.polls, 30);
        assert_eq!(summary.errors, 30);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(300));
        assert!(elapsed < Duration::from_secs(310));
    }
}
