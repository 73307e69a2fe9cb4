use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sigtrade_core::*;
use tracing::warn;

/// Why a guard refused an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardViolation {
    pub rule: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum GuardDecision {
    Approved,
    Rejected(GuardViolation),
}

impl GuardDecision {
    pub fn is_approved(&self) -> bool {
        matches!(self, GuardDecision::Approved)
    }
}

/// Volume must lie in `[volume_min, volume_max]` on the symbol's step grid.
pub struct VolumeGuard;

impl VolumeGuard {
    pub fn check(info: &SymbolInfo, volume: Decimal) -> Option<GuardViolation> {
        if volume < info.volume_min || volume > info.volume_max {
            return Some(GuardViolation {
                rule: "volume_bounds".to_string(),
                message: format!(
                    "volume {} outside [{},{}]",
                    volume, info.volume_min, info.volume_max
                ),
            });
        }

        if info.volume_step > Decimal::ZERO {
            let tolerance = Decimal::new(1, 9);
            let steps = ((volume - info.volume_min) / info.volume_step).round();
            let expected = info.volume_min + steps * info.volume_step;
            if (expected - volume).abs() > tolerance {
                return Some(GuardViolation {
                    rule: "volume_step".to_string(),
                    message: format!(
                        "volume {} not a multiple of step {}",
                        volume, info.volume_step
                    ),
                });
            }
        }
        None
    }
}

/// Free margin must cover the margin the terminal says the order needs.
pub struct MarginGuard;

impl MarginGuard {
    pub fn check(required: Decimal, account: &AccountInfo) -> Option<GuardViolation> {
        if account.margin_free < required {
            Some(GuardViolation {
                rule: "free_margin".to_string(),
                message: format!(
                    "not enough free margin: need {:.2}, have {:.2}",
                    required, account.margin_free
                ),
            })
        } else {
            None
        }
    }
}

/// Checks run before a manually requested order is sent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrderGuards {
    pub check_volume: bool,
    pub check_margin: bool,
}

impl Default for OrderGuards {
    fn default() -> Self {
        Self {
            check_volume: true,
            check_margin: true,
        }
    }
}

impl OrderGuards {
    /// Evaluate the enabled guards in order; the first rejection wins.
    ///
    /// Terminal errors while gathering symbol, account, or margin data are
    /// returned as errors rather than rejections.
    pub async fn evaluate(
        &self,
        terminal: &mut dyn TradingTerminal,
        request: &MarketOrderRequest,
    ) -> Result<GuardDecision, BrokerError> {
        if self.check_volume {
            let info = terminal.symbol_info(&request.symbol).await?;
            if let Some(violation) = VolumeGuard::check(&info, request.volume) {
                warn!(symbol = %request.symbol, reason = %violation.message, "Order rejected by volume guard");
                return Ok(GuardDecision::Rejected(violation));
            }
        }

        if self.check_margin {
            let required = terminal
                .calc_margin(&request.symbol, request.side, request.volume, request.price)
                .await?;
            let account = terminal.account().await?;
            if let Some(violation) = MarginGuard::check(required, &account) {
                warn!(symbol = %request.symbol, reason = %violation.message, "Order rejected by margin guard");
                return Ok(GuardDecision::Rejected(violation));
            }
        }

        Ok(GuardDecision::Approved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;
    use sigtrade_brokers_common::simulated::{SimulatedTerminal, SimulatedTerminalConfig};

    fn gold() -> SymbolInfo {
        SimulatedTerminalConfig::xauusd()
    }

    #[test]
    fn test_volume_bounds() {
        assert!(VolumeGuard::check(&gold(), dec!(0.01)).is_none());
        assert!(VolumeGuard::check(&gold(), dec!(100)).is_none());

        let low = VolumeGuard::check(&gold(), dec!(0.001)).unwrap();
        assert_eq!(low.rule, "volume_bounds");
        let high = VolumeGuard::check(&gold(), dec!(100.01)).unwrap();
        assert!(high.message.contains("outside"));
    }

    #[test]
    fn test_volume_step() {
        assert!(VolumeGuard::check(&gold(), dec!(0.37)).is_none());
        let off_grid = VolumeGuard::check(&gold(), dec!(0.015)).unwrap();
        assert_eq!(off_grid.rule, "volume_step");

        let mut coarse = gold();
        coarse.volume_min = dec!(0.1);
        coarse.volume_step = dec!(0.1);
        assert!(VolumeGuard::check(&coarse, dec!(0.3)).is_none());
        assert!(VolumeGuard::check(&coarse, dec!(0.35)).is_some());
    }

    fn account(margin_free: Decimal) -> AccountInfo {
        AccountInfo {
            login: 1,
            server: "Demo".to_string(),
            currency: "USD".to_string(),
            balance: margin_free,
            equity: margin_free,
            profit: Decimal::ZERO,
            margin: Decimal::ZERO,
            margin_free,
            leverage: 100,
        }
    }

    #[test]
    fn test_margin_check() {
        assert!(MarginGuard::check(dec!(240), &account(dec!(240))).is_none());
        let violation = MarginGuard::check(dec!(240.5), &account(dec!(100))).unwrap();
        assert_eq!(violation.message, "not enough free margin: need 240.50, have 100.00");
    }

    #[tokio::test]
    async fn test_evaluate_against_terminal() {
        let mut terminal = SimulatedTerminal::new(SimulatedTerminalConfig {
            initial_balance: dec!(1000),
            ..Default::default()
        });
        terminal.connect().await.unwrap();
        let guards = OrderGuards::default();

        // 0.01 lot * 100 oz * 2400 / 100 leverage = 24 margin
        let small = MarketOrderRequest::open("XAUUSD", Side::Buy, dec!(0.01), dec!(2400));
        assert!(guards.evaluate(&mut terminal, &small).await.unwrap().is_approved());

        // 5 lots need 12,000 margin on a 1,000 account
        let large = MarketOrderRequest::open("XAUUSD", Side::Buy, dec!(5), dec!(2400));
        match guards.evaluate(&mut terminal, &large).await.unwrap() {
            GuardDecision::Rejected(v) => assert_eq!(v.rule, "free_margin"),
            GuardDecision::Approved => panic!("expected margin rejection"),
        }

        // Volume is checked first
        let bad = MarketOrderRequest::open("XAUUSD", Side::Buy, dec!(500), dec!(2400));
        match guards.evaluate(&mut terminal, &bad).await.unwrap() {
            GuardDecision::Rejected(v) => assert_eq!(v.rule, "volume_bounds"),
            GuardDecision::Approved => panic!("expected volume rejection"),
        }

        let unknown = MarketOrderRequest::open("EURUSD", Side::Sell, dec!(0.01), dec!(1.1));
        assert!(matches!(
            guards.evaluate(&mut terminal, &unknown).await,
            Err(BrokerError::SymbolNotFound(_))
        ));
    }
}
