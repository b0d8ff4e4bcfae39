// src/core/guards.rs
//! The "Oko" guard battery: pure checks over one position (or the whole account)
//! returning what should happen, never doing it.

use crate::config::GuardSettings;
use crate::types::{CloseReason, Position, PositionStatus, RemotePosition, Side};
use crate::utils::precision::relative_diff;
use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use std::fmt;

/// What a guard wants done, with exactly the data that action needs.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardAction {
    GhostCleanup {
        opposite_remote: bool,
    },
    SlBreach {
        price: Decimal,
        stop_loss: Decimal,
        overshoot: Decimal,
    },
    PnlEmergency {
        pnl_ratio: Decimal,
        threshold: Decimal,
    },
    CorrelatedLoss {
        positions_on_symbol: usize,
        losing: usize,
    },
    TimeExit {
        age_hours: i64,
        pnl: Decimal,
    },
    RepairProtection {
        stop_loss: Decimal,
        take_profit: Option<Decimal>,
        missing_stop: bool,
        missing_target: bool,
    },
    SyncQuantity {
        local: Decimal,
        remote: Decimal,
    },
    AccountDrawdown {
        ratio: Decimal,
        threshold: Decimal,
        positions: usize,
    },
}

impl GuardAction {
    /// Checks that need more than one detection; a miss resets their streak.
    pub const DEBOUNCED: [&'static str; 3] = ["pnl_emergency", "correlated_loss", "time_exit"];

    pub fn name(&self) -> &'static str {
        match self {
            GuardAction::GhostCleanup { .. } => "ghost_position",
            GuardAction::SlBreach { .. } => "sl_breach",
            GuardAction::PnlEmergency { .. } => "pnl_emergency",
            GuardAction::CorrelatedLoss { .. } => "correlated_loss",
            GuardAction::TimeExit { .. } => "time_exit",
            GuardAction::RepairProtection { .. } => "missing_protection",
            GuardAction::SyncQuantity { .. } => "quantity_drift",
            GuardAction::AccountDrawdown { .. } => "account_drawdown",
        }
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        match self {
            GuardAction::SlBreach { .. } => Some(CloseReason::SlBreach),
            GuardAction::PnlEmergency { .. } => Some(CloseReason::PnlEmergency),
            GuardAction::CorrelatedLoss { .. } => Some(CloseReason::CorrelatedLoss),
            GuardAction::TimeExit { .. } => Some(CloseReason::TimeExit),
            GuardAction::AccountDrawdown { .. } => Some(CloseReason::AccountDrawdown),
            GuardAction::GhostCleanup { .. }
            | GuardAction::RepairProtection { .. }
            | GuardAction::SyncQuantity { .. } => None,
        }
    }
}

impl fmt::Display for GuardAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct GuardCheckResult {
    pub should_close: bool,
    pub should_fix: bool,
    pub action: GuardAction,
    pub reason: String,
    pub required_confirmations: u32,
}

impl GuardCheckResult {
    fn close(action: GuardAction, required_confirmations: u32, reason: String) -> Self {
        Self {
            should_close: true,
            should_fix: false,
            action,
            reason,
            required_confirmations,
        }
    }

    fn fix(action: GuardAction, reason: String) -> Self {
        Self {
            should_close: false,
            should_fix: true,
            action,
            reason,
            required_confirmations: 1,
        }
    }
}

/// Everything one position's checks look at, read in the current cycle.
#[derive(Debug, Clone)]
pub struct GuardInput<'a> {
    pub position: &'a Position,
    /// Remote leg with the same symbol and side.
    pub remote: Option<&'a RemotePosition>,
    /// Whether the exchange holds the opposite side of this symbol.
    pub opposite_remote: bool,
    /// Unrealized P&L of every open local position on this symbol, this one included.
    pub symbol_pnls: &'a [Decimal],
    pub now: DateTime<Utc>,
}

impl GuardInput<'_> {
    fn price(&self) -> Option<Decimal> {
        self.remote
            .map(|r| r.mark_price)
            .filter(|p| *p > Decimal::ZERO)
    }

    fn pnl(&self) -> Option<Decimal> {
        self.price().map(|p| self.position.pnl_at(p))
    }
}

/// Every qualifying check for one position, highest priority first.
pub fn evaluate_position(input: &GuardInput<'_>, settings: &GuardSettings) -> Vec<GuardCheckResult> {
    [
        check_ghost(input),
        check_sl_breach(input, settings),
        check_pnl_emergency(input, settings),
        check_correlated_loss(input, settings),
        check_time_exit(input, settings),
        check_missing_protection(input),
        check_quantity_drift(input, settings),
    ]
    .into_iter()
    .flatten()
    .collect()
}

pub fn check_ghost(input: &GuardInput<'_>) -> Option<GuardCheckResult> {
    if input.position.status != PositionStatus::Open || input.remote.is_some() {
        return None;
    }
    let reason = if input.opposite_remote {
        format!(
            "exchange holds the opposite side of {}, local {} is stale",
            input.position.symbol, input.position.side
        )
    } else {
        format!("no {} position on exchange for {}", input.position.side, input.position.symbol)
    };
    Some(GuardCheckResult::fix(
        GuardAction::GhostCleanup {
            opposite_remote: input.opposite_remote,
        },
        reason,
    ))
}

pub fn check_sl_breach(input: &GuardInput<'_>, settings: &GuardSettings) -> Option<GuardCheckResult> {
    let price = input.price()?;
    let stop = input.position.current_stop_loss;
    if stop <= Decimal::ZERO {
        return None;
    }
    let overshoot = match input.position.side {
        Side::Long => (stop - price) / stop,
        Side::Short => (price - stop) / stop,
    };
    if overshoot <= settings.sl_breach_tolerance {
        return None;
    }
    Some(GuardCheckResult::close(
        GuardAction::SlBreach {
            price,
            stop_loss: stop,
            overshoot,
        },
        1,
        format!(
            "price {} is {:.2}% beyond stop {} (tolerance {}%)",
            price,
            overshoot * Decimal::ONE_HUNDRED,
            stop,
            settings.sl_breach_tolerance * Decimal::ONE_HUNDRED
        ),
    ))
}

pub fn check_pnl_emergency(
    input: &GuardInput<'_>,
    settings: &GuardSettings,
) -> Option<GuardCheckResult> {
    let pnl = input.pnl()?;
    let margin = input.position.initial_margin;
    if margin <= Decimal::ZERO {
        return None;
    }
    let ratio = pnl / margin;
    if ratio > settings.pnl_emergency_threshold {
        return None;
    }
    Some(GuardCheckResult::close(
        GuardAction::PnlEmergency {
            pnl_ratio: ratio,
            threshold: settings.pnl_emergency_threshold,
        },
        3,
        format!(
            "P&L {:.2}% of margin at or below {}%",
            ratio * Decimal::ONE_HUNDRED,
            settings.pnl_emergency_threshold * Decimal::ONE_HUNDRED
        ),
    ))
}

pub fn check_correlated_loss(
    input: &GuardInput<'_>,
    settings: &GuardSettings,
) -> Option<GuardCheckResult> {
    if !settings.correlated_loss_enabled || input.symbol_pnls.len() < 2 {
        return None;
    }
    let pnl = input.pnl()?;
    let losing = input.symbol_pnls.iter().filter(|p| **p < Decimal::ZERO).count();
    if losing * 2 <= input.symbol_pnls.len() || pnl >= Decimal::ZERO {
        return None;
    }
    Some(GuardCheckResult::close(
        GuardAction::CorrelatedLoss {
            positions_on_symbol: input.symbol_pnls.len(),
            losing,
        },
        3,
        format!(
            "{} of {} positions on {} are losing",
            losing,
            input.symbol_pnls.len(),
            input.position.symbol
        ),
    ))
}

pub fn check_time_exit(input: &GuardInput<'_>, settings: &GuardSettings) -> Option<GuardCheckResult> {
    if !settings.time_exit_enabled {
        return None;
    }
    let pnl = input.pnl()?;
    let age = input.now - input.position.opened_at;
    if age <= Duration::hours(settings.time_exit_hours) || pnl >= Decimal::ZERO {
        return None;
    }
    Some(GuardCheckResult::close(
        GuardAction::TimeExit {
            age_hours: age.num_hours(),
            pnl,
        },
        3,
        format!(
            "open {}h (limit {}h) and still losing {}",
            age.num_hours(),
            settings.time_exit_hours,
            pnl
        ),
    ))
}

pub fn check_missing_protection(input: &GuardInput<'_>) -> Option<GuardCheckResult> {
    let remote = input.remote?;
    let target = input.position.next_target().map(|(_, t)| t.price);
    let missing_stop = !remote.has_stop_loss();
    let missing_target = target.is_some() && !remote.has_take_profit();
    if !missing_stop && !missing_target {
        return None;
    }
    let what = match (missing_stop, missing_target) {
        (true, true) => "stop-loss and take-profit",
        (true, false) => "stop-loss",
        _ => "take-profit",
    };
    Some(GuardCheckResult::fix(
        GuardAction::RepairProtection {
            stop_loss: input.position.current_stop_loss,
            take_profit: target,
            missing_stop,
            missing_target,
        },
        format!("exchange position {} has no {}", input.position.symbol, what),
    ))
}

pub fn check_quantity_drift(
    input: &GuardInput<'_>,
    settings: &GuardSettings,
) -> Option<GuardCheckResult> {
    let remote = input.remote?;
    let local = input.position.quantity;
    if !input.position.any_tp_hit() || remote.size >= local {
        return None;
    }
    if relative_diff(local, remote.size) <= settings.quantity_tolerance {
        return None;
    }
    Some(GuardCheckResult::fix(
        GuardAction::SyncQuantity {
            local,
            remote: remote.size,
        },
        format!("local quantity {} but exchange holds {}", local, remote.size),
    ))
}

/// Account-wide drawdown over `(unrealized_pnl, initial_margin)` of every open position.
pub fn evaluate_account(
    exposures: &[(Decimal, Decimal)],
    settings: &GuardSettings,
) -> Option<GuardCheckResult> {
    let total_margin: Decimal = exposures.iter().map(|(_, m)| *m).sum();
    if exposures.is_empty() || total_margin <= Decimal::ZERO {
        return None;
    }
    let total_pnl: Decimal = exposures.iter().map(|(p, _)| *p).sum();
    let ratio = total_pnl / total_margin;
    if ratio > settings.account_drawdown_threshold {
        return None;
    }
    Some(GuardCheckResult::close(
        GuardAction::AccountDrawdown {
            ratio,
            threshold: settings.account_drawdown_threshold,
            positions: exposures.len(),
        },
        3,
        format!(
            "account P&L {:.2}% of margin at or below {}%",
            ratio * Decimal::ONE_HUNDRED,
            settings.account_drawdown_threshold * Decimal::ONE_HUNDRED
        ),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{TakeProfitTarget, Tier};
    use rust_decimal_macros::dec;

    fn position(side: Side) -> Position {
        Position {
            id: "p1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side,
            tier: Tier::Standard,
            entry_price: dec!(50000),
            quantity: dec!(0.1),
            leverage: 50,
            stop_loss: dec!(49000),
            current_stop_loss: if side == Side::Long { dec!(49000) } else { dec!(51000) },
            take_profits: vec![
                TakeProfitTarget::new(dec!(51000)),
                TakeProfitTarget::new(dec!(52000)),
            ],
            initial_margin: dec!(100),
            unrealized_pnl: Decimal::ZERO,
            confirmations: 0,
            opened_at: Utc::now(),
            status: PositionStatus::Open,
            close_reason: None,
            closed_at: None,
        }
    }

    fn remote(p: &Position, mark: Decimal) -> RemotePosition {
        RemotePosition {
            symbol: p.symbol.clone(),
            side: p.side,
            size: p.quantity,
            entry_price: p.entry_price,
            mark_price: mark,
            unrealized_pnl: p.pnl_at(mark),
            leverage: p.leverage,
            stop_loss: Some(p.current_stop_loss),
            take_profit: Some(dec!(51000)),
        }
    }

    fn input<'a>(p: &'a Position, r: Option<&'a RemotePosition>, pnls: &'a [Decimal]) -> GuardInput<'a> {
        GuardInput {
            position: p,
            remote: r,
            opposite_remote: false,
            symbol_pnls: pnls,
            now: Utc::now(),
        }
    }

    #[test]
    fn healthy_position_passes_every_check() {
        let p = position(Side::Long);
        let r = remote(&p, dec!(50200));
        assert!(evaluate_position(&input(&p, Some(&r), &[dec!(20)]), &GuardSettings::default()).is_empty());
    }

    #[test]
    fn missing_remote_is_a_ghost() {
        let p = position(Side::Long);
        let results = evaluate_position(&input(&p, None, &[]), &GuardSettings::default());
        assert_eq!(results.len(), 1);
        assert!(results[0].should_fix);
        assert_eq!(results[0].required_confirmations, 1);
        assert_eq!(results[0].action.name(), "ghost_position");
    }

    #[test]
    fn opening_positions_are_not_ghosts() {
        let mut p = position(Side::Long);
        p.status = PositionStatus::Opening;
        assert!(check_ghost(&input(&p, None, &[])).is_none());
    }

    #[test]
    fn breach_needs_to_exceed_tolerance() {
        let settings = GuardSettings::default();
        let p = position(Side::Long);
        // 1% under the stop: inside the 2% tolerance
        let r = remote(&p, dec!(48510));
        assert!(check_sl_breach(&input(&p, Some(&r), &[]), &settings).is_none());
        let r = remote(&p, dec!(47900));
        let hit = check_sl_breach(&input(&p, Some(&r), &[]), &settings).unwrap();
        assert!(hit.should_close);
        assert_eq!(hit.required_confirmations, 1);

        let s = position(Side::Short);
        let r = remote(&s, dec!(52100));
        assert!(check_sl_breach(&input(&s, Some(&r), &[]), &settings).is_some());
    }

    #[test]
    fn pnl_emergency_uses_margin_ratio() {
        let settings = GuardSettings::default();
        let p = position(Side::Long);
        // 0.1 BTC * -600 = -60 on 100 margin => -60%
        let r = remote(&p, dec!(49400));
        let hit = check_pnl_emergency(&input(&p, Some(&r), &[]), &settings).unwrap();
        assert_eq!(hit.required_confirmations, 3);
        assert!(matches!(hit.action, GuardAction::PnlEmergency { pnl_ratio, .. } if pnl_ratio == dec!(-0.6)));

        let r = remote(&p, dec!(49600));
        assert!(check_pnl_emergency(&input(&p, Some(&r), &[]), &settings).is_none());
    }

    #[test]
    fn correlated_loss_needs_a_losing_majority() {
        let settings = GuardSettings::default();
        let p = position(Side::Long);
        let r = remote(&p, dec!(49900));
        let pnls = [dec!(-10), dec!(-5), dec!(3)];
        let hit = check_correlated_loss(&input(&p, Some(&r), &pnls), &settings).unwrap();
        assert_eq!(
            hit.action,
            GuardAction::CorrelatedLoss {
                positions_on_symbol: 3,
                losing: 2
            }
        );

        let split = [dec!(-10), dec!(3)];
        assert!(check_correlated_loss(&input(&p, Some(&r), &split), &settings).is_none());
        assert!(check_correlated_loss(&input(&p, Some(&r), &[dec!(-10)]), &settings).is_none());
    }

    #[test]
    fn time_exit_is_off_by_default() {
        let mut p = position(Side::Long);
        p.opened_at = Utc::now() - Duration::hours(100);
        let r = remote(&p, dec!(49900));
        let mut settings = GuardSettings::default();
        assert!(check_time_exit(&input(&p, Some(&r), &[]), &settings).is_none());
        settings.time_exit_enabled = true;
        assert!(check_time_exit(&input(&p, Some(&r), &[]), &settings).is_some());
        let winning = remote(&p, dec!(50100));
        assert!(check_time_exit(&input(&p, Some(&winning), &[]), &settings).is_none());
    }

    #[test]
    fn missing_stop_is_repaired_at_recorded_levels() {
        let p = position(Side::Long);
        let mut r = remote(&p, dec!(50100));
        r.stop_loss = None;
        let hit = check_missing_protection(&input(&p, Some(&r), &[])).unwrap();
        assert!(hit.should_fix);
        assert_eq!(
            hit.action,
            GuardAction::RepairProtection {
                stop_loss: dec!(49000),
                take_profit: Some(dec!(51000)),
                missing_stop: true,
                missing_target: false,
            }
        );
    }

    #[test]
    fn drift_only_after_a_take_profit() {
        let settings = GuardSettings::default();
        let mut p = position(Side::Long);
        let mut r = remote(&p, dec!(50100));
        r.size = dec!(0.05);
        assert!(check_quantity_drift(&input(&p, Some(&r), &[]), &settings).is_none());

        p.take_profits[0].hit = true;
        let hit = check_quantity_drift(&input(&p, Some(&r), &[]), &settings).unwrap();
        assert_eq!(
            hit.action,
            GuardAction::SyncQuantity {
                local: dec!(0.1),
                remote: dec!(0.05)
            }
        );
    }

    #[test]
    fn priority_order_puts_breach_before_emergency() {
        let p = position(Side::Long);
        let r = remote(&p, dec!(47000));
        let results = evaluate_position(&input(&p, Some(&r), &[]), &GuardSettings::default());
        let names: Vec<_> = results.iter().map(|r| r.action.name()).collect();
        assert_eq!(names, vec!["sl_breach", "pnl_emergency"]);
    }

    #[test]
    fn account_drawdown_sums_all_positions() {
        let settings = GuardSettings::default();
        assert!(evaluate_account(&[], &settings).is_none());
        assert!(evaluate_account(&[(dec!(-20), dec!(100)), (dec!(5), dec!(100))], &settings).is_none());
        assert!(evaluate_account(&[(dec!(-50), dec!(100)), (dec!(-20), dec!(100))], &settings).is_none());
        let hit = evaluate_account(&[(dec!(-80), dec!(100)), (dec!(-70), dec!(100))], &settings).unwrap();
        assert!(hit.should_close);
        assert_eq!(hit.required_confirmations, 3);
        assert_eq!(hit.action.close_reason(), Some(CloseReason::AccountDrawdown));
    }
}
