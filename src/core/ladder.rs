// src/core/ladder.rs
//! Take-profit ladder: `opening -> active -> tp1_done -> tp2_done -> closed`.

use crate::config::{EngineSettings, SlPolicy};
use crate::core::executor::{CloseOutcome, Executor, RepairOutcome};
use crate::types::{
    CloseReason, GuardOutcome, HistoryEvent, MarketOrder, Position, PositionStatus, Protection,
    Side,
};
use crate::utils::precision::normalize_quantity;
use rust_decimal::Decimal;
use std::fmt;
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LadderStage {
    Opening,
    Active,
    /// Number of levels already taken.
    Taken(usize),
    Closed,
}

impl LadderStage {
    pub fn of(position: &Position) -> Self {
        match position.status {
            PositionStatus::Opening => LadderStage::Opening,
            PositionStatus::Closed => LadderStage::Closed,
            PositionStatus::Open => match position.take_profits.iter().filter(|t| t.hit).count() {
                0 => LadderStage::Active,
                n => LadderStage::Taken(n),
            },
        }
    }
}

impl fmt::Display for LadderStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LadderStage::Opening => f.write_str("opening"),
            LadderStage::Active => f.write_str("active"),
            LadderStage::Taken(n) => write!(f, "tp{n}_done"),
            LadderStage::Closed => f.write_str("closed"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum LadderStep {
    /// Price has not reached the next level.
    Hold,
    Advanced { level: usize, closed_quantity: Decimal },
    Completed,
    /// Order or close failed; the level stays armed for the next cycle.
    Failed(String),
    /// Protection could not be restored after the partial close.
    ProtectionLost,
}

fn crossed(side: Side, price: Decimal, target: Decimal) -> bool {
    match side {
        Side::Long => price >= target,
        Side::Short => price <= target,
    }
}

fn trailing_stop(side: Side, price: Decimal, distance: Decimal) -> Decimal {
    match side {
        Side::Long => price * (Decimal::ONE - distance),
        Side::Short => price * (Decimal::ONE + distance),
    }
}

/// Fires at most one level for `position` at `price`.
pub async fn advance(
    executor: &Executor,
    position: &mut Position,
    price: Decimal,
    settings: &EngineSettings,
) -> LadderStep {
    if !position.is_open() {
        return LadderStep::Hold;
    }
    let Some((level, target)) = position.next_target() else {
        return LadderStep::Hold;
    };
    if !crossed(position.side, price, target.price) {
        return LadderStep::Hold;
    }

    let before = LadderStage::of(position);
    let is_last = level + 1 == position.take_profits.len();
    let pct = settings
        .ladder
        .close_pcts
        .get(level)
        .copied()
        .unwrap_or(Decimal::ONE_HUNDRED)
        .min(Decimal::ONE_HUNDRED);

    let rules = match executor.exchange().instrument_rules(&position.symbol).await {
        Ok(rules) => rules,
        Err(e) => return LadderStep::Failed(format!("instrument rules: {e}")),
    };
    let to_close = normalize_quantity(position.quantity * pct / Decimal::ONE_HUNDRED, rules.qty_step);
    let remainder = position.quantity - to_close;
    let full_close = is_last
        || pct >= Decimal::ONE_HUNDRED
        || to_close < rules.min_qty
        || remainder < rules.min_qty;

    info!(
        "🎯 TP{} reached on {} {} at {} (target {}, closing {})",
        level + 1,
        position.side,
        position.symbol,
        price,
        target.price,
        if full_close { "all".to_string() } else { format!("{pct}%") }
    );

    if full_close {
        let detail = format!("TP{} at {}", level + 1, price);
        return match executor
            .close_position(position, CloseReason::TakeProfit, &detail, &settings.guard)
            .await
        {
            CloseOutcome::Verified => {
                for t in position.take_profits.iter_mut() {
                    t.hit = true;
                }
                executor.save(position).await;
                info!("Ladder {} -> {} for {}", before, LadderStage::of(position), position.symbol);
                LadderStep::Completed
            }
            CloseOutcome::Unverified { remaining } => {
                LadderStep::Failed(format!("final close unverified, {remaining} left"))
            }
            CloseOutcome::OrderFailed(e) => LadderStep::Failed(e.to_string()),
        };
    }

    let order = MarketOrder {
        symbol: position.symbol.clone(),
        side: position.side.exit_order_side(),
        quantity: to_close,
        reduce_only: true,
    };
    if let Err(e) = executor.exchange().place_market_order(&order).await {
        warn!("TP{} partial close on {} failed: {}", level + 1, position.symbol, e);
        executor
            .log_guard(
                Some(&*position),
                &position.symbol,
                "take_profit",
                GuardOutcome::Failed,
                format!("TP{} partial close failed: {e}", level + 1),
            )
            .await;
        return LadderStep::Failed(e.to_string());
    }

    position.take_profits[level].hit = true;
    position.reduce_quantity(remainder);
    match settings.ladder.sl_policy {
        SlPolicy::Breakeven => {
            position.tighten_stop(position.entry_price);
        }
        SlPolicy::Trailing => {
            let candidate =
                trailing_stop(position.side, price, settings.ladder.trailing_distance_pct);
            position.tighten_stop(candidate);
        }
        SlPolicy::NoChange => {}
    }
    executor.save(position).await;
    executor
        .history(
            position,
            HistoryEvent::PartialClose {
                level,
                closed_quantity: to_close,
            },
            Some(price),
        )
        .await;
    executor
        .log_guard(
            Some(&*position),
            &position.symbol,
            "take_profit",
            GuardOutcome::Executed,
            format!(
                "TP{} closed {}, {} left, stop {}",
                level + 1,
                to_close,
                position.quantity,
                position.current_stop_loss
            ),
        )
        .await;
    info!("Ladder {} -> {} for {}", before, LadderStage::of(position), position.symbol);

    // Partial fills can silently strip protection, so it is pushed and re-read every time.
    let protection = Protection {
        stop_loss: Some(position.current_stop_loss),
        take_profit: position.next_target().map(|(_, t)| t.price),
    };
    let guard = &settings.guard;
    let verified = match executor
        .repair_protection(position, protection, "post_tp_verify", 1, guard)
        .await
    {
        RepairOutcome::Repaired => true,
        _ => {
            warn!("Protection not confirmed after TP{} on {}, urgent repair", level + 1, position.symbol);
            executor.urgent_repair(position, protection, guard).await
        }
    };
    if verified {
        return LadderStep::Advanced {
            level,
            closed_quantity: to_close,
        };
    }

    error!("🚨 Protection lost on {} after TP{}", position.symbol, level + 1);
    let detail = format!("protection lost after TP{}", level + 1);
    executor
        .escalate(position, CloseReason::ProtectionLost, &detail, guard)
        .await;
    LadderStep::ProtectionLost
}
