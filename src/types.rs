// src/types.rs
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Direction of a derivatives position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    Long,
    Short,
}

impl Side {
    pub fn opposite(self) -> Self {
        match self {
            Side::Long => Side::Short,
            Side::Short => Side::Long,
        }
    }

    /// +1 for long, -1 for short. Multiplies price deltas into P&L.
    pub fn sign(self) -> Decimal {
        match self {
            Side::Long => Decimal::ONE,
            Side::Short => Decimal::NEGATIVE_ONE,
        }
    }

    /// Order side that opens (or adds to) a position of this direction.
    pub fn entry_order_side(self) -> OrderSide {
        match self {
            Side::Long => OrderSide::Buy,
            Side::Short => OrderSide::Sell,
        }
    }

    /// Order side that reduces a position of this direction.
    pub fn exit_order_side(self) -> OrderSide {
        self.entry_order_side().opposite()
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Long => write!(f, "LONG"),
            Side::Short => write!(f, "SHORT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn opposite(self) -> Self {
        match self {
            OrderSide::Buy => OrderSide::Sell,
            OrderSide::Sell => OrderSide::Buy,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderSide::Buy => "Buy",
            OrderSide::Sell => "Sell",
        }
    }
}

/// Signal strength class. Ordering matters: a higher tier can upgrade a lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Standard,
    Premium,
    Platinum,
    Emergency,
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Standard
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PositionStatus {
    Opening,
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CloseReason {
    GhostPosition,
    SlBreach,
    PnlEmergency,
    CorrelatedLoss,
    TimeExit,
    AccountDrawdown,
    RepairEscalation,
    ProtectionLost,
    TakeProfit,
    Reversal,
}

impl CloseReason {
    pub fn as_str(self) -> &'static str {
        match self {
            CloseReason::GhostPosition => "ghost_position",
            CloseReason::SlBreach => "sl_breach",
            CloseReason::PnlEmergency => "pnl_emergency",
            CloseReason::CorrelatedLoss => "correlated_loss",
            CloseReason::TimeExit => "time_exit",
            CloseReason::AccountDrawdown => "account_drawdown",
            CloseReason::RepairEscalation => "repair_escalation",
            CloseReason::ProtectionLost => "protection_lost",
            CloseReason::TakeProfit => "take_profit",
            CloseReason::Reversal => "reversal",
        }
    }

    /// Closes forced by a guard rather than by the plan. These feed the capitulation counter.
    pub fn is_emergency(self) -> bool {
        !matches!(
            self,
            CloseReason::GhostPosition | CloseReason::TakeProfit | CloseReason::Reversal
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TakeProfitTarget {
    pub price: Decimal,
    pub hit: bool,
}

impl TakeProfitTarget {
    pub fn new(price: Decimal) -> Self {
        Self { price, hit: false }
    }
}

/// A position as the engine believes it to be.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    #[serde(default)]
    pub tier: Tier,
    pub entry_price: Decimal,
    pub quantity: Decimal,
    pub leverage: u32,
    /// Stop level recorded at open.
    pub stop_loss: Decimal,
    /// Live stop level; only tightens once TP1 has been hit.
    pub current_stop_loss: Decimal,
    pub take_profits: Vec<TakeProfitTarget>,
    pub initial_margin: Decimal,
    pub unrealized_pnl: Decimal,
    /// Same-direction alerts tracked against this position.
    #[serde(default)]
    pub confirmations: u32,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub close_reason: Option<CloseReason>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    pub fn tp_hit(&self, level: usize) -> bool {
        self.take_profits.get(level).map(|t| t.hit).unwrap_or(false)
    }

    pub fn any_tp_hit(&self) -> bool {
        self.take_profits.iter().any(|t| t.hit)
    }

    /// First take-profit level that has not fired yet.
    pub fn next_target(&self) -> Option<(usize, TakeProfitTarget)> {
        self.take_profits
            .iter()
            .enumerate()
            .find(|(_, t)| !t.hit)
            .map(|(i, t)| (i, *t))
    }

    pub fn pnl_at(&self, price: Decimal) -> Decimal {
        (price - self.entry_price) * self.quantity * self.side.sign()
    }

    /// Moves the live stop only in the risk-reducing direction. Returns true if it moved.
    pub fn tighten_stop(&mut self, candidate: Decimal) -> bool {
        let tighter = match self.side {
            Side::Long => candidate > self.current_stop_loss,
            Side::Short => candidate < self.current_stop_loss || self.current_stop_loss.is_zero(),
        };
        if tighter {
            self.current_stop_loss = candidate;
        }
        tighter
    }

    /// Shrinks the quantity. Never grows it.
    pub fn reduce_quantity(&mut self, new_quantity: Decimal) {
        if new_quantity < self.quantity {
            self.quantity = new_quantity.max(Decimal::ZERO);
        }
    }

    pub fn mark_closed(&mut self, reason: CloseReason, at: DateTime<Utc>) {
        self.status = PositionStatus::Closed;
        self.close_reason = Some(reason);
        self.closed_at = Some(at);
    }
}

/// Incoming directional signal. Immutable once received.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub tier: Tier,
    /// In [0, 1].
    pub strength: f64,
    #[serde(default)]
    pub entry_price: Option<Decimal>,
    #[serde(default)]
    pub stop_loss: Option<Decimal>,
    #[serde(default)]
    pub take_profits: Vec<Decimal>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockStatus {
    Opening,
    Active,
    Closed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpeningLock {
    pub id: String,
    pub symbol: String,
    pub side: Side,
    pub status: LockStatus,
    pub position_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockAcquisition {
    Acquired(String),
    Busy(OpeningLock),
}

#[derive(Debug, Clone, PartialEq)]
pub enum LockOutcome {
    Active { position_id: String },
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SymbolBan {
    pub symbol: String,
    pub banned_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub reason: String,
}

impl SymbolBan {
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// Position as reported by the exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePosition {
    pub symbol: String,
    pub side: Side,
    pub size: Decimal,
    pub entry_price: Decimal,
    pub mark_price: Decimal,
    pub unrealized_pnl: Decimal,
    pub leverage: u32,
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

impl RemotePosition {
    pub fn has_stop_loss(&self) -> bool {
        self.stop_loss.map(|p| p > Decimal::ZERO).unwrap_or(false)
    }

    pub fn has_take_profit(&self) -> bool {
        self.take_profit.map(|p| p > Decimal::ZERO).unwrap_or(false)
    }
}

/// Finds the live remote leg for a local position.
pub fn find_remote<'a>(
    remote: &'a [RemotePosition],
    symbol: &str,
    side: Side,
) -> Option<&'a RemotePosition> {
    remote
        .iter()
        .find(|r| r.symbol == symbol && r.side == side && r.size > Decimal::ZERO)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstrumentRules {
    pub symbol: String,
    pub qty_step: Decimal,
    pub tick_size: Decimal,
    pub min_qty: Decimal,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MarketOrder {
    pub symbol: String,
    pub side: OrderSide,
    pub quantity: Decimal,
    pub reduce_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: String,
    pub symbol: String,
    pub status: String,
}

/// Stop-loss / take-profit levels to attach to a remote position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Protection {
    pub stop_loss: Option<Decimal>,
    pub take_profit: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HistoryEvent {
    Opened,
    PartialClose { level: usize, closed_quantity: Decimal },
    Closed { reason: CloseReason },
    QuantitySynced { from: Decimal, to: Decimal },
    Upgraded { tier: Tier },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub position_id: String,
    pub symbol: String,
    pub event: HistoryEvent,
    pub price: Option<Decimal>,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GuardOutcome {
    Pending,
    Executed,
    Refused,
    Failed,
    Critical,
}

/// Audit entry for every guard action, repair, ban and conflict decision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GuardLogEntry {
    pub at: DateTime<Utc>,
    pub position_id: Option<String>,
    pub symbol: String,
    pub action: String,
    pub outcome: GuardOutcome,
    pub reason: String,
}

impl GuardLogEntry {
    pub fn new(
        position_id: Option<&str>,
        symbol: &str,
        action: &str,
        outcome: GuardOutcome,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            at: Utc::now(),
            position_id: position_id.map(str::to_string),
            symbol: symbol.to_string(),
            action: action.to_string(),
            outcome,
            reason: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn long_position() -> Position {
        Position {
            id: "p1".to_string(),
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            tier: Tier::Standard,
            entry_price: dec!(50000),
            quantity: dec!(0.2),
            leverage: 10,
            stop_loss: dec!(49000),
            current_stop_loss: dec!(49000),
            take_profits: vec![TakeProfitTarget::new(dec!(51000))],
            initial_margin: dec!(1000),
            unrealized_pnl: Decimal::ZERO,
            confirmations: 0,
            opened_at: Utc::now(),
            status: PositionStatus::Open,
            close_reason: None,
            closed_at: None,
        }
    }

    #[test]
    fn pnl_follows_side() {
        let mut p = long_position();
        assert_eq!(p.pnl_at(dec!(50500)), dec!(100));
        p.side = Side::Short;
        assert_eq!(p.pnl_at(dec!(50500)), dec!(-100));
    }

    #[test]
    fn stop_never_loosens() {
        let mut p = long_position();
        assert!(p.tighten_stop(dec!(50000)));
        assert!(!p.tighten_stop(dec!(49500)));
        assert_eq!(p.current_stop_loss, dec!(50000));

        let mut s = long_position();
        s.side = Side::Short;
        s.current_stop_loss = dec!(51000);
        assert!(s.tighten_stop(dec!(50000)));
        assert!(!s.tighten_stop(dec!(50500)));
    }

    #[test]
    fn quantity_only_shrinks() {
        let mut p = long_position();
        p.reduce_quantity(dec!(0.3));
        assert_eq!(p.quantity, dec!(0.2));
        p.reduce_quantity(dec!(0.1));
        assert_eq!(p.quantity, dec!(0.1));
    }

    #[test]
    fn remote_protection_ignores_zero_levels() {
        let r = RemotePosition {
            symbol: "BTCUSDT".to_string(),
            side: Side::Long,
            size: dec!(1),
            entry_price: dec!(100),
            mark_price: dec!(100),
            unrealized_pnl: Decimal::ZERO,
            leverage: 5,
            stop_loss: Some(Decimal::ZERO),
            take_profit: None,
        };
        assert!(!r.has_stop_loss());
        assert!(!r.has_take_profit());
    }
}
