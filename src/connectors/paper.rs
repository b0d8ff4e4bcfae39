// src/connectors/paper.rs
use crate::connectors::traits::ExchangeAdapter;
use crate::error::{ExchangeError, ExchangeResult};
use crate::types::{
    InstrumentRules, MarketOrder, OrderResponse, OrderSide, Protection, RemotePosition, Side,
};
use crate::utils::precision::normalize_quantity;
use async_trait::async_trait;
use parking_lot::{Mutex, MutexGuard};
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::info;

/// Operations that can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOp {
    Positions,
    LastPrice,
    SetLeverage,
    MarketOrder,
    SetProtection,
}

#[derive(Debug, Default)]
struct PaperState {
    prices: HashMap<String, Decimal>,
    positions: HashMap<(String, Side), RemotePosition>,
    failures: HashMap<PaperOp, VecDeque<ExchangeError>>,
    /// Errors returned by market orders that did fill (a lost acknowledgement).
    lost_acks: VecDeque<ExchangeError>,
    /// Partial closes wipe attached stop/target, like some venues do.
    drop_protection_on_partial: bool,
    /// Reduce-only orders are acknowledged but never fill.
    ignore_closes: bool,
    /// Protection requests are acknowledged but never stick.
    ignore_protection: bool,
}

/// In-memory exchange used for paper trading and tests.
///
/// Fills market orders at the current price, keeps one position per (symbol, side)
/// and counts every state-changing call.
#[derive(Debug)]
pub struct PaperExchange {
    state: Mutex<PaperState>,
    rules: InstrumentRules,
    mutating_calls: AtomicU64,
    order_seq: AtomicU64,
}

impl Default for PaperExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl PaperExchange {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PaperState::default()),
            rules: InstrumentRules {
                symbol: String::new(),
                qty_step: Decimal::new(1, 3),
                tick_size: Decimal::new(1, 2),
                min_qty: Decimal::new(1, 3),
            },
            mutating_calls: AtomicU64::new(0),
            order_seq: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock()
    }

    pub fn set_price(&self, symbol: &str, price: Decimal) {
        let mut state = self.lock();
        state.prices.insert(symbol.to_string(), price);
        for pos in state.positions.values_mut().filter(|p| p.symbol == symbol) {
            pos.mark_price = price;
            pos.unrealized_pnl = (price - pos.entry_price) * pos.size * pos.side.sign();
        }
    }

    /// Seeds a remote position directly, bypassing orders.
    pub fn insert_position(&self, position: RemotePosition) {
        let key = (position.symbol.clone(), position.side);
        self.lock().positions.insert(key, position);
    }

    pub fn remove_position(&self, symbol: &str, side: Side) {
        self.lock().positions.remove(&(symbol.to_string(), side));
    }

    pub fn position(&self, symbol: &str, side: Side) -> Option<RemotePosition> {
        self.lock().positions.get(&(symbol.to_string(), side)).cloned()
    }

    /// Queues an error returned by the next call of `op`.
    pub fn fail_next(&self, op: PaperOp, err: ExchangeError) {
        self.lock().failures.entry(op).or_default().push_back(err);
    }

    /// The next market order fills, then reports `err` to the caller.
    pub fn fail_after_fill(&self, err: ExchangeError) {
        self.lock().lost_acks.push_back(err);
    }

    pub fn set_drop_protection_on_partial(&self, on: bool) {
        self.lock().drop_protection_on_partial = on;
    }

    pub fn set_ignore_closes(&self, on: bool) {
        self.lock().ignore_closes = on;
    }

    pub fn set_ignore_protection(&self, on: bool) {
        self.lock().ignore_protection = on;
    }

    /// Orders, protection and leverage calls made so far.
    pub fn mutating_calls(&self) -> u64 {
        self.mutating_calls.load(Ordering::SeqCst)
    }

    fn take_failure(&self, op: PaperOp) -> ExchangeResult<()> {
        match self.lock().failures.get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn fill(&self, order: &MarketOrder, qty: Decimal) -> ExchangeResult<()> {
        let mut state = self.lock();
        let price = *state
            .prices
            .get(&order.symbol)
            .ok_or_else(|| ExchangeError::InstrumentRule(format!("no price for {}", order.symbol)))?;

        if order.reduce_only {
            if state.ignore_closes {
                return Ok(());
            }
            let side = match order.side {
                OrderSide::Sell => Side::Long,
                OrderSide::Buy => Side::Short,
            };
            let key = (order.symbol.clone(), side);
            let drop_protection = state.drop_protection_on_partial;
            let Some(pos) = state.positions.get_mut(&key) else {
                return Err(ExchangeError::InvalidParameters(format!(
                    "reduce-only order for {} {} with no open position",
                    side, order.symbol
                )));
            };
            pos.size = (pos.size - qty).max(Decimal::ZERO);
            if pos.size.is_zero() {
                state.positions.remove(&key);
            } else if drop_protection {
                pos.stop_loss = None;
                pos.take_profit = None;
            }
            return Ok(());
        }

        let side = match order.side {
            OrderSide::Buy => Side::Long,
            OrderSide::Sell => Side::Short,
        };
        let entry = state
            .positions
            .entry((order.symbol.clone(), side))
            .or_insert_with(|| RemotePosition {
                symbol: order.symbol.clone(),
                side,
                size: Decimal::ZERO,
                entry_price: price,
                mark_price: price,
                unrealized_pnl: Decimal::ZERO,
                leverage: 1,
                stop_loss: None,
                take_profit: None,
            });
        let total = entry.size + qty;
        entry.entry_price = (entry.entry_price * entry.size + price * qty) / total;
        entry.size = total;
        Ok(())
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn name(&self) -> &str {
        "paper"
    }

    async fn positions(&self) -> ExchangeResult<Vec<RemotePosition>> {
        self.take_failure(PaperOp::Positions)?;
        Ok(self.lock().positions.values().cloned().collect())
    }

    async fn last_price(&self, symbol: &str) -> ExchangeResult<Decimal> {
        self.take_failure(PaperOp::LastPrice)?;
        self.lock()
            .prices
            .get(symbol)
            .copied()
            .ok_or_else(|| ExchangeError::InstrumentRule(format!("unknown symbol {symbol}")))
    }

    async fn instrument_rules(&self, symbol: &str) -> ExchangeResult<InstrumentRules> {
        Ok(InstrumentRules {
            symbol: symbol.to_string(),
            ..self.rules.clone()
        })
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()> {
        self.mutating_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure(PaperOp::SetLeverage)?;
        let mut state = self.lock();
        for pos in state.positions.values_mut().filter(|p| p.symbol == symbol) {
            pos.leverage = leverage;
        }
        Ok(())
    }

    async fn place_market_order(&self, order: &MarketOrder) -> ExchangeResult<OrderResponse> {
        self.mutating_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure(PaperOp::MarketOrder)?;

        let qty = normalize_quantity(order.quantity, self.rules.qty_step);
        if qty < self.rules.min_qty {
            return Err(ExchangeError::InstrumentRule(format!(
                "quantity {} below minimum",
                order.quantity
            )));
        }
        self.fill(order, qty)?;
        if let Some(err) = self.lock().lost_acks.pop_front() {
            return Err(err);
        }

        let id = self.order_seq.fetch_add(1, Ordering::SeqCst) + 1;
        info!(
            "📝 Paper {} {} {} (reduce_only={})",
            order.side.as_str(),
            qty,
            order.symbol,
            order.reduce_only
        );
        Ok(OrderResponse {
            id: format!("paper-{id}"),
            symbol: order.symbol.clone(),
            status: "Filled".to_string(),
        })
    }

    async fn set_protection(
        &self,
        symbol: &str,
        side: Side,
        protection: Protection,
    ) -> ExchangeResult<()> {
        self.mutating_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure(PaperOp::SetProtection)?;

        let mut state = self.lock();
        if state.ignore_protection {
            return Ok(());
        }
        let pos = state
            .positions
            .get_mut(&(symbol.to_string(), side))
            .ok_or_else(|| {
                ExchangeError::InvalidParameters(format!("no {side} position on {symbol}"))
            })?;
        if let Some(sl) = protection.stop_loss {
            pos.stop_loss = Some(sl);
        }
        if let Some(tp) = protection.take_profit {
            pos.take_profit = Some(tp);
        }
        Ok(())
    }
}
