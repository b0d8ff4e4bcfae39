// src/connectors/traits.rs
use crate::error::ExchangeResult;
use crate::types::{InstrumentRules, MarketOrder, OrderResponse, Protection, RemotePosition, Side};
use async_trait::async_trait;
use rust_decimal::Decimal;

/// The one seam between the engine and a remote derivatives exchange.
///
/// Implementations sign, rate-limit, retry and round on their own; callers only
/// ever see classified [`crate::error::ExchangeError`]s.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    fn name(&self) -> &str;

    /// All open positions on the account (size > 0).
    async fn positions(&self) -> ExchangeResult<Vec<RemotePosition>>;

    async fn last_price(&self, symbol: &str) -> ExchangeResult<Decimal>;

    async fn instrument_rules(&self, symbol: &str) -> ExchangeResult<InstrumentRules>;

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> ExchangeResult<()>;

    /// Quantity is rounded to the instrument step before submission.
    async fn place_market_order(&self, order: &MarketOrder) -> ExchangeResult<OrderResponse>;

    /// Attaches (or replaces) stop-loss / take-profit on the position. `None` leaves a level untouched.
    async fn set_protection(
        &self,
        symbol: &str,
        side: Side,
        protection: Protection,
    ) -> ExchangeResult<()>;
}
