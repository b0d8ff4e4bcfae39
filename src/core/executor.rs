// src/core/executor.rs
use crate::config::GuardSettings;
use crate::connectors::traits::ExchangeAdapter;
use crate::core::repair_limiter::RepairLimiter;
use crate::error::ExchangeError;
use crate::storage::Ledger;
use crate::types::{
    find_remote, CloseReason, GuardLogEntry, GuardOutcome, HistoryEvent, HistoryRecord,
    MarketOrder, Position, Protection, RemotePosition,
};
use anyhow::Result;
use chrono::Utc;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Result of a close that was re-read from the exchange afterwards.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    Verified,
    /// Order went out but the exchange still reports size after every re-read.
    Unverified { remaining: Decimal },
    OrderFailed(ExchangeError),
}

impl CloseOutcome {
    pub fn is_verified(&self) -> bool {
        matches!(self, CloseOutcome::Verified)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RepairOutcome {
    Repaired,
    Failed(String),
    /// Attempt budget for this window is spent.
    Refused,
}

/// Performs every state-changing step the guards decide on and records it.
///
/// Ledger write failures are logged and swallowed here: they must never hide
/// that the exchange side already changed.
pub struct Executor {
    exchange: Arc<dyn ExchangeAdapter>,
    ledger: Arc<dyn Ledger>,
    repairs: RepairLimiter,
    capitulation: Mutex<HashMap<String, u32>>,
}

impl Executor {
    pub fn new(exchange: Arc<dyn ExchangeAdapter>, ledger: Arc<dyn Ledger>) -> Self {
        Self {
            exchange,
            ledger,
            repairs: RepairLimiter::new(),
            capitulation: Mutex::new(HashMap::new()),
        }
    }

    pub fn exchange(&self) -> &Arc<dyn ExchangeAdapter> {
        &self.exchange
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn repairs(&self) -> &RepairLimiter {
        &self.repairs
    }

    pub fn capitulation_count(&self, symbol: &str) -> u32 {
        self.capitulation.lock().get(symbol).copied().unwrap_or(0)
    }

    // --- ledger helpers ---

    fn report(&self, what: &str, result: Result<()>) {
        if let Err(e) = result {
            error!("Ledger write failed ({}): {:#}", what, e);
        }
    }

    pub async fn log_guard(
        &self,
        position: Option<&Position>,
        symbol: &str,
        action: &str,
        outcome: GuardOutcome,
        reason: impl Into<String>,
    ) {
        let entry = GuardLogEntry::new(position.map(|p| p.id.as_str()), symbol, action, outcome, reason);
        let result = self.ledger.append_guard_action_log(entry).await;
        self.report("guard log", result);
    }

    pub async fn save(&self, position: &Position) {
        let result = self.ledger.upsert_position(position).await;
        self.report("position", result);
    }

    pub async fn history(&self, position: &Position, event: HistoryEvent, price: Option<Decimal>) {
        let record = HistoryRecord {
            position_id: position.id.clone(),
            symbol: position.symbol.clone(),
            event,
            price,
            at: Utc::now(),
        };
        let result = self.ledger.append_history(record).await;
        self.report("history", result);
    }

    // --- local-only transitions ---

    /// Ghost cleanup: the exchange no longer has the leg, so only the ledger changes.
    pub async fn mark_ghost_closed(&self, position: &mut Position, reason: &str) {
        position.reduce_quantity(Decimal::ZERO);
        position.mark_closed(CloseReason::GhostPosition, Utc::now());
        self.repairs.clear_entity(&position.id);
        info!("👻 Ghost {} {} marked closed: {}", position.side, position.symbol, reason);
        self.save(position).await;
        self.history(position, HistoryEvent::Closed { reason: CloseReason::GhostPosition }, None)
            .await;
        self.log_guard(Some(&*position), &position.symbol, "ghost_position", GuardOutcome::Executed, reason)
            .await;
    }

    /// Adopts the exchange quantity after a fill we did not see. Never grows the position.
    pub async fn sync_quantity(&self, position: &mut Position, remote_size: Decimal) {
        let from = position.quantity;
        position.reduce_quantity(remote_size);
        if position.quantity == from {
            return;
        }
        warn!(
            "Quantity drift on {} {}: local {} -> exchange {}",
            position.side, position.symbol, from, position.quantity
        );
        self.save(position).await;
        self.history(
            position,
            HistoryEvent::QuantitySynced {
                from,
                to: position.quantity,
            },
            None,
        )
        .await;
        self.log_guard(
            Some(&*position),
            &position.symbol,
            "quantity_drift",
            GuardOutcome::Executed,
            format!("local {} synced to exchange {}", from, position.quantity),
        )
        .await;
    }

    // --- remote actions ---

    async fn read_remote(&self, position: &Position) -> Result<Option<RemotePosition>, ExchangeError> {
        let remote = self.exchange.positions().await?;
        Ok(find_remote(&remote, &position.symbol, position.side).cloned())
    }

    /// Re-reads the exchange until the leg is gone or the attempts run out.
    async fn verify_closed(&self, position: &Position, settings: &GuardSettings) -> Option<Decimal> {
        let mut remaining = position.quantity;
        for attempt in 1..=settings.close_verify_attempts.max(1) {
            if settings.close_verify_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(settings.close_verify_delay_ms)).await;
            }
            match self.read_remote(position).await {
                Ok(None) => return None,
                Ok(Some(r)) => {
                    remaining = r.size;
                    debug!(attempt, symbol = %position.symbol, size = %r.size, "close not visible yet");
                }
                Err(e) => warn!(attempt, symbol = %position.symbol, "close verification read failed: {}", e),
            }
        }
        Some(remaining)
    }

    /// Reduce-only market close of whatever the exchange holds, then verification.
    ///
    /// Only a verified close marks the local row closed. An unverified one is a
    /// critical condition of its own and leaves the position open locally.
    pub async fn close_position(
        &self,
        position: &mut Position,
        reason: CloseReason,
        detail: &str,
        settings: &GuardSettings,
    ) -> CloseOutcome {
        let action = reason.as_str();
        let size = match self.read_remote(position).await {
            Ok(Some(r)) => Some(r.size),
            Ok(None) => None,
            Err(e) => {
                warn!("Pre-close read failed for {}: {}. Using local quantity.", position.symbol, e);
                Some(position.quantity)
            }
        };

        if let Some(quantity) = size {
            let order = MarketOrder {
                symbol: position.symbol.clone(),
                side: position.side.exit_order_side(),
                quantity,
                reduce_only: true,
            };
            if let Err(e) = self.exchange.place_market_order(&order).await {
                error!("❌ Close of {} {} failed [{}]: {}", position.side, position.symbol, e.class(), e);
                self.log_guard(
                    Some(&*position),
                    &position.symbol,
                    action,
                    GuardOutcome::Failed,
                    format!("close order failed: {e}"),
                )
                .await;
                return CloseOutcome::OrderFailed(e);
            }
        }

        if let Some(remaining) = self.verify_closed(position, settings).await {
            error!(
                "🚨 CLOSE UNVERIFIED: {} {} still shows {} on exchange",
                position.side, position.symbol, remaining
            );
            self.log_guard(
                Some(&*position),
                &position.symbol,
                "close_unverified",
                GuardOutcome::Critical,
                format!("{action}: exchange still holds {remaining} after close"),
            )
            .await;
            return CloseOutcome::Unverified { remaining };
        }

        let exit_price = self.exchange.last_price(&position.symbol).await.ok();
        position.reduce_quantity(Decimal::ZERO);
        position.mark_closed(reason, Utc::now());
        self.repairs.clear_entity(&position.id);
        info!("✅ Closed {} {} ({}): {}", position.side, position.symbol, action, detail);

        self.save(position).await;
        self.history(position, HistoryEvent::Closed { reason }, exit_price).await;
        self.log_guard(Some(&*position), &position.symbol, action, GuardOutcome::Executed, detail)
            .await;

        if reason.is_emergency() {
            self.count_capitulation(&position.symbol, settings).await;
        }
        CloseOutcome::Verified
    }

    async fn count_capitulation(&self, symbol: &str, settings: &GuardSettings) {
        let reached = {
            let mut counts = self.capitulation.lock();
            let count = counts.entry(symbol.to_string()).or_insert(0);
            *count += 1;
            if *count >= settings.capitulation_threshold.max(1) {
                counts.remove(symbol);
                true
            } else {
                false
            }
        };
        if reached {
            self.ban(
                symbol,
                &format!("capitulation: {} emergency closes", settings.capitulation_threshold),
                settings.capitulation_ban_hours,
            )
            .await;
        }
    }

    pub async fn ban(&self, symbol: &str, reason: &str, hours: i64) {
        error!("⛔ Banning {} for {}h: {}", symbol, hours, reason);
        let result = self.ledger.ban_symbol(symbol, reason, hours).await;
        self.report("ban", result);
        self.log_guard(None, symbol, "symbol_ban", GuardOutcome::Executed, format!("{hours}h: {reason}"))
            .await;
    }

    /// Submits protection, then re-reads the exchange to confirm it stuck.
    ///
    /// Each call spends one attempt of the `(position, action)` budget; a
    /// verified repair clears the budget.
    pub async fn repair_protection(
        &self,
        position: &Position,
        protection: Protection,
        action: &str,
        max_attempts: u32,
        settings: &GuardSettings,
    ) -> RepairOutcome {
        if !self.repairs.should_attempt(
            &position.id,
            action,
            max_attempts,
            settings.repair_cooldown_minutes,
        ) {
            return RepairOutcome::Refused;
        }
        let attempt = self.repairs.attempts(&position.id, action);

        let failure = match self
            .exchange
            .set_protection(&position.symbol, position.side, protection)
            .await
        {
            Err(e) => Some(format!("submit failed [{}]: {}", e.class(), e)),
            Ok(()) => match self.read_remote(position).await {
                Ok(Some(r)) => {
                    let sl_ok = protection.stop_loss.is_none() || r.has_stop_loss();
                    let tp_ok = protection.take_profit.is_none() || r.has_take_profit();
                    if sl_ok && tp_ok {
                        None
                    } else {
                        Some("exchange does not show the submitted protection".to_string())
                    }
                }
                Ok(None) => Some("position gone while verifying protection".to_string()),
                Err(e) => Some(format!("verification read failed: {e}")),
            },
        };

        match failure {
            None => {
                self.repairs.clear(&position.id, action);
                info!(
                    "🛡️ Protection restored on {} {} (SL {:?}, TP {:?})",
                    position.side, position.symbol, protection.stop_loss, protection.take_profit
                );
                self.log_guard(
                    Some(&*position),
                    &position.symbol,
                    action,
                    GuardOutcome::Executed,
                    format!("SL {:?} TP {:?}", protection.stop_loss, protection.take_profit),
                )
                .await;
                RepairOutcome::Repaired
            }
            Some(reason) => {
                warn!(
                    "Protection repair {}/{} on {} failed: {}",
                    attempt, max_attempts, position.symbol, reason
                );
                self.log_guard(
                    Some(&*position),
                    &position.symbol,
                    action,
                    GuardOutcome::Failed,
                    format!("attempt {attempt}/{max_attempts}: {reason}"),
                )
                .await;
                RepairOutcome::Failed(reason)
            }
        }
    }

    /// Repair with the urgent budget, retried back to back within this call.
    pub async fn urgent_repair(
        &self,
        position: &Position,
        protection: Protection,
        settings: &GuardSettings,
    ) -> bool {
        let budget = settings.urgent_repair_attempts.max(1);
        for _ in 0..budget {
            match self
                .repair_protection(position, protection, "post_tp_protection", budget, settings)
                .await
            {
                RepairOutcome::Repaired => return true,
                RepairOutcome::Refused => return false,
                RepairOutcome::Failed(_) => {}
            }
        }
        false
    }

    /// Force-closes a position whose protection cannot be restored. Bans only after
    /// the close is verified.
    pub async fn escalate(
        &self,
        position: &mut Position,
        reason: CloseReason,
        detail: &str,
        settings: &GuardSettings,
    ) -> CloseOutcome {
        error!("🚨 Escalating {} {}: {}", position.side, position.symbol, detail);
        self.log_guard(Some(&*position), &position.symbol, "repair_escalation", GuardOutcome::Critical, detail)
            .await;
        let outcome = self.close_position(position, reason, detail, settings).await;
        if outcome.is_verified() {
            self.ban(&position.symbol, detail, settings.repair_ban_hours).await;
        }
        outcome
    }
}
