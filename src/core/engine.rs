// src/core/engine.rs
use crate::config::{EngineSettings, SameDirectionPolicy, UpgradePolicy};
use crate::connectors::traits::ExchangeAdapter;
use crate::core::confirmation::ConfirmationTracker;
use crate::core::conflict::{self, ConflictAnalysis, ConflictContext, ConflictType, Resolution};
use crate::core::executor::{CloseOutcome, Executor, RepairOutcome};
use crate::core::guards::{self, GuardAction, GuardCheckResult, GuardInput};
use crate::core::ladder::{self, LadderStep};
use crate::error::ErrorClass;
use crate::storage::Ledger;
use crate::types::{
    find_remote, Alert, CloseReason, GuardOutcome, HistoryEvent, LockAcquisition, LockOutcome,
    MarketOrder, Position, PositionStatus, Protection, RemotePosition, Side, TakeProfitTarget,
};
use crate::utils::precision::{relative_diff, tradable_quantity};
use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const ACCOUNT_ENTITY: &str = "account";

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CycleReport {
    pub checked: usize,
    pub repaired: usize,
    pub closed: usize,
    pub errors: Vec<String>,
}

/// What happened to an accepted alert.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalOutcome {
    Opened { position_id: String },
    Reversed { closed_id: String, opened_id: String },
    Upgraded { position_id: String },
    Tracked { position_id: String, confirmations: u32 },
    Ignored { reason: String },
    Rejected { reason: String },
    /// The entry order may have filled; the monitor settles the row once the lock expires.
    Unconfirmed { position_id: String, reason: String },
    Failed { reason: String },
}

/// How far a guarded entry got.
enum Entry {
    Opened(Position),
    Unconfirmed { position_id: String, reason: String },
}

/// Monitor cycle, conflict resolution and guarded opening over one exchange and one ledger.
pub struct GuardEngine {
    executor: Executor,
    confirmations: ConfirmationTracker,
}

fn mark_pnl(position: &Position, remote: &[RemotePosition]) -> Decimal {
    find_remote(remote, &position.symbol, position.side)
        .filter(|r| r.mark_price > Decimal::ZERO)
        .map(|r| position.pnl_at(r.mark_price))
        .unwrap_or(position.unrealized_pnl)
}

impl GuardEngine {
    pub fn new(
        exchange: Arc<dyn ExchangeAdapter>,
        ledger: Arc<dyn Ledger>,
        settings: &EngineSettings,
    ) -> Self {
        Self {
            executor: Executor::new(exchange, ledger),
            confirmations: ConfirmationTracker::new(Duration::seconds(
                settings.guard.confirmation_window_secs,
            )),
        }
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    pub fn confirmations(&self) -> &ConfirmationTracker {
        &self.confirmations
    }

    fn exchange(&self) -> &Arc<dyn ExchangeAdapter> {
        self.executor.exchange()
    }

    fn ledger(&self) -> &Arc<dyn Ledger> {
        self.executor.ledger()
    }

    /// Ticks the monitor cycle until `shutdown` resolves.
    pub async fn run(&self, interval: std::time::Duration, shutdown: impl Future<Output = ()>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        info!("Guard engine running every {:?}", interval);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    info!("Shutdown requested, guard engine stopping");
                    break;
                }
                _ = ticker.tick() => {
                    let report = self.run_monitor_cycle().await;
                    if report.errors.is_empty() {
                        info!(
                            "Cycle: checked {}, repaired {}, closed {}",
                            report.checked, report.repaired, report.closed
                        );
                    } else {
                        warn!(
                            "Cycle: checked {}, repaired {}, closed {}, {} errors: {:?}",
                            report.checked,
                            report.repaired,
                            report.closed,
                            report.errors.len(),
                            report.errors
                        );
                    }
                }
            }
        }
    }

    // --- monitor cycle ---

    pub async fn run_monitor_cycle(&self) -> CycleReport {
        let mut report = CycleReport::default();

        let settings = match self.ledger().load_settings().await {
            Ok(s) => s,
            Err(e) => {
                report.errors.push(format!("load settings: {e:#}"));
                return report;
            }
        };
        self.confirmations
            .set_window(Duration::seconds(settings.guard.confirmation_window_secs));

        // Remote state is read before anything is evaluated; no read, no cycle.
        let remote = match self.exchange().positions().await {
            Ok(r) => r,
            Err(e) => {
                report.errors.push(format!("remote positions [{}]: {e}", e.class()));
                return report;
            }
        };
        let mut positions = match self.ledger().load_open_positions().await {
            Ok(p) => p,
            Err(e) => {
                report.errors.push(format!("load positions: {e:#}"));
                return report;
            }
        };
        match self.ledger().load_active_bans().await {
            Ok(bans) if !bans.is_empty() => {
                let symbols: Vec<&str> = bans.iter().map(|b| b.symbol.as_str()).collect();
                debug!("Active bans (positions still guarded): {:?}", symbols);
            }
            Ok(_) => {}
            Err(e) => report.errors.push(format!("load bans: {e:#}")),
        }

        for position in positions
            .iter_mut()
            .filter(|p| p.status == PositionStatus::Opening)
        {
            self.settle_stale_opening(position, &remote, &settings).await;
        }

        if self.check_account(&mut positions, &remote, &settings, &mut report).await {
            return report;
        }

        let mut symbol_pnls: HashMap<String, Vec<Decimal>> = HashMap::new();
        for p in positions.iter().filter(|p| p.is_open()) {
            symbol_pnls
                .entry(p.symbol.clone())
                .or_default()
                .push(mark_pnl(p, &remote));
        }

        for position in positions.iter_mut().filter(|p| p.is_open()) {
            report.checked += 1;
            let pnls = symbol_pnls.get(&position.symbol).cloned().unwrap_or_default();
            self.guard_position(position, &remote, &pnls, &settings, &mut report)
                .await;
        }
        report
    }

    /// A position left in `opening` past the lock TTL either made it to the
    /// exchange (and is guarded from now on) or never did.
    async fn settle_stale_opening(
        &self,
        position: &mut Position,
        remote: &[RemotePosition],
        settings: &EngineSettings,
    ) {
        let ttl = Duration::seconds(settings.guard.opening_lock_ttl_secs);
        if Utc::now() - position.opened_at < ttl {
            return;
        }
        match find_remote(remote, &position.symbol, position.side) {
            Some(r) => {
                warn!("Stale opening {} {} found on exchange, now guarded", position.side, position.symbol);
                position.status = PositionStatus::Open;
                position.reduce_quantity(r.size);
            }
            None => {
                warn!("Stale opening {} {} never reached exchange", position.side, position.symbol);
                position.status = PositionStatus::Closed;
                position.closed_at = Some(Utc::now());
            }
        }
        self.executor.save(position).await;
    }

    /// Returns true when the account-wide close ran and the cycle is over.
    async fn check_account(
        &self,
        positions: &mut [Position],
        remote: &[RemotePosition],
        settings: &EngineSettings,
        report: &mut CycleReport,
    ) -> bool {
        let exposures: Vec<(Decimal, Decimal)> = positions
            .iter()
            .filter(|p| p.is_open())
            .map(|p| (mark_pnl(p, remote), p.initial_margin))
            .collect();
        let action = "account_drawdown";
        let Some(hit) = guards::evaluate_account(&exposures, &settings.guard) else {
            self.confirmations.reset(ACCOUNT_ENTITY, action);
            return false;
        };

        if !self.confirmations.confirm(
            ACCOUNT_ENTITY,
            action,
            &hit.reason,
            hit.required_confirmations,
        ) {
            let count = self
                .confirmations
                .pending(ACCOUNT_ENTITY, action)
                .map(|s| s.count)
                .unwrap_or(0);
            warn!(
                "⏳ Account drawdown {}/{}: {}",
                count, hit.required_confirmations, hit.reason
            );
            self.executor
                .log_guard(None, ACCOUNT_ENTITY, action, GuardOutcome::Pending, &hit.reason)
                .await;
            return false;
        }

        error!("🚨 ACCOUNT DRAWDOWN confirmed, closing everything: {}", hit.reason);
        for position in positions.iter_mut().filter(|p| p.is_open()) {
            report.checked += 1;
            self.close(position, CloseReason::AccountDrawdown, &hit.reason, settings, report)
                .await;
        }
        true
    }

    async fn guard_position(
        &self,
        position: &mut Position,
        remote: &[RemotePosition],
        symbol_pnls: &[Decimal],
        settings: &EngineSettings,
        report: &mut CycleReport,
    ) {
        let leg = find_remote(remote, &position.symbol, position.side);
        if let Some(r) = leg.filter(|r| r.mark_price > Decimal::ZERO) {
            position.unrealized_pnl = position.pnl_at(r.mark_price);
        }

        let input = GuardInput {
            position: &*position,
            remote: leg,
            opposite_remote: find_remote(remote, &position.symbol, position.side.opposite())
                .is_some(),
            symbol_pnls,
            now: Utc::now(),
        };
        let results = guards::evaluate_position(&input, &settings.guard);

        for name in GuardAction::DEBOUNCED {
            if !results.iter().any(|r| r.action.name() == name) {
                self.confirmations.reset(&position.id, name);
            }
        }

        if let Some(r) = leg {
            let grown = r.size > position.quantity
                && relative_diff(position.quantity, r.size) > settings.guard.quantity_tolerance;
            if grown {
                warn!(
                    "Exchange holds more {} {} than recorded ({} > {}), local quantity kept",
                    position.side, position.symbol, r.size, position.quantity
                );
            }
        }

        match results.into_iter().next() {
            Some(result) => self.apply(position, result, settings, report).await,
            None => match leg {
                Some(r) if r.mark_price > Decimal::ZERO => {
                    self.run_ladder(position, r.mark_price, settings, report).await;
                }
                Some(_) => debug!(
                    "No mark price for {} {}, ladder held",
                    position.side, position.symbol
                ),
                None => {}
            },
        }
    }

    async fn apply(
        &self,
        position: &mut Position,
        result: GuardCheckResult,
        settings: &EngineSettings,
        report: &mut CycleReport,
    ) {
        let action = result.action.name();
        if !self.confirmations.confirm(
            &position.id,
            action,
            &result.reason,
            result.required_confirmations,
        ) {
            let count = self
                .confirmations
                .pending(&position.id, action)
                .map(|s| s.count)
                .unwrap_or(0);
            info!(
                "⏳ {} on {} {}: {}/{} ({})",
                action, position.side, position.symbol, count, result.required_confirmations, result.reason
            );
            self.executor
                .log_guard(
                    Some(&*position),
                    &position.symbol,
                    action,
                    GuardOutcome::Pending,
                    format!("{}/{}: {}", count, result.required_confirmations, result.reason),
                )
                .await;
            return;
        }

        if let Some(reason) = result.action.close_reason() {
            self.close(position, reason, &result.reason, settings, report).await;
            return;
        }

        match result.action {
            GuardAction::GhostCleanup { .. } => {
                self.executor.mark_ghost_closed(position, &result.reason).await;
                self.confirmations.clear_entity(&position.id);
                report.closed += 1;
            }
            GuardAction::RepairProtection {
                stop_loss,
                take_profit,
                ..
            } => {
                let protection = Protection {
                    stop_loss: Some(stop_loss),
                    take_profit,
                };
                self.repair(position, protection, settings, report).await;
            }
            GuardAction::SyncQuantity { remote, .. } => {
                self.executor.sync_quantity(position, remote).await;
                report.repaired += 1;
            }
            other => {
                warn!("Guard action {} carries no close reason", other);
            }
        }
    }

    async fn close(
        &self,
        position: &mut Position,
        reason: CloseReason,
        detail: &str,
        settings: &EngineSettings,
        report: &mut CycleReport,
    ) {
        warn!("🔻 Closing {} {} ({}): {}", position.side, position.symbol, reason.as_str(), detail);
        match self
            .executor
            .close_position(position, reason, detail, &settings.guard)
            .await
        {
            CloseOutcome::Verified => {
                self.confirmations.clear_entity(&position.id);
                report.closed += 1;
            }
            CloseOutcome::Unverified { remaining } => report.errors.push(format!(
                "{} {}: close unverified, {} still open",
                position.symbol,
                reason.as_str(),
                remaining
            )),
            CloseOutcome::OrderFailed(e) => report.errors.push(format!(
                "{} {}: close failed [{}]: {}",
                position.symbol,
                reason.as_str(),
                e.class(),
                e
            )),
        }
    }

    async fn repair(
        &self,
        position: &mut Position,
        protection: Protection,
        settings: &EngineSettings,
        report: &mut CycleReport,
    ) {
        let guard = &settings.guard;
        match self
            .executor
            .repair_protection(position, protection, "missing_protection", guard.repair_max_attempts, guard)
            .await
        {
            RepairOutcome::Repaired => report.repaired += 1,
            RepairOutcome::Failed(reason) => {
                report.errors.push(format!("{} repair failed: {}", position.symbol, reason))
            }
            RepairOutcome::Refused => {
                let age = Utc::now() - position.opened_at;
                if age <= Duration::seconds(guard.repair_grace_secs) {
                    report.errors.push(format!(
                        "{} repair budget spent, within grace period",
                        position.symbol
                    ));
                    return;
                }
                let detail = format!(
                    "protection not restored after {} attempts, open {}s",
                    guard.repair_max_attempts,
                    age.num_seconds()
                );
                match self
                    .executor
                    .escalate(position, CloseReason::RepairEscalation, &detail, guard)
                    .await
                {
                    CloseOutcome::Verified => {
                        self.confirmations.clear_entity(&position.id);
                        report.closed += 1;
                    }
                    other => report
                        .errors
                        .push(format!("{} escalation close: {:?}", position.symbol, other)),
                }
            }
        }
    }

    async fn run_ladder(
        &self,
        position: &mut Position,
        price: Decimal,
        settings: &EngineSettings,
        report: &mut CycleReport,
    ) {
        match ladder::advance(&self.executor, position, price, settings).await {
            LadderStep::Hold | LadderStep::Advanced { .. } => {}
            LadderStep::Completed => {
                self.confirmations.clear_entity(&position.id);
                report.closed += 1;
            }
            LadderStep::Failed(reason) => {
                report.errors.push(format!("{} ladder: {}", position.symbol, reason))
            }
            LadderStep::ProtectionLost => {
                report.errors.push(format!("{} protection lost after TP", position.symbol));
                if position.status == PositionStatus::Closed {
                    report.closed += 1;
                }
            }
        }
    }

    // --- signals ---

    /// Decides what an alert may do. Every decision lands in the guard log.
    pub async fn resolve_conflict(&self, alert: &Alert) -> Result<ConflictAnalysis> {
        let settings = self.ledger().load_settings().await?;
        let (analysis, _, _) = self.analyze(alert, &settings).await?;
        Ok(analysis)
    }

    async fn analyze(
        &self,
        alert: &Alert,
        settings: &EngineSettings,
    ) -> Result<(ConflictAnalysis, Option<Position>, bool)> {
        let now = Utc::now();
        let banned = self
            .ledger()
            .load_active_bans()
            .await
            .context("load bans")?
            .iter()
            .any(|b| b.symbol == alert.symbol && b.is_active(now));
        let lock = self
            .ledger()
            .find_opening_lock(&alert.symbol, alert.side)
            .await
            .context("find opening lock")?;
        let open = self.ledger().load_open_positions().await.context("load positions")?;
        let mut existing = open
            .iter()
            .filter(|p| p.is_open() && p.symbol == alert.symbol)
            .min_by_key(|p| p.side != alert.side)
            .cloned();

        let pnl_ratio = match &existing {
            Some(p) if p.initial_margin > Decimal::ZERO => {
                let pnl = match self.exchange().positions().await {
                    Ok(remote) => mark_pnl(p, &remote),
                    Err(e) => {
                        warn!("P&L read for conflict on {} failed: {}", p.symbol, e);
                        p.unrealized_pnl
                    }
                };
                Some(pnl / p.initial_margin)
            }
            _ => None,
        };

        let ctx = ConflictContext {
            banned,
            lock: lock.as_ref(),
            existing: existing.as_ref(),
            existing_pnl_ratio: pnl_ratio,
        };
        let analysis = conflict::resolve(alert, &ctx, &settings.conflict);

        let mut tracked = false;
        if let Some(position) = existing.as_mut() {
            tracked = analysis.resolution == Resolution::Ignore
                && match analysis.conflict_type {
                    ConflictType::Upgrade => {
                        settings.conflict.upgrade_policy == UpgradePolicy::TrackConfirmation
                    }
                    ConflictType::SameDirection => {
                        settings.conflict.same_direction_policy
                            == SameDirectionPolicy::TrackConfirmation
                    }
                    _ => false,
                };
            if tracked {
                position.confirmations += 1;
                self.executor.save(position).await;
            }
        }

        info!(
            "⚖️ Alert {} {} {} [{:?} {:.2}]: {} / {} - {}",
            alert.id,
            alert.side,
            alert.symbol,
            alert.tier,
            alert.strength,
            analysis.conflict_type,
            analysis.resolution,
            analysis.reason
        );
        self.executor
            .log_guard(
                existing.as_ref(),
                &alert.symbol,
                "conflict_resolution",
                if analysis.should_proceed {
                    GuardOutcome::Executed
                } else {
                    GuardOutcome::Refused
                },
                format!(
                    "alert {}: {} -> {}: {}",
                    alert.id, analysis.conflict_type, analysis.resolution, analysis.reason
                ),
            )
            .await;

        Ok((analysis, existing, tracked))
    }

    /// Resolves the conflict for `alert` and carries out the decision.
    pub async fn accept_signal(&self, alert: &Alert) -> SignalOutcome {
        let settings = match self.ledger().load_settings().await {
            Ok(s) => s,
            Err(e) => return SignalOutcome::Failed { reason: format!("{e:#}") },
        };
        let (analysis, existing, tracked) = match self.analyze(alert, &settings).await {
            Ok(r) => r,
            Err(e) => return SignalOutcome::Failed { reason: format!("{e:#}") },
        };

        match (analysis.resolution, existing) {
            (Resolution::Reject, _) => SignalOutcome::Rejected {
                reason: analysis.reason,
            },
            (Resolution::Ignore, None) if analysis.should_proceed => {
                self.open(alert, &settings).await
            }
            (Resolution::Ignore, Some(p)) if tracked => {
                SignalOutcome::Tracked {
                    position_id: p.id,
                    confirmations: p.confirmations,
                }
            }
            (Resolution::Ignore, _) => SignalOutcome::Ignored {
                reason: analysis.reason,
            },
            (Resolution::CloseAndOpen, Some(mut p)) => {
                let detail = format!("reversed by alert {}", alert.id);
                match self
                    .executor
                    .close_position(&mut p, CloseReason::Reversal, &detail, &settings.guard)
                    .await
                {
                    CloseOutcome::Verified => {
                        self.confirmations.clear_entity(&p.id);
                        match self.open(alert, &settings).await {
                            SignalOutcome::Opened { position_id } => SignalOutcome::Reversed {
                                closed_id: p.id,
                                opened_id: position_id,
                            },
                            other => other,
                        }
                    }
                    other => SignalOutcome::Failed {
                        reason: format!("reversal close of {}: {:?}", p.symbol, other),
                    },
                }
            }
            (Resolution::Upgrade, Some(mut p)) => self.upgrade(&mut p, alert, &settings).await,
            (resolution, None) => SignalOutcome::Failed {
                reason: format!("{resolution} without an existing position"),
            },
        }
    }

    async fn upgrade(&self, position: &mut Position, alert: &Alert, settings: &EngineSettings) -> SignalOutcome {
        position.tier = alert.tier;
        for (i, price) in alert.take_profits.iter().enumerate() {
            match position.take_profits.get_mut(i) {
                Some(t) if !t.hit => t.price = *price,
                Some(_) => {}
                None => position.take_profits.push(TakeProfitTarget::new(*price)),
            }
        }
        info!("⬆️ Upgraded {} {} to {:?}", position.side, position.symbol, alert.tier);
        self.executor.save(position).await;
        self.executor
            .history(position, HistoryEvent::Upgraded { tier: alert.tier }, None)
            .await;

        let protection = Protection {
            stop_loss: Some(position.current_stop_loss),
            take_profit: position.next_target().map(|(_, t)| t.price),
        };
        let guard = &settings.guard;
        if let RepairOutcome::Failed(reason) = self
            .executor
            .repair_protection(position, protection, "upgrade_protection", guard.repair_max_attempts, guard)
            .await
        {
            warn!("Upgraded targets on {} not confirmed: {}", position.symbol, reason);
        }
        SignalOutcome::Upgraded {
            position_id: position.id.clone(),
        }
    }

    /// Opens under the (symbol, side) opening lock. The lock is released unless the
    /// entry is unconfirmed, in which case it expires with its TTL.
    async fn open(&self, alert: &Alert, settings: &EngineSettings) -> SignalOutcome {
        let lock_id = match self
            .ledger()
            .acquire_opening_lock(&alert.symbol, alert.side)
            .await
        {
            Ok(LockAcquisition::Acquired(id)) => id,
            Ok(LockAcquisition::Busy(lock)) => {
                return SignalOutcome::Rejected {
                    reason: format!("{} {} is already being opened ({})", alert.side, alert.symbol, lock.id),
                }
            }
            Err(e) => return SignalOutcome::Failed { reason: format!("{e:#}") },
        };

        let (outcome, release) = match self.open_under_lock(alert, settings).await {
            Ok(Entry::Opened(position)) => (
                SignalOutcome::Opened {
                    position_id: position.id.clone(),
                },
                Some(LockOutcome::Active {
                    position_id: position.id,
                }),
            ),
            Ok(Entry::Unconfirmed { position_id, reason }) => {
                error!(
                    "❓ Entry {} {} unconfirmed, held for the monitor: {}",
                    alert.side, alert.symbol, reason
                );
                self.executor
                    .log_guard(None, &alert.symbol, "open_unconfirmed", GuardOutcome::Critical, &reason)
                    .await;
                // the lock stays in `opening` until its TTL, then the row is settled
                (SignalOutcome::Unconfirmed { position_id, reason }, None)
            }
            Err(e) => {
                error!("❌ Open {} {} failed: {:#}", alert.side, alert.symbol, e);
                self.executor
                    .log_guard(None, &alert.symbol, "open_position", GuardOutcome::Failed, format!("{e:#}"))
                    .await;
                (SignalOutcome::Failed { reason: format!("{e:#}") }, Some(LockOutcome::Failed))
            }
        };
        if let Some(release) = release {
            if let Err(e) = self.ledger().release_opening_lock(&lock_id, release).await {
                error!("Releasing opening lock {} failed: {:#}", lock_id, e);
            }
        }
        outcome
    }

    async fn abandon(&self, position: &mut Position) {
        position.status = PositionStatus::Closed;
        position.closed_at = Some(Utc::now());
        self.executor.save(position).await;
    }

    async fn open_under_lock(&self, alert: &Alert, settings: &EngineSettings) -> Result<Entry> {
        let exchange = self.exchange();
        let price = exchange.last_price(&alert.symbol).await?;
        let stop_loss = alert.stop_loss.context("alert carries no stop-loss")?;
        let stop_ok = match alert.side {
            Side::Long => stop_loss < price,
            Side::Short => stop_loss > price,
        };
        if !stop_ok {
            bail!("stop {} is on the wrong side of {} for {}", stop_loss, price, alert.side);
        }

        let rules = exchange.instrument_rules(&alert.symbol).await?;
        let leverage = settings.trading.default_leverage.max(1);
        let notional = settings.trading.margin_per_trade * Decimal::from(leverage);
        let quantity = tradable_quantity(notional / price, &rules)
            .with_context(|| format!("{} {} below minimum quantity", notional / price, alert.symbol))?;

        let mut position = Position {
            id: Uuid::new_v4().to_string(),
            symbol: alert.symbol.clone(),
            side: alert.side,
            tier: alert.tier,
            entry_price: price,
            quantity,
            leverage,
            stop_loss,
            current_stop_loss: stop_loss,
            take_profits: alert.take_profits.iter().map(|p| TakeProfitTarget::new(*p)).collect(),
            initial_margin: quantity * price / Decimal::from(leverage),
            unrealized_pnl: Decimal::ZERO,
            confirmations: 0,
            opened_at: Utc::now(),
            status: PositionStatus::Opening,
            close_reason: None,
            closed_at: None,
        };
        self.executor.save(&position).await;

        let order = MarketOrder {
            symbol: position.symbol.clone(),
            side: position.side.entry_order_side(),
            quantity,
            reduce_only: false,
        };
        if let Err(e) = exchange.set_leverage(&position.symbol, leverage).await {
            self.abandon(&mut position).await;
            return Err(e).context("set leverage");
        }
        if let Err(e) = exchange.place_market_order(&order).await {
            if e.class() == ErrorClass::TradeFault {
                self.abandon(&mut position).await;
                return Err(e).context("entry order");
            }
            // a timeout or unknown reply says nothing about the fill: ask the exchange
            warn!(
                "Entry {} {} returned [{}] {}, re-reading positions",
                position.side, position.symbol, e.class(), e
            );
            match exchange.positions().await {
                Ok(remote) => match find_remote(&remote, &position.symbol, position.side) {
                    Some(r) => {
                        warn!(
                            "Entry {} {} landed despite the error, adopting size {}",
                            position.side, position.symbol, r.size
                        );
                        position.quantity = r.size;
                        position.initial_margin = r.size * price / Decimal::from(leverage);
                    }
                    None => {
                        self.abandon(&mut position).await;
                        return Err(e).context("entry order, nothing on the exchange");
                    }
                },
                Err(read) => {
                    return Ok(Entry::Unconfirmed {
                        position_id: position.id.clone(),
                        reason: format!(
                            "entry order [{}] {}; position read [{}] {}",
                            e.class(),
                            e,
                            read.class(),
                            read
                        ),
                    });
                }
            }
        }

        // From here the exchange holds the position, so it is recorded as open
        // even if protection fails; the monitor repairs or escalates.
        position.status = PositionStatus::Open;
        position.opened_at = Utc::now();
        let protection = Protection {
            stop_loss: Some(stop_loss),
            take_profit: position.next_target().map(|(_, t)| t.price),
        };
        if let Err(e) = exchange.set_protection(&position.symbol, position.side, protection).await {
            warn!("Protection for new {} {} failed, monitor will repair: {}", position.side, position.symbol, e);
        }

        info!(
            "🚀 Opened {} {} qty {} @ {} ({}x, SL {})",
            position.side, position.symbol, position.quantity, price, leverage, stop_loss
        );
        self.executor.save(&position).await;
        self.executor
            .history(&position, HistoryEvent::Opened, Some(price))
            .await;
        self.executor
            .log_guard(
                Some(&position),
                &position.symbol,
                "open_position",
                GuardOutcome::Executed,
                format!("alert {}: {} @ {}", alert.id, position.quantity, price),
            )
            .await;
        Ok(Entry::Opened(position))
    }
}
