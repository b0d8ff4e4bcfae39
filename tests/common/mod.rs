#![allow(dead_code)]

use chrono::{Duration, Utc};
use oko_guard::config::EngineSettings;
use oko_guard::connectors::paper::PaperExchange;
use oko_guard::core::GuardEngine;
use oko_guard::storage::{JsonLedger, Ledger};
use oko_guard::types::{
    Alert, Position, PositionStatus, RemotePosition, Side, TakeProfitTarget, Tier,
};
use rust_decimal::Decimal;
use std::sync::Arc;

pub struct Harness {
    pub exchange: Arc<PaperExchange>,
    pub ledger: Arc<JsonLedger>,
    pub engine: GuardEngine,
}

/// Defaults with close verification that does not sleep.
pub fn settings() -> EngineSettings {
    let mut s = EngineSettings::default();
    s.guard.close_verify_delay_ms = 0;
    s
}

pub fn harness(settings: EngineSettings) -> Harness {
    let exchange = Arc::new(PaperExchange::new());
    let ledger = Arc::new(JsonLedger::in_memory(settings.clone()));
    let engine = GuardEngine::new(exchange.clone(), ledger.clone(), &settings);
    Harness {
        exchange,
        ledger,
        engine,
    }
}

pub struct PositionBuilder {
    position: Position,
}

impl PositionBuilder {
    pub fn new(symbol: &str, side: Side, entry: Decimal, quantity: Decimal) -> Self {
        Self {
            position: Position {
                id: format!("{}-{}", symbol.to_lowercase(), side),
                symbol: symbol.to_string(),
                side,
                tier: Tier::Standard,
                entry_price: entry,
                quantity,
                leverage: 10,
                stop_loss: Decimal::ZERO,
                current_stop_loss: Decimal::ZERO,
                take_profits: vec![],
                initial_margin: entry * quantity / Decimal::from(10),
                unrealized_pnl: Decimal::ZERO,
                confirmations: 0,
                opened_at: Utc::now() - Duration::minutes(5),
                status: PositionStatus::Open,
                close_reason: None,
                closed_at: None,
            },
        }
    }

    pub fn id(mut self, id: &str) -> Self {
        self.position.id = id.to_string();
        self
    }

    pub fn leverage(mut self, leverage: u32) -> Self {
        self.position.leverage = leverage;
        self.position.initial_margin =
            self.position.entry_price * self.position.quantity / Decimal::from(leverage);
        self
    }

    pub fn stop(mut self, stop: Decimal) -> Self {
        self.position.stop_loss = stop;
        self.position.current_stop_loss = stop;
        self
    }

    pub fn targets(mut self, targets: &[Decimal]) -> Self {
        self.position.take_profits = targets.iter().map(|p| TakeProfitTarget::new(*p)).collect();
        self
    }

    pub fn tier(mut self, tier: Tier) -> Self {
        self.position.tier = tier;
        self
    }

    pub fn build(self) -> Position {
        self.position
    }
}

pub fn remote_of(position: &Position, protected: bool) -> RemotePosition {
    RemotePosition {
        symbol: position.symbol.clone(),
        side: position.side,
        size: position.quantity,
        entry_price: position.entry_price,
        mark_price: position.entry_price,
        unrealized_pnl: Decimal::ZERO,
        leverage: position.leverage,
        stop_loss: protected.then_some(position.current_stop_loss),
        take_profit: if protected {
            position.next_target().map(|(_, t)| t.price)
        } else {
            None
        },
    }
}

impl Harness {
    /// Records the position locally and mirrors it on the exchange.
    pub async fn seed(&self, position: &Position, protected: bool) {
        self.ledger.upsert_position(position).await.unwrap();
        self.exchange.insert_position(remote_of(position, protected));
        self.exchange.set_price(&position.symbol, position.entry_price);
    }

    pub async fn stored(&self, id: &str) -> Position {
        self.ledger.position(id).await.expect("position in ledger")
    }
}

pub fn alert(symbol: &str, side: Side, tier: Tier, strength: f64) -> Alert {
    Alert {
        id: format!("alert-{}", uuid::Uuid::new_v4()),
        symbol: symbol.to_string(),
        side,
        tier,
        strength,
        entry_price: None,
        stop_loss: None,
        take_profits: vec![],
    }
}
