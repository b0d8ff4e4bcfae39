// src/storage/mod.rs
use crate::config::EngineSettings;
use crate::types::{
    GuardLogEntry, HistoryRecord, LockAcquisition, LockOutcome, OpeningLock, Position, Side,
    SymbolBan,
};
use anyhow::Result;
use async_trait::async_trait;

pub mod json;

pub use json::JsonLedger;

/// Durable store of what the engine believes is true.
///
/// `acquire_opening_lock` must be an atomic insert-if-absent: two concurrent
/// callers for the same (symbol, side) never both get `Acquired`.
#[async_trait]
pub trait Ledger: Send + Sync {
    async fn load_settings(&self) -> Result<EngineSettings>;

    /// Positions with status `opening` or `open`.
    async fn load_open_positions(&self) -> Result<Vec<Position>>;

    async fn upsert_position(&self, position: &Position) -> Result<()>;

    async fn append_history(&self, record: HistoryRecord) -> Result<()>;

    async fn acquire_opening_lock(&self, symbol: &str, side: Side) -> Result<LockAcquisition>;

    async fn release_opening_lock(&self, lock_id: &str, outcome: LockOutcome) -> Result<()>;

    /// The in-flight lock for (symbol, side), if any.
    async fn find_opening_lock(&self, symbol: &str, side: Side) -> Result<Option<OpeningLock>>;

    async fn load_active_bans(&self) -> Result<Vec<SymbolBan>>;

    async fn ban_symbol(&self, symbol: &str, reason: &str, duration_hours: i64) -> Result<()>;

    async fn append_guard_action_log(&self, entry: GuardLogEntry) -> Result<()>;
}
