// src/storage/json.rs
use crate::config::EngineSettings;
use crate::storage::Ledger;
use crate::types::{
    GuardLogEntry, HistoryRecord, LockAcquisition, LockOutcome, LockStatus, OpeningLock,
    Position, PositionStatus, Side, SymbolBan,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
struct LedgerState {
    positions: Vec<Position>,
    history: Vec<HistoryRecord>,
    locks: Vec<OpeningLock>,
    bans: Vec<SymbolBan>,
    guard_log: Vec<GuardLogEntry>,
}

/// Audit entries (history, guard log) and settled positions kept by default.
pub const DEFAULT_RETENTION: usize = 10_000;

/// Ledger kept in memory and mirrored to a pretty-printed JSON file after every write.
///
/// Without a path it is purely in-memory. Every write prunes settled locks and
/// expired bans, and trims audit lists to the retention limit.
pub struct JsonLedger {
    path: Option<PathBuf>,
    settings: EngineSettings,
    retention: usize,
    state: Mutex<LedgerState>,
}

fn trim_front<T>(items: &mut Vec<T>, keep: usize) {
    if items.len() > keep {
        let excess = items.len() - keep;
        items.drain(..excess);
    }
}

impl JsonLedger {
    pub fn in_memory(settings: EngineSettings) -> Self {
        Self {
            path: None,
            settings,
            retention: DEFAULT_RETENTION,
            state: Mutex::new(LedgerState::default()),
        }
    }

    /// Opens (or starts) the ledger file at `path`.
    pub async fn open(path: impl Into<PathBuf>, settings: EngineSettings) -> Result<Self> {
        let path = path.into();
        let state = match tokio::fs::read_to_string(&path).await {
            Ok(data) => serde_json::from_str::<LedgerState>(&data)
                .with_context(|| format!("corrupt ledger file {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => LedgerState::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("cannot read ledger {}", path.display()))
            }
        };
        info!(
            "Restored ledger: {} positions, {} bans",
            state.positions.len(),
            state.bans.len()
        );
        Ok(Self {
            path: Some(path),
            settings,
            retention: DEFAULT_RETENTION,
            state: Mutex::new(state),
        })
    }

    pub fn with_retention(mut self, entries: usize) -> Self {
        self.retention = entries.max(1);
        self
    }

    fn prune(&self, state: &mut LedgerState) {
        let now = Utc::now();
        let closed: Vec<String> = state
            .positions
            .iter()
            .filter(|p| p.status == PositionStatus::Closed)
            .map(|p| p.id.clone())
            .collect();

        state.locks.retain(|l| match l.status {
            LockStatus::Closed => false,
            LockStatus::Opening => self.lock_is_live(l),
            LockStatus::Active => !l
                .position_id
                .as_ref()
                .is_some_and(|id| closed.contains(id)),
        });
        state.bans.retain(|b| b.is_active(now));

        if closed.len() > self.retention {
            let oldest = &closed[..closed.len() - self.retention];
            state.positions.retain(|p| !oldest.contains(&p.id));
        }
        trim_front(&mut state.history, self.retention);
        trim_front(&mut state.guard_log, self.retention);
    }

    /// Prunes, then replaces the file through a temp file so a crash never leaves it half written.
    async fn persist(&self, state: &mut LedgerState) -> Result<()> {
        self.prune(state);
        let Some(path) = &self.path else {
            return Ok(());
        };
        let data = serde_json::to_string_pretty(state)?;
        let tmp = path.with_extension("json.tmp");
        let written = match tokio::fs::write(&tmp, data).await {
            Ok(()) => tokio::fs::rename(&tmp, path).await,
            Err(e) => Err(e),
        };
        if let Err(e) = written {
            error!("Failed to save ledger: {}", e);
            return Err(e).with_context(|| format!("cannot write ledger {}", path.display()));
        }
        Ok(())
    }

    pub async fn positions(&self) -> Vec<Position> {
        self.state.lock().await.positions.clone()
    }

    pub async fn position(&self, id: &str) -> Option<Position> {
        self.state
            .lock()
            .await
            .positions
            .iter()
            .find(|p| p.id == id)
            .cloned()
    }

    pub async fn history(&self) -> Vec<HistoryRecord> {
        self.state.lock().await.history.clone()
    }

    pub async fn guard_log(&self) -> Vec<GuardLogEntry> {
        self.state.lock().await.guard_log.clone()
    }

    pub async fn locks(&self) -> Vec<OpeningLock> {
        self.state.lock().await.locks.clone()
    }

    fn lock_is_live(&self, lock: &OpeningLock) -> bool {
        let ttl = Duration::seconds(self.settings.guard.opening_lock_ttl_secs);
        lock.status == LockStatus::Opening && Utc::now() - lock.created_at < ttl
    }
}

#[async_trait]
impl Ledger for JsonLedger {
    async fn load_settings(&self) -> Result<EngineSettings> {
        Ok(self.settings.clone())
    }

    async fn load_open_positions(&self) -> Result<Vec<Position>> {
        Ok(self
            .state
            .lock()
            .await
            .positions
            .iter()
            .filter(|p| p.status != PositionStatus::Closed)
            .cloned()
            .collect())
    }

    async fn upsert_position(&self, position: &Position) -> Result<()> {
        let mut state = self.state.lock().await;
        match state.positions.iter_mut().find(|p| p.id == position.id) {
            Some(existing) => *existing = position.clone(),
            None => state.positions.push(position.clone()),
        }
        self.persist(&mut state).await
    }

    async fn append_history(&self, record: HistoryRecord) -> Result<()> {
        let mut state = self.state.lock().await;
        state.history.push(record);
        self.persist(&mut state).await
    }

    async fn acquire_opening_lock(&self, symbol: &str, side: Side) -> Result<LockAcquisition> {
        let mut state = self.state.lock().await;
        if let Some(existing) = state
            .locks
            .iter()
            .find(|l| l.symbol == symbol && l.side == side && self.lock_is_live(l))
        {
            return Ok(LockAcquisition::Busy(existing.clone()));
        }

        // expired in-flight locks for this pair are dead
        for stale in state
            .locks
            .iter_mut()
            .filter(|l| l.symbol == symbol && l.side == side && l.status == LockStatus::Opening)
        {
            stale.status = LockStatus::Closed;
        }

        let id = Uuid::new_v4().to_string();
        state.locks.push(OpeningLock {
            id: id.clone(),
            symbol: symbol.to_string(),
            side,
            status: LockStatus::Opening,
            position_id: None,
            created_at: Utc::now(),
        });
        self.persist(&mut state).await?;
        Ok(LockAcquisition::Acquired(id))
    }

    async fn release_opening_lock(&self, lock_id: &str, outcome: LockOutcome) -> Result<()> {
        let mut state = self.state.lock().await;
        let lock = state
            .locks
            .iter_mut()
            .find(|l| l.id == lock_id)
            .with_context(|| format!("unknown opening lock {lock_id}"))?;
        match outcome {
            LockOutcome::Active { position_id } => {
                lock.status = LockStatus::Active;
                lock.position_id = Some(position_id);
            }
            LockOutcome::Failed => lock.status = LockStatus::Closed,
        }
        self.persist(&mut state).await
    }

    async fn find_opening_lock(&self, symbol: &str, side: Side) -> Result<Option<OpeningLock>> {
        let state = self.state.lock().await;
        Ok(state
            .locks
            .iter()
            .find(|l| l.symbol == symbol && l.side == side && self.lock_is_live(l))
            .cloned())
    }

    async fn load_active_bans(&self) -> Result<Vec<SymbolBan>> {
        let now = Utc::now();
        Ok(self
            .state
            .lock()
            .await
            .bans
            .iter()
            .filter(|b| b.is_active(now))
            .cloned()
            .collect())
    }

    async fn ban_symbol(&self, symbol: &str, reason: &str, duration_hours: i64) -> Result<()> {
        let now = Utc::now();
        let expires_at = now + Duration::hours(duration_hours);
        let mut state = self.state.lock().await;
        if let Some(longer) = state
            .bans
            .iter()
            .find(|b| b.symbol == symbol && b.is_active(now) && b.expires_at >= expires_at)
        {
            warn!(
                "{} already banned until {} ({}), keeping it over '{}'",
                symbol, longer.expires_at, longer.reason, reason
            );
            return Ok(());
        }
        state.bans.retain(|b| b.symbol != symbol || !b.is_active(now));
        state.bans.push(SymbolBan {
            symbol: symbol.to_string(),
            banned_at: now,
            expires_at,
            reason: reason.to_string(),
        });
        self.persist(&mut state).await
    }

    async fn append_guard_action_log(&self, entry: GuardLogEntry) -> Result<()> {
        let mut state = self.state.lock().await;
        state.guard_log.push(entry);
        self.persist(&mut state).await
    }
}
