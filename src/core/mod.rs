// src/core/mod.rs
pub mod confirmation;
pub mod conflict;
pub mod engine;
pub mod executor;
pub mod guards;
pub mod ladder;
pub mod repair_limiter;

pub use engine::{CycleReport, GuardEngine, SignalOutcome};
