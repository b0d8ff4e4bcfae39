// src/connectors/mod.rs
pub mod bybit;
pub mod paper;
pub mod rate_limiter;
pub mod retry;
pub mod signing;
pub mod traits;
