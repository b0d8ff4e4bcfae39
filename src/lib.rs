// src/lib.rs
//! Position reconciliation and guard engine for leveraged linear derivatives.

pub mod config;
pub mod connectors;
pub mod core;
pub mod error;
pub mod storage;
pub mod types;
pub mod utils;
