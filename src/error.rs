// src/error.rs
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Retry class of an exchange failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Network, rate limit, 5xx. Retried with backoff.
    ApiTemporary,
    /// Business rejection. Never retried.
    TradeFault,
    /// Retried conservatively, then treated as a trade fault.
    Unknown,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::ApiTemporary => write!(f, "api_temporary"),
            ErrorClass::TradeFault => write!(f, "trade_fault"),
            ErrorClass::Unknown => write!(f, "unknown"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExchangeError {
    #[error("network error: {0}")]
    Network(String),

    #[error("request timeout: {0}")]
    Timeout(String),

    #[error("rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("server error: {status} - {message}")]
    Server { status: u16, message: String },

    #[error("insufficient balance: {0}")]
    InsufficientBalance(String),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("instrument rule violation: {0}")]
    InstrumentRule(String),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("rejected by exchange: code {code} - {message}")]
    Rejected { code: i64, message: String },

    #[error("unexpected response: {0}")]
    Unexpected(String),

    #[error("gave up after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        last: Box<ExchangeError>,
    },
}

impl ExchangeError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Network(_) | Self::Timeout(_) | Self::RateLimited(_) | Self::Server { .. } => {
                ErrorClass::ApiTemporary
            }
            Self::InsufficientBalance(_)
            | Self::InvalidParameters(_)
            | Self::InstrumentRule(_)
            | Self::Authentication(_) => ErrorClass::TradeFault,
            Self::Rejected { .. } | Self::Unexpected(_) => ErrorClass::Unknown,
            Self::Exhausted { last, .. } => match last.class() {
                ErrorClass::Unknown => ErrorClass::TradeFault,
                other => other,
            },
        }
    }

    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Exhausted { .. }) && self.class() != ErrorClass::TradeFault
    }

    /// Maps a Bybit v5 `retCode` onto the taxonomy.
    pub fn from_ret_code(code: i64, message: impl Into<String>) -> Self {
        let message = message.into();
        match code {
            10006 | 10018 => Self::RateLimited(message),
            10002 | 10016 => Self::Server {
                status: 200,
                message: format!("retCode {code}: {message}"),
            },
            110004 | 110007 | 110012 => Self::InsufficientBalance(message),
            10001 | 110013 | 110017 => Self::InvalidParameters(message),
            110009 | 110094 => Self::InstrumentRule(message),
            10003 | 10004 | 10005 => Self::Authentication(message),
            _ => Self::Rejected { code, message },
        }
    }

    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            429 => Self::RateLimited(message),
            401 | 403 => Self::Authentication(message),
            s if s >= 500 => Self::Server { status: s, message },
            _ => Self::Rejected {
                code: i64::from(status),
                message,
            },
        }
    }
}

impl From<reqwest::Error> for ExchangeError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout(err.to_string())
        } else if err.is_connect() {
            Self::Network(format!("connection failed: {err}"))
        } else if err.is_decode() {
            Self::Unexpected(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ExchangeError {
    fn from(err: serde_json::Error) -> Self {
        Self::Unexpected(err.to_string())
    }
}

pub type ExchangeResult<T> = std::result::Result<T, ExchangeError>;
