//! Polymarket API clients and the gateway traits the engine runs against.

mod clob_client;
mod data_client;
mod gateway;
mod paper;
mod types;

pub use clob_client::{ClobCredentials, ClobGateway, OrderBook, OrderBookClient};
pub use data_client::DataClient;
pub use gateway::{ExecutionGateway, LedgerProvider, SellFill, SellOrder};
pub use paper::PaperGateway;

use reqwest::StatusCode;

use crate::error::EngineError;

/// Map a non-success read response: 429 backs off, anything else is transient.
fn upstream_error(status: StatusCode, body: &str) -> EngineError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        EngineError::RateLimited
    } else {
        EngineError::Provider(format!("{} - {}", status, body))
    }
}
