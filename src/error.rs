//! Error taxonomy shared by the risk engine, signal detector and gateways.
//!
//! Every variant is scoped to a single position or wallet. Loops log and move
//! on; nothing here is meant to abort a cycle.

use rust_decimal::Decimal;
use thiserror::Error;

/// Engine error types.
#[derive(Error, Debug)]
pub enum EngineError {
    /// Transient upstream failure (timeout, 5xx, malformed body). Retried next cycle.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Upstream answered 429. Reported to the rate limiter, never fatal.
    #[error("Rate limited by upstream provider")]
    RateLimited,

    /// A sell call failed. The position is left untouched.
    #[error("Execution error: {0}")]
    Execution(String),

    /// Inputs that would produce a malformed trade.
    #[error("Data inconsistency: {0}")]
    DataInconsistency(String),

    #[error("Store error: {0}")]
    Store(#[from] sqlx::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    SerdeJson(#[from] serde_json::Error),
}

impl EngineError {
    pub fn inconsistent(what: &str, value: Decimal) -> Self {
        EngineError::DataInconsistency(format!("{} = {}", what, value))
    }

    /// Errors that should be retried on the next cycle without operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::Provider(_) | EngineError::RateLimited | EngineError::Http(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_transient_classification() {
        assert!(EngineError::RateLimited.is_transient());
        assert!(EngineError::Provider("503".into()).is_transient());
        assert!(!EngineError::Execution("no bids".into()).is_transient());
        assert!(!EngineError::inconsistent("price", dec!(-1)).is_transient());
    }

    #[test]
    fn test_inconsistency_message() {
        let err = EngineError::inconsistent("current_price", dec!(0));
        assert_eq!(err.to_string(), "Data inconsistency: current_price = 0");
    }
}
