//! Exchange integration.
//!
//! Defines the `ExchangeConnector` trait the engine trades through and
//! provides an in-memory sandbox implementation:
//! - `sandbox`: simulated venue with balances, fees and minimum notionals

pub mod sandbox;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::types::{Asset, EngineError, Market, Side};

/// Outcome of a conversion request that reached the venue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FillStatus {
    Filled,
    /// The venue refused the order (below minimum, unknown symbol, ...).
    Rejected(String),
}

/// Result of one `convert` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    /// Amount of the received asset, net of fees.
    pub filled_amount: Decimal,
    pub status: FillStatus,
}

impl Fill {
    pub fn filled(amount: Decimal) -> Self {
        Self {
            filled_amount: amount,
            status: FillStatus::Filled,
        }
    }

    pub fn rejected(reason: impl Into<String>) -> Self {
        Self {
            filled_amount: Decimal::ZERO,
            status: FillStatus::Rejected(reason.into()),
        }
    }
}

/// Connector failures, split by whether a retry can help.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ConnectorError {
    #[error("transient: {0}")]
    Transient(String),
    #[error("fatal: {0}")]
    Fatal(String),
}

impl From<ConnectorError> for EngineError {
    fn from(e: ConnectorError) -> Self {
        match e {
            ConnectorError::Transient(msg) => EngineError::ConnectorTransient(msg),
            ConnectorError::Fatal(msg) => EngineError::ConnectorFatal(msg),
        }
    }
}

/// Abstraction over a spot exchange.
///
/// Implementors provide quotes for every listed pair and execute single
/// market conversions. Order routing and account handling stay behind
/// this boundary.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeConnector: Send + Sync {
    /// Fetch a quote for every listed market.
    async fn get_quotes(&self) -> Result<Vec<Market>, ConnectorError>;

    /// Convert `amount` of the spent asset on `symbol`. For `Buy` the
    /// amount is in the quote asset, for `Sell` in the base asset.
    async fn convert(&self, symbol: &str, side: Side, amount: Decimal) -> Result<Fill, ConnectorError>;

    /// All assets the venue lists.
    async fn list_assets(&self) -> Result<Vec<Asset>, ConnectorError>;
}
