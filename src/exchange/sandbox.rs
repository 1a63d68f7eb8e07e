//! In-memory exchange simulator.
//!
//! Fills every order instantly at the quoted bid/ask, charges the configured
//! fee, enforces minimum notionals and keeps per-asset balances. Prices are
//! static unless moved with [`SandboxConnector::set_quote`], which makes the
//! venue deterministic for demos and tests.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::{ConnectorError, ExchangeConnector, Fill};
use crate::clock::Clock;
use crate::config::SandboxConfig;
use crate::types::{to_decimal, Asset, Market, Side};

/// Half the bid/ask spread, as a fraction of mid.
const HALF_SPREAD: f64 = 0.0005;

/// Mid prices: (base, quote, mid).
const DEFAULT_PRICES: &[(&str, &str, f64)] = &[
    ("BTC", "USDT", 50_000.0),
    ("ETH", "USDT", 3_000.0),
    ("BNB", "USDT", 400.0),
    ("SOL", "USDT", 100.0),
    ("XRP", "USDT", 0.6),
    ("ADA", "USDT", 0.5),
    ("DOGE", "USDT", 0.1),
    ("LTC", "USDT", 90.0),
    ("DOT", "USDT", 7.0),
    ("ETH", "BTC", 0.06),
    ("BNB", "BTC", 0.008),
    ("SOL", "BTC", 0.002),
    ("XRP", "BTC", 0.000012),
    ("ADA", "BTC", 0.00001),
    ("LTC", "BTC", 0.0018),
    ("DOT", "BTC", 0.00014),
    ("BNB", "ETH", 0.133),
    ("SOL", "ETH", 0.0333),
    ("XRP", "ETH", 0.0002),
    ("ADA", "ETH", 0.000167),
    ("LTC", "ETH", 0.03),
    ("DOT", "ETH", 0.00233),
];

/// Daily USDT volume per base asset, used to rank liquidity.
const DEFAULT_VOLUMES: &[(&str, f64)] = &[
    ("BTC", 500_000_000.0),
    ("ETH", 300_000_000.0),
    ("BNB", 80_000_000.0),
    ("SOL", 60_000_000.0),
    ("XRP", 40_000_000.0),
    ("ADA", 30_000_000.0),
    ("DOGE", 25_000_000.0),
    ("LTC", 15_000_000.0),
    ("DOT", 10_000_000.0),
];

struct SandboxState {
    markets: BTreeMap<String, Market>,
    balances: HashMap<Asset, Decimal>,
}

/// A simulated spot venue.
pub struct SandboxConnector {
    state: Mutex<SandboxState>,
    clock: Arc<dyn Clock>,
}

impl SandboxConnector {
    /// Build the default market set from configuration.
    pub fn new(config: &SandboxConfig, clock: Arc<dyn Clock>) -> Self {
        let markets = default_markets(config, &clock);
        let balances = config
            .balances
            .iter()
            .map(|(asset, amount)| (asset.to_uppercase(), to_decimal(*amount)))
            .collect();
        Self::with_markets(markets, balances, clock)
    }

    /// Build a venue with an explicit market list.
    pub fn with_markets(
        markets: Vec<Market>,
        balances: HashMap<Asset, Decimal>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let markets = markets.into_iter().map(|m| (m.symbol.clone(), m)).collect();
        Self {
            state: Mutex::new(SandboxState { markets, balances }),
            clock,
        }
    }

    /// Move a market's prices.
    pub async fn set_quote(&self, symbol: &str, bid: f64, ask: f64) -> bool {
        let mut state = self.state.lock().await;
        match state.markets.get_mut(symbol) {
            Some(m) => {
                m.bid = bid;
                m.ask = ask;
                m.timestamp = self.clock.now();
                true
            }
            None => false,
        }
    }

    /// Current balance of one asset.
    pub async fn balance(&self, asset: &str) -> Decimal {
        let state = self.state.lock().await;
        state.balances.get(asset).copied().unwrap_or(Decimal::ZERO)
    }

    /// Snapshot of every non-zero balance.
    pub async fn balances(&self) -> HashMap<Asset, Decimal> {
        let state = self.state.lock().await;
        state
            .balances
            .iter()
            .filter(|(_, v)| !v.is_zero())
            .map(|(k, v)| (k.clone(), *v))
            .collect()
    }
}

fn default_markets(config: &SandboxConfig, clock: &Arc<dyn Clock>) -> Vec<Market> {
    let now = clock.now();
    let volumes: HashMap<&str, f64> = DEFAULT_VOLUMES.iter().copied().collect();
    let usd_price = |asset: &str| -> f64 {
        if asset == "USDT" {
            return 1.0;
        }
        DEFAULT_PRICES
            .iter()
            .find(|(b, q, _)| *b == asset && *q == "USDT")
            .map(|(_, _, p)| *p)
            .unwrap_or(1.0)
    };

    DEFAULT_PRICES
        .iter()
        .map(|&(base, quote, mid)| {
            // Cross pairs trade a fraction of the USDT book.
            let share = if quote == "USDT" { 1.0 } else { 0.25 };
            Market {
                symbol: format!("{base}{quote}"),
                base: base.to_string(),
                quote: quote.to_string(),
                bid: mid * (1.0 - HALF_SPREAD),
                ask: mid * (1.0 + HALF_SPREAD),
                fee_rate: config.fee_rate,
                min_notional: config.min_notional / usd_price(quote),
                liquidity: volumes.get(base).copied().unwrap_or(1_000_000.0) * share,
                timestamp: now,
            }
        })
        .collect()
}

#[async_trait]
impl ExchangeConnector for SandboxConnector {
    async fn get_quotes(&self) -> Result<Vec<Market>, ConnectorError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        // A live venue streams quotes; here every read is fresh.
        for m in state.markets.values_mut() {
            m.timestamp = now;
        }
        Ok(state.markets.values().cloned().collect())
    }

    async fn convert(&self, symbol: &str, side: Side, amount: Decimal) -> Result<Fill, ConnectorError> {
        let mut state = self.state.lock().await;
        let market = state
            .markets
            .get(symbol)
            .cloned()
            .ok_or_else(|| ConnectorError::Fatal(format!("unknown symbol {symbol}")))?;

        if amount <= Decimal::ZERO {
            return Ok(Fill::rejected("amount must be positive"));
        }

        let bid = to_decimal(market.bid);
        let ask = to_decimal(market.ask);
        let keep = Decimal::ONE - to_decimal(market.fee_rate);
        let min_notional = to_decimal(market.min_notional);

        let (spent, received, notional, output) = match side {
            Side::Buy => {
                if ask.is_zero() {
                    return Ok(Fill::rejected("no ask"));
                }
                (&market.quote, &market.base, amount, amount / ask * keep)
            }
            Side::Sell => (&market.base, &market.quote, amount * bid, amount * bid * keep),
        };

        if notional < min_notional {
            return Ok(Fill::rejected(format!(
                "notional {notional:.8} below minimum {min_notional:.8} {}",
                market.quote
            )));
        }

        let available = state.balances.get(spent).copied().unwrap_or(Decimal::ZERO);
        if available < amount {
            return Ok(Fill::rejected(format!(
                "insufficient {spent} balance: have {available:.8}, need {amount:.8}"
            )));
        }

        *state.balances.entry(spent.clone()).or_insert(Decimal::ZERO) -= amount;
        *state.balances.entry(received.clone()).or_insert(Decimal::ZERO) += output;

        debug!(
            symbol,
            side = %side,
            input = %amount,
            output = %output,
            "Sandbox fill"
        );

        Ok(Fill::filled(output))
    }

    async fn list_assets(&self) -> Result<Vec<Asset>, ConnectorError> {
        let state = self.state.lock().await;
        let assets: BTreeSet<Asset> = state
            .markets
            .values()
            .flat_map(|m| [m.base.clone(), m.quote.clone()])
            .collect();
        info!(count = assets.len(), "Sandbox assets listed");
        Ok(assets.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::exchange::FillStatus;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn make_sandbox() -> SandboxConnector {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new(Utc::now()));
        SandboxConnector::new(&SandboxConfig::default(), clock)
    }

    #[tokio::test]
    async fn test_default_quotes_are_tradable() {
        let sandbox = make_sandbox();
        let quotes = sandbox.get_quotes().await.unwrap();
        assert_eq!(quotes.len(), DEFAULT_PRICES.len());
        assert!(quotes.iter().all(|m| m.is_tradable()));
    }

    #[tokio::test]
    async fn test_list_assets_sorted_and_unique() {
        let sandbox = make_sandbox();
        let assets = sandbox.list_assets().await.unwrap();
        assert!(assets.contains(&"USDT".to_string()));
        assert!(assets.contains(&"BTC".to_string()));
        let mut sorted = assets.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(assets, sorted);
    }

    #[tokio::test]
    async fn test_buy_then_sell_moves_balances() {
        let sandbox = make_sandbox();
        let fill = sandbox.convert("BTCUSDT", Side::Buy, dec!(1000)).await.unwrap();
        assert_eq!(fill.status, FillStatus::Filled);
        assert!(fill.filled_amount > Decimal::ZERO);
        assert_eq!(sandbox.balance("USDT").await, dec!(9000));
        assert_eq!(sandbox.balance("BTC").await, fill.filled_amount);

        let back = sandbox
            .convert("BTCUSDT", Side::Sell, fill.filled_amount)
            .await
            .unwrap();
        assert_eq!(back.status, FillStatus::Filled);
        // Spread and two fees make the round trip lose a little.
        assert!(back.filled_amount < dec!(1000));
        assert!(back.filled_amount > dec!(990));
    }

    #[tokio::test]
    async fn test_below_min_notional_rejected() {
        let sandbox = make_sandbox();
        let fill = sandbox.convert("BTCUSDT", Side::Buy, dec!(5)).await.unwrap();
        assert!(matches!(fill.status, FillStatus::Rejected(_)));
        assert_eq!(sandbox.balance("USDT").await, dec!(10000));
    }

    #[tokio::test]
    async fn test_insufficient_balance_rejected() {
        let sandbox = make_sandbox();
        let fill = sandbox.convert("ETHUSDT", Side::Sell, dec!(1)).await.unwrap();
        assert!(matches!(fill.status, FillStatus::Rejected(_)));
    }

    #[tokio::test]
    async fn test_unknown_symbol_is_fatal() {
        let sandbox = make_sandbox();
        let err = sandbox.convert("FOOBAR", Side::Buy, dec!(100)).await.unwrap_err();
        assert!(matches!(err, ConnectorError::Fatal(_)));
    }

    #[tokio::test]
    async fn test_set_quote() {
        let sandbox = make_sandbox();
        assert!(sandbox.set_quote("ETHBTC", 0.061, 0.0611).await);
        assert!(!sandbox.set_quote("NOPE", 1.0, 1.0).await);
        let quotes = sandbox.get_quotes().await.unwrap();
        let eth_btc = quotes.iter().find(|m| m.symbol == "ETHBTC").unwrap();
        assert_eq!(eth_btc.bid, 0.061);
    }
}
