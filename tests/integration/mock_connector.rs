//! Mock exchange for integration testing.
//!
//! Provides a deterministic `ExchangeConnector` whose quotes, fills and
//! failures are fully controllable from test code. Quote timestamps follow
//! a `ManualClock`, so rate expiry is driven by advancing that clock.

use async_trait::async_trait;
use rust_decimal::Decimal;
use std::collections::{BTreeSet, VecDeque};
use std::sync::{Arc, Mutex};

use triangulum::clock::{Clock, ManualClock};
use triangulum::exchange::{ConnectorError, ExchangeConnector, Fill};
use triangulum::types::{to_decimal, Asset, Market, Side};

/// One `convert` call as the venue saw it.
#[derive(Debug, Clone, PartialEq)]
pub struct Conversion {
    pub symbol: String,
    pub side: Side,
    pub amount: Decimal,
}

pub struct MockConnector {
    clock: Arc<ManualClock>,
    markets: Arc<Mutex<Vec<Market>>>,
    /// Multiplier applied to every computed fill; below 1 simulates slippage.
    fill_factor: Arc<Mutex<Decimal>>,
    /// Fills returned verbatim before any computed fill.
    scripted: Arc<Mutex<VecDeque<Fill>>>,
    /// Number of upcoming `convert` calls that fail transiently.
    transient_failures: Arc<Mutex<u32>>,
    /// If set, every operation fails with this message.
    force_error: Arc<Mutex<Option<String>>>,
    conversions: Arc<Mutex<Vec<Conversion>>>,
}

impl MockConnector {
    pub fn new(clock: Arc<ManualClock>, markets: Vec<Market>) -> Self {
        Self {
            clock,
            markets: Arc::new(Mutex::new(markets)),
            fill_factor: Arc::new(Mutex::new(Decimal::ONE)),
            scripted: Arc::new(Mutex::new(VecDeque::new())),
            transient_failures: Arc::new(Mutex::new(0)),
            force_error: Arc::new(Mutex::new(None)),
            conversions: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// The USDT → BTC → ETH → USDT triangle. BTC trades at 40 000 USDT and
    /// ETH at 0.0625 BTC; `eth_usdt` sets the closing price. Zero fees,
    /// zero minimums, bid equals ask.
    pub fn triangle(clock: Arc<ManualClock>, eth_usdt: f64) -> Self {
        let now = clock.now();
        let markets = vec![
            market("BTC", "USDT", 40_000.0, now),
            market("ETH", "BTC", 0.0625, now),
            market("ETH", "USDT", eth_usdt, now),
        ];
        Self::new(clock, markets)
    }

    pub fn set_fill_factor(&self, factor: Decimal) {
        *self.fill_factor.lock().unwrap() = factor;
    }

    pub fn script_fills(&self, fills: Vec<Fill>) {
        self.scripted.lock().unwrap().extend(fills);
    }

    pub fn fail_transiently(&self, times: u32) {
        *self.transient_failures.lock().unwrap() = times;
    }

    pub fn set_error(&self, msg: &str) {
        *self.force_error.lock().unwrap() = Some(msg.to_string());
    }

    pub fn clear_error(&self) {
        *self.force_error.lock().unwrap() = None;
    }

    pub fn set_min_notional(&self, symbol: &str, min_notional: f64) {
        let mut markets = self.markets.lock().unwrap();
        if let Some(m) = markets.iter_mut().find(|m| m.symbol == symbol) {
            m.min_notional = min_notional;
        }
    }

    pub fn conversions(&self) -> Vec<Conversion> {
        self.conversions.lock().unwrap().clone()
    }
}

pub fn market(base: &str, quote: &str, price: f64, now: chrono::DateTime<chrono::Utc>) -> Market {
    Market {
        symbol: format!("{base}{quote}"),
        base: base.into(),
        quote: quote.into(),
        bid: price,
        ask: price,
        fee_rate: 0.0,
        min_notional: 0.0,
        liquidity: 1_000_000.0,
        timestamp: now,
    }
}

#[async_trait]
impl ExchangeConnector for MockConnector {
    async fn get_quotes(&self) -> Result<Vec<Market>, ConnectorError> {
        if let Some(msg) = self.force_error.lock().unwrap().clone() {
            return Err(ConnectorError::Transient(msg));
        }
        let now = self.clock.now();
        let mut markets = self.markets.lock().unwrap().clone();
        for m in &mut markets {
            m.timestamp = now;
        }
        Ok(markets)
    }

    async fn convert(&self, symbol: &str, side: Side, amount: Decimal) -> Result<Fill, ConnectorError> {
        if let Some(msg) = self.force_error.lock().unwrap().clone() {
            return Err(ConnectorError::Fatal(msg));
        }
        {
            let mut failures = self.transient_failures.lock().unwrap();
            if *failures > 0 {
                *failures -= 1;
                return Err(ConnectorError::Transient("venue busy".into()));
            }
        }

        self.conversions.lock().unwrap().push(Conversion {
            symbol: symbol.to_string(),
            side,
            amount,
        });

        if let Some(fill) = self.scripted.lock().unwrap().pop_front() {
            return Ok(fill);
        }

        let market = self
            .markets
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.symbol == symbol)
            .cloned()
            .ok_or_else(|| ConnectorError::Fatal(format!("unknown symbol {symbol}")))?;

        let gross = match side {
            Side::Buy => amount / to_decimal(market.ask),
            Side::Sell => amount * to_decimal(market.bid),
        };
        let net = gross * (Decimal::ONE - to_decimal(market.fee_rate)) * *self.fill_factor.lock().unwrap();
        Ok(Fill::filled(net))
    }

    async fn list_assets(&self) -> Result<Vec<Asset>, ConnectorError> {
        let markets = self.markets.lock().unwrap();
        let assets: BTreeSet<Asset> = markets
            .iter()
            .flat_map(|m| [m.base.clone(), m.quote.clone()])
            .collect();
        Ok(assets.into_iter().collect())
    }
}
