//! Conversion-rate graph.
//!
//! One snapshot of every tradable conversion: node = asset, edge A→B = the
//! best net rate (after fee) for turning one unit of A into B. Built in a
//! single pass over the quotes and never mutated afterwards.

use chrono::{DateTime, Duration, Utc};
use std::collections::BTreeMap;
use tracing::debug;

use crate::types::{Asset, Market, Side};

/// A directed conversion between two assets through one market.
#[derive(Debug, Clone, PartialEq)]
pub struct RateEdge {
    pub from: Asset,
    pub to: Asset,
    pub symbol: String,
    pub side: Side,
    /// Units of `to` received per unit of `from`, net of fee.
    pub rate: f64,
    /// Market minimum notional re-expressed in `from` units.
    pub min_input: f64,
    pub liquidity: f64,
}

/// Immutable rate snapshot.
#[derive(Debug, Clone)]
pub struct RateGraph {
    edges: BTreeMap<Asset, BTreeMap<Asset, RateEdge>>,
    liquidity: BTreeMap<Asset, f64>,
    excluded: Vec<String>,
    timestamp: DateTime<Utc>,
}

impl RateGraph {
    /// Build a snapshot from raw quotes. Quotes older than `max_age` at
    /// `now`, crossed or non-positive books and out-of-range fees are
    /// left out and listed in [`RateGraph::excluded_markets`].
    pub fn build(markets: &[Market], now: DateTime<Utc>, max_age: Duration) -> Self {
        let mut graph = Self {
            edges: BTreeMap::new(),
            liquidity: BTreeMap::new(),
            excluded: Vec::new(),
            timestamp: now,
        };

        for m in markets {
            if let Some(reason) = exclusion_reason(m, now, max_age) {
                debug!(symbol = %m.symbol, reason, "Market excluded from rate graph");
                graph.excluded.push(m.symbol.clone());
                continue;
            }

            let keep = 1.0 - m.fee_rate;
            let min_notional = m.min_notional.max(0.0);

            graph.insert(RateEdge {
                from: m.base.clone(),
                to: m.quote.clone(),
                symbol: m.symbol.clone(),
                side: Side::Sell,
                rate: m.bid * keep,
                min_input: min_notional / m.bid,
                liquidity: m.liquidity,
            });
            graph.insert(RateEdge {
                from: m.quote.clone(),
                to: m.base.clone(),
                symbol: m.symbol.clone(),
                side: Side::Buy,
                rate: keep / m.ask,
                min_input: min_notional,
                liquidity: m.liquidity,
            });

            *graph.liquidity.entry(m.base.clone()).or_insert(0.0) += m.liquidity;
            *graph.liquidity.entry(m.quote.clone()).or_insert(0.0) += m.liquidity;
        }

        graph
    }

    /// Keep the better of two markets offering the same directed pair.
    fn insert(&mut self, edge: RateEdge) {
        let slot = self.edges.entry(edge.from.clone()).or_default();
        match slot.get(&edge.to) {
            Some(existing) if existing.rate >= edge.rate => {}
            _ => {
                slot.insert(edge.to.clone(), edge);
            }
        }
    }

    /// Every asset that appears in at least one usable market, sorted.
    pub fn assets(&self) -> Vec<&Asset> {
        self.liquidity.keys().collect()
    }

    /// Outgoing edges of `asset`, sorted by destination.
    pub fn edges_from(&self, asset: &str) -> impl Iterator<Item = &RateEdge> {
        self.edges.get(asset).into_iter().flat_map(|m| m.values())
    }

    pub fn edge(&self, from: &str, to: &str) -> Option<&RateEdge> {
        self.edges.get(from).and_then(|m| m.get(to))
    }

    /// Summed liquidity of usable markets touching `asset`.
    pub fn liquidity(&self, asset: &str) -> f64 {
        self.liquidity.get(asset).copied().unwrap_or(0.0)
    }

    /// Assets reachable from `base` in one conversion, sorted.
    pub fn connected_assets(&self, base: &str) -> Vec<&Asset> {
        self.edges_from(base).map(|e| &e.to).collect()
    }

    /// The `n` most liquid assets directly connected to `base`.
    /// Ties rank alphabetically so the selection is deterministic.
    pub fn top_connected_assets(&self, base: &str, n: usize) -> Vec<Asset> {
        let mut ranked: Vec<(&Asset, f64)> = self
            .connected_assets(base)
            .into_iter()
            .map(|a| (a, self.liquidity(a)))
            .collect();
        ranked.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        ranked.into_iter().take(n).map(|(a, _)| a.clone()).collect()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.values().map(|m| m.len()).sum()
    }

    /// Symbols of quotes that were left out of the snapshot.
    pub fn excluded_markets(&self) -> &[String] {
        &self.excluded
    }

    /// When the snapshot was taken.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }
}

fn exclusion_reason(m: &Market, now: DateTime<Utc>, max_age: Duration) -> Option<&'static str> {
    if m.is_stale(now, max_age) {
        Some("stale quote")
    } else if m.base == m.quote {
        Some("self pair")
    } else if !m.is_tradable() {
        Some("untradable book")
    } else {
        None
    }
}
