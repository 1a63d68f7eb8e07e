//! One-shot arbitrage scan.
//!
//! Pulls every quote from the exchange, builds a single rate snapshot,
//! enumerates cycles through the base asset and returns the ranked chains
//! that clear the profit threshold. Task loops go through a short-lived
//! result cache so several tasks scanning the same market share one fetch.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::finder::ChainFinder;
use super::graph::RateGraph;
use crate::clock::Clock;
use crate::config::ScanConfig;
use crate::exchange::ExchangeConnector;
use crate::types::{Asset, EngineError, ScanRequest, ScanResult, ScanSummary};

/// Scans the exchange for arbitrage cycles.
pub struct ScanService {
    connector: Arc<dyn ExchangeConnector>,
    clock: Arc<dyn Clock>,
    config: ScanConfig,
    cache: Mutex<HashMap<String, (ScanResult, DateTime<Utc>)>>,
}

impl ScanService {
    pub fn new(connector: Arc<dyn ExchangeConnector>, clock: Arc<dyn Clock>, config: ScanConfig) -> Self {
        Self {
            connector,
            clock,
            config,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ScanConfig {
        &self.config
    }

    /// Reject requests no search could satisfy.
    pub fn validate(&self, req: &ScanRequest) -> Result<(), EngineError> {
        let invalid = |msg: String| Err(EngineError::InvalidParameters(msg));
        let (min_len, max_len) = (self.config.min_chain_length, self.config.max_chain_length);

        if req.base_asset.trim().is_empty() {
            return invalid("base asset must not be blank".into());
        }
        if !(min_len..=max_len).contains(&req.chain_length) {
            return invalid(format!(
                "chain length {} outside {min_len}..={max_len}",
                req.chain_length
            ));
        }
        if req.max_assets < req.chain_length {
            return invalid(format!(
                "max assets {} cannot hold a cycle of length {}",
                req.max_assets, req.chain_length
            ));
        }
        if !req.min_profit_percent.is_finite() {
            return invalid("min profit percent must be finite".into());
        }
        Ok(())
    }

    /// Scan for chains through `req.base_asset` that clear
    /// `req.min_profit_percent`, best first.
    pub async fn scan(&self, req: &ScanRequest) -> Result<ScanResult, EngineError> {
        self.validate(req)?;
        let base = req.base_asset.trim().to_uppercase();

        let quotes = self.connector.get_quotes().await.map_err(|e| {
            warn!(error = %e, "Quote fetch failed");
            EngineError::RateUnavailable(e.to_string())
        })?;

        let now = self.clock.now();
        let graph = RateGraph::build(
            &quotes,
            now,
            Duration::seconds(self.config.quote_max_age_secs),
        );
        if !graph.excluded_markets().is_empty() {
            debug!(
                excluded = graph.excluded_markets().len(),
                "Markets left out of snapshot"
            );
        }

        let universe = graph.top_connected_assets(&base, req.max_assets - 1).len();
        let found = ChainFinder::new(&graph).find(&base, req.chain_length, req.max_assets);
        let total_chains = found.len();

        // Finder output is already ranked; filtering keeps the order.
        let chains: Vec<_> = found
            .into_iter()
            .filter(|c| c.profit_percent >= req.min_profit_percent)
            .collect();

        let summary = ScanSummary {
            assets_analyzed: if universe > 0 { universe + 1 } else { 0 },
            total_chains,
            profitable_chains: chains.len(),
            best_profit_percent: chains.first().map(|c| c.profit_percent),
            timestamp: now,
        };

        info!(
            base = %base,
            length = req.chain_length,
            quotes = quotes.len(),
            edges = graph.edge_count(),
            summary = %summary,
            "Scan complete"
        );

        Ok(ScanResult { chains, summary })
    }

    /// Like [`scan`](Self::scan), but reuses a result for the same request
    /// captured less than `result_cache_secs` ago. Failures are not cached.
    pub async fn scan_cached(&self, req: &ScanRequest) -> Result<ScanResult, EngineError> {
        if self.config.result_cache_secs <= 0 {
            return self.scan(req).await;
        }
        self.validate(req)?;
        let key = cache_key(req);
        let validity = Duration::seconds(self.config.result_cache_secs);

        {
            let cache = self.cache.lock().await;
            if let Some((result, at)) = cache.get(&key) {
                if self.clock.now() - *at < validity {
                    debug!(key = %key, "Scan served from cache");
                    return Ok(result.clone());
                }
            }
        }

        let result = self.scan(req).await?;
        let now = self.clock.now();
        let mut cache = self.cache.lock().await;
        cache.retain(|_, (_, at)| now - *at < validity);
        cache.insert(key, (result.clone(), now));
        Ok(result)
    }

    /// Assets the exchange lists.
    pub async fn list_assets(&self) -> Result<Vec<Asset>, EngineError> {
        self.connector
            .list_assets()
            .await
            .map_err(|e| EngineError::RateUnavailable(e.to_string()))
    }
}

fn cache_key(req: &ScanRequest) -> String {
    format!(
        "{}_{}_{}_{:.4}",
        req.base_asset.trim().to_uppercase(),
        req.max_assets,
        req.chain_length,
        req.min_profit_percent
    )
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
