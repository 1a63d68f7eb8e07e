//! Service facade over the operations the dashboard and binary call.
//!
//! Wraps the scanner, executor and scheduler behind one handle. Remembers
//! the chains returned by recent scans so a caller can execute one by id,
//! and keeps an audit list of manual executions.

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

use crate::clock::Clock;
use crate::config::AppConfig;
use crate::engine::executor::ExecutionEngine;
use crate::engine::scanner::ScanService;
use crate::engine::scheduler::TaskScheduler;
use crate::exchange::ExchangeConnector;
use crate::storage::TaskStore;
use crate::strategy::risk::RiskController;
use crate::types::{
    Asset, Chain, EngineError, Execution, ScanRequest, ScanResult, Task, TaskParams, TaskStatistics,
    TaskStatus,
};

/// Manual executions kept for inspection.
const MAX_MANUAL_EXECUTIONS: usize = 500;

// ---------------------------------------------------------------------------
// Chain registry
// ---------------------------------------------------------------------------

/// Bounded id → chain map; evicts the oldest id first. A re-scanned chain
/// replaces its previous rates but keeps its place.
struct ChainRegistry {
    capacity: usize,
    chains: HashMap<String, Chain>,
    order: VecDeque<String>,
}

impl ChainRegistry {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            chains: HashMap::new(),
            order: VecDeque::new(),
        }
    }

    fn insert(&mut self, chain: Chain) {
        if self.chains.insert(chain.id.clone(), chain.clone()).is_none() {
            self.order.push_back(chain.id);
        }
        while self.order.len() > self.capacity {
            if let Some(old) = self.order.pop_front() {
                self.chains.remove(&old);
            }
        }
    }

    fn get(&self, id: &str) -> Option<&Chain> {
        self.chains.get(id)
    }

    fn len(&self) -> usize {
        self.chains.len()
    }
}

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct ServiceStatus {
    pub tasks: usize,
    pub running_tasks: usize,
    pub known_chains: usize,
    pub manual_executions: usize,
    pub uptime_secs: i64,
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

pub struct ArbitrageService {
    scan: Arc<ScanService>,
    executor: Arc<ExecutionEngine>,
    scheduler: Arc<TaskScheduler>,
    clock: Arc<dyn Clock>,
    registry: RwLock<ChainRegistry>,
    manual: RwLock<Vec<Execution>>,
    started_at: chrono::DateTime<chrono::Utc>,
}

impl ArbitrageService {
    pub fn new(
        scan: Arc<ScanService>,
        executor: Arc<ExecutionEngine>,
        scheduler: Arc<TaskScheduler>,
        clock: Arc<dyn Clock>,
        registry_size: usize,
    ) -> Self {
        let started_at = clock.now();
        Self {
            scan,
            executor,
            scheduler,
            clock,
            registry: RwLock::new(ChainRegistry::new(registry_size)),
            manual: RwLock::new(Vec::new()),
            started_at,
        }
    }

    /// Wire every component from configuration.
    pub fn from_config(
        config: &AppConfig,
        connector: Arc<dyn ExchangeConnector>,
        clock: Arc<dyn Clock>,
        store: Option<TaskStore>,
    ) -> Self {
        let scan = Arc::new(ScanService::new(connector.clone(), clock.clone(), config.scan.clone()));
        let executor = Arc::new(ExecutionEngine::new(connector, clock.clone(), config.execution.clone()));
        let scheduler = Arc::new(TaskScheduler::new(
            scan.clone(),
            executor.clone(),
            RiskController::new(config.risk.clone()),
            clock.clone(),
            store,
        ));
        Self::new(scan, executor, scheduler, clock, config.scan.chain_registry_size)
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    // ---- scanning ----------------------------------------------------------

    /// Run a one-shot scan and remember the returned chains.
    pub async fn scan(&self, req: &ScanRequest) -> Result<ScanResult, EngineError> {
        let result = self.scan.scan(req).await?;
        let mut registry = self.registry.write().await;
        for chain in &result.chains {
            registry.insert(chain.clone());
        }
        Ok(result)
    }

    pub async fn list_assets(&self) -> Result<Vec<Asset>, EngineError> {
        self.scan.list_assets().await
    }

    /// Execute a previously scanned chain outside any task.
    pub async fn execute_chain(&self, chain_id: &str, amount: Decimal) -> Result<Execution, EngineError> {
        let chain = {
            let registry = self.registry.read().await;
            registry
                .get(chain_id)
                .cloned()
                .ok_or_else(|| EngineError::ChainNotFound(chain_id.to_string()))?
        };

        info!(chain_id, amount = %amount, "Manual execution requested");
        let execution = self.executor.execute(&chain, amount, None).await?;

        let mut manual = self.manual.write().await;
        manual.push(execution.clone());
        if manual.len() > MAX_MANUAL_EXECUTIONS {
            let excess = manual.len() - MAX_MANUAL_EXECUTIONS;
            manual.drain(..excess);
        }
        Ok(execution)
    }

    /// Manual executions, oldest first.
    pub async fn manual_executions(&self) -> Vec<Execution> {
        self.manual.read().await.clone()
    }

    // ---- tasks -------------------------------------------------------------

    pub async fn create_task(&self, params: TaskParams) -> Result<Task, EngineError> {
        self.scheduler.create(params).await
    }

    pub async fn start_task(&self, id: &str) -> Result<Task, EngineError> {
        self.scheduler.start(id).await
    }

    pub async fn stop_task(&self, id: &str) -> Result<Task, EngineError> {
        self.scheduler.stop(id).await
    }

    pub async fn delete_task(&self, id: &str) -> Result<(), EngineError> {
        self.scheduler.delete(id).await
    }

    pub async fn list_tasks(&self) -> Vec<Task> {
        self.scheduler.list().await
    }

    pub async fn get_task(&self, id: &str) -> Result<Task, EngineError> {
        self.scheduler.get(id).await
    }

    pub async fn task_statistics(&self, id: &str) -> Result<TaskStatistics, EngineError> {
        self.scheduler.statistics(id).await
    }

    pub async fn status(&self) -> ServiceStatus {
        let tasks = self.scheduler.list().await;
        ServiceStatus {
            tasks: tasks.len(),
            running_tasks: tasks.iter().filter(|t| t.status == TaskStatus::Running).count(),
            known_chains: self.registry.read().await.len(),
            manual_executions: self.manual.read().await.len(),
            uptime_secs: (self.clock.now() - self.started_at).num_seconds(),
        }
    }

    /// Stop every running task loop.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown().await;
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::exchange::sandbox::SandboxConnector;
    use crate::types::{ExecutionStatus, Market};
    use chrono::{Duration, Utc};
    use rust_decimal_macros::dec;

    fn make_market(base: &str, quote: &str, price: f64, now: chrono::DateTime<Utc>) -> Market {
        Market {
            symbol: format!("{base}{quote}"),
            base: base.into(),
            quote: quote.into(),
            bid: price,
            ask: price,
            fee_rate: 0.0,
            min_notional: 10.0,
            liquidity: 1_000.0,
            timestamp: now,
        }
    }

    fn make_service() -> (ArbitrageService, Arc<ManualClock>, Arc<SandboxConnector>) {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let now = clock.now();
        let mut eth_btc = make_market("ETH", "BTC", 0.0625, now);
        eth_btc.min_notional = 0.0001;
        let markets = vec![
            make_market("BTC", "USDT", 40_000.0, now),
            eth_btc,
            make_market("ETH", "USDT", 2_510.0, now),
        ];
        let mut balances = HashMap::new();
        balances.insert("USDT".to_string(), dec!(1000));
        let sandbox = Arc::new(SandboxConnector::with_markets(markets, balances, clock.clone()));
        let service = ArbitrageService::from_config(&AppConfig::default(), sandbox.clone(), clock.clone(), None);
        (service, clock, sandbox)
    }

    fn request() -> ScanRequest {
        ScanRequest {
            base_asset: "USDT".into(),
            max_assets: 3,
            chain_length: 3,
            min_profit_percent: 0.3,
        }
    }

    #[tokio::test]
    async fn test_scan_then_execute_by_id() {
        let (service, _clock, sandbox) = make_service();
        let result = service.scan(&request()).await.unwrap();
        let chain_id = result.chains[0].id.clone();

        let exec = service.execute_chain(&chain_id, dec!(100)).await.unwrap();
        assert_eq!(exec.status, ExecutionStatus::Completed);
        assert!(exec.task_id.is_none());
        assert_eq!(exec.final_amount, dec!(100.4));
        assert_eq!(sandbox.balance("USDT").await, dec!(1000.4));
        assert_eq!(service.manual_executions().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_chain_not_found() {
        let (service, _clock, _) = make_service();
        assert!(matches!(
            service.execute_chain("USDT:NOPE", dec!(100)).await,
            Err(EngineError::ChainNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_registered_chain_expires() {
        let (service, clock, _) = make_service();
        let result = service.scan(&request()).await.unwrap();
        clock.advance(Duration::seconds(60));
        assert!(matches!(
            service.execute_chain(&result.chains[0].id, dec!(100)).await,
            Err(EngineError::RateExpired { .. })
        ));
        assert!(service.manual_executions().await.is_empty());
    }

    #[tokio::test]
    async fn test_list_assets_delegates() {
        let (service, _, _) = make_service();
        assert_eq!(service.list_assets().await.unwrap(), vec!["BTC", "ETH", "USDT"]);
    }

    #[test]
    fn test_registry_evicts_oldest() {
        let mut reg = ChainRegistry::new(2);
        let chain = |id: &str| Chain {
            id: id.into(),
            base_asset: "USDT".into(),
            steps: Vec::new(),
            profit_percent: 0.0,
            min_required_amount: 0.0,
            timestamp: Utc::now(),
        };
        reg.insert(chain("a"));
        reg.insert(chain("b"));
        reg.insert(chain("a"));
        assert_eq!(reg.len(), 2);
        reg.insert(chain("c"));
        assert!(reg.get("a").is_none());
        assert!(reg.get("b").is_some());
        assert!(reg.get("c").is_some());
    }

    #[tokio::test]
    async fn test_status_counts() {
        let (service, _, _) = make_service();
        service.scan(&request()).await.unwrap();
        let status = service.status().await;
        assert_eq!(status.known_chains, 1);
        assert_eq!(status.tasks, 0);
    }
}
