//! Shared types for the arbitrage engine.
//!
//! These types form the data model used across all modules: market quotes,
//! chains, tasks, executions and the domain error.

use chrono::{DateTime, Utc};
use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::strategy::DecisionRecord;

/// A currency symbol such as `USDT`.
pub type Asset = String;

/// Convert an `f64` into a `Decimal`, mapping non-representable values
/// (NaN, infinities) to zero.
pub fn to_decimal(value: f64) -> Decimal {
    Decimal::from_f64(value).unwrap_or(Decimal::ZERO)
}

/// Convert a `Decimal` into an `f64` (lossy).
pub fn to_f64(value: Decimal) -> f64 {
    value.to_f64().unwrap_or(0.0)
}

// ---------------------------------------------------------------------------
// Market quotes
// ---------------------------------------------------------------------------

/// A point-in-time quote for one trading pair on the exchange.
///
/// `base`/`quote` follow exchange convention: `BTCUSDT` has base `BTC` and
/// quote `USDT`, and prices are expressed in quote units per base unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Market {
    pub symbol: String,
    pub base: Asset,
    pub quote: Asset,
    /// Best bid (price we receive when selling base).
    pub bid: f64,
    /// Best ask (price we pay when buying base).
    pub ask: f64,
    /// Fee charged per fill as a fraction (0.001 = 0.1%).
    pub fee_rate: f64,
    /// Minimum order value, denominated in the quote asset.
    pub min_notional: f64,
    /// Quote-denominated traded volume, used to rank assets by liquidity.
    pub liquidity: f64,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for Market {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} bid={} ask={} fee={:.3}% min={} {}",
            self.symbol,
            self.bid,
            self.ask,
            self.fee_rate * 100.0,
            self.min_notional,
            self.quote,
        )
    }
}

impl Market {
    /// Whether the quote is older than `max_age` at `now`.
    pub fn is_stale(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now - self.timestamp > max_age
    }

    /// Whether the quote can be traded at all: positive, uncrossed prices,
    /// positive liquidity and a sane fee.
    pub fn is_tradable(&self) -> bool {
        self.bid.is_finite()
            && self.ask.is_finite()
            && self.bid > 0.0
            && self.ask > 0.0
            && self.bid <= self.ask
            && self.liquidity > 0.0
            && (0.0..1.0).contains(&self.fee_rate)
    }

    /// Which side of this market converts `from` into the other asset.
    /// Returns `None` if `from` is not part of the pair.
    pub fn side_for(&self, from: &str) -> Option<Side> {
        if from == self.base {
            Some(Side::Sell)
        } else if from == self.quote {
            Some(Side::Buy)
        } else {
            None
        }
    }
}

/// Order direction relative to the market's base asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side {
    /// Spend quote, receive base.
    Buy,
    /// Spend base, receive quote.
    Sell,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

// ---------------------------------------------------------------------------
// Chains
// ---------------------------------------------------------------------------

/// One conversion leg of a chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainStep {
    pub from: Asset,
    pub to: Asset,
    pub symbol: String,
    pub side: Side,
    /// Net conversion rate (to-units per from-unit, after fee) captured at scan time.
    pub rate: f64,
    /// Smallest input amount (in `from` units) the market accepts.
    pub min_input: f64,
}

impl fmt::Display for ChainStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}→{} ({} {} @ {})", self.from, self.to, self.side, self.symbol, self.rate)
    }
}

/// A cycle of conversions that starts and ends in the base asset.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Chain {
    /// Content-derived id: same route, same id.
    pub id: String,
    pub base_asset: Asset,
    pub steps: Vec<ChainStep>,
    /// Estimated percentage gain of one full cycle at the captured rates.
    pub profit_percent: f64,
    /// Smallest base amount for which every leg clears its market minimum.
    pub min_required_amount: f64,
    /// When the rates were captured.
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] profit={:.4}% min={:.4} {}",
            self.route(),
            self.steps.len(),
            self.profit_percent,
            self.min_required_amount,
            self.base_asset,
        )
    }
}

impl Chain {
    /// Build the content-derived id for a route.
    pub fn route_id(base_asset: &str, steps: &[ChainStep]) -> String {
        let symbols: Vec<&str> = steps.iter().map(|s| s.symbol.as_str()).collect();
        format!("{base_asset}:{}", symbols.join(">"))
    }

    /// Asset path, e.g. `USDT→BTC→ETH→USDT`.
    pub fn route(&self) -> String {
        let mut parts: Vec<&str> = Vec::with_capacity(self.steps.len() + 1);
        if let Some(first) = self.steps.first() {
            parts.push(first.from.as_str());
        }
        parts.extend(self.steps.iter().map(|s| s.to.as_str()));
        parts.join("→")
    }

    /// Product of the captured net rates.
    pub fn compounded_rate(&self) -> f64 {
        self.steps.iter().map(|s| s.rate).product()
    }

    /// Whether the steps form a connected cycle through the base asset.
    pub fn is_cycle(&self) -> bool {
        let (Some(first), Some(last)) = (self.steps.first(), self.steps.last()) else {
            return false;
        };
        first.from == self.base_asset
            && last.to == self.base_asset
            && self.steps.windows(2).all(|w| w[0].to == w[1].from)
    }

    /// Age of the captured rates at `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.timestamp
    }
}

/// Aggregate figures of one scan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanSummary {
    pub assets_analyzed: usize,
    pub total_chains: usize,
    pub profitable_chains: usize,
    pub best_profit_percent: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

impl fmt::Display for ScanSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let best = self
            .best_profit_percent
            .map(|p| format!("{p:.4}%"))
            .unwrap_or_else(|| "n/a".to_string());
        write!(
            f,
            "assets={} chains={} profitable={} best={}",
            self.assets_analyzed, self.total_chains, self.profitable_chains, best,
        )
    }
}

/// Ranked chains plus the scan summary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScanResult {
    pub chains: Vec<Chain>,
    pub summary: ScanSummary,
}

/// Parameters of a one-shot scan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScanRequest {
    pub base_asset: Asset,
    pub max_assets: usize,
    pub chain_length: usize,
    pub min_profit_percent: f64,
}

// ---------------------------------------------------------------------------
// Executions
// ---------------------------------------------------------------------------

/// Terminal status of an execution attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ExecutionStatus {
    Completed,
    Failed,
    Cancelled,
}

impl fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExecutionStatus::Completed => write!(f, "COMPLETED"),
            ExecutionStatus::Failed => write!(f, "FAILED"),
            ExecutionStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// A filled leg.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LegFill {
    pub step: usize,
    pub symbol: String,
    pub side: Side,
    pub input_amount: Decimal,
    pub output_amount: Decimal,
    pub attempts: u32,
}

/// Intermediate asset left over after a chain failed part-way.
///
/// Legs that already filled are never unwound; the holding is valued in the
/// base asset using the chain's captured rates for the legs that did not run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StrandedHolding {
    pub asset: Asset,
    pub amount: Decimal,
    pub marked_value: Decimal,
}

/// One realized attempt to trade a chain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Execution {
    pub id: String,
    /// Owning task, `None` for manual executions.
    pub task_id: Option<String>,
    pub chain_id: String,
    pub chain: Chain,
    pub initial_amount: Decimal,
    /// Base-asset amount after the attempt (mark-to-base when stranded).
    pub final_amount: Decimal,
    /// Chain estimate captured at decision time.
    pub expected_profit_percent: f64,
    /// Realized profit percent; the authoritative realized figure.
    pub profit_percent: f64,
    pub status: ExecutionStatus,
    pub error: Option<String>,
    pub legs: Vec<LegFill>,
    pub stranded: Option<StrandedHolding>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl fmt::Display for Execution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}] {} {:.4} → {:.4} {} ({:+.4}% vs expected {:+.4}%)",
            self.status,
            self.chain.route(),
            self.initial_amount,
            self.final_amount,
            self.chain.base_asset,
            self.profit_percent,
            self.expected_profit_percent,
        )
    }
}

impl Execution {
    /// Realized profit (negative for a loss), derived from the amounts.
    pub fn profit_amount(&self) -> Decimal {
        self.final_amount - self.initial_amount
    }

    /// Whether the attempt made money.
    pub fn is_win(&self) -> bool {
        self.status == ExecutionStatus::Completed && self.profit_amount() > Decimal::ZERO
    }

    /// Realized minus expected profit percent.
    pub fn slippage_percent(&self) -> f64 {
        self.profit_percent - self.expected_profit_percent
    }
}

/// Track record of one chain within a task.
///
/// A success is a completed execution that made money, so break-even runs
/// count against the chain just as they count as losses on the ledger.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ChainStats {
    pub executions: u32,
    pub successes: u32,
    /// Sum of absolute realized-minus-expected profit, percentage points.
    pub total_slippage: f64,
}

impl ChainStats {
    /// Fold one attempt in. Cancelled attempts never traded and are ignored.
    pub fn record(&mut self, execution: &Execution) {
        if execution.status == ExecutionStatus::Cancelled {
            return;
        }
        self.executions += 1;
        if execution.is_win() {
            self.successes += 1;
        }
        self.total_slippage += execution.slippage_percent().abs();
    }

    pub fn success_rate(&self) -> f64 {
        if self.executions == 0 {
            return 0.0;
        }
        self.successes as f64 / self.executions as f64
    }

    pub fn average_slippage(&self) -> f64 {
        if self.executions == 0 {
            return 0.0;
        }
        self.total_slippage / self.executions as f64
    }

    /// Per-chain records for a list of executions, keyed by chain id.
    pub fn tally(executions: &[Execution]) -> BTreeMap<String, ChainStats> {
        let mut stats: BTreeMap<String, ChainStats> = BTreeMap::new();
        for execution in executions {
            if execution.status == ExecutionStatus::Cancelled {
                continue;
            }
            stats.entry(execution.chain_id.clone()).or_default().record(execution);
        }
        stats
    }
}

// ---------------------------------------------------------------------------
// Tasks
// ---------------------------------------------------------------------------

/// Task lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TaskStatus {
    Pending,
    Running,
    Stopped,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Terminal statuses allow deletion and never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Stopped | TaskStatus::Completed | TaskStatus::Failed)
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "PENDING"),
            TaskStatus::Running => write!(f, "RUNNING"),
            TaskStatus::Stopped => write!(f, "STOPPED"),
            TaskStatus::Completed => write!(f, "COMPLETED"),
            TaskStatus::Failed => write!(f, "FAILED"),
        }
    }
}

fn default_slippage_tolerance() -> f64 {
    0.5
}

fn default_max_loss_per_trade() -> f64 {
    1.0
}

fn default_true() -> bool {
    true
}

fn default_max_consecutive_losses() -> u32 {
    3
}

/// Parameters supplied when creating a task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TaskParams {
    pub base_asset: Asset,
    pub budget: Decimal,
    pub execution_time_minutes: u64,
    pub delay_seconds: u64,
    pub min_profit_percent: f64,
    pub max_assets: usize,
    pub chain_length: usize,
    /// Extra margin (percent) a chain must clear above the threshold.
    #[serde(default = "default_slippage_tolerance")]
    pub slippage_tolerance: f64,
    /// Per-trade loss tolerance (percent); scales the drawdown breaker.
    #[serde(default = "default_max_loss_per_trade")]
    pub max_loss_per_trade: f64,
    #[serde(default = "default_true")]
    pub enable_circuit_breaker: bool,
    #[serde(default = "default_true")]
    pub enable_smart_sizing: bool,
    #[serde(default = "default_max_consecutive_losses")]
    pub max_consecutive_losses: u32,
}

impl TaskParams {
    /// Reject parameters no loop could ever run with.
    pub fn validate(&self, min_chain_length: usize, max_chain_length: usize) -> Result<(), EngineError> {
        let invalid = |msg: String| Err(EngineError::InvalidParameters(msg));

        if self.base_asset.trim().is_empty() {
            return invalid("base asset must not be blank".into());
        }
        if self.budget <= Decimal::ZERO {
            return invalid(format!("budget must be positive, got {}", self.budget));
        }
        if self.execution_time_minutes == 0 {
            return invalid("execution time must be at least one minute".into());
        }
        if !(min_chain_length..=max_chain_length).contains(&self.chain_length) {
            return invalid(format!(
                "chain length {} outside {min_chain_length}..={max_chain_length}",
                self.chain_length
            ));
        }
        if self.max_assets < self.chain_length {
            return invalid(format!(
                "max assets {} is less than chain length {}",
                self.max_assets, self.chain_length
            ));
        }
        if !self.min_profit_percent.is_finite() {
            return invalid("min profit percent must be finite".into());
        }
        if !self.slippage_tolerance.is_finite() || self.slippage_tolerance < 0.0 {
            return invalid("slippage tolerance must be a non-negative number".into());
        }
        if !self.max_loss_per_trade.is_finite() || self.max_loss_per_trade <= 0.0 {
            return invalid("max loss per trade must be positive".into());
        }
        if self.max_consecutive_losses == 0 {
            return invalid("max consecutive losses must be at least 1".into());
        }
        Ok(())
    }

    /// Scan request derived from these parameters at a given threshold.
    pub fn scan_request(&self, min_profit_percent: f64) -> ScanRequest {
        ScanRequest {
            base_asset: self.base_asset.clone(),
            max_assets: self.max_assets,
            chain_length: self.chain_length,
            min_profit_percent,
        }
    }

    /// Total wall time the task may run.
    pub fn execution_time(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.execution_time_minutes.saturating_mul(60))
    }

    /// Pause between cycles.
    pub fn delay(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.delay_seconds)
    }
}

/// A long-lived automated job.
///
/// Owned and mutated exclusively by its scheduler loop; everybody else
/// reads cloned snapshots.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Task {
    pub id: String,
    #[serde(flatten)]
    pub params: TaskParams,
    pub status: TaskStatus,
    pub current_budget: Decimal,
    pub peak_budget: Decimal,
    pub total_profit: Decimal,
    pub total_loss: Decimal,
    pub consecutive_losses: u32,
    pub consecutive_wins: u32,
    /// Largest peak-to-trough budget decline seen, percent of initial budget.
    pub max_drawdown: f64,
    pub executions_count: usize,
    /// Cycles vetoed for lack of budget.
    pub skipped_cycles: u64,
    pub cycles: u64,
    pub stopped_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub executions: Vec<Execution>,
    /// What the risk policy made of each candidate in the latest cycle.
    #[serde(default)]
    pub last_decisions: Vec<DecisionRecord>,
}

impl fmt::Display for Task {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} [{}] budget={:.4}/{:.4} {} | net={:+.4} | W{}/L{} | dd={:.2}% | execs={}",
            self.id,
            self.status,
            self.current_budget,
            self.params.budget,
            self.params.base_asset,
            self.net_profit(),
            self.consecutive_wins,
            self.consecutive_losses,
            self.max_drawdown,
            self.executions_count,
        )
    }
}

impl Task {
    /// Create a new pending task.
    pub fn new(params: TaskParams, now: DateTime<Utc>) -> Self {
        let budget = params.budget;
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            params,
            status: TaskStatus::Pending,
            current_budget: budget,
            peak_budget: budget,
            total_profit: Decimal::ZERO,
            total_loss: Decimal::ZERO,
            consecutive_losses: 0,
            consecutive_wins: 0,
            max_drawdown: 0.0,
            executions_count: 0,
            skipped_cycles: 0,
            cycles: 0,
            stopped_reason: None,
            created_at: now,
            started_at: None,
            completed_at: None,
            executions: Vec::new(),
            last_decisions: Vec::new(),
        }
    }

    /// Total profit minus total loss.
    pub fn net_profit(&self) -> Decimal {
        self.total_profit - self.total_loss
    }

    /// Current decline from the peak budget, percent of the initial budget.
    pub fn drawdown(&self) -> f64 {
        if self.params.budget <= Decimal::ZERO {
            return 0.0;
        }
        to_f64((self.peak_budget - self.current_budget) / self.params.budget) * 100.0
    }

    /// Move into a terminal status.
    pub fn finish(&mut self, status: TaskStatus, reason: Option<String>, at: DateTime<Utc>) {
        self.status = status;
        if reason.is_some() {
            self.stopped_reason = reason;
        }
        self.completed_at = Some(at);
    }
}

/// Read-only projection of a task's executions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatistics {
    pub task: Task,
    pub profitable_executions: Vec<Execution>,
    pub loss_executions: Vec<Execution>,
    pub total_profit: Decimal,
    pub total_loss: Decimal,
    pub net_profit: Decimal,
    /// Track record per chain id.
    pub chains: BTreeMap<String, ChainStats>,
}

impl TaskStatistics {
    /// Split a task snapshot's executions into winners and losers.
    /// Cancelled attempts committed nothing and land in neither list.
    pub fn from_task(task: Task) -> Self {
        let (profitable_executions, loss_executions): (Vec<_>, Vec<_>) = task
            .executions
            .iter()
            .filter(|e| e.status != ExecutionStatus::Cancelled)
            .cloned()
            .partition(|e| e.profit_amount() > Decimal::ZERO);

        Self {
            chains: ChainStats::tally(&task.executions),
            total_profit: task.total_profit,
            total_loss: task.total_loss,
            net_profit: task.net_profit(),
            profitable_executions,
            loss_executions,
            task,
        }
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Domain errors of the engine and scheduler.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("Rates unavailable: {0}")]
    RateUnavailable(String),

    #[error("Rates expired: captured {age_ms}ms ago, limit {limit_ms}ms")]
    RateExpired { age_ms: i64, limit_ms: i64 },

    #[error("Insufficient budget: need {required:.4}, have {available:.4}")]
    InsufficientBudget { required: Decimal, available: Decimal },

    #[error("Connector transient error: {0}")]
    ConnectorTransient(String),

    #[error("Connector fatal error: {0}")]
    ConnectorFatal(String),

    #[error("Circuit breaker tripped: {0}")]
    CircuitBreakerTripped(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Chain not found: {0}")]
    ChainNotFound(String),

    #[error("Task {id} is {status}; cannot {action}")]
    InvalidTaskState {
        id: String,
        status: TaskStatus,
        action: String,
    },
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
