//! Strategy layer: candidate selection, risk policy and chain cooldowns.

pub mod risk;

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::types::{Chain, ChainStats, Execution, ExecutionStatus, Task};
use risk::{RiskController, Veto};

// ---------------------------------------------------------------------------
// Decision log
// ---------------------------------------------------------------------------

/// Record of every candidate considered during a selection pass,
/// including the ones passed on and why.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DecisionRecord {
    /// Chain selected for execution with the sized amount.
    Selected {
        chain_id: String,
        profit_percent: f64,
        amount: Decimal,
    },
    /// Chain vetoed by the risk policy or the cooldown list.
    Rejected { chain_id: String, veto: Veto },
}

impl DecisionRecord {
    pub fn is_budget_veto(&self) -> bool {
        matches!(
            self,
            DecisionRecord::Rejected {
                veto: Veto::InsufficientBudget { .. },
                ..
            }
        )
    }
}

// ---------------------------------------------------------------------------
// Chain cooldown
// ---------------------------------------------------------------------------

/// Benches chains that keep failing.
///
/// A chain that fails or loses `threshold` times in a row is skipped until
/// `duration` has passed. A win clears its failure count.
#[derive(Debug, Clone)]
pub struct ChainCooldown {
    threshold: u32,
    duration: Duration,
    failures: HashMap<String, u32>,
    benched_until: HashMap<String, DateTime<Utc>>,
}

impl ChainCooldown {
    pub fn new(threshold: u32, duration: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            duration,
            failures: HashMap::new(),
            benched_until: HashMap::new(),
        }
    }

    /// Whether `chain_id` is benched at `now`. Expired entries are dropped.
    pub fn is_benched(&mut self, chain_id: &str, now: DateTime<Utc>) -> bool {
        match self.benched_until.get(chain_id) {
            Some(until) if *until > now => true,
            Some(_) => {
                self.benched_until.remove(chain_id);
                false
            }
            None => false,
        }
    }

    /// Record an outcome. Returns true if this failure benched the chain.
    pub fn record(&mut self, chain_id: &str, success: bool, now: DateTime<Utc>) -> bool {
        if success {
            self.failures.remove(chain_id);
            return false;
        }
        let count = self.failures.entry(chain_id.to_string()).or_insert(0);
        *count += 1;
        if *count >= self.threshold {
            self.failures.remove(chain_id);
            self.benched_until.insert(chain_id.to_string(), now + self.duration);
            return true;
        }
        false
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// The chain picked for a cycle and the amount to commit.
#[derive(Debug, Clone)]
pub struct Selection {
    pub chain: Chain,
    pub amount: Decimal,
}

/// Ranks scanned chains and runs them through the risk policy.
///
/// One instance per task loop; it owns that task's cooldown list and the
/// per-chain track record used for sizing.
pub struct StrategyOrchestrator {
    risk: RiskController,
    cooldown: ChainCooldown,
    chain_stats: HashMap<String, ChainStats>,
}

impl StrategyOrchestrator {
    pub fn new(risk: RiskController) -> Self {
        let cooldown = ChainCooldown::new(
            risk.config().chain_failure_threshold,
            Duration::seconds(risk.config().chain_cooldown_secs),
        );
        Self {
            risk,
            cooldown,
            chain_stats: HashMap::new(),
        }
    }

    /// Pick the best chain that passes every check.
    ///
    /// `chains` should arrive ranked; they are re-ranked here so callers
    /// cannot get the order wrong. Returns the selection (if any) and the
    /// decisions made during this pass.
    pub fn select(
        &mut self,
        chains: &[Chain],
        task: &Task,
        now: DateTime<Utc>,
    ) -> (Option<Selection>, Vec<DecisionRecord>) {
        let mut ranked = chains.to_vec();
        crate::engine::finder::rank(&mut ranked);

        let mut pass: Vec<DecisionRecord> = Vec::new();
        let mut selection = None;

        for chain in ranked {
            if task.params.enable_circuit_breaker && self.cooldown.is_benched(&chain.id, now) {
                debug!(chain_id = %chain.id, "Chain cooling down, skipped");
                pass.push(DecisionRecord::Rejected {
                    chain_id: chain.id.clone(),
                    veto: Veto::CoolingDown,
                });
                continue;
            }

            match self.risk.evaluate(task, &chain, self.chain_stats.get(&chain.id)) {
                Ok(amount) => {
                    info!(
                        task_id = %task.id,
                        chain = %chain.route(),
                        profit = format!("{:.4}%", chain.profit_percent),
                        amount = format!("{:.4}", amount),
                        "Chain selected"
                    );
                    pass.push(DecisionRecord::Selected {
                        chain_id: chain.id.clone(),
                        profit_percent: chain.profit_percent,
                        amount,
                    });
                    selection = Some(Selection { chain, amount });
                    break;
                }
                Err(veto) => {
                    debug!(chain_id = %chain.id, veto = %veto, "Chain rejected");
                    pass.push(DecisionRecord::Rejected {
                        chain_id: chain.id.clone(),
                        veto,
                    });
                }
            }
        }

        (selection, pass)
    }

    /// Feed a finished execution into the chain's track record and, with
    /// the breaker on, into the cooldown list.
    pub fn record_outcome(&mut self, task: &Task, execution: &Execution, now: DateTime<Utc>) {
        if execution.status == ExecutionStatus::Cancelled {
            return;
        }
        self.chain_stats
            .entry(execution.chain_id.clone())
            .or_default()
            .record(execution);

        if !task.params.enable_circuit_breaker {
            return;
        }
        if self.cooldown.record(&execution.chain_id, execution.is_win(), now) {
            warn!(
                task_id = %task.id,
                chain_id = %execution.chain_id,
                "Chain benched after repeated failures"
            );
        }
    }

    pub fn chain_stats(&self, chain_id: &str) -> Option<&ChainStats> {
        self.chain_stats.get(chain_id)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
