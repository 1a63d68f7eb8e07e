//! Risk controller.
//!
//! Pure policy over a task snapshot and a candidate chain: position sizing,
//! the adaptive profit threshold, the budget guard and the circuit breaker.
//! Nothing here performs I/O or mutates the task.

use rust_decimal::prelude::*;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::RiskConfig;
use crate::types::{to_decimal, to_f64, Chain, ChainStats, Task};

/// Halving is capped so the divisor stays representable.
const MAX_HALVINGS: u32 = 32;

// ---------------------------------------------------------------------------
// Vetoes
// ---------------------------------------------------------------------------

/// Why a candidate chain was passed over.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Veto {
    /// Estimated profit does not clear the threshold plus slippage margin.
    BelowThreshold { profit_percent: f64, required_percent: f64 },
    /// The task cannot fund the chain's minimum.
    InsufficientBudget { required: Decimal, available: Decimal },
    /// The chain failed repeatedly and is benched.
    CoolingDown,
}

impl fmt::Display for Veto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Veto::BelowThreshold {
                profit_percent,
                required_percent,
            } => write!(f, "profit {profit_percent:.4}% below required {required_percent:.4}%"),
            Veto::InsufficientBudget { required, available } => {
                write!(f, "needs {required:.4}, budget {available:.4}")
            }
            Veto::CoolingDown => write!(f, "chain cooling down"),
        }
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Stateless risk policy. One instance can serve every task.
#[derive(Debug, Clone, Default)]
pub struct RiskController {
    config: RiskConfig,
}

impl RiskController {
    pub fn new(config: RiskConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RiskConfig {
        &self.config
    }

    /// Minimum profit a task scans for: its configured minimum raised by
    /// a fixed step per consecutive loss, up to a cap.
    pub fn effective_min_profit(&self, task: &Task) -> f64 {
        let bump = (task.consecutive_losses as f64 * self.config.adaptive_profit_step)
            .min(self.config.adaptive_profit_cap);
        task.params.min_profit_percent + bump
    }

    /// Minimum estimated profit a chain needs to be traded.
    pub fn required_profit(&self, task: &Task) -> f64 {
        self.effective_min_profit(task) + task.params.slippage_tolerance
    }

    /// Whether a chain has enough history, and enough of it good, to be
    /// sized normally.
    pub fn is_proven(&self, stats: Option<&ChainStats>) -> bool {
        stats.is_some_and(|s| {
            s.executions >= self.config.proven_min_executions
                && s.success_rate() >= self.config.proven_min_success_rate
        })
    }

    /// Amount of base asset to commit to `chain`.
    ///
    /// With smart sizing, an unproven chain gets a small trial stake. A
    /// proven one gets a fixed share of the current budget, halved per
    /// consecutive loss and scaled up after consecutive wins. Without smart
    /// sizing: the chain's minimum. Always clamped to the current budget.
    pub fn position_size(&self, task: &Task, chain: &Chain, stats: Option<&ChainStats>) -> Decimal {
        let budget = task.current_budget.max(Decimal::ZERO);
        let floor = to_decimal(chain.min_required_amount);

        if !task.params.enable_smart_sizing {
            return floor.min(budget);
        }

        if !self.is_proven(stats) {
            let trial = budget * to_decimal(self.config.trial_position_fraction);
            return trial.max(floor).min(budget);
        }

        let mut size = budget * to_decimal(self.config.base_position_fraction);
        if task.consecutive_losses > 0 {
            let halvings = task.consecutive_losses.min(MAX_HALVINGS);
            size /= Decimal::from(1u64 << halvings);
        } else if task.consecutive_wins > 0 {
            let steps = task.consecutive_wins.min(self.config.max_win_scale_steps);
            size *= Decimal::ONE + to_decimal(self.config.win_scale_step) * Decimal::from(steps);
        }

        size.max(floor).min(budget)
    }

    /// Veto if the task cannot fund `amount` on `chain`.
    pub fn check_budget(&self, task: &Task, chain: &Chain, amount: Decimal) -> Result<(), Veto> {
        let required = to_decimal(chain.min_required_amount);
        let available = task.current_budget;
        if available <= Decimal::ZERO || available < required || amount > available || amount < required {
            return Err(Veto::InsufficientBudget {
                required: required.max(amount),
                available,
            });
        }
        Ok(())
    }

    /// Full check for one candidate: threshold, sizing, budget guard.
    /// Returns the amount to commit.
    pub fn evaluate(&self, task: &Task, chain: &Chain, stats: Option<&ChainStats>) -> Result<Decimal, Veto> {
        let required_percent = self.required_profit(task);
        if chain.profit_percent < required_percent {
            return Err(Veto::BelowThreshold {
                profit_percent: chain.profit_percent,
                required_percent,
            });
        }
        let amount = self.position_size(task, chain, stats);
        self.check_budget(task, chain, amount)?;
        Ok(amount)
    }

    /// Whether the task has too little left to keep trading. Dust below
    /// `exhausted_budget_fraction` of the initial budget counts as nothing.
    pub fn budget_exhausted(&self, task: &Task) -> bool {
        let dust = task.params.budget * to_decimal(self.config.exhausted_budget_fraction);
        task.current_budget <= Decimal::ZERO || task.current_budget <= dust
    }

    /// Reason the breaker trips for this task, if it does.
    ///
    /// Checked in order: loss streak, drawdown, total loss, net loss. The
    /// loss rules are percentages of the initial budget.
    pub fn circuit_breaker(&self, task: &Task) -> Option<String> {
        if !task.params.enable_circuit_breaker {
            return None;
        }
        if task.consecutive_losses >= task.params.max_consecutive_losses {
            return Some(format!(
                "{} consecutive losses (limit {})",
                task.consecutive_losses, task.params.max_consecutive_losses
            ));
        }
        let drawdown_limit = task.params.max_loss_per_trade * self.config.drawdown_multiplier;
        if task.max_drawdown > drawdown_limit {
            return Some(format!(
                "drawdown {:.2}% exceeds limit {:.2}%",
                task.max_drawdown, drawdown_limit
            ));
        }
        if task.params.budget <= Decimal::ZERO {
            return None;
        }
        let total_loss = to_f64(task.total_loss / task.params.budget) * 100.0;
        if total_loss > self.config.max_total_loss_percent {
            return Some(format!(
                "total loss {:.2}% of budget exceeds limit {:.2}%",
                total_loss, self.config.max_total_loss_percent
            ));
        }
        let net = to_f64(task.net_profit() / task.params.budget) * 100.0;
        if net < -self.config.max_net_loss_percent {
            return Some(format!(
                "net loss {:.2}% of budget exceeds limit {:.2}%",
                -net, self.config.max_net_loss_percent
            ));
        }
        None
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
