//! Accountant: applies finished executions to a task's ledger.
//!
//! Keeps profit/loss totals, the win/loss streaks, the current and peak
//! budget and the worst drawdown seen. Cancelled executions committed
//! nothing, so they are only appended to the history.

use rust_decimal::Decimal;
use tracing::{debug, info};

use crate::types::{Execution, ExecutionStatus, Task};

// ---------------------------------------------------------------------------
// Ledger update
// ---------------------------------------------------------------------------

/// What one recorded execution did to the ledger.
#[derive(Debug, Clone)]
pub struct LedgerUpdate {
    pub execution_id: String,
    pub status: ExecutionStatus,
    pub profit: Decimal,
    pub budget_before: Decimal,
    pub budget_after: Decimal,
    /// Decline from the peak after this execution, percent of the budget.
    pub drawdown: f64,
}

// ---------------------------------------------------------------------------
// Accountant
// ---------------------------------------------------------------------------

pub struct Accountant;

impl Accountant {
    /// Apply `execution` to `task` and append it to the history.
    pub fn record(task: &mut Task, execution: Execution) -> LedgerUpdate {
        let budget_before = task.current_budget;
        let profit = execution.profit_amount();
        let status = execution.status;
        let execution_id = execution.id.clone();

        if status != ExecutionStatus::Cancelled {
            if profit > Decimal::ZERO {
                task.total_profit += profit;
                task.consecutive_wins += 1;
                task.consecutive_losses = 0;
            } else {
                // Break-even counts against the streak: fees were paid for nothing.
                task.total_loss += profit.abs();
                task.consecutive_losses += 1;
                task.consecutive_wins = 0;
            }

            task.current_budget = task.params.budget + task.total_profit - task.total_loss;
            if task.current_budget > task.peak_budget {
                task.peak_budget = task.current_budget;
            }
            task.max_drawdown = task.max_drawdown.max(task.drawdown());
        } else {
            debug!(task_id = %task.id, execution_id = %execution_id, "Cancelled execution recorded");
        }

        task.executions.push(execution);
        task.executions_count = task.executions.len();

        let update = LedgerUpdate {
            execution_id,
            status,
            profit,
            budget_before,
            budget_after: task.current_budget,
            drawdown: task.drawdown(),
        };

        info!(
            task_id = %task.id,
            status = %update.status,
            profit = format!("{:+.4}", update.profit),
            budget = format!("{:.4}", task.current_budget),
            wins = task.consecutive_wins,
            losses = task.consecutive_losses,
            max_drawdown = format!("{:.2}%", task.max_drawdown),
            "Execution recorded"
        );

        update
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
