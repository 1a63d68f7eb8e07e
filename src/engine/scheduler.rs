//! Task scheduler. Runs the automated scan → decide → execute loop.
//!
//! Every running task gets exactly one tokio task. That loop owns its
//! `Task` value outright and, after each mutation, publishes a full clone
//! through a `watch` channel; readers only ever see whole snapshots. Stop
//! requests travel on a second `watch` channel and are observed at the top
//! of each cycle or while the loop sleeps between cycles, never once a leg
//! has filled. Snapshots reach disk only when the ledger or the lifecycle
//! status changed, on the blocking pool.

use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::accountant::Accountant;
use super::executor::ExecutionEngine;
use super::scanner::ScanService;
use crate::clock::Clock;
use crate::storage::TaskStore;
use crate::strategy::risk::RiskController;
use crate::strategy::StrategyOrchestrator;
use crate::types::{EngineError, Task, TaskParams, TaskStatistics, TaskStatus};

/// Floor on the pause between cycles so a zero delay cannot spin.
const MIN_CYCLE_PAUSE: Duration = Duration::from_millis(100);

pub const REASON_STOPPED: &str = "stopped by user";
pub const REASON_ELAPSED: &str = "execution time elapsed";
pub const REASON_BUDGET_EXHAUSTED: &str = "budget exhausted";
pub const REASON_RESTARTED: &str = "engine restarted";

// ---------------------------------------------------------------------------
// Loop plumbing
// ---------------------------------------------------------------------------

/// Everything a task loop needs, cheap to clone into each spawned loop.
#[derive(Clone)]
struct LoopContext {
    scan: Arc<ScanService>,
    executor: Arc<ExecutionEngine>,
    risk: RiskController,
    clock: Arc<dyn Clock>,
    store: Option<TaskStore>,
}

impl LoopContext {
    /// Publish a snapshot to readers, and write it to the store when
    /// `persist` is set.
    async fn publish(&self, state: &watch::Sender<Task>, task: &Task, persist: bool) {
        state.send_replace(task.clone());
        if !persist {
            return;
        }
        let Some(store) = self.store.clone() else {
            return;
        };
        let snapshot = task.clone();
        match tokio::task::spawn_blocking(move || store.save(&snapshot)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(task_id = %task.id, error = %e, "Failed to persist task snapshot"),
            Err(e) => error!(task_id = %task.id, error = %e, "Persist task panicked"),
        }
    }
}

struct Runner {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct TaskEntry {
    state: Arc<watch::Sender<Task>>,
    runner: Option<Runner>,
}

impl TaskEntry {
    fn snapshot(&self) -> Task {
        self.state.borrow().clone()
    }
}

enum CycleOutcome {
    /// Nothing was traded.
    Idle,
    /// An execution was recorded against the ledger.
    Recorded,
    Fatal(String),
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Owns the lifecycle of every automated task.
pub struct TaskScheduler {
    ctx: LoopContext,
    tasks: RwLock<HashMap<String, TaskEntry>>,
}

impl TaskScheduler {
    pub fn new(
        scan: Arc<ScanService>,
        executor: Arc<ExecutionEngine>,
        risk: RiskController,
        clock: Arc<dyn Clock>,
        store: Option<TaskStore>,
    ) -> Self {
        Self {
            ctx: LoopContext {
                scan,
                executor,
                risk,
                clock,
                store,
            },
            tasks: RwLock::new(HashMap::new()),
        }
    }

    /// Re-register tasks loaded from disk. Tasks that were running when the
    /// engine went down come back as STOPPED; their loops are not resumed.
    pub async fn restore(&self, tasks: Vec<Task>) -> usize {
        let mut map = self.tasks.write().await;
        let mut restored = 0;
        for mut task in tasks {
            if task.status == TaskStatus::Running {
                task.finish(TaskStatus::Stopped, Some(REASON_RESTARTED.into()), self.ctx.clock.now());
                info!(task_id = %task.id, "Interrupted task restored as stopped");
            }
            let (state, _) = watch::channel(task.clone());
            let state = Arc::new(state);
            self.ctx.publish(&state, &task, true).await;
            map.insert(task.id.clone(), TaskEntry { state, runner: None });
            restored += 1;
        }
        restored
    }

    /// Validate `params` and register a new PENDING task.
    pub async fn create(&self, mut params: TaskParams) -> Result<Task, EngineError> {
        let scan_cfg = self.ctx.scan.config();
        params.validate(scan_cfg.min_chain_length, scan_cfg.max_chain_length)?;
        params.base_asset = params.base_asset.trim().to_uppercase();

        let task = Task::new(params, self.ctx.clock.now());
        let (state, _) = watch::channel(task.clone());
        let state = Arc::new(state);
        self.ctx.publish(&state, &task, true).await;

        info!(task = %task, "Task created");
        self.tasks
            .write()
            .await
            .insert(task.id.clone(), TaskEntry { state, runner: None });
        Ok(task)
    }

    /// Move a PENDING task to RUNNING and spawn its loop.
    pub async fn start(&self, id: &str) -> Result<Task, EngineError> {
        let mut map = self.tasks.write().await;
        let entry = map
            .get_mut(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;

        let mut task = entry.snapshot();
        if task.status != TaskStatus::Pending {
            return Err(invalid_state(&task, "start"));
        }

        task.status = TaskStatus::Running;
        task.started_at = Some(self.ctx.clock.now());
        self.ctx.publish(&entry.state, &task, true).await;

        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_loop(
            self.ctx.clone(),
            task.clone(),
            entry.state.clone(),
            stop_rx,
        ));
        entry.runner = Some(Runner {
            stop: stop_tx,
            handle,
        });

        info!(task_id = %id, "Task started");
        Ok(task)
    }

    /// Stop a RUNNING task. Waits for the in-flight cycle to finish and
    /// returns the final snapshot.
    pub async fn stop(&self, id: &str) -> Result<Task, EngineError> {
        let (runner, state) = {
            let mut map = self.tasks.write().await;
            let entry = map
                .get_mut(id)
                .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
            let task = entry.snapshot();
            if task.status != TaskStatus::Running {
                return Err(invalid_state(&task, "stop"));
            }
            let runner = entry
                .runner
                .take()
                .ok_or_else(|| invalid_state(&task, "stop"))?;
            (runner, entry.state.clone())
        };

        info!(task_id = %id, "Stop requested, waiting for current cycle");
        let _ = runner.stop.send(true);
        if let Err(e) = runner.handle.await {
            error!(task_id = %id, error = %e, "Task loop ended abnormally");
        }

        let snapshot = state.borrow().clone();
        Ok(snapshot)
    }

    /// Remove a task in a terminal state.
    pub async fn delete(&self, id: &str) -> Result<(), EngineError> {
        let mut map = self.tasks.write().await;
        let entry = map
            .get(id)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))?;
        let task = entry.snapshot();
        if !task.status.is_terminal() {
            return Err(invalid_state(&task, "delete"));
        }
        map.remove(id);
        drop(map);

        if let Some(store) = &self.ctx.store {
            if let Err(e) = store.delete(id) {
                warn!(task_id = %id, error = %e, "Failed to delete task file");
            }
        }
        info!(task_id = %id, "Task deleted");
        Ok(())
    }

    /// Snapshots of every task, oldest first.
    pub async fn list(&self) -> Vec<Task> {
        let map = self.tasks.read().await;
        let mut tasks: Vec<Task> = map.values().map(TaskEntry::snapshot).collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        tasks
    }

    pub async fn get(&self, id: &str) -> Result<Task, EngineError> {
        let map = self.tasks.read().await;
        map.get(id)
            .map(TaskEntry::snapshot)
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
    }

    pub async fn statistics(&self, id: &str) -> Result<TaskStatistics, EngineError> {
        self.get(id).await.map(TaskStatistics::from_task)
    }

    /// Live snapshot feed for one task.
    pub async fn subscribe(&self, id: &str) -> Result<watch::Receiver<Task>, EngineError> {
        let map = self.tasks.read().await;
        map.get(id)
            .map(|e| e.state.subscribe())
            .ok_or_else(|| EngineError::TaskNotFound(id.to_string()))
    }

    pub async fn running_count(&self) -> usize {
        let map = self.tasks.read().await;
        map.values()
            .filter(|e| e.state.borrow().status == TaskStatus::Running)
            .count()
    }

    /// Stop every running loop and wait for all of them.
    pub async fn shutdown(&self) {
        let runners: Vec<(String, Runner)> = {
            let mut map = self.tasks.write().await;
            map.iter_mut()
                .filter_map(|(id, e)| e.runner.take().map(|r| (id.clone(), r)))
                .collect()
        };
        if runners.is_empty() {
            return;
        }

        info!(count = runners.len(), "Stopping task loops");
        let handles: Vec<JoinHandle<()>> = runners
            .into_iter()
            .map(|(_, r)| {
                let _ = r.stop.send(true);
                r.handle
            })
            .collect();

        for result in join_all(handles).await {
            if let Err(e) = result {
                error!(error = %e, "Task loop ended abnormally during shutdown");
            }
        }
    }
}

fn invalid_state(task: &Task, action: &str) -> EngineError {
    EngineError::InvalidTaskState {
        id: task.id.clone(),
        status: task.status,
        action: action.to_string(),
    }
}

fn stop_requested(rx: &watch::Receiver<bool>) -> bool {
    *rx.borrow() || rx.has_changed().is_err()
}

// ---------------------------------------------------------------------------
// Task loop
// ---------------------------------------------------------------------------

async fn run_loop(
    ctx: LoopContext,
    mut task: Task,
    state: Arc<watch::Sender<Task>>,
    mut stop_rx: watch::Receiver<bool>,
) {
    let deadline = Instant::now() + task.params.execution_time();
    let mut strategy = StrategyOrchestrator::new(ctx.risk.clone());

    info!(task = %task, "Task loop started");

    loop {
        if stop_requested(&stop_rx) {
            task.finish(TaskStatus::Stopped, Some(REASON_STOPPED.into()), ctx.clock.now());
            break;
        }
        if Instant::now() >= deadline {
            task.finish(TaskStatus::Completed, Some(REASON_ELAPSED.into()), ctx.clock.now());
            break;
        }
        if let Some(reason) = ctx.risk.circuit_breaker(&task) {
            trip(&ctx, &mut task, reason);
            break;
        }
        if ctx.risk.budget_exhausted(&task) {
            task.finish(TaskStatus::Failed, Some(REASON_BUDGET_EXHAUSTED.into()), ctx.clock.now());
            break;
        }

        task.cycles += 1;
        let recorded = match run_cycle(&ctx, &mut task, &mut strategy, &stop_rx).await {
            CycleOutcome::Idle => false,
            CycleOutcome::Recorded => true,
            CycleOutcome::Fatal(reason) => {
                error!(task_id = %task.id, reason = %reason, "Unrecoverable task error");
                task.finish(TaskStatus::Failed, Some(reason), ctx.clock.now());
                break;
            }
        };
        ctx.publish(&state, &task, recorded).await;

        if let Some(reason) = ctx.risk.circuit_breaker(&task) {
            trip(&ctx, &mut task, reason);
            break;
        }

        let now = Instant::now();
        if now >= deadline {
            continue;
        }
        let wake = (now + task.params.delay().max(MIN_CYCLE_PAUSE)).min(deadline);
        tokio::select! {
            _ = tokio::time::sleep_until(wake) => {}
            _ = stop_rx.changed() => {}
        }
    }

    ctx.publish(&state, &task, true).await;
    info!(
        task = %task,
        reason = task.stopped_reason.as_deref().unwrap_or(""),
        "Task loop finished"
    );
}

fn trip(ctx: &LoopContext, task: &mut Task, reason: String) {
    let err = EngineError::CircuitBreakerTripped(reason);
    warn!(task_id = %task.id, error = %err, "Circuit breaker tripped");
    task.finish(TaskStatus::Failed, Some(err.to_string()), ctx.clock.now());
}

/// One scan → select → execute → record pass.
async fn run_cycle(
    ctx: &LoopContext,
    task: &mut Task,
    strategy: &mut StrategyOrchestrator,
    stop_rx: &watch::Receiver<bool>,
) -> CycleOutcome {
    let threshold = ctx.risk.effective_min_profit(task);
    let request = task.params.scan_request(threshold);

    let result = match ctx.scan.scan_cached(&request).await {
        Ok(r) => r,
        Err(EngineError::InvalidParameters(msg)) => return CycleOutcome::Fatal(msg),
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "Scan failed, skipping cycle");
            return CycleOutcome::Idle;
        }
    };

    let now = ctx.clock.now();
    let (selection, decisions) = strategy.select(&result.chains, task, now);
    let budget_vetoed = decisions.iter().any(|d| d.is_budget_veto());
    task.last_decisions = decisions;

    let Some(selection) = selection else {
        if budget_vetoed {
            task.skipped_cycles += 1;
            debug!(
                task_id = %task.id,
                budget = %task.current_budget,
                "Cycle skipped for insufficient budget"
            );
        } else {
            debug!(
                task_id = %task.id,
                candidates = result.chains.len(),
                threshold = format!("{:.4}%", ctx.risk.required_profit(task)),
                "No chain passed risk checks"
            );
        }
        return CycleOutcome::Idle;
    };

    match ctx
        .executor
        .execute_until(&selection.chain, selection.amount, Some(&task.id), Some(stop_rx))
        .await
    {
        Ok(execution) => {
            strategy.record_outcome(task, &execution, now);
            if let Some(stats) = strategy.chain_stats(&execution.chain_id) {
                debug!(
                    chain_id = %execution.chain_id,
                    executions = stats.executions,
                    success_rate = format!("{:.2}", stats.success_rate()),
                    avg_slippage = format!("{:.4}%", stats.average_slippage()),
                    "Chain track record"
                );
            }
            let update = Accountant::record(task, execution);
            debug!(
                task_id = %task.id,
                execution_id = %update.execution_id,
                budget_before = %update.budget_before,
                budget_after = %update.budget_after,
                drawdown = format!("{:.2}%", update.drawdown),
                "Ledger updated"
            );
            CycleOutcome::Recorded
        }
        Err(e) => {
            warn!(task_id = %task.id, error = %e, "Execution not attempted");
            CycleOutcome::Idle
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
