//! End-to-end scenarios over the public API, driven by `MockConnector`.

use chrono::{Duration as ChronoDuration, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::sync::Arc;
use std::time::Duration;

use triangulum::clock::{Clock, ManualClock};
use triangulum::config::AppConfig;
use triangulum::engine::accountant::Accountant;
use triangulum::engine::scheduler::{REASON_BUDGET_EXHAUSTED, REASON_ELAPSED, REASON_STOPPED};
use triangulum::exchange::Fill;
use triangulum::service::ArbitrageService;
use triangulum::types::{
    to_f64, EngineError, ExecutionStatus, ScanRequest, Task, TaskParams, TaskStatistics, TaskStatus,
};

use crate::mock_connector::MockConnector;

fn setup(eth_usdt: f64) -> (ArbitrageService, Arc<ManualClock>, Arc<MockConnector>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let connector = Arc::new(MockConnector::triangle(clock.clone(), eth_usdt));
    let service = ArbitrageService::from_config(&AppConfig::default(), connector.clone(), clock.clone(), None);
    (service, clock, connector)
}

fn scan_request(min_profit_percent: f64) -> ScanRequest {
    ScanRequest {
        base_asset: "USDT".into(),
        max_assets: 3,
        chain_length: 3,
        min_profit_percent,
    }
}

fn task_params(budget: Decimal) -> TaskParams {
    TaskParams {
        base_asset: "USDT".into(),
        budget,
        execution_time_minutes: 10,
        delay_seconds: 1,
        min_profit_percent: 0.3,
        max_assets: 3,
        chain_length: 3,
        slippage_tolerance: 0.0,
        max_loss_per_trade: 1.0,
        enable_circuit_breaker: true,
        enable_smart_sizing: true,
        max_consecutive_losses: 3,
    }
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_break_even_triangle_is_not_an_opportunity() {
    let (service, _, _) = setup(2_500.0);
    let result = service.scan(&scan_request(0.3)).await.unwrap();

    assert!(result.chains.is_empty());
    // Both directions were evaluated, neither cleared the threshold.
    assert_eq!(result.summary.total_chains, 2);
    assert_eq!(result.summary.profitable_chains, 0);
    assert_eq!(result.summary.assets_analyzed, 3);
    assert!(result.summary.best_profit_percent.is_none());
}

#[tokio::test]
async fn test_threshold_decides_which_chains_are_returned() {
    let (service, _, _) = setup(2_510.0);

    let strict = service.scan(&scan_request(0.5)).await.unwrap();
    assert!(strict.chains.is_empty());

    let loose = service.scan(&scan_request(0.3)).await.unwrap();
    assert_eq!(loose.chains.len(), 1);
    let chain = &loose.chains[0];
    assert_eq!(chain.id, "USDT:BTCUSDT>ETHBTC>ETHUSDT");
    assert!((chain.profit_percent - 0.4).abs() < 1e-9);
    assert!(chain.is_cycle());
    for c in &loose.chains {
        assert!(c.profit_percent >= 0.3);
    }
}

#[tokio::test]
async fn test_quote_outage_is_rate_unavailable() {
    let (service, _, connector) = setup(2_510.0);
    connector.set_error("maintenance");
    assert!(matches!(
        service.scan(&scan_request(0.3)).await,
        Err(EngineError::RateUnavailable(_))
    ));
    connector.clear_error();
    assert!(service.scan(&scan_request(0.3)).await.is_ok());
}

// ---------------------------------------------------------------------------
// Manual execution
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_stale_chain_is_refused_without_trading() {
    let (service, clock, connector) = setup(2_510.0);
    let chain_id = service.scan(&scan_request(0.3)).await.unwrap().chains[0].id.clone();

    clock.advance(ChronoDuration::seconds(11));
    let err = service.execute_chain(&chain_id, dec!(100)).await.unwrap_err();
    assert!(matches!(err, EngineError::RateExpired { .. }));
    assert!(connector.conversions().is_empty());
}

#[tokio::test]
async fn test_manual_execution_realizes_quoted_profit() {
    let (service, _, connector) = setup(2_510.0);
    let chain_id = service.scan(&scan_request(0.3)).await.unwrap().chains[0].id.clone();

    let exec = service.execute_chain(&chain_id, dec!(100)).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.final_amount, dec!(100.4));
    assert!((exec.profit_percent - 0.4).abs() < 1e-9);
    assert_eq!(exec.legs.len(), 3);

    let symbols: Vec<String> = connector.conversions().into_iter().map(|c| c.symbol).collect();
    assert_eq!(symbols, vec!["BTCUSDT", "ETHBTC", "ETHUSDT"]);
}

#[tokio::test]
async fn test_rejected_leg_strands_holding() {
    let (service, _, connector) = setup(2_510.0);
    let chain_id = service.scan(&scan_request(0.3)).await.unwrap().chains[0].id.clone();
    connector.script_fills(vec![Fill::filled(dec!(0.0025)), Fill::rejected("below minimum")]);

    let exec = service.execute_chain(&chain_id, dec!(100)).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.legs.len(), 1);
    assert!(exec.error.as_deref().unwrap_or("").contains("below minimum"));

    let stranded = exec.stranded.expect("stranded holding");
    assert_eq!(stranded.asset, "BTC");
    assert_eq!(stranded.amount, dec!(0.0025));
    assert!((to_f64(stranded.marked_value) - 100.4).abs() < 1e-6);
    // No unwind was attempted.
    assert_eq!(connector.conversions().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn test_transient_errors_are_retried() {
    let (service, _, connector) = setup(2_510.0);
    let chain_id = service.scan(&scan_request(0.3)).await.unwrap().chains[0].id.clone();
    connector.fail_transiently(2);

    let exec = service.execute_chain(&chain_id, dec!(100)).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Completed);
    assert_eq!(exec.legs[0].attempts, 3);
    assert_eq!(exec.legs[1].attempts, 1);
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_ledger_after_one_win_and_one_loss() {
    let (service, clock, connector) = setup(2_510.0);
    let chain_id = service.scan(&scan_request(0.3)).await.unwrap().chains[0].id.clone();
    let mut task = Task::new(task_params(dec!(100)), clock.now());

    connector.script_fills(vec![
        Fill::filled(dec!(0.00125)),
        Fill::filled(dec!(0.02)),
        Fill::filled(dec!(52)),
    ]);
    let win = service.execute_chain(&chain_id, dec!(50)).await.unwrap();
    Accountant::record(&mut task, win);

    connector.script_fills(vec![
        Fill::filled(dec!(0.00125)),
        Fill::filled(dec!(0.02)),
        Fill::filled(dec!(45)),
    ]);
    let loss = service.execute_chain(&chain_id, dec!(50)).await.unwrap();
    Accountant::record(&mut task, loss);

    assert_eq!(task.total_profit, dec!(2));
    assert_eq!(task.total_loss, dec!(5));
    assert_eq!(task.current_budget, dec!(97));
    assert_eq!(task.net_profit(), dec!(-3));
    assert_eq!(task.peak_budget, dec!(102));
    assert_eq!(task.consecutive_losses, 1);
    assert_eq!(task.consecutive_wins, 0);
    assert!((task.max_drawdown - 5.0).abs() < 1e-9);

    let stats = TaskStatistics::from_task(task);
    assert_eq!(stats.profitable_executions.len(), 1);
    assert_eq!(stats.loss_executions.len(), 1);
    assert_eq!(stats.net_profit, dec!(-3));
    assert_eq!(stats.chains[&chain_id].executions, 2);
    assert_eq!(stats.chains[&chain_id].successes, 1);
}

fn assert_ledger_identity(task: &Task) {
    assert_eq!(
        task.current_budget,
        task.params.budget + task.total_profit - task.total_loss,
        "ledger identity broken after {} executions",
        task.executions_count
    );
    assert!(task.current_budget >= Decimal::ZERO);
    assert!(task.consecutive_wins == 0 || task.consecutive_losses == 0);
    assert_eq!(task.executions_count, task.executions.len());
}

/// Wait for a task to end, checking the ledger on every snapshot seen.
async fn watch_until_terminal(rx: &mut tokio::sync::watch::Receiver<Task>) -> (Task, usize) {
    let mut seen = 0;
    loop {
        let task = rx.borrow_and_update().clone();
        assert_ledger_identity(&task);
        seen += 1;
        if task.status.is_terminal() {
            return (task, seen);
        }
        rx.changed().await.unwrap();
    }
}

// ---------------------------------------------------------------------------
// Automated tasks
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn test_circuit_breaker_fails_task_after_consecutive_losses() {
    // Quotes promise 4% but every leg fills 2% short.
    let (service, _, connector) = setup(2_600.0);
    connector.set_fill_factor(dec!(0.98));

    let task = service.create_task(task_params(dec!(1000))).await.unwrap();
    let mut rx = service.scheduler().subscribe(&task.id).await.unwrap();
    service.start_task(&task.id).await.unwrap();

    let done = rx.wait_for(|t| t.status.is_terminal()).await.unwrap().clone();
    assert_eq!(done.status, TaskStatus::Failed);
    assert!(done
        .stopped_reason
        .as_deref()
        .unwrap_or("")
        .starts_with("Circuit breaker tripped"));
    assert_eq!(done.executions_count, 3);
    assert_eq!(done.consecutive_losses, 3);
    assert!(done.current_budget < dec!(1000));

    // The loop is gone: nothing else reaches the venue.
    let traded = connector.conversions().len();
    assert_eq!(traded, 9);
    tokio::time::sleep(Duration::from_secs(30)).await;
    assert_eq!(connector.conversions().len(), traded);
    assert_eq!(service.get_task(&task.id).await.unwrap().status, TaskStatus::Failed);
}

#[tokio::test(start_paused = true)]
async fn test_stop_mid_run_halts_trading() {
    let (service, _, connector) = setup(2_600.0);
    let task = service.create_task(task_params(dec!(1000))).await.unwrap();
    service.start_task(&task.id).await.unwrap();

    tokio::time::sleep(Duration::from_millis(3_500)).await;
    let stopped = service.stop_task(&task.id).await.unwrap();
    assert_eq!(stopped.status, TaskStatus::Stopped);
    assert_eq!(stopped.stopped_reason.as_deref(), Some(REASON_STOPPED));
    assert!(stopped.executions_count >= 1);
    assert!(stopped.net_profit() > Decimal::ZERO);
    assert!(stopped.completed_at.is_some());

    let traded = connector.conversions().len();
    assert_eq!(traded, stopped.executions_count * 3);
    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.conversions().len(), traded);

    // Terminal tasks can be removed.
    service.delete_task(&task.id).await.unwrap();
    assert!(service.list_tasks().await.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_underfunded_task_skips_cycles_until_time_runs_out() {
    let (service, _, connector) = setup(2_600.0);
    connector.set_min_notional("BTCUSDT", 50.0);

    let mut params = task_params(dec!(5));
    params.execution_time_minutes = 1;
    params.delay_seconds = 5;
    let task = service.create_task(params).await.unwrap();
    let mut rx = service.scheduler().subscribe(&task.id).await.unwrap();
    service.start_task(&task.id).await.unwrap();

    let done = rx.wait_for(|t| t.status.is_terminal()).await.unwrap().clone();
    assert_eq!(done.status, TaskStatus::Completed);
    assert_eq!(done.stopped_reason.as_deref(), Some(REASON_ELAPSED));
    assert_eq!(done.executions_count, 0);
    assert!(done.skipped_cycles > 0);
    assert_eq!(done.current_budget, dec!(5));
    assert!(connector.conversions().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_task_fails_once_budget_is_exhausted() {
    // Every leg fills at a tenth of the quote; each 25 stake returns 0.026.
    let (service, _, connector) = setup(2_600.0);
    connector.set_min_notional("BTCUSDT", 25.0);
    connector.set_fill_factor(dec!(0.1));

    let mut params = task_params(dec!(100));
    params.enable_circuit_breaker = false;
    params.enable_smart_sizing = false;
    let task = service.create_task(params).await.unwrap();
    let mut rx = service.scheduler().subscribe(&task.id).await.unwrap();
    service.start_task(&task.id).await.unwrap();

    let (done, _) = watch_until_terminal(&mut rx).await;
    assert_eq!(done.status, TaskStatus::Failed);
    assert_eq!(done.stopped_reason.as_deref(), Some(REASON_BUDGET_EXHAUSTED));
    assert_eq!(done.executions_count, 4);
    assert!(done.executions.iter().all(|e| e.initial_amount == dec!(25)));
    assert_eq!(done.current_budget, dec!(0.104));
    assert_eq!(done.consecutive_losses, 4);
    assert_eq!(connector.conversions().len(), 12);
}

#[tokio::test(start_paused = true)]
async fn test_drawdown_trips_breaker_through_the_loop() {
    let (service, _, connector) = setup(2_600.0);
    // A 50 trial stake comes back as 20: 3% of the budget, limit 0.5 × 5.
    connector.script_fills(vec![
        Fill::filled(dec!(0.00125)),
        Fill::filled(dec!(0.02)),
        Fill::filled(dec!(20)),
    ]);

    let mut params = task_params(dec!(1000));
    params.max_loss_per_trade = 0.5;
    let task = service.create_task(params).await.unwrap();
    let mut rx = service.scheduler().subscribe(&task.id).await.unwrap();
    service.start_task(&task.id).await.unwrap();

    let (done, _) = watch_until_terminal(&mut rx).await;
    assert_eq!(done.status, TaskStatus::Failed);
    let reason = done.stopped_reason.as_deref().unwrap_or("");
    assert!(reason.starts_with("Circuit breaker tripped"), "{reason}");
    assert!(reason.contains("drawdown 3.00%"), "{reason}");
    assert_eq!(done.executions_count, 1);
    assert_eq!(done.consecutive_losses, 1);
    assert_eq!(done.current_budget, dec!(970));

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(connector.conversions().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_net_loss_trips_breaker_before_drawdown_limit() {
    let (service, _, connector) = setup(2_600.0);
    // 25 lost on 1000: drawdown 2.5% is inside the 5% limit, net -2.5% is not.
    connector.script_fills(vec![
        Fill::filled(dec!(0.00125)),
        Fill::filled(dec!(0.02)),
        Fill::filled(dec!(25)),
    ]);

    let task = service.create_task(task_params(dec!(1000))).await.unwrap();
    let mut rx = service.scheduler().subscribe(&task.id).await.unwrap();
    service.start_task(&task.id).await.unwrap();

    let (done, _) = watch_until_terminal(&mut rx).await;
    assert_eq!(done.status, TaskStatus::Failed);
    let reason = done.stopped_reason.as_deref().unwrap_or("");
    assert!(reason.contains("net loss 2.50%"), "{reason}");
    assert_eq!(done.executions_count, 1);
}

#[tokio::test(start_paused = true)]
async fn test_ledger_holds_across_many_slipping_executions() {
    // Every leg fills 1.5% short: a steady trickle of small losses.
    let (service, _, connector) = setup(2_600.0);
    connector.set_fill_factor(dec!(0.985));

    let mut params = task_params(dec!(1000));
    params.enable_circuit_breaker = false;
    params.execution_time_minutes = 1;
    let task = service.create_task(params).await.unwrap();
    let mut rx = service.scheduler().subscribe(&task.id).await.unwrap();
    service.start_task(&task.id).await.unwrap();

    let (done, seen) = watch_until_terminal(&mut rx).await;
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.executions_count >= 30, "executions = {}", done.executions_count);
    assert!(seen >= 2);
    assert_eq!(done.total_profit, Decimal::ZERO);
    assert_eq!(done.consecutive_losses as usize, done.executions_count);
    assert_eq!(connector.conversions().len(), done.executions_count * 3);

    // Replaying the history reproduces the ledger, one execution at a time.
    let mut replay = Task::new(done.params.clone(), done.created_at);
    for execution in done.executions.iter().cloned() {
        Accountant::record(&mut replay, execution);
        assert_ledger_identity(&replay);
    }
    assert_eq!(replay.current_budget, done.current_budget);
    assert_eq!(replay.total_loss, done.total_loss);
    assert_eq!(replay.peak_budget, done.peak_budget);
    assert!((replay.max_drawdown - done.max_drawdown).abs() < 1e-9);

    // A chain that never wins keeps getting the trial stake.
    let stats = TaskStatistics::from_task(done);
    let chain = stats.chains.values().next().unwrap();
    assert_eq!(chain.successes, 0);
    assert!(chain.average_slippage() > 4.0);
}

#[tokio::test(start_paused = true)]
async fn test_proven_chain_earns_a_larger_stake() {
    let (service, _, _) = setup(2_600.0);
    let task = service.create_task(task_params(dec!(1000))).await.unwrap();
    let mut rx = service.scheduler().subscribe(&task.id).await.unwrap();
    service.start_task(&task.id).await.unwrap();

    rx.wait_for(|t| t.executions_count >= 4).await.unwrap();
    let stopped = service.stop_task(&task.id).await.unwrap();
    let stakes: Vec<Decimal> = stopped.executions.iter().map(|e| e.initial_amount).collect();

    // Three trial runs at 5% of the budget, then 20% scaled by the streak.
    for stake in &stakes[..3] {
        assert!(*stake < dec!(60), "trial stake {stake}");
    }
    assert!(stakes[3] > dec!(200), "proven stake {}", stakes[3]);
    assert!(stopped
        .last_decisions
        .iter()
        .all(|d| matches!(d, triangulum::strategy::DecisionRecord::Selected { .. })));
}
