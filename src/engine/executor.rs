//! Chain executor.
//!
//! Issues the legs of one chain in order against the exchange, feeding the
//! output of each leg into the next. Transient connector errors are retried
//! with exponential backoff; anything else aborts the chain. A stop request
//! cancels the chain only while nothing has filled yet. Filled legs are
//! never unwound: a chain that fails part-way reports the asset it is left
//! holding, marked back to the base asset at the captured rates.

use chrono::Duration as ChronoDuration;
use rust_decimal::Decimal;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::ExecutionConfig;
use crate::exchange::{ConnectorError, ExchangeConnector, FillStatus};
use crate::types::{
    to_decimal, to_f64, Chain, ChainStep, EngineError, Execution, ExecutionStatus, LegFill,
    StrandedHolding,
};

/// Largest backoff exponent; keeps the shift in range for large retry counts.
const MAX_BACKOFF_EXPONENT: u32 = 16;

// ---------------------------------------------------------------------------
// Leg outcome
// ---------------------------------------------------------------------------

enum LegOutcome {
    Filled { output: Decimal, attempts: u32 },
    Failed { reason: String },
    /// Stop arrived while waiting to retry.
    Cancelled,
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    connector: Arc<dyn ExchangeConnector>,
    clock: Arc<dyn Clock>,
    config: ExecutionConfig,
}

impl ExecutionEngine {
    pub fn new(connector: Arc<dyn ExchangeConnector>, clock: Arc<dyn Clock>, config: ExecutionConfig) -> Self {
        Self {
            connector,
            clock,
            config,
        }
    }

    /// Execute `chain` with `amount` of the base asset.
    pub async fn execute(
        &self,
        chain: &Chain,
        amount: Decimal,
        task_id: Option<&str>,
    ) -> Result<Execution, EngineError> {
        self.execute_until(chain, amount, task_id, None).await
    }

    /// Execute `chain`, honouring `stop` until the first leg fills. A stop
    /// seen before the first leg, or while that leg waits to retry, yields
    /// a CANCELLED execution. After a fill the chain runs to completion or
    /// failure.
    ///
    /// Errors (no `Execution` produced): `RateExpired` when the captured
    /// rates are older than the staleness window, `InvalidParameters` for a
    /// non-positive amount or an empty chain.
    pub async fn execute_until(
        &self,
        chain: &Chain,
        amount: Decimal,
        task_id: Option<&str>,
        stop: Option<&watch::Receiver<bool>>,
    ) -> Result<Execution, EngineError> {
        let started_at = self.clock.now();

        if stop.map(|rx| *rx.borrow()).unwrap_or(false) {
            info!(chain = %chain.route(), "Stop requested before first leg, execution cancelled");
            return Ok(self.finish(
                chain,
                task_id,
                amount,
                amount,
                ExecutionStatus::Cancelled,
                Some("stop requested".into()),
                Vec::new(),
                None,
                started_at,
            ));
        }

        let age = chain.age(started_at);
        let limit = ChronoDuration::seconds(self.config.rate_staleness_secs);
        if age > limit {
            warn!(
                chain_id = %chain.id,
                age_ms = age.num_milliseconds(),
                "Chain rates expired"
            );
            return Err(EngineError::RateExpired {
                age_ms: age.num_milliseconds(),
                limit_ms: limit.num_milliseconds(),
            });
        }

        if amount <= Decimal::ZERO {
            return Err(EngineError::InvalidParameters(format!(
                "execution amount must be positive, got {amount}"
            )));
        }
        if chain.steps.is_empty() {
            return Err(EngineError::InvalidParameters(format!("chain {} has no steps", chain.id)));
        }

        info!(
            chain = %chain.route(),
            amount = format!("{:.4}", amount),
            expected = format!("{:.4}%", chain.profit_percent),
            "Executing chain"
        );

        let mut holding = amount;
        let mut legs: Vec<LegFill> = Vec::with_capacity(chain.steps.len());
        let mut failure: Option<String> = None;

        for (index, step) in chain.steps.iter().enumerate() {
            let leg_stop = if index == 0 { stop.cloned() } else { None };
            match self.run_leg(step, holding, leg_stop).await {
                LegOutcome::Filled { output, attempts } => {
                    debug!(
                        leg = index + 1,
                        symbol = %step.symbol,
                        side = %step.side,
                        input = %holding,
                        output = %output,
                        "Leg filled"
                    );
                    legs.push(LegFill {
                        step: index,
                        symbol: step.symbol.clone(),
                        side: step.side,
                        input_amount: holding,
                        output_amount: output,
                        attempts,
                    });
                    holding = output;
                }
                LegOutcome::Failed { reason } => {
                    warn!(
                        leg = index + 1,
                        symbol = %step.symbol,
                        reason = %reason,
                        "Leg failed, aborting chain"
                    );
                    failure = Some(format!("leg {} ({}) failed: {reason}", index + 1, step.symbol));
                    break;
                }
                LegOutcome::Cancelled => {
                    info!(chain = %chain.route(), "Stop requested during retry backoff, execution cancelled");
                    return Ok(self.finish(
                        chain,
                        task_id,
                        amount,
                        amount,
                        ExecutionStatus::Cancelled,
                        Some("stop requested".into()),
                        Vec::new(),
                        None,
                        started_at,
                    ));
                }
            }
        }

        let Some(error) = failure else {
            return Ok(self.finish(
                chain,
                task_id,
                amount,
                holding,
                ExecutionStatus::Completed,
                None,
                legs,
                None,
                started_at,
            ));
        };

        // Nothing filled: the budget never left the base asset.
        if legs.is_empty() {
            return Ok(self.finish(
                chain,
                task_id,
                amount,
                amount,
                ExecutionStatus::Failed,
                Some(error),
                legs,
                None,
                started_at,
            ));
        }

        let stranded = mark_to_base(&chain.steps[legs.len()..], &chain.steps[legs.len() - 1].to, holding);
        warn!(
            asset = %stranded.asset,
            amount = %stranded.amount,
            marked = format!("{:.4}", stranded.marked_value),
            "Chain stranded mid-route"
        );
        let final_amount = stranded.marked_value;
        Ok(self.finish(
            chain,
            task_id,
            amount,
            final_amount,
            ExecutionStatus::Failed,
            Some(error),
            legs,
            Some(stranded),
            started_at,
        ))
    }

    /// Issue one leg, retrying transient errors. With `stop`, a stop request
    /// (or a dropped sender) during a backoff abandons the leg.
    async fn run_leg(&self, step: &ChainStep, input: Decimal, mut stop: Option<watch::Receiver<bool>>) -> LegOutcome {
        let mut attempt: u32 = 0;
        loop {
            match self.connector.convert(&step.symbol, step.side, input).await {
                Ok(fill) => {
                    return match fill.status {
                        FillStatus::Filled if fill.filled_amount > Decimal::ZERO => LegOutcome::Filled {
                            output: fill.filled_amount,
                            attempts: attempt + 1,
                        },
                        FillStatus::Filled => LegOutcome::Failed {
                            reason: "empty fill".into(),
                        },
                        FillStatus::Rejected(reason) => LegOutcome::Failed {
                            reason: format!("rejected: {reason}"),
                        },
                    };
                }
                Err(ConnectorError::Transient(msg)) if attempt < self.config.max_retries => {
                    let backoff = self.backoff(attempt);
                    debug!(
                        symbol = %step.symbol,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %msg,
                        "Transient connector error, retrying"
                    );
                    match stop.as_mut() {
                        Some(rx) => {
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = rx.wait_for(|stop| *stop) => return LegOutcome::Cancelled,
                            }
                        }
                        None => tokio::time::sleep(backoff).await,
                    }
                    attempt += 1;
                }
                Err(ConnectorError::Transient(msg)) => {
                    return LegOutcome::Failed {
                        reason: format!("retries exhausted after {} attempts: {msg}", attempt + 1),
                    };
                }
                Err(ConnectorError::Fatal(msg)) => {
                    return LegOutcome::Failed {
                        reason: format!("fatal: {msg}"),
                    };
                }
            }
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.min(MAX_BACKOFF_EXPONENT);
        Duration::from_millis(self.config.backoff_base_ms.saturating_mul(factor))
    }

    #[allow(clippy::too_many_arguments)]
    fn finish(
        &self,
        chain: &Chain,
        task_id: Option<&str>,
        initial_amount: Decimal,
        final_amount: Decimal,
        status: ExecutionStatus,
        error: Option<String>,
        legs: Vec<LegFill>,
        stranded: Option<StrandedHolding>,
        started_at: chrono::DateTime<chrono::Utc>,
    ) -> Execution {
        let profit_percent = if initial_amount > Decimal::ZERO {
            to_f64((final_amount - initial_amount) / initial_amount) * 100.0
        } else {
            0.0
        };

        let execution = Execution {
            id: uuid::Uuid::new_v4().to_string(),
            task_id: task_id.map(str::to_string),
            chain_id: chain.id.clone(),
            chain: chain.clone(),
            initial_amount,
            final_amount,
            expected_profit_percent: chain.profit_percent,
            profit_percent,
            status,
            error,
            legs,
            stranded,
            started_at,
            finished_at: self.clock.now(),
        };

        info!(
            status = %execution.status,
            profit = format!("{:.4}%", execution.profit_percent),
            result = %execution,
            "Execution finished"
        );
        execution
    }
}

/// Value a stranded holding in the base asset by running it through the
/// remaining legs at their captured rates.
fn mark_to_base(remaining: &[ChainStep], asset: &str, amount: Decimal) -> StrandedHolding {
    let rate: f64 = remaining.iter().map(|s| s.rate).product();
    StrandedHolding {
        asset: asset.to_string(),
        amount,
        marked_value: (amount * to_decimal(rate)).max(Decimal::ZERO),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
