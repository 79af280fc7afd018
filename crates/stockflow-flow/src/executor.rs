//! Single-step execution: the retry loop around `compute` and the
//! prepare/commit bookkeeping around it.

use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stockflow_core::types::{Action, FailureRecord, Severity, StepId};
use stockflow_core::{Result, RunContext, StockflowError};

use crate::aggregator::{ErrorAggregator, Verdict};
use crate::step::{RetryPolicy, Step, StepOutput};

/// How a step execution ended, as seen by the engine.
#[derive(Debug)]
pub enum StepOutcome {
    Completed {
        action: Action,
        /// True when the output came from the fallback, not compute.
        degraded: bool,
    },
    Failed {
        record: FailureRecord,
        verdict: Verdict,
    },
}

/// Drive `compute` through the retry policy. Each attempt runs under the
/// policy's timeout; a timeout counts as a failed attempt. Cancellation
/// is checked before every attempt and stops the loop immediately.
pub(crate) async fn run_attempts<'a, F>(
    step: &StepId,
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    mut compute: F,
) -> Result<StepOutput>
where
    F: FnMut() -> BoxFuture<'a, Result<StepOutput>>,
{
    let mut last_error: Option<StockflowError> = None;
    for attempt in 0..policy.max_attempts {
        if cancel.is_cancelled() {
            return Err(StockflowError::Cancelled);
        }
        if attempt > 0 {
            let delay = policy.backoff.delay(attempt - 1);
            warn!(
                step = %step,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %last_error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                "retrying after backoff"
            );
            tokio::time::sleep(delay).await;
        }
        let future = compute();
        let result = match policy.timeout {
            Some(limit) => match tokio::time::timeout(limit, future).await {
                Ok(result) => result,
                Err(_) => Err(StockflowError::Timeout(limit)),
            },
            None => future.await,
        };
        match result {
            Ok(output) => return Ok(output),
            Err(StockflowError::Cancelled) => return Err(StockflowError::Cancelled),
            Err(e) => last_error = Some(e),
        }
    }
    Err(StockflowError::StepExhausted {
        step: step.to_string(),
        attempts: policy.max_attempts,
        message: last_error.map(|e| e.to_string()).unwrap_or_default(),
    })
}

/// Execute one sequential step end to end.
///
/// Phase order is fixed: prepare once, compute under retry, commit once.
/// A prepare or commit error fails the step without retrying. When
/// compute is exhausted the fallback (if any) supplies a degraded output
/// and the failure is downgraded to a warning.
pub async fn execute_step(
    step: &Arc<dyn Step>,
    ctx: &mut RunContext,
    aggregator: &mut ErrorAggregator,
    cancel: &CancellationToken,
) -> Result<StepOutcome> {
    let step_id = step.id();
    let section = step.section();

    let input = match step.prepare(ctx) {
        Ok(input) => input,
        Err(e) => {
            let record = FailureRecord::new(
                step_id,
                section,
                step.severity_on_failure(),
                format!("prepare failed: {e}"),
            );
            let verdict = aggregator.record(record.clone());
            return Ok(StepOutcome::Failed { record, verdict });
        }
    };

    let policy = step.retry();
    let computed = run_attempts(&step_id, &policy, cancel, || step.compute(&input)).await;

    let (output, degraded) = match computed {
        Ok(output) => (output, false),
        Err(StockflowError::Cancelled) => return Err(StockflowError::Cancelled),
        Err(e) => match step.fallback(&input) {
            Some(output) => {
                warn!(step = %step_id, error = %e, "compute exhausted, using fallback");
                let record = FailureRecord::new(
                    step_id.clone(),
                    section.clone(),
                    Severity::Warning,
                    format!("fallback after exhausted retries: {e}"),
                );
                aggregator.record(record);
                (output, true)
            }
            None => {
                let record = FailureRecord::new(
                    step_id,
                    section,
                    step.severity_on_failure(),
                    e.to_string(),
                );
                let verdict = aggregator.record(record.clone());
                return Ok(StepOutcome::Failed { record, verdict });
            }
        },
    };

    match step.commit(ctx, input, output) {
        Ok(action) => {
            debug!(step = %step_id, action = %action, degraded, "step committed");
            Ok(StepOutcome::Completed { action, degraded })
        }
        Err(e) => {
            let record = FailureRecord::new(
                step_id,
                section,
                step.severity_on_failure(),
                format!("commit failed: {e}"),
            );
            let verdict = aggregator.record(record.clone());
            Ok(StepOutcome::Failed { record, verdict })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use crate::step::Backoff;

    fn quick_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff: Backoff::Fixed { delay_ms: 10 },
            timeout: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_attempts_stop_at_first_success() {
        let calls = AtomicU32::new(0);
        let step = StepId::from("probe");
        let result = run_attempts(&step, &quick_policy(3), &CancellationToken::new(), || {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async move {
                if n < 1 {
                    Err(StockflowError::DataUnavailable {
                        source: "primary".into(),
                        message: "flaky".into(),
                    })
                } else {
                    Ok(serde_json::json!({"ok": true}))
                }
            })
        })
        .await;
        assert!(result.is_ok());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_exhaustion_reports_attempt_count_and_last_error() {
        let calls = AtomicU32::new(0);
        let step = StepId::from("probe");
        let result = run_attempts(&step, &quick_policy(3), &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                Err(StockflowError::DataUnavailable {
                    source: "primary".into(),
                    message: "down".into(),
                })
            })
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 3);
        match result {
            Err(StockflowError::StepExhausted {
                step,
                attempts,
                message,
            }) => {
                assert_eq!(step, "probe");
                assert_eq!(attempts, 3);
                assert!(message.contains("down"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_as_failed_attempt() {
        let calls = AtomicU32::new(0);
        let step = StepId::from("slow");
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: Backoff::Fixed { delay_ms: 1 },
            timeout: Some(std::time::Duration::from_millis(50)),
        };
        let result = run_attempts(&step, &policy, &CancellationToken::new(), || {
            calls.fetch_add(1, Ordering::SeqCst);
            Box::pin(async {
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
                Ok(serde_json::json!(null))
            })
        })
        .await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        match result {
            Err(StockflowError::StepExhausted { message, .. }) => {
                assert!(message.contains("timed out"), "message: {message}");
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_stops_before_next_attempt() {
        let calls = AtomicU32::new(0);
        let step = StepId::from("probe");
        let cancel = CancellationToken::new();
        let result = run_attempts(&step, &quick_policy(5), &cancel, || {
            calls.fetch_add(1, Ordering::SeqCst);
            cancel.cancel();
            Box::pin(async {
                Err(StockflowError::DataUnavailable {
                    source: "primary".into(),
                    message: "down".into(),
                })
            })
        })
        .await;
        assert!(matches!(result, Err(StockflowError::Cancelled)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
