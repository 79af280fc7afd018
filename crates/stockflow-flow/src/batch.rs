//! Batch execution: concurrent fan-out over prepared items with
//! outcomes reassembled in input order.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use stockflow_core::types::{FailureRecord, Severity};
use stockflow_core::{Result, RunContext, StockflowError};

use crate::aggregator::ErrorAggregator;
use crate::executor::{run_attempts, StepOutcome};
use crate::step::{BatchStep, ItemOutcome, StepInput};

/// Execute one batch step: prepare the item list, compute every item
/// under the concurrency cap with per-item retries, then hand all
/// outcomes to a single commit.
///
/// One item failing never aborts its siblings. Cancellation skips items
/// that have not started; items already in flight run to completion and
/// the skipped ones are reported as cancelled.
pub async fn execute_batch(
    step: &Arc<dyn BatchStep>,
    ctx: &mut RunContext,
    aggregator: &mut ErrorAggregator,
    cancel: &CancellationToken,
    concurrency: usize,
) -> Result<StepOutcome> {
    let step_id = step.id();
    let section = step.section();

    let items = match step.prepare(ctx) {
        Ok(items) => items,
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

    debug!(step = %step_id, items = items.len(), concurrency, "dispatching batch");
    let outcomes = run_items(step, &items, cancel, concurrency).await;

    // Per-item markers are advisory; commit decides what the batch
    // as a whole means for the run.
    for (index, outcome) in outcomes.iter().enumerate() {
        if let ItemOutcome::Failed { message } = outcome {
            aggregator.record(FailureRecord::new(
                step_id.clone(),
                section.clone(),
                Severity::Warning,
                format!("item {index} failed: {message}"),
            ));
        }
    }

    match step.commit(ctx, items, outcomes) {
        Ok(action) => Ok(StepOutcome::Completed {
            action,
            degraded: false,
        }),
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

async fn run_items(
    step: &Arc<dyn BatchStep>,
    items: &[StepInput],
    cancel: &CancellationToken,
    concurrency: usize,
) -> Vec<ItemOutcome> {
    let step_id = step.id();
    let policy = step.retry();

    let mut indexed: Vec<(usize, ItemOutcome)> = stream::iter(items.iter().enumerate())
        .map(|(index, item)| {
            let step = Arc::clone(step);
            let step_id = step_id.clone();
            let policy = policy.clone();
            let cancel = cancel.clone();
            async move {
                if cancel.is_cancelled() {
                    return (index, ItemOutcome::Cancelled);
                }
                let computed =
                    run_attempts(&step_id, &policy, &cancel, || step.compute_item(item)).await;
                let outcome = match computed {
                    Ok(output) => ItemOutcome::Ok { output },
                    Err(StockflowError::Cancelled) => ItemOutcome::Cancelled,
                    Err(e) => match step.fallback_item(item) {
                        Some(output) => {
                            warn!(step = %step_id, index, error = %e, "item fallback used");
                            ItemOutcome::Ok { output }
                        }
                        None => ItemOutcome::Failed {
                            message: e.to_string(),
                        },
                    },
                };
                (index, outcome)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    indexed.sort_by_key(|(index, _)| *index);
    indexed.into_iter().map(|(_, outcome)| outcome).collect()
}

/// Verdict helper for batch commits: fail the step when no item made it.
pub fn all_items_failed(outcomes: &[ItemOutcome]) -> bool {
    !outcomes.is_empty() && outcomes.iter().all(|o| !o.is_ok())
}
