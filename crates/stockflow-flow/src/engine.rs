//! The run loop: walks a flow graph step by step, routes on actions,
//! and turns failures into halt-or-isolate decisions.

use std::collections::HashMap;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use stockflow_core::config::FlowConfig;
use stockflow_core::context::{key, ns};
use stockflow_core::types::{FailureRecord, SectionId, SectionStatus, Severity, StepId};
use stockflow_core::{Result, RunContext, StockflowError};

use crate::aggregator::{ErrorAggregator, Verdict};
use crate::batch;
use crate::executor::{self, StepOutcome};
use crate::flow::Flow;
use crate::step::StepKind;

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    /// The flow reached a step with no matching outgoing transition.
    Completed,
    /// A failure stopped the run: either a critical severity, or an
    /// error with no error edge to route along.
    Halted { step: StepId, severity: Severity },
    /// Cancellation observed at a step boundary.
    Cancelled,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        matches!(self, RunOutcome::Completed)
    }
}

/// Everything a run produced, returned even when the run halted so
/// callers can render partial results.
#[derive(Debug)]
pub struct RunReport {
    pub context: RunContext,
    pub outcome: RunOutcome,
    pub sections: Vec<(SectionId, SectionStatus)>,
    pub failures: Vec<FailureRecord>,
    pub steps_executed: u32,
}

impl RunReport {
    pub fn failed_sections(&self) -> impl Iterator<Item = &SectionId> {
        self.sections
            .iter()
            .filter(|(_, status)| {
                matches!(status.state, stockflow_core::types::SectionState::Failed)
            })
            .map(|(id, _)| id)
    }
}

/// Drives flows to completion. Stateless between runs; one engine can
/// serve any number of flows.
pub struct FlowEngine {
    config: FlowConfig,
}

impl FlowEngine {
    pub fn new(config: FlowConfig) -> Self {
        Self { config }
    }

    pub async fn run(&self, flow: &Flow, ctx: RunContext) -> Result<RunReport> {
        self.run_with_cancel(flow, ctx, CancellationToken::new())
            .await
    }

    /// Run the flow, checking the token at every step boundary. A run
    /// never returns `Err` for step-level failures; those end up in the
    /// report. `Err` here means the graph itself is broken.
    pub async fn run_with_cancel(
        &self,
        flow: &Flow,
        mut ctx: RunContext,
        cancel: CancellationToken,
    ) -> Result<RunReport> {
        let mut aggregator = ErrorAggregator::new();
        let mut visits: HashMap<StepId, u32> = HashMap::new();
        let mut steps_executed = 0u32;
        let mut current = flow.entry().clone();
        info!(run = %ctx.run_id, entry = %current, "starting run");

        let outcome = loop {
            if cancel.is_cancelled() {
                info!(run = %ctx.run_id, step = %current, "run cancelled");
                break RunOutcome::Cancelled;
            }

            let visit = visits.entry(current.clone()).or_insert(0);
            *visit += 1;
            if *visit > self.config.max_step_visits {
                warn!(
                    step = %current,
                    visits = *visit,
                    "step visit limit reached, terminating run"
                );
                break RunOutcome::Completed;
            }

            let step = flow.step(&current).ok_or_else(|| {
                StockflowError::FlowDefinition(format!("step '{current}' missing from flow"))
            })?;
            ctx.current_step = Some(current.clone());
            if let Some(section) = step.section() {
                aggregator.begin(&section);
            }
            debug!(step = %current, "executing step");

            let result = match step {
                StepKind::Sequential(s) => {
                    executor::execute_step(s, &mut ctx, &mut aggregator, &cancel).await
                }
                StepKind::Batch(b) => {
                    batch::execute_batch(
                        b,
                        &mut ctx,
                        &mut aggregator,
                        &cancel,
                        self.config.batch_concurrency,
                    )
                    .await
                }
            };
            steps_executed += 1;

            let step_outcome = match result {
                Ok(outcome) => outcome,
                Err(StockflowError::Cancelled) => break RunOutcome::Cancelled,
                Err(e) => return Err(e),
            };

            match step_outcome {
                StepOutcome::Completed { action, degraded } => {
                    if let Some(section) = step.section() {
                        aggregator.succeed(&section);
                    }
                    info!(step = %current, action = %action, degraded, "step completed");
                    match flow.next(&current, &action) {
                        Some(next) => current = next.clone(),
                        None => {
                            debug!(step = %current, action = %action, "no outgoing transition");
                            break RunOutcome::Completed;
                        }
                    }
                }
                StepOutcome::Failed { record, verdict } => {
                    warn!(
                        step = %current,
                        severity = %record.severity,
                        message = %record.message,
                        "step failed"
                    );
                    ctx.shared.set(
                        key(ns::ERRORS, &record.step.0),
                        serde_json::to_value(&record)?,
                    );
                    match verdict {
                        Verdict::Halt => {
                            break RunOutcome::Halted {
                                step: current,
                                severity: record.severity,
                            }
                        }
                        Verdict::Isolate | Verdict::Continue => match flow.error_edge(&current)
                        {
                            Some(next) => {
                                info!(step = %current, next = %next, "routing along error edge");
                                current = next.clone();
                            }
                            None => {
                                break RunOutcome::Halted {
                                    step: current,
                                    severity: record.severity,
                                }
                            }
                        },
                    }
                }
            }
        };

        ctx.current_step = None;
        let (failures, sections) = aggregator.into_parts();
        info!(
            run = %ctx.run_id,
            ?outcome,
            steps = steps_executed,
            failures = failures.len(),
            "run finished"
        );
        Ok(RunReport {
            context: ctx,
            outcome,
            sections,
            failures,
            steps_executed,
        })
    }
}
