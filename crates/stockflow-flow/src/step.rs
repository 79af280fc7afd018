//! Step contracts: the three-phase unit of work a flow is made of.
//!
//! A step separates read-only input gathering (`prepare`) from the
//! side-effect-free work (`compute`) and the single write-back
//! (`commit`). Only `compute` is retried; `prepare` and `commit` run
//! exactly once per step execution regardless of retries.

use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use stockflow_core::config::RetryConfig;
use stockflow_core::types::{Action, SectionId, Severity, StepId};
use stockflow_core::{Result, RunContext};

/// Input assembled by `prepare`, handed unchanged to every compute attempt.
pub type StepInput = serde_json::Value;

/// Output of a successful compute attempt (or a fallback).
pub type StepOutput = serde_json::Value;

/// Delay schedule between compute attempts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Backoff {
    Fixed { delay_ms: u64 },
    Exponential { initial_ms: u64, max_ms: u64 },
}

impl Backoff {
    /// Delay before retrying after the given zero-based failed attempt,
    /// with 0.8x-1.2x jitter so concurrent retries spread out.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = match self {
            Backoff::Fixed { delay_ms } => *delay_ms,
            Backoff::Exponential { initial_ms, max_ms } => initial_ms
                .saturating_mul(2u64.saturating_pow(attempt))
                .min(*max_ms),
        };
        let jitter = 0.8 + rand::random::<f64>() * 0.4;
        Duration::from_millis((base_ms as f64 * jitter) as u64)
    }
}

/// How many compute attempts a step gets and how long each may run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Per-attempt wall-clock limit. `None` disables the timeout.
    pub timeout: Option<Duration>,
}

impl RetryPolicy {
    pub fn from_config(cfg: &RetryConfig) -> Self {
        let backoff = if cfg.exponential {
            Backoff::Exponential {
                initial_ms: cfg.initial_backoff_ms,
                max_ms: cfg.max_backoff_ms,
            }
        } else {
            Backoff::Fixed {
                delay_ms: cfg.initial_backoff_ms,
            }
        };
        Self {
            max_attempts: cfg.max_attempts.max(1),
            backoff,
            timeout: cfg.timeout_secs.map(Duration::from_secs),
        }
    }

    /// Single attempt, no delay, no timeout. For cheap local steps.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            backoff: Backoff::Fixed { delay_ms: 0 },
            timeout: None,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

/// A sequential step. `compute` must not touch the shared context;
/// everything it needs arrives through the prepared input.
pub trait Step: Send + Sync + 'static {
    fn id(&self) -> StepId;

    /// Report section this step produces, if any. Drives section
    /// status tracking and failure isolation.
    fn section(&self) -> Option<SectionId> {
        None
    }

    fn retry(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    /// Severity recorded when all attempts fail and no fallback fires.
    fn severity_on_failure(&self) -> Severity {
        Severity::Error
    }

    /// Read from the shared context and assemble the compute input.
    fn prepare(&self, ctx: &RunContext) -> Result<StepInput>;

    /// The retryable work. Must be safe to re-run with the same input.
    fn compute<'a>(&'a self, input: &'a StepInput) -> BoxFuture<'a, Result<StepOutput>>;

    /// Degraded-mode output used when every attempt has failed.
    fn fallback(&self, _input: &StepInput) -> Option<StepOutput> {
        None
    }

    /// Write results back to the shared context and pick the outgoing
    /// transition. Runs once, only after a successful or fallback compute.
    fn commit(&self, ctx: &mut RunContext, input: StepInput, output: StepOutput) -> Result<Action>;
}

/// Forward the step contract through an `Arc`, so a shared handle can be
/// registered in a flow while the caller keeps one for inspection.
impl<T: Step + ?Sized> Step for Arc<T> {
    fn id(&self) -> StepId {
        (**self).id()
    }

    fn section(&self) -> Option<SectionId> {
        (**self).section()
    }

    fn retry(&self) -> RetryPolicy {
        (**self).retry()
    }

    fn severity_on_failure(&self) -> Severity {
        (**self).severity_on_failure()
    }

    fn prepare(&self, ctx: &RunContext) -> Result<StepInput> {
        (**self).prepare(ctx)
    }

    fn compute<'a>(&'a self, input: &'a StepInput) -> BoxFuture<'a, Result<StepOutput>> {
        (**self).compute(input)
    }

    fn fallback(&self, input: &StepInput) -> Option<StepOutput> {
        (**self).fallback(input)
    }

    fn commit(&self, ctx: &mut RunContext, input: StepInput, output: StepOutput) -> Result<Action> {
        (**self).commit(ctx, input, output)
    }
}

/// Per-item result of a batch step, in input order.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ItemOutcome {
    Ok { output: StepOutput },
    Failed { message: String },
    Cancelled,
}

impl ItemOutcome {
    pub fn is_ok(&self) -> bool {
        matches!(self, ItemOutcome::Ok { .. })
    }

    pub fn output(&self) -> Option<&StepOutput> {
        match self {
            ItemOutcome::Ok { output } => Some(output),
            _ => None,
        }
    }
}

/// A fan-out step: `prepare` yields a list of items, each computed
/// independently (and retried independently) under a concurrency cap,
/// then committed together with outcomes aligned to input order.
pub trait BatchStep: Send + Sync + 'static {
    fn id(&self) -> StepId;

    fn section(&self) -> Option<SectionId> {
        None
    }

    /// Retry policy applied to every item.
    fn retry(&self) -> RetryPolicy {
        RetryPolicy::default()
    }

    fn severity_on_failure(&self) -> Severity {
        Severity::Error
    }

    fn prepare(&self, ctx: &RunContext) -> Result<Vec<StepInput>>;

    fn compute_item<'a>(&'a self, item: &'a StepInput) -> BoxFuture<'a, Result<StepOutput>>;

    fn fallback_item(&self, _item: &StepInput) -> Option<StepOutput> {
        None
    }

    /// Sees every item outcome, successes and failures alike, and
    /// decides what the batch as a whole means for the run.
    fn commit(
        &self,
        ctx: &mut RunContext,
        items: Vec<StepInput>,
        outcomes: Vec<ItemOutcome>,
    ) -> Result<Action>;
}

/// A node in a flow graph.
#[derive(Clone)]
pub enum StepKind {
    Sequential(Arc<dyn Step>),
    Batch(Arc<dyn BatchStep>),
}

impl StepKind {
    pub fn sequential(step: impl Step) -> Self {
        StepKind::Sequential(Arc::new(step))
    }

    pub fn batch(step: impl BatchStep) -> Self {
        StepKind::Batch(Arc::new(step))
    }

    pub fn id(&self) -> StepId {
        match self {
            StepKind::Sequential(s) => s.id(),
            StepKind::Batch(b) => b.id(),
        }
    }

    pub fn section(&self) -> Option<SectionId> {
        match self {
            StepKind::Sequential(s) => s.section(),
            StepKind::Batch(b) => b.section(),
        }
    }
}

impl std::fmt::Debug for StepKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StepKind::Sequential(s) => write!(f, "Sequential({})", s.id()),
            StepKind::Batch(b) => write!(f, "Batch({})", b.id()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles_up_to_cap() {
        let backoff = Backoff::Exponential {
            initial_ms: 100,
            max_ms: 350,
        };
        // Jitter is 0.8x-1.2x, so check the jittered envelope.
        let first = backoff.delay(0).as_millis() as u64;
        assert!((80..=120).contains(&first), "first delay {first}");
        let second = backoff.delay(1).as_millis() as u64;
        assert!((160..=240).contains(&second), "second delay {second}");
        // 100 * 2^2 = 400 hits the 350 cap.
        let third = backoff.delay(2).as_millis() as u64;
        assert!((280..=420).contains(&third), "third delay {third}");
    }

    #[test]
    fn test_fixed_backoff_stays_flat() {
        let backoff = Backoff::Fixed { delay_ms: 200 };
        for attempt in 0..4 {
            let ms = backoff.delay(attempt).as_millis() as u64;
            assert!((160..=240).contains(&ms), "attempt {attempt}: {ms}");
        }
    }

    #[test]
    fn test_retry_policy_from_config() {
        let cfg = RetryConfig::default();
        let policy = RetryPolicy::from_config(&cfg);
        assert_eq!(policy.max_attempts, 3);
        assert!(matches!(policy.backoff, Backoff::Exponential { .. }));
        assert_eq!(policy.timeout, Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_zero_attempts_clamped_to_one() {
        let cfg = RetryConfig {
            max_attempts: 0,
            ..RetryConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&cfg).max_attempts, 1);
    }
}
