//! Flow orchestration: step contracts, flow graphs, the retrying step
//! executor, batch fan-out, and the failure aggregator that decides
//! whether a run halts or degrades.

pub mod aggregator;
pub mod batch;
pub mod engine;
pub mod executor;
pub mod flow;
pub mod step;

pub use aggregator::{ErrorAggregator, Verdict};
pub use batch::{all_items_failed, execute_batch};
pub use engine::{FlowEngine, RunOutcome, RunReport};
pub use executor::{execute_step, StepOutcome};
pub use flow::{Flow, FlowBuilder};
pub use step::{
    Backoff, BatchStep, ItemOutcome, RetryPolicy, Step, StepInput, StepKind, StepOutput,
};
