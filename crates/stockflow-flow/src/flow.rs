//! Flow graphs: steps wired by labeled transitions, validated eagerly
//! at build time so a run never discovers a dangling edge.

use std::collections::{HashMap, HashSet};

use tracing::warn;

use stockflow_core::types::{Action, StepId};
use stockflow_core::{Result, StockflowError};

use crate::step::StepKind;

/// A validated, immutable flow graph. Built through [`FlowBuilder`].
pub struct Flow {
    entry: StepId,
    steps: HashMap<StepId, StepKind>,
    table: HashMap<(StepId, Action), StepId>,
}

impl Flow {
    pub fn builder() -> FlowBuilder {
        FlowBuilder::default()
    }

    pub fn entry(&self) -> &StepId {
        &self.entry
    }

    pub fn step(&self, id: &StepId) -> Option<&StepKind> {
        self.steps.get(id)
    }

    /// Resolve the transition for an action. Labels match exactly; a
    /// missing entry means the flow terminates naturally at this step.
    pub fn next(&self, from: &StepId, action: &Action) -> Option<&StepId> {
        self.table.get(&(from.clone(), action.clone()))
    }

    /// The error edge out of a step, if the flow defines one.
    pub fn error_edge(&self, from: &StepId) -> Option<&StepId> {
        self.table.get(&(from.clone(), Action::Error))
    }

    pub fn step_ids(&self) -> impl Iterator<Item = &StepId> {
        self.steps.keys()
    }
}

impl std::fmt::Debug for Flow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Flow")
            .field("entry", &self.entry)
            .field("steps", &self.steps.len())
            .field("transitions", &self.table.len())
            .finish()
    }
}

#[derive(Default)]
pub struct FlowBuilder {
    entry: Option<StepId>,
    steps: Vec<StepKind>,
    transitions: Vec<(StepId, Action, StepId)>,
}

impl FlowBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step. The first registered step becomes the entry
    /// unless [`entry`](Self::entry) overrides it.
    pub fn step(mut self, step: StepKind) -> Self {
        if self.entry.is_none() {
            self.entry = Some(step.id());
        }
        self.steps.push(step);
        self
    }

    pub fn entry(mut self, id: impl Into<StepId>) -> Self {
        self.entry = Some(id.into());
        self
    }

    pub fn on(
        mut self,
        from: impl Into<StepId>,
        action: Action,
        to: impl Into<StepId>,
    ) -> Self {
        self.transitions.push((from.into(), action, to.into()));
        self
    }

    /// Success edge: taken when commit returns [`Action::Default`].
    pub fn on_default(self, from: impl Into<StepId>, to: impl Into<StepId>) -> Self {
        self.on(from, Action::Default, to)
    }

    /// Error edge: taken by the engine when the step fails recoverably.
    pub fn on_error(self, from: impl Into<StepId>, to: impl Into<StepId>) -> Self {
        self.on(from, Action::Error, to)
    }

    pub fn on_label(
        self,
        from: impl Into<StepId>,
        label: impl Into<String>,
        to: impl Into<StepId>,
    ) -> Self {
        self.on(from, Action::label(label), to)
    }

    /// Validate and freeze the graph. Rejects empty flows, duplicate
    /// step ids, duplicate (step, action) pairs, edges touching
    /// unregistered steps, and an entry that is not a step.
    pub fn build(self) -> Result<Flow> {
        let entry = self
            .entry
            .ok_or_else(|| StockflowError::FlowDefinition("flow has no steps".into()))?;

        let mut steps = HashMap::with_capacity(self.steps.len());
        for step in self.steps {
            let id = step.id();
            if steps.insert(id.clone(), step).is_some() {
                return Err(StockflowError::FlowDefinition(format!(
                    "duplicate step id '{id}'"
                )));
            }
        }

        if !steps.contains_key(&entry) {
            return Err(StockflowError::FlowDefinition(format!(
                "entry step '{entry}' is not registered"
            )));
        }

        let mut table = HashMap::with_capacity(self.transitions.len());
        for (from, action, to) in self.transitions {
            if !steps.contains_key(&from) {
                return Err(StockflowError::FlowDefinition(format!(
                    "transition from unknown step '{from}'"
                )));
            }
            if !steps.contains_key(&to) {
                return Err(StockflowError::FlowDefinition(format!(
                    "transition from '{from}' on '{action}' targets unknown step '{to}'"
                )));
            }
            if table.insert((from.clone(), action.clone()), to).is_some() {
                return Err(StockflowError::FlowDefinition(format!(
                    "duplicate transition from '{from}' on '{action}'"
                )));
            }
        }

        let flow = Flow {
            entry,
            steps,
            table,
        };
        for id in flow.unreachable_steps() {
            warn!(step = %id, "step is unreachable from the entry");
        }
        Ok(flow)
    }
}

impl Flow {
    fn unreachable_steps(&self) -> Vec<StepId> {
        let mut seen: HashSet<&StepId> = HashSet::new();
        let mut stack = vec![&self.entry];
        while let Some(id) = stack.pop() {
            if !seen.insert(id) {
                continue;
            }
            for ((from, _), to) in &self.table {
                if from == id {
                    stack.push(to);
                }
            }
        }
        self.steps
            .keys()
            .filter(|id| !seen.contains(id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::future::BoxFuture;
    use serde_json::json;
    use stockflow_core::RunContext;

    use crate::step::{Step, StepInput, StepOutput};

    struct Noop(&'static str);

    impl Step for Noop {
        fn id(&self) -> StepId {
            StepId::from(self.0)
        }

        fn prepare(&self, _ctx: &RunContext) -> Result<StepInput> {
            Ok(json!(null))
        }

        fn compute<'a>(&'a self, _input: &'a StepInput) -> BoxFuture<'a, Result<StepOutput>> {
            Box::pin(async { Ok(json!(null)) })
        }

        fn commit(
            &self,
            _ctx: &mut RunContext,
            _input: StepInput,
            _output: StepOutput,
        ) -> Result<Action> {
            Ok(Action::Default)
        }
    }

    fn definition_error(result: Result<Flow>) -> String {
        match result {
            Err(StockflowError::FlowDefinition(msg)) => msg,
            other => panic!("expected flow definition error, got {other:?}"),
        }
    }

    #[test]
    fn test_first_step_is_default_entry() {
        let flow = Flow::builder()
            .step(StepKind::sequential(Noop("a")))
            .step(StepKind::sequential(Noop("b")))
            .on_default("a", "b")
            .build()
            .unwrap();
        assert_eq!(flow.entry(), &StepId::from("a"));
        assert_eq!(flow.next(&StepId::from("a"), &Action::Default), Some(&StepId::from("b")));
    }

    #[test]
    fn test_label_transitions_resolve_exactly() {
        let flow = Flow::builder()
            .step(StepKind::sequential(Noop("route")))
            .step(StepKind::sequential(Noop("single")))
            .step(StepKind::sequential(Noop("compare")))
            .on_label("route", "single_stock", "single")
            .on_label("route", "compare_stocks", "compare")
            .build()
            .unwrap();
        let route = StepId::from("route");
        assert_eq!(
            flow.next(&route, &Action::label("single_stock")),
            Some(&StepId::from("single"))
        );
        // Unmatched label means natural termination, not a fallback to default.
        assert_eq!(flow.next(&route, &Action::label("custom_query")), None);
        assert_eq!(flow.next(&route, &Action::Default), None);
    }

    #[test]
    fn test_empty_flow_rejected() {
        let msg = definition_error(Flow::builder().build());
        assert!(msg.contains("no steps"));
    }

    #[test]
    fn test_duplicate_step_id_rejected() {
        let msg = definition_error(
            Flow::builder()
                .step(StepKind::sequential(Noop("a")))
                .step(StepKind::sequential(Noop("a")))
                .build(),
        );
        assert!(msg.contains("duplicate step id"));
    }

    #[test]
    fn test_duplicate_transition_rejected() {
        let msg = definition_error(
            Flow::builder()
                .step(StepKind::sequential(Noop("a")))
                .step(StepKind::sequential(Noop("b")))
                .on_default("a", "b")
                .on_default("a", "a")
                .build(),
        );
        assert!(msg.contains("duplicate transition"));
    }

    #[test]
    fn test_edge_to_unknown_step_rejected() {
        let msg = definition_error(
            Flow::builder()
                .step(StepKind::sequential(Noop("a")))
                .on_default("a", "missing")
                .build(),
        );
        assert!(msg.contains("unknown step"));
    }

    #[test]
    fn test_unknown_entry_rejected() {
        let msg = definition_error(
            Flow::builder()
                .step(StepKind::sequential(Noop("a")))
                .entry("missing")
                .build(),
        );
        assert!(msg.contains("not registered"));
    }

    #[test]
    fn test_error_edge_lookup() {
        let flow = Flow::builder()
            .step(StepKind::sequential(Noop("a")))
            .step(StepKind::sequential(Noop("recover")))
            .on_error("a", "recover")
            .build()
            .unwrap();
        assert_eq!(flow.error_edge(&StepId::from("a")), Some(&StepId::from("recover")));
        assert_eq!(flow.error_edge(&StepId::from("recover")), None);
    }
}
