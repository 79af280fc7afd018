use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::{RunId, StepId};

/// Well-known key namespaces in the shared context.
///
/// Keys are dotted strings: `input.ticker`, `data.stock`, `analysis.sma`,
/// `rag.documents`, `report.sections`, `errors.fetch_data`.
pub mod ns {
    pub const INPUT: &str = "input";
    pub const DATA: &str = "data";
    pub const ANALYSIS: &str = "analysis";
    pub const RAG: &str = "rag";
    pub const REPORT: &str = "report";
    pub const ERRORS: &str = "errors";
}

/// Join a namespace and a key name into a context key.
pub fn key(namespace: &str, name: &str) -> String {
    format!("{}.{}", namespace, name)
}

/// Mutable key/value store shared between the steps of one run.
///
/// Exactly one run owns one instance; the flow engine never shares it
/// across concurrent runs. Keys are namespaced strings; values are JSON.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SharedContext {
    data: HashMap<String, serde_json::Value>,
}

impl SharedContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_map(data: HashMap<String, serde_json::Value>) -> Self {
        Self { data }
    }

    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.data.get(key)
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(|v| v.as_str())
    }

    pub fn set(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    pub fn set_str(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.data
            .insert(key.into(), serde_json::Value::String(value.into()));
    }

    pub fn contains(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// All keys under a namespace, e.g. every `analysis.*` entry.
    pub fn namespace(&self, namespace: &str) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        let prefix = format!("{}.", namespace);
        self.data.iter().filter_map(move |(k, v)| {
            k.strip_prefix(&prefix).map(|rest| (rest, v))
        })
    }

    pub fn data(&self) -> &HashMap<String, serde_json::Value> {
        &self.data
    }
}

/// Per-run state: the run identifier, the shared context, and the current
/// step pointer maintained by the flow engine.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: RunId,
    pub shared: SharedContext,
    pub current_step: Option<StepId>,
}

impl RunContext {
    pub fn new(shared: SharedContext) -> Self {
        Self {
            run_id: RunId::new(),
            shared,
            current_step: None,
        }
    }
}

impl Default for RunContext {
    fn default() -> Self {
        Self::new(SharedContext::new())
    }
}
