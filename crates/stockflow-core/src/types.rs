use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique identifier for one flow execution.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a step within a flow.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Identifier of a report section that a step contributes to.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct SectionId(pub String);

impl SectionId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }
}

impl std::fmt::Display for SectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A label produced by a step's commit phase, used to select the next
/// transition in the flow graph.
///
/// `Default` is the reserved success label; `Error` is reserved for the
/// engine's failure routing and is never produced by a successful commit.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Default,
    Error,
    Label { name: String },
}

impl Action {
    pub fn label(name: impl Into<String>) -> Self {
        Self::Label { name: name.into() }
    }
}

impl Default for Action {
    fn default() -> Self {
        Self::Default
    }
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Default => write!(f, "default"),
            Action::Error => write!(f, "error"),
            Action::Label { name } => write!(f, "{}", name),
        }
    }
}

/// Severity of a recorded failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Severity::Info => "INFO",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle state of a report section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SectionState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// Per-section status returned alongside the final context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SectionStatus {
    pub state: SectionState,
    /// Severity of the most recent failure affecting the section, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_severity: Option<Severity>,
    /// How many times this section has been regenerated within the process.
    pub regenerations: u32,
}

impl SectionStatus {
    pub fn pending() -> Self {
        Self {
            state: SectionState::Pending,
            last_severity: None,
            regenerations: 0,
        }
    }
}

/// A failure reported by the step executor when retries are exhausted or a
/// fallback fires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureRecord {
    pub step: StepId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub section: Option<SectionId>,
    pub severity: Severity,
    pub message: String,
    pub at: DateTime<Utc>,
}

impl FailureRecord {
    pub fn new(
        step: StepId,
        section: Option<SectionId>,
        severity: Severity,
        message: impl Into<String>,
    ) -> Self {
        Self {
            step,
            section,
            severity,
            message: message.into(),
            at: Utc::now(),
        }
    }
}

/// Class of externally fetched data; drives cache TTL policy.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataClass {
    Prices,
    Statements,
    Indicators,
}

/// Granularity of a price series.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Intraday,
    Daily,
    Weekly,
    Monthly,
}

/// Parameters for a data-source fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchParams {
    pub class: DataClass,
    pub granularity: Granularity,
}

impl FetchParams {
    pub fn new(class: DataClass, granularity: Granularity) -> Self {
        Self { class, granularity }
    }
}

/// Origin of a retrieved document; drives the reliability score component.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    RegulatoryFiling,
    EarningsCall,
    AnalystReport,
    CompanyPress,
    News,
    Social,
}

impl SourceType {
    /// Fixed reliability lookup, each value in [0, 1].
    pub fn reliability(&self) -> f64 {
        match self {
            SourceType::RegulatoryFiling => 1.0,
            SourceType::EarningsCall => 0.9,
            SourceType::AnalystReport => 0.8,
            SourceType::CompanyPress => 0.6,
            SourceType::News => 0.5,
            SourceType::Social => 0.3,
        }
    }
}

/// A document in the retrieval corpus. Outlives any single run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub source_type: SourceType,
    pub published_at: DateTime<Utc>,
}

/// Filter applied by the vector store before similarity search.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DocumentFilter {
    #[serde(default)]
    pub source_types: Vec<SourceType>,
    #[serde(default)]
    pub published_after: Option<DateTime<Utc>>,
}

/// A persisted, finished report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportRecord {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub sections: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_display() {
        assert_eq!(Action::Default.to_string(), "default");
        assert_eq!(Action::Error.to_string(), "error");
        assert_eq!(Action::label("single_stock").to_string(), "single_stock");
    }

    #[test]
    fn test_severity_ordering() {
        assert!(Severity::Critical > Severity::Error);
        assert!(Severity::Error > Severity::Warning);
        assert!(Severity::Warning > Severity::Info);
    }

    #[test]
    fn test_reliability_table_bounds_and_order() {
        let all = [
            SourceType::RegulatoryFiling,
            SourceType::EarningsCall,
            SourceType::AnalystReport,
            SourceType::CompanyPress,
            SourceType::News,
            SourceType::Social,
        ];
        for pair in all.windows(2) {
            assert!(pair[0].reliability() > pair[1].reliability());
        }
        for s in all {
            let r = s.reliability();
            assert!((0.0..=1.0).contains(&r));
        }
    }

    #[test]
    fn test_action_serialization_roundtrip() {
        let a = Action::label("compare_stocks");
        let json = serde_json::to_string(&a).unwrap();
        let parsed: Action = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, a);
    }
}
