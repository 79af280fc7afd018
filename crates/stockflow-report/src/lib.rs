//! Stock-research report steps and the pre-built flows that wire them.

pub mod analyze;
pub mod compose;
pub mod fetch;
pub mod flows;
pub mod query;
pub mod rag;

pub use compose::ComposeReportStep;
pub use fetch::{BatchFetchStep, FetchClient, FetchDataStep};
pub use flows::{comparison_flow, custom_research_flow, research_flow, single_stock_flow, Collaborators};
pub use query::{validate_initial_context, ParsedQuery, QueryKind, QueryParser, RouteQueryStep};
pub use rag::RetrieveContextStep;
