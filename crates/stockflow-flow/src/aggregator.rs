//! Failure collection and the halt-or-isolate decision.

use stockflow_core::types::{FailureRecord, SectionId, SectionState, SectionStatus, Severity};

/// What the engine should do after a failure is recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Advisory only, keep going on the normal path.
    Continue,
    /// Fail the owning section, route along the error edge if one exists.
    Isolate,
    /// Stop the run, preserving everything produced so far.
    Halt,
}

/// Collects failure records across a run and tracks per-section status.
///
/// Sections are kept in first-seen order so reports list them the way
/// the flow produced them.
#[derive(Debug, Default)]
pub struct ErrorAggregator {
    records: Vec<FailureRecord>,
    sections: Vec<(SectionId, SectionStatus)>,
}

impl ErrorAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a section as running. Re-entering a section that already
    /// reached a terminal state counts as a regeneration.
    pub fn begin(&mut self, section: &SectionId) {
        match self.status_mut(section) {
            Some(status) => {
                if matches!(
                    status.state,
                    SectionState::Succeeded | SectionState::Failed
                ) {
                    status.regenerations += 1;
                }
                status.state = SectionState::Running;
            }
            None => {
                let mut status = SectionStatus::pending();
                status.state = SectionState::Running;
                self.sections.push((section.clone(), status));
            }
        }
    }

    pub fn succeed(&mut self, section: &SectionId) {
        if let Some(status) = self.status_mut(section) {
            status.state = SectionState::Succeeded;
        }
    }

    /// Record a failure and decide how the run proceeds. Warnings and
    /// infos never change a section's state; errors fail the owning
    /// section; criticals halt the run.
    pub fn record(&mut self, record: FailureRecord) -> Verdict {
        let verdict = match record.severity {
            Severity::Critical => Verdict::Halt,
            Severity::Error => Verdict::Isolate,
            Severity::Warning | Severity::Info => Verdict::Continue,
        };
        if let Some(section) = record.section.clone() {
            if let Some(status) = self.status_mut(&section) {
                status.last_severity = Some(
                    status
                        .last_severity
                        .map_or(record.severity, |prev| prev.max(record.severity)),
                );
                if record.severity >= Severity::Error {
                    status.state = SectionState::Failed;
                }
            }
        }
        self.records.push(record);
        verdict
    }

    pub fn records(&self) -> &[FailureRecord] {
        &self.records
    }

    pub fn sections(&self) -> &[(SectionId, SectionStatus)] {
        &self.sections
    }

    pub fn status(&self, section: &SectionId) -> Option<&SectionStatus> {
        self.sections
            .iter()
            .find(|(id, _)| id == section)
            .map(|(_, status)| status)
    }

    pub fn into_parts(self) -> (Vec<FailureRecord>, Vec<(SectionId, SectionStatus)>) {
        (self.records, self.sections)
    }

    fn status_mut(&mut self, section: &SectionId) -> Option<&mut SectionStatus> {
        self.sections
            .iter_mut()
            .find(|(id, _)| id == section)
            .map(|(_, status)| status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stockflow_core::types::StepId;

    fn record(severity: Severity, section: Option<&str>) -> FailureRecord {
        FailureRecord::new(
            StepId::from("fetch"),
            section.map(SectionId::from),
            severity,
            "boom",
        )
    }

    #[test]
    fn test_severity_maps_to_verdict() {
        let mut agg = ErrorAggregator::new();
        assert_eq!(agg.record(record(Severity::Info, None)), Verdict::Continue);
        assert_eq!(
            agg.record(record(Severity::Warning, None)),
            Verdict::Continue
        );
        assert_eq!(agg.record(record(Severity::Error, None)), Verdict::Isolate);
        assert_eq!(agg.record(record(Severity::Critical, None)), Verdict::Halt);
        assert_eq!(agg.records().len(), 4);
    }

    #[test]
    fn test_error_fails_only_its_section() {
        let mut agg = ErrorAggregator::new();
        let prices = SectionId::from("prices");
        let news = SectionId::from("news");
        agg.begin(&prices);
        agg.begin(&news);
        agg.record(record(Severity::Error, Some("prices")));
        agg.succeed(&news);

        assert_eq!(agg.status(&prices).map(|s| s.state), Some(SectionState::Failed));
        assert_eq!(
            agg.status(&news).map(|s| s.state),
            Some(SectionState::Succeeded)
        );
    }

    #[test]
    fn test_warning_keeps_section_running() {
        let mut agg = ErrorAggregator::new();
        let section = SectionId::from("prices");
        agg.begin(&section);
        agg.record(record(Severity::Warning, Some("prices")));
        let status = agg.status(&section).cloned().unwrap();
        assert_eq!(status.state, SectionState::Running);
        assert_eq!(status.last_severity, Some(Severity::Warning));
        agg.succeed(&section);
        let status = agg.status(&section).cloned().unwrap();
        assert_eq!(status.state, SectionState::Succeeded);
        assert_eq!(status.last_severity, Some(Severity::Warning));
    }

    #[test]
    fn test_last_severity_keeps_the_worst() {
        let mut agg = ErrorAggregator::new();
        let section = SectionId::from("prices");
        agg.begin(&section);
        agg.record(record(Severity::Error, Some("prices")));
        agg.record(record(Severity::Warning, Some("prices")));
        assert_eq!(
            agg.status(&section).unwrap().last_severity,
            Some(Severity::Error)
        );
    }

    #[test]
    fn test_reentry_after_terminal_state_counts_regeneration() {
        let mut agg = ErrorAggregator::new();
        let section = SectionId::from("prices");
        agg.begin(&section);
        agg.record(record(Severity::Error, Some("prices")));
        agg.begin(&section);
        let status = agg.status(&section).unwrap();
        assert_eq!(status.state, SectionState::Running);
        assert_eq!(status.regenerations, 1);
    }

    #[test]
    fn test_sections_listed_in_first_seen_order() {
        let mut agg = ErrorAggregator::new();
        agg.begin(&SectionId::from("overview"));
        agg.begin(&SectionId::from("prices"));
        agg.begin(&SectionId::from("overview"));
        let ids: Vec<_> = agg.sections().iter().map(|(id, _)| id.0.as_str()).collect();
        assert_eq!(ids, ["overview", "prices"]);
    }
}
