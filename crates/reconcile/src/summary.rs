//! Outcome bookkeeping for a reconciliation run

use serde::{Deserialize, Serialize};

/// The outcome of reconciling a single resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApplyOutcome {
    /// The resource was created.
    Created,
    /// The resource was replaced with a new instance.
    Replaced,
    /// The resource already matched the desired configuration.
    Unchanged,
    /// The resource was removed (teardown).
    Removed,
    /// Reconciling the resource failed; siblings continue.
    Failed { error: String },
    /// The resource was not touched.
    Skipped { reason: String },
}

impl ApplyOutcome {
    pub fn is_success(&self) -> bool {
        !matches!(self, Self::Failed { .. })
    }

    pub fn is_change(&self) -> bool {
        matches!(self, Self::Created | Self::Replaced | Self::Removed)
    }
}

/// Counts of per-resource outcomes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub created: usize,
    pub replaced: usize,
    pub unchanged: usize,
    pub removed: usize,
    pub failed: usize,
    pub skipped: usize,
}

impl RunSummary {
    pub fn record(&mut self, outcome: &ApplyOutcome) {
        match outcome {
            ApplyOutcome::Created => self.created += 1,
            ApplyOutcome::Replaced => self.replaced += 1,
            ApplyOutcome::Unchanged => self.unchanged += 1,
            ApplyOutcome::Removed => self.removed += 1,
            ApplyOutcome::Failed { .. } => self.failed += 1,
            ApplyOutcome::Skipped { .. } => self.skipped += 1,
        }
    }

    pub fn merge(&mut self, other: &RunSummary) {
        self.created += other.created;
        self.replaced += other.replaced;
        self.unchanged += other.unchanged;
        self.removed += other.removed;
        self.failed += other.failed;
        self.skipped += other.skipped;
    }

    pub fn total_changes(&self) -> usize {
        self.created + self.replaced + self.removed
    }

    pub fn is_success(&self) -> bool {
        self.failed == 0
    }
}

/// Everything that happened on one host.
///
/// `error` is set when a phase failure aborted the host's remaining phases;
/// the summary still counts whatever completed before the abort.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostReport {
    pub host: String,
    pub summary: RunSummary,
    pub error: Option<String>,
}

impl HostReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.summary.is_success()
    }
}

/// The aggregate result of a whole run: success only if every host's every
/// phase succeeded.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunReport {
    pub hosts: Vec<HostReport>,
}

impl RunReport {
    pub fn is_success(&self) -> bool {
        self.hosts.iter().all(HostReport::is_success)
    }

    pub fn summary(&self) -> RunSummary {
        let mut total = RunSummary::default();
        for host in &self.hosts {
            total.merge(&host.summary);
        }
        total
    }
}
