//! Survey snapshots: the complete result of one scatter/gather round.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::report::NodeReport;

/// Which subject a survey was sent on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SurveyScope {
    /// Privileged system subject; replies carry core stats.
    Full,
    /// Unprivileged subject; core stats are never trusted.
    Basic,
}

/// Replies gathered by a single survey, keyed by server id.
#[derive(Debug, Clone)]
pub struct SurveySnapshot {
    /// When the survey started, unix seconds.
    pub epoch: u64,
    /// Wall time spent collecting.
    pub duration: Duration,
    pub scope: SurveyScope,
    pub replies: BTreeMap<String, NodeReport>,
    /// Replies expected: the configured count, or the high-water mark of
    /// distinct servers seen when no count is configured.
    pub expected_count: usize,
    pub received_count: usize,
    /// Replies dropped because they failed to parse.
    pub malformed_count: usize,
    /// Replies dropped because the server already answered this survey.
    pub duplicate_count: usize,
}

impl SurveySnapshot {
    /// An empty snapshot, as produced by a survey nobody answered.
    pub fn empty(epoch: u64, scope: SurveyScope) -> Self {
        Self {
            epoch,
            duration: Duration::ZERO,
            scope,
            replies: BTreeMap::new(),
            expected_count: 0,
            received_count: 0,
            malformed_count: 0,
            duplicate_count: 0,
        }
    }

    /// Build a snapshot directly from parsed reports.
    pub fn from_reports(epoch: u64, scope: SurveyScope, reports: Vec<NodeReport>) -> Self {
        let mut snapshot = Self::empty(epoch, scope);
        for report in reports {
            snapshot
                .replies
                .insert(report.identity.server_id.clone(), report);
        }
        snapshot.received_count = snapshot.replies.len();
        snapshot.expected_count = snapshot.received_count;
        snapshot
    }

    pub fn contains(&self, server_id: &str) -> bool {
        self.replies.contains_key(server_id)
    }

    /// Servers that were expected but did not answer, when a count was known.
    pub fn missing_count(&self) -> usize {
        self.expected_count.saturating_sub(self.received_count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::report::{CoreStats, NodeIdentity};

    fn report(id: &str) -> NodeReport {
        NodeReport {
            identity: NodeIdentity::new(id, id, "c1", "localhost"),
            core: CoreStats::Absent,
            routes: vec![],
            gateways: vec![],
        }
    }

    #[test]
    fn from_reports_counts_distinct_servers() {
        let snap = SurveySnapshot::from_reports(
            1000,
            SurveyScope::Full,
            vec![report("a"), report("b"), report("a")],
        );
        assert_eq!(snap.received_count, 2);
        assert_eq!(snap.expected_count, 2);
        assert!(snap.contains("a"));
        assert!(!snap.contains("c"));
    }

    #[test]
    fn missing_count_saturates() {
        let mut snap = SurveySnapshot::empty(1000, SurveyScope::Basic);
        snap.expected_count = 3;
        snap.received_count = 2;
        assert_eq!(snap.missing_count(), 1);

        snap.expected_count = 0;
        assert_eq!(snap.missing_count(), 0);
    }
}
