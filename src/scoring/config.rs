use serde::{Deserialize, Serialize};

use super::{ScoringError, ScoringResult};
use crate::db::models::event::EventKind;

pub const DEFAULT_MAX_PAGE_SIZE: i64 = 1000;

/// Events stamped further ahead of the service clock than this are rejected.
pub const DEFAULT_MAX_CLOCK_SKEW_SECS: i64 = 5 * 60;

/// Score delta per event kind. Every kind is listed so a match over [`EventKind`] stays total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ScoringTable {
    pub pull_request_opened: i64,
    pub pull_request_closed: i64,
    pub pull_request_merged: i64,
    pub pull_request_reviewed: i64,
    pub issue_opened: i64,
    pub issue_closed: i64,
    pub issue_commented: i64,
    pub push: i64,
}

impl Default for ScoringTable {
    fn default() -> Self {
        Self {
            pull_request_opened: 1,
            pull_request_closed: 2,
            pull_request_merged: 5,
            pull_request_reviewed: 3,
            issue_opened: 4,
            issue_closed: 2,
            issue_commented: 1,
            push: 1,
        }
    }
}

impl ScoringTable {
    pub fn delta(&self, kind: EventKind) -> i64 {
        match kind {
            EventKind::PullRequestOpened => self.pull_request_opened,
            EventKind::PullRequestClosed => self.pull_request_closed,
            EventKind::PullRequestMerged => self.pull_request_merged,
            EventKind::PullRequestReviewed => self.pull_request_reviewed,
            EventKind::IssueOpened => self.issue_opened,
            EventKind::IssueClosed => self.issue_closed,
            EventKind::IssueCommented => self.issue_commented,
            EventKind::Push => self.push,
        }
    }

    /// Parses an override such as `{"push": 2}`; omitted kinds keep their default.
    pub fn from_json(raw: &str) -> ScoringResult<Self> {
        let table: ScoringTable = serde_json::from_str(raw)
            .map_err(|e| ScoringError::InvalidConfig(format!("scoring table: {e}")))?;
        table.check()?;
        Ok(table)
    }

    /// Rejects kinds that would score nothing or take points away; totals only grow.
    pub fn check(&self) -> ScoringResult<()> {
        match EventKind::ALL.into_iter().find(|kind| self.delta(*kind) <= 0) {
            Some(kind) => Err(ScoringError::InvalidConfig(format!(
                "scoring table: '{kind}' must have a positive delta, got {}",
                self.delta(kind)
            ))),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ScoringConfig {
    pub table: ScoringTable,
    pub max_page_size: i64,
    pub max_clock_skew: chrono::Duration,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            table: ScoringTable::default(),
            max_page_size: DEFAULT_MAX_PAGE_SIZE,
            max_clock_skew: chrono::Duration::seconds(DEFAULT_MAX_CLOCK_SKEW_SECS),
        }
    }
}

impl ScoringConfig {
    /// Default limits, with the table taken from `raw` JSON when present.
    pub fn from_table_override(raw: Option<&str>) -> ScoringResult<Self> {
        let table = match raw {
            Some(raw) => ScoringTable::from_json(raw)?,
            None => ScoringTable::default(),
        };

        Ok(Self {
            table,
            ..Default::default()
        })
    }
}
