use core::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Closed set of contribution kinds that carry a score.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    PullRequestOpened,
    PullRequestClosed,
    PullRequestMerged,
    PullRequestReviewed,
    IssueOpened,
    IssueClosed,
    IssueCommented,
    Push,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::PullRequestOpened,
        EventKind::PullRequestClosed,
        EventKind::PullRequestMerged,
        EventKind::PullRequestReviewed,
        EventKind::IssueOpened,
        EventKind::IssueClosed,
        EventKind::IssueCommented,
        EventKind::Push,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::PullRequestOpened => "pull_request_opened",
            EventKind::PullRequestClosed => "pull_request_closed",
            EventKind::PullRequestMerged => "pull_request_merged",
            EventKind::PullRequestReviewed => "pull_request_reviewed",
            EventKind::IssueOpened => "issue_opened",
            EventKind::IssueClosed => "issue_closed",
            EventKind::IssueCommented => "issue_commented",
            EventKind::Push => "push",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // producers are not consistent about casing ("PullRequestOpened" vs "pull_request_opened")
        let normalized: String = s
            .chars()
            .filter(|c| *c != '_' && *c != '-')
            .map(|c| c.to_ascii_lowercase())
            .collect();

        EventKind::ALL
            .into_iter()
            .find(|kind| kind.as_str().replace('_', "") == normalized)
            .ok_or_else(|| ValidationError::UnknownEventKind(s.to_string()))
    }
}

/// Contribution event as delivered by the upstream webhook normalizer. Nothing here has been
/// checked yet; see `ScoringService::validate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContributionEvent {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub event_kind: String,
    #[serde(default, rename = "repositoryID", alias = "repositoryId")]
    pub repository_id: i64,
    #[serde(default)]
    pub repository_name: String,
    #[serde(default, rename = "contributorID", alias = "contributorId")]
    pub contributor_id: String,
    pub timestamp: DateTime<Utc>,
}

/// A validated, scored contribution. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoreEvent {
    pub id: Uuid,
    #[serde(rename = "userID")]
    pub user_id: String,
    pub event_kind: EventKind,
    #[serde(rename = "repositoryID")]
    pub repository_id: i64,
    pub repository_name: String,
    pub score_delta: i64,
    pub timestamp: DateTime<Utc>,
}

impl ScoreEvent {
    /// Project scope for leaderboard fan-out; projects are keyed by repository.
    pub fn project_id(&self) -> String {
        self.repository_id.to_string()
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field '{0}'")]
    MissingField(&'static str),

    #[error("invalid event id '{0}'")]
    InvalidEventId(String),

    #[error("unknown event kind '{0}'")]
    UnknownEventKind(String),

    #[error("unknown timeframe '{0}'")]
    UnknownTimeframe(String),

    #[error("repository id must be non-zero")]
    InvalidRepositoryId,

    #[error("event timestamp {0} is in the future")]
    FutureTimestamp(DateTime<Utc>),

    #[error("page size {0} outside 1..={1}")]
    InvalidPageSize(i64, i64),

    #[error("offset {0} must be non-negative")]
    InvalidOffset(i64),

    #[error("project id must not be empty")]
    EmptyProjectId,
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_event_kind_parsing() {
        assert_eq!(
            "pull_request_opened".parse::<EventKind>(),
            Ok(EventKind::PullRequestOpened)
        );
        assert_eq!("IssueOpened".parse::<EventKind>(), Ok(EventKind::IssueOpened));
        assert_eq!("PUSH".parse::<EventKind>(), Ok(EventKind::Push));
        assert_eq!(
            "release_published".parse::<EventKind>(),
            Err(ValidationError::UnknownEventKind("release_published".into()))
        );
    }

    #[test]
    fn test_contribution_event_wire_names() {
        let raw = r#"{
            "id": "1d9b1f5e-4c1b-4a47-9a57-4f7f3d0a2c11",
            "eventKind": "issue_opened",
            "repositoryID": 1001,
            "repositoryName": "acme/widgets",
            "contributorID": "U",
            "timestamp": "2024-07-16T10:00:00Z"
        }"#;

        let event: ContributionEvent = serde_json::from_str(raw).unwrap();
        assert_eq!(event.repository_id, 1001);
        assert_eq!(event.contributor_id, "U");
        assert_eq!(event.event_kind, "issue_opened");
    }
}
