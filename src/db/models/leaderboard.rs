use core::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use super::event::ValidationError;

pub const KEY_PREFIX: &str = "leaderboard";
const GLOBAL_SCOPE: &str = "global";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Timeframe {
    AllTime,
    Yearly,
    Monthly,
    Weekly,
}

impl Timeframe {
    pub const ALL: [Timeframe; 4] = [
        Timeframe::AllTime,
        Timeframe::Yearly,
        Timeframe::Monthly,
        Timeframe::Weekly,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Timeframe::AllTime => "all_time",
            Timeframe::Yearly => "yearly",
            Timeframe::Monthly => "monthly",
            Timeframe::Weekly => "weekly",
        }
    }

    /// Calendar label of the window containing `at`; `None` for `all_time`.
    pub fn period(&self, at: DateTime<Utc>) -> Option<String> {
        match self {
            Timeframe::AllTime => None,
            Timeframe::Yearly => Some(format!("{}", at.year())),
            Timeframe::Monthly => Some(format!("{}-{:02}", at.year(), at.month())),
            Timeframe::Weekly => {
                let week = at.iso_week();
                Some(format!("{}-W{:02}", week.year(), week.week()))
            }
        }
    }
}

impl fmt::Display for Timeframe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Timeframe {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Timeframe::ALL
            .into_iter()
            .find(|tf| tf.as_str() == s)
            .ok_or_else(|| ValidationError::UnknownTimeframe(s.to_string()))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Scope {
    Global,
    Project(String),
}

impl Scope {
    pub fn as_str(&self) -> &str {
        match self {
            Scope::Global => GLOBAL_SCOPE,
            Scope::Project(id) => id,
        }
    }

    /// Inverse of [`Scope::as_str`], used for the `scope` column of snapshot rows.
    pub fn from_column(value: &str) -> Self {
        match value {
            GLOBAL_SCOPE => Scope::Global,
            id => Scope::Project(id.to_string()),
        }
    }
}

/// Names exactly one sorted set: `leaderboard:<scope>:<timeframe>[:<period>]`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LeaderboardKey {
    pub scope: Scope,
    pub timeframe: Timeframe,
    pub period: Option<String>,
}

impl LeaderboardKey {
    pub fn new(scope: Scope, timeframe: Timeframe, at: DateTime<Utc>) -> Self {
        Self {
            period: timeframe.period(at),
            scope,
            timeframe,
        }
    }

    pub fn all_time(scope: Scope) -> Self {
        Self {
            scope,
            timeframe: Timeframe::AllTime,
            period: None,
        }
    }

    /// Every key a project-bearing event at `at` contributes to: four global, four project.
    pub fn fan_out(project_id: &str, at: DateTime<Utc>) -> Vec<LeaderboardKey> {
        [Scope::Global, Scope::Project(project_id.to_string())]
            .into_iter()
            .flat_map(|scope| {
                Timeframe::ALL
                    .into_iter()
                    .map(move |tf| LeaderboardKey::new(scope.clone(), tf, at))
            })
            .collect()
    }

    /// Glob matching every leaderboard sorted set.
    pub fn wildcard() -> String {
        format!("{}:*", KEY_PREFIX)
    }
}

impl fmt::Display for LeaderboardKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", KEY_PREFIX, self.scope.as_str(), self.timeframe)?;
        if let Some(period) = &self.period {
            write!(f, ":{}", period)?;
        }

        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardRow {
    pub rank: i64,
    #[serde(rename = "userID")]
    pub user_id: String,
    pub score: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardPage {
    pub timeframe: Timeframe,
    #[serde(rename = "projectID", skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    pub rows: Vec<LeaderboardRow>,
}
