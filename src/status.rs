//! Build status and availability value objects
//!
//! These are immutable snapshots: every state transition during a deploy
//! replaces the whole status rather than mutating it, so readers can hold a
//! clone without seeing a half-updated record.

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Where a build attempt currently stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum BuildState {
    NotBuilt,
    Fetching,
    Building,
    Success,
    Failed,
}

/// One commit as reported by the app's git repository
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GitCommit {
    pub id: String,
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub date: DateTime<Utc>,
    pub author: String,
    pub message: String,
}

/// Immutable snapshot of one build attempt
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BuildStatus {
    pub status: BuildState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<GitCommit>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub runner_id: Option<String>,
}

impl BuildStatus {
    pub fn not_built(commit: Option<GitCommit>) -> Self {
        Self {
            status: BuildState::NotBuilt,
            start_time: None,
            end_time: None,
            description: "This hasn't been built".to_string(),
            commit,
            runner_id: None,
        }
    }

    pub fn fetching(start_time: DateTime<Utc>) -> Self {
        Self {
            status: BuildState::Fetching,
            start_time: Some(start_time),
            end_time: None,
            description: "Fetching changes from git".to_string(),
            commit: None,
            runner_id: None,
        }
    }

    pub fn building(
        start_time: DateTime<Utc>,
        commit: Option<GitCommit>,
        runner_id: &str,
    ) -> Self {
        Self {
            status: BuildState::Building,
            start_time: Some(start_time),
            end_time: None,
            description: "Building now...".to_string(),
            commit,
            runner_id: Some(runner_id.to_string()),
        }
    }

    pub fn success(
        start_time: DateTime<Utc>,
        end_time: DateTime<Utc>,
        commit: Option<GitCommit>,
        runner_id: &str,
    ) -> Self {
        let secs = (end_time.timestamp_millis() - start_time.timestamp_millis()) / 1000;
        Self {
            status: BuildState::Success,
            start_time: Some(start_time),
            end_time: Some(end_time),
            description: format!("Completed successfully in {} seconds", secs),
            commit,
            runner_id: Some(runner_id.to_string()),
        }
    }

    pub fn failure(
        start_time: Option<DateTime<Utc>>,
        end_time: DateTime<Utc>,
        message: impl Into<String>,
        commit: Option<GitCommit>,
        runner_id: Option<String>,
    ) -> Self {
        Self {
            status: BuildState::Failed,
            start_time,
            end_time: Some(end_time),
            description: message.into(),
            commit,
            runner_id,
        }
    }
}

/// Whether an app currently has a live, routed instance
#[derive(Debug, Clone, Serialize)]
pub struct Availability {
    pub available: bool,
    #[serde(rename = "availableStatus")]
    pub status_text: String,
}

impl Availability {
    pub fn available() -> Self {
        Self {
            available: true,
            status_text: "Running".to_string(),
        }
    }

    pub fn unavailable(reason: impl Into<String>) -> Self {
        Self {
            available: false,
            status_text: reason.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn commit() -> GitCommit {
        GitCommit {
            id: "f00dfeed".to_string(),
            date: Utc.timestamp_opt(1_700_000_000, 0).unwrap(),
            author: "Dev Eloper".to_string(),
            message: "Initial commit".to_string(),
        }
    }

    #[test]
    fn test_not_built_without_commit_omits_commit_field() {
        let status = BuildStatus::not_built(None);
        let json = serde_json::to_value(&status).unwrap();

        assert_eq!(json["status"], "not-built");
        assert_eq!(json["description"], "This hasn't been built");
        assert!(json.get("commit").is_none());
        assert!(json.get("startTime").is_none());
        assert!(json.get("runnerId").is_none());
    }

    #[test]
    fn test_success_description_counts_whole_seconds() {
        let start = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let end = start + chrono::Duration::milliseconds(12_700);
        let status = BuildStatus::success(start, end, Some(commit()), "node");

        assert_eq!(status.status, BuildState::Success);
        assert_eq!(status.description, "Completed successfully in 12 seconds");
        assert_eq!(status.runner_id.as_deref(), Some("node"));
    }

    #[test]
    fn test_commit_date_serializes_as_epoch_millis() {
        let status = BuildStatus::not_built(Some(commit()));
        let json = serde_json::to_value(&status).unwrap();

        assert_eq!(json["commit"]["date"], 1_700_000_000_000i64);
        assert_eq!(json["commit"]["id"], "f00dfeed");
    }

    #[test]
    fn test_failure_keeps_message() {
        let end = Utc.timestamp_opt(1_700_000_100, 0).unwrap();
        let status = BuildStatus::failure(None, end, "Could not fetch from git: boom", None, None);
        assert_eq!(status.status, BuildState::Failed);
        assert_eq!(status.description, "Could not fetch from git: boom");
    }

    #[test]
    fn test_availability() {
        let avail = Availability::available();
        assert!(avail.available);
        assert_eq!(avail.status_text, "Running");

        let gone = Availability::unavailable("Stopped");
        assert!(!gone.available);
        assert_eq!(gone.status_text, "Stopped");
    }
}
