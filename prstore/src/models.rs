use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

// --- Pull request domain records ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PrState {
    Open,
    Closed,
    Merged,
}

impl PrState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PrState::Open => "open",
            PrState::Closed => "closed",
            PrState::Merged => "merged",
        }
    }

    /// Merged and closed pull requests never change again upstream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PrState::Open)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewState {
    Pending,
    Approved,
    ChangesRequested,
    Commented,
    Dismissed,
}

impl ReviewState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReviewState::Pending => "PENDING",
            ReviewState::Approved => "APPROVED",
            ReviewState::ChangesRequested => "CHANGES_REQUESTED",
            ReviewState::Commented => "COMMENTED",
            ReviewState::Dismissed => "DISMISSED",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: String,
    #[serde(default)]
    pub html_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
    #[serde(default)]
    pub color: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileChange {
    pub filename: String,
    pub status: String,
    pub additions: i64,
    pub deletions: i64,
    pub changes: i64,
    #[serde(default)]
    pub patch: Option<String>,
}

impl FileChange {
    /// The source drops the patch body for oversized diffs.
    pub fn patch_truncated(&self) -> bool {
        self.patch.is_none() && self.changes > 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Review {
    pub id: i64,
    #[serde(default)]
    pub user: Option<User>,
    pub state: ReviewState,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub html_url: String,
}

/// A pull request together with the child records gathered during enrichment.
///
/// `observed_at` is the instant this snapshot was read from the source. It
/// travels with the record into the cache and every storage row derived from
/// it, and is the version used when reconciling duplicates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PullRequest {
    pub repository: String,
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub state: PrState,
    #[serde(default)]
    pub author: Option<User>,
    pub html_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    pub base_branch: String,
    pub head_branch: String,
    #[serde(default)]
    pub labels: Vec<Label>,
    #[serde(default)]
    pub reviews: Vec<Review>,
    #[serde(default)]
    pub files: Vec<FileChange>,
    #[serde(default)]
    pub requested_reviewers: Vec<User>,
    #[serde(default)]
    pub assignees: Vec<User>,
    #[serde(default)]
    pub additions: i64,
    #[serde(default)]
    pub deletions: i64,
    #[serde(default)]
    pub changed_files: i64,
    #[serde(default)]
    pub draft: bool,
    #[serde(default)]
    pub mergeable: Option<bool>,
    pub observed_at: DateTime<Utc>,
}

impl PullRequest {
    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    pub fn author_login(&self) -> Option<&str> {
        self.author.as_ref().map(|user| user.login.as_str())
    }

    /// True when `login` is among the requested reviewers.
    pub fn is_waiting_for(&self, login: &str) -> bool {
        self.requested_reviewers.iter().any(|user| user.login == login)
    }

    /// List responses carry no size metrics; derive them from the file list
    /// when the record has none of its own.
    pub fn fill_size_from_files(&mut self) {
        if self.additions != 0 || self.deletions != 0 || self.changed_files != 0 {
            return;
        }
        if self.files.is_empty() {
            return;
        }
        self.additions = self.files.iter().map(|f| f.additions).sum();
        self.deletions = self.files.iter().map(|f| f.deletions).sum();
        self.changed_files = self.files.len() as i64;
    }
}

/// The four record kinds persisted by the loader, in load order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    PullRequest,
    Review,
    File,
    Label,
}

impl RecordKind {
    pub const ALL: [RecordKind; 4] = [
        RecordKind::PullRequest,
        RecordKind::Review,
        RecordKind::File,
        RecordKind::Label,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::PullRequest => "pull_request",
            RecordKind::Review => "review",
            RecordKind::File => "file",
            RecordKind::Label => "label",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// --- Metadata Catalog (SQLite) Models ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiBudget {
    pub api_endpoint: String,
    pub requests_left: i64,
    pub reset_time: i64, // Unix timestamp
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Running,
    Success,
    Partial,
    Failed,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Partial => "PARTIAL",
            TaskStatus::Failed => "FAILED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskLog {
    pub task_id: i64,
    pub task_name: String,
    pub start_time: i64, // Unix timestamp
    pub end_time: Option<i64>,
    pub status: String,
    pub details: String, // JSON string
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestWatermark {
    pub repository: String,
    pub window_end: i64, // Unix timestamp
    pub updated_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bare_pr() -> PullRequest {
        let at = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        PullRequest {
            repository: "octocat/hello-world".into(),
            number: 7,
            title: "Add greeting".into(),
            body: None,
            state: PrState::Merged,
            author: None,
            html_url: "https://github.com/octocat/hello-world/pull/7".into(),
            created_at: at,
            updated_at: at,
            merged_at: Some(at),
            closed_at: Some(at),
            base_branch: "main".into(),
            head_branch: "greeting".into(),
            labels: vec![],
            reviews: vec![],
            files: vec![],
            requested_reviewers: vec![],
            assignees: vec![],
            additions: 0,
            deletions: 0,
            changed_files: 0,
            draft: false,
            mergeable: None,
            observed_at: at,
        }
    }

    #[test]
    fn size_metrics_come_from_files_only_when_missing() {
        let mut pr = bare_pr();
        pr.files = vec![
            FileChange {
                filename: "src/lib.rs".into(),
                status: "modified".into(),
                additions: 10,
                deletions: 2,
                changes: 12,
                patch: Some("@@".into()),
            },
            FileChange {
                filename: "README.md".into(),
                status: "added".into(),
                additions: 3,
                deletions: 0,
                changes: 3,
                patch: None,
            },
        ];
        pr.fill_size_from_files();
        assert_eq!((pr.additions, pr.deletions, pr.changed_files), (13, 2, 2));

        pr.additions = 100;
        pr.fill_size_from_files();
        assert_eq!(pr.additions, 100);
        assert!(pr.files[1].patch_truncated());
    }

    #[test]
    fn terminal_states() {
        assert!(PrState::Merged.is_terminal());
        assert!(PrState::Closed.is_terminal());
        assert!(!PrState::Open.is_terminal());
    }
}
