//! Wire payloads of the GitHub REST API and their mapping onto storage records.

use chrono::{DateTime, Utc};
use prstore::models::{FileChange, Label, PrState, PullRequest, Review, ReviewState, User};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct ApiUser {
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
    #[serde(default)]
    pub html_url: Option<String>,
}

impl From<ApiUser> for User {
    fn from(user: ApiUser) -> Self {
        User {
            login: user.login,
            name: user.name,
            avatar_url: user.avatar_url.unwrap_or_default(),
            html_url: user.html_url.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiLabel {
    pub name: String,
    #[serde(default)]
    pub color: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiBranch {
    #[serde(rename = "ref")]
    pub ref_name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiPullRequest {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    pub state: String,
    #[serde(default)]
    pub user: Option<ApiUser>,
    pub html_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub closed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub merged_at: Option<DateTime<Utc>>,
    pub base: ApiBranch,
    pub head: ApiBranch,
    #[serde(default)]
    pub labels: Vec<ApiLabel>,
    #[serde(default)]
    pub requested_reviewers: Vec<ApiUser>,
    #[serde(default)]
    pub assignees: Vec<ApiUser>,
    #[serde(default)]
    pub draft: Option<bool>,
    #[serde(default)]
    pub additions: Option<i64>,
    #[serde(default)]
    pub deletions: Option<i64>,
    #[serde(default)]
    pub changed_files: Option<i64>,
    #[serde(default)]
    pub mergeable: Option<bool>,
}

impl ApiPullRequest {
    pub fn pr_state(&self) -> PrState {
        if self.merged_at.is_some() {
            PrState::Merged
        } else if self.state.eq_ignore_ascii_case("closed") {
            PrState::Closed
        } else {
            PrState::Open
        }
    }

    /// Builds a record with no children yet; enrichment fills them in.
    pub fn into_record(self, repository: &str, observed_at: DateTime<Utc>) -> PullRequest {
        let state = self.pr_state();
        PullRequest {
            repository: repository.to_string(),
            number: self.number,
            title: self.title,
            body: self.body,
            state,
            author: self.user.map(User::from),
            html_url: self.html_url,
            created_at: self.created_at,
            updated_at: self.updated_at,
            merged_at: self.merged_at,
            closed_at: self.closed_at,
            base_branch: self.base.ref_name,
            head_branch: self.head.ref_name,
            labels: self
                .labels
                .into_iter()
                .map(|label| Label {
                    name: label.name,
                    color: label.color.unwrap_or_default(),
                    description: label.description,
                })
                .collect(),
            reviews: Vec::new(),
            files: Vec::new(),
            requested_reviewers: self.requested_reviewers.into_iter().map(User::from).collect(),
            assignees: self.assignees.into_iter().map(User::from).collect(),
            additions: self.additions.unwrap_or(0),
            deletions: self.deletions.unwrap_or(0),
            changed_files: self.changed_files.unwrap_or(0),
            draft: self.draft.unwrap_or(false),
            mergeable: self.mergeable,
            observed_at,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiFile {
    pub filename: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub additions: i64,
    #[serde(default)]
    pub deletions: i64,
    #[serde(default)]
    pub changes: i64,
    #[serde(default)]
    pub patch: Option<String>,
}

impl From<ApiFile> for FileChange {
    fn from(file: ApiFile) -> Self {
        FileChange {
            filename: file.filename,
            status: file.status,
            additions: file.additions,
            deletions: file.deletions,
            changes: file.changes,
            patch: file.patch,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiReview {
    pub id: i64,
    #[serde(default)]
    pub user: Option<ApiUser>,
    pub state: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub submitted_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub html_url: Option<String>,
}

fn review_state(raw: &str) -> ReviewState {
    match raw.to_ascii_uppercase().as_str() {
        "APPROVED" => ReviewState::Approved,
        "CHANGES_REQUESTED" => ReviewState::ChangesRequested,
        "DISMISSED" => ReviewState::Dismissed,
        "PENDING" => ReviewState::Pending,
        "COMMENTED" => ReviewState::Commented,
        other => {
            log::debug!("Unknown review state '{}', recording as COMMENTED", other);
            ReviewState::Commented
        }
    }
}

impl From<ApiReview> for Review {
    fn from(review: ApiReview) -> Self {
        Review {
            id: review.id,
            user: review.user.map(User::from),
            state: review_state(&review.state),
            body: review.body,
            submitted_at: review.submitted_at,
            html_url: review.html_url.unwrap_or_default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiRepository {
    /// Missing visibility is treated as private.
    #[serde(default = "default_private")]
    pub private: bool,
}

fn default_private() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    #[test]
    fn list_item_maps_to_record() {
        let raw = json!({
            "number": 12,
            "title": "Add retries",
            "body": null,
            "state": "closed",
            "user": {"login": "mona", "avatar_url": "https://a", "html_url": "https://h"},
            "html_url": "https://github.com/octocat/hello-world/pull/12",
            "created_at": "2024-05-01T10:00:00Z",
            "updated_at": "2024-05-03T10:00:00Z",
            "closed_at": "2024-05-03T10:00:00Z",
            "merged_at": "2024-05-03T10:00:00Z",
            "base": {"ref": "main"},
            "head": {"ref": "retries"},
            "labels": [{"name": "bug", "color": "d73a4a", "description": null}],
            "draft": false
        });
        let api: ApiPullRequest = serde_json::from_value(raw).unwrap();
        let observed = Utc.with_ymd_and_hms(2024, 5, 4, 0, 0, 0).unwrap();
        let record = api.into_record("octocat/hello-world", observed);

        assert_eq!(record.state, PrState::Merged);
        assert_eq!(record.base_branch, "main");
        assert_eq!(record.author_login(), Some("mona"));
        assert_eq!(record.labels[0].name, "bug");
        assert_eq!(record.additions, 0);
        assert_eq!(record.observed_at, observed);
    }

    #[test]
    fn closed_without_merge_is_closed() {
        let api: ApiPullRequest = serde_json::from_value(json!({
            "number": 1, "title": "t", "state": "closed", "html_url": "",
            "created_at": "2024-05-01T10:00:00Z", "updated_at": "2024-05-01T10:00:00Z",
            "base": {"ref": "main"}, "head": {"ref": "x"}
        }))
        .unwrap();
        assert_eq!(api.pr_state(), PrState::Closed);
    }

    #[test]
    fn review_states_are_normalised() {
        assert_eq!(review_state("changes_requested"), ReviewState::ChangesRequested);
        assert_eq!(review_state("SOMETHING_NEW"), ReviewState::Commented);
    }
}
