use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use ghfetcher::{
    api::ApiClient,
    client::{ApiRequest, ApiResponse, GitHubTransport},
    FetcherConfig, GitFetcher,
};
use prstore::cache::LocalRecordCache;
use serde_json::{json, Value};

pub const REPO: &str = "octocat/hello-world";

pub fn at(day: u32, hour: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, day, hour, 0, 0).unwrap()
}

fn ts(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// A list item as `GET /repos/{repo}/pulls` returns it.
pub fn pr_json(number: u64, merged_at: Option<DateTime<Utc>>, updated_at: DateTime<Utc>) -> Value {
    let state = if merged_at.is_some() { "closed" } else { "open" };
    let body = (number % 2 == 0).then(|| format!("Details for {number}"));
    json!({
        "number": number,
        "title": format!("Change {number}"),
        "body": body,
        "state": state,
        "user": {"login": "mona", "avatar_url": "https://avatars/mona", "html_url": "https://github.com/mona"},
        "html_url": format!("https://github.com/{REPO}/pull/{number}"),
        "created_at": ts(at(1, 0)),
        "updated_at": ts(updated_at),
        "closed_at": merged_at.map(ts),
        "merged_at": merged_at.map(ts),
        "base": {"ref": "main"},
        "head": {"ref": format!("change-{number}")},
        "labels": [{"name": "enhancement", "color": "a2eeef", "description": null}],
        "requested_reviewers": [{"login": "hubot"}],
        "draft": false
    })
}

fn files_json(number: u64) -> Value {
    json!([{
        "filename": format!("src/change_{number}.rs"),
        "status": "modified",
        "additions": 7,
        "deletions": 2,
        "changes": 9,
        "patch": format!("@@ -1 +1 @@\n-old {number}\n+new {number}")
    }])
}

fn reviews_json(number: u64) -> Value {
    json!([{
        "id": 10_000 + number,
        "user": {"login": "hubot"},
        "state": "APPROVED",
        "body": "Looks good",
        "submitted_at": ts(at(2, 0)),
        "html_url": format!("https://github.com/{REPO}/pull/{number}#review")
    }])
}

pub fn ok(body: Value) -> ApiResponse {
    ApiResponse {
        status: 200,
        body: body.to_string(),
        ..ApiResponse::default()
    }
}

pub fn status(code: u16, message: &str) -> ApiResponse {
    ApiResponse {
        status: code,
        body: json!({ "message": message }).to_string(),
        ..ApiResponse::default()
    }
}

/// In-memory GitHub. Serves listings, files and reviews for the pull
/// requests it holds and counts every request by path.
#[derive(Default)]
pub struct MockGitHub {
    pub private: bool,
    pub closed: Mutex<Vec<Value>>,
    pub open: Mutex<Vec<Value>>,
    /// Responses returned, in order, before normal routing for a path.
    pub scripted: Mutex<HashMap<String, VecDeque<ApiResponse>>>,
    pub requests: Mutex<Vec<ApiRequest>>,
    pub sent_at: Mutex<Vec<(String, tokio::time::Instant)>>,
}

impl MockGitHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_closed(items: Vec<Value>) -> Arc<Self> {
        let mock = Self::default();
        *mock.closed.lock().unwrap() = items;
        Arc::new(mock)
    }

    pub fn script(&self, path: &str, responses: Vec<ApiResponse>) {
        self.scripted
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .extend(responses);
    }

    pub fn calls_to(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .count()
    }

    pub fn calls_ending_with(&self, suffix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path.ends_with(suffix))
            .count()
    }

    pub fn requests_to(&self, path: &str) -> Vec<ApiRequest> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .cloned()
            .collect()
    }

    /// One page of `items`, with `Link` reported the way GitHub does: only
    /// when the result spans several pages.
    fn page(items: &[Value], request: &ApiRequest) -> ApiResponse {
        let per_page: usize = request
            .query_value("per_page")
            .and_then(|v| v.parse().ok())
            .unwrap_or(30);
        let page: usize = request
            .query_value("page")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        let body = Value::Array(
            items
                .iter()
                .skip((page - 1) * per_page)
                .take(per_page)
                .cloned()
                .collect(),
        );
        ApiResponse {
            has_next: Some(page * per_page < items.len()),
            ..ok(body)
        }
    }

    fn route(&self, request: &ApiRequest) -> ApiResponse {
        let repo_path = format!("/repos/{REPO}");
        let Some(rest) = request.path.strip_prefix(&repo_path) else {
            return status(404, "Not Found");
        };
        if rest.is_empty() {
            return ok(json!({ "private": self.private }));
        }
        if rest == "/pulls" {
            let items = match request.query_value("state") {
                Some("open") => self.open.lock().unwrap().clone(),
                _ => self.closed.lock().unwrap().clone(),
            };
            return Self::page(&items, request);
        }
        let parts: Vec<&str> = rest.trim_start_matches('/').split('/').collect();
        match parts.as_slice() {
            ["pulls", number, "files"] => match number.parse() {
                Ok(n) => Self::page(files_json(n).as_array().unwrap(), request),
                Err(_) => status(404, "Not Found"),
            },
            ["pulls", number, "reviews"] => match number.parse() {
                Ok(n) => Self::page(reviews_json(n).as_array().unwrap(), request),
                Err(_) => status(404, "Not Found"),
            },
            _ => status(404, "Not Found"),
        }
    }
}

#[async_trait]
impl GitHubTransport for MockGitHub {
    async fn send(&self, request: &ApiRequest) -> ghfetcher::error::Result<ApiResponse> {
        self.requests.lock().unwrap().push(request.clone());
        self.sent_at
            .lock()
            .unwrap()
            .push((request.path.clone(), tokio::time::Instant::now()));
        let scripted = self
            .scripted
            .lock()
            .unwrap()
            .get_mut(&request.path)
            .and_then(VecDeque::pop_front);
        Ok(scripted.unwrap_or_else(|| self.route(request)))
    }
}

pub fn client(mock: &Arc<MockGitHub>, config: FetcherConfig) -> Arc<ApiClient> {
    Arc::new(ApiClient::new(
        Arc::clone(mock) as Arc<dyn GitHubTransport>,
        config,
    ))
}

#[allow(dead_code)]
pub fn fetcher(
    mock: &Arc<MockGitHub>,
    cache: Option<Arc<LocalRecordCache>>,
) -> anyhow::Result<GitFetcher> {
    Ok(GitFetcher::new(REPO, client(mock, FetcherConfig::default()), cache)?)
}

#[allow(dead_code)]
pub fn pulls_path() -> String {
    format!("/repos/{REPO}/pulls")
}
