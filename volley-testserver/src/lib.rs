//! In-memory stand-in for the pull-request review service, used as a load target in tests.
//!
//! Reviewer assignment is deterministic (first active teammates in insertion order) so that
//! tests can predict reassignment outcomes.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::SystemTime;

use axum::Json;
use axum::Router;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::time::{Duration, sleep};

pub const PATH_HEALTH: &str = "/health";
pub const PATH_TEAM_ADD: &str = "/team/add";
pub const PATH_TEAM_GET: &str = "/team/get";
pub const PATH_USERS_SET_IS_ACTIVE: &str = "/users/setIsActive";
pub const PATH_USERS_GET_REVIEW: &str = "/users/getReview";
pub const PATH_PR_CREATE: &str = "/pullRequest/create";
pub const PATH_PR_MERGE: &str = "/pullRequest/merge";
pub const PATH_PR_REASSIGN: &str = "/pullRequest/reassign";
/// Sleeps for `?ms=` milliseconds (default 50) before answering 200.
pub const PATH_SLOW: &str = "/slow";

#[derive(Debug, Clone, Default)]
pub struct TestServerStats {
    requests_total: Arc<AtomicU64>,
    teams_created: Arc<AtomicU64>,
    prs_created: Arc<AtomicU64>,
    prs_merged: Arc<AtomicU64>,
    reassigned: Arc<AtomicU64>,
    reassign_conflicts: Arc<AtomicU64>,
    reviews_fetched: Arc<AtomicU64>,
}

fn inc(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

impl TestServerStats {
    pub fn requests_total(&self) -> u64 {
        self.requests_total.load(Ordering::Relaxed)
    }

    pub fn teams_created(&self) -> u64 {
        self.teams_created.load(Ordering::Relaxed)
    }

    pub fn prs_created(&self) -> u64 {
        self.prs_created.load(Ordering::Relaxed)
    }

    pub fn prs_merged(&self) -> u64 {
        self.prs_merged.load(Ordering::Relaxed)
    }

    pub fn reassigned(&self) -> u64 {
        self.reassigned.load(Ordering::Relaxed)
    }

    pub fn reassign_conflicts(&self) -> u64 {
        self.reassign_conflicts.load(Ordering::Relaxed)
    }

    pub fn reviews_fetched(&self) -> u64 {
        self.reviews_fetched.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
struct User {
    username: String,
    team: String,
    active: bool,
}

#[derive(Debug, Clone)]
struct PullRequest {
    name: String,
    author_id: String,
    merged_at: Option<String>,
    reviewers: Vec<String>,
    created_at: String,
}

#[derive(Debug, Default)]
struct Db {
    /// team name -> member ids in insertion order
    teams: HashMap<String, Vec<String>>,
    users: HashMap<String, User>,
    prs: HashMap<String, PullRequest>,
}

impl Db {
    fn active_teammates(&self, team: &str) -> impl Iterator<Item = &String> {
        self.teams
            .get(team)
            .into_iter()
            .flatten()
            .filter(|id| self.users.get(*id).is_some_and(|u| u.active))
    }

    fn team_json(&self, name: &str) -> Option<Value> {
        let members: Vec<Value> = self
            .teams
            .get(name)?
            .iter()
            .filter_map(|id| {
                let u = self.users.get(id)?;
                Some(json!({"user_id": id, "username": u.username, "is_active": u.active}))
            })
            .collect();
        Some(json!({"team_name": name, "members": members}))
    }
}

#[derive(Clone, Default)]
struct AppState {
    stats: TestServerStats,
    db: Arc<Mutex<Db>>,
}

impl AppState {
    fn db(&self) -> MutexGuard<'_, Db> {
        self.db.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn now_rfc3339() -> String {
    humantime::format_rfc3339_seconds(SystemTime::now()).to_string()
}

fn pr_json(id: &str, pr: &PullRequest) -> Value {
    let mut v = json!({
        "pull_request_id": id,
        "pull_request_name": pr.name,
        "author_id": pr.author_id,
        "status": if pr.merged_at.is_some() { "MERGED" } else { "OPEN" },
        "assigned_reviewers": pr.reviewers,
        "createdAt": pr.created_at,
    });
    if let (Some(merged_at), Some(obj)) = (&pr.merged_at, v.as_object_mut()) {
        obj.insert("mergedAt".to_string(), json!(merged_at));
    }
    v
}

fn api_error(status: StatusCode, code: &str, message: &str) -> Response {
    (
        status,
        Json(json!({"error": {"code": code, "message": message}})),
    )
        .into_response()
}

fn bad_json() -> Response {
    api_error(StatusCode::BAD_REQUEST, "BAD_REQUEST", "invalid json body")
}

fn not_found() -> Response {
    api_error(StatusCode::NOT_FOUND, "NOT_FOUND", "resource not found")
}

fn parse<T: for<'de> Deserialize<'de>>(body: &[u8]) -> Option<T> {
    serde_json::from_slice(body).ok()
}

#[derive(Debug, Deserialize)]
struct TeamMemberIn {
    user_id: String,
    username: String,
    is_active: bool,
}

#[derive(Debug, Deserialize)]
struct TeamIn {
    team_name: String,
    members: Vec<TeamMemberIn>,
}

async fn handle_health(State(state): State<AppState>) -> Response {
    inc(&state.stats.requests_total);
    Json(json!({"status": "ok"})).into_response()
}

async fn handle_team_add(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    inc(&state.stats.requests_total);
    let Some(req) = parse::<TeamIn>(&body) else {
        return bad_json();
    };

    let mut db = state.db();
    if db.teams.contains_key(&req.team_name) {
        return api_error(
            StatusCode::BAD_REQUEST,
            "TEAM_EXISTS",
            "team already exists",
        );
    }

    let mut ids = Vec::with_capacity(req.members.len());
    for m in req.members {
        ids.push(m.user_id.clone());
        db.users.insert(
            m.user_id,
            User {
                username: m.username,
                team: req.team_name.clone(),
                active: m.is_active,
            },
        );
    }
    db.teams.insert(req.team_name.clone(), ids);
    inc(&state.stats.teams_created);

    let team = db.team_json(&req.team_name).unwrap_or(Value::Null);
    (StatusCode::CREATED, Json(json!({"team": team}))).into_response()
}

async fn handle_team_get(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    inc(&state.stats.requests_total);
    let Some(name) = q.get("team_name").filter(|s| !s.is_empty()) else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            "missing required 'team_name' query parameter",
        );
    };
    match state.db().team_json(name) {
        Some(team) => Json(team).into_response(),
        None => not_found(),
    }
}

#[derive(Debug, Deserialize)]
struct SetIsActiveIn {
    user_id: String,
    is_active: bool,
}

async fn handle_set_is_active(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    inc(&state.stats.requests_total);
    let Some(req) = parse::<SetIsActiveIn>(&body) else {
        return bad_json();
    };
    let mut db = state.db();
    let Some(user) = db.users.get_mut(&req.user_id) else {
        return not_found();
    };
    user.active = req.is_active;
    Json(json!({"user": {
        "user_id": req.user_id,
        "username": user.username,
        "team_name": user.team,
        "is_active": user.active,
    }}))
    .into_response()
}

async fn handle_get_review(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    inc(&state.stats.requests_total);
    let Some(user_id) = q.get("user_id").filter(|s| !s.is_empty()) else {
        return api_error(
            StatusCode::BAD_REQUEST,
            "BAD_REQUEST",
            "missing required 'user_id' query parameter",
        );
    };

    let db = state.db();
    if !db.users.contains_key(user_id) {
        return not_found();
    }
    let prs: Vec<Value> = db
        .prs
        .iter()
        .filter(|(_, pr)| pr.reviewers.iter().any(|r| r == user_id))
        .map(|(id, pr)| {
            json!({
                "pull_request_id": id,
                "pull_request_name": pr.name,
                "author_id": pr.author_id,
                "status": if pr.merged_at.is_some() { "MERGED" } else { "OPEN" },
            })
        })
        .collect();
    inc(&state.stats.reviews_fetched);
    Json(json!({"user_id": user_id, "pull_requests": prs})).into_response()
}

#[derive(Debug, Deserialize)]
struct CreatePrIn {
    pull_request_id: String,
    pull_request_name: String,
    author_id: String,
}

async fn handle_pr_create(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    inc(&state.stats.requests_total);
    let Some(req) = parse::<CreatePrIn>(&body) else {
        return bad_json();
    };

    let mut db = state.db();
    let Some(author) = db.users.get(&req.author_id) else {
        return not_found();
    };
    if db.prs.contains_key(&req.pull_request_id) {
        return api_error(
            StatusCode::CONFLICT,
            "PR_EXISTS",
            "pull request already exists",
        );
    }

    let reviewers: Vec<String> = db
        .active_teammates(&author.team)
        .filter(|id| **id != req.author_id)
        .take(2)
        .cloned()
        .collect();

    let pr = PullRequest {
        name: req.pull_request_name,
        author_id: req.author_id,
        merged_at: None,
        reviewers,
        created_at: now_rfc3339(),
    };
    let out = pr_json(&req.pull_request_id, &pr);
    db.prs.insert(req.pull_request_id, pr);
    inc(&state.stats.prs_created);

    (StatusCode::CREATED, Json(json!({"pr": out}))).into_response()
}

#[derive(Debug, Deserialize)]
struct MergePrIn {
    pull_request_id: String,
}

async fn handle_pr_merge(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    inc(&state.stats.requests_total);
    let Some(req) = parse::<MergePrIn>(&body) else {
        return bad_json();
    };

    let mut db = state.db();
    let Some(pr) = db.prs.get_mut(&req.pull_request_id) else {
        return not_found();
    };
    // Merging twice is idempotent.
    if pr.merged_at.is_none() {
        pr.merged_at = Some(now_rfc3339());
        inc(&state.stats.prs_merged);
    }
    Json(json!({"pr": pr_json(&req.pull_request_id, pr)})).into_response()
}

#[derive(Debug, Deserialize)]
struct ReassignIn {
    pull_request_id: String,
    old_user_id: String,
}

async fn handle_pr_reassign(State(state): State<AppState>, body: axum::body::Bytes) -> Response {
    inc(&state.stats.requests_total);
    let Some(req) = parse::<ReassignIn>(&body) else {
        return bad_json();
    };

    let mut db = state.db();
    let Some(pr) = db.prs.get(&req.pull_request_id).cloned() else {
        return not_found();
    };
    if pr.merged_at.is_some() {
        return api_error(
            StatusCode::CONFLICT,
            "PR_MERGED",
            "cannot reassign on merged PR",
        );
    }
    let Some(slot) = pr.reviewers.iter().position(|r| *r == req.old_user_id) else {
        return api_error(
            StatusCode::CONFLICT,
            "NOT_ASSIGNED",
            "reviewer is not assigned to this PR",
        );
    };
    let Some(old) = db.users.get(&req.old_user_id) else {
        return not_found();
    };

    let replacement = db
        .active_teammates(&old.team)
        .find(|id| **id != pr.author_id && !pr.reviewers.contains(*id))
        .cloned();
    let Some(replacement) = replacement else {
        inc(&state.stats.reassign_conflicts);
        return api_error(
            StatusCode::CONFLICT,
            "NO_CANDIDATE",
            "no active replacement candidate in team",
        );
    };

    let Some(stored) = db.prs.get_mut(&req.pull_request_id) else {
        return not_found();
    };
    stored.reviewers[slot] = replacement.clone();
    inc(&state.stats.reassigned);

    Json(json!({
        "pr": pr_json(&req.pull_request_id, stored),
        "replaced_by": replacement,
    }))
    .into_response()
}

async fn handle_slow(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> &'static str {
    inc(&state.stats.requests_total);
    let ms = q.get("ms").and_then(|v| v.parse().ok()).unwrap_or(50);
    sleep(Duration::from_millis(ms)).await;
    "slow"
}

fn app(state: AppState) -> Router {
    Router::new()
        .route(PATH_HEALTH, get(handle_health))
        .route(PATH_TEAM_ADD, post(handle_team_add))
        .route(PATH_TEAM_GET, get(handle_team_get))
        .route(PATH_USERS_SET_IS_ACTIVE, post(handle_set_is_active))
        .route(PATH_USERS_GET_REVIEW, get(handle_get_review))
        .route(PATH_PR_CREATE, post(handle_pr_create))
        .route(PATH_PR_MERGE, post(handle_pr_merge))
        .route(PATH_PR_REASSIGN, post(handle_pr_reassign))
        .route(PATH_SLOW, get(handle_slow))
        .with_state(state)
}

pub fn router(stats: TestServerStats) -> Router {
    app(AppState {
        stats,
        db: Arc::default(),
    })
}

pub struct TestServer {
    addr: SocketAddr,
    base_url: String,
    stats: TestServerStats,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    pub async fn start() -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let stats = TestServerStats::default();
        let app = router(stats.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = serve.await;
        });

        Ok(Self {
            addr,
            base_url: format!("http://{addr}"),
            stats,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    pub fn stats(&self) -> &TestServerStats {
        &self.stats
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if self.shutdown_tx.is_some()
            && let Some(task) = self.task.take()
        {
            task.abort();
        }
    }
}
