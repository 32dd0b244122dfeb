//! Dashboard HTTP API.
//!
//! Successful responses use the `{"code": 20000, "data": ...}` envelope and
//! failures `{"code": <status>, "message": ...}` (see [`crate::error`]).
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `POST` | `/api/detect/create_detect_task` | Submit free text with video links |
//! | `GET`  | `/api/detect/task_list` | All tasks with video counts |
//! | `GET`  | `/api/detect/get_task/{task_id}` | One task and its evil video ids |
//! | `GET`  | `/api/detect/task_result/{task_id}` | Report of a completed task |
//! | `GET`  | `/api/detect/get_round_videos/{task_id}/{round}` | One expansion round |
//! | `GET`  | `/api/detect/get_all_round_videos/{task_id}` | Every expansion round |
//! | `GET`  | `/api/geography/distribution` | Account share per province |
//! | `GET`  | `/api/trends/recent` | Daily publication counts |
//! | `GET`  | `/api/trends/hourly` | Publication counts per hour of day |
//! | `GET`  | `/api/keywords` | Tag shares |
//! | `GET`  | `/api/keywords/{keyword}/videos` | Videos carrying a tag |
//! | `GET`  | `/api/gangs` | Known gangs |
//! | `GET`  | `/api/gangs/{gang_id}` | Gang detail with cross-platform accounts |
//! | `GET`  | `/api/video` | Paged video search |
//! | `GET`  | `/api/video/top` | Most liked videos |
//! | `GET`  | `/api/video/carousel` | Newest videos with covers |
//! | `GET`  | `/api/profile/get_user_profile/{user_id}` | Account profile with its videos |
//! | `GET`  | `/api/report/` | Governance summary |
//! | `POST` | `/api/report/gen_report` | Generate the evidence report |
//! | `POST` | `/api/auth/login` | Exchange credentials for a token |
//! | `POST` | `/api/mail/` | Mail the zipped output directory |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! # Background work
//!
//! [`run_server`] also starts the task workers, the liveness scheduler
//! (`[liveness].enabled`) and the inbox watcher (`[watcher].enabled`). All of
//! them stop on Ctrl-C.

use axum::{
    extract::{rejection::JsonRejection, rejection::QueryRejection, Path, Query, State},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::auth;
use crate::config::Config;
use crate::context::AppContext;
use crate::dashboard::{self, GeographyCache, VideoQuery};
use crate::error::{ok, ApiError, Envelope};
use crate::liveness;
use crate::mail::{self, Mailer, SmtpMailer};
use crate::orchestrator::{Collaborators, SubmitError, TaskQueue};
use crate::report;
use crate::rounds::{self, RoundVideos};
use crate::tasks::{TaskRecord, TaskStatus, TaskSummary};
use crate::watcher;

type ApiResult<T> = Result<Json<Envelope<T>>, ApiError>;

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    ctx: AppContext,
    queue: TaskQueue,
    geography: Arc<GeographyCache>,
    mailer: Option<Arc<dyn Mailer>>,
}

impl AppState {
    pub fn new(ctx: AppContext, queue: TaskQueue, mailer: Option<Arc<dyn Mailer>>) -> Self {
        let ttl = Duration::from_secs(ctx.config.dashboard.geography_cache_secs);
        Self {
            ctx,
            queue,
            geography: Arc::new(GeographyCache::new(ttl)),
            mailer,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .max_age(Duration::from_secs(state.ctx.config.server.cors_max_age_secs));

    Router::new()
        .route("/api/detect/create_detect_task", post(create_detect_task))
        .route("/api/detect/task_list", get(task_list))
        .route("/api/detect/get_task/{task_id}", get(get_task))
        .route("/api/detect/task_result/{task_id}", get(task_result))
        .route(
            "/api/detect/get_round_videos/{task_id}/{round}",
            get(get_round_videos),
        )
        .route(
            "/api/detect/get_all_round_videos/{task_id}",
            get(get_all_round_videos),
        )
        .route("/api/geography/distribution", get(geography))
        .route("/api/trends/recent", get(trends_recent))
        .route("/api/trends/hourly", get(trends_hourly))
        .route("/api/keywords", get(keywords))
        .route("/api/keywords/{keyword}/videos", get(keyword_videos))
        .route("/api/gangs", get(gangs))
        .route("/api/gangs/{gang_id}", get(gang_detail))
        .route("/api/video", get(search_videos))
        .route("/api/video/top", get(top_videos))
        .route("/api/video/carousel", get(carousel))
        .route(
            "/api/profile/get_user_profile/{user_id}",
            get(user_profile),
        )
        .route("/api/report", get(report_summary))
        .route("/api/report/", get(report_summary))
        .route("/api/report/gen_report", post(gen_report))
        .route("/api/auth/login", post(login))
        .route("/api/mail", post(send_mail))
        .route("/api/mail/", post(send_mail))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// `evillens serve`: opens the store and serves until Ctrl-C.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let ctx = AppContext::open(config).await?;
    let collaborators = Collaborators::from_context(&ctx);
    run_server_with(ctx, collaborators, CancellationToken::new()).await
}

/// Like [`run_server`] but with caller-provided collaborators. Shuts down
/// when `cancel` fires or on Ctrl-C.
pub async fn run_server_with(
    ctx: AppContext,
    collaborators: Collaborators,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let config = ctx.config.clone();

    let inbox = if config.watcher.enabled {
        Some(watcher::start(ctx.clone(), cancel.clone())?)
    } else {
        None
    };
    let scheduler = config
        .liveness
        .enabled
        .then(|| liveness::spawn_scheduler(ctx.clone(), cancel.clone()));
    let (queue, workers) = TaskQueue::start(ctx.clone(), collaborators, cancel.clone());

    let mailer = config
        .mail
        .clone()
        .map(|mail| Arc::new(SmtpMailer::new(mail)) as Arc<dyn Mailer>);
    let app = build_router(AppState::new(ctx.clone(), queue, mailer));

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("EvilLens API listening on http://{}", listener.local_addr()?);
    info!(
        workers = config.tasks.workers,
        watcher = config.watcher.enabled,
        liveness = config.liveness.enabled,
        "server started"
    );

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = tokio::signal::ctrl_c() => {
                    if let Err(e) = result {
                        warn!(error = %e, "failed to listen for Ctrl-C");
                    }
                    shutdown.cancel();
                }
            }
        })
        .await?;

    cancel.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    if let Some(handle) = scheduler {
        let _ = handle.await;
    }
    if let Some(inbox) = inbox {
        let _ = inbox.consumer.await;
    }
    ctx.pool.close().await;
    info!("server stopped");
    Ok(())
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ /api/detect ============

#[derive(Deserialize)]
struct CreateTaskRequest {
    video_url: Option<String>,
}

#[derive(Serialize)]
struct CreatedTask {
    task_id: String,
    status: TaskStatus,
}

async fn create_detect_task(
    State(state): State<AppState>,
    body: Result<Json<CreateTaskRequest>, JsonRejection>,
) -> ApiResult<CreatedTask> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let text = request
        .video_url
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("video_url is required"))?;

    match state.queue.submit(&text).await {
        Ok(task) => Ok(ok(CreatedTask {
            task_id: task.task_id,
            status: task.status,
        })),
        Err(e @ SubmitError::NoVideoIds { .. }) => Err(ApiError::bad_request(e.to_string())),
        Err(e @ SubmitError::QueueFull { .. }) => Err(ApiError::Unavailable(e.to_string())),
        Err(SubmitError::Internal(e)) => Err(ApiError::Internal(e)),
    }
}

#[derive(Serialize)]
struct TaskList {
    tasks: Vec<TaskSummary>,
}

async fn task_list(State(state): State<AppState>) -> ApiResult<TaskList> {
    let tasks = state.queue.store().list().await?;
    Ok(ok(TaskList { tasks }))
}

#[derive(Serialize)]
struct TaskDetail {
    #[serde(flatten)]
    task: TaskRecord,
    evil_video_ids: Vec<String>,
}

async fn require_task(state: &AppState, task_id: &str) -> Result<TaskRecord, ApiError> {
    state
        .queue
        .store()
        .get(task_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task not found: {}", task_id)))
}

async fn get_task(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<TaskDetail> {
    let task = require_task(&state, &task_id).await?;
    let evil_video_ids = state.queue.store().video_ids(&task_id, true).await?;
    Ok(ok(TaskDetail {
        task,
        evil_video_ids,
    }))
}

async fn task_result(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<crate::tasks::TaskReport> {
    let task = require_task(&state, &task_id).await?;
    if task.status != TaskStatus::Completed {
        return Err(ApiError::bad_request(format!(
            "task {} is {}, results are only available once it has completed",
            task_id, task.status
        )));
    }
    let report = state
        .queue
        .store()
        .report(&task_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("task not found: {}", task_id)))?;
    Ok(ok(report))
}

#[derive(Serialize)]
struct RoundResponse {
    task_id: String,
    #[serde(flatten)]
    round: RoundVideos,
}

async fn get_round_videos(
    State(state): State<AppState>,
    Path((task_id, round)): Path<(String, u32)>,
) -> ApiResult<RoundResponse> {
    require_task(&state, &task_id).await?;
    let round = rounds::read_round(&state.ctx.config.paths.rounds_dir, &task_id, round)?
        .ok_or_else(|| {
            ApiError::not_found(format!("round {} of task {} not found", round, task_id))
        })?;
    Ok(ok(RoundResponse { task_id, round }))
}

#[derive(Serialize)]
struct AllRoundsResponse {
    task_id: String,
    total_rounds: usize,
    rounds: Vec<RoundVideos>,
}

async fn get_all_round_videos(
    State(state): State<AppState>,
    Path(task_id): Path<String>,
) -> ApiResult<AllRoundsResponse> {
    require_task(&state, &task_id).await?;
    let rounds = rounds::read_all_rounds(&state.ctx.config.paths.rounds_dir, &task_id)?;
    Ok(ok(AllRoundsResponse {
        task_id,
        total_rounds: rounds.len(),
        rounds,
    }))
}

// ============ Dashboard ============

async fn geography(State(state): State<AppState>) -> ApiResult<Vec<dashboard::ProvinceShare>> {
    Ok(ok(state.geography.get(&state.ctx.pool).await?))
}

#[derive(Deserialize, Default)]
struct TrendQuery {
    days: Option<i64>,
}

async fn trends_recent(
    State(state): State<AppState>,
    query: Result<Query<TrendQuery>, QueryRejection>,
) -> ApiResult<Vec<dashboard::DailyCount>> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let days = query
        .days
        .unwrap_or(state.ctx.config.dashboard.default_stats_days);
    if !(0..=dashboard::MAX_TREND_DAYS).contains(&days) {
        return Err(ApiError::bad_request(format!(
            "days must be between 0 and {}",
            dashboard::MAX_TREND_DAYS
        )));
    }
    Ok(ok(dashboard::recent_trend(&state.ctx.pool, days).await?))
}

async fn trends_hourly(State(state): State<AppState>) -> ApiResult<Vec<dashboard::HourlyCount>> {
    Ok(ok(dashboard::hourly_trend(&state.ctx.pool).await?))
}

async fn keywords(State(state): State<AppState>) -> ApiResult<Vec<dashboard::KeywordShare>> {
    Ok(ok(dashboard::keywords(&state.ctx.pool).await?))
}

async fn keyword_videos(
    State(state): State<AppState>,
    Path(keyword): Path<String>,
) -> ApiResult<dashboard::KeywordVideos> {
    Ok(ok(dashboard::keyword_videos(&state.ctx.pool, &keyword).await?))
}

async fn gangs(State(state): State<AppState>) -> ApiResult<Vec<dashboard::GangSummary>> {
    Ok(ok(dashboard::list_gangs(&state.ctx.pool).await?))
}

async fn gang_detail(
    State(state): State<AppState>,
    Path(gang_id): Path<String>,
) -> ApiResult<dashboard::GangDetail> {
    let detail = dashboard::gang_detail(&state.ctx.pool, &gang_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("gang not found: {}", gang_id)))?;
    Ok(ok(detail))
}

async fn search_videos(
    State(state): State<AppState>,
    query: Result<Query<VideoQuery>, QueryRejection>,
) -> ApiResult<dashboard::VideoPage> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let default_page_size = state.ctx.config.dashboard.default_page_size;
    if query.page_bounds(default_page_size).is_none() {
        return Err(ApiError::bad_request("current is out of range"));
    }
    let page = dashboard::search_videos(&state.ctx.pool, &query, default_page_size).await?;
    Ok(ok(page))
}

#[derive(Deserialize, Default)]
struct TopQuery {
    limit: Option<i64>,
}

async fn top_videos(
    State(state): State<AppState>,
    query: Result<Query<TopQuery>, QueryRejection>,
) -> ApiResult<Vec<dashboard::TopVideo>> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let limit = query
        .limit
        .unwrap_or(state.ctx.config.dashboard.default_page_size);
    Ok(ok(dashboard::top_videos(&state.ctx.pool, limit).await?))
}

#[derive(Deserialize, Default)]
struct CarouselQuery {
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn carousel(
    State(state): State<AppState>,
    query: Result<Query<CarouselQuery>, QueryRejection>,
) -> ApiResult<Vec<dashboard::CarouselItem>> {
    let Query(query) = query.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let offset = query.offset.unwrap_or(0);
    if offset < 0 {
        return Err(ApiError::bad_request("offset must not be negative"));
    }
    let limit = query
        .limit
        .unwrap_or(state.ctx.config.dashboard.carousel_limit);
    Ok(ok(dashboard::carousel(&state.ctx.pool, limit, offset).await?))
}

// ============ /api/profile ============

async fn user_profile(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> ApiResult<dashboard::UserProfile> {
    let profile = dashboard::user_profile(&state.ctx.pool, &user_id)
        .await?
        .ok_or_else(|| ApiError::not_found(format!("user not found: {}", user_id)))?;
    Ok(ok(profile))
}

// ============ /api/report ============

async fn report_summary(State(state): State<AppState>) -> ApiResult<report::GovernanceSummary> {
    Ok(ok(report::summary(&state.ctx.pool).await?))
}

async fn gen_report(State(state): State<AppState>) -> ApiResult<report::GeneratedReport> {
    let generated = report::generate_report(&state.ctx)
        .await?
        .ok_or_else(|| ApiError::bad_request("no unreported videos"))?;
    Ok(ok(generated))
}

// ============ /api/auth ============

#[derive(Deserialize)]
struct LoginRequest {
    username: Option<String>,
    password: Option<String>,
}

async fn login(
    State(state): State<AppState>,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> ApiResult<auth::LoginResponse> {
    let Json(request) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    let (Some(username), Some(password)) = (
        request.username.filter(|u| !u.is_empty()),
        request.password.filter(|p| !p.is_empty()),
    ) else {
        return Err(ApiError::bad_request("username and password are required"));
    };

    auth::login(&state.ctx.pool, &state.ctx.config.auth, &username, &password)
        .await?
        .map(ok)
        .ok_or_else(|| ApiError::Unauthorized("invalid username or password".to_string()))
}

// ============ /api/mail ============

#[derive(Deserialize, Default)]
struct MailRequest {
    zip_name: Option<String>,
}

async fn send_mail(
    State(state): State<AppState>,
    body: Result<Json<MailRequest>, JsonRejection>,
) -> ApiResult<mail::MailOutcome> {
    let request = body.map(|Json(r)| r).unwrap_or_default();
    let mailer = state
        .mailer
        .clone()
        .ok_or_else(|| ApiError::Unavailable("mail is not configured".to_string()))?;

    let outcome = mail::send_report_archive(
        &state.ctx.config.paths,
        mailer.as_ref(),
        request.zip_name.as_deref(),
    )
    .await?;
    Ok(ok(outcome))
}
