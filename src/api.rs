use crate::config::SchedulerConfig;
use crate::data::find_pack;
use crate::db::{Db, DbProvisioner};
use crate::error::SchedulerError;
use crate::mastery::{
    count_due_cards_in_pack, estimate_review_load, percent_pack_discovered, percent_pack_introduced,
    percent_pack_mastered, DueCounts, PackIndex, ReviewLoad,
};
use crate::models::{Fact, UserConfig};
use crate::session::{SessionController, SessionObserver, SessionReport, SessionStart, SessionState};
use axum::{
    extract::{Json, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;

pub const DEFAULT_PACK: &str = "mul";

/// Forwards session lifecycle events to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl SessionObserver for LogObserver {
    fn session_active(&self, active: bool) {
        log::info!("session active: {}", active);
    }

    fn session_finished(&self, report: &SessionReport) {
        log::info!(
            "session {} complete: {}/{} correct",
            report.session_id,
            report.correct,
            report.answered
        );
    }

    fn profile_updated(&self, user: &UserConfig) {
        log::debug!(
            "user {} has seen {} new facts today",
            user.id,
            user.new_cards_seen_today
        );
    }
}

pub type Controller = SessionController<DbProvisioner, LogObserver>;

#[derive(Clone)]
pub struct ApiState {
    pub controller: Arc<Mutex<Controller>>,
    pub db: Db,
    pub user_id: String,
}

impl ApiState {
    pub fn new(db: Db, config: SchedulerConfig, user_id: impl Into<String>) -> Result<Self, SchedulerError> {
        let controller = SessionController::new(config, DbProvisioner::new(db.clone()), LogObserver)?;
        Ok(Self {
            controller: Arc::new(Mutex::new(controller)),
            db,
            user_id: user_id.into(),
        })
    }
}

pub fn app_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/session/start", post(start_session))
        .route("/api/session/current", get(current_session))
        .route("/api/session/submit", post(submit_answer))
        .route("/api/stats", get(stats))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub enum ApiError {
    Scheduler(SchedulerError),
    Store(anyhow::Error),
}

impl From<SchedulerError> for ApiError {
    fn from(e: SchedulerError) -> Self {
        ApiError::Scheduler(e)
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        ApiError::Store(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Scheduler(SchedulerError::NotReady | SchedulerError::CannotBuildSession) => {
                StatusCode::CONFLICT
            }
            ApiError::Scheduler(SchedulerError::FactNotTracked(_)) => StatusCode::NOT_FOUND,
            ApiError::Scheduler(SchedulerError::ProvisioningFailed(_)) => StatusCode::BAD_GATEWAY,
            ApiError::Scheduler(SchedulerError::InvalidConfig(_)) | ApiError::Store(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let message = match &self {
            ApiError::Scheduler(e) => e.to_string(),
            ApiError::Store(e) => {
                log::error!("store error: {:#}", e);
                e.to_string()
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

#[derive(Serialize)]
pub struct SessionView {
    pub state: SessionState,
    pub current: Option<Fact>,
    pub queue_len: usize,
    pub estimated_reviews: usize,
    pub estimated_unique_facts: usize,
    pub report: Option<SessionReport>,
}

impl SessionView {
    fn of(controller: &Controller) -> Self {
        Self {
            state: controller.state(),
            current: controller.current_fact().cloned(),
            queue_len: controller.queue_len(),
            estimated_reviews: controller.estimated_reviews(),
            estimated_unique_facts: controller.estimated_unique_facts(),
            report: controller.last_report().cloned(),
        }
    }
}

/// Loads the learner and their pool, widening `active_group` to reach any
/// facts provisioning introduced beyond it.
async fn load_learner(state: &ApiState) -> anyhow::Result<(UserConfig, Vec<Fact>)> {
    let mut user = state.db.load_user(&state.user_id, DEFAULT_PACK).await?;
    let facts = state.db.facts_for_pack(&user.active_pack).await?;
    if user.cover_introduced_groups(&facts) {
        log::info!("user {} moved up to group {}", user.id, user.active_group);
        state.db.save_user(&user).await?;
    }
    Ok((user, facts))
}

/// Persists pending review progress. On failure the facts go back to the
/// controller so the next flush retries them.
async fn flush_progress(state: &ApiState, controller: &mut Controller) -> Result<(), ApiError> {
    let changed = controller.take_changed_facts();
    if changed.is_empty() {
        return Ok(());
    }

    let saved = state.db.save_progress(&changed, controller.user()).await;
    if let Err(e) = saved {
        controller.restore_changed_facts(changed);
        return Err(e.into());
    }
    Ok(())
}

async fn start_session(State(state): State<ApiState>) -> Result<Json<SessionView>, ApiError> {
    let mut controller = state.controller.lock().await;

    // Unsaved progress would be lost when the pool is reloaded.
    flush_progress(&state, &mut controller).await?;

    let (user, facts) = load_learner(&state).await?;
    controller.load(user, facts);

    // A provisioning round gets exactly one retry; a second shortfall surfaces as an error.
    if let SessionStart::AwaitingFacts { provisioned } = controller.start_session().await? {
        log::info!("provisioned {} facts, restarting session", provisioned);
        let (user, facts) = load_learner(&state).await?;
        controller.load(user, facts);
        controller.start_session().await?;
    }

    Ok(Json(SessionView::of(&controller)))
}

async fn current_session(State(state): State<ApiState>) -> Json<SessionView> {
    let controller = state.controller.lock().await;
    Json(SessionView::of(&controller))
}

#[derive(Deserialize)]
pub struct SubmitRequest {
    pub fact_id: String,
    pub correct: bool,
    pub elapsed_ms: u32,
}

#[derive(Serialize)]
pub struct SubmitResponse {
    pub updated: Fact,
    pub session: SessionView,
}

async fn submit_answer(
    State(state): State<ApiState>,
    Json(payload): Json<SubmitRequest>,
) -> Result<Json<SubmitResponse>, ApiError> {
    let mut controller = state.controller.lock().await;

    let updated = controller.submit_answer(&payload.fact_id, payload.correct, payload.elapsed_ms)?;
    flush_progress(&state, &mut controller).await?;

    Ok(Json(SubmitResponse {
        updated,
        session: SessionView::of(&controller),
    }))
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub pack: String,
    pub mastered_percent: u32,
    pub discovered_percent: u32,
    pub introduced_percent: u32,
    pub due: DueCounts,
    pub review_load: ReviewLoad,
}

async fn stats(State(state): State<ApiState>) -> Result<Json<StatsResponse>, ApiError> {
    let user = state.db.load_user(&state.user_id, DEFAULT_PACK).await?;
    let pack = user.active_pack;
    let facts = state.db.facts_for_pack(&pack).await?;
    let meta = state.db.pack_meta(&pack).await?;

    let index = match find_pack(&pack) {
        Some(def) => PackIndex::new(def.fact_ids()),
        None => PackIndex::from_facts(&pack, &facts),
    };

    Ok(Json(StatsResponse {
        mastered_percent: percent_pack_mastered(&facts, meta.as_ref(), &index),
        discovered_percent: percent_pack_discovered(&facts, meta.as_ref(), &index),
        introduced_percent: meta.as_ref().map(percent_pack_introduced).unwrap_or(0),
        due: count_due_cards_in_pack(&facts, meta.as_ref(), &index, Utc::now()),
        review_load: estimate_review_load(&facts),
        pack,
    }))
}
