use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Display;
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::Mutex;

use crate::achievements::{Achievement, LearningStats};
use crate::clock::Clock;
use crate::curriculum::{Challenge, Curriculum, Module};
use crate::db::{self, Db};
use crate::engine::{ChallengeOutcome, LearningPath, StepOutcome};
use crate::models::*;
use crate::persistence::{FileStore, LocalStore, MemoryStore, PersistenceConfig, RemoteSync, SyncStatus};
use crate::prerequisites::{DependencyGraph, NavigationResult};
use crate::progress::OverallProgress;
use crate::recommendations::{AdaptiveSuggestion, Recommendation};

type ApiResult<T> = Result<Json<T>, (StatusCode, String)>;

/// Where each learner's local progress copy lives.
#[derive(Debug, Clone)]
pub enum StoreBackend {
    /// One shared store, one key per learner. Gone with the process.
    Memory(Arc<MemoryStore>),
    /// `{root}/{student_id}/{storage_key}.json`
    Files(PathBuf),
}

impl StoreBackend {
    pub fn memory() -> Self {
        StoreBackend::Memory(Arc::new(MemoryStore::new()))
    }
}

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

struct Session {
    path: Arc<Mutex<LearningPath>>,
    last_used: DateTime<Utc>,
}

/// Shared state of the learner API: the open sessions, keyed by learner.
#[derive(Clone)]
pub struct AppState {
    curriculum: Arc<Curriculum>,
    clock: Arc<dyn Clock>,
    remote: Option<Arc<dyn RemoteSync>>,
    persistence: PersistenceConfig,
    backend: StoreBackend,
    idle_timeout: Duration,
    sessions: Arc<StdMutex<HashMap<String, Session>>>,
}

impl AppState {
    pub fn new(
        curriculum: Arc<Curriculum>,
        clock: Arc<dyn Clock>,
        remote: Option<Arc<dyn RemoteSync>>,
        persistence: PersistenceConfig,
        backend: StoreBackend,
    ) -> Self {
        Self {
            curriculum,
            clock,
            remote,
            persistence,
            backend,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            sessions: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Sessions unused for longer than `idle` are closed on a later request.
    pub fn with_idle_timeout(mut self, idle: Duration) -> Self {
        self.idle_timeout = idle;
        self
    }

    pub fn open_sessions(&self) -> usize {
        self.lock_sessions().len()
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Session>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn local_store(&self, student_id: &str) -> (Arc<dyn LocalStore>, PersistenceConfig) {
        match &self.backend {
            StoreBackend::Memory(store) => {
                let mut config = self.persistence.clone();
                config.storage_key = format!("{}.{student_id}", config.storage_key);
                (store.clone(), config)
            }
            StoreBackend::Files(root) => {
                (Arc::new(FileStore::new(root.join(student_id))), self.persistence.clone())
            }
        }
    }

    fn has_stored_progress(&self, student_id: &str) -> bool {
        let (local, config) = self.local_store(student_id);
        matches!(local.read(&config.storage_key), Ok(Some(_)))
    }

    fn open_path(&self, student_id: &str) -> LearningPath {
        let (local, config) = self.local_store(student_id);
        LearningPath::open(
            student_id,
            self.curriculum.clone(),
            local,
            self.remote.clone(),
            config,
            self.clock.clone(),
        )
    }

    /// The learner's session for a request that may change progress. Opened
    /// from the local store on first use and kept until it goes idle.
    fn session(&self, student_id: &str) -> Result<Arc<Mutex<LearningPath>>, (StatusCode, String)> {
        self.checkout(student_id, true)
    }

    /// Like [`Self::session`], but a learner with nothing stored gets a fresh
    /// session that is dropped after the request.
    fn reader(&self, student_id: &str) -> Result<Arc<Mutex<LearningPath>>, (StatusCode, String)> {
        self.checkout(student_id, false)
    }

    fn checkout(&self, student_id: &str, keep: bool) -> Result<Arc<Mutex<LearningPath>>, (StatusCode, String)> {
        validate_student_id(student_id)?;
        let now = self.clock.now();
        let mut sessions = self.lock_sessions();
        let idle = self.take_idle(&mut sessions, now);

        let path = if let Some(existing) = sessions.get_mut(student_id) {
            existing.last_used = now;
            existing.path.clone()
        } else if keep || self.has_stored_progress(student_id) {
            let path = Arc::new(Mutex::new(self.open_path(student_id)));
            tracing::info!(student = student_id, "learner session opened");
            sessions.insert(student_id.to_string(), Session { path: path.clone(), last_used: now });
            path
        } else {
            Arc::new(Mutex::new(self.open_path(student_id)))
        };
        drop(sessions);

        for (id, session) in idle {
            self.close(id, session);
        }
        Ok(path)
    }

    /// Removes sessions that no request holds and that have been unused for
    /// longer than the idle timeout.
    fn take_idle(
        &self,
        sessions: &mut HashMap<String, Session>,
        now: DateTime<Utc>,
    ) -> Vec<(String, Arc<Mutex<LearningPath>>)> {
        let expired: Vec<String> = sessions
            .iter()
            .filter(|(_, s)| {
                Arc::strong_count(&s.path) == 1
                    && (now - s.last_used).to_std().is_ok_and(|idle| idle > self.idle_timeout)
            })
            .map(|(id, _)| id.clone())
            .collect();
        expired
            .into_iter()
            .filter_map(|id| sessions.remove(&id).map(|s| (id, s.path)))
            .collect()
    }

    /// The local copy is already current. With a remote configured, the
    /// pending snapshot gets one last send before the session is dropped.
    fn close(&self, student_id: String, session: Arc<Mutex<LearningPath>>) {
        tracing::info!(student = %student_id, "idle learner session closed");
        if self.remote.is_none() || Handle::try_current().is_err() {
            return;
        }
        tokio::spawn(async move {
            let sync = session.lock().await.sync_handle();
            if let Err(e) = sync.force_sync_now().await {
                tracing::warn!(student = %student_id, error = %e, "flush of closed session failed");
            }
        });
    }
}

/// Ids become directory names, so only a conservative charset is allowed.
fn validate_student_id(id: &str) -> Result<(), (StatusCode, String)> {
    let ok = !id.is_empty()
        && id.len() <= 64
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if ok {
        Ok(())
    } else {
        Err(e400("student id must be 1-64 characters of [A-Za-z0-9_-]"))
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/curriculum", get(curriculum))
        // learner session
        .route("/api/learners/:student_id/session", post(resume))
        .route("/api/learners/:student_id/progress", get(progress).delete(reset))
        .route("/api/learners/:student_id/steps", post(complete_step))
        .route("/api/learners/:student_id/time", post(add_time))
        .route("/api/learners/:student_id/onboarding", post(onboarding))
        .route("/api/learners/:student_id/modules/:module_id", get(module_detail))
        .route("/api/learners/:student_id/modules/:module_id/challenge", get(module_challenge))
        .route("/api/learners/:student_id/graph", get(graph))
        .route("/api/learners/:student_id/tiers", get(tiers))
        // rule engines
        .route("/api/learners/:student_id/recommendation", get(recommendation))
        .route("/api/learners/:student_id/adaptive", get(adaptive))
        .route("/api/learners/:student_id/achievements", get(achievements))
        .route("/api/learners/:student_id/stats", get(stats))
        // challenges
        .route("/api/learners/:student_id/challenges/:challenge_id/hint", post(hint))
        .route("/api/learners/:student_id/challenges/:challenge_id/submit", post(submit))
        // certificates
        .route("/api/learners/:student_id/certificates", get(certificates).post(issue_certificate))
        .route("/api/learners/:student_id/certificates/:kind/eligibility", get(eligibility))
        // replication
        .route("/api/learners/:student_id/sync", get(sync_status).post(force_sync))
        .with_state(state)
}

/// The remote progress endpoint that [`crate::remote::HttpRemote`] talks to.
pub fn remote_router(db: Db) -> Router {
    Router::new()
        .route("/api/progress/save", post(save_progress))
        .route("/api/progress/load/:student_id", get(load_progress))
        .with_state(db)
}

// --- views ---

#[derive(Serialize)]
struct ProgressView {
    state: StudentState,
    overall: OverallProgress,
    current_streak: u32,
    longest_streak: u32,
    sync: SyncStatus,
}

#[derive(Serialize)]
struct ModuleView {
    module: Module,
    status: MasteryStatus,
    completion_percentage: f64,
    steps: BTreeMap<WorkflowStep, bool>,
    navigation: NavigationResult,
    recommendation_reason: String,
    performance_score: u32,
    needs_review: bool,
}

#[derive(Serialize)]
struct TierView {
    tier: Tier,
    unlocked: bool,
    completion: f64,
}

#[derive(Serialize)]
struct RecommendationView {
    next: Recommendation,
    recommended_tier: Tier,
    suggested: Vec<String>,
    tips: Vec<String>,
}

#[derive(Serialize)]
struct AchievementsView {
    earned: Vec<Achievement>,
    locked: Vec<Achievement>,
    total_points: u32,
    total_possible_points: u32,
    earned_percentage: u32,
}

#[derive(Serialize)]
struct EligibilityView {
    certificate_type: CertificateType,
    eligible: bool,
}

// --- handlers ---

async fn curriculum(State(app): State<AppState>) -> Json<Vec<Module>> {
    Json(app.curriculum.modules().to_vec())
}

async fn resume(
    State(app): State<AppState>,
    Path(student_id): Path<String>,
) -> ApiResult<Vec<Achievement>> {
    let session = app.session(&student_id)?;
    let mut path = session.lock().await;
    Ok(Json(path.resume()))
}

async fn progress(
    State(app): State<AppState>,
    Path(student_id): Path<String>,
) -> ApiResult<ProgressView> {
    let session = app.reader(&student_id)?;
    let path = session.lock().await;
    let store = path.store();
    Ok(Json(ProgressView {
        state: store.state().clone(),
        overall: store.overall_progress(),
        current_streak: store.current_streak(),
        longest_streak: store.longest_streak(),
        sync: path.sync_status(),
    }))
}

async fn reset(
    State(app): State<AppState>,
    Path(student_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let session = app.session(&student_id)?;
    session.lock().await.reset();
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn complete_step(
    State(app): State<AppState>,
    Path(student_id): Path<String>,
    Json(req): Json<CompleteStepReq>,
) -> ApiResult<StepOutcome> {
    let session = app.session(&student_id)?;
    let mut path = session.lock().await;
    path.complete_step(&req.module_id, req.step).map(Json).map_err(e404)
}

async fn add_time(
    State(app): State<AppState>,
    Path(student_id): Path<String>,
    Json(req): Json<TimeSpentReq>,
) -> ApiResult<Vec<Achievement>> {
    let session = app.session(&student_id)?;
    let mut path = session.lock().await;
    path.add_time_spent(&req.module_id, req.minutes).map(Json).map_err(e404)
}

async fn onboarding(
    State(app): State<AppState>,
    Path(student_id): Path<String>,
) -> ApiResult<serde_json::Value> {
    let session = app.session(&student_id)?;
    session.lock().await.mark_onboarding_complete();
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn module_detail(
    State(app): State<AppState>,
    Path((student_id, module_id)): Path<(String, String)>,
) -> ApiResult<ModuleView> {
    let session = app.reader(&student_id)?;
    let path = session.lock().await;
    let module = path.curriculum().lookup(&module_id).map_err(e404)?.clone();
    let store = path.store();
    Ok(Json(ModuleView {
        status: store.status(&module_id),
        completion_percentage: store.completion_percentage(&module_id),
        steps: store.step_progress(&module_id),
        navigation: path.prerequisites().can_navigate(&module_id),
        recommendation_reason: path.recommendations().reason_for(&module_id),
        performance_score: path.assessment().performance_score(store, &module_id),
        needs_review: path.assessment().should_suggest_review(store, &module_id),
        module,
    }))
}

async fn module_challenge(
    State(app): State<AppState>,
    Path((student_id, module_id)): Path<(String, String)>,
) -> ApiResult<Challenge> {
    let session = app.session(&student_id)?;
    let mut path = session.lock().await;
    path.challenge_for(&module_id).map(Json).map_err(e404)
}

async fn graph(
    State(app): State<AppState>,
    Path(student_id): Path<String>,
) -> ApiResult<DependencyGraph> {
    let session = app.reader(&student_id)?;
    let path = session.lock().await;
    Ok(Json(path.prerequisites().dependency_graph()))
}

async fn tiers(
    State(app): State<AppState>,
    Path(student_id): Path<String>,
) -> ApiResult<Vec<TierView>> {
    let session = app.reader(&student_id)?;
    let path = session.lock().await;
    let prereqs = path.prerequisites();
    Ok(Json(
        Tier::ALL
            .into_iter()
            .map(|tier| TierView {
                tier,
                unlocked: prereqs.tier_unlocked(tier),
                completion: prereqs.tier_completion(tier),
            })
            .collect(),
    ))
}

async fn recommendation(
    State(app): State<AppState>,
    Path(student_id): Path<String>,
) -> ApiResult<RecommendationView> {
    let session = app.reader(&student_id)?;
    let path = session.lock().await;
    let engine = path.recommendations();
    Ok(Json(RecommendationView {
        next: engine.next(),
        recommended_tier: engine.recommended_tier(),
        suggested: engine.suggested_modules(3).iter().map(|m| m.id.clone()).collect(),
        tips: engine.personalized_tips(),
    }))
}

async fn adaptive(
    State(app): State<AppState>,
    Path(student_id): Path<String>,
) -> ApiResult<AdaptiveSuggestion> {
    let session = app.reader(&student_id)?;
    let path = session.lock().await;
    Ok(Json(path.recommendations().adaptive_difficulty()))
}

async fn achievements(
    State(app): State<AppState>,
    Path(student_id): Path<String>,
) -> ApiResult<AchievementsView> {
    let session = app.reader(&student_id)?;
    let path = session.lock().await;
    let (engine, store) = (path.achievements(), path.store());
    Ok(Json(AchievementsView {
        earned: engine.earned(store),
        locked: engine.locked(store),
        total_points: engine.total_points(store),
        total_possible_points: engine.total_possible_points(),
        earned_percentage: engine.earned_percentage(store),
    }))
}

async fn stats(
    State(app): State<AppState>,
    Path(student_id): Path<String>,
) -> ApiResult<LearningStats> {
    let session = app.reader(&student_id)?;
    let path = session.lock().await;
    Ok(Json(path.achievements().learning_stats(path.store())))
}

async fn hint(
    State(app): State<AppState>,
    Path((student_id, challenge_id)): Path<(String, String)>,
) -> ApiResult<serde_json::Value> {
    let session = app.session(&student_id)?;
    let mut path = session.lock().await;
    let hint = path.next_hint(&challenge_id).map_err(e404)?;
    Ok(Json(serde_json::json!({ "hint": hint })))
}

async fn submit(
    State(app): State<AppState>,
    Path((student_id, challenge_id)): Path<(String, String)>,
    Json(req): Json<SubmitChallengeReq>,
) -> ApiResult<ChallengeOutcome> {
    let session = app.session(&student_id)?;
    let mut path = session.lock().await;
    if path.curriculum().challenge(&challenge_id).is_err() {
        return Err(e404(format!("no challenge with id {challenge_id}")));
    }
    Ok(Json(path.submit_challenge(&challenge_id, &req.answer, req.time_spent_seconds)))
}

async fn certificates(
    State(app): State<AppState>,
    Path(student_id): Path<String>,
) -> ApiResult<Vec<Certificate>> {
    let session = app.reader(&student_id)?;
    let path = session.lock().await;
    let certs = path.achievements().certificates(path.store());
    Ok(Json(certs.into_iter().cloned().collect()))
}

async fn eligibility(
    State(app): State<AppState>,
    Path((student_id, kind)): Path<(String, String)>,
) -> ApiResult<EligibilityView> {
    let certificate_type: CertificateType =
        serde_json::from_value(serde_json::Value::String(kind.clone()))
            .map_err(|_| e400(format!("unknown certificate type {kind}")))?;
    let session = app.reader(&student_id)?;
    let path = session.lock().await;
    Ok(Json(EligibilityView {
        certificate_type,
        eligible: path.is_eligible_for_certificate(certificate_type),
    }))
}

async fn issue_certificate(
    State(app): State<AppState>,
    Path(student_id): Path<String>,
    Json(req): Json<IssueCertificateReq>,
) -> ApiResult<Certificate> {
    let session = app.session(&student_id)?;
    let mut path = session.lock().await;
    let name = req.student_name.unwrap_or_default();
    path.issue_certificate(req.certificate_type, &name)
        .map(Json)
        .map_err(|e| e400(e.to_string()))
}

async fn sync_status(
    State(app): State<AppState>,
    Path(student_id): Path<String>,
) -> ApiResult<SyncStatus> {
    let session = app.reader(&student_id)?;
    let path = session.lock().await;
    Ok(Json(path.sync_status()))
}

async fn force_sync(
    State(app): State<AppState>,
    Path(student_id): Path<String>,
) -> ApiResult<SyncStatus> {
    let session = app.session(&student_id)?;
    // the lock is released before the round trip so other requests proceed
    let sync = session.lock().await.sync_handle();
    match sync.force_sync_now().await {
        Ok(()) => Ok(Json(sync.status())),
        Err(e) => {
            tracing::warn!(student = %student_id, error = %e, "forced sync failed");
            Err((StatusCode::BAD_GATEWAY, e.to_string()))
        }
    }
}

// --- remote progress endpoint ---

async fn save_progress(
    State(db): State<Db>,
    Json(state): Json<StudentState>,
) -> ApiResult<serde_json::Value> {
    validate_student_id(&state.student_id)?;
    db::save_snapshot(&db, &state).await.map_err(e500)?;
    Ok(Json(serde_json::json!({ "ok": true })))
}

async fn load_progress(
    State(db): State<Db>,
    Path(student_id): Path<String>,
) -> ApiResult<StudentState> {
    validate_student_id(&student_id)?;
    let state = db::load_snapshot(&db, &student_id).await.map_err(e500)?;
    Ok(Json(state.unwrap_or_else(|| StudentState::new(&student_id, Utc::now()))))
}

// --- helpers ---
fn e400<T: Into<String>>(msg: T) -> (StatusCode, String) {
    (StatusCode::BAD_REQUEST, msg.into())
}

fn e404<E: Display>(e: E) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, e.to_string())
}

fn e500<E: Display>(e: E) -> (StatusCode, String) {
    tracing::error!(error=%e, "internal error");
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}
