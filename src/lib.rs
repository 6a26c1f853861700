pub mod achievements;
pub mod assessment;
pub mod clock;
pub mod config;
pub mod curriculum;
pub mod db;
pub mod engine;
pub mod error;
pub mod manifest;
pub mod models;
pub mod persistence;
pub mod prerequisites;
pub mod progress;
pub mod recommendations;
pub mod remote;
pub mod routes;

use axum::{routing::get, Router};
use tower_http::{cors::{Any, CorsLayer}, trace::TraceLayer};

pub use clock::{Clock, ManualClock, SystemClock};
pub use curriculum::{Challenge, Curriculum, Module};
pub use engine::LearningPath;
pub use error::{CurriculumError, NotEligible, NotFound, StoreError, SyncError};
pub use persistence::{FileStore, LocalStore, MemoryStore, PersistenceConfig, ProgressPersistence, RemoteSync, SyncHandle, SyncStatus};
pub use progress::ProgressStore;
pub use remote::HttpRemote;

/// The full HTTP surface: the learner API, plus the remote progress
/// endpoint when a database is configured.
pub fn build_app(state: routes::AppState, db: Option<db::Db>) -> Router {
    let mut app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(routes::router(state));
    if let Some(db) = db {
        app = app.merge(routes::remote_router(db));
    }
    app.layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
}
