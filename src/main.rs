use std::env;
use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use learnpath_runtime::config::AppConfig;
use learnpath_runtime::persistence::RemoteSync;
use learnpath_runtime::routes::{AppState, StoreBackend};
use learnpath_runtime::{build_app, db, manifest, Curriculum, HttpRemote, SystemClock};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            env::var("RUST_LOG").unwrap_or_else(|_| "learnpath_runtime=info,axum=info".into())
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = AppConfig::from_env();

    // a broken prerequisite graph is a startup error, not something to serve
    let curriculum = match &config.curriculum_path {
        Some(path) => manifest::load_curriculum(path)
            .with_context(|| format!("loading curriculum from {}", path.display()))?,
        None => Curriculum::builtin(),
    };

    let pool = match &config.database_url {
        Some(url) => {
            let pool = db::connect(url).await?;
            // crate-relative path for sqlx migrations
            sqlx::migrate!("./migrations").run(&pool).await?;
            Some(pool)
        }
        None => None,
    };

    let remote: Option<Arc<dyn RemoteSync>> = match &config.sync_url {
        Some(url) => Some(Arc::new(HttpRemote::new(url)?)),
        None => {
            tracing::warn!("SYNC_URL not set, progress stays local");
            None
        }
    };

    let state = AppState::new(
        Arc::new(curriculum),
        Arc::new(SystemClock::new(config.learner_offset)),
        remote,
        config.persistence.clone(),
        StoreBackend::Files(config.data_dir.join("learners")),
    )
    .with_idle_timeout(config.session_idle);
    let app = build_app(state, pool);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on http://0.0.0.0:{}", config.port);

    axum::serve(listener, app).await?;
    Ok(())
}
