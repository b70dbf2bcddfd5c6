use std::sync::Arc;

use anyhow::Context;
use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use pagefield_core::config_file::{self, ConfigFile};
use pagefield_core::{
    AdaptiveLimiter, ArtifactStore, FieldExtractor, GeminiExtractor, JobOrchestrator,
    SqliteHistory, StaticAuthorizer, ThrottledExtractor,
};
use pagefield_pdf_mupdf::MupdfRasterizer;

mod error;
mod handlers;
mod models;
mod state;
mod upload;

use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,pagefield_core=debug,pagefield_web=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = config_file::load_config();
    config.apply_env();
    tracing::debug!(?config, "configuration loaded");

    let state = Arc::new(build_state(&config)?);
    let app = router(state, config.max_upload_bytes());

    let bind = config.bind();
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!("Listening on http://{bind}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

fn build_state(config: &ConfigFile) -> anyhow::Result<AppState> {
    let history_path = config.history_path();
    let history = Arc::new(
        SqliteHistory::open(&history_path)
            .with_context(|| format!("failed to open history at {}", history_path.display()))?,
    );
    let artifacts = Arc::new(ArtifactStore::new(
        config.artifact_dir(),
        config.export_format(),
    ));
    tracing::info!(
        history = %history_path.display(),
        artifacts = %artifacts.dir().display(),
        "storage ready"
    );

    let users = config.users();
    if users.is_empty() {
        tracing::warn!("no users configured; every extraction request will be rejected");
    }
    let authorizer = Arc::new(StaticAuthorizer::new(users));

    let model = config.model_config();
    if model.api_key.is_empty() {
        tracing::warn!("no model API key configured (PAGEFIELD_MODEL_API_KEY)");
    }
    let gemini = GeminiExtractor::new(model);
    let extractor: Arc<dyn FieldExtractor> = match config.requests_per_second() {
        Some(rps) => Arc::new(ThrottledExtractor::new(
            gemini,
            AdaptiveLimiter::per_second(rps),
        )),
        None => Arc::new(gemini),
    };

    let rasterizer = Arc::new(MupdfRasterizer::new().with_dpi(config.raster_dpi()));

    let orchestrator = JobOrchestrator::new(
        config.pipeline_config(),
        rasterizer,
        extractor,
        artifacts.clone(),
        history.clone(),
        authorizer.clone(),
    );

    Ok(AppState {
        orchestrator,
        history,
        artifacts,
        authorizer,
    })
}

fn router(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    let body_limit = axum::extract::DefaultBodyLimit::max(max_upload_bytes);

    Router::new()
        .route("/extract/stream", post(handlers::extract::extract_stream))
        .route("/download", get(handlers::download::download))
        .route("/contributors", get(handlers::history::contributors))
        .route("/history", post(handlers::history::history))
        .route("/stats", get(handlers::history::stats))
        .route(
            "/stats/contributors",
            post(handlers::history::contributor_stats),
        )
        .route("/stats/self", post(handlers::history::self_stats))
        .layer(body_limit)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
