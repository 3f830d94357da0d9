use std::sync::Arc;

use comments::{
    CommentEngine, EngineHandle,
    config::{EngineConfig, Env},
    memory::MemoryBackend,
    routes::{self, App},
};
use dotenv::dotenv;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv().ok();

    let config = EngineConfig::new_from_env();

    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("comments=debug,info"));
    let registry = tracing_subscriber::registry().with(env_filter);
    match config.env {
        Env::Production => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        Env::Dev | Env::Staging => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    let backend = Arc::new(MemoryBackend::with_demo_data());
    let engine = EngineHandle::new(
        CommentEngine::new(config.initial_listing()),
        backend.clone(),
        backend.clone(),
    );
    let _subscription = engine.connect_push(backend.as_ref());

    let app = routes::router(App {
        engine: Arc::new(engine),
        backend,
    })
    .layer(TraceLayer::new_for_http())
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    tracing::info!(
        addr = %config.listen_addr,
        page_size = config.page_size,
        sort_field = %config.default_sort,
        sort_order = %config.default_order,
        "Listening"
    );
    axum::serve(listener, app).await?;

    Ok(())
}
