use axum::{
    http::Method,
    routing::get,
    Router,
};
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::cors::{Any, CorsLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod actions;
mod analytics;
mod config;
mod database;
mod error;
mod handlers;
mod identity;
mod ingestion;
mod jobs;

pub use error::{ApiError, ApiResult, AppError};

pub struct AppState {
    pub db_pool: sqlx::PgPool,
    pub ingestor: ingestion::EventIngestor,
    pub executor: actions::ActionExecutor,
    pub queue: actions::ExecutionQueue,
    pub scheduler: Arc<jobs::JobScheduler>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = config::Config::from_env()?;
    let db_pool = database::create_pool(&config.database_url).await?;

    database::migrate(&db_pool).await?;

    let ingestor = ingestion::EventIngestor::new(db_pool.clone());
    let executor = actions::ActionExecutor::new(db_pool.clone(), &config)?;
    let queue = actions::ExecutionQueue::start(executor.clone(), &config.execution);

    let scheduler = Arc::new(jobs::JobScheduler::new(db_pool.clone(), jobs::JobConfig::default()).await?);
    scheduler.start().await?;

    let app_state = Arc::new(AppState {
        db_pool,
        ingestor,
        executor,
        queue,
        scheduler,
    });

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers(Any);

    let app = Router::new()
        .route("/", get(|| async { "Siteflow Analytics Engine v1.0.0" }))
        .route("/health", get(handlers::health_check))
        .nest("/api/v1/events", handlers::event_routes())
        .nest("/api/v1/execute", handlers::execution_routes())
        .nest("/api/v1/analytics", handlers::analytics_routes())
        .nest(
            "/api/v1/sites/:site_id/visitors/:visitor_id/tags",
            handlers::visitor_tag_routes(),
        )
        .nest("/api/v1/jobs", handlers::job_routes())
        .layer(ServiceBuilder::new().layer(cors))
        .with_state(app_state);

    let listener = tokio::net::TcpListener::bind(&config.server_addr).await?;
    tracing::info!("Server running on {}", config.server_addr);

    axum::serve(listener, app).await?;

    Ok(())
}
