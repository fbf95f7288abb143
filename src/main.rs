use axum::{routing::get, Router};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use rustilms_progress::{
    app, catalog, config::Config, db, memory::MemoryStore, models::CourseOutline, routes,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "rustilms_progress=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let notifier = app::notifier_from(&config);

    let (state, _notifications) = match &config.database_url {
        Some(url) => {
            let pool = db::connect(url, config.database_max_connections).await?;
            // crate-relative path for sqlx migrations
            sqlx::migrate!("./migrations").run(&pool).await?;
            let store = Arc::new(db::PgStore::new(pool));
            app::build(store, &config, notifier).await?
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using in-memory store");
            let store = Arc::new(MemoryStore::with_badges(catalog::default_badges()));
            if let Some(path) = &config.courses_file {
                let raw = tokio::fs::read_to_string(path).await?;
                let courses: Vec<CourseOutline> = serde_json::from_str(&raw)?;
                tracing::info!(count = courses.len(), path = %path, "loaded course outlines");
                for course in courses {
                    store.put_course(course)?;
                }
            }
            app::build(store, &config, notifier).await?
        }
    };

    let app = Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(routes::router(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any));

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!("listening on http://{}", addr);

    axum::serve(listener, app).await?;
    Ok(())
}
