use actix_cors::Cors;
use actix_web::{http::header, middleware, web, App, HttpServer};
use realtime_hub_service::{
    backplane::{Backplane, MemoryBackplane, RedisBackplane},
    config::{Config, StorageBackend},
    db,
    error::AppError,
    handlers, logging, metrics,
    services::{demo_generator::DemoGenerator, scheduler},
    state::AppState,
    stores::{
        postgres::{PgMessageStore, PgNotificationStore, PgPresenceStore},
        redis_schedule::RedisScheduleIndex,
        Stores,
    },
};
use std::sync::Arc;
use tokio::sync::broadcast;

async fn build_stores(cfg: &Config) -> Result<(Stores, Arc<dyn Backplane>), AppError> {
    match cfg.storage {
        StorageBackend::Memory => {
            tracing::warn!("Using in-memory stores; state is lost on restart and not shared");
            Ok((Stores::memory(), Arc::new(MemoryBackplane::new())))
        }
        StorageBackend::Postgres => {
            let database_url = cfg
                .database_url
                .as_deref()
                .ok_or_else(|| AppError::Config("DATABASE_URL missing".into()))?;
            let pool = db::init_pool(database_url, cfg.database_max_connections)
                .await
                .map_err(|e| AppError::StartServer(format!("db: {e}")))?;
            db::run_migrations(&pool)
                .await
                .map_err(|e| AppError::StartServer(format!("migrations: {e}")))?;

            let schedule = RedisScheduleIndex::connect(&cfg.redis_url)
                .await
                .map_err(|e| AppError::StartServer(format!("redis: {e}")))?;
            let backplane =
                RedisBackplane::connect(&cfg.redis_url, &cfg.instance_id, &cfg.backplane_channel)
                    .await
                    .map_err(|e| AppError::StartServer(format!("backplane: {e}")))?;

            let stores = Stores {
                presence: Arc::new(PgPresenceStore::new(pool.clone())),
                messages: Arc::new(PgMessageStore::new(pool.clone())),
                notifications: Arc::new(PgNotificationStore::new(pool)),
                schedule: Arc::new(schedule),
            };
            Ok((stores, Arc::new(backplane)))
        }
    }
}

fn build_cors(frontend_url: Option<&str>) -> Cors {
    let cors = match frontend_url {
        Some(origin) => Cors::default().allowed_origin(origin),
        None => Cors::default().allow_any_origin(),
    };
    cors.allowed_methods(vec!["GET", "POST"])
        .allowed_headers(vec![header::CONTENT_TYPE, header::ACCEPT])
        .max_age(3600)
}

#[actix_web::main]
async fn main() -> Result<(), AppError> {
    logging::init_tracing();
    let cfg = Config::from_env()?;
    tracing::info!(config = ?cfg, "Starting realtime-hub-service");

    let (stores, backplane) = build_stores(&cfg).await?;
    let state = AppState::new(cfg.clone(), stores, backplane);

    match state.purge_stale_presence().await {
        Ok(0) => {}
        Ok(n) => tracing::info!(identities = n, "Cleared stale presence from a previous run"),
        Err(e) => tracing::warn!(error = %e, "Failed to clear stale presence"),
    }

    let _listener = state
        .start_backplane_listener()
        .await
        .map_err(|e| AppError::StartServer(format!("backplane listener: {e}")))?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    let scheduler_handle = scheduler::spawn(
        Arc::clone(&state.dispatcher),
        cfg.scheduler.clone(),
        shutdown_tx.subscribe(),
    );
    let demo_handle = cfg.demo.enabled.then(|| {
        DemoGenerator::new(Arc::clone(&state.dispatcher), Arc::clone(&state.presence))
            .spawn(cfg.demo.clone(), shutdown_tx.subscribe())
    });

    let bind_addr = cfg.bind_addr();
    tracing::info!(%bind_addr, instance_id = %cfg.instance_id, "HTTP server listening");

    let frontend_url = cfg.frontend_url.clone();
    let app_state = web::Data::new(state);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(app_state.clone())
            .wrap(build_cors(frontend_url.as_deref()))
            .wrap(middleware::Logger::default())
            .wrap(metrics::RequestMetrics)
            .route("/health", web::get().to(handlers::health))
            .route("/metrics", web::get().to(metrics::serve_metrics))
            .configure(handlers::register_routes)
    })
    .bind(&bind_addr)
    .map_err(|e| AppError::StartServer(format!("bind {bind_addr}: {e}")))?
    .run();

    let result = server
        .await
        .map_err(|e| AppError::StartServer(format!("server: {e}")));

    tracing::info!("Shutting down background tasks");
    let _ = shutdown_tx.send(());
    let _ = scheduler_handle.await;
    if let Some(handle) = demo_handle {
        let _ = handle.await;
    }

    result
}
